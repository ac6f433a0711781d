// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Update notifications
 *
 * Copyright (c) 2025 Code Construct
 */

//! Notification dispatcher
//!
//! Events are queued by the orchestrator and delivered to subscribers on a
//! separate delivery thread, so a slow subscriber never holds up a state
//! transition. Events are delivered in the order they were dispatched,
//! and each event reaches subscribers in registration order.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use smol::channel::{Receiver, Sender};

use crate::{Result, Substate, UpdateError, UpdateState};

/// Subscriber callbacks
pub trait Notification: Send + Sync {
    fn on_update_state_change(&self, state: UpdateState, substate: Substate);

    fn on_flashing_state_change(&self, percentage_complete: u8);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    UpdateStateChange { state: UpdateState, substate: Substate },
    FlashingStateChange { percentage_complete: u8 },
}

impl Event {
    fn deliver(&self, n: &dyn Notification) {
        match *self {
            Self::UpdateStateChange { state, substate } => {
                n.on_update_state_change(state, substate)
            }
            Self::FlashingStateChange {
                percentage_complete,
            } => n.on_flashing_state_change(percentage_complete),
        }
    }
}

type Subscribers = Arc<Mutex<Vec<Arc<dyn Notification>>>>;

pub struct Dispatcher {
    subscribers: Subscribers,
    queue: Option<Sender<Event>>,
    worker: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new() -> std::io::Result<Self> {
        let subscribers = Subscribers::default();
        let (queue, rx) = smol::channel::unbounded();

        let subs = subscribers.clone();
        let worker = std::thread::Builder::new()
            .name("fwupdate-notify".into())
            .spawn(move || deliver_loop(rx, subs))?;

        Ok(Self {
            subscribers,
            queue: Some(queue),
            worker: Some(worker),
        })
    }

    /// Adds a subscriber. Registering the same subscriber twice has
    /// no effect.
    pub fn register(&self, n: Arc<dyn Notification>) {
        let mut subs = lock(&self.subscribers);
        if subs.iter().any(|s| same(s, &n)) {
            debug!("subscriber already registered");
            return;
        }
        subs.push(n);
    }

    /// Removes a subscriber, returning [`UpdateError::NotFound`] if it
    /// wasn't registered.
    pub fn unregister(&self, n: &Arc<dyn Notification>) -> Result<()> {
        let mut subs = lock(&self.subscribers);
        match subs.iter().position(|s| same(s, n)) {
            Some(i) => {
                subs.remove(i);
                Ok(())
            }
            None => {
                warn!("unregister of unknown subscriber");
                Err(UpdateError::NotFound)
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Queues an event for delivery. Returns immediately.
    pub fn dispatch(&self, ev: Event) {
        trace!("dispatch {ev:?}");
        let sent = self.queue.as_ref().map(|q| q.try_send(ev));
        if !matches!(sent, Some(Ok(()))) {
            error!("notification queue closed, dropping {ev:?}");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain and exit
        drop(self.queue.take());
        if let Some(w) = self.worker.take() {
            if w.join().is_err() {
                error!("notification worker panicked");
            }
        }
    }
}

fn deliver_loop(rx: Receiver<Event>, subscribers: Subscribers) {
    while let Ok(ev) = rx.recv_blocking() {
        // Snapshot, so subscribers may (un)register from a callback
        let subs = lock(&subscribers).clone();
        for s in subs.iter() {
            ev.deliver(s.as_ref());
        }
    }
    trace!("notification worker exiting");
}

fn lock(s: &Subscribers) -> MutexGuard<'_, Vec<Arc<dyn Notification>>> {
    s.lock().unwrap_or_else(|e| e.into_inner())
}

fn same(a: &Arc<dyn Notification>, b: &Arc<dyn Notification>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct Recorder {
        name: &'static str,
        tx: Mutex<mpsc::Sender<(&'static str, Event)>>,
    }

    impl Notification for Recorder {
        fn on_update_state_change(&self, state: UpdateState, substate: Substate) {
            let ev = Event::UpdateStateChange { state, substate };
            let _ = self.tx.lock().unwrap().send((self.name, ev));
        }

        fn on_flashing_state_change(&self, percentage_complete: u8) {
            let ev = Event::FlashingStateChange { percentage_complete };
            let _ = self.tx.lock().unwrap().send((self.name, ev));
        }
    }

    fn recorder(
        name: &'static str,
        tx: &mpsc::Sender<(&'static str, Event)>,
    ) -> Arc<dyn Notification> {
        Arc::new(Recorder {
            name,
            tx: Mutex::new(tx.clone()),
        })
    }

    fn started() -> Event {
        Event::UpdateStateChange {
            state: UpdateState::FlashingStarted,
            substate: Substate::NotApplicable,
        }
    }

    #[test]
    fn ordered_delivery() {
        let (tx, rx) = mpsc::channel();
        let d = Dispatcher::new().unwrap();
        let a = recorder("a", &tx);
        let b = recorder("b", &tx);
        d.register(a.clone());
        d.register(b.clone());
        d.register(a.clone());
        assert_eq!(d.subscriber_count(), 2);

        d.dispatch(started());
        for p in [20, 40] {
            d.dispatch(Event::FlashingStateChange {
                percentage_complete: p,
            });
        }

        let got: Vec<_> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        let pct = |p| Event::FlashingStateChange {
            percentage_complete: p,
        };
        assert_eq!(
            got,
            vec![
                ("a", started()),
                ("b", started()),
                ("a", pct(20)),
                ("b", pct(20)),
                ("a", pct(40)),
                ("b", pct(40)),
            ]
        );
        // no duplicate delivery to `a`
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn unregister() {
        let (tx, rx) = mpsc::channel();
        let d = Dispatcher::new().unwrap();
        let a = recorder("a", &tx);
        let b = recorder("b", &tx);

        assert_eq!(
            d.unregister(&a).unwrap_err().code(),
            crate::ErrorCode::NotFound
        );
        d.register(a.clone());
        d.register(b.clone());
        d.unregister(&a).unwrap();
        assert_eq!(d.subscriber_count(), 1);
        // second unregister is reported, not fatal
        assert!(d.unregister(&a).is_err());

        d.dispatch(started());
        let (who, _) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(who, "b");
    }

    #[test]
    fn drop_drains_queue() {
        let (tx, rx) = mpsc::channel();
        let d = Dispatcher::new().unwrap();
        d.register(recorder("a", &tx));
        for p in 0..10 {
            d.dispatch(Event::FlashingStateChange {
                percentage_complete: p,
            });
        }
        drop(d);
        assert_eq!(rx.try_iter().count(), 10);
    }
}
