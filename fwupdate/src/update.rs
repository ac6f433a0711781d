// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * RDK firmware update orchestrator
 *
 * Copyright (c) 2025 Code Construct
 */

//! Firmware update entry points
//!
//! At most one flashing session runs at a time. A session holds the
//! single-flight slot from acceptance until its worker thread finishes,
//! whatever the outcome; requests made meanwhile are rejected with
//! [`UpdateError::InProgress`] rather than queued.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};

use crate::config::MAX_REBOOT_DELAY_SECS;
use crate::device;
use crate::notify::{Dispatcher, Event, Notification};
use crate::platform::{
    Platform, RfcType, RFC_AUTO_REBOOT, RFC_OWNER, RFC_REBOOT_DELAY,
};
use crate::status::StatusStore;
use crate::{
    worker, Config, FirmwareType, Result, Substate, UpdateError, UpdateState,
    UpdateStatus,
};

/// How the image reaches the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Local file supplied by the user, staged before flashing
    Usb,
    /// Already downloaded from `server_url`
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usb => "usb",
            Self::Http => "http",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    User,
    Device,
}

/// A fully described flashing request
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub filepath: PathBuf,
    pub firmware_type: FirmwareType,
    pub protocol: Protocol,
    /// Origin of an `Http` image, passed through to the flashing script
    pub server_url: String,
    pub initiated_by: Initiator,
    pub reboot: bool,
    /// Triggered from the maintenance window
    pub maintenance: bool,
}

impl FlashRequest {
    /// A user supplied local image
    pub fn local(filepath: impl Into<PathBuf>, firmware_type: FirmwareType) -> Self {
        Self {
            filepath: filepath.into(),
            firmware_type,
            protocol: Protocol::Usb,
            server_url: String::new(),
            initiated_by: Initiator::User,
            reboot: false,
            maintenance: false,
        }
    }
}

/// The in-flight flashing operation, owned by the worker thread
#[derive(Debug, Clone)]
pub struct FlashSession {
    pub request: FlashRequest,
    pub started_at: DateTime<Utc>,
}

/// Single-flight slot for the flashing worker
#[derive(Default)]
pub(crate) struct FlashSlot {
    busy: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Holds the slot, releasing it on drop
pub(crate) struct SlotGuard(Arc<FlashSlot>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::Release);
        debug!("flash slot released");
    }
}

impl FlashSlot {
    fn try_acquire(self: &Arc<Self>) -> Option<SlotGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard(self.clone()))
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Starts a worker, first joining the previous (finished) one.
    fn launch<F>(&self, f: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut w = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = w.take() {
            if prev.join().is_err() {
                error!("previous flash worker panicked");
            }
        }
        let t = std::thread::Builder::new()
            .name("fwupdate-flash".into())
            .spawn(f)?;
        *w = Some(t);
        Ok(())
    }

    fn wait(&self) {
        let w = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(w) = w {
            if w.join().is_err() {
                error!("flash worker panicked");
            }
        }
    }
}

pub(crate) struct Inner {
    pub config: Config,
    pub platform: Platform,
    pub status: StatusStore,
    pub dispatcher: Dispatcher,
}

impl Inner {
    /// Persists a state without notifying subscribers
    fn record(&self, state: UpdateState, substate: Substate, reason: &str) {
        let st = UpdateStatus {
            state,
            substate,
            reason: Some(reason.to_string()),
        };
        if let Err(e) = self.status.write(&st) {
            error!("Failed writing update state: {e}");
        }
    }

    /// Persists a state and notifies subscribers
    pub fn transition(
        &self,
        state: UpdateState,
        substate: Substate,
        reason: Option<String>,
    ) {
        info!("update state {state} / {substate}");
        let st = UpdateStatus {
            state,
            substate,
            reason,
        };
        if let Err(e) = self.status.write(&st) {
            error!("Failed writing update state: {e}");
        }
        self.dispatcher
            .dispatch(Event::UpdateStateChange { state, substate });
    }

    pub fn progress(&self, percentage_complete: u8) {
        self.dispatcher.dispatch(Event::FlashingStateChange {
            percentage_complete,
        });
    }
}

/// Firmware update service
///
/// Constructed by the host with its configuration and collaborators.
/// All methods take `&self` and may be called from any thread.
pub struct FirmwareUpdate {
    inner: Arc<Inner>,
    slot: Arc<FlashSlot>,
}

impl FirmwareUpdate {
    pub fn new(config: Config, platform: Platform) -> Result<Self> {
        let status = StatusStore::new(config.status_file.clone());
        let dispatcher = Dispatcher::new()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                platform,
                status,
                dispatcher,
            }),
            slot: Default::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn register(&self, n: Arc<dyn Notification>) {
        self.inner.dispatcher.register(n)
    }

    pub fn unregister(&self, n: &Arc<dyn Notification>) -> Result<()> {
        self.inner.dispatcher.unregister(n)
    }

    /// Records a rejected request.
    ///
    /// Nothing is written while a session holds the slot, the status
    /// file belongs to that session until it finishes.
    fn reject(&self, state: UpdateState, substate: Substate, reason: &str) {
        if self.slot.is_busy() {
            debug!("flash in progress, not recording {state} / {substate}");
            return;
        }
        self.inner.record(state, substate, reason)
    }

    /// `UpdateFirmware`: flash a local image.
    ///
    /// Returns once the request has been accepted or rejected, the outcome
    /// of an accepted flash is reported through [`Self::get_update_state`]
    /// and notifications.
    pub fn update_firmware(
        &self,
        filepath: &str,
        firmware_type: &str,
    ) -> Result<()> {
        let inner = &self.inner;

        if filepath.trim().is_empty() {
            self.reject(
                UpdateState::ValidationFailed,
                Substate::FirmwareNotFound,
                "empty firmware path",
            );
            return Err(UpdateError::new_param("firmwareFilepath is empty"));
        }

        let firmware_type = match firmware_type.parse::<FirmwareType>() {
            Ok(t) => t,
            Err(e) => {
                self.reject(
                    UpdateState::ValidationFailed,
                    Substate::FirmwareInvalid,
                    "unknown firmware type",
                );
                return Err(e);
            }
        };

        let path = Path::new(filepath);
        if !path.is_file() {
            self.reject(
                UpdateState::ValidationFailed,
                Substate::FirmwareNotFound,
                "firmware file not found",
            );
            return Err(UpdateError::new_param(format!(
                "firmware file {filepath} not found"
            )));
        }

        let current = device::current_image_name(&inner.config.version_file);
        let requested = device::image_stem(path);
        if current.is_some() && current == requested {
            info!("{filepath} is already the running image");
            self.reject(
                UpdateState::ValidationFailed,
                Substate::FirmwareUpToDate,
                "firmware already up to date",
            );
            return Err(UpdateError::UpToDate);
        }

        let reboot = inner
            .platform
            .rfc
            .get_bool(RFC_OWNER, RFC_AUTO_REBOOT)
            .unwrap_or(false);

        self.start_flash(FlashRequest {
            reboot,
            ..FlashRequest::local(path, firmware_type)
        })
    }

    /// Start a flashing session without the `UpdateFirmware` checks.
    ///
    /// Still subject to the single-flight slot.
    pub fn start_flash(&self, request: FlashRequest) -> Result<()> {
        if request.filepath.file_name().is_none() {
            return Err(UpdateError::new_param("firmware path has no file name"));
        }

        let Some(guard) = self.slot.try_acquire() else {
            info!("rejecting update of {}, flash in progress", request.filepath.display());
            return Err(UpdateError::InProgress);
        };

        let session = FlashSession {
            request,
            started_at: Utc::now(),
        };
        info!(
            "Starting {} flash of {} ({:?}, {})",
            session.request.firmware_type,
            session.request.filepath.display(),
            session.request.initiated_by,
            session.request.protocol.as_str(),
        );

        let inner = self.inner.clone();
        // the guard moves into the worker; on spawn failure it is
        // dropped along with the closure
        self.slot
            .launch(move || worker::run(inner, session, guard))
            .map_err(|e| {
                UpdateError::new_general(format!("can't start flash worker: {e}"))
            })
    }

    /// `GetUpdateState`
    pub fn get_update_state(&self) -> UpdateStatus {
        self.inner.status.read()
    }

    /// `SetFirmwareRebootDelay`, `1..=86400` seconds
    pub fn set_reboot_delay(&self, seconds: u32) -> Result<()> {
        if !(1..=MAX_REBOOT_DELAY_SECS).contains(&seconds) {
            return Err(UpdateError::new_param(format!(
                "reboot delay {seconds} out of range"
            )));
        }
        self.inner
            .platform
            .rfc
            .set(RFC_OWNER, RFC_REBOOT_DELAY, &seconds.to_string(), RfcType::Int)
            .map_err(|e| UpdateError::new_general(e.to_string()))
    }

    /// `SetAutoReboot`
    pub fn set_auto_reboot(&self, enable: bool) -> Result<()> {
        let v = if enable { "true" } else { "false" };
        self.inner
            .platform
            .rfc
            .set(RFC_OWNER, RFC_AUTO_REBOOT, v, RfcType::Bool)
            .map_err(|e| UpdateError::new_general(e.to_string()))
    }

    /// Whether a flashing session currently holds the slot
    pub fn is_flashing(&self) -> bool {
        self.slot.is_busy()
    }

    /// Blocks until the current (or last) flash worker has finished.
    pub fn wait(&self) {
        self.slot.wait()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{MemoryRfc, ProcessRunner, RecordingBus};
    use crate::ErrorCode;
    use proptest::prelude::*;

    fn service(rfc: Arc<MemoryRfc>) -> (tempfile::TempDir, FirmwareUpdate) {
        let d = tempfile::tempdir().unwrap();
        let platform = Platform {
            rfc,
            bus: Arc::new(RecordingBus::new()),
            scripts: Arc::new(ProcessRunner),
        };
        let fw = FirmwareUpdate::new(Config::with_root(d.path()), platform)
            .unwrap();
        (d, fw)
    }

    #[test]
    fn slot_single_flight() {
        let slot = Arc::new(FlashSlot::default());
        let g = slot.try_acquire().unwrap();
        assert!(slot.is_busy());
        assert!(slot.try_acquire().is_none());
        drop(g);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn reboot_delay_range() {
        let rfc = Arc::new(MemoryRfc::new());
        let (_d, fw) = service(rfc.clone());

        for bad in [0, 86401, u32::MAX] {
            let e = fw.set_reboot_delay(bad).unwrap_err();
            assert_eq!(e.code(), ErrorCode::InvalidParameter);
        }
        assert_eq!(rfc.value(RFC_REBOOT_DELAY), None);

        fw.set_reboot_delay(1).unwrap();
        fw.set_reboot_delay(86400).unwrap();
        assert_eq!(rfc.value(RFC_REBOOT_DELAY).as_deref(), Some("86400"));

        rfc.fail_writes(true);
        let e = fw.set_reboot_delay(60).unwrap_err();
        assert_eq!(e.code(), ErrorCode::General);
    }

    proptest! {
        #[test]
        fn reboot_delay_any(secs in any::<u32>()) {
            let rfc = Arc::new(MemoryRfc::new());
            let (_d, fw) = service(rfc.clone());
            let r = fw.set_reboot_delay(secs);
            if (1..=86400).contains(&secs) {
                prop_assert!(r.is_ok());
                prop_assert_eq!(rfc.value(RFC_REBOOT_DELAY), Some(secs.to_string()));
            } else {
                prop_assert_eq!(ErrorCode::from(&r), ErrorCode::InvalidParameter);
                prop_assert_eq!(rfc.value(RFC_REBOOT_DELAY), None);
            }
        }
    }

    #[test]
    fn auto_reboot() {
        let rfc = Arc::new(MemoryRfc::new());
        let (_d, fw) = service(rfc.clone());
        fw.set_auto_reboot(true).unwrap();
        assert_eq!(rfc.value(RFC_AUTO_REBOOT).as_deref(), Some("true"));
        fw.set_auto_reboot(false).unwrap();
        assert_eq!(rfc.value(RFC_AUTO_REBOOT).as_deref(), Some("false"));
        rfc.fail_writes(true);
        assert_eq!(
            fw.set_auto_reboot(true).unwrap_err().code(),
            ErrorCode::General
        );
    }

    #[test]
    fn rejects_bad_requests() {
        let (d, fw) = service(Arc::new(MemoryRfc::new()));

        let e = fw.update_firmware("   ", "PCI").unwrap_err();
        assert_eq!(e.code(), ErrorCode::InvalidParameter);
        assert_eq!(
            fw.get_update_state(),
            UpdateStatus {
                state: UpdateState::ValidationFailed,
                substate: Substate::FirmwareNotFound,
                reason: Some("empty firmware path".into()),
            }
        );

        let img = d.path().join("NEW_IMAGE.bin");
        std::fs::write(&img, b"image").unwrap();
        let img = img.to_str().unwrap();
        let e = fw.update_firmware(img, "pci").unwrap_err();
        assert_eq!(e.code(), ErrorCode::InvalidParameter);
        assert_eq!(fw.get_update_state().substate, Substate::FirmwareInvalid);

        let missing = d.path().join("MISSING.bin");
        let e = fw
            .update_firmware(missing.to_str().unwrap(), "DRI")
            .unwrap_err();
        assert_eq!(e.code(), ErrorCode::InvalidParameter);
        assert_eq!(fw.get_update_state().substate, Substate::FirmwareNotFound);

        assert!(!fw.is_flashing());
    }
}
