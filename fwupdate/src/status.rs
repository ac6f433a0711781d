// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Persisted update state
 *
 * Copyright (c) 2025 Code Construct
 */

//! Status store
//!
//! The file holds `key=value` lines:
//!
//! ```text
//! state=FLASHING_FAILED
//! substate=FLASH_WRITE_FAILED
//! reason=Failed in flash write
//! ```
//!
//! Every write replaces the whole file, via a temporary file and rename so
//! that readers never observe a partial record.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{Substate, UpdateState, UpdateStatus};

const KEY_STATE: &str = "state";
const KEY_SUBSTATE: &str = "substate";
const KEY_REASON: &str = "reason";

pub struct StatusStore {
    path: PathBuf,
    // serialises writers within this process
    lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, status: &UpdateStatus) -> io::Result<()> {
        let mut rec = format!(
            "{KEY_STATE}={}\n{KEY_SUBSTATE}={}\n",
            status.state, status.substate
        );
        if let Some(r) = &status.reason {
            // one line per key
            let r = r.replace(['\n', '\r'], " ");
            rec.push_str(&format!("{KEY_REASON}={r}\n"));
        }

        let _l = self.lock.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut f = fs::File::create(&tmp)?;
        f.write_all(rec.as_bytes())?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, &self.path)?;

        trace!("status {}: {} / {}", self.path.display(), status.state, status.substate);
        Ok(())
    }

    /// Reads the stored status.
    ///
    /// An absent, unreadable or malformed file gives the default
    /// `{"", NOT_APPLICABLE}`.
    pub fn read(&self) -> UpdateStatus {
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Can't read status {}: {e}", self.path.display());
                }
                return UpdateStatus::default();
            }
        };

        parse(&s).unwrap_or_else(|| {
            debug!("Malformed status file {}", self.path.display());
            UpdateStatus::default()
        })
    }
}

fn parse(s: &str) -> Option<UpdateStatus> {
    let mut state = None;
    let mut substate = None;
    let mut reason = None;

    for (k, v) in s.lines().filter_map(|l| l.split_once('=')) {
        match k.trim() {
            KEY_STATE => state = Some(UpdateState::try_from(v.trim()).ok()?),
            KEY_SUBSTATE => {
                substate = Some(Substate::try_from(v.trim()).ok()?)
            }
            KEY_REASON => reason = Some(v.trim().to_string()),
            _ => (),
        }
    }

    Some(UpdateStatus {
        state: state?,
        substate: substate?,
        reason: reason.filter(|r| !r.is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StatusStore) {
        let d = tempfile::tempdir().unwrap();
        let s = StatusStore::new(d.path().join("state/fw_update_state"));
        (d, s)
    }

    #[test]
    fn absent_empty_malformed() {
        let (_d, s) = store();
        assert_eq!(s.read(), UpdateStatus::default());
        assert_eq!(s.read().state.as_str(), "");
        assert_eq!(s.read().substate.as_str(), "NOT_APPLICABLE");

        fs::create_dir_all(s.path().parent().unwrap()).unwrap();
        for contents in [
            "",
            "state=FLASHING_STARTED\n",
            "substate=FLASH_WRITE_FAILED\n",
            "state=BOGUS\nsubstate=NOT_APPLICABLE\n",
            "state=FLASHING_FAILED\nsubstate=flash_write_failed\n",
            "garbage without separators",
        ] {
            fs::write(s.path(), contents).unwrap();
            assert_eq!(s.read(), UpdateStatus::default(), "{contents:?}");
        }
    }

    #[test]
    fn every_pair_roundtrips() {
        let (_d, s) = store();
        for state in UpdateState::ALL {
            for substate in Substate::ALL {
                let st = UpdateStatus::new(state, substate);
                s.write(&st).unwrap();
                assert_eq!(s.read(), st);
            }
        }
    }

    #[test]
    fn reason_single_line() {
        let (_d, s) = store();
        let mut st = UpdateStatus::new(
            UpdateState::FlashingFailed,
            Substate::FlashWriteFailed,
        );
        st.reason = Some("ECM trigger\nfailed".into());
        s.write(&st).unwrap();

        let r = s.read();
        assert_eq!(r.reason.as_deref(), Some("ECM trigger failed"));

        // a later write replaces the reason
        s.write(&UpdateStatus::new(
            UpdateState::FlashingStarted,
            Substate::NotApplicable,
        ))
        .unwrap();
        assert_eq!(s.read().reason, None);
        assert!(!s.path().with_extension("tmp").exists());
    }
}
