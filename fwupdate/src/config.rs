// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Copyright (c) 2025 Code Construct
 */

//! Paths and delays used by the orchestrator.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reboot delay, seconds, when none has been configured in RFC
pub const DEFAULT_REBOOT_DELAY_SECS: u32 = 10;

/// Maximum for `SetFirmwareRebootDelay`, one day
pub const MAX_REBOOT_DELAY_SECS: u32 = 86400;

#[derive(Debug, Clone)]
pub struct Config {
    /// Persisted `{state, substate}`
    pub status_file: PathBuf,
    /// Contains the `imagename:` of the running image
    pub version_file: PathBuf,
    /// `KEY=value` device classification
    pub device_properties: PathBuf,
    pub flash_script: PathBuf,
    pub reboot_script: PathBuf,
    /// Where local images are copied before flashing. `DIFW_PATH` in
    /// the device properties takes precedence.
    pub staging_dir: PathBuf,
    pub preparing_reboot_marker: PathBuf,
    pub state_red_flag: PathBuf,

    /// Wait after flashing before touching the reboot marker
    pub settle_delay: Duration,
    /// Wait before running the reboot script on the interactive path
    pub reboot_delay: Duration,
    /// Warning period before a critical-device reboot
    pub critical_reboot_grace: Duration,
    /// Unit of the progress schedule, see [`crate::progress`]
    pub progress_step: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            status_file: "/tmp/fw_update_state".into(),
            version_file: "/version.txt".into(),
            device_properties: "/etc/device.properties".into(),
            flash_script: "/lib/rdk/imageFlasher.sh".into(),
            reboot_script: "/rebootNow.sh".into(),
            staging_dir: "/tmp/fw_staging".into(),
            preparing_reboot_marker: "/tmp/fw_preparing_to_reboot".into(),
            state_red_flag: "/tmp/stateRedEnabled".into(),
            settle_delay: Duration::from_secs(5),
            reboot_delay: Duration::from_secs(2),
            critical_reboot_grace: Duration::from_secs(600),
            progress_step: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Default configuration with every file path placed beneath `root`.
    ///
    /// Delays are unchanged.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let mut c = Self::default();
        for p in [
            &mut c.status_file,
            &mut c.version_file,
            &mut c.device_properties,
            &mut c.flash_script,
            &mut c.reboot_script,
            &mut c.staging_dir,
            &mut c.preparing_reboot_marker,
            &mut c.state_red_flag,
        ] {
            *p = rebase(root, p);
        }
        c
    }

    /// Sets all delays to zero, apart from the progress step.
    pub fn without_delays(mut self) -> Self {
        self.settle_delay = Duration::ZERO;
        self.reboot_delay = Duration::ZERO;
        self.critical_reboot_grace = Duration::ZERO;
        self
    }
}

fn rebase(root: &Path, p: &Path) -> PathBuf {
    root.join(p.strip_prefix("/").unwrap_or(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_paths() {
        let c = Config::with_root("/var/test");
        assert_eq!(c.status_file, Path::new("/var/test/tmp/fw_update_state"));
        assert_eq!(c.reboot_script, Path::new("/var/test/rebootNow.sh"));
        assert_eq!(
            c.flash_script,
            Path::new("/var/test/lib/rdk/imageFlasher.sh")
        );
        assert_eq!(c.critical_reboot_grace, Duration::from_secs(600));
        assert_eq!(c.without_delays().critical_reboot_grace, Duration::ZERO);
    }
}
