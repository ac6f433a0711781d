// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Post-flash reboot policy
 *
 * Copyright (c) 2025 Code Construct
 */

//! What happens after a successful flash.
//!
//! [`decide`] chooses a [`RebootAction`] from the session and device,
//! [`PostFlash::run`] performs the side effects around it. None of the side
//! effects can fail the flash, errors are logged.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::path::Path;

use crate::config::{Config, DEFAULT_REBOOT_DELAY_SECS};
use crate::device::{self, DeviceClass, DeviceProperties};
use crate::platform::{
    BusEvent, FwState, ImageDownload, Maintenance, Platform, RfcType,
    RFC_NOTIFY_ENABLE, RFC_OWNER, RFC_REBOOT_DELAY, RFC_REBOOT_PENDING,
};
use crate::FirmwareType;

pub const REBOOT_REASON: &str = "UpgradeReboot_FirmwareUpdate";
pub const CRITICAL_REBOOT_REASON: &str = "UpgradeReboot_CriticalFirmwareUpdate";
pub const REBOOT_MESSAGE: &str =
    "Rebooting the box after Firmware Image Upgrade...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    /// No reboot needed or requested
    None,
    /// Reboot is required but left to the maintenance window
    Deferred,
    /// Reboot after a short delay
    Immediate,
    /// Warn, wait out the grace period, then reboot
    Critical,
    /// A reboot was wanted but there is no reboot script
    ScriptMissing,
}

/// Inputs to the reboot decision
#[derive(Debug, Clone, Copy)]
pub struct RebootContext {
    pub firmware_type: FirmwareType,
    pub maintenance: bool,
    pub reboot_requested: bool,
    pub reboot_script_present: bool,
    pub critical_device: bool,
}

pub fn decide(c: &RebootContext) -> RebootAction {
    // PDRI images apply without a restart
    if c.firmware_type == FirmwareType::Dri {
        return RebootAction::None;
    }

    if c.maintenance {
        if !c.reboot_script_present {
            RebootAction::ScriptMissing
        } else if c.critical_device && c.reboot_requested {
            RebootAction::Critical
        } else {
            RebootAction::Deferred
        }
    } else if !c.reboot_requested {
        RebootAction::None
    } else if c.reboot_script_present {
        RebootAction::Immediate
    } else {
        RebootAction::ScriptMissing
    }
}

pub struct PostFlash<'a> {
    pub config: &'a Config,
    pub platform: &'a Platform,
    pub props: &'a DeviceProperties,
}

impl PostFlash<'_> {
    /// Runs the post-flash sequence, returning the reboot action taken.
    ///
    /// May block for the settle delay, and on the critical path for the
    /// full grace period before the reboot script runs.
    pub fn run(
        &self,
        firmware_type: FirmwareType,
        maintenance: bool,
        reboot_requested: bool,
    ) -> RebootAction {
        let p = self.platform;

        p.broadcast(BusEvent::FirmwareState(FwState::ValidationComplete));
        p.broadcast(BusEvent::ImageDownload(ImageDownload::FlashComplete));
        if maintenance && self.props.device_class() != DeviceClass::Broadband
        {
            p.broadcast(BusEvent::Maintenance(Maintenance::FwDownloadComplete));
        }

        std::thread::sleep(self.config.settle_delay);
        device::sync_filesystems();
        self.mark_preparing_reboot();

        let ctx = RebootContext {
            firmware_type,
            maintenance,
            reboot_requested,
            reboot_script_present: self.config.reboot_script.is_file(),
            critical_device: self.props.is_critical_device(),
        };
        let action = decide(&ctx);
        info!("post-flash reboot action {action:?}");

        match action {
            RebootAction::None => (),
            RebootAction::Deferred => {
                info!("Reboot required, deferring to maintenance window");
                p.broadcast(BusEvent::Maintenance(Maintenance::RebootRequired));
            }
            RebootAction::ScriptMissing => {
                error!(
                    "Reboot script {} missing, not rebooting",
                    self.config.reboot_script.display()
                );
                if maintenance {
                    p.broadcast(BusEvent::Maintenance(
                        Maintenance::FwDownloadError,
                    ));
                }
            }
            RebootAction::Critical => self.critical_reboot(),
            RebootAction::Immediate => self.reboot(),
        }
        action
    }

    fn mark_preparing_reboot(&self) {
        let marker = &self.config.preparing_reboot_marker;
        match device::touch_once(marker) {
            Ok(true) => {
                debug!("created {}", marker.display());
                self.platform
                    .broadcast(BusEvent::FirmwareState(FwState::PreparingToReboot));
            }
            Ok(false) => trace!("{} already present", marker.display()),
            Err(e) => warn!("Can't create {}: {e}", marker.display()),
        }
    }

    fn critical_reboot(&self) {
        let grace = self.config.critical_reboot_grace;
        warn!(
            "Critical firmware update, rebooting in {} seconds",
            grace.as_secs()
        );
        self.platform
            .broadcast(BusEvent::Maintenance(Maintenance::CriticalUpdate));
        std::thread::sleep(grace);

        let args = reboot_args(CRITICAL_REBOOT_REASON);
        match self
            .platform
            .scripts
            .run(&self.config.reboot_script, &args)
        {
            Ok(0) => (),
            Ok(rc) => error!("reboot script exited with {rc}"),
            Err(e) => error!("reboot script: {e}"),
        }
    }

    fn reboot(&self) {
        let p = self.platform;

        if p.rfc.get_bool(RFC_OWNER, RFC_NOTIFY_ENABLE) == Some(true) {
            let delay = self.reboot_delay_secs();
            let _ = p
                .rfc
                .set(
                    RFC_OWNER,
                    RFC_REBOOT_PENDING,
                    &delay.to_string(),
                    RfcType::UnsignedInt,
                )
                .inspect_err(|e| warn!("reboot pending notification: {e}"));
        }

        clear_state_red(&self.config.state_red_flag);
        std::thread::sleep(self.config.reboot_delay);

        let args = reboot_args(REBOOT_REASON);
        if let Err(e) =
            p.scripts.spawn(&self.config.reboot_script, &args)
        {
            error!("reboot script: {e}");
        }
    }

    fn reboot_delay_secs(&self) -> u32 {
        self.platform
            .rfc
            .get(RFC_OWNER, RFC_REBOOT_DELAY)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_REBOOT_DELAY_SECS)
    }
}

fn clear_state_red(flag: &Path) {
    match device::remove_if_present(flag) {
        Ok(true) => info!("cleared state red flag"),
        Ok(false) => (),
        Err(e) => warn!("Can't remove {}: {e}", flag.display()),
    }
}

fn reboot_args(reason: &str) -> Vec<String> {
    vec![
        "-s".into(),
        reason.into(),
        "-o".into(),
        REBOOT_MESSAGE.into(),
    ]
}
