// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * RDK firmware update orchestrator
 *
 * Copyright (c) 2025 Code Construct
 */
#![deny(unsafe_code)]

//! Firmware flashing orchestration for RDK set-top devices.
//!
//! [`FirmwareUpdate`] validates an update request, runs the vendor flashing
//! script on a dedicated worker thread, persists the resulting
//! [`UpdateState`]/[`Substate`] pair to a status file, and reports progress
//! to registered [`Notification`] subscribers.
//!
//! Everything outside the orchestrator (the RFC parameter store, the IARM
//! event bus, the flashing and reboot scripts) is reached through the
//! traits in [`platform`].

use core::fmt;
use core::str::FromStr;

use thiserror::Error;

pub mod config;
pub mod device;
pub mod notify;
pub mod platform;
pub mod policy;
pub mod progress;
pub mod status;
pub mod update;
mod worker;

pub use config::Config;
pub use notify::{Event, Notification};
pub use platform::Platform;
pub use update::{FirmwareUpdate, FlashRequest, Initiator, Protocol};

pub type Result<T> = core::result::Result<T, UpdateError>;

/// Errors returned synchronously from the exposed operations.
///
/// Execution failures of an accepted flash are never reported here, they
/// end up in the persisted [`UpdateStatus`] instead.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("firmware is already up to date")]
    UpToDate,
    #[error("firmware update already in progress")]
    InProgress,
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    General(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    fn new_param(desc: impl Into<String>) -> Self {
        Self::InvalidParameter(desc.into())
    }

    fn new_general(desc: impl Into<String>) -> Self {
        Self::General(desc.into())
    }

    /// Error code reported to the plugin host
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Self::UpToDate => ErrorCode::UpToDate,
            Self::InProgress => ErrorCode::InProgress,
            Self::NotFound => ErrorCode::NotFound,
            Self::General(_) | Self::Io(_) => ErrorCode::General,
        }
    }
}

/// Result codes of the exposed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    None,
    General,
    InvalidParameter,
    NotFound,
    UpToDate,
    InProgress,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::General => "ERROR_GENERAL",
            Self::InvalidParameter => "INVALID_PARAMETER",
            Self::NotFound => "ERROR_NOT_FOUND",
            Self::UpToDate => "FIRMWAREUPDATE_UPTODATE",
            Self::InProgress => "FIRMWAREUPDATE_INPROGRESS",
        }
    }
}

impl<T> From<&Result<T>> for ErrorCode {
    fn from(r: &Result<T>) -> Self {
        match r {
            Ok(_) => ErrorCode::None,
            Err(e) => e.code(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of firmware image
///
/// Matching is exact and case sensitive: only `"PCI"` and `"DRI"` parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareType {
    Pci,
    /// Peripheral (PDRI) image, applied without a reboot
    Dri,
}

impl FirmwareType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pci => "PCI",
            Self::Dri => "DRI",
        }
    }

    /// Upgrade kind argument for the flashing script, `1` for PDRI.
    pub fn upgrade_kind(&self) -> &'static str {
        match self {
            Self::Pci => "0",
            Self::Dri => "1",
        }
    }
}

impl FromStr for FirmwareType {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PCI" => Ok(Self::Pci),
            "DRI" => Ok(Self::Dri),
            _ => Err(UpdateError::new_param(format!(
                "unknown firmware type {s:?}"
            ))),
        }
    }
}

impl fmt::Display for FirmwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateState {
    /// No update has been recorded. Displays as an empty string.
    #[default]
    Unset,
    FlashingStarted,
    ValidationFailed,
    FlashingFailed,
    FlashingSucceeded,
    WaitingForReboot,
}

impl UpdateState {
    pub const ALL: [UpdateState; 6] = [
        Self::Unset,
        Self::FlashingStarted,
        Self::ValidationFailed,
        Self::FlashingFailed,
        Self::FlashingSucceeded,
        Self::WaitingForReboot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::FlashingStarted => "FLASHING_STARTED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::FlashingFailed => "FLASHING_FAILED",
            Self::FlashingSucceeded => "FLASHING_SUCCEEDED",
            Self::WaitingForReboot => "WAITING_FOR_REBOOT",
        }
    }
}

impl TryFrom<&str> for UpdateState {
    type Error = &'static str;
    fn try_from(value: &str) -> core::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .ok_or("unknown update state")
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualifies an [`UpdateState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Substate {
    #[default]
    NotApplicable,
    FirmwareNotFound,
    FirmwareInvalid,
    FirmwareOutdated,
    FirmwareUpToDate,
    FirmwareIncompatible,
    PrewriteSignatureCheckFailed,
    FlashWriteFailed,
    PostwriteFirmwareCheckFailed,
    PostwriteSignatureCheckFailed,
}

impl Substate {
    pub const ALL: [Substate; 10] = [
        Self::NotApplicable,
        Self::FirmwareNotFound,
        Self::FirmwareInvalid,
        Self::FirmwareOutdated,
        Self::FirmwareUpToDate,
        Self::FirmwareIncompatible,
        Self::PrewriteSignatureCheckFailed,
        Self::FlashWriteFailed,
        Self::PostwriteFirmwareCheckFailed,
        Self::PostwriteSignatureCheckFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotApplicable => "NOT_APPLICABLE",
            Self::FirmwareNotFound => "FIRMWARE_NOT_FOUND",
            Self::FirmwareInvalid => "FIRMWARE_INVALID",
            Self::FirmwareOutdated => "FIRMWARE_OUTDATED",
            Self::FirmwareUpToDate => "FIRMWARE_UPTODATE",
            Self::FirmwareIncompatible => "FIRMWARE_INCOMPATIBLE",
            Self::PrewriteSignatureCheckFailed => {
                "PREWRITE_SIGNATURE_CHECK_FAILED"
            }
            Self::FlashWriteFailed => "FLASH_WRITE_FAILED",
            Self::PostwriteFirmwareCheckFailed => {
                "POSTWRITE_FIRMWARE_CHECK_FAILED"
            }
            Self::PostwriteSignatureCheckFailed => {
                "POSTWRITE_SIGNATURE_CHECK_FAILED"
            }
        }
    }
}

impl TryFrom<&str> for Substate {
    type Error = &'static str;
    fn try_from(value: &str) -> core::result::Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .ok_or("unknown update substate")
    }
}

impl fmt::Display for Substate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of `GetUpdateState`
///
/// The default value (`{"", NOT_APPLICABLE}`) means no flash has been
/// recorded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpdateStatus {
    pub state: UpdateState,
    pub substate: Substate,
    /// Human readable reason for a failure, where one was recorded
    pub reason: Option<String>,
}

impl UpdateStatus {
    pub fn new(state: UpdateState, substate: Substate) -> Self {
        Self {
            state,
            substate,
            reason: None,
        }
    }

    /// Whether a flashing session has finished in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            UpdateState::ValidationFailed
                | UpdateState::FlashingFailed
                | UpdateState::FlashingSucceeded
                | UpdateState::WaitingForReboot
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn firmware_type_exact() {
        assert_eq!("PCI".parse::<FirmwareType>().unwrap(), FirmwareType::Pci);
        assert_eq!("DRI".parse::<FirmwareType>().unwrap(), FirmwareType::Dri);
        for bad in ["pci", "Pci", "PCI ", " DRI", "dri", "PDRI", ""] {
            let e = bad.parse::<FirmwareType>().unwrap_err();
            assert_eq!(e.code(), ErrorCode::InvalidParameter, "{bad:?}");
        }
    }

    proptest! {
        #[test]
        fn firmware_type_rejects_others(s in "\\PC*") {
            prop_assume!(s != "PCI" && s != "DRI");
            prop_assert!(s.parse::<FirmwareType>().is_err());
        }
    }

    #[test]
    fn state_names() {
        assert_eq!(UpdateState::Unset.to_string(), "");
        assert_eq!(
            UpdateState::try_from("WAITING_FOR_REBOOT"),
            Ok(UpdateState::WaitingForReboot)
        );
        assert!(UpdateState::try_from("flashing_started").is_err());
        assert_eq!(
            Substate::try_from("FIRMWARE_UPTODATE"),
            Ok(Substate::FirmwareUpToDate)
        );
        assert!(Substate::try_from("").is_err());
    }

    #[test]
    fn error_codes() {
        let ok: Result<()> = Ok(());
        assert_eq!(ErrorCode::from(&ok), ErrorCode::None);
        let busy: Result<()> = Err(UpdateError::InProgress);
        assert_eq!(ErrorCode::from(&busy).as_str(), "FIRMWAREUPDATE_INPROGRESS");
        assert_eq!(
            UpdateError::UpToDate.code().as_str(),
            "FIRMWAREUPDATE_UPTODATE"
        );
    }
}
