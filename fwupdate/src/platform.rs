// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * RFC parameter store, IARM event bus and vendor scripts
 *
 * Copyright (c) 2025 Code Construct
 */

//! External collaborators of the orchestrator.
//!
//! Each is a narrow trait with a production implementation that shells out
//! to the RDK utilities, plus in-memory variants for tests and dry runs.
//! Commands are always run with an argument vector, never through a shell.

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

pub const RFC_OWNER: &str = "FirmwareUpdate";

pub const RFC_REBOOT_DELAY: &str =
    "Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.FirmwareRebootDelay";
pub const RFC_AUTO_REBOOT: &str =
    "Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.AutoReboot.Enable";
pub const RFC_NOTIFY_ENABLE: &str =
    "Device.DeviceInfo.X_RDKCENTRAL-COM_RFC.Feature.ManageableNotification.Enable";
pub const RFC_REBOOT_PENDING: &str =
    "Device.DeviceInfo.X_RDKCENTRAL-COM_xOpsDeviceMgmt.RPC.RebootPendingNotification";

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("can't run {0}: {1}")]
    Spawn(String, #[source] io::Error),
    #[error("{0} failed with status {1:?}")]
    Exit(String, Option<i32>),
    #[error("RFC parameter {0} unavailable")]
    Unavailable(String),
}

type Result<T> = core::result::Result<T, PlatformError>;

/// Data type of an RFC parameter write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfcType {
    Int,
    UnsignedInt,
    Bool,
}

impl RfcType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::UnsignedInt => "uint",
            Self::Bool => "bool",
        }
    }
}

/// Remote Feature Control parameter store
pub trait RfcStore: Send + Sync {
    fn get(&self, owner: &str, key: &str) -> Result<String>;

    fn set(&self, owner: &str, key: &str, value: &str, ty: RfcType)
        -> Result<()>;

    /// Reads a boolean parameter, `None` if unset or not a boolean.
    fn get_bool(&self, owner: &str, key: &str) -> Option<bool> {
        let v = self.get(owner, key).ok()?;
        match v.trim() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }
}

/// RFC access through the `tr181` utility
pub struct Tr181Store {
    binary: PathBuf,
}

impl Tr181Store {
    pub fn new() -> Self {
        Self::with_binary("tr181")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn name(&self) -> String {
        self.binary.display().to_string()
    }
}

impl Default for Tr181Store {
    fn default() -> Self {
        Self::new()
    }
}

impl RfcStore for Tr181Store {
    fn get(&self, owner: &str, key: &str) -> Result<String> {
        trace!("{owner}: tr181 get {key}");
        let out = Command::new(&self.binary)
            .args(["-g", key])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PlatformError::Spawn(self.name(), e))?;

        if !out.status.success() {
            return Err(PlatformError::Exit(self.name(), out.status.code()));
        }

        // tr181 reports values on stderr on some builds
        let stdout = String::from_utf8_lossy(&out.stdout);
        let v = match stdout.trim() {
            "" => String::from_utf8_lossy(&out.stderr).trim().to_string(),
            s => s.to_string(),
        };
        if v.is_empty() {
            return Err(PlatformError::Unavailable(key.into()));
        }
        Ok(v)
    }

    fn set(
        &self,
        owner: &str,
        key: &str,
        value: &str,
        ty: RfcType,
    ) -> Result<()> {
        debug!("{owner}: tr181 set {key} = {value} ({})", ty.as_str());
        let status = Command::new(&self.binary)
            .args(["-s", "-t", ty.as_str(), "-v", value, key])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .map_err(|e| PlatformError::Spawn(self.name(), e))?;

        if !status.success() {
            return Err(PlatformError::Exit(self.name(), status.code()));
        }
        Ok(())
    }
}

/// In-memory RFC store
#[derive(Default)]
pub struct MemoryRfc {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryRfc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `set()` calls fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.lock().insert(key.into(), value.into());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RfcStore for MemoryRfc {
    fn get(&self, _owner: &str, key: &str) -> Result<String> {
        self.value(key)
            .ok_or_else(|| PlatformError::Unavailable(key.into()))
    }

    fn set(
        &self,
        _owner: &str,
        key: &str,
        value: &str,
        _ty: RfcType,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PlatformError::Unavailable(key.into()));
        }
        self.insert(key, value);
        Ok(())
    }
}

pub const IARM_SYSMGR: &str = "SYSMgr";
pub const IARM_MAINTENANCE: &str = "MaintenanceMGR";

/// `FirmwareStateEvent` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwState {
    Failed = 3,
    ValidationComplete = 5,
    PreparingToReboot = 6,
}

/// `ImageDwldEvent` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageDownload {
    FlashComplete = 3,
    FlashFailed = 4,
}

/// Maintenance manager module status values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Maintenance {
    FwDownloadComplete = 8,
    FwDownloadError = 9,
    CriticalUpdate = 11,
    RebootRequired = 12,
}

/// Events broadcast on the IARM bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    FirmwareState(FwState),
    ImageDownload(ImageDownload),
    Maintenance(Maintenance),
}

impl BusEvent {
    pub fn owner(&self) -> &'static str {
        match self {
            Self::FirmwareState(_) | Self::ImageDownload(_) => IARM_SYSMGR,
            Self::Maintenance(_) => IARM_MAINTENANCE,
        }
    }

    pub fn event_id(&self) -> &'static str {
        match self {
            Self::FirmwareState(_) => "FirmwareStateEvent",
            Self::ImageDownload(_) => "ImageDwldEvent",
            Self::Maintenance(_) => "MaintenanceMGR",
        }
    }

    pub fn payload(&self) -> String {
        let v = match self {
            Self::FirmwareState(s) => *s as u8,
            Self::ImageDownload(s) => *s as u8,
            Self::Maintenance(s) => *s as u8,
        };
        v.to_string()
    }
}

pub trait EventBus: Send + Sync {
    fn broadcast(&self, owner: &str, event_id: &str, payload: &str)
        -> Result<()>;
}

/// Broadcasts with `IARM_event_sender`
pub struct IarmEventSender {
    binary: PathBuf,
}

impl IarmEventSender {
    pub fn new() -> Self {
        Self {
            binary: "IARM_event_sender".into(),
        }
    }
}

impl Default for IarmEventSender {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for IarmEventSender {
    fn broadcast(
        &self,
        owner: &str,
        event_id: &str,
        payload: &str,
    ) -> Result<()> {
        debug!("IARM {owner}: {event_id} {payload}");
        let name = self.binary.display().to_string();
        let status = Command::new(&self.binary)
            .args([event_id, payload])
            .stdin(Stdio::null())
            .status()
            .map_err(|e| PlatformError::Spawn(name.clone(), e))?;
        if !status.success() {
            return Err(PlatformError::Exit(name, status.code()));
        }
        Ok(())
    }
}

/// Only logs events
pub struct NullBus;

impl EventBus for NullBus {
    fn broadcast(
        &self,
        owner: &str,
        event_id: &str,
        payload: &str,
    ) -> Result<()> {
        info!("event {owner}: {event_id} {payload}");
        Ok(())
    }
}

/// Records broadcast events
#[derive(Default)]
pub struct RecordingBus {
    events: Mutex<Vec<(String, String, String)>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(owner, event_id, payload)` in broadcast order
    pub fn events(&self) -> Vec<(String, String, String)> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contains(&self, ev: BusEvent) -> bool {
        self.events().iter().any(|(o, id, p)| {
            o == ev.owner() && id == ev.event_id() && *p == ev.payload()
        })
    }
}

impl EventBus for RecordingBus {
    fn broadcast(
        &self,
        owner: &str,
        event_id: &str,
        payload: &str,
    ) -> Result<()> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push((
            owner.into(),
            event_id.into(),
            payload.into(),
        ));
        Ok(())
    }
}

/// Runs the flashing and reboot scripts
pub trait ScriptRunner: Send + Sync {
    /// Runs to completion, returning the exit code. Termination by a
    /// signal is reported as `-1`.
    fn run(&self, script: &Path, args: &[String]) -> Result<i32>;

    /// Starts the script without waiting for it to finish.
    fn spawn(&self, script: &Path, args: &[String]) -> Result<()>;
}

pub struct ProcessRunner;

impl ScriptRunner for ProcessRunner {
    fn run(&self, script: &Path, args: &[String]) -> Result<i32> {
        info!("Running {} {}", script.display(), args.join(" "));
        let status = Command::new(script)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| PlatformError::Spawn(script.display().to_string(), e))?;
        debug!("{} exited: {status}", script.display());
        Ok(status.code().unwrap_or(-1))
    }

    fn spawn(&self, script: &Path, args: &[String]) -> Result<()> {
        info!("Starting {} {}", script.display(), args.join(" "));
        let name = script.display().to_string();
        let mut child = Command::new(script)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| PlatformError::Spawn(name.clone(), e))?;

        // Reap in the background
        std::thread::Builder::new()
            .name("fwupdate-reap".into())
            .spawn(move || match child.wait() {
                Ok(s) => debug!("{name} exited: {s}"),
                Err(e) => warn!("waiting for {name}: {e}"),
            })
            .map_err(|e| PlatformError::Spawn(script.display().to_string(), e))?;
        Ok(())
    }
}

/// The collaborators an orchestrator is built with
#[derive(Clone)]
pub struct Platform {
    pub rfc: Arc<dyn RfcStore>,
    pub bus: Arc<dyn EventBus>,
    pub scripts: Arc<dyn ScriptRunner>,
}

impl Platform {
    /// Production collaborators: `tr181`, `IARM_event_sender` and
    /// directly executed scripts.
    pub fn system() -> Self {
        Self {
            rfc: Arc::new(Tr181Store::new()),
            bus: Arc::new(IarmEventSender::new()),
            scripts: Arc::new(ProcessRunner),
        }
    }

    /// Broadcasts an event, logging rather than returning failure.
    pub fn broadcast(&self, ev: BusEvent) {
        let _ = self
            .bus
            .broadcast(ev.owner(), ev.event_id(), &ev.payload())
            .inspect_err(|e| warn!("Failed broadcasting {ev:?}: {e}"));
    }
}
