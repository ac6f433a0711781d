// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Device classification and filesystem flags
 *
 * Copyright (c) 2025 Code Construct
 */

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Device family that requires a warning period before rebooting
/// into a maintenance update.
pub const CRITICAL_DEVICE_NAME: &str = "PLATCO";

/// Extension of the header file that may accompany a firmware image
pub const HEADER_EXT: &str = "header";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    MediaClient,
    Broadband,
    Other,
}

/// Contents of the `device.properties` file
#[derive(Debug, Default, Clone)]
pub struct DeviceProperties {
    values: HashMap<String, String>,
}

impl DeviceProperties {
    pub fn load(path: &Path) -> io::Result<Self> {
        let s = fs::read_to_string(path)?;
        Ok(Self::parse(&s))
    }

    /// Reads the properties, or an empty set if the file can't be read.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path)
            .inspect_err(|e| {
                warn!("Can't read device properties {}: {e}", path.display())
            })
            .unwrap_or_default()
    }

    /// Parses `KEY=value` lines. Comments and lines without `=` are skipped,
    /// a later key overrides an earlier one.
    pub fn parse(s: &str) -> Self {
        let values = s
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with('#'))
            .filter_map(|l| l.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn device_class(&self) -> DeviceClass {
        match self.get("DEVICE_TYPE") {
            Some(t) if t.eq_ignore_ascii_case("mediaclient") => {
                DeviceClass::MediaClient
            }
            Some(t) if t.eq_ignore_ascii_case("broadband") => {
                DeviceClass::Broadband
            }
            _ => DeviceClass::Other,
        }
    }

    pub fn device_name(&self) -> &str {
        self.get("DEVICE_NAME").unwrap_or("")
    }

    pub fn cpu_arch(&self) -> &str {
        self.get("CPU_ARCH").unwrap_or("")
    }

    pub fn is_critical_device(&self) -> bool {
        self.device_name().starts_with(CRITICAL_DEVICE_NAME)
    }

    /// Device specific staging directory for images
    pub fn staging_dir(&self) -> Option<PathBuf> {
        self.get("DIFW_PATH").filter(|p| !p.is_empty()).map(PathBuf::from)
    }
}

/// Name of the running image, from the `imagename:` line of the version file.
pub fn current_image_name(version_file: &Path) -> Option<String> {
    let s = fs::read_to_string(version_file)
        .inspect_err(|e| {
            debug!("Can't read version file {}: {e}", version_file.display())
        })
        .ok()?;
    parse_image_name(&s)
}

fn parse_image_name(s: &str) -> Option<String> {
    s.lines()
        .find_map(|l| l.trim().strip_prefix("imagename:"))
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
}

/// Firmware file name without directory or extension
pub fn image_stem(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

/// Path of the header file accompanying `image`, `<image>.header`
pub fn header_path(image: &Path) -> PathBuf {
    let mut p = image.as_os_str().to_owned();
    p.push(".");
    p.push(HEADER_EXT);
    PathBuf::from(p)
}

/// Creates an empty marker file.
///
/// Returns `false` if the marker was already present.
pub fn touch_once(path: &Path) -> io::Result<bool> {
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Removes a file, treating an absent file as success.
///
/// Returns whether a file was removed.
pub fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Flush filesystem buffers to storage
#[allow(unsafe_code)]
pub fn sync_filesystems() {
    // SAFETY: sync(2) takes no arguments and cannot fail.
    unsafe { libc::sync() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties() {
        let p = DeviceProperties::parse(
            "# comment\nDEVICE_TYPE=mediaclient\nDEVICE_NAME = PLATCO_XI6\n\
             CPU_ARCH=x86\nnonsense\nDIFW_PATH=\n=orphan\n",
        );
        assert_eq!(p.device_class(), DeviceClass::MediaClient);
        assert_eq!(p.device_name(), "PLATCO_XI6");
        assert!(p.is_critical_device());
        assert_eq!(p.cpu_arch(), "x86");
        assert_eq!(p.staging_dir(), None);
        assert_eq!(p.get(""), None);

        let p = DeviceProperties::parse("DEVICE_TYPE=broadband\n");
        assert_eq!(p.device_class(), DeviceClass::Broadband);
        assert!(!p.is_critical_device());

        let p = DeviceProperties::default();
        assert_eq!(p.device_class(), DeviceClass::Other);
    }

    #[test]
    fn image_name() {
        assert_eq!(
            parse_image_name("BOX=xi6\nimagename:FOO_1.2\nVERSION=1\n"),
            Some("FOO_1.2".into())
        );
        assert_eq!(parse_image_name("imagename:\n"), None);
        assert_eq!(parse_image_name("image:FOO\n"), None);

        assert_eq!(image_stem(Path::new("/tmp/FOO.bin")), Some("FOO".into()));
        assert_eq!(
            header_path(Path::new("/tmp/FOO.bin")),
            Path::new("/tmp/FOO.bin.header")
        );
    }

    #[test]
    fn markers() {
        let d = tempfile::tempdir().unwrap();
        let m = d.path().join("marker");
        assert!(touch_once(&m).unwrap());
        assert!(!touch_once(&m).unwrap());
        assert!(remove_if_present(&m).unwrap());
        assert!(!remove_if_present(&m).unwrap());
    }
}
