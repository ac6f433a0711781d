// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * Flashing worker
 *
 * Copyright (c) 2025 Code Construct
 */

#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::device::{self, DeviceClass, DeviceProperties};
use crate::platform::{BusEvent, FwState, ImageDownload, Maintenance};
use crate::policy::PostFlash;
use crate::progress::ProgressTimer;
use crate::update::{FlashSession, Inner, Protocol, SlotGuard};
use crate::{Substate, UpdateState};

/// Body of the flashing thread.
///
/// `slot` is held for the whole session and released on return.
pub(crate) fn run(inner: Arc<Inner>, session: FlashSession, slot: SlotGuard) {
    let _slot = slot;
    // progress is measured from here, staging time included
    let started = Instant::now();
    let req = &session.request;
    let props = DeviceProperties::load_or_default(&inner.config.device_properties);

    let Some(filename) = req.filepath.file_name() else {
        error!("no file name in {}", req.filepath.display());
        return;
    };

    let (image, server_url) = match req.protocol {
        Protocol::Usb => {
            let staging = props
                .staging_dir()
                .unwrap_or_else(|| inner.config.staging_dir.clone());
            match stage(&req.filepath, &staging, filename) {
                Ok(p) => {
                    let src = req
                        .filepath
                        .parent()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    (p, src)
                }
                Err(e) => {
                    error!(
                        "Can't stage {} to {}: {e}",
                        req.filepath.display(),
                        staging.display()
                    );
                    inner.transition(
                        UpdateState::ValidationFailed,
                        Substate::FirmwareNotFound,
                        Some(format!("copy to staging failed: {e}")),
                    );
                    return;
                }
            }
        }
        Protocol::Http => (req.filepath.clone(), req.server_url.clone()),
    };

    inner.transition(UpdateState::FlashingStarted, Substate::NotApplicable, None);

    let timer = {
        let i = inner.clone();
        ProgressTimer::start(started, inner.config.progress_step, move |p| {
            i.progress(p)
        })
        .inspect_err(|e| warn!("No progress reporting: {e}"))
        .ok()
    };

    let args = flash_args(&session, &server_url, &image);
    let rc = inner.platform.scripts.run(&inner.config.flash_script, &args);

    if let Some(t) = timer {
        t.stop();
    }

    let elapsed = Utc::now() - session.started_at;
    match rc {
        Ok(0) => {
            info!("Flashing succeeded after {}s", elapsed.num_seconds());
            succeeded(&inner, &session, &props, &image);
        }
        Ok(rc) => {
            error!("Flashing script exited with {rc}");
            failed(&inner, &session, &props, &image);
        }
        Err(e) => {
            error!("Flashing script: {e}");
            failed(&inner, &session, &props, &image);
        }
    }
}

/// Copies a local image (and its header, if any) into `staging`.
fn stage(src: &Path, staging: &Path, filename: &OsStr) -> io::Result<PathBuf> {
    fs::create_dir_all(staging)?;
    let dest = staging.join(filename);
    if dest == src {
        return Ok(dest);
    }

    let n = fs::copy(src, &dest)?;
    debug!("staged {} ({n} bytes) to {}", src.display(), dest.display());

    let header = device::header_path(src);
    if header.is_file() {
        if let Err(e) = fs::copy(&header, device::header_path(&dest)) {
            warn!("Can't stage {}: {e}", header.display());
        }
    }
    Ok(dest)
}

/// `protocol server_url dest_dir filename reboot_flag upgrade_kind`
fn flash_args(session: &FlashSession, server_url: &str, image: &Path) -> Vec<String> {
    let req = &session.request;
    let dir = image
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    vec![
        req.protocol.as_str().into(),
        server_url.into(),
        dir,
        name,
        if req.reboot { "1" } else { "0" }.into(),
        req.firmware_type.upgrade_kind().into(),
    ]
}

/// Removes `image` and its header.
fn remove_image(image: &Path) {
    for f in [image.to_path_buf(), device::header_path(image)] {
        match device::remove_if_present(&f) {
            Ok(true) => debug!("removed {}", f.display()),
            Ok(false) => (),
            Err(e) => warn!("Can't remove {}: {e}", f.display()),
        }
    }
}

fn failed(
    inner: &Inner,
    session: &FlashSession,
    props: &DeviceProperties,
    image: &Path,
) {
    let p = &inner.platform;

    // Only our staged copy, never the user's file
    if session.request.protocol == Protocol::Usb
        && image != session.request.filepath
    {
        remove_image(image);
    }

    let reason = match props.device_class() {
        DeviceClass::MediaClient => "Failed in flash write",
        _ => "ECM trigger failed",
    };

    if props.cpu_arch().starts_with("x86") {
        p.broadcast(BusEvent::ImageDownload(ImageDownload::FlashFailed));
    }
    p.broadcast(BusEvent::FirmwareState(FwState::Failed));
    if session.request.maintenance {
        p.broadcast(BusEvent::Maintenance(Maintenance::FwDownloadError));
    }

    inner.transition(
        UpdateState::FlashingFailed,
        Substate::FlashWriteFailed,
        Some(reason.into()),
    );
}

fn succeeded(
    inner: &Inner,
    session: &FlashSession,
    props: &DeviceProperties,
    image: &Path,
) {
    let req = &session.request;

    remove_image(image);

    inner.progress(100);

    let post = PostFlash {
        config: &inner.config,
        platform: &inner.platform,
        props,
    };
    let action = post.run(req.firmware_type, req.maintenance, req.reboot);
    debug!("reboot action {action:?}");

    inner.transition(
        UpdateState::FlashingSucceeded,
        Substate::NotApplicable,
        None,
    );
    if req.protocol == Protocol::Usb {
        inner.transition(
            UpdateState::WaitingForReboot,
            Substate::NotApplicable,
            None,
        );
    }
}
