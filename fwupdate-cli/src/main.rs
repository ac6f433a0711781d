// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * RDK firmware update utility.
 *
 * Copyright (c) 2025 Code Construct
 */
#[allow(unused)]
use log::{debug, error, info, trace, warn};

use anyhow::{bail, Context, Result};
use argh::FromArgs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rdk_fwupdate::platform::{MemoryRfc, NullBus, ProcessRunner};
use rdk_fwupdate::{
    Config, FirmwareUpdate, Notification, Platform, Substate, UpdateState,
    UpdateStatus,
};

#[derive(FromArgs, Debug)]
#[argh(description = "RDK firmware update utility")]
struct Args {
    /// verbose logging, repeat for more
    #[argh(switch, short = 'v')]
    verbose: u8,

    /// place all files beneath this directory
    #[argh(option)]
    root: Option<PathBuf>,

    /// update state file
    #[argh(option)]
    status_file: Option<PathBuf>,

    /// version file holding the running image name
    #[argh(option)]
    version_file: Option<PathBuf>,

    /// device properties file
    #[argh(option)]
    device_properties: Option<PathBuf>,

    /// flashing script
    #[argh(option)]
    flash_script: Option<PathBuf>,

    /// reboot script
    #[argh(option)]
    reboot_script: Option<PathBuf>,

    /// staging directory for local images
    #[argh(option)]
    staging_dir: Option<PathBuf>,

    /// progress reporting interval, seconds
    #[argh(option)]
    progress_step: Option<u64>,

    /// keep RFC settings in memory and don't send bus events
    #[argh(switch)]
    dry_run: bool,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Update(UpdateCommand),
    State(StateCommand),
    SetRebootDelay(SetRebootDelayCommand),
    SetAutoReboot(SetAutoRebootCommand),
    Version(VersionCommand),
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "update",
    description = "Flash a local firmware image"
)]
struct UpdateCommand {
    /// image file
    #[argh(positional)]
    file: String,

    /// firmware type, PCI or DRI
    #[argh(positional)]
    firmware_type: String,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "state", description = "Show the last update state")]
struct StateCommand {}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "set-reboot-delay",
    description = "Set the post-flash reboot delay"
)]
struct SetRebootDelayCommand {
    /// delay in seconds, 1 to 86400
    #[argh(positional)]
    seconds: u32,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "set-auto-reboot",
    description = "Enable or disable reboot after flashing"
)]
struct SetAutoRebootCommand {
    /// true or false
    #[argh(positional)]
    enable: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "version", description = "Print version")]
struct VersionCommand {}

/// Prints notifications as they arrive
struct Printer;

impl Notification for Printer {
    fn on_update_state_change(&self, state: UpdateState, substate: Substate) {
        println!("onUpdateStateChange: {state} {substate}");
    }

    fn on_flashing_state_change(&self, percentage_complete: u8) {
        println!("onFlashingStateChange: {percentage_complete}%");
    }
}

impl Args {
    fn config(&self) -> Config {
        let mut c = match &self.root {
            Some(r) => Config::with_root(r),
            None => Config::default(),
        };
        let overrides = [
            (&self.status_file, &mut c.status_file),
            (&self.version_file, &mut c.version_file),
            (&self.device_properties, &mut c.device_properties),
            (&self.flash_script, &mut c.flash_script),
            (&self.reboot_script, &mut c.reboot_script),
            (&self.staging_dir, &mut c.staging_dir),
        ];
        for (arg, path) in overrides {
            if let Some(a) = arg {
                *path = a.clone();
            }
        }
        if let Some(s) = self.progress_step {
            c.progress_step = Duration::from_secs(s);
        }
        c
    }

    fn platform(&self) -> Platform {
        if self.dry_run {
            Platform {
                rfc: Arc::new(MemoryRfc::new()),
                bus: Arc::new(NullBus),
                scripts: Arc::new(ProcessRunner),
            }
        } else {
            Platform::system()
        }
    }
}

fn print_status(st: &UpdateStatus) {
    let state = if st.state == UpdateState::Unset {
        "(none)"
    } else {
        st.state.as_str()
    };
    println!("state:    {state}");
    println!("substate: {}", st.substate);
    if let Some(r) = &st.reason {
        println!("reason:   {r}");
    }
}

fn update(fw: FirmwareUpdate, u: UpdateCommand) -> Result<()> {
    fw.register(Arc::new(Printer));

    if let Err(e) = fw.update_firmware(&u.file, &u.firmware_type) {
        print_status(&fw.get_update_state());
        bail!("update of {} rejected, {}: {e}", u.file, e.code());
    }

    // The flash runs on a worker thread owned by `fw`, exiting early
    // would kill it.
    fw.wait();
    let st = fw.get_update_state();
    // flushes pending notifications
    drop(fw);

    print_status(&st);
    if !st.is_terminal() {
        bail!("flash finished without reaching a final state");
    }
    if matches!(
        st.state,
        UpdateState::FlashingFailed | UpdateState::ValidationFailed
    ) {
        bail!("update of {} failed", u.file);
    }
    Ok(())
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let level = match args.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    if let Command::Version(_) = args.command {
        println!("rdk-fwupdate version {}", env!("VERSION"));
        return Ok(());
    }

    let config = args.config();
    debug!("{config:?}");
    let fw = FirmwareUpdate::new(config, args.platform())
        .context("Can't start firmware update service")?;

    match args.command {
        Command::Version(_) => (),
        Command::State(_) => print_status(&fw.get_update_state()),
        Command::Update(u) => update(fw, u)?,
        Command::SetRebootDelay(d) => {
            fw.set_reboot_delay(d.seconds)
                .with_context(|| format!("Can't set reboot delay {}", d.seconds))?;
        }
        Command::SetAutoReboot(a) => {
            fw.set_auto_reboot(a.enable)
                .with_context(|| format!("Can't set auto reboot {}", a.enable))?;
        }
    }

    Ok(())
}
