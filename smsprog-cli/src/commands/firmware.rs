//! Programmer firmware update command implementation.

use {
    crate::Settings,
    anyhow::{Context, Result},
    console::style,
    log::warn,
    smsprog::{
        DfuProgrammer, ExchangeOutcome, FirmwareUpdater, Session, UpdateConfig, UpdateState,
        WorkerEvent,
        firmware::{DEFAULT_DEVICE, DEFAULT_TOOL},
        spawn_update,
    },
    std::{io, path::Path},
};

/// Switch the programmer to its bootloader over the command port.
///
/// Only called when the device is not already in its bootloader. Observes
/// the Ctrl-C token like every other session.
fn bootloader_entry(
    settings: &Settings,
) -> impl FnOnce() -> smsprog::Result<ExchangeOutcome> + Send + 'static {
    let port = settings.port.clone();
    let session_config = settings.session.clone();
    let cancel = settings.cancel.clone();
    move || {
        cancel.check()?;
        match Session::open(&port) {
            Ok(session) => {
                let mut session = session
                    .with_config(session_config)
                    .with_cancel_token(cancel);
                session.enter_bootloader()
            },
            Err(e) => {
                warn!("Could not open {port} ({e}), waiting for the bootloader anyway");
                Ok(ExchangeOutcome::Disconnected)
            },
        }
    }
}

/// Update-firmware command implementation.
pub(crate) fn cmd_update_firmware(
    settings: &Settings,
    image: &Path,
    tool: Option<&str>,
    device: Option<&str>,
) -> Result<()> {
    let firmware = &settings.config.firmware;
    let tool = tool
        .or(firmware.tool.as_deref())
        .unwrap_or(DEFAULT_TOOL);
    let device = device
        .or(firmware.device.as_deref())
        .unwrap_or(DEFAULT_DEVICE);

    if !settings.quiet {
        eprintln!(
            "{} Updating programmer firmware from {} ({tool}, {device})",
            style("📦").cyan(),
            image.display()
        );
    }

    let updater = FirmwareUpdater::new(DfuProgrammer::new(tool)).with_config(UpdateConfig {
        device: device.to_string(),
        ..UpdateConfig::default()
    });

    let worker = spawn_update(updater, image.to_path_buf(), bootloader_entry(settings))?;
    let result = loop {
        match worker.events().recv() {
            Ok(WorkerEvent::State(UpdateState::Done | UpdateState::Failed)) => {},
            Ok(WorkerEvent::State(state)) => {
                if !settings.quiet {
                    eprintln!("{} {state}...", style("→").cyan());
                }
            },
            Ok(WorkerEvent::Progress { .. }) => {},
            Ok(WorkerEvent::Finished(result)) => break result,
            Err(_) => {
                break Err(smsprog::Error::Io(io::Error::other(
                    "worker stopped without a result",
                )));
            },
        }
    };
    worker.join()?;
    result.context("Firmware update failed")?;

    if !settings.quiet {
        eprintln!("{} Programmer firmware updated", style("✓").green().bold());
    }
    Ok(())
}
