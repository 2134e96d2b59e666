//! Programmer firmware update.
//!
//! The programmer's microcontroller is reflashed through its USB DFU
//! bootloader with an external tool (`dfu-programmer`). The update is a
//! small state machine:
//!
//! ```text
//! CheckingTool -> DetectingBootloader -> (EnteringBootloader ->)
//!     WaitingBootloader -> Erasing -> Flashing -> Starting -> Done
//! ```
//!
//! Any step can end in `Failed`. The device is left as the last successful
//! step made it; running the update again re-checks with the status query.
//!
//! ## Example
//!
//! ```rust,no_run
//! use smsprog::{DfuProgrammer, FirmwareUpdater, Session};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut updater = FirmwareUpdater::new(DfuProgrammer::default());
//!     updater.run(Path::new("smscprogr.hex"), || {
//!         Session::open("/dev/ttyACM0")?.enter_bootloader()
//!     })?;
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, FlashStep, Result},
        protocol::exchange::ExchangeOutcome,
    },
    log::{debug, info, warn},
    std::{fmt, io::ErrorKind, path::Path, process::Command, thread, time::Duration},
};

/// Default flashing tool.
pub const DEFAULT_TOOL: &str = "dfu-programmer";

/// Default target device of the flashing tool.
pub const DEFAULT_DEVICE: &str = "atmega32u2";

/// Printed on stderr by `dfu-programmer --help`.
const HELP_MARKER: &str = "global-options";

/// Printed on stdout by `dfu-programmer <device> get` in bootloader mode.
const BOOTLOADER_MARKER: &str = "Bootloader Version";

/// Status polls while waiting for the bootloader.
pub const POLL_ATTEMPTS: u32 = 40;

/// Delay between status polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Delay after starting the new firmware.
pub const START_SETTLE: Duration = Duration::from_secs(1);

/// Captured result of one tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ToolOutput {
    /// Whether the tool exited with status 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// External flashing tool.
pub trait FlashTool {
    /// Run the tool with `args` and capture its output.
    ///
    /// A tool that cannot be started is [`Error::ToolNotFound`].
    fn run(&mut self, args: &[&str]) -> Result<ToolOutput>;
}

/// `dfu-programmer` run as a subprocess.
#[derive(Debug, Clone)]
pub struct DfuProgrammer {
    program: String,
}

impl DfuProgrammer {
    /// Use `program` as the tool executable.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Executable name or path.
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Default for DfuProgrammer {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL)
    }
}

impl FlashTool for DfuProgrammer {
    fn run(&mut self, args: &[&str]) -> Result<ToolOutput> {
        debug!("Running {} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                    Error::ToolNotFound(format!("{}: {e}", self.program))
                },
                _ => Error::Io(e),
            })?;
        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Firmware update state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    /// Probing for the flashing tool.
    CheckingTool,
    /// Asking the tool whether the device is already in its bootloader.
    DetectingBootloader,
    /// Sending the `bootloader` command to the programmer.
    EnteringBootloader,
    /// Polling until the bootloader shows up.
    WaitingBootloader,
    /// Erasing the old firmware.
    Erasing,
    /// Writing the new firmware.
    Flashing,
    /// Starting the new firmware.
    Starting,
    /// Finished.
    Done,
    /// Stopped on an error.
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::CheckingTool => "Checking for flashing tool",
            Self::DetectingBootloader => "Checking for device already in bootloader",
            Self::EnteringBootloader => "Entering bootloader",
            Self::WaitingBootloader => "Waiting for bootloader",
            Self::Erasing => "Erasing old firmware",
            Self::Flashing => "Programming new firmware",
            Self::Starting => "Starting new firmware",
            Self::Done => "Firmware update completed",
            Self::Failed => "Firmware update failed",
        };
        f.write_str(text)
    }
}

/// Firmware update settings.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Target device passed to the tool.
    pub device: String,
    /// Status polls before giving up on the bootloader.
    pub poll_attempts: u32,
    /// Delay between status polls.
    pub poll_interval: Duration,
    /// Delay after the start command.
    pub start_settle: Duration,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            poll_attempts: POLL_ATTEMPTS,
            poll_interval: POLL_INTERVAL,
            start_settle: START_SETTLE,
        }
    }
}

type StateObserver = Box<dyn FnMut(UpdateState) + Send>;

/// Drives one firmware update.
pub struct FirmwareUpdater<T: FlashTool> {
    tool: T,
    config: UpdateConfig,
    state: UpdateState,
    last_error: Option<String>,
    observer: Option<StateObserver>,
}

impl<T: FlashTool> FirmwareUpdater<T> {
    /// Updater with default settings.
    pub fn new(tool: T) -> Self {
        Self {
            tool,
            config: UpdateConfig::default(),
            state: UpdateState::CheckingTool,
            last_error: None,
            observer: None,
        }
    }

    /// Replace the settings.
    #[must_use]
    pub fn with_config(mut self, config: UpdateConfig) -> Self {
        self.config = config;
        self
    }

    /// Report every state change to `observer`.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(UpdateState) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Current state.
    pub fn state(&self) -> UpdateState {
        self.state
    }

    /// Message of the error that ended the last run.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Get a reference to the tool.
    pub fn tool(&self) -> &T {
        &self.tool
    }

    /// Flash `image`.
    ///
    /// `enter_bootloader` is only called when the device is not already in
    /// bootloader mode. A [`ExchangeOutcome::Disconnected`] result is the
    /// normal outcome; errors it returns (such as failing to open the port)
    /// end the update.
    pub fn run<F>(&mut self, image: &Path, enter_bootloader: F) -> Result<()>
    where
        F: FnOnce() -> Result<ExchangeOutcome>,
    {
        self.last_error = None;
        let result = self.run_steps(image, enter_bootloader);
        if let Err(ref e) = result {
            warn!("Firmware update failed in state {:?}: {e}", self.state);
            self.last_error = Some(e.to_string());
            self.enter(UpdateState::Failed);
        }
        result
    }

    fn run_steps<F>(&mut self, image: &Path, enter_bootloader: F) -> Result<()>
    where
        F: FnOnce() -> Result<ExchangeOutcome>,
    {
        let image_arg = check_image(image)?;

        self.enter(UpdateState::CheckingTool);
        self.check_tool()?;

        self.enter(UpdateState::DetectingBootloader);
        if self.in_bootloader()? {
            info!("Device is already in bootloader mode");
        } else {
            self.enter(UpdateState::EnteringBootloader);
            match enter_bootloader()? {
                ExchangeOutcome::Disconnected => info!("Programmer disconnected"),
                ExchangeOutcome::Answered(_) => {
                    debug!("Programmer did not disconnect, waiting for the bootloader anyway");
                },
            }
        }

        self.enter(UpdateState::WaitingBootloader);
        self.wait_for_bootloader()?;

        self.enter(UpdateState::Erasing);
        self.device_step(FlashStep::Erase, &["erase"])?;

        self.enter(UpdateState::Flashing);
        self.device_step(FlashStep::Flash, &["flash", image_arg.as_str()])?;

        self.enter(UpdateState::Starting);
        let output = self.device_command(&["start"])?;
        if !output.success() {
            debug!("Start command exited with {:?}", output.status);
        }
        thread::sleep(self.config.start_settle);

        self.enter(UpdateState::Done);
        Ok(())
    }

    fn enter(&mut self, state: UpdateState) {
        debug!("Firmware update: {:?} -> {state:?}", self.state);
        self.state = state;
        if let Some(observer) = self.observer.as_mut() {
            observer(state);
        }
    }

    fn check_tool(&mut self) -> Result<()> {
        let output = self.tool.run(&["--help"])?;
        if output.stderr.contains(HELP_MARKER) {
            Ok(())
        } else {
            Err(Error::ToolNotFound(
                "help output does not look like dfu-programmer".into(),
            ))
        }
    }

    fn device_command(&mut self, args: &[&str]) -> Result<ToolOutput> {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(self.config.device.as_str());
        full.extend_from_slice(args);
        self.tool.run(&full)
    }

    fn in_bootloader(&mut self) -> Result<bool> {
        let output = self.device_command(&["get"])?;
        Ok(output.stdout.contains(BOOTLOADER_MARKER))
    }

    fn wait_for_bootloader(&mut self) -> Result<()> {
        let attempts = self.config.poll_attempts;
        for attempt in 1..=attempts {
            if self.in_bootloader()? {
                debug!("Bootloader found after {attempt} polls");
                return Ok(());
            }
            thread::sleep(self.config.poll_interval);
        }
        Err(Error::BootloaderTimeout { attempts })
    }

    fn device_step(&mut self, step: FlashStep, args: &[&str]) -> Result<()> {
        let output = self.device_command(args)?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::FlashStepFailed {
                step,
                status: output.status,
            })
        }
    }
}

/// The image must be a readable file; returns it as a tool argument.
fn check_image(image: &Path) -> Result<String> {
    let metadata = std::fs::metadata(image)
        .map_err(|e| Error::FirmwareImage(format!("{}: {e}", image.display())))?;
    if !metadata.is_file() {
        return Err(Error::FirmwareImage(format!(
            "{} is not a file",
            image.display()
        )));
    }
    std::fs::File::open(image)
        .map_err(|e| Error::FirmwareImage(format!("{}: {e}", image.display())))?;
    image
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::FirmwareImage(format!("{} is not valid UTF-8", image.display())))
}
