//! smsprog CLI - Command-line tool for the SMS/Game Gear cartridge programmer.
//!
//! ## Features
//!
//! - Identify, read, erase, program and verify cartridges
//! - Blank check on the device or by read-back
//! - Programmer firmware updates through `dfu-programmer`
//! - Serial port listing
//! - Environment variable and configuration file support

use {
    anyhow::{Context, Result},
    clap::{Parser, Subcommand},
    console::style,
    env_logger::Env,
    log::{debug, warn},
    smsprog::{CancelToken, ErrorCategory, NativePort, Session, SessionConfig, UploadHandshake},
    std::{env, path::PathBuf},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

mod commands;
mod config;

use {
    commands::{
        cartridge::{cmd_blank_check, cmd_bootloader, cmd_erase, cmd_program, cmd_read, cmd_verify},
        firmware::cmd_update_firmware,
        info::{cmd_info, cmd_list_ports},
    },
    config::Config,
};

/// Failures detected by the CLI itself.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration file.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// smsprog - Read and write SMS/Game Gear cartridges with the USB programmer.
///
/// Environment variables:
///   SMSPROG_PORT               - Serial port (default: /dev/ttyACM0)
///   SMSPROG_UPLOAD_HANDSHAKE   - Upload handshake of the firmware (nak, ready)
///   SMSPROG_CONFIG             - Configuration file
///   RUST_LOG                   - Log filter
#[derive(Parser)]
#[command(name = "smsprog")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port of the programmer.
    #[arg(short, long, global = true, env = "SMSPROG_PORT")]
    port: Option<String>,

    /// How the firmware announces it is ready for an upload (nak, ready).
    #[arg(long, global = true, env = "SMSPROG_UPLOAD_HANDSHAKE", value_name = "MODE")]
    upload_handshake: Option<UploadHandshake>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(
        long = "config",
        global = true,
        value_name = "PATH",
        env = "SMSPROG_CONFIG"
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Show firmware version and cartridge type.
    Info {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Read the cartridge into a file.
    Read {
        /// Output file.
        #[arg(value_name = "OUT")]
        output: PathBuf,
    },

    /// Write an image to a flash cartridge.
    Program {
        /// Image file.
        #[arg(value_name = "IN")]
        input: PathBuf,

        /// Do not erase the chip first.
        #[arg(long)]
        no_erase: bool,

        /// Read the cartridge back and compare afterwards.
        #[arg(long)]
        verify: bool,
    },

    /// Erase a flash cartridge.
    Erase,

    /// Check whether the cartridge is blank.
    BlankCheck,

    /// Compare the cartridge with an image file.
    Verify {
        /// Image file.
        #[arg(value_name = "IN")]
        input: PathBuf,
    },

    /// Put the programmer into its USB bootloader.
    Bootloader,

    /// Update the programmer firmware.
    UpdateFirmware {
        /// Firmware image (Intel HEX).
        #[arg(value_name = "HEX")]
        image: PathBuf,

        /// Flashing tool executable.
        #[arg(long, env = "SMSPROG_FIRMWARE_TOOL")]
        tool: Option<String>,

        /// Target device passed to the flashing tool.
        #[arg(long, env = "SMSPROG_FIRMWARE_DEVICE")]
        device: Option<String>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Settings resolved from the command line, environment and config files.
pub(crate) struct Settings {
    /// Serial port of the programmer.
    pub(crate) port: String,
    /// Session settings.
    pub(crate) session: SessionConfig,
    /// Merged configuration.
    pub(crate) config: Config,
    /// Cancelled on Ctrl-C.
    pub(crate) cancel: CancelToken,
    /// Suppress non-essential output.
    pub(crate) quiet: bool,
}

impl Settings {
    fn resolve(cli: &Cli, config: Config) -> Result<Self> {
        let handshake = match cli.upload_handshake {
            Some(handshake) => handshake,
            None => config
                .upload_handshake()
                .map_err(|e| CliError::Config(format!("{e:#}")))?
                .unwrap_or_default(),
        };
        let port = cli
            .port
            .clone()
            .unwrap_or_else(|| config.serial_port().to_string());

        Ok(Self {
            port,
            session: SessionConfig {
                upload_handshake: handshake,
                ..SessionConfig::default()
            },
            config,
            cancel: CancelToken::new(),
            quiet: cli.quiet,
        })
    }

    /// Open a session on the configured port and stop whatever the device was doing.
    pub(crate) fn open_session(&self) -> Result<Session<NativePort>> {
        debug!(
            "Opening {} (upload handshake: {})",
            self.port, self.session.upload_handshake
        );
        let mut session = Session::open(&self.port)
            .with_context(|| format!("Could not open {}", self.port))?
            .with_config(self.session.clone())
            .with_cancel_token(self.cancel.clone());
        session.abort()?;
        Ok(session)
    }
}

/// Map an error to the process exit code.
fn exit_code(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    match err
        .downcast_ref::<smsprog::Error>()
        .map(smsprog::Error::category)
    {
        Some(ErrorCategory::Unreachable) => 4,
        Some(ErrorCategory::Rejected) => 5,
        Some(ErrorCategory::FirmwareUpdate) => 6,
        Some(ErrorCategory::Cancelled) => 130,
        Some(ErrorCategory::Local) | None => 1,
    }
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        // Disable all color output
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "smsprog v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(err) = run(&cli) {
        let code = exit_code(&err);
        eprintln!("{} {:#}", style("Error:").red().bold(), err);
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = match cli.config_path {
        Some(ref path) => {
            Config::load_from_path(path).map_err(|e| CliError::Config(format!("{e:#}")))?
        },
        None => Config::load(),
    };
    let settings = Settings::resolve(cli, config)?;

    let cancel = settings.cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || cancel.cancel()) {
        warn!("Could not install Ctrl-C handler: {e}");
    }

    match cli.command {
        Commands::Info { json } => cmd_info(&settings, json),
        Commands::Read { ref output } => cmd_read(&settings, output),
        Commands::Program {
            ref input,
            no_erase,
            verify,
        } => cmd_program(&settings, input, !no_erase, verify),
        Commands::Erase => cmd_erase(&settings),
        Commands::BlankCheck => cmd_blank_check(&settings),
        Commands::Verify { ref input } => cmd_verify(&settings, input),
        Commands::Bootloader => cmd_bootloader(&settings),
        Commands::UpdateFirmware {
            ref image,
            ref tool,
            ref device,
        } => cmd_update_firmware(&settings, image, tool.as_deref(), device.as_deref()),
        Commands::ListPorts { json } => cmd_list_ports(json),
    }
}
