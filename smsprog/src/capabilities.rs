//! Firmware version negotiation.
//!
//! Older programmer firmware lacks some commands. The version reported by
//! the `version` command is turned into an ordinal (`major * 100 + minor`)
//! and compared against a fixed table of the versions where each extended
//! command became usable.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::{
            exchange::CommandChannel,
            response::{find_version_line, version_echoed},
        },
    },
    log::{debug, info},
    std::{collections::BTreeSet, fmt},
};

/// Extended commands not present on every firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Capability {
    /// `bc`: on-device blank check.
    BlankCheck,
    /// `setromsize <n>`: fix the size of the next read.
    SetRomSize,
}

impl Capability {
    /// Capability name as shown to users.
    pub fn name(self) -> &'static str {
        match self {
            Self::BlankCheck => "blankcheck",
            Self::SetRomSize => "setromsize",
        }
    }

    /// Firmware command word.
    pub fn command(self) -> &'static str {
        match self {
            Self::BlankCheck => "bc",
            Self::SetRomSize => "setromsize",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordinal from which each capability works, in ascending order.
///
/// `setromsize` already exists in 1.2 but is broken there.
pub const CAPABILITY_TABLE: &[(u32, Capability)] = &[
    (102, Capability::BlankCheck),
    (103, Capability::SetRomSize),
];

/// Version assumed for firmware without a `version` command.
pub const BASELINE_VERSION: &str = "1.0";

/// Ordinal of [`BASELINE_VERSION`].
pub const BASELINE_ORDINAL: u32 = 100;

/// What the connected programmer firmware can do.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ProgrammerCapabilities {
    /// Version string as reported, e.g. `1.3`.
    pub version: String,
    /// `major * 100 + minor`.
    pub ordinal: u32,
    /// Supported extended commands.
    pub commands: BTreeSet<Capability>,
}

impl Default for ProgrammerCapabilities {
    fn default() -> Self {
        Self::from_ordinal(BASELINE_VERSION, BASELINE_ORDINAL)
    }
}

impl ProgrammerCapabilities {
    /// Build the capability set for a version ordinal.
    pub fn from_ordinal(version: impl Into<String>, ordinal: u32) -> Self {
        let commands = CAPABILITY_TABLE
            .iter()
            .take_while(|(threshold, _)| ordinal >= *threshold)
            .map(|&(_, capability)| capability)
            .collect();
        Self {
            version: version.into(),
            ordinal,
            commands,
        }
    }

    /// Parse a `<major>.<minor>` version string.
    pub fn from_version(version: &str) -> Result<Self> {
        let (major, minor) = version
            .split_once('.')
            .and_then(|(major, minor)| Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?)))
            .ok_or_else(|| Error::Protocol(format!("malformed firmware version {version:?}")))?;
        let ordinal = major
            .checked_mul(100)
            .and_then(|v| v.checked_add(minor))
            .ok_or_else(|| Error::Protocol(format!("firmware version {version:?} out of range")))?;
        Ok(Self::from_ordinal(version, ordinal))
    }

    /// Interpret the answer to the `version` command.
    pub fn from_response(response: &str) -> Result<Self> {
        if !version_echoed(response) {
            debug!("Firmware does not know the version command");
            return Ok(Self::default());
        }
        match find_version_line(response) {
            Some(version) => Self::from_version(version),
            None => {
                debug!("No version line in answer, assuming {BASELINE_VERSION}");
                Ok(Self::default())
            },
        }
    }

    /// Whether `capability` is available.
    pub fn supports(&self, capability: Capability) -> bool {
        self.commands
            .contains(&capability)
    }

    /// Fail with [`Error::CapabilityUnsupported`] unless `capability` is available.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(Error::CapabilityUnsupported {
                capability,
                version: self.version.clone(),
            })
        }
    }
}

/// Query the firmware version over `channel`.
pub fn negotiate<P: Port>(channel: &mut CommandChannel<P>) -> Result<ProgrammerCapabilities> {
    channel.resync()?;
    let response = channel.command("version")?;
    let caps = ProgrammerCapabilities::from_response(&response)?;
    info!(
        "Programmer firmware {} (capabilities: {:?})",
        caps.version, caps.commands
    );
    Ok(caps)
}
