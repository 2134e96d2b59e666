//! Response markers of the programmer firmware.
//!
//! The firmware answers in free-form text, so every check is a literal
//! substring match wrapped in a named predicate.

/// Prompt printed after every command.
pub const PROMPT: &str = "\r\n> ";

/// Printed by `init` for writable cartridges.
pub const FLASH_CARTRIDGE: &str = "Cartridge type: FLASH";

/// Printed by `init` for mask ROM cartridges.
pub const ROM_CARTRIDGE: &str = "Cartridge type: ROM";

/// Printed by `init` when the flash chip is known to the firmware.
pub const SUPPORTED: &str = "(supported)";

/// Positive `bc` answer.
pub const BLANK_YES: &str = "Cartridge is blank: YES";

/// Label of the `version` answer line.
pub const VERSION_LABEL: &str = "Version:";

/// Printed by `dx` right before the transfer starts.
pub const DOWNLOAD_READY: &str = "CTRL+C to cancel.";

/// Printed by `ux` on firmware that does not announce with a NAK.
pub const UPLOAD_READY: &str = "READY. Please start uploading.";

/// Printed by the firmware when it rejects a command or its argument.
pub const ERROR: &str = "ERROR";

const ROM_SIZE_LABEL: &str = "ROM size set to ";
const CHIP_ARROW: &str = "=> ";

/// Decode device output as ASCII, dropping anything outside of it.
pub fn decode_ascii_lossy(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect()
}

/// Whether the `version` command was understood.
pub fn version_echoed(response: &str) -> bool {
    response.contains("version")
}

/// Value of the first `Version:` line, trimmed.
pub fn find_version_line(response: &str) -> Option<&str> {
    response
        .lines()
        .find_map(|line| {
            line.find(VERSION_LABEL)
                .map(|pos| &line[pos + VERSION_LABEL.len()..])
        })
        .map(str::trim)
}

/// Whether `init` reported a flash cartridge.
pub fn is_flash_cartridge(response: &str) -> bool {
    response.contains(FLASH_CARTRIDGE)
}

/// Whether `init` reported a supported flash chip.
///
/// The unsupported variant reads `(unknown/unsupported)`, which does not
/// contain the marker.
pub fn is_supported_flash(response: &str) -> bool {
    response.contains(SUPPORTED)
}

/// Whether `init` reported a mask ROM cartridge.
pub fn is_rom_cartridge(response: &str) -> bool {
    response.contains(ROM_CARTRIDGE)
}

/// Whether `bc` reported a blank cartridge.
pub fn is_blank(response: &str) -> bool {
    response.contains(BLANK_YES)
}

/// Whether the firmware rejected the command.
pub fn is_error(response: &str) -> bool {
    response
        .lines()
        .any(|line| line.trim() == ERROR)
}

/// Whether `dx` is ready to send.
pub fn download_ready(response: &str) -> bool {
    response.contains(DOWNLOAD_READY)
}

/// ROM size announced by `init` or `setromsize`; the last announcement wins.
pub fn parse_rom_size(response: &str) -> Option<u32> {
    response
        .lines()
        .filter_map(|line| {
            line.find(ROM_SIZE_LABEL)
                .map(|pos| line[pos + ROM_SIZE_LABEL.len()..].trim())
        })
        .filter_map(|value| value.parse().ok())
        .last()
}

/// Flash chip name from the `init` cartridge line, e.g. `MX29F040`.
pub fn parse_chip(response: &str) -> Option<String> {
    let line = response
        .lines()
        .find(|line| line.contains(FLASH_CARTRIDGE))?;
    let rest = &line[line.find(CHIP_ARROW)? + CHIP_ARROW.len()..];
    let name = rest
        .split(" (")
        .next()
        .unwrap_or(rest)
        .trim();
    (!name.is_empty()).then(|| name.to_string())
}
