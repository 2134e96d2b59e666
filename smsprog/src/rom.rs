//! ROM image inspection.

/// Offset of the `TMR SEGA` signature.
pub const TMR_OFFSET: usize = 0x7FF0;

/// Offset of the `SDSC` homebrew header signature.
pub const SDSC_OFFSET: usize = 0x7FE0;

const TMR_MAGIC: &[u8] = b"TMR SEGA";
const SDSC_MAGIC: &[u8] = b"SDSC";

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xFF;

/// Headers found in a ROM image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RomHeader {
    /// Official Sega header present.
    pub tmr_sega: bool,
    /// SDSC header present.
    pub sdsc: bool,
}

impl RomHeader {
    /// Look for the known header signatures in `image`.
    pub fn inspect(image: &[u8]) -> Self {
        Self {
            tmr_sega: has_magic(image, TMR_OFFSET, TMR_MAGIC),
            sdsc: has_magic(image, SDSC_OFFSET, SDSC_MAGIC),
        }
    }
}

fn has_magic(image: &[u8], offset: usize, magic: &[u8]) -> bool {
    image
        .get(offset..offset + magic.len())
        .is_some_and(|found| found == magic)
}

/// Number of bytes that are not erased.
pub fn count_non_blank(image: &[u8]) -> usize {
    image
        .iter()
        .filter(|&&b| b != ERASED)
        .count()
}
