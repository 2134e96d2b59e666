//! CRC16-XMODEM (polynomial 0x1021, initial value 0).

/// Compute the CRC16-XMODEM of `data`.
pub fn crc16_xmodem(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| crc16_xmodem_update(crc, byte))
}

/// Feed one byte into a running CRC16-XMODEM.
pub fn crc16_xmodem_update(crc: u16, byte: u8) -> u16 {
    let mut crc = crc ^ (u16::from(byte) << 8);
    for _ in 0..8 {
        crc = if crc & 0x8000 != 0 {
            (crc << 1) ^ 0x1021
        } else {
            crc << 1
        };
    }
    crc
}

/// Eight-bit additive checksum used by plain XMODEM.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_xmodem_check_value() {
        assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
        assert_eq!(crc16_xmodem(&[]), 0);
    }

    #[test]
    fn test_checksum8_wraps() {
        assert_eq!(checksum8(&[0xFF; 128]), 0x80);
        assert_eq!(checksum8(&[1, 2, 3]), 6);
    }
}
