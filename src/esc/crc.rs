//! KISS frame checksum.
//!
//! CRC-8/SMBUS: polynomial 0x07, seed 0, no reflection, no final XOR.

use crc::{Crc, CRC_8_SMBUS};

const KISS_CRC: Crc<u8> = Crc::<u8>::new(&CRC_8_SMBUS);

/// Checksum over the payload bytes of a KISS frame
///
/// ```
/// use rotor_rpm::esc::crc::crc8_kiss;
///
/// assert_eq!(crc8_kiss(&[0x01]), 0x07);
/// ```
pub fn crc8_kiss(data: &[u8]) -> u8 {
    KISS_CRC.checksum(data)
}

/// True when `payload` checksums to `expected`
pub fn validate_crc8_kiss(payload: &[u8], expected: u8) -> bool {
    crc8_kiss(payload) == expected
}
