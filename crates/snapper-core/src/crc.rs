//! CRC16 used by the receiver firmware to verify a flashed image.
//!
//! This is the device's own table-free shift/XOR sequence. The host value
//! must match the device bit for bit.

/// Compute the device CRC16 over `data`, starting from zero.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| crc16_update(crc, byte))
}

/// Feed one byte into a running CRC.
pub fn crc16_update(crc: u16, byte: u8) -> u16 {
    let mut code = (crc >> 8) & 0xFF;
    code ^= u16::from(byte);
    code ^= code >> 4;
    let mut crc = crc << 8;
    crc ^= code;
    // The second shift applies to the already shifted code.
    code <<= 5;
    crc ^= code;
    code <<= 7;
    crc ^= code;
    crc
}
