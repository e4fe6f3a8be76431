//! CRC-16/ARC (reflected polynomial 0x8005, init 0, no final XOR).
//!
//! Used for out-of-band spot checks on packets we build ourselves. Data
//! arriving from the network is vouched for by the signature validator,
//! never by this checksum.

const CRC16_TABLE: [u16; 256] = {
    let mut table = [0u16; 256];
    let mut i = 0u16;
    while i < 256 {
        let mut crc = i;
        let mut j = 0;
        while j < 8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i as usize] = crc;
        i += 1;
    }
    table
};

/// Compute CRC-16/ARC over a byte slice.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc = (crc >> 8) ^ CRC16_TABLE[((crc ^ byte as u16) & 0x00ff) as usize];
    }
    crc
}
