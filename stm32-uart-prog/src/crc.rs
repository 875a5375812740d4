/// CRC-8/GSM-A: polynomial 0x1D, init 0x00, no reflection, no final XOR.
///
/// Used to checksum the 9-byte application-layer mute/enter-bootloader
/// frames before their trailing CRC byte.
pub fn crc8_gsm_a(buffer: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in buffer {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x1D } else { crc << 1 };
        }
    }
    crc
}

/// XOR checksum used throughout the bootloader wire protocol: address
/// bytes, length-prefixed payloads, and erase-sector payloads all end with
/// one byte equal to the XOR of everything that preceded it.
pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc8_gsm_a_of_empty_is_zero() {
        assert_eq!(crc8_gsm_a(&[]), 0);
    }

    #[test]
    fn crc8_gsm_a_reference_vectors() {
        // Broadcast mute frame body, command 0xDA.
        let mute = [0xAA, 0x01, 0xFF, 0xFF, 0x03, 0xDA, 0x00, 0x00, 0x00];
        assert_eq!(crc8_gsm_a(&mute), 0x2B);

        // Unicast enter-bootloader frame body for device ID 1, command 0xDF.
        let enter = [0xAA, 0x01, 0x00, 0x01, 0x03, 0xDF, 0x00, 0x00, 0x00];
        assert_eq!(crc8_gsm_a(&enter), 0x42);
    }

    #[test]
    fn xor_checksum_of_single_byte_is_itself() {
        assert_eq!(xor_checksum(&[0x42]), 0x42);
    }

    #[test]
    fn xor_checksum_cancels_pairs() {
        assert_eq!(xor_checksum(&[0x11, 0x11, 0x22, 0x22]), 0);
    }
}
