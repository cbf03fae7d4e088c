/// CRC-16/MODBUS (reflected poly 0xA001, init 0xFFFF). Sent low byte first.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus() {
        let data = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16_modbus(&data).to_le_bytes(), [0x84, 0x0A]);
    }

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc16_modbus(b"123456789"), 0x4B37);
    }
}
