//! Subset of the CAN database (DBC) format: `BO_` message and `SG_` signal
//! definitions, enough to turn frame payloads into physical values.

use std::collections::HashMap;
use std::path::Path;

use crate::utils::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// `@1`, Intel
    LittleEndian,
    /// `@0`, Motorola
    BigEndian,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbcSignal {
    pub name: String,
    pub start_bit: u16,
    pub length: u16,
    pub byte_order: ByteOrder,
    pub signed: bool,
    pub scale: f64,
    pub offset: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbcMessage {
    /// 11 or 29 bit identifier, without the extended flag.
    pub id: u32,
    /// Whether frames use the 29 bit format.
    pub extended: bool,
    pub name: String,
    pub dlc: u8,
    pub signals: Vec<DbcSignal>,
}

#[derive(Debug, Clone, Default)]
pub struct DbcDatabase {
    messages: HashMap<u32, DbcMessage>,
}

impl DbcDatabase {
    pub fn parse(content: &str) -> Result<Self, DriverError> {
        let mut messages = HashMap::new();
        let mut current: Option<u32> = None;

        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with("BO_ ") {
                let message = parse_message(trimmed)
                    .ok_or_else(|| DriverError::Protocol(format!("DBC line {}: bad BO_ definition", lineno + 1)))?;
                current = Some(message.id);
                messages.insert(message.id, message);
            } else if trimmed.starts_with("SG_ ") {
                let signal = parse_signal(trimmed)
                    .ok_or_else(|| DriverError::Protocol(format!("DBC line {}: bad SG_ definition", lineno + 1)))?;
                let id = current
                    .ok_or_else(|| DriverError::Protocol(format!("DBC line {}: SG_ outside of BO_", lineno + 1)))?;
                if let Some(message) = messages.get_mut(&id) {
                    message.signals.push(signal);
                }
            } else if trimmed.is_empty() || !line.starts_with(char::is_whitespace) {
                current = None;
            }
        }

        Ok(Self { messages })
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self, DriverError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            DriverError::Protocol(format!("cannot read DBC file {}: {}", path.as_ref().display(), e))
        })?;
        Self::parse(&content)
    }

    pub fn message(&self, id: u32) -> Option<&DbcMessage> {
        self.messages.get(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn find_signal(&self, id: u32, message_name: Option<&str>, signal_name: &str) -> Result<&DbcSignal, DriverError> {
        let message = self
            .message(id)
            .ok_or_else(|| DriverError::Protocol(format!("no message with id 0x{:X} in DBC", id)))?;
        if let Some(expected) = message_name {
            if message.name != expected {
                return Err(DriverError::Protocol(format!(
                    "message 0x{:X} is '{}', expected '{}'",
                    id, message.name, expected
                )));
            }
        }
        message
            .signals
            .iter()
            .find(|s| s.name == signal_name)
            .ok_or_else(|| DriverError::Protocol(format!("signal '{}' not in message '{}'", signal_name, message.name)))
    }
}

const EXTENDED_FLAG: u32 = 0x8000_0000;

fn parse_message(line: &str) -> Option<DbcMessage> {
    // BO_ 291 EngineData: 8 Vector__XXX
    let mut parts = line.split_whitespace().skip(1);
    let raw_id: u32 = parts.next()?.parse().ok()?;
    let name = parts.next()?.trim_end_matches(':').to_string();
    let dlc: u8 = parts.next()?.parse().ok()?;
    let id = raw_id & 0x1FFF_FFFF;
    let extended = raw_id & EXTENDED_FLAG != 0 || id > 0x7FF;
    Some(DbcMessage { id, extended, name, dlc, signals: Vec::new() })
}

fn parse_signal(line: &str) -> Option<DbcSignal> {
    // SG_ EngineSpeed : 0|16@1+ (0.125,0) [0|8031.875] "rpm" Vector__XXX
    let rest = line.strip_prefix("SG_")?.trim();
    let (head, tail) = rest.split_once(':')?;
    let name = head.split_whitespace().next()?.to_string();

    let mut parts = tail.split_whitespace();
    let layout = parts.next()?;
    let factor = parts.next()?;

    let (start, layout) = layout.split_once('|')?;
    let (length, flags) = layout.split_once('@')?;
    let mut flags = flags.chars();
    let byte_order = match flags.next()? {
        '1' => ByteOrder::LittleEndian,
        '0' => ByteOrder::BigEndian,
        _ => return None,
    };
    let signed = match flags.next()? {
        '-' => true,
        '+' => false,
        _ => return None,
    };

    let (scale, offset) = factor.strip_prefix('(')?.strip_suffix(')')?.split_once(',')?;
    let unit = tail.split('"').nth(1).unwrap_or("").to_string();

    let length: u16 = length.parse().ok()?;
    if length == 0 || length > 64 {
        return None;
    }

    Some(DbcSignal {
        name,
        start_bit: start.parse().ok()?,
        length,
        byte_order,
        signed,
        scale: scale.trim().parse().ok()?,
        offset: offset.trim().parse().ok()?,
        unit,
    })
}

impl DbcSignal {
    /// Raw bit pattern of the signal, before sign extension.
    pub fn raw_bits(&self, data: &[u8]) -> Result<u64, DriverError> {
        let length = self.length as usize;
        let start = self.start_bit as usize;
        let mut raw: u64 = 0;

        match self.byte_order {
            ByteOrder::LittleEndian => {
                if start + length > data.len() * 8 {
                    return Err(self.too_short(data));
                }
                for i in 0..length {
                    let pos = start + i;
                    let bit = (data[pos / 8] >> (pos % 8)) & 1;
                    raw |= (bit as u64) << i;
                }
            }
            ByteOrder::BigEndian => {
                // start bit is the MSB, walking the sawtooth bit numbering
                let mut pos = start;
                for _ in 0..length {
                    let byte = pos / 8;
                    if byte >= data.len() {
                        return Err(self.too_short(data));
                    }
                    let bit = (data[byte] >> (pos % 8)) & 1;
                    raw = (raw << 1) | bit as u64;
                    pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
                }
            }
        }
        Ok(raw)
    }

    /// `physical = raw * scale + offset`
    pub fn decode(&self, data: &[u8]) -> Result<f64, DriverError> {
        let raw = self.raw_bits(data)?;
        let value = if self.signed && self.length < 64 && raw & (1u64 << (self.length - 1)) != 0 {
            (raw as i64 - (1i64 << self.length)) as f64
        } else if self.signed {
            raw as i64 as f64
        } else {
            raw as f64
        };
        Ok(value * self.scale + self.offset)
    }

    fn too_short(&self, data: &[u8]) -> DriverError {
        DriverError::Protocol(format!("{} byte payload too short for signal '{}'", data.len(), self.name))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE_DBC: &str = r#"
VERSION ""

BU_: ECU Gateway

BO_ 291 EngineData: 8 ECU
 SG_ EngineSpeed : 0|16@1+ (0.125,0) [0|8031.875] "rpm" Gateway
 SG_ CoolantTemp : 16|8@1+ (1,-40) [-40|215] "degC" Gateway
 SG_ Torque : 24|12@1- (0.5,0) [-1024|1023.5] "Nm" Gateway

BO_ 2147484161 BatteryStatus: 8 ECU
 SG_ PackVoltage : 7|16@0+ (0.01,0) [0|655.35] "V" Gateway
"#;

    #[test]
    fn test_parse_messages_and_signals() {
        let db = DbcDatabase::parse(SAMPLE_DBC).unwrap();
        assert_eq!(db.len(), 2);
        let engine = db.message(291).unwrap();
        assert_eq!(engine.name, "EngineData");
        assert_eq!(engine.signals.len(), 3);
        assert_eq!(engine.signals[1].unit, "degC");
        assert!(!engine.extended);
        let battery = db.message(0x201).unwrap();
        assert_eq!(battery.name, "BatteryStatus");
        assert!(battery.extended);
    }

    #[test]
    fn test_intel_decode() {
        let db = DbcDatabase::parse(SAMPLE_DBC).unwrap();
        let data = [0x40, 0x1F, 0x5A, 0, 0, 0, 0, 0];
        let speed = db.find_signal(291, None, "EngineSpeed").unwrap();
        assert_eq!(speed.raw_bits(&data).unwrap(), 0x1F40);
        assert_eq!(speed.decode(&data).unwrap(), 0x1F40 as f64 * 0.125 + 0.0);

        let temp = db.find_signal(291, Some("EngineData"), "CoolantTemp").unwrap();
        assert_eq!(temp.decode(&data).unwrap(), 90.0 * 1.0 - 40.0);
    }

    #[test]
    fn test_signed_decode() {
        let db = DbcDatabase::parse(SAMPLE_DBC).unwrap();
        let torque = db.find_signal(291, None, "Torque").unwrap();
        // 12-bit 0xFFE = -2
        let data = [0, 0, 0, 0xFE, 0x0F, 0, 0, 0];
        assert_eq!(torque.decode(&data).unwrap(), -1.0);
    }

    #[test]
    fn test_motorola_decode() {
        let db = DbcDatabase::parse(SAMPLE_DBC).unwrap();
        let volts = db.find_signal(0x201, None, "PackVoltage").unwrap();
        let data = [0x9C, 0x40, 0, 0, 0, 0, 0, 0];
        assert_eq!(volts.raw_bits(&data).unwrap(), 0x9C40);
        assert!((volts.decode(&data).unwrap() - 400.0).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_errors() {
        let db = DbcDatabase::parse(SAMPLE_DBC).unwrap();
        assert!(db.find_signal(0x999, None, "EngineSpeed").is_err());
        assert!(db.find_signal(291, Some("Other"), "EngineSpeed").is_err());
        assert!(db.find_signal(291, None, "Missing").is_err());
        let speed = db.find_signal(291, None, "EngineSpeed").unwrap();
        assert!(speed.decode(&[0x01]).is_err());
    }

    #[test]
    fn test_bad_definition_rejected() {
        assert!(DbcDatabase::parse("BO_ 1 M: 8 X\n SG_ S : 0|0@1+ (1,0) [0|0] \"\" X\n").is_err());
        assert!(DbcDatabase::parse("BO_ x M: 8 X\n").is_err());
    }
}
