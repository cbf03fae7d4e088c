use bytes::{BufMut, Bytes, BytesMut};

use super::crc::crc16_modbus;
use crate::sensors::models::RegisterType;
use crate::utils::error::DriverError;

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;

pub const MBAP_HEADER_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq)]
pub enum ModbusRequest {
    ReadCoils { start: u16, quantity: u16 },
    ReadDiscreteInputs { start: u16, quantity: u16 },
    ReadHoldingRegisters { start: u16, quantity: u16 },
    ReadInputRegisters { start: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModbusResponse {
    Bits(Vec<bool>),
    Registers(Vec<u16>),
    WriteAck,
}

impl ModbusRequest {
    pub fn read(register_type: RegisterType, start: u16, quantity: u16) -> Self {
        match register_type {
            RegisterType::Holding => ModbusRequest::ReadHoldingRegisters { start, quantity },
            RegisterType::Input => ModbusRequest::ReadInputRegisters { start, quantity },
            RegisterType::Coil => ModbusRequest::ReadCoils { start, quantity },
            RegisterType::Discrete => ModbusRequest::ReadDiscreteInputs { start, quantity },
        }
    }

    /// Builds the single-point write for a register type, or `None` when the
    /// table is read-only.
    pub fn write(register_type: RegisterType, address: u16, value: f64) -> Option<Self> {
        match register_type {
            RegisterType::Holding => Some(ModbusRequest::WriteSingleRegister {
                address,
                value: value.trunc().clamp(0.0, u16::MAX as f64) as u16,
            }),
            RegisterType::Coil => Some(ModbusRequest::WriteSingleCoil { address, value: value != 0.0 }),
            RegisterType::Input | RegisterType::Discrete => None,
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::ReadCoils { .. } => READ_COILS,
            ModbusRequest::ReadDiscreteInputs { .. } => READ_DISCRETE_INPUTS,
            ModbusRequest::ReadHoldingRegisters { .. } => READ_HOLDING_REGISTERS,
            ModbusRequest::ReadInputRegisters { .. } => READ_INPUT_REGISTERS,
            ModbusRequest::WriteSingleCoil { .. } => WRITE_SINGLE_COIL,
            ModbusRequest::WriteSingleRegister { .. } => WRITE_SINGLE_REGISTER,
        }
    }

    pub fn encode_pdu(&self, buf: &mut BytesMut) {
        buf.put_u8(self.function_code());
        match self {
            ModbusRequest::ReadCoils { start, quantity }
            | ModbusRequest::ReadDiscreteInputs { start, quantity }
            | ModbusRequest::ReadHoldingRegisters { start, quantity }
            | ModbusRequest::ReadInputRegisters { start, quantity } => {
                buf.put_u16(*start);
                buf.put_u16(*quantity);
            }
            ModbusRequest::WriteSingleCoil { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(if *value { 0xFF00 } else { 0x0000 });
            }
            ModbusRequest::WriteSingleRegister { address, value } => {
                buf.put_u16(*address);
                buf.put_u16(*value);
            }
        }
    }

    /// Length of a normal (non-exception) response PDU, function code included.
    pub fn response_pdu_len(&self) -> usize {
        match self {
            ModbusRequest::ReadCoils { quantity, .. } | ModbusRequest::ReadDiscreteInputs { quantity, .. } => {
                2 + (*quantity as usize + 7) / 8
            }
            ModbusRequest::ReadHoldingRegisters { quantity, .. }
            | ModbusRequest::ReadInputRegisters { quantity, .. } => 2 + *quantity as usize * 2,
            ModbusRequest::WriteSingleCoil { .. } | ModbusRequest::WriteSingleRegister { .. } => 5,
        }
    }
}

pub fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

pub fn decode_response_pdu(request: &ModbusRequest, pdu: &[u8]) -> Result<ModbusResponse, DriverError> {
    let fc = request.function_code();
    let (&received_fc, body) = pdu
        .split_first()
        .ok_or_else(|| DriverError::Protocol("empty response".to_string()))?;

    if received_fc == fc | 0x80 {
        let code = body.first().copied().unwrap_or(0);
        return Err(DriverError::Protocol(format!(
            "exception 0x{:02X} ({})",
            code,
            exception_name(code)
        )));
    }
    if received_fc != fc {
        return Err(DriverError::Protocol(format!(
            "unexpected function code 0x{:02X}, expected 0x{:02X}",
            received_fc, fc
        )));
    }
    if pdu.len() < request.response_pdu_len() {
        return Err(DriverError::Protocol(format!(
            "short response: {} bytes, expected {}",
            pdu.len(),
            request.response_pdu_len()
        )));
    }

    match request {
        ModbusRequest::ReadCoils { quantity, .. } | ModbusRequest::ReadDiscreteInputs { quantity, .. } => {
            let byte_count = body[0] as usize;
            if byte_count != (*quantity as usize + 7) / 8 {
                return Err(DriverError::Protocol(format!("bad byte count {}", byte_count)));
            }
            let bits = (0..*quantity as usize)
                .map(|i| body[1 + i / 8] & (1 << (i % 8)) != 0)
                .collect();
            Ok(ModbusResponse::Bits(bits))
        }
        ModbusRequest::ReadHoldingRegisters { quantity, .. } | ModbusRequest::ReadInputRegisters { quantity, .. } => {
            let byte_count = body[0] as usize;
            if byte_count != *quantity as usize * 2 {
                return Err(DriverError::Protocol(format!("bad byte count {}", byte_count)));
            }
            let registers = body[1..1 + byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            Ok(ModbusResponse::Registers(registers))
        }
        ModbusRequest::WriteSingleCoil { .. } | ModbusRequest::WriteSingleRegister { .. } => {
            let mut expected = BytesMut::with_capacity(5);
            request.encode_pdu(&mut expected);
            if &pdu[..5] != expected.as_ref() {
                return Err(DriverError::Protocol("write echo mismatch".to_string()));
            }
            Ok(ModbusResponse::WriteAck)
        }
    }
}

/// MBAP header + PDU for Modbus TCP.
pub fn encode_tcp_frame(transaction_id: u16, unit_id: u8, request: &ModbusRequest) -> Bytes {
    let mut pdu = BytesMut::with_capacity(5);
    request.encode_pdu(&mut pdu);

    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0); // protocol id
    frame.put_u16(pdu.len() as u16 + 1);
    frame.put_u8(unit_id);
    frame.extend_from_slice(&pdu);
    frame.freeze()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

pub fn decode_mbap_header(raw: &[u8; MBAP_HEADER_LEN]) -> Result<MbapHeader, DriverError> {
    let header = MbapHeader {
        transaction_id: u16::from_be_bytes([raw[0], raw[1]]),
        protocol_id: u16::from_be_bytes([raw[2], raw[3]]),
        length: u16::from_be_bytes([raw[4], raw[5]]),
        unit_id: raw[6],
    };
    if header.protocol_id != 0 {
        return Err(DriverError::Protocol(format!("bad protocol id {}", header.protocol_id)));
    }
    if header.length < 2 || header.length > 254 {
        return Err(DriverError::Protocol(format!("bad MBAP length {}", header.length)));
    }
    Ok(header)
}

/// Slave address + PDU + CRC for Modbus RTU.
pub fn encode_rtu_frame(slave_id: u8, request: &ModbusRequest) -> Bytes {
    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(slave_id);
    request.encode_pdu(&mut frame);
    let crc = crc16_modbus(&frame);
    frame.put_u16_le(crc);
    frame.freeze()
}

pub fn decode_rtu_frame(slave_id: u8, request: &ModbusRequest, frame: &[u8]) -> Result<ModbusResponse, DriverError> {
    if frame.len() < 5 {
        return Err(DriverError::Protocol(format!("frame too short: {} bytes", frame.len())));
    }
    let data_len = frame.len() - 2;
    let received_crc = u16::from_le_bytes([frame[data_len], frame[data_len + 1]]);
    let calculated_crc = crc16_modbus(&frame[..data_len]);
    if received_crc != calculated_crc {
        return Err(DriverError::Protocol(format!(
            "CRC mismatch: received 0x{:04X}, calculated 0x{:04X}",
            received_crc, calculated_crc
        )));
    }
    if frame[0] != slave_id {
        return Err(DriverError::Protocol(format!("response from slave {}, expected {}", frame[0], slave_id)));
    }
    decode_response_pdu(request, &frame[1..data_len])
}

/// Turns a read response into the sensor's raw numeric value.
/// One register is taken as-is, two are combined high word first.
pub fn extract_value(response: &ModbusResponse) -> Result<f64, DriverError> {
    match response {
        ModbusResponse::Bits(bits) => bits
            .first()
            .map(|b| if *b { 1.0 } else { 0.0 })
            .ok_or_else(|| DriverError::Protocol("no bits in response".to_string())),
        ModbusResponse::Registers(regs) => match regs.as_slice() {
            [single] => Ok(*single as f64),
            [hi, lo, ..] => Ok((((*hi as u32) << 16) | *lo as u32) as f64),
            [] => Err(DriverError::Protocol("no registers in response".to_string())),
        },
        ModbusResponse::WriteAck => Err(DriverError::Protocol("write ack has no value".to_string())),
    }
}
