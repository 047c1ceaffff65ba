//! Modbus TCP framing: PDU buffer, read requests, MBAP header, response parsing
//!
//! Pure functions, no I/O. The transport layer feeds raw bytes in and gets
//! register words out.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CollectorError, Result};

/// MBAP header bytes preceding the length-counted part:
/// Transaction ID(2) + Protocol ID(2) + Length(2). The unit id is counted in Length.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size (RS485 ADU 256 - address 1 - CRC 2)
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// FC03/FC04 limit: 1 + 1 + 2N <= 253
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// FC01/FC02 limit
pub const MODBUS_MAX_READ_COILS: u16 = 2000;

const MODBUS_PROTOCOL_ID: u16 = 0;

/// Read function codes understood by the collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FunctionCode {
    ReadCoils,
    ReadDiscreteInputs,
    ReadHoldingRegisters,
    ReadInputRegisters,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 0x01,
            FunctionCode::ReadDiscreteInputs => 0x02,
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::ReadInputRegisters => 0x04,
        }
    }

    /// Coil/discrete reads return bits instead of 16-bit words
    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs
        )
    }
}

impl TryFrom<u8> for FunctionCode {
    type Error = CollectorError;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            other => Err(CollectorError::config(format!(
                "Unsupported function code: {}",
                other
            ))),
        }
    }
}

impl From<FunctionCode> for u8 {
    fn from(fc: FunctionCode) -> Self {
        fc.code()
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FC{:02}", self.code())
    }
}

fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Failed To Respond",
        _ => "Unknown Exception",
    }
}

/// PDU backed by a fixed-size stack array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(CollectorError::protocol(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(CollectorError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        for byte in value.to_be_bytes() {
            self.push(byte)?;
        }
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    pub fn is_exception(&self) -> bool {
        self.function_code().is_some_and(|fc| fc & 0x80 != 0)
    }

    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.as_slice().get(1).copied()
        } else {
            None
        }
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// One read request: function code, start address and item count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub function: FunctionCode,
    pub address: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn new(function: FunctionCode, address: u16, count: u16) -> Result<Self> {
        let limit = if function.is_bit_access() {
            MODBUS_MAX_READ_COILS
        } else {
            MODBUS_MAX_READ_REGISTERS
        };
        if count == 0 || count > limit {
            return Err(CollectorError::protocol(format!(
                "{} count {} out of range 1..={}",
                function, count, limit
            )));
        }
        if u32::from(address) + u32::from(count) > 0x1_0000 {
            return Err(CollectorError::protocol(format!(
                "{} address range {}+{} exceeds 65535",
                function, address, count
            )));
        }
        Ok(Self {
            function,
            address,
            count,
        })
    }

    pub fn to_pdu(&self) -> Result<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        pdu.push(self.function.code())?;
        pdu.push_u16(self.address)?;
        pdu.push_u16(self.count)?;
        Ok(pdu)
    }

    /// Expected data byte count in the response
    fn expected_bytes(&self) -> usize {
        if self.function.is_bit_access() {
            usize::from(self.count).div_ceil(8)
        } else {
            usize::from(self.count) * 2
        }
    }
}

/// Build a full Modbus TCP ADU: MBAP header + unit id + PDU
pub fn encode_adu(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu.as_slice());
    frame
}

/// Parsed MBAP header (without the unit id)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Bytes that follow the header: unit id + PDU
    pub length: usize,
}

impl MbapHeader {
    pub fn parse(header: &[u8; MBAP_HEADER_LEN]) -> Result<Self> {
        let parsed = Self {
            transaction_id: u16::from_be_bytes([header[0], header[1]]),
            protocol_id: u16::from_be_bytes([header[2], header[3]]),
            length: usize::from(u16::from_be_bytes([header[4], header[5]])),
        };
        if parsed.protocol_id != MODBUS_PROTOCOL_ID {
            return Err(CollectorError::protocol(format!(
                "Unexpected protocol id {}",
                parsed.protocol_id
            )));
        }
        // At least unit id + function code
        if parsed.length < 2 || parsed.length > MAX_MBAP_LENGTH {
            return Err(CollectorError::protocol(format!(
                "Invalid MBAP length: {}",
                parsed.length
            )));
        }
        Ok(parsed)
    }
}

/// Decode a read response PDU into one word per requested item.
///
/// Register reads yield the raw 16-bit words; bit reads yield 0/1 per item.
pub fn parse_read_response(pdu: &ModbusPdu, request: &ReadRequest) -> Result<Vec<u16>> {
    let data = pdu.as_slice();
    let fc = pdu
        .function_code()
        .ok_or_else(|| CollectorError::protocol("Empty response PDU"))?;

    if pdu.is_exception() {
        let code = pdu.exception_code().unwrap_or(0);
        return Err(CollectorError::protocol(format!(
            "{} exception 0x{:02X} ({})",
            request.function,
            code,
            exception_description(code)
        )));
    }

    if fc != request.function.code() {
        return Err(CollectorError::protocol(format!(
            "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
            request.function.code(),
            fc
        )));
    }

    let byte_count = usize::from(
        *data
            .get(1)
            .ok_or_else(|| CollectorError::protocol("Response missing byte count"))?,
    );
    let payload = &data[2..];
    if payload.len() < byte_count || byte_count < request.expected_bytes() {
        return Err(CollectorError::protocol(format!(
            "Short response: byte count {}, payload {}, expected {}",
            byte_count,
            payload.len(),
            request.expected_bytes()
        )));
    }

    let values: Vec<u16> = if request.function.is_bit_access() {
        (0..usize::from(request.count))
            .map(|i| u16::from((payload[i / 8] >> (i % 8)) & 0x01))
            .collect()
    } else {
        payload[..request.expected_bytes()]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    };

    debug!(
        "{} @{} parsed {} item(s)",
        request.function,
        request.address,
        values.len()
    );
    Ok(values)
}
