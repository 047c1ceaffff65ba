//! Register value conversion: encodings, byte/word order, engineering and display values

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, Result};

/// Numeric encoding of a register value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// One register, two's complement
    Int16,
    /// Two registers
    Uint32,
    /// Two registers, IEEE 754
    Float32,
}

impl Encoding {
    pub fn register_count(self) -> u16 {
        match self {
            Encoding::Int16 => 1,
            Encoding::Uint32 | Encoding::Float32 => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Int16 => "int16",
            Encoding::Uint32 => "uint32",
            Encoding::Float32 => "float32",
        }
    }
}

impl FromStr for Encoding {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int16" | "i16" => Ok(Encoding::Int16),
            "uint32" | "u32" => Ok(Encoding::Uint32),
            "float32" | "f32" | "float" => Ok(Encoding::Float32),
            other => Err(CollectorError::config(format!(
                "Unknown data type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte layout of a value across registers.
///
/// Letters name the bytes of the big-endian value; the variant describes how
/// they arrive on the wire. For 16-bit values only the byte swap matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// ABCD, no swapping
    #[default]
    BigEndian,
    /// CDAB, registers swapped
    WordSwap,
    /// BADC, bytes swapped inside each register
    ByteSwap,
    /// DCBA, both swapped
    LittleEndian,
}

impl ByteOrder {
    pub fn swaps_words(self) -> bool {
        matches!(self, ByteOrder::WordSwap | ByteOrder::LittleEndian)
    }

    pub fn swaps_bytes(self) -> bool {
        matches!(self, ByteOrder::ByteSwap | ByteOrder::LittleEndian)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ByteOrder::BigEndian => "ABCD",
            ByteOrder::WordSwap => "CDAB",
            ByteOrder::ByteSwap => "BADC",
            ByteOrder::LittleEndian => "DCBA",
        }
    }
}

impl FromStr for ByteOrder {
    type Err = CollectorError;

    /// Accepts the `swap` keywords of machine files and the ABCD notation
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "abcd" | "big" | "big_endian" => Ok(ByteOrder::BigEndian),
            "word" | "cdab" | "word_swap" => Ok(ByteOrder::WordSwap),
            "byte" | "badc" | "byte_swap" => Ok(ByteOrder::ByteSwap),
            "both" | "dcba" | "little" | "little_endian" => Ok(ByteOrder::LittleEndian),
            other => Err(CollectorError::config(format!(
                "Unknown swap/byte order: {}",
                other
            ))),
        }
    }
}

/// How a reading is rendered for humans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayFormat {
    #[default]
    Raw,
    /// `ON` when value > 0, otherwise `OFF`
    Boolean,
    /// Lookup in the sensor's value map, `#<n>` for unknown codes
    Mapped,
}

impl DisplayFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DisplayFormat::Raw => "raw",
            DisplayFormat::Boolean => "boolean",
            DisplayFormat::Mapped => "mapped",
        }
    }
}

impl FromStr for DisplayFormat {
    type Err = CollectorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "raw" | "number" => Ok(DisplayFormat::Raw),
            "boolean" | "bool" => Ok(DisplayFormat::Boolean),
            "mapped" | "enum" => Ok(DisplayFormat::Mapped),
            other => Err(CollectorError::config(format!(
                "Unknown display format: {}",
                other
            ))),
        }
    }
}

/// Arrange two wire registers into big-endian value bytes
fn regs_to_bytes_4(regs: [u16; 2], order: ByteOrder) -> [u8; 4] {
    let [mut hi, mut lo] = regs;
    if order.swaps_words() {
        std::mem::swap(&mut hi, &mut lo);
    }
    if order.swaps_bytes() {
        hi = hi.swap_bytes();
        lo = lo.swap_bytes();
    }
    let [a, b] = hi.to_be_bytes();
    let [c, d] = lo.to_be_bytes();
    [a, b, c, d]
}

fn bytes_4_to_regs(bytes: [u8; 4], order: ByteOrder) -> [u16; 2] {
    let mut hi = u16::from_be_bytes([bytes[0], bytes[1]]);
    let mut lo = u16::from_be_bytes([bytes[2], bytes[3]]);
    if order.swaps_bytes() {
        hi = hi.swap_bytes();
        lo = lo.swap_bytes();
    }
    if order.swaps_words() {
        std::mem::swap(&mut hi, &mut lo);
    }
    [hi, lo]
}

/// Decode register words into the raw numeric value
pub fn decode_registers(encoding: Encoding, order: ByteOrder, regs: &[u16]) -> Result<f64> {
    let needed = usize::from(encoding.register_count());
    if regs.len() < needed {
        return Err(CollectorError::data(format!(
            "{} needs {} register(s), got {}",
            encoding,
            needed,
            regs.len()
        )));
    }

    let value = match encoding {
        Encoding::Int16 => {
            let word = if order.swaps_bytes() {
                regs[0].swap_bytes()
            } else {
                regs[0]
            };
            f64::from(word as i16)
        },
        Encoding::Uint32 => {
            f64::from(u32::from_be_bytes(regs_to_bytes_4([regs[0], regs[1]], order)))
        },
        Encoding::Float32 => {
            let value = f32::from_be_bytes(regs_to_bytes_4([regs[0], regs[1]], order));
            if !value.is_finite() {
                return Err(CollectorError::data(format!(
                    "Non-finite float32 from registers {:04X} {:04X}",
                    regs[0], regs[1]
                )));
            }
            f64::from(value)
        },
    };
    Ok(value)
}

/// Inverse of [`decode_registers`] for values representable in `encoding`
pub fn encode_registers(raw: f64, encoding: Encoding, order: ByteOrder) -> Result<Vec<u16>> {
    match encoding {
        Encoding::Int16 => {
            if raw.fract() != 0.0 || raw < f64::from(i16::MIN) || raw > f64::from(i16::MAX) {
                return Err(CollectorError::data(format!("{} does not fit int16", raw)));
            }
            let word = raw as i16 as u16;
            Ok(vec![if order.swaps_bytes() {
                word.swap_bytes()
            } else {
                word
            }])
        },
        Encoding::Uint32 => {
            if raw.fract() != 0.0 || raw < 0.0 || raw > f64::from(u32::MAX) {
                return Err(CollectorError::data(format!("{} does not fit uint32", raw)));
            }
            Ok(bytes_4_to_regs((raw as u32).to_be_bytes(), order).to_vec())
        },
        Encoding::Float32 => Ok(bytes_4_to_regs((raw as f32).to_be_bytes(), order).to_vec()),
    }
}

/// `raw * scale + offset`, rounded half away from zero to `precision` decimals
pub fn engineering_value(raw: f64, scale: f64, offset: f64, precision: Option<u32>) -> f64 {
    let value = raw * scale + offset;
    match precision {
        Some(digits) => {
            let factor = 10f64.powi(digits.min(15) as i32);
            (value * factor).round() / factor
        },
        None => value,
    }
}

/// Render a value per display format. Raw values keep a fractional part,
/// so 23 renders as "23.0".
pub fn display_value(format: DisplayFormat, value: f64, value_map: &BTreeMap<String, String>) -> String {
    match format {
        DisplayFormat::Raw => format!("{:?}", value),
        DisplayFormat::Boolean => {
            if value > 0.0 {
                "ON".to_string()
            } else {
                "OFF".to_string()
            }
        },
        DisplayFormat::Mapped => {
            let code = value.trunc() as i64;
            value_map
                .get(&code.to_string())
                .cloned()
                .unwrap_or_else(|| format!("#{}", code))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORDERS: [ByteOrder; 4] = [
        ByteOrder::BigEndian,
        ByteOrder::WordSwap,
        ByteOrder::ByteSwap,
        ByteOrder::LittleEndian,
    ];

    #[test]
    fn test_float32_word_swap_equals_reversed_registers() {
        // 12.5f32 = 0x41480000, plus a value with all four bytes distinct
        for regs in [[0x4148u16, 0x0000u16], [0x3F9D, 0xF3B6], [0xC2F6, 0xE979]] {
            let swapped = decode_registers(Encoding::Float32, ByteOrder::WordSwap, &regs).unwrap();
            let reversed =
                decode_registers(Encoding::Float32, ByteOrder::BigEndian, &[regs[1], regs[0]])
                    .unwrap();
            assert_eq!(swapped, reversed);
        }
    }

    #[test]
    fn test_decode_known_values() {
        assert_eq!(
            decode_registers(Encoding::Float32, ByteOrder::BigEndian, &[0x4148, 0x0000]).unwrap(),
            12.5
        );
        assert_eq!(
            decode_registers(Encoding::Float32, ByteOrder::WordSwap, &[0x0000, 0x4148]).unwrap(),
            12.5
        );
        assert_eq!(
            decode_registers(Encoding::Uint32, ByteOrder::BigEndian, &[0x0001, 0x0002]).unwrap(),
            65538.0
        );
        assert_eq!(
            decode_registers(Encoding::Int16, ByteOrder::BigEndian, &[0xFFFE]).unwrap(),
            -2.0
        );
        assert_eq!(
            decode_registers(Encoding::Int16, ByteOrder::ByteSwap, &[0xFEFF]).unwrap(),
            -2.0
        );
        assert_eq!(
            decode_registers(Encoding::Uint32, ByteOrder::LittleEndian, &[0x0200, 0x0100]).unwrap(),
            65538.0
        );
    }

    #[test]
    fn test_int16_bounds() {
        assert_eq!(
            decode_registers(Encoding::Int16, ByteOrder::BigEndian, &[0x8000]).unwrap(),
            -32768.0
        );
        assert_eq!(
            decode_registers(Encoding::Int16, ByteOrder::BigEndian, &[0x7FFF]).unwrap(),
            32767.0
        );
    }

    #[test]
    fn test_decode_rejects_short_input_and_nan() {
        assert!(decode_registers(Encoding::Float32, ByteOrder::BigEndian, &[0x4148]).is_err());
        assert!(decode_registers(Encoding::Int16, ByteOrder::BigEndian, &[]).is_err());
        assert!(decode_registers(Encoding::Float32, ByteOrder::BigEndian, &[0x7FC0, 0x0000]).is_err());
    }

    #[test]
    fn test_encode_reproduces_register_bits() {
        let cases: [(Encoding, &[u16]); 3] = [
            (Encoding::Int16, &[0xFF38]),
            (Encoding::Uint32, &[0xDEAD, 0xBEEF]),
            (Encoding::Float32, &[0x4148, 0x0001]),
        ];
        for order in ORDERS {
            for (encoding, regs) in cases {
                let raw = decode_registers(encoding, order, regs).unwrap();
                assert_eq!(
                    encode_registers(raw, encoding, order).unwrap(),
                    regs.to_vec(),
                    "{:?} {:?}",
                    encoding,
                    order
                );
            }
        }
    }

    #[test]
    fn test_encode_rejects_out_of_range() {
        assert!(encode_registers(40000.0, Encoding::Int16, ByteOrder::BigEndian).is_err());
        assert!(encode_registers(-1.0, Encoding::Uint32, ByteOrder::BigEndian).is_err());
        assert!(encode_registers(1.5, Encoding::Int16, ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn test_engineering_value_rounding() {
        assert_eq!(engineering_value(235.0, 0.1, 0.0, Some(1)), 23.5);
        assert_eq!(engineering_value(100.0, 1.0, -40.0, Some(2)), 60.0);
        assert_eq!(engineering_value(1.0, 1.0 / 3.0, 0.0, Some(3)), 0.333);
        assert_eq!(engineering_value(-2.5, 1.0, 0.0, Some(0)), -3.0);
        assert_eq!(engineering_value(1.0, 1.0 / 3.0, 0.0, None), 1.0 / 3.0);
    }

    #[test]
    fn test_display_values() {
        let mut map = BTreeMap::new();
        map.insert("1".to_string(), "RUNNING".to_string());
        map.insert("2".to_string(), "STOPPED".to_string());

        assert_eq!(display_value(DisplayFormat::Boolean, 1.0, &map), "ON");
        assert_eq!(display_value(DisplayFormat::Boolean, 0.0, &map), "OFF");
        assert_eq!(display_value(DisplayFormat::Boolean, -3.0, &map), "OFF");
        assert_eq!(display_value(DisplayFormat::Mapped, 2.0, &map), "STOPPED");
        assert_eq!(display_value(DisplayFormat::Mapped, 7.0, &map), "#7");
        assert_eq!(display_value(DisplayFormat::Raw, 23.5, &map), "23.5");
        assert_eq!(display_value(DisplayFormat::Raw, 23.0, &map), "23.0");
        assert_eq!(display_value(DisplayFormat::Raw, -4.0, &map), "-4.0");
    }

    #[test]
    fn test_parse_config_keywords() {
        assert_eq!("word".parse::<ByteOrder>().unwrap(), ByteOrder::WordSwap);
        assert_eq!("DCBA".parse::<ByteOrder>().unwrap(), ByteOrder::LittleEndian);
        assert_eq!("float32".parse::<Encoding>().unwrap(), Encoding::Float32);
        assert_eq!("mapped".parse::<DisplayFormat>().unwrap(), DisplayFormat::Mapped);
        assert!("int64".parse::<Encoding>().is_err());
    }
}
