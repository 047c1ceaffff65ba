//! Protocol codec: Modbus TCP framing and register value conversion

pub mod frame;
pub mod value;

pub use frame::{
    encode_adu, parse_read_response, FunctionCode, MbapHeader, ModbusPdu, ReadRequest,
    MBAP_HEADER_LEN, MAX_MBAP_LENGTH, MAX_PDU_SIZE,
};
pub use value::{
    decode_registers, display_value, encode_registers, engineering_value, ByteOrder,
    DisplayFormat, Encoding,
};
