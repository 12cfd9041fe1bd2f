use std::fmt;

use tracing::warn;

use crate::ModbusError;
use crate::codec::{FunctionCode, MIN_RESPONSE_LEN, MbapHeader};

const EXCEPTION_BIT: u8 = 0x80;

/// Exception code carried in byte 8 of an exception response.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExceptionCode {
    FunctionCodeNotSupported,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Unknown(u8),
}

impl ExceptionCode {
    pub const fn from_u8(code: u8) -> Self {
        match code {
            0x01 => Self::FunctionCodeNotSupported,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::ServerDeviceFailure,
            other => Self::Unknown(other),
        }
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            Self::FunctionCodeNotSupported => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::ServerDeviceFailure => 0x04,
            Self::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FunctionCodeNotSupported => write!(f, "function code not supported"),
            Self::IllegalDataAddress => write!(f, "starting address or quantity invalid"),
            Self::IllegalDataValue => write!(f, "quantity or value invalid"),
            Self::ServerDeviceFailure => write!(f, "server device failure"),
            Self::Unknown(raw) => write!(f, "unknown exception code {raw:#04x}"),
        }
    }
}

/// Classifies a raw response before any data is decoded from it.
///
/// An empty read means the peer closed the stream and is reported as a
/// connection failure. Frames shorter than [`MIN_RESPONSE_LEN`], a non-zero
/// protocol id, a foreign unit id or a reply to some other function are
/// protocol errors. A function code with the high bit set turns into
/// [`ModbusError::Exception`].
pub fn check_response(
    frame: &[u8],
    unit_id: u8,
    expected: FunctionCode,
) -> Result<(), ModbusError> {
    if frame.is_empty() {
        return Err(ModbusError::ConnectionFailure("stream is null".into()));
    }

    if frame.len() < MIN_RESPONSE_LEN {
        return Err(ModbusError::FrameTooShort {
            expected: MIN_RESPONSE_LEN,
            actual: frame.len(),
        });
    }

    let header = MbapHeader::parse(frame)?;
    if header.protocol_id != 0 {
        return Err(ModbusError::InvalidProtocolId(header.protocol_id));
    }
    if header.unit_id != unit_id {
        return Err(ModbusError::UnitIdMismatch {
            expected: unit_id,
            received: header.unit_id,
        });
    }

    let function_code = frame[7];
    let function = function_code & !EXCEPTION_BIT;
    if function != expected.code() {
        return Err(ModbusError::UnexpectedFunctionCode {
            expected: expected.code(),
            received: function_code,
        });
    }

    if function_code & EXCEPTION_BIT != 0 {
        let code = ExceptionCode::from_u8(frame[8]);
        warn!(function, exception = code.as_u8(), "Server returned exception: {code}");
        return Err(ModbusError::Exception { function, code });
    }

    Ok(())
}
