// lib.rs

mod client;
mod codec;
mod exception;
mod transport;

pub use client::{ClientConfig, ModbusClient, ModbusClientBuilder, QuantityLimits};
pub use codec::{
    FunctionCode, MbapHeader, RequestFrame, MBAP_HEADER_LEN, MIN_RESPONSE_LEN,
    RESPONSE_BUFFER_LEN,
};
pub use exception::{check_response, ExceptionCode};
pub use transport::{ResponseRead, TcpTransport};

#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("Connection error: {0}")]
    ConnectionFailure(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Modbus exception: function code {function:#04x}, {code}")]
    Exception { function: u8, code: ExceptionCode },

    #[error("Response timed out")]
    Timeout,

    #[error("Frame too short: expected at least {expected} bytes, received {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("Unexpected function code: expected {expected:#04x}, got {received:#04x}")]
    UnexpectedFunctionCode { expected: u8, received: u8 },

    #[error("Byte count mismatch: expected {expected}, received {received}")]
    ByteCountMismatch { expected: usize, received: usize },

    #[error("Invalid protocol ID: {0}")]
    InvalidProtocolId(u16),

    #[error("Unit ID mismatch: expected {expected}, received {received}")]
    UnitIdMismatch { expected: u8, received: u8 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of a [`ModbusError`], used to pick a recovery
/// strategy: reconnect on connection problems, fix the request otherwise.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    FunctionCodeNotSupported,
    IllegalDataAddress,
    IllegalDataValue,
    ServerDeviceFailure,
    Unknown(u8),
    ConnectionFailure,
    Timeout,
    InvalidArgument,
    Protocol,
}

impl ModbusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModbusError::Exception { code, .. } => match code {
                ExceptionCode::FunctionCodeNotSupported => ErrorKind::FunctionCodeNotSupported,
                ExceptionCode::IllegalDataAddress => ErrorKind::IllegalDataAddress,
                ExceptionCode::IllegalDataValue => ErrorKind::IllegalDataValue,
                ExceptionCode::ServerDeviceFailure => ErrorKind::ServerDeviceFailure,
                ExceptionCode::Unknown(raw) => ErrorKind::Unknown(*raw),
            },
            ModbusError::ConnectionFailure(_) | ModbusError::Io(_) => ErrorKind::ConnectionFailure,
            ModbusError::Timeout => ErrorKind::Timeout,
            ModbusError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ModbusError::FrameTooShort { .. }
            | ModbusError::UnexpectedFunctionCode { .. }
            | ModbusError::ByteCountMismatch { .. }
            | ModbusError::InvalidProtocolId(_)
            | ModbusError::UnitIdMismatch { .. } => ErrorKind::Protocol,
        }
    }

    /// True for server-side rejections of a well-formed request.
    pub fn is_exception(&self) -> bool {
        matches!(self, ModbusError::Exception { .. })
    }
}
