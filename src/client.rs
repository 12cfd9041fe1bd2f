use std::time::Duration;

use tracing::debug;

use crate::ModbusError;
use crate::codec::{self, FunctionCode, RequestFrame};
use crate::exception::check_response;
use crate::transport::{ResponseRead, TcpTransport};

pub const DEFAULT_PORT: u16 = 502;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(400);
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_TRANSACTION_ID: u16 = 1;
const MAX_ADDRESS: i32 = 65535;

/// Largest quantity accepted per addressed function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QuantityLimits {
    pub read_coils: u16,
    pub read_discrete_inputs: u16,
    pub read_holding_registers: u16,
    pub read_input_registers: u16,
    pub write_multiple_coils: u16,
    pub write_multiple_registers: u16,
}

impl Default for QuantityLimits {
    fn default() -> Self {
        QuantityLimits {
            read_coils: 2000,
            read_discrete_inputs: 2000,
            read_holding_registers: 125,
            read_input_registers: 125,
            write_multiple_coils: 1968,
            write_multiple_registers: 123,
        }
    }
}

impl QuantityLimits {
    /// Same bound for every function.
    pub const fn uniform(max: u16) -> Self {
        QuantityLimits {
            read_coils: max,
            read_discrete_inputs: max,
            read_holding_registers: max,
            read_input_registers: max,
            write_multiple_coils: max,
            write_multiple_registers: max,
        }
    }

    /// `None` for single-value writes, which carry no quantity.
    pub fn max_for(&self, function: FunctionCode) -> Option<u16> {
        match function {
            FunctionCode::ReadCoils => Some(self.read_coils),
            FunctionCode::ReadDiscreteInputs => Some(self.read_discrete_inputs),
            FunctionCode::ReadHoldingRegisters => Some(self.read_holding_registers),
            FunctionCode::ReadInputRegisters => Some(self.read_input_registers),
            FunctionCode::WriteMultipleCoils => Some(self.write_multiple_coils),
            FunctionCode::WriteMultipleRegisters => Some(self.write_multiple_registers),
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub host: Option<String>,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Extra attempts after a timed-out connect; 1 means two attempts in total.
    pub connect_retries: u32,
    pub unit_id: u8,
    /// Sent unchanged with every request. One transaction is in flight at a time.
    pub transaction_id: u16,
    pub response_timeout: Option<Duration>,
    pub response_read: ResponseRead,
    pub limits: QuantityLimits,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: None,
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connect_retries: 1,
            unit_id: 0,
            transaction_id: DEFAULT_TRANSACTION_ID,
            response_timeout: Some(DEFAULT_RESPONSE_TIMEOUT),
            response_read: ResponseRead::SingleRead,
            limits: QuantityLimits::default(),
        }
    }
}

pub struct ModbusClientBuilder {
    config: ClientConfig,
}

impl ModbusClientBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn connect_retries(mut self, retries: u32) -> Self {
        self.config.connect_retries = retries;
        self
    }

    pub fn unit_id(mut self, unit_id: u8) -> Self {
        self.config.unit_id = unit_id;
        self
    }

    pub fn transaction_id(mut self, transaction_id: u16) -> Self {
        self.config.transaction_id = transaction_id;
        self
    }

    /// `None` blocks on the response read indefinitely.
    pub fn response_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn response_read(mut self, mode: ResponseRead) -> Self {
        self.config.response_read = mode;
        self
    }

    pub fn limits(mut self, limits: QuantityLimits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn build(self) -> Result<ModbusClient, ModbusError> {
        check_connect_timeout(self.config.connect_timeout)?;
        check_response_timeout(self.config.response_timeout)?;

        Ok(ModbusClient {
            config: self.config,
            transport: TcpTransport::new(),
        })
    }
}

/// Synchronous Modbus TCP client: one connection, one request at a time.
///
/// Every operation takes `&mut self`, so a client is never used from two
/// places at once without the caller wrapping it in a lock. Dropping the
/// client or calling [`ModbusClient::disconnect`] is the only way to abort.
pub struct ModbusClient {
    config: ClientConfig,
    transport: TcpTransport,
}

impl Default for ModbusClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ModbusClient {
    pub fn new() -> Self {
        ModbusClient {
            config: ClientConfig::default(),
            transport: TcpTransport::new(),
        }
    }

    pub fn with_host(host: impl Into<String>, port: u16) -> Self {
        ModbusClient {
            config: ClientConfig {
                host: Some(host.into()),
                port,
                ..ClientConfig::default()
            },
            transport: TcpTransport::new(),
        }
    }

    pub fn builder() -> ModbusClientBuilder {
        ModbusClientBuilder {
            config: ClientConfig::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to the configured host and port.
    pub fn connect(&mut self) -> Result<(), ModbusError> {
        let host = self
            .config
            .host
            .clone()
            .ok_or_else(|| ModbusError::ConnectionFailure("hostname is not set".into()))?;

        self.transport.connect(
            &host,
            self.config.port,
            self.config.connect_timeout,
            self.config.connect_retries,
            self.config.response_timeout,
        )
    }

    pub fn connect_host(&mut self, host: impl Into<String>) -> Result<(), ModbusError> {
        self.config.host = Some(host.into());
        self.connect()
    }

    pub fn connect_to(&mut self, host: impl Into<String>, port: u16) -> Result<(), ModbusError> {
        self.config.host = Some(host.into());
        self.config.port = port;
        self.connect()
    }

    pub fn disconnect(&mut self) {
        self.transport.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Read Coils (0x01).
    pub fn read_coils(&mut self, starting: i32, quantity: i32) -> Result<Vec<bool>, ModbusError> {
        self.read_bits(FunctionCode::ReadCoils, starting, quantity)
    }

    /// Read Discrete Inputs (0x02).
    pub fn read_discrete_inputs(&mut self, starting: i32, quantity: i32) -> Result<Vec<bool>, ModbusError> {
        self.read_bits(FunctionCode::ReadDiscreteInputs, starting, quantity)
    }

    /// Read Holding Registers (0x03). Values at or above 0x8000 come back negative.
    pub fn read_holding_registers(&mut self, starting: i32, quantity: i32) -> Result<Vec<i32>, ModbusError> {
        self.read_registers(FunctionCode::ReadHoldingRegisters, starting, quantity)
    }

    /// Read Input Registers (0x04). Values at or above 0x8000 come back negative.
    pub fn read_input_registers(&mut self, starting: i32, quantity: i32) -> Result<Vec<i32>, ModbusError> {
        self.read_registers(FunctionCode::ReadInputRegisters, starting, quantity)
    }

    /// Write Single Coil (0x05).
    pub fn write_single_coil(&mut self, starting: i32, value: bool) -> Result<(), ModbusError> {
        self.check_connected()?;
        let starting = check_address(starting)?;

        let payload = codec::write_single_coil_payload(starting, value);
        self.transact(FunctionCode::WriteSingleCoil, payload).map(|_| ())
    }

    /// Write Single Register (0x06). Only the low 16 bits of `value` are sent.
    pub fn write_single_register(&mut self, starting: i32, value: i32) -> Result<(), ModbusError> {
        self.check_connected()?;
        let starting = check_address(starting)?;

        let payload = codec::write_single_register_payload(starting, value as u16);
        self.transact(FunctionCode::WriteSingleRegister, payload).map(|_| ())
    }

    /// Write Multiple Coils (0x0F).
    pub fn write_multiple_coils(&mut self, starting: i32, values: &[bool]) -> Result<(), ModbusError> {
        let function = FunctionCode::WriteMultipleCoils;
        let (starting, _) = self.check_request(function, starting, values.len() as i64)?;

        let payload = codec::write_multiple_coils_payload(starting, values)?;
        self.transact(function, payload).map(|_| ())
    }

    /// Write Multiple Registers (0x10). Only the low 16 bits of each value are sent.
    pub fn write_multiple_registers(&mut self, starting: i32, values: &[i32]) -> Result<(), ModbusError> {
        let function = FunctionCode::WriteMultipleRegisters;
        let (starting, _) = self.check_request(function, starting, values.len() as i64)?;

        let registers: Vec<u16> = values.iter().map(|&value| value as u16).collect();
        let payload = codec::write_multiple_registers_payload(starting, &registers)?;
        self.transact(function, payload).map(|_| ())
    }

    pub fn hostname(&self) -> Option<&str> {
        self.config.host.as_deref()
    }

    pub fn set_hostname(&mut self, host: impl Into<String>) {
        self.config.host = Some(host.into());
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.config.port = port;
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    pub fn set_connect_timeout(&mut self, timeout: Duration) -> Result<(), ModbusError> {
        check_connect_timeout(timeout)?;
        self.config.connect_timeout = timeout;
        Ok(())
    }

    pub fn connect_retries(&self) -> u32 {
        self.config.connect_retries
    }

    pub fn set_connect_retries(&mut self, retries: u32) {
        self.config.connect_retries = retries;
    }

    pub fn unit_identifier(&self) -> u8 {
        self.config.unit_id
    }

    pub fn set_unit_identifier(&mut self, unit_id: u8) {
        self.config.unit_id = unit_id;
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.config.response_timeout
    }

    /// Applies to the live connection as well as future ones.
    pub fn set_response_timeout(&mut self, timeout: Option<Duration>) -> Result<(), ModbusError> {
        check_response_timeout(timeout)?;
        self.transport.set_response_timeout(timeout)?;
        self.config.response_timeout = timeout;
        Ok(())
    }

    fn read_bits(&mut self, function: FunctionCode, starting: i32, quantity: i32) -> Result<Vec<bool>, ModbusError> {
        let (starting, quantity) = self.check_request(function, starting, i64::from(quantity))?;

        let response = self.transact(function, codec::read_payload(starting, quantity))?;
        codec::decode_bits(&response, quantity as usize)
    }

    fn read_registers(&mut self, function: FunctionCode, starting: i32, quantity: i32) -> Result<Vec<i32>, ModbusError> {
        let (starting, quantity) = self.check_request(function, starting, i64::from(quantity))?;

        let response = self.transact(function, codec::read_payload(starting, quantity))?;
        codec::decode_registers(&response, quantity as usize)
    }

    fn check_connected(&self) -> Result<(), ModbusError> {
        if !self.is_connected() {
            return Err(ModbusError::ConnectionFailure("socket is null".into()));
        }
        Ok(())
    }

    /// Connection first, then address and quantity, all before any I/O.
    fn check_request(&self, function: FunctionCode, starting: i32, quantity: i64) -> Result<(u16, u16), ModbusError> {
        self.check_connected()?;
        let starting = check_address(starting)?;

        let max = self.config.limits.max_for(function).unwrap_or(1);
        let quantity = u16::try_from(quantity)
            .ok()
            .filter(|&q| q <= max)
            .ok_or_else(|| {
                ModbusError::InvalidArgument(format!(
                    "quantity {quantity} for {function:?} must be 0 - {max}"
                ))
            })?;

        let end = starting as u32 + quantity as u32;
        if end > MAX_ADDRESS as u32 + 1 {
            return Err(ModbusError::InvalidArgument(format!(
                "range {starting} + {quantity} runs past address {MAX_ADDRESS}"
            )));
        }

        Ok((starting, quantity))
    }

    fn transact(&mut self, function: FunctionCode, payload: Vec<u8>) -> Result<Vec<u8>, ModbusError> {
        let frame = RequestFrame::new(self.config.transaction_id, self.config.unit_id, function, payload)?;
        debug!(
            function = ?frame.function(),
            unit_id = self.config.unit_id,
            len = frame.header().length,
            "Sending Modbus request"
        );

        let response = self
            .transport
            .send_and_receive(&frame.encode(), self.config.response_read)?;
        check_response(&response, self.config.unit_id, function)?;
        Ok(response)
    }
}

fn check_address(starting: i32) -> Result<u16, ModbusError> {
    u16::try_from(starting).map_err(|_| {
        ModbusError::InvalidArgument(format!("starting address {starting} must be 0 - {MAX_ADDRESS}"))
    })
}

fn check_connect_timeout(timeout: Duration) -> Result<(), ModbusError> {
    if timeout.is_zero() {
        return Err(ModbusError::InvalidArgument("connect timeout must be non-zero".into()));
    }
    Ok(())
}

fn check_response_timeout(timeout: Option<Duration>) -> Result<(), ModbusError> {
    if timeout.is_some_and(|t| t.is_zero()) {
        return Err(ModbusError::InvalidArgument("response timeout must be non-zero".into()));
    }
    Ok(())
}
