use crate::ModbusError;

/// Transaction id, protocol id, length and unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// MBAP header, function code and at least one data byte.
pub const MIN_RESPONSE_LEN: usize = 9;

/// Upper bound for a single response read. Generous for any legal Modbus TCP frame.
pub const RESPONSE_BUFFER_LEN: usize = 2100;

/// Offset of the first data byte after the byte-count field of a read response.
const READ_DATA_OFFSET: usize = 9;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::ReadCoils),
            0x02 => Some(Self::ReadDiscreteInputs),
            0x03 => Some(Self::ReadHoldingRegisters),
            0x04 => Some(Self::ReadInputRegisters),
            0x05 => Some(Self::WriteSingleCoil),
            0x06 => Some(Self::WriteSingleRegister),
            0x0F => Some(Self::WriteMultipleCoils),
            0x10 => Some(Self::WriteMultipleRegisters),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte length of unit id + function code + data.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(frame: &[u8]) -> Result<Self, ModbusError> {
        if frame.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::FrameTooShort {
                expected: MBAP_HEADER_LEN,
                actual: frame.len(),
            });
        }

        Ok(MbapHeader {
            transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
            protocol_id: u16::from_be_bytes([frame[2], frame[3]]),
            length: u16::from_be_bytes([frame[4], frame[5]]),
            unit_id: frame[6],
        })
    }
}

/// One encoded request: MBAP header plus PDU. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestFrame {
    header: MbapHeader,
    function: FunctionCode,
    payload: Vec<u8>,
}

impl RequestFrame {
    pub fn new(
        transaction_id: u16,
        unit_id: u8,
        function: FunctionCode,
        payload: Vec<u8>,
    ) -> Result<Self, ModbusError> {
        let length = u16::try_from(payload.len() + 2).map_err(|_| {
            ModbusError::InvalidArgument(format!("payload of {} bytes", payload.len()))
        })?;

        Ok(RequestFrame {
            header: MbapHeader {
                transaction_id,
                protocol_id: 0,
                length,
                unit_id,
            },
            function,
            payload,
        })
    }

    pub fn header(&self) -> &MbapHeader {
        &self.header
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + self.payload.len());

        frame.extend_from_slice(&self.header.transaction_id.to_be_bytes());
        frame.extend_from_slice(&self.header.protocol_id.to_be_bytes());
        frame.extend_from_slice(&self.header.length.to_be_bytes());
        frame.push(self.header.unit_id);
        frame.push(self.function.code());
        frame.extend_from_slice(&self.payload);

        frame
    }
}

/// starting(2) · quantity(2), shared by the four read functions.
pub fn read_payload(starting: u16, quantity: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.push((starting >> 8) as u8);
    payload.push(starting as u8);
    payload.push((quantity >> 8) as u8);
    payload.push(quantity as u8);
    payload
}

pub fn write_single_coil_payload(starting: u16, value: bool) -> Vec<u8> {
    let value = if value { COIL_ON } else { COIL_OFF };
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&starting.to_be_bytes());
    payload.extend_from_slice(&value.to_be_bytes());
    payload
}

pub fn write_single_register_payload(starting: u16, value: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&starting.to_be_bytes());
    payload.extend_from_slice(&value.to_be_bytes());
    payload
}

pub fn write_multiple_coils_payload(starting: u16, values: &[bool]) -> Result<Vec<u8>, ModbusError> {
    let quantity = u16::try_from(values.len())
        .map_err(|_| ModbusError::InvalidArgument(format!("{} coils", values.len())))?;
    let packed = pack_coils(values);
    let byte_count = u8::try_from(packed.len()).map_err(|_| {
        ModbusError::InvalidArgument(format!(
            "{} coils need {} data bytes, at most 255 fit in one request",
            values.len(),
            packed.len()
        ))
    })?;

    let mut payload = Vec::with_capacity(5 + packed.len());
    payload.extend_from_slice(&starting.to_be_bytes());
    payload.extend_from_slice(&quantity.to_be_bytes());
    payload.push(byte_count);
    payload.extend(packed);
    Ok(payload)
}

pub fn write_multiple_registers_payload(starting: u16, values: &[u16]) -> Result<Vec<u8>, ModbusError> {
    let byte_count = u8::try_from(values.len() * 2).map_err(|_| {
        ModbusError::InvalidArgument(format!(
            "{} registers need {} data bytes, at most 255 fit in one request",
            values.len(),
            values.len() * 2
        ))
    })?;

    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.extend_from_slice(&starting.to_be_bytes());
    payload.extend_from_slice(&(values.len() as u16).to_be_bytes());
    payload.push(byte_count);
    for value in values {
        payload.push((value >> 8) as u8);
        payload.push(*value as u8);
    }
    Ok(payload)
}

/// Packs coil `i` into bit `i % 8` of byte `i / 8`, LSB first.
/// Unused high bits of the last byte stay zero.
pub fn pack_coils(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &bit) in values.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Returns the data bytes of a read response after checking that the
/// byte count at offset 8 is `data_len` and that all of them arrived.
fn read_data(frame: &[u8], data_len: usize) -> Result<&[u8], ModbusError> {
    if frame.len() < READ_DATA_OFFSET {
        return Err(ModbusError::FrameTooShort {
            expected: READ_DATA_OFFSET,
            actual: frame.len(),
        });
    }

    let byte_count = frame[READ_DATA_OFFSET - 1] as usize;
    if byte_count != data_len {
        return Err(ModbusError::ByteCountMismatch {
            expected: data_len,
            received: byte_count,
        });
    }

    let expected = READ_DATA_OFFSET + data_len;
    if frame.len() < expected {
        return Err(ModbusError::FrameTooShort {
            expected,
            actual: frame.len(),
        });
    }

    Ok(&frame[READ_DATA_OFFSET..expected])
}

/// Decodes `quantity` bits of a coil or discrete-input response.
pub fn decode_bits(frame: &[u8], quantity: usize) -> Result<Vec<bool>, ModbusError> {
    let data = read_data(frame, quantity.div_ceil(8))?;
    Ok((0..quantity)
        .map(|i| (data[i / 8] >> (i % 8)) & 0x01 == 0x01)
        .collect())
}

/// Decodes `quantity` big-endian registers, sign-extending each 16-bit value.
pub fn decode_registers(frame: &[u8], quantity: usize) -> Result<Vec<i32>, ModbusError> {
    let data = read_data(frame, quantity * 2)?;
    Ok(data
        .chunks_exact(2)
        .map(|pair| i32::from(i16::from_be_bytes([pair[0], pair[1]])))
        .collect())
}
