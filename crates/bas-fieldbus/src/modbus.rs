//! Modbus application protocol: function codes, request/response PDUs and
//! the Modbus TCP transport.
//!
//! Supported function codes:
//! - Read Coils (0x01)
//! - Read Discrete Inputs (0x02)
//! - Read Holding Registers (0x03)
//! - Read Input Registers (0x04)
//! - Write Single Coil (0x05)
//! - Write Single Register (0x06)
//! - Write Multiple Coils (0x0F)
//! - Write Multiple Registers (0x10)
//!
//! Anything else can still be sent as [`Request::Raw`].

use crate::ModbusTransport;
use bas_common::error::{BasError, BasResult};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Largest quantity of bits in one read request.
pub const MAX_READ_BITS: u16 = 2000;
/// Largest quantity of registers in one read request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest quantity of coils in one write request.
pub const MAX_WRITE_COILS: u16 = 1968;
/// Largest quantity of registers in one write request.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Modbus function codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01).
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02).
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03).
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04).
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05).
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06).
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F).
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10).
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Parse a function code from its numeric value.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
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

    /// Numeric value on the wire.
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Coil and discrete-input codes address single bits.
    #[must_use]
    pub fn is_bit_access(self) -> bool {
        matches!(
            self,
            Self::ReadCoils
                | Self::ReadDiscreteInputs
                | Self::WriteSingleCoil
                | Self::WriteMultipleCoils
        )
    }

    /// Codes that change device state.
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::WriteSingleCoil
                | Self::WriteSingleRegister
                | Self::WriteMultipleCoils
                | Self::WriteMultipleRegisters
        )
    }

    /// Single-item writes are issued immediately instead of being merged.
    #[must_use]
    pub fn is_single_write(self) -> bool {
        matches!(self, Self::WriteSingleCoil | Self::WriteSingleRegister)
    }

    /// The read used to sample points addressed with this code.
    #[must_use]
    pub fn read_counterpart(self) -> Self {
        match self {
            Self::ReadCoils | Self::WriteSingleCoil | Self::WriteMultipleCoils => Self::ReadCoils,
            Self::ReadDiscreteInputs => Self::ReadDiscreteInputs,
            Self::ReadHoldingRegisters
            | Self::WriteSingleRegister
            | Self::WriteMultipleRegisters => Self::ReadHoldingRegisters,
            Self::ReadInputRegisters => Self::ReadInputRegisters,
        }
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction = 0x01,
    /// Illegal data address.
    IllegalDataAddress = 0x02,
    /// Illegal data value.
    IllegalDataValue = 0x03,
    /// Server device failure.
    ServerDeviceFailure = 0x04,
    /// Acknowledge (request accepted, processing).
    Acknowledge = 0x05,
    /// Server device busy.
    ServerDeviceBusy = 0x06,
    /// Gateway path unavailable.
    GatewayPathUnavailable = 0x0A,
    /// Gateway target device failed to respond.
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Parse an exception code from a byte value.
    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
            Self::ServerDeviceFailure => write!(f, "Server Device Failure"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::ServerDeviceBusy => write!(f, "Server Device Busy"),
            Self::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            Self::GatewayTargetFailed => write!(f, "Gateway Target Failed"),
        }
    }
}

/// A Modbus application request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Read `quantity` coils starting at `address`.
    ReadCoils {
        /// First coil.
        address: u16,
        /// Number of coils.
        quantity: u16,
    },
    /// Read `quantity` discrete inputs starting at `address`.
    ReadDiscreteInputs {
        /// First input.
        address: u16,
        /// Number of inputs.
        quantity: u16,
    },
    /// Read `quantity` holding registers starting at `address`.
    ReadHoldingRegisters {
        /// First register.
        address: u16,
        /// Number of registers.
        quantity: u16,
    },
    /// Read `quantity` input registers starting at `address`.
    ReadInputRegisters {
        /// First register.
        address: u16,
        /// Number of registers.
        quantity: u16,
    },
    /// Set one coil.
    WriteSingleCoil {
        /// Coil address.
        address: u16,
        /// New state.
        value: bool,
    },
    /// Set one holding register.
    WriteSingleRegister {
        /// Register address.
        address: u16,
        /// New value.
        value: u16,
    },
    /// Set consecutive coils starting at `address`.
    WriteMultipleCoils {
        /// First coil.
        address: u16,
        /// New states.
        values: Vec<bool>,
    },
    /// Set consecutive holding registers starting at `address`.
    WriteMultipleRegisters {
        /// First register.
        address: u16,
        /// New values.
        values: Vec<u16>,
    },
    /// Hand-built request for vendor-specific function codes.
    Raw {
        /// Function code byte.
        function: u8,
        /// Bytes following the function code.
        data: Vec<u8>,
    },
}

/// Decoded response to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Bit values for coil and discrete-input reads.
    Bits(Vec<bool>),
    /// Register values for register reads.
    Registers(Vec<u16>),
    /// Write acknowledged for `quantity` items at `address`.
    Written {
        /// First item written.
        address: u16,
        /// Number of items written.
        quantity: u16,
    },
    /// Unparsed PDU (function code included) for raw requests.
    Raw(Vec<u8>),
}

impl Request {
    /// Function code byte of this request.
    #[must_use]
    pub fn function_code(&self) -> u8 {
        match self {
            Self::ReadCoils { .. } => FunctionCode::ReadCoils.code(),
            Self::ReadDiscreteInputs { .. } => FunctionCode::ReadDiscreteInputs.code(),
            Self::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters.code(),
            Self::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters.code(),
            Self::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil.code(),
            Self::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister.code(),
            Self::WriteMultipleCoils { .. } => FunctionCode::WriteMultipleCoils.code(),
            Self::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters.code(),
            Self::Raw { function, .. } => *function,
        }
    }

    /// Build a read request of the given function code class.
    ///
    /// Write codes map to their read counterpart.
    #[must_use]
    pub fn read(function: FunctionCode, address: u16, quantity: u16) -> Self {
        match function.read_counterpart() {
            FunctionCode::ReadDiscreteInputs => Self::ReadDiscreteInputs { address, quantity },
            FunctionCode::ReadHoldingRegisters => Self::ReadHoldingRegisters { address, quantity },
            FunctionCode::ReadInputRegisters => Self::ReadInputRegisters { address, quantity },
            _ => Self::ReadCoils { address, quantity },
        }
    }

    /// Serialize the request PDU.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::TransportError`] when a quantity is outside the
    /// protocol limits.
    pub fn encode(&self) -> BasResult<Vec<u8>> {
        let function = self.function_code();
        let mut pdu = Vec::with_capacity(8);
        pdu.push(function);

        match self {
            Self::ReadCoils { address, quantity }
            | Self::ReadDiscreteInputs { address, quantity } => {
                check_quantity(*quantity, MAX_READ_BITS, "bits")?;
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
            }
            Self::ReadHoldingRegisters { address, quantity }
            | Self::ReadInputRegisters { address, quantity } => {
                check_quantity(*quantity, MAX_READ_REGISTERS, "registers")?;
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
            }
            Self::WriteSingleCoil { address, value } => {
                // Coil value: 0xFF00 for ON, 0x0000 for OFF
                let coil_value: u16 = if *value { 0xFF00 } else { 0x0000 };
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&coil_value.to_be_bytes());
            }
            Self::WriteSingleRegister { address, value } => {
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&value.to_be_bytes());
            }
            Self::WriteMultipleCoils { address, values } => {
                let quantity = quantity_of(values.len(), MAX_WRITE_COILS, "coils")?;
                let packed = pack_bits(values);
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                #[allow(clippy::cast_possible_truncation)]
                pdu.push(packed.len() as u8);
                pdu.extend_from_slice(&packed);
            }
            Self::WriteMultipleRegisters { address, values } => {
                let quantity = quantity_of(values.len(), MAX_WRITE_REGISTERS, "registers")?;
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&quantity.to_be_bytes());
                #[allow(clippy::cast_possible_truncation)]
                pdu.push((values.len() * 2) as u8);
                for value in values {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
            }
            Self::Raw { data, .. } => pdu.extend_from_slice(data),
        }

        Ok(pdu)
    }

    /// Parse a request PDU as received by a server.
    ///
    /// Unknown function codes come back as [`Request::Raw`].
    ///
    /// # Errors
    ///
    /// Returns [`BasError::TransportError`] for truncated or inconsistent PDUs.
    pub fn decode(pdu: &[u8]) -> BasResult<Self> {
        let (&function, body) = pdu
            .split_first()
            .ok_or_else(|| BasError::TransportError("empty request PDU".into()))?;

        let Some(code) = FunctionCode::from_code(function) else {
            return Ok(Self::Raw {
                function,
                data: body.to_vec(),
            });
        };

        if body.len() < 4 {
            return Err(BasError::TransportError(format!(
                "request for function 0x{function:02X} too short: {} bytes",
                pdu.len()
            )));
        }
        let address = u16::from_be_bytes([body[0], body[1]]);
        let word = u16::from_be_bytes([body[2], body[3]]);

        let request = match code {
            FunctionCode::ReadCoils => Self::ReadCoils {
                address,
                quantity: word,
            },
            FunctionCode::ReadDiscreteInputs => Self::ReadDiscreteInputs {
                address,
                quantity: word,
            },
            FunctionCode::ReadHoldingRegisters => Self::ReadHoldingRegisters {
                address,
                quantity: word,
            },
            FunctionCode::ReadInputRegisters => Self::ReadInputRegisters {
                address,
                quantity: word,
            },
            FunctionCode::WriteSingleCoil => Self::WriteSingleCoil {
                address,
                value: word == 0xFF00,
            },
            FunctionCode::WriteSingleRegister => Self::WriteSingleRegister {
                address,
                value: word,
            },
            FunctionCode::WriteMultipleCoils => {
                let data = payload(body, function)?;
                if data.len() * 8 < usize::from(word) {
                    return Err(BasError::TransportError(format!(
                        "coil payload of {} bytes cannot hold {word} coils",
                        data.len()
                    )));
                }
                Self::WriteMultipleCoils {
                    address,
                    values: unpack_bits(data, word),
                }
            }
            FunctionCode::WriteMultipleRegisters => {
                let data = payload(body, function)?;
                if data.len() != usize::from(word) * 2 {
                    return Err(BasError::TransportError(format!(
                        "register payload of {} bytes does not match {word} registers",
                        data.len()
                    )));
                }
                Self::WriteMultipleRegisters {
                    address,
                    values: data
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                }
            }
        };
        Ok(request)
    }

    /// Validate and decode the response PDU for this request.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::ModbusException`] for exception responses and
    /// [`BasError::TransportError`] for malformed ones.
    pub fn decode_response(&self, response: &[u8]) -> BasResult<Response> {
        check_exception(response)?;

        let function = self.function_code();
        if let Self::Raw { .. } = self {
            return Ok(Response::Raw(response.to_vec()));
        }

        if response.len() < 2 {
            return Err(BasError::TransportError("Response too short".into()));
        }

        // Validate function code matches request
        if response[0] != function {
            return Err(BasError::TransportError(format!(
                "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
                function, response[0]
            )));
        }

        match self {
            Self::ReadCoils { quantity, .. } | Self::ReadDiscreteInputs { quantity, .. } => {
                let byte_count = usize::from(response[1]);
                let expected_bytes = usize::from(*quantity).div_ceil(8);
                if byte_count < expected_bytes {
                    return Err(BasError::TransportError(format!(
                        "Byte count {byte_count} too small for {quantity} bits"
                    )));
                }
                if response.len() < 2 + byte_count {
                    return Err(BasError::TransportError(format!(
                        "Expected {} data bytes, got {}",
                        byte_count,
                        response.len() - 2
                    )));
                }
                Ok(Response::Bits(unpack_bits(&response[2..], *quantity)))
            }
            Self::ReadHoldingRegisters { quantity, .. }
            | Self::ReadInputRegisters { quantity, .. } => {
                let byte_count = usize::from(response[1]);
                let expected_bytes = usize::from(*quantity) * 2;
                if byte_count != expected_bytes {
                    return Err(BasError::TransportError(format!(
                        "Expected {expected_bytes} bytes, got {byte_count}"
                    )));
                }
                if response.len() < 2 + byte_count {
                    return Err(BasError::TransportError(format!(
                        "Response too short: expected {} bytes",
                        2 + byte_count
                    )));
                }
                Ok(Response::Registers(
                    response[2..2 + byte_count]
                        .chunks_exact(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect(),
                ))
            }
            Self::WriteSingleCoil { address, .. }
            | Self::WriteSingleRegister { address, .. } => {
                // Response echoes the request
                let expected = self.encode()?;
                if response.len() < 5 || response[..5] != expected[..5] {
                    return Err(BasError::TransportError(format!(
                        "Write single 0x{function:02X} echo mismatch at address {address}"
                    )));
                }
                Ok(Response::Written {
                    address: *address,
                    quantity: 1,
                })
            }
            Self::WriteMultipleCoils { address, values } => {
                echo_range(response, *address, values.len())
            }
            Self::WriteMultipleRegisters { address, values } => {
                echo_range(response, *address, values.len())
            }
            Self::Raw { .. } => Ok(Response::Raw(response.to_vec())),
        }
    }
}

fn check_quantity(quantity: u16, max: u16, what: &str) -> BasResult<()> {
    if quantity == 0 || quantity > max {
        return Err(BasError::TransportError(format!(
            "Cannot transfer {quantity} {what} (limit {max})"
        )));
    }
    Ok(())
}

fn quantity_of(len: usize, max: u16, what: &str) -> BasResult<u16> {
    let quantity = u16::try_from(len).unwrap_or(u16::MAX);
    check_quantity(quantity, max, what)?;
    Ok(quantity)
}

fn payload(body: &[u8], function: u8) -> BasResult<&[u8]> {
    let count = usize::from(*body.get(4).ok_or_else(|| {
        BasError::TransportError(format!("request 0x{function:02X} missing byte count"))
    })?);
    body.get(5..5 + count).ok_or_else(|| {
        BasError::TransportError(format!(
            "request 0x{function:02X} declares {count} bytes but carries {}",
            body.len().saturating_sub(5)
        ))
    })
}

fn echo_range(response: &[u8], address: u16, len: usize) -> BasResult<Response> {
    if response.len() < 5 {
        return Err(BasError::TransportError("Response too short".into()));
    }
    let resp_address = u16::from_be_bytes([response[1], response[2]]);
    let resp_quantity = u16::from_be_bytes([response[3], response[4]]);
    if resp_address != address || usize::from(resp_quantity) != len {
        return Err(BasError::TransportError(format!(
            "Write response mismatch: addr={resp_address}/{address}, qty={resp_quantity}/{len}"
        )));
    }
    Ok(Response::Written {
        address,
        quantity: resp_quantity,
    })
}

/// Return an error if `response` is an exception PDU.
///
/// # Errors
///
/// Returns [`BasError::ModbusException`] carrying the exception code.
pub fn check_exception(response: &[u8]) -> BasResult<()> {
    match response {
        [function, rest @ ..] if function & 0x80 != 0 => {
            let code = rest.first().copied().unwrap_or(0);
            let name = ExceptionCode::from_byte(code)
                .map_or_else(|| "Unknown".to_string(), |c| c.to_string());
            debug!(function = function & 0x7F, code, %name, "Modbus exception response");
            Err(BasError::ModbusException {
                function: function & 0x7F,
                code,
            })
        }
        _ => Ok(()),
    }
}

/// Pack bits LSB-first into bytes.
#[must_use]
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &value) in values.iter().enumerate() {
        if value {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `quantity` bits LSB-first from bytes.
#[must_use]
pub fn unpack_bits(bytes: &[u8], quantity: u16) -> Vec<bool> {
    (0..usize::from(quantity))
        .map(|i| bytes.get(i / 8).is_some_and(|b| (b >> (i % 8)) & 1 != 0))
        .collect()
}

/// Modbus TCP Application Protocol (MBAP) header.
#[derive(Debug, Clone, Copy)]
struct MbapHeader {
    /// Transaction identifier (echoed by server).
    transaction_id: u16,
    /// Protocol identifier (0 for Modbus).
    protocol_id: u16,
    /// Length of remaining data (unit ID + PDU).
    length: u16,
    /// Unit identifier (slave address).
    unit_id: u8,
}

impl MbapHeader {
    /// MBAP header size in bytes.
    const SIZE: usize = 7;

    fn new(transaction_id: u16, pdu_length: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1, // +1 for unit_id
            unit_id,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> BasResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(BasError::TransportError(format!(
                "MBAP header too short: {} bytes",
                bytes.len()
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }
}

/// Open a TCP stream with the interface timeout applied to connect, read and write.
pub(crate) fn open_stream(address: &str, timeout: Duration) -> BasResult<(TcpStream, SocketAddr)> {
    let addr = address
        .to_socket_addrs()
        .map_err(|e| BasError::TransportError(format!("cannot resolve {address}: {e}")))?
        .next()
        .ok_or_else(|| BasError::TransportError(format!("{address} resolved to nothing")))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| BasError::from_io("Connection failed", &e))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| BasError::from_io("Failed to set read timeout", &e))?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(|e| BasError::from_io("Failed to set write timeout", &e))?;
    stream
        .set_nodelay(true)
        .map_err(|e| BasError::from_io("Failed to set TCP_NODELAY", &e))?;

    Ok((stream, addr))
}

/// Modbus TCP client transport.
///
/// A broken socket is dropped; the next transaction reconnects once and
/// reports failure if that does not work. Retry pacing is left to the
/// control cycle.
pub struct TcpTransport {
    address: String,
    timeout: Duration,
    connection: Option<TcpStream>,
    transaction_id: u16,
    rx_buffer: Vec<u8>,
}

impl TcpTransport {
    /// Connect to a Modbus TCP server.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the first connection attempt fails.
    pub fn connect(address: &str, timeout: Duration) -> BasResult<Self> {
        let mut transport = Self {
            address: address.to_string(),
            timeout,
            connection: None,
            transaction_id: 0,
            rx_buffer: vec![0u8; 260], // Max Modbus TCP frame size
        };
        transport.reconnect()?;
        Ok(transport)
    }

    fn reconnect(&mut self) -> BasResult<()> {
        info!(addr = %self.address, "Connecting to Modbus TCP server");
        let (stream, peer) = open_stream(&self.address, self.timeout)?;
        self.connection = Some(stream);
        debug!(%peer, "Connected to Modbus TCP server");
        Ok(())
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    fn drop_connection(&mut self, err: &std::io::Error, context: &str) -> BasError {
        warn!(addr = %self.address, error = %err, "{context}, dropping connection");
        self.connection = None;
        BasError::from_io(context, err)
    }

    /// Whether a socket is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}

impl ModbusTransport for TcpTransport {
    fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> BasResult<Vec<u8>> {
        if self.connection.is_none() {
            self.reconnect()?;
        }

        let transaction_id = self.next_transaction_id();
        #[allow(clippy::cast_possible_truncation)]
        let header = MbapHeader::new(transaction_id, pdu.len() as u16, unit_id);

        let mut request = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
        request.extend_from_slice(&header.to_bytes());
        request.extend_from_slice(pdu);

        trace!(transaction_id, unit_id, pdu_len = pdu.len(), "Sending Modbus request");

        let Some(stream) = self.connection.as_mut() else {
            return Err(BasError::TransportError("Not connected".into()));
        };
        if let Err(e) = stream.write_all(&request) {
            return Err(self.drop_connection(&e, "Send failed"));
        }

        let header_result = stream.read_exact(&mut self.rx_buffer[..MbapHeader::SIZE]);
        if let Err(e) = header_result {
            return Err(self.drop_connection(&e, "Receive header failed"));
        }
        let response_header = MbapHeader::from_bytes(&self.rx_buffer[..MbapHeader::SIZE])?;

        if response_header.transaction_id != transaction_id {
            // Stream is out of sync; start over on the next request
            self.connection = None;
            return Err(BasError::TransportError(format!(
                "Transaction ID mismatch: expected {}, got {}",
                transaction_id, response_header.transaction_id
            )));
        }
        if response_header.protocol_id != 0 {
            self.connection = None;
            return Err(BasError::TransportError(format!(
                "Invalid protocol ID: {}",
                response_header.protocol_id
            )));
        }

        let pdu_length = usize::from(response_header.length.saturating_sub(1));
        if pdu_length == 0 || pdu_length > self.rx_buffer.len() - MbapHeader::SIZE {
            self.connection = None;
            return Err(BasError::TransportError(format!(
                "Invalid response length: {pdu_length} bytes"
            )));
        }

        let body_result = stream
            .read_exact(&mut self.rx_buffer[MbapHeader::SIZE..MbapHeader::SIZE + pdu_length]);
        if let Err(e) = body_result {
            return Err(self.drop_connection(&e, "Receive PDU failed"));
        }

        if response_header.unit_id != unit_id {
            return Err(BasError::TransportError(format!(
                "Unit ID mismatch: expected {}, got {}",
                unit_id, response_header.unit_id
            )));
        }

        trace!(transaction_id, pdu_len = pdu_length, "Received Modbus response");
        Ok(self.rx_buffer[MbapHeader::SIZE..MbapHeader::SIZE + pdu_length].to_vec())
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mbap_header_serialization() {
        let header = MbapHeader::new(0x1234, 5, 1);
        let bytes = header.to_bytes();

        assert_eq!(bytes[0], 0x12); // transaction_id high
        assert_eq!(bytes[1], 0x34); // transaction_id low
        assert_eq!(bytes[2], 0x00); // protocol_id high
        assert_eq!(bytes[3], 0x00); // protocol_id low
        assert_eq!(bytes[4], 0x00); // length high (5 + 1 = 6)
        assert_eq!(bytes[5], 0x06); // length low
        assert_eq!(bytes[6], 0x01); // unit_id
    }

    #[test]
    fn test_mbap_header_parsing() {
        let bytes = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01];
        let header = MbapHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 1);
    }

    #[test]
    fn test_write_single_coil_pdu_format() {
        let on = Request::WriteSingleCoil {
            address: 0x1234,
            value: true,
        };
        assert_eq!(on.encode().unwrap(), [0x05, 0x12, 0x34, 0xFF, 0x00]);

        let off = Request::WriteSingleCoil {
            address: 0x1234,
            value: false,
        };
        assert_eq!(off.encode().unwrap(), [0x05, 0x12, 0x34, 0x00, 0x00]);
    }

    #[test]
    fn test_write_multiple_coils_packing() {
        let request = Request::WriteMultipleCoils {
            address: 0,
            values: vec![true, false, true, false, false, false, false, false, true],
        };
        // quantity 9 -> 2 payload bytes, bit 0 and 2 in the first, bit 0 in the second
        assert_eq!(
            request.encode().unwrap(),
            [0x0F, 0x00, 0x00, 0x00, 0x09, 0x02, 0b0000_0101, 0b0000_0001]
        );
    }

    #[test]
    fn test_write_multiple_registers_pdu_format() {
        let request = Request::WriteMultipleRegisters {
            address: 0x0100,
            values: vec![0xABCD, 0x0001],
        };
        assert_eq!(
            request.encode().unwrap(),
            [0x10, 0x01, 0x00, 0x00, 0x02, 0x04, 0xAB, 0xCD, 0x00, 0x01]
        );
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let request = Request::WriteMultipleCoils {
            address: 0,
            values: vec![],
        };
        assert!(request.encode().is_err());

        let request = Request::ReadHoldingRegisters {
            address: 0,
            quantity: 126,
        };
        assert!(request.encode().is_err());
    }

    #[test]
    fn test_decode_read_bits_response() {
        let request = Request::ReadDiscreteInputs {
            address: 0,
            quantity: 10,
        };
        let response = request
            .decode_response(&[0x02, 0x02, 0b1000_0001, 0b0000_0010])
            .unwrap();
        let Response::Bits(bits) = response else {
            panic!("expected bits");
        };
        assert_eq!(bits.len(), 10);
        assert!(bits[0] && bits[7] && bits[9]);
        assert!(!bits[1] && !bits[8]);
    }

    #[test]
    fn test_decode_register_byte_count_mismatch() {
        let request = Request::ReadInputRegisters {
            address: 0,
            quantity: 2,
        };
        let err = request
            .decode_response(&[0x04, 0x02, 0x00, 0x01])
            .unwrap_err();
        assert!(matches!(err, BasError::TransportError(msg) if msg.contains("Expected 4 bytes")));
    }

    #[test]
    fn test_decode_exception_response() {
        let request = Request::ReadHoldingRegisters {
            address: 10,
            quantity: 1,
        };
        let err = request.decode_response(&[0x83, 0x02]).unwrap_err();
        assert_eq!(
            err,
            BasError::ModbusException {
                function: 0x03,
                code: 0x02
            }
        );
    }

    #[test]
    fn test_decode_single_register_echo() {
        let request = Request::WriteSingleRegister {
            address: 1,
            value: 3,
        };
        assert_eq!(
            request
                .decode_response(&[0x06, 0x00, 0x01, 0x00, 0x03])
                .unwrap(),
            Response::Written {
                address: 1,
                quantity: 1
            }
        );
        assert!(request
            .decode_response(&[0x06, 0x00, 0x01, 0x00, 0x04])
            .is_err());
    }

    #[test]
    fn test_decode_multiple_write_echo_mismatch() {
        let request = Request::WriteMultipleCoils {
            address: 4,
            values: vec![true; 3],
        };
        let err = request
            .decode_response(&[0x0F, 0x00, 0x04, 0x00, 0x02])
            .unwrap_err();
        assert!(matches!(err, BasError::TransportError(msg) if msg.contains("mismatch")));
    }

    #[test]
    fn test_request_decode_from_server_side() {
        let original = Request::WriteMultipleRegisters {
            address: 7,
            values: vec![1, 2, 3],
        };
        let decoded = Request::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);

        let raw = Request::decode(&[0x2B, 0x0E, 0x01]).unwrap();
        assert_eq!(
            raw,
            Request::Raw {
                function: 0x2B,
                data: vec![0x0E, 0x01]
            }
        );
    }

    #[test]
    fn test_read_counterpart() {
        assert_eq!(
            FunctionCode::WriteMultipleCoils.read_counterpart(),
            FunctionCode::ReadCoils
        );
        assert_eq!(
            FunctionCode::WriteSingleRegister.read_counterpart(),
            FunctionCode::ReadHoldingRegisters
        );
        assert_eq!(
            FunctionCode::ReadInputRegisters.read_counterpart(),
            FunctionCode::ReadInputRegisters
        );
        assert!(matches!(
            Request::read(FunctionCode::WriteMultipleRegisters, 3, 2),
            Request::ReadHoldingRegisters {
                address: 3,
                quantity: 2
            }
        ));
    }

    #[test]
    fn test_exception_code_parsing() {
        assert_eq!(
            ExceptionCode::from_byte(0x04),
            Some(ExceptionCode::ServerDeviceFailure)
        );
        assert_eq!(ExceptionCode::from_byte(0xFF), None);
        assert_eq!(
            ExceptionCode::IllegalDataAddress.to_string(),
            "Illegal Data Address"
        );
    }

    #[test]
    fn test_transaction_id_wrapping() {
        let mut transport = TcpTransport {
            address: "127.0.0.1:1".into(),
            timeout: Duration::from_millis(10),
            connection: None,
            transaction_id: u16::MAX,
            rx_buffer: vec![0u8; 260],
        };
        assert_eq!(transport.next_transaction_id(), 0);
        assert!(!transport.is_connected());
    }
}
