//! Modbus RTU framing over a serial line or a raw TCP stream.
//!
//! Frame layout: `unit_id | PDU | CRC16 (low byte first)`. The checksum and
//! the expected response length come from `rmodbus`.

use crate::ModbusTransport;
use bas_common::config::{InterfaceConfig, Parity};
use bas_common::error::{BasError, BasResult};
use rmodbus::{calc_crc16, guess_response_frame_len, ModbusProto};
use serialport::{ClearBuffer, DataBits, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Largest RTU frame on the wire.
const MAX_FRAME: usize = 256;

/// Largest byte count a read response can announce.
const MAX_DATA_BYTES: u8 = 250;

/// CRC-16/MODBUS of `data`.
fn checksum(data: &[u8]) -> BasResult<u16> {
    let len = u8::try_from(data.len()).map_err(|_| {
        BasError::TransportError(format!("RTU frame of {} bytes is too long", data.len()))
    })?;
    Ok(calc_crc16(data, len))
}

/// Build an RTU frame around a PDU.
///
/// # Errors
///
/// Returns [`BasError::TransportError`] when the PDU does not fit a frame.
pub fn encode_frame(unit_id: u8, pdu: &[u8]) -> BasResult<Vec<u8>> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    let crc = checksum(&frame)?;
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Check the CRC of a complete frame and return `(unit_id, pdu)`.
///
/// # Errors
///
/// Returns [`BasError::TransportError`] on a short frame or CRC mismatch.
pub fn decode_frame(frame: &[u8]) -> BasResult<(u8, &[u8])> {
    if frame.len() < 4 {
        return Err(BasError::TransportError(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = checksum(body)?;
    if received != computed {
        return Err(BasError::TransportError(format!(
            "CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}"
        )));
    }
    Ok((body[0], &body[1..]))
}

/// Total response frame length announced by its first three bytes.
///
/// `None` means the length is not derivable and the frame ends when the
/// line goes quiet.
fn expected_frame_len(header: &[u8]) -> Option<usize> {
    let function = header.get(1).copied()?;
    let count = header.get(2).copied()?;
    match function {
        f if f & 0x80 != 0 => Some(5),
        0x01..=0x04 if count > MAX_DATA_BYTES => None,
        0x01..=0x06 | 0x0F | 0x10 => guess_response_frame_len(header, ModbusProto::Rtu)
            .ok()
            .map(usize::from),
        _ => None,
    }
}

fn read_frame<S: Read + ?Sized>(stream: &mut S) -> BasResult<Vec<u8>> {
    let mut frame = vec![0u8; 3];
    stream
        .read_exact(&mut frame)
        .map_err(|e| BasError::from_io("Receive RTU header failed", &e))?;

    match expected_frame_len(&frame) {
        Some(total) if total > MAX_FRAME || total < 4 => {
            return Err(BasError::TransportError(format!(
                "RTU frame of {total} bytes is out of range"
            )));
        }
        Some(total) => {
            frame.resize(total, 0);
            stream
                .read_exact(&mut frame[3..])
                .map_err(|e| BasError::from_io("Receive RTU body failed", &e))?;
        }
        None => {
            let mut chunk = [0u8; 64];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => frame.extend_from_slice(&chunk[..n]),
                    Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                        break
                    }
                    Err(e) => return Err(BasError::from_io("Receive RTU body failed", &e)),
                }
                if frame.len() >= MAX_FRAME {
                    break;
                }
            }
        }
    }
    Ok(frame)
}

/// Send one request frame and read back the matching response PDU.
///
/// # Errors
///
/// Returns transport errors for I/O failures, CRC mismatches and answers
/// from the wrong unit.
pub fn rtu_transact<S: Read + Write + ?Sized>(
    stream: &mut S,
    unit_id: u8,
    pdu: &[u8],
) -> BasResult<Vec<u8>> {
    let request = encode_frame(unit_id, pdu)?;
    trace!(unit_id, frame_len = request.len(), "Sending RTU frame");
    stream
        .write_all(&request)
        .and_then(|()| stream.flush())
        .map_err(|e| BasError::from_io("Send RTU frame failed", &e))?;

    let frame = read_frame(stream)?;
    let (resp_unit, resp_pdu) = decode_frame(&frame)?;
    if resp_unit != unit_id {
        return Err(BasError::TransportError(format!(
            "Unit ID mismatch: expected {unit_id}, got {resp_unit}"
        )));
    }
    trace!(unit_id, pdu_len = resp_pdu.len(), "Received RTU frame");
    Ok(resp_pdu.to_vec())
}

/// Modbus RTU over a local serial port.
pub struct RtuTransport {
    port_name: String,
    port: Box<dyn SerialPort>,
}

impl RtuTransport {
    /// Open the serial port named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::TransportError`] if the port cannot be opened.
    pub fn open(config: &InterfaceConfig) -> BasResult<Self> {
        let port_name = config
            .port
            .clone()
            .ok_or_else(|| BasError::Config(format!("interface {} has no port", config.id)))?;

        info!(port = %port_name, baud = config.baud_rate, "Opening RTU serial port");
        let port = serialport::new(port_name.as_str(), config.baud_rate)
            .timeout(config.timeout)
            .data_bits(match config.data_bits {
                5 => DataBits::Five,
                6 => DataBits::Six,
                7 => DataBits::Seven,
                _ => DataBits::Eight,
            })
            .stop_bits(match config.stop_bits {
                2 => StopBits::Two,
                _ => StopBits::One,
            })
            .parity(match config.parity {
                Parity::None => serialport::Parity::None,
                Parity::Even => serialport::Parity::Even,
                Parity::Odd => serialport::Parity::Odd,
            })
            .open()
            .map_err(|e| BasError::TransportError(format!("cannot open {port_name}: {e}")))?;

        Ok(Self { port_name, port })
    }
}

impl ModbusTransport for RtuTransport {
    fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> BasResult<Vec<u8>> {
        // Drop stale bytes from a previous timed-out exchange
        if let Err(e) = self.port.clear(ClearBuffer::Input) {
            debug!(port = %self.port_name, error = %e, "Failed to clear serial input");
        }
        rtu_transact(&mut *self.port, unit_id, pdu)
    }

    fn describe(&self) -> String {
        format!("rtu://{}", self.port_name)
    }
}

/// RTU frames over a TCP stream, as spoken by serial device servers.
pub struct RtuOverTcpTransport {
    address: String,
    timeout: Duration,
    connection: Option<TcpStream>,
}

impl RtuOverTcpTransport {
    /// Connect to the gateway.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the connection cannot be established.
    pub fn connect(address: &str, timeout: Duration) -> BasResult<Self> {
        let mut transport = Self {
            address: address.to_string(),
            timeout,
            connection: None,
        };
        transport.reconnect()?;
        Ok(transport)
    }

    fn reconnect(&mut self) -> BasResult<()> {
        info!(addr = %self.address, "Connecting to RTU-over-TCP gateway");
        let (stream, _) = crate::modbus::open_stream(&self.address, self.timeout)?;
        self.connection = Some(stream);
        Ok(())
    }
}

impl ModbusTransport for RtuOverTcpTransport {
    fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> BasResult<Vec<u8>> {
        if self.connection.is_none() {
            self.reconnect()?;
        }
        let Some(stream) = self.connection.as_mut() else {
            return Err(BasError::TransportError("Not connected".into()));
        };

        let result = rtu_transact(stream, unit_id, pdu);
        if let Err(e) = &result {
            // No framing to resync on; start from a fresh stream
            warn!(
                addr = %self.address,
                error = %e,
                "RTU-over-TCP exchange failed, dropping connection"
            );
            self.connection = None;
        }
        result
    }

    fn describe(&self) -> String {
        format!("rtu+tcp://{}", self.address)
    }
}
