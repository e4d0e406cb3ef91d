//! Fieldbus access for the building-automation controller.
//!
//! This crate provides:
//! - The symbolic pin grammar ([`address`])
//! - A Modbus PDU codec and TCP transport ([`modbus`])
//! - RTU framing over serial lines and TCP gateways ([`rtu`])
//! - The on-board REST I/O client ([`local`])
//! - A lazily populated, per-interface transport pool ([`pool`])
//! - An in-memory bus for tests and dry runs (`simulated`, behind the
//!   `simulated` feature)

pub mod address;
pub mod local;
pub mod modbus;
pub mod pool;
pub mod rtu;
#[cfg(feature = "simulated")]
pub mod simulated;

pub use address::{Access, Endpoint, PointKind, Polarity, RemotePoint, Target};
pub use local::{LocalIo, LocalPoint, RestClient, RestFamily};
pub use modbus::{FunctionCode, Request, Response, TcpTransport};
pub use pool::{SystemTransports, TransportFactory, TransportPool};
pub use rtu::{RtuOverTcpTransport, RtuTransport};

use bas_common::error::BasResult;

/// A Modbus client connection, independent of framing.
///
/// Implementations carry one request at a time; callers serialize access
/// per interface.
pub trait ModbusTransport: Send {
    /// Send a request PDU to `unit_id` and return the response PDU.
    ///
    /// Exception responses are returned as-is; decoding is the caller's job.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the exchange does not complete.
    fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> BasResult<Vec<u8>>;

    /// Location for logs, e.g. `tcp://10.0.0.4:502`.
    fn describe(&self) -> String;

    /// Encode `request`, send it and decode the validated response.
    ///
    /// # Errors
    ///
    /// Returns transport errors, [`bas_common::BasError::ModbusException`]
    /// for exception responses, or a decode error for malformed answers.
    fn execute(&mut self, unit_id: u8, request: &Request) -> BasResult<Response> {
        let pdu = request.encode()?;
        let response = self.transact(unit_id, &pdu)?;
        request.decode_response(&response)
    }
}
