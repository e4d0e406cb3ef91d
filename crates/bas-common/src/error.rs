use thiserror::Error;

/// Error taxonomy for the I/O virtualization and dispatch layer.
///
/// Address and pin errors are configuration bugs and are returned to the
/// calling plugin. Transport errors are masked at the controller/flusher
/// boundary and only surface through logs and diagnostics.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BasError {
    /// Symbolic name was empty.
    #[error("invalid name: symbolic pin name is empty")]
    InvalidName,

    /// Symbolic name does not match the address grammar.
    #[error("invalid address {name:?}: {reason}")]
    InvalidAddress {
        /// The rejected symbolic name.
        name: String,
        /// What part of the grammar failed.
        reason: String,
    },

    /// Well-formed name that is not bound in the configured pin map.
    #[error("unknown pin: {0}")]
    UnknownPin(String),

    /// Write requested on a point whose function code only supports reads.
    #[error("point {0} is read-only")]
    ReadOnly(String),

    /// Transport handle for an interface could not be constructed.
    #[error("transport unavailable on interface {interface}: {reason}")]
    TransportUnavailable {
        /// Interface identifier (or local base URL).
        interface: String,
        /// Construction failure.
        reason: String,
    },

    /// A request did not complete within its timeout.
    #[error("transport timeout: {0}")]
    TransportTimeout(String),

    /// A request failed on the wire or returned an error status.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The remote device answered with a Modbus exception response.
    #[error("modbus exception 0x{code:02X} for function 0x{function:02X}")]
    ModbusException {
        /// Function code of the request.
        function: u8,
        /// Exception code returned by the device.
        code: u8,
    },

    /// Transport failure on a point that callers depend on.
    #[error("hardware malfunction on {name} ({address}): {reason}")]
    HardwareMalfunction {
        /// Symbolic name of the affected point.
        name: String,
        /// Formatted physical address.
        address: String,
        /// Underlying transport failure.
        reason: String,
    },

    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid cycle phase transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source phase.
        from: String,
        /// Attempted target phase.
        to: String,
    },
}

impl BasError {
    /// Shorthand for an [`BasError::InvalidAddress`] with a static reason.
    pub fn invalid_address(name: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true for failures of the physical I/O path.
    ///
    /// These are masked by the controller and never returned to plugins.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::TransportUnavailable { .. }
                | Self::TransportTimeout(_)
                | Self::TransportError(_)
                | Self::ModbusException { .. }
                | Self::HardwareMalfunction { .. }
        )
    }

    /// Map an I/O error from a socket or serial port.
    ///
    /// Timeouts keep their own variant so diagnostics can tell a silent
    /// device from a broken link.
    #[must_use]
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::TransportTimeout(format!("{context}: {err}"))
            }
            _ => Self::TransportError(format!("{context}: {err}")),
        }
    }
}

/// Convenience type alias for controller operations.
pub type BasResult<T> = Result<T, BasError>;
