//! Symbolic pin grammar.
//!
//! ```text
//! off                                   disabled point
//! !<name>                               inverted polarity
//! <KIND><index>                         on-board point, e.g. DI3, LED1
//! U<if>:ID<dev>:FC<fc>:R<base>:<KIND><n>  Modbus point, e.g. U1:ID2:FC5:R0:RO3
//! U<if>:ID<dev>:R<base>:<KIND><n>       short form, function code inferred from KIND
//! ```
//!
//! Parsing is pure; whether a name is bound to anything is decided by the
//! controller.

use crate::modbus::FunctionCode;
use bas_common::error::{BasError, BasResult};
use std::fmt;
use std::str::FromStr;

/// Sentinel name for a point with no physical binding.
pub const DISABLED: &str = "off";

/// Logical polarity of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Polarity {
    /// Value passes through.
    #[default]
    Normal,
    /// Boolean values are negated in both directions.
    Inverted,
}

impl Polarity {
    /// Apply the polarity to a boolean value.
    #[must_use]
    pub fn apply(self, value: bool) -> bool {
        match self {
            Self::Normal => value,
            Self::Inverted => !value,
        }
    }
}

/// Point kind mnemonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PointKind {
    /// Digital input (`DI`).
    DigitalInput,
    /// Digital output (`DO`).
    DigitalOutput,
    /// Relay output (`RO`).
    Relay,
    /// Analog output (`AO`).
    AnalogOutput,
    /// Analog input (`AI`).
    AnalogInput,
    /// Indicator LED (`LED`).
    Led,
}

impl PointKind {
    /// Mnemonic as written in symbolic names.
    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::DigitalInput => "DI",
            Self::DigitalOutput => "DO",
            Self::Relay => "RO",
            Self::AnalogOutput => "AO",
            Self::AnalogInput => "AI",
            Self::Led => "LED",
        }
    }

    /// Analog kinds carry whole words; the others carry single bits.
    #[must_use]
    pub fn is_analog(self) -> bool {
        matches!(self, Self::AnalogOutput | Self::AnalogInput)
    }

    /// Function code used when a remote name omits the `FC` segment.
    #[must_use]
    pub fn default_function(self) -> FunctionCode {
        match self {
            Self::DigitalInput => FunctionCode::ReadDiscreteInputs,
            Self::DigitalOutput | Self::Relay | Self::Led => FunctionCode::WriteMultipleCoils,
            Self::AnalogOutput => FunctionCode::WriteMultipleRegisters,
            Self::AnalogInput => FunctionCode::ReadInputRegisters,
        }
    }

    /// Split a leading mnemonic off `s`.
    fn split(s: &str) -> Option<(Self, &str)> {
        // LED first so "LE" never shadows it
        const ORDER: [PointKind; 6] = [
            PointKind::Led,
            PointKind::DigitalInput,
            PointKind::DigitalOutput,
            PointKind::Relay,
            PointKind::AnalogOutput,
            PointKind::AnalogInput,
        ];
        ORDER
            .into_iter()
            .find_map(|kind| s.strip_prefix(kind.mnemonic()).map(|rest| (kind, rest)))
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// How a remote point is located inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Coil or discrete input at `base_register + offset`.
    Coil {
        /// Offset from the group base.
        offset: u16,
    },
    /// Single bit of the register at `base_register`.
    RegisterBit {
        /// Bit position, 0 is least significant.
        bit: u8,
    },
    /// Whole register at `base_register + offset`.
    Register {
        /// Offset from the group base.
        offset: u16,
    },
}

/// A point on a Modbus device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemotePoint {
    /// Interface index (`U<n>`).
    pub interface_id: u8,
    /// Modbus unit id before `unit_base` is applied.
    pub device_id: u8,
    /// Function code the point is addressed with.
    pub function: FunctionCode,
    /// Group anchor register or coil.
    pub base_register: u16,
    /// Kind mnemonic from the name.
    pub kind: PointKind,
    /// Bit or word index from the name.
    pub bit_index: u16,
}

impl RemotePoint {
    /// Location of the point inside its group.
    #[must_use]
    pub fn access(&self) -> Access {
        if self.function.is_bit_access() {
            Access::Coil {
                offset: self.bit_index,
            }
        } else if self.kind.is_analog() {
            Access::Register {
                offset: self.bit_index,
            }
        } else {
            #[allow(clippy::cast_possible_truncation)]
            Access::RegisterBit {
                bit: self.bit_index as u8,
            }
        }
    }

    /// Word offset used when the point is read as a counter.
    #[must_use]
    pub fn word_offset(&self) -> u16 {
        match self.access() {
            Access::RegisterBit { .. } => 0,
            Access::Coil { offset } | Access::Register { offset } => offset,
        }
    }

    fn validate(self, name: &str) -> BasResult<Self> {
        match self.access() {
            Access::Coil { offset } if self.kind.is_analog() => Err(BasError::invalid_address(
                name,
                format!(
                    "analog kind {} cannot use bit function code {} (offset {offset})",
                    self.kind, self.function
                ),
            )),
            Access::Coil { offset } | Access::Register { offset }
                if self.base_register.checked_add(offset).is_none() =>
            {
                Err(BasError::invalid_address(
                    name,
                    "register offset overflows the address space",
                ))
            }
            Access::RegisterBit { .. } if self.bit_index > 15 => Err(BasError::invalid_address(
                name,
                format!("bit index {} exceeds 15", self.bit_index),
            )),
            _ => Ok(self),
        }
    }
}

impl fmt::Display for RemotePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "U{}:ID{}:FC{}:R{}:{}{}",
            self.interface_id,
            self.device_id,
            self.function.code(),
            self.base_register,
            self.kind,
            self.bit_index
        )
    }
}

/// Physical binding of a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// No binding; reads yield defaults and writes are dropped.
    Disabled,
    /// On-board REST I/O point.
    Local {
        /// Point kind.
        kind: PointKind,
        /// Point index.
        index: u16,
    },
    /// Modbus point.
    Remote(RemotePoint),
}

/// Canonical descriptor produced from a symbolic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Leading `!` on the name.
    pub polarity: Polarity,
    /// Where the point lives.
    pub target: Target,
}

impl Endpoint {
    /// Parse a symbolic name.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::InvalidName`] for an empty string and
    /// [`BasError::InvalidAddress`] for anything outside the grammar.
    pub fn parse(name: &str) -> BasResult<Self> {
        if name.is_empty() {
            return Err(BasError::InvalidName);
        }

        let (polarity, body) = match name.strip_prefix('!') {
            Some(rest) => (Polarity::Inverted, rest),
            None => (Polarity::Normal, name),
        };

        let target = if body == DISABLED {
            Target::Disabled
        } else if body.contains(':') {
            Target::Remote(parse_remote(name, body)?)
        } else {
            let (kind, index) = parse_kind(name, body)?;
            Target::Local { kind, index }
        };

        Ok(Self { polarity, target })
    }

    /// True for the `off` sentinel.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self.target, Target::Disabled)
    }

    /// Point kind, absent for disabled points.
    #[must_use]
    pub fn kind(&self) -> Option<PointKind> {
        match self.target {
            Target::Disabled => None,
            Target::Local { kind, .. } | Target::Remote(RemotePoint { kind, .. }) => Some(kind),
        }
    }

    /// Canonical name without the polarity marker.
    #[must_use]
    pub fn target_name(&self) -> String {
        match self.target {
            Target::Disabled => DISABLED.to_string(),
            Target::Local { kind, index } => format!("{kind}{index}"),
            Target::Remote(point) => point.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.polarity == Polarity::Inverted && !self.is_disabled() {
            f.write_str("!")?;
        }
        f.write_str(&self.target_name())
    }
}

impl FromStr for Endpoint {
    type Err = BasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Decimal digits only; signs and whitespace are rejected.
fn number<T: TryFrom<u64>>(name: &str, digits: &str, field: &str) -> BasResult<T> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BasError::invalid_address(
            name,
            format!("{field} {digits:?} is not a decimal number"),
        ));
    }
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| BasError::invalid_address(name, format!("{field} {digits} out of range")))
}

fn prefixed<T: TryFrom<u64>>(name: &str, segment: &str, prefix: &str, field: &str) -> BasResult<T> {
    let digits = segment.strip_prefix(prefix).ok_or_else(|| {
        BasError::invalid_address(name, format!("expected {prefix}<{field}>, got {segment:?}"))
    })?;
    number(name, digits, field)
}

fn parse_kind<T: TryFrom<u64>>(name: &str, segment: &str) -> BasResult<(PointKind, T)> {
    let (kind, digits) = PointKind::split(segment).ok_or_else(|| {
        BasError::invalid_address(name, format!("unknown point kind in {segment:?}"))
    })?;
    Ok((kind, number(name, digits, "index")?))
}

fn parse_remote(name: &str, body: &str) -> BasResult<RemotePoint> {
    let segments: Vec<&str> = body.split(':').collect();
    let (iface, dev, fc, reg, point) = match segments.as_slice() {
        [iface, dev, fc, reg, point] => (*iface, *dev, Some(*fc), *reg, *point),
        [iface, dev, reg, point] => (*iface, *dev, None, *reg, *point),
        _ => {
            return Err(BasError::invalid_address(
                name,
                format!("expected 4 or 5 segments, got {}", segments.len()),
            ))
        }
    };

    let interface_id = prefixed(name, iface, "U", "interface")?;
    let device_id = prefixed(name, dev, "ID", "device id")?;
    let base_register = prefixed(name, reg, "R", "register")?;
    let (kind, bit_index) = parse_kind(name, point)?;

    let function = match fc {
        Some(segment) => {
            let code: u8 = prefixed(name, segment, "FC", "function code")?;
            FunctionCode::from_code(code).ok_or_else(|| {
                BasError::invalid_address(name, format!("unsupported function code {code}"))
            })?
        }
        None => kind.default_function(),
    };

    RemotePoint {
        interface_id,
        device_id,
        function,
        base_register,
        kind,
        bit_index,
    }
    .validate(name)
}
