//! On-board I/O module reached over its local REST API.
//!
//! Every call is one blocking HTTP request with the configured timeout.
//! Non-200 answers, undecodable bodies and socket failures all come back as
//! transport errors.

use crate::address::PointKind;
use bas_common::config::LocalConfig;
use bas_common::error::{BasError, BasResult};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::trace;

/// REST path family under `<base_url>/rest/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RestFamily {
    /// Snapshot of every point.
    All,
    /// Generic register.
    Register,
    /// Indicator LED.
    Led,
    /// Relay output.
    Relay,
    /// Digital output.
    DigitalOutput,
    /// Digital input (also carries the pulse counter).
    DigitalInput,
    /// Analog output.
    AnalogOutput,
    /// Analog input.
    AnalogInput,
    /// Hardware watchdog.
    Watchdog,
}

impl RestFamily {
    /// Path segment of the family.
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Register => "register",
            Self::Led => "led",
            Self::Relay => "relay",
            Self::DigitalOutput => "do",
            Self::DigitalInput => "di",
            Self::AnalogOutput => "ao",
            Self::AnalogInput => "ai",
            Self::Watchdog => "wd",
        }
    }

    /// Family serving a local point kind.
    #[must_use]
    pub fn for_kind(kind: PointKind) -> Self {
        match kind {
            PointKind::DigitalInput => Self::DigitalInput,
            PointKind::DigitalOutput => Self::DigitalOutput,
            PointKind::Relay => Self::Relay,
            PointKind::AnalogOutput => Self::AnalogOutput,
            PointKind::AnalogInput => Self::AnalogInput,
            PointKind::Led => Self::Led,
        }
    }

    /// Family named by the `dev` field of a snapshot entry.
    #[must_use]
    pub fn from_dev(dev: &str) -> Option<Self> {
        match dev {
            "register" => Some(Self::Register),
            "led" => Some(Self::Led),
            "relay" | "ro" => Some(Self::Relay),
            "do" | "output" => Some(Self::DigitalOutput),
            "di" | "input" => Some(Self::DigitalInput),
            "ao" => Some(Self::AnalogOutput),
            "ai" => Some(Self::AnalogInput),
            "wd" => Some(Self::Watchdog),
            _ => None,
        }
    }
}

impl fmt::Display for RestFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// One point as reported by the REST API.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LocalPoint {
    /// Device class (`input`, `relay`, `ai`, ...).
    pub dev: String,
    /// Circuit id, e.g. `1_01`.
    #[serde(deserialize_with = "circuit_string")]
    pub circuit: String,
    /// Current value; booleans are reported as 0/1.
    #[serde(deserialize_with = "number_or_bool")]
    pub value: Option<f64>,
    /// Pulse counter of digital inputs.
    pub counter: Option<i64>,
}

fn number_or_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => Some(if b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        _ => None,
    })
}

fn circuit_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Strip the `result`/`data` envelope some firmware versions add.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("result").or_else(|| map.remove("data")) {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    }
}

/// Decode a single point body.
///
/// # Errors
///
/// Returns [`BasError::TransportError`] when the body is not a point object.
pub fn decode_point(body: Value) -> BasResult<LocalPoint> {
    serde_json::from_value(unwrap_envelope(body))
        .map_err(|e| BasError::TransportError(format!("malformed point body: {e}")))
}

/// Decode the `all` snapshot body.
///
/// # Errors
///
/// Returns [`BasError::TransportError`] when the body is not an array of points.
pub fn decode_snapshot(body: Value) -> BasResult<Vec<LocalPoint>> {
    serde_json::from_value(unwrap_envelope(body))
        .map_err(|e| BasError::TransportError(format!("malformed snapshot body: {e}")))
}

/// Access to the on-board I/O module.
pub trait LocalIo: Send {
    /// Read one point.
    ///
    /// # Errors
    ///
    /// Returns a transport error on any failure.
    fn get(&mut self, family: RestFamily, circuit: &str) -> BasResult<LocalPoint>;

    /// Update fields of one point.
    ///
    /// # Errors
    ///
    /// Returns a transport error on any failure.
    fn set(&mut self, family: RestFamily, circuit: &str, body: &Value) -> BasResult<()>;

    /// Read every point in one request.
    ///
    /// # Errors
    ///
    /// Returns a transport error on any failure.
    fn snapshot(&mut self) -> BasResult<Vec<LocalPoint>>;

    /// Location for logs.
    fn describe(&self) -> String;
}

/// Blocking HTTP client for the REST API.
pub struct RestClient {
    base_url: String,
    agent: ureq::Agent,
}

impl RestClient {
    /// Build a client for `config.base_url`.
    #[must_use]
    pub fn new(config: &LocalConfig) -> Self {
        Self::with_timeout(&config.base_url, config.timeout)
    }

    /// Build a client with an explicit timeout.
    #[must_use]
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, family: RestFamily, circuit: Option<&str>) -> String {
        match circuit {
            Some(circuit) => format!("{}/rest/{}/{}", self.base_url, family.path(), circuit),
            None => format!("{}/rest/{}", self.base_url, family.path()),
        }
    }

    fn map_error(url: &str, err: &ureq::Error) -> BasError {
        match err {
            ureq::Error::Timeout(_) => BasError::TransportTimeout(format!("{url}: {err}")),
            _ => BasError::TransportError(format!("{url}: {err}")),
        }
    }

    fn fetch(&self, url: &str) -> BasResult<Value> {
        trace!(%url, "GET");
        let mut response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| Self::map_error(url, &e))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(BasError::TransportError(format!("{url}: HTTP {status}")));
        }
        response
            .body_mut()
            .read_json::<Value>()
            .map_err(|e| Self::map_error(url, &e))
    }
}

impl LocalIo for RestClient {
    fn get(&mut self, family: RestFamily, circuit: &str) -> BasResult<LocalPoint> {
        let url = self.url(family, Some(circuit));
        decode_point(self.fetch(&url)?)
    }

    fn set(&mut self, family: RestFamily, circuit: &str, body: &Value) -> BasResult<()> {
        let url = self.url(family, Some(circuit));
        trace!(%url, %body, "POST");
        let response = self
            .agent
            .post(&url)
            .send_json(body)
            .map_err(|e| Self::map_error(&url, &e))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(BasError::TransportError(format!("{url}: HTTP {status}")));
        }
        Ok(())
    }

    fn snapshot(&mut self) -> BasResult<Vec<LocalPoint>> {
        let url = self.url(RestFamily::All, None);
        decode_snapshot(self.fetch(&url)?)
    }

    fn describe(&self) -> String {
        self.base_url.clone()
    }
}
