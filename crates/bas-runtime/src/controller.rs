//! Controller facade.
//!
//! The single surface used by drivers and plugins. A symbolic name is
//! parsed, checked against the configured pin map and routed:
//!
//! - disabled points never touch a transport;
//! - local points are one immediate REST request each;
//! - remote points are queued into the batch accumulator and served from
//!   the register cache until the end-of-cycle [`Controller::flush`].
//!
//! Transport failures never reach the caller. They are logged as hardware
//! malfunctions, recorded in [`IoDiagnostics`] and masked with the
//! last-known-good value.

use crate::batch::{with_bit, BatchAccumulator, Correlation, WriteValue};
use crate::cache::{GroupKey, RegisterCache, RegisterImage};
use crate::flush::{cached_sample, flush_groups, FlushReport};
use crate::scaling::{to_engineering, to_native, to_register, AnalogReading};
use bas_common::config::{AnalogRange, BasConfig};
use bas_common::error::{BasError, BasResult};
use bas_common::state::{CyclePhase, PhaseTracker};
use bas_fieldbus::pool::wire_unit_id;
use bas_fieldbus::{
    Access, Endpoint, PointKind, Polarity, RemotePoint, Request, Response,
    RestFamily, SystemTransports, Target, TransportFactory, TransportPool,
};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// "Last update errors" mirror and I/O counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IoDiagnostics {
    /// Last error per symbolic name; cleared by the next success.
    pub last_errors: BTreeMap<String, String>,
    /// Hardware malfunctions logged since start.
    pub malfunctions: u64,
    /// Physical transactions issued since start (Modbus and REST).
    pub transactions: u64,
    /// Completed flushes.
    pub flushes: u64,
    /// Failed batch groups in the most recent flush.
    pub failed_groups_last_flush: usize,
}

impl IoDiagnostics {
    fn record_error(&mut self, name: &str, error: &BasError) {
        self.malfunctions += 1;
        self.last_errors.insert(name.to_string(), error.to_string());
    }

    fn record_success(&mut self, name: &str) {
        self.last_errors.remove(name);
    }

    fn record_flush(&mut self, report: &FlushReport) {
        self.flushes += 1;
        self.transactions += report.transactions as u64;
        self.failed_groups_last_flush = report.failures.len();
        for name in &report.healthy {
            self.last_errors.remove(name);
        }
        for failure in &report.failures {
            for name in &failure.names {
                self.record_error(name, &failure.error);
            }
        }
    }

    /// Whether a point's last update failed.
    #[must_use]
    pub fn has_error(&self, name: &str) -> bool {
        self.last_errors.contains_key(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Decode {
    Digital(Polarity),
    Analog(AnalogRange),
}

/// Value of a read whose remote part completes at flush.
///
/// Local and disabled points are ready immediately; remote points carry
/// the cached value plus the correlation of the queued read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deferred<T> {
    cached: T,
    pending: Option<(Correlation, Decode)>,
}

impl<T: Copy> Deferred<T> {
    fn ready(value: T) -> Self {
        Self {
            cached: value,
            pending: None,
        }
    }

    /// Value known at the time of the call.
    #[must_use]
    pub fn cached(&self) -> T {
        self.cached
    }

    /// Correlation of the queued read, if any.
    #[must_use]
    pub fn correlation(&self) -> Option<Correlation> {
        self.pending.map(|(correlation, _)| correlation)
    }

    /// True when the value depends on the next flush.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Whether the flush failed to refresh this value.
    #[must_use]
    pub fn is_stale(&self, report: &FlushReport) -> bool {
        self.correlation()
            .and_then(|c| report.completion(c))
            .is_some_and(|done| done.stale)
    }
}

impl Deferred<bool> {
    /// Demultiplexed value from `report`, or the cached value.
    #[must_use]
    pub fn resolve(&self, report: &FlushReport) -> bool {
        match self.pending {
            Some((correlation, Decode::Digital(polarity))) => report
                .completion(correlation)
                .map_or(self.cached, |done| polarity.apply(done.value.as_bool())),
            _ => self.cached,
        }
    }
}

impl Deferred<AnalogReading> {
    /// Demultiplexed and scaled value from `report`, or the cached value.
    #[must_use]
    pub fn resolve(&self, report: &FlushReport) -> AnalogReading {
        match self.pending {
            Some((correlation, Decode::Analog(range))) => {
                report.completion(correlation).map_or(self.cached, |done| {
                    AnalogReading::new(to_engineering(done.value.as_f64(), &range), &range)
                })
            }
            _ => self.cached,
        }
    }
}

/// Physical binding of a resolved name.
#[derive(Debug, Clone)]
enum Binding {
    Disabled,
    Local {
        key: String,
        kind: PointKind,
        circuit: String,
    },
    Remote(RemotePoint),
}

impl Binding {
    fn local_address(kind: PointKind, circuit: &str) -> String {
        format!("{}/{circuit}", RestFamily::for_kind(kind))
    }
}

fn pin_table(config: &BasConfig) -> BasResult<BTreeMap<String, String>> {
    config
        .local
        .pins
        .iter()
        .map(|(name, circuit)| {
            let endpoint = Endpoint::parse(name)
                .map_err(|e| BasError::Config(format!("pin {name:?}: {e}")))?;
            match endpoint.target {
                Target::Local { .. } if endpoint.polarity == Polarity::Normal => {
                    Ok((endpoint.target_name(), circuit.clone()))
                }
                _ => Err(BasError::Config(format!(
                    "pin {name:?} is not a plain local point name"
                ))),
            }
        })
        .collect()
}

fn analog_table(config: &BasConfig) -> BasResult<HashMap<String, AnalogRange>> {
    config
        .analog
        .iter()
        .map(|(name, range)| {
            let endpoint = Endpoint::parse(name)
                .map_err(|e| BasError::Config(format!("analog range {name:?}: {e}")))?;
            if endpoint.is_disabled() {
                return Err(BasError::Config(format!(
                    "analog range {name:?} names a disabled point"
                )));
            }
            Ok((endpoint.target_name(), *range))
        })
        .collect()
}

fn config_error(error: &bas_common::config::ConfigError) -> BasError {
    BasError::Config(error.to_string())
}

/// I/O virtualization and dispatch facade.
pub struct Controller {
    config: BasConfig,
    pool: TransportPool,
    cache: RegisterCache,
    batch: BatchAccumulator,
    phase: PhaseTracker,
    pins: BTreeMap<String, String>,
    analog: HashMap<String, AnalogRange>,
    local_values: HashMap<String, f64>,
    local_counters: HashMap<String, i64>,
    diagnostics: IoDiagnostics,
}

impl Controller {
    /// Build a controller over `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::Config`] if the configuration does not validate,
    /// a pin key is not a local point name, or an analog key does not parse.
    pub fn new(config: BasConfig, factory: Arc<dyn TransportFactory>) -> BasResult<Self> {
        config.validate().map_err(|e| config_error(&e))?;
        let pins = pin_table(&config)?;
        let analog = analog_table(&config)?;
        let pool = TransportPool::new(factory, &config.interfaces, &config.local);

        info!(
            interfaces = config.interfaces.len(),
            local_pins = pins.len(),
            analog_ranges = analog.len(),
            "Controller ready"
        );

        Ok(Self {
            config,
            pool,
            cache: RegisterCache::new(),
            batch: BatchAccumulator::new(),
            phase: PhaseTracker::new(),
            pins,
            analog,
            local_values: HashMap::new(),
            local_counters: HashMap::new(),
            diagnostics: IoDiagnostics::default(),
        })
    }

    /// Build a controller over real serial ports, sockets and HTTP.
    ///
    /// # Errors
    ///
    /// See [`Controller::new`].
    pub fn with_system_transports(config: BasConfig) -> BasResult<Self> {
        Self::new(config, Arc::new(SystemTransports))
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &BasConfig {
        &self.config
    }

    /// Device register cache.
    #[must_use]
    pub fn cache(&self) -> &RegisterCache {
        &self.cache
    }

    /// Transport pool.
    #[must_use]
    pub fn pool(&self) -> &TransportPool {
        &self.pool
    }

    /// Current cycle phase.
    #[must_use]
    pub fn phase(&self) -> CyclePhase {
        self.phase.phase()
    }

    /// Number of completed flushes.
    #[must_use]
    pub fn completed_cycles(&self) -> u64 {
        self.phase.completed_cycles()
    }

    /// Remote operations queued for the next flush.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.batch.len()
    }

    /// Error mirror and counters.
    #[must_use]
    pub fn diagnostics(&self) -> &IoDiagnostics {
        &self.diagnostics
    }

    /// Resolve a symbolic name against the grammar and the configuration.
    fn bind(&self, name: &str) -> BasResult<(Polarity, Binding)> {
        let endpoint = Endpoint::parse(name)?;
        let binding = match endpoint.target {
            Target::Disabled => Binding::Disabled,
            Target::Local { kind, .. } => {
                let key = endpoint.target_name();
                let circuit = self
                    .pins
                    .get(&key)
                    .ok_or_else(|| BasError::UnknownPin(name.to_string()))?
                    .clone();
                Binding::Local { key, kind, circuit }
            }
            Target::Remote(point) => {
                if self.pool.interface(point.interface_id).is_none() {
                    return Err(BasError::UnknownPin(name.to_string()));
                }
                Binding::Remote(point)
            }
        };
        Ok((endpoint.polarity, binding))
    }

    /// Scaling metadata of a point, identity window if none is configured.
    fn range_of(&self, binding: &Binding) -> AnalogRange {
        let key = match binding {
            Binding::Disabled => return AnalogRange::default(),
            Binding::Local { key, .. } => key.clone(),
            Binding::Remote(point) => point.to_string(),
        };
        self.analog.get(&key).copied().unwrap_or_default()
    }

    fn malfunction(&mut self, name: &str, address: &str, error: &BasError) {
        warn!(name = %name, address = %address, error = %error, "Hardware malfunction");
        self.diagnostics.record_error(name, error);
    }

    // Local path

    /// One GET against the REST module; updates last-known-good values.
    fn local_fetch(
        &mut self,
        name: &str,
        key: &str,
        kind: PointKind,
        circuit: &str,
    ) -> BasResult<()> {
        let family = RestFamily::for_kind(kind);
        self.diagnostics.transactions += 1;
        match self.pool.with_local(|io| io.get(family, circuit)) {
            Ok(point) => {
                trace!(
                    name = %name,
                    %family,
                    circuit = %circuit,
                    value = ?point.value,
                    "Local read"
                );
                if let Some(value) = point.value {
                    self.local_values.insert(key.to_string(), value);
                }
                if let Some(counter) = point.counter {
                    self.local_counters.insert(key.to_string(), counter);
                }
                self.diagnostics.record_success(name);
                Ok(())
            }
            Err(e) if e.is_transport() => {
                self.malfunction(name, &Binding::local_address(kind, circuit), &e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One POST against the REST module. Returns whether it succeeded.
    fn local_post(
        &mut self,
        name: &str,
        family: RestFamily,
        circuit: &str,
        body: &serde_json::Value,
    ) -> BasResult<bool> {
        self.diagnostics.transactions += 1;
        match self.pool.with_local(|io| io.set(family, circuit, body)) {
            Ok(()) => {
                trace!(name = %name, %family, circuit = %circuit, %body, "Local write");
                self.diagnostics.record_success(name);
                Ok(true)
            }
            Err(e) if e.is_transport() => {
                self.malfunction(name, &format!("{family}/{circuit}"), &e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn local_write_value(
        &mut self,
        name: &str,
        key: &str,
        kind: PointKind,
        circuit: &str,
        value: f64,
    ) -> BasResult<()> {
        if matches!(kind, PointKind::DigitalInput | PointKind::AnalogInput) {
            return Err(BasError::ReadOnly(name.to_string()));
        }
        let family = RestFamily::for_kind(kind);
        if self.local_post(name, family, circuit, &json!({ "value": value }))? {
            self.local_values.insert(key.to_string(), value);
        }
        Ok(())
    }

    // Remote path

    fn enqueue_read(
        &mut self,
        name: &str,
        point: &RemotePoint,
        access: Access,
    ) -> BasResult<Correlation> {
        self.phase.begin_accumulating()?;
        let key = GroupKey::of(point);
        trace!(name = %name, group = %key, "Read queued");
        Ok(self.batch.enqueue_read(key, access, name))
    }

    fn remote_write(
        &mut self,
        name: &str,
        point: &RemotePoint,
        access: Access,
        value: WriteValue,
    ) -> BasResult<()> {
        if !point.function.is_write() {
            return Err(BasError::ReadOnly(name.to_string()));
        }
        let key = GroupKey::of(point);
        if point.function.is_single_write() {
            return self.write_immediate(name, point, key, access, value);
        }
        self.phase.begin_accumulating()?;
        trace!(name = %name, group = %key, ?value, "Write queued");
        self.batch.enqueue_write(key, access, value, &self.cache, name);
        Ok(())
    }

    /// Single coil/register codes go straight to the bus.
    fn write_immediate(
        &mut self,
        name: &str,
        point: &RemotePoint,
        key: GroupKey,
        access: Access,
        value: WriteValue,
    ) -> BasResult<()> {
        let base = point.base_register;
        let (request, offset, image) = match access {
            Access::Coil { offset } => {
                let bit = value.as_bool();
                (
                    Request::WriteSingleCoil {
                        address: base.saturating_add(offset),
                        value: bit,
                    },
                    offset,
                    RegisterImage::Bits(vec![bit]),
                )
            }
            Access::RegisterBit { bit } => {
                let word = with_bit(self.cache.word(&key, 0).unwrap_or(0), bit, value.as_bool());
                (
                    Request::WriteSingleRegister {
                        address: base,
                        value: word,
                    },
                    0,
                    RegisterImage::Words(vec![word]),
                )
            }
            Access::Register { offset } => {
                let word = value.as_word();
                (
                    Request::WriteSingleRegister {
                        address: base.saturating_add(offset),
                        value: word,
                    },
                    offset,
                    RegisterImage::Words(vec![word]),
                )
            }
        };

        match self.transact(point.interface_id, point.device_id, &request) {
            Ok(_) => {
                self.cache.store(key, offset, &image);
                self.diagnostics.record_success(name);
                Ok(())
            }
            Err(e) if e.is_transport() => {
                self.cache.mark_stale(&key);
                self.malfunction(name, &point.to_string(), &e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn transact(
        &mut self,
        interface_id: u8,
        device_id: u8,
        request: &Request,
    ) -> BasResult<Response> {
        self.diagnostics.transactions += 1;
        trace!(
            interface = interface_id,
            device = device_id,
            function = request.function_code(),
            "Immediate request"
        );
        self.pool.with_modbus(interface_id, |transport, config| {
            transport.execute(wire_unit_id(config, device_id), request)
        })
    }

    // Digital

    /// Read a boolean point; remote reads also queue a refresh.
    ///
    /// # Errors
    ///
    /// Address and pin errors only; transport failures are masked.
    pub fn digital_read_deferred(&mut self, name: &str) -> BasResult<Deferred<bool>> {
        let (polarity, binding) = self.bind(name)?;
        match binding {
            Binding::Disabled => Ok(Deferred::ready(false)),
            Binding::Local { key, kind, circuit } => {
                self.local_fetch(name, &key, kind, &circuit)?;
                let raw = self.local_values.get(&key).is_some_and(|v| *v != 0.0);
                Ok(Deferred::ready(polarity.apply(raw)))
            }
            Binding::Remote(point) => {
                let access = point.access();
                let cached = cached_sample(&self.cache, &GroupKey::of(&point), access).as_bool();
                let correlation = self.enqueue_read(name, &point, access)?;
                Ok(Deferred {
                    cached: polarity.apply(cached),
                    pending: Some((correlation, Decode::Digital(polarity))),
                })
            }
        }
    }

    /// Read a boolean point.
    ///
    /// # Errors
    ///
    /// [`BasError::InvalidName`], [`BasError::InvalidAddress`] or
    /// [`BasError::UnknownPin`].
    pub fn digital_read(&mut self, name: &str) -> BasResult<bool> {
        self.digital_read_deferred(name).map(|read| read.cached())
    }

    /// Write a boolean point.
    ///
    /// # Errors
    ///
    /// Address and pin errors, or [`BasError::ReadOnly`] for inputs.
    pub fn digital_write(&mut self, name: &str, value: bool) -> BasResult<()> {
        let (polarity, binding) = self.bind(name)?;
        let physical = polarity.apply(value);
        match binding {
            Binding::Disabled => Ok(()),
            Binding::Local { key, kind, circuit } => {
                self.local_write_value(name, &key, kind, &circuit, f64::from(u8::from(physical)))
            }
            Binding::Remote(point) => {
                self.remote_write(name, &point, point.access(), WriteValue::Bit(physical))
            }
        }
    }

    // Analog

    /// Read an analog point in engineering units.
    ///
    /// # Errors
    ///
    /// Address and pin errors only; transport failures are masked.
    pub fn analog_read_deferred(&mut self, name: &str) -> BasResult<Deferred<AnalogReading>> {
        let (_, binding) = self.bind(name)?;
        let range = self.range_of(&binding);
        match binding {
            Binding::Disabled => Ok(Deferred::ready(AnalogReading::new(range.min, &range))),
            Binding::Local { key, kind, circuit } => {
                self.local_fetch(name, &key, kind, &circuit)?;
                let raw = self.local_values.get(&key).copied().unwrap_or(0.0);
                Ok(Deferred::ready(AnalogReading::new(
                    to_engineering(raw, &range),
                    &range,
                )))
            }
            Binding::Remote(point) => {
                let access = point.access();
                let raw = cached_sample(&self.cache, &GroupKey::of(&point), access).as_f64();
                let correlation = self.enqueue_read(name, &point, access)?;
                Ok(Deferred {
                    cached: AnalogReading::new(to_engineering(raw, &range), &range),
                    pending: Some((correlation, Decode::Analog(range))),
                })
            }
        }
    }

    /// Read an analog point in engineering units.
    ///
    /// # Errors
    ///
    /// [`BasError::InvalidName`], [`BasError::InvalidAddress`] or
    /// [`BasError::UnknownPin`].
    pub fn analog_read(&mut self, name: &str) -> BasResult<AnalogReading> {
        self.analog_read_deferred(name).map(|read| read.cached())
    }

    /// Write an analog point given in engineering units.
    ///
    /// The value is clamped to the engineering window and scaled into the
    /// native range; remote points round to a 16-bit register.
    ///
    /// # Errors
    ///
    /// Address and pin errors, or [`BasError::ReadOnly`] for inputs.
    pub fn analog_write(&mut self, name: &str, value: f64) -> BasResult<()> {
        let (_, binding) = self.bind(name)?;
        let native = to_native(value, &self.range_of(&binding));
        match binding {
            Binding::Disabled => Ok(()),
            Binding::Local { key, kind, circuit } => {
                self.local_write_value(name, &key, kind, &circuit, native)
            }
            Binding::Remote(point) => {
                let word = to_register(native);
                let value = match point.access() {
                    Access::Register { .. } => WriteValue::Word(word),
                    Access::Coil { .. } | Access::RegisterBit { .. } => WriteValue::Bit(word != 0),
                };
                self.remote_write(name, &point, point.access(), value)
            }
        }
    }

    // Counters

    fn counter_word(name: &str, point: &RemotePoint) -> BasResult<Access> {
        if point.function.is_bit_access() {
            return Err(BasError::invalid_address(
                name,
                format!("function code {} has no counter registers", point.function),
            ));
        }
        Ok(Access::Register {
            offset: point.word_offset(),
        })
    }

    fn local_counter_only(name: &str, kind: PointKind) -> BasResult<()> {
        if kind == PointKind::DigitalInput {
            Ok(())
        } else {
            Err(BasError::invalid_address(
                name,
                format!("{kind} points have no pulse counter"),
            ))
        }
    }

    /// Read a pulse counter.
    ///
    /// Local counters live on digital inputs; remote counters are one
    /// register word.
    ///
    /// # Errors
    ///
    /// Address and pin errors, or [`BasError::InvalidAddress`] for points
    /// that carry no counter.
    pub fn read_counter(&mut self, name: &str) -> BasResult<i64> {
        let (_, binding) = self.bind(name)?;
        match binding {
            Binding::Disabled => Ok(0),
            Binding::Local { key, kind, circuit } => {
                Self::local_counter_only(name, kind)?;
                self.local_fetch(name, &key, kind, &circuit)?;
                Ok(self.local_counters.get(&key).copied().unwrap_or(0))
            }
            Binding::Remote(point) => {
                let access = Self::counter_word(name, &point)?;
                let cached = cached_sample(&self.cache, &GroupKey::of(&point), access).as_f64();
                self.enqueue_read(name, &point, access)?;
                #[allow(clippy::cast_possible_truncation)]
                Ok(cached as i64)
            }
        }
    }

    /// Preset a pulse counter.
    ///
    /// # Errors
    ///
    /// Address and pin errors, [`BasError::InvalidAddress`] for points that
    /// carry no counter, or [`BasError::ReadOnly`] for input registers.
    pub fn write_counter(&mut self, name: &str, value: i64) -> BasResult<()> {
        let (_, binding) = self.bind(name)?;
        match binding {
            Binding::Disabled => Ok(()),
            Binding::Local { key, kind, circuit } => {
                Self::local_counter_only(name, kind)?;
                let body = json!({ "counter": value });
                if self.local_post(name, RestFamily::DigitalInput, &circuit, &body)? {
                    self.local_counters.insert(key, value);
                }
                Ok(())
            }
            Binding::Remote(point) => {
                let access = Self::counter_word(name, &point)?;
                let word = u16::try_from(value.clamp(0, i64::from(u16::MAX))).unwrap_or(u16::MAX);
                self.remote_write(name, &point, access, WriteValue::Word(word))
            }
        }
    }

    // Escape hatch

    /// Send a hand-built request immediately, bypassing the batch.
    ///
    /// # Errors
    ///
    /// Exception responses come back as [`BasError::ModbusException`];
    /// other transport failures are logged and returned as
    /// [`BasError::HardwareMalfunction`]. An unconfigured interface is
    /// [`BasError::UnknownPin`].
    pub fn execute(
        &mut self,
        interface_id: u8,
        device_id: u8,
        request: &Request,
    ) -> BasResult<Response> {
        if self.pool.interface(interface_id).is_none() {
            return Err(BasError::UnknownPin(format!("U{interface_id}")));
        }
        let name = format!("U{interface_id}:ID{device_id}:FC{}", request.function_code());
        match self.transact(interface_id, device_id, request) {
            Ok(response) => {
                self.diagnostics.record_success(&name);
                Ok(response)
            }
            Err(e @ BasError::ModbusException { .. }) => {
                debug!(request = %name, error = %e, "Device answered with an exception");
                Err(e)
            }
            Err(e) if e.is_transport() => {
                self.malfunction(&name, &name, &e);
                Err(BasError::HardwareMalfunction {
                    address: name.clone(),
                    name,
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(e),
        }
    }

    // Cycle

    /// Drain the batch onto the buses.
    ///
    /// The accumulator is emptied unconditionally; per-group failures are
    /// masked and reported in the returned [`FlushReport`].
    ///
    /// # Errors
    ///
    /// Only [`BasError::InvalidStateTransition`] when called re-entrantly.
    pub fn flush(&mut self) -> BasResult<FlushReport> {
        self.phase.transition(CyclePhase::Flushing)?;
        let groups = self.batch.drain();
        let report = flush_groups(groups, &mut self.cache, &self.pool);
        self.diagnostics.record_flush(&report);
        self.phase.transition(CyclePhase::Idle)?;
        Ok(report)
    }

    /// Refresh every local point with one snapshot request.
    ///
    /// Returns the number of configured pins that were updated.
    ///
    /// # Errors
    ///
    /// Non-transport errors only.
    pub fn refresh_local(&mut self) -> BasResult<usize> {
        self.diagnostics.transactions += 1;
        let points = match self.pool.with_local(|io| io.snapshot()) {
            Ok(points) => points,
            Err(e) if e.is_transport() => {
                warn!(base_url = %self.config.local.base_url, error = %e, "Local snapshot failed");
                return Ok(0);
            }
            Err(e) => return Err(e),
        };

        let mut by_circuit: HashMap<(RestFamily, &str), Vec<&String>> = HashMap::new();
        for (key, circuit) in &self.pins {
            if let Ok(Endpoint {
                target: Target::Local { kind, .. },
                ..
            }) = Endpoint::parse(key)
            {
                by_circuit
                    .entry((RestFamily::for_kind(kind), circuit.as_str()))
                    .or_default()
                    .push(key);
            }
        }

        let mut updated = 0;
        for point in &points {
            let Some(family) = RestFamily::from_dev(&point.dev) else {
                continue;
            };
            let Some(keys) = by_circuit.get(&(family, point.circuit.as_str())) else {
                continue;
            };
            for key in keys {
                if let Some(value) = point.value {
                    self.local_values.insert((*key).clone(), value);
                }
                if let Some(counter) = point.counter {
                    self.local_counters.insert((*key).clone(), counter);
                }
                self.diagnostics.last_errors.remove(key.as_str());
                updated += 1;
            }
        }
        debug!(points = points.len(), updated, "Local snapshot applied");
        Ok(updated)
    }

    /// Re-arm the hardware watchdog of the REST module.
    ///
    /// # Errors
    ///
    /// Non-transport errors only.
    pub fn kick_watchdog(&mut self, circuit: &str, timeout: Duration) -> BasResult<()> {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let body = json!({ "value": 1, "timeout": millis });
        self.local_post(&format!("wd{circuit}"), RestFamily::Watchdog, circuit, &body)
            .map(|_| ())
    }

    /// Apply new configuration.
    ///
    /// Handles whose interface settings changed are dropped and their cache
    /// entries marked stale. Returns the ids of the affected interfaces.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::Config`] without changing anything if the new
    /// configuration is rejected.
    pub fn reconfigure(&mut self, config: BasConfig) -> BasResult<Vec<u8>> {
        config.validate().map_err(|e| config_error(&e))?;
        let pins = pin_table(&config)?;
        let analog = analog_table(&config)?;

        let mut affected = self.pool.reconfigure(&config.interfaces, &config.local);
        for old in &self.config.interfaces {
            if config.interface(old.id).is_none() && !affected.contains(&old.id) {
                affected.push(old.id);
            }
        }
        affected.sort_unstable();
        for id in &affected {
            self.cache.mark_interface_stale(*id);
        }

        self.local_values.retain(|key, _| pins.contains_key(key));
        self.local_counters.retain(|key, _| pins.contains_key(key));
        self.pins = pins;
        self.analog = analog;
        self.config = config;

        info!(
            interfaces = self.config.interfaces.len(),
            local_pins = self.pins.len(),
            affected = ?affected,
            "Configuration applied"
        );
        Ok(affected)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("phase", &self.phase.phase())
            .field("pending", &self.batch.len())
            .field("cached_groups", &self.cache.len())
            .field("open_transports", &self.pool.open_count())
            .finish_non_exhaustive()
    }
}
