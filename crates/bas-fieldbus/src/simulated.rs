//! In-memory stand-ins for Modbus devices and the on-board REST module.
//!
//! Used by the daemon's `--simulated` mode and by tests that need to count
//! physical transactions or inject failures.

use crate::local::{LocalIo, LocalPoint, RestFamily};
use crate::modbus::{pack_bits, Request};
use crate::pool::TransportFactory;
use crate::ModbusTransport;
use bas_common::config::{InterfaceConfig, LocalConfig};
use bas_common::error::{BasError, BasResult};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Data tables of one simulated device.
#[derive(Debug, Default, Clone)]
struct Device {
    coils: BTreeMap<u16, bool>,
    discrete_inputs: BTreeMap<u16, bool>,
    holding: BTreeMap<u16, u16>,
    input: BTreeMap<u16, u16>,
}

/// One request as seen on the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Interface the request went out on.
    pub interface_id: u8,
    /// Wire unit id.
    pub unit_id: u8,
    /// Decoded request.
    pub request: Request,
}

#[derive(Debug, Default)]
struct BusState {
    devices: HashMap<(u8, u8), Device>,
    log: Vec<Transaction>,
    failing: HashSet<u8>,
}

/// Shared simulated Modbus network.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// Create an empty bus; unknown devices read as zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_device<R>(&self, interface_id: u8, unit_id: u8, f: impl FnOnce(&mut Device) -> R) -> R {
        let mut state = lock(&self.state);
        f(state.devices.entry((interface_id, unit_id)).or_default())
    }

    /// Set a coil.
    pub fn set_coil(&self, interface_id: u8, unit_id: u8, address: u16, value: bool) {
        self.with_device(interface_id, unit_id, |d| d.coils.insert(address, value));
    }

    /// Current coil state.
    #[must_use]
    pub fn coil(&self, interface_id: u8, unit_id: u8, address: u16) -> bool {
        self.with_device(interface_id, unit_id, |d| {
            d.coils.get(&address).copied().unwrap_or(false)
        })
    }

    /// Set a discrete input.
    pub fn set_discrete_input(&self, interface_id: u8, unit_id: u8, address: u16, value: bool) {
        self.with_device(interface_id, unit_id, |d| {
            d.discrete_inputs.insert(address, value)
        });
    }

    /// Set a holding register.
    pub fn set_holding(&self, interface_id: u8, unit_id: u8, address: u16, value: u16) {
        self.with_device(interface_id, unit_id, |d| d.holding.insert(address, value));
    }

    /// Current holding register value.
    #[must_use]
    pub fn holding(&self, interface_id: u8, unit_id: u8, address: u16) -> u16 {
        self.with_device(interface_id, unit_id, |d| {
            d.holding.get(&address).copied().unwrap_or(0)
        })
    }

    /// Set an input register.
    pub fn set_input(&self, interface_id: u8, unit_id: u8, address: u16, value: u16) {
        self.with_device(interface_id, unit_id, |d| d.input.insert(address, value));
    }

    /// Make every transaction on `interface_id` time out (or stop doing so).
    pub fn set_failing(&self, interface_id: u8, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing.insert(interface_id);
        } else {
            state.failing.remove(&interface_id);
        }
    }

    /// All transactions seen so far, in order.
    #[must_use]
    pub fn transactions(&self) -> Vec<Transaction> {
        lock(&self.state).log.clone()
    }

    /// Number of transactions seen so far.
    #[must_use]
    pub fn transaction_count(&self) -> usize {
        lock(&self.state).log.len()
    }

    /// Forget logged transactions.
    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    /// Client transport attached to one interface of this bus.
    #[must_use]
    pub fn transport(&self, interface_id: u8) -> SimulatedTransport {
        SimulatedTransport {
            bus: self.clone(),
            interface_id,
        }
    }

    fn serve(&self, interface_id: u8, unit_id: u8, request: &Request) -> BasResult<Vec<u8>> {
        let mut state = lock(&self.state);
        state.log.push(Transaction {
            interface_id,
            unit_id,
            request: request.clone(),
        });
        if state.failing.contains(&interface_id) {
            return Err(BasError::TransportTimeout(format!(
                "simulated interface U{interface_id} not responding"
            )));
        }

        let device = state.devices.entry((interface_id, unit_id)).or_default();
        let function = request.function_code();
        let mut pdu = vec![function];

        let read_bits = |table: &BTreeMap<u16, bool>, address: u16, quantity: u16| {
            let bits: Vec<bool> = (0..quantity)
                .map(|i| {
                    table
                        .get(&address.wrapping_add(i))
                        .copied()
                        .unwrap_or(false)
                })
                .collect();
            pack_bits(&bits)
        };
        let read_words = |table: &BTreeMap<u16, u16>, address: u16, quantity: u16| {
            (0..quantity)
                .flat_map(|i| {
                    table
                        .get(&address.wrapping_add(i))
                        .copied()
                        .unwrap_or(0)
                        .to_be_bytes()
                })
                .collect::<Vec<u8>>()
        };

        #[allow(clippy::cast_possible_truncation)]
        match request {
            Request::ReadCoils { address, quantity } => {
                let data = read_bits(&device.coils, *address, *quantity);
                pdu.push(data.len() as u8);
                pdu.extend(data);
            }
            Request::ReadDiscreteInputs { address, quantity } => {
                let data = read_bits(&device.discrete_inputs, *address, *quantity);
                pdu.push(data.len() as u8);
                pdu.extend(data);
            }
            Request::ReadHoldingRegisters { address, quantity } => {
                let data = read_words(&device.holding, *address, *quantity);
                pdu.push(data.len() as u8);
                pdu.extend(data);
            }
            Request::ReadInputRegisters { address, quantity } => {
                let data = read_words(&device.input, *address, *quantity);
                pdu.push(data.len() as u8);
                pdu.extend(data);
            }
            Request::WriteSingleCoil { address, value } => {
                device.coils.insert(*address, *value);
                return request.encode();
            }
            Request::WriteSingleRegister { address, value } => {
                device.holding.insert(*address, *value);
                return request.encode();
            }
            Request::WriteMultipleCoils { address, values } => {
                for (i, value) in values.iter().enumerate() {
                    device.coils.insert(address.wrapping_add(i as u16), *value);
                }
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
            }
            Request::WriteMultipleRegisters { address, values } => {
                for (i, value) in values.iter().enumerate() {
                    device.holding.insert(address.wrapping_add(i as u16), *value);
                }
                pdu.extend_from_slice(&address.to_be_bytes());
                pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
            }
            Request::Raw { function, .. } => {
                // Illegal function
                return Ok(vec![function | 0x80, 0x01]);
            }
        }
        Ok(pdu)
    }
}

/// Client side of one simulated interface.
#[derive(Debug, Clone)]
pub struct SimulatedTransport {
    bus: SimulatedBus,
    interface_id: u8,
}

impl ModbusTransport for SimulatedTransport {
    fn transact(&mut self, unit_id: u8, pdu: &[u8]) -> BasResult<Vec<u8>> {
        let request = Request::decode(pdu)?;
        trace!(interface = self.interface_id, unit_id, ?request, "Simulated transaction");
        self.bus.serve(self.interface_id, unit_id, &request)
    }

    fn describe(&self) -> String {
        format!("sim://U{}", self.interface_id)
    }
}

/// One request seen by the simulated REST module.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalRequest {
    /// `GET /rest/<family>/<circuit>`.
    Get(RestFamily, String),
    /// `POST /rest/<family>/<circuit>` with a JSON body.
    Set(RestFamily, String, Value),
    /// `GET /rest/all`.
    Snapshot,
}

#[derive(Debug, Default)]
struct LocalState {
    points: BTreeMap<(RestFamily, String), LocalPoint>,
    requests: Vec<LocalRequest>,
    offline: bool,
}

/// Shared simulated on-board I/O module.
#[derive(Debug, Clone, Default)]
pub struct SimulatedLocal {
    state: Arc<Mutex<LocalState>>,
}

impl SimulatedLocal {
    /// Create a module with no points; unknown points read as zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value of a point.
    pub fn set_value(&self, family: RestFamily, circuit: &str, value: f64) {
        let mut state = lock(&self.state);
        let point = Self::point_mut(&mut state, family, circuit);
        point.value = Some(value);
    }

    /// Set the pulse counter of a digital input.
    pub fn set_counter(&self, circuit: &str, counter: i64) {
        let mut state = lock(&self.state);
        let point = Self::point_mut(&mut state, RestFamily::DigitalInput, circuit);
        point.counter = Some(counter);
    }

    /// Current value of a point.
    #[must_use]
    pub fn value(&self, family: RestFamily, circuit: &str) -> Option<f64> {
        lock(&self.state)
            .points
            .get(&(family, circuit.to_string()))
            .and_then(|p| p.value)
    }

    /// Make every request fail (or stop doing so).
    pub fn set_offline(&self, offline: bool) {
        lock(&self.state).offline = offline;
    }

    /// Requests seen so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<LocalRequest> {
        lock(&self.state).requests.clone()
    }

    fn point_mut<'a>(
        state: &'a mut LocalState,
        family: RestFamily,
        circuit: &str,
    ) -> &'a mut LocalPoint {
        state
            .points
            .entry((family, circuit.to_string()))
            .or_insert_with(|| LocalPoint {
                dev: family.path().to_string(),
                circuit: circuit.to_string(),
                ..LocalPoint::default()
            })
    }

    fn record(&self, request: LocalRequest) -> BasResult<MutexGuard<'_, LocalState>> {
        let mut state = lock(&self.state);
        state.requests.push(request);
        if state.offline {
            return Err(BasError::TransportTimeout("simulated local I/O offline".into()));
        }
        Ok(state)
    }
}

impl LocalIo for SimulatedLocal {
    fn get(&mut self, family: RestFamily, circuit: &str) -> BasResult<LocalPoint> {
        let mut state = self.record(LocalRequest::Get(family, circuit.to_string()))?;
        Ok(Self::point_mut(&mut state, family, circuit).clone())
    }

    fn set(&mut self, family: RestFamily, circuit: &str, body: &Value) -> BasResult<()> {
        let mut state = self.record(LocalRequest::Set(family, circuit.to_string(), body.clone()))?;
        let point = Self::point_mut(&mut state, family, circuit);
        if let Some(value) = body.get("value") {
            point.value = value
                .as_f64()
                .or_else(|| value.as_bool().map(|b| if b { 1.0 } else { 0.0 }));
        }
        if let Some(counter) = body.get("counter").and_then(Value::as_i64) {
            point.counter = Some(counter);
        }
        Ok(())
    }

    fn snapshot(&mut self) -> BasResult<Vec<LocalPoint>> {
        let state = self.record(LocalRequest::Snapshot)?;
        Ok(state.points.values().cloned().collect())
    }

    fn describe(&self) -> String {
        "sim://local".into()
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    opens: HashMap<u8, usize>,
    refused: HashSet<u8>,
}

/// Transport factory that hands out simulated transports.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransports {
    bus: SimulatedBus,
    local: SimulatedLocal,
    state: Arc<Mutex<FactoryState>>,
}

impl SimulatedTransports {
    /// Factory over the given bus and REST module.
    #[must_use]
    pub fn new(bus: SimulatedBus, local: SimulatedLocal) -> Self {
        Self {
            bus,
            local,
            state: Arc::default(),
        }
    }

    /// The simulated bus.
    #[must_use]
    pub fn bus(&self) -> &SimulatedBus {
        &self.bus
    }

    /// The simulated REST module.
    #[must_use]
    pub fn local(&self) -> &SimulatedLocal {
        &self.local
    }

    /// How many times a transport was opened for `interface_id`.
    #[must_use]
    pub fn open_count(&self, interface_id: u8) -> usize {
        lock(&self.state).opens.get(&interface_id).copied().unwrap_or(0)
    }

    /// Make opening `interface_id` fail (or stop doing so).
    pub fn refuse_open(&self, interface_id: u8, refuse: bool) {
        let mut state = lock(&self.state);
        if refuse {
            state.refused.insert(interface_id);
        } else {
            state.refused.remove(&interface_id);
        }
    }
}

impl TransportFactory for SimulatedTransports {
    fn open_modbus(&self, config: &InterfaceConfig) -> BasResult<Box<dyn ModbusTransport>> {
        let mut state = lock(&self.state);
        *state.opens.entry(config.id).or_default() += 1;
        if state.refused.contains(&config.id) {
            return Err(BasError::TransportError(format!(
                "simulated interface U{} refused to open",
                config.id
            )));
        }
        Ok(Box::new(self.bus.transport(config.id)))
    }

    fn open_local(&self, _config: &LocalConfig) -> BasResult<Box<dyn LocalIo>> {
        Ok(Box::new(self.local.clone()))
    }
}
