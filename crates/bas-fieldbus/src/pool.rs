//! Lazily created transport handles, one per interface.
//!
//! Handles are opened on first use and kept until [`TransportPool::reset`]
//! or a configuration change for that interface. Opening is serialized per
//! interface id so concurrent callers never construct the same handle
//! twice; a failed open is not cached.

use crate::local::{LocalIo, RestClient};
use crate::modbus::TcpTransport;
use crate::rtu::{RtuOverTcpTransport, RtuTransport};
use crate::ModbusTransport;
use bas_common::config::{InterfaceConfig, LocalConfig, TransportKind};
use bas_common::error::{BasError, BasResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Shared Modbus handle. Locking it serializes traffic on the interface.
pub type ModbusHandle = Arc<Mutex<Box<dyn ModbusTransport>>>;

/// Shared local REST handle.
pub type LocalHandle = Arc<Mutex<Box<dyn LocalIo>>>;

type Slot<T> = Arc<Mutex<Option<T>>>;

/// Constructs transports from configuration.
pub trait TransportFactory: Send + Sync {
    /// Open a Modbus transport for an interface.
    ///
    /// # Errors
    ///
    /// Returns an error if the port or connection cannot be opened.
    fn open_modbus(&self, config: &InterfaceConfig) -> BasResult<Box<dyn ModbusTransport>>;

    /// Open the on-board REST client.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built.
    fn open_local(&self, config: &LocalConfig) -> BasResult<Box<dyn LocalIo>>;
}

/// Factory for real serial ports, sockets and HTTP clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTransports;

impl TransportFactory for SystemTransports {
    fn open_modbus(&self, config: &InterfaceConfig) -> BasResult<Box<dyn ModbusTransport>> {
        let address = || {
            config.address.as_deref().ok_or_else(|| {
                BasError::Config(format!("{} interface {} has no address", config.kind, config.id))
            })
        };
        Ok(match config.kind {
            TransportKind::Tcp => Box::new(TcpTransport::connect(address()?, config.timeout)?),
            TransportKind::Rtu => Box::new(RtuTransport::open(config)?),
            TransportKind::RtuOverTcp => {
                Box::new(RtuOverTcpTransport::connect(address()?, config.timeout)?)
            }
        })
    }

    fn open_local(&self, config: &LocalConfig) -> BasResult<Box<dyn LocalIo>> {
        Ok(Box::new(RestClient::new(config)))
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding a transport lock leaves the handle usable
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wire unit id for an endpoint device id on an interface.
#[must_use]
pub fn wire_unit_id(config: &InterfaceConfig, device_id: u8) -> u8 {
    config.unit_base.saturating_add(device_id)
}

/// Owner of every live transport handle.
pub struct TransportPool {
    factory: Arc<dyn TransportFactory>,
    interfaces: HashMap<u8, InterfaceConfig>,
    local: LocalConfig,
    modbus: Mutex<HashMap<u8, Slot<ModbusHandle>>>,
    local_slot: Slot<LocalHandle>,
}

impl TransportPool {
    /// Create an empty pool. Nothing is opened until first use.
    #[must_use]
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        interfaces: &[InterfaceConfig],
        local: &LocalConfig,
    ) -> Self {
        Self {
            factory,
            interfaces: interfaces.iter().map(|i| (i.id, i.clone())).collect(),
            local: local.clone(),
            modbus: Mutex::new(HashMap::new()),
            local_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Configuration of an interface.
    #[must_use]
    pub fn interface(&self, interface_id: u8) -> Option<&InterfaceConfig> {
        self.interfaces.get(&interface_id)
    }

    /// Return the cached handle for `interface_id`, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::Config`] for an unconfigured interface and
    /// [`BasError::TransportUnavailable`] if the handle cannot be opened.
    pub fn get_or_create(&self, interface_id: u8) -> BasResult<ModbusHandle> {
        let config = self.interfaces.get(&interface_id).ok_or_else(|| {
            BasError::Config(format!("interface U{interface_id} is not configured"))
        })?;

        let slot = {
            let mut slots = lock(&self.modbus);
            Arc::clone(slots.entry(interface_id).or_default())
        };

        let mut slot = lock(&slot);
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }

        debug!(
            interface = interface_id,
            kind = %config.kind,
            location = %config.location(),
            "Opening transport"
        );
        let transport = self.factory.open_modbus(config).map_err(|e| {
            warn!(interface = interface_id, error = %e, "Transport unavailable");
            BasError::TransportUnavailable {
                interface: format!("U{interface_id}"),
                reason: e.to_string(),
            }
        })?;
        info!(interface = interface_id, transport = %transport.describe(), "Transport opened");

        let handle: ModbusHandle = Arc::new(Mutex::new(transport));
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Run `f` with exclusive use of an interface's transport.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::get_or_create`] errors and whatever `f` returns.
    pub fn with_modbus<R>(
        &self,
        interface_id: u8,
        f: impl FnOnce(&mut dyn ModbusTransport, &InterfaceConfig) -> BasResult<R>,
    ) -> BasResult<R> {
        let handle = self.get_or_create(interface_id)?;
        let config = self.interfaces.get(&interface_id).ok_or_else(|| {
            BasError::Config(format!("interface U{interface_id} is not configured"))
        })?;
        let mut transport = lock(&handle);
        f(transport.as_mut(), config)
    }

    /// Return the on-board REST handle, opening it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`BasError::TransportUnavailable`] if the client cannot be built.
    pub fn local(&self) -> BasResult<LocalHandle> {
        let mut slot = lock(&self.local_slot);
        if let Some(handle) = slot.as_ref() {
            return Ok(Arc::clone(handle));
        }
        let client = self
            .factory
            .open_local(&self.local)
            .map_err(|e| BasError::TransportUnavailable {
                interface: self.local.base_url.clone(),
                reason: e.to_string(),
            })?;
        debug!(base_url = %client.describe(), "Local I/O client created");
        let handle: LocalHandle = Arc::new(Mutex::new(client));
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Run `f` with exclusive use of the REST client.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::local`] errors and whatever `f` returns.
    pub fn with_local<R>(&self, f: impl FnOnce(&mut dyn LocalIo) -> BasResult<R>) -> BasResult<R> {
        let handle = self.local()?;
        let mut client = lock(&handle);
        f(client.as_mut())
    }

    /// Drop the handle of one interface; the next use reopens it.
    pub fn reset(&self, interface_id: u8) {
        if lock(&self.modbus).remove(&interface_id).is_some() {
            debug!(interface = interface_id, "Transport reset");
        }
    }

    /// Whether a live handle exists for `interface_id`.
    #[must_use]
    pub fn is_open(&self, interface_id: u8) -> bool {
        lock(&self.modbus)
            .get(&interface_id)
            .is_some_and(|slot| lock(slot).is_some())
    }

    /// Number of live Modbus handles.
    #[must_use]
    pub fn open_count(&self) -> usize {
        lock(&self.modbus)
            .values()
            .filter(|slot| lock(slot).is_some())
            .count()
    }

    /// Apply new configuration, dropping handles whose settings changed.
    ///
    /// Returns the interface ids whose handles were dropped.
    pub fn reconfigure(&mut self, interfaces: &[InterfaceConfig], local: &LocalConfig) -> Vec<u8> {
        let next: HashMap<u8, InterfaceConfig> =
            interfaces.iter().map(|i| (i.id, i.clone())).collect();

        let mut dropped = Vec::new();
        {
            let mut slots = lock(&self.modbus);
            slots.retain(|id, _| {
                let keep = self.interfaces.get(id) == next.get(id);
                if !keep {
                    dropped.push(*id);
                }
                keep
            });
        }
        dropped.sort_unstable();
        for id in &dropped {
            info!(interface = id, "Interface configuration changed, transport will reopen");
        }

        if self.local != *local {
            *lock(&self.local_slot) = None;
            info!(base_url = %local.base_url, "Local I/O configuration changed");
        }

        self.interfaces = next;
        self.local = local.clone();
        dropped
    }
}
