//! Shared fixtures for acceptance tests.

#![allow(dead_code)]

use bas_common::config::{AnalogRange, BasConfig, InterfaceConfig};
use bas_fieldbus::simulated::{SimulatedTransports, Transaction};
use bas_runtime::Controller;
use std::sync::Arc;
use std::time::Duration;

/// ADC window used by the analog scenarios.
pub fn adc_range() -> AnalogRange {
    AnalogRange {
        native_min: 0.0,
        native_max: 4095.0,
        min: 0.0,
        max: 10.0,
    }
}

/// Site with a few local pins and one simulated Modbus interface.
pub fn site_config() -> BasConfig {
    let mut config = BasConfig {
        cycle_time: Duration::from_millis(1),
        ..BasConfig::default()
    };
    for (name, circuit) in [("DI1", "1_01"), ("DO2", "1_02"), ("RO1", "2_01"), ("AI1", "1_01")] {
        config.local.pins.insert(name.into(), circuit.into());
    }
    config.interfaces.push(InterfaceConfig {
        id: 0,
        address: Some("sim:502".into()),
        ..InterfaceConfig::default()
    });
    config.analog.insert("AI1".into(), adc_range());
    config.analog.insert("U0:ID5:FC4:R0:AI0".into(), adc_range());
    config
}

/// Controller over a fresh simulated bus.
pub fn controller() -> (Controller, SimulatedTransports) {
    controller_with(site_config())
}

/// Controller for `config` over a fresh simulated bus.
pub fn controller_with(config: BasConfig) -> (Controller, SimulatedTransports) {
    let sim = SimulatedTransports::default();
    let controller = Controller::new(config, Arc::new(sim.clone())).expect("controller");
    (controller, sim)
}

/// Transactions logged since the last call, clearing the log.
pub fn take_transactions(sim: &SimulatedTransports) -> Vec<Transaction> {
    let log = sim.bus().transactions();
    sim.bus().clear_log();
    log
}
