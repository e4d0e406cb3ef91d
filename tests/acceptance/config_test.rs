//! Configuration loading and reconfiguration acceptance tests.

use super::common::controller_with;
use bas_common::config::BasConfig;
use bas_common::error::BasError;
use bas_fieldbus::RestFamily;
use bas_runtime::{CycleDriver, Plugin};
use std::io::Write;
use std::time::Duration;

const SITE: &str = r#"
cycle_time = "2ms"

[local]
base_url = "http://127.0.0.1:8080"
timeout = "1s"

[local.pins]
DI1 = "1_01"
RO1 = "2_01"

[[interfaces]]
id = 0
kind = "tcp"
address = "sim:502"

[analog."U0:ID2:FC4:R0:AI0"]
native_min = 0
native_max = 4095
min = 0.0
max = 10.0

[monitor]
points = ["DI1", "U0:ID2:FC4:R0:AI0"]
"#;

fn write_site(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn controller_builds_from_config_file() {
    let file = write_site(SITE);
    let config = BasConfig::from_file(file.path()).unwrap();
    assert_eq!(config.cycle_time, Duration::from_millis(2));
    assert_eq!(config.monitor.points.len(), 2);

    let (mut c, sim) = controller_with(config);
    sim.local().set_value(RestFamily::DigitalInput, "1_01", 1.0);
    sim.bus().set_input(0, 2, 0, 4095);

    assert!(c.digital_read("DI1").unwrap());
    let read = c.analog_read_deferred("U0:ID2:FC4:R0:AI0").unwrap();
    let report = c.flush().unwrap();
    assert!((read.resolve(&report).value - 10.0).abs() < f64::EPSILON);
}

#[test]
fn invalid_files_are_rejected() {
    let duplicate = write_site(
        r#"
        [[interfaces]]
        id = 1
        address = "a:502"

        [[interfaces]]
        id = 1
        address = "b:502"
        "#,
    );
    assert!(BasConfig::from_file(duplicate.path()).is_err());

    let garbage = write_site("cycle_time = [");
    assert!(BasConfig::from_file(garbage.path()).is_err());
}

#[test]
fn reconfigure_rebinds_pins_and_interfaces() {
    let (mut c, sim) = controller_with(BasConfig::from_toml(SITE).unwrap());
    c.digital_write("U0:ID1:FC15:R0:RO0", true).unwrap();
    c.flush().unwrap();
    assert_eq!(c.pool().open_count(), 1);

    let mut next = BasConfig::from_toml(SITE).unwrap();
    next.interfaces[0].address = Some("sim:1502".into());
    next.local.pins.insert("DI2".into(), "1_02".into());
    next.local.pins.remove("RO1");

    let affected = c.reconfigure(next).unwrap();
    assert_eq!(affected, vec![0]);
    assert_eq!(c.digital_write("RO1", true), Err(BasError::UnknownPin("RO1".into())));

    sim.local().set_value(RestFamily::DigitalInput, "1_02", 1.0);
    assert!(c.digital_read("DI2").unwrap());

    // The interface is reopened on demand with the new settings
    c.digital_write("U0:ID1:FC15:R0:RO0", false).unwrap();
    c.flush().unwrap();
    assert_eq!(sim.open_count(0), 2);
}

#[test]
fn rejected_reconfiguration_keeps_previous_state() {
    let (mut c, _) = controller_with(BasConfig::from_toml(SITE).unwrap());
    let mut bad = BasConfig::from_toml(SITE).unwrap();
    bad.analog.insert("NOT A PIN".into(), Default::default());

    assert!(matches!(c.reconfigure(bad), Err(BasError::Config(_))));
    assert_eq!(c.config().monitor.points.len(), 2);
    assert!(c.digital_write("RO1", true).is_ok());
}

struct Toggle {
    on: bool,
}

impl Plugin for Toggle {
    fn name(&self) -> &str {
        "toggle"
    }

    fn update(
        &mut self,
        controller: &mut bas_runtime::Controller,
    ) -> bas_common::error::BasResult<()> {
        self.on = !self.on;
        controller.digital_write("RO1", self.on)?;
        controller.digital_write("U0:ID1:FC15:R0:RO0", self.on)
    }
}

#[test]
fn driver_runs_configured_site() {
    let config = BasConfig::from_toml(SITE).unwrap();
    let (controller, sim) = controller_with(config.clone());
    let mut driver = CycleDriver::new(controller, &config);
    driver.add_plugin(Box::new(Toggle { on: false }));

    driver.run_for(3).unwrap();
    assert_eq!(driver.cycle_count(), 3);
    assert_eq!(driver.controller().completed_cycles(), 3);
    assert_eq!(sim.bus().transaction_count(), 3);
    assert!(sim.bus().coil(0, 1, 0));
    assert_eq!(sim.local().value(RestFamily::Relay, "2_01"), Some(1.0));
}

#[test]
fn shipped_default_config_is_valid() {
    let config = BasConfig::from_toml(include_str!("../../config/default.toml")).unwrap();
    assert_eq!(config.interfaces.len(), 2);
    let (c, _) = controller_with(config);
    assert_eq!(c.config().monitor.points.len(), 4);
}
