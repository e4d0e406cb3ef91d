//! Analog scaling acceptance tests.

use super::common::controller;
use bas_fieldbus::RestFamily;

#[test]
fn local_adc_reading_scales_to_volts() {
    let (mut c, sim) = controller();
    sim.local().set_value(RestFamily::AnalogInput, "1_01", 2048.0);

    let reading = c.analog_read("AI1").unwrap();
    assert!((reading.value - 5.0).abs() < 0.01, "got {}", reading.value);
    assert!(reading.min.abs() < f64::EPSILON);
    assert!((reading.max - 10.0).abs() < f64::EPSILON);
}

#[test]
fn out_of_range_reading_is_clamped() {
    let (mut c, sim) = controller();
    sim.local().set_value(RestFamily::AnalogInput, "1_01", 5000.0);
    let reading = c.analog_read("AI1").unwrap();
    assert!((reading.value - 10.0).abs() < f64::EPSILON);
}

#[test]
fn remote_input_register_scales_at_flush() {
    let (mut c, sim) = controller();
    sim.bus().set_input(0, 5, 0, 2048);

    let read = c.analog_read_deferred("U0:ID5:FC4:R0:AI0").unwrap();
    assert!(read.is_pending());
    let report = c.flush().unwrap();
    let reading = read.resolve(&report);
    assert!((reading.value - 5.0).abs() < 0.01, "got {}", reading.value);

    sim.bus().set_input(0, 5, 0, u16::MAX);
    let read = c.analog_read_deferred("U0:ID5:FC4:R0:AI0").unwrap();
    let report = c.flush().unwrap();
    assert!((read.resolve(&report).value - 10.0).abs() < f64::EPSILON);
}

#[test]
fn remote_analog_write_uses_native_units() {
    let mut config = super::common::site_config();
    config
        .analog
        .insert("U0:ID6:FC16:R20:AO0".into(), super::common::adc_range());
    let (mut c, sim) = super::common::controller_with(config);

    c.analog_write("U0:ID6:FC16:R20:AO0", 2.5).unwrap();
    c.flush().unwrap();
    assert_eq!(sim.bus().holding(0, 6, 20), 1024);
}
