//! Dispatch acceptance tests: grammar, coalescing, demultiplexing,
//! polarity and failure masking.

use super::common::{controller, take_transactions};
use bas_common::error::BasError;
use bas_fieldbus::{Endpoint, FunctionCode, Request, RestFamily};
use bas_runtime::GroupKey;

#[test]
fn address_round_trip() {
    let names = [
        "DI1",
        "!RO3",
        "LED2",
        "AO1",
        "U0:ID2:FC15:R0:RO2",
        "!U1:ID3:FC2:R100:DI7",
        "U4:ID1:FC16:R10:DO3",
        "U0:ID5:FC4:R0:AI0",
        "off",
        "!off",
    ];
    for name in names {
        let endpoint = Endpoint::parse(name).unwrap();
        let reparsed = Endpoint::parse(&endpoint.to_string()).unwrap();
        assert_eq!(reparsed.target, endpoint.target, "{name}");
        if !endpoint.is_disabled() {
            assert_eq!(reparsed.polarity, endpoint.polarity, "{name}");
        }
    }
}

#[test]
fn disabled_points_touch_nothing() {
    let (mut c, sim) = controller();
    for name in ["off", "!off"] {
        assert!(!c.digital_read(name).unwrap());
        c.digital_write(name, true).unwrap();
        c.analog_write(name, 7.5).unwrap();
        assert!(c.analog_read(name).unwrap().value.abs() < f64::EPSILON);
    }
    let report = c.flush().unwrap();

    assert_eq!(report.transactions, 0);
    assert_eq!(sim.bus().transaction_count(), 0);
    assert!(sim.local().requests().is_empty());
}

#[test]
fn remote_write_then_read_round_trip() {
    let (mut c, sim) = controller();
    c.digital_write("U0:ID1:FC15:R0:RO0", true).unwrap();
    c.flush().unwrap();
    assert!(sim.bus().coil(0, 1, 0));

    let read = c.digital_read_deferred("U0:ID1:FC15:R0:RO0").unwrap();
    let report = c.flush().unwrap();
    assert!(read.resolve(&report));
}

#[test]
fn local_write_then_read_round_trip() {
    let (mut c, sim) = controller();
    c.digital_write("DO2", true).unwrap();
    assert_eq!(sim.local().value(RestFamily::DigitalOutput, "1_02"), Some(1.0));
    assert!(c.digital_read("DO2").unwrap());
}

#[test]
fn coil_writes_coalesce_into_one_transaction() {
    let (mut c, sim) = controller();
    for bit in 0..8 {
        c.digital_write(&format!("U0:ID1:FC15:R0:RO{bit}"), bit % 2 == 0)
            .unwrap();
    }
    // Last write wins
    c.digital_write("U0:ID1:FC15:R0:RO7", true).unwrap();
    c.flush().unwrap();

    let log = take_transactions(&sim);
    assert_eq!(log.len(), 1);
    assert_eq!(
        log[0].request,
        Request::WriteMultipleCoils {
            address: 0,
            values: vec![true, false, true, false, true, false, true, true],
        }
    );
}

#[test]
fn register_bit_writes_merge_over_cached_word() {
    let (mut c, sim) = controller();
    sim.bus().set_holding(0, 3, 10, 0b1000_0000);

    // Seed the cache with the device word
    c.digital_read_deferred("U0:ID3:FC16:R10:DO7").unwrap();
    c.flush().unwrap();
    take_transactions(&sim);

    c.digital_write("U0:ID3:FC16:R10:DO0", true).unwrap();
    c.digital_write("U0:ID3:FC16:R10:DO3", true).unwrap();
    c.digital_write("U0:ID3:FC16:R10:DO0", false).unwrap();
    c.flush().unwrap();

    let log = take_transactions(&sim);
    assert_eq!(log.len(), 1);
    assert_eq!(
        log[0].request,
        Request::WriteMultipleRegisters {
            address: 10,
            values: vec![0b1000_1000],
        }
    );
    assert_eq!(sim.bus().holding(0, 3, 10), 0b1000_1000);
}

#[test]
fn reads_demultiplex_from_one_transaction() {
    let (mut c, sim) = controller();
    for (address, value) in [(0, true), (1, false), (2, true), (3, false), (4, true)] {
        sim.bus().set_discrete_input(0, 1, address, value);
    }

    let reads: Vec<_> = ["DI0", "DI1", "DI4", "DI0"]
        .iter()
        .map(|bit| {
            c.digital_read_deferred(&format!("U0:ID1:FC2:R0:{bit}"))
                .unwrap()
        })
        .collect();
    let report = c.flush().unwrap();

    let log = take_transactions(&sim);
    assert_eq!(log.len(), 1);
    assert_eq!(
        log[0].request,
        Request::ReadDiscreteInputs {
            address: 0,
            quantity: 5,
        }
    );
    let values: Vec<bool> = reads.iter().map(|r| r.resolve(&report)).collect();
    assert_eq!(values, vec![true, false, true, true]);
}

#[test]
fn reads_and_writes_are_counted_separately() {
    let (mut c, sim) = controller();
    c.digital_write("U0:ID1:FC15:R0:RO0", true).unwrap();
    c.digital_write("U0:ID1:FC15:R0:RO1", true).unwrap();
    let first = c.digital_read_deferred("U0:ID1:FC15:R0:RO0").unwrap();
    let second = c.digital_read_deferred("U0:ID1:FC15:R0:RO1").unwrap();
    let report = c.flush().unwrap();

    let log = take_transactions(&sim);
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].request.function_code(), FunctionCode::WriteMultipleCoils.code());
    assert_eq!(log[1].request.function_code(), FunctionCode::ReadCoils.code());
    assert!(first.resolve(&report));
    assert!(second.resolve(&report));
}

#[test]
fn inverted_local_write_matches_plain_write() {
    let (mut c, sim) = controller();
    c.digital_write("!DO2", true).unwrap();
    assert_eq!(sim.local().value(RestFamily::DigitalOutput, "1_02"), Some(0.0));
    c.digital_write("DO2", false).unwrap();
    assert_eq!(sim.local().value(RestFamily::DigitalOutput, "1_02"), Some(0.0));

    c.digital_write("!DO2", false).unwrap();
    assert_eq!(sim.local().value(RestFamily::DigitalOutput, "1_02"), Some(1.0));
    assert!(c.digital_read("DO2").unwrap());
    assert!(!c.digital_read("!DO2").unwrap());
}

#[test]
fn inverted_remote_write_matches_plain_write() {
    let (mut plain, plain_sim) = controller();
    plain.digital_write("U0:ID1:FC15:R0:RO0", false).unwrap();
    plain.flush().unwrap();

    let (mut inverted, inverted_sim) = controller();
    inverted.digital_write("!U0:ID1:FC15:R0:RO0", true).unwrap();
    inverted.flush().unwrap();

    assert_eq!(plain_sim.bus().transactions(), inverted_sim.bus().transactions());

    inverted_sim.bus().set_discrete_input(0, 1, 0, true);
    let read = inverted.digital_read_deferred("!U0:ID1:FC2:R0:DI0").unwrap();
    let report = inverted.flush().unwrap();
    assert!(!read.resolve(&report));
}

#[test]
fn failed_group_reports_cached_values() {
    let (mut c, sim) = controller();
    sim.bus().set_discrete_input(0, 1, 0, true);
    let name = "U0:ID1:FC2:R0:DI0";
    let key = GroupKey {
        interface_id: 0,
        device_id: 1,
        function: FunctionCode::ReadDiscreteInputs,
        base_register: 0,
    };

    c.digital_read_deferred(name).unwrap();
    c.flush().unwrap();
    assert_eq!(c.cache().bit(&key, 0), Some(true));

    sim.bus().set_failing(0, true);
    sim.bus().set_discrete_input(0, 1, 0, false);
    let read = c.digital_read_deferred(name).unwrap();
    let report = c.flush().unwrap();

    assert!(read.resolve(&report));
    assert!(read.is_stale(&report));
    assert_eq!(report.failures.len(), 1);
    assert_eq!(c.cache().bit(&key, 0), Some(true));
    assert!(c.cache().is_stale(&key));
    assert!(c.diagnostics().has_error(name));

    // Recovery clears the stale flag and the error mirror
    sim.bus().set_failing(0, false);
    let read = c.digital_read_deferred(name).unwrap();
    let report = c.flush().unwrap();
    assert!(!read.resolve(&report));
    assert!(!c.cache().is_stale(&key));
    assert!(!c.diagnostics().has_error(name));
}

#[test]
fn failed_writes_do_not_raise() {
    let (mut c, sim) = controller();
    sim.bus().set_failing(0, true);
    assert!(c.digital_write("U0:ID1:FC15:R0:RO0", true).is_ok());
    let report = c.flush().unwrap();
    assert!(!report.is_clean());
    assert_eq!(c.diagnostics().malfunctions, 1);
}

#[test]
fn merged_coil_payload_preserves_untouched_bits() {
    let (mut c, sim) = controller();
    sim.bus().set_coil(0, 2, 2, true);

    // A previous cycle observed RO2
    let seen = c.digital_read_deferred("U0:ID2:FC15:R0:RO2").unwrap();
    let report = c.flush().unwrap();
    assert!(seen.resolve(&report));
    take_transactions(&sim);

    c.digital_write("U0:ID2:FC15:R0:RO0", true).unwrap();
    c.digital_write("U0:ID2:FC15:R0:RO1", false).unwrap();
    c.flush().unwrap();

    let log = take_transactions(&sim);
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].unit_id, 2);
    assert_eq!(
        log[0].request,
        Request::WriteMultipleCoils {
            address: 0,
            values: vec![true, false, true],
        }
    );
    assert!(sim.bus().coil(0, 2, 2));
}

#[test]
fn name_errors_surface_immediately() {
    let (mut c, sim) = controller();
    assert_eq!(c.digital_read(""), Err(BasError::InvalidName));
    assert!(matches!(c.digital_write("QQ4", true), Err(BasError::InvalidAddress { .. })));
    assert_eq!(c.digital_read("DI9"), Err(BasError::UnknownPin("DI9".into())));
    assert_eq!(
        c.digital_write("U0:ID1:FC2:R0:DI0", true),
        Err(BasError::ReadOnly("U0:ID1:FC2:R0:DI0".into()))
    );
    assert_eq!(c.pending_operations(), 0);
    assert_eq!(sim.bus().transaction_count(), 0);
}

#[test]
fn coil_write_leaves_unobserved_coils_alone() {
    let (mut c, sim) = controller();
    sim.bus().set_coil(0, 2, 0, true);

    c.digital_write("U0:ID2:FC15:R0:RO3", true).unwrap();
    let report = c.flush().unwrap();

    assert!(report.is_clean());
    let log = take_transactions(&sim);
    assert_eq!(
        log[0].request,
        Request::WriteMultipleCoils {
            address: 3,
            values: vec![true],
        }
    );
    assert!(sim.bus().coil(0, 2, 0));
    assert!(sim.bus().coil(0, 2, 3));
}

#[test]
fn reads_at_both_ends_of_the_address_space() {
    let (mut c, sim) = controller();
    sim.bus().set_coil(0, 2, u16::MAX, true);

    let low = c.digital_read_deferred("U0:ID2:FC1:R0:DO0").unwrap();
    let high = c.digital_read_deferred("U0:ID2:FC1:R0:DO65535").unwrap();
    let report = c.flush().unwrap();

    assert!(report.is_clean());
    assert_eq!(report.transactions, 2);
    assert!(!low.resolve(&report));
    assert!(high.resolve(&report));
}

#[test]
fn far_analog_write_lands_every_cycle() {
    let (mut c, sim) = controller();
    for _ in 0..3 {
        c.analog_write("U0:ID2:FC16:R0:AO200", 5.0).unwrap();
        let report = c.flush().unwrap();
        assert!(report.is_clean(), "{:?}", report.failures);
    }
    assert_eq!(sim.bus().holding(0, 2, 200), 5);
    assert_eq!(c.diagnostics().malfunctions, 0);
}

#[test]
fn write_after_wide_read_is_accepted() {
    let (mut c, sim) = controller();
    c.analog_read_deferred("U0:ID2:FC16:R0:AO0").unwrap();
    c.analog_read_deferred("U0:ID2:FC16:R0:AO124").unwrap();
    assert!(c.flush().unwrap().is_clean());

    c.analog_write("U0:ID2:FC16:R0:AO0", 3.0).unwrap();
    let report = c.flush().unwrap();
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(sim.bus().holding(0, 2, 0), 3);
}

#[test]
fn wide_input_span_is_not_a_device_fault() {
    let (mut c, sim) = controller();
    sim.bus().set_input(0, 2, 130, 9);

    let near = c.analog_read_deferred("U0:ID2:FC4:R0:AI0").unwrap();
    let far = c.analog_read_deferred("U0:ID2:FC4:R0:AI130").unwrap();
    let report = c.flush().unwrap();

    assert!(report.is_clean());
    assert_eq!(report.transactions, 2);
    assert!(near.resolve(&report).value.abs() < f64::EPSILON);
    assert!((far.resolve(&report).value - 9.0).abs() < f64::EPSILON);
}
