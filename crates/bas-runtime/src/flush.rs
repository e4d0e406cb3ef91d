//! Batch flusher.
//!
//! For every group drained from the accumulator: the merged write, then a
//! read over the minimal span covering the queued reads. Each is normally a
//! single transaction; spans wider than one request allows are split, and
//! a write never carries a coil or register whose value is unknown.
//! Failures mark the group stale and answer every queued read from the
//! cache.

use crate::batch::{BatchGroup, Correlation, PendingRead, WriteValue};
use crate::cache::{GroupKey, RegisterCache, RegisterImage};
use bas_common::error::{BasError, BasResult};
use bas_fieldbus::modbus::{
    MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};
use bas_fieldbus::pool::wire_unit_id;
use bas_fieldbus::{Access, FunctionCode, ModbusTransport, Request, Response, TransportPool};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// Raw value delivered to a queued read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// Coil, discrete input or register bit.
    Bit(bool),
    /// Whole register.
    Word(u16),
}

impl Sample {
    /// Value as a boolean.
    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bit(bit) => bit,
            Self::Word(word) => word != 0,
        }
    }

    /// Value as a number.
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Bit(bit) => f64::from(u8::from(bit)),
            Self::Word(word) => f64::from(word),
        }
    }
}

/// Outcome of one queued read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Value from the response, or the cached/default value on failure.
    pub value: Sample,
    /// True when the group's transaction failed.
    pub stale: bool,
}

/// A group whose transaction failed.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupFailure {
    /// The failed group.
    pub key: GroupKey,
    /// Transport error behind the failure.
    pub error: BasError,
    /// Names served by the group.
    pub names: Vec<String>,
}

/// Result of draining one cycle's batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlushReport {
    /// Per-read outcomes.
    pub completions: BTreeMap<Correlation, Completion>,
    /// Physical transactions attempted.
    pub transactions: usize,
    /// Groups whose transaction failed.
    pub failures: Vec<GroupFailure>,
    /// Names whose group completed without error.
    pub healthy: BTreeSet<String>,
}

impl FlushReport {
    /// Outcome of a queued read.
    #[must_use]
    pub fn completion(&self, correlation: Correlation) -> Option<Completion> {
        self.completions.get(&correlation).copied()
    }

    /// True when every group succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Contiguous range of a group, relative to its base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u16,
    count: u16,
}

/// Spans covering every queued read, each at most `limit` wide.
fn read_spans(reads: &[PendingRead], limit: u16) -> Vec<Span> {
    let offsets: BTreeSet<u16> = reads
        .iter()
        .map(|r| match r.access {
            Access::Coil { offset } | Access::Register { offset } => offset,
            Access::RegisterBit { .. } => 0,
        })
        .collect();

    let mut spans: Vec<Span> = Vec::new();
    for offset in offsets {
        match spans.last_mut() {
            Some(span) if offset - span.start < limit => span.count = offset - span.start + 1,
            _ => spans.push(Span {
                start: offset,
                count: 1,
            }),
        }
    }
    spans
}

/// Consecutive values of one write request, relative to the group base.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WriteRun {
    start: u16,
    end: u16,
    values: Vec<WriteValue>,
}

fn known_value(cache: &RegisterCache, key: &GroupKey, offset: u16) -> Option<WriteValue> {
    if key.function.is_bit_access() {
        cache.bit(key, offset).map(WriteValue::Bit)
    } else {
        cache.word(key, offset).map(WriteValue::Word)
    }
}

/// Plan the write requests for the merged values of a group.
///
/// Touched offsets join one run when every offset between them is known
/// from the cache; each run then carries the known values that follow it.
/// A run never exceeds the protocol write limit.
fn write_runs(
    key: &GroupKey,
    writes: &BTreeMap<u16, WriteValue>,
    cache: &RegisterCache,
) -> Vec<WriteRun> {
    let limit = usize::from(if key.function.is_bit_access() {
        MAX_WRITE_COILS
    } else {
        MAX_WRITE_REGISTERS
    });

    let mut runs: Vec<WriteRun> = Vec::new();
    for (&offset, &value) in writes {
        if let Some(run) = runs.last_mut() {
            if usize::from(offset - run.start) < limit {
                let gap: Option<Vec<WriteValue>> = (run.end + 1..offset)
                    .map(|o| known_value(cache, key, o))
                    .collect();
                if let Some(gap) = gap {
                    run.values.extend(gap);
                    run.values.push(value);
                    run.end = offset;
                    continue;
                }
            }
        }
        runs.push(WriteRun {
            start: offset,
            end: offset,
            values: vec![value],
        });
    }

    let next_starts: Vec<Option<u16>> = runs
        .iter()
        .skip(1)
        .map(|run| Some(run.start))
        .chain(std::iter::once(None))
        .collect();
    for (run, next_start) in runs.iter_mut().zip(next_starts) {
        while run.values.len() < limit {
            let Some(offset) = run.end.checked_add(1) else {
                break;
            };
            if next_start.is_some_and(|next| offset >= next) {
                break;
            }
            let Some(value) = known_value(cache, key, offset) else {
                break;
            };
            run.values.push(value);
            run.end = offset;
        }
    }
    runs
}

fn run_image(key: &GroupKey, run: &WriteRun) -> RegisterImage {
    if key.function.is_bit_access() {
        RegisterImage::Bits(run.values.iter().map(|v| v.as_bool()).collect())
    } else {
        RegisterImage::Words(run.values.iter().map(|v| v.as_word()).collect())
    }
}

fn absolute(key: &GroupKey, offset: u16) -> BasResult<u16> {
    key.base_register.checked_add(offset).ok_or_else(|| {
        BasError::TransportError(format!("offset {offset} of {key} overflows the address space"))
    })
}

fn sample_from(cache: &RegisterCache, key: &GroupKey, access: Access) -> Option<Sample> {
    match access {
        Access::Coil { offset } => cache.bit(key, offset).map(Sample::Bit),
        Access::RegisterBit { bit } => cache
            .word(key, 0)
            .map(|word| Sample::Bit((word >> bit) & 1 != 0)),
        Access::Register { offset } => cache.word(key, offset).map(Sample::Word),
    }
}

/// Default value when nothing was ever cached.
fn default_sample(access: Access) -> Sample {
    match access {
        Access::Coil { .. } | Access::RegisterBit { .. } => Sample::Bit(false),
        Access::Register { .. } => Sample::Word(0),
    }
}

/// Best known value of a point from the cache.
#[must_use]
pub fn cached_sample(cache: &RegisterCache, key: &GroupKey, access: Access) -> Sample {
    sample_from(cache, key, access).unwrap_or_else(|| default_sample(access))
}

fn write_request(address: u16, image: RegisterImage) -> Request {
    match image {
        RegisterImage::Bits(values) => Request::WriteMultipleCoils { address, values },
        RegisterImage::Words(values) => Request::WriteMultipleRegisters { address, values },
    }
}

fn transact(pool: &TransportPool, key: &GroupKey, request: &Request) -> BasResult<Response> {
    trace!(group = %key, function = request.function_code(), "Issuing batched request");
    pool.with_modbus(key.interface_id, |transport: &mut dyn ModbusTransport, config| {
        transport.execute(wire_unit_id(config, key.device_id), request)
    })
}

/// Drain `groups` onto the buses.
///
/// Never fails as a whole: per-group errors end up in the report, and the
/// affected cache entries are marked stale.
pub fn flush_groups(
    groups: BTreeMap<GroupKey, BatchGroup>,
    cache: &mut RegisterCache,
    pool: &TransportPool,
) -> FlushReport {
    let mut report = FlushReport::default();

    for (key, group) in groups {
        match flush_group(&key, &group, cache, pool, &mut report) {
            Ok(()) => {
                report
                    .healthy
                    .extend(group.names().map(ToString::to_string));
            }
            Err(error) => {
                cache.mark_stale(&key);
                for read in &group.reads {
                    report.completions.insert(
                        read.correlation,
                        Completion {
                            value: cached_sample(cache, &key, read.access),
                            stale: true,
                        },
                    );
                }

                let mut names: Vec<String> = group.names().map(ToString::to_string).collect();
                names.sort();
                names.dedup();
                for name in &names {
                    warn!(
                        name = %name,
                        address = %key,
                        error = %error,
                        "Hardware malfunction"
                    );
                }
                report.failures.push(GroupFailure { key, error, names });
            }
        }
    }

    debug!(
        transactions = report.transactions,
        failed_groups = report.failures.len(),
        reads = report.completions.len(),
        "Batch flushed"
    );
    report
}

fn flush_group(
    key: &GroupKey,
    group: &BatchGroup,
    cache: &mut RegisterCache,
    pool: &TransportPool,
    report: &mut FlushReport,
) -> BasResult<()> {
    for run in write_runs(key, &group.writes, cache) {
        let image = run_image(key, &run);
        let request = write_request(absolute(key, run.start)?, image.clone());
        report.transactions += 1;
        transact(pool, key, &request)?;
        cache.store(*key, run.start, &image);
        trace!(group = %key, start = run.start, len = image.len(), "Merged write applied");
    }

    let read_code: FunctionCode = key.function.read_counterpart();
    let limit = if read_code.is_bit_access() {
        MAX_READ_BITS
    } else {
        MAX_READ_REGISTERS
    };
    for span in read_spans(&group.reads, limit) {
        let request = Request::read(read_code, absolute(key, span.start)?, span.count);
        report.transactions += 1;
        let values = match transact(pool, key, &request)? {
            Response::Bits(bits) => RegisterImage::Bits(bits),
            Response::Registers(words) => RegisterImage::Words(words),
            other => {
                return Err(BasError::TransportError(format!(
                    "unexpected response to read of {key}: {other:?}"
                )))
            }
        };
        cache.store(*key, span.start, &values);
    }

    for read in &group.reads {
        report.completions.insert(
            read.correlation,
            Completion {
                value: cached_sample(cache, key, read.access),
                stale: false,
            },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchAccumulator, WriteValue};
    use bas_common::config::{InterfaceConfig, LocalConfig};
    use bas_fieldbus::simulated::{SimulatedBus, SimulatedLocal, SimulatedTransports};
    use std::sync::Arc;

    fn setup() -> (SimulatedBus, TransportPool) {
        let bus = SimulatedBus::new();
        let factory = SimulatedTransports::new(bus.clone(), SimulatedLocal::new());
        let interfaces = [InterfaceConfig {
            id: 0,
            address: Some("sim".into()),
            ..InterfaceConfig::default()
        }];
        let pool = TransportPool::new(Arc::new(factory), &interfaces, &LocalConfig::default());
        (bus, pool)
    }

    fn key(function: FunctionCode) -> GroupKey {
        GroupKey {
            interface_id: 0,
            device_id: 2,
            function,
            base_register: 0,
        }
    }

    fn reads(accesses: &[Access]) -> Vec<PendingRead> {
        accesses
            .iter()
            .enumerate()
            .map(|(i, &access)| PendingRead {
                correlation: Correlation(i as u64),
                access,
                name: format!("p{i}"),
            })
            .collect()
    }

    fn coils(offsets: &[u16]) -> Vec<PendingRead> {
        reads(&offsets.iter().map(|&offset| Access::Coil { offset }).collect::<Vec<_>>())
    }

    #[test]
    fn test_read_span_covers_requests() {
        assert!(read_spans(&[], MAX_READ_BITS).is_empty());
        assert_eq!(
            read_spans(&coils(&[3]), MAX_READ_BITS),
            vec![Span { start: 3, count: 1 }]
        );
        assert_eq!(
            read_spans(&coils(&[5, 2, 9]), MAX_READ_BITS),
            vec![Span { start: 2, count: 8 }]
        );
    }

    #[test]
    fn test_read_spans_at_address_space_ends() {
        assert_eq!(
            read_spans(&coils(&[0, u16::MAX]), MAX_READ_BITS),
            vec![
                Span { start: 0, count: 1 },
                Span {
                    start: u16::MAX,
                    count: 1
                }
            ]
        );
    }

    #[test]
    fn test_read_spans_split_at_limit() {
        let registers = |offsets: &[u16]| {
            reads(
                &offsets
                    .iter()
                    .map(|&offset| Access::Register { offset })
                    .collect::<Vec<_>>(),
            )
        };
        assert_eq!(
            read_spans(&registers(&[0, 124]), MAX_READ_REGISTERS),
            vec![Span {
                start: 0,
                count: 125
            }]
        );
        assert_eq!(
            read_spans(&registers(&[0, 125, 130]), MAX_READ_REGISTERS),
            vec![
                Span { start: 0, count: 1 },
                Span {
                    start: 125,
                    count: 6
                }
            ]
        );
    }

    #[test]
    fn test_one_read_serves_many() {
        let (bus, pool) = setup();
        bus.set_discrete_input(0, 2, 1, true);
        bus.set_discrete_input(0, 2, 3, true);

        let key = key(FunctionCode::ReadDiscreteInputs);
        let mut batch = BatchAccumulator::new();
        let a = batch.enqueue_read(key, Access::Coil { offset: 1 }, "DI1");
        let b = batch.enqueue_read(key, Access::Coil { offset: 2 }, "DI2");
        let c = batch.enqueue_read(key, Access::Coil { offset: 3 }, "DI3");

        let mut cache = RegisterCache::new();
        let report = flush_groups(batch.drain(), &mut cache, &pool);

        assert_eq!(report.transactions, 1);
        assert_eq!(bus.transaction_count(), 1);
        assert_eq!(
            bus.transactions()[0].request,
            Request::ReadDiscreteInputs {
                address: 1,
                quantity: 3
            }
        );
        assert_eq!(report.completion(a).unwrap().value, Sample::Bit(true));
        assert_eq!(report.completion(b).unwrap().value, Sample::Bit(false));
        assert_eq!(report.completion(c).unwrap().value, Sample::Bit(true));
        assert!(report.healthy.contains("DI2"));
    }

    #[test]
    fn test_write_before_read_in_group() {
        let (bus, pool) = setup();
        let key = key(FunctionCode::WriteMultipleRegisters);
        let mut cache = RegisterCache::new();
        let mut batch = BatchAccumulator::new();

        let access = Access::Register { offset: 1 };
        batch.enqueue_write(key, access, WriteValue::Word(42), &cache, "AO1");
        let read = batch.enqueue_read(key, Access::Register { offset: 1 }, "AO1");

        let report = flush_groups(batch.drain(), &mut cache, &pool);
        assert_eq!(report.transactions, 2);

        let log = bus.transactions();
        assert!(matches!(log[0].request, Request::WriteMultipleRegisters { .. }));
        assert_eq!(
            log[1].request,
            Request::ReadHoldingRegisters {
                address: 1,
                quantity: 1
            }
        );
        assert_eq!(report.completion(read).unwrap().value, Sample::Word(42));
        assert_eq!(bus.holding(0, 2, 1), 42);
    }

    #[test]
    fn test_failure_masks_with_cache() {
        let (bus, pool) = setup();
        let key = key(FunctionCode::ReadInputRegisters);
        let mut cache = RegisterCache::new();
        cache.store(key, 0, &RegisterImage::Words(vec![1234]));

        bus.set_failing(0, true);
        let mut batch = BatchAccumulator::new();
        let read = batch.enqueue_read(key, Access::Register { offset: 0 }, "AI0");
        let unseen = batch.enqueue_read(key, Access::Register { offset: 5 }, "AI5");

        let report = flush_groups(batch.drain(), &mut cache, &pool);
        assert_eq!(
            report.completion(read),
            Some(Completion {
                value: Sample::Word(1234),
                stale: true
            })
        );
        assert_eq!(report.completion(unseen).unwrap().value, Sample::Word(0));
        assert!(cache.is_stale(&key));
        assert_eq!(cache.word(&key, 0), Some(1234));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].names, vec!["AI0", "AI5"]);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_failed_write_skips_read() {
        let (bus, pool) = setup();
        bus.set_failing(0, true);
        let key = key(FunctionCode::WriteMultipleCoils);
        let mut cache = RegisterCache::new();
        let mut batch = BatchAccumulator::new();
        let access = Access::Coil { offset: 0 };
        batch.enqueue_write(key, access, WriteValue::Bit(true), &cache, "RO0");
        batch.enqueue_read(key, Access::Coil { offset: 0 }, "RO0");

        let report = flush_groups(batch.drain(), &mut cache, &pool);
        assert_eq!(report.transactions, 1);
        assert_eq!(report.failures[0].names, vec!["RO0"]);
    }

    #[test]
    fn test_register_bit_reads_share_one_word() {
        let (bus, pool) = setup();
        bus.set_holding(0, 2, 0, 0b0000_0100);
        let key = key(FunctionCode::ReadHoldingRegisters);
        let mut batch = BatchAccumulator::new();
        let bit2 = batch.enqueue_read(key, Access::RegisterBit { bit: 2 }, "DI2");
        let bit3 = batch.enqueue_read(key, Access::RegisterBit { bit: 3 }, "DI3");

        let mut cache = RegisterCache::new();
        let report = flush_groups(batch.drain(), &mut cache, &pool);
        assert_eq!(bus.transaction_count(), 1);
        assert_eq!(report.completion(bit2).unwrap().value, Sample::Bit(true));
        assert_eq!(report.completion(bit3).unwrap().value, Sample::Bit(false));
    }

    #[test]
    fn test_extreme_offsets_read_separately() {
        let (bus, pool) = setup();
        bus.set_coil(0, 2, u16::MAX, true);
        let key = key(FunctionCode::ReadCoils);
        let mut batch = BatchAccumulator::new();
        let low = batch.enqueue_read(key, Access::Coil { offset: 0 }, "DO0");
        let high = batch.enqueue_read(key, Access::Coil { offset: u16::MAX }, "DO65535");

        let mut cache = RegisterCache::new();
        let report = flush_groups(batch.drain(), &mut cache, &pool);

        assert!(report.is_clean());
        assert_eq!(report.transactions, 2);
        assert_eq!(
            bus.transactions()[1].request,
            Request::ReadCoils {
                address: u16::MAX,
                quantity: 1
            }
        );
        assert_eq!(report.completion(low).unwrap().value, Sample::Bit(false));
        assert_eq!(report.completion(high).unwrap().value, Sample::Bit(true));
    }

    #[test]
    fn test_wide_register_reads_are_split() {
        let (bus, pool) = setup();
        bus.set_input(0, 2, 130, 77);
        let key = key(FunctionCode::ReadInputRegisters);
        let mut batch = BatchAccumulator::new();
        batch.enqueue_read(key, Access::Register { offset: 0 }, "AI0");
        let far = batch.enqueue_read(key, Access::Register { offset: 130 }, "AI130");

        let mut cache = RegisterCache::new();
        let report = flush_groups(batch.drain(), &mut cache, &pool);

        assert!(report.is_clean());
        assert_eq!(report.transactions, 2);
        assert_eq!(report.completion(far).unwrap().value, Sample::Word(77));
    }

    #[test]
    fn test_write_never_covers_unknown_coils() {
        let (bus, pool) = setup();
        bus.set_coil(0, 2, 0, true);
        let key = key(FunctionCode::WriteMultipleCoils);
        let mut cache = RegisterCache::new();
        let mut batch = BatchAccumulator::new();
        let access = Access::Coil { offset: 3 };
        batch.enqueue_write(key, access, WriteValue::Bit(true), &cache, "RO3");

        let report = flush_groups(batch.drain(), &mut cache, &pool);
        assert!(report.is_clean());
        assert_eq!(
            bus.transactions()[0].request,
            Request::WriteMultipleCoils {
                address: 3,
                values: vec![true]
            }
        );
        assert!(bus.coil(0, 2, 0));
        assert!(bus.coil(0, 2, 3));
    }

    #[test]
    fn test_unknown_gap_splits_write() {
        let (bus, pool) = setup();
        let key = key(FunctionCode::WriteMultipleCoils);
        let mut cache = RegisterCache::new();
        let mut batch = BatchAccumulator::new();
        for offset in [0, 2] {
            let access = Access::Coil { offset };
            batch.enqueue_write(key, access, WriteValue::Bit(true), &cache, "RO");
        }
        flush_groups(batch.drain(), &mut cache, &pool);
        assert_eq!(bus.transaction_count(), 2);

        // Once coil 1 is known the same writes coalesce
        bus.clear_log();
        for offset in [0, 2] {
            let access = Access::Coil { offset };
            batch.enqueue_write(key, access, WriteValue::Bit(false), &cache, "RO");
        }
        cache.store(key, 1, &RegisterImage::Bits(vec![true]));
        flush_groups(batch.drain(), &mut cache, &pool);
        assert_eq!(
            bus.transactions(),
            vec![bas_fieldbus::simulated::Transaction {
                interface_id: 0,
                unit_id: 2,
                request: Request::WriteMultipleCoils {
                    address: 0,
                    values: vec![false, true, false]
                },
            }]
        );
    }

    #[test]
    fn test_far_register_write_is_anchored_at_offset() {
        let (bus, pool) = setup();
        let key = key(FunctionCode::WriteMultipleRegisters);
        let mut cache = RegisterCache::new();
        let mut batch = BatchAccumulator::new();
        let access = Access::Register { offset: 200 };
        batch.enqueue_write(key, access, WriteValue::Word(2048), &cache, "AO200");

        let report = flush_groups(batch.drain(), &mut cache, &pool);
        assert!(report.is_clean());
        assert_eq!(
            bus.transactions()[0].request,
            Request::WriteMultipleRegisters {
                address: 200,
                values: vec![2048]
            }
        );
        assert_eq!(bus.holding(0, 2, 200), 2048);
        assert_eq!(cache.word(&key, 200), Some(2048));
    }

    #[test]
    fn test_write_after_wide_read_stays_within_limit() {
        let (bus, pool) = setup();
        let key = key(FunctionCode::WriteMultipleRegisters);
        let mut cache = RegisterCache::new();
        let mut batch = BatchAccumulator::new();
        batch.enqueue_read(key, Access::Register { offset: 0 }, "AO0");
        batch.enqueue_read(key, Access::Register { offset: 124 }, "AO124");
        assert!(flush_groups(batch.drain(), &mut cache, &pool).is_clean());

        bus.clear_log();
        let access = Access::Register { offset: 0 };
        batch.enqueue_write(key, access, WriteValue::Word(1229), &cache, "AO0");
        let report = flush_groups(batch.drain(), &mut cache, &pool);

        assert!(report.is_clean());
        match &bus.transactions()[0].request {
            Request::WriteMultipleRegisters { address, values } => {
                assert_eq!(*address, 0);
                assert_eq!(values.len(), usize::from(MAX_WRITE_REGISTERS));
                assert_eq!(values[0], 1229);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bus.holding(0, 2, 0), 1229);
    }

    #[test]
    fn test_sample_conversions() {
        assert!(Sample::Word(3).as_bool());
        assert!((Sample::Bit(true).as_f64() - 1.0).abs() < f64::EPSILON);
    }
}
