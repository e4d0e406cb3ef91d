//! Per-cycle batch accumulator.
//!
//! Remote operations issued while plugins run are indexed by [`GroupKey`].
//! Writes are merged per offset as they arrive; register bits are folded
//! into their word starting from the cached word. The flusher fills the
//! gaps between touched offsets from the cache. Reads only remember what to
//! demultiplex after the flush.

use crate::cache::{GroupKey, RegisterCache};
use bas_fieldbus::Access;
use std::collections::BTreeMap;
use std::fmt;

/// Identifies a queued read inside one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Correlation(pub u64);

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Physical value written to a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteValue {
    /// Coil or register bit.
    Bit(bool),
    /// Whole register.
    Word(u16),
}

impl WriteValue {
    /// Value as a coil state.
    #[must_use]
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bit(bit) => bit,
            Self::Word(word) => word != 0,
        }
    }

    /// Value as a register word.
    #[must_use]
    pub fn as_word(self) -> u16 {
        match self {
            Self::Bit(bit) => u16::from(bit),
            Self::Word(word) => word,
        }
    }
}

/// A read waiting for the flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRead {
    /// Handed back to the caller.
    pub correlation: Correlation,
    /// Where the value sits in the group.
    pub access: Access,
    /// Symbolic name, for diagnostics.
    pub name: String,
}

/// Operations for one group in the current cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGroup {
    /// Reads in enqueue order.
    pub reads: Vec<PendingRead>,
    /// Merged write values by offset from the base register.
    pub writes: BTreeMap<u16, WriteValue>,
    /// Names that contributed to the write, in enqueue order.
    pub writers: Vec<String>,
}

impl BatchGroup {
    fn new() -> Self {
        Self {
            reads: Vec::new(),
            writes: BTreeMap::new(),
            writers: Vec::new(),
        }
    }

    /// Every symbolic name touching the group.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.writers
            .iter()
            .map(String::as_str)
            .chain(self.reads.iter().map(|r| r.name.as_str()))
    }
}

/// Pending remote operations of the in-progress cycle.
#[derive(Debug, Default)]
pub struct BatchAccumulator {
    groups: BTreeMap<GroupKey, BatchGroup>,
    next_correlation: u64,
    operations: usize,
}

impl BatchAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a read and return its correlation id.
    pub fn enqueue_read(&mut self, key: GroupKey, access: Access, name: &str) -> Correlation {
        self.next_correlation += 1;
        let correlation = Correlation(self.next_correlation);
        self.operations += 1;
        self.groups
            .entry(key)
            .or_insert_with(BatchGroup::new)
            .reads
            .push(PendingRead {
                correlation,
                access,
                name: name.to_string(),
            });
        correlation
    }

    /// Merge a write into the group.
    ///
    /// Later writes to the same coil, register or register bit overwrite
    /// earlier ones. A register bit starts from the word already merged this
    /// cycle, else the cached word, else 0.
    pub fn enqueue_write(
        &mut self,
        key: GroupKey,
        access: Access,
        value: WriteValue,
        cache: &RegisterCache,
        name: &str,
    ) {
        self.operations += 1;
        let group = self.groups.entry(key).or_insert_with(BatchGroup::new);

        match access {
            Access::Coil { offset } => {
                group.writes.insert(offset, WriteValue::Bit(value.as_bool()));
            }
            Access::RegisterBit { bit } => {
                let word = group
                    .writes
                    .get(&0)
                    .map(|merged| merged.as_word())
                    .or_else(|| cache.word(&key, 0))
                    .unwrap_or(0);
                let merged = with_bit(word, bit, value.as_bool());
                group.writes.insert(0, WriteValue::Word(merged));
            }
            Access::Register { offset } => {
                group.writes.insert(offset, WriteValue::Word(value.as_word()));
            }
        }
        group.writers.push(name.to_string());
    }

    /// Take every pending group, leaving the accumulator empty.
    pub fn drain(&mut self) -> BTreeMap<GroupKey, BatchGroup> {
        self.operations = 0;
        std::mem::take(&mut self.groups)
    }

    /// Number of operations queued this cycle.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations == 0
    }

    /// Number of distinct groups queued this cycle.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Pending operations of one group.
    #[must_use]
    pub fn group(&self, key: &GroupKey) -> Option<&BatchGroup> {
        self.groups.get(key)
    }
}

/// `word` with bit `bit` set to `value`.
#[must_use]
pub fn with_bit(word: u16, bit: u8, value: bool) -> u16 {
    let mask = 1u16 << bit;
    if value {
        word | mask
    } else {
        word & !mask
    }
}
