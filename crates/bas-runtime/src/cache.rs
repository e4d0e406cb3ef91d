//! Device register cache.
//!
//! Last-known state of every batch group, anchored at the group's base
//! register. Bit-access groups (coils, discrete inputs) hold one `bool` per
//! coil; register groups hold one word per register. Only offsets the
//! device confirmed count as known. Entries live for the whole process and
//! are marked stale, never dropped, on transport errors.

use bas_fieldbus::{FunctionCode, RemotePoint};
use std::collections::HashMap;
use std::fmt;

/// Identity of a batch group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    /// Interface index.
    pub interface_id: u8,
    /// Device id before `unit_base` is applied.
    pub device_id: u8,
    /// Function code of the points in the group.
    pub function: FunctionCode,
    /// Anchor register or coil.
    pub base_register: u16,
}

impl GroupKey {
    /// Group a remote point belongs to.
    #[must_use]
    pub fn of(point: &RemotePoint) -> Self {
        Self {
            interface_id: point.interface_id,
            device_id: point.device_id,
            function: point.function,
            base_register: point.base_register,
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "U{}:ID{}:FC{}:R{}",
            self.interface_id, self.device_id, self.function, self.base_register
        )
    }
}

/// Values of a group starting at its base register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterImage {
    /// Coil or discrete-input states.
    Bits(Vec<bool>),
    /// Register words.
    Words(Vec<u16>),
}

impl RegisterImage {
    /// Empty image of the shape used by `function`.
    #[must_use]
    pub fn empty_for(function: FunctionCode) -> Self {
        if function.is_bit_access() {
            Self::Bits(Vec::new())
        } else {
            Self::Words(Vec::new())
        }
    }

    /// Number of coils or words held.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bits(bits) => bits.len(),
            Self::Words(words) => words.len(),
        }
    }

    /// True when nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coil at `offset`.
    #[must_use]
    pub fn bit(&self, offset: u16) -> Option<bool> {
        match self {
            Self::Bits(bits) => bits.get(usize::from(offset)).copied(),
            Self::Words(_) => None,
        }
    }

    /// Word at `offset`.
    #[must_use]
    pub fn word(&self, offset: u16) -> Option<u16> {
        match self {
            Self::Words(words) => words.get(usize::from(offset)).copied(),
            Self::Bits(_) => None,
        }
    }

    /// Set the coil at `offset`, growing the image with `false`.
    pub fn set_bit(&mut self, offset: u16, value: bool) {
        if let Self::Bits(bits) = self {
            let index = usize::from(offset);
            if bits.len() <= index {
                bits.resize(index + 1, false);
            }
            bits[index] = value;
        }
    }

    /// Set the word at `offset`, growing the image with zeros.
    pub fn set_word(&mut self, offset: u16, value: u16) {
        if let Self::Words(words) = self {
            let index = usize::from(offset);
            if words.len() <= index {
                words.resize(index + 1, 0);
            }
            words[index] = value;
        }
    }

    /// Copy `other` over this image starting at `offset`.
    ///
    /// Shapes that do not match are ignored.
    pub fn overlay(&mut self, offset: u16, other: &RegisterImage) {
        match other {
            Self::Bits(bits) => {
                for (i, &bit) in bits.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation)]
                    self.set_bit(offset.saturating_add(i as u16), bit);
                }
            }
            Self::Words(words) => {
                for (i, &word) in words.iter().enumerate() {
                    #[allow(clippy::cast_possible_truncation)]
                    self.set_word(offset.saturating_add(i as u16), word);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    image: RegisterImage,
    known: Vec<bool>,
    stale: bool,
}

impl CacheEntry {
    fn knows(&self, offset: u16) -> bool {
        self.known.get(usize::from(offset)).copied().unwrap_or(false)
    }
}

/// Last-known values per batch group.
#[derive(Debug, Default)]
pub struct RegisterCache {
    entries: HashMap<GroupKey, CacheEntry>,
}

impl RegisterCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn known_entry(&self, key: &GroupKey, offset: u16) -> Option<&CacheEntry> {
        self.entries.get(key).filter(|e| e.knows(offset))
    }

    /// Cached coil, `None` if never seen.
    #[must_use]
    pub fn bit(&self, key: &GroupKey, offset: u16) -> Option<bool> {
        self.known_entry(key, offset)
            .and_then(|e| e.image.bit(offset))
    }

    /// Cached word, `None` if never seen.
    #[must_use]
    pub fn word(&self, key: &GroupKey, offset: u16) -> Option<u16> {
        self.known_entry(key, offset)
            .and_then(|e| e.image.word(offset))
    }

    /// Whether the last transaction on the group failed.
    #[must_use]
    pub fn is_stale(&self, key: &GroupKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.stale)
    }

    /// Record values confirmed by the device, starting at `offset`.
    pub fn store(&mut self, key: GroupKey, offset: u16, values: &RegisterImage) {
        let entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            image: RegisterImage::empty_for(key.function),
            known: Vec::new(),
            stale: false,
        });
        entry.image.overlay(offset, values);

        let start = usize::from(offset);
        let end = (start + values.len()).min(usize::from(u16::MAX) + 1);
        if entry.known.len() < end {
            entry.known.resize(end, false);
        }
        entry.known[start..end].fill(true);
        entry.stale = false;
    }

    /// Flag a group after a failed transaction; values are kept.
    pub fn mark_stale(&mut self, key: &GroupKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.stale = true;
        }
    }

    /// Flag every group on an interface, e.g. after it was reconfigured.
    pub fn mark_interface_stale(&mut self, interface_id: u8) {
        for (key, entry) in &mut self.entries {
            if key.interface_id == interface_id {
                entry.stale = true;
            }
        }
    }

    /// Number of cached groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing has been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of groups currently marked stale.
    #[must_use]
    pub fn stale_count(&self) -> usize {
        self.entries.values().filter(|e| e.stale).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coil_key() -> GroupKey {
        GroupKey {
            interface_id: 0,
            device_id: 2,
            function: FunctionCode::WriteMultipleCoils,
            base_register: 0,
        }
    }

    #[test]
    fn test_group_key_display() {
        assert_eq!(coil_key().to_string(), "U0:ID2:FC15:R0");
    }

    #[test]
    fn test_store_only_marks_confirmed_offsets() {
        let mut cache = RegisterCache::new();
        let key = coil_key();
        assert_eq!(cache.bit(&key, 0), None);

        cache.store(key, 2, &RegisterImage::Bits(vec![true]));
        assert_eq!(cache.bit(&key, 2), Some(true));
        // Padding below the stored span is not a known value
        assert_eq!(cache.bit(&key, 0), None);
        assert_eq!(cache.bit(&key, 1), None);
        assert_eq!(cache.bit(&key, 3), None);
        assert_eq!(cache.word(&key, 2), None);

        cache.store(key, 0, &RegisterImage::Bits(vec![false]));
        assert_eq!(cache.bit(&key, 0), Some(false));
        assert_eq!(cache.bit(&key, 1), None);
    }

    #[test]
    fn test_store_at_top_of_address_space() {
        let mut cache = RegisterCache::new();
        let key = GroupKey {
            function: FunctionCode::ReadHoldingRegisters,
            ..coil_key()
        };
        cache.store(key, u16::MAX, &RegisterImage::Words(vec![7]));
        assert_eq!(cache.word(&key, u16::MAX), Some(7));
        assert_eq!(cache.word(&key, u16::MAX - 1), None);
    }

    #[test]
    fn test_stale_keeps_values() {
        let mut cache = RegisterCache::new();
        let key = GroupKey {
            function: FunctionCode::ReadInputRegisters,
            ..coil_key()
        };
        cache.store(key, 0, &RegisterImage::Words(vec![10, 20]));
        cache.mark_stale(&key);

        assert!(cache.is_stale(&key));
        assert_eq!(cache.word(&key, 1), Some(20));
        assert_eq!(cache.stale_count(), 1);

        // A later successful read clears the flag
        cache.store(key, 1, &RegisterImage::Words(vec![21]));
        assert!(!cache.is_stale(&key));
        assert_eq!(cache.word(&key, 0), Some(10));
    }

    #[test]
    fn test_mark_unknown_group_is_noop() {
        let mut cache = RegisterCache::new();
        cache.mark_stale(&coil_key());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_interface_invalidation() {
        let mut cache = RegisterCache::new();
        let other = GroupKey {
            interface_id: 1,
            ..coil_key()
        };
        cache.store(coil_key(), 0, &RegisterImage::Bits(vec![true]));
        cache.store(other, 0, &RegisterImage::Bits(vec![true]));

        cache.mark_interface_stale(1);
        assert!(!cache.is_stale(&coil_key()));
        assert!(cache.is_stale(&other));
    }

    #[test]
    fn test_image_shape_mismatch_ignored() {
        let mut image = RegisterImage::Bits(vec![true]);
        image.set_word(0, 5);
        assert_eq!(image, RegisterImage::Bits(vec![true]));
    }
}
