//! An open-addressing `address -> size` map, specialised for the one job of
//! knowing which addresses are live right now.
//!
//! Entries live as interleaved `[key, value, key, value, ...]` pairs in one
//! flat buffer of `2 * capacity` words. A key always sits on an even index and
//! its value right after it, so a lookup touches one cache line for both. The
//! key `0` ([`EMPTY`]) marks a free slot, which is why `0` can never be
//! tracked as an address.
//!
//! Removal does backward-shift compaction along the collision chain instead of
//! leaving tombstones:
//!
//! ```plaintext
//!  home(a) = home(b) = home(c) = 2
//!
//!  slot:  0    2    4    6    8
//!        [ ] [a]  [b]  [c]  [ ]      remove(a)
//!        [ ] [ ]  [b]  [c]  [ ]      hole at 2, b's home is 2 -> shift b
//!        [ ] [b]  [ ]  [c]  [ ]      hole at 4, c's home is 2 -> shift c
//!        [ ] [b]  [c]  [ ]  [ ]      hit an empty slot, done
//! ```
//!
//! The table has no locking of its own. Whoever owns it decides how it is
//! shared, see [`crate::storage`].

use std::fmt;

use crate::util::num::pow2_at_least;

/// The reserved key for "nothing here"
pub const EMPTY: u64 = 0;

pub const DEFAULT_INITIAL_CAPACITY: usize = 16;
pub const DEFAULT_LOAD_FACTOR: f64 = 0.6;
/// Largest initial capacity we accept: 2^28 pairs, i.e. a 4 GiB table
pub const MAX_INITIAL_CAPACITY: usize = 1 << 28;

/// phi = 2^64 / golden ratio
const PHI: u64 = 0x9E37_79B9_7F4A_7C15;

fn mix(key: u64) -> u64 {
    let h = key.wrapping_mul(PHI);
    let h = h ^ (h >> 32);
    h ^ (h >> 16)
}

/// The even slot a key would like to live in
#[inline]
fn home(key: u64, mask: usize) -> usize {
    (mix(key) as usize) & mask & !1
}

pub struct Ledger {
    entries: Box<[u64]>,
    capacity: usize,
    /// `2 * capacity - 1`, i.e. a mask over word indices, not pair indices
    mask: usize,
    load_factor: f64,
    resize_threshold: usize,
    len: usize,
}

impl Ledger {
    /// An empty ledger with capacity 16 and load factor 0.6
    pub fn new() -> Self {
        Self::with_capacity_and_load_factor(DEFAULT_INITIAL_CAPACITY, DEFAULT_LOAD_FACTOR)
    }

    /// # Panics
    ///
    /// - If `load_factor` is not in `(0, 1)`. A full table would make probing
    ///   spin forever, so we never allow one.
    /// - If `initial_capacity` rounds up past `usize::MAX`.
    pub fn with_capacity_and_load_factor(initial_capacity: usize, load_factor: f64) -> Self {
        assert!(
            load_factor > 0.0 && load_factor < 1.0,
            "load factor must be in (0, 1), got {load_factor}"
        );
        let capacity = pow2_at_least(initial_capacity);
        let mut ledger = Self {
            entries: Box::new([]),
            capacity: 0,
            mask: 0,
            load_factor,
            resize_threshold: 0,
            len: 0,
        };
        ledger.reset(capacity);
        ledger
    }

    /// Replace the buffer with an empty one of `capacity` pairs
    fn reset(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.mask = capacity * 2 - 1;
        self.resize_threshold = (capacity as f64 * self.load_factor) as usize;
        self.entries = vec![EMPTY; capacity * 2].into_boxed_slice();
        self.len = 0;
    }

    #[inline]
    fn next(&self, index: usize) -> usize {
        (index + 2) & self.mask
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of `(key, value)` pairs the buffer can hold. Always a power of
    /// two.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// Index of `key`'s slot if present, otherwise `Err` with the empty slot
    /// that ended the scan (where `key` would go).
    fn find_slot(&self, key: u64) -> Result<usize, usize> {
        let mut index = home(key, self.mask);
        loop {
            match self.entries[index] {
                EMPTY => return Err(index),
                candidate if candidate == key => return Ok(index),
                _ => index = self.next(index),
            }
        }
    }

    /// Track `address` with `size`, overwriting any existing entry. Returns the
    /// size that was there before.
    ///
    /// # Panics
    ///
    /// - If `address` is [`EMPTY`]
    pub fn insert(&mut self, address: u64, size: u64) -> Option<u64> {
        assert_ne!(address, EMPTY, "address {EMPTY} is reserved");
        match self.find_slot(address) {
            Ok(index) => {
                let old = self.entries[index + 1];
                self.entries[index + 1] = size;
                Some(old)
            }
            Err(index) => {
                self.entries[index] = address;
                self.entries[index + 1] = size;
                self.len += 1;
                if self.len > self.resize_threshold {
                    self.grow();
                }
                None
            }
        }
    }

    /// Double the capacity and rehash every entry into the new buffer
    fn grow(&mut self) {
        let new_capacity = self.capacity.checked_mul(2).expect("capacity overflow");
        let old = std::mem::replace(&mut self.entries, Box::new([]));
        self.reset(new_capacity);
        for pair in old.chunks_exact(2) {
            if pair[0] != EMPTY {
                // Keys were unique in the old table and the new one has twice
                // the room, so a plain scan for an empty slot is enough.
                let Err(index) = self.find_slot(pair[0]) else {
                    unreachable!("duplicate key {:#x} while rehashing", pair[0]);
                };
                self.entries[index] = pair[0];
                self.entries[index + 1] = pair[1];
                self.len += 1;
            }
        }
        log::trace!("ledger grew to capacity {}", self.capacity);
    }

    /// Size tracked for exactly `address`
    pub fn get(&self, address: u64) -> Option<u64> {
        if address == EMPTY {
            return None;
        }
        self.find_slot(address).ok().map(|index| self.entries[index + 1])
    }

    pub fn contains(&self, address: u64) -> bool {
        self.get(address).is_some()
    }

    /// Find the record whose `[base, base + size)` contains `address`. An exact
    /// base match is tried first, then every entry is scanned, so interior
    /// addresses cost `O(capacity)`. [`crate::storage::Partition`] keeps an
    /// ordered index for the checker's lookups.
    ///
    /// A zero-sized record only "contains" its own base address.
    pub fn containing(&self, address: u64) -> Option<(u64, u64)> {
        if let Some(size) = self.get(address) {
            return Some((address, size));
        }
        self.iter()
            .find(|&(base, size)| address > base && address - base < size)
    }

    /// Stop tracking `address`, returning its size if it was tracked
    pub fn remove(&mut self, address: u64) -> Option<u64> {
        if address == EMPTY {
            return None;
        }
        let index = self.find_slot(address).ok()?;
        let size = self.entries[index + 1];
        self.entries[index] = EMPTY;
        self.entries[index + 1] = EMPTY;
        self.len -= 1;
        self.compact_chain(index);
        Some(size)
    }

    /// Close the hole at `delete_index` by walking the collision chain forward and
    /// pulling back every entry that is allowed to live in the hole, until we
    /// hit an empty slot.
    ///
    /// An entry at `index` with home slot `hash` may move into the hole iff
    /// the hole lies cyclically within `[hash, index)`, i.e. moving it does not
    /// put it *before* its home slot. The three cases below are the three ways
    /// that interval can look once you account for wrapping.
    fn compact_chain(&mut self, mut delete_index: usize) {
        let mut index = delete_index;
        loop {
            index = self.next(index);
            let key = self.entries[index];
            if key == EMPTY {
                return;
            }
            let hash = home(key, self.mask);
            let movable = if index < hash {
                // `[hash, index)` wraps past the end of the buffer
                hash <= delete_index || delete_index <= index
            } else {
                hash <= delete_index && delete_index <= index
            };
            if movable {
                self.entries[delete_index] = key;
                self.entries[delete_index + 1] = self.entries[index + 1];
                self.entries[index] = EMPTY;
                self.entries[index + 1] = EMPTY;
                delete_index = index;
            }
        }
    }

    /// Forget everything, keeping the current capacity
    pub fn clear(&mut self) {
        self.entries.fill(EMPTY);
        self.len = 0;
    }

    /// Iterate over `(address, size)` in slot order. The order is an
    /// implementation detail, but it *is* stable for a given table state.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            pairs: self.entries.chunks_exact(2),
        }
    }
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(address, size)| (format!("{address:#x}"), size)))
            .finish()
    }
}

pub struct Iter<'a> {
    pairs: std::slice::ChunksExact<'a, u64>,
}

impl Iterator for Iter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        self.pairs
            .find(|pair| pair[0] != EMPTY)
            .map(|pair| (pair[0], pair[1]))
    }
}

impl<'a> IntoIterator for &'a Ledger {
    type Item = (u64, u64);
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use hashbrown::HashMap;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    /// Every key in the table must be reachable from its home slot without
    /// crossing an empty slot
    fn assert_collision_chains_intact(ledger: &Ledger) {
        for (address, size) in ledger.iter() {
            assert_eq!(ledger.get(address), Some(size), "{address:#x} unreachable");
        }
        assert_eq!(ledger.iter().count(), ledger.len());
    }

    /// Keys (other than `EMPTY`) whose home slot is `slot` in a table with
    /// `mask`
    fn keys_homed_at(slot: usize, mask: usize, n: usize) -> Vec<u64> {
        (1u64..)
            .filter(|&k| home(k, mask) == slot)
            .take(n)
            .collect()
    }

    #[test]
    fn insert_get_remove() {
        let mut ledger = Ledger::new();
        assert_eq!(ledger.insert(0x1000, 100), None);
        assert_eq!(ledger.get(0x1000), Some(100));
        assert_eq!(ledger.insert(0x1000, 200), Some(100));
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.remove(0x1000), Some(200));
        assert_eq!(ledger.remove(0x1000), None);
        assert_eq!(ledger.get(0x1000), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn zero_is_never_found() {
        let mut ledger = Ledger::new();
        ledger.insert(1, 1);
        assert_eq!(ledger.get(EMPTY), None);
        assert_eq!(ledger.remove(EMPTY), None);
    }

    #[test]
    #[should_panic]
    fn inserting_zero_panics() {
        Ledger::new().insert(EMPTY, 8);
    }

    #[test]
    fn capacity_is_power_of_two() {
        assert_eq!(Ledger::with_capacity_and_load_factor(0, 0.5).capacity(), 2);
        assert_eq!(Ledger::with_capacity_and_load_factor(10, 0.5).capacity(), 16);
        assert_eq!(Ledger::with_capacity_and_load_factor(64, 0.5).capacity(), 64);
    }

    #[test]
    fn resizes_past_threshold() {
        let mut ledger = Ledger::with_capacity_and_load_factor(16, 0.6);
        for i in 1..=9u64 {
            ledger.insert(i * 0x40, i);
        }
        assert_eq!(ledger.capacity(), 16);
        ledger.insert(10 * 0x40, 10);
        assert_eq!(ledger.capacity(), 32);
        for i in 1..=10u64 {
            assert_eq!(ledger.get(i * 0x40), Some(i));
        }
        assert_eq!(ledger.len(), 10);
    }

    #[test]
    fn backward_shift_within_chain() {
        let mut ledger = Ledger::with_capacity_and_load_factor(16, 0.9);
        let keys = keys_homed_at(4, ledger.mask, 3);
        for &k in &keys {
            ledger.insert(k, k);
        }
        assert_eq!(ledger.remove(keys[0]), Some(keys[0]));
        assert_eq!(ledger.get(keys[1]), Some(keys[1]));
        assert_eq!(ledger.get(keys[2]), Some(keys[2]));
        // Shifted back, no gap left at the front of the chain
        assert_eq!(ledger.entries[4], keys[1]);
        assert_eq!(ledger.entries[6], keys[2]);
        assert_eq!(ledger.entries[8], EMPTY);
        assert_collision_chains_intact(&ledger);
    }

    #[test]
    fn backward_shift_across_wraparound() {
        let mut ledger = Ledger::with_capacity_and_load_factor(16, 0.9);
        let last = ledger.mask - 1;
        let wrapping = keys_homed_at(last, ledger.mask, 3);
        let at_zero = keys_homed_at(0, ledger.mask, 1);
        for &k in wrapping.iter().chain(&at_zero) {
            ledger.insert(k, k + 1);
        }
        // wrapping[0] at `last`, wrapping[1] at 0, wrapping[2] at 2, at_zero at 4
        assert_eq!(ledger.entries[last], wrapping[0]);
        assert_eq!(ledger.entries[0], wrapping[1]);

        ledger.remove(wrapping[0]);
        assert_eq!(ledger.entries[last], wrapping[1]);
        assert_eq!(ledger.entries[0], wrapping[2]);
        // at_zero's home is 0, so it moves into 2 but not across to `last`
        assert_eq!(ledger.entries[2], at_zero[0]);
        assert_eq!(ledger.entries[4], EMPTY);
        assert_collision_chains_intact(&ledger);

        ledger.remove(wrapping[2]);
        assert_eq!(ledger.entries[0], at_zero[0]);
        assert_collision_chains_intact(&ledger);
    }

    #[test]
    fn containing_finds_interior_addresses() {
        let mut ledger = Ledger::new();
        ledger.insert(0x1000, 0x100);
        ledger.insert(0x2000, 0);
        assert_eq!(ledger.containing(0x1000), Some((0x1000, 0x100)));
        assert_eq!(ledger.containing(0x10ff), Some((0x1000, 0x100)));
        assert_eq!(ledger.containing(0x1100), None);
        assert_eq!(ledger.containing(0x0fff), None);
        assert_eq!(ledger.containing(0x2000), Some((0x2000, 0)));
        assert_eq!(ledger.containing(0x2001), None);
    }

    #[test]
    fn iteration_order_is_stable() {
        let mut ledger = Ledger::new();
        for i in 1..50u64 {
            ledger.insert(i * 24, i);
        }
        let a: Vec<_> = ledger.iter().collect();
        let b: Vec<_> = ledger.iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.len(), 49);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut ledger = Ledger::new();
        for i in 1..100u64 {
            ledger.insert(i, i);
        }
        let capacity = ledger.capacity();
        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(ledger.capacity(), capacity);
        assert_eq!(ledger.get(5), None);
    }

    /// Random insert/remove/get against a reference map. Keys are drawn from a
    /// small range so chains get long and removals hit them often.
    #[test]
    fn fuzz_against_reference() {
        for seed in 0..16u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut ledger = Ledger::with_capacity_and_load_factor(2, 0.75);
            let mut reference: HashMap<u64, u64> = HashMap::new();
            for _ in 0..4000 {
                let key = rng.gen_range(1..256u64);
                match rng.gen_range(0..3) {
                    0 => {
                        let size = rng.gen::<u64>();
                        assert_eq!(ledger.insert(key, size), reference.insert(key, size));
                    }
                    1 => assert_eq!(ledger.remove(key), reference.remove(&key)),
                    _ => assert_eq!(ledger.get(key), reference.get(&key).copied()),
                }
                assert_eq!(ledger.len(), reference.len());
            }
            assert_collision_chains_intact(&ledger);
            let mut seen: Vec<_> = ledger.iter().collect();
            let mut expected: Vec<_> = reference.into_iter().collect();
            seen.sort_unstable();
            expected.sort_unstable();
            assert_eq!(seen, expected, "seed {seed}");
        }
    }
}
