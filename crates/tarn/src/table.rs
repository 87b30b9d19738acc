//! Insertion-ordered open-addressed hash table.
//!
//! Every attribute dictionary, module namespace, `dict`/`set` payload and the string
//! intern pool is a [`Table`]. Storage is split in two:
//!
//! - `entries`: key/value pairs in insertion order. Deleting leaves a gap (a
//!   `Kwargs(0)` key) so that the order of surviving entries never changes.
//! - `indexes`: a power-of-two bucket array holding an index into `entries`,
//!   [`EMPTY`] or [`TOMBSTONE`].
//!
//! `count` is the number of live entries and `used` the length of `entries` including
//! gaps, so `count <= used <= capacity`. Inserting rebuilds both arrays once
//! `used + 1` would exceed three quarters of the capacity; the rebuild drops the
//! gaps and doubles the bucket array when the live entries need the room.
//!
//! Hashing and equality of keys are supplied by a [`KeyContext`] because both may
//! need to look inside heap objects. Both are fallible: an unhashable key is an error
//! that propagates out of the table operation, never a silent miss.

use smallvec::SmallVec;

use crate::{
    exception_private::{ExcType, RunResult},
    value::{KWARGS_UNSET, Value},
};

/// Bucket that has never held an entry.
pub const EMPTY: isize = -1;
/// Bucket whose entry was deleted; probing continues past it.
pub const TOMBSTONE: isize = -2;

const MIN_CAPACITY: usize = 8;

/// Supplies hashing and equality for table keys.
pub trait KeyContext {
    /// Hash of `key`, or an error if the key is unhashable.
    fn key_hash(&self, key: Value) -> RunResult<u32>;

    /// Value equality of two keys whose hashes already matched and which are not the
    /// same value.
    fn keys_equal(&self, a: Value, b: Value) -> RunResult<bool>;
}

/// How a probe decides that a stored key matches the requested one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    /// The keys are the same value, or [`KeyContext::keys_equal`] says they are equal.
    SameOrEqual,
    /// The keys are the same value. Used for internal bookkeeping where equality must
    /// not be consulted.
    Exact,
}

/// Key context for tables that only ever hold immediates.
///
/// Heap references are rejected as unhashable.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateKeys;

impl KeyContext for ImmediateKeys {
    fn key_hash(&self, key: Value) -> RunResult<u32> {
        key.immediate_hash()
            .ok_or_else(|| ExcType::type_error("unhashable type: 'object'"))
    }

    fn keys_equal(&self, a: Value, b: Value) -> RunResult<bool> {
        Ok(a.numeric_eq(b).unwrap_or(false))
    }
}

/// One key/value pair together with the key's hash.
#[derive(Debug, Clone, Copy)]
pub struct TableEntry {
    pub key: Value,
    pub value: Value,
    hash: u32,
}

impl TableEntry {
    fn gap() -> Self {
        Self {
            key: Value::Kwargs(KWARGS_UNSET),
            value: Value::None,
            hash: 0,
        }
    }

    #[inline]
    fn is_gap(&self) -> bool {
        self.key.is_unset()
    }

    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// Result of probing the bucket array.
#[derive(Debug, Clone, Copy)]
enum Probe {
    Found { bucket: usize, entry: usize },
    /// Bucket where the key would be inserted: the first tombstone seen, or the empty
    /// bucket that ended the scan.
    Vacant { bucket: usize },
}

/// Hash table preserving insertion order. See the [module docs](self).
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<TableEntry>,
    indexes: Vec<isize>,
    count: usize,
}

impl Table {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Length of the ordered entry array, deleted gaps included.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.entries.len()
    }

    /// Size of the bucket array; always zero or a power of two.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.indexes.len()
    }

    /// Looks up `key`.
    pub fn get(&self, ctx: &impl KeyContext, key: Value) -> RunResult<Option<Value>> {
        let hash = ctx.key_hash(key)?;
        self.get_hashed(ctx, key, hash)
    }

    /// Looks up `key` whose hash the caller already computed.
    pub fn get_hashed(&self, ctx: &impl KeyContext, key: Value, hash: u32) -> RunResult<Option<Value>> {
        if self.count == 0 {
            return Ok(None);
        }
        match self.probe(key, hash, KeyPolicy::SameOrEqual, ctx)? {
            Probe::Found { entry, .. } => Ok(Some(self.entries[entry].value)),
            Probe::Vacant { .. } => Ok(None),
        }
    }

    /// Fast path for interned strings with a known hash.
    ///
    /// Interned strings with equal content are the same object, so identity is enough
    /// and no key context is consulted.
    #[must_use]
    pub fn get_by_str(&self, key: Value, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        match self.probe(key, hash, KeyPolicy::Exact, &ImmediateKeys) {
            Ok(Probe::Found { entry, .. }) => Some(self.entries[entry].value),
            _ => None,
        }
    }

    /// Inserts or updates `key`. Returns `true` if the key was not present before.
    pub fn set(&mut self, ctx: &impl KeyContext, key: Value, value: Value) -> RunResult<bool> {
        let hash = ctx.key_hash(key)?;
        self.set_hashed(ctx, key, hash, value)
    }

    /// [`Table::set`] with a precomputed hash.
    pub fn set_hashed(&mut self, ctx: &impl KeyContext, key: Value, hash: u32, value: Value) -> RunResult<bool> {
        if (self.entries.len() + 1) * 4 > self.capacity() * 3 {
            self.grow();
        }
        match self.probe(key, hash, KeyPolicy::SameOrEqual, ctx)? {
            Probe::Found { entry, .. } => {
                self.entries[entry].value = value;
                Ok(false)
            }
            Probe::Vacant { bucket } => {
                self.indexes[bucket] = self.entries.len() as isize;
                self.entries.push(TableEntry { key, value, hash });
                self.count += 1;
                Ok(true)
            }
        }
    }

    /// Updates `key` only if it is already present. Returns whether it was.
    pub fn set_if_exists(&mut self, ctx: &impl KeyContext, key: Value, value: Value) -> RunResult<bool> {
        let hash = ctx.key_hash(key)?;
        if self.count == 0 {
            return Ok(false);
        }
        match self.probe(key, hash, KeyPolicy::SameOrEqual, ctx)? {
            Probe::Found { entry, .. } => {
                self.entries[entry].value = value;
                Ok(true)
            }
            Probe::Vacant { .. } => Ok(false),
        }
    }

    /// Removes `key`, leaving a tombstone. Returns whether the key was present.
    pub fn delete(&mut self, ctx: &impl KeyContext, key: Value) -> RunResult<bool> {
        let hash = ctx.key_hash(key)?;
        self.remove(ctx, key, hash, KeyPolicy::SameOrEqual)
    }

    /// Removes the entry whose key is exactly `key`, without consulting equality.
    pub fn delete_exact(&mut self, ctx: &impl KeyContext, key: Value) -> RunResult<bool> {
        let hash = ctx.key_hash(key)?;
        self.remove(ctx, key, hash, KeyPolicy::Exact)
    }

    /// Identity removal with a hash the caller already knows. Used to drop freed
    /// strings from the intern pool.
    pub fn delete_exact_hashed(&mut self, key: Value, hash: u32) -> bool {
        // exact probes never consult the context
        self.remove(&ImmediateKeys, key, hash, KeyPolicy::Exact).unwrap_or(false)
    }

    fn remove(&mut self, ctx: &impl KeyContext, key: Value, hash: u32, policy: KeyPolicy) -> RunResult<bool> {
        if self.count == 0 {
            return Ok(false);
        }
        match self.probe(key, hash, policy, ctx)? {
            Probe::Found { bucket, entry } => {
                self.indexes[bucket] = TOMBSTONE;
                self.entries[entry] = TableEntry::gap();
                self.count -= 1;
                Ok(true)
            }
            Probe::Vacant { .. } => Ok(false),
        }
    }

    /// Copies every entry of `from` into `self`; on conflicting keys `from` wins.
    pub fn add_all(&mut self, ctx: &impl KeyContext, from: &Self) -> RunResult<()> {
        for entry in from.entries.iter().filter(|e| !e.is_gap()) {
            self.set_hashed(ctx, entry.key, entry.hash, entry.value)?;
        }
        Ok(())
    }

    /// Probe used only by the string intern pool.
    ///
    /// Compares the stored hash and then hands each candidate key to `same_bytes`, which
    /// compares raw string content. No object-level equality is involved.
    pub fn find_interned_string(&self, hash: u32, mut same_bytes: impl FnMut(Value) -> bool) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut bucket = hash as usize & mask;
        loop {
            match self.indexes[bucket] {
                EMPTY => return None,
                TOMBSTONE => {}
                index => {
                    let entry = &self.entries[index as usize];
                    if entry.hash == hash && same_bytes(entry.key) {
                        return Some(entry.key);
                    }
                }
            }
            bucket = (bucket + 1) & mask;
        }
    }

    /// Keys sharing `hash`, in probe order.
    ///
    /// Lets a caller run user-level equality on candidates without holding a borrow of
    /// the table.
    #[must_use]
    pub fn keys_with_hash(&self, hash: u32) -> SmallVec<[Value; 4]> {
        let mut keys = SmallVec::new();
        if self.count == 0 {
            return keys;
        }
        let mask = self.capacity() - 1;
        let mut bucket = hash as usize & mask;
        loop {
            match self.indexes[bucket] {
                EMPTY => return keys,
                TOMBSTONE => {}
                index => {
                    let entry = &self.entries[index as usize];
                    if entry.hash == hash {
                        keys.push(entry.key);
                    }
                }
            }
            bucket = (bucket + 1) & mask;
        }
    }

    /// Live key/value pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().filter(|e| !e.is_gap()).map(|e| (e.key, e.value))
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
        self.iter().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.iter().map(|(_, v)| v)
    }

    /// First live entry at or after raw position `position`, with its position.
    ///
    /// Iterators over tables keep a raw position so they survive re-borrowing the table
    /// between steps.
    #[must_use]
    pub fn next_entry(&self, position: usize) -> Option<(usize, Value, Value)> {
        self.entries
            .iter()
            .enumerate()
            .skip(position)
            .find(|(_, e)| !e.is_gap())
            .map(|(i, e)| (i, e.key, e.value))
    }

    /// Removes every entry for which `keep` returns false, then compacts in place.
    pub fn retain(&mut self, mut keep: impl FnMut(Value, Value) -> bool) {
        let before = self.count;
        for entry in &mut self.entries {
            if !entry.is_gap() && !keep(entry.key, entry.value) {
                *entry = TableEntry::gap();
                self.count -= 1;
            }
        }
        if self.count != before {
            self.rebuild(self.capacity());
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.indexes.clear();
        self.count = 0;
    }

    fn probe(&self, key: Value, hash: u32, policy: KeyPolicy, ctx: &impl KeyContext) -> RunResult<Probe> {
        let mask = self.capacity() - 1;
        let mut bucket = hash as usize & mask;
        let mut tombstone = None;
        loop {
            match self.indexes[bucket] {
                EMPTY => {
                    return Ok(Probe::Vacant {
                        bucket: tombstone.unwrap_or(bucket),
                    });
                }
                TOMBSTONE => {
                    tombstone.get_or_insert(bucket);
                }
                index => {
                    let entry = &self.entries[index as usize];
                    if entry.hash == hash {
                        let matches = entry.key == key
                            || (policy == KeyPolicy::SameOrEqual && ctx.keys_equal(entry.key, key)?);
                        if matches {
                            return Ok(Probe::Found {
                                bucket,
                                entry: index as usize,
                            });
                        }
                    }
                }
            }
            bucket = (bucket + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = self.capacity();
        let new_capacity = if capacity == 0 {
            MIN_CAPACITY
        } else if (self.count + 1) * 2 > capacity {
            capacity * 2
        } else {
            capacity
        };
        self.rebuild(new_capacity);
    }

    /// Drops gaps from `entries` and re-buckets every live entry.
    fn rebuild(&mut self, capacity: usize) {
        self.entries.retain(|e| !e.is_gap());
        self.indexes.clear();
        self.indexes.resize(capacity, EMPTY);
        if capacity == 0 {
            return;
        }
        let mask = capacity - 1;
        for (index, entry) in self.entries.iter().enumerate() {
            let mut bucket = entry.hash as usize & mask;
            while self.indexes[bucket] != EMPTY {
                bucket = (bucket + 1) & mask;
            }
            self.indexes[bucket] = index as isize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tombstones(table: &Table) -> usize {
        table.indexes.iter().filter(|&&i| i == TOMBSTONE).count()
    }

    #[test]
    fn first_insert_allocates_minimum_capacity() {
        let mut table = Table::new();
        assert_eq!(table.capacity(), 0);
        assert!(table.set(&ImmediateKeys, Value::Int(1), Value::Int(10)).unwrap());
        assert_eq!(table.capacity(), MIN_CAPACITY);
    }

    #[test]
    fn delete_leaves_tombstone_and_gap() {
        let mut table = Table::new();
        for i in 0..4 {
            table.set(&ImmediateKeys, Value::Int(i), Value::Int(i)).unwrap();
        }
        assert!(table.delete(&ImmediateKeys, Value::Int(1)).unwrap());
        assert_eq!(table.len(), 3);
        assert_eq!(table.used(), 4, "delete must not shrink the ordered array");
        assert_eq!(tombstones(&table), 1);
    }

    #[test]
    fn tombstone_is_reused_for_reinsertion() {
        let mut table = Table::new();
        // 1 and 9 share a bucket in an 8-slot table
        table.set(&ImmediateKeys, Value::Int(1), Value::Int(1)).unwrap();
        table.set(&ImmediateKeys, Value::Int(9), Value::Int(9)).unwrap();
        table.delete(&ImmediateKeys, Value::Int(1)).unwrap();
        table.set(&ImmediateKeys, Value::Int(17), Value::Int(17)).unwrap();
        assert_eq!(tombstones(&table), 0, "the tombstone left by 1 should take 17");
        assert_eq!(table.get(&ImmediateKeys, Value::Int(9)).unwrap(), Some(Value::Int(9)));
    }

    #[test]
    fn churn_compacts_without_growing() {
        let mut table = Table::new();
        for i in 0..1000 {
            table.set(&ImmediateKeys, Value::Int(i), Value::None).unwrap();
            table.delete(&ImmediateKeys, Value::Int(i)).unwrap();
        }
        assert_eq!(table.capacity(), MIN_CAPACITY);
        assert!(table.is_empty());
    }
}
