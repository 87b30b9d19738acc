use std::{borrow::Cow, collections::BTreeMap};

use bitflags::bitflags;
use strum::IntoStaticStr;

use crate::{
    exception_private::{ExcType, RunError, RunResult},
    gc::GcStats,
    resource::{GcConfig, ResourceError, ResourceTracker},
    table::{ImmediateKeys, KeyContext, Table},
    types::{
        BoundMethod, Bytes, Class, Closure, CodeObject, Instance, NativeFunction, Payload, SpecialMethod, Str, Tuple,
        Upvalue, UpvalueLocation,
        str::sdbm_hash,
        tuple::fold_tuple_hash,
    },
    value::Value,
};

/// Snapshot of heap state at a point in time.
///
/// Captures object counts by type, total allocations, and memory estimates.
/// Used for monitoring heap growth and comparing states via heap diffs.
///
/// The `objects_by_type` map uses `BTreeMap` for deterministic iteration order,
/// making snapshots suitable for display and comparison without sort overhead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Total number of live objects on the heap.
    pub live_objects: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total heap capacity (live + free).
    pub total_slots: usize,
    /// Breakdown of live objects by `HeapData` variant name.
    pub objects_by_type: BTreeMap<&'static str, usize>,
    /// Number of entries in the string intern pool.
    pub interned_strings: usize,
    /// Bytes charged to live objects.
    pub bytes_allocated: usize,
    /// Resource tracker allocation count, if using `LimitedTracker`.
    pub tracker_allocations: Option<usize>,
    /// Resource tracker memory usage in bytes, if using `LimitedTracker`.
    pub tracker_memory_bytes: Option<usize>,
}

/// Difference between two heap snapshots.
///
/// Computed by comparing a "before" and "after" `HeapStats` via
/// [`HeapStats::diff`]. Positive deltas mean growth, negative means shrinkage.
///
/// Only types present in at least one of the two snapshots appear in
/// `objects_by_type_delta`. Types exclusive to the "after" snapshot are
/// listed in `new_types`; types exclusive to the "before" snapshot are in
/// `removed_types`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapDiff {
    /// Change in live object count (`after - before`).
    pub live_objects_delta: isize,
    pub free_slots_delta: isize,
    pub total_slots_delta: isize,
    /// Per-type deltas. Only includes types present in either snapshot.
    pub objects_by_type_delta: BTreeMap<&'static str, isize>,
    /// Types that appeared in "after" but not "before".
    pub new_types: Vec<&'static str>,
    /// Types that appeared in "before" but not "after".
    pub removed_types: Vec<&'static str>,
    pub interned_strings_delta: isize,
    pub bytes_allocated_delta: isize,
    /// Change in tracker allocations (only if both snapshots have the value).
    pub tracker_allocations_delta: Option<isize>,
    /// Change in tracker memory bytes (only if both snapshots have the value).
    pub tracker_memory_bytes_delta: Option<isize>,
}

impl HeapStats {
    /// Computes the difference between `self` ("before") and `other` ("after").
    ///
    /// For tracker fields, a delta is computed only when both snapshots contain `Some`.
    #[must_use]
    pub fn diff(&self, other: &Self) -> HeapDiff {
        let (objects_by_type_delta, new_types, removed_types) =
            compute_type_deltas(&self.objects_by_type, &other.objects_by_type);

        HeapDiff {
            live_objects_delta: isize_delta(self.live_objects, other.live_objects),
            free_slots_delta: isize_delta(self.free_slots, other.free_slots),
            total_slots_delta: isize_delta(self.total_slots, other.total_slots),
            objects_by_type_delta,
            new_types,
            removed_types,
            interned_strings_delta: isize_delta(self.interned_strings, other.interned_strings),
            bytes_allocated_delta: isize_delta(self.bytes_allocated, other.bytes_allocated),
            tracker_allocations_delta: optional_isize_delta(self.tracker_allocations, other.tracker_allocations),
            tracker_memory_bytes_delta: optional_isize_delta(self.tracker_memory_bytes, other.tracker_memory_bytes),
        }
    }
}

impl HeapDiff {
    /// Returns `true` when all deltas are zero and no types were added or removed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live_objects_delta == 0
            && self.free_slots_delta == 0
            && self.total_slots_delta == 0
            && self.interned_strings_delta == 0
            && self.bytes_allocated_delta == 0
            && self.new_types.is_empty()
            && self.removed_types.is_empty()
            && self.objects_by_type_delta.values().all(|&v| v == 0)
            && self.tracker_allocations_delta.is_none_or(|d| d == 0)
            && self.tracker_memory_bytes_delta.is_none_or(|d| d == 0)
    }
}

impl std::fmt::Display for HeapDiff {
    /// Produces a human-readable summary of what changed between two heap
    /// snapshots. Example output:
    ///
    /// ```text
    /// HeapDiff: +3 live objects, +4 slots
    ///   Instance: +1
    ///   Str: +2
    ///   New types: Closure
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "HeapDiff: no changes");
        }

        write!(
            f,
            "HeapDiff: {:+} live objects, {:+} slots",
            self.live_objects_delta, self.total_slots_delta
        )?;

        for (&type_name, &delta) in &self.objects_by_type_delta {
            if delta != 0 {
                write!(f, "\n  {type_name}: {delta:+}")?;
            }
        }

        if !self.new_types.is_empty() {
            write!(f, "\n  New types: {}", self.new_types.join(", "))?;
        }
        if !self.removed_types.is_empty() {
            write!(f, "\n  Removed types: {}", self.removed_types.join(", "))?;
        }

        if self.interned_strings_delta != 0 {
            write!(f, "\n  Interned strings: {:+}", self.interned_strings_delta)?;
        }
        if self.bytes_allocated_delta != 0 {
            write!(f, "\n  Bytes: {:+}", self.bytes_allocated_delta)?;
        }

        if let Some(alloc_delta) = self.tracker_allocations_delta
            && alloc_delta != 0
        {
            write!(f, "\n  Tracker allocations: {alloc_delta:+}")?;
        }
        if let Some(mem_delta) = self.tracker_memory_bytes_delta
            && mem_delta != 0
        {
            write!(f, "\n  Tracker memory: {mem_delta:+} bytes")?;
        }

        Ok(())
    }
}

/// Computes `after - before` as `isize`, handling the `usize -> isize` conversion.
fn isize_delta(before: usize, after: usize) -> isize {
    (after as isize).wrapping_sub(before as isize)
}

/// Computes the delta between two optional `usize` values.
///
/// Returns `Some(delta)` only when both values are `Some`.
fn optional_isize_delta(before: Option<usize>, after: Option<usize>) -> Option<isize> {
    match (before, after) {
        (Some(b), Some(a)) => Some(isize_delta(b, a)),
        _ => None,
    }
}

/// Computes per-type deltas, plus lists of new and removed types.
fn compute_type_deltas(
    before: &BTreeMap<&'static str, usize>,
    after: &BTreeMap<&'static str, usize>,
) -> (BTreeMap<&'static str, isize>, Vec<&'static str>, Vec<&'static str>) {
    let mut deltas = BTreeMap::new();
    let mut new_types = Vec::new();
    let mut removed_types = Vec::new();

    for (&type_name, &count) in before {
        let after_count = after.get(type_name).copied().unwrap_or(0);
        deltas.insert(type_name, isize_delta(count, after_count));
        if !after.contains_key(type_name) {
            removed_types.push(type_name);
        }
    }

    for (&type_name, &count) in after {
        if !before.contains_key(type_name) {
            deltas.insert(type_name, count as isize);
            new_types.push(type_name);
        }
    }

    (deltas, new_types, removed_types)
}

/// Unique identifier for values stored inside the heap arena.
///
/// Indexes must fit the 48-bit payload of a packed reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(usize);

impl HeapId {
    #[inline]
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// Per-object flag word.
    #[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
    pub struct ObjFlags: u16 {
        /// Reached during the current mark phase.
        const MARKED = 1 << 0;
        /// Never freed by the sweep.
        const IMMORTAL = 1 << 1;
        /// `repr` of this object is in progress; a nested `repr` prints a placeholder.
        const IN_REPR = 1 << 2;
        /// `ObjHeader::hash` holds the object's hash.
        const HASH_VALID = 1 << 3;

        // === String width (exactly one set on every string) ===
        const STR_ASCII = 1 << 4;
        const STR_UCS1 = 1 << 5;
        const STR_UCS2 = 1 << 6;
        const STR_UCS4 = 1 << 7;
    }
}

/// Bookkeeping shared by every heap object.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjHeader {
    pub flags: ObjFlags,
    /// Consecutive collections this object went unmarked.
    pub generation: u8,
    pub hash: u32,
    /// Bytes charged to the allocator for this object.
    pub size: usize,
}

/// HeapData captures every runtime object that lives in the arena.
#[derive(Debug, IntoStaticStr)]
pub enum HeapData {
    Str(Str),
    Bytes(Bytes),
    Tuple(Tuple),
    Code(Box<CodeObject>),
    Closure(Closure),
    Native(NativeFunction),
    BoundMethod(BoundMethod),
    Class(Box<Class>),
    Instance(Instance),
    Upvalue(Upvalue),
}

impl HeapData {
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        self.into()
    }

    /// Approximate bytes owned by the object beyond its arena slot.
    #[must_use]
    pub fn estimate_size(&self) -> usize {
        match self {
            Self::Str(s) => s.estimate_size(),
            Self::Bytes(b) => b.len(),
            Self::Tuple(t) => t.len() * size_of::<Value>(),
            Self::Code(code) => code.estimate_size(),
            Self::Closure(c) => c.upvalues.len() * size_of::<HeapId>() + c.fields.capacity() * size_of::<Value>(),
            Self::Native(_) | Self::BoundMethod(_) | Self::Upvalue(_) => 0,
            Self::Class(c) => c.estimate_size(),
            Self::Instance(i) => i.fields.capacity() * size_of::<(Value, Value)>() + i.payload.estimate_size(),
        }
    }

    /// Calls `visit` for every value this object keeps alive.
    ///
    /// A class's subclass list is deliberately absent: subclasses are referenced weakly.
    pub fn for_each_child(&self, mut visit: impl FnMut(Value)) {
        let table = |table: &Table, visit: &mut dyn FnMut(Value)| {
            for (k, v) in table.iter() {
                visit(k);
                visit(v);
            }
        };
        match self {
            Self::Str(_) | Self::Bytes(_) | Self::Native(_) => {}
            Self::Tuple(t) => t.as_slice().iter().copied().for_each(visit),
            Self::Code(code) => {
                code.chunk.constants.iter().copied().for_each(&mut visit);
                let names = code
                    .name
                    .iter()
                    .chain(&code.doc)
                    .chain(&code.chunk.filename)
                    .chain(&code.positional_names)
                    .chain(code.keyword_only.iter().map(|k| &k.name))
                    .chain(code.locals.iter().map(|l| &l.name));
                for &id in names {
                    visit(Value::Ref(id));
                }
            }
            Self::Closure(c) => {
                visit(Value::Ref(c.code));
                visit(Value::Ref(c.globals));
                visit(c.annotations);
                for &upvalue in &c.upvalues {
                    visit(Value::Ref(upvalue));
                }
                table(&c.fields, &mut visit);
            }
            Self::BoundMethod(m) => {
                visit(m.receiver);
                visit(m.method);
            }
            Self::Class(c) => {
                visit(Value::Ref(c.name));
                for &id in c.filename.iter().chain(&c.doc).chain(&c.base) {
                    visit(Value::Ref(id));
                }
                table(&c.methods, &mut visit);
                for method in <SpecialMethod as strum::IntoEnumIterator>::iter() {
                    if let Some(value) = c.special(method) {
                        visit(value);
                    }
                }
            }
            Self::Instance(i) => {
                visit(Value::Ref(i.class));
                table(&i.fields, &mut visit);
                i.payload.for_each_child(visit);
            }
            Self::Upvalue(u) => match u.location {
                UpvalueLocation::Open { .. } => {}
                UpvalueLocation::Parked { generator, .. } => visit(Value::Ref(generator)),
                UpvalueLocation::Closed(value) => visit(value),
            },
        }
    }
}

/// Which table of an object [`Heap::with_table`] operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSlot {
    /// Attribute table: instance fields, class methods or function attributes.
    Fields,
    /// The `dict` or `set` payload of an instance.
    Payload,
}

/// A single arena slot: header plus the object itself.
#[derive(Debug)]
pub struct HeapEntry {
    pub header: ObjHeader,
    pub data: HeapData,
}

/// Arena of every heap object, together with the string intern pool and the
/// collector's accounting.
///
/// Objects are addressed by [`HeapId`]. A freed slot becomes `None` and its id goes on
/// the free list for reuse by a later allocation.
#[derive(Debug)]
pub struct Heap<T: ResourceTracker> {
    pub(crate) entries: Vec<Option<HeapEntry>>,
    pub(crate) free_list: Vec<HeapId>,
    /// Intern pool: every live string is a key, mapped to `None`.
    pub(crate) strings: Table,
    pub(crate) tracker: T,
    pub(crate) bytes_allocated: usize,
    pub(crate) next_gc: usize,
    pub(crate) config: GcConfig,
    /// Nesting depth of `pause_gc`; collection never starts while non-zero.
    pub(crate) paused: usize,
    pub(crate) gc_stats: GcStats,
}

impl<T: ResourceTracker> Heap<T> {
    pub fn new(tracker: T, config: GcConfig) -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            strings: Table::new(),
            tracker,
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            config,
            paused: 0,
            gc_stats: GcStats::default(),
        }
    }

    /// Allocates a new object with a zeroed header.
    ///
    /// Strings and byte buffers get their hash installed here. This never collects; the
    /// VM checks [`Heap::should_collect`] before calling it.
    pub fn allocate(&mut self, data: HeapData) -> Result<HeapId, ResourceError> {
        let size = size_of::<HeapEntry>() + data.estimate_size();
        self.tracker.on_allocate(|| size)?;
        Ok(self.insert(data, size, ObjFlags::empty()))
    }

    /// Allocates an immortal object outside the resource budget.
    ///
    /// Used while bootstrapping built-in classes and functions, which live as long as
    /// the VM and are never handed to the tracker's `on_free`.
    pub fn allocate_permanent(&mut self, data: HeapData) -> HeapId {
        let size = size_of::<HeapEntry>() + data.estimate_size();
        self.insert(data, size, ObjFlags::IMMORTAL)
    }

    fn insert(&mut self, data: HeapData, size: usize, flags: ObjFlags) -> HeapId {
        let mut header = ObjHeader {
            flags,
            size,
            ..ObjHeader::default()
        };
        match &data {
            HeapData::Str(s) => {
                header.flags |= ObjFlags::HASH_VALID | s.width().flag();
                header.hash = sdbm_hash(s.as_str().as_bytes());
            }
            HeapData::Bytes(b) => {
                header.flags |= ObjFlags::HASH_VALID;
                header.hash = sdbm_hash(b.as_slice());
            }
            _ => {}
        }
        self.bytes_allocated += size;

        let entry = HeapEntry { header, data };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            self.entries.push(Some(entry));
            HeapId(self.entries.len() - 1)
        }
    }

    /// Returns the interned string with content `text`, allocating it on first use.
    pub fn intern(&mut self, text: &str) -> Result<HeapId, ResourceError> {
        if let Some(id) = self.find_interned(text) {
            return Ok(id);
        }
        let id = self.allocate(HeapData::Str(Str::new(text)))?;
        self.add_to_pool(id);
        Ok(id)
    }

    /// Interns `text` as an immortal string. An existing pooled string is made immortal.
    pub fn intern_permanent(&mut self, text: &str) -> HeapId {
        if let Some(id) = self.find_interned(text) {
            self.make_immortal(id);
            return id;
        }
        let id = self.allocate_permanent(HeapData::Str(Str::new(text)));
        self.add_to_pool(id);
        id
    }

    pub(crate) fn find_interned(&self, text: &str) -> Option<HeapId> {
        let hash = sdbm_hash(text.as_bytes());
        let entries = &self.entries;
        self.strings
            .find_interned_string(hash, |key| {
                key.as_heap_id()
                    .and_then(|id| entries.get(id.index())?.as_ref())
                    .is_some_and(|entry| matches!(&entry.data, HeapData::Str(s) if s.as_str() == text))
            })
            .and_then(Value::as_heap_id)
    }

    fn add_to_pool(&mut self, id: HeapId) {
        let hash = self.str_hash(id);
        let keys = HeapKeys { entries: &self.entries };
        // identity comparison never fails for strings
        let _ = self.strings.set_hashed(&keys, Value::Ref(id), hash, Value::None);
    }

    /// Whether the allocation counter calls for a collection.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.paused == 0 && (self.config.stress || self.bytes_allocated > self.next_gc)
    }

    pub fn pause_gc(&mut self) {
        self.paused += 1;
    }

    pub fn resume_gc(&mut self) {
        self.paused = self.paused.saturating_sub(1);
    }

    /// Returns a reference to the object stored at `id`.
    ///
    /// # Panics
    /// Panics if the id is out of range or the object has been freed.
    #[must_use]
    pub fn get(&self, id: HeapId) -> &HeapData {
        &self
            .entries
            .get(id.index())
            .expect("Heap::get: slot missing")
            .as_ref()
            .expect("Heap::get: object already freed")
            .data
    }

    /// Returns a mutable reference to the object stored at `id`.
    ///
    /// # Panics
    /// Panics if the id is out of range or the object has been freed.
    pub fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::get_mut: slot missing")
            .as_mut()
            .expect("Heap::get_mut: object already freed")
            .data
    }

    /// Returns the object if the slot is live, `None` if it was freed.
    #[must_use]
    pub fn get_if_live(&self, id: HeapId) -> Option<&HeapData> {
        self.entries.get(id.index())?.as_ref().map(|entry| &entry.data)
    }

    #[must_use]
    pub fn is_live(&self, id: HeapId) -> bool {
        self.get_if_live(id).is_some()
    }

    #[must_use]
    pub fn header(&self, id: HeapId) -> &ObjHeader {
        &self
            .entries
            .get(id.index())
            .expect("Heap::header: slot missing")
            .as_ref()
            .expect("Heap::header: object already freed")
            .header
    }

    pub fn header_mut(&mut self, id: HeapId) -> &mut ObjHeader {
        &mut self
            .entries
            .get_mut(id.index())
            .expect("Heap::header_mut: slot missing")
            .as_mut()
            .expect("Heap::header_mut: object already freed")
            .header
    }

    /// Text of the string at `id`.
    ///
    /// # Panics
    /// Panics if `id` is not a string.
    #[must_use]
    pub fn str(&self, id: HeapId) -> &str {
        match self.get(id) {
            HeapData::Str(s) => s.as_str(),
            other => panic!("Heap::str: expected Str, found {}", other.variant_name()),
        }
    }

    /// Text of `value` if it is a string.
    #[must_use]
    pub fn as_str(&self, value: Value) -> Option<&str> {
        match self.get_if_live(value.as_heap_id()?)? {
            HeapData::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Interned-string hash of `id`, as installed at allocation.
    #[must_use]
    pub fn str_hash(&self, id: HeapId) -> u32 {
        self.header(id).hash
    }

    #[must_use]
    pub fn class(&self, id: HeapId) -> &Class {
        match self.get(id) {
            HeapData::Class(c) => c,
            other => panic!("Heap::class: expected Class, found {}", other.variant_name()),
        }
    }

    pub fn class_mut(&mut self, id: HeapId) -> &mut Class {
        match self.get_mut(id) {
            HeapData::Class(c) => c,
            other => panic!("Heap::class_mut: expected Class, found {}", other.variant_name()),
        }
    }

    #[must_use]
    pub fn instance(&self, id: HeapId) -> Option<&Instance> {
        match self.get_if_live(id)? {
            HeapData::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn instance_mut(&mut self, id: HeapId) -> Option<&mut Instance> {
        match self.get_mut(id) {
            HeapData::Instance(i) => Some(i),
            _ => None,
        }
    }

    #[must_use]
    pub fn closure(&self, id: HeapId) -> &Closure {
        match self.get(id) {
            HeapData::Closure(c) => c,
            other => panic!("Heap::closure: expected Closure, found {}", other.variant_name()),
        }
    }

    pub fn closure_mut(&mut self, id: HeapId) -> &mut Closure {
        match self.get_mut(id) {
            HeapData::Closure(c) => c,
            other => panic!("Heap::closure_mut: expected Closure, found {}", other.variant_name()),
        }
    }

    #[must_use]
    pub fn code(&self, id: HeapId) -> &CodeObject {
        match self.get(id) {
            HeapData::Code(c) => c,
            other => panic!("Heap::code: expected Code, found {}", other.variant_name()),
        }
    }

    pub fn code_mut(&mut self, id: HeapId) -> &mut CodeObject {
        match self.get_mut(id) {
            HeapData::Code(c) => c,
            other => panic!("Heap::code_mut: expected Code, found {}", other.variant_name()),
        }
    }

    #[must_use]
    pub fn upvalue(&self, id: HeapId) -> &Upvalue {
        match self.get(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("Heap::upvalue: expected Upvalue, found {}", other.variant_name()),
        }
    }

    pub fn upvalue_mut(&mut self, id: HeapId) -> &mut Upvalue {
        match self.get_mut(id) {
            HeapData::Upvalue(u) => u,
            other => panic!("Heap::upvalue_mut: expected Upvalue, found {}", other.variant_name()),
        }
    }

    /// The table stored in `slot` of object `id`, if the object has one there.
    pub fn table_mut(&mut self, id: HeapId, slot: TableSlot) -> Option<&mut Table> {
        match (self.get_mut(id), slot) {
            (HeapData::Instance(i), TableSlot::Fields) => Some(&mut i.fields),
            (HeapData::Instance(i), TableSlot::Payload) => match &mut i.payload {
                Payload::Dict(table) | Payload::Set(table) => Some(table),
                _ => None,
            },
            (HeapData::Class(c), TableSlot::Fields) => Some(&mut c.methods),
            (HeapData::Closure(c), TableSlot::Fields) => Some(&mut c.fields),
            _ => None,
        }
    }

    #[must_use]
    pub fn table(&self, id: HeapId, slot: TableSlot) -> Option<&Table> {
        match (self.get_if_live(id)?, slot) {
            (HeapData::Instance(i), TableSlot::Fields) => Some(&i.fields),
            (HeapData::Instance(i), TableSlot::Payload) => match &i.payload {
                Payload::Dict(table) | Payload::Set(table) => Some(table),
                _ => None,
            },
            (HeapData::Class(c), TableSlot::Fields) => Some(&c.methods),
            (HeapData::Closure(c), TableSlot::Fields) => Some(&c.fields),
            _ => None,
        }
    }

    /// Runs `f` on a table owned by `id` with a key context over the rest of the heap.
    ///
    /// The table is moved out of its object for the duration, so `f` may hash and compare
    /// keys that live anywhere in the arena.
    ///
    /// # Panics
    /// Panics if `id` has no table in `slot`.
    pub fn with_table<R>(&mut self, id: HeapId, slot: TableSlot, f: impl FnOnce(&mut Table, &HeapKeys<'_>) -> R) -> R {
        let table = self.table_mut(id, slot).expect("Heap::with_table: object has no such table");
        let mut taken = std::mem::take(table);
        let result = f(&mut taken, &HeapKeys { entries: &self.entries });
        *self.table_mut(id, slot).expect("Heap::with_table: object has no such table") = taken;
        result
    }

    /// Class of an instance value, if it is one.
    #[must_use]
    pub fn instance_class(&self, value: Value) -> Option<HeapId> {
        self.instance(value.as_heap_id()?).map(|i| i.class)
    }

    /// Name of the type of a heap value, for error messages.
    #[must_use]
    pub fn type_name(&self, value: Value) -> Cow<'_, str> {
        let Some(data) = value.as_heap_id().and_then(|id| self.get_if_live(id)) else {
            return Cow::Borrowed(value.immediate_type_name());
        };
        Cow::Borrowed(match data {
            HeapData::Str(_) => "str",
            HeapData::Bytes(_) => "bytes",
            HeapData::Tuple(_) => "tuple",
            HeapData::Code(_) => "codeobject",
            HeapData::Closure(_) => "function",
            HeapData::Native(_) => "builtin_function_or_method",
            HeapData::BoundMethod(_) => "method",
            HeapData::Class(_) => "type",
            HeapData::Upvalue(_) => "upvalue",
            HeapData::Instance(i) => return Cow::Borrowed(self.str(self.class(i.class).name)),
        })
    }

    /// Key context backed by this heap.
    #[must_use]
    pub fn keys(&self) -> HeapKeys<'_> {
        HeapKeys { entries: &self.entries }
    }

    /// Hashes `value`, caching tuple hashes in the header.
    ///
    /// Instances whose class defines `__hash__` must have had their hash installed with
    /// [`Heap::set_cached_hash`] first.
    pub fn hash_value(&mut self, value: Value) -> RunResult<u32> {
        let hash = self.keys().key_hash(value)?;
        if let Some(id) = value.as_heap_id()
            && matches!(self.get(id), HeapData::Tuple(_))
        {
            self.set_cached_hash(id, hash);
        }
        Ok(hash)
    }

    pub fn set_cached_hash(&mut self, id: HeapId, hash: u32) {
        let header = self.header_mut(id);
        header.hash = hash;
        header.flags |= ObjFlags::HASH_VALID;
    }

    /// Marks an object as never collectable.
    pub fn make_immortal(&mut self, id: HeapId) {
        self.header_mut(id).flags |= ObjFlags::IMMORTAL;
    }

    /// Sets the `IN_REPR` guard; returns `false` if it was already set.
    pub fn enter_repr(&mut self, id: HeapId) -> bool {
        let header = self.header_mut(id);
        if header.flags.contains(ObjFlags::IN_REPR) {
            return false;
        }
        header.flags |= ObjFlags::IN_REPR;
        true
    }

    pub fn exit_repr(&mut self, id: HeapId) {
        self.header_mut(id).flags.remove(ObjFlags::IN_REPR);
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.entries.len() - self.free_list.len()
    }

    #[must_use]
    pub fn interned_strings(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut T {
        &mut self.tracker
    }

    /// Returns a snapshot of the current heap state.
    ///
    /// Iterates all heap slots to count live vs free entries and categorize
    /// live objects by their `HeapData` variant name.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        let mut live_objects: usize = 0;
        let mut objects_by_type: BTreeMap<&'static str, usize> = BTreeMap::new();

        for entry in self.entries.iter().flatten() {
            live_objects += 1;
            *objects_by_type.entry(entry.data.variant_name()).or_insert(0) += 1;
        }

        HeapStats {
            live_objects,
            free_slots: self.entries.len() - live_objects,
            total_slots: self.entries.len(),
            objects_by_type,
            interned_strings: self.strings.len(),
            bytes_allocated: self.bytes_allocated,
            tracker_allocations: self.tracker.allocation_count(),
            tracker_memory_bytes: self.tracker.current_memory_bytes(),
        }
    }
}

/// [`KeyContext`] for tables whose keys may be heap objects.
///
/// Strings hash by content (installed at allocation) and compare by identity, which is
/// exact because they are interned. Tuples and byte buffers compare structurally.
/// Instances hash by identity unless their class defines `__hash__`, whose result the
/// VM caches in the header before any table operation. Lists, dicts, sets and classes
/// that define `__eq__` without `__hash__` are unhashable.
#[derive(Debug, Clone, Copy)]
pub struct HeapKeys<'a> {
    entries: &'a [Option<HeapEntry>],
}

impl HeapKeys<'_> {
    fn entry(&self, id: HeapId) -> RunResult<&HeapEntry> {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| RunError::internal("table key refers to a freed object"))
    }

    fn class_name(&self, class: HeapId) -> String {
        let name = self.entry(class).ok().and_then(|entry| match &entry.data {
            HeapData::Class(c) => self.entry(c.name).ok(),
            _ => None,
        });
        match name.map(|entry| &entry.data) {
            Some(HeapData::Str(s)) => s.as_str().to_owned(),
            _ => "object".to_owned(),
        }
    }

    fn ref_hash(&self, id: HeapId) -> RunResult<u32> {
        let entry = self.entry(id)?;
        if entry.header.flags.contains(ObjFlags::HASH_VALID) {
            return Ok(entry.header.hash);
        }
        match &entry.data {
            HeapData::Tuple(t) => {
                let hashes = t
                    .as_slice()
                    .iter()
                    .map(|&item| self.key_hash(item))
                    .collect::<RunResult<Vec<_>>>()?;
                Ok(fold_tuple_hash(t.len(), hashes))
            }
            HeapData::Instance(instance) => {
                if matches!(
                    instance.payload,
                    Payload::List(_) | Payload::Dict(_) | Payload::Set(_) | Payload::Slice { .. }
                ) {
                    return Err(ExcType::unhashable(self.class_name(instance.class)));
                }
                if let HeapData::Class(class) = &self.entry(instance.class)?.data {
                    if class.is_unhashable() {
                        return Err(ExcType::unhashable(self.class_name(instance.class)));
                    }
                    if class.special(SpecialMethod::Hash).is_some() {
                        return Err(RunError::internal("user __hash__ was not computed before table access"));
                    }
                }
                Ok(identity_hash(id))
            }
            _ => Ok(identity_hash(id)),
        }
    }

    /// Structural equality used for table keys; never calls user code.
    #[must_use]
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        if a == b {
            return true;
        }
        if let Some(eq) = a.numeric_eq(b) {
            return eq;
        }
        let (Value::Ref(x), Value::Ref(y)) = (a, b) else {
            return false;
        };
        let (Ok(x), Ok(y)) = (self.entry(x), self.entry(y)) else {
            return false;
        };
        match (&x.data, &y.data) {
            (HeapData::Str(s), HeapData::Str(t)) => s.as_str() == t.as_str(),
            (HeapData::Bytes(s), HeapData::Bytes(t)) => s == t,
            (HeapData::Tuple(s), HeapData::Tuple(t)) => {
                s.len() == t.len()
                    && s.as_slice()
                        .iter()
                        .zip(t.as_slice())
                        .all(|(&p, &q)| self.values_equal(p, q))
            }
            _ => false,
        }
    }
}

impl KeyContext for HeapKeys<'_> {
    fn key_hash(&self, key: Value) -> RunResult<u32> {
        match key {
            Value::Ref(id) => self.ref_hash(id),
            other => ImmediateKeys.key_hash(other),
        }
    }

    fn keys_equal(&self, a: Value, b: Value) -> RunResult<bool> {
        Ok(self.values_equal(a, b))
    }
}

/// Hash of an object that has no content hash: derived from its arena index.
#[must_use]
pub fn identity_hash(id: HeapId) -> u32 {
    (id.index() as u32).wrapping_mul(0x9E37_79B1)
}
