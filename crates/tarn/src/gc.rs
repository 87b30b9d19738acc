//! Mark-sweep collection with generation aging.
//!
//! A collection is a single stop-the-world pass:
//!
//! 1. every root is marked and pushed onto the gray worklist;
//! 2. gray objects are popped and their children marked until the list is empty;
//! 3. the arena is swept. Marked and immortal objects are kept with their mark bit and
//!    generation reset. Unmarked objects age by one and are freed once they have gone
//!    `GcConfig::generations` consecutive collections unmarked.
//!
//! Freeing a string also drops it from the intern pool, and freeing a class removes it
//! from its base's subclass list. After the sweep the next threshold is twice the live
//! byte count, but never below `GcConfig::initial_threshold`.
//!
//! Roots are supplied by the VM (`Vm::collect_garbage`): every thread's stack, frames,
//! open upvalues, current exception and scratch slots, plus the builtins module, the
//! module table, the built-in classes, special-method names and compiler roots.

use smallvec::SmallVec;

use crate::{
    bytecode::vm::Vm,
    heap::{Heap, HeapData, HeapId, ObjFlags},
    resource::ResourceTracker,
    tracer::VmTracer,
    value::Value,
};

/// Cumulative collector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Number of completed collections.
    pub collections: usize,
    /// Objects freed across all collections.
    pub objects_freed: usize,
    /// Objects freed by the most recent collection.
    pub last_freed: usize,
    /// Bytes charged to live objects after the most recent collection.
    pub live_bytes: usize,
    /// Allocation level that triggers the next collection.
    pub next_threshold: usize,
}

impl<T: ResourceTracker> Heap<T> {
    /// Runs a full collection. Returns the number of objects freed.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>) -> usize {
        let mut gray: Vec<HeapId> = Vec::new();
        for root in roots {
            self.mark_value(root, &mut gray);
        }
        self.trace_references(&mut gray);
        let freed = self.sweep();

        self.next_gc = (self.bytes_allocated * 2).max(self.config.initial_threshold);
        self.gc_stats.collections += 1;
        self.gc_stats.objects_freed += freed;
        self.gc_stats.last_freed = freed;
        self.gc_stats.live_bytes = self.bytes_allocated;
        self.gc_stats.next_threshold = self.next_gc;
        freed
    }

    #[must_use]
    pub fn gc_stats(&self) -> GcStats {
        GcStats {
            next_threshold: self.next_gc,
            ..self.gc_stats
        }
    }

    fn mark_value(&mut self, value: Value, gray: &mut Vec<HeapId>) {
        if let Value::Ref(id) = value {
            self.mark_object(id, gray);
        }
    }

    fn mark_object(&mut self, id: HeapId, gray: &mut Vec<HeapId>) {
        let Some(Some(entry)) = self.entries.get_mut(id.index()) else {
            return;
        };
        if entry.header.flags.contains(ObjFlags::MARKED) {
            return;
        }
        entry.header.flags |= ObjFlags::MARKED;
        gray.push(id);
    }

    /// Drains the gray worklist, blackening each object by marking its children.
    fn trace_references(&mut self, gray: &mut Vec<HeapId>) {
        let mut children: SmallVec<[Value; 16]> = SmallVec::new();
        while let Some(id) = gray.pop() {
            children.clear();
            if let Some(Some(entry)) = self.entries.get(id.index()) {
                entry.data.for_each_child(|child| {
                    if matches!(child, Value::Ref(_)) {
                        children.push(child);
                    }
                });
            }
            for &child in &children {
                self.mark_value(child, gray);
            }
        }
    }

    fn sweep(&mut self) -> usize {
        let generations = self.config.generations.max(1);
        let mut freed = 0;
        for index in 0..self.entries.len() {
            let Some(entry) = &mut self.entries[index] else {
                continue;
            };
            let flags = entry.header.flags;
            if flags.intersects(ObjFlags::MARKED | ObjFlags::IMMORTAL) {
                entry.header.flags.remove(ObjFlags::MARKED);
                entry.header.generation = 0;
                continue;
            }
            entry.header.generation = entry.header.generation.saturating_add(1);
            if entry.header.generation >= generations {
                self.free(HeapId::from_index(index));
                freed += 1;
            }
        }
        freed
    }

    /// Releases one object and runs its type-specific cleanup.
    fn free(&mut self, id: HeapId) {
        let Some(entry) = self.entries[id.index()].take() else {
            return;
        };
        match &entry.data {
            HeapData::Str(_) => {
                self.strings.delete_exact_hashed(Value::Ref(id), entry.header.hash);
            }
            HeapData::Class(class) => {
                if let Some(base) = class.base
                    && let Some(Some(base_entry)) = self.entries.get_mut(base.index())
                    && let HeapData::Class(base_class) = &mut base_entry.data
                {
                    base_class.subclasses.retain(|&sub| sub != id);
                }
            }
            _ => {}
        }
        let size = entry.header.size;
        self.tracker.on_free(|| size);
        self.bytes_allocated = self.bytes_allocated.saturating_sub(size);
        self.free_list.push(id);
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Every value the collector must treat as reachable.
    pub(crate) fn gc_roots(&self) -> Vec<Value> {
        let mut roots = Vec::new();
        for thread in std::iter::once(&self.thread).chain(self.threads.iter().flatten()) {
            roots.extend_from_slice(&thread.stack);
            for frame in &thread.frames {
                roots.push(Value::Ref(frame.closure));
                roots.push(Value::Ref(frame.globals));
            }
            roots.extend(thread.open_upvalues.iter().map(|&id| Value::Ref(id)));
            roots.push(thread.current_exception);
            roots.extend_from_slice(&thread.scratch);
            roots.push(thread.result);
        }
        roots.push(Value::Ref(self.builtins));
        for (name, module) in self.modules.iter() {
            roots.push(name);
            roots.push(module);
        }
        roots.extend(self.classes.iter().map(Value::Ref));
        roots.extend(self.exc_classes.iter().map(|&id| Value::Ref(id)));
        roots.extend(self.special_names.iter().map(|&id| Value::Ref(id)));
        roots.extend_from_slice(&self.compiler_roots);
        roots
    }

    /// Runs a collection now, regardless of the allocation counter.
    ///
    /// Returns the number of objects freed.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.gc_roots();
        let before = self.heap.bytes_allocated;
        let freed = self.heap.collect(roots);
        self.tracer.on_gc(freed, before, self.heap.bytes_allocated);
        freed
    }
}
