//! Upvalue capture, access and closing.
//!
//! A thread keeps its open upvalues in a vector sorted by stack slot, highest slot
//! last, so closing at frame exit pops from the end. An upvalue found open at the slot
//! being captured is reused, which is what makes sibling closures share a variable.

use super::{ThreadState, Vm};
use crate::{
    exception_private::{RunError, RunResult},
    heap::{HeapData, HeapId},
    resource::ResourceTracker,
    table::Table,
    tracer::VmTracer,
    types::{Closure, Payload, Upvalue, UpvalueLocation},
    value::Value,
};

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Returns the open upvalue for `slot` on the current thread, creating it if needed.
    pub(crate) fn capture_upvalue(&mut self, slot: usize) -> RunResult<HeapId> {
        let thread = self.thread.id;
        let heap = &self.heap;
        let pos = self
            .thread
            .open_upvalues
            .partition_point(|&id| heap.upvalue(id).open_slot(thread).is_some_and(|s| s < slot));
        if let Some(&existing) = self.thread.open_upvalues.get(pos)
            && self.heap.upvalue(existing).open_slot(thread) == Some(slot)
        {
            return Ok(existing);
        }

        let id = self.allocate(HeapData::Upvalue(Upvalue::open(thread, slot)))?;
        self.thread.open_upvalues.insert(pos, id);
        self.tracer.on_upvalue_capture(slot);
        Ok(id)
    }

    /// Closes every open upvalue at or above stack index `from`.
    pub(crate) fn close_upvalues(&mut self, from: usize) {
        let thread = self.thread.id;
        let mut closed = 0;
        while let Some(&id) = self.thread.open_upvalues.last() {
            let Some(slot) = self.heap.upvalue(id).open_slot(thread) else {
                break;
            };
            if slot < from {
                break;
            }
            let value = self.thread.stack.get(slot).copied().unwrap_or(Value::None);
            self.heap.upvalue_mut(id).location = UpvalueLocation::Closed(value);
            self.thread.open_upvalues.pop();
            closed += 1;
        }
        if closed > 0 {
            self.tracer.on_upvalue_close(closed);
        }
    }

    /// Current value of upvalue `id`, wherever it lives.
    pub(crate) fn upvalue_get(&self, id: HeapId) -> Value {
        match self.heap.upvalue(id).location {
            UpvalueLocation::Open { thread, slot } => self
                .thread_stack(thread)
                .and_then(|stack| stack.get(slot).copied())
                .unwrap_or(Value::None),
            UpvalueLocation::Parked { generator, offset } => match self.heap.instance(generator).map(|i| &i.payload) {
                Some(Payload::Generator(state)) => state.saved.get(offset).copied().unwrap_or(Value::None),
                _ => Value::None,
            },
            UpvalueLocation::Closed(value) => value,
        }
    }

    fn upvalue_set(&mut self, id: HeapId, value: Value) {
        match self.heap.upvalue(id).location {
            UpvalueLocation::Open { thread, slot } => {
                if let Some(cell) = self.thread_stack_mut(thread).and_then(|stack| stack.get_mut(slot)) {
                    *cell = value;
                }
            }
            UpvalueLocation::Parked { generator, offset } => {
                if let Some(instance) = self.heap.instance_mut(generator)
                    && let Payload::Generator(state) = &mut instance.payload
                    && let Some(cell) = state.saved.get_mut(offset)
                {
                    *cell = value;
                }
            }
            UpvalueLocation::Closed(_) => self.heap.upvalue_mut(id).location = UpvalueLocation::Closed(value),
        }
    }

    fn thread_stack(&self, thread: usize) -> Option<&Vec<Value>> {
        if thread == self.thread.id {
            return Some(&self.thread.stack);
        }
        self.threads.iter().flatten().find(|t| t.id == thread).map(|t| &t.stack)
    }

    fn thread_stack_mut(&mut self, thread: usize) -> Option<&mut Vec<Value>> {
        if thread == self.thread.id {
            return Some(&mut self.thread.stack);
        }
        self.threads
            .iter_mut()
            .flatten()
            .find(|t| t.id == thread)
            .map(|t: &mut ThreadState| &mut t.stack)
    }

    fn frame_upvalue(&self, index: usize) -> RunResult<HeapId> {
        let closure = self.current_frame().closure;
        self.heap
            .closure(closure)
            .upvalues
            .get(index)
            .copied()
            .ok_or_else(|| RunError::internal("upvalue index out of range"))
    }

    pub(super) fn load_upvalue(&self, index: usize) -> RunResult<Value> {
        Ok(self.upvalue_get(self.frame_upvalue(index)?))
    }

    /// Assigns through upvalue `index` of the running closure.
    ///
    /// A closed upvalue still shared with sibling closures of the declaring frame is
    /// copied first, so the write stays private to this closure.
    pub(super) fn store_upvalue(&mut self, index: usize, value: Value) -> RunResult<()> {
        let id = self.frame_upvalue(index)?;
        let upvalue = *self.heap.upvalue(id);
        if upvalue.is_closed() && upvalue.sharers > 1 {
            let private = self.allocate(HeapData::Upvalue(Upvalue::closed(value)))?;
            self.heap.upvalue_mut(id).sharers -= 1;
            let closure = self.current_frame().closure;
            self.heap.closure_mut(closure).upvalues[index] = private;
            return Ok(());
        }
        self.upvalue_set(id, value);
        Ok(())
    }

    /// Instantiates code constant `index` as a closure over the current frame.
    ///
    /// Reads one `(is_local, index)` descriptor per upvalue the code declares.
    pub(super) fn op_closure(&mut self, index: u16) -> RunResult<()> {
        let code = match self.read_constant(index)? {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Code(_)) => id,
            _ => return Err(RunError::internal("Closure operand is not a code object")),
        };
        let frame = *self.current_frame();
        let count = self.heap.code(code).upvalue_count;

        let closure = self.allocate(HeapData::Closure(Closure {
            code,
            upvalues: Vec::with_capacity(count),
            fields: Table::new(),
            annotations: Value::None,
            globals: frame.globals,
        }))?;
        // rooted while captures allocate
        self.push(Value::Ref(closure));

        for _ in 0..count {
            let is_local = self.fetch_u8()? == 1;
            let index = usize::from(self.fetch_u16()?);
            let upvalue = if is_local {
                let upvalue = self.capture_upvalue(frame.slots + index)?;
                self.heap.upvalue_mut(upvalue).sharers += 1;
                upvalue
            } else {
                // nested functions see the same variable as their enclosing closure
                self.heap
                    .closure(frame.closure)
                    .upvalues
                    .get(index)
                    .copied()
                    .ok_or_else(|| RunError::internal("enclosing upvalue index out of range"))?
            };
            self.heap.closure_mut(closure).upvalues.push(upvalue);
        }
        Ok(())
    }
}
