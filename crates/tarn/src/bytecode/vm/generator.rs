//! Generator creation, resumption and suspension.
//!
//! A generator runs on the live thread stack like any other call. Resuming pushes
//! the generator's saved values back at the stack top, re-opens the upvalues it
//! parked at the new base and runs a nested loop until the frame yields or returns.
//! A yield copies the frame's region back into the generator and parks any upvalue
//! still open inside it, so later calls can reuse those stack slots.

use super::{FrameExit, Vm};
use crate::{
    exception_private::{ExcType, RunResult},
    heap::{HeapData, HeapId},
    resource::ResourceTracker,
    table::Table,
    tracer::VmTracer,
    types::{GeneratorState, Instance, Payload, UpvalueLocation},
    value::Value,
};

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Allocates a suspended, unstarted generator over `closure` with bound `arguments`.
    ///
    /// The caller keeps `arguments` reachable until this returns.
    pub(crate) fn new_generator(&mut self, closure: HeapId, arguments: Vec<Value>) -> RunResult<HeapId> {
        self.allocate(HeapData::Instance(Instance {
            class: self.classes.generator,
            fields: Table::new(),
            payload: Payload::Generator(Box::new(GeneratorState::new(closure, arguments))),
        }))
    }

    pub(crate) fn generator_state(&self, generator: HeapId) -> RunResult<&GeneratorState> {
        match self.heap.instance(generator).map(|i| &i.payload) {
            Some(Payload::Generator(state)) => Ok(state),
            _ => Err(ExcType::type_error("expected a generator")),
        }
    }

    fn generator_state_mut(&mut self, generator: HeapId) -> &mut GeneratorState {
        match self.heap.instance_mut(generator).map(|i| &mut i.payload) {
            Some(Payload::Generator(state)) => state,
            _ => panic!("generator_state_mut: not a generator"),
        }
    }

    /// Resumes `generator`, delivering `sent` as the value of the pending `yield`.
    ///
    /// Returns the next yielded value, or the generator itself once the body has
    /// finished. An exception escaping the body finishes the generator and propagates.
    pub fn resume_generator(&mut self, generator: HeapId, sent: Value) -> RunResult<Value> {
        let state = self.generator_state(generator)?;
        if state.is_finished() {
            return Ok(Value::Ref(generator));
        }
        if state.running {
            return Err(ExcType::value_error("generator already executing"));
        }
        if !state.started && !sent.is_none() {
            return Err(ExcType::type_error("can't send non-None value to a just-started generator"));
        }
        let closure = state.closure;
        let ip = state.ip.unwrap_or(0);
        let started = state.started;

        let state = self.generator_state_mut(generator);
        let saved = std::mem::take(&mut state.saved);
        let parked = std::mem::take(&mut state.parked);
        state.running = true;
        state.started = true;

        let out_slots = self.thread.stack.len();
        self.push(Value::Ref(closure));
        let base = self.thread.stack.len();
        self.thread.stack.extend(saved);
        if started {
            self.push(sent);
        }
        // parked upvalues sit above every open one: the base is above the old top
        for upvalue in parked {
            if let UpvalueLocation::Parked { offset, .. } = self.heap.upvalue(upvalue).location {
                self.heap.upvalue_mut(upvalue).location = UpvalueLocation::Open {
                    thread: self.thread.id,
                    slot: base + offset,
                };
                self.thread.open_upvalues.push(upvalue);
            }
        }

        if let Err(err) = self.push_frame(closure, base, out_slots) {
            self.close_upvalues(base);
            self.thread.stack.truncate(out_slots);
            self.finish_generator(generator, Value::None);
            return Err(err);
        }
        self.current_frame_mut().ip = ip;
        self.tracer.on_generator_resume(self.thread.frames.len());

        let depth = self.thread.frames.len() - 1;
        match self.run(depth) {
            Ok(FrameExit::Yield(value)) => {
                self.suspend_generator(generator);
                Ok(value)
            }
            Ok(FrameExit::Return(value)) => {
                self.finish_generator(generator, value);
                Ok(Value::Ref(generator))
            }
            Err(err) => {
                self.finish_generator(generator, Value::None);
                Err(err)
            }
        }
    }

    /// Moves the yielding frame's region into `generator` and pops the frame.
    fn suspend_generator(&mut self, generator: HeapId) {
        let frame = *self.current_frame();
        let thread = self.thread.id;

        let mut parked = Vec::new();
        while let Some(&upvalue) = self.thread.open_upvalues.last() {
            match self.heap.upvalue(upvalue).open_slot(thread) {
                Some(slot) if slot >= frame.slots => {
                    self.heap.upvalue_mut(upvalue).location = UpvalueLocation::Parked {
                        generator,
                        offset: slot - frame.slots,
                    };
                    parked.push(upvalue);
                    self.thread.open_upvalues.pop();
                }
                _ => break,
            }
        }
        parked.reverse();

        let saved = self.thread.stack.split_off(frame.slots);
        let saved_len = saved.len();
        self.thread.frames.pop();
        self.thread.stack.truncate(frame.out_slots);

        let state = self.generator_state_mut(generator);
        state.saved = saved;
        state.parked = parked;
        state.ip = Some(frame.ip);
        state.running = false;
        self.tracer.on_generator_suspend(saved_len);
    }

    fn finish_generator(&mut self, generator: HeapId, result: Value) {
        let state = self.generator_state_mut(generator);
        state.ip = None;
        state.running = false;
        state.result = result;
        state.saved.clear();
        state.parked.clear();
    }

    /// Value the body of a finished generator returned.
    pub(crate) fn generator_result(&self, generator: HeapId) -> RunResult<Value> {
        let state = self.generator_state(generator)?;
        if state.is_finished() {
            Ok(state.result)
        } else {
            Err(ExcType::value_error("generator has not finished"))
        }
    }
}
