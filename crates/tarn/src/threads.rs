//! OS threads over one shared VM.
//!
//! Every thread owns a [`ThreadState`](crate::bytecode::vm::ThreadState) registered
//! with the VM: its own value stack, frames, open upvalues and exception state. The
//! heap, intern table and modules are shared, and all access to them happens while
//! holding the runtime lock, so a thread runs its callable start to finish with the
//! lock held. Only the main thread triggers collections; the states of the other
//! threads are scanned as roots. A finished thread's result stays rooted in its
//! state until the thread is joined.

use std::{sync::Arc, thread::JoinHandle};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    bytecode::{Vm, vm::ThreadState},
    exception_private::{ExcType, RunError},
    exception_public::Exception,
    object::Object,
    resource::ResourceTracker,
    tracer::{NoopTracer, VmTracer},
    value::Value,
};

/// A [`Vm`] behind the runtime lock, shareable between OS threads.
pub struct SharedVm<T: ResourceTracker, Tr: VmTracer = NoopTracer>(Arc<Mutex<Vm<T, Tr>>>);

impl<T: ResourceTracker, Tr: VmTracer> SharedVm<T, Tr> {
    pub fn new(vm: Vm<T, Tr>) -> Self {
        Self(Arc::new(Mutex::new(vm)))
    }

    /// Takes the runtime lock.
    pub fn lock(&self) -> MutexGuard<'_, Vm<T, Tr>> {
        self.0.lock()
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Clone for SharedVm<T, Tr> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: ResourceTracker, Tr: VmTracer> std::fmt::Debug for SharedVm<T, Tr> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedVm(..)")
    }
}

impl<T, Tr> SharedVm<T, Tr>
where
    T: ResourceTracker + Send + 'static,
    Tr: VmTracer + Send + 'static,
{
    /// Starts an OS thread that calls `callee` with `args`.
    ///
    /// The callee and arguments are rooted in the new thread's stack before this
    /// returns, so the caller may drop its own references.
    pub fn spawn(&self, callee: Value, args: &[Value]) -> ThreadHandle<T, Tr> {
        let (slot, id) = self.lock().register_thread(callee, args);
        let shared = self.clone();
        let handle = std::thread::spawn(move || shared.lock().run_thread(slot));
        ThreadHandle {
            vm: self.clone(),
            slot,
            id,
            handle,
        }
    }
}

/// A spawned thread, joined to collect its result.
#[derive(Debug)]
pub struct ThreadHandle<T: ResourceTracker, Tr: VmTracer = NoopTracer> {
    vm: SharedVm<T, Tr>,
    slot: usize,
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: ResourceTracker, Tr: VmTracer> ThreadHandle<T, Tr> {
    /// Identifier of the thread's state, unique for the VM's lifetime.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the thread and converts what its callable returned or raised.
    pub fn join(self) -> Result<Object, Exception> {
        let panicked = self.handle.join().is_err();
        let mut vm = self.vm.lock();
        let Some(state) = vm.threads.get_mut(self.slot).and_then(Option::take) else {
            return Err(Exception::new(ExcType::ThreadError, Some("thread state vanished".to_owned())));
        };
        if panicked {
            return Err(Exception::new(ExcType::ThreadError, Some(format!("thread {} panicked", self.id))));
        }
        // the result is unrooted once the state is taken: root it while converting
        vm.push(state.result);
        let outcome = match &state.failure {
            None => Ok(vm.to_object(state.result)),
            Some(err) => Err(vm.to_exception(err)),
        };
        vm.pop();
        outcome
    }
}

impl<T: ResourceTracker, Tr: VmTracer> Vm<T, Tr> {
    /// Number of spawned threads that have not been joined.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.iter().flatten().count()
    }

    /// Registers a thread state holding `callee` and `args`; returns its slot and id.
    fn register_thread(&mut self, callee: Value, args: &[Value]) -> (usize, usize) {
        let id = self.next_thread_id;
        self.next_thread_id += 1;
        let mut state = ThreadState::new(id, false);
        state.stack.push(callee);
        state.stack.extend_from_slice(args);
        match self.threads.iter().position(Option::is_none) {
            Some(slot) => {
                self.threads[slot] = Some(state);
                (slot, id)
            }
            None => {
                self.threads.push(Some(state));
                (self.threads.len() - 1, id)
            }
        }
    }

    /// Runs the callable registered in `slot` as the current thread.
    ///
    /// The state that was current is parked in the slot for the duration and put back
    /// afterwards; the finished state returns to the slot with its result.
    fn run_thread(&mut self, slot: usize) {
        let Some(state) = self.threads.get_mut(slot).and_then(Option::take) else {
            return;
        };
        let outer = std::mem::replace(&mut self.thread, state);
        self.threads[slot] = Some(outer);

        let argc = self.thread.stack.len() - 1;
        let outcome = self.call_stack(argc);
        match outcome {
            Ok(value) => self.thread.result = value,
            Err(err) => {
                if let RunError::Raised(exc) = err {
                    self.thread.result = exc;
                }
                self.thread.failure = Some(err);
            }
        }
        self.thread.stack.clear();
        self.thread.frames.clear();
        self.thread.current_exception = Value::None;

        let outer = self.threads[slot].take();
        if let Some(outer) = outer {
            let finished = std::mem::replace(&mut self.thread, outer);
            self.threads[slot] = Some(finished);
        }
    }
}
