use crate::{heap::HeapId, value::Value};

/// Suspended execution state of a generator.
///
/// While suspended, the values that were on the stack above the frame base live in
/// `saved`, and upvalues that pointed into that region are parked on the generator.
/// Resuming pushes `saved` back onto the running thread's stack and re-opens the parked
/// upvalues at the new base.
#[derive(Debug)]
pub struct GeneratorState {
    pub closure: HeapId,
    pub saved: Vec<Value>,
    /// Resume offset; `None` once the body has returned or raised.
    pub ip: Option<usize>,
    pub running: bool,
    pub started: bool,
    /// Value the body returned.
    pub result: Value,
    /// Upvalues re-homed into `saved` at the last suspension.
    pub parked: Vec<HeapId>,
}

impl GeneratorState {
    #[must_use]
    pub fn new(closure: HeapId, arguments: Vec<Value>) -> Self {
        Self {
            closure,
            saved: arguments,
            ip: Some(0),
            running: false,
            started: false,
            result: Value::None,
            parked: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.ip.is_none()
    }

    pub fn for_each_child(&self, mut visit: impl FnMut(Value)) {
        visit(Value::Ref(self.closure));
        self.saved.iter().copied().for_each(&mut visit);
        visit(self.result);
        for &upvalue in &self.parked {
            visit(Value::Ref(upvalue));
        }
    }
}
