use crate::{heap::HeapId, value::Value};

/// Where an upvalue currently keeps its variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueLocation {
    /// Live stack slot of a running frame on thread `thread`.
    Open { thread: usize, slot: usize },
    /// Slot of a suspended generator's saved values.
    Parked { generator: HeapId, offset: usize },
    /// The declaring frame is gone; the value lives here.
    Closed(Value),
}

/// A captured variable.
#[derive(Debug, Clone, Copy)]
pub struct Upvalue {
    pub location: UpvalueLocation,
    /// Number of closures that captured this upvalue directly from the declaring frame.
    ///
    /// A closed upvalue with more than one sharer is copied before a write, so sibling
    /// closures stop observing each other's assignments once the declaring frame has
    /// returned. Closures that reach it through an enclosing closure are not counted.
    pub sharers: u32,
}

impl Upvalue {
    #[must_use]
    pub fn open(thread: usize, slot: usize) -> Self {
        Self {
            location: UpvalueLocation::Open { thread, slot },
            sharers: 0,
        }
    }

    #[must_use]
    pub fn closed(value: Value) -> Self {
        Self {
            location: UpvalueLocation::Closed(value),
            sharers: 1,
        }
    }

    /// Stack slot when open on `thread`.
    #[must_use]
    pub fn open_slot(&self, thread: usize) -> Option<usize> {
        match self.location {
            UpvalueLocation::Open { thread: t, slot } if t == thread => Some(slot),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.location, UpvalueLocation::Closed(_))
    }
}
