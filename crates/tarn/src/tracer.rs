//! VM execution tracing.
//!
//! The VM is generic over a [`VmTracer`]; every hook has an `#[inline(always)]` no-op
//! default, so `Vm<_, NoopTracer>` carries no tracing cost at all. Concrete tracers
//! override only the hooks they need:
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | No-op (default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency counters, call depth, collector activity |
//! | [`CoverageTracer`] | Which bytecode offsets executed |
//! | [`RecordingTracer`] | Full event stream for post-mortem analysis |
//!
//! ```ignore
//! let mut vm = Vm::with_tracer(NoLimitTracker, GcConfig::default(), ProfilingTracer::new());
//! // ... run ...
//! println!("{}", vm.tracer().report());
//! ```

use std::collections::HashMap;

use crate::bytecode::Opcode;

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched.
    Instruction {
        /// Byte offset of the opcode in its chunk.
        ip: usize,
        opcode: Opcode,
        /// Values above the current frame's base.
        stack_depth: usize,
    },
    /// A managed call pushed a frame.
    Call { func_name: Option<String>, depth: usize },
    /// A frame returned.
    Return { depth: usize },
    /// A closure captured a stack slot.
    UpvalueCapture { slot: usize },
    /// Open upvalues were closed at frame exit.
    UpvalueClose { count: usize },
    /// An exception started unwinding.
    Exception { type_name: String, depth: usize },
    /// A collection finished.
    Gc { freed: usize, bytes_before: usize, bytes_after: usize },
    /// A generator was resumed.
    GeneratorResume { depth: usize },
    /// A generator yielded, saving `saved` values.
    GeneratorSuspend { saved: usize },
}

/// Trait for VM execution tracing.
///
/// All methods have default no-op implementations, so [`NoopTracer`] requires
/// zero lines of code and compiles to zero instructions.
pub trait VmTracer: std::fmt::Debug {
    /// Called before each opcode dispatch. This is the hottest hook.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called when a managed call pushes a frame; `depth` is the frame count after the push.
    #[inline(always)]
    fn on_call(&mut self, _func_name: Option<&str>, _depth: usize) {}

    /// Called when a frame is popped; `depth` is the frame count after the pop.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when a closure captures stack slot `slot` as a new open upvalue.
    #[inline(always)]
    fn on_upvalue_capture(&mut self, _slot: usize) {}

    /// Called after closing `count` open upvalues.
    #[inline(always)]
    fn on_upvalue_close(&mut self, _count: usize) {}

    /// Called when an exception starts unwinding.
    #[inline(always)]
    fn on_exception(&mut self, _type_name: &str, _depth: usize) {}

    /// Called after each collection.
    #[inline(always)]
    fn on_gc(&mut self, _freed: usize, _bytes_before: usize, _bytes_after: usize) {}

    /// Called when a generator frame is pushed for resumption.
    #[inline(always)]
    fn on_generator_resume(&mut self, _depth: usize) {}

    /// Called when a generator suspends at a `yield`.
    #[inline(always)]
    fn on_generator_suspend(&mut self, _saved: usize) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {}

// ============================================================================
// StderrTracer
// ============================================================================

/// Tracer that prints a human-readable execution log to stderr.
///
/// Output format:
/// ```text
/// [    0] LoadConst  stack=0  frames=1
///   >>> CALL inner                depth=2
/// [    0] LoadUpvalue  stack=0  frames=2
///   <<< RETURN              depth=1
///   ### GC freed=12 bytes=4096->2048
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Stop printing after this many instructions. None = unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that stops after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[{ip:>5}] {opcode:?}  stack={stack_depth}  frames={frame_depth}");
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_call(&mut self, func_name: Option<&str>, depth: usize) {
        if self.stopped {
            return;
        }
        let name = func_name.unwrap_or("<anonymous>");
        eprintln!("  >>> CALL {name:<20} depth={depth}");
    }

    fn on_return(&mut self, depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("  <<< RETURN              depth={depth}");
    }

    fn on_upvalue_capture(&mut self, slot: usize) {
        if self.stopped {
            return;
        }
        eprintln!("  ... CAPTURE slot={slot}");
    }

    fn on_upvalue_close(&mut self, count: usize) {
        if self.stopped || count == 0 {
            return;
        }
        eprintln!("  ... CLOSE {count} upvalue(s)");
    }

    fn on_exception(&mut self, type_name: &str, depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("  !!! RAISE {type_name:<19} depth={depth}");
    }

    fn on_gc(&mut self, freed: usize, bytes_before: usize, bytes_after: usize) {
        eprintln!("  ### GC freed={freed} bytes={bytes_before}->{bytes_after}");
    }

    fn on_generator_resume(&mut self, depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("  >>> RESUME generator    depth={depth}");
    }

    fn on_generator_suspend(&mut self, saved: usize) {
        if self.stopped {
            return;
        }
        eprintln!("  <<< YIELD saved={saved}");
    }
}

// ============================================================================
// ProfilingTracer
// ============================================================================

/// Tracer that collects execution statistics.
///
/// Retrieve results via [`ProfilingTracer::report`] after execution.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: HashMap<Opcode, u64>,
    total_instructions: u64,
    max_depth: usize,
    total_calls: u64,
    total_exceptions: u64,
    total_collections: u64,
    total_freed: u64,
    total_resumes: u64,
}

/// Summary report from a profiling trace.
#[derive(Debug)]
pub struct ProfilingReport {
    /// Per-opcode execution counts, sorted by frequency (highest first).
    pub opcode_counts: Vec<(Opcode, u64)>,
    pub total_instructions: u64,
    pub max_depth: usize,
    pub total_calls: u64,
    pub total_exceptions: u64,
    pub total_collections: u64,
    /// Objects freed across all collections.
    pub total_freed: u64,
    pub total_resumes: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a report. Opcode counts are sorted by frequency, most executed first.
    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));
        ProfilingReport {
            opcode_counts,
            total_instructions: self.total_instructions,
            max_depth: self.max_depth,
            total_calls: self.total_calls,
            total_exceptions: self.total_exceptions,
            total_collections: self.total_collections,
            total_freed: self.total_freed,
            total_resumes: self.total_resumes,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
    }

    #[inline]
    fn on_call(&mut self, _func_name: Option<&str>, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_exception(&mut self, _type_name: &str, _depth: usize) {
        self.total_exceptions += 1;
    }

    fn on_gc(&mut self, freed: usize, _bytes_before: usize, _bytes_after: usize) {
        self.total_collections += 1;
        self.total_freed += freed as u64;
    }

    fn on_generator_resume(&mut self, depth: usize) {
        self.total_resumes += 1;
        self.max_depth = self.max_depth.max(depth);
    }
}

impl std::fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== VM Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Max call depth:     {}", self.max_depth)?;
        writeln!(f, "Exceptions:         {}", self.total_exceptions)?;
        writeln!(f, "Generator resumes:  {}", self.total_resumes)?;
        writeln!(
            f,
            "Collections:        {} ({} objects freed)",
            self.total_collections, self.total_freed
        )?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions as f64) * 100.0;
            writeln!(f, "  {opcode:<20?} {count:>10}  ({pct:>5.1}%)")?;
        }
        Ok(())
    }
}

// ============================================================================
// CoverageTracer
// ============================================================================

/// Tracer that records which instruction offsets were executed.
#[derive(Debug, Default)]
pub struct CoverageTracer {
    ips: ahash::AHashSet<usize>,
}

impl CoverageTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn covered_ips(&self) -> &ahash::AHashSet<usize> {
        &self.ips
    }

    /// Returns the number of unique instruction offsets executed.
    #[must_use]
    pub fn coverage_count(&self) -> usize {
        self.ips.len()
    }
}

impl VmTracer for CoverageTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        self.ips.insert(ip);
    }
}

// ============================================================================
// RecordingTracer
// ============================================================================

/// Tracer that records every event.
///
/// The most expensive tracer (allocates per event); use it for short runs.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_some_and(|l| self.events.len() >= l) {
            return;
        }
        self.events.push(event);
    }
}

impl VmTracer for RecordingTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        self.record(TraceEvent::Instruction {
            ip,
            opcode,
            stack_depth,
        });
    }

    fn on_call(&mut self, func_name: Option<&str>, depth: usize) {
        self.record(TraceEvent::Call {
            func_name: func_name.map(String::from),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_upvalue_capture(&mut self, slot: usize) {
        self.record(TraceEvent::UpvalueCapture { slot });
    }

    fn on_upvalue_close(&mut self, count: usize) {
        if count > 0 {
            self.record(TraceEvent::UpvalueClose { count });
        }
    }

    fn on_exception(&mut self, type_name: &str, depth: usize) {
        self.record(TraceEvent::Exception {
            type_name: type_name.to_owned(),
            depth,
        });
    }

    fn on_gc(&mut self, freed: usize, bytes_before: usize, bytes_after: usize) {
        self.record(TraceEvent::Gc {
            freed,
            bytes_before,
            bytes_after,
        });
    }

    fn on_generator_resume(&mut self, depth: usize) {
        self.record(TraceEvent::GeneratorResume { depth });
    }

    fn on_generator_suspend(&mut self, saved: usize) {
        self.record(TraceEvent::GeneratorSuspend { saved });
    }
}
