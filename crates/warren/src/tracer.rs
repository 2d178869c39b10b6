//! Execution tracing for the resolver.
//!
//! Provides a trait-based monitor system with zero-cost abstraction: the
//! machine carries the tracer as a type parameter, so with [`NoopTracer`]
//! every hook compiles away entirely via monomorphization, exactly as
//! [`NoLimitTracker`](crate::resource::NoLimitTracker) eliminates resource
//! checks.
//!
//! Hooks fire synchronously at well-defined boundaries: on reset, on each
//! decoded instruction, on every call/execute entry, on each solution and on
//! each backtrack. Tracers observe through a read-only [`MachineSnapshot`];
//! they cannot mutate machine state.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`CountingTracer`] | Per-opcode frequency counters |
//! | [`RecordingTracer`] | Full event recording for post-mortem analysis |

use ahash::AHashMap;

use crate::{
    instr::{Instr, Opcode},
    intern::FunctorId,
    store::Cell,
};

/// Read-only view of the machine handed to every hook.
#[derive(Debug, Clone, Copy)]
pub struct MachineSnapshot<'a> {
    /// Program counter (byte address in the code area).
    pub p: u32,
    /// Continuation pointer.
    pub cp: u32,
    /// Heap top.
    pub h: usize,
    /// Trail top.
    pub tr: usize,
    /// Environment-stack depth.
    pub env_depth: usize,
    /// Choicepoint-stack depth.
    pub choice_depth: usize,
    /// The heap cells, read-only.
    pub heap: &'a [Cell],
}

/// Trace event captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// The machine was reset for a new query.
    Reset,
    /// An instruction was dispatched at the given address.
    Step { p: u32, opcode: Opcode },
    /// Control entered a predicate via `call` or `execute`.
    Execute { functor: FunctorId },
    /// A solution was produced.
    Solution,
    /// The machine backtracked; `choice_depth` is the depth before the jump.
    Backtrack { choice_depth: usize },
}

/// Trait for resolver monitors.
///
/// All methods have default no-op implementations, so [`NoopTracer`] requires
/// zero lines of code and compiles to zero instructions.
pub trait MachineTracer: std::fmt::Debug {
    /// Called when `set_query` resets the machine.
    #[inline(always)]
    fn on_reset(&mut self, _state: &MachineSnapshot<'_>) {}

    /// Called before each instruction dispatch.
    ///
    /// This is the hottest hook; implementations should be as lightweight as
    /// possible.
    #[inline(always)]
    fn on_step(&mut self, _instr: &Instr, _state: &MachineSnapshot<'_>) {}

    /// Called on every `call`/`execute` entry, user-defined or built-in.
    #[inline(always)]
    fn on_execute(&mut self, _functor: FunctorId, _state: &MachineSnapshot<'_>) {}

    /// Called when a solution is produced.
    #[inline(always)]
    fn on_solution(&mut self, _state: &MachineSnapshot<'_>) {}

    /// Called on every backtrack, before the machine state is restored.
    #[inline(always)]
    fn on_backtrack(&mut self, _state: &MachineSnapshot<'_>) {}
}

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl MachineTracer for NoopTracer {}

/// Tracer that prints a human-readable execution log to stderr.
///
/// Output format:
/// ```text
/// [  112] get_struc      H=14  TR=2  E=1  B=1
///   >>> execute member/2
///   <<< backtrack (depth 1)
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl MachineTracer for StderrTracer {
    fn on_reset(&mut self, _state: &MachineSnapshot<'_>) {
        eprintln!("--- reset ---");
    }

    fn on_step(&mut self, instr: &Instr, state: &MachineSnapshot<'_>) {
        let mnemonic: &'static str = instr.opcode().into();
        eprintln!(
            "[{p:>5}] {mnemonic:<16} H={h}  TR={tr}  E={e}  B={b}",
            p = state.p,
            h = state.h,
            tr = state.tr,
            e = state.env_depth,
            b = state.choice_depth
        );
    }

    fn on_execute(&mut self, functor: FunctorId, _state: &MachineSnapshot<'_>) {
        eprintln!("  >>> execute functor#{id}", id = functor.index());
    }

    fn on_solution(&mut self, _state: &MachineSnapshot<'_>) {
        eprintln!("  === solution");
    }

    fn on_backtrack(&mut self, state: &MachineSnapshot<'_>) {
        eprintln!("  <<< backtrack (depth {d})", d = state.choice_depth);
    }
}

/// Tracer that counts opcode dispatch frequencies.
#[derive(Debug, Clone, Default)]
pub struct CountingTracer {
    counts: AHashMap<Opcode, u64>,
    executes: u64,
    backtracks: u64,
}

impl CountingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch count for one opcode.
    #[must_use]
    pub fn count(&self, opcode: Opcode) -> u64 {
        self.counts.get(&opcode).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn executes(&self) -> u64 {
        self.executes
    }

    #[must_use]
    pub fn backtracks(&self) -> u64 {
        self.backtracks
    }
}

impl MachineTracer for CountingTracer {
    fn on_step(&mut self, instr: &Instr, _state: &MachineSnapshot<'_>) {
        *self.counts.entry(instr.opcode()).or_insert(0) += 1;
    }

    fn on_execute(&mut self, _functor: FunctorId, _state: &MachineSnapshot<'_>) {
        self.executes += 1;
    }

    fn on_backtrack(&mut self, _state: &MachineSnapshot<'_>) {
        self.backtracks += 1;
    }
}

/// Tracer that records every event for post-mortem inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded events, in order.
    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

impl MachineTracer for RecordingTracer {
    fn on_reset(&mut self, _state: &MachineSnapshot<'_>) {
        self.events.push(TraceEvent::Reset);
    }

    fn on_step(&mut self, instr: &Instr, state: &MachineSnapshot<'_>) {
        self.events.push(TraceEvent::Step {
            p: state.p,
            opcode: instr.opcode(),
        });
    }

    fn on_execute(&mut self, functor: FunctorId, _state: &MachineSnapshot<'_>) {
        self.events.push(TraceEvent::Execute { functor });
    }

    fn on_solution(&mut self, _state: &MachineSnapshot<'_>) {
        self.events.push(TraceEvent::Solution);
    }

    fn on_backtrack(&mut self, state: &MachineSnapshot<'_>) {
        self.events.push(TraceEvent::Backtrack {
            choice_depth: state.choice_depth,
        });
    }
}
