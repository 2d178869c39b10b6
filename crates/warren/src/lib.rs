#![doc = include_str!("../../../README.md")]
#![expect(clippy::cast_possible_truncation, reason = "register and id narrowing is bounds-checked upstream")]
#![expect(clippy::missing_panics_doc, reason = "internal invariant breaches panic by design")]
#![expect(clippy::unnecessary_wraps, reason = "dispatch signatures are uniform")]

mod analysis;
mod builtins;
mod code;
mod compile;
mod error;
mod instr;
mod intern;
mod machine;
mod optimize;
mod resource;
mod session;
mod store;
mod symtab;
mod term;
mod tracer;

pub use crate::{
    analysis::{ClauseAnalysis, CutPlan, VarInfo, analyze},
    builtins::{ArithOp, BUILTIN_BIT, Builtin},
    code::{CallPoint, CallTarget, CodeMachine, FAIL_ADDR, HALT_ADDR},
    compile::{
        CompileOptions, CompiledQuery, FirstArg, PredicateListing, QUERY_PRED, assemble, classify_first_arg,
        compile_clause, query_clause,
    },
    error::{CompileError, CompileErrorKind, LinkError, MachineResult, SessionError, SolveError, Span},
    instr::{Instr, InstrDisplay, Label, Listing, Opcode, Place, RegId, SlotId},
    intern::{FunctorId, FunctorName, Interns, VarId, WellKnown},
    machine::{Bindings, Machine, MachineStats},
    optimize::optimize,
    resource::{LimitedTracker, NoLimitTracker, ResourceError, ResourceTracker},
    session::{CompilerObserver, Session},
    store::{Addr, Cell, ChoiceFrame, EnvFrame, Heap},
    symtab::{Field, FieldValue, ScopeKey, SymbolKey, SymbolTable},
    term::{Clause, Term, TermDisplay, TermPath, VisitOrder},
    tracer::{CountingTracer, MachineSnapshot, MachineTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
};
