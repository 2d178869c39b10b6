//! Error types for the three failure categories: compile-time, link-time and
//! run-time.
//!
//! Unification failure is deliberately absent here: a failed unification is the
//! normal control-flow mechanism that drives backtracking and never surfaces as
//! an error. The `SolveError` variants are the *fatal* conditions that abort a
//! whole resolution. Internal invariant breaches (choicepoint underflow, an
//! unknown opcode reaching the encoder) are bugs and panic instead of being
//! reported.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::intern::FunctorId;

/// Result type alias for operations that can produce a fatal runtime error.
pub type MachineResult<T> = Result<T, SolveError>;

/// A line/column range attached to a clause by the front-end parser.
///
/// The engine never produces spans itself; it only carries them through so
/// compile-time diagnostics can point back at source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// 1-based start line.
    pub line: u32,
    /// 1-based start column.
    pub column: u32,
    /// 1-based end line (inclusive).
    pub end_line: u32,
    /// 1-based end column (exclusive).
    pub end_column: u32,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{line}:{col}", line = self.line, col = self.column)
    }
}

/// A clause was refused by the compiler. The session continues; the clause is
/// simply not added to its predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    /// Source position of the offending clause, when the front-end supplied one.
    pub span: Option<Span>,
}

/// The individual compile-time failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// The clause head is not a callable term (a variable, or a literal).
    MalformedHead,
    /// A body goal is not a callable term.
    MalformedGoal,
    /// The clause head names a built-in predicate, which cannot be redefined.
    BuiltinRedefinition(FunctorId),
    /// A functor exceeds the 255-argument limit imposed by 1-byte register
    /// operands.
    ArityOverflow(u32),
    /// The clause needs more temporary registers than the instruction format
    /// can address.
    RegisterOverflow,
    /// The clause needs more permanent variables than an environment frame can
    /// hold.
    SlotOverflow,
    /// A query was compiled with more free variables than argument registers.
    TooManyQueryVariables(usize),
}

impl CompileError {
    pub(crate) fn new(kind: CompileErrorKind, span: Option<Span>) -> Self {
        Self { kind, span }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            CompileErrorKind::MalformedHead => write!(f, "clause head is not a callable term")?,
            CompileErrorKind::MalformedGoal => write!(f, "body goal is not a callable term")?,
            CompileErrorKind::BuiltinRedefinition(id) => {
                write!(f, "cannot redefine built-in predicate (functor id {id})", id = id.index())?;
            }
            CompileErrorKind::ArityOverflow(arity) => write!(f, "functor arity {arity} exceeds the limit of 255")?,
            CompileErrorKind::RegisterOverflow => write!(f, "clause requires more than 255 temporary registers")?,
            CompileErrorKind::SlotOverflow => write!(f, "clause requires more than 255 permanent variables")?,
            CompileErrorKind::TooManyQueryVariables(n) => {
                write!(f, "query has {n} free variables, more than the 255 argument registers")?;
            }
        }
        if let Some(span) = self.span {
            write!(f, " at {span}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}

/// A predicate could not be emitted into the code area. The offending
/// predicate is not installed; previously installed predicates are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A `call`/`execute` operand named a functor with no reserved call-point
    /// and no built-in.
    Unresolved {
        /// The predicate whose listing contained the dangling reference.
        caller: FunctorId,
        /// The functor that could not be resolved.
        callee: FunctorId,
    },
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved { caller, callee } => write!(
                f,
                "predicate (functor id {caller}) calls unresolved functor id {callee}",
                caller = caller.index(),
                callee = callee.index()
            ),
        }
    }
}

impl std::error::Error for LinkError {}

/// A fatal runtime condition. The resolution is aborted; no partial bindings
/// are returned.
#[derive(Debug, Clone, PartialEq)]
pub enum SolveError {
    /// An arithmetic built-in was applied to an unbound variable.
    Instantiation,
    /// An arithmetic built-in was applied to a non-numeric term.
    ArithmeticType {
        /// Rendered form of the offending term.
        culprit: String,
    },
    /// Integer division or modulo by zero.
    DivisionByZero,
    /// Integer arithmetic overflowed the immediate cell range.
    IntOverflow,
    /// A resource limit was exceeded (heap, steps, choicepoints).
    Resource(crate::resource::ResourceError),
    /// `resolve` was called with no query installed.
    NoQuery,
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instantiation => write!(f, "arguments are not sufficiently instantiated"),
            Self::ArithmeticType { culprit } => {
                write!(f, "type error: expected an evaluable term, got {culprit}")
            }
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::IntOverflow => write!(f, "integer arithmetic overflow"),
            Self::Resource(err) => write!(f, "{err}"),
            Self::NoQuery => write!(f, "no query installed; call set_query first"),
        }
    }
}

impl std::error::Error for SolveError {}

impl From<crate::resource::ResourceError> for SolveError {
    fn from(err: crate::resource::ResourceError) -> Self {
        Self::Resource(err)
    }
}

/// Either failure class a combined compile-and-install operation can hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Compile(CompileError),
    Link(LinkError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile(err) => write!(f, "{err}"),
            Self::Link(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CompileError> for SessionError {
    fn from(err: CompileError) -> Self {
        Self::Compile(err)
    }
}

impl From<LinkError> for SessionError {
    fn from(err: LinkError) -> Self {
        Self::Link(err)
    }
}
