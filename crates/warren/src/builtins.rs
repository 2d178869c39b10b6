//! Built-in predicate table.
//!
//! Built-ins are addressed through the call-point resolver: `resolve` answers
//! them with a reserved address range (the high bit set, the discriminant in
//! the low bits) so `call`/`execute` encode uniformly to a 4-byte code
//! address whether the target is compiled code or a built-in. The machine
//! recognizes the range at transfer time and runs the built-in inline with
//! `proceed` semantics.
//!
//! Failure of a built-in (`fail/0`, a false comparison, a failed `=/2`) is
//! ordinary backtracking. Arithmetic built-ins applied to unbound or
//! non-numeric terms abort the whole resolution with a fatal
//! [`SolveError`](crate::error::SolveError).

use strum::FromRepr;

use crate::intern::{FunctorId, WellKnown};

/// Address-space bit marking a built-in target in encoded `call`/`execute`
/// operands.
pub const BUILTIN_BIT: u32 = 0x8000_0000;

/// The built-in predicates.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr)]
pub enum Builtin {
    /// `true/0` — always succeeds.
    True,
    /// `fail/0` — always fails.
    Fail,
    /// `=/2` — unification.
    Unify,
    /// `\=/2` — succeeds iff the arguments do not unify; bindings made during
    /// the trial are undone either way.
    NotUnify,
    /// `</2` — arithmetic comparison.
    Lt,
    /// `>/2`.
    Gt,
    /// `=</2`.
    Le,
    /// `>=/2`.
    Ge,
    /// `=:=/2` — arithmetic equality.
    ArithEq,
    /// `=\=/2` — arithmetic inequality.
    ArithNe,
    /// `is/2` — evaluate the right argument, unify with the left.
    Is,
}

impl Builtin {
    /// Looks up a built-in by functor id. Only the well-known block can
    /// match, so this is a constant-time discriminant comparison.
    #[must_use]
    pub fn from_functor(f: FunctorId) -> Option<Self> {
        let wk = WellKnown::from_repr(f.index())?;
        let builtin = match wk {
            WellKnown::True => Self::True,
            WellKnown::Fail => Self::Fail,
            WellKnown::Unify => Self::Unify,
            WellKnown::NotUnify => Self::NotUnify,
            WellKnown::Lt => Self::Lt,
            WellKnown::Gt => Self::Gt,
            WellKnown::Le => Self::Le,
            WellKnown::Ge => Self::Ge,
            WellKnown::ArithEq => Self::ArithEq,
            WellKnown::ArithNe => Self::ArithNe,
            WellKnown::Is => Self::Is,
            _ => return None,
        };
        Some(builtin)
    }

    /// The functor this built-in answers for.
    #[must_use]
    pub fn functor(self) -> FunctorId {
        let wk = match self {
            Self::True => WellKnown::True,
            Self::Fail => WellKnown::Fail,
            Self::Unify => WellKnown::Unify,
            Self::NotUnify => WellKnown::NotUnify,
            Self::Lt => WellKnown::Lt,
            Self::Gt => WellKnown::Gt,
            Self::Le => WellKnown::Le,
            Self::Ge => WellKnown::Ge,
            Self::ArithEq => WellKnown::ArithEq,
            Self::ArithNe => WellKnown::ArithNe,
            Self::Is => WellKnown::Is,
        };
        wk.functor_id()
    }

    /// Number of argument registers the built-in consumes.
    #[must_use]
    pub fn arity(self) -> u8 {
        match self {
            Self::True | Self::Fail => 0,
            _ => 2,
        }
    }

    /// The reserved code address this built-in resolves to.
    #[must_use]
    pub fn address(self) -> u32 {
        BUILTIN_BIT | u32::from(self as u8)
    }

    /// Recovers a built-in from a reserved code address.
    #[must_use]
    pub fn from_address(addr: u32) -> Option<Self> {
        if addr & BUILTIN_BIT == 0 {
            return None;
        }
        Self::from_repr((addr & !BUILTIN_BIT) as u8)
    }
}

/// Evaluable functors recognized by the arithmetic evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    IntDiv,
    Mod,
    Neg,
}

impl ArithOp {
    /// Classifies a functor as an evaluable operator.
    #[must_use]
    pub fn from_functor(f: FunctorId) -> Option<Self> {
        let op = match WellKnown::from_repr(f.index())? {
            WellKnown::Add => Self::Add,
            WellKnown::Sub => Self::Sub,
            WellKnown::Mul => Self::Mul,
            WellKnown::IntDiv => Self::IntDiv,
            WellKnown::Mod => Self::Mod,
            WellKnown::Neg => Self::Neg,
            _ => return None,
        };
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_addresses_round_trip() {
        for raw in 0..=10u8 {
            let builtin = Builtin::from_repr(raw).expect("all discriminants covered");
            assert_eq!(Builtin::from_address(builtin.address()), Some(builtin));
        }
        assert_eq!(Builtin::from_address(0x42), None, "plain code addresses are not built-ins");
    }

    #[test]
    fn functor_lookup_matches_well_known_block() {
        assert_eq!(Builtin::from_functor(WellKnown::Ge.into()), Some(Builtin::Ge));
        assert_eq!(Builtin::from_functor(WellKnown::Cons.into()), None);
        assert_eq!(ArithOp::from_functor(WellKnown::Neg.into()), Some(ArithOp::Neg));
        assert_eq!(ArithOp::from_functor(WellKnown::Is.into()), None);
    }
}
