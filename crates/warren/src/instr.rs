//! The WAM instruction IR.
//!
//! Each instruction is one variant of a closed sum type carrying its operands
//! in decoded form; the encoder and disassembler dispatch by pattern matching
//! rather than a visitor hierarchy, since the instruction set is closed and
//! finite. Every instruction declares its encoded size up front so call-point
//! reservation can compute predicate lengths before any byte is written.
//!
//! Labels are predicate-local until linking: a [`Label`] indexes the owning
//! listing's target table, and the encoder rewrites it to an absolute code
//! address. `call`/`execute` operands stay functor ids in the IR and are
//! resolved to addresses through the call-point resolver at encode time.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};

use crate::intern::{FunctorId, Interns};

/// A temporary/argument register `Xn` / `An` (the same register file), 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegId(pub u8);

/// A permanent-variable slot `Yn` in the current environment, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u8);

/// A variable operand: either a temporary register or an environment slot.
///
/// Encoded as a one-byte kind flag followed by the one-byte index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Place {
    Temp(RegId),
    Perm(SlotId),
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temp(RegId(n)) => write!(f, "X{n}"),
            Self::Perm(SlotId(n)) => write!(f, "Y{n}"),
        }
    }
}

/// A predicate-local branch target.
///
/// Before linking the value indexes the listing's label table; after linking
/// it is an absolute byte address in the code area. The reserved
/// [`Label::FAIL`] target makes the machine backtrack and is used for empty
/// switch branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

impl Label {
    /// Branch target that forces a backtrack.
    pub const FAIL: Self = Self(u32::MAX);
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::FAIL {
            write!(f, "fail")
        } else {
            write!(f, "L{n}", n = self.0)
        }
    }
}

/// One WAM instruction with decoded operands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instr {
    /// Create an unbound cell on the heap; store a reference in `place` and `arg`.
    PutVar { place: Place, arg: RegId },
    /// Copy `place` into `arg`.
    PutVal { place: Place, arg: RegId },
    /// Place the constant `c` in `arg`.
    PutConst { c: FunctorId, arg: RegId },
    /// Place the immediate integer `n` in `arg`.
    PutInt { n: i64, arg: RegId },
    /// Push a functor header at `H`; `arg` receives the structure pointer.
    /// Subsequent `set_*` instructions fill the arguments.
    PutStruc { f: FunctorId, arg: RegId },
    /// `arg` receives a list pointer to `H`; subsequent `set_*` fill head and tail.
    PutList { arg: RegId },
    /// Push an unbound cell at `H`; store a reference in `place`.
    SetVar { place: Place },
    /// Push the value of `place` at `H`.
    SetVal { place: Place },
    /// Push the constant `c` at `H`.
    SetConst { c: FunctorId },
    /// Push the immediate integer `n` at `H`.
    SetInt { n: i64 },
    /// Push `n` unbound cells at `H`.
    SetVoid { n: u8 },
    /// Copy `arg` into `place`.
    GetVar { place: Place, arg: RegId },
    /// Unify `place` with `arg`.
    GetVal { place: Place, arg: RegId },
    /// Unify `arg` with the constant `c`; fail on mismatch.
    GetConst { c: FunctorId, arg: RegId },
    /// Unify `arg` with the immediate integer `n`; fail on mismatch.
    GetInt { n: i64, arg: RegId },
    /// Dereference `arg`: bind an unbound variable to a fresh structure and
    /// enter write mode, or match an existing structure and enter read mode.
    GetStruc { f: FunctorId, arg: RegId },
    /// The `get_struc` analogue for list cells.
    GetList { arg: RegId },
    /// Read mode: load the next subterm into `place`. Write mode: push an
    /// unbound cell and store a reference in `place`.
    UnifyVar { place: Place },
    /// Read mode: unify `place` with the next subterm. Write mode: push the
    /// value of `place`.
    UnifyVal { place: Place },
    /// Read mode: unify the next subterm with `c`. Write mode: push `c`.
    UnifyConst { c: FunctorId },
    /// Read mode: unify the next subterm with `n`. Write mode: push `n`.
    UnifyInt { n: i64 },
    /// Skip (read) or push (write) `n` anonymous subterms.
    UnifyVoid { n: u8 },
    /// Push an environment frame with `n` permanent-variable slots.
    Allocate { n: u8 },
    /// Pop the current environment frame; restore the continuation.
    Deallocate,
    /// Call `f`, saving the continuation. `live` is the number of permanent
    /// variables still needed after the call; the environment is trimmed to it.
    Call { f: FunctorId, live: u8 },
    /// Last call: jump to `f` without saving a continuation.
    Execute { f: FunctorId },
    /// Return to the continuation.
    Proceed,
    /// Push a choicepoint whose alternative is `alt`.
    TryMeElse { alt: Label },
    /// Update the current choicepoint's alternative to `alt`.
    RetryMeElse { alt: Label },
    /// Pop the current choicepoint; this was the last alternative.
    TrustMe,
    /// Push a choicepoint whose alternative is the following instruction, then
    /// jump to `clause`. Used by switch-dispatched alternative blocks.
    Try { clause: Label },
    /// Update the current choicepoint's alternative to the following
    /// instruction, then jump to `clause`.
    Retry { clause: Label },
    /// Pop the current choicepoint, then jump to `clause`.
    Trust { clause: Label },
    /// Discard choicepoints created since entry to the current predicate.
    NeckCut,
    /// Save the cut barrier into `slot`.
    GetLevel { slot: SlotId },
    /// Discard choicepoints younger than the barrier saved in `slot`.
    Cut { slot: SlotId },
    /// Dispatch on the dereferenced tag of the first argument.
    SwitchOnTerm { var: Label, con: Label, lis: Label, struc: Label },
    /// Dispatch on a constant first argument by functor id.
    SwitchOnConst { table: Vec<(FunctorId, Label)> },
    /// Dispatch on the principal functor of a structure first argument.
    SwitchOnStruc { table: Vec<(FunctorId, Label)> },
}

/// Byte-level opcode of each instruction, the first byte of its encoding.
///
/// Zero is deliberately unassigned so a jump into zero-filled (reserved but
/// never encoded) code is caught as an invalid opcode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Opcode {
    PutVar = 1,
    PutVal,
    PutConst,
    PutInt,
    PutStruc,
    PutList,
    SetVar,
    SetVal,
    SetConst,
    SetInt,
    SetVoid,
    GetVar,
    GetVal,
    GetConst,
    GetInt,
    GetStruc,
    GetList,
    UnifyVar,
    UnifyVal,
    UnifyConst,
    UnifyInt,
    UnifyVoid,
    Allocate,
    Deallocate,
    Call,
    Execute,
    Proceed,
    TryMeElse,
    RetryMeElse,
    TrustMe,
    Try,
    Retry,
    Trust,
    NeckCut,
    GetLevel,
    Cut,
    SwitchOnTerm,
    #[strum(serialize = "switch_on_constant")]
    SwitchOnConst,
    #[strum(serialize = "switch_on_structure")]
    SwitchOnStruc,
}

impl Instr {
    /// The opcode byte that starts this instruction's encoding.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::PutVar { .. } => Opcode::PutVar,
            Self::PutVal { .. } => Opcode::PutVal,
            Self::PutConst { .. } => Opcode::PutConst,
            Self::PutInt { .. } => Opcode::PutInt,
            Self::PutStruc { .. } => Opcode::PutStruc,
            Self::PutList { .. } => Opcode::PutList,
            Self::SetVar { .. } => Opcode::SetVar,
            Self::SetVal { .. } => Opcode::SetVal,
            Self::SetConst { .. } => Opcode::SetConst,
            Self::SetInt { .. } => Opcode::SetInt,
            Self::SetVoid { .. } => Opcode::SetVoid,
            Self::GetVar { .. } => Opcode::GetVar,
            Self::GetVal { .. } => Opcode::GetVal,
            Self::GetConst { .. } => Opcode::GetConst,
            Self::GetInt { .. } => Opcode::GetInt,
            Self::GetStruc { .. } => Opcode::GetStruc,
            Self::GetList { .. } => Opcode::GetList,
            Self::UnifyVar { .. } => Opcode::UnifyVar,
            Self::UnifyVal { .. } => Opcode::UnifyVal,
            Self::UnifyConst { .. } => Opcode::UnifyConst,
            Self::UnifyInt { .. } => Opcode::UnifyInt,
            Self::UnifyVoid { .. } => Opcode::UnifyVoid,
            Self::Allocate { .. } => Opcode::Allocate,
            Self::Deallocate => Opcode::Deallocate,
            Self::Call { .. } => Opcode::Call,
            Self::Execute { .. } => Opcode::Execute,
            Self::Proceed => Opcode::Proceed,
            Self::TryMeElse { .. } => Opcode::TryMeElse,
            Self::RetryMeElse { .. } => Opcode::RetryMeElse,
            Self::TrustMe => Opcode::TrustMe,
            Self::Try { .. } => Opcode::Try,
            Self::Retry { .. } => Opcode::Retry,
            Self::Trust { .. } => Opcode::Trust,
            Self::NeckCut => Opcode::NeckCut,
            Self::GetLevel { .. } => Opcode::GetLevel,
            Self::Cut { .. } => Opcode::Cut,
            Self::SwitchOnTerm { .. } => Opcode::SwitchOnTerm,
            Self::SwitchOnConst { .. } => Opcode::SwitchOnConst,
            Self::SwitchOnStruc { .. } => Opcode::SwitchOnStruc,
        }
    }

    /// The encoded size of this instruction in bytes, opcode included.
    ///
    /// Operand widths: register and slot indexes 1 byte, place operands a
    /// 1-byte kind flag plus index, functor ids and code addresses 4 bytes,
    /// immediate integers 8 bytes, counts 1 byte, switch tables a 2-byte
    /// entry count followed by 8 bytes per entry.
    #[must_use]
    pub fn size(&self) -> u32 {
        match self {
            Self::Deallocate | Self::Proceed | Self::TrustMe | Self::NeckCut => 1,
            Self::PutList { .. }
            | Self::GetList { .. }
            | Self::SetVoid { .. }
            | Self::UnifyVoid { .. }
            | Self::Allocate { .. }
            | Self::GetLevel { .. }
            | Self::Cut { .. } => 2,
            Self::SetVar { .. } | Self::SetVal { .. } | Self::UnifyVar { .. } | Self::UnifyVal { .. } => 3,
            Self::PutVar { .. } | Self::PutVal { .. } | Self::GetVar { .. } | Self::GetVal { .. } => 4,
            Self::SetConst { .. } | Self::UnifyConst { .. } | Self::Execute { .. } => 5,
            Self::PutConst { .. }
            | Self::PutStruc { .. }
            | Self::GetConst { .. }
            | Self::GetStruc { .. }
            | Self::Call { .. } => 6,
            Self::TryMeElse { .. } | Self::RetryMeElse { .. } | Self::Try { .. } | Self::Retry { .. } | Self::Trust { .. } => 5,
            Self::SetInt { .. } | Self::UnifyInt { .. } => 9,
            Self::PutInt { .. } | Self::GetInt { .. } => 10,
            Self::SwitchOnTerm { .. } => 17,
            Self::SwitchOnConst { table } | Self::SwitchOnStruc { table } => 3 + 8 * table.len() as u32,
        }
    }

    /// Renders the instruction through the interner for listings and
    /// disassembly output.
    #[must_use]
    pub fn display<'a>(&'a self, interns: &'a Interns) -> InstrDisplay<'a> {
        InstrDisplay { instr: self, interns }
    }
}

/// Borrowing display adapter produced by [`Instr::display`].
pub struct InstrDisplay<'a> {
    instr: &'a Instr,
    interns: &'a Interns,
}

impl fmt::Display for InstrDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interns = self.interns;
        let mnemonic: &'static str = self.instr.opcode().into();
        match self.instr {
            Instr::PutVar { place, arg } | Instr::PutVal { place, arg } => {
                write!(f, "{mnemonic} {place}, A{a}", a = arg.0)
            }
            Instr::GetVar { place, arg } | Instr::GetVal { place, arg } => {
                write!(f, "{mnemonic} {place}, A{a}", a = arg.0)
            }
            Instr::PutConst { c, arg } | Instr::GetConst { c, arg } => {
                write!(f, "{mnemonic} {c}, A{a}", c = constant_name(interns, *c), a = arg.0)
            }
            Instr::PutInt { n, arg } | Instr::GetInt { n, arg } => write!(f, "{mnemonic} {n}, A{a}", a = arg.0),
            Instr::PutStruc { f: functor, arg } | Instr::GetStruc { f: functor, arg } => {
                write!(f, "{mnemonic} {func}, A{a}", func = interns.format_functor(*functor), a = arg.0)
            }
            Instr::PutList { arg } | Instr::GetList { arg } => write!(f, "{mnemonic} A{a}", a = arg.0),
            Instr::SetVar { place } | Instr::SetVal { place } | Instr::UnifyVar { place } | Instr::UnifyVal { place } => {
                write!(f, "{mnemonic} {place}")
            }
            Instr::SetConst { c } | Instr::UnifyConst { c } => {
                write!(f, "{mnemonic} {c}", c = constant_name(interns, *c))
            }
            Instr::SetInt { n } | Instr::UnifyInt { n } => write!(f, "{mnemonic} {n}"),
            Instr::SetVoid { n } | Instr::UnifyVoid { n } => write!(f, "{mnemonic} {n}"),
            Instr::Allocate { n } => write!(f, "{mnemonic} {n}"),
            Instr::Deallocate | Instr::Proceed | Instr::TrustMe | Instr::NeckCut => write!(f, "{mnemonic}"),
            Instr::Call { f: functor, live } => {
                write!(f, "{mnemonic} {func}, {live}", func = interns.format_functor(*functor))
            }
            Instr::Execute { f: functor } => {
                write!(f, "{mnemonic} {func}", func = interns.format_functor(*functor))
            }
            Instr::TryMeElse { alt } | Instr::RetryMeElse { alt } => write!(f, "{mnemonic} {alt}"),
            Instr::Try { clause } | Instr::Retry { clause } | Instr::Trust { clause } => {
                write!(f, "{mnemonic} {clause}")
            }
            Instr::GetLevel { slot } | Instr::Cut { slot } => write!(f, "{mnemonic} Y{s}", s = slot.0),
            Instr::SwitchOnTerm { var, con, lis, struc } => {
                write!(f, "{mnemonic} {var}, {con}, {lis}, {struc}")
            }
            Instr::SwitchOnConst { table } | Instr::SwitchOnStruc { table } => {
                write!(f, "{mnemonic} [")?;
                for (i, (functor, target)) in table.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{func}: {target}", func = interns.format_functor(*functor))?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Constants render without the `/0` arity suffix.
fn constant_name(interns: &Interns, c: FunctorId) -> String {
    interns.functor_of(c).0.to_string()
}

/// An assembled instruction sequence for one predicate, with its label table.
///
/// `targets[label]` is the index of the instruction the label points at.
/// Linking replaces every label with `call_point.start + byte offset of the
/// target instruction`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub instrs: Vec<Instr>,
    pub targets: Vec<u32>,
}

impl Listing {
    /// A label-free listing.
    #[must_use]
    pub fn plain(instrs: Vec<Instr>) -> Self {
        Self {
            instrs,
            targets: Vec::new(),
        }
    }

    /// Creates a label whose target is patched later with [`Listing::bind`].
    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.targets.len() as u32);
        self.targets.push(u32::MAX);
        label
    }

    /// Points `label` at the next instruction to be pushed.
    pub fn bind(&mut self, label: Label) {
        self.targets[label.0 as usize] = self.instrs.len() as u32;
    }

    /// Total encoded size of the listing in bytes.
    #[must_use]
    pub fn byte_len(&self) -> u32 {
        self.instrs.iter().map(Instr::size).sum()
    }

    /// Renders the listing one instruction per line, labels resolved to
    /// instruction indexes.
    #[must_use]
    pub fn render(&self, interns: &Interns) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for (i, instr) in self.instrs.iter().enumerate() {
            writeln!(out, "{i:>4}: {instr}", instr = instr.display(interns)).expect("write to String");
        }
        out
    }
}
