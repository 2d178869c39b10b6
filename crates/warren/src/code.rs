//! The code machine: byte buffer, call-points and the byte-code codec.
//!
//! Predicates are placed at reserved, non-overlapping call-points. Redefining
//! a predicate reserves a fresh call-point and orphans the previous code; no
//! compaction is performed. Emission is two-phase so a batch of mutually
//! recursive predicates can be compiled together: reserve every call-point
//! first (sizes are known statically from the IR), then encode, resolving
//! `call`/`execute` functor operands to absolute addresses — built-ins to a
//! reserved address range — only at encode time.
//!
//! The decoder reverses the codec exactly: call targets are mapped back to
//! functor ids through the call-point index, so `decode(encode(i)) == i` for
//! every linked instruction. The machine itself executes by decoding at `P`,
//! which also gives redefinition the required late-binding behavior: targets
//! are resolved by interned name at every transfer.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    builtins::Builtin,
    error::LinkError,
    instr::{Instr, Label, Listing, Opcode, Place, RegId, SlotId},
    intern::{FunctorId, Interns},
};

/// Sentinel continuation address: reaching it means the query succeeded.
pub const HALT_ADDR: u32 = u32::MAX;

/// Sentinel branch address: jumping to it forces a backtrack. Used for empty
/// switch branches.
pub const FAIL_ADDR: u32 = u32::MAX - 1;

/// The (address, length, name) record identifying a predicate in the byte
/// buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPoint {
    pub start: u32,
    pub len: u32,
    pub functor: FunctorId,
}

/// A resolved `call`/`execute` target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Compiled code at an absolute address.
    Code(u32),
    /// A built-in, run inline by the machine.
    Builtin(Builtin),
}

/// The code area and call-point resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeMachine {
    buf: Vec<u8>,
    /// Live call-point per predicate; replaced wholesale on redefinition.
    points: AHashMap<FunctorId, CallPoint>,
    /// Every reserved start address ever, orphaned code included, so the
    /// decoder can map call targets back to functors.
    by_start: AHashMap<u32, FunctorId>,
}

impl CodeMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a call-point of `len` bytes for `functor` at the current
    /// insertion point. If the predicate already has a call-point, the old
    /// code is orphaned and a fresh call-point is reserved.
    pub fn reserve(&mut self, functor: FunctorId, len: u32) -> CallPoint {
        let start = self.buf.len() as u32;
        self.buf.resize(self.buf.len() + len as usize, 0);
        let point = CallPoint { start, len, functor };
        self.points.insert(functor, point);
        self.by_start.insert(start, functor);
        point
    }

    /// Answers `resolve(functor_id) -> call_point | builtin | none`.
    ///
    /// Built-ins shadow compiled code; they cannot be redefined.
    #[must_use]
    pub fn resolve(&self, functor: FunctorId) -> Option<CallTarget> {
        if let Some(builtin) = Builtin::from_functor(functor) {
            return Some(CallTarget::Builtin(builtin));
        }
        self.points.get(&functor).map(|p| CallTarget::Code(p.start))
    }

    /// The live call-point of a predicate, if any.
    #[must_use]
    pub fn call_point(&self, functor: FunctorId) -> Option<CallPoint> {
        self.points.get(&functor).copied()
    }

    /// Maps a call-point start address back to its functor.
    #[must_use]
    pub fn functor_at(&self, start: u32) -> Option<FunctorId> {
        self.by_start.get(&start).copied()
    }

    /// Withdraws a predicate's live call-point, orphaning its code. Used
    /// when encoding fails so the predicate is not installed half-written.
    pub fn withdraw(&mut self, functor: FunctorId) {
        self.points.remove(&functor);
    }

    /// Encodes a linked listing into its reserved call-point.
    ///
    /// Labels are rewritten to absolute addresses; `call`/`execute` functor
    /// operands are resolved through the call-point resolver, which is what
    /// permits forward references within a reserve-then-encode batch.
    ///
    /// # Panics
    /// Panics if the listing's computed size does not match the reservation;
    /// that is a compiler bug, not an input error.
    pub fn encode(&mut self, point: CallPoint, listing: &Listing) -> Result<(), LinkError> {
        assert_eq!(listing.byte_len(), point.len, "listing size drifted from its reservation");

        // Byte offset of each instruction, for label resolution.
        let mut offsets = Vec::with_capacity(listing.instrs.len());
        let mut offset = 0u32;
        for instr in &listing.instrs {
            offsets.push(offset);
            offset += instr.size();
        }
        let label_addr = |label: Label| -> u32 {
            if label == Label::FAIL {
                FAIL_ADDR
            } else {
                point.start + offsets[listing.targets[label.0 as usize] as usize]
            }
        };

        // Resolve every call target before writing a single byte, so a
        // failing predicate is not half-installed.
        let mut targets = Vec::new();
        for instr in &listing.instrs {
            if let Instr::Call { f, .. } | Instr::Execute { f } = instr {
                let target = self.resolve(*f).ok_or(LinkError::Unresolved {
                    caller: point.functor,
                    callee: *f,
                })?;
                targets.push(match target {
                    CallTarget::Code(addr) => addr,
                    CallTarget::Builtin(b) => b.address(),
                });
            }
        }

        let mut w = Writer {
            buf: &mut self.buf,
            pos: point.start as usize,
        };
        let mut next_target = 0usize;
        for instr in &listing.instrs {
            w.u8(instr.opcode() as u8);
            match instr {
                Instr::PutVar { place, arg }
                | Instr::PutVal { place, arg }
                | Instr::GetVar { place, arg }
                | Instr::GetVal { place, arg } => {
                    w.place(*place);
                    w.u8(arg.0);
                }
                Instr::PutConst { c, arg } | Instr::GetConst { c, arg } => {
                    w.u32(c.index());
                    w.u8(arg.0);
                }
                Instr::PutInt { n, arg } | Instr::GetInt { n, arg } => {
                    w.i64(*n);
                    w.u8(arg.0);
                }
                Instr::PutStruc { f, arg } | Instr::GetStruc { f, arg } => {
                    w.u32(f.index());
                    w.u8(arg.0);
                }
                Instr::PutList { arg } | Instr::GetList { arg } => w.u8(arg.0),
                Instr::SetVar { place } | Instr::SetVal { place } | Instr::UnifyVar { place } | Instr::UnifyVal { place } => {
                    w.place(*place);
                }
                Instr::SetConst { c } | Instr::UnifyConst { c } => w.u32(c.index()),
                Instr::SetInt { n } | Instr::UnifyInt { n } => w.i64(*n),
                Instr::SetVoid { n } | Instr::UnifyVoid { n } | Instr::Allocate { n } => w.u8(*n),
                Instr::Deallocate | Instr::Proceed | Instr::TrustMe | Instr::NeckCut => {}
                Instr::Call { live, .. } => {
                    w.u32(targets[next_target]);
                    next_target += 1;
                    w.u8(*live);
                }
                Instr::Execute { .. } => {
                    w.u32(targets[next_target]);
                    next_target += 1;
                }
                Instr::TryMeElse { alt } | Instr::RetryMeElse { alt } => w.u32(label_addr(*alt)),
                Instr::Try { clause } | Instr::Retry { clause } | Instr::Trust { clause } => {
                    w.u32(label_addr(*clause));
                }
                Instr::GetLevel { slot } | Instr::Cut { slot } => w.u8(slot.0),
                Instr::SwitchOnTerm { var, con, lis, struc } => {
                    w.u32(label_addr(*var));
                    w.u32(label_addr(*con));
                    w.u32(label_addr(*lis));
                    w.u32(label_addr(*struc));
                }
                Instr::SwitchOnConst { table } | Instr::SwitchOnStruc { table } => {
                    w.u16(table.len() as u16);
                    for (f, target) in table {
                        w.u32(f.index());
                        w.u32(label_addr(*target));
                    }
                }
            }
        }
        assert_eq!(
            w.pos,
            (point.start + point.len) as usize,
            "encoder wrote a different size than declared"
        );
        Ok(())
    }

    /// Decodes the instruction at `addr`, returning it and the address of the
    /// following instruction.
    ///
    /// Branch operands come back as absolute-address labels; call targets are
    /// mapped back to functor ids.
    ///
    /// # Panics
    /// Panics on an invalid opcode byte or a call target that is not a
    /// call-point; both are internal invariant breaches.
    #[must_use]
    pub fn decode_at(&self, addr: u32) -> (Instr, u32) {
        let mut r = Reader {
            buf: &self.buf,
            pos: addr as usize,
        };
        let byte = r.u8();
        let opcode = Opcode::from_repr(byte).unwrap_or_else(|| panic!("invalid opcode {byte:#x} at address {addr}"));
        let instr = match opcode {
            Opcode::PutVar => Instr::PutVar { place: r.place(), arg: RegId(r.u8()) },
            Opcode::PutVal => Instr::PutVal { place: r.place(), arg: RegId(r.u8()) },
            Opcode::PutConst => Instr::PutConst { c: FunctorId::from_index(r.u32()), arg: RegId(r.u8()) },
            Opcode::PutInt => Instr::PutInt { n: r.i64(), arg: RegId(r.u8()) },
            Opcode::PutStruc => Instr::PutStruc { f: FunctorId::from_index(r.u32()), arg: RegId(r.u8()) },
            Opcode::PutList => Instr::PutList { arg: RegId(r.u8()) },
            Opcode::SetVar => Instr::SetVar { place: r.place() },
            Opcode::SetVal => Instr::SetVal { place: r.place() },
            Opcode::SetConst => Instr::SetConst { c: FunctorId::from_index(r.u32()) },
            Opcode::SetInt => Instr::SetInt { n: r.i64() },
            Opcode::SetVoid => Instr::SetVoid { n: r.u8() },
            Opcode::GetVar => Instr::GetVar { place: r.place(), arg: RegId(r.u8()) },
            Opcode::GetVal => Instr::GetVal { place: r.place(), arg: RegId(r.u8()) },
            Opcode::GetConst => Instr::GetConst { c: FunctorId::from_index(r.u32()), arg: RegId(r.u8()) },
            Opcode::GetInt => Instr::GetInt { n: r.i64(), arg: RegId(r.u8()) },
            Opcode::GetStruc => Instr::GetStruc { f: FunctorId::from_index(r.u32()), arg: RegId(r.u8()) },
            Opcode::GetList => Instr::GetList { arg: RegId(r.u8()) },
            Opcode::UnifyVar => Instr::UnifyVar { place: r.place() },
            Opcode::UnifyVal => Instr::UnifyVal { place: r.place() },
            Opcode::UnifyConst => Instr::UnifyConst { c: FunctorId::from_index(r.u32()) },
            Opcode::UnifyInt => Instr::UnifyInt { n: r.i64() },
            Opcode::UnifyVoid => Instr::UnifyVoid { n: r.u8() },
            Opcode::Allocate => Instr::Allocate { n: r.u8() },
            Opcode::Deallocate => Instr::Deallocate,
            Opcode::Call => {
                let f = self.target_functor(r.u32());
                Instr::Call { f, live: r.u8() }
            }
            Opcode::Execute => Instr::Execute { f: self.target_functor(r.u32()) },
            Opcode::Proceed => Instr::Proceed,
            Opcode::TryMeElse => Instr::TryMeElse { alt: Label(r.u32()) },
            Opcode::RetryMeElse => Instr::RetryMeElse { alt: Label(r.u32()) },
            Opcode::TrustMe => Instr::TrustMe,
            Opcode::Try => Instr::Try { clause: Label(r.u32()) },
            Opcode::Retry => Instr::Retry { clause: Label(r.u32()) },
            Opcode::Trust => Instr::Trust { clause: Label(r.u32()) },
            Opcode::NeckCut => Instr::NeckCut,
            Opcode::GetLevel => Instr::GetLevel { slot: SlotId(r.u8()) },
            Opcode::Cut => Instr::Cut { slot: SlotId(r.u8()) },
            Opcode::SwitchOnTerm => Instr::SwitchOnTerm {
                var: Label(r.u32()),
                con: Label(r.u32()),
                lis: Label(r.u32()),
                struc: Label(r.u32()),
            },
            Opcode::SwitchOnConst => Instr::SwitchOnConst { table: r.table() },
            Opcode::SwitchOnStruc => Instr::SwitchOnStruc { table: r.table() },
        };
        (instr, r.pos as u32)
    }

    fn target_functor(&self, addr: u32) -> FunctorId {
        if let Some(builtin) = Builtin::from_address(addr) {
            return builtin.functor();
        }
        self.functor_at(addr)
            .unwrap_or_else(|| panic!("call target {addr} is not a call-point"))
    }

    /// Renders the live code of a predicate, one addressed instruction per
    /// line.
    #[must_use]
    pub fn disassemble(&self, functor: FunctorId, interns: &Interns) -> Option<String> {
        use std::fmt::Write;

        let point = self.call_point(functor)?;
        let mut out = String::new();
        let mut addr = point.start;
        let end = point.start + point.len;
        while addr < end {
            let (instr, next) = self.decode_at(addr);
            writeln!(out, "{addr:>6}: {instr}", instr = instr.display(interns)).expect("write to String");
            addr = next;
        }
        Some(out)
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.buf[self.pos] = v;
        self.pos += 1;
    }

    fn u16(&mut self, v: u16) {
        self.buf[self.pos..self.pos + 2].copy_from_slice(&v.to_le_bytes());
        self.pos += 2;
    }

    fn u32(&mut self, v: u32) {
        self.buf[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn i64(&mut self, v: i64) {
        self.buf[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }

    fn place(&mut self, place: Place) {
        match place {
            Place::Temp(RegId(n)) => {
                self.u8(0);
                self.u8(n);
            }
            Place::Perm(SlotId(n)) => {
                self.u8(1);
                self.u8(n);
            }
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn u8(&mut self) -> u8 {
        let v = self.buf[self.pos];
        self.pos += 1;
        v
    }

    fn u16(&mut self) -> u16 {
        let v = u16::from_le_bytes(self.buf[self.pos..self.pos + 2].try_into().expect("u16 slice"));
        self.pos += 2;
        v
    }

    fn u32(&mut self) -> u32 {
        let v = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().expect("u32 slice"));
        self.pos += 4;
        v
    }

    fn i64(&mut self) -> i64 {
        let v = i64::from_le_bytes(self.buf[self.pos..self.pos + 8].try_into().expect("i64 slice"));
        self.pos += 8;
        v
    }

    fn place(&mut self) -> Place {
        match self.u8() {
            0 => Place::Temp(RegId(self.u8())),
            1 => Place::Perm(SlotId(self.u8())),
            kind => panic!("invalid place kind byte {kind:#x}"),
        }
    }

    fn table(&mut self) -> Vec<(FunctorId, Label)> {
        let count = self.u16();
        (0..count)
            .map(|_| (FunctorId::from_index(self.u32()), Label(self.u32())))
            .collect()
    }
}
