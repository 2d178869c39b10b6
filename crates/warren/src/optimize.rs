//! State-machine peephole optimizer.
//!
//! A stream transducer over the per-clause instruction list: the matcher
//! consumes one instruction at a time, holding at most one pending
//! instruction that may still begin a two-instruction pattern. On each input
//! it either *shifts* (the input becomes pending), *discards* (the pending
//! instruction fuses with the input into a shorter form) or *flushes* (the
//! pending instruction is released to the output, transformed by its
//! single-instruction rewrite if one applies).
//!
//! Rewrites:
//! 1. `unify_var Xi` ; `get_struc f/0, Xi` → `unify_const f`
//! 2. `get_struc f/0, Ai` → `get_const f, Ai`
//! 3. `put_struc f/0, Xi` ; `set_var Xi` (or `set_val Xi`) → `set_const f`
//! 4. `put_struc f/0, Ai` → `put_const f, Ai`
//! 5. `get_struc cons/2, Ai` → `get_list Ai`; same for `put_struc`
//! 6. `unify_var Xi` with `Xi` a singleton non-argument variable →
//!    `unify_void 1`, consecutive voids coalescing; same for `set_var`
//! 7. `get_var Xi, Xi` → eliminated
//!
//! The singleton analysis behind rule 6 arrives as the `voidable` register
//! set computed by the annotation pass; the allocator gives those registers
//! clause-unique numbers, so membership is safe to test on the register
//! alone. The optimizer runs per clause on the IR, before predicate assembly
//! and byte encoding; the unoptimized listing is retained alongside for
//! debugging.

use ahash::AHashSet;

use crate::{
    instr::{Instr, Place, RegId},
    intern::{Interns, WellKnown},
};

/// The pending instruction: the matcher's single state beyond "empty".
#[derive(Debug)]
enum Pending {
    /// `unify_var Xi` awaiting a fusable `get_struc f/0, Xi`.
    UnifyVar(Place),
    /// `put_struc f/0, Xi` awaiting a fusable `set_var`/`set_val Xi`;
    /// flushes as `put_const f, Xi`.
    PutStrucAtom { f: crate::intern::FunctorId, reg: RegId },
    /// A run of voided `unify_var`s being coalesced.
    UnifyVoid(u8),
    /// A run of voided `set_var`s being coalesced.
    SetVoid(u8),
}

/// Runs the peephole pass over one clause's instructions.
#[must_use]
pub fn optimize(instrs: Vec<Instr>, voidable: &AHashSet<u8>, interns: &Interns) -> Vec<Instr> {
    let mut matcher = Matcher {
        interns,
        voidable,
        pending: None,
        out: Vec::with_capacity(instrs.len()),
    };
    for instr in instrs {
        matcher.step(instr);
    }
    matcher.finish()
}

struct Matcher<'a> {
    interns: &'a Interns,
    voidable: &'a AHashSet<u8>,
    pending: Option<Pending>,
    out: Vec<Instr>,
}

impl Matcher<'_> {
    fn step(&mut self, instr: Instr) {
        // Fusions against the pending instruction (discard transitions).
        match (&self.pending, &instr) {
            (Some(Pending::UnifyVar(Place::Temp(x))), Instr::GetStruc { f, arg })
                if arg.0 == x.0 && self.interns.functor_arity(*f) == 0 =>
            {
                let c = *f;
                self.pending = None;
                self.out.push(Instr::UnifyConst { c });
                return;
            }
            (Some(Pending::PutStrucAtom { f, reg }), Instr::SetVar { place: Place::Temp(x) })
            | (Some(Pending::PutStrucAtom { f, reg }), Instr::SetVal { place: Place::Temp(x) })
                if x.0 == reg.0 =>
            {
                let c = *f;
                self.pending = None;
                self.out.push(Instr::SetConst { c });
                return;
            }
            (Some(Pending::UnifyVoid(n)), Instr::UnifyVoid { n: m }) => {
                let total = n.saturating_add(*m);
                self.pending = Some(Pending::UnifyVoid(total));
                return;
            }
            (Some(Pending::SetVoid(n)), Instr::SetVoid { n: m }) => {
                let total = n.saturating_add(*m);
                self.pending = Some(Pending::SetVoid(total));
                return;
            }
            (Some(Pending::UnifyVoid(n)), Instr::UnifyVar { place: Place::Temp(x) }) if self.is_voidable(x.0) => {
                self.pending = Some(Pending::UnifyVoid(n.saturating_add(1)));
                return;
            }
            (Some(Pending::SetVoid(n)), Instr::SetVar { place: Place::Temp(x) }) if self.is_voidable(x.0) => {
                self.pending = Some(Pending::SetVoid(n.saturating_add(1)));
                return;
            }
            _ => {}
        }

        self.flush();

        // Single-instruction rewrites and shift transitions.
        match instr {
            // Rule 7: a register-to-itself copy is a no-op.
            Instr::GetVar { place: Place::Temp(x), arg } if x.0 == arg.0 => {}
            Instr::GetStruc { f, arg } => {
                if self.interns.functor_arity(f) == 0 {
                    self.out.push(Instr::GetConst { c: f, arg });
                } else if f == WellKnown::Cons.functor_id() {
                    self.out.push(Instr::GetList { arg });
                } else {
                    self.out.push(instr);
                }
            }
            Instr::PutStruc { f, arg } => {
                if self.interns.functor_arity(f) == 0 {
                    self.pending = Some(Pending::PutStrucAtom { f, reg: arg });
                } else if f == WellKnown::Cons.functor_id() {
                    self.out.push(Instr::PutList { arg });
                } else {
                    self.out.push(instr);
                }
            }
            Instr::UnifyVar { place: Place::Temp(x) } if self.is_voidable(x.0) => {
                self.pending = Some(Pending::UnifyVoid(1));
            }
            Instr::SetVar { place: Place::Temp(x) } if self.is_voidable(x.0) => {
                self.pending = Some(Pending::SetVoid(1));
            }
            Instr::UnifyVoid { n } => self.pending = Some(Pending::UnifyVoid(n)),
            Instr::SetVoid { n } => self.pending = Some(Pending::SetVoid(n)),
            Instr::UnifyVar { place } => self.pending = Some(Pending::UnifyVar(place)),
            other => self.out.push(other),
        }
    }

    fn is_voidable(&self, reg: u8) -> bool {
        self.voidable.contains(&reg)
    }

    /// Releases the pending instruction, applying its flush-time rewrite.
    fn flush(&mut self) {
        match self.pending.take() {
            None => {}
            Some(Pending::UnifyVar(place)) => self.out.push(Instr::UnifyVar { place }),
            // Rule 4: an unfused atom build becomes a constant load.
            Some(Pending::PutStrucAtom { f, reg }) => self.out.push(Instr::PutConst { c: f, arg: reg }),
            Some(Pending::UnifyVoid(n)) => self.out.push(Instr::UnifyVoid { n }),
            Some(Pending::SetVoid(n)) => self.out.push(Instr::SetVoid { n }),
        }
    }

    fn finish(mut self) -> Vec<Instr> {
        self.flush();
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::SlotId;

    fn interns_with(names: &[(&str, u32)]) -> (Interns, Vec<crate::intern::FunctorId>) {
        let mut interns = Interns::new();
        let ids = names.iter().map(|(n, a)| interns.intern_functor(n, *a)).collect();
        (interns, ids)
    }

    #[test]
    fn fuses_unify_var_with_atom_struc() {
        let (interns, ids) = interns_with(&[("f", 1), ("a", 0)]);
        let voidable = AHashSet::new();
        let out = optimize(
            vec![
                Instr::GetStruc { f: ids[0], arg: RegId(1) },
                Instr::UnifyVar { place: Place::Temp(RegId(2)) },
                Instr::GetStruc { f: ids[1], arg: RegId(2) },
            ],
            &voidable,
            &interns,
        );
        assert_eq!(
            out,
            vec![
                Instr::GetStruc { f: ids[0], arg: RegId(1) },
                Instr::UnifyConst { c: ids[1] },
            ]
        );
    }

    #[test]
    fn rewrites_standalone_atom_strucs_to_consts() {
        let (interns, ids) = interns_with(&[("a", 0)]);
        let voidable = AHashSet::new();
        let out = optimize(
            vec![
                Instr::GetStruc { f: ids[0], arg: RegId(1) },
                Instr::PutStruc { f: ids[0], arg: RegId(1) },
            ],
            &voidable,
            &interns,
        );
        assert_eq!(
            out,
            vec![
                Instr::GetConst { c: ids[0], arg: RegId(1) },
                Instr::PutConst { c: ids[0], arg: RegId(1) },
            ]
        );
    }

    #[test]
    fn fuses_put_struc_atom_with_set() {
        let (interns, ids) = interns_with(&[("a", 0)]);
        let voidable = AHashSet::new();
        let out = optimize(
            vec![
                Instr::PutStruc { f: ids[0], arg: RegId(3) },
                Instr::SetVar { place: Place::Temp(RegId(3)) },
            ],
            &voidable,
            &interns,
        );
        assert_eq!(out, vec![Instr::SetConst { c: ids[0] }]);
    }

    #[test]
    fn rewrites_cons_strucs_to_list_instructions() {
        let interns = Interns::new();
        let cons = WellKnown::Cons.functor_id();
        let voidable = AHashSet::new();
        let out = optimize(
            vec![
                Instr::GetStruc { f: cons, arg: RegId(1) },
                Instr::PutStruc { f: cons, arg: RegId(2) },
            ],
            &voidable,
            &interns,
        );
        assert_eq!(
            out,
            vec![Instr::GetList { arg: RegId(1) }, Instr::PutList { arg: RegId(2) }]
        );
    }

    #[test]
    fn voids_singleton_registers_and_coalesces() {
        let interns = Interns::new();
        let voidable: AHashSet<u8> = [7, 8].into_iter().collect();
        let out = optimize(
            vec![
                Instr::UnifyVar { place: Place::Temp(RegId(7)) },
                Instr::UnifyVar { place: Place::Temp(RegId(8)) },
                Instr::UnifyVar { place: Place::Temp(RegId(2)) },
            ],
            &voidable,
            &interns,
        );
        assert_eq!(
            out,
            vec![
                Instr::UnifyVoid { n: 2 },
                Instr::UnifyVar { place: Place::Temp(RegId(2)) },
            ]
        );
    }

    #[test]
    fn drops_identity_register_moves() {
        let interns = Interns::new();
        let voidable = AHashSet::new();
        let out = optimize(
            vec![
                Instr::GetVar { place: Place::Temp(RegId(1)), arg: RegId(1) },
                Instr::GetVar { place: Place::Temp(RegId(2)), arg: RegId(1) },
                Instr::GetVar { place: Place::Perm(SlotId(1)), arg: RegId(1) },
            ],
            &voidable,
            &interns,
        );
        assert_eq!(
            out,
            vec![
                Instr::GetVar { place: Place::Temp(RegId(2)), arg: RegId(1) },
                Instr::GetVar { place: Place::Perm(SlotId(1)), arg: RegId(1) },
            ]
        );
    }
}
