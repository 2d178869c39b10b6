//! Clause compilation and predicate assembly.
//!
//! A clause compiles head-first: head arguments through the `get`/`unify`
//! family in consume mode (nested structures breadth-first through a queue of
//! scratch registers), then the body goals through the `put`/`set` family in
//! build mode (nested structures bottom-up, children into scratch registers
//! before the enclosing `put_struc`). The compiler emits the naive listing —
//! atoms as arity-0 structures, lists as plain `cons/2` structures — and
//! leaves the specializations to the peephole pass, which runs per clause on
//! this IR.
//!
//! Environment handling follows the classic discipline: `allocate` opens the
//! clause when it has permanent variables, more than one call, or anything
//! after its only call; each `call` carries the number of permanent variables
//! still live so the environment can be trimmed; the last call compiles to
//! `deallocate` + `execute` (last-call optimization); a fact ends in
//! `proceed`. A cut in neck position is a bare `neck_cut`; deeper cuts save
//! the barrier with `get_level` into a reserved slot.
//!
//! Predicate assembly wraps multiple clauses in
//! `try_me_else`/`retry_me_else`/`trust_me` in source order, and, when every
//! clause has a non-variable first argument, prefixes a `switch_on_term`
//! dispatch with `switch_on_constant`/`switch_on_structure` tables and
//! `try`/`retry`/`trust` blocks for multi-clause buckets.
//!
//! Queries compile as an ordinary clause of a reserved predicate whose head
//! arguments are the query's free variables, so the whole pipeline —
//! annotation, allocation, optimization, encoding — serves queries unchanged.

use std::collections::VecDeque;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::{ClauseAnalysis, CutPlan, is_cut},
    error::{CompileError, CompileErrorKind},
    instr::{Instr, Label, Listing, Place, RegId},
    intern::{FunctorId, Interns, VarId},
    term::{Clause, Term, VisitOrder},
};

/// Compiler configuration.
#[derive(Debug, Clone, Copy)]
pub struct CompileOptions {
    /// Emit first-argument indexing for predicates where every clause has a
    /// non-variable first argument. Disabling it produces plain
    /// `try_me_else` chains; the solution set and order are identical.
    pub first_arg_indexing: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            first_arg_indexing: true,
        }
    }
}

/// The reserved predicate name queries compile under.
pub const QUERY_PRED: &str = "$query";

/// A finished predicate: both retained listings plus bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateListing {
    pub functor: FunctorId,
    /// The assembled listing before the peephole pass, retained for
    /// debugging.
    pub unoptimized: Listing,
    /// The assembled listing the encoder consumes.
    pub optimized: Listing,
    pub clause_count: u32,
}

/// Handle to an installed query: its reserved predicate and the free
/// variables whose bindings each solution reports, in first-occurrence order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub functor: FunctorId,
    pub vars: Vec<VarId>,
}

/// Classification of a clause's first head argument, for indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstArg {
    /// The predicate has no arguments.
    NoArg,
    Var,
    Con(FunctorId),
    /// Immediate integers have no functor id to hash on; their presence
    /// disables indexing for the predicate.
    Int,
    Lis,
    Struc(FunctorId),
}

/// Classifies the first head argument of a clause, interning literal
/// constants so they can key switch tables.
pub fn classify_first_arg(head: &Term, interns: &mut Interns) -> FirstArg {
    let Term::Struct { args, .. } = head else {
        return FirstArg::NoArg;
    };
    match args.first() {
        None => FirstArg::NoArg,
        Some(Term::Var(_)) => FirstArg::Var,
        Some(Term::Int(_)) => FirstArg::Int,
        Some(Term::Float(v)) => FirstArg::Con(interns.intern_float(*v)),
        Some(Term::Str(s)) => FirstArg::Con(interns.intern_string(s)),
        Some(Term::Struct { functor, args }) => {
            if args.is_empty() {
                FirstArg::Con(*functor)
            } else if *functor == crate::intern::WellKnown::Cons.functor_id() {
                FirstArg::Lis
            } else {
                FirstArg::Struc(*functor)
            }
        }
    }
}

/// Compiles one analyzed clause to its naive instruction sequence.
pub fn compile_clause(
    clause: &Clause,
    analysis: &mut ClauseAnalysis,
    interns: &mut Interns,
) -> Result<Vec<Instr>, CompileError> {
    let mut ctx = ClauseCtx {
        analysis,
        interns,
        seen: AHashSet::new(),
        out: Vec::new(),
    };

    if ctx.analysis.needs_env {
        ctx.out.push(Instr::Allocate {
            n: ctx.analysis.slot_count,
        });
    }

    ctx.compile_head(&clause.head)?;

    if let CutPlan::Deep { slot } = ctx.analysis.cut {
        ctx.out.push(Instr::GetLevel { slot });
    }

    let mut ended_in_execute = false;
    for (i, goal) in clause.body.iter().enumerate() {
        let goal_index = i as u32 + 1;
        if is_cut(goal) {
            if goal_index == 1 {
                ctx.out.push(Instr::NeckCut);
            } else {
                let CutPlan::Deep { slot } = ctx.analysis.cut else {
                    unreachable!("deep cut without a barrier slot");
                };
                ctx.out.push(Instr::Cut { slot });
            }
            continue;
        }
        let (f, _) = goal.functor().expect("goal checked callable during analysis");
        let Term::Struct { args, .. } = goal else {
            unreachable!("callable goal is a structure");
        };
        ctx.compile_goal_args(args, goal_index)?;
        if i == clause.body.len() - 1 {
            if ctx.analysis.needs_env {
                ctx.out.push(Instr::Deallocate);
            }
            ctx.out.push(Instr::Execute { f });
            ended_in_execute = true;
        } else {
            ctx.out.push(Instr::Call {
                f,
                live: ctx.analysis.live_after(goal_index),
            });
        }
    }

    if !ended_in_execute {
        // A fact, or a body whose last operation is a cut.
        if ctx.analysis.needs_env {
            ctx.out.push(Instr::Deallocate);
        }
        ctx.out.push(Instr::Proceed);
    }

    Ok(ctx.out)
}

struct ClauseCtx<'a> {
    analysis: &'a mut ClauseAnalysis,
    interns: &'a mut Interns,
    seen: AHashSet<VarId>,
    out: Vec<Instr>,
}

impl ClauseCtx<'_> {
    fn place_of(&self, var: VarId) -> Place {
        self.analysis.vars[&var].place
    }

    fn compile_head(&mut self, head: &Term) -> Result<(), CompileError> {
        let Term::Struct { args, .. } = head else {
            unreachable!("head checked callable during analysis");
        };
        // Depth-one unify sequences run inline; deeper structures go through
        // the queue and are matched breadth-first after the argument pass.
        let mut queue: VecDeque<(RegId, &Term)> = VecDeque::new();
        for (i, arg) in args.iter().enumerate() {
            let ai = RegId(i as u8 + 1);
            match arg {
                Term::Var(v) => {
                    let place = self.place_of(*v);
                    if self.seen.insert(*v) {
                        self.out.push(Instr::GetVar { place, arg: ai });
                    } else {
                        self.out.push(Instr::GetVal { place, arg: ai });
                    }
                }
                Term::Int(n) => self.out.push(Instr::GetInt { n: *n, arg: ai }),
                Term::Float(v) => {
                    let c = self.interns.intern_float(*v);
                    self.out.push(Instr::GetConst { c, arg: ai });
                }
                Term::Str(s) => {
                    let c = self.interns.intern_string(s);
                    self.out.push(Instr::GetConst { c, arg: ai });
                }
                Term::Struct { functor, args } => {
                    self.out.push(Instr::GetStruc { f: *functor, arg: ai });
                    self.head_unify_args(args, &mut queue)?;
                }
            }
        }
        while let Some((reg, term)) = queue.pop_front() {
            let Term::Struct { functor, args } = term else {
                unreachable!("only structures are queued");
            };
            self.out.push(Instr::GetStruc { f: *functor, arg: reg });
            self.head_unify_args(args, &mut queue)?;
        }
        Ok(())
    }

    fn head_unify_args<'t>(
        &mut self,
        args: &'t [Term],
        queue: &mut VecDeque<(RegId, &'t Term)>,
    ) -> Result<(), CompileError> {
        for sub in args {
            match sub {
                Term::Var(v) => {
                    let place = self.place_of(*v);
                    if self.seen.insert(*v) {
                        self.out.push(Instr::UnifyVar { place });
                    } else {
                        self.out.push(Instr::UnifyVal { place });
                    }
                }
                Term::Int(n) => self.out.push(Instr::UnifyInt { n: *n }),
                Term::Float(v) => {
                    let c = self.interns.intern_float(*v);
                    self.out.push(Instr::UnifyConst { c });
                }
                Term::Str(s) => {
                    let c = self.interns.intern_string(s);
                    self.out.push(Instr::UnifyConst { c });
                }
                Term::Struct { .. } => {
                    let reg = self.analysis.fresh_register()?;
                    self.out.push(Instr::UnifyVar { place: Place::Temp(reg) });
                    queue.push_back((reg, sub));
                }
            }
        }
        Ok(())
    }

    fn compile_goal_args(&mut self, args: &[Term], _goal_index: u32) -> Result<(), CompileError> {
        for (i, arg) in args.iter().enumerate() {
            let ai = RegId(i as u8 + 1);
            match arg {
                Term::Var(v) => {
                    let place = self.place_of(*v);
                    if self.seen.insert(*v) {
                        self.out.push(Instr::PutVar { place, arg: ai });
                    } else if place != Place::Temp(ai) {
                        self.out.push(Instr::PutVal { place, arg: ai });
                    }
                    // A seen variable already holding its own argument
                    // register needs no move.
                }
                Term::Int(n) => self.out.push(Instr::PutInt { n: *n, arg: ai }),
                Term::Float(v) => {
                    let c = self.interns.intern_float(*v);
                    self.out.push(Instr::PutConst { c, arg: ai });
                }
                Term::Str(s) => {
                    let c = self.interns.intern_string(s);
                    self.out.push(Instr::PutConst { c, arg: ai });
                }
                Term::Struct { args: inner, .. } if inner.is_empty() => {
                    let (f, _) = arg.functor().expect("atom");
                    self.out.push(Instr::PutStruc { f, arg: ai });
                }
                Term::Struct { .. } => self.build_struct(arg, ai)?,
            }
        }
        Ok(())
    }

    /// Builds a compound body argument bottom-up: compound children first,
    /// each into a fresh scratch register, then the structure itself.
    fn build_struct(&mut self, term: &Term, target: RegId) -> Result<(), CompileError> {
        let Term::Struct { functor, args } = term else {
            unreachable!("build_struct takes structures");
        };
        let mut child_regs: Vec<Option<RegId>> = Vec::with_capacity(args.len());
        for sub in args {
            match sub {
                Term::Struct { args: inner, .. } if !inner.is_empty() => {
                    let reg = self.analysis.fresh_register()?;
                    self.build_struct(sub, reg)?;
                    child_regs.push(Some(reg));
                }
                _ => child_regs.push(None),
            }
        }
        self.out.push(Instr::PutStruc { f: *functor, arg: target });
        for (sub, child) in args.iter().zip(child_regs) {
            match sub {
                Term::Var(v) => {
                    let place = self.place_of(*v);
                    if self.seen.insert(*v) {
                        self.out.push(Instr::SetVar { place });
                    } else {
                        self.out.push(Instr::SetVal { place });
                    }
                }
                Term::Int(n) => self.out.push(Instr::SetInt { n: *n }),
                Term::Float(v) => {
                    let c = self.interns.intern_float(*v);
                    self.out.push(Instr::SetConst { c });
                }
                Term::Str(s) => {
                    let c = self.interns.intern_string(s);
                    self.out.push(Instr::SetConst { c });
                }
                Term::Struct { functor, args: inner } => {
                    if inner.is_empty() {
                        self.out.push(Instr::SetConst { c: *functor });
                    } else {
                        let reg = child.expect("compound child was pre-built");
                        self.out.push(Instr::SetVal { place: Place::Temp(reg) });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Builds the synthetic query clause: a head over the goals' free variables
/// in first-occurrence order, under the reserved query predicate.
pub fn query_clause(goals: Vec<Term>, interns: &mut Interns) -> Result<(Clause, Vec<VarId>), CompileError> {
    let mut vars: Vec<VarId> = Vec::new();
    let mut seen = AHashSet::new();
    for goal in &goals {
        goal.walk(&mut |term, _path, order| {
            if order == VisitOrder::Pre
                && let Term::Var(v) = term
                && seen.insert(*v)
            {
                vars.push(*v);
            }
        });
    }
    if vars.len() > usize::from(u8::MAX) {
        return Err(CompileError::new(
            CompileErrorKind::TooManyQueryVariables(vars.len()),
            None,
        ));
    }
    let functor = interns.intern_functor(QUERY_PRED, vars.len() as u32);
    let head = Term::Struct {
        functor,
        args: vars.iter().map(|&v| Term::Var(v)).collect(),
    };
    Ok((Clause::new(head, goals), vars))
}

/// Assembles a predicate's clauses into one listing.
///
/// `first_args` must classify each clause in source order. Indexing is
/// emitted only when requested, the predicate has at least two clauses and
/// an argument to dispatch on, and no clause defeats the dispatch (a
/// variable or an immediate-integer first argument).
pub fn assemble(clauses: &[Vec<Instr>], first_args: &[FirstArg], indexing: bool) -> Listing {
    assert_eq!(clauses.len(), first_args.len(), "one classification per clause");
    if clauses.len() == 1 {
        return Listing::plain(clauses[0].clone());
    }

    let indexable = indexing
        && first_args
            .iter()
            .all(|fa| !matches!(fa, FirstArg::Var | FirstArg::Int | FirstArg::NoArg));

    let mut listing = Listing::default();

    // Labels at each clause's own code, for bucket entry.
    let clause_labels: Vec<Label> = clauses.iter().map(|_| listing.fresh_label()).collect();

    let switch_var = if indexable {
        // The non-var targets are patched below, once the chain and the
        // table positions are known.
        let var = listing.fresh_label();
        listing.instrs.push(Instr::SwitchOnTerm {
            var,
            con: Label::FAIL,
            lis: Label::FAIL,
            struc: Label::FAIL,
        });
        Some(var)
    } else {
        None
    };

    // The full try_me_else chain, in source order.
    if let Some(var) = switch_var {
        listing.bind(var);
    }
    let mut pending: Option<Label> = None;
    for (i, code) in clauses.iter().enumerate() {
        if i == 0 {
            let alt = listing.fresh_label();
            listing.instrs.push(Instr::TryMeElse { alt });
            pending = Some(alt);
        } else {
            listing.bind(pending.take().expect("chain label pending"));
            if i < clauses.len() - 1 {
                let alt = listing.fresh_label();
                listing.instrs.push(Instr::RetryMeElse { alt });
                pending = Some(alt);
            } else {
                listing.instrs.push(Instr::TrustMe);
            }
        }
        listing.bind(clause_labels[i]);
        listing.instrs.extend(code.iter().cloned());
    }

    let Some(switch_var) = switch_var else {
        return listing;
    };

    // Constant and structure buckets keyed by functor, in first-seen order;
    // list clauses form a single group.
    let mut con_groups: Vec<(FunctorId, Vec<usize>)> = Vec::new();
    let mut struc_groups: Vec<(FunctorId, Vec<usize>)> = Vec::new();
    let mut lis_group: Vec<usize> = Vec::new();
    for (i, fa) in first_args.iter().enumerate() {
        match fa {
            FirstArg::Con(c) => push_group(&mut con_groups, *c, i),
            FirstArg::Struc(f) => push_group(&mut struc_groups, *f, i),
            FirstArg::Lis => lis_group.push(i),
            FirstArg::Var | FirstArg::Int | FirstArg::NoArg => unreachable!("indexable predicates exclude these"),
        }
    }

    // Emit multi-clause buckets as try/retry/trust blocks and record each
    // group's entry label.
    let mut emit_group = |listing: &mut Listing, members: &[usize]| -> Label {
        if members.len() == 1 {
            return clause_labels[members[0]];
        }
        let entry = listing.fresh_label();
        listing.bind(entry);
        for (k, &member) in members.iter().enumerate() {
            let target = clause_labels[member];
            if k == 0 {
                listing.instrs.push(Instr::Try { clause: target });
            } else if k < members.len() - 1 {
                listing.instrs.push(Instr::Retry { clause: target });
            } else {
                listing.instrs.push(Instr::Trust { clause: target });
            }
        }
        entry
    };

    let lis_target = if lis_group.is_empty() {
        Label::FAIL
    } else {
        emit_group(&mut listing, &lis_group)
    };

    let con_table: Vec<(FunctorId, Label)> = con_groups
        .into_iter()
        .map(|(c, members)| (c, emit_group(&mut listing, &members)))
        .collect();
    let struc_table: Vec<(FunctorId, Label)> = struc_groups
        .into_iter()
        .map(|(f, members)| (f, emit_group(&mut listing, &members)))
        .collect();

    let con_target = if con_table.is_empty() {
        Label::FAIL
    } else {
        let at = listing.fresh_label();
        listing.bind(at);
        listing.instrs.push(Instr::SwitchOnConst { table: con_table });
        at
    };
    let struc_target = if struc_table.is_empty() {
        Label::FAIL
    } else {
        let at = listing.fresh_label();
        listing.bind(at);
        listing.instrs.push(Instr::SwitchOnStruc { table: struc_table });
        at
    };

    // Patch the dispatch now that every branch is placed.
    listing.instrs[0] = Instr::SwitchOnTerm {
        var: switch_var,
        con: con_target,
        lis: lis_target,
        struc: struc_target,
    };

    listing
}

fn push_group(groups: &mut Vec<(FunctorId, Vec<usize>)>, key: FunctorId, member: usize) {
    if let Some((_, members)) = groups.iter_mut().find(|(k, _)| *k == key) {
        members.push(member);
    } else {
        groups.push((key, vec![member]));
    }
}
