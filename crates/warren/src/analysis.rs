//! Clause annotation: symbol-key assignment, occurrence analysis and
//! register allocation.
//!
//! Two walks over each clause populate the scoped symbol table. The first
//! assigns every term node a symbol key under
//! `(predicate, clause_index, goal_index, arg path)`, with all occurrences of
//! one variable sharing a key under the clause's free-variable sub-scope. The
//! second gathers, per variable: occurrence count, the non-argument-only flag
//! (true iff every occurrence lies strictly inside a compound subterm), first
//! and last occurrence goals (head = goal 0), and permanence. The head and
//! the first body goal count as one unit for permanence, so chain rules stay
//! environment-free.
//!
//! Register allocation then assigns each temporary a register under an
//! invariant the body compiler relies on: *an argument register is only ever
//! assigned to the variable that occupies that argument position itself*, so
//! every later read of an argument register sees the same variable's cell and
//! no shuffle copies are needed. Everything else gets a clause-global fresh
//! register above all arities; live ranges are trivially disjoint, which
//! satisfies the no-overlap contract, and it makes the registers of voidable
//! singletons clause-unique — the property the peephole optimizer's
//! `unify_void` rewrite depends on.
//!
//! Permanent variables are assigned slots ordered by last occurrence, latest
//! death first, so trimming the environment at each `call N` keeps exactly
//! the slots that are still live.

use ahash::{AHashMap, AHashSet};

use crate::{
    error::{CompileError, CompileErrorKind},
    instr::{Place, RegId, SlotId},
    intern::{FunctorId, VarId, WellKnown},
    symtab::{Field, FieldValue, ScopeKey, SymbolKey, SymbolTable},
    term::{Clause, Term, VisitOrder},
};

/// Per-variable annotation results.
#[derive(Debug, Clone)]
pub struct VarInfo {
    /// Total occurrences in the clause.
    pub occurrences: u32,
    /// True iff no occurrence is a direct argument of the head or a goal.
    pub non_arg_only: bool,
    /// Goal index of the first occurrence (head = 0).
    pub first_goal: u32,
    /// Goal index of the last occurrence.
    pub last_goal: u32,
    /// True iff the variable lives in the environment.
    pub permanent: bool,
    /// The assigned register or slot.
    pub place: Place,
}

/// Where cut instructions go in the compiled clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CutPlan {
    /// No cut in the body.
    None,
    /// Cuts only in neck position; compiled to `neck_cut`, no barrier slot.
    NeckOnly,
    /// At least one cut after the first goal; `get_level` saves the barrier
    /// into the reserved slot.
    Deep { slot: SlotId },
}

/// Everything the clause compiler needs to know about one clause.
#[derive(Debug, Clone)]
pub struct ClauseAnalysis {
    /// Symbol key of the clause scope.
    pub clause_key: SymbolKey,
    /// Index of this clause within its predicate, in arrival order.
    pub clause_index: u32,
    pub vars: AHashMap<VarId, VarInfo>,
    /// Environment size: permanent variables plus the cut barrier slot.
    pub slot_count: u8,
    pub cut: CutPlan,
    /// Whether the clause allocates an environment at all.
    pub needs_env: bool,
    /// Registers of singleton non-argument variables, for the optimizer's
    /// `unify_void` rewrite. Clause-unique by construction.
    pub voidable: AHashSet<u8>,
    /// Last-occurrence goal per slot, in slot order (descending), for
    /// environment trimming.
    slot_last_goals: Vec<u32>,
    /// First register never handed out; scratch allocation continues here
    /// during compilation.
    next_register: u8,
}

impl ClauseAnalysis {
    /// Number of permanent variables still needed after calling goal `j`.
    #[must_use]
    pub fn live_after(&self, goal: u32) -> u8 {
        self.slot_last_goals.iter().take_while(|&&last| last > goal).count() as u8
    }

    /// Hands out a fresh scratch register for structure flattening.
    pub fn fresh_register(&mut self) -> Result<RegId, CompileError> {
        if self.next_register == u8::MAX {
            return Err(CompileError::new(CompileErrorKind::RegisterOverflow, None));
        }
        let reg = RegId(self.next_register);
        self.next_register += 1;
        Ok(reg)
    }
}

/// Occurrence bookkeeping accumulated during the annotation walk.
#[derive(Debug, Default)]
struct VarOcc {
    occurrences: u32,
    non_arg_only: bool,
    first_goal: u32,
    last_goal: u32,
    /// Direct argument positions in the head (1-based).
    head_direct: Vec<u8>,
    /// True iff the variable occurs inside a compound subterm of the head.
    head_nested: bool,
    /// Direct argument positions in the first body goal.
    goal1_direct: Vec<u8>,
    /// Direct argument positions in the single later goal the variable is
    /// local to; meaningless for permanent variables.
    local_direct: Vec<u8>,
    /// Distinct permanence units the variable occurs in (head and goal 1
    /// share unit 1).
    units: AHashSet<u32>,
    /// Arrival order, for deterministic slot assignment.
    order: u32,
}

/// Runs both annotation walks and register allocation over one clause.
///
/// `pred` is the functor of the predicate the clause belongs to and
/// `clause_index` its position there; together they root the clause's scope
/// in the symbol table.
pub fn analyze(
    clause: &Clause,
    pred: FunctorId,
    clause_index: u32,
    symtab: &mut SymbolTable,
) -> Result<ClauseAnalysis, CompileError> {
    let span = clause.span;

    let head_arity = check_callable(&clause.head, span, CompileErrorKind::MalformedHead)?;
    let clause_key = symtab.symbol_key_for(&[ScopeKey::Pred(pred), ScopeKey::Clause(clause_index)]);
    let free_scope = symtab.enter_scope(clause_key, ScopeKey::Free);

    let mut occs: AHashMap<VarId, VarOcc> = AHashMap::new();
    let mut order = 0u32;
    let mut max_arity = head_arity;
    let mut deep_cut_last = None;
    let mut has_neck_cut = false;
    let mut call_count = 0u32;
    let mut last_op_is_call = false;

    // Goal 0 is the head.
    scan_goal(&clause.head, 0, clause_key, free_scope, symtab, &mut occs, &mut order);

    for (i, goal) in clause.body.iter().enumerate() {
        let goal_index = i as u32 + 1;
        if is_cut(goal) {
            if goal_index == 1 {
                has_neck_cut = true;
            } else {
                deep_cut_last = Some(goal_index);
            }
            last_op_is_call = false;
            // The cut still owns its goal scope, so positional keys stay
            // aligned with the body.
            symtab.symbol_key_for(&[
                ScopeKey::Pred(pred),
                ScopeKey::Clause(clause_index),
                ScopeKey::Goal(goal_index),
            ]);
            continue;
        }
        let arity = check_callable(goal, span, CompileErrorKind::MalformedGoal)?;
        max_arity = max_arity.max(arity);
        call_count += 1;
        last_op_is_call = true;
        scan_goal(goal, goal_index, clause_key, free_scope, symtab, &mut occs, &mut order);
    }

    // Permanence: more than one unit, where head and goal 1 are one unit.
    let mut vars: AHashMap<VarId, VarInfo> = AHashMap::new();
    let mut perms: Vec<(VarId, u32, u32)> = Vec::new();
    for (&var, occ) in &occs {
        let permanent = occ.units.len() > 1;
        if permanent {
            perms.push((var, occ.last_goal, occ.order));
        }
        vars.insert(
            var,
            VarInfo {
                occurrences: occ.occurrences,
                non_arg_only: occ.non_arg_only,
                first_goal: occ.first_goal,
                last_goal: occ.last_goal,
                permanent,
                // Placeholder; assigned below.
                place: Place::Temp(RegId(0)),
            },
        );
    }

    // Slot assignment: latest death first, arrival order as tie-break. The
    // cut barrier participates like a permanent variable dying at the last
    // deep cut.
    let mut slot_entries: Vec<(Option<VarId>, u32, u32)> =
        perms.iter().map(|&(v, last, ord)| (Some(v), last, ord)).collect();
    if let Some(last) = deep_cut_last {
        slot_entries.push((None, last, u32::MAX));
    }
    slot_entries.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    if slot_entries.len() > u8::MAX as usize {
        return Err(CompileError::new(CompileErrorKind::SlotOverflow, span));
    }
    let mut cut = if has_neck_cut { CutPlan::NeckOnly } else { CutPlan::None };
    let mut slot_last_goals = Vec::with_capacity(slot_entries.len());
    for (i, &(var, last_goal, _)) in slot_entries.iter().enumerate() {
        let slot = SlotId(i as u8 + 1);
        slot_last_goals.push(last_goal);
        match var {
            Some(v) => vars.get_mut(&v).expect("permanent variable is known").place = Place::Perm(slot),
            None => cut = CutPlan::Deep { slot },
        }
    }

    // Temporary register assignment; see the module docs for the invariant.
    if max_arity >= u32::from(u8::MAX) {
        return Err(CompileError::new(CompileErrorKind::RegisterOverflow, span));
    }
    let mut next_register = max_arity as u8 + 1;
    let mut voidable = AHashSet::new();
    let mut temp_ids: Vec<VarId> = occs
        .iter()
        .filter(|(v, _)| !vars[v].permanent)
        .map(|(&v, _)| v)
        .collect();
    temp_ids.sort_by_key(|v| occs[v].order);
    for var in temp_ids {
        let occ = &occs[&var];
        let info = vars.get_mut(&var).expect("temporary variable is known");
        let in_unit0 = occ.last_goal <= 1;
        // An argument register Ai may only be assigned to the variable that
        // itself occupies position i, and for head variables only when every
        // head occurrence is direct: the head's get phase must read each Ai
        // before anything overwrites it, and a nested first occurrence would
        // write the register mid-phase. Goal-side assignment is safe with
        // nested occurrences because the put phase only builds.
        let assigned = if in_unit0 {
            if let Some(&h) = occ.head_direct.first() {
                let head_all_direct = !occ.head_nested;
                let head_only = occ.last_goal == 0;
                if head_all_direct && (head_only || occ.goal1_direct.contains(&h)) {
                    Some(h)
                } else {
                    None
                }
            } else if occ.first_goal == 1 && !occ.goal1_direct.is_empty() {
                Some(occ.goal1_direct[0])
            } else {
                None
            }
        } else if !occ.local_direct.is_empty() {
            Some(occ.local_direct[0])
        } else {
            None
        };
        let reg = match assigned {
            Some(i) => RegId(i),
            None => {
                if next_register == u8::MAX {
                    return Err(CompileError::new(CompileErrorKind::RegisterOverflow, span));
                }
                let reg = RegId(next_register);
                next_register += 1;
                reg
            }
        };
        info.place = Place::Temp(reg);
        if occ.occurrences == 1 && occ.non_arg_only {
            voidable.insert(reg.0);
        }
    }

    // Record the annotation in the symbol table.
    for (&var, info) in &vars {
        let key = symtab.symbol_key_for_var(free_scope, var);
        symtab.put(key, Field::OccurrenceCount, FieldValue::Count(info.occurrences));
        symtab.put(key, Field::NonArgOnly, FieldValue::Flag(info.non_arg_only));
        symtab.put(key, Field::FirstGoal, FieldValue::Goal(info.first_goal));
        symtab.put(key, Field::LastGoal, FieldValue::Goal(info.last_goal));
        symtab.put(key, Field::Permanent, FieldValue::Flag(info.permanent));
        match info.place {
            Place::Temp(RegId(r)) => symtab.put(key, Field::Register, FieldValue::Reg(r)),
            Place::Perm(SlotId(s)) => symtab.put(key, Field::Slot, FieldValue::SlotIndex(s)),
        }
    }

    let slot_count = slot_entries.len() as u8;
    let needs_env = slot_count > 0
        || call_count > 1
        || (call_count == 1 && !last_op_is_call);

    Ok(ClauseAnalysis {
        clause_key,
        clause_index,
        vars,
        slot_count,
        cut,
        needs_env,
        voidable,
        slot_last_goals,
        next_register,
    })
}

/// True for the `!/0` atom.
pub fn is_cut(term: &Term) -> bool {
    matches!(term.functor(), Some((f, 0)) if f == WellKnown::Cut.functor_id())
}

fn check_callable(term: &Term, span: Option<crate::error::Span>, kind: CompileErrorKind) -> Result<u32, CompileError> {
    match term.functor() {
        Some((_, arity)) if arity <= u8::MAX as u32 => Ok(arity),
        Some((_, arity)) => Err(CompileError::new(CompileErrorKind::ArityOverflow(arity), span)),
        None => Err(CompileError::new(kind, span)),
    }
}

/// The symbol-key and occurrence walk over one goal.
fn scan_goal(
    goal: &Term,
    goal_index: u32,
    clause_key: SymbolKey,
    free_scope: SymbolKey,
    symtab: &mut SymbolTable,
    occs: &mut AHashMap<VarId, VarOcc>,
    order: &mut u32,
) {
    let goal_scope = symtab.enter_scope(clause_key, ScopeKey::Goal(goal_index));
    goal.walk(&mut |term, path, visit| {
        if visit != VisitOrder::Pre || path.is_empty() {
            return;
        }
        // Positional key for the node; variables additionally share a key in
        // the free-variable sub-scope.
        let mut scope = goal_scope;
        for &step in path {
            scope = symtab.enter_scope(scope, ScopeKey::Arg(step));
        }
        let Term::Var(var) = term else { return };
        symtab.enter_scope(free_scope, ScopeKey::Var(*var));

        let direct = path.len() == 1;
        let position = path[0] as u8 + 1;
        let occ = occs.entry(*var).or_insert_with(|| VarOcc {
            non_arg_only: true,
            first_goal: goal_index,
            order: {
                *order += 1;
                *order
            },
            ..VarOcc::default()
        });
        occ.occurrences += 1;
        occ.last_goal = goal_index;
        occ.units.insert(goal_index.max(1));
        if direct {
            occ.non_arg_only = false;
            match goal_index {
                0 => occ.head_direct.push(position),
                1 => occ.goal1_direct.push(position),
                _ => {
                    // Only meaningful while the variable stays local to one
                    // goal; permanence overrides the register path anyway.
                    occ.local_direct.push(position);
                }
            }
        } else if goal_index == 0 {
            occ.head_nested = true;
        }
    });
}

impl SymbolTable {
    /// The shared key of a variable under a clause's free-variable sub-scope.
    pub fn symbol_key_for_var(&mut self, free_scope: SymbolKey, var: VarId) -> SymbolKey {
        self.enter_scope(free_scope, ScopeKey::Var(var))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::Interns;

    fn analyze_one(clause: &Clause) -> ClauseAnalysis {
        let (pred, _) = clause.head.functor().expect("test clause head is callable");
        let mut symtab = SymbolTable::new();
        analyze(clause, pred, 0, &mut symtab).expect("analysis succeeds")
    }

    #[test]
    fn chain_rule_has_no_environment_and_identity_registers() {
        let mut interns = Interns::new();
        let x = interns.var("X");
        let head = interns.app("p", vec![x.clone()]);
        let goal = interns.app("q", vec![x]);
        let analysis = analyze_one(&Clause::new(head, vec![goal]));

        assert!(!analysis.needs_env);
        assert_eq!(analysis.slot_count, 0);
        let info = analysis.vars.values().next().expect("one variable");
        assert!(!info.permanent);
        assert_eq!(info.place, Place::Temp(RegId(1)));
    }

    #[test]
    fn variable_crossing_two_body_goals_is_permanent() {
        let mut interns = Interns::new();
        let x = interns.var("X");
        let y = interns.var("Y");
        let head = interns.app("p", vec![x.clone()]);
        let g1 = interns.app("q", vec![x, y.clone()]);
        let g2 = interns.app("r", vec![y]);
        let clause = Clause::new(head, vec![g1, g2]);
        let analysis = analyze_one(&clause);

        assert!(analysis.needs_env);
        assert_eq!(analysis.slot_count, 1);
        let y_id = interns.intern_variable("Y");
        let x_id = interns.intern_variable("X");
        assert!(analysis.vars[&y_id].permanent, "Y crosses goals 1 and 2");
        assert!(!analysis.vars[&x_id].permanent, "X stays within the head/goal-1 unit");
        assert_eq!(analysis.vars[&y_id].place, Place::Perm(SlotId(1)));
        assert_eq!(analysis.live_after(1), 1);
        assert_eq!(analysis.live_after(2), 0);
    }

    #[test]
    fn singleton_inside_structure_is_voidable_with_unique_register() {
        let mut interns = Interns::new();
        let v = interns.var("V");
        let inner = interns.app("f", vec![v]);
        let head = interns.app("p", vec![inner]);
        let analysis = analyze_one(&Clause::fact(head));

        let info = analysis.vars.values().next().expect("one variable");
        assert!(info.non_arg_only);
        assert_eq!(info.occurrences, 1);
        let Place::Temp(RegId(reg)) = info.place else {
            panic!("singleton must be temporary")
        };
        assert!(analysis.voidable.contains(&reg));
        assert!(reg > 1, "voidable registers live above the argument range");
    }

    #[test]
    fn deep_cut_reserves_a_barrier_slot() {
        let mut interns = Interns::new();
        let x = interns.var("X");
        let y = interns.var("Y");
        let head = interns.app("max", vec![x.clone(), y.clone(), x.clone()]);
        let ge = interns.app(">=", vec![x, y]);
        let cut = interns.atom("!");
        let clause = Clause::new(head, vec![ge, cut]);
        let analysis = analyze_one(&clause);

        assert!(analysis.needs_env);
        assert_eq!(analysis.cut, CutPlan::Deep { slot: SlotId(1) });
        assert_eq!(analysis.slot_count, 1, "barrier slot only; X and Y stay temporary");
        assert_eq!(analysis.live_after(1), 1, "barrier survives the comparison call");
    }

    #[test]
    fn head_only_singleton_takes_its_argument_register() {
        let mut interns = Interns::new();
        let anon = interns.var("_");
        let y = interns.var("Y");
        let head = interns.app("max", vec![anon, y.clone(), y]);
        let analysis = analyze_one(&Clause::fact(head));

        let anon_info = analysis
            .vars
            .values()
            .find(|i| i.occurrences == 1)
            .expect("anonymous variable");
        assert_eq!(anon_info.place, Place::Temp(RegId(1)));
        let y_info = analysis.vars.values().find(|i| i.occurrences == 2).expect("Y");
        assert_eq!(y_info.place, Place::Temp(RegId(2)));
    }
}
