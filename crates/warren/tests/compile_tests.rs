//! Listing-level tests: what the compiler and peephole optimizer emit, as
//! observed through the disassembler and the compiler observer.

use std::{cell::RefCell, rc::Rc};

use warren::{Clause, CompilerObserver, Instr, PredicateListing, Session, Term};

fn atom(session: &mut Session, name: &str) -> Term {
    session.interns_mut().atom(name)
}

fn var(session: &mut Session, name: &str) -> Term {
    session.interns_mut().var(name)
}

fn app(session: &mut Session, name: &str, args: Vec<Term>) -> Term {
    session.interns_mut().app(name, args)
}

fn disassemble(session: &mut Session, name: &str, arity: u32) -> String {
    let functor = session.interns_mut().intern_functor(name, arity);
    session.disassemble(functor).expect("predicate is installed")
}

// =============================================================================
// 1. Peephole constants
// =============================================================================

/// Compiling `p(a) :- q(a).` must come out as `get_const a, A1` and
/// `put_const a, A1` — never a bare arity-0 `get_struc`/`put_struc`.
#[test]
fn atom_arguments_compile_to_constants() {
    let mut session = Session::new();
    let a = atom(&mut session, "a");
    let head = app(&mut session, "p", vec![a.clone()]);
    let body = app(&mut session, "q", vec![a]);
    session.compile(Clause::new(head, vec![body])).expect("p compiles");
    let a = atom(&mut session, "a");
    let q_head = app(&mut session, "q", vec![a]);
    session.compile(Clause::fact(q_head)).expect("q compiles");
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 1);
    assert!(listing.contains("get_const a, A1"), "head constant missing:\n{listing}");
    assert!(listing.contains("put_const a, A1"), "body constant missing:\n{listing}");
    assert!(!listing.contains("get_struc"), "unspecialized get_struc survived:\n{listing}");
    assert!(!listing.contains("put_struc"), "unspecialized put_struc survived:\n{listing}");
}

/// Nested atoms inside head structures fuse to `unify_const`.
#[test]
fn nested_head_atoms_fuse_to_unify_const() {
    let mut session = Session::new();
    let a = atom(&mut session, "a");
    let inner = app(&mut session, "f", vec![a]);
    let head = app(&mut session, "p", vec![inner]);
    session.compile(Clause::fact(head)).expect("p compiles");
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 1);
    assert!(listing.contains("get_struc f/1, A1"), "outer structure missing:\n{listing}");
    assert!(listing.contains("unify_const a"), "fused constant missing:\n{listing}");
}

// =============================================================================
// 2. Chain rules and identity moves
// =============================================================================

/// `p(X) :- q(X).` is a pure jump: the identity register move is eliminated
/// and the last call compiles to `execute` with no environment.
#[test]
fn chain_rule_compiles_to_a_bare_execute() {
    let mut session = Session::new();
    let x = var(&mut session, "X");
    let head = app(&mut session, "p", vec![x.clone()]);
    let body = app(&mut session, "q", vec![x]);
    session.compile(Clause::new(head, vec![body])).expect("p compiles");
    let a = atom(&mut session, "a");
    let q_head = app(&mut session, "q", vec![a]);
    session.compile(Clause::fact(q_head)).expect("q compiles");
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 1);
    let lines: Vec<&str> = listing.lines().collect();
    assert_eq!(lines.len(), 1, "chain rule should be a single instruction:\n{listing}");
    assert!(lines[0].contains("execute q/1"), "missing last-call jump:\n{listing}");
}

// =============================================================================
// 3. Environments, trimming, last-call optimization
// =============================================================================

/// Permanent variables get an environment, calls carry the live slot count,
/// and the last goal is `deallocate` + `execute`.
#[test]
fn permanent_variables_allocate_and_trim() {
    let mut session = Session::new();
    let x = var(&mut session, "X");
    let y = var(&mut session, "Y");
    let head = atom(&mut session, "p");
    let g1 = app(&mut session, "q", vec![x.clone(), y.clone()]);
    let g2 = app(&mut session, "r", vec![x, y]);
    session.compile(Clause::new(head, vec![g1, g2])).expect("p compiles");
    let a = atom(&mut session, "a");
    let b = atom(&mut session, "b");
    let q_head = app(&mut session, "q", vec![a.clone(), b.clone()]);
    session.compile(Clause::fact(q_head)).expect("q compiles");
    let r_head = app(&mut session, "r", vec![a, b]);
    session.compile(Clause::fact(r_head)).expect("r compiles");
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 0);
    assert!(listing.contains("allocate 2"), "environment missing:\n{listing}");
    assert!(listing.contains("call q/2, 2"), "trim count missing:\n{listing}");
    assert!(listing.contains("deallocate"), "deallocate missing:\n{listing}");
    assert!(listing.contains("execute r/2"), "last-call execute missing:\n{listing}");
    assert!(!listing.contains("call r/2"), "last goal must not be a call:\n{listing}");
}

// =============================================================================
// 4. Void arguments
// =============================================================================

/// Consecutive singleton variables inside a structure coalesce to one
/// `unify_void`.
#[test]
fn singletons_in_structures_coalesce_to_void() {
    let mut session = Session::new();
    let a1 = var(&mut session, "_");
    let a2 = var(&mut session, "_");
    let x = var(&mut session, "X");
    let inner = app(&mut session, "f", vec![a1, a2, x.clone()]);
    let head = app(&mut session, "p", vec![inner, x]);
    session.compile(Clause::fact(head)).expect("p compiles");
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 2);
    assert!(listing.contains("unify_void 2"), "voids did not coalesce:\n{listing}");
}

// =============================================================================
// 5. First-argument indexing
// =============================================================================

/// All-constant first arguments produce a `switch_on_term` +
/// `switch_on_constant` dispatch.
#[test]
fn constant_first_arguments_are_indexed() {
    let mut session = Session::new();
    let a = atom(&mut session, "a");
    let head = app(&mut session, "p", vec![a, Term::Int(1)]);
    session.compile(Clause::fact(head)).expect("clause compiles");
    let b = atom(&mut session, "b");
    let head = app(&mut session, "p", vec![b, Term::Int(2)]);
    session.compile(Clause::fact(head)).expect("clause compiles");
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 2);
    assert!(listing.contains("switch_on_term"), "dispatch missing:\n{listing}");
    assert!(listing.contains("switch_on_constant"), "constant table missing:\n{listing}");
}

/// A variable first argument in any clause disables indexing.
#[test]
fn variable_first_argument_disables_indexing() {
    let mut session = Session::new();
    let a = atom(&mut session, "a");
    let head = app(&mut session, "p", vec![a]);
    session.compile(Clause::fact(head)).expect("clause compiles");
    let x = var(&mut session, "X");
    let head = app(&mut session, "p", vec![x]);
    session.compile(Clause::fact(head)).expect("clause compiles");
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 1);
    assert!(!listing.contains("switch_on_term"), "unexpected dispatch:\n{listing}");
    assert!(listing.contains("try_me_else"), "plain chain missing:\n{listing}");
}

/// Structure first arguments dispatch through `switch_on_structure`, with a
/// `try`/`trust` block for multi-clause buckets.
#[test]
fn structure_buckets_use_try_trust_blocks() {
    let mut session = Session::new();
    for n in [1i64, 2, 3] {
        let inner = app(&mut session, "s", vec![Term::Int(n)]);
        let head = app(&mut session, "p", vec![inner]);
        session.compile(Clause::fact(head)).expect("clause compiles");
    }
    session.end_scope().expect("scope links");

    let listing = disassemble(&mut session, "p", 1);
    assert!(listing.contains("switch_on_structure"), "structure table missing:\n{listing}");
    assert!(listing.contains("try "), "bucket try missing:\n{listing}");
    assert!(listing.contains("trust "), "bucket trust missing:\n{listing}");
}

// =============================================================================
// 6. Observer: both listings retained
// =============================================================================

#[derive(Default)]
struct Capture {
    preds: Rc<RefCell<Vec<PredicateListing>>>,
    queries: Rc<RefCell<Vec<PredicateListing>>>,
}

impl CompilerObserver for Capture {
    fn on_predicate(&mut self, listing: &PredicateListing) {
        self.preds.borrow_mut().push(listing.clone());
    }

    fn on_query(&mut self, listing: &PredicateListing) {
        self.queries.borrow_mut().push(listing.clone());
    }
}

/// The observer sees each finished predicate with both the naive and the
/// optimized listing; the naive one still carries the arity-0 structure
/// build that the peephole pass specialized away.
#[test]
fn observer_receives_unoptimized_and_optimized_listings() {
    let capture = Capture::default();
    let preds = Rc::clone(&capture.preds);
    let queries = Rc::clone(&capture.queries);

    let mut session = Session::new();
    session.set_observer(Box::new(capture));
    let a = atom(&mut session, "a");
    let head = app(&mut session, "p", vec![a]);
    session.compile(Clause::fact(head)).expect("p compiles");
    session.end_scope().expect("scope links");

    let x = var(&mut session, "X");
    let goal = app(&mut session, "p", vec![x]);
    session.compile_query(vec![goal]).expect("query compiles");

    let preds = preds.borrow();
    assert_eq!(preds.len(), 1);
    let listing = &preds[0];
    assert!(
        listing.unoptimized.instrs.iter().any(|i| matches!(i, Instr::GetStruc { .. })),
        "naive listing lost its structure build: {instrs:?}",
        instrs = listing.unoptimized.instrs
    );
    assert!(
        listing.optimized.instrs.iter().any(|i| matches!(i, Instr::GetConst { .. })),
        "optimized listing lost its constant: {instrs:?}",
        instrs = listing.optimized.instrs
    );
    assert_eq!(queries.borrow().len(), 1, "the query listing must reach the observer");
}
