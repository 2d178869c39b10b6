//! Session-level behavior: resource limits, cooperative cancellation,
//! machine statistics (the last-call stack bound), and indexing equivalence.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use pretty_assertions::assert_eq;
use warren::{
    Bindings, Clause, CountingTracer, LimitedTracker, MachineTracer, NoopTracer, Opcode, RecordingTracer,
    ResourceError, ResourceTracker, Session, SolveError, Term, TraceEvent,
};

fn atom<T: ResourceTracker, Tr: MachineTracer>(session: &mut Session<T, Tr>, name: &str) -> Term {
    session.interns_mut().atom(name)
}

fn var<T: ResourceTracker, Tr: MachineTracer>(session: &mut Session<T, Tr>, name: &str) -> Term {
    session.interns_mut().var(name)
}

fn app<T: ResourceTracker, Tr: MachineTracer>(session: &mut Session<T, Tr>, name: &str, args: Vec<Term>) -> Term {
    session.interns_mut().app(name, args)
}

// =============================================================================
// 1. Last-call optimization keeps the stacks flat
// =============================================================================

/// `walk(nil). walk(cons(_, T)) :- tick, walk(T). tick.` — walking a long
/// list must keep the environment stack at O(1) and, with first-argument
/// indexing, create no choicepoints at all.
#[test]
fn tail_recursion_runs_in_constant_stack() {
    let mut session = Session::new();
    let nil = atom(&mut session, "nil");
    let head = app(&mut session, "walk", vec![nil]);
    session.compile(Clause::fact(head)).expect("base compiles");

    let anon = var(&mut session, "_");
    let t = var(&mut session, "T");
    let pair = app(&mut session, "cons", vec![anon, t.clone()]);
    let head = app(&mut session, "walk", vec![pair]);
    let tick = atom(&mut session, "tick");
    let recurse = app(&mut session, "walk", vec![t]);
    session.compile(Clause::new(head, vec![tick, recurse])).expect("step compiles");

    let tick_head = atom(&mut session, "tick");
    session.compile(Clause::fact(tick_head)).expect("tick compiles");
    session.end_scope().expect("scope links");

    let items: Vec<Term> = (0..60).map(Term::Int).collect();
    let long_list = session.interns_mut().list(items, None);
    let goal = app(&mut session, "walk", vec![long_list]);
    let query = session.compile_query(vec![goal]).expect("query compiles");
    session.set_query(&query);
    assert!(session.resolve().expect("walk succeeds").is_some());

    let stats = session.machine_stats();
    assert!(
        stats.env_high_water <= 2,
        "last-call optimization must bound the environment stack, got {hw}",
        hw = stats.env_high_water
    );
    assert_eq!(
        stats.choice_high_water, 0,
        "indexing makes the walk deterministic, so no choicepoints"
    );
    assert!(session.resolve().expect("exhaustion").is_none());
}

// =============================================================================
// 2. Cooperative cancellation
// =============================================================================

/// A raised stop flag makes the resolver report exhaustion at the next
/// choicepoint, not an error and not a partial answer.
#[test]
fn stop_flag_reports_exhaustion() {
    let stop = Arc::new(AtomicBool::new(false));
    let tracker = LimitedTracker::new().with_stop_flag(Arc::clone(&stop));
    let mut session = Session::with_parts(tracker, NoopTracer);

    let a = atom(&mut session, "a");
    let head = app(&mut session, "p", vec![a]);
    session.compile(Clause::fact(head)).expect("p compiles");
    let b = atom(&mut session, "b");
    let head = app(&mut session, "p", vec![b]);
    session.compile(Clause::fact(head)).expect("p compiles");
    session.end_scope().expect("scope links");

    let x = var(&mut session, "X");
    let goal = app(&mut session, "p", vec![x]);
    let query = session.compile_query(vec![goal]).expect("query compiles");

    stop.store(true, Ordering::Relaxed);
    session.set_query(&query);
    assert_eq!(
        session.resolve().expect("cancellation is not an error"),
        None,
        "a cancelled resolution reports no more solutions"
    );
}

// =============================================================================
// 3. Resource limits
// =============================================================================

/// `p :- p.` diverges; the step limit turns it into a fatal resource error.
#[test]
fn step_limit_stops_runaway_recursion() {
    let tracker = LimitedTracker::new().with_max_steps(10_000);
    let mut session = Session::with_parts(tracker, NoopTracer);

    let head = atom(&mut session, "p");
    let body = atom(&mut session, "p");
    session.compile(Clause::new(head, vec![body])).expect("p compiles");
    session.end_scope().expect("scope links");

    let goal = atom(&mut session, "p");
    let query = session.compile_query(vec![goal]).expect("query compiles");
    session.set_query(&query);
    let err = session.resolve().expect_err("divergence must trip the limit");
    assert!(
        matches!(err, SolveError::Resource(ResourceError::Steps { .. })),
        "got {err:?}"
    );
}

/// `grow(X) :- grow(f(X)).` allocates heap forever; the heap limit stops it.
#[test]
fn heap_limit_stops_unbounded_structure_growth() {
    let tracker = LimitedTracker::new().with_max_heap_cells(10_000);
    let mut session = Session::with_parts(tracker, NoopTracer);

    let x = var(&mut session, "X");
    let head = app(&mut session, "grow", vec![x.clone()]);
    let wrapped = app(&mut session, "f", vec![x]);
    let body = app(&mut session, "grow", vec![wrapped]);
    session.compile(Clause::new(head, vec![body])).expect("grow compiles");
    session.end_scope().expect("scope links");

    let seed = atom(&mut session, "seed");
    let goal = app(&mut session, "grow", vec![seed]);
    let query = session.compile_query(vec![goal]).expect("query compiles");
    session.set_query(&query);
    let err = session.resolve().expect_err("growth must trip the limit");
    assert!(
        matches!(err, SolveError::Resource(ResourceError::HeapCells { .. })),
        "got {err:?}"
    );
}

// =============================================================================
// 4. Indexing preserves the solution set and order
// =============================================================================

fn solutions<T: ResourceTracker, Tr: MachineTracer>(session: &mut Session<T, Tr>, goals: Vec<Term>) -> Vec<Bindings> {
    let query = session.compile_query(goals).expect("query compiles");
    session.set_query(&query);
    let mut out = Vec::new();
    while let Some(bindings) = session.resolve().expect("resolution is error-free") {
        out.push(bindings);
    }
    out
}

fn build_indexed_program(session: &mut Session, indexing: bool) {
    session.options_mut().first_arg_indexing = indexing;
    for (name, n) in [("a", 1i64), ("b", 2), ("a", 3), ("c", 4), ("a", 5)] {
        let key = atom(session, name);
        let head = app(session, "f", vec![key, Term::Int(n)]);
        session.compile(Clause::fact(head)).expect("clause compiles");
    }
    session.end_scope().expect("scope links");
}

/// Switch-dispatched and plain-chain builds of the same predicate agree on
/// every query: same solutions, same order.
#[test]
fn indexing_does_not_change_solutions_or_order() {
    let mut indexed = Session::new();
    build_indexed_program(&mut indexed, true);
    let mut plain = Session::new();
    build_indexed_program(&mut plain, false);

    // Constant first argument: the indexed build dispatches to the bucket.
    let key = atom(&mut indexed, "a");
    let x = var(&mut indexed, "X");
    let goal = app(&mut indexed, "f", vec![key, x]);
    let from_indexed = solutions(&mut indexed, vec![goal]);
    let key = atom(&mut plain, "a");
    let x = var(&mut plain, "X");
    let goal = app(&mut plain, "f", vec![key, x]);
    let from_plain = solutions(&mut plain, vec![goal]);
    assert_eq!(from_indexed, from_plain);
    let got: Vec<&Term> = from_indexed.iter().map(|b| &b["X"]).collect();
    assert_eq!(got, vec![&Term::Int(1), &Term::Int(3), &Term::Int(5)]);

    // Unbound first argument: both builds enumerate every clause in order.
    let k = var(&mut indexed, "K");
    let x = var(&mut indexed, "X");
    let goal = app(&mut indexed, "f", vec![k, x]);
    let from_indexed = solutions(&mut indexed, vec![goal]);
    let k = var(&mut plain, "K");
    let x = var(&mut plain, "X");
    let goal = app(&mut plain, "f", vec![k, x]);
    let from_plain = solutions(&mut plain, vec![goal]);
    assert_eq!(from_indexed, from_plain);
    assert_eq!(from_indexed.len(), 5);

    // A key with no bucket fails immediately under indexing, and by
    // exhausting the chain without one.
    let key = atom(&mut indexed, "zzz");
    let x = var(&mut indexed, "X");
    let goal = app(&mut indexed, "f", vec![key, x]);
    assert_eq!(solutions(&mut indexed, vec![goal]).len(), 0);
    let key = atom(&mut plain, "zzz");
    let x = var(&mut plain, "X");
    let goal = app(&mut plain, "f", vec![key, x]);
    assert_eq!(solutions(&mut plain, vec![goal]).len(), 0);
}

// =============================================================================
// 5. Monitors
// =============================================================================

/// An attached monitor sees reset, steps, execute entries, solutions and
/// backtracks — and cannot perturb the solutions it observes.
#[test]
fn monitors_observe_the_resolution() {
    let mut session = Session::new().attach_monitor(RecordingTracer::new());
    let a = atom(&mut session, "a");
    let head = app(&mut session, "p", vec![a]);
    session.compile(Clause::fact(head)).expect("p compiles");
    let b = atom(&mut session, "b");
    let head = app(&mut session, "p", vec![b]);
    session.compile(Clause::fact(head)).expect("p compiles");
    session.end_scope().expect("scope links");

    let x = var(&mut session, "X");
    let goal = app(&mut session, "p", vec![x]);
    let all = solutions(&mut session, vec![goal]);
    assert_eq!(all.len(), 2);

    let events = session.tracer_mut().events().to_vec();
    assert!(events.contains(&TraceEvent::Reset), "reset not observed");
    assert_eq!(
        events.iter().filter(|e| matches!(e, TraceEvent::Solution)).count(),
        2,
        "both solutions must be observed"
    );
    assert!(
        events.iter().any(|e| matches!(e, TraceEvent::Execute { .. })),
        "execute entries must be observed"
    );
    assert!(
        events.iter().any(|e| matches!(e, TraceEvent::Backtrack { .. })),
        "backtracks must be observed"
    );
}

/// The counting tracer tallies opcode dispatch frequencies.
#[test]
fn counting_tracer_tallies_opcodes() {
    let mut session = Session::new().attach_monitor(CountingTracer::new());
    let a = atom(&mut session, "a");
    let head = app(&mut session, "p", vec![a]);
    session.compile(Clause::fact(head)).expect("p compiles");
    session.end_scope().expect("scope links");

    let x = var(&mut session, "X");
    let goal = app(&mut session, "p", vec![x]);
    let all = solutions(&mut session, vec![goal]);
    assert_eq!(all.len(), 1);

    let tracer = session.tracer_mut();
    assert!(tracer.count(Opcode::GetConst) >= 1, "p/1's constant match must be counted");
    assert!(tracer.executes() >= 1, "the call into p/1 must be counted");
}

// =============================================================================
// 6. Deterministic stats
// =============================================================================

/// The step counter and solution counter reflect the drive loop.
#[test]
fn stats_count_solutions() {
    let mut session = Session::new();
    for name in ["a", "b", "c"] {
        let key = atom(&mut session, name);
        let head = app(&mut session, "p", vec![key]);
        session.compile(Clause::fact(head)).expect("clause compiles");
    }
    session.end_scope().expect("scope links");

    let x = var(&mut session, "X");
    let goal = app(&mut session, "p", vec![x]);
    let all = solutions(&mut session, vec![goal]);
    assert_eq!(all.len(), 3);
    let stats = session.machine_stats();
    assert_eq!(stats.solutions, 3);
    assert!(stats.steps > 0);
    assert!(stats.backtracks >= 3, "each retry and the final exhaustion backtrack");
}
