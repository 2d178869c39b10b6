//! Byte-code codec tests: encode/decode round-trips, two-phase linking,
//! link failures, and optimized/unoptimized execution equivalence.

use pretty_assertions::assert_eq;
use warren::{
    Bindings, Clause, CodeMachine, CompilerObserver, Instr, Interns, Label, LinkError, Listing, Machine, NoLimitTracker,
    NoopTracer, Place, PredicateListing, RegId, Session, SessionError, SlotId, Term, WellKnown,
};

// =============================================================================
// 1. Round-trip encoding
// =============================================================================

/// `decode(encode(i)) == i` for every instruction kind, with branch labels
/// resolved to absolute addresses and call targets mapped back to functors.
#[test]
fn every_instruction_round_trips() {
    let mut interns = Interns::new();
    let mut code = CodeMachine::new();

    // A target predicate so call/execute operands resolve.
    let q = interns.intern_functor("q", 0);
    let q_point = code.reserve(q, 1);
    code.encode(q_point, &Listing::plain(vec![Instr::Proceed])).expect("q encodes");

    let f2 = interns.intern_functor("f", 2);
    let a0 = interns.intern_functor("a", 0);
    let unify = WellKnown::Unify.functor_id();
    let cons = WellKnown::Cons.functor_id();

    let mut listing = Listing::default();
    let end = listing.fresh_label();
    let body = [
        Instr::TryMeElse { alt: end },
        Instr::RetryMeElse { alt: end },
        Instr::Try { clause: end },
        Instr::Retry { clause: end },
        Instr::Trust { clause: end },
        Instr::SwitchOnTerm { var: end, con: Label::FAIL, lis: end, struc: Label::FAIL },
        Instr::SwitchOnConst { table: vec![(a0, end)] },
        Instr::SwitchOnStruc { table: vec![(f2, end), (cons, end)] },
        Instr::PutVar { place: Place::Temp(RegId(3)), arg: RegId(1) },
        Instr::PutVar { place: Place::Perm(SlotId(2)), arg: RegId(1) },
        Instr::PutVal { place: Place::Temp(RegId(4)), arg: RegId(2) },
        Instr::PutConst { c: a0, arg: RegId(1) },
        Instr::PutInt { n: -42, arg: RegId(2) },
        Instr::PutStruc { f: f2, arg: RegId(1) },
        Instr::PutList { arg: RegId(2) },
        Instr::SetVar { place: Place::Temp(RegId(5)) },
        Instr::SetVal { place: Place::Perm(SlotId(1)) },
        Instr::SetConst { c: a0 },
        Instr::SetInt { n: i64::MIN },
        Instr::SetVoid { n: 3 },
        Instr::GetVar { place: Place::Temp(RegId(6)), arg: RegId(1) },
        Instr::GetVal { place: Place::Perm(SlotId(3)), arg: RegId(2) },
        Instr::GetConst { c: a0, arg: RegId(1) },
        Instr::GetInt { n: 7, arg: RegId(1) },
        Instr::GetStruc { f: f2, arg: RegId(1) },
        Instr::GetList { arg: RegId(2) },
        Instr::UnifyVar { place: Place::Temp(RegId(7)) },
        Instr::UnifyVal { place: Place::Perm(SlotId(4)) },
        Instr::UnifyConst { c: a0 },
        Instr::UnifyInt { n: -1 },
        Instr::UnifyVoid { n: 2 },
        Instr::Allocate { n: 4 },
        Instr::GetLevel { slot: SlotId(4) },
        Instr::Cut { slot: SlotId(4) },
        Instr::NeckCut,
        Instr::Call { f: q, live: 2 },
        Instr::Call { f: unify, live: 0 },
        Instr::Execute { f: q },
        Instr::Deallocate,
        Instr::TrustMe,
        Instr::Proceed,
    ];
    for instr in body {
        listing.instrs.push(instr);
    }
    listing.bind(end);
    listing.instrs.push(Instr::Proceed);

    let p = interns.intern_functor("p", 0);
    let point = code.reserve(p, listing.byte_len());
    code.encode(point, &listing).expect("p encodes");

    // The label points at the final proceed; compute its absolute address.
    let end_addr = point.start + listing.instrs[..listing.instrs.len() - 1].iter().map(Instr::size).sum::<u32>();
    let resolve_label = |l: Label| if l == Label::FAIL { Label(warren::FAIL_ADDR) } else { Label(end_addr) };
    let expected: Vec<Instr> = listing
        .instrs
        .iter()
        .cloned()
        .map(|instr| match instr {
            Instr::TryMeElse { alt } => Instr::TryMeElse { alt: resolve_label(alt) },
            Instr::RetryMeElse { alt } => Instr::RetryMeElse { alt: resolve_label(alt) },
            Instr::Try { clause } => Instr::Try { clause: resolve_label(clause) },
            Instr::Retry { clause } => Instr::Retry { clause: resolve_label(clause) },
            Instr::Trust { clause } => Instr::Trust { clause: resolve_label(clause) },
            Instr::SwitchOnTerm { var, con, lis, struc } => Instr::SwitchOnTerm {
                var: resolve_label(var),
                con: resolve_label(con),
                lis: resolve_label(lis),
                struc: resolve_label(struc),
            },
            Instr::SwitchOnConst { table } => Instr::SwitchOnConst {
                table: table.into_iter().map(|(c, l)| (c, resolve_label(l))).collect(),
            },
            Instr::SwitchOnStruc { table } => Instr::SwitchOnStruc {
                table: table.into_iter().map(|(c, l)| (c, resolve_label(l))).collect(),
            },
            other => other,
        })
        .collect();

    let mut decoded = Vec::new();
    let mut addr = point.start;
    while addr < point.start + point.len {
        let (instr, next) = code.decode_at(addr);
        decoded.push(instr);
        addr = next;
    }
    assert_eq!(decoded, expected);
}

// =============================================================================
// 2. Two-phase linking
// =============================================================================

/// Mutually recursive predicates compiled in one scope link through the
/// reserve-then-encode batch and execute correctly.
#[test]
fn mutually_recursive_predicates_link_in_one_batch() {
    let mut session = Session::new();

    // even(z). even(s(X)) :- odd(X). odd(s(X)) :- even(X).
    let z = session.interns_mut().atom("z");
    let head = session.interns_mut().app("even", vec![z]);
    session.compile(Clause::fact(head)).expect("even/1 base compiles");

    let x = session.interns_mut().var("X");
    let s_x = session.interns_mut().app("s", vec![x.clone()]);
    let head = session.interns_mut().app("even", vec![s_x]);
    let body = session.interns_mut().app("odd", vec![x]);
    session.compile(Clause::new(head, vec![body])).expect("even/1 step compiles");

    let x = session.interns_mut().var("X");
    let s_x = session.interns_mut().app("s", vec![x.clone()]);
    let head = session.interns_mut().app("odd", vec![s_x]);
    let body = session.interns_mut().app("even", vec![x]);
    session.compile(Clause::new(head, vec![body])).expect("odd/1 compiles");

    session.end_scope().expect("forward references link within the batch");

    // ?- even(s(s(z))).
    let z = session.interns_mut().atom("z");
    let s1 = session.interns_mut().app("s", vec![z]);
    let s2 = session.interns_mut().app("s", vec![s1]);
    let goal = session.interns_mut().app("even", vec![s2]);
    let query = session.compile_query(vec![goal]).expect("query compiles");
    session.set_query(&query);
    assert!(session.resolve().expect("resolution runs").is_some(), "even(s(s(z))) holds");
    assert!(session.resolve().expect("resolution runs").is_none());

    // ?- even(s(z)). fails.
    let z = session.interns_mut().atom("z");
    let s1 = session.interns_mut().app("s", vec![z]);
    let goal = session.interns_mut().app("even", vec![s1]);
    let query = session.compile_query(vec![goal]).expect("query compiles");
    session.set_query(&query);
    assert!(session.resolve().expect("resolution runs").is_none(), "even(s(z)) fails");
}

/// A call to a functor with no call-point and no built-in is a link error;
/// the offending predicate is not installed.
#[test]
fn unresolved_calls_fail_at_link_time() {
    let mut session = Session::new();
    let head = session.interns_mut().atom("r");
    let body = session.interns_mut().atom("missing");
    session.compile(Clause::new(head, vec![body])).expect("r compiles");
    let err = session.end_scope().expect_err("missing/0 does not resolve");

    let missing = session.interns_mut().intern_functor("missing", 0);
    let r = session.interns_mut().intern_functor("r", 0);
    assert_eq!(err, LinkError::Unresolved { caller: r, callee: missing });
    assert!(session.disassemble(r).is_none(), "r must not be installed");

    // A query against the withdrawn predicate fails to link too.
    let goal = session.interns_mut().atom("r");
    let err = session.compile_query(vec![goal]).expect_err("query cannot link");
    assert!(matches!(err, SessionError::Link(_)), "got {err:?}");
}

// =============================================================================
// 3. Image dump/load
// =============================================================================

/// A dumped session image reloads with its code and interner intact and
/// resolves queries identically.
#[test]
fn session_image_round_trips_through_postcard() {
    let mut session = Session::new();
    let a = session.interns_mut().atom("a");
    let head = session.interns_mut().app("p", vec![a]);
    session.compile(Clause::fact(head)).expect("p compiles");
    let b = session.interns_mut().atom("b");
    let head = session.interns_mut().app("p", vec![b]);
    session.compile(Clause::fact(head)).expect("p compiles");
    session.end_scope().expect("scope links");

    let bytes = session.dump().expect("image serializes");
    let mut reloaded = Session::load(&bytes).expect("image deserializes");

    let x = reloaded.interns_mut().var("X");
    let goal = reloaded.interns_mut().app("p", vec![x]);
    let query = reloaded.compile_query(vec![goal]).expect("query compiles against the image");
    reloaded.set_query(&query);
    let first = reloaded.resolve().expect("resolution runs").expect("first solution");
    let expected = reloaded.interns_mut().atom("a");
    assert_eq!(first["X"], expected);
    let second = reloaded.resolve().expect("resolution runs").expect("second solution");
    let expected = reloaded.interns_mut().atom("b");
    assert_eq!(second["X"], expected);
    assert!(reloaded.resolve().expect("resolution runs").is_none());
}

// =============================================================================
// 4. Optimizer preservation
// =============================================================================

#[derive(Default)]
struct CaptureAll {
    listings: std::rc::Rc<std::cell::RefCell<Vec<PredicateListing>>>,
}

impl CompilerObserver for CaptureAll {
    fn on_predicate(&mut self, listing: &PredicateListing) {
        self.listings.borrow_mut().push(listing.clone());
    }

    fn on_query(&mut self, listing: &PredicateListing) {
        self.listings.borrow_mut().push(listing.clone());
    }
}

/// Encoding the *unoptimized* listings into a second code machine and
/// resolving there produces exactly the solutions of the optimized build.
#[test]
fn unoptimized_bytecode_produces_identical_solutions() {
    let capture = CaptureAll::default();
    let listings = std::rc::Rc::clone(&capture.listings);

    let mut session = Session::new();
    session.set_observer(Box::new(capture));

    // append(nil, L, L). append(cons(H,T), L, cons(H,R)) :- append(T, L, R).
    let nil = session.interns_mut().atom("nil");
    let l = session.interns_mut().var("L");
    let head = session.interns_mut().app("append", vec![nil, l.clone(), l]);
    session.compile(Clause::fact(head)).expect("base compiles");
    let h = session.interns_mut().var("H");
    let t = session.interns_mut().var("T");
    let l = session.interns_mut().var("L");
    let r = session.interns_mut().var("R");
    let a1 = session.interns_mut().app("cons", vec![h.clone(), t.clone()]);
    let a3 = session.interns_mut().app("cons", vec![h, r.clone()]);
    let head = session.interns_mut().app("append", vec![a1, l.clone(), a3]);
    let body = session.interns_mut().app("append", vec![t, l, r]);
    session.compile(Clause::new(head, vec![body])).expect("step compiles");
    session.end_scope().expect("scope links");

    // ?- append(A, B, [1, 2]).
    let a = session.interns_mut().var("A");
    let b = session.interns_mut().var("B");
    let whole = session.interns_mut().list(vec![Term::Int(1), Term::Int(2)], None);
    let goal = session.interns_mut().app("append", vec![a, b, whole]);
    let query = session.compile_query(vec![goal]).expect("query compiles");

    // Optimized run through the session.
    session.set_query(&query);
    let mut optimized: Vec<Bindings> = Vec::new();
    while let Some(bindings) = session.resolve().expect("optimized run") {
        optimized.push(bindings);
    }
    assert_eq!(optimized.len(), 3);

    // Unoptimized run: re-encode the naive listings into a fresh code area.
    let mut code = CodeMachine::new();
    let captured = listings.borrow();
    let mut points = Vec::new();
    for listing in captured.iter() {
        points.push(code.reserve(listing.functor, listing.unoptimized.byte_len()));
    }
    for (point, listing) in points.into_iter().zip(captured.iter()) {
        code.encode(point, &listing.unoptimized).expect("naive listing encodes");
    }

    let mut machine = Machine::new(NoLimitTracker, NoopTracer);
    machine.set_query(&code, &query);
    let mut naive: Vec<Bindings> = Vec::new();
    while let Some(bindings) = machine
        .resolve(&code, session.interns_mut())
        .expect("unoptimized run")
    {
        naive.push(bindings);
    }
    assert_eq!(naive, optimized, "the peephole pass must not change solutions");
}
