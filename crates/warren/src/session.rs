//! The session: the front door tying interner, symbol table, compiler, code
//! machine and resolver together.
//!
//! Front-ends deliver parsed clause trees with interned names; the session
//! accumulates them with [`Session::compile`] and installs the batch with
//! [`Session::end_scope`] — a two-phase emit (reserve every call-point, then
//! encode) so mutually recursive predicates can reference each other freely
//! within a batch. Queries go through the same clause pipeline under a
//! reserved predicate and run with [`Session::set_query`] /
//! [`Session::resolve`], which yields one binding set per solution in
//! left-to-right, depth-first, clause-definition order.
//!
//! A compiled program can be serialized with [`Session::dump`] and reloaded
//! with [`Session::load`]; the image carries the code area and the interner,
//! which together are the persisted byte-code format.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    analysis::analyze,
    builtins::Builtin,
    code::CodeMachine,
    compile::{
        CompileOptions, CompiledQuery, FirstArg, PredicateListing, assemble, classify_first_arg, compile_clause,
        query_clause,
    },
    error::{CompileError, CompileErrorKind, LinkError, SessionError, SolveError},
    instr::Instr,
    intern::{FunctorId, Interns},
    machine::{Bindings, Machine, MachineStats},
    optimize::optimize,
    resource::{NoLimitTracker, ResourceTracker},
    symtab::{Field, ScopeKey, SymbolTable},
    term::{Clause, Term},
    tracer::{MachineTracer, NoopTracer},
};

/// Receives every finished compiled predicate and compiled query.
///
/// Observers are passive: they see both the unoptimized and the optimized
/// listing of each predicate, but cannot alter what gets installed.
pub trait CompilerObserver {
    fn on_predicate(&mut self, _listing: &PredicateListing) {}
    fn on_query(&mut self, _listing: &PredicateListing) {}
}

/// One predicate's clauses accumulated in the current scope.
struct PendingPredicate {
    functor: FunctorId,
    /// Per clause: naive code, optimized code, first-argument class.
    clauses: Vec<(Vec<Instr>, Vec<Instr>, FirstArg)>,
}

/// A compiler-and-resolver session.
///
/// The tracker bounds resolution (and carries the cooperative stop flag);
/// the tracer observes it. Both default to the zero-cost implementations.
pub struct Session<T: ResourceTracker = NoLimitTracker, Tr: MachineTracer = NoopTracer> {
    interns: Interns,
    symtab: SymbolTable,
    code: CodeMachine,
    machine: Machine<T, Tr>,
    options: CompileOptions,
    pending: Vec<PendingPredicate>,
    /// Both listings of every installed predicate, kept for debugging.
    listings: AHashMap<FunctorId, PredicateListing>,
    observer: Option<Box<dyn CompilerObserver>>,
}

/// The serialized form of a session's compiled program.
#[derive(Serialize, Deserialize)]
struct SessionImage {
    interns: Interns,
    code: CodeMachine,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session with no resource limits and no tracing.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(NoLimitTracker, NoopTracer)
    }

    /// Deserializes a session image produced by [`Session::dump`].
    ///
    /// The reloaded session resolves queries against the saved program and
    /// accepts further compilation.
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        let image: SessionImage = postcard::from_bytes(bytes)?;
        let mut session = Self::new();
        session.interns = image.interns;
        session.code = image.code;
        Ok(session)
    }
}

impl<T: ResourceTracker, Tr: MachineTracer> Session<T, Tr> {
    /// A session with an explicit resource tracker and tracer.
    pub fn with_parts(tracker: T, tracer: Tr) -> Self {
        Self {
            interns: Interns::new(),
            symtab: SymbolTable::new(),
            code: CodeMachine::new(),
            machine: Machine::new(tracker, tracer),
            options: CompileOptions::default(),
            pending: Vec::new(),
            listings: AHashMap::new(),
            observer: None,
        }
    }

    /// Replaces the monitor, resetting any in-progress resolution.
    #[must_use]
    pub fn attach_monitor<Tr2: MachineTracer>(self, tracer: Tr2) -> Session<T, Tr2> {
        let (tracker, _) = self.machine.into_parts();
        Session {
            interns: self.interns,
            symtab: self.symtab,
            code: self.code,
            machine: Machine::new(tracker, tracer),
            options: self.options,
            pending: self.pending,
            listings: self.listings,
            observer: self.observer,
        }
    }

    /// The session's interner, for front-ends building terms.
    pub fn interns(&self) -> &Interns {
        &self.interns
    }

    pub fn interns_mut(&mut self) -> &mut Interns {
        &mut self.interns
    }

    /// Compiler configuration; takes effect at the next `end_scope`.
    pub fn options_mut(&mut self) -> &mut CompileOptions {
        &mut self.options
    }

    /// Installs a compiler observer.
    pub fn set_observer(&mut self, observer: Box<dyn CompilerObserver>) {
        self.observer = Some(observer);
    }

    /// Adds a clause to the current scope's accumulation of its predicate.
    ///
    /// Clauses of one predicate keep their source order; the predicate is
    /// assembled and installed at the next [`Session::end_scope`].
    pub fn compile(&mut self, clause: Clause) -> Result<(), CompileError> {
        let (functor, _) = clause
            .head
            .functor()
            .ok_or_else(|| CompileError::new(CompileErrorKind::MalformedHead, clause.span))?;
        if Builtin::from_functor(functor).is_some() {
            return Err(CompileError::new(
                CompileErrorKind::BuiltinRedefinition(functor),
                clause.span,
            ));
        }

        let (unoptimized, optimized, first_arg) = self.compile_one(&clause, functor)?;
        match self.pending.iter_mut().find(|p| p.functor == functor) {
            Some(pending) => pending.clauses.push((unoptimized, optimized, first_arg)),
            None => self.pending.push(PendingPredicate {
                functor,
                clauses: vec![(unoptimized, optimized, first_arg)],
            }),
        }
        Ok(())
    }

    fn compile_one(
        &mut self,
        clause: &Clause,
        functor: FunctorId,
    ) -> Result<(Vec<Instr>, Vec<Instr>, FirstArg), CompileError> {
        let pred_key = self.symtab.symbol_key_for(&[ScopeKey::Pred(functor)]);
        let clause_index = self.symtab.bump_count(pred_key, Field::ClauseCount) - 1;
        let mut analysis = analyze(clause, functor, clause_index, &mut self.symtab)?;
        let first_arg = classify_first_arg(&clause.head, &mut self.interns);
        let unoptimized = compile_clause(clause, &mut analysis, &mut self.interns)?;
        let optimized = optimize(unoptimized.clone(), &analysis.voidable, &self.interns);
        Ok((unoptimized, optimized, first_arg))
    }

    /// Finalizes the current scope: assembles every accumulated predicate,
    /// reserves all call-points, then encodes them, resolving cross-calls —
    /// including forward references within the batch — through the
    /// call-point resolver.
    ///
    /// On a link failure the offending predicate is withdrawn and not
    /// installed; the rest of the batch stays.
    pub fn end_scope(&mut self) -> Result<(), LinkError> {
        let pending = std::mem::take(&mut self.pending);
        let mut prepared = Vec::with_capacity(pending.len());
        for pred in &pending {
            let first_args: Vec<FirstArg> = pred.clauses.iter().map(|(_, _, fa)| *fa).collect();
            let naive: Vec<Vec<Instr>> = pred.clauses.iter().map(|(u, _, _)| u.clone()).collect();
            let opt: Vec<Vec<Instr>> = pred.clauses.iter().map(|(_, o, _)| o.clone()).collect();
            let listing = PredicateListing {
                functor: pred.functor,
                unoptimized: assemble(&naive, &first_args, self.options.first_arg_indexing),
                optimized: assemble(&opt, &first_args, self.options.first_arg_indexing),
                clause_count: pred.clauses.len() as u32,
            };
            let point = self.code.reserve(pred.functor, listing.optimized.byte_len());
            prepared.push((point, listing));
        }

        let mut first_error = None;
        for (point, listing) in prepared {
            match self.code.encode(point, &listing.optimized) {
                Ok(()) => {
                    if let Some(observer) = self.observer.as_mut() {
                        observer.on_predicate(&listing);
                    }
                    self.listings.insert(listing.functor, listing);
                }
                Err(err) => {
                    self.code.withdraw(listing.functor);
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Compiles a clause and installs it immediately as a complete
    /// single-clause predicate, inserting or replacing the definition.
    pub fn add_clause_to_domain(&mut self, clause: Clause) -> Result<(), SessionError> {
        // Compiling through the scope machinery would merge with pending
        // clauses; a domain update is its own one-predicate batch.
        assert!(
            self.pending.is_empty(),
            "add_clause_to_domain during an open scope; call end_scope first"
        );
        self.compile(clause)?;
        self.end_scope()?;
        Ok(())
    }

    /// Compiles a query body and installs it under the reserved query
    /// predicate, replacing any previous query.
    pub fn compile_query(&mut self, goals: Vec<Term>) -> Result<CompiledQuery, SessionError> {
        let (clause, vars) = query_clause(goals, &mut self.interns)?;
        let (functor, _) = clause.head.functor().expect("query head is synthetic");
        let (unoptimized, optimized, _) = self.compile_one(&clause, functor)?;
        let listing = PredicateListing {
            functor,
            unoptimized: assemble(std::slice::from_ref(&unoptimized), &[FirstArg::Var], false),
            optimized: assemble(std::slice::from_ref(&optimized), &[FirstArg::Var], false),
            clause_count: 1,
        };
        let point = self.code.reserve(functor, listing.optimized.byte_len());
        if let Err(err) = self.code.encode(point, &listing.optimized) {
            self.code.withdraw(functor);
            return Err(err.into());
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.on_query(&listing);
        }
        self.listings.insert(functor, listing);
        Ok(CompiledQuery { functor, vars })
    }

    /// Installs a compiled query as the machine's starting point.
    pub fn set_query(&mut self, query: &CompiledQuery) {
        self.machine.set_query(&self.code, query);
    }

    /// Produces the next solution, or `None` when the search is exhausted.
    pub fn resolve(&mut self) -> Result<Option<Bindings>, SolveError> {
        self.machine.resolve(&self.code, &mut self.interns)
    }

    /// Counters and high-water marks of the current resolution.
    #[must_use]
    pub fn machine_stats(&self) -> MachineStats {
        self.machine.stats()
    }

    /// The machine's tracer, for collecting observations.
    pub fn tracer_mut(&mut self) -> &mut Tr {
        self.machine.tracer()
    }

    /// Renders a predicate's installed code.
    #[must_use]
    pub fn disassemble(&self, functor: FunctorId) -> Option<String> {
        self.code.disassemble(functor, &self.interns)
    }

    /// The retained listings (naive and optimized) of an installed predicate.
    #[must_use]
    pub fn listing(&self, functor: FunctorId) -> Option<&PredicateListing> {
        self.listings.get(&functor)
    }

    /// Serializes the compiled program (code area plus interner).
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        let image = SessionImage {
            interns: self.interns.clone(),
            code: self.code.clone(),
        };
        postcard::to_allocvec(&image)
    }
}
