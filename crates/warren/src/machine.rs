//! The resolver: executes byte-code with unification and backtracking.
//!
//! The machine decodes the instruction at `P` on every step, which is what
//! gives predicate redefinition its late-binding behavior: `call`/`execute`
//! targets are re-resolved by interned name at every transfer. State follows
//! the classic register set — `P`, `CP`, `E`, `B` (the choicepoint stack
//! itself), `H`, `TR`, `S`, the read/write mode flag, `HB` (the top
//! choicepoint's saved heap top) and `B0` (the cut barrier).
//!
//! Unification failure is not an error: it triggers a backtrack, restoring
//! the machine to the youngest choicepoint and continuing at its next
//! alternative. Only arithmetic type/instantiation errors and resource-limit
//! violations abort a resolution. A raised stop flag is observed at
//! choicepoint creation and backtracking and reported as exhaustion, never as
//! partial state.
//!
//! The machine is monomorphized over its [`ResourceTracker`] and
//! [`MachineTracer`], so the production pair
//! ([`NoLimitTracker`](crate::resource::NoLimitTracker), [`NoopTracer`])
//! costs nothing.

use ahash::AHashSet;
use indexmap::IndexMap;
use smallvec::{SmallVec, smallvec};

use crate::{
    builtins::{ArithOp, Builtin},
    code::{CallTarget, CodeMachine, FAIL_ADDR, HALT_ADDR},
    compile::CompiledQuery,
    error::{MachineResult, SolveError},
    instr::{Instr, Place, RegId, SlotId},
    intern::{FunctorName, Interns, WellKnown},
    resource::{ResourceError, ResourceTracker},
    store::{Addr, Cell, ChoiceFrame, EnvFrame, Heap},
    term::Term,
    tracer::{MachineSnapshot, MachineTracer},
};

/// One solution: the query's free variables bound to reified terms, in
/// query-variable order.
pub type Bindings = IndexMap<String, Term>;

/// High-water marks and counters for one resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineStats {
    /// Instructions dispatched.
    pub steps: u64,
    /// Solutions produced so far.
    pub solutions: u64,
    /// Backtracks taken.
    pub backtracks: u64,
    /// Largest heap size reached, in cells.
    pub heap_high_water: usize,
    /// Largest environment-stack depth reached.
    pub env_high_water: usize,
    /// Largest choicepoint-stack depth reached.
    pub choice_high_water: usize,
    /// Largest trail depth reached.
    pub trail_high_water: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// No query installed.
    Idle,
    /// Query installed, not yet run.
    Ready,
    /// Stopped at a success; the next `resolve` forces a failure into the
    /// last choicepoint.
    Succeeded,
    /// The search space is exhausted.
    Exhausted,
}

/// Read-only snapshot constructor; a macro so the disjoint field borrows
/// survive being passed alongside `&mut self.tracer`.
macro_rules! snap {
    ($m:expr) => {
        MachineSnapshot {
            p: $m.p,
            cp: $m.cp,
            h: $m.heap.len(),
            tr: $m.trail.len(),
            env_depth: $m.envs.len(),
            choice_depth: $m.choices.len(),
            heap: $m.heap.cells(),
        }
    };
}

/// The WAM resolver.
#[derive(Debug)]
pub struct Machine<T: ResourceTracker, Tr: MachineTracer> {
    heap: Heap,
    /// Argument/temporary registers, 1-based; index 0 is unused.
    regs: Vec<Cell>,
    envs: Vec<EnvFrame>,
    choices: Vec<ChoiceFrame>,
    trail: Vec<Addr>,
    p: u32,
    cp: u32,
    e: Option<u32>,
    b0: u32,
    s: Addr,
    mode: Mode,
    /// Arity of the predicate currently entered; sets the choicepoint's saved
    /// argument count.
    num_args: u8,
    /// Heap address of each query variable, recorded at `set_query`.
    query_vars: Vec<(crate::intern::VarId, Addr)>,
    state: State,
    /// Trail unconditionally; used during `\=` trial unification so every
    /// binding can be undone.
    force_trail: bool,
    tracker: T,
    tracer: Tr,
    stats: MachineStats,
}

impl<T: ResourceTracker, Tr: MachineTracer> Machine<T, Tr> {
    pub fn new(tracker: T, tracer: Tr) -> Self {
        Self {
            heap: Heap::new(),
            regs: vec![Cell::Int(0); 256],
            envs: Vec::new(),
            choices: Vec::new(),
            trail: Vec::new(),
            p: HALT_ADDR,
            cp: HALT_ADDR,
            e: None,
            b0: 0,
            s: 0,
            mode: Mode::Read,
            num_args: 0,
            query_vars: Vec::new(),
            state: State::Idle,
            force_trail: false,
            tracker,
            tracer,
            stats: MachineStats::default(),
        }
    }

    /// The tracer, for collecting its observations after a resolution.
    pub fn tracer(&mut self) -> &mut Tr {
        &mut self.tracer
    }

    /// Dismantles the machine, returning its tracker and tracer. All
    /// resolution state is discarded.
    #[must_use]
    pub fn into_parts(self) -> (T, Tr) {
        (self.tracker, self.tracer)
    }

    /// Counters and high-water marks of the current resolution.
    #[must_use]
    pub fn stats(&self) -> MachineStats {
        self.stats
    }

    /// Installs a compiled query: resets all data areas, seeds one fresh
    /// unbound heap cell per query variable into the argument registers, and
    /// points `P` at the query predicate.
    ///
    /// # Panics
    /// Panics if the query predicate is not installed in `code`.
    pub fn set_query(&mut self, code: &CodeMachine, query: &CompiledQuery) {
        self.heap.clear();
        self.regs.fill(Cell::Int(0));
        self.envs.clear();
        self.choices.clear();
        self.trail.clear();
        self.query_vars.clear();
        self.stats = MachineStats::default();
        self.e = None;
        self.b0 = 0;
        self.s = 0;
        self.mode = Mode::Read;
        self.cp = HALT_ADDR;

        for (i, &var) in query.vars.iter().enumerate() {
            let addr = self.heap.push_unbound();
            self.regs[i + 1] = Cell::Ref(addr);
            self.query_vars.push((var, addr));
        }
        self.num_args = query.vars.len() as u8;

        let Some(CallTarget::Code(addr)) = code.resolve(query.functor) else {
            panic!("query predicate is not installed in the code machine");
        };
        self.p = addr;
        self.state = State::Ready;
        self.tracer.on_reset(&snap!(self));
    }

    /// Steps the machine to the next solution.
    ///
    /// Returns the bindings of the query's free variables, or `None` when the
    /// search is exhausted (or cancelled through the tracker's stop flag).
    /// Fatal conditions abort the resolution with an error; no partial
    /// bindings are returned.
    pub fn resolve(&mut self, code: &CodeMachine, interns: &mut Interns) -> Result<Option<Bindings>, SolveError> {
        match self.state {
            State::Idle => return Err(SolveError::NoQuery),
            State::Exhausted => return Ok(None),
            State::Succeeded => {
                // Force a failure into the last success point.
                if !self.backtrack()? {
                    return self.exhausted();
                }
            }
            State::Ready => {}
        }
        let result = self.run(code, interns);
        if result.is_err() {
            // A fatal condition aborts the whole resolution; there is no
            // partial-success recovery.
            self.state = State::Exhausted;
        }
        result
    }

    fn exhausted(&mut self) -> Result<Option<Bindings>, SolveError> {
        self.state = State::Exhausted;
        Ok(None)
    }

    fn run(&mut self, code: &CodeMachine, interns: &mut Interns) -> Result<Option<Bindings>, SolveError> {
        loop {
            if self.p == HALT_ADDR {
                self.stats.solutions += 1;
                self.tracer.on_solution(&snap!(self));
                self.state = State::Succeeded;
                let bindings = self.reify_bindings(interns);
                return Ok(Some(bindings));
            }
            if self.p == FAIL_ADDR {
                if !self.backtrack()? {
                    return self.exhausted();
                }
                continue;
            }

            self.tracker.on_step().map_err(SolveError::from)?;
            let (instr, next) = code.decode_at(self.p);
            self.stats.steps += 1;
            self.tracer.on_step(&instr, &snap!(self));
            self.p = next;

            let ok = match instr {
                Instr::PutVar { place, arg } => {
                    let addr = self.push_unbound()?;
                    self.write_place(place, Cell::Ref(addr));
                    self.regs[arg.0 as usize] = Cell::Ref(addr);
                    true
                }
                Instr::PutVal { place, arg } => {
                    self.regs[arg.0 as usize] = self.read_place(place);
                    true
                }
                Instr::PutConst { c, arg } => {
                    self.regs[arg.0 as usize] = Cell::Con(c);
                    true
                }
                Instr::PutInt { n, arg } => {
                    self.regs[arg.0 as usize] = Cell::Int(n);
                    true
                }
                Instr::PutStruc { f, arg } => {
                    let header = self.push_cell(Cell::Fun(f))?;
                    self.regs[arg.0 as usize] = Cell::Str(header);
                    true
                }
                Instr::PutList { arg } => {
                    self.regs[arg.0 as usize] = Cell::Lis(self.heap.top());
                    true
                }
                Instr::SetVar { place } => {
                    let addr = self.push_unbound()?;
                    self.write_place(place, Cell::Ref(addr));
                    true
                }
                Instr::SetVal { place } => {
                    let cell = self.read_place(place);
                    self.push_cell(cell)?;
                    true
                }
                Instr::SetConst { c } => {
                    self.push_cell(Cell::Con(c))?;
                    true
                }
                Instr::SetInt { n } => {
                    self.push_cell(Cell::Int(n))?;
                    true
                }
                Instr::SetVoid { n } => {
                    for _ in 0..n {
                        self.push_unbound()?;
                    }
                    true
                }
                Instr::GetVar { place, arg } => {
                    self.write_place(place, self.regs[arg.0 as usize]);
                    true
                }
                Instr::GetVal { place, arg } => {
                    let a = self.read_place(place);
                    let b = self.regs[arg.0 as usize];
                    self.unify(a, b, interns)
                }
                Instr::GetConst { c, arg } => {
                    let a = self.regs[arg.0 as usize];
                    self.unify(a, Cell::Con(c), interns)
                }
                Instr::GetInt { n, arg } => {
                    let a = self.regs[arg.0 as usize];
                    self.unify(a, Cell::Int(n), interns)
                }
                Instr::GetStruc { f, arg } => self.get_struc(f, arg)?,
                Instr::GetList { arg } => self.get_list(arg)?,
                Instr::UnifyVar { place } => {
                    match self.mode {
                        Mode::Read => {
                            let cell = self.heap.get(self.s);
                            self.write_place(place, cell);
                            self.s += 1;
                        }
                        Mode::Write => {
                            let addr = self.push_unbound()?;
                            self.write_place(place, Cell::Ref(addr));
                        }
                    }
                    true
                }
                Instr::UnifyVal { place } => match self.mode {
                    Mode::Read => {
                        let sub = self.heap.get(self.s);
                        self.s += 1;
                        let cell = self.read_place(place);
                        self.unify(cell, sub, interns)
                    }
                    Mode::Write => {
                        let cell = self.read_place(place);
                        self.push_cell(cell)?;
                        true
                    }
                },
                Instr::UnifyConst { c } => match self.mode {
                    Mode::Read => {
                        let sub = self.heap.get(self.s);
                        self.s += 1;
                        self.unify(sub, Cell::Con(c), interns)
                    }
                    Mode::Write => {
                        self.push_cell(Cell::Con(c))?;
                        true
                    }
                },
                Instr::UnifyInt { n } => match self.mode {
                    Mode::Read => {
                        let sub = self.heap.get(self.s);
                        self.s += 1;
                        self.unify(sub, Cell::Int(n), interns)
                    }
                    Mode::Write => {
                        self.push_cell(Cell::Int(n))?;
                        true
                    }
                },
                Instr::UnifyVoid { n } => {
                    match self.mode {
                        Mode::Read => self.s += u32::from(n),
                        Mode::Write => {
                            for _ in 0..n {
                                self.push_unbound()?;
                            }
                        }
                    }
                    true
                }
                Instr::Allocate { n } => {
                    self.envs.push(EnvFrame {
                        ce: self.e,
                        cp: self.cp,
                        slots: smallvec![Cell::Int(0); n as usize],
                    });
                    self.e = Some(self.envs.len() as u32 - 1);
                    self.stats.env_high_water = self.stats.env_high_water.max(self.envs.len());
                    true
                }
                Instr::Deallocate => {
                    let ei = self.e.expect("deallocate without an environment") as usize;
                    let frame = &self.envs[ei];
                    self.cp = frame.cp;
                    self.e = frame.ce;
                    // Physically pop only when no choicepoint protects the
                    // frame; otherwise it stays until a backtrack discards it.
                    let protected = self.choices.last().is_some_and(|c| c.env_len as usize > ei);
                    if ei == self.envs.len() - 1 && !protected {
                        self.envs.pop();
                    }
                    true
                }
                Instr::Call { f, live } => {
                    self.b0 = self.choices.len() as u32;
                    self.trim_env(live);
                    self.tracer.on_execute(f, &snap!(self));
                    match code.resolve(f).expect("encoded call target resolves") {
                        CallTarget::Builtin(b) => self.run_builtin(b, interns)?,
                        CallTarget::Code(addr) => {
                            self.cp = self.p;
                            self.num_args = interns.functor_arity(f) as u8;
                            self.p = addr;
                            true
                        }
                    }
                }
                Instr::Execute { f } => {
                    self.b0 = self.choices.len() as u32;
                    self.tracer.on_execute(f, &snap!(self));
                    match code.resolve(f).expect("encoded call target resolves") {
                        CallTarget::Builtin(b) => {
                            let ok = self.run_builtin(b, interns)?;
                            if ok {
                                self.p = self.cp;
                            }
                            ok
                        }
                        CallTarget::Code(addr) => {
                            self.num_args = interns.functor_arity(f) as u8;
                            self.p = addr;
                            true
                        }
                    }
                }
                Instr::Proceed => {
                    self.p = self.cp;
                    true
                }
                Instr::TryMeElse { alt } => {
                    match self.push_choicepoint(alt.0) {
                        Ok(()) => true,
                        Err(ResourceError::Interrupted) => return self.exhausted(),
                        Err(e) => return Err(e.into()),
                    }
                }
                Instr::RetryMeElse { alt } => {
                    self.choices.last_mut().expect("retry without a choicepoint").next = alt.0;
                    true
                }
                Instr::TrustMe => {
                    self.choices.pop().expect("trust without a choicepoint");
                    true
                }
                Instr::Try { clause } => {
                    match self.push_choicepoint(self.p) {
                        Ok(()) => {
                            self.p = clause.0;
                            true
                        }
                        Err(ResourceError::Interrupted) => return self.exhausted(),
                        Err(e) => return Err(e.into()),
                    }
                }
                Instr::Retry { clause } => {
                    let next = self.p;
                    self.choices.last_mut().expect("retry without a choicepoint").next = next;
                    self.p = clause.0;
                    true
                }
                Instr::Trust { clause } => {
                    self.choices.pop().expect("trust without a choicepoint");
                    self.p = clause.0;
                    true
                }
                Instr::NeckCut => {
                    self.cut_to(self.b0);
                    true
                }
                Instr::GetLevel { slot } => {
                    self.write_slot(slot, Cell::Lvl(self.b0));
                    true
                }
                Instr::Cut { slot } => {
                    let Cell::Lvl(barrier) = self.read_slot(slot) else {
                        panic!("cut slot does not hold a barrier");
                    };
                    self.cut_to(barrier);
                    true
                }
                Instr::SwitchOnTerm { var, con, lis, struc } => {
                    let target = match self.deref(self.regs[1]) {
                        Cell::Ref(_) => var,
                        Cell::Con(_) | Cell::Int(_) => con,
                        Cell::Lis(_) => lis,
                        Cell::Str(s) => {
                            let f = self.functor_of_struct(s);
                            if f == WellKnown::Cons.functor_id() {
                                lis
                            } else if interns.functor_arity(f) == 0 {
                                // Unoptimized code builds atoms as arity-0
                                // structures; they dispatch as constants.
                                con
                            } else {
                                struc
                            }
                        }
                        cell => panic!("first argument dereferenced to {cell:?}"),
                    };
                    self.p = target.0;
                    true
                }
                Instr::SwitchOnConst { table } => {
                    let key = match self.deref(self.regs[1]) {
                        Cell::Con(c) => Some(c),
                        Cell::Str(s) => Some(self.functor_of_struct(s)),
                        _ => None,
                    };
                    match key.and_then(|k| table.iter().find(|(c, _)| *c == k)) {
                        Some((_, target)) => {
                            self.p = target.0;
                            true
                        }
                        None => false,
                    }
                }
                Instr::SwitchOnStruc { table } => {
                    let key = match self.deref(self.regs[1]) {
                        Cell::Str(s) => Some(self.functor_of_struct(s)),
                        _ => None,
                    };
                    match key.and_then(|k| table.iter().find(|(f, _)| *f == k)) {
                        Some((_, target)) => {
                            self.p = target.0;
                            true
                        }
                        None => false,
                    }
                }
            };

            if !ok && !self.backtrack()? {
                return self.exhausted();
            }
        }
    }

    // ------------------------------------------------------------------
    // Data-area access
    // ------------------------------------------------------------------

    fn push_cell(&mut self, cell: Cell) -> MachineResult<Addr> {
        self.tracker.on_heap_grow(self.heap.len() + 1)?;
        let addr = self.heap.push(cell);
        self.stats.heap_high_water = self.stats.heap_high_water.max(self.heap.len());
        Ok(addr)
    }

    fn push_unbound(&mut self) -> MachineResult<Addr> {
        self.tracker.on_heap_grow(self.heap.len() + 1)?;
        let addr = self.heap.push_unbound();
        self.stats.heap_high_water = self.stats.heap_high_water.max(self.heap.len());
        Ok(addr)
    }

    fn read_place(&self, place: Place) -> Cell {
        match place {
            Place::Temp(RegId(r)) => self.regs[r as usize],
            Place::Perm(slot) => self.read_slot(slot),
        }
    }

    fn write_place(&mut self, place: Place, cell: Cell) {
        match place {
            Place::Temp(RegId(r)) => self.regs[r as usize] = cell,
            Place::Perm(slot) => self.write_slot(slot, cell),
        }
    }

    fn read_slot(&self, slot: SlotId) -> Cell {
        let ei = self.e.expect("permanent variable access without an environment") as usize;
        self.envs[ei].slots[slot.0 as usize - 1]
    }

    fn write_slot(&mut self, slot: SlotId, cell: Cell) {
        let ei = self.e.expect("permanent variable access without an environment") as usize;
        self.envs[ei].slots[slot.0 as usize - 1] = cell;
    }

    fn trim_env(&mut self, live: u8) {
        if let Some(ei) = self.e {
            let ei = ei as usize;
            let protected = self.choices.last().is_some_and(|c| c.env_len as usize > ei);
            if !protected && self.envs[ei].slots.len() > live as usize {
                self.envs[ei].slots.truncate(live as usize);
            }
        }
    }

    fn functor_of_struct(&self, header: Addr) -> crate::intern::FunctorId {
        match self.heap.get(header) {
            Cell::Fun(f) => f,
            cell => panic!("structure pointer does not address a functor header: {cell:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Dereference, bind, trail, unify
    // ------------------------------------------------------------------

    /// Follows REF chains to the representative cell: a non-REF, or a
    /// self-referential REF for an unbound variable.
    fn deref(&self, mut cell: Cell) -> Cell {
        while let Cell::Ref(addr) = cell {
            let next = self.heap.get(addr);
            if next == cell {
                return cell;
            }
            cell = next;
        }
        cell
    }

    /// Binds the unbound variable at `addr`, trailing conditionally: only
    /// addresses older than the current choicepoint's saved heap top need an
    /// undo entry, younger ones vanish when the heap retreats.
    fn bind(&mut self, addr: Addr, cell: Cell) {
        self.heap.set(addr, cell);
        let hb = self.choices.last().map(|c| c.h);
        if self.force_trail || hb.is_some_and(|hb| addr < hb) {
            self.trail.push(addr);
            self.stats.trail_high_water = self.stats.trail_high_water.max(self.trail.len());
        }
    }

    /// Unifies two cells without occurs check, binding unbound variables so
    /// the younger points at the older.
    fn unify(&mut self, a: Cell, b: Cell, interns: &Interns) -> bool {
        let mut work: SmallVec<[(Cell, Cell); 16]> = smallvec![(a, b)];
        while let Some((a, b)) = work.pop() {
            let a = self.deref(a);
            let b = self.deref(b);
            if a == b {
                continue;
            }
            match (a, b) {
                (Cell::Ref(x), Cell::Ref(y)) => {
                    if x < y {
                        self.bind(y, Cell::Ref(x));
                    } else {
                        self.bind(x, Cell::Ref(y));
                    }
                }
                (Cell::Ref(x), other) => self.bind(x, other),
                (other, Cell::Ref(y)) => self.bind(y, other),
                (Cell::Con(c1), Cell::Con(c2)) => {
                    if c1 != c2 {
                        return false;
                    }
                }
                (Cell::Int(_), Cell::Int(_)) => return false, // equal ints matched above
                (Cell::Lis(l1), Cell::Lis(l2)) => {
                    work.push((self.heap.get(l1), self.heap.get(l2)));
                    work.push((self.heap.get(l1 + 1), self.heap.get(l2 + 1)));
                }
                (Cell::Str(s1), Cell::Str(s2)) => {
                    let f1 = self.functor_of_struct(s1);
                    let f2 = self.functor_of_struct(s2);
                    if f1 != f2 {
                        return false;
                    }
                    for k in 1..=interns.functor_arity(f1) {
                        work.push((self.heap.get(s1 + k), self.heap.get(s2 + k)));
                    }
                }
                // An arity-0 structure and the same constant denote the same
                // atom; unoptimized code builds the former, optimized code
                // the latter.
                (Cell::Con(c), Cell::Str(s)) | (Cell::Str(s), Cell::Con(c)) => {
                    if self.functor_of_struct(s) != c {
                        return false;
                    }
                }
                // Same for cons/2 structures versus list cells.
                (Cell::Lis(l), Cell::Str(s)) | (Cell::Str(s), Cell::Lis(l)) => {
                    if self.functor_of_struct(s) != WellKnown::Cons.functor_id() {
                        return false;
                    }
                    work.push((self.heap.get(l), self.heap.get(s + 1)));
                    work.push((self.heap.get(l + 1), self.heap.get(s + 2)));
                }
                _ => return false,
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Control: structures, choicepoints, backtracking, cut
    // ------------------------------------------------------------------

    fn get_struc(&mut self, f: crate::intern::FunctorId, arg: RegId) -> MachineResult<bool> {
        match self.deref(self.regs[arg.0 as usize]) {
            Cell::Ref(addr) => {
                let header = self.push_cell(Cell::Fun(f))?;
                self.bind(addr, Cell::Str(header));
                self.mode = Mode::Write;
                Ok(true)
            }
            Cell::Str(s) => {
                if self.functor_of_struct(s) == f {
                    self.s = s + 1;
                    self.mode = Mode::Read;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Cell::Con(c) => Ok(c == f),
            Cell::Lis(l) => {
                if f == WellKnown::Cons.functor_id() {
                    self.s = l;
                    self.mode = Mode::Read;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => Ok(false),
        }
    }

    fn get_list(&mut self, arg: RegId) -> MachineResult<bool> {
        match self.deref(self.regs[arg.0 as usize]) {
            Cell::Ref(addr) => {
                let head = self.heap.top();
                self.bind(addr, Cell::Lis(head));
                self.mode = Mode::Write;
                Ok(true)
            }
            Cell::Lis(l) => {
                self.s = l;
                self.mode = Mode::Read;
                Ok(true)
            }
            Cell::Str(s) => {
                if self.functor_of_struct(s) == WellKnown::Cons.functor_id() {
                    self.s = s + 1;
                    self.mode = Mode::Read;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => Ok(false),
        }
    }

    fn push_choicepoint(&mut self, next: u32) -> Result<(), ResourceError> {
        self.tracker.on_choicepoint(self.choices.len() + 1)?;
        let mut args: SmallVec<[Cell; 4]> = SmallVec::with_capacity(self.num_args as usize);
        args.extend_from_slice(&self.regs[1..=self.num_args as usize]);
        self.choices.push(ChoiceFrame {
            args,
            e: self.e,
            env_len: self.envs.len() as u32,
            cp: self.cp,
            next,
            tr: self.trail.len() as u32,
            h: self.heap.top(),
            b0: self.b0,
        });
        self.stats.choice_high_water = self.stats.choice_high_water.max(self.choices.len());
        Ok(())
    }

    /// Restores the youngest choicepoint and jumps to its next alternative.
    /// Returns `false` when no choicepoint remains (or the stop flag was
    /// raised), meaning the resolution is exhausted.
    fn backtrack(&mut self) -> Result<bool, SolveError> {
        self.stats.backtracks += 1;
        self.tracer.on_backtrack(&snap!(self));
        match self.tracker.on_backtrack() {
            Err(ResourceError::Interrupted) => return Ok(false),
            Err(e) => return Err(e.into()),
            Ok(()) => {}
        }
        let Some(top) = self.choices.last().cloned() else {
            return Ok(false);
        };
        self.e = top.e;
        self.cp = top.cp;
        self.b0 = top.b0;
        self.num_args = top.args.len() as u8;
        for (i, &cell) in top.args.iter().enumerate() {
            self.regs[i + 1] = cell;
        }
        self.envs.truncate(top.env_len as usize);
        self.unwind_trail(top.tr as usize);
        self.heap.truncate(top.h);
        self.p = top.next;
        Ok(true)
    }

    fn unwind_trail(&mut self, mark: usize) {
        while self.trail.len() > mark {
            let addr = self.trail.pop().expect("trail entry above mark");
            self.heap.set(addr, Cell::Ref(addr));
        }
    }

    fn cut_to(&mut self, barrier: u32) {
        if (barrier as usize) < self.choices.len() {
            self.choices.truncate(barrier as usize);
        }
    }

    // ------------------------------------------------------------------
    // Built-ins
    // ------------------------------------------------------------------

    fn run_builtin(&mut self, builtin: Builtin, interns: &mut Interns) -> MachineResult<bool> {
        match builtin {
            Builtin::True => Ok(true),
            Builtin::Fail => Ok(false),
            Builtin::Unify => {
                let (a, b) = (self.regs[1], self.regs[2]);
                Ok(self.unify(a, b, interns))
            }
            Builtin::NotUnify => {
                let (a, b) = (self.regs[1], self.regs[2]);
                let mark = self.trail.len();
                self.force_trail = true;
                let unifiable = self.unify(a, b, interns);
                self.force_trail = false;
                self.unwind_trail(mark);
                Ok(!unifiable)
            }
            Builtin::Lt | Builtin::Gt | Builtin::Le | Builtin::Ge | Builtin::ArithEq | Builtin::ArithNe => {
                let x = self.eval_arith(self.regs[1], interns)?;
                let y = self.eval_arith(self.regs[2], interns)?;
                Ok(compare(builtin, x, y))
            }
            Builtin::Is => {
                let value = self.eval_arith(self.regs[2], interns)?;
                let cell = match value {
                    Num::Int(n) => Cell::Int(n),
                    Num::Float(v) => Cell::Con(interns.intern_float(v)),
                };
                let lhs = self.regs[1];
                Ok(self.unify(lhs, cell, interns))
            }
        }
    }

    fn eval_arith(&self, cell: Cell, interns: &Interns) -> MachineResult<Num> {
        match self.deref(cell) {
            Cell::Int(n) => Ok(Num::Int(n)),
            Cell::Ref(_) => Err(SolveError::Instantiation),
            Cell::Con(c) => match interns.functor_of(c).0 {
                FunctorName::Float(bits) => Ok(Num::Float(f64::from_bits(*bits))),
                name => Err(SolveError::ArithmeticType {
                    culprit: name.to_string(),
                }),
            },
            Cell::Str(s) => {
                let f = self.functor_of_struct(s);
                let Some(op) = ArithOp::from_functor(f) else {
                    return Err(SolveError::ArithmeticType {
                        culprit: interns.format_functor(f),
                    });
                };
                if op == ArithOp::Neg {
                    let x = self.eval_arith(self.heap.get(s + 1), interns)?;
                    return match x {
                        Num::Int(n) => n.checked_neg().map(Num::Int).ok_or(SolveError::IntOverflow),
                        Num::Float(v) => Ok(Num::Float(-v)),
                    };
                }
                let x = self.eval_arith(self.heap.get(s + 1), interns)?;
                let y = self.eval_arith(self.heap.get(s + 2), interns)?;
                apply(op, x, y)
            }
            Cell::Lis(_) => Err(SolveError::ArithmeticType {
                culprit: "a list".to_owned(),
            }),
            cell => panic!("evaluable position dereferenced to {cell:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Binding reification
    // ------------------------------------------------------------------

    fn reify_bindings(&self, interns: &mut Interns) -> Bindings {
        let mut bindings = Bindings::new();
        for &(var, addr) in &self.query_vars {
            let name = interns.variable_of(var).to_owned();
            let mut path = AHashSet::new();
            let term = self.reify(Cell::Ref(addr), interns, &mut path);
            bindings.insert(name, term);
        }
        bindings
    }

    /// Materializes a heap value as a term. `path` holds the structure
    /// addresses on the current descent so reference cycles (rational trees,
    /// possible without the occurs check) render as variables instead of
    /// looping.
    fn reify(&self, cell: Cell, interns: &mut Interns, path: &mut AHashSet<Addr>) -> Term {
        match self.deref(cell) {
            Cell::Ref(addr) => Term::Var(interns.intern_variable(&format!("_G{addr}"))),
            Cell::Int(n) => Term::Int(n),
            Cell::Con(c) => constant_term(c, interns),
            Cell::Lis(l) => {
                if !path.insert(l) {
                    return Term::Var(interns.intern_variable(&format!("_G{l}")));
                }
                let head = self.reify(self.heap.get(l), interns, path);
                let tail = self.reify(self.heap.get(l + 1), interns, path);
                path.remove(&l);
                Term::Struct {
                    functor: WellKnown::Cons.into(),
                    args: vec![head, tail],
                }
            }
            Cell::Str(s) => {
                if !path.insert(s) {
                    return Term::Var(interns.intern_variable(&format!("_G{s}")));
                }
                let f = self.functor_of_struct(s);
                let arity = interns.functor_arity(f);
                let args = (1..=arity).map(|k| self.reify(self.heap.get(s + k), interns, path)).collect();
                path.remove(&s);
                Term::Struct { functor: f, args }
            }
            cell => panic!("reified a control cell: {cell:?}"),
        }
    }
}

/// A number produced by the arithmetic evaluator.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Self::Int(n) => n as f64,
            Self::Float(v) => v,
        }
    }
}

fn apply(op: ArithOp, x: Num, y: Num) -> MachineResult<Num> {
    use std::ops::{Add, Mul, Sub};

    match op {
        ArithOp::Add => arith2(x, y, i64::checked_add, f64::add),
        ArithOp::Sub => arith2(x, y, i64::checked_sub, f64::sub),
        ArithOp::Mul => arith2(x, y, i64::checked_mul, f64::mul),
        ArithOp::IntDiv => int2(x, y, i64::checked_div),
        ArithOp::Mod => int2(x, y, i64::checked_rem_euclid),
        ArithOp::Neg => unreachable!("negation is unary"),
    }
}

fn arith2(
    x: Num,
    y: Num,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> MachineResult<Num> {
    match (x, y) {
        (Num::Int(a), Num::Int(b)) => int_op(a, b).map(Num::Int).ok_or(SolveError::IntOverflow),
        _ => Ok(Num::Float(float_op(x.as_f64(), y.as_f64()))),
    }
}

/// Integer-only operators (`//` and `mod`).
fn int2(x: Num, y: Num, int_op: impl Fn(i64, i64) -> Option<i64>) -> MachineResult<Num> {
    match (x, y) {
        (Num::Int(_), Num::Int(0)) => Err(SolveError::DivisionByZero),
        (Num::Int(a), Num::Int(b)) => int_op(a, b).map(Num::Int).ok_or(SolveError::IntOverflow),
        _ => Err(SolveError::ArithmeticType {
            culprit: "a float in integer division".to_owned(),
        }),
    }
}

fn compare(builtin: Builtin, x: Num, y: Num) -> bool {
    if let (Num::Int(a), Num::Int(b)) = (x, y) {
        return match builtin {
            Builtin::Lt => a < b,
            Builtin::Gt => a > b,
            Builtin::Le => a <= b,
            Builtin::Ge => a >= b,
            Builtin::ArithEq => a == b,
            Builtin::ArithNe => a != b,
            _ => unreachable!("not a comparison"),
        };
    }
    let (a, b) = (x.as_f64(), y.as_f64());
    match builtin {
        Builtin::Lt => a < b,
        Builtin::Gt => a > b,
        Builtin::Le => a <= b,
        Builtin::Ge => a >= b,
        Builtin::ArithEq => a == b,
        Builtin::ArithNe => a != b,
        _ => unreachable!("not a comparison"),
    }
}

fn constant_term(c: crate::intern::FunctorId, interns: &Interns) -> Term {
    match interns.functor_of(c).0 {
        FunctorName::Atom(_) => Term::atom(c),
        FunctorName::Float(bits) => Term::Float(f64::from_bits(*bits)),
        FunctorName::Str(s) => Term::Str(s.clone()),
    }
}
