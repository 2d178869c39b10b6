//! Name interning for functors and variables.
//!
//! The interner maps between source strings and stable integer ids in two
//! disjoint namespaces: functors (a *name + arity* pair, so `foo/1` and
//! `foo/2` get distinct ids) and variables. Ids are handed out by the
//! front-end during parsing and stay stable for the lifetime of the session;
//! the compiler, the optimizer and the resolver all traffic exclusively in
//! ids, and lookups back to strings are needed only for diagnostics,
//! disassembly and binding output.
//!
//! Float and string literals are interned into the functor table as arity-0
//! constants with their own name kind, so a CON cell covers atoms, floats and
//! strings uniformly while `1.5` and the atom `'1.5'` remain distinct.
//!
//! Functor ids are laid out as follows:
//! * 0 to count(WellKnown) - the well-known functors, at their discriminants
//! * count(WellKnown).. - functors interned per session

use std::fmt;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, FromRepr, IntoEnumIterator};

/// Index into the functor interner's storage.
///
/// Uses `u32` to save space (4 bytes in a byte-code operand). This limits us
/// to ~4 billion unique functors, which is more than sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctorId(u32);

impl FunctorId {
    /// Creates a FunctorId from a raw index value.
    ///
    /// Used by the byte-code decoder to reconstruct ids from operands. The
    /// caller is responsible for ensuring the index is valid.
    #[inline]
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Index into the variable interner's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarId(u32);

impl VarId {
    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// The name half of a functor table entry.
///
/// Atoms, float literals and string literals all live in the functor table as
/// arity-0 constants, distinguished by this kind so unification by id never
/// conflates `nil`, `"nil"` and a float that happens to render the same way.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunctorName {
    /// A plain atom or compound-term name.
    Atom(Box<str>),
    /// A float literal, stored as raw bits so the table key is hashable.
    Float(u64),
    /// A string literal.
    Str(Box<str>),
}

impl FunctorName {
    /// Returns the float value for `Float` entries.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(bits) => Some(f64::from_bits(*bits)),
            Self::Atom(_) | Self::Str(_) => None,
        }
    }
}

impl fmt::Display for FunctorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Atom(name) => write!(f, "{name}"),
            Self::Float(bits) => {
                let mut buf = ryu::Buffer::new();
                write!(f, "{v}", v = buf.format(f64::from_bits(*bits)))
            }
            Self::Str(s) => write!(f, "\"{s}\""),
        }
    }
}

/// Functors known at compile time, pre-interned at fixed ids equal to their
/// discriminants.
///
/// Covers the list constructors the compiler specializes on and the built-in
/// predicates the call-point resolver answers without a code address.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, EnumCount, EnumIter)]
pub enum WellKnown {
    /// `nil/0`, the empty list.
    Nil,
    /// `cons/2`, the list constructor.
    Cons,
    /// `true/0`.
    True,
    /// `fail/0`.
    Fail,
    /// `!/0`; compiled inline to cut instructions, never called.
    Cut,
    /// `=/2`, unification.
    Unify,
    /// `\=/2`, non-unifiability.
    NotUnify,
    /// `</2`.
    Lt,
    /// `>/2`.
    Gt,
    /// `=</2`.
    Le,
    /// `>=/2`.
    Ge,
    /// `=:=/2`, arithmetic equality.
    ArithEq,
    /// `=\=/2`, arithmetic inequality.
    ArithNe,
    /// `is/2`, arithmetic evaluation.
    Is,
    /// `+/2`, evaluable only.
    Add,
    /// `-/2`, evaluable only.
    Sub,
    /// `*/2`, evaluable only.
    Mul,
    /// `///2` (integer division), evaluable only.
    IntDiv,
    /// `mod/2`, evaluable only.
    Mod,
    /// `-/1` (arithmetic negation), evaluable only.
    Neg,
}

impl WellKnown {
    /// The source spelling of this functor.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Cons => "cons",
            Self::True => "true",
            Self::Fail => "fail",
            Self::Cut => "!",
            Self::Unify => "=",
            Self::NotUnify => "\\=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "=<",
            Self::Ge => ">=",
            Self::ArithEq => "=:=",
            Self::ArithNe => "=\\=",
            Self::Is => "is",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::IntDiv => "//",
            Self::Mod => "mod",
            Self::Neg => "-",
        }
    }

    /// The arity this functor is interned with.
    #[must_use]
    pub fn arity(self) -> u32 {
        match self {
            Self::Nil | Self::True | Self::Fail | Self::Cut => 0,
            Self::Neg => 1,
            _ => 2,
        }
    }

    /// The fixed functor id of this entry.
    #[inline]
    #[must_use]
    pub fn functor_id(self) -> FunctorId {
        FunctorId(self as u32)
    }
}

impl From<WellKnown> for FunctorId {
    fn from(wk: WellKnown) -> Self {
        wk.functor_id()
    }
}

/// Bidirectional interner for functor and variable names.
///
/// Owned by the session and shared by reference between the compiler and the
/// resolver. Within one session it is accessed from a single thread; callers
/// that want to share an interner across threads must add their own lock
/// around the `intern_*` operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interns {
    functors: Vec<(FunctorName, u32)>,
    functor_map: AHashMap<(FunctorName, u32), FunctorId>,
    variables: Vec<Box<str>>,
    variable_map: AHashMap<Box<str>, VarId>,
    fresh_counter: u32,
}

impl Default for Interns {
    fn default() -> Self {
        let mut interns = Self {
            functors: Vec::new(),
            functor_map: AHashMap::new(),
            variables: Vec::new(),
            variable_map: AHashMap::new(),
            fresh_counter: 0,
        };
        for wk in WellKnown::iter() {
            let id = interns.intern_functor(wk.name(), wk.arity());
            debug_assert_eq!(id, wk.functor_id(), "well-known functor id drifted from its discriminant");
        }
        interns
    }
}

impl Interns {
    /// Creates an interner with the well-known functors pre-interned.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a functor, returning its id.
    ///
    /// Distinct arities produce distinct ids even for the same name, so
    /// `-/2` (subtraction) and `-/1` (negation) never collide.
    pub fn intern_functor(&mut self, name: &str, arity: u32) -> FunctorId {
        self.intern_entry(FunctorName::Atom(name.into()), arity)
    }

    /// Interns a float literal as an arity-0 constant.
    pub fn intern_float(&mut self, value: f64) -> FunctorId {
        self.intern_entry(FunctorName::Float(value.to_bits()), 0)
    }

    /// Interns a string literal as an arity-0 constant.
    pub fn intern_string(&mut self, value: &str) -> FunctorId {
        self.intern_entry(FunctorName::Str(value.into()), 0)
    }

    fn intern_entry(&mut self, name: FunctorName, arity: u32) -> FunctorId {
        if let Some(&id) = self.functor_map.get(&(name.clone(), arity)) {
            return id;
        }
        let id = FunctorId(self.functors.len().try_into().expect("FunctorId overflow"));
        self.functors.push((name.clone(), arity));
        self.functor_map.insert((name, arity), id);
        id
    }

    /// Interns a variable name, returning its id.
    ///
    /// Every occurrence of the same spelling within a session maps to the
    /// same id; front-ends are responsible for renaming variables apart
    /// between clauses if they want clause-local scoping (the compiler keys
    /// its per-clause analysis by clause scope, so reuse across clauses is
    /// harmless).
    pub fn intern_variable(&mut self, name: &str) -> VarId {
        if let Some(&id) = self.variable_map.get(name) {
            return id;
        }
        let id = VarId(self.variables.len().try_into().expect("VarId overflow"));
        self.variables.push(name.into());
        self.variable_map.insert(name.into(), id);
        id
    }

    /// Creates a fresh variable with a generated name.
    ///
    /// Used for anonymous `_` occurrences (each of which must be a distinct
    /// variable) and for naming unbound cells when bindings are reified.
    pub fn fresh_variable(&mut self) -> VarId {
        loop {
            self.fresh_counter += 1;
            let name = format!("_G{n}", n = self.fresh_counter);
            if !self.variable_map.contains_key(name.as_str()) {
                return self.intern_variable(&name);
            }
        }
    }

    /// Looks up a functor by id, returning its name and arity.
    ///
    /// # Panics
    /// Panics if the id was not produced by this interner.
    #[must_use]
    pub fn functor_of(&self, id: FunctorId) -> (&FunctorName, u32) {
        let (name, arity) = &self.functors[id.0 as usize];
        (name, *arity)
    }

    /// Returns the arity a functor was interned with.
    #[must_use]
    pub fn functor_arity(&self, id: FunctorId) -> u32 {
        self.functors[id.0 as usize].1
    }

    /// Looks up a variable name by id.
    ///
    /// # Panics
    /// Panics if the id was not produced by this interner.
    #[must_use]
    pub fn variable_of(&self, id: VarId) -> &str {
        &self.variables[id.0 as usize]
    }

    /// Renders a functor as `name/arity` for diagnostics and disassembly.
    #[must_use]
    pub fn format_functor(&self, id: FunctorId) -> String {
        let (name, arity) = self.functor_of(id);
        format!("{name}/{arity}")
    }

    /// Number of functors interned so far, including the well-known block.
    #[must_use]
    pub fn functor_count(&self) -> usize {
        self.functors.len()
    }
}
