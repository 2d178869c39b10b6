//! The clause-tree model delivered by front-ends.
//!
//! Parsers hand the compiler fully interned terms: variables and compound
//! terms carry ids from [`Interns`](crate::intern::Interns), while numeric and
//! string literals stay inline until the compiler interns them as constants.
//! Terms are immutable; the compiler attaches its analysis through the scoped
//! symbol table instead of mutating the tree, and the tree is discarded once
//! its clause has been compiled.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    error::Span,
    intern::{FunctorId, Interns, VarId, WellKnown},
};

/// A first-order term.
///
/// Atoms are `Struct` nodes with an empty argument vector; lists are ordinary
/// `cons/2` structures terminated by the `nil` atom, built for convenience by
/// [`Interns::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// An interned variable.
    Var(VarId),
    /// A compound term (or atom, when `args` is empty). The functor's interned
    /// arity must equal `args.len()`.
    Struct {
        functor: FunctorId,
        args: Vec<Term>,
    },
    /// An immediate integer literal.
    Int(i64),
    /// A float literal; interned as an arity-0 constant at compile time.
    Float(f64),
    /// A string literal; interned as an arity-0 constant at compile time.
    Str(Box<str>),
}

/// The order in which a traversal visits a node relative to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    Pre,
    Post,
}

/// Positional context handed to traversal visitors: the path of argument
/// indices from the traversal root down to the current node.
pub type TermPath = Vec<u16>;

impl Term {
    /// Convenience constructor for a compound term.
    #[must_use]
    pub fn app(functor: FunctorId, args: Vec<Self>) -> Self {
        Self::Struct { functor, args }
    }

    /// Convenience constructor for an atom.
    #[must_use]
    pub fn atom(functor: FunctorId) -> Self {
        Self::Struct {
            functor,
            args: Vec::new(),
        }
    }

    /// Returns the functor and arity of a callable term (an atom or compound).
    #[must_use]
    pub fn functor(&self) -> Option<(FunctorId, u32)> {
        match self {
            Self::Struct { functor, args } => Some((*functor, args.len() as u32)),
            _ => None,
        }
    }

    /// True for atoms (arity-0 structures).
    #[must_use]
    pub fn is_atom(&self) -> bool {
        matches!(self, Self::Struct { args, .. } if args.is_empty())
    }

    /// Walks the term, invoking `visit` once before and once after each
    /// node's children, with the node's positional path from the root.
    pub fn walk(&self, visit: &mut impl FnMut(&Self, &TermPath, VisitOrder)) {
        let mut path = TermPath::new();
        self.walk_inner(&mut path, visit);
    }

    fn walk_inner(&self, path: &mut TermPath, visit: &mut impl FnMut(&Self, &TermPath, VisitOrder)) {
        visit(self, path, VisitOrder::Pre);
        if let Self::Struct { args, .. } = self {
            for (i, arg) in args.iter().enumerate() {
                path.push(i as u16);
                arg.walk_inner(path, visit);
                path.pop();
            }
        }
        visit(self, path, VisitOrder::Post);
    }

    /// Renders the term through the interner, detecting `cons`/`nil` chains
    /// and printing them in list notation.
    #[must_use]
    pub fn display<'a>(&'a self, interns: &'a Interns) -> TermDisplay<'a> {
        TermDisplay { term: self, interns }
    }
}

/// A clause `head :- body`, with an empty body for facts.
///
/// Queries are represented as a bare goal list; see
/// [`Session::compile_query`](crate::session::Session::compile_query).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    pub head: Term,
    pub body: Vec<Term>,
    /// Source position supplied by the front-end, carried into diagnostics.
    pub span: Option<Span>,
}

impl Clause {
    /// A clause with no source position.
    #[must_use]
    pub fn new(head: Term, body: Vec<Term>) -> Self {
        Self { head, body, span: None }
    }

    /// A fact (empty body).
    #[must_use]
    pub fn fact(head: Term) -> Self {
        Self::new(head, Vec::new())
    }
}

/// Term-building conveniences for front-ends and tests.
impl Interns {
    /// Interns `name/args.len()` and builds the compound term.
    pub fn app(&mut self, name: &str, args: Vec<Term>) -> Term {
        let functor = self.intern_functor(name, args.len() as u32);
        Term::Struct { functor, args }
    }

    /// Interns `name/0` and builds the atom.
    pub fn atom(&mut self, name: &str) -> Term {
        self.app(name, Vec::new())
    }

    /// Interns a variable name and builds the variable term. The name `_`
    /// produces a fresh anonymous variable on every call.
    pub fn var(&mut self, name: &str) -> Term {
        let id = if name == "_" {
            self.fresh_variable()
        } else {
            self.intern_variable(name)
        };
        Term::Var(id)
    }

    /// Builds a `cons`/`nil` list from `items`, with an optional explicit
    /// tail.
    pub fn list(&mut self, items: Vec<Term>, tail: Option<Term>) -> Term {
        let mut term = tail.unwrap_or_else(|| Term::atom(WellKnown::Nil.into()));
        for item in items.into_iter().rev() {
            term = Term::Struct {
                functor: WellKnown::Cons.into(),
                args: vec![item, term],
            };
        }
        term
    }
}

/// Borrowing display adapter produced by [`Term::display`].
pub struct TermDisplay<'a> {
    term: &'a Term,
    interns: &'a Interns,
}

impl fmt::Display for TermDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_term(self.term, self.interns, f)
    }
}

fn fmt_term(term: &Term, interns: &Interns, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match term {
        Term::Var(id) => write!(f, "{name}", name = interns.variable_of(*id)),
        Term::Int(n) => write!(f, "{n}"),
        Term::Float(v) => {
            let mut buf = ryu::Buffer::new();
            write!(f, "{v}", v = buf.format(*v))
        }
        Term::Str(s) => write!(f, "\"{s}\""),
        Term::Struct { functor, args } => {
            if *functor == WellKnown::Cons.functor_id() && args.len() == 2 {
                return fmt_list(term, interns, f);
            }
            let (name, _) = interns.functor_of(*functor);
            write!(f, "{name}")?;
            if !args.is_empty() {
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_term(arg, interns, f)?;
                }
                write!(f, ")")?;
            }
            Ok(())
        }
    }
}

/// Renders a `cons` chain as `[a, b | Tail]`, falling back to a plain `]`
/// when the chain ends in `nil`.
fn fmt_list(term: &Term, interns: &Interns, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    let mut current = term;
    let mut first = true;
    loop {
        match current {
            Term::Struct { functor, args } if *functor == WellKnown::Cons.functor_id() && args.len() == 2 => {
                if !first {
                    write!(f, ", ")?;
                }
                first = false;
                fmt_term(&args[0], interns, f)?;
                current = &args[1];
            }
            Term::Struct { functor, args } if *functor == WellKnown::Nil.functor_id() && args.is_empty() => break,
            other => {
                write!(f, " | ")?;
                fmt_term(other, interns, f)?;
                break;
            }
        }
    }
    write!(f, "]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_reports_positional_paths() {
        let mut interns = Interns::new();
        let x = interns.var("X");
        let inner = interns.app("g", vec![x]);
        let a = interns.atom("a");
        let term = interns.app("f", vec![a, inner]);

        let mut pre_paths = Vec::new();
        term.walk(&mut |_, path, order| {
            if order == VisitOrder::Pre {
                pre_paths.push(path.clone());
            }
        });
        assert_eq!(pre_paths, vec![vec![], vec![0], vec![1], vec![1, 0]]);
    }

    #[test]
    fn list_builder_and_display_round_trip() {
        let mut interns = Interns::new();
        let items = vec![Term::Int(1), Term::Int(2)];
        let list = interns.list(items, None);
        assert_eq!(list.display(&interns).to_string(), "[1, 2]");

        let tail = interns.var("T");
        let partial = interns.list(vec![Term::Int(1)], Some(tail));
        assert_eq!(partial.display(&interns).to_string(), "[1 | T]");
    }

    #[test]
    fn anonymous_variables_are_fresh() {
        let mut interns = Interns::new();
        let a = interns.var("_");
        let b = interns.var("_");
        assert_ne!(a, b);
    }
}
