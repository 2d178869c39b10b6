//! Nested, scoped symbol table.
//!
//! Every term node is assigned a symbol key by a pre-pass over the clause so
//! the compiler can attach analysis results (occurrence counts, register
//! assignments, permanence flags) without mutating the term tree. The table
//! is a tree of scopes realized as an arena: a [`SymbolKey`] is an opaque
//! handle that subsumes its whole scope chain, so field access is a single
//! hash lookup keyed by `(key, field)`.
//!
//! Scope layout used by the compiler (one level per path segment):
//!
//! ```text
//! root / Pred(p/2) / Clause(0) / Goal(0) / Arg(1) ...   positional nodes
//! root / Pred(p/2) / Clause(0) / Free / Var(X)          shared per-variable keys
//! ```

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::intern::{FunctorId, VarId};

/// Opaque handle to a scope-chain position in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolKey(u32);

impl SymbolKey {
    /// The root scope, present in every table.
    pub const ROOT: Self = Self(0);
}

/// One step of a scope path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScopeKey {
    /// A predicate scope under the root.
    Pred(FunctorId),
    /// A clause scope under its predicate, by clause index.
    Clause(u32),
    /// A goal scope under its clause; the head is goal 0.
    Goal(u32),
    /// A positional argument step under a goal or a compound term.
    Arg(u16),
    /// The shared free-variable sub-scope of a clause.
    Free,
    /// A variable key under the free-variable sub-scope.
    Var(VarId),
}

/// Analysis fields attachable to a symbol key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    /// Number of occurrences of a variable in its clause.
    OccurrenceCount,
    /// True iff every occurrence of a variable lies strictly inside a
    /// compound subterm.
    NonArgOnly,
    /// Goal index of a variable's first occurrence (head = 0).
    FirstGoal,
    /// Goal index of a variable's last occurrence.
    LastGoal,
    /// True iff a variable lives in the environment frame.
    Permanent,
    /// Temporary register assigned to a variable.
    Register,
    /// Permanent-variable slot assigned to a variable.
    Slot,
    /// Number of clauses accumulated for a predicate.
    ClauseCount,
}

/// Value stored under a `(key, field)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    Count(u32),
    Flag(bool),
    Goal(u32),
    Reg(u8),
    SlotIndex(u8),
}

impl FieldValue {
    /// Reads a `Count` value; panics on a field-kind mismatch, which is a
    /// compiler bug.
    #[must_use]
    pub fn count(self) -> u32 {
        match self {
            Self::Count(n) => n,
            other => panic!("expected Count field, got {other:?}"),
        }
    }

    /// Reads a `Flag` value.
    #[must_use]
    pub fn flag(self) -> bool {
        match self {
            Self::Flag(b) => b,
            other => panic!("expected Flag field, got {other:?}"),
        }
    }

    /// Reads a `Goal` value.
    #[must_use]
    pub fn goal(self) -> u32 {
        match self {
            Self::Goal(g) => g,
            other => panic!("expected Goal field, got {other:?}"),
        }
    }
}

/// The scoped key/field store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTable {
    /// Number of keys handed out; key 0 is the root.
    key_count: u32,
    children: AHashMap<(SymbolKey, ScopeKey), SymbolKey>,
    fields: AHashMap<(SymbolKey, Field), FieldValue>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            key_count: 1,
            children: AHashMap::new(),
            fields: AHashMap::new(),
        }
    }

    /// Returns the child scope of `parent` under `key`, creating it on first
    /// use. Child keys never collide across distinct parents.
    pub fn enter_scope(&mut self, parent: SymbolKey, key: ScopeKey) -> SymbolKey {
        if let Some(&existing) = self.children.get(&(parent, key)) {
            return existing;
        }
        let child = SymbolKey(self.key_count);
        self.key_count += 1;
        self.children.insert((parent, key), child);
        child
    }

    /// Resolves a whole scope path from the root in one call.
    pub fn symbol_key_for(&mut self, path: &[ScopeKey]) -> SymbolKey {
        let mut current = SymbolKey::ROOT;
        for &step in path {
            current = self.enter_scope(current, step);
        }
        current
    }

    /// Stores a field value, replacing any previous value.
    pub fn put(&mut self, key: SymbolKey, field: Field, value: FieldValue) {
        self.fields.insert((key, field), value);
    }

    /// Reads a field value.
    #[must_use]
    pub fn get(&self, key: SymbolKey, field: Field) -> Option<FieldValue> {
        self.fields.get(&(key, field)).copied()
    }

    /// Increments a `Count` field, creating it at 1, and returns the new
    /// value.
    pub fn bump_count(&mut self, key: SymbolKey, field: Field) -> u32 {
        let next = match self.fields.get(&(key, field)) {
            Some(v) => v.count() + 1,
            None => 1,
        };
        self.fields.insert((key, field), FieldValue::Count(next));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::WellKnown;

    #[test]
    fn scopes_do_not_collide_across_parents() {
        let mut table = SymbolTable::new();
        let p = table.enter_scope(SymbolKey::ROOT, ScopeKey::Pred(WellKnown::Nil.into()));
        let q = table.enter_scope(SymbolKey::ROOT, ScopeKey::Pred(WellKnown::Cons.into()));
        let p0 = table.enter_scope(p, ScopeKey::Clause(0));
        let q0 = table.enter_scope(q, ScopeKey::Clause(0));
        assert_ne!(p0, q0);

        table.put(p0, Field::ClauseCount, FieldValue::Count(3));
        assert_eq!(table.get(q0, Field::ClauseCount), None);
    }

    #[test]
    fn enter_scope_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.symbol_key_for(&[ScopeKey::Pred(WellKnown::True.into()), ScopeKey::Clause(1)]);
        let b = table.symbol_key_for(&[ScopeKey::Pred(WellKnown::True.into()), ScopeKey::Clause(1)]);
        assert_eq!(a, b);
    }

    #[test]
    fn bump_count_starts_at_one() {
        let mut table = SymbolTable::new();
        let key = table.enter_scope(SymbolKey::ROOT, ScopeKey::Clause(0));
        assert_eq!(table.bump_count(key, Field::OccurrenceCount), 1);
        assert_eq!(table.bump_count(key, Field::OccurrenceCount), 2);
        assert_eq!(table.get(key, Field::OccurrenceCount), Some(FieldValue::Count(2)));
    }
}
