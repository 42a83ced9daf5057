//! Lexical scopes and the context threaded through planning passes.
//!
//! Every SELECT gets a [`Scope`]. A scope only borrows its parent through a
//! `Weak` link; the [`ScopeTree`] owns all of them for the statement.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use crate::sql::JoinOrderHint;

/// Identifier of a SELECT scope within one statement. The outermost scope is 0.
pub type ScopeId = usize;

/// One lexical nesting level.
#[derive(Debug)]
pub struct Scope {
    id: ScopeId,
    parent: Option<Weak<Scope>>,
    hint: Option<JoinOrderHint>,
}

impl Scope {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn parent(&self) -> Option<Arc<Scope>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn hint(&self) -> Option<&JoinOrderHint> {
        self.hint.as_ref()
    }

    /// Nesting depth; the outermost scope has depth 0.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self.parent();
        while let Some(scope) = current {
            depth += 1;
            current = scope.parent();
        }
        depth
    }

    /// Whether `other` is this scope or one of its ancestors.
    pub fn is_within(&self, other: ScopeId) -> bool {
        if self.id == other {
            return true;
        }
        let mut current = self.parent();
        while let Some(scope) = current {
            if scope.id == other {
                return true;
            }
            current = scope.parent();
        }
        false
    }
}

/// All scopes of a statement, indexed by id.
#[derive(Debug, Default)]
pub struct ScopeTree {
    scopes: Vec<Arc<Scope>>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new scope below `parent` (or a root scope).
    pub fn open(&mut self, parent: Option<ScopeId>, hint: Option<JoinOrderHint>) -> Arc<Scope> {
        let parent = parent
            .and_then(|id| self.scopes.get(id))
            .map(Arc::downgrade);
        let scope = Arc::new(Scope {
            id: self.scopes.len(),
            parent,
            hint,
        });
        self.scopes.push(Arc::clone(&scope));
        scope
    }

    pub fn get(&self, id: ScopeId) -> Option<&Arc<Scope>> {
        self.scopes.get(id)
    }

    pub fn hint(&self, id: ScopeId) -> Option<&JoinOrderHint> {
        self.scopes.get(id).and_then(|s| s.hint())
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

/// Explicit context for rewrite and selection calls: the scope being
/// planned and the relations whose rows are bound by enclosing scopes.
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub scope: ScopeId,
    pub outer_relations: Arc<BTreeSet<String>>,
}

impl PlanContext {
    pub fn root() -> Self {
        Self {
            scope: 0,
            outer_relations: Arc::new(BTreeSet::new()),
        }
    }

    /// Context for a nested scope that can see `bound` in addition to what
    /// this context already sees.
    pub fn nested<'a>(&self, scope: ScopeId, bound: impl IntoIterator<Item = &'a String>) -> Self {
        let mut outer = BTreeSet::clone(&self.outer_relations);
        outer.extend(bound.into_iter().cloned());
        Self {
            scope,
            outer_relations: Arc::new(outer),
        }
    }

    pub fn in_scope(&self, scope: ScopeId) -> Self {
        Self {
            scope,
            outer_relations: Arc::clone(&self.outer_relations),
        }
    }

    pub fn is_outer(&self, relation: &str) -> bool {
        self.outer_relations.contains(relation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_links_are_weak() {
        let mut tree = ScopeTree::new();
        let root = tree.open(None, None);
        let child = tree.open(Some(root.id()), None);
        let grandchild = tree.open(Some(child.id()), None);

        assert_eq!(grandchild.depth(), 2);
        assert!(grandchild.is_within(0));
        assert!(!root.is_within(child.id()));
        assert_eq!(Arc::strong_count(&root), 2);
    }

    #[test]
    fn test_hint_lookup() {
        let mut tree = ScopeTree::new();
        tree.open(None, None);
        let hint = JoinOrderHint {
            relations: vec!["b".into(), "a".into()],
        };
        let inner = tree.open(Some(0), Some(hint.clone()));
        assert_eq!(tree.hint(inner.id()), Some(&hint));
        assert!(tree.hint(0).is_none());
    }

    #[test]
    fn test_nested_context_accumulates_relations() {
        let ctx = PlanContext::root();
        let names = vec!["xy".to_string()];
        let nested = ctx.nested(1, &names);
        assert!(nested.is_outer("xy"));
        assert!(!ctx.is_outer("xy"));
        assert_eq!(nested.in_scope(2).scope, 2);
    }
}
