//! Nested lexical scopes for pseudo-variables consulted by many subtags.
//!
//! Reads fall back through the parent chain; writes always target the
//! innermost scope. A new scope is pushed when entering an isolated block
//! (a function body, a loop body) and popped on exit.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Scope-local pseudo-variables. `None` means "not set here, ask the parent".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagScope {
    /// Suppresses "not found" style messages in entity lookups.
    pub quiet: Option<bool>,
    /// Output substituted for a subtag's non-fatal error, when set.
    pub fallback: Option<String>,
    /// Audit-log reason applied by moderation-flavored subtags.
    pub reason: Option<String>,
    /// Suppresses interactive lookup prompts entirely.
    pub suppress_lookup: Option<bool>,
    /// Blocks `@everyone`-style mentions in the produced output.
    pub disable_everyone: Option<bool>,
}

impl TagScope {
    /// Overlays `self` on top of `parent`: unset fields read through.
    fn merged_onto(&self, parent: &TagScope) -> TagScope {
        TagScope {
            quiet: self.quiet.or(parent.quiet),
            fallback: self.fallback.clone().or_else(|| parent.fallback.clone()),
            reason: self.reason.clone().or_else(|| parent.reason.clone()),
            suppress_lookup: self.suppress_lookup.or(parent.suppress_lookup),
            disable_everyone: self.disable_everyone.or(parent.disable_everyone),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ScopeError {
    #[error("cannot pop the root scope")]
    NoParentScope,
}

/// The scope stack for one context. Never shared across sibling evaluations;
/// a context evaluates on a single logical thread.
#[derive(Debug, Clone)]
pub struct ScopeCollection {
    scopes: Vec<TagScope>,
}

impl Default for ScopeCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeCollection {
    pub fn new() -> Self {
        Self {
            scopes: vec![TagScope::default()],
        }
    }

    /// Seeds the root scope, used when restoring a suspended invocation.
    pub fn with_root(root: TagScope) -> Self {
        Self { scopes: vec![root] }
    }

    /// The innermost scope; all writes land here.
    pub fn local_mut(&mut self) -> &mut TagScope {
        self.scopes.last_mut().expect("scope stack is never empty")
    }

    pub fn local(&self) -> &TagScope {
        self.scopes.last().expect("scope stack is never empty")
    }

    /// The read view: innermost values win, unset fields fall back outward.
    pub fn effective(&self) -> TagScope {
        self.scopes
            .iter()
            .fold(TagScope::default(), |acc, scope| scope.merged_onto(&acc))
    }

    /// Enters an isolated block: an empty scope sharing the parent chain.
    pub fn push(&mut self) {
        self.scopes.push(TagScope::default());
    }

    pub fn pop(&mut self) -> Result<TagScope, ScopeError> {
        if self.scopes.len() == 1 {
            return Err(ScopeError::NoParentScope);
        }
        Ok(self.scopes.pop().expect("len checked above"))
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}
