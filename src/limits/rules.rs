//! Individual limit rules. Stateless rules are shared singletons; counting
//! rules carry their own per-invocation state and may be registered under
//! several subtag names to share one budget.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::context::BBTagContext;

#[derive(Debug, Error)]
pub enum RuleCheckError {
    /// The rule denied this call; the message becomes the non-fatal error
    /// text and evaluation continues.
    #[error("{0}")]
    Violation(String),
    /// The rule could not be evaluated at all; aborts the invocation.
    #[error(transparent)]
    Fatal(#[from] crate::error::Error),
}

#[async_trait]
pub trait LimitRule: Send + Sync {
    async fn check(&self, context: &BBTagContext, subtag_name: &str)
        -> Result<(), RuleCheckError>;

    /// Counter state to persist across a suspension, if any.
    fn state(&self) -> Option<serde_json::Value> {
        None
    }

    fn load_state(&self, _state: &serde_json::Value) {}
}

/// Denies the call unless the authorizer is staff in the invoking guild.
/// Carries no per-check state, so one instance backs every binding.
#[derive(Debug)]
pub struct StaffOnlyRule;

impl StaffOnlyRule {
    pub fn instance() -> Arc<StaffOnlyRule> {
        static INSTANCE: OnceLock<Arc<StaffOnlyRule>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(StaffOnlyRule)).clone()
    }
}

#[async_trait]
impl LimitRule for StaffOnlyRule {
    async fn check(
        &self,
        context: &BBTagContext,
        _subtag_name: &str,
    ) -> Result<(), RuleCheckError> {
        if context.is_staff().await? {
            Ok(())
        } else {
            Err(RuleCheckError::Violation(
                "Authorizer must be staff".to_string(),
            ))
        }
    }
}

/// Unconditionally denies the call for this invocation kind.
#[derive(Debug)]
pub struct DisabledRule;

impl DisabledRule {
    pub fn instance() -> Arc<DisabledRule> {
        static INSTANCE: OnceLock<Arc<DisabledRule>> = OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(DisabledRule)).clone()
    }
}

#[async_trait]
impl LimitRule for DisabledRule {
    async fn check(&self, _context: &BBTagContext, subtag_name: &str) -> Result<(), RuleCheckError> {
        Err(RuleCheckError::Violation(format!(
            "{{{subtag_name}}} is disabled"
        )))
    }
}

/// Allows at most `initial` uses per invocation. Registering one instance
/// under several subtag names makes those names draw from a single budget,
/// reported under `label` in the error text.
#[derive(Debug)]
pub struct UseCountRule {
    initial: u64,
    remaining: AtomicI64,
    label: String,
}

impl UseCountRule {
    pub fn new(count: u64) -> Arc<Self> {
        Self::named(count, "uses")
    }

    pub fn named(count: u64, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            initial: count,
            remaining: AtomicI64::new(count as i64),
            label: label.into(),
        })
    }
}

#[async_trait]
impl LimitRule for UseCountRule {
    async fn check(
        &self,
        _context: &BBTagContext,
        _subtag_name: &str,
    ) -> Result<(), RuleCheckError> {
        let before = self.remaining.fetch_sub(1, Ordering::SeqCst);
        if before <= 0 {
            Err(RuleCheckError::Violation(format!(
                "Maximum {} {} reached",
                self.initial, self.label
            )))
        } else {
            Ok(())
        }
    }

    fn state(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!(self.remaining.load(Ordering::SeqCst)))
    }

    fn load_state(&self, state: &serde_json::Value) {
        if let Some(remaining) = state.as_i64() {
            self.remaining.store(remaining, Ordering::SeqCst);
        }
    }
}
