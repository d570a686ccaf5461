//! Lazy argument values handed to subtag handlers.
//!
//! Arguments are never pre-evaluated: a handler that skips a branch never
//! pays for it. Reading `value` evaluates the backing statement at most once
//! per call instance and caches the result; loop constructs re-enter the
//! dispatcher with fresh call instances, so bodies re-evaluate each
//! iteration through `code` instead.

use tokio::sync::OnceCell;

use crate::ast::Statement;
use crate::context::BBTagContext;
use crate::error::EngineResult;

pub struct SubtagArgument {
    code: Statement,
    raw: String,
    resolved: OnceCell<String>,
}

impl SubtagArgument {
    /// An argument that evaluates its statement on first read.
    pub fn deferred(code: Statement) -> Self {
        Self {
            raw: code.to_string(),
            code,
            resolved: OnceCell::new(),
        }
    }

    /// An always-resolved argument, used for injected parameter defaults.
    pub fn literal(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            code: Statement::literal(value.clone()),
            raw: value.clone(),
            resolved: OnceCell::new_with(Some(value)),
        }
    }

    /// Evaluates (at most once) and returns the argument text.
    pub async fn value(&self, context: &BBTagContext) -> EngineResult<&str> {
        self.resolved
            .get_or_try_init(|| context.eval(self.code.clone()))
            .await
            .map(String::as_str)
    }

    /// The cached value, if `value` has already been awaited.
    pub fn cached(&self) -> Option<&str> {
        self.resolved.get().map(String::as_str)
    }

    pub fn is_cached(&self) -> bool {
        self.resolved.initialized()
    }

    /// The original source text, for diagnostics.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The backing statement, for constructs that re-evaluate (loop bodies).
    pub fn code(&self) -> &Statement {
        &self.code
    }
}
