//! The tree-walking evaluator and its host-facing entry points.
//!
//! [`BBTagEngine`] is the long-lived half of the runtime: configuration,
//! collaborators, the subtag registry, and the process-wide key locks all
//! live here and are shared by every invocation. Evaluation itself is
//! re-entrant: subtag bodies call back into [`BBTagEngine::eval`] through
//! their lazy arguments, which is how nesting works.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::ast::{Statement, StatementPart, SubtagCall};
use crate::collaborators::{
    BBTagUtilities, ContinuationScheduler, SubtagRegistry, TagVariableStore,
};
use crate::config::EngineConfig;
use crate::context::{
    BBTagContext, BBTagContextOptions, DebugEntry, RuntimeError, RuntimeReturnState,
    SerializedContext,
};
use crate::error::EngineResult;
use crate::limits::rules::RuleCheckError;
use crate::subtag::SubtagHandler;

/// What one completed (or terminated) invocation produced.
#[derive(Debug)]
pub struct ExecutionResult {
    pub content: String,
    pub errors: Vec<RuntimeError>,
    pub debug: Vec<DebugEntry>,
    pub subtag_count: u64,
    pub committed_variables: usize,
    pub duration: Duration,
}

pub struct BBTagEngine {
    pub config: EngineConfig,
    pub util: Arc<dyn BBTagUtilities>,
    pub store: Arc<dyn TagVariableStore>,
    pub subtags: Arc<dyn SubtagRegistry>,
    pub scheduler: Option<Arc<dyn ContinuationScheduler>>,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl BBTagEngine {
    pub fn new(
        config: EngineConfig,
        util: Arc<dyn BBTagUtilities>,
        store: Arc<dyn TagVariableStore>,
        subtags: Arc<dyn SubtagRegistry>,
    ) -> Self {
        Self {
            config,
            util,
            store,
            subtags,
            scheduler: None,
            locks: DashMap::new(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn ContinuationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Process-wide lock for a shared key; the same key always yields the
    /// same lock, across every concurrent invocation in this process.
    pub fn get_lock(&self, key: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Runs a parsed statement as a fresh invocation: builds the context,
    /// evaluates, and flushes dirty variables.
    #[tracing::instrument(level = "debug", skip_all, fields(author = %options.author))]
    pub async fn execute(
        self: &Arc<Self>,
        statement: &Statement,
        options: BBTagContextOptions,
    ) -> EngineResult<ExecutionResult> {
        let context = BBTagContext::new(self.clone(), options);
        self.run(statement, &context).await
    }

    /// Resumes a suspended invocation from its snapshot. Restoration failures
    /// are fatal; a half-reconstructed context never runs.
    #[tracing::instrument(level = "debug", skip_all, fields(tag = %snapshot.tag_name))]
    pub async fn resume(
        self: &Arc<Self>,
        snapshot: SerializedContext,
        statement: &Statement,
    ) -> EngineResult<ExecutionResult> {
        let context = BBTagContext::deserialize(self.clone(), snapshot).await?;
        self.run(statement, &context).await
    }

    async fn run(
        &self,
        statement: &Statement,
        context: &Arc<BBTagContext>,
    ) -> EngineResult<ExecutionResult> {
        let started = Instant::now();
        let content = self.eval(statement, context).await?;
        let committed_variables = context.commit_variables().await?;
        Ok(ExecutionResult {
            content,
            errors: context.errors(),
            debug: context.debug_entries(),
            subtag_count: context.total_subtag_count(),
            committed_variables,
            duration: started.elapsed(),
        })
    }

    /// Evaluates a statement left to right, concatenating literal fragments
    /// with subtag output. A set return state stops the walk mid-statement;
    /// everything produced so far is kept.
    #[async_recursion]
    pub async fn eval(
        &self,
        statement: &Statement,
        context: &BBTagContext,
    ) -> EngineResult<String> {
        let mut output = String::new();
        for part in statement.parts() {
            if context.return_state() != RuntimeReturnState::None {
                break;
            }
            match part {
                StatementPart::Literal(text) => output.push_str(text),
                StatementPart::Call(call) => output.push_str(&self.eval_call(call, context).await?),
            }
        }
        Ok(output)
    }

    /// Dispatches one call: evaluate the (possibly computed) name, find a
    /// handler, and run it under the depth ceiling and the limit table.
    #[async_recursion]
    async fn eval_call(&self, call: &SubtagCall, context: &BBTagContext) -> EngineResult<String> {
        let name = self.eval(&call.name, context).await?.trim().to_lowercase();
        let handler: Arc<dyn SubtagHandler> = match context.get_override(&name) {
            // An override shadows the registry entirely, including any
            // deprecation notice on the subtag it replaces.
            Some(handler) => handler,
            None => match self.subtags.resolve(&name) {
                Some(subtag) => {
                    if subtag.deprecated {
                        warn!(subtag = %name, tag = %context.tag_name, "deprecated subtag used");
                    }
                    subtag
                }
                None => {
                    // Unknown name: the call renders as its own source text.
                    debug!(subtag = %name, "unknown subtag, echoing source");
                    return Ok(call.to_string());
                }
            },
        };
        let depth = context.enter_call();
        let result = self.dispatch(&name, handler.as_ref(), call, context, depth).await;
        context.exit_call();
        result
    }

    async fn dispatch(
        &self,
        name: &str,
        handler: &dyn SubtagHandler,
        call: &SubtagCall,
        context: &BBTagContext,
        depth: usize,
    ) -> EngineResult<String> {
        if depth > self.config.max_stack_depth {
            context.set_return(RuntimeReturnState::All);
            return Ok(context.add_error(
                format!(
                    "Terminated recursive tag after {} execs",
                    context.total_subtag_count()
                ),
                Some(call),
                None,
            ));
        }
        if let Err(error) = context.limit.check(context, name).await {
            return match error {
                RuleCheckError::Violation(message) => {
                    Ok(context.add_error(message, Some(call), None))
                }
                RuleCheckError::Fatal(error) => Err(error),
            };
        }
        let started = Instant::now();
        let result = handler.execute(context, name, call).await;
        // Timed whether the handler succeeded or not.
        context.record_duration(name, started.elapsed());
        result
    }
}
