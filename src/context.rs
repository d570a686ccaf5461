//! Per-invocation execution context.
//!
//! One [`BBTagContext`] exists per top-level invocation (or is reconstructed
//! from a persisted snapshot). It owns every piece of mutable evaluation
//! state (scopes, run state, error log, variable cache, limit) and is the
//! only thing that changes while a parsed [`Statement`] executes. A context
//! runs on a single logical thread; interior mutability exists so handlers
//! can reach state through a shared reference, not for cross-task sharing.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

use crate::ast::{SourceRange, Statement, SubtagCall};
use crate::collaborators::{
    AllowedMentions, AttachmentRef, ChannelRef, FileContent, LookupOptions, MemberRef, RoleRef,
    SendContent, UserRef,
};
use crate::engine::BBTagEngine;
use crate::error::{EngineResult, Error};
use crate::flags::{self, FlagDefinition, FlagResult};
use crate::limits::{RuntimeLimit, SerializedRuntimeLimit};
use crate::scope::{ScopeCollection, TagScope};
use crate::subtag::SubtagHandler;
use crate::variables::{VariableCache, VariableScope};

/// Minimal replayable record of the invoking message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    pub channel: ChannelRef,
    pub member: MemberRef,
    pub attachments: Vec<AttachmentRef>,
    pub embeds: Vec<serde_json::Value>,
}

impl Default for ContextMessage {
    fn default() -> Self {
        Self {
            id: String::new(),
            timestamp: DateTime::UNIX_EPOCH,
            content: String::new(),
            channel: ChannelRef::default(),
            member: MemberRef::default(),
            attachments: Vec::new(),
            embeds: Vec::new(),
        }
    }
}

/// Where a non-fatal error came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSite {
    pub name: String,
    pub range: SourceRange,
}

/// A recorded non-fatal error. Evaluation continues past these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeError {
    pub subtag: Option<CallSite>,
    pub error: String,
    pub debug_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntry {
    pub subtag: String,
    pub message: String,
}

/// Whether evaluation should keep appending output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeReturnState {
    #[default]
    None,
    /// Stop evaluating the current tag.
    Current,
    /// Stop evaluating everything, including callers.
    All,
}

/// Memoized entity lookups plus the interactive-prompt budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryCache {
    pub count: usize,
    pub users: HashMap<String, String>,
    pub roles: HashMap<String, String>,
    pub channels: HashMap<String, String>,
}

/// The serializable portion of the run state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub return_state: RuntimeReturnState,
    pub breaks: usize,
    pub continues: usize,
    pub query: QueryCache,
    pub owned_message_ids: Vec<String>,
    pub reactions: Vec<String>,
    pub embed: Option<serde_json::Value>,
    pub file: Option<FileContent>,
    pub nsfw_message: Option<String>,
    pub allowed_mentions: AllowedMentions,
}

/// Construction parameters for a fresh context.
pub struct BBTagContextOptions {
    pub message: ContextMessage,
    pub input_raw: String,
    pub flags: Vec<FlagDefinition>,
    pub is_cc: bool,
    pub tag_vars: Option<bool>,
    pub author: String,
    pub authorizer: Option<String>,
    pub root_tag_name: Option<String>,
    pub tag_name: Option<String>,
    pub silent: bool,
    pub limit: RuntimeLimit,
    pub scope: Option<TagScope>,
    pub state: Option<ContextState>,
}

impl BBTagContextOptions {
    pub fn new(message: ContextMessage, author: impl Into<String>, limit: RuntimeLimit) -> Self {
        Self {
            message,
            input_raw: String::new(),
            flags: Vec::new(),
            is_cc: false,
            tag_vars: None,
            author: author.into(),
            authorizer: None,
            root_tag_name: None,
            tag_name: None,
            silent: false,
            limit,
            scope: None,
            state: None,
        }
    }
}

/// Overrides applied when spawning a child context for isolated
/// sub-evaluation (e.g. executing another tag from inside this one).
#[derive(Default)]
pub struct ChildContextOptions {
    pub tag_name: Option<String>,
    pub input_raw: Option<String>,
    pub flags: Option<Vec<FlagDefinition>>,
    pub silent: Option<bool>,
    /// Seed the child's root scope with the parent's effective scope.
    pub inherit_scope: bool,
}

pub struct BBTagContext {
    engine: Arc<BBTagEngine>,
    pub message: ContextMessage,
    pub input_raw: String,
    /// Smart-split positional arguments of the raw input.
    pub input: Vec<String>,
    pub flags: Vec<FlagDefinition>,
    pub flagged_input: FlagResult,
    pub is_cc: bool,
    pub tag_vars: bool,
    pub author: String,
    pub authorizer: String,
    pub root_tag_name: String,
    pub tag_name: String,
    pub silent: bool,
    pub limit: Arc<RuntimeLimit>,
    pub variables: Arc<VariableCache>,
    scopes: Mutex<ScopeCollection>,
    state: Mutex<ContextState>,
    errors: Mutex<Vec<RuntimeError>>,
    debug: Mutex<Vec<DebugEntry>>,
    stack_size: AtomicUsize,
    subtag_count: AtomicU64,
    commit_count: AtomicU64,
    output_message: OnceCell<Option<String>>,
    subtag_durations: DashMap<String, Vec<Duration>>,
    result_cache: DashMap<String, Option<serde_json::Value>>,
    overrides: Arc<Mutex<HashMap<String, Arc<dyn SubtagHandler>>>>,
    staff: OnceCell<bool>,
}

impl BBTagContext {
    pub fn new(engine: Arc<BBTagEngine>, options: BBTagContextOptions) -> Arc<Self> {
        Self::build(engine, options, None)
    }

    fn build(
        engine: Arc<BBTagEngine>,
        options: BBTagContextOptions,
        flagged_input: Option<FlagResult>,
    ) -> Arc<Self> {
        let input = flags::smart_split(&options.input_raw);
        let flagged_input = flagged_input
            .unwrap_or_else(|| flags::parse(&options.flags, &options.input_raw, false));
        let root_tag_name = options
            .root_tag_name
            .unwrap_or_else(|| "unknown".to_string());
        let tag_name = options.tag_name.unwrap_or_else(|| root_tag_name.clone());
        let authorizer = options.authorizer.unwrap_or_else(|| options.author.clone());
        let tag_vars = options.tag_vars.unwrap_or(!options.is_cc);
        let variables = Arc::new(VariableCache::new(
            engine.store.clone(),
            engine.config.variable_scopes.clone(),
        ));
        let scopes = match options.scope {
            Some(root) => ScopeCollection::with_root(root),
            None => ScopeCollection::new(),
        };
        Arc::new(Self {
            engine,
            message: options.message,
            input_raw: options.input_raw,
            input,
            flags: options.flags,
            flagged_input,
            is_cc: options.is_cc,
            tag_vars,
            author: options.author,
            authorizer,
            root_tag_name,
            tag_name,
            silent: options.silent,
            limit: Arc::new(options.limit),
            variables,
            scopes: Mutex::new(scopes),
            state: Mutex::new(options.state.unwrap_or_default()),
            errors: Mutex::new(Vec::new()),
            debug: Mutex::new(Vec::new()),
            stack_size: AtomicUsize::new(0),
            subtag_count: AtomicU64::new(0),
            commit_count: AtomicU64::new(0),
            output_message: OnceCell::new(),
            subtag_durations: DashMap::new(),
            result_cache: DashMap::new(),
            overrides: Arc::new(Mutex::new(HashMap::new())),
            staff: OnceCell::new(),
        })
    }

    pub fn engine(&self) -> &Arc<BBTagEngine> {
        &self.engine
    }

    pub fn channel_id(&self) -> &str {
        &self.message.channel.id
    }

    pub fn guild_id(&self) -> &str {
        self.message.channel.guild_id.as_deref().unwrap_or("")
    }

    /// Re-entrant evaluation of a statement against this context.
    pub async fn eval(&self, statement: Statement) -> EngineResult<String> {
        self.engine.eval(&statement, self).await
    }

    // ---- scopes ----------------------------------------------------------

    /// The effective read view of the scope stack.
    pub fn scope(&self) -> TagScope {
        self.lock_scopes().effective()
    }

    /// Mutates the innermost scope.
    pub fn modify_scope(&self, f: impl FnOnce(&mut TagScope)) {
        f(self.lock_scopes().local_mut());
    }

    /// Runs `f` inside a fresh scope, popping it on every exit path.
    pub async fn with_isolated_scope<T, Fut, F>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.lock_scopes().push();
        let result = f().await;
        let _ = self.lock_scopes().pop();
        result
    }

    fn lock_scopes(&self) -> MutexGuard<'_, ScopeCollection> {
        self.scopes.lock().expect("scope mutex poisoned")
    }

    // ---- run state -------------------------------------------------------

    pub fn with_state<T>(&self, f: impl FnOnce(&mut ContextState) -> T) -> T {
        f(&mut self.lock_state())
    }

    pub fn return_state(&self) -> RuntimeReturnState {
        self.lock_state().return_state
    }

    pub fn set_return(&self, state: RuntimeReturnState) {
        self.lock_state().return_state = state;
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().expect("state mutex poisoned")
    }

    pub(crate) fn enter_call(&self) -> usize {
        self.subtag_count.fetch_add(1, Ordering::SeqCst);
        self.stack_size.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn exit_call(&self) {
        self.stack_size.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn stack_depth(&self) -> usize {
        self.stack_size.load(Ordering::SeqCst)
    }

    pub fn total_subtag_count(&self) -> u64 {
        self.subtag_count.load(Ordering::SeqCst)
    }

    pub(crate) fn record_duration(&self, subtag_name: &str, elapsed: Duration) {
        self.subtag_durations
            .entry(subtag_name.to_string())
            .or_default()
            .push(elapsed);
    }

    /// Per-subtag execution timings recorded so far.
    pub fn subtag_durations(&self) -> HashMap<String, Vec<Duration>> {
        self.subtag_durations
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    // ---- errors ----------------------------------------------------------

    /// Records a non-fatal error and returns the text the failing call
    /// should produce: the scope's fallback when set, else the bracketed
    /// message. The surrounding statement keeps evaluating.
    pub fn add_error(
        &self,
        message: impl Into<String>,
        call: Option<&SubtagCall>,
        debug_message: Option<String>,
    ) -> String {
        let message = message.into();
        let subtag = call.map(|call| CallSite {
            name: call
                .name
                .as_literal()
                .unwrap_or_else(|| call.name.to_string()),
            range: call.range,
        });
        self.errors
            .lock()
            .expect("error log mutex poisoned")
            .push(RuntimeError {
                subtag,
                error: message.clone(),
                debug_message,
            });
        match self.scope().fallback {
            Some(fallback) => fallback,
            None => format!("`{message}`"),
        }
    }

    pub fn errors(&self) -> Vec<RuntimeError> {
        self.errors.lock().expect("error log mutex poisoned").clone()
    }

    pub fn add_debug(&self, subtag: impl Into<String>, message: impl Into<String>) {
        self.debug
            .lock()
            .expect("debug log mutex poisoned")
            .push(DebugEntry {
                subtag: subtag.into(),
                message: message.into(),
            });
    }

    pub fn debug_entries(&self) -> Vec<DebugEntry> {
        self.debug.lock().expect("debug log mutex poisoned").clone()
    }

    // ---- entity lookups --------------------------------------------------

    /// Options with the query budget and scope toggles applied: once the
    /// per-invocation prompt budget is spent, every further lookup is forced
    /// quiet and suppressed.
    fn effective_lookup_options(&self, mut options: LookupOptions) -> LookupOptions {
        if self.lock_state().query.count >= self.engine.config.max_lookup_queries {
            options.quiet = true;
            options.suppress = true;
        }
        let scope = self.scope();
        if scope.quiet == Some(true) {
            options.quiet = true;
        }
        if scope.suppress_lookup == Some(true) {
            options.suppress = true;
        }
        options
    }

    pub async fn get_user(
        &self,
        query: &str,
        options: LookupOptions,
    ) -> EngineResult<Option<UserRef>> {
        let options = self.effective_lookup_options(options);
        // Read the memoized id in its own statement so the state guard is
        // released before any await.
        let cached = self.lock_state().query.users.get(query).cloned();
        if let Some(id) = cached {
            if let Some(user) = self.engine.util.get_user_by_id(&id).await? {
                return Ok(Some(user));
            }
        }
        let result = self
            .engine
            .util
            .find_user(self.guild_id(), query, &options)
            .await?;
        let mut state = self.lock_state();
        if result.prompted {
            state.query.count += 1;
        }
        if let Some(user) = &result.entity {
            state.query.users.insert(query.to_string(), user.id.clone());
        }
        Ok(result.entity)
    }

    pub async fn get_role(
        &self,
        query: &str,
        options: LookupOptions,
    ) -> EngineResult<Option<RoleRef>> {
        let options = self.effective_lookup_options(options);
        let cached = self.lock_state().query.roles.get(query).cloned();
        if let Some(id) = cached {
            if let Some(role) = self.engine.util.get_role_by_id(self.guild_id(), &id).await? {
                return Ok(Some(role));
            }
        }
        let result = self
            .engine
            .util
            .find_role(self.guild_id(), query, &options)
            .await?;
        let mut state = self.lock_state();
        if result.prompted {
            state.query.count += 1;
        }
        if let Some(role) = &result.entity {
            state.query.roles.insert(query.to_string(), role.id.clone());
        }
        Ok(result.entity)
    }

    pub async fn get_channel(
        &self,
        query: &str,
        options: LookupOptions,
    ) -> EngineResult<Option<ChannelRef>> {
        let options = self.effective_lookup_options(options);
        let cached = self.lock_state().query.channels.get(query).cloned();
        if let Some(id) = cached {
            if let Some(channel) = self.engine.util.get_channel_by_id(&id).await? {
                return Ok(Some(channel));
            }
        }
        let result = self
            .engine
            .util
            .find_channel(self.guild_id(), query, &options)
            .await?;
        let mut state = self.lock_state();
        if result.prompted {
            state.query.count += 1;
        }
        // Only textable guild channels are usable from a tag.
        let channel = result
            .entity
            .filter(|channel| channel.guild_id.is_some() && channel.textable);
        if let Some(channel) = &channel {
            state
                .query
                .channels
                .insert(query.to_string(), channel.id.clone());
        }
        Ok(channel)
    }

    /// Whether the authorizer is staff in the invoking guild; resolved once
    /// per invocation.
    pub async fn is_staff(&self) -> EngineResult<bool> {
        self.staff
            .get_or_try_init(|| async {
                self.engine
                    .util
                    .is_user_staff(&self.authorizer, self.guild_id())
                    .await
                    .map_err(Error::from)
            })
            .await
            .copied()
    }

    // ---- overrides -------------------------------------------------------

    /// Installs a temporary handler for `name`, shadowing the registry. The
    /// returned guard restores the previous binding when reverted or
    /// dropped.
    pub fn override_subtag(
        &self,
        name: &str,
        handler: Arc<dyn SubtagHandler>,
    ) -> OverrideGuard {
        let name = name.to_lowercase();
        let previous = self
            .overrides
            .lock()
            .expect("override mutex poisoned")
            .insert(name.clone(), handler);
        OverrideGuard {
            overrides: self.overrides.clone(),
            name,
            previous,
            done: false,
        }
    }

    pub(crate) fn get_override(&self, name: &str) -> Option<Arc<dyn SubtagHandler>> {
        self.overrides
            .lock()
            .expect("override mutex poisoned")
            .get(name)
            .cloned()
    }

    // ---- variables -------------------------------------------------------

    pub async fn get_variable(&self, key: &str) -> EngineResult<Option<String>> {
        self.variables.get(self, key).await
    }

    pub fn set_variable(&self, key: &str, value: Option<String>) {
        self.variables.set(key, value);
    }

    /// Flushes dirty variables; bumps the commit counter for telemetry.
    pub async fn commit_variables(&self) -> EngineResult<usize> {
        let committed = self.variables.commit(self).await?;
        self.commit_count
            .fetch_add(committed as u64, Ordering::SeqCst);
        Ok(committed)
    }

    pub fn committed_variables(&self) -> u64 {
        self.commit_count.load(Ordering::SeqCst)
    }

    /// Which owner row a variable scope is addressed with for this context.
    pub(crate) fn variable_owner(&self, scope: VariableScope) -> String {
        match scope {
            VariableScope::Temporary | VariableScope::Global => String::new(),
            VariableScope::Author => self.author.clone(),
            VariableScope::Guild => self.guild_id().to_string(),
            VariableScope::Local => {
                if self.is_cc && !self.tag_vars {
                    format!("cc:{}", self.guild_id())
                } else {
                    format!("tag:{}", self.root_tag_name)
                }
            }
        }
    }

    /// Process-wide lock for multi-step read-modify-write on a shared key.
    pub fn get_lock(&self, key: &str) -> Arc<RwLock<()>> {
        self.engine.get_lock(key)
    }

    // ---- general-purpose result cache ------------------------------------

    /// Memoizes `fetch` per key for the lifetime of this context, including
    /// negative results. Not serialized; reset on restore.
    pub async fn get_cached<F, Fut>(
        &self,
        key: &str,
        fetch: F,
    ) -> EngineResult<Option<serde_json::Value>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = EngineResult<Option<serde_json::Value>>>,
    {
        if let Some(hit) = self.result_cache.get(key) {
            return Ok(hit.clone());
        }
        let value = fetch(key.to_string()).await?;
        self.result_cache.insert(key.to_string(), value.clone());
        Ok(value)
    }

    // ---- output ----------------------------------------------------------

    pub fn owns_message(&self, message_id: &str) -> bool {
        message_id == self.message.id
            || self
                .lock_state()
                .owned_message_ids
                .iter()
                .any(|id| id == message_id)
    }

    /// Delivers the invocation output at most once; repeated calls return
    /// the same message id. `Ok(None)` means there was nothing to send.
    pub async fn send_output(&self, text: &str) -> EngineResult<Option<String>> {
        if self.silent {
            return Ok(self.output_message.get().cloned().flatten());
        }
        self.output_message
            .get_or_try_init(|| self.deliver_output(text))
            .await
            .cloned()
    }

    async fn deliver_output(&self, text: &str) -> EngineResult<Option<String>> {
        let (embed, file, nsfw_message, mut allowed_mentions) = {
            let state = self.lock_state();
            (
                state.embed.clone(),
                state.file.clone(),
                state.nsfw_message.clone(),
                state.allowed_mentions.clone(),
            )
        };
        if !self.is_cc {
            allowed_mentions = AllowedMentions::default();
        }
        if self.scope().disable_everyone == Some(true) {
            allowed_mentions.everybody = false;
        }
        let content = SendContent {
            content: text.to_string(),
            embeds: embed.into_iter().collect(),
            file,
            nsfw_message,
            allowed_mentions,
        };
        match self.engine.util.send(self.channel_id(), content).await? {
            Some(message) => {
                let mut reactions = self.lock_state().reactions.clone();
                reactions.dedup();
                if !reactions.is_empty() {
                    self.engine
                        .util
                        .add_reactions(&message.channel_id, &message.id, &reactions)
                        .await?;
                }
                self.lock_state()
                    .owned_message_ids
                    .push(message.id.clone());
                Ok(Some(message.id))
            }
            None => Ok(None),
        }
    }

    // ---- suspension ------------------------------------------------------

    /// In-process bounded pause; the cap applies irrespective of the
    /// requested duration.
    pub async fn sleep(&self, requested: Duration) {
        tokio::time::sleep(requested.min(self.engine.config.max_sleep)).await;
    }

    /// Serializes this context and hands it to the continuation scheduler
    /// for later (possibly cross-process) resumption.
    pub async fn suspend(&self, resume_after: Duration) -> EngineResult<()> {
        let scheduler = self.engine.scheduler.clone().ok_or(Error::NoScheduler)?;
        let snapshot = self.serialize();
        debug!(tag = %self.tag_name, ?resume_after, "suspending invocation");
        scheduler
            .schedule(snapshot, resume_after.min(self.engine.config.max_sleep))
            .await?;
        Ok(())
    }

    // ---- child contexts --------------------------------------------------

    /// Builds a child context for isolated sub-evaluation: configuration and
    /// identity are copied, the limit and variable cache are shared so the
    /// child draws the same budgets, and scope/run state start fresh.
    pub fn make_child(self: &Arc<Self>, options: ChildContextOptions) -> Arc<BBTagContext> {
        let input_raw = options.input_raw.unwrap_or_else(|| self.input_raw.clone());
        let flag_schema = options.flags.unwrap_or_else(|| self.flags.clone());
        let input = flags::smart_split(&input_raw);
        let flagged_input = flags::parse(&flag_schema, &input_raw, false);
        let scopes = if options.inherit_scope {
            ScopeCollection::with_root(self.scope())
        } else {
            ScopeCollection::new()
        };
        Arc::new(Self {
            engine: self.engine.clone(),
            message: self.message.clone(),
            input_raw,
            input,
            flags: flag_schema,
            flagged_input,
            is_cc: self.is_cc,
            tag_vars: self.tag_vars,
            author: self.author.clone(),
            authorizer: self.authorizer.clone(),
            root_tag_name: self.root_tag_name.clone(),
            tag_name: options.tag_name.unwrap_or_else(|| self.tag_name.clone()),
            silent: options.silent.unwrap_or(self.silent),
            limit: self.limit.clone(),
            variables: self.variables.clone(),
            scopes: Mutex::new(scopes),
            state: Mutex::new(ContextState::default()),
            errors: Mutex::new(Vec::new()),
            debug: Mutex::new(Vec::new()),
            stack_size: AtomicUsize::new(0),
            subtag_count: AtomicU64::new(0),
            commit_count: AtomicU64::new(0),
            output_message: OnceCell::new(),
            subtag_durations: DashMap::new(),
            result_cache: DashMap::new(),
            overrides: Arc::new(Mutex::new(HashMap::new())),
            staff: OnceCell::new(),
        })
    }

    // ---- snapshots -------------------------------------------------------

    pub fn serialize(&self) -> SerializedContext {
        SerializedContext {
            message: self.message.clone(),
            is_cc: self.is_cc,
            tag_vars: self.tag_vars,
            input_raw: self.input_raw.clone(),
            flags: self.flags.clone(),
            flagged_input: self.flagged_input.clone(),
            root_tag_name: self.root_tag_name.clone(),
            tag_name: self.tag_name.clone(),
            author: self.author.clone(),
            authorizer: self.authorizer.clone(),
            state: self.lock_state().clone(),
            stack_size: self.stack_depth(),
            subtag_count: self.total_subtag_count(),
            output_message: self.output_message.get().cloned().flatten(),
            scope: self.scope(),
            limit: self.limit.serialize(),
            temp_vars: self.variables.temporaries(),
        }
    }

    /// Reconstructs a context from a snapshot. The channel and member are
    /// re-resolved from the collaborator; either failing is fatal, since a
    /// partially reconstructed context must never run.
    pub async fn deserialize(
        engine: Arc<BBTagEngine>,
        snapshot: SerializedContext,
    ) -> EngineResult<Arc<Self>> {
        let channel = engine
            .util
            .get_channel_by_id(&snapshot.message.channel.id)
            .await?
            .ok_or_else(|| Error::restore("channel no longer exists"))?;
        let Some(guild_id) = channel.guild_id.clone() else {
            return Err(Error::restore("channel must be a guild channel"));
        };
        if !channel.textable {
            return Err(Error::restore(
                "channel must be able to send and receive messages",
            ));
        }
        let member = engine
            .util
            .get_member(&guild_id, &snapshot.message.member.id)
            .await?
            .ok_or_else(|| {
                Error::restore(format!(
                    "member {} no longer exists in guild {}",
                    snapshot.message.member.id, guild_id
                ))
            })?;

        let message = ContextMessage {
            channel,
            member,
            ..snapshot.message
        };
        let limit = RuntimeLimit::new(snapshot.limit.kind);
        limit.load(&snapshot.limit);
        let context = Self::build(
            engine,
            BBTagContextOptions {
                message,
                input_raw: snapshot.input_raw,
                flags: snapshot.flags,
                is_cc: snapshot.is_cc,
                tag_vars: Some(snapshot.tag_vars),
                author: snapshot.author,
                authorizer: Some(snapshot.authorizer),
                root_tag_name: Some(snapshot.root_tag_name),
                tag_name: Some(snapshot.tag_name),
                silent: false,
                limit,
                scope: Some(snapshot.scope),
                state: Some(snapshot.state),
            },
            Some(snapshot.flagged_input),
        );
        context
            .subtag_count
            .store(snapshot.subtag_count, Ordering::SeqCst);
        if let Some(id) = snapshot.output_message {
            let _ = context.output_message.set(Some(id));
        }
        for (key, value) in snapshot.temp_vars {
            context.variables.restore_temporary(&key, value);
        }
        Ok(context)
    }
}

/// Scoped-release handle for a subtag override; restores the prior binding
/// (or removes the override) on revert or drop.
pub struct OverrideGuard {
    overrides: Arc<Mutex<HashMap<String, Arc<dyn SubtagHandler>>>>,
    name: String,
    previous: Option<Arc<dyn SubtagHandler>>,
    done: bool,
}

impl OverrideGuard {
    pub fn revert(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let mut overrides = self.overrides.lock().expect("override mutex poisoned");
        match self.previous.take() {
            Some(previous) => overrides.insert(self.name.clone(), previous),
            None => overrides.remove(&self.name),
        };
    }
}

impl Drop for OverrideGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// The persisted/transmitted form of a suspended invocation.
///
/// The override table and the result cache are not serializable and reset to
/// empty on restore; everything else survives intact, including limit
/// counters and temporary variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedContext {
    pub message: ContextMessage,
    pub is_cc: bool,
    pub tag_vars: bool,
    pub input_raw: String,
    pub flags: Vec<FlagDefinition>,
    pub flagged_input: FlagResult,
    pub root_tag_name: String,
    pub tag_name: String,
    pub author: String,
    pub authorizer: String,
    pub state: ContextState,
    pub stack_size: usize,
    pub subtag_count: u64,
    pub output_message: Option<String>,
    pub scope: TagScope,
    pub limit: SerializedRuntimeLimit,
    pub temp_vars: HashMap<String, String>,
}
