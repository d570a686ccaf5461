//! Shared fixtures: in-memory collaborators and a handful of test subtags.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use bbtag::arguments::SubtagArgument;
use bbtag::ast::{SourceRange, Statement, StatementPart, SubtagCall};
use bbtag::collaborators::{
    BBTagUtilities, ChannelRef, ContinuationScheduler, InMemorySubtagRegistry, LookupOptions,
    LookupResult, MemberRef, MessageRef, RoleRef, SendContent, StoreError, TagVariableStore,
    UserRef, UtilityError,
};
use bbtag::compilation::{FnSignatureBody, HandlerFuture, SignatureBody, SubtagSignature};
use bbtag::config::EngineConfig;
use bbtag::context::{BBTagContext, BBTagContextOptions, ContextMessage, SerializedContext};
use bbtag::engine::BBTagEngine;
use bbtag::error::EngineResult;
use bbtag::limits::{LimitKind, RuntimeLimit};
use bbtag::subtag::{Subtag, SubtagDefinition, SubtagType};
use bbtag::variables::VariableScope;

// ---- statement builders ---------------------------------------------------

pub fn lit(text: &str) -> StatementPart {
    StatementPart::Literal(text.to_string())
}

pub fn call(name: &str, args: &[&str]) -> StatementPart {
    StatementPart::Call(SubtagCall::new(
        Statement::literal(name),
        args.iter().copied().map(Statement::literal).collect(),
        SourceRange::default(),
    ))
}

pub fn call_with(name: &str, args: Vec<Statement>) -> StatementPart {
    StatementPart::Call(SubtagCall::new(
        Statement::literal(name),
        args,
        SourceRange::default(),
    ))
}

/// A call whose name is itself a statement (computed dispatch).
pub fn call_named(name: Statement, args: Vec<Statement>) -> StatementPart {
    StatementPart::Call(SubtagCall::new(name, args, SourceRange::default()))
}

/// A statement that is exactly one zero-argument call.
pub fn call_statement(name: &str) -> Statement {
    Statement::from(SubtagCall::new(
        Statement::literal(name),
        Vec::new(),
        SourceRange::default(),
    ))
}

pub fn stmt(parts: Vec<StatementPart>) -> Statement {
    Statement::new(parts)
}

// ---- collaborator fakes ---------------------------------------------------

pub struct RecordedLookup {
    pub query: String,
    pub quiet: bool,
    pub suppress: bool,
}

#[derive(Default)]
pub struct MockUtilities {
    pub staff: Mutex<Vec<String>>,
    pub users: Mutex<Vec<UserRef>>,
    pub roles: Mutex<Vec<RoleRef>>,
    pub channels: Mutex<Vec<ChannelRef>>,
    pub members: Mutex<Vec<MemberRef>>,
    pub lookups: Mutex<Vec<RecordedLookup>>,
    pub sent: Mutex<Vec<(String, SendContent)>>,
    pub reactions: Mutex<Vec<(String, String, Vec<String>)>>,
    next_message_id: AtomicUsize,
}

impl MockUtilities {
    fn record(&self, query: &str, options: &LookupOptions) {
        self.lookups.lock().unwrap().push(RecordedLookup {
            query: query.to_string(),
            quiet: options.quiet,
            suppress: options.suppress,
        });
    }
}

#[async_trait]
impl BBTagUtilities for MockUtilities {
    async fn is_user_staff(&self, user_id: &str, _guild_id: &str) -> Result<bool, UtilityError> {
        Ok(self.staff.lock().unwrap().iter().any(|id| id == user_id))
    }

    async fn find_user(
        &self,
        _guild_id: &str,
        query: &str,
        options: &LookupOptions,
    ) -> Result<LookupResult<UserRef>, UtilityError> {
        self.record(query, options);
        let entity = self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|user| user.id == query || user.username == query)
            .cloned();
        Ok(LookupResult {
            entity,
            prompted: !options.suppress,
        })
    }

    async fn find_role(
        &self,
        _guild_id: &str,
        query: &str,
        options: &LookupOptions,
    ) -> Result<LookupResult<RoleRef>, UtilityError> {
        self.record(query, options);
        let entity = self
            .roles
            .lock()
            .unwrap()
            .iter()
            .find(|role| role.id == query || role.name == query)
            .cloned();
        Ok(LookupResult {
            entity,
            prompted: !options.suppress,
        })
    }

    async fn find_channel(
        &self,
        _guild_id: &str,
        query: &str,
        options: &LookupOptions,
    ) -> Result<LookupResult<ChannelRef>, UtilityError> {
        self.record(query, options);
        let entity = self
            .channels
            .lock()
            .unwrap()
            .iter()
            .find(|channel| channel.id == query || channel.name == query)
            .cloned();
        Ok(LookupResult {
            entity,
            prompted: !options.suppress,
        })
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserRef>, UtilityError> {
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .find(|user| user.id == user_id)
            .cloned())
    }

    async fn get_role_by_id(
        &self,
        _guild_id: &str,
        role_id: &str,
    ) -> Result<Option<RoleRef>, UtilityError> {
        Ok(self
            .roles
            .lock()
            .unwrap()
            .iter()
            .find(|role| role.id == role_id)
            .cloned())
    }

    async fn get_channel_by_id(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelRef>, UtilityError> {
        Ok(self
            .channels
            .lock()
            .unwrap()
            .iter()
            .find(|channel| channel.id == channel_id)
            .cloned())
    }

    async fn get_member(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRef>, UtilityError> {
        Ok(self
            .members
            .lock()
            .unwrap()
            .iter()
            .find(|member| member.guild_id == guild_id && member.id == user_id)
            .cloned())
    }

    async fn send(
        &self,
        channel_id: &str,
        content: SendContent,
    ) -> Result<Option<MessageRef>, UtilityError> {
        if content.content.is_empty() && content.embeds.is_empty() && content.file.is_none() {
            return Ok(None);
        }
        let id = format!("m{}", self.next_message_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.sent
            .lock()
            .unwrap()
            .push((channel_id.to_string(), content));
        Ok(Some(MessageRef {
            id,
            channel_id: channel_id.to_string(),
        }))
    }

    async fn add_reactions(
        &self,
        channel_id: &str,
        message_id: &str,
        reactions: &[String],
    ) -> Result<(), UtilityError> {
        self.reactions.lock().unwrap().push((
            channel_id.to_string(),
            message_id.to_string(),
            reactions.to_vec(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub values: Mutex<HashMap<(VariableScope, String, String), String>>,
}

#[async_trait]
impl TagVariableStore for MemoryStore {
    async fn get(
        &self,
        scope: VariableScope,
        owner: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(&(scope, owner.to_string(), name.to_string()))
            .cloned())
    }

    async fn set(
        &self,
        scope: VariableScope,
        owner: &str,
        name: &str,
        value: Option<String>,
    ) -> Result<(), StoreError> {
        let key = (scope, owner.to_string(), name.to_string());
        let mut values = self.values.lock().unwrap();
        match value {
            Some(value) => {
                values.insert(key, value);
            }
            None => {
                values.remove(&key);
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CaptureScheduler {
    pub scheduled: Mutex<Vec<(SerializedContext, Duration)>>,
}

#[async_trait]
impl ContinuationScheduler for CaptureScheduler {
    async fn schedule(
        &self,
        snapshot: SerializedContext,
        resume_after: Duration,
    ) -> Result<(), UtilityError> {
        self.scheduled.lock().unwrap().push((snapshot, resume_after));
        Ok(())
    }
}

// ---- test subtags ---------------------------------------------------------

pub fn make_subtag(name: &str, patterns: &[&str], body: Arc<dyn SignatureBody>) -> Subtag {
    Subtag::new(
        SubtagDefinition::new(name, SubtagType::Simple)
            .with_signature(SubtagSignature::new(patterns, body).unwrap()),
    )
    .unwrap()
}

fn concat_body<'a>(
    context: &'a BBTagContext,
    args: &'a [SubtagArgument],
    _call: &'a SubtagCall,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let mut out = String::new();
        for arg in args {
            out.push_str(arg.value(context).await?);
        }
        Ok(out)
    })
}

fn lower_body<'a>(
    context: &'a BBTagContext,
    args: &'a [SubtagArgument],
    _call: &'a SubtagCall,
) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(args[0].value(context).await?.to_lowercase()) })
}

fn error_body<'a>(
    context: &'a BBTagContext,
    args: &'a [SubtagArgument],
    call: &'a SubtagCall,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let message = args[0].value(context).await?.to_string();
        Ok(context.add_error(message, Some(call), None))
    })
}

fn fallback_body<'a>(
    context: &'a BBTagContext,
    args: &'a [SubtagArgument],
    _call: &'a SubtagCall,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let value = args[0].value(context).await?.to_string();
        context.modify_scope(|scope| scope.fallback = Some(value));
        Ok(String::new())
    })
}

fn greet_body<'a>(
    context: &'a BBTagContext,
    args: &'a [SubtagArgument],
    _call: &'a SubtagCall,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let name = args[0].value(context).await?.to_string();
        let greeting = args[1].value(context).await?;
        Ok(format!("{greeting} {name}"))
    })
}

fn get_body<'a>(
    context: &'a BBTagContext,
    args: &'a [SubtagArgument],
    _call: &'a SubtagCall,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let name = args[0].value(context).await?;
        Ok(context.get_variable(name).await?.unwrap_or_default())
    })
}

fn set_body<'a>(
    context: &'a BBTagContext,
    args: &'a [SubtagArgument],
    _call: &'a SubtagCall,
) -> HandlerFuture<'a> {
    Box::pin(async move {
        let name = args[0].value(context).await?.to_string();
        let value = args[1].value(context).await?.to_string();
        context.set_variable(&name, Some(value));
        Ok(String::new())
    })
}

/// Always returns the same output; stands in for effectful subtags in limit
/// tests.
pub struct StaticBody(pub String);

#[async_trait]
impl SignatureBody for StaticBody {
    async fn invoke(
        &self,
        _context: &BBTagContext,
        _args: &[SubtagArgument],
        _call: &SubtagCall,
    ) -> EngineResult<String> {
        Ok(self.0.clone())
    }
}

pub fn static_subtag(name: &str, output: &str) -> Subtag {
    // Accepts any argument count so it can stand in for arbitrary subtags.
    make_subtag(name, &["args?+"], Arc::new(StaticBody(output.to_string())))
}

pub fn deprecated_subtag(name: &str, output: &str) -> Subtag {
    Subtag::new(
        SubtagDefinition::new(name, SubtagType::Simple)
            .deprecated()
            .with_signature(
                SubtagSignature::new(&["args?+"], Arc::new(StaticBody(output.to_string())))
                    .unwrap(),
            ),
    )
    .unwrap()
}

/// Side-effecting counter; each evaluation returns the new count.
pub struct CountBody(pub Arc<AtomicUsize>);

#[async_trait]
impl SignatureBody for CountBody {
    async fn invoke(
        &self,
        _context: &BBTagContext,
        _args: &[SubtagArgument],
        _call: &SubtagCall,
    ) -> EngineResult<String> {
        Ok((self.0.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    }
}

/// Reads its single argument twice and concatenates both reads.
pub struct DoubleReadBody;

#[async_trait]
impl SignatureBody for DoubleReadBody {
    async fn invoke(
        &self,
        context: &BBTagContext,
        args: &[SubtagArgument],
        _call: &SubtagCall,
    ) -> EngineResult<String> {
        let first = args[0].value(context).await?.to_string();
        let second = args[0].value(context).await?;
        Ok(format!("{first}{second}"))
    }
}

/// Calls itself forever; exercises the stack-depth ceiling.
pub struct RecurseBody;

#[async_trait]
impl SignatureBody for RecurseBody {
    async fn invoke(
        &self,
        context: &BBTagContext,
        _args: &[SubtagArgument],
        _call: &SubtagCall,
    ) -> EngineResult<String> {
        let again = Statement::from(SubtagCall::new(
            Statement::literal("recurse"),
            Vec::new(),
            SourceRange::default(),
        ));
        context.eval(again).await
    }
}

/// The subtags most tests share.
pub fn standard_registry() -> InMemorySubtagRegistry {
    let mut registry = InMemorySubtagRegistry::new();
    registry.register(make_subtag(
        "concat",
        &["values+"],
        Arc::new(FnSignatureBody(concat_body)),
    ));
    registry.register(make_subtag(
        "lower",
        &["text"],
        Arc::new(FnSignatureBody(lower_body)),
    ));
    registry.register(make_subtag(
        "error",
        &["message?:Test error"],
        Arc::new(FnSignatureBody(error_body)),
    ));
    registry.register(make_subtag(
        "fallback",
        &["value"],
        Arc::new(FnSignatureBody(fallback_body)),
    ));
    registry.register(make_subtag(
        "greet",
        &["name", "greeting?:hello"],
        Arc::new(FnSignatureBody(greet_body)),
    ));
    registry.register(make_subtag(
        "get",
        &["name"],
        Arc::new(FnSignatureBody(get_body)),
    ));
    registry.register(make_subtag(
        "set",
        &["name", "value"],
        Arc::new(FnSignatureBody(set_body)),
    ));
    registry
}

// ---- hosts and contexts ---------------------------------------------------

pub struct Host {
    pub engine: Arc<BBTagEngine>,
    pub util: Arc<MockUtilities>,
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<CaptureScheduler>,
}

pub fn guild_channel() -> ChannelRef {
    ChannelRef {
        id: "c1".to_string(),
        guild_id: Some("g1".to_string()),
        name: "general".to_string(),
        textable: true,
    }
}

pub fn guild_member() -> MemberRef {
    MemberRef {
        id: "u1".to_string(),
        guild_id: "g1".to_string(),
        display_name: "tester".to_string(),
    }
}

pub fn message() -> ContextMessage {
    ContextMessage {
        id: "m0".to_string(),
        channel: guild_channel(),
        member: guild_member(),
        ..Default::default()
    }
}

pub fn options(kind: LimitKind) -> BBTagContextOptions {
    let mut options = BBTagContextOptions::new(message(), "u1", RuntimeLimit::new(kind));
    options.is_cc = kind == LimitKind::CustomCommandLimit;
    options.root_tag_name = Some("testtag".to_string());
    options
}

pub fn host(registry: InMemorySubtagRegistry) -> Host {
    host_with_config(EngineConfig::default(), registry)
}

fn init_tracing() {
    static INIT: std::sync::OnceLock<()> = std::sync::OnceLock::new();
    INIT.get_or_init(|| {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

pub fn host_with_config(config: EngineConfig, registry: InMemorySubtagRegistry) -> Host {
    init_tracing();
    let util = Arc::new(MockUtilities::default());
    util.users.lock().unwrap().push(UserRef {
        id: "u1".to_string(),
        username: "tester".to_string(),
    });
    util.channels.lock().unwrap().push(guild_channel());
    util.members.lock().unwrap().push(guild_member());
    let store = Arc::new(MemoryStore::default());
    let scheduler = Arc::new(CaptureScheduler::default());
    let engine = Arc::new(
        BBTagEngine::new(config, util.clone(), store.clone(), Arc::new(registry))
            .with_scheduler(scheduler.clone()),
    );
    Host {
        engine,
        util,
        store,
        scheduler,
    }
}
