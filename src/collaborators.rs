//! External collaborator contracts consumed by the engine.
//!
//! The engine never talks to Discord, persistent storage, or a scheduler
//! directly; it goes through these async traits so hosts (and tests) can
//! supply their own implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::SerializedContext;
use crate::subtag::Subtag;
use crate::variables::VariableScope;
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: String,
    pub guild_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub guild_id: Option<String>,
    pub name: String,
    pub textable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRef {
    pub id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Mentions the delivered output is allowed to resolve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowedMentions {
    pub users: Vec<String>,
    pub roles: Vec<String>,
    pub everybody: bool,
}

/// A file attached to the produced output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileContent {
    pub name: String,
    pub content: String,
}

/// The fully assembled output of one invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendContent {
    pub content: String,
    pub embeds: Vec<serde_json::Value>,
    pub file: Option<FileContent>,
    pub nsfw_message: Option<String>,
    pub allowed_mentions: AllowedMentions,
}

/// Options forwarded to fuzzy entity lookups.
#[derive(Debug, Clone, Default)]
pub struct LookupOptions {
    /// Suppresses "not found" replies.
    pub quiet: bool,
    /// Suppresses interactive disambiguation prompts.
    pub suppress: bool,
    /// Label shown in prompts, e.g. the subtag asking.
    pub label: Option<String>,
}

/// Outcome of a fuzzy lookup. `prompted` reports whether the collaborator
/// sent an interactive prompt, which counts against the context's query
/// budget.
#[derive(Debug, Clone, Default)]
pub struct LookupResult<T> {
    pub entity: Option<T>,
    pub prompted: bool,
}

#[derive(Debug, Error)]
pub enum UtilityError {
    #[error("entity service unavailable: {0}")]
    Unavailable(String),
    #[error("failed to send output: {0}")]
    SendFailed(String),
    #[error("scheduler rejected the continuation: {0}")]
    ScheduleFailed(String),
}

/// Discord-domain services: entity resolution, staff checks, and output
/// delivery. Resolution by name is fuzzy and may prompt the invoking user.
#[async_trait]
pub trait BBTagUtilities: Send + Sync {
    async fn is_user_staff(&self, user_id: &str, guild_id: &str) -> Result<bool, UtilityError>;

    async fn find_user(
        &self,
        guild_id: &str,
        query: &str,
        options: &LookupOptions,
    ) -> Result<LookupResult<UserRef>, UtilityError>;

    async fn find_role(
        &self,
        guild_id: &str,
        query: &str,
        options: &LookupOptions,
    ) -> Result<LookupResult<RoleRef>, UtilityError>;

    async fn find_channel(
        &self,
        guild_id: &str,
        query: &str,
        options: &LookupOptions,
    ) -> Result<LookupResult<ChannelRef>, UtilityError>;

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserRef>, UtilityError>;

    async fn get_role_by_id(
        &self,
        guild_id: &str,
        role_id: &str,
    ) -> Result<Option<RoleRef>, UtilityError>;

    async fn get_channel_by_id(&self, channel_id: &str)
        -> Result<Option<ChannelRef>, UtilityError>;

    async fn get_member(
        &self,
        guild_id: &str,
        user_id: &str,
    ) -> Result<Option<MemberRef>, UtilityError>;

    /// Delivers the invocation output. `Ok(None)` means there was nothing to
    /// send, which is not an error; any other failure is fatal.
    async fn send(
        &self,
        channel_id: &str,
        content: SendContent,
    ) -> Result<Option<MessageRef>, UtilityError>;

    async fn add_reactions(
        &self,
        channel_id: &str,
        message_id: &str,
        reactions: &[String],
    ) -> Result<(), UtilityError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("variable store unreachable: {0}")]
    Unreachable(String),
    #[error("variable write rejected: {0}")]
    WriteRejected(String),
}

/// Persistent tag-variable storage, addressed by scope and owner.
#[async_trait]
pub trait TagVariableStore: Send + Sync {
    async fn get(
        &self,
        scope: VariableScope,
        owner: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn set(
        &self,
        scope: VariableScope,
        owner: &str,
        name: &str,
        value: Option<String>,
    ) -> Result<(), StoreError>;
}

/// Registered subtag lookup by exact name or alias.
pub trait SubtagRegistry: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<Subtag>>;
    fn list(&self) -> Vec<Arc<Subtag>>;
}

/// In-memory registry indexing subtags by name and alias.
#[derive(Default)]
pub struct InMemorySubtagRegistry {
    subtags: Vec<Arc<Subtag>>,
    index: std::collections::HashMap<String, Arc<Subtag>>,
}

impl InMemorySubtagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subtag: Subtag) {
        let subtag = Arc::new(subtag);
        self.index
            .insert(subtag.name.to_lowercase(), subtag.clone());
        for alias in &subtag.aliases {
            self.index.insert(alias.to_lowercase(), subtag.clone());
        }
        self.subtags.push(subtag);
    }
}

impl SubtagRegistry for InMemorySubtagRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<Subtag>> {
        self.index.get(&name.to_lowercase()).cloned()
    }

    fn list(&self) -> Vec<Arc<Subtag>> {
        self.subtags.clone()
    }
}

/// Persistent scheduler used to resume a suspended invocation, possibly in
/// another process.
#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    async fn schedule(
        &self,
        snapshot: SerializedContext,
        resume_after: Duration,
    ) -> Result<(), UtilityError>;
}
