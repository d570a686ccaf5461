//! Read-through, write-back cache over persistent tag variables.
//!
//! A variable key carries its scope as a leading sigil (`~tmp`, `*global`,
//! `@author`, `_guild`, plain for local). The sigil-to-scope table is
//! configuration ([`crate::config::EngineConfig::variable_scopes`]); the
//! cache derives an explicit [`VariableScope`] once per key and never
//! re-inspects the string afterwards.
//!
//! Writes are queued in the cache and flushed by `commit`; a miss is cached
//! too, so one key never costs more than one persistence fetch per
//! invocation. Temporary variables skip persistence entirely but are carried
//! in the suspension snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collaborators::TagVariableStore;
use crate::context::BBTagContext;
use crate::error::EngineResult;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum VariableScope {
    /// Never persisted; lives for one invocation (and its snapshot).
    Temporary,
    /// Shared across all guilds.
    Global,
    /// Shared across everything the tag author owns.
    Author,
    /// Shared across one guild's tags and custom commands.
    Guild,
    /// Private to one tag, or to one guild's custom commands.
    Local,
}

/// One row of the sigil-to-scope table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeDefinition {
    pub prefix: Option<char>,
    pub scope: VariableScope,
    pub description: String,
}

impl ScopeDefinition {
    pub fn new(prefix: Option<char>, scope: VariableScope, description: &str) -> Self {
        Self {
            prefix,
            scope,
            description: description.to_string(),
        }
    }
}

/// A key with its scope resolved. `key` is the full user-visible name
/// (sigil included); `name` is what the store is addressed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableReference {
    pub scope: VariableScope,
    pub key: String,
    pub name: String,
}

impl VariableReference {
    pub fn derive(key: &str, table: &[ScopeDefinition]) -> Self {
        for definition in table {
            if let Some(prefix) = definition.prefix {
                if let Some(name) = key.strip_prefix(prefix) {
                    return Self {
                        scope: definition.scope,
                        key: key.to_string(),
                        name: name.to_string(),
                    };
                }
            }
        }
        let scope = table
            .iter()
            .find(|definition| definition.prefix.is_none())
            .map(|definition| definition.scope)
            .unwrap_or(VariableScope::Local);
        Self {
            scope,
            key: key.to_string(),
            name: key.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    reference: VariableReference,
    value: Option<String>,
    dirty: bool,
}

/// Per-context variable cache over a shared persistent store.
pub struct VariableCache {
    entries: DashMap<String, CacheEntry>,
    store: Arc<dyn TagVariableStore>,
    table: Vec<ScopeDefinition>,
}

impl VariableCache {
    pub fn new(store: Arc<dyn TagVariableStore>, table: Vec<ScopeDefinition>) -> Self {
        Self {
            entries: DashMap::new(),
            store,
            table,
        }
    }

    /// Cached value, or a persistence fetch on first access. The fetch
    /// result is cached even when absent so repeated misses stay free.
    pub async fn get(&self, context: &BBTagContext, key: &str) -> EngineResult<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            return Ok(entry.value.clone());
        }
        let reference = VariableReference::derive(key, &self.table);
        let value = match reference.scope {
            VariableScope::Temporary => None,
            scope => {
                self.store
                    .get(scope, &context.variable_owner(scope), &reference.name)
                    .await?
            }
        };
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                reference,
                value: value.clone(),
                dirty: false,
            },
        );
        Ok(value)
    }

    /// Updates the cache and marks the entry dirty; never blocks on
    /// persistence.
    pub fn set(&self, key: &str, value: Option<String>) {
        let reference = VariableReference::derive(key, &self.table);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                reference,
                value,
                dirty: true,
            },
        );
    }

    /// Flushes every dirty, non-temporary entry to the store. Returns the
    /// number of committed writes.
    pub async fn commit(&self, context: &BBTagContext) -> EngineResult<usize> {
        // Snapshot first: holding DashMap guards across awaits risks
        // deadlocking against concurrent cache access.
        let dirty: Vec<(String, VariableReference, Option<String>)> = self
            .entries
            .iter()
            .filter(|entry| entry.dirty && entry.reference.scope != VariableScope::Temporary)
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.reference.clone(),
                    entry.value.clone(),
                )
            })
            .collect();

        let mut committed = 0usize;
        for (key, reference, value) in dirty {
            self.store
                .set(
                    reference.scope,
                    &context.variable_owner(reference.scope),
                    &reference.name,
                    value,
                )
                .await?;
            if let Some(mut entry) = self.entries.get_mut(&key) {
                entry.dirty = false;
            }
            committed += 1;
        }
        if committed > 0 {
            debug!(committed, "flushed tag variables");
        }
        Ok(committed)
    }

    /// Temporary-scope values for the suspension snapshot.
    pub fn temporaries(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .filter(|entry| entry.reference.scope == VariableScope::Temporary)
            .filter_map(|entry| {
                entry
                    .value
                    .clone()
                    .map(|value| (entry.key().clone(), value))
            })
            .collect()
    }

    /// Seeds a restored temporary variable without marking it dirty.
    pub fn restore_temporary(&self, key: &str, value: String) {
        let reference = VariableReference::derive(key, &self.table);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                reference,
                value: Some(value),
                dirty: false,
            },
        );
    }
}
