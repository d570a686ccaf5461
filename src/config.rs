use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::variables::{ScopeDefinition, VariableScope};

/// Engine-wide configuration. Per-invocation ceilings live on the
/// [`RuntimeLimit`](crate::limits::RuntimeLimit) instead; these are the
/// structural bounds every invocation shares.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Subtag nesting depth after which evaluation is terminated.
    #[serde(default = "default_max_stack_depth")]
    pub max_stack_depth: usize,

    /// Interactive entity lookups allowed before further lookups are forced
    /// into quiet/suppressed mode.
    #[serde(default = "default_max_lookup_queries")]
    pub max_lookup_queries: usize,

    /// Hard cap applied to the sleep construct irrespective of the requested
    /// duration.
    #[serde(default = "default_max_sleep", with = "duration_ms")]
    pub max_sleep: Duration,

    /// Sigil-to-scope table consulted by the variable cache.
    #[serde(default = "default_variable_scopes")]
    pub variable_scopes: Vec<ScopeDefinition>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: default_max_stack_depth(),
            max_lookup_queries: default_max_lookup_queries(),
            max_sleep: default_max_sleep(),
            variable_scopes: default_variable_scopes(),
        }
    }
}

fn default_max_stack_depth() -> usize {
    200
}

fn default_max_lookup_queries() -> usize {
    5
}

fn default_max_sleep() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_variable_scopes() -> Vec<ScopeDefinition> {
    vec![
        ScopeDefinition::new(
            Some('~'),
            VariableScope::Temporary,
            "discarded after the invocation; survives suspension snapshots",
        ),
        ScopeDefinition::new(Some('*'), VariableScope::Global, "shared across all guilds"),
        ScopeDefinition::new(
            Some('@'),
            VariableScope::Author,
            "shared across everything the author owns",
        ),
        ScopeDefinition::new(
            Some('_'),
            VariableScope::Guild,
            "shared across the guild's tags and custom commands",
        ),
        ScopeDefinition::new(
            None,
            VariableScope::Local,
            "private to this tag (or this guild's custom commands)",
        ),
    ]
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
