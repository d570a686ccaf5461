//! Per-invocation resource limits.
//!
//! A [`RuntimeLimit`] binds one invocation kind (stored tag vs custom
//! command) to an ordered rule table keyed by subtag name. The engine checks
//! the table before dispatching a call; the first failing rule's message is
//! reported through the non-fatal error channel instead of executing the
//! subtag. Counter state survives a serialize/load round trip so a resumed
//! invocation cannot reset its budget.

pub mod rules;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::context::BBTagContext;
use rules::{DisabledRule, LimitRule, RuleCheckError, StaffOnlyRule, UseCountRule};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "camelCase")]
pub enum LimitKind {
    TagLimit,
    CustomCommandLimit,
}

struct LimitBinding {
    /// Serialization key, e.g. `for:loops`. The part before `:` is the
    /// subtag name, the rest names a shared counter group.
    key: String,
    rule: Arc<dyn LimitRule>,
}

/// The rule table for one invocation.
pub struct RuntimeLimit {
    kind: LimitKind,
    scope_name: &'static str,
    bindings: Vec<LimitBinding>,
    index: HashMap<String, Vec<usize>>,
}

impl RuntimeLimit {
    pub fn new(kind: LimitKind) -> Self {
        match kind {
            LimitKind::TagLimit => tag_limit(),
            LimitKind::CustomCommandLimit => custom_command_limit(),
        }
    }

    fn empty(kind: LimitKind, scope_name: &'static str) -> Self {
        Self {
            kind,
            scope_name,
            bindings: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn kind(&self) -> LimitKind {
        self.kind
    }

    /// Human-readable name of the invocation kind, used in error text.
    pub fn scope_name(&self) -> &'static str {
        self.scope_name
    }

    fn add_rule(mut self, keys: &[&str], rule: Arc<dyn LimitRule>) -> Self {
        for key in keys {
            let subtag = key.split(':').next().expect("split yields at least one");
            let position = self.bindings.len();
            self.bindings.push(LimitBinding {
                key: (*key).to_string(),
                rule: rule.clone(),
            });
            self.index
                .entry(subtag.to_string())
                .or_default()
                .push(position);
        }
        self
    }

    /// Runs all rules registered for `subtag_name` in order. The first
    /// failing rule wins; passing advances any counters the rules own.
    pub async fn check(
        &self,
        context: &BBTagContext,
        subtag_name: &str,
    ) -> Result<(), RuleCheckError> {
        let Some(positions) = self.index.get(subtag_name) else {
            return Ok(());
        };
        for &position in positions {
            self.bindings[position]
                .rule
                .check(context, subtag_name)
                .await
                .map_err(|error| match error {
                    RuleCheckError::Violation(message) => RuleCheckError::Violation(format!(
                        "{} in {}",
                        message, self.scope_name
                    )),
                    fatal => fatal,
                })?;
        }
        Ok(())
    }

    pub fn serialize(&self) -> SerializedRuntimeLimit {
        let mut counters = HashMap::new();
        for binding in &self.bindings {
            if let Some(state) = binding.rule.state() {
                counters.insert(binding.key.clone(), state);
            }
        }
        SerializedRuntimeLimit {
            kind: self.kind,
            counters,
        }
    }

    /// Restores counter state; configuration always comes from the preset.
    pub fn load(&self, serialized: &SerializedRuntimeLimit) {
        for binding in &self.bindings {
            if let Some(state) = serialized.counters.get(&binding.key) {
                binding.rule.load_state(state);
            }
        }
    }
}

/// Counter snapshot crossing process boundaries with the context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializedRuntimeLimit {
    pub kind: LimitKind,
    pub counters: HashMap<String, serde_json::Value>,
}

fn custom_command_limit() -> RuntimeLimit {
    let loop_budget = UseCountRule::named(10_000, "loops");
    RuntimeLimit::empty(LimitKind::CustomCommandLimit, "custom commands")
        .add_rule(
            &[
                "ban",
                "unban",
                "guildbans",
                "kick",
                "modlog",
                "pardon",
                "warn",
                "reason",
                "slowmode",
                "roleadd",
                "rolecreate",
                "roledelete",
                "rolemention",
                "roleremove",
                "rolesetmentionable",
                "rolesetperms",
                "rolesetposition",
                "guildseticon",
                "emojicreate",
                "emojidelete",
                "channelcreate",
                "channeldelete",
                "channeledit",
                "channelsetperms",
                "channelsetpos",
                "usersetnick",
            ],
            StaffOnlyRule::instance(),
        )
        .add_rule(&["dm"], StaffOnlyRule::instance())
        .add_rule(&["dm"], UseCountRule::new(1))
        .add_rule(&["send"], StaffOnlyRule::instance())
        .add_rule(&["send"], UseCountRule::new(10))
        .add_rule(&["edit"], UseCountRule::new(10))
        .add_rule(&["delete"], UseCountRule::new(11))
        .add_rule(&["reactremove"], UseCountRule::new(10))
        .add_rule(
            &["reactremove:requests"],
            UseCountRule::named(40, "requests"),
        )
        .add_rule(&["timer"], StaffOnlyRule::instance())
        .add_rule(&["timer"], UseCountRule::new(3))
        .add_rule(&["waitmessage"], UseCountRule::new(10))
        .add_rule(&["waitreaction"], UseCountRule::new(20))
        .add_rule(&["for:loops", "repeat:loops", "while:loops"], loop_budget)
        .add_rule(&["foreach:loops"], UseCountRule::named(100_000, "loops"))
        .add_rule(&["map:loops"], UseCountRule::named(100_000, "loops"))
        .add_rule(&["filter:loops"], UseCountRule::named(100_000, "loops"))
        .add_rule(&["dump"], UseCountRule::new(5))
}

fn tag_limit() -> RuntimeLimit {
    let loop_budget = UseCountRule::named(10_000, "loops");
    RuntimeLimit::empty(LimitKind::TagLimit, "tags")
        .add_rule(
            &[
                "ban",
                "unban",
                "guildbans",
                "kick",
                "modlog",
                "pardon",
                "warn",
                "reason",
                "slowmode",
                "roleadd",
                "rolecreate",
                "roledelete",
                "rolemention",
                "roleremove",
                "rolesetperms",
                "rolesetposition",
                "guildseticon",
                "emojicreate",
                "emojidelete",
                "channelsetperms",
                "channelsetpos",
                "dm",
                "timer",
            ],
            DisabledRule::instance(),
        )
        .add_rule(&["send"], UseCountRule::new(10))
        .add_rule(&["edit"], UseCountRule::new(10))
        .add_rule(&["delete"], UseCountRule::new(11))
        .add_rule(&["reactremove"], UseCountRule::new(10))
        .add_rule(
            &["reactremove:requests"],
            UseCountRule::named(40, "requests"),
        )
        .add_rule(&["waitmessage"], UseCountRule::new(10))
        .add_rule(&["waitreaction"], UseCountRule::new(20))
        .add_rule(&["for:loops", "repeat:loops", "while:loops"], loop_budget)
        .add_rule(&["foreach:loops"], UseCountRule::named(100_000, "loops"))
        .add_rule(&["map:loops"], UseCountRule::named(100_000, "loops"))
        .add_rule(&["filter:loops"], UseCountRule::named(100_000, "loops"))
        .add_rule(&["dump"], UseCountRule::new(5))
}
