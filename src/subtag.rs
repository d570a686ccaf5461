//! Subtag declaration surface and the handler contract the engine dispatches
//! through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ast::SubtagCall;
use crate::compilation::{compile_signatures, CompiledHandler, SubtagSignature};
use crate::context::BBTagContext;
use crate::error::EngineResult;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum SubtagType {
    Simple,
    Complex,
    Array,
    Bot,
}

/// Anything dispatchable by name: a compiled subtag or a scoped override.
#[async_trait]
pub trait SubtagHandler: Send + Sync {
    async fn execute(
        &self,
        context: &BBTagContext,
        subtag_name: &str,
        call: &SubtagCall,
    ) -> EngineResult<String>;
}

/// The declarative surface consumed to build a dispatchable subtag.
pub struct SubtagDefinition {
    pub name: String,
    pub aliases: Vec<String>,
    pub category: SubtagType,
    pub description: String,
    pub deprecated: bool,
    pub staff_only: bool,
    pub signatures: Vec<SubtagSignature>,
}

impl SubtagDefinition {
    pub fn new(name: impl Into<String>, category: SubtagType) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            category,
            description: String::new(),
            deprecated: false,
            staff_only: false,
            signatures: Vec::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = true;
        self
    }

    pub fn staff_only(mut self) -> Self {
        self.staff_only = true;
        self
    }

    pub fn with_signature(mut self, signature: SubtagSignature) -> Self {
        self.signatures.push(signature);
        self
    }
}

/// A registered subtag: declaration metadata plus the compiled dispatcher.
pub struct Subtag {
    pub name: String,
    pub aliases: Vec<String>,
    pub category: SubtagType,
    pub description: String,
    pub deprecated: bool,
    pub staff_only: bool,
    handler: CompiledHandler,
}

impl Subtag {
    pub fn new(definition: SubtagDefinition) -> EngineResult<Self> {
        let handler = compile_signatures(definition.signatures)?;
        Ok(Self {
            name: definition.name,
            aliases: definition.aliases,
            category: definition.category,
            description: definition.description,
            deprecated: definition.deprecated,
            staff_only: definition.staff_only,
            handler,
        })
    }

    pub fn signatures(&self) -> &[SubtagSignature] {
        self.handler.signatures()
    }
}

#[async_trait]
impl SubtagHandler for Subtag {
    async fn execute(
        &self,
        context: &BBTagContext,
        subtag_name: &str,
        call: &SubtagCall,
    ) -> EngineResult<String> {
        self.handler.execute(context, subtag_name, call).await
    }
}
