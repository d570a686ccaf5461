//! BBTag execution engine.
//!
//! A tree-walking interpreter for user-authored `{subtag;...}` templates.
//! A parsed [`ast::Statement`] is executed against a per-invocation
//! [`context::BBTagContext`]; subtags receive their arguments lazily and
//! evaluate them on demand, so unvisited branches cost nothing. User-facing
//! failures are recorded as non-fatal errors and evaluation continues;
//! only collaborator and infrastructure failures abort an invocation.
//!
//! The engine owns no I/O: entity lookups, output delivery, variable
//! persistence, and continuation scheduling are [`collaborators`] traits the
//! host implements. An invocation can be suspended into a
//! [`context::SerializedContext`] snapshot and resumed later, in another
//! process if the host wants.

pub mod arguments;
pub mod ast;
pub mod collaborators;
pub mod compilation;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod flags;
pub mod limits;
pub mod scope;
pub mod subtag;
pub mod variables;

pub use ast::{SourceRange, Statement, StatementPart, SubtagCall};
pub use config::EngineConfig;
pub use context::{BBTagContext, BBTagContextOptions, SerializedContext};
pub use engine::{BBTagEngine, ExecutionResult};
pub use error::{EngineResult, Error};
pub use limits::{LimitKind, RuntimeLimit};
pub use subtag::{Subtag, SubtagDefinition, SubtagType};
