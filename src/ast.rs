//! The parsed-program representation executed by the engine.
//!
//! A [`Statement`] is the immutable output of the upstream bracket lexer: an
//! ordered sequence of literal text fragments and nested [`SubtagCall`]s.
//! Statements are parsed once per tag source and re-executed freely; all
//! mutable evaluation state lives on the context, never on the tree.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Byte range of a node within the original tag source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start: usize,
    pub end: usize,
}

impl SourceRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// One node of a parsed tag: literal text or a nested subtag call.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementPart {
    Literal(String),
    Call(SubtagCall),
}

/// An immutable, cheaply cloneable sequence of [`StatementPart`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    parts: Arc<Vec<StatementPart>>,
}

impl Statement {
    pub fn new(parts: Vec<StatementPart>) -> Self {
        Self {
            parts: Arc::new(parts),
        }
    }

    /// A statement consisting of a single literal fragment.
    pub fn literal(text: impl Into<String>) -> Self {
        Self::new(vec![StatementPart::Literal(text.into())])
    }

    pub fn parts(&self) -> &[StatementPart] {
        &self.parts
    }

    /// Returns the concatenated text when no part is a subtag call.
    pub fn as_literal(&self) -> Option<String> {
        let mut out = String::new();
        for part in self.parts.iter() {
            match part {
                StatementPart::Literal(text) => out.push_str(text),
                StatementPart::Call(_) => return None,
            }
        }
        Some(out)
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

impl From<SubtagCall> for Statement {
    fn from(call: SubtagCall) -> Self {
        Self::new(vec![StatementPart::Call(call)])
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in self.parts.iter() {
            match part {
                StatementPart::Literal(text) => f.write_str(text)?,
                StatementPart::Call(call) => write!(f, "{}", call)?,
            }
        }
        Ok(())
    }
}

/// A single `{name;arg;...}` invocation inside a statement.
///
/// The name is itself a [`Statement`] because subtag names may be computed
/// dynamically, so dispatch happens only after the name evaluates.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtagCall {
    pub name: Statement,
    pub args: Vec<Statement>,
    pub range: SourceRange,
}

impl SubtagCall {
    pub fn new(name: Statement, args: Vec<Statement>, range: SourceRange) -> Self {
        Self { name, args, range }
    }
}

impl fmt::Display for SubtagCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}", self.name)?;
        for arg in &self.args {
            write!(f, ";{}", arg)?;
        }
        write!(f, "}}")
    }
}
