//! Signature compilation and call-time dispatch.
//!
//! A subtag declares overloads as parameter-pattern strings (`text`,
//! `count?:1`, `values+`) plus a body per overload. Compilation turns the
//! declaration into one dispatchable unit that selects an overload by
//! argument count, injects literal defaults for omitted optionals, and
//! routes count mismatches to the non-fatal error channel, so a body never
//! sees an out-of-range argument count.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::arguments::SubtagArgument;
use crate::ast::SubtagCall;
use crate::context::BBTagContext;
use crate::error::EngineResult;

#[derive(Debug, Error, PartialEq)]
pub enum CompilationError {
    #[error("empty parameter name in pattern {pattern:?}")]
    EmptyParameterName { pattern: String },
    #[error("variadic parameter {name:?} must be last in its signature")]
    VariadicNotLast { name: String },
    #[error("subtag declares no signatures")]
    NoSignatures,
}

/// One declared parameter, parsed from its pattern string.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtagParameter {
    pub name: String,
    pub required: bool,
    pub default: Option<String>,
    /// Trailing `+`: consumes all remaining arguments.
    pub rest: bool,
}

impl SubtagParameter {
    /// Grammar: `name` required, `name?` optional, `name?:default` optional
    /// with a literal default; a trailing `+` makes the parameter variadic.
    pub fn parse(pattern: &str) -> Result<Self, CompilationError> {
        let (body, rest) = match pattern.strip_suffix('+') {
            Some(body) => (body, true),
            None => (pattern, false),
        };
        let (name, required, default) = match body.split_once('?') {
            None => (body, true, None),
            Some((name, "")) => (name, false, None),
            Some((name, tail)) => {
                let default = tail
                    .strip_prefix(':')
                    .ok_or_else(|| CompilationError::EmptyParameterName {
                        pattern: pattern.to_string(),
                    })?;
                (name, false, Some(default.to_string()))
            }
        };
        if name.is_empty() {
            return Err(CompilationError::EmptyParameterName {
                pattern: pattern.to_string(),
            });
        }
        Ok(Self {
            name: name.to_string(),
            required,
            default,
            rest,
        })
    }
}

/// The body of one overload.
#[async_trait]
pub trait SignatureBody: Send + Sync {
    async fn invoke(
        &self,
        context: &BBTagContext,
        args: &[SubtagArgument],
        call: &SubtagCall,
    ) -> EngineResult<String>;
}

/// A [`SignatureBody`] backed by a plain function or closure returning a
/// boxed future, for call sites that don't want a named type.
pub struct FnSignatureBody<F>(pub F);

pub type HandlerFuture<'a> =
    std::pin::Pin<Box<dyn std::future::Future<Output = EngineResult<String>> + Send + 'a>>;

#[async_trait]
impl<F> SignatureBody for FnSignatureBody<F>
where
    F: for<'a> Fn(&'a BBTagContext, &'a [SubtagArgument], &'a SubtagCall) -> HandlerFuture<'a>
        + Send
        + Sync,
{
    async fn invoke(
        &self,
        context: &BBTagContext,
        args: &[SubtagArgument],
        call: &SubtagCall,
    ) -> EngineResult<String> {
        (self.0)(context, args, call).await
    }
}

/// One declared overload: parameters, documentation, and a body.
#[derive(Clone)]
pub struct SubtagSignature {
    pub parameters: Vec<SubtagParameter>,
    pub description: String,
    pub example_code: String,
    pub example_out: String,
    pub body: Arc<dyn SignatureBody>,
}

impl SubtagSignature {
    pub fn new(
        patterns: &[&str],
        body: Arc<dyn SignatureBody>,
    ) -> Result<Self, CompilationError> {
        let parameters = patterns
            .iter()
            .map(|pattern| SubtagParameter::parse(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(position) = parameters.iter().position(|p| p.rest) {
            if position + 1 != parameters.len() {
                return Err(CompilationError::VariadicNotLast {
                    name: parameters[position].name.clone(),
                });
            }
        }
        Ok(Self {
            parameters,
            description: String::new(),
            example_code: String::new(),
            example_out: String::new(),
            body,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_example(
        mut self,
        code: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        self.example_code = code.into();
        self.example_out = output.into();
        self
    }

    /// Inclusive argument-count range this overload accepts.
    fn arg_range(&self) -> (usize, Option<usize>) {
        let min = self.parameters.iter().filter(|p| p.required).count();
        let max = if self.parameters.iter().any(|p| p.rest) {
            None
        } else {
            Some(self.parameters.len())
        };
        (min, max)
    }

    fn accepts(&self, count: usize) -> bool {
        let (min, max) = self.arg_range();
        count >= min && max.map_or(true, |max| count <= max)
    }

    /// Pairs the call's argument statements with declared parameters.
    /// Omitted defaulted optionals become pre-resolved literal arguments, so
    /// bodies treat all parameters uniformly; argument identity is preserved
    /// for lazy evaluation.
    fn bind(&self, call: &SubtagCall) -> Vec<SubtagArgument> {
        let provided = call.args.len();
        let mut bound = Vec::with_capacity(provided.max(self.parameters.len()));
        let mut next = 0usize;
        for parameter in &self.parameters {
            if parameter.rest {
                while next < provided {
                    bound.push(SubtagArgument::deferred(call.args[next].clone()));
                    next += 1;
                }
            } else if next < provided {
                bound.push(SubtagArgument::deferred(call.args[next].clone()));
                next += 1;
            } else if let Some(default) = &parameter.default {
                bound.push(SubtagArgument::literal(default.clone()));
            }
        }
        bound
    }
}

/// All overloads of one subtag compiled into a single dispatcher.
#[derive(Clone)]
pub struct CompiledHandler {
    signatures: Vec<SubtagSignature>,
    min_args: usize,
}

pub fn compile_signatures(
    signatures: Vec<SubtagSignature>,
) -> Result<CompiledHandler, CompilationError> {
    if signatures.is_empty() {
        return Err(CompilationError::NoSignatures);
    }
    let min_args = signatures
        .iter()
        .map(|signature| signature.arg_range().0)
        .min()
        .unwrap_or(0);
    Ok(CompiledHandler {
        signatures,
        min_args,
    })
}

impl CompiledHandler {
    pub fn signatures(&self) -> &[SubtagSignature] {
        &self.signatures
    }

    /// Overload resolution: the first signature (declaration order) whose
    /// argument-count range contains the call's count wins. No match routes
    /// to the too-few/too-many default through the non-fatal error channel.
    pub async fn execute(
        &self,
        context: &BBTagContext,
        _subtag_name: &str,
        call: &SubtagCall,
    ) -> EngineResult<String> {
        let count = call.args.len();
        let Some(signature) = self
            .signatures
            .iter()
            .find(|signature| signature.accepts(count))
        else {
            let message = if count < self.min_args {
                "Not enough arguments"
            } else {
                "Too many arguments"
            };
            return Ok(context.add_error(message, Some(call), None));
        };
        let args = signature.bind(call);
        signature.body.invoke(context, &args, call).await
    }
}
