//! Bytecode compilation errors.

use ecow::EcoString;

use crate::parser::{Span, line_col};

/// An error found while lowering a template to bytecode.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{name}:{line}:{column}: {kind}")]
pub struct CompileError {
    /// Name of the template being compiled.
    pub name: EcoString,
    /// Source text of the template, for rendering snippets.
    pub src: EcoString,
    pub kind: CompileErrorKind,
    pub span: Span,
    pub line: usize,
    pub column: usize,
}

/// Errors that can occur during bytecode compilation.
///
/// Besides the two semantic checks, these are resource limit errors that can
/// only occur with absurdly large templates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("unknown filter '{name}'")]
    UnknownFilter { name: EcoString },
    #[error("duplicate parameter '{param}' in macro '{name}'")]
    DuplicateParameter { name: EcoString, param: EcoString },
    #[error("too many constants (limit: ~4 billion)")]
    TooManyConstants,
    #[error("too many names (limit: ~4 billion)")]
    TooManyNames,
    #[error("program too large (limit: ~4 billion instructions)")]
    TooManyInstructions,
}

impl CompileError {
    pub fn new(name: &str, source: &str, span: Span, kind: CompileErrorKind) -> Self {
        let (line, column) = line_col(source, span.0.start);
        Self {
            name: name.into(),
            src: source.into(),
            kind,
            span,
            line,
            column,
        }
    }
}
