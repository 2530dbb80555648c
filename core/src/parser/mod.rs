mod ast;
pub mod error;
#[allow(clippy::module_inception)]
pub mod parser;
mod syntax;

// Re-export the parser and rule enum for external use
pub use parser::Rule;
pub use parser::TTerseGrammar;
pub use parser::parse;

pub use ast::{Expr, Literal, Node, Template};
pub use error::{ParseError, ParseErrorKind};
pub use syntax::{BinaryOp, BoolOp, Span, UnaryOp, line_col};

/// Turns template source into an AST.
///
/// Implementations must be shareable across threads: one parser instance
/// serves every load performed by a loader.
pub trait TemplateParser: Send + Sync {
    fn parse(&self, name: &str, source: &str) -> Result<Template, ParseError>;

    /// Name of the syntax this parser reads.
    fn syntax(&self) -> &str;
}

/// The TTerse-like syntax (`[% ... %]` tags).
#[derive(Debug, Clone, Copy, Default)]
pub struct TTerse;

impl TemplateParser for TTerse {
    fn parse(&self, name: &str, source: &str) -> Result<Template, ParseError> {
        parse(name, source)
    }

    fn syntax(&self) -> &str {
        "TTerse"
    }
}
