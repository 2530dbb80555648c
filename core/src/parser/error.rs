use ecow::EcoString;

use crate::parser::{Rule, Span, line_col};

/// Parser error with position information.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    /// Name of the template being parsed.
    pub name: EcoString,
    pub kind: ParseErrorKind,
    pub span: Span,
    /// 1-based line of `span.start`.
    pub line: usize,
    /// 1-based column of `span.start`.
    pub column: usize,
    /// The template source, kept for diagnostics rendering.
    pub src: EcoString,
}

/// Specific kinds of parse errors
#[derive(Debug, Clone, PartialEq)]
pub enum ParseErrorKind {
    /// Unexpected token
    UnexpectedToken { expected: String, found: String },
    /// `ELSIF`, `ELSE` or `END` with no block to attach to.
    Misplaced { tag: &'static str, message: String },
    /// A block still open at the end of the template.
    Unclosed { block: &'static str },
    /// Invalid number literal
    InvalidNumber { text: String },
    /// Other parse errors (catch-all for Pest errors we don't specifically handle)
    Other { message: String },
}

impl ParseErrorKind {
    pub fn other(message: impl Into<String>) -> Self {
        ParseErrorKind::Other {
            message: message.into(),
        }
    }

    pub fn message(&self) -> String {
        match self {
            ParseErrorKind::UnexpectedToken { expected, found } => {
                format!("expected {}, found {}", expected, found)
            }
            ParseErrorKind::Misplaced { message, .. } => message.clone(),
            ParseErrorKind::Unclosed { block } => {
                format!("{} block is never closed with END", block)
            }
            ParseErrorKind::InvalidNumber { text } => format!("invalid number literal '{}'", text),
            ParseErrorKind::Other { message } => message.clone(),
        }
    }
}

impl ParseError {
    pub fn new(name: &str, source: &str, span: Span, kind: ParseErrorKind) -> Self {
        let (line, column) = line_col(source, span.0.start);
        Self {
            name: name.into(),
            kind,
            span,
            line,
            column,
            src: source.into(),
        }
    }

    /// Convert a Pest error into a human-readable ParseError.
    pub fn from_pest(name: &str, source: &str, err: pest::error::Error<Rule>) -> Self {
        use pest::error::ErrorVariant;

        let span = match err.location {
            pest::error::InputLocation::Pos(pos) => Span(pos..pos),
            pest::error::InputLocation::Span((start, end)) => Span(start..end),
        };

        let kind = match err.variant {
            ErrorVariant::ParsingError {
                positives,
                negatives,
            } => ParseErrorKind::UnexpectedToken {
                expected: format_expected_rules(&positives),
                found: found_at(source, span.0.start, &negatives),
            },
            ErrorVariant::CustomError { message } => ParseErrorKind::Other { message },
        };

        ParseError::new(name, source, span, kind)
    }
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}",
            self.name,
            self.line,
            self.column,
            self.kind.message()
        )
    }
}

impl std::error::Error for ParseError {}

/// Format expected rules in a human-readable way
fn format_expected_rules(rules: &[Rule]) -> String {
    let mut concepts: Vec<&str> = Vec::new();

    for rule in rules {
        let concept = match rule {
            Rule::int | Rule::float | Rule::string | Rule::true_lit | Rule::false_lit => "literal",
            Rule::ident => "identifier",
            Rule::field_name => "field name",
            Rule::EOI => "end of input",
            Rule::tag | Rule::text | Rule::comment => "template text or tag",
            Rule::kw_block => "BLOCK",
            Rule::kw_in => "IN",
            Rule::or
            | Rule::and
            | Rule::eq
            | Rule::ne
            | Rule::lt
            | Rule::le
            | Rule::gt
            | Rule::ge
            | Rule::concat
            | Rule::add
            | Rule::sub
            | Rule::mul
            | Rule::div
            | Rule::modulo => "operator",
            _ => "expression",
        };
        if !concepts.contains(&concept) {
            concepts.push(concept);
        }
    }

    match concepts.split_last() {
        None => "something else".to_string(),
        Some((only, [])) => only.to_string(),
        Some((last, rest)) => format!("{} or {}", rest.join(", "), last),
    }
}

/// Describe what sits at the error position.
fn found_at(source: &str, pos: usize, negatives: &[Rule]) -> String {
    if let Some(rule) = negatives.first() {
        return format!("{:?}", rule);
    }
    let rest = source.get(pos..).unwrap_or_default();
    if rest.is_empty() {
        return "end of input".to_string();
    }
    if rest.starts_with("%]") {
        return "'%]'".to_string();
    }
    let token: String = rest
        .chars()
        .take_while(|c| !c.is_whitespace())
        .take(12)
        .collect();
    format!("'{}'", token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_position() {
        let error = ParseError::new(
            "page.tx",
            "line one\n  [% oops",
            Span(11..13),
            ParseErrorKind::other("bad tag"),
        );
        assert_eq!(error.to_string(), "page.tx:2:3: bad tag");
    }

    #[test]
    fn test_format_expected_rules() {
        assert_eq!(format_expected_rules(&[Rule::int, Rule::float]), "literal");
        assert_eq!(
            format_expected_rules(&[Rule::ident, Rule::int, Rule::EOI]),
            "identifier, literal or end of input"
        );
        assert_eq!(format_expected_rules(&[]), "something else");
    }

    #[test]
    fn test_found_at() {
        assert_eq!(found_at("[% a %]", 5, &[]), "'%]'");
        assert_eq!(found_at("abc", 3, &[]), "end of input");
        assert_eq!(found_at("[% 1 + ; %]", 7, &[]), "';'");
    }
}
