//! Error rendering using ariadne
//!
//! Syntax and compile errors are rendered with a snippet of the template
//! source and a label under the offending span. Other errors are printed as
//! a message followed by their chain of causes.

use std::io::Write;

use ariadne::{Color, Label, Report, ReportKind, Source};

use crate::{Error, RuntimeError};

/// Render an error with formatting to stderr
///
/// # Example
/// ```no_run
/// use xslate::{Engine, EngineOptions, Vars, render_error};
///
/// let engine = Engine::new(EngineOptions::default()).unwrap();
/// if let Err(e) = engine.render_string("[% IF x %]never closed", &Vars::new()) {
///     render_error(&e);
/// }
/// ```
pub fn render_error(error: &Error) {
    render_error_to_writer(error, &mut std::io::stderr(), true).ok();
}

/// Render an error to a specific writer
pub fn render_error_to(error: &Error, writer: &mut dyn Write) -> std::io::Result<()> {
    render_error_to_writer(error, writer, true)
}

/// Render an error to a String (useful for logs, web UIs, etc.)
pub fn render_error_to_string(error: &Error) -> String {
    let mut buf = Vec::new();
    render_error_to_writer(error, &mut buf, true).ok();
    String::from_utf8_lossy(&buf).to_string()
}

/// Render an error to a String without color codes (useful for tests)
pub fn render_error_to_string_no_color(error: &Error) -> String {
    let mut buf = Vec::new();
    render_error_to_writer(error, &mut buf, false).ok();
    String::from_utf8_lossy(&buf).to_string()
}

fn render_error_to_writer(
    error: &Error,
    writer: &mut dyn Write,
    use_color: bool,
) -> std::io::Result<()> {
    match error {
        Error::Syntax(e) => render_snippet(
            "syntax error",
            &e.name,
            &e.src,
            e.span.0.clone(),
            &e.kind.message(),
            writer,
            use_color,
        ),
        Error::Compile(e) => render_snippet(
            "compile error",
            &e.name,
            &e.src,
            e.span.0.clone(),
            &e.kind.to_string(),
            writer,
            use_color,
        ),
        // Errors inside included templates point into the included source.
        Error::Runtime(RuntimeError::Include { name, source }) => {
            writeln!(writer, "Error: in template included as '{}':", name)?;
            render_error_to_writer(source, writer, use_color)
        }
        other => {
            writeln!(writer, "Error: {}", other)?;
            let mut cause = std::error::Error::source(other);
            while let Some(e) = cause {
                writeln!(writer, "  caused by: {}", e)?;
                cause = e.source();
            }
            Ok(())
        }
    }
}

fn render_snippet(
    title: &str,
    name: &str,
    source: &str,
    span: std::ops::Range<usize>,
    message: &str,
    writer: &mut dyn Write,
    use_color: bool,
) -> std::io::Result<()> {
    // ariadne counts characters, spans are byte offsets.
    let start = char_offset(source, span.start);
    let end = char_offset(source, span.end).max(start);

    Report::build(ReportKind::Error, (name, start..end))
        .with_message(title)
        .with_config(ariadne::Config::default().with_color(use_color))
        .with_label(
            Label::new((name, start..end))
                .with_message(message)
                .with_color(Color::Red),
        )
        .finish()
        .write((name, Source::from(source)), &mut *writer)
}

fn char_offset(source: &str, byte: usize) -> usize {
    let byte = byte.min(source.len());
    source
        .char_indices()
        .take_while(|(i, _)| *i < byte)
        .count()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{Engine, EngineOptions, MemoryTemplateFetcher, Vars};

    fn engine(templates: &[(&str, &str)]) -> Engine {
        let fetcher: MemoryTemplateFetcher = templates.iter().copied().collect();
        Engine::with_fetcher(EngineOptions::default(), Arc::new(fetcher)).unwrap()
    }

    #[test]
    fn test_render_syntax_error() {
        let source = "<p>\n[% IF user %]hello";
        let e = engine(&[]).render_string(source, &Vars::new()).unwrap_err();
        let output = render_error_to_string_no_color(&e);

        assert!(output.contains("syntax error"));
        assert!(output.contains("IF block is never closed with END"));
        // Should show the source
        assert!(output.contains("[% IF user %]hello"));
    }

    #[test]
    fn test_render_compile_error() {
        let source = "[% name | shout %]";
        let e = engine(&[]).render_string(source, &Vars::new()).unwrap_err();
        let output = render_error_to_string_no_color(&e);

        assert!(output.contains("compile error"));
        assert!(output.contains("unknown filter 'shout'"));
        assert!(output.contains("[% name | shout %]"));
    }

    #[test]
    fn test_render_error_in_include() {
        let engine = engine(&[
            ("page.tx", "[% INCLUDE 'broken.tx' %]"),
            ("broken.tx", "[% FOREACH x IN xs %]"),
        ]);
        let e = engine.render("page.tx", &Vars::new()).unwrap_err();
        let output = render_error_to_string_no_color(&e);

        assert!(output.contains("included as 'broken.tx'"));
        assert!(output.contains("FOREACH block is never closed with END"));
    }

    #[test]
    fn test_render_compile_error_in_nested_include() {
        let engine = engine(&[
            ("page.tx", "[% INCLUDE 'mid.tx' %]"),
            ("mid.tx", "[% INCLUDE 'leaf.tx' %]"),
            ("leaf.tx", "<b>\n[% title | shout %]</b>"),
        ]);
        let e = engine.render("page.tx", &Vars::new()).unwrap_err();
        let output = render_error_to_string_no_color(&e);

        assert!(output.contains("included as 'mid.tx'"));
        assert!(output.contains("included as 'leaf.tx'"));
        assert!(output.contains("compile error"));
        assert!(output.contains("unknown filter 'shout'"));
        // The snippet comes from the included template's own source.
        assert!(output.contains("[% title | shout %]"));
    }

    #[test]
    fn test_render_runtime_error() {
        let e = engine(&[]).render_string("[% nope %]", &Vars::new()).unwrap_err();
        let output = render_error_to_string_no_color(&e);
        assert!(output.starts_with("Error: runtime error: undefined variable 'nope'"));
    }
}
