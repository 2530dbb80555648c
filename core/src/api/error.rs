//! Public error type for xslate operations.
//!
//! Each layer has its own error type ([`ParseError`], [`CompileError`],
//! [`CacheError`], [`RuntimeError`]); they are folded into [`Error`] at the
//! loader and engine boundaries so callers can tell which phase failed.

use std::path::PathBuf;

use ecow::EcoString;

use crate::{
    compiler::CompileError, loader::CacheError, parser::ParseError, vm::RuntimeError,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No load path contained the template.
    #[error("template '{name}' not found (searched {})", display_paths(.paths))]
    TemplateNotFound { name: EcoString, paths: Vec<PathBuf> },

    #[error("syntax error: {0}")]
    Syntax(#[from] ParseError),

    #[error("compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("failed to read template '{name}': {source}")]
    Io {
        name: EcoString,
        #[source]
        source: std::io::Error,
    },

    /// Invalid engine configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no load paths".into();
    }
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_lists_paths() {
        let err = Error::TemplateNotFound {
            name: "a.tx".into(),
            paths: vec!["t1".into(), "t2".into()],
        };
        assert_eq!(
            err.to_string(),
            "template 'a.tx' not found (searched t1, t2)"
        );
    }

    #[test]
    fn test_runtime_conversion() {
        let err: Error = RuntimeError::NoLoader { name: "x".into() }.into();
        assert!(matches!(err, Error::Runtime(RuntimeError::NoLoader { .. })));
    }
}
