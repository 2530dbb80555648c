//! xslate - A template engine running on a bytecode VM
//!
//! # Overview
//!
//! Templates are parsed, compiled once into an immutable bytecode program,
//! cached (in memory, or on disk with freshness checks), and rendered by a
//! small stack VM. One [`Engine`] can render from any number of threads.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use xslate::{Engine, EngineOptions, MemoryTemplateFetcher, Value, Vars};
//!
//! let templates = MemoryTemplateFetcher::new();
//! templates.insert(
//!     "list.tx",
//!     "[% FOREACH item IN items %][% loop.count %]. [% item %]\n[% END %]",
//! );
//! let engine = Engine::with_fetcher(EngineOptions::default(), Arc::new(templates)).unwrap();
//!
//! let mut vars = Vars::new();
//! vars.insert("items".into(), Value::list(["tea", "<cake>"]));
//! assert_eq!(
//!     engine.render("list.tx", &vars).unwrap(),
//!     "1. tea\n2. &lt;cake&gt;\n",
//! );
//! ```
//!
//! # Template syntax
//!
//! ```text
//! [% name %]                          print, HTML-escaped
//! [% name | raw %]                    print without escaping
//! [% IF a %]..[% ELSIF b %]..[% ELSE %]..[% END %]
//! [% FOREACH x IN list %]..[% END %]  `loop.index`, `loop.count`, `loop.first`, ...
//! [% WHILE cond %]..[% END %]
//! [% SET x = expr %]
//! [% MACRO m(a, b) BLOCK %]..[% END %]  then [% m(1, 2) %]
//! [% INCLUDE 'other.tx' WITH k = v %]
//! [%# comment %]
//! ```

pub mod error_renderer;

pub use error_renderer::{
    render_error, render_error_to, render_error_to_string, render_error_to_string_no_color,
};

// Re-export public API from xslate_core
pub use xslate_core::Error;
pub use xslate_core::api::{
    CompilationOptions, Engine, EngineOptions, ExecutionOptions, LoaderOptions, Syntax,
};
pub use xslate_core::loader::{
    ByteCodeCache, ByteCodeLoader, CacheStrategy, CachedByteCodeLoader, FileCache,
    FileTemplateFetcher, FreshnessCheck, LayeredCache, MemoryCache, MemoryTemplateFetcher,
    TemplateFetcher,
};
pub use xslate_core::values::{Value, Vars};

// Re-export errors
pub use xslate_core::compiler::CompileError;
pub use xslate_core::parser::ParseError;
pub use xslate_core::vm::{ResourceExceededError, RuntimeError};
