//! Public API for the xslate template engine.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use xslate_core::api::{Engine, EngineOptions};
//! use xslate_core::loader::MemoryTemplateFetcher;
//! use xslate_core::values::{Value, Vars};
//!
//! let templates = MemoryTemplateFetcher::new();
//! templates.insert("hello.tx", "Hello, [% name %]!");
//! let engine = Engine::with_fetcher(EngineOptions::default(), Arc::new(templates)).unwrap();
//!
//! let mut vars = Vars::new();
//! vars.insert("name".into(), Value::str("<world>"));
//! assert_eq!(engine.render("hello.tx", &vars).unwrap(), "Hello, &lt;world&gt;!");
//! ```

pub mod engine;
pub mod error;
pub mod options;

pub use engine::Engine;
pub use error::Error;
pub use options::{CompilationOptions, EngineOptions, ExecutionOptions, LoaderOptions, Syntax};
