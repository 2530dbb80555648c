//! Configuration options for the xslate engine.

use std::path::PathBuf;

use crate::loader::{CacheStrategy, FreshnessCheck};

/// Configuration options for compilation.
///
/// # Example
///
/// ```
/// use xslate_core::api::CompilationOptions;
///
/// let options = CompilationOptions { auto_escape: false };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationOptions {
    /// HTML-escape the value of every `[% expr %]` print.
    ///
    /// Default: true
    pub auto_escape: bool,
}

impl Default for CompilationOptions {
    fn default() -> Self {
        Self { auto_escape: true }
    }
}

/// Configuration options for template execution.
///
/// These options control resource limits and runtime behavior during a render.
///
/// # Example
///
/// ```
/// use xslate_core::api::ExecutionOptions;
///
/// let options = ExecutionOptions {
///     max_depth: 64,
///     max_include_depth: 16,
///     max_steps: Some(1_000_000),
///     strict_variables: true,
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Maximum nesting of macro calls and includes (for recursion protection).
    ///
    /// Default: 1000
    pub max_depth: usize,

    /// Maximum nesting of `INCLUDE`s alone.
    ///
    /// Each include runs on the native stack, so this bound is kept well
    /// below `max_depth`.
    ///
    /// Default: 64
    pub max_include_depth: usize,

    /// Maximum number of instructions a render may dispatch (if Some).
    ///
    /// Set to `None` for no limit (be careful with untrusted templates!).
    ///
    /// Default: None
    pub max_steps: Option<usize>,

    /// Fail on lookups of unbound variables instead of yielding undef.
    ///
    /// Default: true
    pub strict_variables: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_depth: 1000,
            max_include_depth: 64,
            max_steps: None,
            strict_variables: true,
        }
    }
}

/// Configuration for a [`CachedByteCodeLoader`](crate::loader::CachedByteCodeLoader).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoaderOptions {
    /// How compiled programs are reused across loads.
    pub strategy: CacheStrategy,
    /// Equality test used by [`CacheStrategy::FreshnessChecked`].
    pub freshness: FreshnessCheck,
    /// Log the syntax tree of every template that gets compiled.
    pub dump_ast: bool,
    /// Log the bytecode of every template that gets compiled.
    pub dump_bytecode: bool,
}

/// Configuration options for the xslate [`Engine`](crate::api::Engine).
///
/// # Example
///
/// ```
/// use xslate_core::api::EngineOptions;
/// use xslate_core::loader::CacheStrategy;
///
/// let mut options = EngineOptions::default();
/// options.load_paths.push("templates".into());
/// options.loader.strategy = CacheStrategy::MemoryOnly;
/// ```
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Name of the template syntax, see [`Syntax::from_name`].
    ///
    /// Default: "TTerse"
    pub syntax: String,

    /// Directories searched for templates, in order.
    ///
    /// Default: the current directory
    pub load_paths: Vec<PathBuf>,

    /// Directory for the durable bytecode cache. Without one, the
    /// freshness-checked strategy only caches in memory.
    pub cache_dir: Option<PathBuf>,

    pub loader: LoaderOptions,
    pub compilation: CompilationOptions,
    pub execution: ExecutionOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            syntax: Syntax::TTerse.name().into(),
            load_paths: vec![PathBuf::from(".")],
            cache_dir: None,
            loader: LoaderOptions::default(),
            compilation: CompilationOptions::default(),
            execution: ExecutionOptions::default(),
        }
    }
}

/// Template syntaxes the engine can parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// Template-Toolkit-like tags: `[% IF x %]...[% END %]`.
    TTerse,
}

impl Syntax {
    pub fn name(self) -> &'static str {
        match self {
            Syntax::TTerse => "TTerse",
        }
    }

    /// Look a syntax up by name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        [Syntax::TTerse]
            .into_iter()
            .find(|syntax| syntax.name().eq_ignore_ascii_case(name))
    }
}
