//! The xslate rendering engine.

use std::{io, sync::Arc};

use tracing::debug;

use super::{EngineOptions, Error, Syntax};
use crate::{
    compiler::BytecodeCompiler,
    loader::{
        ByteCodeCache, ByteCodeLoader, CacheStrategy, CachedByteCodeLoader, FileCache,
        FileTemplateFetcher, LayeredCache, MemoryCache, TemplateFetcher,
    },
    parser::{TTerse, TemplateParser},
    values::Vars,
    vm::VM,
};

/// Name given to templates rendered with [`Engine::render_string`].
pub const STRING_TEMPLATE_NAME: &str = "<string>";

/// The xslate rendering engine.
///
/// The engine wires a fetcher, parser, compiler, cache and loader together
/// from an [`EngineOptions`], and renders templates with a [`VM`] that can
/// resolve `INCLUDE`s through the same loader.
///
/// An engine is `Send + Sync`; every render gets its own execution state, so
/// one engine can be shared by any number of threads.
///
/// # Example
///
/// ```no_run
/// use xslate_core::api::{Engine, EngineOptions};
/// use xslate_core::values::{Value, Vars};
///
/// let mut options = EngineOptions::default();
/// options.load_paths = vec!["templates".into()];
/// let engine = Engine::new(options).unwrap();
///
/// let mut vars = Vars::new();
/// vars.insert("name".into(), Value::str("world"));
/// let html = engine.render("hello.tx", &vars).unwrap();
/// ```
pub struct Engine {
    options: EngineOptions,
    loader: Arc<CachedByteCodeLoader>,
    vm: VM,
}

impl Engine {
    /// Create an engine reading templates from `options.load_paths`.
    pub fn new(options: EngineOptions) -> Result<Self, Error> {
        let fetcher = Arc::new(FileTemplateFetcher::new(options.load_paths.clone()));
        Self::with_fetcher(options, fetcher)
    }

    /// Create an engine reading templates from a custom fetcher.
    ///
    /// `options.load_paths` is ignored.
    pub fn with_fetcher(
        options: EngineOptions,
        fetcher: Arc<dyn TemplateFetcher>,
    ) -> Result<Self, Error> {
        let syntax = Syntax::from_name(&options.syntax)
            .ok_or_else(|| Error::Config(format!("unknown syntax '{}'", options.syntax)))?;
        let parser: Arc<dyn TemplateParser> = match syntax {
            Syntax::TTerse => Arc::new(TTerse),
        };
        let compiler = Arc::new(BytecodeCompiler::new(options.compilation.clone()));

        let cache: Arc<dyn ByteCodeCache> = match (&options.cache_dir, options.loader.strategy) {
            (Some(dir), CacheStrategy::FreshnessChecked) => {
                Arc::new(LayeredCache::new(FileCache::new(dir)))
            }
            _ => Arc::new(MemoryCache::new()),
        };
        debug!(
            syntax = syntax.name(),
            strategy = ?options.loader.strategy,
            cache_dir = ?options.cache_dir,
            "creating engine"
        );

        let loader = Arc::new(
            CachedByteCodeLoader::new(fetcher, parser, compiler, options.loader.clone())
                .with_cache(cache),
        );
        let vm = VM::new(options.execution.clone()).with_loader(loader.clone());
        Ok(Self {
            options,
            loader,
            vm,
        })
    }

    /// Access the engine options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The loader used for templates and their includes.
    pub fn loader(&self) -> &Arc<CachedByteCodeLoader> {
        &self.loader
    }

    /// Render the template called `name`.
    pub fn render(&self, name: &str, vars: &Vars) -> Result<String, Error> {
        let mut out = Vec::new();
        self.render_to(name, vars, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Render the template called `name` into `sink`, returning the number of
    /// bytes written.
    ///
    /// On a runtime error, output already written to `sink` stays there.
    pub fn render_to(
        &self,
        name: &str,
        vars: &Vars,
        sink: &mut dyn io::Write,
    ) -> Result<usize, Error> {
        let program = self.loader.load(name)?;
        Ok(self.vm.run(&program, vars, sink)?)
    }

    /// Render template source text directly. The compiled program is not
    /// cached.
    pub fn render_string(&self, source: &str, vars: &Vars) -> Result<String, Error> {
        let program = self.loader.load_string(STRING_TEMPLATE_NAME, source)?;
        let mut out = Vec::new();
        self.vm.run(&program, vars, &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

static_assertions::assert_impl_all!(Engine: Send, Sync);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{loader::MemoryTemplateFetcher, values::Value};

    fn engine(templates: &[(&str, &str)]) -> Engine {
        let fetcher: MemoryTemplateFetcher = templates.iter().copied().collect();
        Engine::with_fetcher(EngineOptions::default(), Arc::new(fetcher)).unwrap()
    }

    #[test]
    fn test_render_with_include() {
        let engine = engine(&[
            ("page.tx", "<ul>[% FOREACH i IN items %][% INCLUDE 'item.tx' %][% END %]</ul>"),
            ("item.tx", "<li>[% i %]</li>"),
        ]);
        let mut vars = Vars::new();
        vars.insert("items".into(), Value::list(["a", "<b>"]));
        assert_eq!(
            engine.render("page.tx", &vars).unwrap(),
            "<ul><li>a</li><li>&lt;b&gt;</li></ul>"
        );
        assert_eq!(engine.loader().stats().compilations(), 2);
    }

    #[test]
    fn test_render_string() {
        let engine = engine(&[]);
        assert_eq!(
            engine.render_string("[% 6 * 7 %]", &Vars::new()).unwrap(),
            "42"
        );
        match engine.render_string("[% END %]", &Vars::new()) {
            Err(Error::Syntax(e)) => assert_eq!(e.name.as_str(), STRING_TEMPLATE_NAME),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_render_to_reports_bytes() {
        let engine = engine(&[("a.tx", "héllo")]);
        let mut out = Vec::new();
        assert_eq!(engine.render_to("a.tx", &Vars::new(), &mut out).unwrap(), 6);
        assert_eq!(out, "héllo".as_bytes());
    }

    #[test]
    fn test_unknown_syntax() {
        let options = EngineOptions {
            syntax: "Kolon".into(),
            ..EngineOptions::default()
        };
        assert!(matches!(Engine::new(options), Err(Error::Config(_))));
    }

    #[test]
    fn test_no_escape_option() {
        let mut options = EngineOptions::default();
        options.compilation.auto_escape = false;
        let engine =
            Engine::with_fetcher(options, Arc::new(MemoryTemplateFetcher::new())).unwrap();
        let mut vars = Vars::new();
        vars.insert("x".into(), Value::str("<i>"));
        assert_eq!(engine.render_string("[% x %]", &vars).unwrap(), "<i>");
    }
}
