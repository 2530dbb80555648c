use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tracing::{debug, info, warn};

use crate::{
    Error,
    api::LoaderOptions,
    compiler::Compiler,
    loader::{
        ByteCodeCache, ByteCodeLoader, CacheEntry, CacheStrategy, Freshness, MemoryCache,
        TemplateFetcher,
    },
    parser::TemplateParser,
    vm::Program,
};

/// Counters describing what a loader has done so far.
#[derive(Debug, Default)]
pub struct LoaderStats {
    compilations: AtomicUsize,
    cache_hits: AtomicUsize,
    cache_errors: AtomicUsize,
}

impl LoaderStats {
    /// Templates parsed and compiled, including `load_string` calls.
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    /// Loads served from the cache.
    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Cache lookups or stores that failed and were skipped.
    pub fn cache_errors(&self) -> usize {
        self.cache_errors.load(Ordering::Relaxed)
    }

    fn count(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The standard loader: fetcher, parser, compiler and cache wired together
/// under a [`CacheStrategy`].
pub struct CachedByteCodeLoader {
    fetcher: Arc<dyn TemplateFetcher>,
    parser: Arc<dyn TemplateParser>,
    compiler: Arc<dyn Compiler>,
    cache: Arc<dyn ByteCodeCache>,
    options: LoaderOptions,
    stats: LoaderStats,
    /// Syntax and compiler fingerprint stamped on every stored entry.
    build: String,
}

impl CachedByteCodeLoader {
    /// Create a loader caching in memory.
    pub fn new(
        fetcher: Arc<dyn TemplateFetcher>,
        parser: Arc<dyn TemplateParser>,
        compiler: Arc<dyn Compiler>,
        options: LoaderOptions,
    ) -> Self {
        let build = format!("{}/{}", parser.syntax(), compiler.fingerprint());
        Self {
            build,
            fetcher,
            parser,
            compiler,
            cache: Arc::new(MemoryCache::new()),
            options,
            stats: LoaderStats::default(),
        }
    }

    /// Replace the cache, e.g. with a durable one.
    pub fn with_cache(mut self, cache: Arc<dyn ByteCodeCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn stats(&self) -> &LoaderStats {
        &self.stats
    }

    pub fn cache(&self) -> &dyn ByteCodeCache {
        self.cache.as_ref()
    }

    /// Fetch `name` and stamp its freshness with this loader's build.
    fn fetch(&self, name: &str) -> Result<(String, Freshness), Error> {
        let source = self.fetcher.resolve(name)?;
        Ok((source.text, source.freshness.with_build(self.build.as_str())))
    }

    fn compile(&self, name: &str, source: &str) -> Result<Arc<Program>, Error> {
        let template = self.parser.parse(name, source)?;
        if self.options.dump_ast {
            info!(template = name, "syntax tree:\n{:#?}", template);
        }
        let program = self.compiler.compile(&template, source)?;
        if self.options.dump_bytecode {
            info!(template = name, "bytecode:\n{:?}", program);
        }
        LoaderStats::count(&self.stats.compilations);
        debug!(template = name, instructions = program.len(), "compiled template");
        Ok(Arc::new(program))
    }

    /// Lookup that degrades a cache failure into a miss.
    fn lookup(&self, name: &str) -> Option<CacheEntry> {
        match self.cache.lookup(name) {
            Ok(entry) => entry,
            Err(e) => {
                LoaderStats::count(&self.stats.cache_errors);
                warn!(template = name, error = %e, "cache lookup failed, recompiling");
                None
            }
        }
    }

    /// Store that degrades a cache failure into a warning.
    fn store(&self, name: &str, freshness: Freshness, program: &Arc<Program>) {
        if let Err(e) = self.cache.store(name, freshness, program.clone()) {
            LoaderStats::count(&self.stats.cache_errors);
            warn!(template = name, error = %e, "failed to store compiled template in cache");
        }
    }

    fn hit(&self, name: &str, program: Arc<Program>) -> Arc<Program> {
        LoaderStats::count(&self.stats.cache_hits);
        debug!(template = name, "cache hit");
        program
    }
}

impl ByteCodeLoader for CachedByteCodeLoader {
    fn load(&self, name: &str) -> Result<Arc<Program>, Error> {
        match self.options.strategy {
            CacheStrategy::None => {
                let source = self.fetcher.resolve(name)?;
                self.compile(name, &source.text)
            }

            CacheStrategy::MemoryOnly => {
                if let Some(entry) = self.lookup(name) {
                    return Ok(self.hit(name, entry.program));
                }
                let (text, freshness) = self.fetch(name)?;
                let program = self.compile(name, &text)?;
                self.store(name, freshness, &program);
                Ok(program)
            }

            CacheStrategy::FreshnessChecked => {
                let (text, freshness) = self.fetch(name)?;
                match self.lookup(name) {
                    Some(entry)
                        if self
                            .options
                            .freshness
                            .is_fresh(&entry.freshness, &freshness) =>
                    {
                        return Ok(self.hit(name, entry.program));
                    }
                    Some(_) => debug!(template = name, "cache entry is stale"),
                    None => debug!(template = name, "cache miss"),
                }
                let program = self.compile(name, &text)?;
                self.store(name, freshness, &program);
                Ok(program)
            }
        }
    }

    fn load_string(&self, name: &str, source: &str) -> Result<Arc<Program>, Error> {
        self.compile(name, source)
    }
}
