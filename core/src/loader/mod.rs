//! The compile-cache-load pipeline.
//!
//! A [`ByteCodeLoader`] turns a template name into a [`Program`]:
//!
//! ```text
//! name ─► TemplateFetcher ─► ByteCodeCache ──(fresh hit)──────────► Program
//!                                  │
//!                                  └─(miss/stale)─► parse ─► compile ─► store ─► Program
//! ```
//!
//! How aggressively compiled programs are reused is decided by the
//! [`CacheStrategy`].

mod cache;
mod cached;
mod fetcher;
mod freshness;


use std::sync::Arc;

pub use cache::{
    ByteCodeCache, CACHE_FORMAT_VERSION, CACHE_MAGIC, CacheEntry, CacheError, FileCache,
    LayeredCache, MemoryCache,
};
pub use cached::{CachedByteCodeLoader, LoaderStats};
pub use fetcher::{FileTemplateFetcher, MemoryTemplateFetcher, TemplateFetcher, TemplateSource};
pub use freshness::{Freshness, FreshnessCheck, digest};

use crate::{Error, vm::Program};

/// Resolves template names to compiled programs.
pub trait ByteCodeLoader: Send + Sync {
    /// Load the template called `name`, compiling it if needed.
    fn load(&self, name: &str) -> Result<Arc<Program>, Error>;

    /// Compile `source` as a template called `name`. Never cached.
    fn load_string(&self, name: &str, source: &str) -> Result<Arc<Program>, Error>;
}

/// Policy for reusing compiled programs across loads, from least to most
/// careful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Parse and compile on every load.
    None,
    /// Compile once per process; sources are assumed never to change.
    MemoryOnly,
    /// Reuse a cached program only while its source is unchanged.
    #[default]
    FreshnessChecked,
}
