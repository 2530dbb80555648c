//! Bytecode caches.
//!
//! A cache maps a template name to the program compiled from it and the
//! freshness token of the source it was compiled from. Entries are replaced
//! whole, never updated in place, so a reader sees either the old entry or
//! the new one.
//!
//! On-disk entries written by [`FileCache`] have this layout:
//!
//! ```text
//! +--------+-----------------+----------------------------------------+
//! | "XSLC" | version (u32 LE)| postcard { name, freshness, program }  |
//! +--------+-----------------+----------------------------------------+
//! ```
//!
//! An entry with the wrong magic or version, or one that fails to decode, is
//! treated as a miss so the template gets recompiled.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use ecow::EcoString;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    loader::{Freshness, freshness},
    vm::Program,
};

/// Magic bytes at the start of every cache file.
pub const CACHE_MAGIC: &[u8; 4] = b"XSLC";

/// Cache file format version (increment on breaking changes to the
/// serialized program).
pub const CACHE_FORMAT_VERSION: u32 = 2;

const HEADER_LEN: usize = CACHE_MAGIC.len() + 4;

/// A compiled program and the freshness of the source it came from.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub name: EcoString,
    pub freshness: Freshness,
    pub program: Arc<Program>,
}

/// Errors from a durable cache backend.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] postcard::Error),
}

/// A store of compiled programs keyed by template name.
///
/// Implementations must allow concurrent lookups and stores; concurrent
/// stores to the same name resolve as last-writer-wins.
pub trait ByteCodeCache: Send + Sync {
    fn lookup(&self, name: &str) -> Result<Option<CacheEntry>, CacheError>;

    fn store(
        &self,
        name: &str,
        freshness: Freshness,
        program: Arc<Program>,
    ) -> Result<(), CacheError>;

    fn invalidate(&self, name: &str) -> Result<(), CacheError>;
}

/// Process-local cache.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<EcoString, CacheEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert(&self, entry: CacheEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }
}

impl ByteCodeCache for MemoryCache {
    fn lookup(&self, name: &str) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.get(name).map(|entry| entry.value().clone()))
    }

    fn store(
        &self,
        name: &str,
        freshness: Freshness,
        program: Arc<Program>,
    ) -> Result<(), CacheError> {
        self.insert(CacheEntry {
            name: name.into(),
            freshness,
            program,
        });
        Ok(())
    }

    fn invalidate(&self, name: &str) -> Result<(), CacheError> {
        self.entries.remove(name);
        Ok(())
    }
}

#[derive(Serialize)]
struct StoredEntryRef<'a> {
    name: &'a str,
    freshness: &'a Freshness,
    program: &'a Program,
}

#[derive(Deserialize)]
struct StoredEntry {
    name: EcoString,
    freshness: Freshness,
    program: Program,
}

/// Cache persisted as one file per template under a directory.
///
/// Files are named by the SHA-256 of the template name, and written to a
/// temporary file first and renamed into place.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the entry for `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.txc", freshness::digest(name.as_bytes())))
    }

    fn decode(&self, name: &str, path: &Path, bytes: &[u8]) -> Option<CacheEntry> {
        let (header, body) = bytes.split_at_checked(HEADER_LEN)?;
        if &header[..CACHE_MAGIC.len()] != CACHE_MAGIC {
            debug!(path = %path.display(), "ignoring cache file with bad magic");
            return None;
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&header[CACHE_MAGIC.len()..]);
        let version = u32::from_le_bytes(version);
        if version != CACHE_FORMAT_VERSION {
            debug!(
                path = %path.display(),
                version,
                expected = CACHE_FORMAT_VERSION,
                "ignoring cache file from another format version"
            );
            return None;
        }

        let stored: StoredEntry = match postcard::from_bytes(body) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring undecodable cache file");
                return None;
            }
        };
        if stored.name.as_str() != name {
            debug!(
                path = %path.display(),
                stored = %stored.name,
                "cache file belongs to another template"
            );
            return None;
        }
        if let Err(e) = stored.program.validate() {
            warn!(path = %path.display(), error = %e, "ignoring invalid cached program");
            return None;
        }
        Some(CacheEntry {
            name: stored.name,
            freshness: stored.freshness,
            program: Arc::new(stored.program),
        })
    }

    fn io_error(path: &Path, source: io::Error) -> CacheError {
        CacheError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl ByteCodeCache for FileCache {
    fn lookup(&self, name: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.path_for(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(&path, e)),
        };
        Ok(self.decode(name, &path, &bytes))
    }

    fn store(
        &self,
        name: &str,
        freshness: Freshness,
        program: Arc<Program>,
    ) -> Result<(), CacheError> {
        let body = postcard::to_allocvec(&StoredEntryRef {
            name,
            freshness: &freshness,
            program: &program,
        })?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.extend_from_slice(CACHE_MAGIC);
        bytes.extend_from_slice(&CACHE_FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);

        fs::create_dir_all(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;
        let path = self.path_for(name);
        let mut file =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| Self::io_error(&self.dir, e))?;
        file.write_all(&bytes)
            .map_err(|e| Self::io_error(file.path(), e))?;
        file.persist(&path)
            .map_err(|e| Self::io_error(&path, e.error))?;

        debug!(template = name, path = %path.display(), bytes = bytes.len(), "stored cache entry");
        Ok(())
    }

    fn invalidate(&self, name: &str) -> Result<(), CacheError> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }
}

/// A memory cache in front of a durable one.
///
/// Hits in the durable cache are promoted into memory.
pub struct LayeredCache<C> {
    memory: MemoryCache,
    durable: C,
}

impl<C: ByteCodeCache> LayeredCache<C> {
    pub fn new(durable: C) -> Self {
        Self {
            memory: MemoryCache::new(),
            durable,
        }
    }

    pub fn durable(&self) -> &C {
        &self.durable
    }
}

impl<C: ByteCodeCache> ByteCodeCache for LayeredCache<C> {
    fn lookup(&self, name: &str) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.memory.lookup(name)? {
            return Ok(Some(entry));
        }
        let entry = self.durable.lookup(name)?;
        if let Some(entry) = &entry {
            self.memory.insert(entry.clone());
        }
        Ok(entry)
    }

    fn store(
        &self,
        name: &str,
        freshness: Freshness,
        program: Arc<Program>,
    ) -> Result<(), CacheError> {
        self.memory
            .store(name, freshness.clone(), program.clone())?;
        self.durable.store(name, freshness, program)
    }

    fn invalidate(&self, name: &str) -> Result<(), CacheError> {
        self.memory.invalidate(name)?;
        self.durable.invalidate(name)
    }
}
