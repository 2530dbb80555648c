//! Freshness tokens: how the loader decides whether cached bytecode still
//! matches its template source.

use std::{path::PathBuf, time::SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Freshness token recorded for a template source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freshness {
    /// Last-modified time of the source, when the backing store has one.
    pub modified: Option<SystemTime>,
    /// Lowercase hex SHA-256 of the source bytes.
    pub digest: String,
    /// File the source was resolved to, when it has one.
    pub origin: Option<PathBuf>,
    /// Syntax and compiler settings the program was built with.
    pub build: String,
}

impl Freshness {
    pub fn new(modified: Option<SystemTime>, content: &[u8]) -> Self {
        Self {
            modified,
            digest: digest(content),
            origin: None,
            build: String::new(),
        }
    }

    pub fn with_origin(mut self, origin: PathBuf) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = build.into();
        self
    }
}

/// Lowercase hex SHA-256 of `content`.
pub fn digest(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Equality test applied to freshness tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FreshnessCheck {
    /// Compare modification times. Falls back to the digest when either
    /// token has no modification time.
    #[default]
    ModifiedTime,
    /// Compare content digests; for filesystems with coarse timestamps.
    ContentHash,
}

impl FreshnessCheck {
    /// Whether an entry recorded with `stored` may serve a source whose
    /// current token is `current`.
    ///
    /// Tokens from another file or another build are never fresh.
    pub fn is_fresh(self, stored: &Freshness, current: &Freshness) -> bool {
        if stored.origin != current.origin || stored.build != current.build {
            return false;
        }
        match (self, stored.modified, current.modified) {
            (FreshnessCheck::ModifiedTime, Some(stored), Some(current)) => stored == current,
            _ => stored.digest == current.digest,
        }
    }
}
