//! Template fetchers: resolve a template name to its source text and a
//! freshness token.

use std::{
    fs::File,
    io::{self, Read, Seek},
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use dashmap::DashMap;
use ecow::EcoString;
use tracing::{debug, trace};

use crate::{Error, loader::Freshness};

/// Source text of one template, as read by a [`TemplateFetcher`].
#[derive(Debug, Clone)]
pub struct TemplateSource {
    pub name: EcoString,
    /// File the source was read from, for file-backed fetchers.
    pub path: Option<PathBuf>,
    pub text: String,
    pub freshness: Freshness,
}

/// Resolves template names to source text.
pub trait TemplateFetcher: Send + Sync {
    /// Read the template called `name`.
    ///
    /// Fails with [`Error::TemplateNotFound`] when no location has it.
    fn resolve(&self, name: &str) -> Result<TemplateSource, Error>;
}

/// Number of times a read is retried when the file changes while being read.
const MAX_READ_ATTEMPTS: usize = 3;

/// Fetches templates from an ordered list of directories.
///
/// The first directory containing the template wins; later ones are never
/// consulted for that name.
#[derive(Debug, Clone)]
pub struct FileTemplateFetcher {
    roots: Vec<PathBuf>,
}

impl FileTemplateFetcher {
    pub fn new(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn not_found(&self, name: &str) -> Error {
        Error::TemplateNotFound {
            name: name.into(),
            paths: self.roots.clone(),
        }
    }
}

impl TemplateFetcher for FileTemplateFetcher {
    fn resolve(&self, name: &str) -> Result<TemplateSource, Error> {
        if !is_relative_name(name) {
            debug!(template = name, "rejecting template name outside the load paths");
            return Err(self.not_found(name));
        }

        for root in &self.roots {
            let path = root.join(name);
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(Error::Io {
                        name: name.into(),
                        source,
                    });
                }
            };
            let read = read_consistent(file).map_err(|source| Error::Io {
                name: name.into(),
                source,
            })?;
            let Some((text, modified)) = read else {
                // A directory by that name does not shadow later roots.
                continue;
            };
            trace!(template = name, path = %path.display(), "resolved template");
            return Ok(TemplateSource {
                name: name.into(),
                freshness: Freshness::new(modified, text.as_bytes()).with_origin(path.clone()),
                path: Some(path),
                text,
            });
        }

        Err(self.not_found(name))
    }
}

/// Names must stay below their root: no absolute paths, no `..`.
fn is_relative_name(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Read `file` and the modification time that goes with the bytes read.
///
/// The time is taken from the open handle before and after the read; if the
/// two differ the file changed mid-read and the read is repeated. Returns
/// `None` for anything that is not a regular file.
fn read_consistent(mut file: File) -> io::Result<Option<(String, Option<SystemTime>)>> {
    let mut text = String::new();
    for _ in 0..MAX_READ_ATTEMPTS {
        let before = file.metadata()?;
        if !before.is_file() {
            return Ok(None);
        }
        text.clear();
        file.rewind()?;
        file.read_to_string(&mut text)?;
        let after = file.metadata()?.modified().ok();
        let modified = before.modified().ok();
        if modified == after {
            return Ok(Some((text, modified)));
        }
    }
    // Still changing: record no mtime so freshness falls back to the digest
    // of what was actually read.
    Ok(Some((text, None)))
}

/// Fetches templates registered in memory.
///
/// Sources have no modification time, so their freshness is their digest.
#[derive(Debug, Default)]
pub struct MemoryTemplateFetcher {
    sources: DashMap<EcoString, String>,
}

impl MemoryTemplateFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template.
    pub fn insert(&self, name: impl Into<EcoString>, text: impl Into<String>) {
        self.sources.insert(name.into(), text.into());
    }

    pub fn remove(&self, name: &str) {
        self.sources.remove(name);
    }
}

impl<N, T> FromIterator<(N, T)> for MemoryTemplateFetcher
where
    N: Into<EcoString>,
    T: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, T)>>(iter: I) -> Self {
        let fetcher = Self::new();
        for (name, text) in iter {
            fetcher.insert(name, text);
        }
        fetcher
    }
}

impl TemplateFetcher for MemoryTemplateFetcher {
    fn resolve(&self, name: &str) -> Result<TemplateSource, Error> {
        let text = self
            .sources
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::TemplateNotFound {
                name: name.into(),
                paths: vec![],
            })?;
        Ok(TemplateSource {
            name: name.into(),
            path: None,
            freshness: Freshness::new(None, text.as_bytes()),
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_first_root_wins() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        fs::write(first.path().join("a.tx"), "first").unwrap();
        fs::write(second.path().join("a.tx"), "second").unwrap();
        fs::write(second.path().join("b.tx"), "only second").unwrap();

        let fetcher = FileTemplateFetcher::new([first.path(), second.path()]);
        let a = fetcher.resolve("a.tx").unwrap();
        assert_eq!(a.text, "first");
        assert_eq!(a.path.as_deref(), Some(first.path().join("a.tx").as_path()));
        assert!(a.freshness.modified.is_some());
        assert_eq!(a.freshness.origin, a.path);
        assert_eq!(fetcher.resolve("b.tx").unwrap().text, "only second");
    }

    #[test]
    fn test_subdirectories() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("inc")).unwrap();
        fs::write(root.path().join("inc/row.tx"), "row").unwrap();

        let fetcher = FileTemplateFetcher::new([root.path()]);
        assert_eq!(fetcher.resolve("inc/row.tx").unwrap().text, "row");
        assert_eq!(fetcher.resolve("./inc/row.tx").unwrap().text, "row");
    }

    #[test]
    fn test_not_found() {
        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("dir.tx")).unwrap();
        let fetcher = FileTemplateFetcher::new([root.path()]);

        for name in ["missing.tx", "dir.tx", "../escape.tx", "/etc/passwd", ""] {
            match fetcher.resolve(name) {
                Err(Error::TemplateNotFound { name: got, paths }) => {
                    assert_eq!(got.as_str(), name);
                    assert_eq!(paths, vec![root.path().to_path_buf()]);
                }
                other => panic!("expected not found for {:?}, got {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_modification_changes_freshness() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("a.tx");
        fs::write(&path, "one").unwrap();
        let fetcher = FileTemplateFetcher::new([root.path()]);
        let before = fetcher.resolve("a.tx").unwrap().freshness;

        fs::write(&path, "two").unwrap();
        let after = fetcher.resolve("a.tx").unwrap().freshness;
        assert_ne!(before.digest, after.digest);
    }

    #[test]
    fn test_memory_fetcher() {
        let fetcher: MemoryTemplateFetcher = [("a.tx", "hello")].into_iter().collect();
        let source = fetcher.resolve("a.tx").unwrap();
        assert_eq!(source.text, "hello");
        assert_eq!(source.freshness.modified, None);

        fetcher.insert("a.tx", "bye");
        assert_ne!(fetcher.resolve("a.tx").unwrap().freshness, source.freshness);

        fetcher.remove("a.tx");
        assert!(matches!(
            fetcher.resolve("a.tx"),
            Err(Error::TemplateNotFound { .. })
        ));
    }
}
