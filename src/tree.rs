//! Working tree access for the sync engine.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use crate::attributes::TrackPatterns;
use crate::pointer::MAX_POINTER_SIZE;
use crate::{Error, Result};

/// What the sync engine needs from a checkout.
///
/// Paths are repository-relative with forward slashes.
pub trait WorkingTree: Send + Sync {
    /// Pointer text as committed for `path`.
    fn read_committed(&self, path: &str) -> Result<Vec<u8>>;

    /// Current working bytes of `path`.
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Atomically replace `path` with the content of `reader`.
    ///
    /// Readers of `path` see either the old or the new file, never a mix.
    fn write(&self, path: &str, reader: &mut dyn Read) -> Result<u64>;
}

/// A working tree on the local filesystem.
///
/// Committed pointer text is what git leaves in the file before the content
/// has been materialized.
#[derive(Debug, Clone)]
pub struct FsWorkingTree {
    root: PathBuf,
}

impl FsWorkingTree {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        FsWorkingTree {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of a repository-relative path.
    pub fn absolute(&self, path: &str) -> Result<PathBuf> {
        let relative = PathBuf::from(normalize_path(path));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if relative.as_os_str().is_empty() || escapes {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path escapes the working tree: {}", path),
            )));
        }
        Ok(self.root.join(relative))
    }

    /// The tracking rules of the root `.gitattributes`.
    pub fn track_patterns(&self) -> Result<TrackPatterns> {
        TrackPatterns::load(self.root.join(".gitattributes"))
    }

    /// Every file under the root that `.gitattributes` routes through LFS,
    /// sorted by path.
    pub fn tracked_files(&self) -> Result<Vec<String>> {
        let patterns = self.track_patterns()?;
        if patterns.is_empty() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if entry.file_name() == ".git" {
                    continue;
                }
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    stack.push(entry.path());
                } else if file_type.is_file() {
                    let relative = match entry.path().strip_prefix(&self.root) {
                        Ok(rel) => rel.to_string_lossy().into_owned(),
                        Err(_) => continue,
                    };
                    let relative = normalize_path(&relative);
                    if patterns.is_tracked(&relative) {
                        files.push(relative);
                    }
                }
            }
        }

        files.sort();
        debug!(root = %self.root.display(), count = files.len(), "listed tracked files");
        Ok(files)
    }
}

impl WorkingTree for FsWorkingTree {
    fn read_committed(&self, path: &str) -> Result<Vec<u8>> {
        let file = File::open(self.absolute(path)?)?;
        // One byte past the limit so oversized files fail to parse
        let mut content = Vec::new();
        file.take(MAX_POINTER_SIZE as u64 + 1)
            .read_to_end(&mut content)?;
        Ok(content)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.absolute(path)?)?))
    }

    fn write(&self, path: &str, reader: &mut dyn Read) -> Result<u64> {
        let target = self.absolute(path)?;
        let dir = match target.parent() {
            Some(dir) => dir,
            None => &self.root,
        };
        fs::create_dir_all(dir)?;

        let mut temp = NamedTempFile::new_in(dir)?;
        let written = io::copy(reader, &mut temp)?;
        temp.as_file().sync_all()?;
        temp.persist(&target).map_err(|e| Error::Io(e.error))?;

        debug!(path, bytes = written, "materialized file");
        Ok(written)
    }
}

/// Repository-relative path with forward slashes.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut path = path.as_str();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.trim_start_matches('/').to_string()
}
