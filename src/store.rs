//! Local content store for LFS objects.
//!
//! Stores LFS objects in `.git/lfs/objects/` to avoid re-downloading
//! and enable offline access. A blob only ever appears at its addressed
//! path after its digest was verified, so presence implies integrity.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::oid::OidHasher;
use crate::{CancellationToken, Error, Oid, Result};

const COPY_BUF_SIZE: usize = 64 * 1024;

/// Content-addressed store for LFS objects.
///
/// Objects are stored in the git-lfs standard layout:
/// `.git/lfs/objects/<oid[0:2]>/<oid[2:4]>/<oid>`, with in-flight writes
/// under `.git/lfs/objects/tmp/`.
#[derive(Debug, Clone)]
pub struct ContentStore {
    base_path: PathBuf,
}

/// A verified blob held by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub oid: Oid,
    pub path: PathBuf,
    pub size: u64,
    pub verified: bool,
}

impl ContentStore {
    /// Create a store at the given base path.
    ///
    /// Typically this is `.git/lfs/objects` within a repository.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        ContentStore {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Create a store for a repository's `.git/lfs/objects` directory.
    pub fn for_repo<P: AsRef<Path>>(git_dir: P) -> Self {
        let base_path = git_dir.as_ref().join("lfs").join("objects");
        ContentStore { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the path where an object with the given OID would be stored.
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.base_path
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(&hex)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.base_path.join("tmp")
    }

    /// Check if an object exists in the store.
    pub fn has(&self, oid: &Oid) -> bool {
        self.object_path(oid).is_file()
    }

    /// Describe a stored object.
    pub fn entry(&self, oid: &Oid) -> Option<BlobEntry> {
        let path = self.object_path(oid);
        let meta = fs::metadata(&path).ok()?;
        if !meta.is_file() {
            return None;
        }
        Some(BlobEntry {
            oid: *oid,
            path,
            size: meta.len(),
            verified: true,
        })
    }

    /// Open a stored object for streaming read.
    pub fn open(&self, oid: &Oid) -> Result<File> {
        match File::open(self.object_path(oid)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::NotFound(oid.to_hex())),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Read a whole object into memory.
    pub fn read(&self, oid: &Oid) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        self.open(oid)?.read_to_end(&mut content)?;
        Ok(content)
    }

    /// Store content under its claimed OID.
    ///
    /// The digest is recomputed while streaming; on mismatch nothing is kept
    /// and [`Error::Integrity`] is returned.
    pub fn put<R: Read>(&self, oid: &Oid, reader: R) -> Result<BlobEntry> {
        self.put_cancellable(oid, reader, &CancellationToken::new())
    }

    /// Like [`put`](Self::put), checking `cancel` between chunks.
    pub fn put_cancellable<R: Read>(
        &self,
        oid: &Oid,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<BlobEntry> {
        let mut temp = self.reserve_temp(oid)?;
        copy_cancellable(&mut reader, &mut temp, cancel)?;
        temp.commit()
    }

    /// Hash a local file and store it.
    pub fn stage_file<P: AsRef<Path>>(&self, path: P) -> Result<BlobEntry> {
        let (oid, _) = Oid::from_reader(File::open(path.as_ref())?)?;
        if let Some(entry) = self.entry(&oid) {
            return Ok(entry);
        }
        self.put(&oid, File::open(path.as_ref())?)
    }

    /// Reserve a temporary slot for writing an object.
    ///
    /// Nothing is visible at the addressed path until [`TempBlob::commit`].
    pub fn reserve_temp(&self, oid: &Oid) -> Result<TempBlob> {
        let tmp_dir = self.tmp_dir();
        fs::create_dir_all(&tmp_dir)?;
        let file = tempfile::Builder::new()
            .prefix(&format!("{}-", oid.to_hex()))
            .suffix(".tmp")
            .tempfile_in(&tmp_dir)?;

        Ok(TempBlob {
            oid: *oid,
            file,
            hasher: OidHasher::new(),
            final_path: self.object_path(oid),
        })
    }

    /// Re-hash a stored object.
    pub fn verify(&self, oid: &Oid) -> Result<bool> {
        let (actual, _) = Oid::from_reader(self.open(oid)?)?;
        Ok(actual == *oid)
    }

    /// Remove an object from the store.
    pub fn remove(&self, oid: &Oid) -> Result<bool> {
        let path = self.object_path(oid);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Get the total size of stored objects in bytes.
    pub fn size(&self) -> u64 {
        self.iter_objects()
            .filter_map(|(_, path)| fs::metadata(&path).ok())
            .map(|meta| meta.len())
            .sum()
    }

    /// Get the number of stored objects.
    pub fn count(&self) -> usize {
        self.iter_objects().count()
    }

    /// Iterate over all stored objects.
    fn iter_objects(&self) -> impl Iterator<Item = (Oid, PathBuf)> {
        walkdir(self.base_path.clone()).filter_map(|path| {
            let oid = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(|name| Oid::from_hex(name).ok())?;
            Some((oid, path))
        })
    }

    /// Prune objects not referenced by any pointer.
    ///
    /// Takes an iterator of OIDs that should be kept. Returns bytes freed.
    pub fn prune<'a>(&self, keep: impl Iterator<Item = &'a Oid>) -> Result<u64> {
        let keep_set: std::collections::HashSet<_> = keep.copied().collect();
        let mut removed = 0u64;

        for (oid, path) in self.iter_objects() {
            if keep_set.contains(&oid) {
                continue;
            }
            if let Ok(meta) = fs::metadata(&path) {
                if fs::remove_file(&path).is_ok() {
                    removed += meta.len();
                }
            }
        }

        info!(bytes = removed, "pruned content store");
        Ok(removed)
    }

    /// Evict least recently modified objects until the store fits `max_bytes`.
    ///
    /// Objects in `keep` are never evicted. Returns bytes freed.
    pub fn enforce_limit<'a>(
        &self,
        max_bytes: u64,
        keep: impl Iterator<Item = &'a Oid>,
    ) -> Result<u64> {
        let keep_set: std::collections::HashSet<_> = keep.copied().collect();
        let mut objects: Vec<(SystemTime, u64, Oid, PathBuf)> = self
            .iter_objects()
            .filter_map(|(oid, path)| {
                let meta = fs::metadata(&path).ok()?;
                let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                Some((modified, meta.len(), oid, path))
            })
            .collect();

        let mut total: u64 = objects.iter().map(|o| o.1).sum();
        if total <= max_bytes {
            return Ok(0);
        }

        objects.sort_by(|a, b| a.0.cmp(&b.0));
        let mut freed = 0u64;
        for (_, len, oid, path) in objects {
            if total <= max_bytes {
                break;
            }
            if keep_set.contains(&oid) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(%oid, bytes = len, "evicted object");
                    total -= len;
                    freed += len;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        info!(bytes = freed, "content store over limit, evicted objects");
        Ok(freed)
    }

    /// Remove leftover temp files from interrupted writes.
    pub fn sweep_temp(&self) -> Result<usize> {
        let mut removed = 0;
        let entries = match fs::read_dir(self.tmp_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in entries.flatten() {
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Scoped write of one object.
///
/// Bytes go to a temp file and are hashed as they are written. Dropping an
/// uncommitted `TempBlob` deletes its temp file.
pub struct TempBlob {
    oid: Oid,
    file: NamedTempFile,
    hasher: OidHasher,
    final_path: PathBuf,
}

impl TempBlob {
    /// The OID this blob claims to have.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.hasher.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hasher.is_empty()
    }

    /// Open an independent read handle on the data written so far.
    pub fn reopen(&self) -> Result<File> {
        Ok(self.file.reopen()?)
    }

    /// Check that the bytes written so far hash to the claimed OID.
    pub fn check(&self) -> Result<()> {
        let actual = self.hasher.clone().finish();
        if actual != self.oid {
            return Err(Error::Integrity {
                expected: self.oid.to_hex(),
                actual: actual.to_hex(),
            });
        }
        Ok(())
    }

    /// Verify the digest and atomically promote into the store.
    ///
    /// If another writer promoted the same OID first, this blob's data is
    /// discarded and the existing entry returned.
    pub fn commit(self) -> Result<BlobEntry> {
        self.check()?;
        let size = self.hasher.len();

        self.file.as_file().sync_all()?;
        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.file.persist_noclobber(&self.final_path) {
            Ok(_) => {
                debug!(oid = %self.oid, size, "stored object");
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                debug!(oid = %self.oid, "object already stored, discarding duplicate");
            }
            Err(e) => return Err(Error::Io(e.error)),
        }

        Ok(BlobEntry {
            oid: self.oid,
            path: self.final_path,
            size,
            verified: true,
        })
    }
}

impl Write for TempBlob {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Copy a reader into a writer, checking `cancel` before every chunk.
pub(crate) fn copy_cancellable<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.flush()?;
    Ok(total)
}

/// Walk a directory tree and return all file paths.
fn walkdir(base: PathBuf) -> impl Iterator<Item = PathBuf> {
    let mut stack = vec![base];

    std::iter::from_fn(move || {
        while let Some(path) = stack.pop() {
            if path.is_dir() {
                if let Ok(entries) = fs::read_dir(&path) {
                    for entry in entries.flatten() {
                        stack.push(entry.path());
                    }
                }
            } else if path.is_file() {
                return Some(path);
            }
        }
        None
    })
}
