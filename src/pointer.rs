//! LFS pointer file format.
//!
//! LFS pointer files are small text files that replace large files in the
//! version-control tree. They contain metadata about the actual file stored in
//! LFS. The encoded form is what gets committed, so encoding is canonical:
//! `version` first, then every other key in ascending order.

use std::collections::BTreeMap;
use std::io::Read;

use crate::{Error, Oid, Result};

/// LFS specification version.
pub const LFS_SPEC_V1: &str = "https://git-lfs.github.com/spec/v1";

/// Pre-release spec tag still found in old repositories.
const HAWSER_SPEC_V1: &str = "https://hawser.github.com/spec/v1";

/// Maximum size of an LFS pointer file (1KB).
pub const MAX_POINTER_SIZE: usize = 1024;

/// An LFS pointer representing a file stored in LFS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    /// The SHA256 hash of the file content.
    oid: Oid,
    /// The size of the file in bytes.
    size: u64,
    /// Extension and unknown keys, preserved as-is.
    extensions: BTreeMap<String, String>,
}

impl Pointer {
    /// Create a new pointer with the given OID and size.
    pub fn new(oid: Oid, size: u64) -> Self {
        Pointer {
            oid,
            size,
            extensions: BTreeMap::new(),
        }
    }

    /// Create a pointer from file content.
    ///
    /// This computes the SHA256 hash of the content.
    pub fn from_content(content: &[u8]) -> Self {
        Pointer::new(Oid::from_content(content), content.len() as u64)
    }

    /// Create a pointer by streaming content from a reader.
    ///
    /// This computes the SHA256 hash while reading, avoiding loading
    /// the entire content into memory at once.
    pub fn from_reader<R: Read>(reader: R) -> std::io::Result<Self> {
        let (oid, size) = Oid::from_reader(reader)?;
        Ok(Pointer::new(oid, size))
    }

    /// Attach an extension key.
    ///
    /// Keys are limited to `[a-z0-9.-]` and may not shadow `version`, `oid`
    /// or `size`; values may not contain line breaks.
    pub fn with_extension(mut self, key: &str, value: &str) -> Result<Self> {
        if !is_valid_key(key) || matches!(key, "version" | "oid" | "size") {
            return Err(Error::InvalidPointer(format!(
                "invalid extension key: {:?}",
                key
            )));
        }
        if value.is_empty() || value.contains(['\n', '\r']) || value.trim() != value {
            return Err(Error::InvalidPointer(format!(
                "invalid value for extension {}",
                key
            )));
        }
        self.extensions.insert(key.to_string(), value.to_string());
        Ok(self)
    }

    /// Parse a pointer from its text representation.
    pub fn parse(content: &[u8]) -> Result<Self> {
        // Check size first
        if content.len() > MAX_POINTER_SIZE {
            return Err(Error::InvalidPointer(
                "content too large to be a pointer".into(),
            ));
        }

        let text = std::str::from_utf8(content)
            .map_err(|_| Error::InvalidPointer("invalid UTF-8".into()))?;

        let mut version_found = false;
        let mut oid: Option<Oid> = None;
        let mut size: Option<u64> = None;
        let mut extensions = BTreeMap::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once(' ')
                .ok_or_else(|| Error::InvalidPointer(format!("malformed line: {:?}", line)))?;
            let value = value.trim();

            match key {
                "version" => {
                    if version_found {
                        return Err(Error::InvalidPointer("duplicate version".into()));
                    }
                    if value != LFS_SPEC_V1 && value != HAWSER_SPEC_V1 {
                        return Err(Error::InvalidPointer(format!(
                            "unsupported version: {}",
                            value
                        )));
                    }
                    version_found = true;
                }
                "oid" => {
                    if oid.is_some() {
                        return Err(Error::InvalidPointer("duplicate oid".into()));
                    }
                    let hex = value.strip_prefix("sha256:").ok_or_else(|| {
                        Error::InvalidOid(format!("unsupported hash algorithm: {}", value))
                    })?;
                    oid = Some(Oid::from_hex(hex)?);
                }
                "size" => {
                    if size.is_some() {
                        return Err(Error::InvalidPointer("duplicate size".into()));
                    }
                    if !value.bytes().all(|b| b.is_ascii_digit()) {
                        return Err(Error::InvalidPointer("invalid size".into()));
                    }
                    size = Some(
                        value
                            .parse()
                            .map_err(|_| Error::InvalidPointer("invalid size".into()))?,
                    );
                }
                other => {
                    if !is_valid_key(other) || value.is_empty() {
                        return Err(Error::InvalidPointer(format!(
                            "malformed line: {:?}",
                            line
                        )));
                    }
                    if extensions
                        .insert(other.to_string(), value.to_string())
                        .is_some()
                    {
                        return Err(Error::InvalidPointer(format!("duplicate key: {}", other)));
                    }
                }
            }
        }

        if !version_found {
            return Err(Error::InvalidPointer("missing version".into()));
        }

        match (oid, size) {
            (Some(oid), Some(size)) => Ok(Pointer {
                oid,
                size,
                extensions,
            }),
            (None, _) => Err(Error::InvalidPointer("missing oid".into())),
            (_, None) => Err(Error::InvalidPointer("missing size".into())),
        }
    }

    /// Check if content looks like an LFS pointer.
    pub fn is_pointer(content: &[u8]) -> bool {
        if content.len() > MAX_POINTER_SIZE {
            return false;
        }
        content.starts_with(b"version https://git-lfs.github.com/spec/v1")
            || content.starts_with(b"version https://hawser.github.com/spec/v1")
    }

    /// Get the OID of this pointer.
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Get the size of the file.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Extension and unknown keys carried by this pointer.
    pub fn extensions(&self) -> &BTreeMap<String, String> {
        &self.extensions
    }

    /// Encode the pointer to its canonical text representation.
    pub fn encode(&self) -> String {
        let mut lines: Vec<(&str, String)> = self
            .extensions
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        lines.push(("oid", format!("sha256:{}", self.oid.to_hex())));
        lines.push(("size", self.size.to_string()));
        lines.sort_by(|a, b| a.0.cmp(b.0));

        let mut out = format!("version {}\n", LFS_SPEC_V1);
        for (key, value) in lines {
            out.push_str(key);
            out.push(' ');
            out.push_str(&value);
            out.push('\n');
        }
        out
    }

    /// Encode the pointer to bytes.
    pub fn encode_bytes(&self) -> Vec<u8> {
        self.encode().into_bytes()
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-'))
}
