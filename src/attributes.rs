//! `.gitattributes` handling: which paths are stored through LFS.

use std::fs;
use std::io;
use std::path::Path;

use crate::tree::normalize_path;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    pattern: String,
    tracked: bool,
}

/// The `filter=lfs` rules of one `.gitattributes` file.
///
/// Later lines override earlier ones, so `*.uasset filter=lfs` followed by
/// `Config/*.uasset -filter` leaves the config assets in plain git.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackPatterns {
    rules: Vec<Rule>,
}

impl TrackPatterns {
    /// Parse the content of a `.gitattributes` file.
    pub fn parse(content: &str) -> Self {
        let mut rules = Vec::new();

        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut tokens = line.split_whitespace();
            let pattern = match tokens.next() {
                Some(p) => p,
                None => continue,
            };

            let tracked = tokens.fold(None, |state, attr| match attr {
                "filter=lfs" => Some(true),
                "-filter" | "!filter" => Some(false),
                a if a.starts_with("filter=") => Some(false),
                _ => state,
            });

            if let Some(tracked) = tracked {
                rules.push(Rule {
                    pattern: pattern.to_string(),
                    tracked,
                });
            }
        }

        TrackPatterns { rules }
    }

    /// Read `.gitattributes` at `path`; a missing file tracks nothing.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        match fs::read_to_string(path.as_ref()) {
            Ok(content) => Ok(TrackPatterns::parse(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(TrackPatterns::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Patterns that route files through LFS.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(|r| r.tracked)
            .map(|r| r.pattern.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether the repository-relative `path` is stored through LFS.
    pub fn is_tracked(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.rules
            .iter()
            .rev()
            .find(|rule| pattern_matches(&rule.pattern, &path))
            .map_or(false, |rule| rule.tracked)
    }
}

/// Match a gitattributes pattern against a slash-separated path.
///
/// A pattern without a slash matches the file name at any depth.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim_start_matches('/');

    if !pattern.contains('/') {
        let name = path.rsplit('/').next().unwrap_or(path);
        return glob_match(pattern.as_bytes(), name.as_bytes());
    }

    // Handle **/pattern (matches in any directory)
    if let Some(suffix) = pattern.strip_prefix("**/") {
        if glob_match(suffix.as_bytes(), path.as_bytes()) {
            return true;
        }
    }

    glob_match(pattern.as_bytes(), path.as_bytes())
}

/// Glob matching: `*` stays within one path segment, `**` crosses them, `?`
/// is any single non-slash byte.
fn glob_match(pattern: &[u8], path: &[u8]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(b'*') if pattern.get(1) == Some(&b'*') => {
            let rest = pattern[2..].strip_prefix(b"/").unwrap_or(&pattern[2..]);
            (0..=path.len()).any(|i| glob_match(rest, &path[i..]))
        }
        Some(b'*') => {
            let rest = &pattern[1..];
            for i in 0..=path.len() {
                if glob_match(rest, &path[i..]) {
                    return true;
                }
                if path.get(i) == Some(&b'/') {
                    break;
                }
            }
            false
        }
        Some(b'?') => match path.first() {
            Some(&c) if c != b'/' => glob_match(&pattern[1..], &path[1..]),
            _ => false,
        },
        Some(&c) => path.first() == Some(&c) && glob_match(&pattern[1..], &path[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const UE_ATTRIBUTES: &str = "\
# Unreal binary assets
*.uasset filter=lfs diff=lfs merge=lfs -text
*.umap filter=lfs diff=lfs merge=lfs -text
Content/Movies/** filter=lfs diff=lfs merge=lfs -text
*.ini text eol=lf
Config/*.uasset -filter
";

    #[test]
    fn test_extension_patterns() {
        let patterns = TrackPatterns::parse(UE_ATTRIBUTES);
        assert!(patterns.is_tracked("Hero.uasset"));
        assert!(patterns.is_tracked("Content/Characters/Hero.uasset"));
        assert!(patterns.is_tracked("Content\\Maps\\Arena.umap"));
        assert!(!patterns.is_tracked("Config/DefaultGame.ini"));
        assert!(!patterns.is_tracked("Source/Game/Game.cpp"));
    }

    #[test]
    fn test_directory_patterns() {
        let patterns = TrackPatterns::parse(UE_ATTRIBUTES);
        assert!(patterns.is_tracked("Content/Movies/intro.mp4"));
        assert!(patterns.is_tracked("Content/Movies/Season1/ep1.mp4"));
        assert!(!patterns.is_tracked("Content/Audio/intro.mp4"));
    }

    #[test]
    fn test_later_rule_overrides() {
        let patterns = TrackPatterns::parse(UE_ATTRIBUTES);
        assert!(!patterns.is_tracked("Config/Splash.uasset"));
        assert!(patterns.is_tracked("Content/Config/Splash.uasset"));
    }

    #[test]
    fn test_patterns_listing() {
        let patterns = TrackPatterns::parse(UE_ATTRIBUTES);
        let tracked: Vec<_> = patterns.patterns().collect();
        assert_eq!(tracked, vec!["*.uasset", "*.umap", "Content/Movies/**"]);
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"assets/*", b"assets/image.png"));
        assert!(!glob_match(b"assets/*", b"assets/sub/image.png"));
        assert!(glob_match(b"**/*.bin", b"a/b/c.bin"));
        assert!(glob_match(b"data?.bin", b"data1.bin"));
        assert!(!glob_match(b"data?.bin", b"data.bin"));
    }

    #[test]
    fn test_load_missing_file() {
        let td = TempDir::new().unwrap();
        let patterns = TrackPatterns::load(td.path().join(".gitattributes")).unwrap();
        assert!(patterns.is_empty());
        assert!(!patterns.is_tracked("Hero.uasset"));
    }
}
