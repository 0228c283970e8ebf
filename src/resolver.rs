//! Path resolution
//!
//! Turns user-supplied paths into canonical bucket paths and provider keys.
//! A canonical path is absolute, has no empty, `.` or `..` segments, and
//! ends with `/` exactly when it names a directory. The bucket root is `/`.

use serde::{Serialize, Serializer};
use std::fmt;

use crate::errors::{GatewayError, Result};

/// Normalized absolute path inside a bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPath {
    segments: Vec<String>,
    is_dir: bool,
}

impl CanonicalPath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            is_dir: true,
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// Last segment; `None` for the root
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Same location in directory form
    pub fn as_dir(&self) -> Self {
        Self {
            segments: self.segments.clone(),
            is_dir: true,
        }
    }

    /// Same location in file form; the root cannot be a file
    pub fn as_file(&self) -> Result<Self> {
        if self.is_root() {
            return Err(GatewayError::InvalidPath(
                "the bucket root is not a file".to_string(),
            ));
        }
        Ok(Self {
            segments: self.segments.clone(),
            is_dir: false,
        })
    }

    /// Enclosing directory; the root is its own parent
    pub fn parent(&self) -> Self {
        let mut segments = self.segments.clone();
        segments.pop();
        Self {
            segments,
            is_dir: true,
        }
    }

    /// Child of a directory path
    pub fn child(&self, name: &str, is_dir: bool) -> Result<Self> {
        let name = validate_segment(name)?;
        let mut segments = self.segments.clone();
        segments.push(name.to_string());
        Ok(Self { segments, is_dir })
    }

    /// Provider key: the canonical form without its leading `/`
    pub fn key(&self) -> String {
        let mut key = self.segments.join("/");
        if self.is_dir && !self.segments.is_empty() {
            key.push('/');
        }
        key
    }

    /// Path as consumers see it below the bucket's mount point
    pub fn mounted_at(&self, mount: &CanonicalPath) -> String {
        let mut segments = mount.segments.clone();
        segments.extend(self.segments.iter().cloned());
        CanonicalPath {
            segments,
            is_dir: self.is_dir,
        }
        .to_string()
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.key())
    }
}

impl Serialize for CanonicalPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

fn validate_segment(segment: &str) -> Result<&str> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(GatewayError::InvalidPath(format!(
            "invalid path segment `{}`",
            segment
        )));
    }
    if segment.chars().any(|c| c.is_control() || c == '\\') {
        return Err(GatewayError::InvalidPath(format!(
            "path segment `{}` contains forbidden characters",
            segment.escape_debug()
        )));
    }
    Ok(segment)
}

/// Resolve `requested` against the directory `cwd`
///
/// Absolute paths start from the bucket root; bare names and relative paths
/// are children of `cwd`. A trailing `/`, `.` or `..` yields a directory.
/// `..` may move up within the bucket; moving above the root fails with
/// `InvalidPath` instead of clamping.
pub fn resolve_path(cwd: &CanonicalPath, requested: &str) -> Result<CanonicalPath> {
    let (mut segments, rest) = match requested.strip_prefix('/') {
        Some(rest) => (Vec::new(), rest),
        None => (cwd.segments.clone(), requested),
    };

    let parts: Vec<&str> = rest.split('/').collect();
    let mut is_dir = requested.is_empty() && cwd.is_dir;
    for (i, part) in parts.iter().enumerate() {
        let last = i + 1 == parts.len();
        match *part {
            "" => {
                if last {
                    is_dir = true;
                }
            }
            "." => is_dir = last || is_dir,
            ".." => {
                if segments.pop().is_none() {
                    return Err(GatewayError::InvalidPath(format!(
                        "{} escapes the bucket root",
                        requested
                    )));
                }
                is_dir = last || is_dir;
            }
            name => {
                segments.push(validate_segment(name)?.to_string());
                is_dir = false;
            }
        }
    }

    let is_dir = is_dir || segments.is_empty();
    Ok(CanonicalPath { segments, is_dir })
}

/// Resolves paths for one bucket
#[derive(Debug, Clone)]
pub struct PathResolver {
    mount: CanonicalPath,
}

impl PathResolver {
    /// `remote_path` is the bucket's mount point and must be absolute
    pub fn new(remote_path: &str) -> Result<Self> {
        Ok(Self {
            mount: canonical_mount(remote_path)?,
        })
    }

    /// Resolve a request path, anchoring relative paths at `cwd`
    pub fn resolve(&self, cwd: Option<&str>, requested: &str) -> Result<ResolvedPath> {
        let cwd = match cwd {
            Some(cwd) if !cwd.is_empty() => resolve_path(&CanonicalPath::root(), cwd)?.as_dir(),
            _ => CanonicalPath::root(),
        };
        let canonical = resolve_path(&cwd, requested)?;
        Ok(ResolvedPath {
            key: canonical.key(),
            mounted: canonical.mounted_at(&self.mount),
            canonical,
        })
    }
}

/// Canonical form of a mount point
pub fn canonical_mount(remote_path: &str) -> Result<CanonicalPath> {
    if !remote_path.starts_with('/') {
        return Err(GatewayError::InvalidPath(format!(
            "mount point {} must start with /",
            remote_path
        )));
    }
    Ok(resolve_path(&CanonicalPath::root(), remote_path)?.as_dir())
}

/// A resolved request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub canonical: CanonicalPath,
    pub key: String,
    pub mounted: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root_resolve(p: &str) -> String {
        resolve_path(&CanonicalPath::root(), p).unwrap().to_string()
    }

    #[test]
    fn test_collapses_separators_and_marks_directories() {
        assert_eq!(root_resolve("/"), "/");
        assert_eq!(root_resolve(""), "/");
        assert_eq!(root_resolve("//a///b//"), "/a/b/");
        assert_eq!(root_resolve("/a/b.csv"), "/a/b.csv");
        assert_eq!(root_resolve("/a/./b/."), "/a/b/");
    }

    #[test]
    fn test_canonical_paths_are_fixed_points() {
        for p in ["/", "/a/", "/a/b/", "/a/b.csv", "/x/y/z"] {
            let once = root_resolve(p);
            assert_eq!(once, p);
            assert_eq!(root_resolve(&once), once);
        }
    }

    #[test]
    fn test_relative_paths_are_children_of_cwd() {
        let cwd = resolve_path(&CanonicalPath::root(), "/data/raw/").unwrap();
        assert_eq!(resolve_path(&cwd, "a.csv").unwrap().to_string(), "/data/raw/a.csv");
        assert_eq!(resolve_path(&cwd, "sub/dir/").unwrap().to_string(), "/data/raw/sub/dir/");
        assert_eq!(resolve_path(&cwd, "../x").unwrap().to_string(), "/data/x");
        assert_eq!(resolve_path(&cwd, "").unwrap().to_string(), "/data/raw/");
    }

    #[test]
    fn test_escaping_the_root_is_rejected() {
        assert!(matches!(
            resolve_path(&CanonicalPath::root(), "/.."),
            Err(GatewayError::InvalidPath(_))
        ));
        assert!(matches!(
            resolve_path(&CanonicalPath::root(), "/a/../../etc/passwd"),
            Err(GatewayError::InvalidPath(_))
        ));
        let cwd = resolve_path(&CanonicalPath::root(), "/a/").unwrap();
        assert!(resolve_path(&cwd, "../..").is_err());
        assert_eq!(resolve_path(&cwd, "..").unwrap().to_string(), "/");
    }

    #[test]
    fn test_parent_is_enclosing_directory() {
        let parent = |p: &str| resolve_path(&CanonicalPath::root(), p).unwrap().parent().to_string();
        assert_eq!(parent("/a/b/"), "/a/");
        assert_eq!(parent("/a/b.csv"), "/a/");
        assert_eq!(parent("/a/"), "/");
        assert_eq!(parent("/"), "/");
    }

    #[test]
    fn test_forbidden_characters_rejected() {
        assert!(resolve_path(&CanonicalPath::root(), "/a\\b").is_err());
        assert!(resolve_path(&CanonicalPath::root(), "/a\u{0}b").is_err());
    }

    #[test]
    fn test_keys_and_mount_points() {
        let resolver = PathResolver::new("//datasets/").unwrap();
        assert_eq!(resolver.resolve(None, "/").unwrap().mounted, "/datasets/");

        let resolved = resolver.resolve(None, "/nested//dir/").unwrap();
        assert_eq!(resolved.key, "nested/dir/");
        assert_eq!(resolved.mounted, "/datasets/nested/dir/");

        let resolved = resolver.resolve(Some("/nested"), "a.csv").unwrap();
        assert_eq!(resolved.key, "nested/a.csv");

        assert_eq!(resolver.resolve(None, "/").unwrap().key, "");
        assert!(PathResolver::new("relative").is_err());
    }

    #[test]
    fn test_keys_round_trip_through_resolution() {
        for key in ["", "a/", "a/b.csv"] {
            assert_eq!(root_resolve(&format!("/{}", key)), format!("/{}", key));
        }
    }

    #[test]
    fn test_name_is_last_segment() {
        let file = resolve_path(&CanonicalPath::root(), "/a/b/c.csv").unwrap();
        assert_eq!(file.name(), Some("c.csv"));
        assert_eq!(CanonicalPath::root().name(), None);
    }
}
