//! File states and the pure name-to-path policies.
//!
//! A [`FileState`] pins one phase of a file's life to one directory. A
//! [`PathPolicy`] maps a logical name to the relative on-disk path of its
//! data file inside a state directory; policies are pure and reversible
//! (the reverse mapping backs `list_names`).

use std::path::{Component, Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// File name of the data file inside an entry directory.
pub const DATA_FILE: &str = "data";

const DOCKER_REPOSITORIES: &str = "docker/registry/v2/repositories";
const DOCKER_BLOBS: &str = "docker/registry/v2/blobs/sha256";

/// One phase of a file's life, pinned to an absolute directory.
///
/// A file exists in exactly one state at any instant; facades bind the
/// states an operation may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    dir: PathBuf,
}

impl FileState {
    /// Bind a state to its directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The state's directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Policy mapping a logical name to a relative on-disk path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPolicy {
    /// `<name>/data`.
    Flat,
    /// `aa/bb/<name>/data`: one directory level per leading digest byte.
    Sharded {
        /// Number of leading digest bytes (two hex characters each) used
        /// as shard directory levels.
        shard_width: usize,
    },
    /// Docker registry tag link:
    /// `docker/registry/v2/repositories/<repo>/_manifests/tags/<tag>/current/link`.
    DockerTag,
    /// Docker registry sharded blob:
    /// `docker/registry/v2/blobs/sha256/<aa>/<name>/data`.
    DockerBlob,
}

/// Default shard width for content-addressed layouts.
pub const DEFAULT_SHARD_WIDTH: usize = 2;

impl Default for PathPolicy {
    fn default() -> Self {
        Self::Sharded {
            shard_width: DEFAULT_SHARD_WIDTH,
        }
    }
}

impl PathPolicy {
    /// Relative path of the data file for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidName`] when the name violates the
    /// policy's shape requirements.
    pub fn relative_path(&self, name: &str) -> StoreResult<PathBuf> {
        validate_name(name)?;
        match self {
            Self::Flat => Ok(Path::new(name).join(DATA_FILE)),
            Self::Sharded { shard_width } => {
                if name.len() < 2 * shard_width {
                    return Err(StoreError::InvalidName {
                        name: name.to_string(),
                        reason: "name shorter than shard prefix",
                    });
                }
                let mut path = PathBuf::new();
                for level in 0..*shard_width {
                    path.push(&name[2 * level..2 * level + 2]);
                }
                path.push(name);
                path.push(DATA_FILE);
                Ok(path)
            }
            Self::DockerTag => {
                let (repo, tag) = split_repo_tag(name)?;
                let mut path = PathBuf::from(DOCKER_REPOSITORIES);
                path.push(repo);
                path.push("_manifests/tags");
                path.push(tag);
                path.push("current/link");
                Ok(path)
            }
            Self::DockerBlob => {
                if name.len() < 2 {
                    return Err(StoreError::InvalidName {
                        name: name.to_string(),
                        reason: "name shorter than shard prefix",
                    });
                }
                let mut path = PathBuf::from(DOCKER_BLOBS);
                path.push(&name[..2]);
                path.push(name);
                path.push(DATA_FILE);
                Ok(path)
            }
        }
    }

    /// Recover the logical name from a relative data-file path, when the
    /// path matches this policy's shape.
    #[must_use]
    pub fn name_from_relative(&self, relative: &Path) -> Option<String> {
        match self {
            Self::Flat | Self::Sharded { .. } | Self::DockerBlob => {
                if relative.file_name()?.to_str()? != DATA_FILE {
                    return None;
                }
                let name = relative.parent()?.file_name()?.to_str()?.to_string();
                // Round-trip to reject paths from a different layout.
                (self.relative_path(&name).ok()? == relative).then_some(name)
            }
            Self::DockerTag => {
                let tail = relative.strip_prefix(DOCKER_REPOSITORIES).ok()?;
                let parts: Vec<&str> = tail.iter().map(|c| c.to_str()).collect::<Option<_>>()?;
                // <repo...>/_manifests/tags/<tag>/current/link
                let manifests = parts.iter().position(|p| *p == "_manifests")?;
                if parts.len() != manifests + 5
                    || parts[manifests + 1] != "tags"
                    || parts[manifests + 3] != "current"
                    || parts[manifests + 4] != "link"
                {
                    return None;
                }
                let repo = parts[..manifests].join("/");
                let tag = parts[manifests + 2];
                Some(format!("{repo}:{tag}"))
            }
        }
    }
}

/// Reject names with path-like components.
///
/// Names are opaque identifiers, not paths: empty names, absolute
/// prefixes, and `..` components are forbidden. Interior `/` is allowed
/// (Docker repository names contain it).
///
/// # Errors
///
/// Returns [`StoreError::InvalidName`] on violation.
pub fn validate_name(name: &str) -> StoreResult<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidName {
            name: name.to_string(),
            reason: "empty",
        });
    }
    if name.starts_with('/') {
        return Err(StoreError::InvalidName {
            name: name.to_string(),
            reason: "absolute prefix",
        });
    }
    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(StoreError::InvalidName {
                    name: name.to_string(),
                    reason: "path traversal component",
                });
            }
        }
    }
    Ok(())
}

fn split_repo_tag(name: &str) -> StoreResult<(&str, &str)> {
    let (repo, tag) = name.split_once(':').ok_or_else(|| StoreError::InvalidName {
        name: name.to_string(),
        reason: "expected repo:tag",
    })?;
    if repo.is_empty() {
        return Err(StoreError::InvalidName {
            name: name.to_string(),
            reason: "repo must be non-empty",
        });
    }
    if tag.is_empty() {
        return Err(StoreError::InvalidName {
            name: name.to_string(),
            reason: "tag must be non-empty",
        });
    }
    Ok((repo, tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_layout() -> anyhow::Result<()> {
        let policy = PathPolicy::Flat;
        assert_eq!(policy.relative_path("abcd")?, Path::new("abcd/data"));
        assert_eq!(
            policy.name_from_relative(Path::new("abcd/data")),
            Some("abcd".to_string())
        );
        Ok(())
    }

    #[test]
    fn sharded_layout() -> anyhow::Result<()> {
        let policy = PathPolicy::default();
        assert_eq!(
            policy.relative_path("0123abcd")?,
            Path::new("01/23/0123abcd/data")
        );
        assert_eq!(
            policy.name_from_relative(Path::new("01/23/0123abcd/data")),
            Some("0123abcd".to_string())
        );
        // Shard dirs must agree with the name.
        assert_eq!(
            policy.name_from_relative(Path::new("99/23/0123abcd/data")),
            None
        );
        assert!(policy.relative_path("012").is_err());
        Ok(())
    }

    #[test]
    fn sharded_width_is_configurable() -> anyhow::Result<()> {
        let policy = PathPolicy::Sharded { shard_width: 3 };
        assert_eq!(
            policy.relative_path("0123456789")?,
            Path::new("01/23/45/0123456789/data")
        );
        assert!(policy.relative_path("01234").is_err());
        Ok(())
    }

    #[test]
    fn docker_tag_layout() -> anyhow::Result<()> {
        let policy = PathPolicy::DockerTag;
        assert_eq!(
            policy.relative_path("repo-bar:latest")?,
            Path::new("docker/registry/v2/repositories/repo-bar/_manifests/tags/latest/current/link")
        );
        // Nested repository names keep their slashes.
        assert_eq!(
            policy.relative_path("ns/repo:v1")?,
            Path::new("docker/registry/v2/repositories/ns/repo/_manifests/tags/v1/current/link")
        );
        assert_eq!(
            policy.name_from_relative(Path::new(
                "docker/registry/v2/repositories/ns/repo/_manifests/tags/v1/current/link"
            )),
            Some("ns/repo:v1".to_string())
        );
        assert!(policy.relative_path("repo:").is_err());
        assert!(policy.relative_path(":tag").is_err());
        assert!(policy.relative_path("repo").is_err());
        Ok(())
    }

    #[test]
    fn docker_blob_layout() -> anyhow::Result<()> {
        let policy = PathPolicy::DockerBlob;
        let name = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        assert_eq!(
            policy.relative_path(name)?,
            Path::new(&format!("docker/registry/v2/blobs/sha256/e3/{name}/data"))
        );
        assert_eq!(
            policy.name_from_relative(&policy.relative_path(name)?),
            Some(name.to_string())
        );
        Ok(())
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("abc").is_ok());
        assert!(validate_name("ns/repo").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("/abc").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name("..").is_err());
    }
}
