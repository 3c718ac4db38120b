//! Lightweight git awareness for branch scoping.
//!
//! Branch detection only needs the current branch name and the repository's
//! default branch, so this reads `.git` plumbing files directly instead of
//! shelling out or linking a git library.

use std::fs;
use std::path::{Path, PathBuf};

/// Supplies branch context for the index. All methods are best-effort;
/// `None` means "no usable git context" and the index falls back to the
/// unscoped default branch.
pub trait GitInfo: Send + Sync {
    /// Currently checked-out branch, if any. Detached HEAD yields `None`.
    fn branch(&self) -> Option<String>;

    /// The repository's default branch, if determinable.
    fn default_branch(&self) -> Option<String>;
}

/// Git context for trees that are not repositories.
pub struct NoGit;

impl GitInfo for NoGit {
    fn branch(&self) -> Option<String> {
        None
    }

    fn default_branch(&self) -> Option<String> {
        None
    }
}

/// Reads branch state from `.git/HEAD` and friends.
pub struct HeadFileGit {
    git_dir: PathBuf,
}

impl HeadFileGit {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            git_dir: root.as_ref().join(".git"),
        }
    }

    /// Returns `Some` only if `root` actually contains a `.git` directory.
    pub fn discover(root: impl AsRef<Path>) -> Option<Self> {
        let git_dir = root.as_ref().join(".git");
        if git_dir.is_dir() {
            Some(Self { git_dir })
        } else {
            None
        }
    }
}

impl GitInfo for HeadFileGit {
    fn branch(&self) -> Option<String> {
        let head = fs::read_to_string(self.git_dir.join("HEAD")).ok()?;
        let head = head.trim();
        head.strip_prefix("ref: refs/heads/")
            .map(|name| name.to_string())
    }

    fn default_branch(&self) -> Option<String> {
        // Cloned repositories record the remote default here.
        if let Ok(head) = fs::read_to_string(self.git_dir.join("refs/remotes/origin/HEAD")) {
            if let Some(name) = head.trim().strip_prefix("ref: refs/remotes/origin/") {
                return Some(name.to_string());
            }
        }
        for candidate in ["main", "master"] {
            if self.git_dir.join("refs/heads").join(candidate).is_file() {
                return Some(candidate.to_string());
            }
        }
        None
    }
}
