//! File discovery.

use std::path::Path;

use anyhow::Result;
use ignore::WalkBuilder;
use tracing::debug;

use crate::chunk::content_hash;
use crate::parser::SourceFile;

/// Directories never worth indexing, gitignore or not.
const SKIP_DIRS: &[&str] = &[
    "target",
    "node_modules",
    ".git",
    "dist",
    "build",
    ".next",
    "vendor",
    "__pycache__",
    ".venv",
];

/// A scanned file together with its content hash.
#[derive(Debug, Clone)]
pub struct HashedFile {
    pub file: SourceFile,
    pub hash: String,
}

/// Walk `root` and collect matching source files, hashed and sorted by path.
///
/// Paths in the result are relative to `root`. Files that cannot be read as
/// UTF-8 are skipped.
pub fn collect_sources(
    root: &Path,
    extensions: &[String],
    respect_gitignore: bool,
) -> Result<Vec<HashedFile>> {
    let mut files = Vec::new();

    let walker = WalkBuilder::new(root)
        .git_ignore(respect_gitignore)
        .git_global(respect_gitignore)
        .git_exclude(respect_gitignore)
        .hidden(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && SKIP_DIRS.contains(&name.as_ref()))
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }

        let path = entry.path();
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| extensions.iter().any(|allowed| allowed == e))
            .unwrap_or(false);
        if !matches_ext {
            continue;
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                debug!(path = %path.display(), "skipping unreadable file: {e}");
                continue;
            }
        };

        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let hash = content_hash(&content);
        files.push(HashedFile {
            file: SourceFile { path: rel, content },
            hash,
        });
    }

    files.sort_by(|a, b| a.file.path.cmp(&b.file.path));
    debug!(count = files.len(), "collected source files");
    Ok(files)
}
