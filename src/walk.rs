//! Source tree traversal.
//!
//! [`DirectoryWalker::plan`] fixes the processing order of every directory
//! below the root (post-order, siblings by file name);
//! [`DirectoryWalker::list`] enumerates one directory's files when the
//! pipeline reaches it.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::IngestError;
use crate::media::SourceFile;

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    /// Skip dot-directories below the root.
    pub skip_hidden: bool,
    pub follow_links: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            skip_hidden: false,
            follow_links: true,
        }
    }
}

/// A subtree that could not be descended into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Directories in processing order plus the subtrees that were lost.
#[derive(Debug, Clone, Default)]
pub struct WalkPlan {
    pub directories: Vec<PathBuf>,
    pub failures: Vec<WalkFailure>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryWalker {
    options: WalkOptions,
}

fn is_hidden_dir(entry: &DirEntry) -> bool {
    // Never skip the root; tempfile roots can be dot-dirs.
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry.file_name().to_str().is_some_and(|n| n.starts_with('.'))
}

impl DirectoryWalker {
    pub fn new(options: WalkOptions) -> Self {
        Self { options }
    }

    /// Every directory under `root` (inclusive), children before parents.
    ///
    /// # Errors
    /// Fails only when the root itself cannot be read; deeper failures are
    /// collected in [`WalkPlan::failures`] and the rest of the tree is kept.
    pub fn plan(&self, root: &Path) -> Result<WalkPlan, IngestError> {
        let skip_hidden = self.options.skip_hidden;
        let walker = WalkDir::new(root)
            .follow_links(self.options.follow_links)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |e| !(skip_hidden && is_hidden_dir(e)));

        let mut plan = WalkPlan::default();
        // (depth, path) of directories still open in pre-order.
        let mut open: Vec<(usize, PathBuf)> = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().unwrap_or(root).to_path_buf();
                    if err.depth() == 0 {
                        let source = err
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("filesystem loop at root"));
                        return Err(IngestError::io(path, source));
                    }
                    // The unreadable directory was already yielded; drop it.
                    if open.last().is_some_and(|(_, p)| *p == path) {
                        open.pop();
                    }
                    warn!(path = %path.display(), error = %err, "walk: subtree skipped");
                    plan.failures.push(WalkFailure {
                        path,
                        reason: err.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            while open.last().is_some_and(|(depth, _)| *depth >= entry.depth()) {
                if let Some((_, done)) = open.pop() {
                    plan.directories.push(done);
                }
            }
            open.push((entry.depth(), entry.into_path()));
        }
        while let Some((_, done)) = open.pop() {
            plan.directories.push(done);
        }

        if plan.directories.is_empty() {
            return Err(IngestError::io(
                root,
                std::io::Error::new(std::io::ErrorKind::NotADirectory, "source root is not a directory"),
            ));
        }
        debug!(root = %root.display(), dirs = plan.directories.len(), "walk planned");
        Ok(plan)
    }

    /// Non-directory entries of `dir`, sorted by name.
    ///
    /// Directory-ness is tested on `dir/<name>`, never on the bare name.
    /// Entries whose metadata cannot be read are still returned so that the
    /// failure surfaces when they are resolved.
    pub fn list(&self, dir: &Path) -> Result<Vec<SourceFile>, IngestError> {
        let entries = fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IngestError::io(dir, e))?;
            let name = entry.file_name();
            let source_path = dir.join(&name);
            let meta = if self.options.follow_links {
                fs::metadata(&source_path)
            } else {
                fs::symlink_metadata(&source_path)
            };
            if meta.is_ok_and(|m| m.is_dir()) {
                continue;
            }
            files.push(SourceFile {
                name: name.to_string_lossy().into_owned(),
                source_path,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }
}
