//! Working-directory snapshots for per-iteration changed-file lists.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

/// Directories never scanned (VCS internals and build output).
const EXCLUDED_DIRS: &[&str] = &[".git", ".hg", ".svn", "target", "node_modules"];

/// File fingerprint: size plus modification time in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    len: u64,
    modified_ns: u128,
}

/// Relative path -> fingerprint for every regular file under a root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    files: BTreeMap<String, Fingerprint>,
}

impl Snapshot {
    pub fn capture(root: &Path) -> Result<Snapshot> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && e
                            .file_name()
                            .to_str()
                            .is_some_and(|name| EXCLUDED_DIRS.contains(&name)))
            });
        for entry in walker {
            let entry = entry.with_context(|| format!("walk {}", root.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let meta = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            let modified_ns = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            files.insert(
                rel,
                Fingerprint {
                    len: meta.len(),
                    modified_ns,
                },
            );
        }
        debug!(root = %root.display(), files = files.len(), "snapshot captured");
        Ok(Snapshot { files })
    }

    /// Paths added, removed, or modified between `self` and `after`, sorted.
    pub fn changed_files(&self, after: &Snapshot) -> Vec<String> {
        let mut changed: Vec<String> = after
            .files
            .iter()
            .filter(|(path, fp)| self.files.get(*path) != Some(fp))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            self.files
                .keys()
                .filter(|path| !after.files.contains_key(*path))
                .cloned(),
        );
        changed.sort();
        changed
    }
}
