use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{Error, Result};

/// The manifest file chosen for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestTarget {
    /// Path relative to the repository root
    pub path: PathBuf,
    /// Other files that also mention the identifier, in traversal order
    pub alternatives: Vec<PathBuf>,
}

impl ManifestTarget {
    pub fn is_ambiguous(&self) -> bool {
        !self.alternatives.is_empty()
    }
}

/// Find the YAML file under `repo_root` that deploys `identifier`.
///
/// A hint naming an existing file is taken as is. A hint naming a directory
/// narrows the search to that tree; a missing hint or one outside the
/// repository falls back to searching everything. The search visits files in
/// file-name order and the first `.yaml`/`.yml` whose content contains the
/// identifier wins.
pub fn locate(repo_root: &Path, hint: Option<&Path>, identifier: &str) -> Result<ManifestTarget> {
    let root = repo_root.canonicalize()?;

    let search_root = match hint.and_then(|hint| resolve_hint(&root, hint)) {
        Some(file) if file.is_file() => {
            debug!(path = %file.display(), "Using manifest hint");
            return Ok(ManifestTarget {
                path: relative_to(&root, &file),
                alternatives: Vec::new(),
            });
        }
        Some(dir) if dir.is_dir() => dir,
        _ => {
            if let Some(hint) = hint {
                warn!(hint = %hint.display(), "Manifest hint not found in repository, searching all of it");
            }
            root.clone()
        }
    };

    let mut matches = WalkDir::new(&search_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git")
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable path");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file() && is_yaml(entry))
        .filter(|entry| mentions(entry.path(), identifier))
        .map(|entry| relative_to(&root, entry.path()));

    let Some(path) = matches.next() else {
        return Err(Error::ManifestNotFound {
            identifier: identifier.to_string(),
            searched: search_root,
        });
    };
    let alternatives: Vec<PathBuf> = matches.collect();

    if !alternatives.is_empty() {
        warn!(
            chosen = %path.display(),
            others = ?alternatives,
            identifier,
            "Several manifests mention the service; using the first"
        );
    }

    Ok(ManifestTarget { path, alternatives })
}

fn resolve_hint(root: &Path, hint: &Path) -> Option<PathBuf> {
    let candidate = if hint.is_absolute() {
        hint.to_path_buf()
    } else {
        root.join(hint)
    };
    let resolved = candidate.canonicalize().ok()?;
    resolved.starts_with(root).then_some(resolved)
}

fn is_yaml(entry: &DirEntry) -> bool {
    matches!(
        entry.path().extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    )
}

fn mentions(path: &Path, identifier: &str) -> bool {
    match std::fs::read_to_string(path) {
        Ok(content) => content.contains(identifier),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Skipping unreadable manifest candidate");
            false
        }
    }
}

fn relative_to(root: &Path, path: &Path) -> PathBuf {
    path.strip_prefix(root)
        .map(|p| p.components().filter(|c| !matches!(c, Component::CurDir)).collect::<PathBuf>())
        .unwrap_or_else(|_| path.to_path_buf())
}
