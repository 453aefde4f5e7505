//! Walks the ingestion roots, loads allowlisted files and fingerprints their content.

use crate::config::IngestConfig;
use crate::models::{fingerprint, FileKind, SourceFile};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub async fn ingest(cfg: &IngestConfig) -> anyhow::Result<Vec<SourceFile>> {
    let (tx, mut rx) = mpsc::channel(100);
    let exclude_set = build_globset(&cfg.exclude)?;
    let allowlist = Allowlist::new(&cfg.code_extensions, &cfg.config_extensions);
    let roots: Vec<PathBuf> = cfg.roots.iter().map(PathBuf::from).collect();
    let max_bytes = cfg.max_file_bytes;

    // Walker task
    let walker_handle = task::spawn_blocking(move || {
        for root in roots {
            if !root.exists() {
                warn!(root = %root.display(), "ingestion root does not exist");
                continue;
            }
            for entry in WalkDir::new(&root)
                .follow_links(true)
                .into_iter()
                .filter_entry(|e| {
                    e.depth() == 0 || should_descend(&root, e.path(), false, &exclude_set)
                })
            {
                let entry = match entry {
                    Ok(e) => e,
                    Err(_) => continue,
                };

                let path = entry.path();
                if path.is_dir() || is_excluded(&root, path, &exclude_set) || is_hidden(path) {
                    continue;
                }
                let kind = match allowlist.kind_of(path) {
                    Some(k) => k,
                    None => continue,
                };
                if let Some(limit) = max_bytes {
                    if fs::metadata(path).map(|m| m.len() > limit).unwrap_or(true) {
                        debug!(path = %path.display(), "skipping oversized file");
                        continue;
                    }
                }

                let file = match load(&root, path, kind) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable file");
                        continue;
                    }
                };

                if tx.blocking_send(file).is_err() {
                    // Receiver dropped, stop walking.
                    break;
                }
            }
        }
    });

    let mut files = Vec::new();
    while let Some(file) = rx.recv().await {
        files.push(file);
    }

    walker_handle.await?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    info!(files = files.len(), "ingestion complete");
    Ok(files)
}

fn load(root: &Path, path: &Path, kind: FileKind) -> anyhow::Result<SourceFile> {
    let bytes = fs::read(path)?;
    let fingerprint = fingerprint(&bytes);
    let content = String::from_utf8(bytes)?;
    let relative = path.strip_prefix(root).unwrap_or(path);
    let project = project_of(root, relative);
    Ok(SourceFile {
        path: path.to_string_lossy().replace('\\', "/"),
        relative_path: relative.to_string_lossy().replace('\\', "/"),
        project,
        kind,
        content,
        fingerprint,
    })
}

/// First directory below the root, or the root's own name for top-level files.
fn project_of(root: &Path, relative: &Path) -> String {
    let mut components = relative.components();
    let first = components.next();
    match (first, components.next()) {
        (Some(dir), Some(_)) => dir.as_os_str().to_string_lossy().into_owned(),
        _ => root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

struct Allowlist {
    kinds: HashMap<String, FileKind>,
}

impl Allowlist {
    fn new(code: &[String], configuration: &[String]) -> Self {
        let mut kinds = HashMap::new();
        for ext in code {
            kinds.insert(normalize_ext(ext), FileKind::Code);
        }
        for ext in configuration {
            kinds.insert(normalize_ext(ext), FileKind::Configuration);
        }
        Self { kinds }
    }

    fn kind_of(&self, path: &Path) -> Option<FileKind> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        self.kinds.get(&ext).copied()
    }
}

fn normalize_ext(ext: &str) -> String {
    ext.trim_start_matches('.').to_lowercase()
}

fn build_globset(patterns: &[String]) -> anyhow::Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pat in patterns {
        let glob = Glob::new(pat)?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

fn should_descend(root: &Path, path: &Path, include_hidden: bool, excludes: &GlobSet) -> bool {
    if is_excluded(root, path, excludes) {
        return false;
    }
    if !include_hidden && is_hidden(path) {
        return false;
    }
    true
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

/// Globs see the path below the ingestion root, never the directories above it.
fn is_excluded(root: &Path, path: &Path, excludes: &GlobSet) -> bool {
    excludes.is_match(path.strip_prefix(root).unwrap_or(path))
}
