// SPDX-License-Identifier: MIT

//! Discovers repository directories below the watched root.
//!
//! A repository is a directory holding exactly one `.xml` catalog. The
//! index compares what is on disk with the stored repository records by
//! path; an edited catalog keeps its path and therefore stays the same
//! repository.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::catalog::CatalogSource;
use crate::debug::print_step;
use crate::store::RepositoryRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryCandidate {
    /// Catalog path relative to the root, `r440/Catalog.xml`. This is the
    /// repository record's unique name.
    pub file_name: String,
    /// Absolute repository directory.
    pub file_path: PathBuf,
    pub catalog_path: PathBuf,
    /// Repository directory relative to the root, empty for the root itself.
    pub folder: String,
    /// Stem of the intermediate artifacts.
    pub repo_id: String,
}

impl RepositoryCandidate {
    pub fn source(&self) -> CatalogSource {
        CatalogSource {
            catalog_path: self.catalog_path.clone(),
            folder: self.folder.clone(),
            xml_file_name: self.file_name.clone(),
        }
    }

    pub fn record_path(&self) -> String {
        self.file_path.display().to_string()
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RepositoryDelta {
    pub added: Vec<RepositoryCandidate>,
    pub removed: Vec<RepositoryRecord>,
}

impl RepositoryDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Escapes the characters the artifact stem gives a meaning to.
fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('_', "%5F")
}

/// Artifact stem for a repository folder: `site/r440` becomes `site_r440`.
///
/// `%` and `_` inside folder names are percent-escaped first, so the stem
/// is unique per folder (`a/b` is `a_b`, `a_b` is `a%5Fb`) and its only
/// bare underscores separate path segments. A catalog directly in the root
/// uses the root's own directory name followed by `%2F`, which no folder
/// stem can contain.
pub fn repo_id(root: &Path, folder: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        let name = root
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("root");
        return format!("{}%2F", escape_segment(name));
    }
    folder
        .split('/')
        .map(escape_segment)
        .collect::<Vec<_>>()
        .join("_")
}

/// Folder part of a stored `file_name`.
pub fn folder_of(file_name: &str) -> String {
    match file_name.rsplit_once('/') {
        Some((folder, _)) => folder.to_string(),
        None => String::new(),
    }
}

fn is_not_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| entry.depth() == 0 || !s.starts_with('.'))
        .unwrap_or(false)
}

fn is_catalog(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("xml"))
        .unwrap_or(false)
}

/// Compares candidates with stored records by path.
pub fn diff(candidates: &[RepositoryCandidate], stored: &[RepositoryRecord]) -> RepositoryDelta {
    let on_disk: HashSet<&str> = candidates.iter().map(|c| c.file_name.as_str()).collect();
    let known: HashSet<&str> = stored.iter().map(|r| r.file_name.as_str()).collect();

    RepositoryDelta {
        added: candidates
            .iter()
            .filter(|c| !known.contains(c.file_name.as_str()))
            .cloned()
            .collect(),
        removed: stored
            .iter()
            .filter(|r| !on_disk.contains(r.file_name.as_str()))
            .cloned()
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryIndex {
    root: PathBuf,
    excludes: Vec<Regex>,
}

impl RepositoryIndex {
    pub fn new(root: impl Into<PathBuf>, excludes: &[String]) -> Self {
        let mut patterns = Vec::new();
        for ex in excludes {
            match Regex::new(ex) {
                Ok(p) => patterns.push(p),
                Err(_) => warn!("Cannot handle exclude regex {}. Skipping", ex),
            }
        }
        RepositoryIndex {
            root: root.into(),
            excludes: patterns,
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        Some(rel.to_string_lossy().trim_matches('/').to_string())
    }

    fn is_excluded(&self, rel: &str) -> bool {
        match self.excludes.iter().find(|p| p.is_match(rel)) {
            Some(p) => {
                debug!("{} is excluded because of {}", rel, p);
                true
            }
            None => false,
        }
    }

    /// Looks at a single directory. Returns a candidate if it holds exactly
    /// one catalog.
    pub fn candidate(&self, dir: &Path) -> Option<RepositoryCandidate> {
        let folder = self.relative(dir)?;
        if !folder.is_empty() && self.is_excluded(&folder) {
            return None;
        }

        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                debug!("cannot read {}: {}", dir.display(), e);
                return None;
            }
        };
        let mut catalogs = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .map(|e| e.path())
            .filter(|p| is_catalog(p));

        let catalog_path = catalogs.next()?;
        if catalogs.next().is_some() {
            debug!("{} holds more than one catalog, ignoring", dir.display());
            return None;
        }

        let catalog_name = catalog_path.file_name()?.to_str()?.to_string();
        let file_name = match folder.is_empty() {
            true => catalog_name,
            false => format!("{}/{}", folder, catalog_name),
        };

        Some(RepositoryCandidate {
            repo_id: repo_id(&self.root, &folder),
            file_name,
            file_path: dir.to_path_buf(),
            catalog_path,
            folder,
        })
    }

    /// Every repository below `dir`, `dir` included.
    pub fn enumerate_in(&self, dir: &Path) -> Vec<RepositoryCandidate> {
        let mut found: Vec<RepositoryCandidate> = WalkDir::new(dir)
            .follow_links(true)
            .into_iter()
            .filter_entry(is_not_hidden)
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| self.candidate(e.path()))
            .collect();
        found.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        found
    }

    /// Every repository below the root.
    pub fn enumerate(&self) -> Vec<RepositoryCandidate> {
        print_step(format!("Enumerating repositories in {}", self.root.display()));
        self.enumerate_in(&self.root)
    }

    /// The directory to re-evaluate after a change notification for
    /// `path`: the nearest existing directory at or above it.
    pub fn scope(&self, path: &Path) -> PathBuf {
        let mut current = path;
        loop {
            if current.is_dir() {
                return current.to_path_buf();
            }
            match current.parent() {
                Some(parent) if parent.starts_with(&self.root) => current = parent,
                _ => return self.root.clone(),
            }
        }
    }

    /// Add/remove delta restricted to `scope`.
    pub fn diff_scoped(&self, scope: &Path, stored: &[RepositoryRecord]) -> RepositoryDelta {
        let candidates = self.enumerate_in(scope);
        let relevant: Vec<RepositoryRecord> = stored
            .iter()
            .filter(|r| Path::new(&r.file_path).starts_with(scope))
            .cloned()
            .collect();
        diff(&candidates, &relevant)
    }

    /// Artifact stem of a stored repository.
    pub fn repo_id_of(&self, record: &RepositoryRecord) -> String {
        repo_id(&self.root, &folder_of(&record.file_name))
    }
}
