//! Hierarchical ignore rules.
//!
//! Pattern files are compiled per directory and kept on a stack while the
//! walk is inside that directory. Two flat lists from the config document
//! sit on top of the pattern files: an override allow-list (never ignored)
//! and an always-ignore list (ignored unconditionally, no descent).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use ignore::Match;
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use thiserror::Error;
use tracing::debug;

use super::paths::{is_same_or_under, remote_path_for};

pub const IGNORE_FILE_NAME: &str = ".gitignore";

#[derive(Debug, Error)]
pub enum IgnoreError {
    #[error("invalid pattern file {path}: {source}")]
    Pattern {
        path: PathBuf,
        #[source]
        source: ignore::Error,
    },
}

/// Flat path lists read from the config document. Entries are root-relative
/// paths with a leading `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreLists {
    pub overrides: BTreeSet<String>,
    pub always_ignore: BTreeSet<String>,
}

impl IgnoreLists {
    /// Accepts either root-relative entries or absolute paths under `root`.
    pub fn normalized<I, J>(root: &Path, overrides: I, always_ignore: J) -> Self
    where
        I: IntoIterator<Item = String>,
        J: IntoIterator<Item = String>,
    {
        let normalize = |entry: String| normalize_entry(root, &entry);
        Self {
            overrides: overrides.into_iter().filter_map(normalize).collect(),
            always_ignore: always_ignore.into_iter().filter_map(normalize).collect(),
        }
    }
}

fn normalize_entry(root: &Path, entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }
    let as_path = Path::new(entry);
    if as_path.starts_with(root) {
        return remote_path_for(root, as_path).ok();
    }
    let trimmed = entry.trim_end_matches('/');
    if trimmed.starts_with('/') {
        Some(trimmed.to_string())
    } else {
        Some(format!("/{trimmed}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Included,
    /// Matched by a pattern file.
    Ignored,
    /// Under an always-ignore prefix; the walk must not descend.
    Excluded,
}

impl Verdict {
    pub fn is_ignored(self) -> bool {
        !matches!(self, Verdict::Included)
    }
}

pub struct IgnoreMatcher {
    root: PathBuf,
    lists: IgnoreLists,
    stack: Vec<(PathBuf, Gitignore)>,
}

impl IgnoreMatcher {
    pub fn new(root: impl Into<PathBuf>, lists: IgnoreLists) -> Self {
        Self {
            root: root.into(),
            lists,
            stack: Vec::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Drops matchers whose directory is not an ancestor of `dir`, then loads
    /// the pattern file of `dir` itself, if there is one.
    pub fn enter_dir(&mut self, dir: &Path) -> Result<(), IgnoreError> {
        self.leave_to(dir);
        if self.stack.last().is_some_and(|(top, _)| top == dir) {
            return Ok(());
        }
        let file = dir.join(IGNORE_FILE_NAME);
        if !file.is_file() {
            return Ok(());
        }
        let mut builder = GitignoreBuilder::new(dir);
        if let Some(err) = builder.add(&file) {
            return Err(IgnoreError::Pattern { path: file, source: err });
        }
        let matcher = builder.build().map_err(|source| IgnoreError::Pattern {
            path: file.clone(),
            source,
        })?;
        debug!(dir = %dir.display(), patterns = matcher.num_ignores(), "loaded ignore file");
        self.stack.push((dir.to_path_buf(), matcher));
        Ok(())
    }

    /// Pops every matcher that does not apply to entries of `dir`.
    pub fn leave_to(&mut self, dir: &Path) {
        while self
            .stack
            .last()
            .is_some_and(|(origin, _)| !dir.starts_with(origin))
        {
            self.stack.pop();
        }
    }

    /// Loads pattern files of every directory between the root and `path`'s
    /// parent, for checks made outside a top-down walk.
    pub fn prime(&mut self, path: &Path) -> Result<(), IgnoreError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let Ok(relative) = parent.strip_prefix(&self.root) else {
            return Ok(());
        };
        let mut current = self.root.clone();
        self.enter_dir(&current)?;
        for component in relative.components() {
            current.push(component);
            self.enter_dir(&current)?;
        }
        Ok(())
    }

    pub fn check(&self, path: &Path, is_dir: bool) -> Verdict {
        let key = remote_path_for(&self.root, path).ok();
        if let Some(key) = key.as_deref() {
            if self
                .lists
                .always_ignore
                .iter()
                .any(|prefix| is_same_or_under(key, prefix))
            {
                return Verdict::Excluded;
            }
            if self.is_overridden(key) {
                return Verdict::Included;
            }
        }
        if self.matches_patterns(path, is_dir) {
            Verdict::Ignored
        } else {
            Verdict::Included
        }
    }

    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        self.check(path, is_dir).is_ignored()
    }

    /// True when some override entry lies strictly below `dir`, so an
    /// ignored directory still has to be entered.
    pub fn has_override_below(&self, dir: &Path) -> bool {
        let Ok(key) = remote_path_for(&self.root, dir) else {
            return false;
        };
        self.lists
            .overrides
            .iter()
            .any(|entry| entry != &key && is_same_or_under(entry, &key))
    }

    fn is_overridden(&self, key: &str) -> bool {
        self.lists
            .overrides
            .iter()
            .any(|entry| is_same_or_under(key, entry))
    }

    // Deepest matcher first; the first definite verdict wins.
    fn matches_patterns(&self, path: &Path, is_dir: bool) -> bool {
        for (origin, matcher) in self.stack.iter().rev() {
            if !path.starts_with(origin) || path == origin {
                continue;
            }
            match matcher.matched_path_or_any_parents(path, is_dir) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }
        false
    }
}
