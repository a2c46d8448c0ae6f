use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

use super::ignore::{IgnoreError, IgnoreMatcher, Verdict};
use super::paths::{PathError, remote_path_for};

#[derive(Debug, Error)]
pub enum WalkError {
    #[error(transparent)]
    Io(#[from] walkdir::Error),
    #[error(transparent)]
    Ignore(#[from] IgnoreError),
    #[error(transparent)]
    Path(#[from] PathError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    /// Ledger key relative to the sync root, e.g. "/a/b.txt".
    pub remote_path: String,
    pub is_file: bool,
}

/// Depth-first walk of a local subtree that yields only entries the
/// [`IgnoreMatcher`] lets through. Ignored directories are pruned unless an
/// override entry lies somewhere below them.
pub struct LocalWalker {
    matcher: IgnoreMatcher,
    inner: walkdir::IntoIter,
    root: PathBuf,
    start: PathBuf,
    ignored: usize,
}

impl LocalWalker {
    pub fn new(mut matcher: IgnoreMatcher, start: &Path) -> Result<Self, WalkError> {
        matcher.prime(start)?;
        let root = matcher.root().to_path_buf();
        let inner = WalkDir::new(start)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Ok(Self {
            matcher,
            inner,
            root,
            start: start.to_path_buf(),
            ignored: 0,
        })
    }

    /// Number of entries skipped by ignore rules so far.
    pub fn ignored(&self) -> usize {
        self.ignored
    }

    fn visit(&mut self, entry: walkdir::DirEntry) -> Result<Option<LocalEntry>, WalkError> {
        let path = entry.path().to_path_buf();
        let is_dir = entry.file_type().is_dir();
        if let Some(parent) = path.parent() {
            self.matcher.leave_to(parent);
        }

        let verdict = self.matcher.check(&path, is_dir);
        match verdict {
            Verdict::Excluded => {
                self.skip(&path, is_dir);
                return Ok(None);
            }
            Verdict::Ignored if is_dir && self.matcher.has_override_below(&path) => {
                self.matcher.enter_dir(&path)?;
                return Ok(None);
            }
            Verdict::Ignored => {
                self.skip(&path, is_dir);
                return Ok(None);
            }
            Verdict::Included => {}
        }

        if is_dir {
            self.matcher.enter_dir(&path)?;
        }
        // The start directory itself is not an entry of its own subtree.
        if is_dir && path == self.start {
            return Ok(None);
        }
        let remote_path = remote_path_for(&self.root, &path)?;
        Ok(Some(LocalEntry {
            path,
            remote_path,
            is_file: entry.file_type().is_file(),
        }))
    }

    fn skip(&mut self, path: &Path, is_dir: bool) {
        debug!(path = %path.display(), "ignored");
        self.ignored += 1;
        if is_dir {
            self.inner.skip_current_dir();
        }
    }
}

impl Iterator for LocalWalker {
    type Item = Result<LocalEntry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => return Some(Err(err.into())),
            };
            match self.visit(entry) {
                Ok(Some(local)) => return Some(Ok(local)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}
