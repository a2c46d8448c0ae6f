use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;
use zip::result::ZipError;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid archive: {0}")]
    Zip(#[from] ZipError),
}

#[derive(Debug, Default)]
pub struct Extracted {
    pub files: Vec<PathBuf>,
    pub skipped: usize,
}

/// Expands `archive` under `destination`. Entries whose names would land
/// outside `destination` are dropped, as are entries `skip` rejects.
pub fn extract<F>(archive: &Path, destination: &Path, mut skip: F) -> Result<Extracted, ArchiveError>
where
    F: FnMut(&Path, bool) -> bool,
{
    let mut zip = ZipArchive::new(File::open(archive)?)?;
    let mut out = Extracted::default();

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!(name = entry.name(), "archive entry escapes destination, skipped");
            out.skipped += 1;
            continue;
        };
        let target = destination.join(relative);
        let is_dir = entry.is_dir();
        if skip(&target, is_dir) {
            debug!(path = %target.display(), "archive entry ignored");
            out.skipped += 1;
            continue;
        }

        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(&target)?;
        io::copy(&mut entry, &mut file)?;
        out.files.push(target);
    }
    Ok(out)
}
