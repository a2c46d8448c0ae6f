use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("{0} is outside the sync root")]
    OutsideRoot(PathBuf),
}

/// Maps a remote path ("/Docs/A.txt") onto the local sync root.
pub fn local_path_for(root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`]: the ledger key for a local path, with a leading `/`.
pub fn remote_path_for(root: &Path, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;
    let mut out = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Joins a relative local path under a remote folder ("/Backup" + "a/b" -> "/Backup/a/b").
pub fn join_remote(base: &str, relative: &Path) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}

/// The API addresses the root folder as "" rather than "/".
pub fn api_path(remote_path: &str) -> &str {
    if remote_path == "/" { "" } else { remote_path }
}

/// True when `path` equals `prefix` or sits below it.
pub fn is_same_or_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
