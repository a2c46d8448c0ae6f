//! Persisted record of when each path was last reconciled, per direction.
//!
//! Both maps live inside the shared config document. Every write is a
//! whole-document read-modify-write; [`JsonConfigStore`] serializes those
//! writes within the process, but a second process editing the same file
//! can still lose updates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono_tz::Tz;
use thiserror::Error;
use tracing::debug;

use super::ignore::IgnoreLists;
use super::timestamp::{Timestamp, format_timestamp, parse_timestamp};
use crate::config::{ConfigDocument, ConfigError};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    /// Written after a pull.
    pub from_cloud: BTreeMap<String, Timestamp>,
    /// Written after a push.
    pub from_local: BTreeMap<String, Timestamp>,
}

impl Ledger {
    pub fn pushed_at(&self, path: &str) -> Option<&Timestamp> {
        self.from_local.get(path)
    }

    pub fn pulled_at(&self, path: &str) -> Option<&Timestamp> {
        self.from_cloud.get(path)
    }

    fn from_document(document: &ConfigDocument, tz: Tz) -> Self {
        let mut from_local = parse_map(&document.synced_from_local, tz);
        if let Some(legacy) = document.legacy_synced_paths.as_ref() {
            for (path, ts) in parse_map(legacy, tz) {
                from_local.entry(path).or_insert(ts);
            }
        }
        Self {
            from_cloud: parse_map(&document.synced_from_cloud, tz),
            from_local,
        }
    }

    fn write_into(&self, document: &mut ConfigDocument) {
        document.synced_from_cloud = format_map(&self.from_cloud);
        document.synced_from_local = format_map(&self.from_local);
        document.legacy_synced_paths = None;
    }
}

fn parse_map(raw: &BTreeMap<String, String>, tz: Tz) -> BTreeMap<String, Timestamp> {
    raw.iter()
        .filter_map(|(path, value)| match parse_timestamp(value, tz) {
            Ok(ts) => Some((path.clone(), ts)),
            Err(err) => {
                debug!(path = %path, error = %err, "dropping unreadable ledger timestamp");
                None
            }
        })
        .collect()
}

fn format_map(map: &BTreeMap<String, Timestamp>) -> BTreeMap<String, String> {
    map.iter()
        .map(|(path, ts)| (path.clone(), format_timestamp(ts)))
        .collect()
}

/// Changes accumulated by one run, applied on top of whatever is on disk at
/// commit time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerDelta {
    pushed: BTreeMap<String, Timestamp>,
    pulled: BTreeMap<String, Timestamp>,
    forgotten: BTreeSet<String>,
}

impl LedgerDelta {
    pub fn record_push(&mut self, path: impl Into<String>, at: Timestamp) {
        let path = path.into();
        self.forgotten.remove(&path);
        self.pushed.insert(path, at);
    }

    pub fn record_pull(&mut self, path: impl Into<String>, at: Timestamp) {
        let path = path.into();
        self.forgotten.remove(&path);
        self.pulled.insert(path, at);
    }

    /// Removes the path from both directions.
    pub fn forget(&mut self, path: impl Into<String>) {
        let path = path.into();
        self.pushed.remove(&path);
        self.pulled.remove(&path);
        self.forgotten.insert(path);
    }

    pub fn is_empty(&self) -> bool {
        self.pushed.is_empty() && self.pulled.is_empty() && self.forgotten.is_empty()
    }

    pub fn apply_to(&self, ledger: &mut Ledger) {
        for path in &self.forgotten {
            ledger.from_local.remove(path);
            ledger.from_cloud.remove(path);
        }
        ledger
            .from_local
            .extend(self.pushed.iter().map(|(k, v)| (k.clone(), *v)));
        ledger
            .from_cloud
            .extend(self.pulled.iter().map(|(k, v)| (k.clone(), *v)));
    }
}

pub trait LedgerStore: Send + Sync {
    fn load(&self) -> Result<Ledger, LedgerError>;

    /// Replaces both maps with `ledger`.
    fn save(&self, ledger: &Ledger) -> Result<(), LedgerError>;

    /// Reload, mutate and save as one step.
    fn update(&self, apply: &mut dyn FnMut(&mut Ledger)) -> Result<Ledger, LedgerError>;

    fn commit(&self, delta: &LedgerDelta) -> Result<Ledger, LedgerError> {
        self.update(&mut |ledger: &mut Ledger| delta.apply_to(ledger))
    }

    /// Ignore lists stored alongside the ledger, normalized against `root`.
    fn ignore_lists(&self, root: &Path) -> Result<IgnoreLists, LedgerError>;
}

/// Ledger and ignore configuration backed by the JSON config document.
pub struct JsonConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> Result<ConfigDocument, LedgerError> {
        Ok(ConfigDocument::read(&self.path)?)
    }

    /// Locked read-modify-write of the whole document.
    pub fn update_document<T>(
        &self,
        apply: impl FnOnce(&mut ConfigDocument) -> T,
    ) -> Result<T, LedgerError> {
        let _guard = self.guard();
        let mut document = ConfigDocument::read(&self.path)?;
        let out = apply(&mut document);
        document.write(&self.path)?;
        Ok(out)
    }

    pub fn add_ignore_override(&self, path: impl Into<String>) -> Result<bool, LedgerError> {
        let path = path.into();
        self.update_document(|doc| doc.ignore_overrides.insert(path))
    }

    pub fn remove_ignore_override(&self, path: &str) -> Result<bool, LedgerError> {
        self.update_document(|doc| doc.ignore_overrides.remove(path))
    }

    pub fn add_always_ignore(&self, path: impl Into<String>) -> Result<bool, LedgerError> {
        let path = path.into();
        self.update_document(|doc| doc.always_ignore.insert(path))
    }

    pub fn set_access_token(&self, token: impl Into<String>) -> Result<(), LedgerError> {
        let token = token.into();
        self.update_document(|doc| doc.access_token = Some(token))
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LedgerStore for JsonConfigStore {
    fn load(&self) -> Result<Ledger, LedgerError> {
        let document = ConfigDocument::read(&self.path)?;
        Ok(Ledger::from_document(&document, document.time_zone()?))
    }

    fn save(&self, ledger: &Ledger) -> Result<(), LedgerError> {
        self.update_document(|doc| ledger.write_into(doc))
    }

    fn update(&self, apply: &mut dyn FnMut(&mut Ledger)) -> Result<Ledger, LedgerError> {
        let _guard = self.guard();
        let mut document = ConfigDocument::read(&self.path)?;
        let mut ledger = Ledger::from_document(&document, document.time_zone()?);
        apply(&mut ledger);
        ledger.write_into(&mut document);
        document.write(&self.path)?;
        Ok(ledger)
    }

    fn ignore_lists(&self, root: &Path) -> Result<IgnoreLists, LedgerError> {
        let document = ConfigDocument::read(&self.path)?;
        Ok(IgnoreLists::normalized(
            root,
            document.ignore_overrides,
            document.always_ignore,
        ))
    }
}
