/// Hierarchical key/value configuration namespace.
///
/// Keys are slash-separated paths (`/apps/fmradio/presets/default/97.3`),
/// values are strings.  Watchers subscribe to a directory and receive every
/// add, modify or delete below it, including changes they made themselves
/// and edits other programs make to the backing file (picked up by
/// `reload`, which `watch_file` triggers).
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::StoreError;

/// One key changed.  `value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: String,
    pub value: Option<String>,
}

pub trait ConfigStore: Send {
    /// Every `(key, value)` directly or indirectly below `dir`.
    fn all_entries(&self, dir: &str) -> Result<Vec<(String, String)>, StoreError>;
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn unset(&mut self, key: &str) -> Result<(), StoreError>;
    /// Subscribe to changes below `dir`.
    fn watch(&mut self, dir: &str) -> broadcast::Receiver<StoreChange>;
    /// Re-read the durable copy and notify watchers of anything that
    /// changed behind our back.  Returns the number of changed keys.
    fn reload(&mut self) -> Result<usize, StoreError>;
}

/// Directory-scoped change fan-out shared by store implementations.
#[derive(Default)]
pub struct Watchers {
    dirs: Vec<(String, broadcast::Sender<StoreChange>)>,
}

const WATCH_CHANNEL: usize = 64;

impl Watchers {
    pub fn subscribe(&mut self, dir: &str) -> broadcast::Receiver<StoreChange> {
        let dir = dir.trim_end_matches('/').to_string();
        if let Some((_, tx)) = self.dirs.iter().find(|(d, _)| *d == dir) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(WATCH_CHANNEL);
        self.dirs.push((dir, tx));
        rx
    }

    pub fn notify(&mut self, change: StoreChange) {
        self.dirs.retain(|(_, tx)| tx.receiver_count() > 0);
        for (dir, tx) in &self.dirs {
            if in_dir(&change.key, dir) {
                let _ = tx.send(change.clone());
            }
        }
    }
}

pub fn in_dir(key: &str, dir: &str) -> bool {
    key.strip_prefix(dir.trim_end_matches('/'))
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Last path component of a key.
pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Keys whose value differs between `old` and `new`.
fn diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<StoreChange> {
    let mut changes = Vec::new();
    for (key, value) in new {
        if old.get(key) != Some(value) {
            changes.push(StoreChange {
                key: key.clone(),
                value: Some(value.clone()),
            });
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changes.push(StoreChange {
                key: key.clone(),
                value: None,
            });
        }
    }
    changes
}

// ── TOML-file backed store ────────────────────────────────────────────────────

/// Keeps the whole namespace in one TOML table of `"key" = "value"` lines.
pub struct TomlStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    watchers: Watchers,
}

impl TomlStore {
    /// Load `path`.  A missing file is an empty namespace.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let entries = Self::read(path)?;
        info!("Store: {} keys loaded from {}", entries.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            watchers: Watchers::default(),
        })
    }

    fn read(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| StoreError::Unreachable(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(StoreError::Unreachable(format!("{}: {}", path.display(), e))),
        }
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let fail = |e: String| StoreError::WriteFailure(format!("{}: {}", self.path.display(), e));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
        }
        let content = toml::to_string(entries).map_err(|e| fail(e.to_string()))?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content).map_err(|e| fail(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| fail(e.to_string()))
    }

    /// Adopt the file's current contents, notifying watchers of every key
    /// that differs from the in-memory copy.
    fn refresh(&mut self) -> Result<usize, StoreError> {
        let fresh = Self::read(&self.path)?;
        let changes = diff(&self.entries, &fresh);
        if changes.is_empty() {
            return Ok(0);
        }
        debug!("Store: {} keys changed on disk", changes.len());
        self.entries = fresh;
        let n = changes.len();
        for change in changes {
            self.watchers.notify(change);
        }
        Ok(n)
    }

    /// Writes go on top of what is on disk now, not on top of the last
    /// reload, so edits made by other clients in between survive.
    fn commit(&mut self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        self.refresh()?;
        let mut next = self.entries.clone();
        match value {
            Some(v) => next.insert(key.to_string(), v.to_string()),
            None => next.remove(key),
        };
        if next == self.entries {
            return Ok(());
        }
        self.persist(&next)?;
        self.entries = next;
        self.watchers.notify(StoreChange {
            key: key.to_string(),
            value: value.map(str::to_string),
        });
        Ok(())
    }
}

impl ConfigStore for TomlStore {
    fn all_entries(&self, dir: &str) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|(k, _)| in_dir(k, dir))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.commit(key, Some(value))
    }

    fn unset(&mut self, key: &str) -> Result<(), StoreError> {
        self.commit(key, None)
    }

    fn watch(&mut self, dir: &str) -> broadcast::Receiver<StoreChange> {
        self.watchers.subscribe(dir)
    }

    fn reload(&mut self) -> Result<usize, StoreError> {
        self.refresh()
    }
}

/// Call `on_change` whenever the file at `path` is created, modified,
/// replaced or removed.  The parent directory is watched so atomic
/// rename-over writes are seen.  Dropping the watcher stops it.
pub fn watch_file<F>(path: &Path, on_change: F) -> notify::Result<RecommendedWatcher>
where
    F: Fn() + Send + 'static,
{
    let name = path.file_name().map(|n| n.to_os_string());
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(notify::Error::io)?;

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            if event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == name)
            {
                on_change();
            }
        }
        Err(e) => debug!("Store: watch error: {}", e),
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Store: watching {}", path.display());
    Ok(watcher)
}
