/// PresetStore: in-memory index of named frequencies.
///
/// The durable copy lives in the config namespace under
/// `<namespace>/<set>/<MHz>` keys; other clients may edit it at any time.
/// The index is loaded in full at construction and afterwards kept in sync
/// by applying store change notifications.  Local writes update the index
/// first, so a read straight after a write sees it even if the store write
/// failed.
use std::collections::BTreeMap;

use fmradio_proto::freq::{canonicalize, format_mhz, parse_mhz};
use fmradio_proto::protocol::Preset;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{base_name, in_dir, ConfigStore, StoreChange};

pub struct PresetStore {
    store: Box<dyn ConfigStore>,
    dir: String,
    index: BTreeMap<u64, String>,
}

impl PresetStore {
    /// Load every preset of the set at `dir`.  An unreachable store yields an
    /// empty index; notifications fill it in later.
    pub fn open(store: Box<dyn ConfigStore>, dir: &str) -> Self {
        let mut presets = Self {
            store,
            dir: dir.trim_end_matches('/').to_string(),
            index: BTreeMap::new(),
        };
        if let Err(e) = presets.reload() {
            warn!("Presets: cannot load {}: {}", presets.dir, e);
        }
        presets
    }

    /// Subscribe to store changes for this set.
    pub fn watch(&mut self) -> broadcast::Receiver<StoreChange> {
        self.store.watch(&self.dir)
    }

    /// Store key for the preset at `hz`.
    pub fn key_for(&self, hz: u64) -> String {
        format!("{}/{}", self.dir, format_mhz(hz))
    }

    /// Replace the index with the full contents of the store.  Returns true
    /// when the index changed.
    pub fn reload(&mut self) -> Result<bool, StoreError> {
        let mut index = BTreeMap::new();
        for (key, name) in self.store.all_entries(&self.dir)? {
            match parse_mhz(base_name(&key)) {
                Some(hz) => {
                    index.insert(hz, name);
                }
                None => debug!("Presets: ignoring key {}", key),
            }
        }
        info!("Presets: {} loaded from {}", index.len(), self.dir);
        let changed = index != self.index;
        self.index = index;
        Ok(changed)
    }

    /// Have the store look for external edits.  Whatever changed arrives
    /// through the watch channel.
    pub fn poll_store(&mut self) -> Result<usize, StoreError> {
        self.store.reload()
    }

    pub fn set_preset(&mut self, hz: u64, name: &str) -> Result<(), StoreError> {
        let hz = canonicalize(hz);
        self.index.insert(hz, name.to_string());

        let key = self.key_for(hz);
        self.store.set(&key, name).map_err(|e| {
            warn!("Presets: failed to store '{}' ('{}'): {}", key, name, e);
            e
        })
    }

    /// Drop the preset locally and delete the durable key.
    pub fn remove_preset(&mut self, hz: u64) -> Result<(), StoreError> {
        let hz = canonicalize(hz);
        self.index.remove(&hz);

        let key = self.key_for(hz);
        self.store.unset(&key).map_err(|e| {
            warn!("Presets: failed to remove '{}': {}", key, e);
            e
        })
    }

    pub fn is_preset(&self, hz: u64) -> bool {
        self.index.contains_key(&canonicalize(hz))
    }

    pub fn get_preset(&self, hz: u64) -> Option<&str> {
        self.index.get(&canonicalize(hz)).map(String::as_str)
    }

    /// All presets, ascending by frequency.
    pub fn get_all(&self) -> Vec<Preset> {
        self.index
            .iter()
            .map(|(&frequency, name)| Preset {
                frequency,
                name: name.clone(),
            })
            .collect()
    }

    /// Apply a store notification.  Returns true when the index changed;
    /// applying the same change again returns false.
    pub fn apply_change(&mut self, change: &StoreChange) -> bool {
        if !in_dir(&change.key, &self.dir) {
            return false;
        }
        let Some(hz) = parse_mhz(base_name(&change.key)) else {
            debug!("Presets: ignoring change to {}", change.key);
            return false;
        };

        match &change.value {
            Some(name) => {
                if self.index.get(&hz) == Some(name) {
                    return false;
                }
                debug!("Presets: '{}' changed to '{}'", base_name(&change.key), name);
                self.index.insert(hz, name.clone());
                true
            }
            None => {
                let removed = self.index.remove(&hz).is_some();
                if removed {
                    debug!("Presets: '{}' removed", base_name(&change.key));
                }
                removed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    const DIR: &str = "/apps/fmradio/presets/default";

    fn change(name: &str, value: Option<&str>) -> StoreChange {
        StoreChange {
            key: format!("{}/{}", DIR, name),
            value: value.map(str::to_string),
        }
    }

    #[test]
    fn construction_loads_existing_namespace() {
        let mem = MemoryStore::new();
        mem.insert(&format!("{}/97.3", DIR), "Radio X");
        mem.insert(&format!("{}/88.1", DIR), "Classic");
        mem.insert("/apps/fmradio/presets/car/101.1", "Other set");
        mem.insert(&format!("{}/junk", DIR), "not a frequency");

        let presets = PresetStore::open(Box::new(mem), DIR);
        let all = presets.get_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].frequency, 88_100_000);
        assert_eq!(all[1].name, "Radio X");
    }

    #[test]
    fn unreachable_store_starts_empty() {
        let mem = MemoryStore::new();
        mem.set_unreachable(true);
        let presets = PresetStore::open(Box::new(mem), DIR);
        assert!(presets.get_all().is_empty());
    }

    #[test]
    fn read_your_write_and_key_format() {
        let mem = MemoryStore::new();
        let mut presets = PresetStore::open(Box::new(mem.clone()), DIR);

        presets.set_preset(97_312_500, "Radio X").unwrap();
        assert_eq!(presets.get_preset(97_300_000), Some("Radio X"));
        assert!(presets.is_preset(97_349_000));
        assert_eq!(mem.value(&format!("{}/97.3", DIR)).as_deref(), Some("Radio X"));
        assert_eq!(presets.key_for(100_000_000), format!("{}/100.0", DIR));
    }

    #[test]
    fn colliding_keys_overwrite() {
        let mut presets = PresetStore::open(Box::new(MemoryStore::new()), DIR);
        presets.set_preset(97_280_000, "first").unwrap();
        presets.set_preset(97_320_000, "second").unwrap();
        assert_eq!(presets.get_all().len(), 1);
        assert_eq!(presets.get_preset(97_300_000), Some("second"));
    }

    #[test]
    fn get_all_is_sorted_by_frequency() {
        let mut presets = PresetStore::open(Box::new(MemoryStore::new()), DIR);
        for (hz, name) in [(104_000_000, "c"), (88_000_000, "a"), (97_300_000, "b")] {
            presets.set_preset(hz, name).unwrap();
        }
        let freqs: Vec<u64> = presets.get_all().iter().map(|p| p.frequency).collect();
        assert_eq!(freqs, vec![88_000_000, 97_300_000, 104_000_000]);
    }

    #[test]
    fn failed_write_keeps_local_state() {
        let mem = MemoryStore::new();
        let mut presets = PresetStore::open(Box::new(mem.clone()), DIR);
        mem.fail_writes(true);

        assert!(matches!(
            presets.set_preset(97_300_000, "Radio X"),
            Err(StoreError::WriteFailure(_))
        ));
        assert_eq!(presets.get_preset(97_300_000), Some("Radio X"));
        assert_eq!(mem.value(&format!("{}/97.3", DIR)), None);
    }

    #[test]
    fn remove_is_optimistic() {
        let mem = MemoryStore::new();
        let mut presets = PresetStore::open(Box::new(mem.clone()), DIR);
        presets.set_preset(97_300_000, "Radio X").unwrap();

        presets.remove_preset(97_310_000).unwrap();
        assert!(!presets.is_preset(97_300_000));
        assert_eq!(mem.value(&format!("{}/97.3", DIR)), None);
    }

    #[test]
    fn notifications_are_idempotent() {
        let mut presets = PresetStore::open(Box::new(MemoryStore::new()), DIR);

        let add = change("101.1", Some("Rock"));
        assert!(presets.apply_change(&add));
        let snapshot = presets.get_all();
        assert!(!presets.apply_change(&add));
        assert_eq!(presets.get_all(), snapshot);

        let del = change("101.1", None);
        assert!(presets.apply_change(&del));
        assert!(!presets.apply_change(&del));
        assert!(presets.get_all().is_empty());
    }

    #[test]
    fn notifications_outside_the_set_are_ignored() {
        let mut presets = PresetStore::open(Box::new(MemoryStore::new()), DIR);
        let other = StoreChange {
            key: "/apps/fmradio/presets/car/101.1".into(),
            value: Some("x".into()),
        };
        assert!(!presets.apply_change(&other));
        assert!(!presets.apply_change(&change("garbage", Some("x"))));
        assert!(presets.get_all().is_empty());
    }

    #[test]
    fn non_canonical_keys_do_not_alias_presets() {
        let mem = MemoryStore::new();
        mem.insert(&format!("{}/97.3", DIR), "Radio X");
        mem.insert(&format!("{}/97.32", DIR), "Stray");
        mem.insert(&format!("{}/1e3", DIR), "Far away");
        let mut presets = PresetStore::open(Box::new(mem), DIR);
        assert_eq!(presets.get_all().len(), 1);
        assert_eq!(presets.get_preset(97_300_000), Some("Radio X"));

        // Deleting the stray key leaves the canonical entry alone.
        assert!(!presets.apply_change(&change("97.32", None)));
        assert!(!presets.apply_change(&change("97.30", Some("Stray"))));
        assert_eq!(presets.get_preset(97_300_000), Some("Radio X"));
    }

    #[tokio::test]
    async fn external_writer_reaches_index_through_watch() {
        let mem = MemoryStore::new();
        let mut presets = PresetStore::open(Box::new(mem.clone()), DIR);
        let mut rx = presets.watch();

        mem.external_set(&format!("{}/104.0", DIR), Some("News"));
        let change = rx.recv().await.unwrap();
        assert!(presets.apply_change(&change));
        assert_eq!(presets.get_preset(104_000_000), Some("News"));
    }
}
