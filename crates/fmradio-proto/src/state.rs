use crate::protocol::{OutputMode, Preset, RadioState, RdsInfo};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// What survives a daemon restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentState {
    pub last_frequency: Option<u64>,
    /// Last output mode the user selected.  Never `Mute` unless chosen.
    pub output: OutputMode,
}

impl Default for PersistentState {
    fn default() -> Self {
        Self {
            last_frequency: None,
            output: OutputMode::System,
        }
    }
}

/// Published snapshot of the engine, shared with the socket and HTTP
/// servers.  Only the core loop writes; everyone else reads clones.
pub struct StateManager {
    state: Arc<RwLock<RadioState>>,
    state_file: PathBuf,
    persistent: std::sync::Mutex<PersistentState>,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        let persistent = Self::load_persistent(&state_file);

        let state = RadioState {
            rev: 1,
            ..RadioState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
            state_file,
            persistent: std::sync::Mutex::new(persistent),
        }
    }

    pub async fn get_state(&self) -> RadioState {
        self.state.read().await.clone()
    }

    /// Persisted values loaded at startup (and updated by later saves).
    pub fn persistent(&self) -> PersistentState {
        match self.persistent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn set_tuner(&self, ready: bool, range: Option<(u64, u64)>) {
        let mut state = self.state.write().await;
        state.tuner_ready = ready;
        if let Some((low, high)) = range {
            state.range_low = low;
            state.range_high = high;
        }
        if !ready {
            state.frequency = None;
            state.signal = 0;
        }
        state.rev += 1;
    }

    pub async fn set_frequency(&self, hz: Option<u64>, signal: u32) {
        let mut state = self.state.write().await;
        state.frequency = hz;
        state.signal = signal;
        state.rev += 1;
    }

    pub async fn set_output(&self, mode: OutputMode) {
        let mut state = self.state.write().await;
        state.output = mode;
        state.rev += 1;
    }

    pub async fn set_scanning(&self, scanning: bool) {
        let mut state = self.state.write().await;
        state.scanning = scanning;
        state.rev += 1;
    }

    pub async fn set_presets(&self, presets: Vec<Preset>) {
        let mut state = self.state.write().await;
        state.presets = presets;
        state.rev += 1;
    }

    pub async fn set_rds(&self, rds: RdsInfo) {
        let mut state = self.state.write().await;
        state.rds = rds;
        state.rev += 1;
    }

    /// Record the values to restore on the next start and write them out.
    pub async fn save(&self, last_frequency: Option<u64>, output: OutputMode) -> anyhow::Result<()> {
        let persistent = {
            let mut guard = match self.persistent.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if last_frequency.is_some() {
                guard.last_frequency = last_frequency;
            }
            guard.output = output;
            guard.clone()
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}
