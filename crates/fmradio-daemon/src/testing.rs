//! Hardware-free stand-ins used by the unit tests.
//!
//! Every fake is a cheap handle around shared state: clone it, hand one copy
//! to the code under test and keep the other to inspect or poke at.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fmradio_proto::config::MixerConfig;
use fmradio_proto::freq::canonicalize;
use fmradio_proto::protocol::RdsInfo;
use tokio::sync::broadcast;

use crate::audio::{
    AudioBackend, AudioPathController, AudioRoute, CaptureStream, PlaybackStream,
    RouteAnnouncer, StreamSpec,
};
use crate::error::{AudioBackendError, DeviceError, MixerError, StoreError};
use crate::mixer::{AudioMixerControl, MixerControl};
use crate::rds::RdsSource;
use crate::store::{in_dir, ConfigStore, StoreChange, Watchers};
use crate::tuner::{Precision, TunerBackend, TunerIo, TunerStatus};

// ── tuner ─────────────────────────────────────────────────────────────────────

/// Where a hardware seek lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    /// The seek does not move the tuner.
    Stay,
    /// The seek jumps to the next programmed station, or the band edge.
    NextStation,
}

struct TunerState {
    radio: bool,
    precision: Precision,
    range_low: u32,
    range_high: u32,
    raw: u32,
    muted: bool,
    stations: BTreeMap<u64, u32>,
    seek_mode: SeekMode,
    seeks: usize,
    opens: usize,
}

impl TunerState {
    fn hz(&self) -> u64 {
        self.precision.decode(self.raw)
    }
}

#[derive(Clone)]
pub struct FakeTuner(Arc<Mutex<TunerState>>);

impl FakeTuner {
    /// An 87.5–108 MHz radio tuner, powered off, parked at the bottom.
    pub fn fm_band(precise: bool) -> Self {
        let precision = Precision::from_capability(precise);
        let range_low = precision.encode(87_500_000);
        Self(Arc::new(Mutex::new(TunerState {
            radio: true,
            precision,
            range_low,
            range_high: precision.encode(108_000_000),
            raw: range_low,
            muted: true,
            stations: BTreeMap::new(),
            seek_mode: SeekMode::Stay,
            seeks: 0,
            opens: 0,
        })))
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TunerState> {
        self.0.lock().unwrap()
    }

    pub fn muted(&self) -> bool {
        self.state().muted
    }

    pub fn set_radio(&self, radio: bool) {
        self.state().radio = radio;
    }

    pub fn raw_frequency(&self) -> u32 {
        self.state().raw
    }

    /// Put a transmitter at `hz`; its signal is reported whenever the tuner
    /// sits within the same 0.1 MHz slot.
    pub fn set_station(&self, hz: u64, signal: u32) {
        self.state().stations.insert(canonicalize(hz), signal);
    }

    pub fn set_seek_mode(&self, mode: SeekMode) {
        self.state().seek_mode = mode;
    }

    pub fn seek_count(&self) -> usize {
        self.state().seeks
    }

    pub fn open_count(&self) -> usize {
        self.state().opens
    }
}

impl TunerIo for FakeTuner {
    fn status(&mut self) -> Result<TunerStatus, DeviceError> {
        let s = self.state();
        let signal = s
            .stations
            .get(&canonicalize(s.hz()))
            .copied()
            .unwrap_or(0);
        Ok(TunerStatus {
            radio: s.radio,
            kind: if s.radio { 1 } else { 2 },
            precise: s.precision == Precision::Fine,
            range_low: s.range_low,
            range_high: s.range_high,
            signal,
            rds: signal > 0,
        })
    }

    fn set_mute(&mut self, mute: bool) -> Result<(), DeviceError> {
        self.state().muted = mute;
        Ok(())
    }

    fn frequency_raw(&mut self) -> Result<u32, DeviceError> {
        Ok(self.state().raw)
    }

    fn set_frequency_raw(&mut self, raw: u32) -> Result<(), DeviceError> {
        self.state().raw = raw;
        Ok(())
    }

    fn seek(&mut self, upward: bool) -> Result<(), DeviceError> {
        let mut s = self.state();
        s.seeks += 1;
        if s.seek_mode == SeekMode::Stay {
            return Ok(());
        }
        let here = s.hz();
        let target = if upward {
            s.stations
                .iter()
                .find(|(&hz, &sig)| hz > here && sig > 0)
                .map(|(&hz, _)| hz)
                .unwrap_or_else(|| s.precision.decode(s.range_high))
        } else {
            s.stations
                .iter()
                .rev()
                .find(|(&hz, &sig)| hz < here && sig > 0)
                .map(|(&hz, _)| hz)
                .unwrap_or_else(|| s.precision.decode(s.range_low))
        };
        s.raw = s.precision.encode(target);
        Ok(())
    }
}

pub struct FakeTunerBackend {
    tuner: Option<FakeTuner>,
}

impl FakeTunerBackend {
    pub fn new(tuner: FakeTuner) -> Self {
        Self { tuner: Some(tuner) }
    }

    /// Every open fails as if the node did not exist.
    pub fn failing() -> Self {
        Self { tuner: None }
    }
}

impl TunerBackend for FakeTunerBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn TunerIo>, DeviceError> {
        match &self.tuner {
            Some(tuner) => {
                tuner.state().opens += 1;
                Ok(Box::new(tuner.clone()))
            }
            None => Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{}: no such device", path.display()),
            ))),
        }
    }
}

// ── mixer ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MixerState {
    enums: HashMap<String, String>,
    switches: HashMap<String, bool>,
    missing: HashSet<String>,
}

/// Accepts every control except the ones explicitly removed.
#[derive(Clone, Default)]
pub struct RecordingMixer(Arc<Mutex<MixerState>>);

impl RecordingMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove_control(&self, control: &str) {
        self.0.lock().unwrap().missing.insert(control.to_string());
    }

    pub fn enum_value(&self, control: &str) -> Option<String> {
        self.0.lock().unwrap().enums.get(control).cloned()
    }

    pub fn switch_value(&self, control: &str) -> Option<bool> {
        self.0.lock().unwrap().switches.get(control).copied()
    }
}

impl MixerControl for RecordingMixer {
    fn set_enum(&mut self, control: &str, option: &str) -> Result<(), MixerError> {
        let mut s = self.0.lock().unwrap();
        if s.missing.contains(control) {
            return Err(MixerError::ControlNotFound(control.to_string()));
        }
        s.enums.insert(control.to_string(), option.to_string());
        Ok(())
    }

    fn set_switch(&mut self, control: &str, on: bool) -> Result<(), MixerError> {
        let mut s = self.0.lock().unwrap();
        if s.missing.contains(control) {
            return Err(MixerError::ControlNotFound(control.to_string()));
        }
        s.switches.insert(control.to_string(), on);
        Ok(())
    }
}

// ── audio ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct AudioShared {
    live: AtomicUsize,
    played: AtomicUsize,
    capture_broken: AtomicBool,
    open_fails: AtomicBool,
}

/// In-memory sound server.  Capture produces silence in small blocks.
#[derive(Clone, Default)]
pub struct FakeAudioBackend(Arc<AudioShared>);

impl FakeAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams currently allocated (capture and playback both count).
    pub fn live_streams(&self) -> usize {
        self.0.live.load(Ordering::SeqCst)
    }

    pub fn bytes_played(&self) -> usize {
        self.0.played.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.0.open_fails.store(fail, Ordering::SeqCst);
    }

    /// Make every further capture read fail.
    pub fn break_capture(&self) {
        self.0.capture_broken.store(true, Ordering::SeqCst);
    }
}

struct FakeCapture(Arc<AudioShared>);
struct FakePlayback(Arc<AudioShared>);

impl CaptureStream for FakeCapture {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioBackendError> {
        std::thread::sleep(Duration::from_millis(1));
        if self.0.capture_broken.load(Ordering::SeqCst) {
            return Err(AudioBackendError::StreamFailure("capture broken".into()));
        }
        let n = buf.len().min(32);
        buf[..n].fill(0);
        Ok(n)
    }
}

impl PlaybackStream for FakePlayback {
    fn write(&mut self, data: &[u8]) -> Result<(), AudioBackendError> {
        self.0.played.fetch_add(data.len(), Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for FakePlayback {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AudioBackend for FakeAudioBackend {
    fn probe(&self) -> Result<(), AudioBackendError> {
        if self.0.open_fails.load(Ordering::SeqCst) {
            return Err(AudioBackendError::ConnectFailure("refused".into()));
        }
        Ok(())
    }

    fn open_capture(&self, _spec: &StreamSpec) -> Result<Box<dyn CaptureStream>, AudioBackendError> {
        self.probe()?;
        self.0.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture(Arc::clone(&self.0))))
    }

    fn open_playback(
        &self,
        _spec: &StreamSpec,
    ) -> Result<Box<dyn PlaybackStream>, AudioBackendError> {
        self.probe()?;
        self.0.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakePlayback(Arc::clone(&self.0))))
    }
}

#[derive(Clone, Default)]
pub struct RecordingAnnouncer(Arc<Mutex<Vec<AudioRoute>>>);

impl RecordingAnnouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes announced since the last call.
    pub fn take(&self) -> Vec<AudioRoute> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl RouteAnnouncer for RecordingAnnouncer {
    fn announce(&mut self, route: &AudioRoute) {
        self.0.lock().unwrap().push(*route);
    }
}

/// A controller wired to fakes, backend not yet ready.
pub fn audio_rig() -> (AudioPathController, FakeAudioBackend) {
    let backend = FakeAudioBackend::new();
    let ctl = AudioPathController::new(
        Arc::new(backend.clone()),
        AudioMixerControl::new(Box::new(RecordingMixer::new()), &MixerConfig::default()),
        Box::new(RecordingAnnouncer::new()),
        StreamSpec {
            rate: 48_000,
            channels: 2,
        },
        64,
        Arc::new(|_: AudioBackendError| {}),
    );
    (ctl, backend)
}

// ── config store ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemState {
    entries: BTreeMap<String, String>,
    watchers: Watchers,
    fail_writes: bool,
    unreachable: bool,
}

#[derive(Clone, Default)]
pub struct MemoryStore(Arc<Mutex<MemState>>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key without notifying anyone.
    pub fn insert(&self, key: &str, value: &str) {
        self.0
            .lock()
            .unwrap()
            .entries
            .insert(key.to_string(), value.to_string());
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.0.lock().unwrap().entries.get(key).cloned()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.0.lock().unwrap().fail_writes = fail;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.0.lock().unwrap().unreachable = unreachable;
    }

    /// Another client changes a key.
    pub fn external_set(&self, key: &str, value: Option<&str>) {
        let mut s = self.0.lock().unwrap();
        match value {
            Some(v) => s.entries.insert(key.to_string(), v.to_string()),
            None => s.entries.remove(key),
        };
        s.watchers.notify(StoreChange {
            key: key.to_string(),
            value: value.map(str::to_string),
        });
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<(), StoreError> {
        let mut s = self.0.lock().unwrap();
        if s.fail_writes {
            return Err(StoreError::WriteFailure("read-only".into()));
        }
        let changed = match value {
            Some(v) => s.entries.insert(key.to_string(), v.to_string()).as_deref() != Some(v),
            None => s.entries.remove(key).is_some(),
        };
        if changed {
            s.watchers.notify(StoreChange {
                key: key.to_string(),
                value: value.map(str::to_string),
            });
        }
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn all_entries(&self, dir: &str) -> Result<Vec<(String, String)>, StoreError> {
        let s = self.0.lock().unwrap();
        if s.unreachable {
            return Err(StoreError::Unreachable("offline".into()));
        }
        Ok(s.entries
            .iter()
            .filter(|(k, _)| in_dir(k, dir))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.value(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, Some(value))
    }

    fn unset(&mut self, key: &str) -> Result<(), StoreError> {
        self.write(key, None)
    }

    fn watch(&mut self, dir: &str) -> broadcast::Receiver<StoreChange> {
        self.0.lock().unwrap().watchers.subscribe(dir)
    }

    fn reload(&mut self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

// ── rds ───────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct FakeRds(Arc<Mutex<RdsInfo>>);

impl FakeRds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ps(&self, ps: Option<&str>) {
        self.0.lock().unwrap().ps = ps.map(str::to_string);
    }
}

impl RdsSource for FakeRds {
    fn read(&mut self) -> RdsInfo {
        self.0.lock().unwrap().clone()
    }
}
