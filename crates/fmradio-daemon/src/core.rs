/// RadioCore: single-owner event loop for the radio engine.
///
/// RadioCore owns the tuner, the audio path controller, the autoscan engine
/// and the preset store exclusively.  Everything that happens elsewhere (a
/// client command, an access grant, a sound server coming up, a store change
/// made by another program, the RDS poll tick) is delivered as a
/// `CoreEvent` into this loop; hardware calls are made from here and nowhere
/// else.
///
/// After each event that mutates state, RadioCore updates the shared
/// `StateManager` snapshot and broadcasts `BroadcastMessage::StateUpdated`
/// plus typed `RadioEvent`s to all listeners.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fmradio_proto::config::Config;
use fmradio_proto::freq::{canonicalize, clamp_to_range, DIAL_STEP_HZ};
use fmradio_proto::protocol::{Command, OutputMode, RadioEvent, RdsInfo};
use fmradio_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::access::{AccessBroker, AccessOutcome, AccessService};
use crate::audio::{AudioBackend, AudioPathController, RouteAnnouncer, StreamSpec};
use crate::autoscan::AutoscanEngine;
use crate::error::{AccessError, AudioBackendError, DeviceError};
use crate::mixer::{AudioMixerControl, MixerControl};
use crate::presets::PresetStore;
use crate::rds::RdsSource;
use crate::store::{ConfigStore, StoreChange};
use crate::tuner::{TunerBackend, TunerDevice};
use crate::BroadcastMessage;

/// How long after a hardware seek the landing frequency is read back.
const SEEK_SETTLE: Duration = Duration::from_millis(300);
/// Delay before asking the sound server again after it failed.
const AUDIO_RETRY: Duration = Duration::from_secs(10);

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the RadioCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A command from a socket client or the HTTP API.
    ClientCommand(Command),
    /// Answer of the access arbitration service.
    Access(Result<PathBuf, AccessError>),
    /// Time to renew access.
    AccessKeepalive,
    /// Result of probing the sound server.
    AudioBackend(Result<(), AudioBackendError>),
    /// A running loopback stream failed.
    AudioFailed(AudioBackendError),
    /// Run the next autoscan step of the given sweep.
    ScanStep(u64),
    /// Read back the frequency after a hardware seek.
    SeekSettled,
    /// A key in the preset namespace changed.
    StoreChanged(StoreChange),
    /// Store notifications were lost; reload the whole set.
    StoreResync,
    /// The store file changed on disk, or the fallback poll fired.
    StoreReloadTick,
    /// Time to poll RDS and the signal meter.
    RdsTick,
    /// Shutdown requested.
    Shutdown,
}

// ── composition ───────────────────────────────────────────────────────────────

/// External collaborators the core is built from.
pub struct CoreParts {
    pub tuner: Box<dyn TunerBackend>,
    pub mixer: Box<dyn MixerControl>,
    pub audio: Arc<dyn AudioBackend>,
    pub announcer: Box<dyn RouteAnnouncer>,
    pub access: Arc<dyn AccessService>,
    pub store: Box<dyn ConfigStore>,
    pub rds: Box<dyn RdsSource>,
}

impl CoreParts {
    /// The real hardware and services.
    pub fn system(
        config: &Config,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> anyhow::Result<Self> {
        #[cfg(target_os = "linux")]
        let tuner: Box<dyn TunerBackend> = Box::new(crate::v4l2::V4l2Backend);
        #[cfg(not(target_os = "linux"))]
        let tuner: Box<dyn TunerBackend> = Box::new(crate::tuner::NoTunerBackend);

        let store = crate::store::TomlStore::open(&config.presets.store_file)?;

        Ok(Self {
            tuner,
            mixer: Box::new(crate::mixer::AmixerControl::new(&config.mixer.card)),
            audio: Arc::new(crate::pulse::PulseBackend::new(&config.audio.app_name)),
            announcer: Box::new(crate::audio::LogAnnouncer::new(broadcast_tx)),
            access: crate::access::service_from_config(config),
            store: Box::new(store),
            rds: Box::new(crate::rds::SysfsRds::new(config.rds.sysfs_dir.clone())),
        })
    }
}

// ── RadioCore ─────────────────────────────────────────────────────────────────

pub struct RadioCore {
    config: Config,
    state_manager: Arc<StateManager>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    event_tx: mpsc::Sender<CoreEvent>,
    tuner: TunerDevice,
    audio: AudioPathController,
    access: AccessBroker,
    scan: AutoscanEngine,
    presets: PresetStore,
    rds: Box<dyn RdsSource>,
    /// Last RDS reading broadcast (to avoid duplicate broadcasts).
    last_rds: RdsInfo,
    /// Last frequency reported in a `FrequencyChanged` event.
    last_frequency: Option<u64>,
}

impl RadioCore {
    pub async fn new(
        config: Config,
        parts: CoreParts,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
        event_tx: mpsc::Sender<CoreEvent>,
    ) -> anyhow::Result<Self> {
        let state_manager = Arc::new(StateManager::new(config.daemon.state_file.clone()));

        let failure_tx = event_tx.clone();
        let mut audio = AudioPathController::new(
            parts.audio,
            AudioMixerControl::new(parts.mixer, &config.mixer),
            parts.announcer,
            StreamSpec {
                rate: config.audio.rate,
                channels: config.audio.channels,
            },
            config.audio.min_chunk_bytes,
            Arc::new(move |e: AudioBackendError| {
                let _ = failure_tx.try_send(CoreEvent::AudioFailed(e));
            }),
        );

        // Recorded now, applied once the sound server is reachable.
        let requested = state_manager.persistent().output;
        if let Err(e) = audio.set(requested) {
            warn!("RadioCore: cannot select {}: {}", requested, e);
        }

        let access = AccessBroker::new(
            parts.access,
            event_tx.clone(),
            Duration::from_secs(config.access.keepalive_secs.max(1)),
        );
        let presets = PresetStore::open(parts.store, &config.preset_dir());

        state_manager.set_output(audio.mode()).await;
        state_manager.set_presets(presets.get_all()).await;

        Ok(Self {
            scan: AutoscanEngine::new(config.scan.increment_hz),
            config,
            state_manager,
            broadcast_tx,
            event_tx,
            tuner: TunerDevice::new(parts.tuner),
            audio,
            access,
            presets,
            rds: parts.rds,
            last_rds: RdsInfo::default(),
            last_frequency: None,
        })
    }

    /// Borrow the state manager (for the socket and HTTP servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or the event channel is closed.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("RadioCore: starting event loop");

        self.access.request();
        let _keepalive = self.access.spawn_keepalive();
        self.probe_audio(Duration::ZERO);
        self.spawn_store_forwarder();
        let _store_watcher = self.watch_store_file();
        spawn_ticker(
            self.event_tx.clone(),
            Duration::from_secs(self.config.rds.poll_secs.max(1)),
            || CoreEvent::RdsTick,
        );

        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt).await {
                break;
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// Process one event.  Returns false when the loop should stop.
    pub async fn handle_event(&mut self, evt: CoreEvent) -> bool {
        match evt {
            CoreEvent::Shutdown => {
                info!("RadioCore: shutdown requested");
                return false;
            }

            CoreEvent::ClientCommand(cmd) => {
                info!("RadioCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }

            CoreEvent::Access(result) => self.handle_access(result).await,

            CoreEvent::AccessKeepalive => {
                debug!("RadioCore: renewing tuner access");
                self.access.request();
            }

            CoreEvent::AudioBackend(Ok(())) => {
                if let Err(e) = self.audio.on_backend_ready() {
                    self.report_error(format!("audio output unavailable: {}", e));
                }
                self.publish_output().await;
            }

            CoreEvent::AudioBackend(Err(e)) => {
                warn!("RadioCore: sound server unavailable: {}", e);
                self.audio.on_backend_failed(&e);
                self.publish_output().await;
                self.probe_audio(AUDIO_RETRY);
            }

            CoreEvent::AudioFailed(e) => {
                self.audio.on_backend_failed(&e);
                self.report_error(format!("audio stream failed: {}", e));
                self.publish_output().await;
                self.probe_audio(AUDIO_RETRY);
            }

            CoreEvent::ScanStep(generation) => self.handle_scan_step(generation).await,

            CoreEvent::SeekSettled => {
                if !self.scan.is_scanning() {
                    self.publish_frequency().await;
                    self.persist().await;
                }
            }

            CoreEvent::StoreChanged(change) => {
                if self.presets.apply_change(&change) {
                    self.publish_presets().await;
                }
            }

            CoreEvent::StoreResync => match self.presets.reload() {
                Ok(true) => self.publish_presets().await,
                Ok(false) => {}
                Err(e) => warn!("RadioCore: preset resync failed: {}", e),
            },

            CoreEvent::StoreReloadTick => {
                if let Err(e) = self.presets.poll_store() {
                    debug!("RadioCore: store reload failed: {}", e);
                }
            }

            CoreEvent::RdsTick => self.handle_rds_tick().await,
        }
        true
    }

    // ── commands ─────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        // Manual tuning always wins over a running sweep.
        if cmd.is_manual_tuning() && self.scan.is_scanning() {
            self.cancel_scan().await;
        }

        match cmd {
            Command::Tune { hz } => self.tune(hz).await,
            Command::SelectPreset { hz } => self.tune(canonicalize(hz)).await,
            Command::Step { up } => self.step_dial(up).await,
            Command::SeekUp => {
                let res = self.tuner.seek_up();
                self.after_seek(res);
            }
            Command::SeekDown => {
                let res = self.tuner.seek_down();
                self.after_seek(res);
            }
            Command::SetOutput { mode } => {
                // A sweep stays muted; the choice is applied when it ends.
                let chosen = if self.scan.set_restore_mode(mode) {
                    mode
                } else {
                    if let Err(e) = self.audio.set(mode) {
                        self.report_error(format!("cannot switch output to {}: {}", mode, e));
                    }
                    self.publish_output().await;
                    self.audio.mode()
                };
                if let Err(e) = self.state_manager.save(None, chosen).await {
                    warn!("RadioCore: failed to save state: {}", e);
                }
            }
            Command::StartScan => self.start_scan().await,
            Command::CancelScan => self.cancel_scan().await,
            Command::SetPreset { hz, name } => {
                let _ = self.presets.set_preset(hz, name.trim());
                self.publish_presets().await;
            }
            Command::AddPresetFromRds => match self.tuner.frequency() {
                Ok(hz) => {
                    // Read now: the last tick may belong to the previous station.
                    let name = if self.tuner.rds_available().unwrap_or(false) {
                        self.rds.read().ps.unwrap_or_default()
                    } else {
                        String::new()
                    };
                    // Without a station name an existing preset keeps its own.
                    if name.trim().is_empty() && self.presets.is_preset(hz) {
                        return;
                    }
                    let _ = self.presets.set_preset(hz, name.trim());
                    self.publish_presets().await;
                }
                Err(e) => self.report_error(format!("no frequency to store: {}", e)),
            },
            Command::RemovePreset { hz } => {
                let _ = self.presets.remove_preset(hz);
                self.publish_presets().await;
            }
            Command::GetState => {
                // State will be broadcast automatically
            }
        }

        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    /// The landing frequency is only known once the hardware settles.
    fn after_seek(&self, res: Result<(), DeviceError>) {
        match res {
            Ok(()) => self.after(SEEK_SETTLE, CoreEvent::SeekSettled),
            Err(e) => self.report_error(format!("seek failed: {}", e)),
        }
    }

    async fn tune(&mut self, hz: u64) {
        if let Err(e) = self.tuner.set_frequency(hz) {
            self.report_error(format!("cannot tune: {}", e));
            return;
        }
        self.publish_frequency().await;
        self.persist().await;
    }

    /// One dial step, landing on the 0.1 MHz grid inside the hardware range.
    async fn step_dial(&mut self, up: bool) {
        let (Some((low, high)), Ok(current)) = (self.tuner.range(), self.tuner.frequency()) else {
            self.report_error("tuner not available".to_string());
            return;
        };
        let target = if up {
            current.saturating_add(DIAL_STEP_HZ)
        } else {
            current.saturating_sub(DIAL_STEP_HZ)
        };
        let target = clamp_to_range(canonicalize(clamp_to_range(target, low, high)), low, high);
        self.tune(target).await;
    }

    // ── autoscan ─────────────────────────────────────────────────────────────

    async fn start_scan(&mut self) {
        match self.scan.start(&mut self.tuner, &mut self.audio) {
            Ok(true) => {
                self.state_manager.set_scanning(true).await;
                self.emit(RadioEvent::ScanStateChanged { scanning: true });
                self.publish_output().await;
                self.schedule_scan_step();
            }
            Ok(false) => debug!("RadioCore: scan already running"),
            Err(e) => self.report_error(format!("cannot start scan: {}", e)),
        }
    }

    async fn cancel_scan(&mut self) {
        if self.scan.cancel(&mut self.tuner, &mut self.audio) {
            self.scan_finished().await;
        }
    }

    async fn handle_scan_step(&mut self, generation: u64) {
        if !self.scan.is_scanning() || generation != self.scan.generation() {
            debug!("RadioCore: dropping stale scan step {}", generation);
            return;
        }

        let report = self
            .scan
            .step(&mut self.tuner, &mut self.audio, &mut self.presets);
        if let Some(hz) = report.found {
            info!("RadioCore: scan found a station at {} Hz", hz);
            self.publish_presets().await;
        }

        if report.finished {
            self.scan_finished().await;
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        } else {
            if let Ok(hz) = self.tuner.frequency() {
                let signal = self.tuner.signal_strength().unwrap_or(0);
                self.state_manager.set_frequency(Some(hz), signal).await;
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            self.schedule_scan_step();
        }
    }

    async fn scan_finished(&mut self) {
        self.state_manager.set_scanning(false).await;
        self.emit(RadioEvent::ScanStateChanged { scanning: false });
        self.publish_output().await;
        self.publish_frequency().await;
    }

    fn schedule_scan_step(&self) {
        let tx = self.event_tx.clone();
        let generation = self.scan.generation();
        let settle = self.config.scan.settle_ms;
        tokio::spawn(async move {
            if settle == 0 {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(Duration::from_millis(settle)).await;
            }
            let _ = tx.send(CoreEvent::ScanStep(generation)).await;
        });
    }

    // ── access / audio ───────────────────────────────────────────────────────

    async fn handle_access(&mut self, result: Result<PathBuf, AccessError>) {
        match self.access.handle_response(result, &mut self.tuner) {
            AccessOutcome::Opened { low, high } => {
                self.state_manager.set_tuner(true, Some((low, high))).await;
                self.emit(RadioEvent::RangeChanged { low, high });
                self.emit(RadioEvent::TunerAvailability { ready: true });

                let restore = self
                    .state_manager
                    .persistent()
                    .last_frequency
                    .unwrap_or(low);
                if let Err(e) = self.tuner.set_frequency(clamp_to_range(restore, low, high)) {
                    warn!("RadioCore: cannot restore frequency: {}", e);
                }
                self.publish_frequency().await;
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
            }
            AccessOutcome::Renewed => {}
            AccessOutcome::Unavailable => {
                if !self.tuner.is_open() {
                    self.state_manager.set_tuner(false, None).await;
                    let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
                }
            }
        }
    }

    /// Probe the sound server on a blocking thread after `delay`.
    fn probe_audio(&self, delay: Duration) {
        let backend = self.audio.backend();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = match tokio::task::spawn_blocking(move || backend.probe()).await {
                Ok(r) => r,
                Err(e) => Err(AudioBackendError::ConnectFailure(e.to_string())),
            };
            let _ = tx.send(CoreEvent::AudioBackend(result)).await;
        });
    }

    // ── store / rds ──────────────────────────────────────────────────────────

    fn spawn_store_forwarder(&mut self) {
        let mut rx = self.presets.watch();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                let evt = match rx.recv().await {
                    Ok(change) => CoreEvent::StoreChanged(change),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("RadioCore: missed {} store notifications", n);
                        CoreEvent::StoreResync
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if tx.send(evt).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Reload the store whenever its file changes on disk.  Falls back to
    /// polling when the file cannot be watched.
    fn watch_store_file(&self) -> Option<notify::RecommendedWatcher> {
        let path = &self.config.presets.store_file;
        let tx = self.event_tx.clone();
        match crate::store::watch_file(path, move || {
            let _ = tx.try_send(CoreEvent::StoreReloadTick);
        }) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                let period = Duration::from_secs(self.config.presets.poll_secs.max(1));
                warn!(
                    "RadioCore: cannot watch {}: {}; polling every {:?}",
                    path.display(),
                    e,
                    period
                );
                spawn_ticker(self.event_tx.clone(), period, || CoreEvent::StoreReloadTick);
                None
            }
        }
    }

    async fn handle_rds_tick(&mut self) {
        if !self.tuner.is_open() || self.scan.is_scanning() {
            return;
        }

        let info = if self.tuner.rds_available().unwrap_or(false) {
            self.rds.read()
        } else {
            RdsInfo::default()
        };
        if info != self.last_rds {
            debug!("RadioCore: RDS {:?}", info);
            self.last_rds = info.clone();
            self.state_manager.set_rds(info.clone()).await;
            let _ = self.broadcast_tx.send(BroadcastMessage::Rds(info.clone()));
        }

        // Presets found by a scan are unnamed until the station tells us.
        if let (Ok(hz), Some(ps)) = (self.tuner.frequency(), info.ps.as_deref()) {
            if self.presets.get_preset(hz) == Some("") {
                info!("RadioCore: naming preset at {} Hz '{}'", canonicalize(hz), ps);
                let _ = self.presets.set_preset(hz, ps.trim());
                self.publish_presets().await;
            }
        }

        self.publish_frequency().await;
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    // ── publishing ───────────────────────────────────────────────────────────

    fn emit(&self, event: RadioEvent) {
        let _ = self.broadcast_tx.send(BroadcastMessage::Event(event));
    }

    fn report_error(&self, message: String) {
        warn!("RadioCore: {}", message);
        let _ = self.broadcast_tx.send(BroadcastMessage::Error(message));
    }

    fn after(&self, delay: Duration, evt: CoreEvent) {
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(evt).await;
        });
    }

    async fn publish_frequency(&mut self) {
        let hz = self.tuner.frequency().ok();
        let signal = if hz.is_some() {
            self.tuner.signal_strength().unwrap_or(0)
        } else {
            0
        };
        self.state_manager.set_frequency(hz, signal).await;
        if hz != self.last_frequency {
            self.last_frequency = hz;
            if let Some(hz) = hz {
                self.emit(RadioEvent::FrequencyChanged { hz });
            }
            self.clear_rds().await;
        }
    }

    /// RDS data belongs to one station; drop it when the tuner moves.
    async fn clear_rds(&mut self) {
        if self.last_rds == RdsInfo::default() {
            return;
        }
        self.last_rds = RdsInfo::default();
        self.state_manager.set_rds(RdsInfo::default()).await;
        let _ = self.broadcast_tx.send(BroadcastMessage::Rds(RdsInfo::default()));
    }

    async fn publish_output(&mut self) {
        let mode = self.audio.mode();
        if self.state_manager.get_state().await.output != mode {
            self.state_manager.set_output(mode).await;
            self.emit(RadioEvent::OutputModeChanged { mode });
        }
    }

    async fn publish_presets(&mut self) {
        self.state_manager.set_presets(self.presets.get_all()).await;
        self.emit(RadioEvent::PresetsChanged);
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    /// Save the current frequency next to the last chosen output mode.
    async fn persist(&self) {
        let output = self.state_manager.persistent().output;
        if let Err(e) = self.state_manager.save(self.last_frequency, output).await {
            warn!("RadioCore: failed to save state: {}", e);
        }
    }

    async fn cleanup(&mut self) {
        self.cancel_scan().await;
        self.persist().await;
        if let Err(e) = self.audio.set(OutputMode::Mute) {
            error!("RadioCore: failed to mute on exit: {}", e);
        }
        self.tuner.close();
        info!("RadioCore: stopped");
    }
}

fn spawn_ticker<F>(tx: mpsc::Sender<CoreEvent>, period: Duration, make: F)
where
    F: Fn() -> CoreEvent + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            if tx.send(make()).await.is_err() {
                break;
            }
        }
    });
}
