/// Audio routing.
///
/// `AudioPathController` owns the output mode.  The digital modes (system,
/// speaker, headphones) only announce a route to the OS; the analog bypass
/// mode switches the mixer to the tuner ADC and runs an `AudioPath`, a
/// capture → playback loopback pumped on its own thread.  The mixer's analog
/// path and the loopback are exclusive: the old path is always torn down
/// before a new one is set up.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use fmradio_proto::protocol::OutputMode;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::AudioBackendError;
use crate::mixer::AudioMixerControl;
use crate::BroadcastMessage;

// ── streaming backend seam ────────────────────────────────────────────────────

/// S16LE sample layout shared by both loopback streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSpec {
    pub rate: u32,
    pub channels: u8,
}

pub trait CaptureStream {
    /// Block until some audio is available and copy it into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioBackendError>;
}

pub trait PlaybackStream {
    /// Append `data` after whatever is already queued.
    fn write(&mut self, data: &[u8]) -> Result<(), AudioBackendError>;
}

/// Connection to the sound server.  Streams are opened on the loopback
/// thread that uses them and never leave it.
pub trait AudioBackend: Send + Sync {
    /// Check the sound server is reachable.  Run off the event loop.
    fn probe(&self) -> Result<(), AudioBackendError>;
    fn open_capture(&self, spec: &StreamSpec) -> Result<Box<dyn CaptureStream>, AudioBackendError>;
    fn open_playback(&self, spec: &StreamSpec)
        -> Result<Box<dyn PlaybackStream>, AudioBackendError>;
}

/// Called from the loopback thread when a running stream fails.
pub type FailureHook = Arc<dyn Fn(AudioBackendError) + Send + Sync>;

// ── route announcements ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Sink,
    Source,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Sink => "sink",
            RouteKind::Source => "source",
        }
    }
}

/// A routing decision broadcast to the OS audio policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRoute {
    pub kind: RouteKind,
    pub device: &'static str,
    pub mode: &'static str,
    pub hwid: &'static str,
}

impl AudioRoute {
    pub const HEADPHONES: AudioRoute = AudioRoute {
        kind: RouteKind::Sink,
        device: "headphone",
        mode: "lineout",
        hwid: "na",
    };
    pub const SPEAKERS: AudioRoute = AudioRoute {
        kind: RouteKind::Sink,
        device: "ihf",
        mode: "ihf",
        hwid: "na",
    };
    pub const BYPASS: AudioRoute = AudioRoute {
        kind: RouteKind::Source,
        device: "fmrx",
        mode: "na",
        hwid: "na",
    };
    pub const MICROPHONE: AudioRoute = AudioRoute {
        kind: RouteKind::Source,
        device: "microphone",
        mode: "na",
        hwid: "na",
    };

    /// Routes announced when entering `mode`, in order.
    pub fn for_mode(mode: OutputMode) -> &'static [AudioRoute] {
        match mode {
            OutputMode::Mute => &[],
            OutputMode::System => &[AudioRoute::HEADPHONES, AudioRoute::MICROPHONE],
            OutputMode::Speaker => &[AudioRoute::SPEAKERS],
            OutputMode::Headphones => &[AudioRoute::HEADPHONES],
            OutputMode::HeadphonesBypass => &[AudioRoute::BYPASS],
        }
    }
}

impl std::fmt::Display for AudioRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{} (hwid {})",
            self.kind.as_str(),
            self.device,
            self.mode,
            self.hwid
        )
    }
}

/// Fire-and-forget sink for routing decisions.
pub trait RouteAnnouncer: Send {
    fn announce(&mut self, route: &AudioRoute);
}

/// Logs each decision and relays it to connected clients.
pub struct LogAnnouncer {
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl LogAnnouncer {
    pub fn new(broadcast_tx: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { broadcast_tx }
    }
}

impl RouteAnnouncer for LogAnnouncer {
    fn announce(&mut self, route: &AudioRoute) {
        info!("Audio route: {}", route);
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage::Log(format!("audio route {}", route)));
    }
}

// ── loopback ──────────────────────────────────────────────────────────────────

/// Collects captured bytes and releases them once `min_chunk` are pending.
pub struct Passthrough {
    pending: Vec<u8>,
    min_chunk: usize,
}

impl Passthrough {
    pub fn new(min_chunk: usize) -> Self {
        Self {
            pending: Vec::with_capacity(min_chunk),
            min_chunk,
        }
    }

    pub fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(data);
        if self.pending.len() >= self.min_chunk {
            Some(std::mem::take(&mut self.pending))
        } else {
            None
        }
    }
}

const CAPTURE_READ_BYTES: usize = 4096;

/// A running capture → playback pair.  Dropping it stops the thread and
/// releases both streams before `drop` returns.
pub struct AudioPath {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPath {
    pub fn start(
        backend: Arc<dyn AudioBackend>,
        spec: StreamSpec,
        min_chunk: usize,
        on_failure: FailureHook,
    ) -> Result<Self, AudioBackendError> {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let stop_flag = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("fm-loopback".into())
            .spawn(move || {
                let streams = backend
                    .open_capture(&spec)
                    .and_then(|c| backend.open_playback(&spec).map(|p| (c, p)));
                let (mut capture, mut playback) = match streams {
                    Ok(pair) => {
                        let _ = ready_tx.send(Ok(()));
                        pair
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let mut pump = Passthrough::new(min_chunk);
                let mut buf = vec![0u8; CAPTURE_READ_BYTES];
                while !stop_flag.load(Ordering::Relaxed) {
                    let res = capture.read(&mut buf).and_then(|n| match pump.push(&buf[..n]) {
                        Some(chunk) => playback.write(&chunk),
                        None => Ok(()),
                    });
                    if let Err(e) = res {
                        if !stop_flag.load(Ordering::Relaxed) {
                            on_failure(e);
                        }
                        break;
                    }
                }
                debug!("Loopback thread exiting");
            })
            .map_err(|e| AudioBackendError::StreamFailure(e.to_string()))?;

        let mut path = Self {
            stop,
            thread: Some(thread),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(path),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                path.shutdown();
                Err(AudioBackendError::StreamFailure(
                    "loopback thread exited during setup".into(),
                ))
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("Loopback thread panicked");
            }
        }
    }
}

impl Drop for AudioPath {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── controller ────────────────────────────────────────────────────────────────

pub struct AudioPathController {
    mode: OutputMode,
    backend: Arc<dyn AudioBackend>,
    backend_ready: bool,
    mixer: AudioMixerControl,
    announcer: Box<dyn RouteAnnouncer>,
    path: Option<AudioPath>,
    spec: StreamSpec,
    min_chunk: usize,
    on_failure: FailureHook,
}

impl AudioPathController {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        mixer: AudioMixerControl,
        announcer: Box<dyn RouteAnnouncer>,
        spec: StreamSpec,
        min_chunk: usize,
        on_failure: FailureHook,
    ) -> Self {
        Self {
            mode: OutputMode::Mute,
            backend,
            backend_ready: false,
            mixer,
            announcer,
            path: None,
            spec,
            min_chunk,
            on_failure,
        }
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn backend(&self) -> Arc<dyn AudioBackend> {
        Arc::clone(&self.backend)
    }

    #[cfg(test)]
    pub fn backend_ready(&self) -> bool {
        self.backend_ready
    }

    #[cfg(test)]
    pub fn has_path(&self) -> bool {
        self.path.is_some()
    }

    /// Switch output.  Modes other than `Mute` are recorded even while the
    /// backend is not connected and are applied once it is.  A loopback that
    /// cannot be created forces `Mute`.
    pub fn set(&mut self, mode: OutputMode) -> Result<(), AudioBackendError> {
        if mode != self.mode {
            debug!("Audio: {} -> {}", self.mode, mode);
        }
        self.mode = mode;

        if mode == OutputMode::Mute {
            self.teardown();
            self.mixer.set_bypass(false);
            return Ok(());
        }

        if !self.backend_ready {
            debug!("Audio: backend not ready, deferring {}", mode);
            return Ok(());
        }
        self.enter(mode)
    }

    fn enter(&mut self, mode: OutputMode) -> Result<(), AudioBackendError> {
        self.teardown();

        if mode != OutputMode::HeadphonesBypass {
            self.mixer.set_bypass(false);
            self.announce(mode);
            return Ok(());
        }

        self.mixer.set_bypass(true);
        self.announce(mode);
        match AudioPath::start(
            Arc::clone(&self.backend),
            self.spec,
            self.min_chunk,
            Arc::clone(&self.on_failure),
        ) {
            Ok(path) => {
                info!("Audio: bypass loopback running");
                self.path = Some(path);
                Ok(())
            }
            Err(e) => {
                warn!("Audio: cannot create loopback: {}", e);
                self.mode = OutputMode::Mute;
                self.mixer.set_bypass(false);
                Err(e)
            }
        }
    }

    fn announce(&mut self, mode: OutputMode) {
        for route in AudioRoute::for_mode(mode) {
            self.announcer.announce(route);
        }
    }

    fn teardown(&mut self) {
        if let Some(path) = self.path.take() {
            drop(path);
            debug!("Audio: loopback stopped");
        }
    }

    /// The sound server connected.  Applies a mode requested before it was
    /// available.
    pub fn on_backend_ready(&mut self) -> Result<(), AudioBackendError> {
        self.backend_ready = true;
        info!("Audio backend ready");
        if self.mode != OutputMode::Mute && self.path.is_none() {
            return self.enter(self.mode);
        }
        Ok(())
    }

    /// The sound server went away or a stream broke: fall back to `Mute`.
    pub fn on_backend_failed(&mut self, err: &AudioBackendError) {
        warn!("Audio backend failed, muting: {}", err);
        self.backend_ready = false;
        self.mode = OutputMode::Mute;
        self.teardown();
        self.mixer.set_bypass(false);
    }
}

impl Drop for AudioPathController {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAudioBackend, RecordingAnnouncer, RecordingMixer};
    use fmradio_proto::config::MixerConfig;

    struct Rig {
        ctl: AudioPathController,
        audio: FakeAudioBackend,
        mixer: RecordingMixer,
        routes: RecordingAnnouncer,
        failures: Arc<std::sync::Mutex<Vec<String>>>,
    }

    fn rig(min_chunk: usize) -> Rig {
        let audio = FakeAudioBackend::new();
        let mixer = RecordingMixer::new();
        let routes = RecordingAnnouncer::new();
        let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&failures);
        let ctl = AudioPathController::new(
            Arc::new(audio.clone()),
            AudioMixerControl::new(Box::new(mixer.clone()), &MixerConfig::default()),
            Box::new(routes.clone()),
            StreamSpec {
                rate: 48_000,
                channels: 2,
            },
            min_chunk,
            Arc::new(move |e: AudioBackendError| sink.lock().unwrap().push(e.to_string())),
        );
        Rig {
            ctl,
            audio,
            mixer,
            routes,
            failures,
        }
    }

    #[test]
    fn passthrough_waits_for_min_chunk() {
        let mut p = Passthrough::new(8);
        assert_eq!(p.push(&[1, 2, 3]), None);
        assert_eq!(p.push(&[4, 5, 6, 7, 8, 9]), Some(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert_eq!(p.push(&[1]), None);
    }

    #[test]
    fn starts_muted_without_streams() {
        let r = rig(16);
        assert_eq!(r.ctl.mode(), OutputMode::Mute);
        assert!(!r.ctl.has_path());
        assert_eq!(r.audio.live_streams(), 0);
    }

    #[test]
    fn route_table() {
        assert_eq!(
            AudioRoute::for_mode(OutputMode::System),
            &[AudioRoute::HEADPHONES, AudioRoute::MICROPHONE]
        );
        assert_eq!(AudioRoute::for_mode(OutputMode::Speaker), &[AudioRoute::SPEAKERS]);
        assert!(AudioRoute::for_mode(OutputMode::Mute).is_empty());
        assert_eq!(AudioRoute::BYPASS.to_string(), "source/fmrx/na (hwid na)");
    }

    #[test]
    fn bypass_then_mute_releases_everything() {
        let mut r = rig(16);
        r.ctl.on_backend_ready().unwrap();

        r.ctl.set(OutputMode::HeadphonesBypass).unwrap();
        assert!(r.ctl.has_path());
        assert_eq!(r.audio.live_streams(), 2);
        assert_eq!(r.mixer.enum_value("Input Select").as_deref(), Some("ADC"));
        assert_eq!(r.routes.take(), vec![AudioRoute::BYPASS]);

        r.ctl.set(OutputMode::Mute).unwrap();
        assert!(!r.ctl.has_path());
        assert_eq!(r.audio.live_streams(), 0);
        assert_eq!(r.mixer.switch_value("PGA Capture Switch"), Some(false));
        assert_eq!(r.mixer.switch_value("Left PGA Mixer Line2L Switch"), Some(false));
        assert_eq!(r.mixer.switch_value("Right PGA Mixer Line2R Switch"), Some(false));
    }

    #[test]
    fn loopback_forwards_captured_audio() {
        let mut r = rig(64);
        r.ctl.on_backend_ready().unwrap();
        r.ctl.set(OutputMode::HeadphonesBypass).unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while r.audio.bytes_played() < 64 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(r.audio.bytes_played() >= 64);
        r.ctl.set(OutputMode::Mute).unwrap();
    }

    #[test]
    fn digital_modes_announce_and_keep_mixer_digital() {
        let mut r = rig(16);
        r.ctl.on_backend_ready().unwrap();

        r.ctl.set(OutputMode::HeadphonesBypass).unwrap();
        r.routes.take();
        r.ctl.set(OutputMode::Speaker).unwrap();
        assert!(!r.ctl.has_path());
        assert_eq!(r.audio.live_streams(), 0);
        assert_eq!(r.routes.take(), vec![AudioRoute::SPEAKERS]);
        assert_eq!(r.mixer.enum_value("Input Select").as_deref(), Some("Digital Mic"));

        r.ctl.set(OutputMode::System).unwrap();
        assert_eq!(
            r.routes.take(),
            vec![AudioRoute::HEADPHONES, AudioRoute::MICROPHONE]
        );
    }

    #[test]
    fn mode_requested_before_backend_is_applied_on_ready() {
        let mut r = rig(16);
        r.ctl.set(OutputMode::HeadphonesBypass).unwrap();
        assert_eq!(r.ctl.mode(), OutputMode::HeadphonesBypass);
        assert!(!r.ctl.has_path());
        assert!(r.routes.take().is_empty());

        r.ctl.on_backend_ready().unwrap();
        assert!(r.ctl.has_path());
        assert_eq!(r.routes.take(), vec![AudioRoute::BYPASS]);
    }

    #[test]
    fn backend_failure_forces_mute() {
        let mut r = rig(16);
        r.ctl.on_backend_ready().unwrap();
        r.ctl.set(OutputMode::HeadphonesBypass).unwrap();

        r.ctl
            .on_backend_failed(&AudioBackendError::StreamFailure("server gone".into()));
        assert_eq!(r.ctl.mode(), OutputMode::Mute);
        assert!(!r.ctl.has_path());
        assert_eq!(r.audio.live_streams(), 0);
        assert!(!r.ctl.backend_ready());
    }

    #[test]
    fn failed_stream_open_falls_back_to_mute() {
        let mut r = rig(16);
        r.audio.fail_open(true);
        r.ctl.on_backend_ready().unwrap();

        let err = r.ctl.set(OutputMode::HeadphonesBypass).unwrap_err();
        assert!(matches!(err, AudioBackendError::ConnectFailure(_)));
        assert_eq!(r.ctl.mode(), OutputMode::Mute);
        assert!(!r.ctl.has_path());
        assert_eq!(r.audio.live_streams(), 0);
        assert_eq!(r.mixer.enum_value("Input Select").as_deref(), Some("Digital Mic"));
    }

    #[test]
    fn broken_capture_reports_through_hook() {
        let mut r = rig(16);
        r.ctl.on_backend_ready().unwrap();
        r.ctl.set(OutputMode::HeadphonesBypass).unwrap();
        r.audio.break_capture();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while r.failures.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(r.failures.lock().unwrap().len(), 1);
    }
}
