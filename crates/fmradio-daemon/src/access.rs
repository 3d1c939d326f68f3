/// Tuner access arbitration.
///
/// The tuner node may be gated by an OS service that has to grant (and keep
/// granting) access before the node can be opened.  Requests run as spawned
/// tasks; their answers come back into the core loop as
/// `CoreEvent::Access`, where `AccessBroker::handle_response` opens the
/// device on the first grant and treats later grants as renewals.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fmradio_proto::config::{AccessConfig, AccessMode, Config};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::CoreEvent;
use crate::error::AccessError;
use crate::tuner::TunerDevice;

#[async_trait]
pub trait AccessService: Send + Sync {
    /// Ask for (or renew) access.  On grant, returns the device node path.
    async fn request(&self) -> Result<PathBuf, AccessError>;
}

// ── D-Bus enabler ─────────────────────────────────────────────────────────────

/// Calls the enabler's `request` method on the system bus through
/// `dbus-send`.
pub struct DbusSendService {
    binary: PathBuf,
    service: String,
    object_path: String,
    interface: String,
}

impl DbusSendService {
    pub fn new(config: &AccessConfig) -> Self {
        let binary = fmradio_proto::platform::find_dbus_send_binary()
            .unwrap_or_else(|| PathBuf::from("dbus-send"));
        Self {
            binary,
            service: config.service.clone(),
            object_path: config.object_path.clone(),
            interface: config.interface.clone(),
        }
    }
}

#[async_trait]
impl AccessService for DbusSendService {
    async fn request(&self) -> Result<PathBuf, AccessError> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--system")
            .arg("--print-reply")
            .arg(format!("--dest={}", self.service))
            .arg(&self.object_path)
            .arg(format!("{}.request", self.interface))
            .output()
            .await
            .map_err(|e| AccessError::Transport(format!("{}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AccessError::Transport(stderr.trim().to_string()));
        }
        parse_reply(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse a `dbus-send --print-reply` answer of the form `(int32, string)`.
pub fn parse_reply(reply: &str) -> Result<PathBuf, AccessError> {
    let mut code = None;
    let mut device = None;

    for line in reply.lines().map(str::trim) {
        if let Some(v) = line.strip_prefix("int32 ") {
            code = v.trim().parse::<i32>().ok();
        } else if let Some(v) = line.strip_prefix("string ") {
            device = Some(v.trim().trim_matches('"').to_string());
        }
    }

    match (code, device) {
        (Some(0), Some(dev)) if !dev.is_empty() => Ok(PathBuf::from(dev)),
        (Some(0), _) => Err(AccessError::Transport("grant without device path".into())),
        (Some(code), _) => Err(AccessError::Denied(code)),
        (None, _) => Err(AccessError::Transport(format!(
            "unexpected reply: {}",
            reply.trim()
        ))),
    }
}

// ── static grant ──────────────────────────────────────────────────────────────

/// Always grants a fixed node.  For systems without an enabler service.
pub struct StaticService {
    device: PathBuf,
}

impl StaticService {
    pub fn new(device: PathBuf) -> Self {
        Self { device }
    }
}

#[async_trait]
impl AccessService for StaticService {
    async fn request(&self) -> Result<PathBuf, AccessError> {
        Ok(self.device.clone())
    }
}

pub fn service_from_config(config: &Config) -> Arc<dyn AccessService> {
    match config.access.mode {
        AccessMode::Dbus => Arc::new(DbusSendService::new(&config.access)),
        AccessMode::Static => Arc::new(StaticService::new(config.tuner.fallback_device.clone())),
    }
}

// ── broker ────────────────────────────────────────────────────────────────────

/// Result of applying an access answer.
#[derive(Debug, PartialEq, Eq)]
pub enum AccessOutcome {
    /// First grant: the tuner is now open with this range.
    Opened { low: u64, high: u64 },
    /// Grant while the device is already open.
    Renewed,
    /// Denied, unreachable, or the node failed to open.
    Unavailable,
}

pub struct AccessBroker {
    service: Arc<dyn AccessService>,
    event_tx: mpsc::Sender<CoreEvent>,
    keepalive: Duration,
}

impl AccessBroker {
    pub fn new(
        service: Arc<dyn AccessService>,
        event_tx: mpsc::Sender<CoreEvent>,
        keepalive: Duration,
    ) -> Self {
        Self {
            service,
            event_tx,
            keepalive,
        }
    }

    /// Issue a request.  Returns immediately; the answer arrives as
    /// `CoreEvent::Access`.
    pub fn request(&self) {
        let service = Arc::clone(&self.service);
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = service.request().await;
            let _ = tx.send(CoreEvent::Access(result)).await;
        });
    }

    /// Post `CoreEvent::AccessKeepalive` every keep-alive interval.
    pub fn spawn_keepalive(&self) -> tokio::task::JoinHandle<()> {
        let tx = self.event_tx.clone();
        let period = self.keepalive;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if tx.send(CoreEvent::AccessKeepalive).await.is_err() {
                    break;
                }
            }
        })
    }

    pub fn handle_response(
        &self,
        result: Result<PathBuf, AccessError>,
        tuner: &mut TunerDevice,
    ) -> AccessOutcome {
        let path = match result {
            Ok(path) => path,
            Err(e) => {
                warn!("Access: {}", e);
                return AccessOutcome::Unavailable;
            }
        };

        if tuner.is_open() {
            debug!("Access: renewed access to {}", path.display());
            return AccessOutcome::Renewed;
        }

        info!("Access: granted {}", path.display());
        match tuner.open(&path) {
            Ok((low, high)) => AccessOutcome::Opened { low, high },
            Err(e) => {
                warn!("Access: cannot open {}: {}", path.display(), e);
                AccessOutcome::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTuner, FakeTunerBackend};

    const GRANTED: &str = "method return time=1700000000.1 sender=:1.5 -> destination=:1.9 serial=7 reply_serial=2
   int32 0
   string \"/dev/radio1\"
";

    fn broker() -> (AccessBroker, mpsc::Receiver<CoreEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let service = Arc::new(StaticService::new(PathBuf::from("/dev/radio0")));
        (AccessBroker::new(service, tx, Duration::from_secs(20)), rx)
    }

    #[test]
    fn parse_granted_reply() {
        assert_eq!(parse_reply(GRANTED).unwrap(), PathBuf::from("/dev/radio1"));
    }

    #[test]
    fn parse_denied_reply() {
        let reply = "method return\n   int32 3\n   string \"\"\n";
        assert!(matches!(parse_reply(reply), Err(AccessError::Denied(3))));
    }

    #[test]
    fn parse_garbage_reply() {
        assert!(matches!(
            parse_reply("Error org.freedesktop.DBus.Error.ServiceUnknown"),
            Err(AccessError::Transport(_))
        ));
        assert!(matches!(
            parse_reply("method return\n   int32 0\n"),
            Err(AccessError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn request_posts_answer_into_loop() {
        let (broker, mut rx) = broker();
        broker.request();
        match rx.recv().await {
            Some(CoreEvent::Access(Ok(path))) => assert_eq!(path, PathBuf::from("/dev/radio0")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_grant_opens_then_renews() {
        let (broker, _rx) = broker();
        let fake = FakeTuner::fm_band(true);
        let mut tuner = TunerDevice::new(Box::new(FakeTunerBackend::new(fake.clone())));

        let outcome = broker.handle_response(Ok(PathBuf::from("/dev/radio0")), &mut tuner);
        assert_eq!(
            outcome,
            AccessOutcome::Opened {
                low: 87_500_000,
                high: 108_000_000
            }
        );
        assert_eq!(fake.open_count(), 1);

        let outcome = broker.handle_response(Ok(PathBuf::from("/dev/radio0")), &mut tuner);
        assert_eq!(outcome, AccessOutcome::Renewed);
        assert_eq!(fake.open_count(), 1);
    }

    #[tokio::test]
    async fn denial_leaves_tuner_closed() {
        let (broker, _rx) = broker();
        let mut tuner = TunerDevice::new(Box::new(FakeTunerBackend::new(FakeTuner::fm_band(true))));
        let outcome = broker.handle_response(Err(AccessError::Denied(1)), &mut tuner);
        assert_eq!(outcome, AccessOutcome::Unavailable);
        assert!(!tuner.is_open());
        assert!(tuner.frequency().is_err());
    }

    #[tokio::test]
    async fn grant_for_unopenable_node_is_unavailable() {
        let (broker, _rx) = broker();
        let mut tuner = TunerDevice::new(Box::new(FakeTunerBackend::failing()));
        let outcome = broker.handle_response(Ok(PathBuf::from("/dev/radio7")), &mut tuner);
        assert_eq!(outcome, AccessOutcome::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_ticks() {
        let (broker, mut rx) = broker();
        let handle = broker.spawn_keepalive();
        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(matches!(rx.recv().await, Some(CoreEvent::AccessKeepalive)));
        handle.abort();
    }
}
