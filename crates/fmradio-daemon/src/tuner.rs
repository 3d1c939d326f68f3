/// Tuner device wrapper.
///
/// `TunerDevice` owns the (optional) open handle to the hardware tuner.  The
/// raw driver calls live behind [`TunerIo`]; the V4L2 implementation is in
/// `v4l2.rs`.  Frequencies cross this boundary in Hz and are converted to
/// driver units with the [`Precision`] detected once at open time.
use std::path::{Path, PathBuf};

use fmradio_proto::freq::{clamp_to_range, ABS_RANGE_HIGH, ABS_RANGE_LOW};
use tracing::{debug, info, warn};

use crate::error::DeviceError;

// ── units ─────────────────────────────────────────────────────────────────────

/// Unit of raw frequency values exchanged with the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    /// 62.5 Hz per step (driver reports the low-frequency capability).
    Fine,
    /// 62.5 kHz per step.
    Coarse,
}

impl Precision {
    pub fn from_capability(low_cap: bool) -> Self {
        if low_cap {
            Precision::Fine
        } else {
            Precision::Coarse
        }
    }

    /// Hz → driver steps, truncating.
    pub fn encode(self, hz: u64) -> u32 {
        let raw = match self {
            Precision::Fine => hz * 2 / 125,
            Precision::Coarse => hz / 62_500,
        };
        raw.min(u32::MAX as u64) as u32
    }

    /// Driver steps → Hz.  Half-hertz results round up so that
    /// `encode(decode(raw)) == raw` for every raw value.
    pub fn decode(self, raw: u32) -> u64 {
        match self {
            Precision::Fine => (raw as u64 * 125 + 1) / 2,
            Precision::Coarse => raw as u64 * 62_500,
        }
    }
}

// ── driver seam ───────────────────────────────────────────────────────────────

/// Snapshot of the tuner descriptor (`VIDIOC_G_TUNER` on V4L2).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunerStatus {
    /// The tuner is a radio (not TV) tuner.
    pub radio: bool,
    /// Raw tuner type as reported, for diagnostics.
    pub kind: u32,
    /// Low-frequency (62.5 Hz) capability flag.
    pub precise: bool,
    pub range_low: u32,
    pub range_high: u32,
    /// 0..=65535.
    pub signal: u32,
    /// The driver signals an RDS sub-channel.
    pub rds: bool,
}

/// Raw driver operations on an open tuner node.
pub trait TunerIo: Send {
    fn status(&mut self) -> Result<TunerStatus, DeviceError>;
    fn set_mute(&mut self, mute: bool) -> Result<(), DeviceError>;
    fn frequency_raw(&mut self) -> Result<u32, DeviceError>;
    fn set_frequency_raw(&mut self, raw: u32) -> Result<(), DeviceError>;
    /// Start a hardware seek.  The driver gives no completion callback; the
    /// landing frequency is observed with a later `frequency_raw`.
    fn seek(&mut self, upward: bool) -> Result<(), DeviceError>;
}

/// Opens tuner nodes.
pub trait TunerBackend: Send {
    fn open(&self, path: &Path) -> Result<Box<dyn TunerIo>, DeviceError>;
}

/// Backend for platforms without a tuner driver.  Every open fails.
#[cfg(not(target_os = "linux"))]
pub struct NoTunerBackend;

#[cfg(not(target_os = "linux"))]
impl TunerBackend for NoTunerBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn TunerIo>, DeviceError> {
        Err(DeviceError::WrongType(format!(
            "{}: no radio tuner support on this platform",
            path.display()
        )))
    }
}

// ── device ────────────────────────────────────────────────────────────────────

struct TunerHandle {
    io: Box<dyn TunerIo>,
    path: PathBuf,
    precision: Precision,
    range_low: u64,
    range_high: u64,
}

impl Drop for TunerHandle {
    fn drop(&mut self) {
        // Power the tuner off (hardware mute) before the node is released.
        if let Err(e) = self.io.set_mute(true) {
            warn!("Tuner: failed to power off {}: {}", self.path.display(), e);
        } else {
            debug!("Tuner: powered off {}", self.path.display());
        }
    }
}

pub struct TunerDevice {
    backend: Box<dyn TunerBackend>,
    handle: Option<TunerHandle>,
}

impl TunerDevice {
    pub fn new(backend: Box<dyn TunerBackend>) -> Self {
        Self {
            backend,
            handle: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Open the node, detect precision and range, and power the tuner on.
    /// Returns the hardware range in Hz.  Any previously open handle is
    /// released first.
    pub fn open(&mut self, path: &Path) -> Result<(u64, u64), DeviceError> {
        self.close();

        let mut io = self.backend.open(path)?;
        let status = io.status()?;
        if !status.radio {
            return Err(DeviceError::WrongType(format!(
                "{} reports tuner type {}",
                path.display(),
                status.kind
            )));
        }

        let precision = Precision::from_capability(status.precise);
        let range_low = precision.decode(status.range_low).max(ABS_RANGE_LOW);
        let range_high = precision.decode(status.range_high).min(ABS_RANGE_HIGH);

        info!(
            "Tuner detected on {} ({:?} precision, {} Hz to {} Hz)",
            path.display(),
            precision,
            range_low,
            range_high
        );

        io.set_mute(false)?;
        info!("Tuner powered");

        self.handle = Some(TunerHandle {
            io,
            path: path.to_path_buf(),
            precision,
            range_low,
            range_high,
        });
        Ok((range_low, range_high))
    }

    /// Power off and release the node.  No-op when nothing is open.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            info!("Tuner: closing {}", handle.path.display());
        }
    }

    fn handle(&mut self) -> Result<&mut TunerHandle, DeviceError> {
        self.handle.as_mut().ok_or(DeviceError::NotOpen)
    }

    pub fn range(&self) -> Option<(u64, u64)> {
        self.handle.as_ref().map(|h| (h.range_low, h.range_high))
    }

    #[cfg(test)]
    pub fn precision(&self) -> Option<Precision> {
        self.handle.as_ref().map(|h| h.precision)
    }

    /// Tune.  The value is clamped to the hardware range before encoding.
    pub fn set_frequency(&mut self, hz: u64) -> Result<(), DeviceError> {
        let h = self.handle()?;
        let hz = clamp_to_range(hz, h.range_low, h.range_high);
        let raw = h.precision.encode(hz);
        h.io.set_frequency_raw(raw)
    }

    pub fn frequency(&mut self) -> Result<u64, DeviceError> {
        let h = self.handle()?;
        let raw = h.io.frequency_raw()?;
        Ok(h.precision.decode(raw))
    }

    /// Signal strength, 0 (none) to 65536 (full scale).
    pub fn signal_strength(&mut self) -> Result<u32, DeviceError> {
        Ok(self.handle()?.io.status()?.signal)
    }

    pub fn rds_available(&mut self) -> Result<bool, DeviceError> {
        Ok(self.handle()?.io.status()?.rds)
    }

    pub fn seek_up(&mut self) -> Result<(), DeviceError> {
        self.handle()?.io.seek(true)
    }

    pub fn seek_down(&mut self) -> Result<(), DeviceError> {
        self.handle()?.io.seek(false)
    }
}
