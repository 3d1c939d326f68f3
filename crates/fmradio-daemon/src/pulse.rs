//! PulseAudio (or PipeWire's pulse server) loopback streams.
//!
//! Only available on Linux.  Elsewhere `PulseBackend` never becomes ready and
//! the daemon stays in the digital output modes.

use crate::audio::{AudioBackend, CaptureStream, PlaybackStream, StreamSpec};
use crate::error::AudioBackendError;

pub struct PulseBackend {
    app_name: String,
}

impl PulseBackend {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
        }
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use tracing::debug;

    fn sample_spec(spec: &StreamSpec) -> Result<Spec, AudioBackendError> {
        let s = Spec {
            format: Format::S16le,
            channels: spec.channels,
            rate: spec.rate,
        };
        if !s.is_valid() {
            return Err(AudioBackendError::StreamFailure(format!(
                "invalid sample spec {} Hz x{}",
                spec.rate, spec.channels
            )));
        }
        Ok(s)
    }

    fn connect(
        app_name: &str,
        dir: Direction,
        description: &str,
        spec: &StreamSpec,
    ) -> Result<Simple, AudioBackendError> {
        let s = sample_spec(spec)?;
        Simple::new(None, app_name, dir, None, description, &s, None, None)
            .map_err(|e| AudioBackendError::ConnectFailure(format!("{}", e)))
    }

    struct PulseCapture(Simple);
    struct PulsePlayback(Simple);

    impl CaptureStream for PulseCapture {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, AudioBackendError> {
            self.0
                .read(buf)
                .map_err(|e| AudioBackendError::StreamFailure(format!("{}", e)))?;
            Ok(buf.len())
        }
    }

    impl PlaybackStream for PulsePlayback {
        fn write(&mut self, data: &[u8]) -> Result<(), AudioBackendError> {
            self.0
                .write(data)
                .map_err(|e| AudioBackendError::StreamFailure(format!("{}", e)))
        }
    }

    impl AudioBackend for PulseBackend {
        fn probe(&self) -> Result<(), AudioBackendError> {
            let spec = StreamSpec {
                rate: 48_000,
                channels: 2,
            };
            let probe = connect(&self.app_name, Direction::Playback, "probe", &spec)?;
            drop(probe);
            debug!("PulseAudio server reachable");
            Ok(())
        }

        fn open_capture(
            &self,
            spec: &StreamSpec,
        ) -> Result<Box<dyn CaptureStream>, AudioBackendError> {
            let s = connect(&self.app_name, Direction::Record, "FM Radio input", spec)?;
            Ok(Box::new(PulseCapture(s)))
        }

        fn open_playback(
            &self,
            spec: &StreamSpec,
        ) -> Result<Box<dyn PlaybackStream>, AudioBackendError> {
            let s = connect(&self.app_name, Direction::Playback, "FM Radio output", spec)?;
            Ok(Box::new(PulsePlayback(s)))
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl AudioBackend for PulseBackend {
    fn probe(&self) -> Result<(), AudioBackendError> {
        Err(AudioBackendError::ConnectFailure(format!(
            "{}: PulseAudio is only available on Linux",
            self.app_name
        )))
    }

    fn open_capture(&self, _spec: &StreamSpec) -> Result<Box<dyn CaptureStream>, AudioBackendError> {
        Err(AudioBackendError::ConnectFailure("unsupported platform".into()))
    }

    fn open_playback(
        &self,
        _spec: &StreamSpec,
    ) -> Result<Box<dyn PlaybackStream>, AudioBackendError> {
        Err(AudioBackendError::ConnectFailure("unsupported platform".into()))
    }
}
