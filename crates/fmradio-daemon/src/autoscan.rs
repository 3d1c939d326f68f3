/// AutoscanEngine: sweeps the band and records stations as presets.
///
/// The engine itself does no scheduling.  `start` prepares the sweep and
/// bumps the generation; the core loop then calls `step` once per
/// `CoreEvent::ScanStep(generation)` until a step reports `finished`.  A
/// step event carrying an older generation belongs to a cancelled sweep and
/// is dropped by the core.
use fmradio_proto::freq::{canonicalize, SIGNAL_FULL_SCALE};
use fmradio_proto::protocol::OutputMode;
use tracing::{debug, info, warn};

use crate::audio::AudioPathController;
use crate::error::DeviceError;
use crate::presets::PresetStore;
use crate::tuner::TunerDevice;

/// A station is recorded when its signal exceeds a third of full scale.
pub const SIGNAL_THRESHOLD: u32 = SIGNAL_FULL_SCALE / 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCursor {
    /// Frequency to return to when the sweep ends.
    pub previous_frequency: u64,
    /// Upper bound of the hardware range.
    pub target_max: u64,
    /// Frequency requested before the last seek.
    pub current: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Canonical frequency of a preset created by this step.
    pub found: Option<u64>,
    /// The sweep is over; frequency and output mode have been restored.
    pub finished: bool,
}

pub struct AutoscanEngine {
    increment: u64,
    cursor: Option<ScanCursor>,
    previous_mode: OutputMode,
    generation: u64,
    steps: u32,
}

impl AutoscanEngine {
    pub fn new(increment: u64) -> Self {
        Self {
            increment: increment.max(1),
            cursor: None,
            previous_mode: OutputMode::Mute,
            generation: 0,
            steps: 0,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.cursor.is_some()
    }

    /// Identifies the current sweep.  Changes on every start and stop.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the output mode restored when the running sweep ends.
    /// Returns false, and changes nothing, when no sweep is running.
    pub fn set_restore_mode(&mut self, mode: OutputMode) -> bool {
        if self.cursor.is_none() {
            return false;
        }
        debug!("Autoscan: {} selected, applied after the sweep", mode);
        self.previous_mode = mode;
        true
    }

    #[cfg(test)]
    pub fn cursor(&self) -> Option<&ScanCursor> {
        self.cursor.as_ref()
    }

    /// Begin a sweep.  Returns `Ok(false)` if one is already running.
    pub fn start(
        &mut self,
        tuner: &mut TunerDevice,
        audio: &mut AudioPathController,
    ) -> Result<bool, DeviceError> {
        if self.cursor.is_some() {
            return Ok(false);
        }

        let previous_frequency = tuner.frequency()?;
        let (low, high) = tuner.range().ok_or(DeviceError::NotOpen)?;

        self.previous_mode = audio.mode();
        let _ = audio.set(OutputMode::Mute);

        if let Err(e) = tuner.set_frequency(low) {
            let _ = audio.set(self.previous_mode);
            return Err(e);
        }
        if let Err(e) = tuner.seek_up() {
            warn!("Autoscan: seek failed: {}", e);
        }

        info!(
            "Autoscan: sweeping {} Hz to {} Hz from {} Hz",
            low, high, previous_frequency
        );
        self.cursor = Some(ScanCursor {
            previous_frequency,
            target_max: high,
            current: low,
        });
        self.generation += 1;
        self.steps = 0;
        Ok(true)
    }

    pub fn step(
        &mut self,
        tuner: &mut TunerDevice,
        audio: &mut AudioPathController,
        presets: &mut PresetStore,
    ) -> StepReport {
        let mut report = StepReport::default();
        let Some(cursor) = self.cursor.as_mut() else {
            return report;
        };
        self.steps += 1;

        let freq = match tuner.frequency() {
            Ok(f) => f,
            Err(e) => {
                warn!("Autoscan: lost the tuner: {}", e);
                self.finish(tuner, audio);
                report.finished = true;
                return report;
            }
        };
        let signal = tuner.signal_strength().unwrap_or(0);

        if signal > SIGNAL_THRESHOLD && !presets.is_preset(freq) {
            debug!("Autoscan: station at {} Hz (signal {})", freq, signal);
            let _ = presets.set_preset(freq, "");
            report.found = Some(canonicalize(freq));
        }

        if freq >= cursor.target_max {
            self.finish(tuner, audio);
            report.finished = true;
            return report;
        }

        // The increment is a floor: when the seek overshot, continue from
        // where it landed.
        let next = (freq.max(cursor.current) + self.increment).min(cursor.target_max);
        cursor.current = next;
        if let Err(e) = tuner.set_frequency(next) {
            warn!("Autoscan: cannot tune {} Hz: {}", next, e);
        }
        if let Err(e) = tuner.seek_up() {
            warn!("Autoscan: seek failed: {}", e);
        }
        report
    }

    /// Stop a sweep early.  Returns false if none was running.
    pub fn cancel(&mut self, tuner: &mut TunerDevice, audio: &mut AudioPathController) -> bool {
        if self.cursor.is_none() {
            return false;
        }
        info!("Autoscan: cancelled");
        self.finish(tuner, audio);
        true
    }

    fn finish(&mut self, tuner: &mut TunerDevice, audio: &mut AudioPathController) {
        let Some(cursor) = self.cursor.take() else {
            return;
        };
        self.generation += 1;
        info!("Autoscan: done after {} steps", self.steps);

        if let Err(e) = tuner.set_frequency(cursor.previous_frequency) {
            warn!("Autoscan: cannot restore frequency: {}", e);
        }
        if let Err(e) = audio.set(self.previous_mode) {
            warn!("Autoscan: cannot restore output {}: {}", self.previous_mode, e);
        }
    }
}
