//! Mixer control for the analog bypass route.
//!
//! Two primitives: pick an option of an enumerated control by name, and set
//! a boolean switch on every channel it has.  Mixer topology differs between
//! hardware revisions, so a missing control is reported, logged by the
//! caller and otherwise ignored.

use std::path::PathBuf;
use std::process::Command;

use fmradio_proto::config::{MixerConfig, MixerSetting};
use tracing::{debug, warn};

use crate::error::MixerError;

pub trait MixerControl: Send {
    /// Set an enumerated control to the option named `option` (all channels).
    fn set_enum(&mut self, control: &str, option: &str) -> Result<(), MixerError>;
    /// Set a boolean control on every channel it exposes.
    fn set_switch(&mut self, control: &str, on: bool) -> Result<(), MixerError>;
}

/// Owns the mixer handle and knows which writes make up the bypass route.
pub struct AudioMixerControl {
    mixer: Box<dyn MixerControl>,
    bypass_enable: Vec<MixerSetting>,
    bypass_disable: Vec<MixerSetting>,
}

impl AudioMixerControl {
    pub fn new(mixer: Box<dyn MixerControl>, config: &MixerConfig) -> Self {
        Self {
            mixer,
            bypass_enable: config.bypass_enable.clone(),
            bypass_disable: config.bypass_disable.clone(),
        }
    }

    pub fn set_enum_value(&mut self, control: &str, option: &str) -> Result<(), MixerError> {
        self.mixer.set_enum(control, option)
    }

    pub fn set_bool_value(&mut self, control: &str, on: bool) -> Result<(), MixerError> {
        self.mixer.set_switch(control, on)
    }

    /// Switch the analog input to the tuner (or back to the default input).
    ///
    /// Every setting is attempted even if an earlier one fails; the failures
    /// are logged and returned.
    pub fn set_bypass(&mut self, enabled: bool) -> Vec<MixerError> {
        let settings = if enabled {
            self.bypass_enable.clone()
        } else {
            self.bypass_disable.clone()
        };

        let mut errors = Vec::new();
        for setting in &settings {
            let res = match setting {
                MixerSetting::Enum { control, value } => self.set_enum_value(control, value),
                MixerSetting::Switch { control, on } => self.set_bool_value(control, *on),
            };
            if let Err(e) = res {
                warn!("Mixer: {}", e);
                errors.push(e);
            }
        }
        debug!(
            "Mixer: bypass route {} ({} of {} writes failed)",
            if enabled { "enabled" } else { "disabled" },
            errors.len(),
            settings.len()
        );
        errors
    }
}

// ── amixer backend ────────────────────────────────────────────────────────────

/// Description of one control as printed by `amixer cget`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ControlInfo {
    pub kind: String,
    pub channels: usize,
    pub items: Vec<String>,
}

/// Parse `amixer cget` output.
pub fn parse_cget(output: &str) -> Option<ControlInfo> {
    let mut info = ControlInfo::default();
    let mut seen_type = false;

    for line in output.lines() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("; ") else {
            continue;
        };
        if let Some(attrs) = rest.strip_prefix("type=") {
            seen_type = true;
            let mut parts = attrs.split(',');
            info.kind = parts.next().unwrap_or_default().to_string();
            for part in parts {
                if let Some(n) = part.strip_prefix("values=") {
                    info.channels = n.parse().unwrap_or(1);
                }
            }
        } else if let Some(item) = rest.strip_prefix("Item #") {
            // `0 'Digital Mic'`
            if let Some(start) = item.find('\'') {
                let name = item[start + 1..].trim_end_matches('\'');
                info.items.push(name.to_string());
            }
        }
    }

    seen_type.then_some(info)
}

/// Drives ALSA mixer controls through the `amixer` tool.
pub struct AmixerControl {
    binary: PathBuf,
    card: String,
}

impl AmixerControl {
    pub fn new(card: &str) -> Self {
        let binary = fmradio_proto::platform::find_amixer_binary()
            .unwrap_or_else(|| PathBuf::from("amixer"));
        Self {
            binary,
            card: card.to_string(),
        }
    }

    /// Run `amixer` on the card.  `control` names the element the command
    /// addresses, for error reports.
    fn run(&self, control: &str, args: &[String]) -> Result<String, MixerError> {
        let output = Command::new(&self.binary)
            .arg("-D")
            .arg(&self.card)
            .args(args)
            .output()
            .map_err(|e| MixerError::WriteFailure(format!("{}: {}", self.binary.display(), e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        Err(failure(control, &String::from_utf8_lossy(&output.stderr)))
    }

    fn info(&self, control: &str) -> Result<ControlInfo, MixerError> {
        let out = self.run(control, &["cget".to_string(), control_id(control)])?;
        parse_cget(&out).ok_or_else(|| MixerError::ControlNotFound(control.to_string()))
    }

    fn write(&self, control: &str, values: String) -> Result<(), MixerError> {
        self.run(
            control,
            &[
                "-q".to_string(),
                "cset".to_string(),
                control_id(control),
                values,
            ],
        )
        .map(|_| ())
    }
}

/// Map `amixer` error output to a mixer error for `control`.
fn failure(control: &str, stderr: &str) -> MixerError {
    if stderr.contains("Cannot find the given element") {
        MixerError::ControlNotFound(control.to_string())
    } else {
        MixerError::WriteFailure(stderr.trim().to_string())
    }
}

fn control_id(control: &str) -> String {
    format!("name='{}'", control)
}

/// `v` repeated once per channel, comma separated.
fn per_channel(v: &str, channels: usize) -> String {
    vec![v; channels.max(1)].join(",")
}

impl MixerControl for AmixerControl {
    fn set_enum(&mut self, control: &str, option: &str) -> Result<(), MixerError> {
        let info = self.info(control)?;
        let idx = info
            .items
            .iter()
            .position(|i| i == option)
            .ok_or_else(|| MixerError::OptionNotFound {
                control: control.to_string(),
                value: option.to_string(),
            })?;
        self.write(control, per_channel(&idx.to_string(), info.channels))
    }

    fn set_switch(&mut self, control: &str, on: bool) -> Result<(), MixerError> {
        let info = self.info(control)?;
        self.write(control, per_channel(if on { "on" } else { "off" }, info.channels))
    }
}
