use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub tuner: TunerConfig,
    #[serde(default)]
    pub access: AccessConfig,
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub presets: PresetsConfig,
    #[serde(default)]
    pub rds: RdsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunerConfig {
    /// Device node used when access is granted statically.
    #[serde(default = "default_tuner_device")]
    pub fallback_device: PathBuf,
}

/// How permission to open the tuner is obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Ask the FM receiver enabler service on the system bus.
    Dbus,
    /// Always grant `tuner.fallback_device`.
    Static,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessConfig {
    #[serde(default = "default_access_mode")]
    pub mode: AccessMode,
    #[serde(default = "default_access_service")]
    pub service: String,
    #[serde(default = "default_access_object_path")]
    pub object_path: String,
    #[serde(default = "default_access_service")]
    pub interface: String,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

/// One mixer write.  `value` is an option name for enumerated controls and
/// `"on"`/`"off"` for switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MixerSetting {
    Enum { control: String, value: String },
    Switch { control: String, on: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerConfig {
    #[serde(default = "default_mixer_card")]
    pub card: String,
    /// Applied in order when the analog bypass route is enabled.
    #[serde(default = "default_bypass_enable")]
    pub bypass_enable: Vec<MixerSetting>,
    /// Applied in order when the analog bypass route is disabled.
    #[serde(default = "default_bypass_disable")]
    pub bypass_disable: Vec<MixerSetting>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Client name presented to the sound server.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default = "default_rate")]
    pub rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Captured audio is forwarded once at least this many bytes are pending.
    #[serde(default = "default_min_chunk_bytes")]
    pub min_chunk_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_increment_hz")]
    pub increment_hz: u64,
    /// Delay between a seek and the next scan step.  0 runs the next step as
    /// soon as the event loop is idle.
    #[serde(default)]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetsConfig {
    /// Name of the preset set; becomes the last directory of the namespace.
    #[serde(default = "default_set_name")]
    pub set_name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// File backing the key/value namespace.
    #[serde(default = "default_store_file")]
    pub store_file: PathBuf,
    /// Reload period used when the store file cannot be watched.
    #[serde(default = "default_store_poll_secs")]
    pub poll_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdsConfig {
    /// Directory holding the `rds_pi`, `rds_ps` and `rds_rt` attributes.
    #[serde(default = "default_rds_sysfs_dir")]
    pub sysfs_dir: PathBuf,
    #[serde(default = "default_rds_poll_secs")]
    pub poll_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            fallback_device: default_tuner_device(),
        }
    }
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            mode: default_access_mode(),
            service: default_access_service(),
            object_path: default_access_object_path(),
            interface: default_access_service(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            card: default_mixer_card(),
            bypass_enable: default_bypass_enable(),
            bypass_disable: default_bypass_disable(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            rate: default_rate(),
            channels: default_channels(),
            min_chunk_bytes: default_min_chunk_bytes(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            increment_hz: default_increment_hz(),
            settle_ms: 0,
        }
    }
}

impl Default for PresetsConfig {
    fn default() -> Self {
        Self {
            set_name: default_set_name(),
            namespace: default_namespace(),
            store_file: default_store_file(),
            poll_secs: default_store_poll_secs(),
        }
    }
}

impl Default for RdsConfig {
    fn default() -> Self {
        Self {
            sysfs_dir: default_rds_sysfs_dir(),
            poll_secs: default_rds_poll_secs(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("state.json")
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_tuner_device() -> PathBuf {
    PathBuf::from("/dev/radio0")
}

fn default_access_mode() -> AccessMode {
    AccessMode::Dbus
}

fn default_access_service() -> String {
    "de.pycage.FMRXEnabler".to_string()
}

fn default_access_object_path() -> String {
    "/de/pycage/FMRXEnabler".to_string()
}

fn default_keepalive_secs() -> u64 {
    20
}

fn default_mixer_card() -> String {
    "hw:0".to_string()
}

fn switch(control: &str, on: bool) -> MixerSetting {
    MixerSetting::Switch {
        control: control.to_string(),
        on,
    }
}

fn input_select(value: &str) -> MixerSetting {
    MixerSetting::Enum {
        control: "Input Select".to_string(),
        value: value.to_string(),
    }
}

fn default_bypass_enable() -> Vec<MixerSetting> {
    vec![
        input_select("ADC"),
        switch("PGA Capture Switch", true),
        switch("Left PGA Mixer Line2L Switch", true),
        switch("Right PGA Mixer Line2R Switch", true),
    ]
}

fn default_bypass_disable() -> Vec<MixerSetting> {
    vec![
        input_select("Digital Mic"),
        switch("PGA Capture Switch", false),
        switch("Left PGA Mixer Line2L Switch", false),
        switch("Right PGA Mixer Line2R Switch", false),
    ]
}

fn default_app_name() -> String {
    // Sound policy on some handsets keys routing on this exact name.
    "FM Radio".to_string()
}

fn default_rate() -> u32 {
    48_000
}

fn default_channels() -> u8 {
    2
}

fn default_min_chunk_bytes() -> usize {
    4096 * 4
}

fn default_increment_hz() -> u64 {
    100_000
}

fn default_set_name() -> String {
    "default".to_string()
}

fn default_namespace() -> String {
    "/apps/fmradio/presets".to_string()
}

fn default_store_file() -> PathBuf {
    platform::config_dir().join("presets.toml")
}

fn default_store_poll_secs() -> u64 {
    5
}

fn default_rds_sysfs_dir() -> PathBuf {
    PathBuf::from("/sys/class/i2c-adapter/i2c-3/3-0022")
}

fn default_rds_poll_secs() -> u64 {
    1
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from an explicit path, writing defaults there if it is missing.
    pub fn load_from(config_path: &std::path::Path) -> anyhow::Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> anyhow::Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Directory in the config namespace holding this preset set.
    pub fn preset_dir(&self) -> String {
        format!(
            "{}/{}",
            self.presets.namespace.trim_end_matches('/'),
            self.presets.set_name
        )
    }
}
