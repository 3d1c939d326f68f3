//! Error types for the radio engine.
//!
//! Each hardware-facing component has its own error enum.  None of them is
//! fatal: callers log and degrade the affected feature.

/// Tuner device failures.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No device handle is open (access not granted yet, or closed).
    #[error("tuner device not open")]
    NotOpen,

    /// The node opened but is not a radio tuner.
    #[error("not a radio tuner: {0}")]
    WrongType(String),

    /// An ioctl (or equivalent driver call) failed.
    #[error("tuner ioctl {op} failed: {reason}")]
    Ioctl { op: &'static str, reason: String },

    /// The device node could not be opened.
    #[error("cannot open tuner device: {0}")]
    Io(#[from] std::io::Error),
}

/// Mixer control failures.
#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    /// The named control does not exist on this mixer.
    #[error("mixer control not found: {0}")]
    ControlNotFound(String),

    /// The control exists but has no option with this name.
    #[error("mixer control '{control}' has no option '{value}'")]
    OptionNotFound { control: String, value: String },

    #[error("mixer write failed: {0}")]
    WriteFailure(String),
}

/// Sound server failures.
#[derive(Debug, thiserror::Error)]
pub enum AudioBackendError {
    #[error("audio backend connect failed: {0}")]
    ConnectFailure(String),

    #[error("audio stream failed: {0}")]
    StreamFailure(String),
}

/// Device-access arbitration failures.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The arbitration service answered with a non-zero result code.
    #[error("access to tuner denied (code {0})")]
    Denied(i32),

    /// The service could not be reached or answered garbage.
    #[error("access service transport error: {0}")]
    Transport(String),
}

/// Remote configuration store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store write failed: {0}")]
    WriteFailure(String),

    #[error("store unreachable: {0}")]
    Unreachable(String),
}
