use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Tune to a frequency in Hz (clamped to the hardware range).
    Tune { hz: u64 },
    /// Move the dial one 100 kHz step.
    Step { up: bool },
    SeekUp,
    SeekDown,
    SetOutput { mode: OutputMode },
    StartScan,
    CancelScan,
    SetPreset { hz: u64, name: String },
    /// Store the current frequency under the current RDS station name.
    AddPresetFromRds,
    RemovePreset { hz: u64 },
    SelectPreset { hz: u64 },
    GetState,
}

impl Command {
    /// True for commands that express manual tuning intent.  These cancel a
    /// running autoscan before they are applied.
    pub fn is_manual_tuning(&self) -> bool {
        matches!(
            self,
            Command::Tune { .. }
                | Command::Step { .. }
                | Command::SeekUp
                | Command::SeekDown
                | Command::SelectPreset { .. }
        )
    }
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: RadioState,
    },
    State {
        data: RadioState,
    },
    Event {
        event: RadioEvent,
    },
    Rds {
        info: RdsInfo,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Typed change notifications published by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event")]
pub enum RadioEvent {
    FrequencyChanged { hz: u64 },
    RangeChanged { low: u64, high: u64 },
    OutputModeChanged { mode: OutputMode },
    ScanStateChanged { scanning: bool },
    PresetsChanged,
    TunerAvailability { ready: bool },
}

/// Where received audio goes.  Exactly one mode is active at a time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    #[default]
    Mute,
    /// Through the system mixer; the OS picks the sink.
    System,
    Speaker,
    Headphones,
    /// Analog bypass of the tuner ADC straight to the headphones.
    HeadphonesBypass,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Mute => "mute",
            OutputMode::System => "system",
            OutputMode::Speaker => "speaker",
            OutputMode::Headphones => "headphones",
            OutputMode::HeadphonesBypass => "headphones-bypass",
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mute" => Ok(OutputMode::Mute),
            "system" => Ok(OutputMode::System),
            "speaker" | "speakers" => Ok(OutputMode::Speaker),
            "headphones" => Ok(OutputMode::Headphones),
            "headphones-bypass" | "bypass" => Ok(OutputMode::HeadphonesBypass),
            other => anyhow::bail!("unknown output mode '{}'", other),
        }
    }
}

/// A named frequency.  `frequency` is always canonical (0.1 MHz grid).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Preset {
    pub frequency: u64,
    pub name: String,
}

/// Decoded RDS strings for the current frequency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RdsInfo {
    /// Programme identification code.
    pub pi: Option<String>,
    /// Programme service (station) name.
    pub ps: Option<String>,
    /// Radio text.
    pub rt: Option<String>,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RadioState {
    /// Monotonic revision counter: incremented on every state change.
    #[serde(default)]
    pub rev: u64,
    /// True once access was granted and the tuner device opened.
    pub tuner_ready: bool,
    /// Current frequency in Hz, `None` while the tuner is unavailable.
    pub frequency: Option<u64>,
    pub range_low: u64,
    pub range_high: u64,
    /// Last signal reading, 0..=65536.
    pub signal: u32,
    pub output: OutputMode,
    pub scanning: bool,
    /// Ascending by frequency.
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub rds: RdsInfo,
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

/// Largest frame body a peer may send.  Anything longer is treated as a
/// broken or hostile stream.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// What sits at the front of a receive buffer.
#[derive(Debug)]
pub enum Frame {
    /// The length header or the body is not complete yet.
    Incomplete,
    /// One message and the number of bytes it took.
    Message(Message, usize),
    /// A complete frame whose body is not a message.  Skipping `consumed`
    /// bytes resynchronizes on the next frame.
    Invalid { consumed: usize, reason: String },
    /// The header announces a body longer than `MAX_FRAME_LEN`.
    Oversized(usize),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode_frame(data: &[u8]) -> Frame {
        if data.len() < 4 {
            return Frame::Incomplete;
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Frame::Oversized(len);
        }
        if data.len() < 4 + len {
            return Frame::Incomplete;
        }
        match serde_json::from_slice(&data[4..4 + len]) {
            Ok(msg) => Frame::Message(msg, 4 + len),
            Err(e) => Frame::Invalid {
                consumed: 4 + len,
                reason: e.to_string(),
            },
        }
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        match Self::decode_frame(data) {
            Frame::Message(msg, used) => Ok((msg, used)),
            Frame::Incomplete => anyhow::bail!("Insufficient data for message"),
            Frame::Invalid { reason, .. } => anyhow::bail!("Invalid message: {}", reason),
            Frame::Oversized(len) => anyhow::bail!("Frame of {} bytes is too long", len),
        }
    }
}
