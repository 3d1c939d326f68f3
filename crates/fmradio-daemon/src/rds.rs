//! RDS telemetry.
//!
//! The driver exposes the decoded programme identification, service name and
//! radio text as sysfs attributes.  They are polled once a second; the values
//! change slowly and there is no change notification to subscribe to.

use std::path::PathBuf;

use fmradio_proto::protocol::RdsInfo;
use tracing::trace;

pub trait RdsSource: Send {
    fn read(&mut self) -> RdsInfo;
}

pub struct SysfsRds {
    dir: PathBuf,
}

impl SysfsRds {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn attr(&self, name: &str) -> Option<String> {
        match std::fs::read(self.dir.join(name)) {
            Ok(raw) => decode(&raw),
            Err(e) => {
                trace!("RDS: {} unreadable: {}", name, e);
                None
            }
        }
    }
}

impl RdsSource for SysfsRds {
    fn read(&mut self) -> RdsInfo {
        RdsInfo {
            pi: self.attr("rds_pi"),
            ps: self.attr("rds_ps"),
            rt: self.attr("rds_rt"),
        }
    }
}

/// Turn a raw attribute into display text: control characters dropped,
/// Latin-1 bytes mapped to their code points, whitespace trimmed.
pub fn decode(raw: &[u8]) -> Option<String> {
    let text: String = raw
        .iter()
        .filter(|&&b| b >= 0x20 && b != 0x7f)
        .map(|&b| char::from(b))
        .collect();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
