//! V4L2 radio tuner backend (Linux).
//!
//! Only the handful of ioctls the engine needs are declared here.  Struct
//! layouts mirror `linux/videodev2.h`.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::error::DeviceError;
use crate::tuner::{TunerBackend, TunerIo, TunerStatus};

const V4L2_TUNER_RADIO: u32 = 1;
const V4L2_TUNER_CAP_LOW: u32 = 0x0001;
const V4L2_TUNER_SUB_RDS: u32 = 0x0010;
const V4L2_CID_AUDIO_MUTE: u32 = 0x0098_0909;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
pub struct V4l2Tuner {
    index: u32,
    name: [u8; 32],
    kind: u32,
    capability: u32,
    rangelow: u32,
    rangehigh: u32,
    rxsubchans: u32,
    audmode: u32,
    signal: i32,
    afc: i32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
pub struct V4l2Frequency {
    tuner: u32,
    kind: u32,
    frequency: u32,
    reserved: [u32; 8],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
pub struct V4l2Control {
    id: u32,
    value: i32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
pub struct V4l2HwFreqSeek {
    tuner: u32,
    kind: u32,
    seek_upward: u32,
    wrap_around: u32,
    spacing: u32,
    rangelow: u32,
    rangehigh: u32,
    reserved: [u32; 5],
}

nix::ioctl_readwrite!(vidioc_s_ctrl, b'V', 28, V4l2Control);
nix::ioctl_readwrite!(vidioc_g_tuner, b'V', 29, V4l2Tuner);
nix::ioctl_readwrite!(vidioc_g_frequency, b'V', 56, V4l2Frequency);
nix::ioctl_write_ptr!(vidioc_s_frequency, b'V', 57, V4l2Frequency);
nix::ioctl_write_ptr!(vidioc_s_hw_freq_seek, b'V', 82, V4l2HwFreqSeek);

fn ioctl_err(op: &'static str, e: nix::errno::Errno) -> DeviceError {
    DeviceError::Ioctl {
        op,
        reason: e.desc().to_string(),
    }
}

/// Opens `/dev/radioN` style nodes.
pub struct V4l2Backend;

impl TunerBackend for V4l2Backend {
    fn open(&self, path: &Path) -> Result<Box<dyn TunerIo>, DeviceError> {
        let file = std::fs::OpenOptions::new().read(true).open(path)?;
        Ok(Box::new(RadioNode {
            file,
            path: path.to_path_buf(),
        }))
    }
}

/// Tuner index 0 of an open V4L2 radio node.
pub struct RadioNode {
    file: File,
    path: PathBuf,
}

impl TunerIo for RadioNode {
    fn status(&mut self) -> Result<TunerStatus, DeviceError> {
        let mut t = V4l2Tuner::default();
        // SAFETY: the fd is open for the lifetime of `self.file` and `t`
        // matches the kernel's struct v4l2_tuner layout.
        unsafe { vidioc_g_tuner(self.file.as_raw_fd(), &mut t) }
            .map_err(|e| ioctl_err("VIDIOC_G_TUNER", e))?;
        Ok(TunerStatus {
            radio: t.kind == V4L2_TUNER_RADIO,
            kind: t.kind,
            precise: t.capability & V4L2_TUNER_CAP_LOW != 0,
            range_low: t.rangelow,
            range_high: t.rangehigh,
            signal: t.signal.clamp(0, 65_535) as u32,
            rds: t.rxsubchans & V4L2_TUNER_SUB_RDS != 0,
        })
    }

    fn set_mute(&mut self, mute: bool) -> Result<(), DeviceError> {
        let mut ctrl = V4l2Control {
            id: V4L2_CID_AUDIO_MUTE,
            value: i32::from(mute),
        };
        // SAFETY: see `status`.
        unsafe { vidioc_s_ctrl(self.file.as_raw_fd(), &mut ctrl) }
            .map_err(|e| ioctl_err("VIDIOC_S_CTRL", e))?;
        Ok(())
    }

    fn frequency_raw(&mut self) -> Result<u32, DeviceError> {
        let mut f = V4l2Frequency::default();
        // SAFETY: see `status`.
        unsafe { vidioc_g_frequency(self.file.as_raw_fd(), &mut f) }
            .map_err(|e| ioctl_err("VIDIOC_G_FREQUENCY", e))?;
        Ok(f.frequency)
    }

    fn set_frequency_raw(&mut self, raw: u32) -> Result<(), DeviceError> {
        let f = V4l2Frequency {
            tuner: 0,
            kind: V4L2_TUNER_RADIO,
            frequency: raw,
            ..Default::default()
        };
        // SAFETY: see `status`.
        unsafe { vidioc_s_frequency(self.file.as_raw_fd(), &f) }
            .map_err(|e| ioctl_err("VIDIOC_S_FREQUENCY", e))?;
        Ok(())
    }

    fn seek(&mut self, upward: bool) -> Result<(), DeviceError> {
        let req = V4l2HwFreqSeek {
            tuner: 0,
            kind: V4L2_TUNER_RADIO,
            seek_upward: u32::from(upward),
            wrap_around: 0,
            ..Default::default()
        };
        // SAFETY: see `status`.
        unsafe { vidioc_s_hw_freq_seek(self.file.as_raw_fd(), &req) }
            .map_err(|e| ioctl_err("VIDIOC_S_HW_FREQ_SEEK", e))?;
        tracing::trace!(
            "V4L2: seek {} issued on {}",
            if upward { "up" } else { "down" },
            self.path.display()
        );
        Ok(())
    }
}
