//! Frequency helpers.  All frequencies are plain `u64` hertz.

/// Lowest frequency any tuner may report, in Hz.
pub const ABS_RANGE_LOW: u64 = 60_000_000;
/// Highest frequency any tuner may report, in Hz.
pub const ABS_RANGE_HIGH: u64 = 140_000_000;

/// Presets are quantized to this grid (0.1 MHz).
pub const PRESET_GRID_HZ: u64 = 100_000;

/// Dial step used by `Step` commands.
pub const DIAL_STEP_HZ: u64 = 100_000;

/// Full scale of the signal strength reading (0 = no signal).
pub const SIGNAL_FULL_SCALE: u32 = 65_536;

/// Round to the nearest 0.1 MHz.  Halfway values round up.
pub fn canonicalize(hz: u64) -> u64 {
    ((hz + PRESET_GRID_HZ / 2) / PRESET_GRID_HZ) * PRESET_GRID_HZ
}

/// Clamp into `[low, high]`.  A degenerate range (low > high) yields `low`.
pub fn clamp_to_range(hz: u64, low: u64, high: u64) -> u64 {
    if low > high {
        return low;
    }
    hz.clamp(low, high)
}

/// Format the canonical frequency as MHz with one decimal, e.g. `"97.3"`.
///
/// Integer arithmetic only, so the text is stable for use as a store key.
pub fn format_mhz(hz: u64) -> String {
    let c = canonicalize(hz);
    format!("{}.{}", c / 1_000_000, (c % 1_000_000) / PRESET_GRID_HZ)
}

/// Parse a store key name back into a frequency.
///
/// Only the exact `format_mhz` form inside the absolute bounds is accepted,
/// so every frequency has one key and every key one frequency.
pub fn parse_mhz(text: &str) -> Option<u64> {
    let (whole, tenth) = text.split_once('.')?;
    if whole.is_empty()
        || tenth.len() != 1
        || !whole.bytes().chain(tenth.bytes()).all(|b| b.is_ascii_digit())
    {
        return None;
    }
    let hz = whole
        .parse::<u64>()
        .ok()?
        .checked_mul(1_000_000)?
        .checked_add(tenth.parse::<u64>().ok()? * PRESET_GRID_HZ)?;
    if !(ABS_RANGE_LOW..=ABS_RANGE_HIGH).contains(&hz) || format_mhz(hz) != text {
        return None;
    }
    Some(hz)
}
