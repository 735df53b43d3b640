//! Typed results produced by the per-packet-type decoders.
//!
//! Decoders never touch session state; they turn one confirmed payload into a
//! [`Packet`] and the session decides what to do with it.

/// Value type stored in every output channel's ring buffer.
pub type Sample = i32;

/// One or more points of the primary (full-rate) channels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFrame {
    pub channels: usize,
    pub values: Vec<Sample>,
}

impl SampleFrame {
    pub fn new(channels: usize, values: Vec<Sample>) -> Self {
        Self { channels, values }
    }

    /// Number of points (rows) in the frame.
    pub fn points(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.values.len() / self.channels
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Sample]> {
        self.values.chunks_exact(self.channels.max(1))
    }
}

/// Aperiodic event (e.g. one heart beat) feeding a zero-order-held channel group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeatFrame {
    /// Hold group the values belong to.
    pub group: usize,
    /// Position of the event on the primary stream's sample clock.
    pub sample_index: u64,
    pub values: Vec<Sample>,
}

/// Bit-packed device status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFrame {
    pub errors: u16,
    pub warnings: u16,
    /// Device mode (low nibble of the mode byte).
    pub mode: u8,
    /// Seconds until the next cuff measurement cycle.
    pub countdown: u8,
}

/// Clock correlation packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFrame {
    /// Device tick captured when a host time request was answered.
    Now { request: u8, tick_us: i32 },
    /// Device tick of the first sample after sampling started.
    FirstSample { tick_us: i32 },
    /// Time request answer that also carries the latest USB start-of-frame.
    LatestUsbFrame {
        request: u8,
        tick_us: i32,
        frame_number: u16,
        frame_time_us: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionFrame {
    pub version: String,
}

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Samples(SampleFrame),
    Beat(BeatFrame),
    Status(StatusFrame),
    Time(TimeFrame),
    Version(VersionFrame),
}

// ----------------------------------------------------------------------------
// Field readers. Callers pass payloads whose length the scanner has already
// checked against the packet table, so offsets are always in range.
// ----------------------------------------------------------------------------

#[inline]
pub(crate) fn le_u16(p: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([p[at], p[at + 1]])
}

#[inline]
pub(crate) fn le_i16(p: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([p[at], p[at + 1]])
}

#[inline]
pub(crate) fn le_u32(p: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

#[inline]
pub(crate) fn le_i32(p: &[u8], at: usize) -> i32 {
    i32::from_le_bytes([p[at], p[at + 1], p[at + 2], p[at + 3]])
}

/// Big-endian signed 24-bit value truncated to its top 16 bits.
#[inline]
pub(crate) fn be_i24_as_i16(p: &[u8], at: usize) -> i16 {
    i16::from_be_bytes([p[at], p[at + 1]])
}

/// NUL/space padded ASCII field.
pub(crate) fn ascii_field(p: &[u8]) -> String {
    let end = p.iter().position(|&b| b == 0).unwrap_or(p.len());
    String::from_utf8_lossy(&p[..end]).trim().to_string()
}
