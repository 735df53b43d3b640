//! Packet counter tracking and hold-fill state.
//!
//! [`SequenceTracker`] compares each received counter with the expected one
//! using modular arithmetic so a legitimate wrap (255 -> 0) is never mistaken
//! for loss. [`HoldState`] owns the last-known value of every slow channel and
//! the number of primary samples each slow group still has to mirror.

use log::warn;

use crate::packets::Sample;
use crate::protocol::{Protocol, SequenceWidth};

/// Result of observing one packet counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gap {
    /// First counter after a reset; adopted as the baseline.
    Synced,
    InOrder,
    /// This many packets went missing before the received one.
    Lost(u32),
    /// Jump too large to be loss (device restart or replay); counter adopted.
    Resync(u32),
}

#[derive(Debug, Clone)]
pub struct SequenceTracker {
    width: SequenceWidth,
    max_gap: u32,
    expected: Option<u16>,
}

impl SequenceTracker {
    /// `max_gap` defaults to half the counter range.
    pub fn new(width: SequenceWidth, max_gap: Option<u32>) -> Self {
        let half = (width.mask() + 1) / 2;
        Self {
            width,
            max_gap: max_gap.unwrap_or(half).min(width.mask()),
            expected: None,
        }
    }

    pub fn reset(&mut self) {
        self.expected = None;
    }

    /// Counter value the next packet should carry.
    pub fn expected(&self) -> Option<u16> {
        self.expected
    }

    pub fn observe(&mut self, received: u16) -> Gap {
        let mask = self.width.mask();
        let received = u32::from(received) & mask;
        let gap = match self.expected {
            None => Gap::Synced,
            Some(expected) => {
                let delta = received.wrapping_sub(u32::from(expected)) & mask;
                if delta == 0 {
                    Gap::InOrder
                } else if delta <= self.max_gap {
                    Gap::Lost(delta)
                } else {
                    warn!(
                        "sequence jump {} -> {} exceeds {}; resynchronizing without backfill",
                        expected, received, self.max_gap
                    );
                    Gap::Resync(delta)
                }
            }
        };
        self.expected = Some(((received + 1) & mask) as u16);
        gap
    }
}

/// Destination for channel samples (the session's ring buffers, or a test vector).
pub trait SampleSink {
    fn put(&mut self, channel: usize, value: Sample);
}

/// A set of slow channels updated together and zero-order held in between.
#[derive(Debug, Clone)]
pub struct HoldGroup {
    channels: Vec<usize>,
    last: Vec<Sample>,
    /// Primary samples not yet mirrored into this group.
    pending: u64,
    /// Samples written to this group since the reset.
    written: u64,
}

impl HoldGroup {
    pub fn new(channels: Vec<usize>, initial: Sample) -> Self {
        let last = vec![initial; channels.len()];
        Self {
            channels,
            last,
            pending: 0,
            written: 0,
        }
    }

    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn last_values(&self) -> &[Sample] {
        &self.last
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    fn repeat_last(&mut self, n: u64, sink: &mut impl SampleSink) {
        for _ in 0..n {
            for (&ch, &v) in self.channels.iter().zip(&self.last) {
                sink.put(ch, v);
            }
        }
        self.written += n;
    }

    /// New values arrived. Slots before `at` (on the primary sample clock) keep
    /// the previous value; without a timestamp every pending slot does.
    pub fn update(&mut self, at: Option<u64>, values: &[Sample], sink: &mut impl SampleSink) {
        let behind = match at {
            Some(t) => t.saturating_sub(self.written).min(self.pending),
            None => self.pending,
        };
        self.repeat_last(behind, sink);
        self.pending -= behind;
        for (slot, &v) in self.last.iter_mut().zip(values) {
            *slot = v;
        }
    }

    /// Write the held value for every pending slot.
    pub fn flush(&mut self, sink: &mut impl SampleSink) {
        let n = self.pending;
        self.repeat_last(n, sink);
        self.pending = 0;
    }
}

/// Hold groups of one session.
#[derive(Debug, Clone, Default)]
pub struct HoldState {
    groups: Vec<HoldGroup>,
}

impl HoldState {
    /// Held channels start at the protocol's out-of-range value until the
    /// first update arrives.
    pub fn for_protocol(protocol: &Protocol) -> Self {
        Self {
            groups: protocol
                .hold_groups()
                .into_iter()
                .map(|channels| HoldGroup::new(channels, protocol.out_of_range))
                .collect(),
        }
    }

    pub fn group(&self, index: usize) -> Option<&HoldGroup> {
        self.groups.get(index)
    }

    pub fn group_mut(&mut self, index: usize) -> Option<&mut HoldGroup> {
        self.groups.get_mut(index)
    }

    /// The primary stream produced `n` more samples.
    pub fn advance(&mut self, n: u64) {
        for g in &mut self.groups {
            g.pending += n;
        }
    }

    /// End of chunk: bring every group level with the primary stream.
    pub fn flush(&mut self, sink: &mut impl SampleSink) {
        for g in &mut self.groups {
            g.flush(sink);
        }
    }

    /// Flush, then write `value` for `n` slots into every held channel.
    /// Used for lost-packet sentinels and zero padding.
    pub fn fill(&mut self, n: u64, value: Sample, sink: &mut impl SampleSink) {
        for g in &mut self.groups {
            g.flush(sink);
            for _ in 0..n {
                for &ch in &g.channels {
                    sink.put(ch, value);
                }
            }
            g.written += n;
        }
    }
}
