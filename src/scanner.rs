//! Resynchronizing frame scanner.
//!
//! Bytes from the transport are appended to an accumulation buffer. The scanner
//! searches that buffer for the protocol's anchor byte (the least ambiguous
//! byte of the marker), confirms every marker byte at its fixed offset from the
//! anchor, looks the packet type up, waits until the whole frame has arrived,
//! checks the CRC and hands the payload to the type's decoder.
//!
//! Anything that fails confirmation is skipped one byte past its anchor, so a
//! bogus anchor is never found twice. Unconsumed bytes (a frame still in
//! flight) stay in the buffer and the next chunk is appended to them.

use log::debug;

use crate::config::CrcPolicy;
use crate::crc::crc8;
use crate::packets::Packet;
use crate::protocol::Protocol;

/// Where the scanner stopped on its last pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// No anchor in the buffer.
    NoHeaderBytes,
    /// Anchor found but the rest of the marker has not arrived.
    HaveAnchor,
    /// Marker confirmed, waiting for the type byte and counter.
    ConfirmingHeader,
    /// Header complete, waiting for payload and CRC of this packet type.
    HaveFullPacket(u8),
}

/// Statistics about the scanner's operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Frames handed to decoders.
    pub frames: u64,
    /// Frames whose CRC did not match (used or dropped depending on policy).
    pub crc_errors: u64,
    /// Confirmed markers followed by an unknown packet type.
    pub unknown_types: u64,
    /// Anchor bytes whose surrounding marker did not match.
    pub false_anchors: u64,
    /// Bytes skipped while looking for frames.
    pub bytes_discarded: u64,
}

/// One frame located and decoded by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFrame {
    pub type_byte: u8,
    pub sequence: u16,
    pub crc_ok: bool,
    pub packet: Packet,
}

pub struct FrameScanner {
    protocol: &'static Protocol,
    crc_policy: CrcPolicy,
    buffer: Vec<u8>,
    state: ScanState,
    stats: ScanStats,
}

impl FrameScanner {
    pub fn new(protocol: &'static Protocol, crc_policy: CrcPolicy) -> Self {
        Self {
            protocol,
            crc_policy,
            buffer: Vec::with_capacity(256),
            state: ScanState::NoHeaderBytes,
            stats: ScanStats::default(),
        }
    }

    pub fn protocol(&self) -> &'static Protocol {
        self.protocol
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    /// Bytes retained for the next chunk.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Drop buffered bytes and statistics.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ScanState::NoHeaderBytes;
        self.stats = ScanStats::default();
    }

    /// Append a chunk and return every frame it completes, in stream order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<ScannedFrame> {
        let mut frames = Vec::new();
        self.push_with(bytes, |frame| frames.push(frame));
        frames
    }

    /// Append a chunk and call `on_frame` for each completed frame.
    pub fn push_with(&mut self, bytes: &[u8], mut on_frame: impl FnMut(ScannedFrame)) {
        self.buffer.extend_from_slice(bytes);

        let p = self.protocol;
        let anchor = p.anchor();
        let k = p.anchor_offset;
        let marker_len = p.marker.len();
        let len = self.buffer.len();
        let mut pos = 0usize;

        loop {
            self.state = ScanState::NoHeaderBytes;

            let search_from = pos + k;
            let found = self
                .buffer
                .get(search_from..)
                .and_then(|tail| tail.iter().position(|&b| b == anchor));
            let Some(rel) = found else {
                // Keep the bytes that could still precede an anchor in the next chunk.
                let keep_from = len.saturating_sub(k).max(pos);
                self.stats.bytes_discarded += (keep_from - pos) as u64;
                pos = keep_from;
                break;
            };

            let start = search_from + rel - k;
            self.stats.bytes_discarded += (start - pos) as u64;
            pos = start;
            self.state = ScanState::HaveAnchor;

            if start + marker_len > len {
                break;
            }
            if &self.buffer[start..start + marker_len] != p.marker {
                self.stats.false_anchors += 1;
                self.skip_past_anchor(&mut pos);
                continue;
            }

            self.state = ScanState::ConfirmingHeader;
            if start + p.header_len() > len {
                break;
            }
            let type_byte = self.buffer[start + marker_len];
            let Some(spec) = p.packet(type_byte) else {
                debug!("unknown packet type {:#04X} at offset {}", type_byte, start);
                self.stats.unknown_types += 1;
                self.skip_past_anchor(&mut pos);
                continue;
            };

            self.state = ScanState::HaveFullPacket(type_byte);
            let frame_len = p.frame_len(spec);
            if start + frame_len > len {
                break;
            }

            let sequence = p.sequence.read(&self.buffer[start + marker_len + 1..]);
            let payload_start = start + p.header_len();
            let payload_end = payload_start + spec.payload_len;
            let payload = &self.buffer[payload_start..payload_end];

            let crc_ok = if p.has_crc {
                let received = self.buffer[payload_end];
                let calculated = crc8(payload);
                if received != calculated {
                    self.stats.crc_errors += 1;
                    debug!(
                        "CRC mismatch in {} packet seq={} (received: {:#04X}, calculated: {:#04X})",
                        spec.name, sequence, received, calculated
                    );
                }
                received == calculated
            } else {
                true
            };

            if !crc_ok && self.crc_policy == CrcPolicy::Strict {
                self.skip_past_anchor(&mut pos);
                continue;
            }

            let packet = (spec.decode)(payload);
            self.stats.frames += 1;
            pos = start + frame_len;
            on_frame(ScannedFrame {
                type_byte,
                sequence,
                crc_ok,
                packet,
            });
        }

        self.buffer.drain(..pos);
    }

    /// Resume the search one byte past the current candidate's anchor.
    fn skip_past_anchor(&mut self, pos: &mut usize) {
        *pos += 1;
        self.stats.bytes_discarded += 1;
    }
}
