//! Byte-stream framing and decoding engine for serial data acquisition devices.
//!
//! A device streams framed packets over a byte transport. This crate finds
//! those frames in arbitrarily chunked input, checks them, decodes them into
//! typed packets and turns the packets into sample-aligned channel data in
//! per-channel ring buffers.
//!
//! # Pipeline
//!
//! 1. [`FrameScanner`] accumulates bytes, locates frames by their anchor byte
//!    and confirms marker, packet type and CRC.
//! 2. The [`Protocol`] descriptor maps each packet type to a decoder.
//! 3. [`SequenceTracker`] spots lost packets; the session backfills them with
//!    the protocol's out-of-range sentinel.
//! 4. Slow values (beat results, status countdown) are zero-order held at the
//!    primary sample rate so every channel stays aligned.
//!
//! # Example
//! ```
//! use daq_stream::{Session, SessionSettings, TEENSY_ADC};
//!
//! let mut session = Session::new(&TEENSY_ADC, Box::new(Vec::new()));
//! assert!(session.start_sampling(SessionSettings::default()));
//! session.on_bytes(&[0x50, 0xA0, 0x44, 0x00, 0x01, 0x02, 0x03, 0x04]);
//!
//! let adc1 = session.buffer(0).unwrap();
//! assert_eq!(adc1.lock().unwrap().read(), Some(0x0201));
//! ```

pub mod alarms;
pub mod config;
pub mod crc;
pub mod device;
pub mod errors;
pub mod logging;
pub mod packets;
pub mod protocol;
pub mod ring_buffer;
pub mod scanner;
pub mod sequence;
pub mod session;
pub mod timer;

#[cfg(feature = "python")]
mod python;

pub use alarms::{AlarmChange, AlarmEvent, AlarmSource, AlarmTracker, Severity};
pub use config::{CrcPolicy, DeviceOptions, SessionSettings};
pub use crc::{crc8, crc8_range};
pub use device::{PhysicalDevice, ProxyId};
pub use errors::*;
pub use packets::{BeatFrame, Packet, Sample, SampleFrame, StatusFrame, TimeFrame, VersionFrame};
pub use protocol::{Protocol, NIBP, TEENSY_ADC};
pub use ring_buffer::{RingBuffer, SharedRingBuffer};
pub use scanner::{FrameScanner, ScanState, ScanStats, ScannedFrame};
pub use sequence::{Gap, SequenceTracker};
pub use session::{Session, SessionEvent, SessionState, SessionStats, TimeCorrelation, Transport};
