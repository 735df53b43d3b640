//! Per-device protocol descriptors.
//!
//! The scanner and session are generic; everything device specific lives in a
//! static [`Protocol`]: marker bytes and anchor position, sequence counter
//! width, CRC presence, the packet table (type byte, payload length, decoder),
//! the output channel list and the command builders.
//!
//! Frame layout shared by every protocol:
//!
//! ```text
//! [marker (1-2)] [type (1)] [sequence (1-2, LE)] [payload (N)] [crc8 (0-1)]
//! ```

use crate::config::DeviceOptions;
use crate::crc::append_crc8;
use crate::packets::{
    ascii_field, be_i24_as_i16, le_i16, le_i32, le_u16, le_u32, BeatFrame, Packet, Sample,
    SampleFrame, StatusFrame, TimeFrame, VersionFrame,
};

/// Decodes one payload of a known packet type.
pub type Decoder = fn(&[u8]) -> Packet;

#[derive(Debug, Clone, Copy)]
pub struct PacketSpec {
    pub type_byte: u8,
    pub name: &'static str,
    pub payload_len: usize,
    pub decode: Decoder,
}

/// Width of the wrapping packet counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceWidth {
    U8,
    U16,
}

impl SequenceWidth {
    /// Bytes the counter occupies on the wire.
    pub fn len(self) -> usize {
        match self {
            SequenceWidth::U8 => 1,
            SequenceWidth::U16 => 2,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            SequenceWidth::U8 => 0xFF,
            SequenceWidth::U16 => 0xFFFF,
        }
    }

    /// Read the counter from the start of `bytes` (little-endian).
    pub fn read(self, bytes: &[u8]) -> u16 {
        match self {
            SequenceWidth::U8 => bytes[0] as u16,
            SequenceWidth::U16 => u16::from_le_bytes([bytes[0], bytes[1]]),
        }
    }

    pub fn encode(self, value: u16, out: &mut Vec<u8>) {
        match self {
            SequenceWidth::U8 => out.push(value as u8),
            SequenceWidth::U16 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Written straight from sample packets.
    Primary,
    /// Zero-order held from a slower packet stream.
    Held { group: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub name: &'static str,
    pub unit: &'static str,
    pub kind: ChannelKind,
}

/// Outgoing command builders.
#[derive(Debug, Clone, Copy)]
pub struct Commands {
    pub start: fn(&DeviceOptions) -> Vec<u8>,
    pub stop: fn() -> Vec<u8>,
    /// Heartbeat; receives the time request number to embed.
    pub keep_alive: Option<fn(u8) -> Vec<u8>>,
}

/// Human readable name of one status bit.
#[derive(Debug, Clone, Copy)]
pub struct AlarmName {
    pub bit: u8,
    pub name: &'static str,
}

#[derive(Debug)]
pub struct Protocol {
    pub name: &'static str,
    pub marker: &'static [u8],
    /// Index in `marker` of the byte the scanner searches for.
    pub anchor_offset: usize,
    pub sequence: SequenceWidth,
    pub has_crc: bool,
    pub packets: &'static [PacketSpec],
    pub channels: &'static [ChannelSpec],
    /// Hold group fed by the status countdown, if any.
    pub status_group: Option<usize>,
    /// Written for samples lost in transit.
    pub out_of_range: Sample,
    /// Error bits that stop sampling.
    pub fatal_errors: u16,
    /// Warning bits promoted to critical.
    pub promoted_warnings: u16,
    pub error_names: &'static [AlarmName],
    pub warning_names: &'static [AlarmName],
    pub commands: Commands,
}

impl Protocol {
    /// Look up a built-in protocol by name.
    pub fn by_name(name: &str) -> Option<&'static Protocol> {
        match name.to_ascii_lowercase().as_str() {
            "teensy" | "teensy-adc" => Some(&TEENSY_ADC),
            "nibp" => Some(&NIBP),
            _ => None,
        }
    }

    pub fn anchor(&self) -> u8 {
        self.marker[self.anchor_offset]
    }

    /// Marker, type and sequence bytes.
    pub fn header_len(&self) -> usize {
        self.marker.len() + 1 + self.sequence.len()
    }

    pub fn frame_len(&self, spec: &PacketSpec) -> usize {
        self.header_len() + spec.payload_len + usize::from(self.has_crc)
    }

    pub fn packet(&self, type_byte: u8) -> Option<&PacketSpec> {
        self.packets.iter().find(|p| p.type_byte == type_byte)
    }

    /// Indices of the primary channels, in sample-frame column order.
    pub fn primary_channels(&self) -> Vec<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ChannelKind::Primary)
            .map(|(i, _)| i)
            .collect()
    }

    /// Channel indices of each hold group, in value order.
    pub fn hold_groups(&self) -> Vec<Vec<usize>> {
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (i, c) in self.channels.iter().enumerate() {
            if let ChannelKind::Held { group } = c.kind {
                if groups.len() <= group {
                    groups.resize(group + 1, Vec::new());
                }
                groups[group].push(i);
            }
        }
        groups
    }

    pub fn channel_index(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    /// Serialize one frame; used by device simulators and tests.
    pub fn encode_frame(&self, type_byte: u8, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len() + payload.len() + 1);
        out.extend_from_slice(self.marker);
        out.push(type_byte);
        self.sequence.encode(sequence, &mut out);
        let payload_start = out.len();
        out.extend_from_slice(payload);
        if self.has_crc {
            append_crc8(&mut out, payload_start);
        }
        out
    }
}

// ============================================================================
// Teensy 4.1 ADC firmware
// ============================================================================
//
// Header is "P\xA0" followed by the packet type. 0xA0 is far rarer in sample
// data than 'P', so it is the anchor. The packet counter is shared by every
// packet type and restarts at zero when sampling starts. No checksum.

const TEENSY_CHANNELS: usize = 2;
const TEENSY_MEDIUM_POINTS: usize = 10;

pub const TEENSY_DATA: u8 = b'D';
pub const TEENSY_MEDIUM_DATA: u8 = b'M';
pub const TEENSY_TIME_NOW: u8 = b'N';
pub const TEENSY_FIRST_SAMPLE: u8 = b'F';
pub const TEENSY_LATEST_USB_FRAME: u8 = b'L';

fn decode_teensy_points(p: &[u8]) -> Packet {
    let values = p
        .chunks_exact(2)
        .map(|pair| Sample::from(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();
    Packet::Samples(SampleFrame::new(TEENSY_CHANNELS, values))
}

fn decode_teensy_now(p: &[u8]) -> Packet {
    Packet::Time(TimeFrame::Now {
        request: p[0],
        tick_us: le_i32(p, 1),
    })
}

fn decode_teensy_first_sample(p: &[u8]) -> Packet {
    Packet::Time(TimeFrame::FirstSample {
        tick_us: le_i32(p, 0),
    })
}

fn decode_teensy_latest_usb_frame(p: &[u8]) -> Packet {
    Packet::Time(TimeFrame::LatestUsbFrame {
        request: p[0],
        tick_us: le_i32(p, 1),
        frame_number: le_u16(p, 5),
        frame_time_us: le_i32(p, 7),
    })
}

fn teensy_start(options: &DeviceOptions) -> Vec<u8> {
    let points = if options.large_packets {
        TEENSY_MEDIUM_POINTS as u8
    } else {
        1
    };
    vec![b'b', points]
}

fn teensy_stop() -> Vec<u8> {
    vec![b's']
}

fn teensy_time_request(request: u8) -> Vec<u8> {
    vec![b'n', request]
}

static TEENSY_PACKETS: [PacketSpec; 5] = [
    PacketSpec {
        type_byte: TEENSY_DATA,
        name: "data",
        payload_len: 2 * TEENSY_CHANNELS,
        decode: decode_teensy_points,
    },
    PacketSpec {
        type_byte: TEENSY_MEDIUM_DATA,
        name: "medium data",
        payload_len: 2 * TEENSY_CHANNELS * TEENSY_MEDIUM_POINTS,
        decode: decode_teensy_points,
    },
    PacketSpec {
        type_byte: TEENSY_TIME_NOW,
        name: "time now",
        payload_len: 5,
        decode: decode_teensy_now,
    },
    PacketSpec {
        type_byte: TEENSY_FIRST_SAMPLE,
        name: "first sample time",
        payload_len: 4,
        decode: decode_teensy_first_sample,
    },
    PacketSpec {
        type_byte: TEENSY_LATEST_USB_FRAME,
        name: "latest usb frame time",
        payload_len: 11,
        decode: decode_teensy_latest_usb_frame,
    },
];

static TEENSY_CHANNEL_SPECS: [ChannelSpec; 2] = [
    ChannelSpec {
        name: "ADC1",
        unit: "counts",
        kind: ChannelKind::Primary,
    },
    ChannelSpec {
        name: "ADC2",
        unit: "counts",
        kind: ChannelKind::Primary,
    },
];

pub static TEENSY_ADC: Protocol = Protocol {
    name: "teensy-adc",
    marker: b"P\xA0",
    anchor_offset: 1,
    sequence: SequenceWidth::U8,
    has_crc: false,
    packets: &TEENSY_PACKETS,
    channels: &TEENSY_CHANNEL_SPECS,
    status_group: None,
    out_of_range: 0x8000,
    fatal_errors: 0,
    promoted_warnings: 0,
    error_names: &[],
    warning_names: &[],
    commands: Commands {
        start: teensy_start,
        stop: teensy_stop,
        keep_alive: Some(teensy_time_request),
    },
};

// ============================================================================
// NIBP (finger cuff) monitor
// ============================================================================
//
// STX 0x02 then 0xD4; the 0xD4 byte is the anchor. 16-bit counter, CRC-8 over
// the payload. Waveform samples are 24-bit big-endian, truncated to 16 bits.
// Beat packets carry the waveform sample index they belong to.

pub const NIBP_WAVEFORM: u8 = b'W';
pub const NIBP_BEAT: u8 = b'B';
pub const NIBP_STATUS: u8 = b'S';
pub const NIBP_VERSION: u8 = b'V';

const NIBP_CMD_START: u8 = 0x01;
const NIBP_CMD_STOP: u8 = 0x02;
const NIBP_CMD_POLL: u8 = 0x03;

pub const NIBP_ERR_CUFF_LEAK: u16 = 0x0001;
pub const NIBP_ERR_OVERPRESSURE: u16 = 0x0002;
pub const NIBP_ERR_SENSOR: u16 = 0x0004;
pub const NIBP_ERR_INTERNAL: u16 = 0x0008;

pub const NIBP_WARN_WEAK_PULSE: u16 = 0x0001;
pub const NIBP_WARN_MOTION: u16 = 0x0002;
pub const NIBP_WARN_LOW_BATTERY: u16 = 0x0004;
pub const NIBP_WARN_CUFF_LOOSE: u16 = 0x0008;

fn decode_nibp_waveform(p: &[u8]) -> Packet {
    Packet::Samples(SampleFrame::new(
        2,
        vec![
            Sample::from(be_i24_as_i16(p, 0)),
            Sample::from(be_i24_as_i16(p, 3)),
        ],
    ))
}

fn decode_nibp_beat(p: &[u8]) -> Packet {
    Packet::Beat(BeatFrame {
        group: 0,
        sample_index: u64::from(le_u32(p, 0)),
        values: (0..4).map(|i| Sample::from(le_u16(p, 4 + 2 * i))).collect(),
    })
}

fn decode_nibp_status(p: &[u8]) -> Packet {
    Packet::Status(StatusFrame {
        errors: le_u16(p, 0),
        warnings: le_u16(p, 2),
        mode: p[4] & 0x0F,
        countdown: p[5],
    })
}

fn decode_nibp_version(p: &[u8]) -> Packet {
    Packet::Version(VersionFrame {
        version: ascii_field(p),
    })
}

fn nibp_command(cmd: u8, args: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + args.len());
    out.extend_from_slice(NIBP.marker);
    out.push(cmd);
    out.extend_from_slice(args);
    append_crc8(&mut out, NIBP.marker.len());
    out
}

fn nibp_start(options: &DeviceOptions) -> Vec<u8> {
    let flags = u8::from(options.test_mode) | (u8::from(options.calibrate) << 1) | (options.gain << 4);
    nibp_command(NIBP_CMD_START, &[options.cuff_mode, flags])
}

fn nibp_stop() -> Vec<u8> {
    nibp_command(NIBP_CMD_STOP, &[])
}

fn nibp_poll(_request: u8) -> Vec<u8> {
    nibp_command(NIBP_CMD_POLL, &[])
}

static NIBP_PACKETS: [PacketSpec; 4] = [
    PacketSpec {
        type_byte: NIBP_WAVEFORM,
        name: "waveform",
        payload_len: 6,
        decode: decode_nibp_waveform,
    },
    PacketSpec {
        type_byte: NIBP_BEAT,
        name: "beat",
        payload_len: 12,
        decode: decode_nibp_beat,
    },
    PacketSpec {
        type_byte: NIBP_STATUS,
        name: "status",
        payload_len: 6,
        decode: decode_nibp_status,
    },
    PacketSpec {
        type_byte: NIBP_VERSION,
        name: "version",
        payload_len: 16,
        decode: decode_nibp_version,
    },
];

static NIBP_CHANNEL_SPECS: [ChannelSpec; 7] = [
    ChannelSpec {
        name: "Pressure",
        unit: "mmHg",
        kind: ChannelKind::Primary,
    },
    ChannelSpec {
        name: "Pleth",
        unit: "counts",
        kind: ChannelKind::Primary,
    },
    ChannelSpec {
        name: "Systolic",
        unit: "mmHg",
        kind: ChannelKind::Held { group: 0 },
    },
    ChannelSpec {
        name: "Diastolic",
        unit: "mmHg",
        kind: ChannelKind::Held { group: 0 },
    },
    ChannelSpec {
        name: "Mean",
        unit: "mmHg",
        kind: ChannelKind::Held { group: 0 },
    },
    ChannelSpec {
        name: "HeartRate",
        unit: "bpm",
        kind: ChannelKind::Held { group: 0 },
    },
    ChannelSpec {
        name: "Countdown",
        unit: "s",
        kind: ChannelKind::Held { group: 1 },
    },
];

static NIBP_ERROR_NAMES: [AlarmName; 4] = [
    AlarmName { bit: 0, name: "cuff leak" },
    AlarmName { bit: 1, name: "cuff overpressure" },
    AlarmName { bit: 2, name: "pressure sensor fault" },
    AlarmName { bit: 3, name: "internal fault" },
];

static NIBP_WARNING_NAMES: [AlarmName; 4] = [
    AlarmName { bit: 0, name: "weak pulse" },
    AlarmName { bit: 1, name: "motion artifact" },
    AlarmName { bit: 2, name: "low battery" },
    AlarmName { bit: 3, name: "cuff too loose" },
];

pub static NIBP: Protocol = Protocol {
    name: "nibp",
    marker: &[0x02, 0xD4],
    anchor_offset: 1,
    sequence: SequenceWidth::U16,
    has_crc: true,
    packets: &NIBP_PACKETS,
    channels: &NIBP_CHANNEL_SPECS,
    status_group: Some(1),
    out_of_range: 0x8000,
    fatal_errors: NIBP_ERR_OVERPRESSURE | NIBP_ERR_SENSOR | NIBP_ERR_INTERNAL,
    promoted_warnings: NIBP_WARN_CUFF_LOOSE,
    error_names: &NIBP_ERROR_NAMES,
    warning_names: &NIBP_WARNING_NAMES,
    commands: Commands {
        start: nibp_start,
        stop: nibp_stop,
        keep_alive: Some(nibp_poll),
    },
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(Protocol::by_name("Teensy").map(|p| p.name), Some("teensy-adc"));
        assert_eq!(Protocol::by_name("nibp").map(|p| p.name), Some("nibp"));
        assert!(Protocol::by_name("openbci").is_none());
    }

    #[test]
    fn test_geometry() {
        assert_eq!(TEENSY_ADC.anchor(), 0xA0);
        assert_eq!(TEENSY_ADC.header_len(), 4);
        let data = TEENSY_ADC.packet(TEENSY_DATA).unwrap();
        assert_eq!(TEENSY_ADC.frame_len(data), 8);
        let medium = TEENSY_ADC.packet(TEENSY_MEDIUM_DATA).unwrap();
        assert_eq!(TEENSY_ADC.frame_len(medium), 44);

        assert_eq!(NIBP.anchor(), 0xD4);
        assert_eq!(NIBP.header_len(), 5);
        let wave = NIBP.packet(NIBP_WAVEFORM).unwrap();
        assert_eq!(NIBP.frame_len(wave), 12);
        assert!(NIBP.packet(b'?').is_none());
    }

    #[test]
    fn test_channel_layout() {
        assert_eq!(TEENSY_ADC.primary_channels(), vec![0, 1]);
        assert!(TEENSY_ADC.hold_groups().is_empty());
        assert_eq!(NIBP.primary_channels(), vec![0, 1]);
        assert_eq!(NIBP.hold_groups(), vec![vec![2, 3, 4, 5], vec![6]]);
        assert_eq!(NIBP.channel_index("HeartRate"), Some(5));
    }

    #[test]
    fn test_encode_teensy_frame() {
        let frame = TEENSY_ADC.encode_frame(TEENSY_DATA, 0, &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame, vec![0x50, 0xA0, 0x44, 0x00, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_encode_nibp_frame_appends_crc() {
        let frame = NIBP.encode_frame(NIBP_STATUS, 0x0102, &[0; 6]);
        assert_eq!(&frame[..5], &[0x02, 0xD4, b'S', 0x02, 0x01]);
        assert_eq!(frame.len(), 12);
        assert_eq!(frame[11], crate::crc::crc8(&[0; 6]));
    }

    #[test]
    fn test_teensy_decoders() {
        let Packet::Samples(s) = decode_teensy_points(&[0x01, 0x02, 0xFF, 0xFF]) else {
            panic!("expected samples");
        };
        assert_eq!(s.values, vec![0x0201, -1]);

        let mut payload = vec![7];
        payload.extend_from_slice(&1000i32.to_le_bytes());
        payload.extend_from_slice(&42u16.to_le_bytes());
        payload.extend_from_slice(&(-5i32).to_le_bytes());
        assert_eq!(
            decode_teensy_latest_usb_frame(&payload),
            Packet::Time(TimeFrame::LatestUsbFrame {
                request: 7,
                tick_us: 1000,
                frame_number: 42,
                frame_time_us: -5,
            })
        );
    }

    #[test]
    fn test_nibp_decoders() {
        let Packet::Samples(s) = decode_nibp_waveform(&[0x00, 0x78, 0xAA, 0xFF, 0xF0, 0x00]) else {
            panic!("expected samples");
        };
        assert_eq!(s.values, vec![0x0078, -16]);

        let mut beat = 500u32.to_le_bytes().to_vec();
        for v in [120u16, 80, 93, 60] {
            beat.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            decode_nibp_beat(&beat),
            Packet::Beat(BeatFrame {
                group: 0,
                sample_index: 500,
                values: vec![120, 80, 93, 60],
            })
        );

        assert_eq!(
            decode_nibp_status(&[0x02, 0x00, 0x08, 0x00, 0xF3, 30]),
            Packet::Status(StatusFrame {
                errors: NIBP_ERR_OVERPRESSURE,
                warnings: NIBP_WARN_CUFF_LOOSE,
                mode: 3,
                countdown: 30,
            })
        );

        let mut version = [0u8; 16];
        version[..9].copy_from_slice(b"NIBP v2.1");
        assert_eq!(
            decode_nibp_version(&version),
            Packet::Version(VersionFrame {
                version: "NIBP v2.1".into()
            })
        );
    }

    #[test]
    fn test_nibp_commands_carry_crc() {
        assert_eq!(nibp_stop(), vec![0x02, 0xD4, 0x02, 0xBC]);
        assert_eq!(nibp_poll(9), vec![0x02, 0xD4, 0x03, 0xE2]);
        assert_eq!(
            nibp_start(&DeviceOptions::default()),
            vec![0x02, 0xD4, 0x01, 0x00, 0x00, 0xAB]
        );
        let opts = DeviceOptions {
            cuff_mode: 2,
            test_mode: true,
            ..Default::default()
        };
        assert_eq!(nibp_start(&opts), vec![0x02, 0xD4, 0x01, 0x02, 0x01, 0x64]);
    }

    #[test]
    fn test_teensy_commands() {
        assert_eq!(teensy_start(&DeviceOptions::default()), vec![b'b', 1]);
        let large = DeviceOptions {
            large_packets: true,
            ..Default::default()
        };
        assert_eq!(teensy_start(&large), vec![b'b', 10]);
        assert_eq!(teensy_stop(), vec![b's']);
        assert_eq!(teensy_time_request(3), vec![b'n', 3]);
    }
}
