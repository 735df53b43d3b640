use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use daq_stream::protocol::{
    NIBP_BEAT, NIBP_ERR_SENSOR, NIBP_STATUS, NIBP_WAVEFORM, TEENSY_DATA, TEENSY_MEDIUM_DATA,
};
use daq_stream::{
    AlarmChange, CrcPolicy, DriverError, PhysicalDevice, Protocol, Sample, Session, SessionEvent,
    SessionSettings, SessionState, NIBP, TEENSY_ADC,
};

#[derive(Clone, Default)]
struct Wire(Arc<Mutex<Vec<u8>>>);

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn started(protocol: &'static Protocol, settings: SessionSettings) -> (Session, Wire) {
    let wire = Wire::default();
    let mut session = Session::new(protocol, Box::new(wire.clone()));
    assert!(session.start_sampling(settings));
    (session, wire)
}

fn drain(session: &Session, ch: usize) -> Vec<Sample> {
    session
        .buffer(ch)
        .map(|b| b.lock().unwrap().drain_all())
        .unwrap_or_default()
}

fn events(session: &mut Session) -> Vec<SessionEvent> {
    std::iter::from_fn(|| session.next_event()).collect()
}

fn wave(seq: u16, pressure: i16, pleth: i16) -> Vec<u8> {
    let [p0, p1] = pressure.to_be_bytes();
    let [q0, q1] = pleth.to_be_bytes();
    NIBP.encode_frame(NIBP_WAVEFORM, seq, &[p0, p1, 0x00, q0, q1, 0x00])
}

#[test]
fn teensy_frame_then_lost_packet() {
    let (mut s, _) = started(&TEENSY_ADC, SessionSettings::default());

    s.on_bytes(&[0x50, 0xA0, 0x44, 0x00, 0x01, 0x02, 0x03, 0x04]);
    assert_eq!(drain(&s, 0), vec![0x0201]);
    assert_eq!(drain(&s, 1), vec![0x0403]);

    // Counter 1 never arrives.
    s.on_bytes(&[0x50, 0xA0, 0x44, 0x02, 0x05, 0x00, 0x06, 0x00]);
    assert_eq!(drain(&s, 0), vec![0x8000, 5]);
    assert_eq!(drain(&s, 1), vec![0x8000, 6]);
    assert_eq!(s.expected_sequence(), Some(3));
    assert_eq!(s.stats().lost_packets, 1);
}

#[test]
fn garbage_between_frames_is_skipped() {
    let (mut s, _) = started(&TEENSY_ADC, SessionSettings::default());
    let mut bytes = vec![0xA0, 0x13, 0x50, 0x50];
    bytes.extend(TEENSY_ADC.encode_frame(TEENSY_DATA, 0, &[1, 0, 2, 0]));
    bytes.extend([0xA0, 0xA0, 0x00]);
    bytes.extend(TEENSY_ADC.encode_frame(TEENSY_DATA, 1, &[3, 0, 4, 0]));

    for b in &bytes {
        s.on_bytes(std::slice::from_ref(b));
    }
    assert_eq!(drain(&s, 0), vec![1, 3]);
    assert_eq!(drain(&s, 1), vec![2, 4]);
    assert_eq!(s.stats().lost_packets, 0);
}

#[test]
fn medium_packets_backfill_ten_rows_per_lost_packet() {
    let settings = SessionSettings {
        options: daq_stream::DeviceOptions {
            large_packets: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut s, wire) = started(&TEENSY_ADC, settings);
    assert_eq!(wire.0.lock().unwrap().as_slice(), &[b'b', 10]);

    let payload: Vec<u8> = (0..10i16)
        .flat_map(|i| [i.to_le_bytes(), (-i).to_le_bytes()].concat())
        .collect();
    let mut bytes = TEENSY_ADC.encode_frame(TEENSY_MEDIUM_DATA, 7, &payload);
    bytes.extend(TEENSY_ADC.encode_frame(TEENSY_MEDIUM_DATA, 9, &payload));
    s.on_bytes(&bytes);

    let ch0 = drain(&s, 0);
    assert_eq!(ch0.len(), 30);
    assert_eq!(&ch0[..10], &(0..10).collect::<Vec<Sample>>()[..]);
    assert!(ch0[10..20].iter().all(|&v| v == 0x8000));
    assert_eq!(ch0[29], 9);
    assert_eq!(drain(&s, 1)[29], -9);
}

#[test]
fn counter_wraps_without_loss() {
    let (mut s, _) = started(&TEENSY_ADC, SessionSettings::default());
    let mut bytes = Vec::new();
    for i in 0..300u16 {
        bytes.extend(TEENSY_ADC.encode_frame(TEENSY_DATA, i & 0xFF, &[i as u8, 0, 0, 0]));
    }
    s.on_bytes(&bytes);
    assert_eq!(drain(&s, 0).len(), 300);
    assert_eq!(s.stats().lost_packets, 0);
    assert_eq!(s.stats().sentinel_samples, 0);
}

#[test]
fn strict_crc_drops_corrupt_frames() {
    let settings = SessionSettings {
        crc_policy: CrcPolicy::Strict,
        ..Default::default()
    };
    let (mut s, _) = started(&NIBP, settings);
    let mut bad = wave(1, 20, 0);
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;

    let mut bytes = wave(0, 10, 0);
    bytes.extend(bad);
    bytes.extend(wave(2, 30, 0));
    s.on_bytes(&bytes);

    // The dropped frame shows up as one lost packet.
    assert_eq!(drain(&s, 0), vec![10, 0x8000, 30]);
    assert_eq!(s.stats().scan.crc_errors, 1);
}

#[test]
fn lenient_crc_keeps_corrupt_frames() {
    let (mut s, _) = started(&NIBP, SessionSettings::default());
    let mut bad = wave(1, 20, 0);
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;

    let mut bytes = wave(0, 10, 0);
    bytes.extend(bad);
    s.on_bytes(&bytes);
    assert_eq!(drain(&s, 0), vec![10, 20]);
    assert_eq!(s.stats().scan.crc_errors, 1);
}

#[test]
fn nibp_full_run() {
    let settings = SessionSettings {
        enabled_channels: Some(vec![0, 2, 6]),
        ..Default::default()
    };
    let (mut s, wire) = started(&NIBP, settings);
    assert_eq!(wire.0.lock().unwrap().as_slice(), &[0x02, 0xD4, 0x01, 0x00, 0x00, 0xAB]);

    let mut bytes = Vec::new();
    bytes.extend(wave(0, 50, 1));
    bytes.extend(wave(1, 51, 1));
    let mut beat = 1u32.to_le_bytes().to_vec();
    for v in [118u16, 76, 90, 64] {
        beat.extend_from_slice(&v.to_le_bytes());
    }
    bytes.extend(NIBP.encode_frame(NIBP_BEAT, 2, &beat));
    bytes.extend(NIBP.encode_frame(NIBP_STATUS, 3, &[0, 0, 0, 0, 0x02, 15]));
    bytes.extend(wave(4, 52, 1));
    s.on_bytes(&bytes);

    assert!(s.buffer(1).is_none());
    assert_eq!(drain(&s, 0), vec![50, 51, 52]);
    assert_eq!(drain(&s, 2), vec![0x8000, 118, 118]);
    assert_eq!(drain(&s, 6), vec![0x8000, 0x8000, 15]);

    let ev = events(&mut s);
    assert!(matches!(ev[0], SessionEvent::SamplingStarted { .. }));
    assert!(ev.contains(&SessionEvent::ModeChanged { from: None, to: 2 }));

    assert!(s.stop_sampling());
    assert!(wire
        .0
        .lock()
        .unwrap()
        .ends_with(&[0x02, 0xD4, 0x02, 0xBC]));
    assert_eq!(
        events(&mut s),
        vec![SessionEvent::SamplingStopped { error: None }]
    );
}

fn beat(seq: u16, sample_index: u32, systolic: u16) -> Vec<u8> {
    let mut payload = sample_index.to_le_bytes().to_vec();
    for v in [systolic, 76, 90, 64] {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    NIBP.encode_frame(NIBP_BEAT, seq, &payload)
}

#[test]
fn late_beat_only_updates_held_value() {
    let sentinel = NIBP.out_of_range;
    let waves: Vec<u8> = (0..3).flat_map(|seq| wave(seq, 50, 1)).collect();
    let mut tail = beat(3, 1, 118);
    tail.extend(wave(4, 53, 1));

    // One chunk: the beat lands while slots 0..3 are still pending.
    let (mut whole, _) = started(&NIBP, SessionSettings::default());
    whole.on_bytes(&[waves.clone(), tail.clone()].concat());
    assert_eq!(drain(&whole, 2), vec![sentinel, 118, 118, 118]);

    // Two chunks: slots 0..3 were flushed with the old value before the beat
    // arrived, so only the slot after it carries the new value.
    let (mut split, _) = started(&NIBP, SessionSettings::default());
    split.on_bytes(&waves);
    assert_eq!(drain(&split, 2), vec![sentinel; 3]);
    split.on_bytes(&tail);
    assert_eq!(drain(&split, 2), vec![118]);
    assert_eq!(drain(&split, 0), vec![50, 50, 50, 53]);
}

#[test]
fn nibp_fatal_error_reported_once_then_stops() {
    let (mut s, _) = started(&NIBP, SessionSettings::default());
    let [lo, hi] = NIBP_ERR_SENSOR.to_le_bytes();
    let mut bytes = wave(0, 1, 1);
    bytes.extend(NIBP.encode_frame(NIBP_STATUS, 1, &[lo, hi, 0, 0, 0, 0]));
    s.on_bytes(&bytes);

    assert_eq!(s.state(), SessionState::Idle);
    let ev = events(&mut s);
    let alarms: Vec<_> = ev
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Alarm(a) => Some(a),
            _ => None,
        })
        .collect();
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].change, AlarmChange::Raised);
    assert!(matches!(
        ev.last(),
        Some(SessionEvent::SamplingStopped { error: Some(_) })
    ));
}

#[test]
fn update_events_are_throttled() {
    let (mut s, _) = started(&TEENSY_ADC, SessionSettings::default());
    let t0 = Instant::now();
    for i in 0..10u16 {
        let at = t0 + Duration::from_millis(u64::from(i) * 10);
        s.on_bytes_at(&TEENSY_ADC.encode_frame(TEENSY_DATA, i, &[0; 4]), at);
    }
    let updates = events(&mut s)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::SamplingUpdate { .. }))
        .count();
    // Chunks at 0, 10, ..., 90 ms: updates at 0 and 50 ms.
    assert_eq!(updates, 2);
}

#[test]
fn device_allows_one_proxy() {
    let session = Session::new(&TEENSY_ADC, Box::new(std::io::sink()));
    let mut device = PhysicalDevice::new("teensy", session);
    device.connect(10).unwrap();
    assert!(matches!(
        device.connect(11),
        Err(DriverError::DeviceBusy { owner: 10 })
    ));
    assert!(device
        .session(10)
        .unwrap()
        .start_sampling(SessionSettings::default()));
    device.on_bytes(&TEENSY_ADC.encode_frame(TEENSY_DATA, 0, &[1, 0, 1, 0]));
    assert_eq!(
        device.session(10).unwrap().state(),
        SessionState::Sampling
    );
    assert!(device.disconnect(10));
    device.connect(11).unwrap();
    assert!(!device.session(11).unwrap().is_sampling());
}
