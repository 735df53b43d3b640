//! Per-connection session controller.
//!
//! A [`Session`] owns the scanner, the counter tracker, the hold state and the
//! ring buffers of one device connection. The host feeds it byte chunks with
//! [`Session::on_bytes`], drives its timers with [`Session::poll`] and drains
//! the per-channel buffers and the event queue.
//!
//! # State machine
//!
//! ```text
//! Idle --start_sampling--> StartingSampling --first sample--> Sampling
//!                                                      |
//!                        critical alarm + continue_on_error
//!                                                      v
//!                                                    Error (zero padded)
//! ```
//!
//! Any state but `Idle` returns to `Idle` on `stop_sampling`, on a transport
//! error, when the watchdog expires, or on a critical alarm without
//! `continue_on_error`. Each of those emits exactly one `SamplingStopped`.

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::alarms::{AlarmEvent, AlarmTracker, StatusEvent};
use crate::config::SessionSettings;
use crate::errors::{DriverError, Result};
use crate::packets::{Packet, Sample, SampleFrame, StatusFrame, TimeFrame};
use crate::protocol::Protocol;
use crate::ring_buffer::{RingBuffer, SharedRingBuffer};
use crate::scanner::{FrameScanner, ScanStats};
use crate::sequence::{Gap, HoldState, SampleSink, SequenceTracker};
use crate::timer::{Throttle, Timer, Watchdog};

/// Minimum spacing of `SamplingUpdate` events.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(50);

/// Oldest events are dropped beyond this many undrained entries.
const MAX_QUEUED_EVENTS: usize = 1024;

/// Anything the session can write commands to.
pub trait Transport: Write + Send {}
impl<T: Write + Send> Transport for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Start command sent, no sample packet yet.
    StartingSampling,
    Sampling,
    /// Critical device error latched; samples are written as zeros.
    Error,
}

/// Host/device clock pair from a time request round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeCorrelation {
    pub request: u8,
    pub device_tick_us: i32,
    /// When the matching request was written; `None` if it was not ours.
    pub sent_at: Option<Instant>,
    pub received_at: Instant,
    /// USB start-of-frame number and its device time, when reported.
    pub usb_frame: Option<(u16, i32)>,
}

impl TimeCorrelation {
    pub fn round_trip(&self) -> Option<Duration> {
        self.sent_at
            .map(|sent| self.received_at.saturating_duration_since(sent))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SamplingStarted { at: Instant },
    /// New samples are waiting in the buffers.
    SamplingUpdate { samples_written: u64 },
    SamplingStopped { error: Option<String> },
    Alarm(AlarmEvent),
    ModeChanged { from: Option<u8>, to: u8 },
    TimeCorrelation(TimeCorrelation),
    FirstSampleTime { tick_us: i32 },
    Version(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub scan: ScanStats,
    /// Values accepted by the ring buffers, sentinels included.
    pub samples_written: u64,
    /// Values rejected because a ring buffer was full.
    pub samples_dropped: u64,
    pub sentinel_samples: u64,
    pub lost_packets: u64,
    pub sequence_resyncs: u64,
}

/// Writes into the enabled channels' ring buffers.
struct ChannelWriter<'a> {
    buffers: &'a [Option<SharedRingBuffer<Sample>>],
    stats: &'a mut SessionStats,
}

impl SampleSink for ChannelWriter<'_> {
    fn put(&mut self, channel: usize, value: Sample) {
        let Some(Some(buffer)) = self.buffers.get(channel) else {
            return;
        };
        let written = buffer.lock().map(|mut b| b.write(value)).unwrap_or(false);
        if written {
            self.stats.samples_written += 1;
        } else {
            self.stats.samples_dropped += 1;
        }
    }
}

pub struct Session {
    protocol: &'static Protocol,
    transport: Box<dyn Transport>,
    state: SessionState,
    settings: SessionSettings,

    scanner: FrameScanner,
    sequence: SequenceTracker,
    holds: HoldState,
    alarms: AlarmTracker,

    primary: Vec<usize>,
    buffers: Vec<Option<SharedRingBuffer<Sample>>>,
    /// Points per sample packet, from the latest one seen.
    points_per_packet: usize,

    keep_alive: Option<Timer>,
    watchdog: Watchdog,
    updates: Throttle,
    reported_samples: u64,
    reported_crc_errors: u64,

    next_request: u8,
    time_requests: HashMap<u8, Instant>,

    events: VecDeque<SessionEvent>,
    stats: SessionStats,
    last_error: Option<String>,
    first_sample_at: Option<Instant>,
    version: Option<String>,
}

impl Session {
    pub fn new(protocol: &'static Protocol, transport: Box<dyn Transport>) -> Self {
        let settings = SessionSettings::default();
        Self {
            protocol,
            transport,
            state: SessionState::Idle,
            scanner: FrameScanner::new(protocol, settings.crc_policy),
            sequence: SequenceTracker::new(protocol.sequence, settings.max_sequence_gap),
            holds: HoldState::for_protocol(protocol),
            alarms: AlarmTracker::new(protocol, settings.alarm_repeat()),
            primary: protocol.primary_channels(),
            buffers: Vec::new(),
            points_per_packet: 1,
            keep_alive: None,
            watchdog: Watchdog::new(settings.watchdog_timeout()),
            updates: Throttle::new(UPDATE_INTERVAL),
            reported_samples: 0,
            reported_crc_errors: 0,
            next_request: 0,
            time_requests: HashMap::new(),
            events: VecDeque::new(),
            stats: SessionStats::default(),
            last_error: None,
            first_sample_at: None,
            version: None,
            settings,
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn protocol(&self) -> &'static Protocol {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_sampling(&self) -> bool {
        self.state != SessionState::Idle
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Ring buffer of one channel; `None` when idle or the channel is disabled.
    pub fn buffer(&self, channel: usize) -> Option<SharedRingBuffer<Sample>> {
        self.buffers.get(channel).and_then(|b| b.clone())
    }

    pub fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            scan: *self.scanner.stats(),
            ..self.stats
        }
    }

    /// Host instant at which the first sample packet of this run arrived.
    pub fn first_sample_at(&self) -> Option<Instant> {
        self.first_sample_at
    }

    /// Last identification string reported by the device.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn expected_sequence(&self) -> Option<u16> {
        self.sequence.expected()
    }

    // ------------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------------

    pub fn start_sampling(&mut self, settings: SessionSettings) -> bool {
        self.start_sampling_at(settings, Instant::now())
    }

    /// Validate `settings`, reset every per-run state, allocate the buffers and
    /// send the start command. Returns false and records the reason on failure.
    pub fn start_sampling_at(&mut self, settings: SessionSettings, now: Instant) -> bool {
        if self.is_sampling() {
            self.stop_sampling();
        }
        if let Err(e) = settings.validate(self.protocol) {
            self.record_error(&e);
            return false;
        }

        let p = self.protocol;
        self.scanner = FrameScanner::new(p, settings.crc_policy);
        self.sequence = SequenceTracker::new(p.sequence, settings.max_sequence_gap);
        self.holds = HoldState::for_protocol(p);
        self.alarms = AlarmTracker::new(p, settings.alarm_repeat());
        self.stats = SessionStats::default();
        self.points_per_packet = 1;
        self.reported_samples = 0;
        self.reported_crc_errors = 0;
        self.updates.reset();
        self.time_requests.clear();
        self.first_sample_at = None;
        self.last_error = None;

        let size = settings.buffer_samples();
        self.buffers = settings
            .enabled_mask(p)
            .into_iter()
            .map(|on| on.then(|| RingBuffer::with_min_size(size).shared()))
            .collect();

        let command = (p.commands.start)(&settings.options);
        if let Err(e) = self.send(&command) {
            self.buffers.clear();
            self.record_error(&DriverError::Command(format!("start: {e}")));
            return false;
        }

        self.state = SessionState::StartingSampling;
        self.watchdog = Watchdog::new(settings.watchdog_timeout());
        self.watchdog.feed(now);
        self.keep_alive = settings.keep_alive_period().map(|period| {
            let mut timer = Timer::new(period);
            timer.arm(now);
            timer
        });
        info!(
            "{}: sampling requested ({} enabled channels, {} samples per buffer)",
            p.name,
            self.buffers.iter().filter(|b| b.is_some()).count(),
            size
        );
        self.settings = settings;
        true
    }

    /// Stop sampling. Calling it while idle does nothing and returns true.
    /// Returns false only if the stop command could not be written; the
    /// session is idle either way.
    pub fn stop_sampling(&mut self) -> bool {
        if !self.is_sampling() {
            return true;
        }
        let command = (self.protocol.commands.stop)();
        let delivered = match self.send(&command) {
            Ok(()) => true,
            Err(e) => {
                self.record_error(&DriverError::Command(format!("stop: {e}")));
                false
            }
        };
        self.teardown(None);
        delivered
    }

    /// The transport failed; the session stops and does not retry.
    pub fn on_transport_error(&mut self, err: impl Into<DriverError>) {
        let err = err.into();
        if self.is_sampling() {
            self.fail(err);
        } else {
            self.record_error(&err);
        }
    }

    // ------------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------------

    pub fn on_bytes(&mut self, bytes: &[u8]) {
        self.on_bytes_at(bytes, Instant::now());
    }

    /// Process one chunk received at `now`.
    pub fn on_bytes_at(&mut self, bytes: &[u8], now: Instant) {
        if self.is_sampling() && !bytes.is_empty() {
            self.watchdog.feed(now);
        }

        for frame in self.scanner.push(bytes) {
            if let Packet::Version(v) = &frame.packet {
                debug!("{}: device version {:?}", self.protocol.name, v.version);
                self.version = Some(v.version.clone());
                self.push_event(SessionEvent::Version(v.version.clone()));
            }
            if !self.is_sampling() {
                continue;
            }

            match self.sequence.observe(frame.sequence) {
                Gap::Lost(n) => self.backfill(n),
                Gap::Resync(_) => self.stats.sequence_resyncs += 1,
                Gap::Synced | Gap::InOrder => {}
            }

            match frame.packet {
                Packet::Samples(samples) => self.apply_samples(&samples, now),
                Packet::Beat(beat) => {
                    if self.state != SessionState::Error {
                        let mut out = ChannelWriter {
                            buffers: &self.buffers,
                            stats: &mut self.stats,
                        };
                        if let Some(group) = self.holds.group_mut(beat.group) {
                            group.update(Some(beat.sample_index), &beat.values, &mut out);
                        }
                    }
                }
                Packet::Status(status) => self.apply_status(&status, now),
                Packet::Time(time) => self.apply_time(time, now),
                Packet::Version(_) => {}
            }
        }

        if matches!(self.state, SessionState::Sampling | SessionState::Error) {
            let mut out = ChannelWriter {
                buffers: &self.buffers,
                stats: &mut self.stats,
            };
            self.holds.flush(&mut out);
        }
        self.report_progress(now);
    }

    /// Drive the watchdog, keep-alive and update timers.
    pub fn poll(&mut self, now: Instant) {
        if !self.is_sampling() {
            return;
        }
        if self.watchdog.expired(now) {
            let timeout = self.watchdog.timeout();
            self.fail(DriverError::CommunicationLost(format!(
                "no data from {} for {} ms",
                self.protocol.name,
                timeout.as_millis()
            )));
            return;
        }
        if self.keep_alive.as_mut().is_some_and(|t| t.fire(now)) {
            self.send_keep_alive(now);
        }
        self.report_progress(now);
    }

    // ------------------------------------------------------------------------
    // Packet effects
    // ------------------------------------------------------------------------

    fn apply_samples(&mut self, frame: &SampleFrame, now: Instant) {
        if self.state == SessionState::StartingSampling {
            self.state = SessionState::Sampling;
            self.first_sample_at = Some(now);
            info!("{}: sampling started", self.protocol.name);
            self.push_event(SessionEvent::SamplingStarted { at: now });
        }

        let points = frame.points();
        self.points_per_packet = points.max(1);
        let mut out = ChannelWriter {
            buffers: &self.buffers,
            stats: &mut self.stats,
        };

        if self.state == SessionState::Error {
            for _ in 0..points {
                for &ch in &self.primary {
                    out.put(ch, 0);
                }
            }
            self.holds.fill(points as u64, 0, &mut out);
            return;
        }

        for row in frame.rows() {
            for (&ch, &value) in self.primary.iter().zip(row) {
                out.put(ch, value);
            }
        }
        self.holds.advance(points as u64);
    }

    /// Write sentinel rows for `lost` missing packets.
    fn backfill(&mut self, lost: u32) {
        self.stats.lost_packets += u64::from(lost);
        if !matches!(self.state, SessionState::Sampling | SessionState::Error) {
            return;
        }
        let rows = u64::from(lost) * self.points_per_packet as u64;
        let sentinel = self.protocol.out_of_range;
        let before = self.stats.samples_written;
        let mut out = ChannelWriter {
            buffers: &self.buffers,
            stats: &mut self.stats,
        };
        for _ in 0..rows {
            for &ch in &self.primary {
                out.put(ch, sentinel);
            }
        }
        self.holds.fill(rows, sentinel, &mut out);
        self.stats.sentinel_samples += self.stats.samples_written - before;
        debug!("{}: {} packets lost, {} rows backfilled", self.protocol.name, lost, rows);
    }

    fn apply_status(&mut self, status: &StatusFrame, now: Instant) {
        if let Some(group) = self.protocol.status_group {
            if self.state != SessionState::Error {
                let mut out = ChannelWriter {
                    buffers: &self.buffers,
                    stats: &mut self.stats,
                };
                if let Some(group) = self.holds.group_mut(group) {
                    group.update(None, &[Sample::from(status.countdown)], &mut out);
                }
            }
        }

        let mut critical = None;
        for event in self.alarms.process(status, now) {
            match event {
                StatusEvent::Alarm(alarm) => {
                    if alarm.is_critical_onset() && critical.is_none() {
                        critical = Some(alarm.name.clone());
                    }
                    self.push_event(SessionEvent::Alarm(alarm));
                }
                StatusEvent::ModeChanged { from, to } => {
                    self.push_event(SessionEvent::ModeChanged { from, to });
                }
            }
        }

        let Some(name) = critical else {
            return;
        };
        if self.settings.continue_on_error {
            if self.state != SessionState::Error {
                warn!(
                    "{}: critical error '{}', continuing with zero padding",
                    self.protocol.name, name
                );
                self.last_error = Some(DriverError::Critical(name).to_string());
                self.state = SessionState::Error;
            }
        } else {
            self.fail(DriverError::Critical(name));
        }
    }

    fn apply_time(&mut self, time: TimeFrame, now: Instant) {
        let (request, tick_us, usb_frame) = match time {
            TimeFrame::FirstSample { tick_us } => {
                self.push_event(SessionEvent::FirstSampleTime { tick_us });
                return;
            }
            TimeFrame::Now { request, tick_us } => (request, tick_us, None),
            TimeFrame::LatestUsbFrame {
                request,
                tick_us,
                frame_number,
                frame_time_us,
            } => (request, tick_us, Some((frame_number, frame_time_us))),
        };
        let sent_at = self.time_requests.remove(&request);
        if sent_at.is_none() {
            debug!("{}: time reply for unknown request {}", self.protocol.name, request);
        }
        self.push_event(SessionEvent::TimeCorrelation(TimeCorrelation {
            request,
            device_tick_us: tick_us,
            sent_at,
            received_at: now,
            usb_frame,
        }));
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.transport.write_all(bytes)?;
        self.transport.flush()?;
        Ok(())
    }

    fn send_keep_alive(&mut self, now: Instant) {
        let Some(build) = self.protocol.commands.keep_alive else {
            return;
        };
        let request = self.next_request;
        self.next_request = self.next_request.wrapping_add(1);
        match self.send(&build(request)) {
            Ok(()) => {
                self.time_requests.insert(request, now);
            }
            Err(e) => self.fail(e),
        }
    }

    fn report_progress(&mut self, now: Instant) {
        if !matches!(self.state, SessionState::Sampling | SessionState::Error) {
            return;
        }
        if self.stats.samples_written == self.reported_samples || !self.updates.ready(now) {
            return;
        }
        self.reported_samples = self.stats.samples_written;
        self.push_event(SessionEvent::SamplingUpdate {
            samples_written: self.stats.samples_written,
        });

        let crc_errors = self.scanner.stats().crc_errors;
        if crc_errors > self.reported_crc_errors {
            warn!(
                "{}: {} CRC errors since last report ({} total)",
                self.protocol.name,
                crc_errors - self.reported_crc_errors,
                crc_errors
            );
            self.reported_crc_errors = crc_errors;
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        if self.events.len() >= MAX_QUEUED_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn record_error(&mut self, err: &DriverError) {
        warn!("{}: {}", self.protocol.name, err);
        self.last_error = Some(err.to_string());
    }

    /// Fatal error while active: best-effort stop command, then tear down.
    fn fail(&mut self, err: DriverError) {
        error!("{}: stopping: {}", self.protocol.name, err);
        let message = err.to_string();
        self.last_error = Some(message.clone());
        if !matches!(err, DriverError::Io(_) | DriverError::Serial(_)) {
            let command = (self.protocol.commands.stop)();
            if let Err(e) = self.send(&command) {
                debug!("{}: stop command failed: {}", self.protocol.name, e);
            }
        }
        self.teardown(Some(message));
    }

    fn teardown(&mut self, error: Option<String>) {
        self.watchdog.cancel();
        if let Some(timer) = self.keep_alive.as_mut() {
            timer.cancel();
        }
        self.buffers.clear();
        self.time_requests.clear();
        self.state = SessionState::Idle;
        info!("{}: sampling stopped", self.protocol.name);
        self.push_event(SessionEvent::SamplingStopped { error });
    }
}
