//! Edge detection for status packets.
//!
//! Status packets repeat the same flags many times per second. The tracker
//! only reports transitions: a flag that appears, a flag that clears, and a
//! flag that is still set after the repeat window elapsed. Mode changes are
//! reported the same way.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::packets::StatusFrame;
use crate::protocol::{AlarmName, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlarmSource {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
    /// Stops sampling unless the session continues on error.
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmChange {
    Raised,
    /// Still active after the repeat window.
    Repeated,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmEvent {
    pub source: AlarmSource,
    pub bit: u8,
    pub name: String,
    pub severity: Severity,
    pub change: AlarmChange,
}

impl AlarmEvent {
    /// True when this event should stop (or degrade) the session.
    pub fn is_critical_onset(&self) -> bool {
        self.severity == Severity::Critical && self.change != AlarmChange::Cleared
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    Alarm(AlarmEvent),
    ModeChanged { from: Option<u8>, to: u8 },
}

pub struct AlarmTracker {
    protocol: &'static Protocol,
    repeat_after: Duration,
    raised: HashMap<(AlarmSource, u8), Instant>,
    mode: Option<u8>,
}

fn bit_name(names: &[AlarmName], bit: u8) -> Option<&'static str> {
    names.iter().find(|n| n.bit == bit).map(|n| n.name)
}

impl AlarmTracker {
    pub fn new(protocol: &'static Protocol, repeat_after: Duration) -> Self {
        Self {
            protocol,
            repeat_after,
            raised: HashMap::new(),
            mode: None,
        }
    }

    pub fn reset(&mut self) {
        self.raised.clear();
        self.mode = None;
    }

    pub fn is_raised(&self, source: AlarmSource, bit: u8) -> bool {
        self.raised.contains_key(&(source, bit))
    }

    pub fn mode(&self) -> Option<u8> {
        self.mode
    }

    fn severity(&self, source: AlarmSource, bit: u8) -> Severity {
        let mask = 1u16 << bit;
        match source {
            AlarmSource::Error if self.protocol.fatal_errors & mask != 0 => Severity::Critical,
            AlarmSource::Error => Severity::Error,
            AlarmSource::Warning if self.protocol.promoted_warnings & mask != 0 => {
                Severity::Critical
            }
            AlarmSource::Warning => Severity::Warning,
        }
    }

    fn name(&self, source: AlarmSource, bit: u8) -> String {
        let names = match source {
            AlarmSource::Error => self.protocol.error_names,
            AlarmSource::Warning => self.protocol.warning_names,
        };
        match bit_name(names, bit) {
            Some(name) => name.to_string(),
            None => format!("{:?} bit {}", source, bit).to_lowercase(),
        }
    }

    fn track(
        &mut self,
        source: AlarmSource,
        flags: u16,
        now: Instant,
        events: &mut Vec<StatusEvent>,
    ) {
        for bit in 0..16u8 {
            let set = flags & (1 << bit) != 0;
            let key = (source, bit);
            let change = match (set, self.raised.get(&key).copied()) {
                (true, None) => Some(AlarmChange::Raised),
                (true, Some(at)) if now.saturating_duration_since(at) >= self.repeat_after => {
                    Some(AlarmChange::Repeated)
                }
                (false, Some(_)) => Some(AlarmChange::Cleared),
                _ => None,
            };
            let Some(change) = change else {
                continue;
            };

            if change == AlarmChange::Cleared {
                self.raised.remove(&key);
            } else {
                self.raised.insert(key, now);
            }

            let event = AlarmEvent {
                source,
                bit,
                name: self.name(source, bit),
                severity: self.severity(source, bit),
                change,
            };
            match (event.change, event.severity) {
                (AlarmChange::Cleared, _) => info!("{} cleared", event.name),
                (_, Severity::Warning) => warn!("device warning: {}", event.name),
                _ => warn!("device error ({:?}): {}", event.severity, event.name),
            }
            events.push(StatusEvent::Alarm(event));
        }
    }

    /// Compare a status packet with what has already been reported.
    pub fn process(&mut self, status: &StatusFrame, now: Instant) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        self.track(AlarmSource::Error, status.errors, now, &mut events);
        self.track(AlarmSource::Warning, status.warnings, now, &mut events);

        if self.mode != Some(status.mode) {
            info!("device mode {:?} -> {}", self.mode, status.mode);
            events.push(StatusEvent::ModeChanged {
                from: self.mode,
                to: status.mode,
            });
            self.mode = Some(status.mode);
        }
        events
    }
}
