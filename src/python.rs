//! Python bindings.
//!
//! The Python side owns the port: it feeds received bytes to a `Parser`,
//! sends whatever `take_commands()` returns, and reads the channel buffers.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBytes, PyDict};

use crate::alarms::AlarmChange;
use crate::config::SessionSettings;
use crate::crc;
use crate::logging;
use crate::protocol::Protocol;
use crate::session::{Session, SessionEvent, SessionState};

/// Outgoing commands, collected until Python writes them to the device.
#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<u8>>>);

impl Write for Outbox {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "outbox poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn event_to_dict<'py>(py: Python<'py>, event: &SessionEvent) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    match event {
        SessionEvent::SamplingStarted { .. } => {
            dict.set_item("kind", "sampling_started")?;
        }
        SessionEvent::SamplingUpdate { samples_written } => {
            dict.set_item("kind", "sampling_update")?;
            dict.set_item("samples_written", samples_written)?;
        }
        SessionEvent::SamplingStopped { error } => {
            dict.set_item("kind", "sampling_stopped")?;
            dict.set_item("error", error.clone())?;
        }
        SessionEvent::Alarm(alarm) => {
            dict.set_item("kind", "alarm")?;
            dict.set_item("name", &alarm.name)?;
            dict.set_item("bit", alarm.bit)?;
            dict.set_item("severity", format!("{:?}", alarm.severity).to_lowercase())?;
            dict.set_item("cleared", alarm.change == AlarmChange::Cleared)?;
        }
        SessionEvent::ModeChanged { from, to } => {
            dict.set_item("kind", "mode_changed")?;
            dict.set_item("from", *from)?;
            dict.set_item("to", *to)?;
        }
        SessionEvent::TimeCorrelation(tc) => {
            dict.set_item("kind", "time_correlation")?;
            dict.set_item("request", tc.request)?;
            dict.set_item("device_tick_us", tc.device_tick_us)?;
            dict.set_item(
                "round_trip_us",
                tc.round_trip().map(|d| d.as_micros() as u64),
            )?;
            dict.set_item("usb_frame", tc.usb_frame)?;
        }
        SessionEvent::FirstSampleTime { tick_us } => {
            dict.set_item("kind", "first_sample_time")?;
            dict.set_item("tick_us", tick_us)?;
        }
        SessionEvent::Version(version) => {
            dict.set_item("kind", "version")?;
            dict.set_item("version", version)?;
        }
    }
    Ok(dict)
}

/// Frame parser for one device connection.
///
/// Example:
///     >>> parser = Parser("teensy")
///     >>> parser.start('{"sample_rate_hz": 1000}')
///     >>> port.write(parser.take_commands())
///     >>> parser.feed(port.read(4096))
///     >>> adc1 = parser.read(0)
#[pyclass(name = "Parser", unsendable)]
struct PyParser {
    session: Session,
    outbox: Outbox,
}

#[pymethods]
impl PyParser {
    #[new]
    fn new(protocol: &str) -> PyResult<Self> {
        let protocol = Protocol::by_name(protocol)
            .ok_or_else(|| PyValueError::new_err(format!("unknown protocol '{protocol}'")))?;
        let outbox = Outbox::default();
        Ok(PyParser {
            session: Session::new(protocol, Box::new(outbox.clone())),
            outbox,
        })
    }

    /// Start sampling. `settings` is a JSON object; missing keys use defaults.
    ///
    /// Returns:
    ///     False if the settings were rejected (see `last_error`).
    #[pyo3(signature = (settings=None))]
    fn start(&mut self, settings: Option<&str>) -> PyResult<bool> {
        let settings = match settings {
            Some(json) => SessionSettings::from_json_str(json)
                .map_err(|e| PyValueError::new_err(e.to_string()))?,
            None => SessionSettings::default(),
        };
        Ok(self.session.start_sampling(settings))
    }

    fn stop(&mut self) -> bool {
        self.session.stop_sampling()
    }

    /// Process bytes received from the device.
    fn feed(&mut self, data: &[u8]) {
        self.session.on_bytes(data);
    }

    /// Run the keep-alive and watchdog timers; call this regularly.
    fn poll(&mut self) {
        self.session.poll(Instant::now());
    }

    /// Report a transport failure; sampling stops.
    fn transport_error(&mut self, message: &str) {
        self.session.on_transport_error(std::io::Error::new(
            std::io::ErrorKind::Other,
            message.to_string(),
        ));
    }

    /// Commands queued for the device since the last call.
    fn take_commands<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyBytes>> {
        let mut pending = self
            .outbox
            .0
            .lock()
            .map_err(|_| PyRuntimeError::new_err("outbox poisoned"))?;
        let bytes = PyBytes::new(py, &pending[..]);
        pending.clear();
        Ok(bytes)
    }

    /// Drain up to `max` samples of one channel (all when omitted).
    #[pyo3(signature = (channel, max=None))]
    fn read(&self, channel: usize, max: Option<usize>) -> PyResult<Vec<i32>> {
        let Some(buffer) = self.session.buffer(channel) else {
            return Ok(Vec::new());
        };
        let mut buffer = buffer
            .lock()
            .map_err(|_| PyRuntimeError::new_err("channel buffer poisoned"))?;
        let n = max.map_or(buffer.count(), |m| m.min(buffer.count()));
        let mut out = vec![0; n];
        let read = buffer.read_into(&mut out);
        out.truncate(read);
        Ok(out)
    }

    /// Pending session events as dictionaries with a `kind` key.
    fn events<'py>(&mut self, py: Python<'py>) -> PyResult<Vec<Bound<'py, PyDict>>> {
        let mut out = Vec::new();
        while let Some(event) = self.session.next_event() {
            out.push(event_to_dict(py, &event)?);
        }
        Ok(out)
    }

    fn stats<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let stats = self.session.stats();
        let dict = PyDict::new(py);
        dict.set_item("frames", stats.scan.frames)?;
        dict.set_item("crc_errors", stats.scan.crc_errors)?;
        dict.set_item("bytes_discarded", stats.scan.bytes_discarded)?;
        dict.set_item("samples_written", stats.samples_written)?;
        dict.set_item("samples_dropped", stats.samples_dropped)?;
        dict.set_item("lost_packets", stats.lost_packets)?;
        dict.set_item("sequence_resyncs", stats.sequence_resyncs)?;
        Ok(dict)
    }

    #[getter]
    fn channels(&self) -> Vec<&'static str> {
        self.session.protocol().channels.iter().map(|c| c.name).collect()
    }

    #[getter]
    fn is_sampling(&self) -> bool {
        self.session.is_sampling()
    }

    #[getter]
    fn state(&self) -> &'static str {
        match self.session.state() {
            SessionState::Idle => "idle",
            SessionState::StartingSampling => "starting",
            SessionState::Sampling => "sampling",
            SessionState::Error => "error",
        }
    }

    #[getter]
    fn last_error(&self) -> Option<String> {
        self.session.last_error().map(str::to_string)
    }

    fn __repr__(&self) -> String {
        format!(
            "Parser(protocol={}, state={})",
            self.session.protocol().name,
            self.state()
        )
    }
}

/// CRC-8 (Dallas/Maxim) of `data`.
#[pyfunction(name = "crc8")]
fn py_crc8(data: &[u8]) -> u8 {
    crc::crc8(data)
}

/// Forward crate logs to Python's `logging` at `level` (env default).
#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
    logging::init_python_logging(py)?;
    logging::set_python_log_level(py, level)
}

#[pymodule]
fn daq_stream(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyParser>()?;
    m.add_function(wrap_pyfunction!(py_crc8, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    m.add("PROTOCOLS", vec!["teensy-adc", "nibp"])?;
    Ok(())
}
