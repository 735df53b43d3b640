use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use daq_stream::logging::init_rust_logging;
use daq_stream::{Protocol, Sample, Session, SessionEvent, SessionSettings};

const READ_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(
    name = "daq-stream",
    about = "Decode a DAQ device byte stream into channel data"
)]
struct Args {
    /// Serial port of a live device (e.g. /dev/ttyACM0)
    #[arg(long, conflicts_with = "capture", required_unless_present = "capture")]
    port: Option<String>,
    /// Recorded byte stream to replay instead of a live device
    #[arg(long)]
    capture: Option<PathBuf>,
    /// Device protocol: teensy or nibp
    #[arg(long, default_value = "teensy")]
    protocol: String,
    /// JSON session settings; defaults are used for missing keys
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Seconds to sample from a live device
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,
    /// Bytes handed to the parser per call
    #[arg(long, default_value_t = 4096)]
    chunk: usize,
    #[arg(long, default_value_t = 115_200)]
    baud: u32,
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

/// Per-channel totals gathered while draining.
struct Totals {
    names: Vec<&'static str>,
    counts: Vec<u64>,
    last: Vec<Option<Sample>>,
}

impl Totals {
    fn new(protocol: &Protocol) -> Self {
        let n = protocol.channels.len();
        Self {
            names: protocol.channels.iter().map(|c| c.name).collect(),
            counts: vec![0; n],
            last: vec![None; n],
        }
    }

    fn drain(&mut self, session: &Session) {
        for ch in 0..self.names.len() {
            let Some(buffer) = session.buffer(ch) else {
                continue;
            };
            let Ok(mut buffer) = buffer.lock() else {
                continue;
            };
            let values = buffer.drain_all();
            self.counts[ch] += values.len() as u64;
            if let Some(&v) = values.last() {
                self.last[ch] = Some(v);
            }
        }
    }
}

fn report_events(session: &mut Session) {
    while let Some(event) = session.next_event() {
        match event {
            SessionEvent::SamplingUpdate { .. } => {}
            SessionEvent::Alarm(alarm) => println!(
                "alarm: {} ({:?}, {:?})",
                alarm.name, alarm.severity, alarm.change
            ),
            SessionEvent::SamplingStopped { error: Some(e) } => println!("stopped: {e}"),
            other => println!("{other:?}"),
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    if args.chunk == 0 {
        bail!("--chunk must be at least 1");
    }

    let protocol = Protocol::by_name(&args.protocol)
        .ok_or_else(|| anyhow!("unknown protocol '{}' (teensy, nibp)", args.protocol))?;
    let settings = match &args.settings {
        Some(path) => SessionSettings::from_json_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => SessionSettings::default(),
    };

    let mut totals = Totals::new(protocol);
    let session = match (&args.port, &args.capture) {
        (_, Some(path)) => replay(protocol, settings, path, args.chunk, &mut totals)?,
        (Some(port), None) => live(protocol, settings, port, &args, &mut totals)?,
        (None, None) => bail!("either --port or --capture is required"),
    };

    for (ch, name) in totals.names.iter().enumerate() {
        match totals.last[ch] {
            Some(v) => println!("{name:>10}: {:>8} samples, last {v}", totals.counts[ch]),
            None => println!("{name:>10}: {:>8} samples", totals.counts[ch]),
        }
    }
    println!("{:#?}", session.stats());
    if let Some(e) = session.last_error() {
        println!("last error: {e}");
    }
    Ok(())
}

fn replay(
    protocol: &'static Protocol,
    settings: SessionSettings,
    path: &Path,
    chunk: usize,
    totals: &mut Totals,
) -> Result<Session> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    info!("replaying {} bytes from {}", bytes.len(), path.display());

    let mut session = Session::new(protocol, Box::new(std::io::sink()));
    if !session.start_sampling(settings) {
        bail!(
            "start failed: {}",
            session.last_error().unwrap_or("unknown error")
        );
    }
    for piece in bytes.chunks(chunk) {
        session.on_bytes(piece);
        totals.drain(&session);
        report_events(&mut session);
    }
    totals.drain(&session);
    session.stop_sampling();
    report_events(&mut session);
    Ok(session)
}

fn live(
    protocol: &'static Protocol,
    settings: SessionSettings,
    port_name: &str,
    args: &Args,
    totals: &mut Totals,
) -> Result<Session> {
    let mut port = serialport::new(port_name, args.baud)
        .timeout(READ_TIMEOUT)
        .open()
        .with_context(|| format!("Failed to open serial port at {port_name}"))?;
    let writer = port
        .try_clone()
        .context("Failed to clone serial port for writing")?;

    let mut session = Session::new(protocol, Box::new(writer));
    if !session.start_sampling(settings) {
        bail!(
            "start failed: {}",
            session.last_error().unwrap_or("unknown error")
        );
    }

    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0));
    let mut buf = vec![0u8; args.chunk];
    while session.is_sampling() && Instant::now() < deadline {
        match port.read(&mut buf) {
            Ok(n) => session.on_bytes(&buf[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {}
            Err(e) => {
                warn!("read from {port_name} failed: {e}");
                session.on_transport_error(e);
            }
        }
        session.poll(Instant::now());
        totals.drain(&session);
        report_events(&mut session);
    }

    totals.drain(&session);
    session.stop_sampling();
    report_events(&mut session);
    Ok(session)
}
