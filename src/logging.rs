//! Log setup for the CLI and the Python extension.
//!
//! The level comes from `DAQ_STREAM_LOG`, then `RUST_LOG`, default `info`.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

pub const LOG_ENV: &str = "DAQ_STREAM_LOG";

static RUST_LOG_ONCE: Once = Once::new();

pub fn env_level() -> LevelFilter {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn level_name(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

pub fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr logger used by the binary. Later calls do nothing.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level_name(level));
        // A logger installed by the embedding process wins.
        let _ = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .try_init();
    });
}

#[cfg(feature = "python")]
pub use python_bridge::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python_bridge {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    use super::env_level;

    static BRIDGE: OnceCell<&'static PyBridge> = OnceCell::new();

    /// Forwards `log` records to `logging.getLogger(<target>)`.
    struct PyBridge {
        level: Mutex<LevelFilter>,
        logging: Py<PyModule>,
        loggers: Mutex<HashMap<String, Py<PyAny>>>,
    }

    fn py_level(level: Level) -> u32 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyBridge {
        fn logger(&self, py: Python<'_>, target: &str) -> PyResult<Py<PyAny>> {
            let mut loggers = self
                .loggers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(logger) = loggers.get(target) {
                return Ok(logger.clone_ref(py));
            }
            let logger = self
                .logging
                .bind(py)
                .call_method1("getLogger", (target,))?
                .unbind();
            loggers.insert(target.to_string(), logger.clone_ref(py));
            Ok(logger)
        }

        fn current_level(&self) -> LevelFilter {
            *self
                .level
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }

    impl Log for PyBridge {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.current_level()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            let target = record.target().replace("::", ".");
            let message = record.args().to_string();
            Python::attach(|py| {
                let result = self.logger(py, &target).and_then(|logger| {
                    logger
                        .bind(py)
                        .call_method1("log", (py_level(record.level()), message))
                        .map(|_| ())
                });
                if let Err(e) = result {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    fn bridge(py: Python<'_>) -> PyResult<&'static PyBridge> {
        BRIDGE
            .get_or_try_init(|| {
                let bridge = PyBridge {
                    level: Mutex::new(env_level()),
                    logging: py.import("logging")?.unbind(),
                    loggers: Mutex::new(HashMap::new()),
                };
                let leaked: &'static PyBridge = Box::leak(Box::new(bridge));
                if log::set_logger(leaked).is_ok() {
                    log::set_max_level(leaked.current_level());
                }
                Ok::<_, PyErr>(leaked)
            })
            .copied()
    }

    /// Route crate logs into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        bridge(py).map(|_| ())
    }

    /// Change the forwarded level; `None` re-reads the environment.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        let level = level.and_then(super::parse_level).unwrap_or_else(env_level);
        let bridge = bridge(py)?;
        *bridge
            .level
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = level;
        bridge
            .loggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        log::set_max_level(level);
        Ok(())
    }
}
