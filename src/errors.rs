use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("command failed: {0}")]
    Command(String),
    #[error("device not ready: {0}")]
    NotReady(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("communication lost: {0}")]
    CommunicationLost(String),
    #[error("device is in use by proxy {owner}")]
    DeviceBusy { owner: u64 },
    #[error("critical device error: {0}")]
    Critical(String),
}

impl From<serde_json::Error> for DriverError {
    fn from(e: serde_json::Error) -> Self {
        DriverError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
