//! One physical device shared by several host-side proxies.
//!
//! Only one proxy may drive a device at a time. The others get
//! [`DriverError::DeviceBusy`] until the owner disconnects.

use std::time::Instant;

use log::info;

use crate::errors::{DriverError, Result};
use crate::session::Session;

pub type ProxyId = u64;

pub struct PhysicalDevice {
    name: String,
    session: Session,
    owner: Option<ProxyId>,
}

impl PhysicalDevice {
    pub fn new(name: impl Into<String>, session: Session) -> Self {
        Self {
            name: name.into(),
            session,
            owner: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<ProxyId> {
        self.owner
    }

    /// Claim the device. Reconnecting the current owner is a no-op.
    pub fn connect(&mut self, proxy: ProxyId) -> Result<()> {
        match self.owner {
            Some(owner) if owner != proxy => Err(DriverError::DeviceBusy { owner }),
            Some(_) => Ok(()),
            None => {
                info!("{}: connected to proxy {}", self.name, proxy);
                self.owner = Some(proxy);
                Ok(())
            }
        }
    }

    /// Release the device, stopping any sampling the owner left running.
    /// Returns false if `proxy` was not the owner.
    pub fn disconnect(&mut self, proxy: ProxyId) -> bool {
        if self.owner != Some(proxy) {
            return false;
        }
        self.session.stop_sampling();
        self.owner = None;
        info!("{}: proxy {} disconnected", self.name, proxy);
        true
    }

    /// Session access for the owning proxy.
    pub fn session(&mut self, proxy: ProxyId) -> Result<&mut Session> {
        match self.owner {
            Some(owner) if owner == proxy => Ok(&mut self.session),
            Some(owner) => Err(DriverError::DeviceBusy { owner }),
            None => Err(DriverError::NotReady(format!(
                "{} has no connected proxy",
                self.name
            ))),
        }
    }

    /// Bytes from the transport go to the session whoever owns it.
    pub fn on_bytes(&mut self, bytes: &[u8]) {
        self.session.on_bytes(bytes);
    }

    pub fn poll(&mut self, now: Instant) {
        self.session.poll(now);
    }
}
