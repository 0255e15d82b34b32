//! Master server announcements.

use crate::config::MAX_MASTERS;
use log::{info, warn};
use shared::PORT_MASTER;
use std::net::{IpAddr, SocketAddr};

/// Milliseconds between heartbeats.
pub const HEARTBEAT_MSEC: u64 = 300_000;

/// Resolved master addresses plus the settings they came from.
#[derive(Debug, Default)]
pub struct MasterList {
    settings: [String; MAX_MASTERS],
    addresses: [Option<SocketAddr>; MAX_MASTERS],
    modified: bool,
}

impl MasterList {
    pub fn new(settings: [String; MAX_MASTERS]) -> Self {
        Self {
            settings,
            addresses: [None; MAX_MASTERS],
            modified: true,
        }
    }

    /// Changes one master setting; takes effect on the next frame.
    pub fn set(&mut self, index: usize, value: &str) -> bool {
        match self.settings.get_mut(index) {
            Some(slot) => {
                *slot = value.to_string();
                self.modified = true;
                true
            }
            None => false,
        }
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    pub fn addresses(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addresses.iter().flatten().copied()
    }

    pub fn settings(&self) -> &[String] {
        &self.settings
    }

    /// Replaces every setting with `values`, in order; slots past the end
    /// are cleared.
    pub fn replace_all(&mut self, values: &[String]) {
        for (index, slot) in self.settings.iter_mut().enumerate() {
            *slot = values.get(index).cloned().unwrap_or_default();
        }
        self.modified = true;
    }

    /// Re-parses every setting. Returns the addresses that parsed.
    pub fn resolve(&mut self) -> Vec<SocketAddr> {
        self.modified = false;
        for (setting, address) in self.settings.iter().zip(self.addresses.iter_mut()) {
            *address = None;
            if setting.is_empty() {
                continue;
            }
            match parse_master(setting) {
                Some(resolved) => {
                    info!("Master server at {}", resolved);
                    *address = Some(resolved);
                }
                None => warn!("Bad master address: {}", setting),
            }
        }
        self.addresses().collect()
    }
}

/// Parses a literal `ip[:port]`, defaulting to the master port.
///
/// This runs inside the frame, so it never touches DNS; host names are
/// turned into addresses up front by [`lookup_masters`].
pub fn parse_master(setting: &str) -> Option<SocketAddr> {
    if let Ok(address) = setting.parse::<SocketAddr>() {
        return Some(address);
    }
    setting
        .parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, PORT_MASTER))
}

/// Looks up every host name setting and replaces it with its first
/// address. Settings that do not resolve are cleared.
pub async fn lookup_masters(settings: &mut [String]) {
    for setting in settings.iter_mut() {
        if setting.is_empty() || parse_master(setting).is_some() {
            continue;
        }
        let host = if setting.contains(':') {
            setting.clone()
        } else {
            format!("{}:{}", setting, PORT_MASTER)
        };
        match tokio::net::lookup_host(host).await.map(|mut found| found.next()) {
            Ok(Some(address)) => {
                info!("Master {} resolved to {}", setting, address);
                *setting = address.to_string();
            }
            Ok(None) => {
                warn!("Master {} has no address", setting);
                setting.clear();
            }
            Err(e) => {
                warn!("Can't resolve master {}: {}", setting, e);
                setting.clear();
            }
        }
    }
}
