//! Relay Configuration

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Inbound UDP listen address
    pub listen_addr: SocketAddrV4,
    /// Downstream RADIUS server
    pub dest_addr: SocketAddrV4,
    /// Number of raw-socket writers
    pub writers: usize,
    /// In-flight packets per writer
    pub queue_depth: usize,
    /// Metrics/health HTTP listen address
    pub metrics_addr: SocketAddr,
    /// Rate limiting
    pub limits: LimitConfig,
}

/// Token-bucket sizing and lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Seconds between bucket refills
    pub refill_secs: u64,
    /// Refill ticks before an idle bucket is dropped
    pub unused_ticks: u32,
    /// Tokens gained per refill, per user bucket
    pub user_fill: i32,
    /// Token cap per user bucket
    pub user_max: i32,
    /// Tokens gained per refill, per NAS-port bucket
    pub port_fill: i32,
    /// Token cap per NAS-port bucket
    pub port_max: i32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 1812),
            dest_addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 11812),
            writers: 1,
            queue_depth: 16,
            metrics_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 8080)),
            limits: LimitConfig::default(),
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            refill_secs: 60,
            unused_ticks: 5,
            user_fill: 5,
            user_max: 10,
            port_fill: 5,
            port_max: 10,
        }
    }
}

impl RelayConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to a JSON file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}
