//! Sharded Rate-Limit Selector
//!
//! Decides, per inbound datagram, whether it must be forwarded downstream.
//! Only Access-Request messages are filtered; the verdict comes from
//! per-user and per-NAS-port token buckets spread over 256 shards per kind,
//! routed by the low byte of an FNV-1a fingerprint.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::cache::{Cache, Sizer};
use crate::error::{RelayError, RelayResult};
use crate::radius::{AttrType, Code, Packet};
use crate::stats::Metrics;

/// Number of cache shards per keyed dimension
pub const SHARD_COUNT: usize = 256;

/// Forward/drop decision for one datagram.
///
/// An `Err` means the payload could not be inspected; callers are expected
/// to forward anyway — the relay's purpose is availability, not strict
/// filtering.
pub trait Selector: Send + Sync {
    fn select(&self, src: Ipv4Addr, payload: &[u8]) -> Result<bool, RelayError>;
}

/// Selector backed by two 256-way sharded token-bucket caches.
pub struct ShardedSelector {
    users: Vec<Cache>,
    ports: Vec<Cache>,
}

impl ShardedSelector {
    /// Build both shard arrays. Buckets refill every `rate` and are evicted
    /// after more than `unused_ticks` idle refills; sizes come from the
    /// per-kind sizers.
    pub fn new(
        rate: Duration,
        unused_ticks: u32,
        user_sizer: Sizer,
        port_sizer: Sizer,
        metrics: &Metrics,
    ) -> RelayResult<Self> {
        let mut users = Vec::with_capacity(SHARD_COUNT);
        let mut ports = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            users.push(Cache::new(
                "users",
                rate,
                unused_ticks,
                user_sizer.clone(),
                metrics.users.clone(),
            )?);
            ports.push(Cache::new(
                "ports",
                rate,
                unused_ticks,
                port_sizer.clone(),
                metrics.ports.clone(),
            )?);
        }
        Ok(Self { users, ports })
    }

    /// Stop the refill sweepers of every shard
    pub fn stop(&mut self) {
        for cache in self.users.iter_mut().chain(self.ports.iter_mut()) {
            cache.stop();
        }
    }

    /// Probe the shard behind `key ‖ src`, spending one token
    fn check(shards: &[Cache], src: Ipv4Addr, key: &[u8]) -> bool {
        let fp = fingerprint(key, src);
        shards[(fp & 0xff) as usize].check(src, fp, 1)
    }
}

impl Selector for ShardedSelector {
    fn select(&self, src: Ipv4Addr, payload: &[u8]) -> Result<bool, RelayError> {
        let packet = Packet::parse(payload)?;
        // Only Access-Requests are filtered.
        if packet.code != Code::ACCESS_REQUEST {
            return Ok(true);
        }

        let mut user: Option<&[u8]> = None;
        let mut port: Option<&[u8]> = None;
        for (attr, value) in packet.attributes() {
            match attr {
                AttrType::USER_NAME => user = Some(value),
                AttrType::NAS_PORT => {
                    // A lone 0x00 or ASCII '0' means "no port"; never key on it.
                    if !matches!(value, [0x00] | [b'0']) {
                        port = Some(value);
                    }
                }
                // Continuation of a challenge exchange, never filtered.
                AttrType::STATE => return Ok(true),
                _ => {}
            }
        }

        if let Some(user) = user {
            if !Self::check(&self.users, src, user) {
                return Ok(false);
            }
        }
        if let Some(port) = port {
            return Ok(Self::check(&self.ports, src, port));
        }
        Ok(true)
    }
}

/// FNV-1a 64 over `key ‖ 0xFFFF ‖ src`; the low byte doubles as the shard
/// index.
fn fingerprint(key: &[u8], src: Ipv4Addr) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let octets = src.octets();
    let mut h = FNV_OFFSET;
    for b in key.iter().chain(&[0xff, 0xff]).chain(&octets) {
        h ^= u64::from(*b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}
