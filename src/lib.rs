//! Source-Preserving RADIUS Relay
//!
//! UDP relay that forwards RADIUS authentication traffic to a downstream
//! server while applying per-user and per-NAS-port rate limiting. Forwarded
//! datagrams are re-emitted through a raw IPv4 socket with a forged header
//! carrying the original client's source address, so the downstream server
//! sees packets as if the client had sent them directly.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────── one pipe per writer ────────────┐
//!                       │                                             │
//!  ┌──────────┐  free   │  ┌────────┐  tasks   ┌─────────────────┐    │
//!  │   UDP    │  list   │  │ Reader │ ───────► │ Worker × Q      │    │
//!  │ listener │ ──────► │  │        │          │  parse RADIUS   │    │
//!  └──────────┘         │  └────────┘          │  check buckets  │    │
//!                       │      ▲               │  forge headers  │    │
//!                       │      │    buffers    └────────┬────────┘    │
//!                       │      └────────────────────────┘             │
//!                       │                               │ IPv4 frames │
//!                       └───────────────────────────────┼─────────────┘
//!                                                       ▼
//!                                               ┌───────────────┐
//!                                               │  raw socket   │
//!                                               │ (IP_HDRINCL)  │
//!                                               └───────────────┘
//! ```
//!
//! A fixed pool of `Q` buffers bounds memory and concurrency per writer; a
//! buffer travels free list → reader → worker → free list and is never
//! shared. Rate limiting runs over 256 token-bucket cache shards per keyed
//! dimension (user, NAS port), each refilled and aged by its own background
//! sweep.
//!
//! The relay is deliberately one-way and IPv4-only, and its failure bias is
//! availability: whatever cannot be inspected is forwarded.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod radius;
pub mod selector;
pub mod sink;
pub mod stats;

pub use buffer::{PacketBuffer, MAX_PACKET_SIZE};
pub use cache::{fixed_sizer, Cache, Sizer};
pub use config::{LimitConfig, RelayConfig};
pub use dispatch::{Dispatcher, FrameWriter, PacketSource};
pub use error::{RelayError, RelayResult};
pub use radius::{AttrType, Code, Packet};
pub use selector::{Selector, ShardedSelector, SHARD_COUNT};
pub use sink::RawSocket;
pub use stats::Metrics;
