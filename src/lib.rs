//! lattice-dns - An authoritative DNS server backed by a hierarchical
//! key/value store.
//!
//! Publishers write JSON service records under reversed-domain paths in the
//! store; this crate translates DNS questions into store reads and
//! synthesises SRV, A/AAAA, CNAME, PTR, NS, SOA, TXT and DNSKEY answers
//! from what it finds, honouring DNS semantics along the way (NXDOMAIN,
//! NODATA, CNAME chasing, wildcards, EDNS0, truncation).
//!
//! ## Features
//!
//! - SRV synthesis with per-priority weight renormalisation
//! - Wildcard queries (`*` matches any single label) and subtree expansion
//! - Bounded LRU response cache and signature cache
//! - Stub forwarding to upstream resolvers with failover and single-flight
//!   deduplication
//! - Online DNSSEC signing with NSEC3 white-lie denial
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          lattice-dns                             │
//! │                                                                  │
//! │   UDP/TCP :53 ──▶ ServiceHandler ──▶ Backend (store reads)       │
//! │                     │    │    │                                  │
//! │                     │    │    └──▶ Forwarder ──▶ upstreams       │
//! │                     │    └──▶ ResponseCache (LRU)                │
//! │                     └──▶ ZoneSigner ──▶ SignatureCache (LRU)     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Store layout
//!
//! ```text
//! a.b.skydns.local.  →  /skydns/local/skydns/b/a
//!   → leaf holds {"host": …, "port": …, "priority": …, "weight": …}
//!   → directories expand to every leaf beneath them
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lattice_dns::{DnsConfig, DnsServer, MemoryBackend};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = DnsConfig {
//!         listen_addr: "127.0.0.1:5353".parse().unwrap(),
//!         domain: "skydns.local.".to_string(),
//!         ..Default::default()
//!     };
//!     config.prepare().unwrap();
//!
//!     let backend = Arc::new(MemoryBackend::new("skydns", config.ttl, config.priority));
//!     let server = DnsServer::new(config, backend);
//!     server.run(CancellationToken::new()).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod forward;
pub mod handler;
pub mod metrics;
pub mod nsec3;
pub mod path;
pub mod server;
pub mod service;
pub mod sign;
pub mod telemetry;

// Re-export main types
pub use backend::{Backend, MemoryBackend};
pub use config::{Config, DnsConfig, TelemetryConfig};
pub use error::{BackendError, DnsError, ForwardError};
pub use handler::ServiceHandler;
pub use server::{BoundSockets, DnsServer};
pub use service::Service;
