//! Configuration types for lattice-dns.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DnsError;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// DNS server configuration.
    pub dns: DnsConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// DNS server configuration.
///
/// [`DnsConfig::prepare`] must run once before the config is handed to the
/// server: it canonicalises the domain, derives dependent fields and fills
/// the nameserver list from the OS resolver when none are given.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Address both listeners (UDP and TCP) bind.
    pub listen_addr: SocketAddr,

    /// The domain this server is authoritative for. Lower-cased and given a
    /// trailing dot during preparation.
    pub domain: String,

    /// Anchor segment all store paths hang off (`/skydns/…`).
    pub path_prefix: String,

    /// SOA mailbox. Defaults to `hostmaster.<domain>`; `@` becomes `.`.
    pub hostmaster: String,

    /// Upstream recursive resolvers for out-of-zone queries. Defaults to
    /// the OS resolver configuration.
    pub nameservers: Vec<SocketAddr>,

    /// Per-exchange read timeout, in seconds.
    pub read_timeout_secs: u64,

    /// Default record TTL when neither the store node nor the service
    /// carries one.
    pub ttl: u32,

    /// Authority TTL for NXDOMAIN and NODATA responses.
    pub min_ttl: u32,

    /// Default SRV priority when the record leaves it unset.
    pub priority: u16,

    /// Shuffle A/AAAA answers.
    pub round_robin: bool,

    /// Path to a PKCS#8 signing key. Signing and NSEC3 denial switch on
    /// when set.
    pub dnssec: Option<PathBuf>,

    /// Response cache capacity in resource records; zero disables it.
    pub response_cache_capacity: usize,

    /// Response cache TTL, in seconds.
    pub response_cache_ttl_secs: u64,

    /// Signature cache capacity in signatures.
    pub signature_cache_capacity: usize,

    /// Name substituted for `local.dns.<domain>` queries, for addressing
    /// "this" node.
    pub local_address: Option<String>,

    /// Identity answered for `id.server.`/`hostname.bind.` CHAOS queries.
    pub instance_id: String,

    /// JSON catalog loaded into the in-memory backend at startup.
    pub catalog: Option<PathBuf>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            domain: default_domain(),
            path_prefix: default_path_prefix(),
            hostmaster: String::new(),
            nameservers: Vec::new(),
            read_timeout_secs: default_read_timeout_secs(),
            ttl: default_ttl(),
            min_ttl: default_min_ttl(),
            priority: default_priority(),
            round_robin: true,
            dnssec: None,
            response_cache_capacity: 0,
            response_cache_ttl_secs: default_response_cache_ttl_secs(),
            signature_cache_capacity: default_signature_cache_capacity(),
            local_address: None,
            instance_id: default_instance_id(),
            catalog: None,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    "127.0.0.1:53".parse().expect("literal addr")
}

fn default_domain() -> String {
    "skydns.local.".to_string()
}

fn default_path_prefix() -> String {
    "skydns".to_string()
}

fn default_read_timeout_secs() -> u64 {
    2
}

fn default_ttl() -> u32 {
    3600
}

fn default_min_ttl() -> u32 {
    60
}

fn default_priority() -> u16 {
    10
}

fn default_response_cache_ttl_secs() -> u64 {
    60
}

fn default_signature_cache_capacity() -> usize {
    10_000
}

fn default_instance_id() -> String {
    "localhost".to_string()
}

impl DnsConfig {
    /// Validate and derive dependent fields. Idempotent.
    pub fn prepare(&mut self) -> Result<(), DnsError> {
        if self.domain.is_empty() {
            return Err(DnsError::Config("domain must not be empty".into()));
        }
        if self.read_timeout_secs == 0 {
            return Err(DnsError::Config("read_timeout_secs must be positive".into()));
        }
        if self.path_prefix.is_empty() || self.path_prefix.contains('/') {
            return Err(DnsError::Config(
                "path_prefix must be a single path segment".into(),
            ));
        }

        self.domain = fqdn(&self.domain.to_ascii_lowercase());

        if self.hostmaster.is_empty() {
            self.hostmaster = format!("hostmaster.{}", self.domain);
        }
        // SOA mailboxes cannot carry @-signs; publishers tend to write them
        // anyway.
        self.hostmaster = fqdn(&self.hostmaster.replace('@', ".").to_ascii_lowercase());

        if let Some(local) = &self.local_address {
            self.local_address = Some(fqdn(&local.to_ascii_lowercase()));
        }

        if self.nameservers.is_empty() {
            self.nameservers = system_nameservers()?;
        }
        Ok(())
    }

    /// The per-exchange read timeout as a [`Duration`].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// The response cache TTL as a [`Duration`].
    pub fn response_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.response_cache_ttl_secs)
    }
}

/// Append the trailing dot when missing.
fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Upstreams from the OS resolver configuration.
fn system_nameservers() -> Result<Vec<SocketAddr>, DnsError> {
    let (resolver_config, _) = hickory_resolver::system_conf::read_system_conf()
        .map_err(|e| DnsError::Config(format!("cannot read system resolver config: {e}")))?;
    let mut upstreams: Vec<SocketAddr> = Vec::new();
    for ns in resolver_config.name_servers() {
        if !upstreams.contains(&ns.socket_addr) {
            upstreams.push(ns.socket_addr);
        }
    }
    Ok(upstreams)
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "lattice_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
