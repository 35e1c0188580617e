//! Error types for lattice-dns.

use hickory_proto::rr::Name;
use thiserror::Error;

/// Errors that can occur while setting up or running the DNS server.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (socket bind, key file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Proto(#[from] hickory_proto::ProtoError),

    /// DNSSEC key material could not be loaded or used
    #[error("DNSSEC error: {0}")]
    Dnssec(String),
}

/// Errors surfaced by a [`Backend`](crate::backend::Backend) implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The path does not exist in the store.
    #[error("name not found in the store")]
    NotFound,

    /// The store is unreachable.
    #[error("store unreachable: {0}")]
    Transport(String),

    /// A leaf payload is not a valid service record.
    #[error("malformed service record: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of recursive record resolution inside the query pipeline.
///
/// CNAME chasing keeps its partial chain on failure so the caller can decide
/// whether to splice an external lookup onto it or drop it entirely.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The backend failed underneath the resolution.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A CNAME target was already emitted earlier in this resolution.
    #[error("CNAME loop detected for {target}")]
    CnameLoop {
        /// The target that closed the cycle.
        target: Name,
    },

    /// The chain exceeded the lookup depth limit of 8.
    #[error("CNAME lookup limit of 8 exceeded at {target}")]
    CnameLimitExceeded {
        /// The target that would have exceeded the limit.
        target: Name,
    },

    /// The chain left the authoritative domain and could not be completed
    /// internally. Carries the partial chain so the pipeline can try an
    /// external lookup for its terminal target.
    #[error("incomplete CNAME chain")]
    IncompleteChain {
        /// The partial chain, ending in the external CNAME.
        records: Vec<hickory_proto::rr::Record>,
    },
}

/// Errors from the forwarding client.
///
/// Cloneable so a single failed exchange can be fanned out to every caller
/// coalesced onto it.
#[derive(Debug, Clone, Error)]
pub enum ForwardError {
    /// No upstream nameservers are configured.
    #[error("no nameservers configured, can not forward")]
    NoUpstreams,

    /// Every configured upstream failed or timed out.
    #[error("failure to forward request after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Number of exchanges attempted.
        attempts: usize,
        /// The last transport error observed.
        last_error: String,
    },

    /// The upstream answered with a non-success rcode.
    #[error("upstream returned rcode {0}")]
    Rcode(hickory_proto::op::ResponseCode),
}
