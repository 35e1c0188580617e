//! Metrics instrumentation for lattice-dns.
//!
//! All metrics are prefixed with `lattice_dns.`

use metrics::counter;

/// Count one inbound request.
pub fn record_request() {
    counter!("lattice_dns.requests").increment(1);
}

/// How a query was ultimately answered.
#[derive(Debug, Clone, Copy)]
pub enum QueryOutcome {
    /// Records were returned.
    Success,
    /// Authoritative name error.
    NxDomain,
    /// The name exists but carries no data of the queried type.
    NoData,
    /// The query was refused (ANY).
    Refused,
    /// Internal or upstream failure.
    ServFail,
}

/// Count a query by its outcome.
pub fn record_query_outcome(outcome: QueryOutcome) {
    let outcome_str = match outcome {
        QueryOutcome::Success => "success",
        QueryOutcome::NxDomain => "nxdomain",
        QueryOutcome::NoData => "nodata",
        QueryOutcome::Refused => "refused",
        QueryOutcome::ServFail => "servfail",
    };
    counter!("lattice_dns.responses", "outcome" => outcome_str).increment(1);
}

/// Count a response cache hit.
pub fn record_cache_hit() {
    counter!("lattice_dns.response_cache", "result" => "hit").increment(1);
}

/// Count a response cache miss.
pub fn record_cache_miss() {
    counter!("lattice_dns.response_cache", "result" => "miss").increment(1);
}

/// Count a signature that had to be computed rather than served from cache.
pub fn record_signature_cache_miss() {
    counter!("lattice_dns.signature_cache.miss").increment(1);
}

/// Count a query answered with the DO bit set.
pub fn record_dnssec_ok() {
    counter!("lattice_dns.dnssec_ok").increment(1);
}

/// Count a client query handed to the upstream pool.
pub fn record_forward() {
    counter!("lattice_dns.forward.requests").increment(1);
}

/// Count an internal lookup (glue, external CNAME tails).
pub fn record_lookup() {
    counter!("lattice_dns.forward.lookups").increment(1);
}

/// Count an exchange that piggybacked on an identical in-flight one.
pub fn record_forward_coalesced() {
    counter!("lattice_dns.forward.coalesced").increment(1);
}

/// Count a forward that failed across every upstream.
pub fn record_forward_exhausted() {
    counter!("lattice_dns.forward.exhausted").increment(1);
}
