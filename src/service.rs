//! Service records as published in the store.
//!
//! A service is the rdata of an SRV record with a twist: `host` must be a
//! domain name, but when it parses as an IPv4/IPv6 literal it is treated as
//! an address and the pipeline synthesises the owner name from the store
//! path instead.

use std::net::IpAddr;
use std::str::FromStr;

use hickory_proto::rr::rdata::{A, AAAA, CNAME, NS, PTR, SRV, TXT};
use hickory_proto::rr::{DNSClass, Name, RData, Record};
use serde::{Deserialize, Serialize};

/// Maximum length of a single DNS character-string inside a TXT record.
const TXT_CHUNK: usize = 255;

/// One service endpoint as stored at a single leaf in the backend.
///
/// All fields are optional in the JSON payload; unknown fields are ignored.
/// `ttl` and `key` are filled in by the backend at read time: `ttl` becomes
/// the effective TTL (see [`effective_ttl`]) and `key` the store path the
/// record was read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    /// Target name or IP literal (v4 or v6).
    pub host: String,
    /// Port for SRV synthesis.
    pub port: u16,
    /// SRV priority; zero means "use the configured default".
    pub priority: u16,
    /// SRV weight; zero means "unset" and is renormalised as 100.
    pub weight: u16,
    /// Record TTL in seconds; zero means "fall through".
    pub ttl: u32,
    /// TXT payload.
    pub text: String,
    /// Grouping tag, opaque to the server.
    pub group: String,

    /// Store path this record was read from. Derived, never serialised.
    #[serde(skip)]
    pub key: String,
}

impl Service {
    /// The host parsed as an IP literal, if it is one.
    pub fn ip(&self) -> Option<IpAddr> {
        IpAddr::from_str(&self.host).ok()
    }

    /// The identity used for deduplication during subtree enumeration.
    pub fn dedup_key(&self) -> (String, u16, u16, u16) {
        (
            self.host.to_ascii_lowercase(),
            self.port,
            self.priority,
            self.weight,
        )
    }

    /// Build an A record owned by `name`.
    pub fn new_a(&self, name: Name, addr: std::net::Ipv4Addr) -> Record {
        in_record(name, self.ttl, RData::A(A(addr)))
    }

    /// Build an AAAA record owned by `name`.
    pub fn new_aaaa(&self, name: Name, addr: std::net::Ipv6Addr) -> Record {
        in_record(name, self.ttl, RData::AAAA(AAAA(addr)))
    }

    /// Build a CNAME from `name` to `target`.
    pub fn new_cname(&self, name: Name, target: Name) -> Record {
        in_record(name, self.ttl, RData::CNAME(CNAME(target)))
    }

    /// Build an SRV owned by `name` with the given (renormalised) weight.
    pub fn new_srv(&self, name: Name, target: Name, weight: u16) -> Record {
        in_record(
            name,
            self.ttl,
            RData::SRV(SRV::new(self.priority, weight, self.port, target)),
        )
    }

    /// Build a TXT record carrying `text` split into 255-byte chunks.
    pub fn new_txt(&self, name: Name) -> Record {
        in_record(name, self.ttl, RData::TXT(TXT::new(split_txt(&self.text))))
    }

    /// Build a PTR from `name` to the service host.
    pub fn new_ptr(&self, name: Name, target: Name, ttl: u32) -> Record {
        in_record(name, ttl, RData::PTR(PTR(target)))
    }

    /// Build an NS record owned by `name` delegating to `target`.
    pub fn new_ns(&self, name: Name, target: Name) -> Record {
        in_record(name, self.ttl, RData::NS(NS(target)))
    }
}

fn in_record(name: Name, ttl: u32, rdata: RData) -> Record {
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);
    record
}

/// Effective TTL of a record: the smaller of the store node TTL and the
/// service TTL, with zero meaning "unset" and the configured default as the
/// fallback when both are unset.
pub fn effective_ttl(node_ttl: u32, service_ttl: u32, default_ttl: u32) -> u32 {
    match (node_ttl, service_ttl) {
        (0, 0) => default_ttl,
        (0, s) => s,
        (n, 0) => n,
        (n, s) => n.min(s),
    }
}

/// Split a TXT payload into DNS character-strings of at most 255 bytes.
fn split_txt(text: &str) -> Vec<String> {
    let mut chunks = Vec::with_capacity(text.len() / TXT_CHUNK + 1);
    let mut rest = text;
    while rest.len() > TXT_CHUNK {
        // Back off to a char boundary so each chunk stays valid UTF-8.
        let mut at = TXT_CHUNK;
        while !rest.is_char_boundary(at) {
            at -= 1;
        }
        let (chunk, tail) = rest.split_at(at);
        chunks.push(chunk.to_string());
        rest = tail;
    }
    chunks.push(rest.to_string());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let svc: Service =
            serde_json::from_str(r#"{"host":"10.0.0.1","port":8080,"comment":"ignored"}"#).unwrap();
        assert_eq!(svc.host, "10.0.0.1");
        assert_eq!(svc.port, 8080);
        assert_eq!(svc.priority, 0);
    }

    #[test]
    fn test_decode_all_fields_optional() {
        let svc: Service = serde_json::from_str("{}").unwrap();
        assert_eq!(svc, Service::default());
    }

    #[test]
    fn test_ip_detection() {
        let v4 = Service {
            host: "10.0.0.1".into(),
            ..Default::default()
        };
        let v6 = Service {
            host: "2001:db8::1".into(),
            ..Default::default()
        };
        let name = Service {
            host: "server1.example.com".into(),
            ..Default::default()
        };
        assert!(matches!(v4.ip(), Some(IpAddr::V4(_))));
        assert!(matches!(v6.ip(), Some(IpAddr::V6(_))));
        assert!(name.ip().is_none());
    }

    #[test]
    fn test_effective_ttl() {
        assert_eq!(effective_ttl(0, 0, 3600), 3600);
        assert_eq!(effective_ttl(0, 120, 3600), 120);
        assert_eq!(effective_ttl(30, 0, 3600), 30);
        assert_eq!(effective_ttl(30, 120, 3600), 30);
        assert_eq!(effective_ttl(120, 30, 3600), 30);
    }

    #[test]
    fn test_split_txt_short() {
        assert_eq!(split_txt("hello"), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_txt_chunks_at_255() {
        let long = "x".repeat(600);
        let chunks = split_txt(&long);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 255);
        assert_eq!(chunks[1].len(), 255);
        assert_eq!(chunks[2].len(), 90);
    }

    #[test]
    fn test_dedup_key_folds_case() {
        let a = Service {
            host: "Server1".into(),
            port: 80,
            ..Default::default()
        };
        let b = Service {
            host: "server1".into(),
            port: 80,
            ..Default::default()
        };
        assert_eq!(a.dedup_key(), b.dedup_key());
    }
}
