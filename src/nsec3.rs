//! NSEC3 white lies for authenticated denial (RFC 7129, appendix B).
//!
//! The closest encloser is always the authoritative domain itself and the
//! wildcard to deny is always `*.<domain>`, so both of those NSEC3 records
//! are computed once at startup. Per query we only synthesise the record
//! covering the hashed qname: its owner is one below `H(qname)` and its
//! next-hash one above, produced by byte-wise ±1 over the SHA-1 digest.

use data_encoding::BASE32_DNSSEC;
use hickory_proto::dnssec::rdata::{DNSSECRData, NSEC3};
use hickory_proto::dnssec::Nsec3HashAlgorithm;
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::ProtoError;

/// The two static denial records: the closest encloser covering the domain
/// and the denial of `*.<domain>`.
#[derive(Debug, Clone)]
pub struct StaticDenial {
    /// NSEC3 whose owner is the hashed apex, proving the closest encloser.
    pub closest_encloser: Record,
    /// NSEC3 covering the hash of `*.<domain>`.
    pub deny_wildcard: Record,
}

impl StaticDenial {
    /// Precompute both records for `domain` with the given authority TTL.
    pub fn new(domain: &Name, ttl: u32) -> Result<Self, ProtoError> {
        let apex_hash = hash_name(domain)?;
        let mut next = apex_hash.clone();
        byte_arith(&mut next, true);
        let closest_encloser = nsec3_record(
            owner_name(&apex_hash, domain)?,
            ttl,
            next,
            vec![
                RecordType::A,
                RecordType::NS,
                RecordType::SOA,
                RecordType::AAAA,
                RecordType::RRSIG,
                RecordType::DNSKEY,
            ],
        );

        let wildcard = Name::from_ascii("*").and_then(|w| w.append_domain(domain))?;
        let mut buf = hash_name(&wildcard)?;
        byte_arith(&mut buf, false);
        let owner = owner_name(&buf, domain)?;
        byte_arith(&mut buf, true);
        byte_arith(&mut buf, true);
        let deny_wildcard = nsec3_record(owner, ttl, buf, Vec::new());

        Ok(Self {
            closest_encloser,
            deny_wildcard,
        })
    }
}

/// NSEC3 covering a non-existent qname: owner one hash below, next one above.
pub fn name_error(qname: &Name, domain: &Name, ttl: u32) -> Result<Record, ProtoError> {
    let mut buf = hash_name(qname)?;
    byte_arith(&mut buf, false);
    let owner = owner_name(&buf, domain)?;
    byte_arith(&mut buf, true);
    byte_arith(&mut buf, true);
    Ok(nsec3_record(owner, ttl, buf, Vec::new()))
}

/// NSEC3 for an existing qname with no data of the queried type: owner is
/// the hash itself, bitmap empty.
pub fn no_data(qname: &Name, domain: &Name, ttl: u32) -> Result<Record, ProtoError> {
    let hash = hash_name(qname)?;
    let owner = owner_name(&hash, domain)?;
    let mut next = hash;
    byte_arith(&mut next, true);
    Ok(nsec3_record(owner, ttl, next, Vec::new()))
}

/// SHA-1 NSEC3 hash with zero iterations and an empty salt.
fn hash_name(name: &Name) -> Result<Vec<u8>, ProtoError> {
    let digest = Nsec3HashAlgorithm::SHA1.hash(&[], name, 0)?;
    Ok(digest.as_ref().to_vec())
}

/// `<base32hex(hash)>.<domain>`, lower case.
fn owner_name(hash: &[u8], domain: &Name) -> Result<Name, ProtoError> {
    Name::from_ascii(BASE32_DNSSEC.encode(hash))?.append_domain(domain)
}

fn nsec3_record(owner: Name, ttl: u32, next_hashed: Vec<u8>, types: Vec<RecordType>) -> Record {
    let rdata = NSEC3::new(
        Nsec3HashAlgorithm::SHA1,
        false,
        0,
        Vec::new(),
        next_hashed,
        types,
    );
    let mut record = Record::from_rdata(owner, ttl, RData::DNSSEC(DNSSECRData::NSEC3(rdata)));
    record.set_dns_class(DNSClass::IN);
    record
}

/// Add or subtract one over the digest, treated as a fixed-width big-endian
/// integer. Under- and overflow wrap; they cannot occur for SHA-1 output in
/// practice.
fn byte_arith(buf: &mut [u8], up: bool) {
    if up {
        for b in buf.iter_mut().rev() {
            if *b == 255 {
                *b = 0;
                continue;
            }
            *b += 1;
            return;
        }
    } else {
        for b in buf.iter_mut().rev() {
            if *b == 0 {
                *b = 255;
                continue;
            }
            *b -= 1;
            return;
        }
    }
}
