//! Online DNSSEC signing.
//!
//! Signatures are generated per RRset on demand and remembered in the
//! signature cache keyed by RRset content, so a busy name is signed once per
//! signature window rather than once per query. Inception is rounded down to
//! the hour and expiration sits seven days out, which keeps the cache key
//! stable across queries inside the same hour.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hickory_proto::dnssec::rdata::{DNSSECRData, DNSKEY, RRSIG};
use hickory_proto::dnssec::crypto::{EcdsaSigningKey, Ed25519SigningKey, RsaSigningKey};
use hickory_proto::dnssec::{Algorithm, SigSigner, SigningKey, TBS};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use rustls_pki_types::PrivatePkcs8KeyDer;
use tracing::{debug, warn};

use crate::cache::{rrset_key, SignatureCache};
use crate::error::DnsError;
use crate::metrics;

/// Signature validity window: seven days from now.
const SIG_VALIDITY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Key material and signature cache for one authoritative zone.
pub struct ZoneSigner {
    signer: SigSigner,
    dnskey: Record,
    key_tag: u16,
    algorithm: Algorithm,
    domain: Name,
    cache: SignatureCache,
}

impl ZoneSigner {
    /// Load a PKCS#8 signing key and derive the zone DNSKEY from it.
    ///
    /// The algorithm is whatever the key material declares: Ed25519, ECDSA
    /// P-256 or RSA/SHA-256 are attempted in that order.
    pub fn from_pkcs8(
        der: &[u8],
        domain: Name,
        dnskey_ttl: u32,
        cache_capacity: usize,
    ) -> Result<Self, DnsError> {
        let (key, algorithm) = load_signing_key(der)?;
        let public = key
            .to_public_key()
            .map_err(|e| DnsError::Dnssec(format!("cannot derive public key: {e}")))?;
        let dnskey_rdata = DNSKEY::from_key(&public);
        let key_tag = dnskey_rdata
            .calculate_key_tag()
            .map_err(|e| DnsError::Dnssec(format!("cannot compute key tag: {e}")))?;

        let mut dnskey = Record::from_rdata(
            domain.clone(),
            dnskey_ttl,
            RData::DNSSEC(DNSSECRData::DNSKEY(dnskey_rdata.clone())),
        );
        dnskey.set_dns_class(DNSClass::IN);

        let signer = SigSigner::dnssec(dnskey_rdata, key, domain.clone(), SIG_VALIDITY);

        Ok(Self {
            signer,
            dnskey,
            key_tag,
            algorithm,
            domain,
            cache: SignatureCache::new(cache_capacity),
        })
    }

    /// The zone DNSKEY record served for apex DNSKEY queries.
    pub fn dnskey(&self) -> &Record {
        &self.dnskey
    }

    /// The key tag of the zone key.
    pub fn key_tag(&self) -> u16 {
        self.key_tag
    }

    /// Number of cached signatures, for introspection in tests.
    pub fn cached_signatures(&self) -> usize {
        self.cache.len()
    }

    /// Sign every RRset in `records`, appending the RRSIGs in place.
    ///
    /// OPT and pre-existing RRSIG records are left unsigned. RRsets that
    /// fail to sign are answered unsigned rather than dropped.
    pub fn sign_section(&self, records: &mut Vec<Record>) {
        let mut rrsets: BTreeMap<(String, RecordType), Vec<Record>> = BTreeMap::new();
        for record in records.iter() {
            match record.record_type() {
                RecordType::OPT | RecordType::RRSIG => continue,
                rtype => rrsets
                    .entry((record.name().to_ascii().to_ascii_lowercase(), rtype))
                    .or_default()
                    .push(record.clone()),
            }
        }

        for rrset in rrsets.values() {
            match self.rrsig(rrset) {
                Ok(sig) => records.push(sig),
                Err(err) => {
                    warn!(
                        name = %rrset[0].name(),
                        rtype = ?rrset[0].record_type(),
                        %err,
                        "failed to sign RRset"
                    );
                }
            }
        }
    }

    /// Produce the RRSIG for one RRset, consulting the signature cache.
    fn rrsig(&self, rrset: &[Record]) -> Result<Record, DnsError> {
        let key = rrset_key(rrset);
        if let Some(sig) = self.cache.search(&key) {
            return Ok(sig);
        }
        metrics::record_signature_cache_miss();
        debug!(name = %rrset[0].name(), rtype = ?rrset[0].record_type(), "signing RRset");

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0) as u32;
        let inception = now - now % 3600;
        let expiration = now.wrapping_add(SIG_VALIDITY.as_secs() as u32);

        let first = &rrset[0];
        let rrsig_rdata = RRSIG::new(
            first.record_type(),
            self.algorithm,
            first.name().num_labels(),
            first.ttl(),
            expiration,
            inception,
            self.key_tag,
            self.domain.clone(),
            Vec::new(),
        );
        let mut template =
            Record::<RRSIG>::from_rdata(first.name().clone(), first.ttl(), rrsig_rdata.clone());
        template.set_dns_class(first.dns_class());

        let tbs = TBS::from_rrsig(&template, rrset.iter())
            .map_err(|e| DnsError::Dnssec(format!("cannot serialise RRset: {e}")))?;
        let signature = self
            .signer
            .sign(&tbs)
            .map_err(|e| DnsError::Dnssec(format!("signing failed: {e}")))?;

        let signed_rdata = RRSIG::new(
            first.record_type(),
            self.algorithm,
            first.name().num_labels(),
            first.ttl(),
            expiration,
            inception,
            self.key_tag,
            self.domain.clone(),
            signature,
        );
        let mut sig = Record::from_rdata(
            first.name().clone(),
            first.ttl(),
            RData::DNSSEC(DNSSECRData::RRSIG(signed_rdata)),
        );
        sig.set_dns_class(first.dns_class());

        self.cache.insert(key, sig.clone(), expiration);
        Ok(sig)
    }
}

fn load_signing_key(der: &[u8]) -> Result<(Box<dyn SigningKey>, Algorithm), DnsError> {
    let der = PrivatePkcs8KeyDer::from(der);
    if let Ok(key) = Ed25519SigningKey::from_pkcs8(&der) {
        return Ok((Box::new(key), Algorithm::ED25519));
    }
    if let Ok(key) = EcdsaSigningKey::from_pkcs8(&der, Algorithm::ECDSAP256SHA256) {
        return Ok((Box::new(key), Algorithm::ECDSAP256SHA256));
    }
    match RsaSigningKey::from_pkcs8(&der, Algorithm::RSASHA256) {
        Ok(key) => Ok((Box::new(key), Algorithm::RSASHA256)),
        Err(err) => Err(DnsError::Dnssec(format!(
            "unsupported signing key material: {err}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use std::str::FromStr;

    fn signer() -> ZoneSigner {
        let der = EcdsaSigningKey::generate_pkcs8(Algorithm::ECDSAP256SHA256)
            .expect("generate test key");
        ZoneSigner::from_pkcs8(
            der.secret_pkcs8_der(),
            Name::from_str("skydns.test.").unwrap(),
            3600,
            100,
        )
        .expect("signer from generated key")
    }

    fn a_record(name: &str, octet: u8) -> Record {
        let mut r = Record::from_rdata(
            Name::from_str(name).unwrap(),
            3600,
            RData::A(A(std::net::Ipv4Addr::new(10, 0, 0, octet))),
        );
        r.set_dns_class(DNSClass::IN);
        r
    }

    #[test]
    fn test_sign_section_appends_one_rrsig_per_rrset() {
        let s = signer();
        let mut section = vec![
            a_record("a.skydns.test.", 1),
            a_record("a.skydns.test.", 2),
            a_record("b.skydns.test.", 3),
        ];
        s.sign_section(&mut section);

        let sigs: Vec<_> = section
            .iter()
            .filter(|r| r.record_type() == RecordType::RRSIG)
            .collect();
        assert_eq!(sigs.len(), 2);
    }

    #[test]
    fn test_signature_is_cached_by_content() {
        let s = signer();
        let mut first = vec![a_record("a.skydns.test.", 1)];
        s.sign_section(&mut first);
        assert_eq!(s.cached_signatures(), 1);

        let mut second = vec![a_record("a.skydns.test.", 1)];
        s.sign_section(&mut second);
        assert_eq!(s.cached_signatures(), 1);

        let mut other = vec![a_record("b.skydns.test.", 1)];
        s.sign_section(&mut other);
        assert_eq!(s.cached_signatures(), 2);
    }

    #[test]
    fn test_existing_rrsig_not_resigned() {
        let s = signer();
        let mut section = vec![a_record("a.skydns.test.", 1)];
        s.sign_section(&mut section);
        let len_after_first = section.len();

        s.sign_section(&mut section);
        // The RRSIG from the first pass is skipped, the A RRset signature
        // comes from the cache: no growth beyond one extra RRSIG.
        assert_eq!(section.len(), len_after_first + 1);
    }

    #[test]
    fn test_dnskey_owner_and_tag() {
        let s = signer();
        assert_eq!(s.dnskey().name(), &Name::from_str("skydns.test.").unwrap());
        assert_eq!(s.dnskey().record_type(), RecordType::DNSKEY);
        // Key tag is derived from the key material, not hardcoded.
        assert_ne!(s.key_tag(), 0);
    }
}
