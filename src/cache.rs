//! Bounded LRU caches for responses and signatures.
//!
//! Both caches sit behind a single mutex each and return deep copies on
//! lookup, so a reader can never alias an entry that a concurrent insert is
//! about to evict. Capacity is counted in resource records, not entries: a
//! fat response weighs more than a lone RRSIG.

use std::hash::Hash;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use lru::LruCache;
use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    weight: usize,
    expires: Instant,
}

/// LRU map with per-entry expiry and weighted capacity.
struct LruTtl<K: Hash + Eq, V> {
    inner: Mutex<LruTtlInner<K, V>>,
    capacity: usize,
}

struct LruTtlInner<K: Hash + Eq, V> {
    map: LruCache<K, Entry<V>>,
    size: usize,
}

impl<K: Hash + Eq, V: Clone> LruTtl<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruTtlInner {
                map: LruCache::unbounded(),
                size: 0,
            }),
            capacity,
        }
    }

    /// Look up a key, refreshing its recency. Expired entries are evicted
    /// and reported as misses.
    fn search(&self, key: &K) -> Option<V> {
        if self.capacity == 0 {
            return None;
        }
        let mut inner = self.inner.lock();
        let expired = match inner.map.get(key) {
            Some(entry) if entry.expires > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            if let Some(entry) = inner.map.pop(key) {
                inner.size -= entry.weight;
            }
        }
        None
    }

    fn insert(&self, key: K, value: V, weight: usize, expires: Instant) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some(old) = inner.map.put(
            key,
            Entry {
                value,
                weight,
                expires,
            },
        ) {
            inner.size -= old.weight;
        }
        inner.size += weight;
        while inner.size > self.capacity {
            let Some((_, evicted)) = inner.map.pop_lru() else {
                break;
            };
            inner.size -= evicted.weight;
        }
    }

    fn len(&self) -> usize {
        self.inner.lock().map.len()
    }
}

/// Cache key for one question: name, type and the DO bit.
///
/// DO and non-DO answers are cached separately; signatures are attached
/// after the cache, so the bodies still converge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuestionKey {
    /// Lower-cased query name.
    pub name: String,
    /// Query type.
    pub qtype: RecordType,
    /// EDNS0 DO flag.
    pub dnssec: bool,
}

/// A captured reply, minus the envelope.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Answer section.
    pub answers: Vec<Record>,
    /// Authority section.
    pub authorities: Vec<Record>,
    /// Additional section.
    pub additionals: Vec<Record>,
    /// Response code of the captured reply.
    pub rcode: ResponseCode,
    /// Whether the captured reply was authoritative.
    pub authoritative: bool,
}

impl Default for CachedResponse {
    fn default() -> Self {
        Self {
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            rcode: ResponseCode::NoError,
            authoritative: true,
        }
    }
}

impl CachedResponse {
    fn weight(&self) -> usize {
        // At least one unit so empty NODATA replies still occupy space.
        (self.answers.len() + self.authorities.len() + self.additionals.len()).max(1)
    }
}

/// Bounded cache of complete replies with a fixed TTL.
pub struct ResponseCache {
    entries: LruTtl<QuestionKey, CachedResponse>,
    ttl: Duration,
}

impl ResponseCache {
    /// Create a cache holding up to `capacity` resource records, each entry
    /// fresh for `ttl`.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruTtl::new(capacity),
            ttl,
        }
    }

    /// Return a deep copy of the cached reply for `key`, if fresh.
    pub fn search(&self, key: &QuestionKey) -> Option<CachedResponse> {
        self.entries.search(key)
    }

    /// Capture a reply.
    pub fn insert(&self, key: QuestionKey, response: CachedResponse) {
        let weight = response.weight();
        self.entries
            .insert(key, response, weight, Instant::now() + self.ttl);
    }

    /// Number of cached replies.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Bounded cache of RRSIGs keyed by the content of the RRset they cover.
pub struct SignatureCache {
    entries: LruTtl<Vec<u8>, Record>,
}

impl SignatureCache {
    /// Create a cache holding up to `capacity` signatures.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruTtl::new(capacity),
        }
    }

    /// Return a copy of the cached signature for this RRset content.
    pub fn search(&self, key: &[u8]) -> Option<Record> {
        self.entries.search(&key.to_vec())
    }

    /// Cache a signature until its own expiration field says otherwise.
    pub fn insert(&self, key: Vec<u8>, sig: Record, sig_expiration: u32) {
        let expires = rrsig_expiry(sig_expiration);
        self.entries.insert(key, sig, 1, expires);
    }

    /// Number of cached signatures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Hash the content of an RRset: owner name, type, and the serialised rdata
/// of every member. Two RRsets with identical rdata but different owners get
/// different keys.
pub fn rrset_key(records: &[Record]) -> Vec<u8> {
    let mut key = Vec::with_capacity(64);
    if let Some(first) = records.first() {
        key.extend_from_slice(first.name().to_ascii().to_ascii_lowercase().as_bytes());
        key.extend_from_slice(&u16::from(first.record_type()).to_be_bytes());
    }
    for record in records {
        let mut buf = Vec::with_capacity(32);
        let mut encoder = BinEncoder::new(&mut buf);
        if record.data().emit(&mut encoder).is_ok() {
            key.extend_from_slice(&buf);
        }
    }
    key
}

/// Map an RRSIG expiration (serial arithmetic, seconds since epoch mod 2^32)
/// to a wall-clock deadline, rolling over the 2^31-second boundary.
fn rrsig_expiry(expiration: u32) -> Instant {
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let mut m = ((expiration as i64 - now_unix) / (1i64 << 31)) - 1;
    if m < 0 {
        m = 0;
    }
    let t = expiration as i64 - m * (1i64 << 31);
    let remaining = (t - now_unix).max(0) as u64;
    Instant::now() + Duration::from_secs(remaining)
}
