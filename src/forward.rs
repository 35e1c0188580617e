//! Forwarding client for names outside the authoritative domain.
//!
//! Upstreams are tried starting at `request id mod N` and advance circularly
//! on transport errors, at most N exchanges per query. Identical concurrent
//! exchanges (same name, type, DO bit and upstream) are coalesced onto one
//! in-flight exchange whose reply is fanned out to every waiter.

use std::net::SocketAddr;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_server::proto::xfer::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ForwardError;
use crate::metrics;

/// Identity of one outbound exchange for coalescing purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    name: String,
    qtype: RecordType,
    dnssec: bool,
    upstream: SocketAddr,
}

type ExchangeResult = Result<Message, String>;

/// Client for the configured upstream recursive resolvers.
pub struct Forwarder {
    upstreams: Vec<SocketAddr>,
    /// Per-exchange cap; exchanges wait twice this long, as the general
    /// read timeout also covers slower recursion upstream.
    read_timeout: Duration,
    /// TTL stamped onto looked-up glue, aligned with the response cache.
    lookup_ttl: u32,
    inflight: DashMap<FlightKey, broadcast::Sender<ExchangeResult>>,
}

impl Forwarder {
    /// Create a forwarder over the given upstream addresses.
    pub fn new(upstreams: Vec<SocketAddr>, read_timeout: Duration, lookup_ttl: u32) -> Self {
        Self {
            upstreams,
            read_timeout,
            lookup_ttl,
            inflight: DashMap::new(),
        }
    }

    /// True when no upstreams are configured.
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Forward a full client request, preserving its id, over the transport
    /// the client used.
    pub async fn forward(&self, req: &Message, proto: Protocol) -> Result<Message, ForwardError> {
        metrics::record_forward();
        let mut reply = self.try_upstreams(req, proto).await?;
        reply.set_id(req.id());
        Ok(reply)
    }

    /// Resolve `name`/`qtype` through the upstreams for internal use (glue
    /// for external SRV targets, terminal names of external CNAME chains).
    ///
    /// Non-success rcodes are errors here: a SERVFAIL upstream must not be
    /// spliced into an authoritative answer.
    pub async fn lookup(
        &self,
        name: Name,
        qtype: RecordType,
        dnssec: bool,
        bufsize: u16,
    ) -> Result<Message, ForwardError> {
        metrics::record_lookup();
        let mut query = Message::new();
        query.set_id(rand::random());
        query.set_op_code(OpCode::Query);
        query.set_message_type(MessageType::Query);
        query.set_recursion_desired(true);
        query.add_query(Query::query(name, qtype));
        if dnssec {
            let mut edns = Edns::new();
            edns.set_max_payload(bufsize);
            edns.set_dnssec_ok(true);
            query.set_edns(edns);
        }

        let mut reply = self.try_upstreams(&query, Protocol::Udp).await?;
        if reply.response_code() != ResponseCode::NoError {
            return Err(ForwardError::Rcode(reply.response_code()));
        }
        // Flatten TTLs so spliced glue ages with the response cache.
        for record in reply.answers_mut() {
            record.set_ttl(self.lookup_ttl);
        }
        for record in reply.additionals_mut() {
            record.set_ttl(self.lookup_ttl);
        }
        Ok(reply)
    }

    async fn try_upstreams(&self, req: &Message, proto: Protocol) -> Result<Message, ForwardError> {
        if self.upstreams.is_empty() {
            return Err(ForwardError::NoUpstreams);
        }
        let n = self.upstreams.len();
        let mut nsid = req.id() as usize % n;
        let mut last_error = String::new();
        for attempt in 0..n {
            let upstream = self.upstreams[nsid];
            match self.exchange_coalesced(req, upstream, proto).await {
                Ok(reply) => return Ok(reply),
                Err(err) => {
                    debug!(%upstream, attempt, %err, "upstream exchange failed");
                    last_error = err;
                    nsid = (nsid + 1) % n;
                }
            }
        }
        metrics::record_forward_exhausted();
        Err(ForwardError::Exhausted {
            attempts: n,
            last_error,
        })
    }

    /// One exchange against one upstream, deduplicated across callers.
    async fn exchange_coalesced(
        &self,
        req: &Message,
        upstream: SocketAddr,
        proto: Protocol,
    ) -> ExchangeResult {
        let Some(question) = req.queries().first() else {
            return Err("request has no question".to_string());
        };
        let key = FlightKey {
            name: question.name().to_ascii().to_ascii_lowercase(),
            qtype: question.query_type(),
            dnssec: req.edns().map(|e| e.flags().dnssec_ok).unwrap_or(false),
            upstream,
        };

        let waiter = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => Some(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(1);
                entry.insert(tx);
                None
            }
        };

        if let Some(mut rx) = waiter {
            metrics::record_forward_coalesced();
            match rx.recv().await {
                Ok(result) => {
                    return result.map(|mut reply| {
                        reply.set_id(req.id());
                        reply
                    });
                }
                // Leader vanished without broadcasting; fall through to our
                // own exchange.
                Err(_) => {}
            }
        } else {
            let result = self.exchange(req, upstream, proto).await;
            if let Some((_, tx)) = self.inflight.remove(&key) {
                let _ = tx.send(result.clone());
            }
            return result;
        }

        self.exchange(req, upstream, proto).await
    }

    async fn exchange(
        &self,
        req: &Message,
        upstream: SocketAddr,
        proto: Protocol,
    ) -> ExchangeResult {
        let payload = req.to_vec().map_err(|e| e.to_string())?;
        let wait = self.read_timeout * 2;
        let raw = match proto {
            Protocol::Tcp => self.exchange_tcp(&payload, upstream, wait).await?,
            _ => self.exchange_udp(&payload, upstream, wait).await?,
        };
        let reply = Message::from_vec(&raw).map_err(|e| e.to_string())?;
        if reply.id() != req.id() {
            return Err(format!(
                "upstream {upstream} answered with mismatched id {}",
                reply.id()
            ));
        }
        Ok(reply)
    }

    async fn exchange_udp(
        &self,
        payload: &[u8],
        upstream: SocketAddr,
        wait: Duration,
    ) -> Result<Vec<u8>, String> {
        let bind_addr: SocketAddr = if upstream.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| e.to_string())?;
        socket.connect(upstream).await.map_err(|e| e.to_string())?;
        socket.send(payload).await.map_err(|e| e.to_string())?;

        let mut buf = vec![0u8; 4096];
        let len = timeout(wait, socket.recv(&mut buf))
            .await
            .map_err(|_| format!("udp read from {upstream} timed out"))?
            .map_err(|e| e.to_string())?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn exchange_tcp(
        &self,
        payload: &[u8],
        upstream: SocketAddr,
        wait: Duration,
    ) -> Result<Vec<u8>, String> {
        let mut stream = timeout(wait, TcpStream::connect(upstream))
            .await
            .map_err(|_| format!("tcp connect to {upstream} timed out"))?
            .map_err(|e| e.to_string())?;

        let mut framed = Vec::with_capacity(payload.len() + 2);
        framed.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        framed.extend_from_slice(payload);
        stream.write_all(&framed).await.map_err(|e| e.to_string())?;

        let read = async {
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        };
        timeout(wait, read)
            .await
            .map_err(|_| format!("tcp read from {upstream} timed out"))?
            .map_err(|e| e.to_string())
    }
}
