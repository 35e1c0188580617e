//! Shared test infrastructure for query pipeline integration tests.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use lattice_dns::backend::MemoryBackend;
use lattice_dns::config::DnsConfig;
use lattice_dns::forward::Forwarder;
use lattice_dns::handler::ServiceHandler;
use lattice_dns::service::Service;
use lattice_dns::sign::ZoneSigner;

// --- Constants ---

pub const DOMAIN: &str = "skydns.test.";

// --- TestResponseHandler ---

/// Captures the serialized DNS response for inspection in tests.
///
/// Implements `ResponseHandler` so it can be passed to
/// `RequestHandler::handle_request()`. The response is serialized via
/// `MessageResponse::destructive_emit()` and stored as raw wire-format
/// bytes, which can then be parsed with `Message::from_vec()`.
#[derive(Clone)]
pub struct TestResponseHandler {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            buf: Arc::new(Mutex::new(Vec::with_capacity(512))),
        }
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let buf = self.buf.lock().unwrap();
        assert!(!buf.is_empty(), "no response was captured");
        Message::from_vec(&buf).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = self.buf.lock().unwrap();
        buf.clear();
        let mut encoder = BinEncoder::new(&mut *buf);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(info)
    }
}

// --- Config/handler builders ---

pub fn test_dns_config() -> DnsConfig {
    let mut config = DnsConfig {
        listen_addr: "127.0.0.1:5353".parse().unwrap(),
        domain: DOMAIN.to_string(),
        // A dead loopback port: tests that want forwarding spawn their own
        // upstream and override this.
        nameservers: vec!["127.0.0.1:1".parse().unwrap()],
        read_timeout_secs: 1,
        ..Default::default()
    };
    config.prepare().expect("config prepares");
    config
}

pub fn test_backend(config: &DnsConfig) -> MemoryBackend {
    MemoryBackend::new(&config.path_prefix, config.ttl, config.priority)
}

pub fn build_handler(config: DnsConfig, backend: MemoryBackend) -> ServiceHandler {
    build_handler_with_signer(config, backend, None)
}

pub fn build_handler_with_signer(
    config: DnsConfig,
    backend: MemoryBackend,
    signer: Option<ZoneSigner>,
) -> ServiceHandler {
    let forwarder = Arc::new(Forwarder::new(
        config.nameservers.clone(),
        config.read_timeout(),
        config.response_cache_ttl_secs as u32,
    ));
    ServiceHandler::new(Arc::new(config), Arc::new(backend), forwarder, signer)
        .expect("handler builds")
}

/// A signer over a freshly generated ECDSA P-256 key.
pub fn test_signer(cache_capacity: usize) -> ZoneSigner {
    use hickory_proto::dnssec::crypto::EcdsaSigningKey;
    use hickory_proto::dnssec::Algorithm;

    let der = EcdsaSigningKey::generate_pkcs8(Algorithm::ECDSAP256SHA256)
        .expect("generate signing key");
    ZoneSigner::from_pkcs8(
        der.secret_pkcs8_der(),
        Name::from_ascii(DOMAIN).unwrap(),
        3600,
        cache_capacity,
    )
    .expect("signer from generated key")
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    query_message(name, record_type, id).to_vec().unwrap()
}

pub fn query_message(name: &str, record_type: RecordType, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` for the given protocol.
pub fn build_request(name: &str, record_type: RecordType, id: u16, protocol: Protocol) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    let src: SocketAddr = "127.0.0.1:53210".parse().unwrap();
    Request::new(msg, src, protocol)
}

/// Build a `Request` carrying an EDNS0 OPT with the given bufsize/DO bit.
pub fn build_edns_request(
    name: &str,
    record_type: RecordType,
    id: u16,
    bufsize: u16,
    dnssec_ok: bool,
) -> Request {
    let mut msg = query_message(name, record_type, id);
    let mut edns = Edns::new();
    edns.set_max_payload(bufsize);
    edns.set_version(0);
    edns.set_dnssec_ok(dnssec_ok);
    msg.set_edns(edns);
    let bytes = msg.to_vec().unwrap();
    let parsed = parse_message_request(&bytes);
    let src: SocketAddr = "127.0.0.1:53210".parse().unwrap();
    Request::new(parsed, src, Protocol::Udp)
}

// --- Query execution ---

/// Execute a query through the handler and return the parsed response.
pub async fn execute_query(handler: &ServiceHandler, name: &str, record_type: RecordType) -> Message {
    execute_request(handler, build_request(name, record_type, 4096, Protocol::Udp)).await
}

pub async fn execute_request(handler: &ServiceHandler, request: Request) -> Message {
    let capture = TestResponseHandler::new();
    handler.handle_request(&request, capture.clone()).await;
    capture.into_message()
}

// --- Response assertions ---

pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Extract rdata of a given type from the answer section.
pub fn answers_of_type(msg: &Message, rtype: RecordType) -> Vec<Record> {
    msg.answers()
        .iter()
        .filter(|r| r.record_type() == rtype)
        .cloned()
        .collect()
}

/// The single SOA expected in the authority section of negative answers.
pub fn authority_soa(msg: &Message) -> Record {
    let soas: Vec<&Record> = msg
        .name_servers()
        .iter()
        .filter(|r| r.record_type() == RecordType::SOA)
        .collect();
    assert_eq!(soas.len(), 1, "expected exactly one SOA in authority");
    soas[0].clone()
}

// --- Service shorthands ---

pub fn host_service(host: &str) -> Service {
    Service {
        host: host.to_string(),
        ..Default::default()
    }
}

pub fn srv_service(host: &str, port: u16) -> Service {
    Service {
        host: host.to_string(),
        port,
        ..Default::default()
    }
}

// --- Loopback upstream ---

/// Spawn a loopback UDP upstream answering every question with one A record
/// (192.0.2.7), after an optional artificial delay. Returns its address and
/// a counter of packets received.
pub async fn spawn_upstream(delay: Duration) -> (SocketAddr, Arc<std::sync::atomic::AtomicUsize>) {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(req) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut reply = Message::new();
            reply.set_id(req.id());
            reply.set_message_type(MessageType::Response);
            reply.set_op_code(OpCode::Query);
            reply.set_recursion_available(true);
            for q in req.queries() {
                reply.add_query(q.clone());
                let rdata = match q.query_type() {
                    RecordType::PTR => RData::PTR(hickory_proto::rr::rdata::PTR(
                        Name::from_ascii("upstream.example.com.").unwrap(),
                    )),
                    _ => RData::A(hickory_proto::rr::rdata::A(std::net::Ipv4Addr::new(
                        192, 0, 2, 7,
                    ))),
                };
                reply.add_answer(Record::from_rdata(q.name().clone(), 300, rdata));
            }
            let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
        }
    });
    (addr, hits)
}
