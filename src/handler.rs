//! The query pipeline.
//!
//! Every inbound question runs through the same stations: envelope setup,
//! short-circuits (ANY, CHAOS, reverse zones, out-of-zone forwarding), the
//! response cache, apex synthesis, type dispatch against the backend, and
//! finally TTL smoothing, cache insertion, optional signing and truncation.
//! Errors from the backend are translated to DNS rcodes at the top; nothing
//! below this module ever writes a packet.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::{Edns, Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{SOA, TXT};
use hickory_proto::rr::{DNSClass, LowerName, Name, RData, Record, RecordType};
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use rand::Rng;
use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::cache::{CachedResponse, QuestionKey, ResponseCache};
use crate::config::DnsConfig;
use crate::error::{BackendError, ForwardError, ResolveError};
use crate::forward::Forwarder;
use crate::metrics::{self, QueryOutcome};
use crate::nsec3::{self, StaticDenial};
use crate::path::name_of;
use crate::sign::ZoneSigner;

/// CNAME chase depth limit.
const CNAME_LIMIT: usize = 8;

/// Minimum EDNS0 buffer size we honour.
const MIN_BUFSIZE: u16 = 512;

/// Authors answered for `authors.bind.` CHAOS queries.
const AUTHORS: &[&str] = &["The lattice-dns Authors"];

/// A reply under construction, before it becomes a wire message.
#[derive(Debug, Clone)]
struct Reply {
    answers: Vec<Record>,
    authorities: Vec<Record>,
    additionals: Vec<Record>,
    rcode: ResponseCode,
    authentic_data: bool,
}

impl Default for Reply {
    fn default() -> Self {
        Self {
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            rcode: ResponseCode::NoError,
            authentic_data: false,
        }
    }
}

impl Reply {
    fn from_cached(cached: CachedResponse) -> Self {
        Self {
            answers: cached.answers,
            authorities: cached.authorities,
            additionals: cached.additionals,
            rcode: cached.rcode,
            authentic_data: false,
        }
    }

    fn to_cached(&self) -> CachedResponse {
        CachedResponse {
            answers: self.answers.clone(),
            authorities: self.authorities.clone(),
            additionals: self.additionals.clone(),
            rcode: self.rcode,
            authoritative: true,
        }
    }
}

/// The DNS request handler: one instance serves both listeners.
pub struct ServiceHandler {
    config: Arc<DnsConfig>,
    backend: Arc<dyn Backend>,
    forwarder: Arc<Forwarder>,
    rcache: ResponseCache,
    signer: Option<ZoneSigner>,
    denial: Option<StaticDenial>,

    domain: Name,
    domain_lower: LowerName,
    /// `dns.<domain>`, the reserved bookkeeping subtree.
    dns_domain: String,
    /// `ns.dns.<domain>`, where NS endpoints are published.
    ns_domain: String,
    primary_ns: Name,
    hostmaster: Name,
}

impl ServiceHandler {
    /// Build a handler over a prepared configuration and a backend.
    pub fn new(
        config: Arc<DnsConfig>,
        backend: Arc<dyn Backend>,
        forwarder: Arc<Forwarder>,
        signer: Option<ZoneSigner>,
    ) -> Result<Self, crate::error::DnsError> {
        let domain = Name::from_ascii(&config.domain)?;
        let denial = match &signer {
            Some(_) => Some(StaticDenial::new(&domain, config.min_ttl)?),
            None => None,
        };
        let primary_ns = Name::from_ascii(format!("ns.dns.{}", config.domain))?;
        let hostmaster = Name::from_ascii(&config.hostmaster)?;

        Ok(Self {
            rcache: ResponseCache::new(config.response_cache_capacity, config.response_cache_ttl()),
            domain_lower: LowerName::from(&domain),
            dns_domain: format!("dns.{}", config.domain),
            ns_domain: format!("ns.dns.{}", config.domain),
            domain,
            primary_ns,
            hostmaster,
            config,
            backend,
            forwarder,
            signer,
            denial,
        })
    }

    /// The zone this handler is authoritative for.
    pub fn origin(&self) -> &Name {
        &self.domain
    }

    fn in_domain(&self, name: &Name) -> bool {
        self.domain_lower.zone_of(&LowerName::from(name))
    }

    async fn dispatch<R: ResponseHandler>(
        &self,
        request: &Request,
        mut handle: R,
    ) -> Result<ResponseInfo, crate::error::DnsError> {
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            let builder = MessageResponseBuilder::from_message_request(request);
            let response = builder.error_msg(request.header(), ResponseCode::NotImp);
            return Ok(handle.send_response(response).await?);
        }

        let info = request.request_info()?;
        let query = info.query;
        let qtype = query.query_type();
        let qclass = query.query_class();
        let qname = query.original().name().clone();
        let mut name = query.name().to_string();
        metrics::record_request();
        debug!(%name, ?qtype, proto = ?info.protocol, "received query");

        // Self-referencing alias: local.dns.<domain> answers for this node.
        if let Some(local) = &self.config.local_address {
            if name == format!("local.dns.{}", self.config.domain) {
                name = local.clone();
            }
        }

        // ANY is refused outright.
        if qtype == RecordType::ANY {
            metrics::record_query_outcome(QueryOutcome::Refused);
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::Refused);
            header.set_authoritative(false);
            header.set_recursion_available(false);
            let builder = MessageResponseBuilder::from_message_request(request);
            let response = builder.build_no_records(header);
            return Ok(handle.send_response(response).await?);
        }

        let (bufsize, dnssec) = self.read_edns(request, info.protocol);
        let tcp = info.protocol == Protocol::Tcp;

        if qclass == DNSClass::CH {
            return self.serve_chaos(request, &name, qtype, handle).await;
        }

        if qtype == RecordType::PTR
            && (name.ends_with(".in-addr.arpa.") || name.ends_with(".ip6.arpa."))
        {
            return self.serve_reverse(request, &name, &qname, handle).await;
        }

        if !self.in_domain(&qname) {
            return self.serve_forward(request, handle).await;
        }

        // Consult the response cache before any store access.
        let key = QuestionKey {
            name: name.clone(),
            qtype,
            dnssec,
        };
        if let Some(cached) = self.rcache.search(&key) {
            metrics::record_cache_hit();
            let mut reply = Reply::from_cached(cached);
            if self.config.round_robin
                && (qtype == RecordType::A || qtype == RecordType::AAAA)
            {
                round_robin(&mut reply.answers);
            }
            // Bodies are cached unsigned; signatures come from the
            // signature cache per RRset, so DO and non-DO queries share
            // cached message bodies.
            if dnssec {
                metrics::record_dnssec_ok();
                self.secure_reply(&qname, &mut reply);
            }
            return self
                .send_reply(request, reply, bufsize, tcp, dnssec, &mut handle)
                .await;
        }
        metrics::record_cache_miss();

        let mut reply = Reply::default();
        self.resolve(&mut reply, &name, &qname, qtype, bufsize, dnssec)
            .await;

        if reply.rcode == ResponseCode::ServFail {
            metrics::record_query_outcome(QueryOutcome::ServFail);
            let mut header = Header::response_from_request(request.header());
            header.set_response_code(ResponseCode::ServFail);
            header.set_recursion_available(true);
            let builder = MessageResponseBuilder::from_message_request(request);
            let response = builder.build_no_records(header);
            return Ok(handle.send_response(response).await?);
        }

        // Finalisation: smooth TTLs, remember the reply, then sign.
        smooth_ttls(&mut reply.answers);
        self.rcache.insert(key, reply.to_cached());
        if dnssec {
            metrics::record_dnssec_ok();
            self.secure_reply(&qname, &mut reply);
        }
        self.send_reply(request, reply, bufsize, tcp, dnssec, &mut handle)
            .await
    }

    /// Resolve the question into `reply`, applying the rcode mapping for
    /// backend and CNAME failures.
    async fn resolve(
        &self,
        reply: &mut Reply,
        name: &str,
        qname: &Name,
        qtype: RecordType,
        bufsize: u16,
        dnssec: bool,
    ) {
        // Synthesised apex records.
        if name == self.config.domain {
            match qtype {
                RecordType::SOA => {
                    reply.answers.push(self.soa());
                    metrics::record_query_outcome(QueryOutcome::Success);
                    return;
                }
                RecordType::DNSKEY => {
                    if let Some(signer) = &self.signer {
                        reply.answers.push(signer.dnskey().clone());
                        metrics::record_query_outcome(QueryOutcome::Success);
                        return;
                    }
                }
                RecordType::NS => {
                    match self.ns_records(qname).await {
                        Ok((records, extra)) => {
                            reply.answers.extend(records);
                            reply.additionals.extend(extra);
                        }
                        Err(err) => {
                            self.map_resolve_error(reply, err.into());
                            return;
                        }
                    }
                    if !reply.answers.is_empty() {
                        metrics::record_query_outcome(QueryOutcome::Success);
                        return;
                    }
                }
                _ => {}
            }
        }

        // The dns.<domain> subtree is reserved; the apex of it has no data.
        if name == self.dns_domain {
            self.no_data(reply);
            return;
        }

        match qtype {
            RecordType::A | RecordType::AAAA => {
                match self
                    .address_records(qname, name, qtype, Vec::new())
                    .await
                {
                    Ok(mut records) => {
                        if self.config.round_robin {
                            round_robin(&mut records);
                        }
                        reply.answers.extend(records);
                    }
                    Err(ResolveError::IncompleteChain { records }) => {
                        self.splice_external_chain(reply, records, qtype, bufsize, dnssec)
                            .await;
                        return;
                    }
                    Err(err) => {
                        self.map_resolve_error(reply, err);
                        return;
                    }
                }
            }
            RecordType::CNAME => match self.cname_records(qname, name).await {
                Ok(records) => reply.answers.extend(records),
                Err(err) => {
                    self.map_resolve_error(reply, err.into());
                    return;
                }
            },
            RecordType::TXT => match self.txt_records(qname, name).await {
                Ok(records) => reply.answers.extend(records),
                Err(err) => {
                    self.map_resolve_error(reply, err.into());
                    return;
                }
            },
            other => {
                // SRV and ANY answer from the service tree; every other
                // type still walks it so NXDOMAIN/NODATA come out right,
                // but its records are discarded.
                match self.srv_records(qname, name, bufsize, dnssec).await {
                    Ok((records, extra)) => {
                        if other == RecordType::SRV {
                            reply.answers.extend(records);
                            reply.additionals.extend(extra);
                        }
                    }
                    Err(err) => {
                        self.map_resolve_error(reply, err.into());
                        return;
                    }
                }
            }
        }

        if reply.answers.is_empty() {
            self.no_data(reply);
        } else {
            metrics::record_query_outcome(QueryOutcome::Success);
        }
    }

    /// A failed internal CNAME chain: try the terminal external target
    /// through the forwarder, otherwise answer NODATA without the partial
    /// chain.
    async fn splice_external_chain(
        &self,
        reply: &mut Reply,
        records: Vec<Record>,
        qtype: RecordType,
        bufsize: u16,
        dnssec: bool,
    ) {
        if records.is_empty() {
            self.name_error(reply);
            return;
        }
        let target = records.iter().rev().find_map(|r| match r.data() {
            RData::CNAME(cname) if !self.in_domain(&cname.0) => Some(cname.0.clone()),
            _ => None,
        });
        let Some(target) = target else {
            debug!("incomplete CNAME chain with no external target");
            self.no_data(reply);
            return;
        };
        match self.forwarder.lookup(target, qtype, dnssec, bufsize).await {
            Ok(upstream) => {
                reply.answers.extend(records);
                reply.answers.extend(upstream.answers().iter().cloned());
                metrics::record_query_outcome(QueryOutcome::Success);
            }
            Err(err) => {
                debug!(%err, "external CNAME target lookup failed");
                self.no_data(reply);
            }
        }
    }

    fn map_resolve_error(&self, reply: &mut Reply, err: ResolveError) {
        match err {
            ResolveError::Backend(BackendError::NotFound) => self.name_error(reply),
            ResolveError::Backend(BackendError::Transport(e)) => {
                error!(error = %e, "store unreachable");
                reply.rcode = ResponseCode::ServFail;
            }
            ResolveError::Backend(BackendError::Decode(e)) => {
                error!(error = %e, "malformed service record");
                reply.rcode = ResponseCode::ServFail;
            }
            ResolveError::CnameLoop { target } => {
                warn!(%target, "CNAME loop detected");
                self.name_error(reply);
            }
            ResolveError::CnameLimitExceeded { target } => {
                warn!(%target, "CNAME lookup limit of {} exceeded", CNAME_LIMIT);
                self.name_error(reply);
            }
            ResolveError::IncompleteChain { .. } => self.no_data(reply),
        }
    }

    /// NXDOMAIN with the SOA in the authority section.
    fn name_error(&self, reply: &mut Reply) {
        metrics::record_query_outcome(QueryOutcome::NxDomain);
        reply.rcode = ResponseCode::NXDomain;
        let mut soa = self.soa();
        soa.set_ttl(self.config.min_ttl);
        reply.authorities = vec![soa];
        reply.answers.clear();
        reply.additionals.clear();
    }

    /// NODATA: NOERROR with the SOA in the authority section.
    fn no_data(&self, reply: &mut Reply) {
        metrics::record_query_outcome(QueryOutcome::NoData);
        reply.rcode = ResponseCode::NoError;
        let mut soa = self.soa();
        soa.set_ttl(self.config.min_ttl);
        reply.authorities = vec![soa];
        reply.answers.clear();
        reply.additionals.clear();
    }

    /// Denial synthesis and RRset signing for DO queries.
    fn secure_reply(&self, qname: &Name, reply: &mut Reply) {
        let (Some(signer), Some(denial)) = (&self.signer, &self.denial) else {
            return;
        };
        reply.authentic_data = true;

        if reply.rcode == ResponseCode::NXDomain {
            match nsec3::name_error(qname, &self.domain, self.config.min_ttl) {
                Ok(cover) => {
                    let cover_name = cover.name().clone();
                    reply.authorities.push(cover);
                    if denial.closest_encloser.name() != &cover_name {
                        reply.authorities.push(denial.closest_encloser.clone());
                    }
                    if denial.deny_wildcard.name() != &cover_name {
                        reply.authorities.push(denial.deny_wildcard.clone());
                    }
                }
                Err(err) => warn!(%err, "failed to synthesise NXDOMAIN denial"),
            }
        } else if reply.rcode == ResponseCode::NoError
            && reply.answers.is_empty()
            && reply.authorities.len() == 1
            && reply.authorities[0].record_type() == RecordType::SOA
        {
            match nsec3::no_data(qname, &self.domain, self.config.min_ttl) {
                Ok(record) => reply.authorities.push(record),
                Err(err) => warn!(%err, "failed to synthesise NODATA denial"),
            }
        }

        signer.sign_section(&mut reply.answers);
        signer.sign_section(&mut reply.authorities);
        signer.sign_section(&mut reply.additionals);
    }

    /// Address resolution with CNAME chasing.
    ///
    /// `previous` carries the CNAMEs emitted earlier in this resolution;
    /// the chain is bounded at eight lookups and any repeated target fails
    /// the chase.
    fn address_records<'a>(
        &'a self,
        qname: &'a Name,
        name: &'a str,
        qtype: RecordType,
        previous: Vec<Record>,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Record>, ResolveError>> + Send + 'a>> {
        Box::pin(async move {
            let services = self.backend.records(name, false).await?;
            let mut records = Vec::with_capacity(services.len());
            for service in services {
                match service.ip() {
                    None => {
                        let target = match fqdn(&service.host) {
                            Ok(target) => target,
                            Err(err) => {
                                warn!(host = %service.host, %err, "unusable CNAME target");
                                continue;
                            }
                        };
                        if previous.len() + records.len() >= CNAME_LIMIT {
                            return Err(ResolveError::CnameLimitExceeded { target });
                        }
                        if chain_contains(&previous, &target)
                            || chain_contains(&records, &target)
                        {
                            return Err(ResolveError::CnameLoop { target });
                        }
                        let cname = service.new_cname(qname.clone(), target.clone());
                        records.push(cname);

                        let mut chain = previous.clone();
                        chain.extend(records.iter().cloned());
                        let target_name = target.to_string().to_lowercase();
                        match self
                            .address_records(&target, &target_name, qtype, chain)
                            .await
                        {
                            Ok(next) => records.extend(next),
                            Err(_) => {
                                // The chain cannot be completed internally.
                                // Hand the partial chain up; emitting it
                                // as-is would violate the no-other-data
                                // rule.
                                return Err(ResolveError::IncompleteChain { records });
                            }
                        }
                    }
                    Some(std::net::IpAddr::V4(v4)) if qtype == RecordType::A => {
                        records.push(service.new_a(qname.clone(), v4));
                    }
                    Some(std::net::IpAddr::V6(v6)) if qtype == RecordType::AAAA => {
                        records.push(service.new_aaaa(qname.clone(), v6));
                    }
                    Some(_) => {}
                }
            }
            Ok(records)
        })
    }

    /// SRV synthesis with per-priority weight renormalisation.
    async fn srv_records(
        &self,
        qname: &Name,
        name: &str,
        bufsize: u16,
        dnssec: bool,
    ) -> Result<(Vec<Record>, Vec<Record>), BackendError> {
        let services = self.backend.records(name, false).await?;

        // First pass: total weight per priority class, unset weights count
        // as 100.
        let mut totals: std::collections::HashMap<u16, u32> = std::collections::HashMap::new();
        for service in &services {
            let weight = if service.weight == 0 {
                100
            } else {
                u32::from(service.weight)
            };
            *totals.entry(service.priority).or_insert(0) += weight;
        }

        let mut records = Vec::with_capacity(services.len());
        let mut extra = Vec::new();
        let mut looked_up = std::collections::HashSet::new();
        for mut service in services {
            let total = f64::from(totals[&service.priority]);
            let share = if service.weight == 0 {
                100.0
            } else {
                f64::from(service.weight)
            };
            let weight = (100.0 / total * share).floor() as u16;

            match service.ip() {
                None => {
                    let target = match fqdn(&service.host) {
                        Ok(target) => target,
                        Err(err) => {
                            warn!(host = %service.host, %err, "unusable SRV target");
                            continue;
                        }
                    };
                    records.push(service.new_srv(qname.clone(), target.clone(), weight));
                    if looked_up.insert(target.clone()) && !self.in_domain(&target) {
                        self.external_glue(&target, dnssec, bufsize, &mut extra).await;
                    }
                }
                Some(ip) => {
                    // The owner of the glue is the name synthesised from
                    // the store path, so IP endpoints stay addressable.
                    let owner = match fqdn(&name_of(&service.key, &self.config.path_prefix)) {
                        Ok(owner) => owner,
                        Err(err) => {
                            warn!(key = %service.key, %err, "unusable record key");
                            continue;
                        }
                    };
                    service.host = owner.to_string();
                    records.push(service.new_srv(qname.clone(), owner.clone(), weight));
                    match ip {
                        std::net::IpAddr::V4(v4) => extra.push(service.new_a(owner, v4)),
                        std::net::IpAddr::V6(v6) => extra.push(service.new_aaaa(owner, v6)),
                    }
                }
            }
        }
        Ok((records, extra))
    }

    /// Fetch A/AAAA glue for an external SRV target, skipping CNAMEs.
    async fn external_glue(
        &self,
        target: &Name,
        dnssec: bool,
        bufsize: u16,
        extra: &mut Vec<Record>,
    ) {
        for qtype in [RecordType::A, RecordType::AAAA] {
            match self
                .forwarder
                .lookup(target.clone(), qtype, dnssec, bufsize)
                .await
            {
                Ok(upstream) => extra.extend(
                    upstream
                        .answers()
                        .iter()
                        .filter(|r| r.record_type() != RecordType::CNAME)
                        .cloned(),
                ),
                Err(err) => debug!(%target, ?qtype, %err, "no external glue"),
            }
        }
    }

    async fn cname_records(&self, qname: &Name, name: &str) -> Result<Vec<Record>, BackendError> {
        let services = self.backend.records(name, true).await?;
        let mut records = Vec::new();
        if let Some(service) = services.first() {
            if service.ip().is_none() {
                match fqdn(&service.host) {
                    Ok(target) => records.push(service.new_cname(qname.clone(), target)),
                    Err(err) => warn!(host = %service.host, %err, "unusable CNAME target"),
                }
            }
        }
        Ok(records)
    }

    async fn txt_records(&self, qname: &Name, name: &str) -> Result<Vec<Record>, BackendError> {
        let services = self.backend.records(name, false).await?;
        Ok(services
            .iter()
            .filter(|s| !s.text.is_empty())
            .map(|s| s.new_txt(qname.clone()))
            .collect())
    }

    /// NS records for the apex, published under `ns.dns.<domain>`.
    async fn ns_records(&self, qname: &Name) -> Result<(Vec<Record>, Vec<Record>), BackendError> {
        let services = self.backend.records(&self.ns_domain, false).await?;
        let mut records = Vec::new();
        let mut extra = Vec::new();
        for mut service in services {
            let Some(ip) = service.ip() else {
                warn!(host = %service.host, "NS endpoint must be an IP address");
                continue;
            };
            let owner = match fqdn(&name_of(&service.key, &self.config.path_prefix)) {
                Ok(owner) => owner,
                Err(err) => {
                    warn!(key = %service.key, %err, "unusable record key");
                    continue;
                }
            };
            service.host = owner.to_string();
            records.push(service.new_ns(qname.clone(), owner.clone()));
            match ip {
                std::net::IpAddr::V4(v4) => extra.push(service.new_a(owner, v4)),
                std::net::IpAddr::V6(v6) => extra.push(service.new_aaaa(owner, v6)),
            }
        }
        Ok((records, extra))
    }

    /// Reverse zone: answer from the store or hand the query upstream.
    async fn serve_reverse<R: ResponseHandler>(
        &self,
        request: &Request,
        name: &str,
        qname: &Name,
        mut handle: R,
    ) -> Result<ResponseInfo, crate::error::DnsError> {
        if !name.contains('*') {
            if let Ok(service) = self.backend.reverse_record(name).await {
                if let Ok(target) = fqdn(&service.host) {
                    let ptr = service.new_ptr(qname.clone(), target, service.ttl);
                    metrics::record_query_outcome(QueryOutcome::Success);
                    let mut header = Header::response_from_request(request.header());
                    header.set_authoritative(false);
                    header.set_recursion_available(true);
                    let builder = MessageResponseBuilder::from_message_request(request);
                    let answers = [ptr];
                    let response =
                        builder.build(header, answers.iter(), std::iter::empty(), std::iter::empty(), std::iter::empty());
                    return Ok(handle.send_response(response).await?);
                }
            }
        }
        // Not ours (or a wildcard, which reverse names cannot contain):
        // always forward.
        self.serve_forward(request, handle).await
    }

    /// Forward an out-of-zone query to the upstream pool.
    async fn serve_forward<R: ResponseHandler>(
        &self,
        request: &Request,
        mut handle: R,
    ) -> Result<ResponseInfo, crate::error::DnsError> {
        let info = request.request_info()?;
        let proto = info.protocol;

        let mut outbound = Message::new();
        outbound.set_id(request.id());
        outbound.set_op_code(OpCode::Query);
        outbound.set_message_type(MessageType::Query);
        outbound.set_recursion_desired(request.header().recursion_desired());
        outbound.add_query(info.query.original().clone());
        if let Some(edns) = request.edns() {
            outbound.set_edns(edns.clone());
        }

        match self.forwarder.forward(&outbound, proto).await {
            Ok(upstream) => {
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(upstream.response_code());
                header.set_authoritative(false);
                header.set_recursion_available(upstream.recursion_available());
                header.set_truncated(upstream.truncated());
                let builder = MessageResponseBuilder::from_message_request(request);
                let response = builder.build(
                    header,
                    upstream.answers().iter(),
                    upstream.name_servers().iter(),
                    std::iter::empty(),
                    upstream.additionals().iter(),
                );
                Ok(handle.send_response(response).await?)
            }
            Err(err) => {
                match err {
                    ForwardError::NoUpstreams => debug!("{err}"),
                    _ => error!(%err, "failure to forward request"),
                }
                metrics::record_query_outcome(QueryOutcome::ServFail);
                let mut header = Header::response_from_request(request.header());
                header.set_response_code(ResponseCode::ServFail);
                header.set_authoritative(false);
                header.set_recursion_available(true);
                let builder = MessageResponseBuilder::from_message_request(request);
                let response = builder.build_no_records(header);
                Ok(handle.send_response(response).await?)
            }
        }
    }

    /// Well-known CHAOS TXT names.
    async fn serve_chaos<R: ResponseHandler>(
        &self,
        request: &Request,
        name: &str,
        qtype: RecordType,
        mut handle: R,
    ) -> Result<ResponseInfo, crate::error::DnsError> {
        let mut texts: Vec<String> = Vec::new();
        if qtype == RecordType::TXT {
            match name {
                "version.bind." | "version.server." => {
                    texts.push(format!("lattice-dns-{}", env!("CARGO_PKG_VERSION")));
                }
                "hostname.bind." | "id.server." => {
                    texts.push(self.config.instance_id.clone());
                }
                "authors.bind." => {
                    texts.extend(AUTHORS.iter().map(|a| a.to_string()));
                }
                _ if name == self.config.domain => {
                    texts.extend(AUTHORS.iter().map(|a| a.to_string()));
                }
                _ => {}
            }
        }

        let builder = MessageResponseBuilder::from_message_request(request);
        if texts.is_empty() {
            let response = builder.error_msg(request.header(), ResponseCode::ServFail);
            return Ok(handle.send_response(response).await?);
        }

        let info = request.request_info()?;
        let owner = info.query.original().name().clone();
        let answers: Vec<Record> = texts
            .into_iter()
            .map(|text| {
                let mut record =
                    Record::from_rdata(owner.clone(), 0, RData::TXT(TXT::new(vec![text])));
                record.set_dns_class(DNSClass::CH);
                record
            })
            .collect();
        let header = Header::response_from_request(request.header());
        let response = builder.build(header, answers.iter(), std::iter::empty(), std::iter::empty(), std::iter::empty());
        Ok(handle.send_response(response).await?)
    }

    /// Emit the finished reply, clamping to the negotiated buffer size.
    async fn send_reply<R: ResponseHandler>(
        &self,
        request: &Request,
        reply: Reply,
        bufsize: u16,
        tcp: bool,
        dnssec: bool,
        handle: &mut R,
    ) -> Result<ResponseInfo, crate::error::DnsError> {
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(reply.rcode);
        header.set_authoritative(true);
        header.set_recursion_available(true);
        header.set_authentic_data(reply.authentic_data);

        if !tcp && wire_len(request, &reply) > usize::from(bufsize) {
            header.set_truncated(true);
        }

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if request.edns().is_some() {
            let mut edns = Edns::new();
            edns.set_max_payload(bufsize.max(MIN_BUFSIZE));
            edns.set_version(0);
            edns.set_dnssec_ok(dnssec);
            builder.edns(edns);
        }
        let response = builder.build(
            header,
            reply.answers.iter(),
            reply.authorities.iter(),
            std::iter::empty(),
            reply.additionals.iter(),
        );
        Ok(handle.send_response(response).await?)
    }

    fn read_edns(&self, request: &Request, proto: Protocol) -> (u16, bool) {
        let mut bufsize = MIN_BUFSIZE;
        let mut dnssec = false;
        if let Some(edns) = request.edns() {
            bufsize = edns.max_payload().max(MIN_BUFSIZE);
            dnssec = edns.flags().dnssec_ok;
        }
        if proto == Protocol::Tcp {
            bufsize = u16::MAX;
        }
        (bufsize, dnssec)
    }

    /// The zone SOA. Serial is the current hour, truncated to seconds, so
    /// restarts inside the same hour stay consistent.
    fn soa(&self) -> Record {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let serial = (now - now % 3600) as u32;
        let soa = SOA::new(
            self.primary_ns.clone(),
            self.hostmaster.clone(),
            serial,
            28800,
            7200,
            604_800,
            self.config.min_ttl,
        );
        let mut record =
            Record::from_rdata(self.domain.clone(), self.config.ttl, RData::SOA(soa));
        record.set_dns_class(DNSClass::IN);
        record
    }
}

#[async_trait::async_trait]
impl RequestHandler for ServiceHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.dispatch(request, response_handle).await {
            Ok(info) => info,
            Err(err) => {
                error!(%err, "error handling request");
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}

/// All answer-section records share the minimum TTL among them.
fn smooth_ttls(answers: &mut [Record]) {
    let Some(min) = answers.iter().map(Record::ttl).min() else {
        return;
    };
    for record in answers.iter_mut() {
        record.set_ttl(min);
    }
}

/// Round-robin shuffle for address answers.
///
/// Chains with more than one CNAME are left alone: some stub resolvers
/// require the chain in order.
fn round_robin(records: &mut [Record]) {
    let cnames = records
        .iter()
        .filter(|r| r.record_type() == RecordType::CNAME)
        .count();
    if cnames > 1 {
        return;
    }
    let mut rng = rand::thread_rng();
    match records.len() {
        0 | 1 => {}
        2 => {
            if rng.gen_bool(0.5) {
                records.swap(0, 1);
            }
        }
        l => {
            for _ in 0..l * rng.gen_range(1..=4) {
                let a = rng.gen_range(0..l);
                let mut b = rng.gen_range(0..l);
                if a == b {
                    b = (b + 1) % l;
                }
                records.swap(a, b);
            }
        }
    }
}

fn chain_contains(records: &[Record], target: &Name) -> bool {
    records.iter().any(|r| match r.data() {
        RData::CNAME(cname) => cname.0 == *target,
        _ => false,
    })
}

/// Parse a stored host into a fully-qualified lower-case name.
fn fqdn(host: &str) -> Result<Name, hickory_proto::ProtoError> {
    let mut name = Name::from_ascii(host.to_ascii_lowercase())?;
    if !name.is_fqdn() {
        name.set_fqdn(true);
    }
    Ok(name)
}

/// Encoded size of the reply, measured on a scratch message.
fn wire_len(request: &Request, reply: &Reply) -> usize {
    let mut scratch = Message::new();
    scratch.set_message_type(MessageType::Response);
    if let Ok(info) = request.request_info() {
        scratch.add_query(info.query.original().clone());
    }
    for record in &reply.answers {
        scratch.add_answer(record.clone());
    }
    for record in &reply.authorities {
        scratch.add_name_server(record.clone());
    }
    for record in &reply.additionals {
        scratch.add_additional(record.clone());
    }
    scratch.to_vec().map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, CNAME};
    use std::str::FromStr;

    fn a(name: &str, ttl: u32) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A(std::net::Ipv4Addr::new(10, 0, 0, 1))),
        )
    }

    fn cname(name: &str, target: &str) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            60,
            RData::CNAME(CNAME(Name::from_str(target).unwrap())),
        )
    }

    #[test]
    fn test_smooth_ttls_rewrites_to_minimum() {
        let mut answers = vec![a("a.skydns.test.", 3600), a("b.skydns.test.", 60)];
        smooth_ttls(&mut answers);
        assert!(answers.iter().all(|r| r.ttl() == 60));
    }

    #[test]
    fn test_smooth_ttls_empty_is_noop() {
        let mut answers: Vec<Record> = Vec::new();
        smooth_ttls(&mut answers);
        assert!(answers.is_empty());
    }

    #[test]
    fn test_round_robin_leaves_cname_chains_alone() {
        let mut records = vec![
            cname("a.skydns.test.", "b.skydns.test."),
            cname("b.skydns.test.", "c.skydns.test."),
            a("c.skydns.test.", 60),
        ];
        let before = records.clone();
        for _ in 0..16 {
            round_robin(&mut records);
        }
        assert_eq!(records, before);
    }

    #[test]
    fn test_round_robin_eventually_swaps_pairs() {
        let mut swapped = false;
        for _ in 0..64 {
            let mut records = vec![a("a.skydns.test.", 60), a("b.skydns.test.", 60)];
            let first = records[0].clone();
            round_robin(&mut records);
            if records[1] == first {
                swapped = true;
                break;
            }
        }
        assert!(swapped, "two records never swapped in 64 shuffles");
    }

    #[test]
    fn test_chain_contains_matches_cname_targets() {
        let chain = vec![cname("a.skydns.test.", "b.skydns.test.")];
        assert!(chain_contains(
            &chain,
            &Name::from_str("b.skydns.test.").unwrap()
        ));
        assert!(!chain_contains(
            &chain,
            &Name::from_str("c.skydns.test.").unwrap()
        ));
    }

    #[test]
    fn test_fqdn_appends_root() {
        assert_eq!(fqdn("server1").unwrap().to_string(), "server1.");
        assert_eq!(
            fqdn("Server1.Example.COM.").unwrap().to_string(),
            "server1.example.com."
        );
    }
}
