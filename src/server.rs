//! DNS server setup and lifecycle management.

use std::sync::Arc;

use hickory_server::ServerFuture;
use tokio::net::{TcpListener, UdpSocket};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::Backend;
use crate::config::DnsConfig;
use crate::error::DnsError;
use crate::forward::Forwarder;
use crate::handler::ServiceHandler;
use crate::sign::ZoneSigner;

/// Pre-bound sockets handed in by an external activator (systemd and
/// friends). Either may be absent; missing ones are bound from the
/// configured listen address.
#[derive(Debug, Default)]
pub struct BoundSockets {
    /// A pre-bound, non-blocking UDP socket.
    pub udp: Option<std::net::UdpSocket>,
    /// A pre-bound, non-blocking TCP listener.
    pub tcp: Option<std::net::TcpListener>,
}

/// Authoritative DNS server over a service-discovery backend.
pub struct DnsServer {
    config: DnsConfig,
    backend: Arc<dyn Backend>,
}

impl DnsServer {
    /// Create a new DNS server with a prepared configuration.
    pub fn new(config: DnsConfig, backend: Arc<dyn Backend>) -> Self {
        Self { config, backend }
    }

    /// Run the DNS server until the cancellation token fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DnsError> {
        self.run_with_sockets(shutdown, BoundSockets::default())
            .await
    }

    /// As [`DnsServer::run`], with optional externally-activated sockets.
    pub async fn run_with_sockets(
        self,
        shutdown: CancellationToken,
        sockets: BoundSockets,
    ) -> Result<(), DnsError> {
        let config = Arc::new(self.config);

        let signer = match &config.dnssec {
            Some(path) => {
                let der = fs::read(path).await?;
                let signer = ZoneSigner::from_pkcs8(
                    &der,
                    hickory_proto::rr::Name::from_ascii(&config.domain)?,
                    config.ttl,
                    config.signature_cache_capacity,
                )?;
                info!(key = %path.display(), key_tag = signer.key_tag(), "DNSSEC signing enabled");
                Some(signer)
            }
            None => None,
        };

        let forwarder = Arc::new(Forwarder::new(
            config.nameservers.clone(),
            config.read_timeout(),
            config.response_cache_ttl_secs as u32,
        ));

        let handler = ServiceHandler::new(config.clone(), self.backend, forwarder, signer)?;
        let mut server = ServerFuture::new(handler);

        let udp_socket = match sockets.udp {
            Some(socket) => {
                socket.set_nonblocking(true)?;
                UdpSocket::from_std(socket)?
            }
            None => UdpSocket::bind(config.listen_addr).await?,
        };
        info!(addr = %udp_socket.local_addr()?, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = match sockets.tcp {
            Some(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
            None => TcpListener::bind(config.listen_addr).await?,
        };
        info!(addr = %tcp_listener.local_addr()?, "DNS TCP listening");
        server.register_listener(tcp_listener, config.read_timeout());

        info!(
            domain = %config.domain,
            rcache = config.response_cache_capacity,
            "ready for queries"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
            }
        }

        info!("DNS server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let mut config = DnsConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            domain: "skydns.test.".into(),
            nameservers: vec!["127.0.0.1:5300".parse().unwrap()],
            ..Default::default()
        };
        config.prepare().unwrap();

        let backend = Arc::new(MemoryBackend::new("skydns", 3600, 10));
        let server = DnsServer::new(config, backend);

        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        let handle = tokio::spawn(server.run(shutdown));

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        trigger.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked");
        assert!(result.is_ok());
    }
}
