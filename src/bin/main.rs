//! lattice-dns binary entry point.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lattice_dns::{telemetry, Config, DnsServer, MemoryBackend, Service};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Authoritative DNS server backed by a hierarchical key/value store.
#[derive(Parser, Debug)]
#[command(name = "lattice-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "lattice-dns.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("LATTICE_DNS")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    config.dns.prepare()?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %args.config.display(),
        listen_addr = %config.dns.listen_addr,
        domain = %config.dns.domain,
        "Starting lattice-dns"
    );

    let backend = Arc::new(MemoryBackend::new(
        &config.dns.path_prefix,
        config.dns.ttl,
        config.dns.priority,
    ));
    if let Some(catalog) = &config.dns.catalog {
        let raw = tokio::fs::read_to_string(catalog).await?;
        let entries: HashMap<String, Service> = serde_json::from_str(&raw)?;
        let count = entries.len();
        for (name, service) in entries {
            backend.publish(&name, &service);
        }
        info!(catalog = %catalog.display(), records = count, "loaded service catalog");
    }

    // Setup graceful shutdown on SIGINT/SIGTERM
    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        signal_shutdown.cancel();
    });

    // Run DNS server
    let server = DnsServer::new(config.dns, backend);
    let result = server.run(shutdown).await;

    if let Err(e) = result {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("lattice-dns shutdown complete");
    Ok(())
}
