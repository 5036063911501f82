//! Scry CLI
//!
//! Run a rendezvous/proxy witness node, or classify this node's NAT from
//! the command line.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use scry_discovery::{Contact, DetectionService, DetectionServiceConfig, NatDetector};
use scry_transport::{ConnectionType, Transport, TransportParameters, UdpTransport};

/// Scry - NAT classification over reliable UDP
#[derive(Parser)]
#[command(name = "scry")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Link profile for transport timing (wireless, t1, e1, 10m-ethernet,
    /// 100m-ethernet, 1g-ethernet)
    #[arg(long, default_value = "100m-ethernet")]
    connection: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a rendezvous/proxy witness node
    Serve {
        /// Listen address
        #[arg(short, long, default_value = "0.0.0.0:5483")]
        bind: String,

        /// Proxy address to forward unmatched requests to
        #[arg(long)]
        proxy: Option<String>,
    },

    /// Classify this node's NAT against rendezvous contacts
    Detect {
        /// Local bind address
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: String,

        /// Endpoint this node believes it occupies (defaults to the bind
        /// address)
        #[arg(long)]
        endpoint: Option<String>,

        /// Query every contact, not just rendezvous-capable ones
        #[arg(long)]
        all_contacts: bool,

        /// Rendezvous contact addresses, tried in order
        #[arg(required = true)]
        contacts: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose { "debug" } else { "info" })
        .init();

    let params = TransportParameters::for_connection(parse_connection(&cli.connection)?);

    match cli.command {
        Commands::Serve { bind, proxy } => {
            run_serve(bind, proxy, params).await?;
        }
        Commands::Detect {
            bind,
            endpoint,
            all_contacts,
            contacts,
        } => {
            run_detect(bind, endpoint, all_contacts, contacts, params).await?;
        }
    }

    Ok(())
}

fn parse_connection(value: &str) -> anyhow::Result<ConnectionType> {
    let connection = match value.to_ascii_lowercase().as_str() {
        "wireless" => ConnectionType::Wireless,
        "t1" => ConnectionType::T1,
        "e1" => ConnectionType::E1,
        "10m-ethernet" | "10m" => ConnectionType::Ethernet10M,
        "100m-ethernet" | "100m" => ConnectionType::Ethernet100M,
        "1g-ethernet" | "1g" => ConnectionType::Ethernet1G,
        other => anyhow::bail!("unknown connection type: {other}"),
    };
    Ok(connection)
}

/// Run a witness node until interrupted
async fn run_serve(
    bind: String,
    proxy: Option<String>,
    params: TransportParameters,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let proxy = match proxy {
        Some(value) => Some(Contact::new(value.parse()?)),
        None => None,
    };

    let forwards = proxy.is_some();
    let config = DetectionServiceConfig { proxy, params };
    let (transport, _service) = DetectionService::serve(addr, config).await?;

    println!("Scry witness node");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", transport.local_addr()?);
    println!("Forwarding: {}", if forwards { "enabled" } else { "disabled" });
    println!("\nPress Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    transport.close().await?;

    Ok(())
}

/// Classify this node's NAT and print the verdict
async fn run_detect(
    bind: String,
    endpoint: Option<String>,
    all_contacts: bool,
    contacts: Vec<String>,
    params: TransportParameters,
) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    let transport = UdpTransport::bind(addr, params.clone()).await?;
    let local = match endpoint {
        Some(value) => value.parse()?,
        None => transport.local_addr()?,
    };
    let contacts = contacts
        .iter()
        .map(|value| value.parse().map(Contact::new))
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!(%local, candidates = contacts.len(), "starting detection");

    let detector = NatDetector::new(
        Arc::new(transport.clone()),
        local,
        params,
        tokio::runtime::Handle::current(),
    );
    let use_rendezvous = !all_contacts;
    let detection = tokio::task::spawn_blocking(move || detector.detect(&contacts, use_rendezvous))
        .await??;

    println!("NAT type: {}", detection.nat_type);
    println!("Rendezvous endpoint: {}", detection.rendezvous_endpoint);

    transport.close().await?;
    Ok(())
}
