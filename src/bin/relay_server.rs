//! Standalone room relay server binary
//!
//! Run with:
//!   cargo run --bin relay-server -- --port 8080
//!
//! With TLS:
//!   cargo run --bin relay-server -- --port 8443 --cert cert.pem --key key.pem

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn, Level};

use tandem::network::RelayServer;

/// Room relay for tandem sessions
#[derive(Parser, Debug)]
#[command(name = "relay-server")]
#[command(about = "Room relay for tandem host/guest sessions")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Path to TLS certificate file (PEM format)
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        bail!("No certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| anyhow!("No private key found in {:?}", path))
}

fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Accept TLS connections and hand each upgraded socket to the relay
async fn run_tls_server(server: RelayServer, addr: SocketAddr, acceptor: TlsAcceptor) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("TLS relay listening on {}", addr);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };
        info!("New TLS connection from {}", peer_addr);

        let acceptor = acceptor.clone();
        let server = server.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("TLS handshake failed for {}: {}", peer_addr, e);
                    return;
                }
            };
            let ws_stream = match tokio_tungstenite::accept_async(tls_stream).await {
                Ok(s) => s,
                Err(e) => {
                    warn!("WebSocket upgrade failed for {}: {}", peer_addr, e);
                    return;
                }
            };
            if let Err(e) = server.serve(ws_stream).await {
                warn!("Connection error for {}: {}", peer_addr, e);
            }
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let tls_acceptor = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key)?)
        }
        (Some(_), None) | (None, Some(_)) => {
            error!("Both --cert and --key must be provided for TLS");
            bail!("TLS configuration incomplete");
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            None
        }
    };

    let server = RelayServer::new();
    match tls_acceptor {
        Some(acceptor) => run_tls_server(server, addr, acceptor).await?,
        None => server.run(&addr.to_string()).await?,
    }

    Ok(())
}
