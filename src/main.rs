//! Burrow relay daemon
//!
//! Hosts one encrypted UDP relay instance, local or server side, on a
//! single-threaded runtime.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use burrow::cipher::{ChaChaPacketCipher, PacketCipher, PlainCipher};
use burrow::config::RelayConfig;
use burrow::relay::{RelayMode, RelayOptions, RelayPool, TargetAddr};
use burrow::resolver::SystemResolver;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "burrowd", version, about = "Burrow: encrypted UDP relay")]
struct Args {
    /// Relay side: local (SOCKS5-UDP front end) or server
    #[arg(short, long, default_value = "local")]
    mode: String,

    /// Listen address
    #[arg(short, long, default_value = "127.0.0.1:1080")]
    listen: SocketAddr,

    /// Relay server address (local mode)
    #[arg(short, long)]
    server: Option<SocketAddr>,

    /// Forced destination host:port; disables SOCKS5-UDP parsing
    /// (local mode)
    #[arg(short, long)]
    tunnel: Option<String>,

    /// Hex-encoded 32-byte key
    #[arg(short, long, conflicts_with = "password")]
    key: Option<String>,

    /// Password the key is derived from
    #[arg(short, long)]
    password: Option<String>,

    /// Relay traffic unencrypted (testing only)
    #[arg(long, conflicts_with_all = ["key", "password"])]
    plain: bool,

    /// Pin upstream sockets to a network device (Linux only)
    #[arg(short, long)]
    iface: Option<String>,

    /// JSON config file with relay options
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn parse_tunnel(input: &str) -> Result<TargetAddr, String> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(TargetAddr::Ip(addr));
    }
    let (host, port) = input.rsplit_once(':').ok_or("expected host:port")?;
    let port: u16 = port.parse().map_err(|_| format!("invalid port in {}", input))?;
    if host.is_empty() || host.len() > 255 {
        return Err(format!("invalid hostname in {}", input));
    }
    Ok(TargetAddr::Domain(host.to_string(), port))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("burrow=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match RelayConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load {}: {}", path.display(), e);
                return;
            }
        },
        None => RelayConfig::default(),
    };

    let cipher: Arc<dyn PacketCipher> = if args.plain {
        Arc::new(PlainCipher)
    } else if let Some(key) = &args.key {
        match ChaChaPacketCipher::from_hex(key) {
            Ok(cipher) => Arc::new(cipher),
            Err(e) => {
                error!("Invalid key: {}", e);
                return;
            }
        }
    } else if let Some(password) = &args.password {
        Arc::new(ChaChaPacketCipher::from_password(password))
    } else {
        error!("One of --key, --password or --plain is required");
        return;
    };

    let mode = match args.mode.as_str() {
        "local" => {
            let Some(remote_addr) = args.server else {
                error!("Local mode needs --server");
                return;
            };
            let tunnel_addr = match args.tunnel.as_deref().map(parse_tunnel) {
                Some(Ok(target)) => Some(target),
                Some(Err(e)) => {
                    error!("Invalid --tunnel: {}", e);
                    return;
                }
                None => None,
            };
            RelayMode::Local { remote_addr, tunnel_addr }
        }
        "server" => {
            if args.server.is_some() || args.tunnel.is_some() {
                error!("--server and --tunnel only apply to local mode");
                return;
            }
            RelayMode::Server
        }
        other => {
            error!("Invalid mode {:?}. Use: local, server", other);
            return;
        }
    };

    info!("Burrow v{} starting in {} mode on {}", VERSION, args.mode, args.listen);

    let mut pool = RelayPool::new();
    let bound = pool
        .add(RelayOptions {
            listen: args.listen,
            mode,
            cipher,
            timeout: config.timeout(),
            mtu: Some(config.mtu),
            reuse_port: config.reuse_port,
            bind_local_addr4: config.bind_local_addr4,
            bind_local_addr6: config.bind_local_addr6,
            bind_interface: args.iface.clone(),
            resolver: Arc::new(SystemResolver),
        })
        .await;
    let bound = match bound {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to start relay: {}", e);
            return;
        }
    };

    info!("Burrow running on {}", bound);

    // Wait for shutdown
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    for relay in pool.relays() {
        info!(
            "Relayed {} bytes out, {} bytes back, {} live connections",
            relay.tx_bytes(),
            relay.rx_bytes(),
            relay.connection_count()
        );
    }
    pool.shutdown_all();
}
