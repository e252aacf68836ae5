//! `settd` — the sett credential store daemon.
//!
//! Binary entrypoint that ties the sett components into a running node:
//! the embedded engine, one replication worker per peer, the maintenance
//! and backup cycles, and the admin HTTP API.
//!
//! # Usage
//!
//! ```text
//! settd start                      # start a node with defaults
//! settd start -c sett.toml         # start with a config file
//! settd start -d ./node2           # second instance in another directory
//! settd identity                   # print this node's identity
//! settd identity -d ./node2
//! ```

mod admin;
mod config;
mod handler;
mod telemetry;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ed25519_dalek::{SigningKey, VerifyingKey};
use iroh::protocol::Router;
use iroh::{EndpointAddr, SecretKey};
use sett_backup::{Backup, BackupConfig, FsObjectStore, ObjectStore};
use sett_codec::Roster;
use sett_db::{Db, DbError, DbOptions};
use sett_net::{SettTransport, Transport, cluster_alpn};
use sett_repl::{PeerHandle, ReplicationService, Replicator, ReplicatorConfig};
use sett_types::{NodeId, PeerEntry};
use tracing::{error, info, warn};

use config::CliConfig;
use handler::SettProtocol;

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "settd", version, about = "sett replicated credential store daemon")]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sett node.
    Start {
        /// Override data directory (useful for running multiple instances).
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Override the admin API listen address (e.g. "127.0.0.1:4841").
        #[arg(short = 'l', long)]
        admin_listen_addr: Option<String>,
    },

    /// Print this node's identity (node id, public key, endpoint id).
    Identity {
        /// Data directory holding (or receiving) the node key.
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = CliConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Start {
            data_dir,
            admin_listen_addr,
        } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            if let Some(addr) = admin_listen_addr {
                config.node.admin_listen_addr = addr;
            }
            cmd_start(config).await
        }
        Commands::Identity { data_dir } => {
            if let Some(dir) = data_dir {
                config.node.data_dir = dir;
            }
            cmd_identity(&config)
        }
    }
}

// -----------------------------------------------------------------------
// settd start
// -----------------------------------------------------------------------

async fn cmd_start(config: CliConfig) -> Result<()> {
    telemetry::init(&config.log.level);

    std::fs::create_dir_all(&config.node.data_dir).context("failed to create data directory")?;

    // --- Node identity ---
    // One 32-byte secret drives both the iroh endpoint identity (transport
    // authentication) and the ed25519 log entry signatures.
    let secret_key = load_or_create_secret_key(&config.node.data_dir)?;
    let signing_key = SigningKey::from_bytes(&secret_key.to_bytes());
    let verifying_key = signing_key.verifying_key();
    let node_id = if config.node.id.is_empty() {
        derive_node_id(&verifying_key)
    } else {
        NodeId::from_hex(&config.node.id).context("invalid node.id in config")?
    };

    // --- Roster ---
    let mut peer_entries = Vec::new();
    let mut peer_handles = Vec::new();
    for peer in &config.peers {
        let (entry, handle) = resolve_peer(peer)?;
        peer_entries.push(entry);
        peer_handles.push(handle);
    }
    let roster = Roster::from_peers((node_id, verifying_key), &peer_entries)
        .map_err(|e| anyhow::anyhow!("invalid peer public key: {e}"))?;

    // --- Engine ---
    let options = DbOptions {
        require_expiry: config.node.require_expiry,
        tombstone_retention_secs: config.tombstone_retention().as_secs(),
        log_retention_secs: config.log_retention().as_secs(),
    };
    let db = Arc::new(
        Db::open(
            config.node.data_dir.join("db"),
            node_id,
            signing_key,
            roster.clone(),
            options,
        )
        .context("failed to open engine")?,
    );
    info!(%node_id, clock = db.clock_value(), "engine ready");

    // --- Transport + incoming connection handler ---
    // The ALPN binds connections to this exact roster; the handshake
    // rejects nodes from other clusters outright.
    let alpn = cluster_alpn(&roster_digest(node_id, &verifying_key, &peer_entries));
    let transport = Arc::new(
        SettTransport::bind_with_alpn(secret_key, iroh::RelayMode::Default, alpn.clone())
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind transport: {e}"))?,
    );
    info!(endpoint_id = %transport.endpoint_id(), "transport ready");

    let service = Arc::new(ReplicationService::new(db.clone()));
    let router = Router::builder(transport.endpoint().clone())
        .accept(alpn, SettProtocol::new(service))
        .spawn();

    // --- Shutdown coordination ---
    // A watch channel lets background workers observe when shutdown begins
    // so they abort long-running work (a mid-flight pull, an upload)
    // instead of blocking the shutdown sequence.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // --- Replication workers, one per peer ---
    let replicator_config = ReplicatorConfig {
        interval: config.replication_interval(),
        batch: config.replication_batch(),
        deadline: config.replication_deadline(),
    };
    for handle in peer_handles {
        let replicator = Replicator::new(
            db.clone(),
            transport.clone() as Arc<dyn Transport>,
            handle,
            replicator_config.clone(),
        );
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { replicator.run(rx).await });
    }
    info!(peers = config.peers.len(), "replication workers started");

    // --- Maintenance worker: TTL GC + log retention ---
    {
        let db = db.clone();
        let mut rx = shutdown_rx.clone();
        let sweep_interval = config.maintenance_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = rx.changed() => break,
                }
                match db.run_ttl_gc_once() {
                    Ok(stats) if stats.expired_removed > 0 || stats.tombstones_purged > 0 => {
                        info!(
                            expired = stats.expired_removed,
                            tombstones = stats.tombstones_purged,
                            "gc sweep finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => fail_on_storage_error(&e),
                }
                match db.trim_log_once() {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "log retention trim finished"),
                    Err(e) => fail_on_storage_error(&e),
                }
            }
        });
    }

    // --- Backup worker ---
    if config.backup.enabled {
        let store: Arc<dyn ObjectStore> = Arc::new(
            FsObjectStore::new(&config.backup.endpoint)
                .map_err(|e| anyhow::anyhow!("failed to open backup store: {e}"))?,
        );
        let backup = Backup::new(
            db.clone(),
            store,
            BackupConfig {
                bucket: config.backup.bucket.clone(),
                prefix: config.backup.prefix.clone(),
                interval: config.backup_interval(),
            },
        );
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { backup.run(rx).await });
    } else {
        info!("backups disabled");
    }

    // --- Admin HTTP API ---
    let listener = tokio::net::TcpListener::bind(&config.node.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.node.admin_listen_addr))?;
    info!(addr = %config.node.admin_listen_addr, "admin API ready");
    axum::serve(listener, admin::router(db.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("admin server failed")?;

    // --- Graceful shutdown sequence ---

    // 1. Signal background workers to stop; replication aborts mid-batch
    //    without advancing high-water marks.
    let _ = shutdown_tx.send(true);

    // 2. Shut down the iroh router (stops accepting new connections,
    //    waits for in-flight handlers, then closes the endpoint).
    info!("shutting down router");
    router.shutdown().await.context("router shutdown failed")?;

    // 3. The engine closes last, when the final Arc drops; every
    //    acknowledged write is already fsynced.
    info!("shutdown complete");
    Ok(())
}

/// Storage failures are fatal: log, stop accepting writes, exit non-zero.
fn fail_on_storage_error(err: &DbError) {
    match err {
        DbError::Storage(_) | DbError::Io(_) => {
            error!(%err, "storage failure, terminating");
            std::process::exit(1);
        }
        _ => warn!(%err, "maintenance sweep failed"),
    }
}

// -----------------------------------------------------------------------
// settd identity
// -----------------------------------------------------------------------

fn cmd_identity(config: &CliConfig) -> Result<()> {
    std::fs::create_dir_all(&config.node.data_dir)?;
    let secret_key = load_or_create_secret_key(&config.node.data_dir)?;
    let signing_key = SigningKey::from_bytes(&secret_key.to_bytes());
    let verifying_key = signing_key.verifying_key();
    let node_id = if config.node.id.is_empty() {
        derive_node_id(&verifying_key)
    } else {
        NodeId::from_hex(&config.node.id).context("invalid node.id in config")?
    };

    println!("node_id:     {node_id}");
    println!("public_key:  {}", hex(&verifying_key.to_bytes()));
    println!("endpoint_id: {}", secret_key.public());
    Ok(())
}

// -----------------------------------------------------------------------
// Identity and peer helpers
// -----------------------------------------------------------------------

/// Load or create the persistent node secret from `data_dir/node.key`.
///
/// On first run, generates a new random ed25519 key and writes it out. On
/// subsequent runs, reads the existing key, so the node keeps a stable
/// identity across restarts.
fn load_or_create_secret_key(data_dir: &Path) -> Result<SecretKey> {
    let key_path = data_dir.join("node.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("failed to read node.key")?;
        anyhow::ensure!(bytes.len() == 32, "node.key must be exactly 32 bytes");
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        let key = SecretKey::from_bytes(&arr);
        info!(endpoint_id = %key.public().fmt_short(), "loaded existing node key");
        Ok(key)
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let key = SecretKey::from(bytes);
        std::fs::write(&key_path, key.to_bytes()).context("failed to write node.key")?;
        info!(
            path = %key_path.display(),
            endpoint_id = %key.public().fmt_short(),
            "generated new node key"
        );
        Ok(key)
    }
}

/// Default node id: the first 16 bytes of the public signing key.
fn derive_node_id(verifying_key: &VerifyingKey) -> NodeId {
    let bytes = verifying_key.to_bytes();
    let mut id = [0u8; 16];
    id.copy_from_slice(&bytes[..16]);
    NodeId::from(id)
}

/// Resolve one configured peer into its roster entry and dial handle.
fn resolve_peer(peer: &config::PeerSection) -> Result<(PeerEntry, PeerHandle)> {
    let public_key = parse_hex32(&peer.public_key)
        .with_context(|| format!("invalid peer public_key {:?}", peer.public_key))?;
    let peer_verifying = VerifyingKey::from_bytes(&public_key)
        .map_err(|e| anyhow::anyhow!("peer public_key is not a valid ed25519 key: {e}"))?;

    let node_id = if peer.node_id.is_empty() {
        derive_node_id(&peer_verifying)
    } else {
        NodeId::from_hex(&peer.node_id).context("invalid peer node_id")?
    };

    let addr = if peer.address.is_empty() {
        // The public key doubles as the endpoint identity; iroh finds a
        // path via relay discovery.
        let endpoint_id = iroh::EndpointId::from_bytes(&public_key)
            .map_err(|e| anyhow::anyhow!("peer public_key is not a valid endpoint id: {e}"))?;
        EndpointAddr::new(endpoint_id)
    } else {
        parse_peer_addr(&peer.address)?
    };

    Ok((
        PeerEntry {
            node_id,
            address: peer.address.clone(),
            public_key,
        },
        PeerHandle { node_id, addr },
    ))
}

/// Parse a peer address string: `<endpoint_id>` or `<endpoint_id>@host:port`.
fn parse_peer_addr(s: &str) -> Result<EndpointAddr> {
    let (id_str, addr_str) = match s.split_once('@') {
        Some((id, addr)) => (id, Some(addr)),
        None => (s, None),
    };

    let endpoint_id: iroh::EndpointId = id_str
        .parse()
        .context("invalid endpoint ID (expected hex-encoded public key)")?;

    let mut endpoint_addr = EndpointAddr::new(endpoint_id);
    if let Some(addr) = addr_str {
        let socket_addr: SocketAddr = addr
            .parse()
            .context("invalid socket address in peer (expected host:port)")?;
        endpoint_addr = endpoint_addr.with_ip_addr(socket_addr);
    }

    Ok(endpoint_addr)
}

/// Deterministic digest of the cluster membership, identical on every
/// node: sorted `(node_id, public_key)` pairs, concatenated.
fn roster_digest(
    local_id: NodeId,
    local_key: &VerifyingKey,
    peers: &[PeerEntry],
) -> Vec<u8> {
    let mut members: Vec<(NodeId, [u8; 32])> = peers
        .iter()
        .map(|p| (p.node_id, p.public_key))
        .collect();
    members.push((local_id, local_key.to_bytes()));
    members.sort();

    let mut digest = Vec::with_capacity(members.len() * 48);
    for (node_id, key) in members {
        digest.extend_from_slice(node_id.as_bytes());
        digest.extend_from_slice(&key);
    }
    digest
}

fn parse_hex32(s: &str) -> Result<[u8; 32]> {
    anyhow::ensure!(s.len() == 64, "expected 64 hex chars, got {}", s.len());
    let mut bytes = [0u8; 32];
    for (i, chunk) in bytes.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).context("invalid hex")?;
    }
    Ok(bytes)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// -----------------------------------------------------------------------
// Signal handling
// -----------------------------------------------------------------------

/// Wait for a SIGTERM or SIGINT (Ctrl-C) signal.
///
/// On the first signal, the returned future resolves and initiates
/// graceful shutdown (admin server stops accepting, in-flight requests
/// drain, workers abort, router closes). If a second signal arrives while
/// shutdown is in progress, the process exits immediately.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT (Ctrl-C), initiating graceful shutdown"),
        () = terminate => info!("received SIGTERM, initiating graceful shutdown"),
    }

    // If a second signal arrives during shutdown, exit immediately.
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        warn!("received second signal during shutdown — forcing exit");
        std::process::exit(1);
    });
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_parse_peer_addr_endpoint_id_only() {
        let key = {
            use rand::RngCore;
            let mut b = [0u8; 32];
            rand::rng().fill_bytes(&mut b);
            SecretKey::from(b)
        };
        let id_str = key.public().to_string();

        let addr = parse_peer_addr(&id_str).unwrap();
        assert_eq!(addr.id, key.public());
        assert!(addr.is_empty()); // no direct addresses, relay-only
    }

    #[test]
    fn test_parse_peer_addr_with_address() {
        let key = {
            use rand::RngCore;
            let mut b = [0u8; 32];
            rand::rng().fill_bytes(&mut b);
            SecretKey::from(b)
        };
        let seed = format!("{}@127.0.0.1:4840", key.public());

        let addr = parse_peer_addr(&seed).unwrap();
        assert!(!addr.is_empty()); // has a direct address
    }

    #[test]
    fn test_parse_peer_addr_invalid() {
        assert!(parse_peer_addr("not-a-valid-key").is_err());
        assert!(parse_peer_addr("abc123@not-a-valid-addr").is_err());
    }

    #[test]
    fn test_derive_node_id_is_stable() {
        let key = test_key(7).verifying_key();
        assert_eq!(derive_node_id(&key), derive_node_id(&key));
        assert_ne!(
            derive_node_id(&key),
            derive_node_id(&test_key(8).verifying_key())
        );
    }

    #[test]
    fn test_roster_digest_is_order_independent() {
        let a = test_key(1);
        let b = test_key(2);
        let a_id = derive_node_id(&a.verifying_key());
        let b_id = derive_node_id(&b.verifying_key());

        let entry = |id: NodeId, key: &SigningKey| PeerEntry {
            node_id: id,
            address: String::new(),
            public_key: key.verifying_key().to_bytes(),
        };

        // Node A's view (B is its peer) and node B's view (A is its peer)
        // must derive the same digest, or they could never connect.
        let from_a = roster_digest(a_id, &a.verifying_key(), &[entry(b_id, &b)]);
        let from_b = roster_digest(b_id, &b.verifying_key(), &[entry(a_id, &a)]);
        assert_eq!(from_a, from_b);
    }

    #[test]
    fn test_parse_hex32() {
        assert!(parse_hex32(&"ab".repeat(32)).is_ok());
        assert!(parse_hex32("abcd").is_err());
        assert!(parse_hex32(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_secret_key_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_secret_key(dir.path()).unwrap();
        let second = load_or_create_secret_key(dir.path()).unwrap();
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn test_cli_parses_start_overrides() {
        use clap::Parser;
        let cli = Cli::try_parse_from([
            "settd",
            "start",
            "--data-dir",
            "/tmp/n2",
            "-l",
            "127.0.0.1:9000",
        ])
        .unwrap();
        match cli.command {
            Commands::Start {
                data_dir,
                admin_listen_addr,
            } => {
                assert_eq!(data_dir.as_deref(), Some(Path::new("/tmp/n2")));
                assert_eq!(admin_listen_addr.as_deref(), Some("127.0.0.1:9000"));
            }
            _ => panic!("expected start command"),
        }
    }
}
