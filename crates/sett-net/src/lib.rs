//! Network protocol on iroh QUIC.
//!
//! This crate implements sett's peer replication transport on top of
//! [iroh] QUIC connections:
//!
//! - [`SettMessage`] — the wire protocol (postcard-serialized).
//! - [`SettTransport`] — manages an iroh [`Endpoint`], connection pooling,
//!   and request/response streams.
//!
//! Peer connections are mutually authenticated: a peer's configured public
//! key *is* its iroh endpoint identity, so the QUIC handshake itself
//! rejects nodes outside the roster. A cluster-specific ALPN (see
//! [`cluster_alpn`]) additionally stops nodes from different clusters from
//! connecting at all.
//!
//! [`Endpoint`]: iroh::Endpoint

mod error;
mod message;
mod transport;

pub use error::NetError;
pub use message::{EntriesBatch, SettMessage, SnapshotRecord};
pub use transport::SettTransport;

use sett_types::NodeId;

/// Trait abstracting the pull operations the replication workers use.
///
/// Lets tests substitute a loopback transport wired directly to another
/// engine, avoiding real QUIC endpoints and network access.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Pull a batch of log entries for `node_id` starting at `from_clock`.
    async fn pull_entries(
        &self,
        addr: iroh::EndpointAddr,
        node_id: NodeId,
        from_clock: u64,
        limit: u32,
    ) -> Result<EntriesBatch, NetError>;

    /// Pull the remote node's full record space (snapshot catch-up).
    /// Returns the records plus the remote's current clock, where log
    /// tailing resumes.
    async fn pull_snapshot(
        &self,
        addr: iroh::EndpointAddr,
    ) -> Result<(Vec<SnapshotRecord>, u64), NetError>;

    /// Round-trip a ping, returning the remote's echo timestamp.
    async fn ping(&self, addr: iroh::EndpointAddr, timestamp: u64) -> Result<u64, NetError>;
}

/// Default ALPN protocol identifier (no cluster binding).
pub const SETT_ALPN: &[u8] = b"sett/0";

/// Derive a cluster-specific ALPN from the roster digest.
///
/// The ALPN is `sett/0/<first 16 hex chars of blake3(seed)>`. Nodes with
/// different rosters get different ALPNs and cannot establish QUIC
/// connections to each other — the TLS handshake itself rejects the
/// mismatch before any application data is exchanged.
pub fn cluster_alpn(seed: &[u8]) -> Vec<u8> {
    let hash = blake3::hash(seed);
    let hex = hash.to_hex();
    format!("sett/0/{}", &hex[..16]).into_bytes()
}
