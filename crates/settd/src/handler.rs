//! Incoming protocol handler for the sett daemon.
//!
//! Implements iroh's [`ProtocolHandler`] trait to handle incoming QUIC
//! connections dispatched by the iroh [`Router`]. Each connection's
//! bi-directional streams carry replication requests answered by the
//! [`ReplicationService`].
//!
//! [`ProtocolHandler`]: iroh::protocol::ProtocolHandler
//! [`Router`]: iroh::protocol::Router

use std::fmt;
use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::protocol::AcceptError;
use sett_net::SettTransport;
use sett_repl::ReplicationService;
use tracing::debug;

/// Handles incoming sett protocol connections.
///
/// The transport layer has already authenticated the remote: only
/// endpoints holding a roster key complete the handshake on the cluster
/// ALPN.
pub struct SettProtocol {
    service: Arc<ReplicationService>,
}

impl SettProtocol {
    /// Create a protocol handler answering from the given service.
    pub fn new(service: Arc<ReplicationService>) -> Self {
        Self { service }
    }
}

impl fmt::Debug for SettProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettProtocol").finish_non_exhaustive()
    }
}

impl iroh::protocol::ProtocolHandler for SettProtocol {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        debug!(remote = %conn.remote_id().fmt_short(), "peer connected");

        let service = self.service.clone();
        tokio::spawn(async move {
            SettTransport::handle_bi_streams(conn, move |request| {
                let service = service.clone();
                async move { service.handle(request) }
            })
            .await;
        });

        Ok(())
    }
}
