//! Network transport built on iroh QUIC.
//!
//! [`SettTransport`] wraps an iroh [`Endpoint`] and provides:
//! - Connection pooling (reuse connections to the same peer).
//! - Request/response over bi-directional streams with length-prefixed
//!   postcard encoding.

use std::collections::HashMap;
use std::sync::Arc;

use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::{Endpoint, EndpointAddr, SecretKey};
use sett_types::NodeId;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::message::{EntriesBatch, SettMessage, SnapshotRecord};
use crate::{SETT_ALPN, Transport};

/// Maximum message size: 64 MB. A snapshot response carries the full
/// record space of a node.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Network transport for inter-node replication.
///
/// Manages an iroh QUIC endpoint and a connection pool to peer nodes.
pub struct SettTransport {
    endpoint: Endpoint,
    /// Cached connections to remote peers, keyed by their iroh endpoint ID.
    connections: Arc<RwLock<HashMap<iroh::EndpointId, Connection>>>,
    /// ALPN used for outgoing connections. Derived from the roster digest
    /// so that nodes from different clusters cannot connect.
    alpn: Vec<u8>,
}

impl SettTransport {
    /// Create a new transport with the default ALPN (`sett/0`).
    ///
    /// Use [`iroh::RelayMode::Disabled`] for tests that don't need relay
    /// servers.
    pub async fn bind(secret_key: SecretKey, relay_mode: iroh::RelayMode) -> Result<Self, NetError> {
        Self::bind_with_alpn(secret_key, relay_mode, SETT_ALPN.to_vec()).await
    }

    /// Create a new transport with a cluster-specific ALPN.
    ///
    /// Use [`crate::cluster_alpn`] to derive the ALPN from the roster.
    pub async fn bind_with_alpn(
        secret_key: SecretKey,
        relay_mode: iroh::RelayMode,
        alpn: Vec<u8>,
    ) -> Result<Self, NetError> {
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![alpn.clone()])
            .relay_mode(relay_mode)
            .bind()
            .await
            .map_err(|e| NetError::Endpoint(e.to_string()))?;

        Ok(Self {
            endpoint,
            connections: Arc::new(RwLock::new(HashMap::new())),
            alpn,
        })
    }

    /// Return a reference to the underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Return the [`EndpointAddr`] of this transport (ID + addresses).
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Return this endpoint's public identity.
    pub fn endpoint_id(&self) -> iroh::EndpointId {
        self.endpoint.id()
    }

    // -------------------------------------------------------------------
    // Connection management
    // -------------------------------------------------------------------

    /// Get or establish a QUIC connection to a remote peer.
    async fn get_connection(&self, addr: EndpointAddr) -> Result<Connection, NetError> {
        let remote_id = addr.id;

        {
            let cache = self.connections.read().await;
            if let Some(conn) = cache.get(&remote_id) {
                // Verify the connection is still alive.
                if conn.close_reason().is_none() {
                    return Ok(conn.clone());
                }
            }
        }

        debug!(remote = %remote_id.fmt_short(), "connecting to peer");
        let conn = self
            .endpoint
            .connect(addr, &self.alpn)
            .await
            .map_err(|e| NetError::Connect(e.to_string()))?;

        {
            let mut cache = self.connections.write().await;
            cache.insert(remote_id, conn.clone());
        }

        Ok(conn)
    }

    /// Remove a cached connection (e.g. after detecting it's dead).
    pub async fn remove_connection(&self, id: &iroh::EndpointId) {
        let mut cache = self.connections.write().await;
        cache.remove(id);
    }

    // -------------------------------------------------------------------
    // Request/response
    // -------------------------------------------------------------------

    /// Send a request on a new bi-directional stream and await the response.
    pub async fn request(
        &self,
        addr: EndpointAddr,
        request: &SettMessage,
    ) -> Result<SettMessage, NetError> {
        let conn = self.get_connection(addr).await?;

        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| NetError::StreamOpen(e.to_string()))?;

        Self::send_on_stream(&mut send, request).await?;
        Self::recv_message(&mut recv).await
    }

    /// Send a message on an already-open send stream.
    ///
    /// The message is length-prefixed (4-byte big-endian) then
    /// postcard-encoded.
    pub async fn send_on_stream(
        send: &mut SendStream,
        message: &SettMessage,
    ) -> Result<(), NetError> {
        let payload =
            postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;
        send.write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        send.write_all(&payload).await?;
        send.finish()?;
        Ok(())
    }

    /// Receive a message from a receive stream.
    ///
    /// Reads a 4-byte big-endian length prefix, then reads that many bytes
    /// and deserializes with postcard.
    pub async fn recv_message(recv: &mut RecvStream) -> Result<SettMessage, NetError> {
        let mut len_buf = [0u8; 4];
        recv.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(NetError::Serialization(format!(
                "message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"
            )));
        }

        let payload = recv.read_to_end(len).await?;
        let message: SettMessage =
            postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))?;

        Ok(message)
    }

    // -------------------------------------------------------------------
    // Incoming message handling
    // -------------------------------------------------------------------

    /// Accept a single incoming connection and return it.
    ///
    /// Returns `None` if the endpoint is shutting down.
    pub async fn accept(&self) -> Option<Connection> {
        let incoming = self.endpoint.accept().await?;
        match incoming.await {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!("failed to accept connection: {e}");
                None
            }
        }
    }

    /// Handle incoming bi-directional streams on a connection.
    ///
    /// For each incoming bi stream, reads a request and calls the handler,
    /// which must produce a response message. The response is sent back on
    /// the same stream. Runs until the connection is closed.
    pub async fn handle_bi_streams<F, Fut>(conn: Connection, handler: F)
    where
        F: Fn(SettMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Option<SettMessage>> + Send,
    {
        loop {
            match conn.accept_bi().await {
                Ok((mut send, mut recv)) => match Self::recv_message(&mut recv).await {
                    Ok(request) => {
                        if let Some(response) = handler(request).await
                            && let Err(e) = Self::send_on_stream(&mut send, &response).await
                        {
                            warn!("failed to send response: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("failed to decode bi-stream request: {e}");
                    }
                },
                Err(e) => {
                    debug!("connection closed (bi): {e}");
                    break;
                }
            }
        }
    }

    /// Gracefully close the transport.
    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}

#[async_trait::async_trait]
impl Transport for SettTransport {
    async fn pull_entries(
        &self,
        addr: EndpointAddr,
        node_id: NodeId,
        from_clock: u64,
        limit: u32,
    ) -> Result<EntriesBatch, NetError> {
        let response = self
            .request(
                addr,
                &SettMessage::EntriesRequest {
                    node_id,
                    from_clock,
                    limit,
                },
            )
            .await?;

        match response {
            SettMessage::EntriesResponse {
                entries,
                earliest_retained,
                current_clock,
            } => Ok(EntriesBatch {
                entries,
                earliest_retained,
                current_clock,
            }),
            _ => Err(NetError::UnexpectedResponse("entries request")),
        }
    }

    async fn pull_snapshot(
        &self,
        addr: EndpointAddr,
    ) -> Result<(Vec<SnapshotRecord>, u64), NetError> {
        let response = self.request(addr, &SettMessage::SnapshotRequest).await?;
        match response {
            SettMessage::SnapshotResponse {
                records,
                current_clock,
            } => Ok((records, current_clock)),
            _ => Err(NetError::UnexpectedResponse("snapshot request")),
        }
    }

    async fn ping(&self, addr: EndpointAddr, timestamp: u64) -> Result<u64, NetError> {
        let response = self.request(addr, &SettMessage::Ping { timestamp }).await?;
        match response {
            SettMessage::Pong { timestamp } => Ok(timestamp),
            _ => Err(NetError::UnexpectedResponse("ping")),
        }
    }
}
