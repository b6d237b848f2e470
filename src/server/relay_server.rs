//! QUIC relay server
//!
//! Accepts connections, assigns each a connection id and hands it to a
//! [`ConnectionHandler`] bound to the shared [`Hub`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::Endpoint;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::current_timestamp;
use crate::error::{DropError, Result};
use crate::protocol::frame::MAX_FRAME_SIZE;
use crate::protocol::messages::{ConnectionId, PeerInfo, RoomId};
use crate::transfer::TransferPolicy;

use super::connection_handler::ConnectionHandler;
use super::hub::Hub;

/// ALPN protocol identifier
pub const ALPN_PROTOCOL: &[u8] = b"roomdrop";

/// Default listening port
pub const DEFAULT_PORT: u16 = 4433;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// Largest frame payload accepted from clients
    pub max_frame_size: usize,
    /// Transfer size limits
    pub transfer: TransferPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            max_connections: 10000,
            idle_timeout: Duration::from_secs(300),
            max_frame_size: MAX_FRAME_SIZE,
            transfer: TransferPolicy::default(),
        }
    }
}

/// Active connection tracking
struct ActiveConnection {
    remote_addr: SocketAddr,
    connected_at: u64,
    handler: Arc<ConnectionHandler>,
}

/// Room-based file relay server
pub struct RelayServer {
    config: ServerConfig,
    endpoint: Option<Endpoint>,
    hub: Arc<Hub>,
    connections: Arc<RwLock<HashMap<ConnectionId, ActiveConnection>>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Self {
        let mut policy = config.transfer.clone();
        policy.max_message_size = config.max_frame_size;
        let hub = Arc::new(Hub::new(policy));
        Self {
            config,
            endpoint: None,
            hub,
            connections: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind and serve until the endpoint closes
    pub async fn start(&mut self) -> Result<()> {
        self.bind()?;
        self.serve().await
    }

    /// Create the QUIC endpoint and return the bound address
    pub fn bind(&mut self) -> Result<SocketAddr> {
        info!("Starting relay server on {}", self.config.bind_addr);

        // Self-signed certificate; clients skip verification
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .map_err(|e| DropError::config(format!("Failed to generate certificate: {}", e)))?;

        let cert_der = CertificateDer::from(
            cert.serialize_der()
                .map_err(|e| DropError::config(format!("Failed to serialize certificate: {}", e)))?,
        );
        let key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));

        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)
            .map_err(|e| DropError::config(format!("Failed to configure TLS: {}", e)))?;

        tls_config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
        tls_config.max_early_data_size = 0;

        let idle_timeout = self
            .config
            .idle_timeout
            .try_into()
            .map_err(|e| DropError::config(format!("Invalid idle timeout: {}", e)))?;

        let mut transport_config = quinn::TransportConfig::default();
        transport_config.max_concurrent_bidi_streams(4u32.into());
        transport_config.max_concurrent_uni_streams(100u32.into());
        transport_config.max_idle_timeout(Some(idle_timeout));

        let mut quic_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
                .map_err(|e| DropError::config(format!("Failed to create QUIC config: {}", e)))?,
        ));
        quic_config.transport_config(Arc::new(transport_config));

        let endpoint = Endpoint::server(quic_config, self.config.bind_addr)
            .map_err(|e| DropError::network(format!("Failed to create endpoint: {}", e)))?;

        let local = endpoint.local_addr()?;
        info!("Server listening on {}", local);

        self.endpoint = Some(endpoint);
        Ok(local)
    }

    /// Accept connections on a bound endpoint
    pub async fn serve(&self) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| DropError::config("Server is not bound"))?;
        self.accept_connections(endpoint).await
    }

    async fn accept_connections(&self, endpoint: Endpoint) -> Result<()> {
        while let Some(incoming) = endpoint.accept().await {
            {
                let conns = self.connections.read().await;
                if conns.len() >= self.config.max_connections {
                    warn!("Connection limit reached, rejecting connection");
                    incoming.refuse();
                    continue;
                }
            }

            let server = self.clone_ref();
            tokio::spawn(async move {
                if let Err(e) = server.handle_incoming(incoming).await {
                    error!("Connection handling failed: {}", e);
                }
            });
        }

        warn!("Endpoint stopped accepting connections");
        Ok(())
    }

    async fn handle_incoming(&self, incoming: quinn::Incoming) -> Result<()> {
        let connection = incoming.await?;
        let remote_addr = connection.remote_address();
        let conn_id = uuid::Uuid::new_v4().to_string();

        debug!("New connection {} from {}", conn_id, remote_addr);

        let handler = Arc::new(ConnectionHandler::new(
            connection,
            conn_id.clone(),
            Arc::clone(&self.hub),
            self.config.max_frame_size,
        ));

        self.connections.write().await.insert(
            conn_id.clone(),
            ActiveConnection {
                remote_addr,
                connected_at: current_timestamp(),
                handler: Arc::clone(&handler),
            },
        );

        let result = handler.run().await;
        self.cleanup_connection(&conn_id).await;
        result
    }

    async fn cleanup_connection(&self, conn_id: &str) {
        let Some(conn) = self.connections.write().await.remove(conn_id) else {
            return;
        };
        debug!(
            "Cleaned up connection {} from {} (up {:?}, idle {:?}, rtt {:?}, since {})",
            conn_id,
            conn.remote_addr,
            conn.handler.uptime(),
            conn.handler.idle_for().await,
            conn.handler.rtt().await,
            conn.connected_at
        );
    }

    /// Get server statistics
    pub async fn get_stats(&self) -> ServerStats {
        let hub = self.hub.stats().await;
        ServerStats {
            total_connections: self.connections.read().await.len(),
            total_rooms: hub.rooms,
            active_sessions: hub.active_sessions,
            reassembling: hub.reassembling,
            bind_address: self.local_addr().unwrap_or(self.config.bind_addr),
        }
    }

    /// Every room with its members, sorted by room id
    pub async fn room_snapshot(&self) -> Vec<(RoomId, Vec<PeerInfo>)> {
        self.hub.directory().snapshot().await
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    /// Close the endpoint and every connection on it
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"Server shutdown");
            endpoint.wait_idle().await;
            info!("Server shutdown complete");
        }
        Ok(())
    }

    /// Clone reference for spawning tasks
    pub fn clone_ref(&self) -> Arc<Self> {
        Arc::new(Self {
            config: self.config.clone(),
            endpoint: self.endpoint.clone(),
            hub: Arc::clone(&self.hub),
            connections: Arc::clone(&self.connections),
        })
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub total_connections: usize,
    pub total_rooms: usize,
    pub active_sessions: usize,
    pub reassembling: usize,
    pub bind_address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferMode;
    use crate::transfer::manager::relayable_size;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 4433);
        assert_eq!(config.max_connections, 10000);
        assert_eq!(config.transfer.max_direct_size, 50 * 1024 * 1024);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert!(server.endpoint.is_none());
        assert!(server.local_addr().is_none());
        assert!(server.serve().await.is_err());
    }

    #[test]
    fn test_frame_ceiling_caps_transfer_limits() {
        let server = RelayServer::new(ServerConfig {
            max_frame_size: 1024 * 1024,
            ..Default::default()
        });
        let hub = server.hub();
        let policy = hub.transfers().policy();
        assert_eq!(policy.max_message_size, 1024 * 1024);
        assert_eq!(
            policy.limit_for(TransferMode::Direct),
            relayable_size(1024 * 1024)
        );
        assert_eq!(
            policy.limit_for(TransferMode::Chunked),
            relayable_size(1024 * 1024)
        );
    }

    #[tokio::test]
    async fn test_server_stats() {
        let server = RelayServer::with_defaults();
        let stats = server.get_stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.total_rooms, 0);
        assert_eq!(stats.active_sessions, 0);
        assert!(server.room_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let mut server = RelayServer::new(ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        });
        let addr = server.bind().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        server.shutdown().await.unwrap();
        assert!(server.local_addr().is_none());
    }
}
