//! QUIC client for the room relay
//!
//! Opens the control stream on connect and turns every frame the relay sends
//! into a [`ClientEvent`]. Chunked files go out on their own data stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use quinn::{ClientConfig as QuinnClientConfig, Connection, Endpoint, RecvStream, SendStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};

use crate::error::{DropError, Result};
use crate::protocol::codec::Message;
use crate::protocol::frame::{FrameCodec, MAX_FRAME_SIZE};
use crate::protocol::messages::*;
use crate::server::{ALPN_PROTOCOL, DEFAULT_PORT};
use crate::transfer::TransferMode;

/// Relay client configuration
#[derive(Clone, Debug)]
pub struct RelayClientConfig {
    /// Relay address to connect to
    pub server_addr: SocketAddr,
    /// Client bind address (port 0 for auto)
    pub bind_addr: SocketAddr,
    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
    /// Largest frame accepted from the relay
    pub max_frame_size: usize,
    /// Chunk size used by `send_chunked`
    pub chunk_size: u32,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            connect_timeout_secs: 10,
            max_frame_size: MAX_FRAME_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Events that the client can receive
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A message from the relay
    Message(Message),
    /// Control stream closed
    Disconnected(String),
    /// Error occurred
    Error(DropError),
}

/// Client for the room relay
pub struct RelayClient {
    config: RelayClientConfig,
    connection: Option<Connection>,
    endpoint: Option<Endpoint>,
    control: Option<Arc<Mutex<SendStream>>>,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Self {
        Self {
            config,
            connection: None,
            endpoint: None,
            control: None,
        }
    }

    /// Connect and open the control stream
    pub async fn connect(&mut self) -> Result<mpsc::UnboundedReceiver<ClientEvent>> {
        info!("Connecting to relay at {}", self.config.server_addr);

        let client_config = self.configure_client()?;

        let mut endpoint = Endpoint::client(self.config.bind_addr)
            .map_err(|e| DropError::network(format!("Failed to create endpoint: {}", e)))?;
        endpoint.set_default_client_config(client_config);
        self.endpoint = Some(endpoint.clone());

        let connecting = endpoint
            .connect(self.config.server_addr, "localhost")
            .map_err(|e| DropError::connection(format!("Failed to initiate connection: {}", e)))?;

        let connection = tokio::time::timeout(
            Duration::from_secs(self.config.connect_timeout_secs),
            connecting,
        )
        .await
        .map_err(|_| DropError::timeout("Connection timeout"))?
        .map_err(|e| DropError::connection(format!("Failed to connect: {}", e)))?;

        info!("Connected to relay");

        let (send, recv) = connection.open_bi().await?;
        self.connection = Some(connection);
        self.control = Some(Arc::new(Mutex::new(send)));

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        self.start_receiver(recv, event_tx);

        Ok(event_rx)
    }

    fn configure_client(&self) -> Result<QuinnClientConfig> {
        // The relay presents a self-signed certificate
        let mut crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();

        crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

        Ok(QuinnClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
                .map_err(|e| DropError::config(format!("Failed to create QUIC config: {}", e)))?,
        )))
    }

    fn start_receiver(&self, mut recv: RecvStream, event_tx: mpsc::UnboundedSender<ClientEvent>) {
        let max_frame_size = self.config.max_frame_size;

        tokio::spawn(async move {
            let mut codec = FrameCodec::with_limit(max_frame_size);
            let mut buf = vec![0u8; 64 * 1024];

            loop {
                let n = match recv.read(&mut buf).await {
                    Ok(Some(n)) => n,
                    Ok(None) => {
                        let _ = event_tx.send(ClientEvent::Disconnected("stream closed".into()));
                        break;
                    }
                    Err(e) => {
                        let _ = event_tx
                            .send(ClientEvent::Disconnected(format!("Connection lost: {}", e)));
                        break;
                    }
                };
                codec.feed(&buf[..n]);

                loop {
                    match codec.decode_next() {
                        Ok(Some(frame)) => match Message::decode(&frame) {
                            Ok(message) => {
                                let _ = event_tx.send(ClientEvent::Message(message));
                            }
                            Err(e) => {
                                error!("Failed to parse {:?}: {}", frame.frame_type, e);
                                let _ = event_tx.send(ClientEvent::Error(
                                    DropError::serialization(format!(
                                        "Failed to parse {:?}: {}",
                                        frame.frame_type, e
                                    )),
                                ));
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            error!("Failed to decode frame: {}", e);
                            let _ = event_tx.send(ClientEvent::Disconnected(format!(
                                "Protocol error: {}",
                                e
                            )));
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Write one message to the control stream
    pub async fn send(&self, message: Message) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| DropError::connection("Not connected to relay"))?;

        let bytes = message
            .to_bytes()
            .map_err(|e| DropError::serialization(format!("Failed to encode frame: {}", e)))?;
        control.lock().await.write_all(&bytes).await?;
        Ok(())
    }

    pub async fn join_room(&self, room_id: &str, peer_address: &str) -> Result<()> {
        self.send(Message::JoinRoom(JoinRoom {
            room_id: room_id.to_string(),
            peer_address: peer_address.to_string(),
        }))
        .await
    }

    pub async fn leave_room(&self) -> Result<()> {
        self.send(Message::LeaveRoom(LeaveRoom {})).await
    }

    /// Forward a negotiation payload to another member of the room
    pub async fn signal(&self, peer: &str, payload: serde_json::Value) -> Result<()> {
        self.send(Message::Signal(Signal {
            peer: peer.to_string(),
            payload,
        }))
        .await
    }

    /// Offer a file; returns the session id used
    pub async fn offer_file(
        &self,
        to: &str,
        file: FileMeta,
        mode: TransferMode,
    ) -> Result<SessionId> {
        let session_id = crate::generate_session_id();
        self.send(Message::FileOffer(FileOffer {
            to: to.to_string(),
            session_id: Some(session_id.clone()),
            file,
            mode,
        }))
        .await?;
        Ok(session_id)
    }

    pub async fn accept(&self, session_id: &str) -> Result<()> {
        self.send(Message::FileAccept(FileAccept {
            session_id: session_id.to_string(),
        }))
        .await
    }

    pub async fn reject(&self, session_id: &str) -> Result<()> {
        self.send(Message::FileReject(FileReject {
            session_id: session_id.to_string(),
        }))
        .await
    }

    pub async fn cancel(&self, session_id: &str, reason: Option<String>) -> Result<()> {
        self.send(Message::FileCancel(FileCancel {
            session_id: session_id.to_string(),
            reason,
        }))
        .await
    }

    /// Relay a whole file through the control stream (direct mode)
    pub async fn send_direct(&self, session_id: &str, data: &[u8]) -> Result<()> {
        self.send(Message::FilePayload(FilePayload {
            session_id: session_id.to_string(),
            data: STANDARD.encode(data),
        }))
        .await
    }

    /// Send a file on a fresh data stream: start, every chunk, then complete
    pub async fn send_chunked(&self, session_id: &str, data: Bytes) -> Result<()> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| DropError::connection("Not connected to relay"))?;

        let chunk_size = self.config.chunk_size;
        let mut stream = connection.open_uni().await?;

        let start = Message::ChunkedStart(ChunkedStart {
            session_id: session_id.to_string(),
            total_size: data.len() as u64,
            chunk_size,
        });
        write_message(&mut stream, &start).await?;

        let mut count = 0usize;
        for chunk in chunks_of(session_id, &data, chunk_size) {
            write_message(&mut stream, &Message::FileChunk(chunk)).await?;
            count += 1;
        }

        let complete = Message::FileComplete(FileComplete {
            session_id: session_id.to_string(),
        });
        write_message(&mut stream, &complete).await?;
        stream.finish()?;

        debug!(
            "Sent {} bytes in {} chunks for session {}",
            data.len(),
            count,
            session_id
        );
        Ok(())
    }

    /// Say goodbye and close the connection
    pub async fn disconnect(&mut self) -> Result<()> {
        if self.control.is_some() {
            let _ = self
                .send(Message::Goodbye(Goodbye {
                    reason: "client disconnect".to_string(),
                }))
                .await;
        }
        if let Some(control) = self.control.take() {
            let _ = control.lock().await.finish();
        }

        if let Some(connection) = self.connection.take() {
            connection.close(0u32.into(), b"Client disconnect");
            info!("Disconnected from relay");
        }

        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"Client shutdown");
        }

        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Get connection statistics
    pub fn connection_stats(&self) -> Option<ConnectionStats> {
        self.connection.as_ref().map(|conn| {
            let stats = conn.stats();
            ConnectionStats {
                bytes_sent: stats.udp_tx.bytes,
                bytes_received: stats.udp_rx.bytes,
                packets_sent: stats.udp_tx.datagrams,
                packets_received: stats.udp_rx.datagrams,
                round_trip_time: stats.path.rtt,
            }
        })
    }
}

async fn write_message(stream: &mut SendStream, message: &Message) -> Result<()> {
    let bytes = message
        .to_bytes()
        .map_err(|e| DropError::serialization(format!("Failed to encode frame: {}", e)))?;
    stream.write_all(&bytes).await?;
    Ok(())
}

/// Split `data` into offset-addressed chunks of at most `chunk_size` bytes.
///
/// An empty file yields no chunks; a zero chunk size is treated as one chunk.
pub fn chunks_of(session_id: &str, data: &Bytes, chunk_size: u32) -> Vec<FileChunk> {
    let step = if chunk_size == 0 {
        data.len().max(1)
    } else {
        chunk_size as usize
    };

    (0..data.len())
        .step_by(step)
        .map(|start| {
            let end = (start + step).min(data.len());
            FileChunk {
                session_id: session_id.to_string(),
                offset: start as u64,
                payload: data.slice(start..end),
            }
        })
        .collect()
}

/// Connection statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub round_trip_time: Duration,
}

/// Certificate verifier that accepts anything; the relay is self-signed
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = RelayClientConfig::default();
        assert_eq!(config.server_addr.port(), 4433);
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.connect_timeout_secs, 10);
        assert_eq!(config.chunk_size, 16 * 1024);
    }

    #[test]
    fn test_chunks_cover_file_in_order() {
        let data = Bytes::from(vec![7u8; 40]);
        let chunks = chunks_of("s", &data, 16);

        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks.iter().map(|c| c.offset).collect::<Vec<_>>(),
            vec![0, 16, 32]
        );
        assert_eq!(chunks[2].payload.len(), 8);
        assert_eq!(
            chunks.iter().map(|c| c.payload.len()).sum::<usize>(),
            data.len()
        );
    }

    #[test]
    fn test_chunks_edge_sizes() {
        assert!(chunks_of("s", &Bytes::new(), 16).is_empty());

        let data = Bytes::from_static(b"abc");
        let whole = chunks_of("s", &data, 0);
        assert_eq!(whole.len(), 1);
        assert_eq!(whole[0].payload, data);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let mut client = RelayClient::new(RelayClientConfig::default());
        assert!(!client.is_connected());
        assert!(client.join_room("r1", "addr").await.is_err());
        assert!(client.connection_stats().is_none());
        assert!(client.disconnect().await.is_ok());
    }
}
