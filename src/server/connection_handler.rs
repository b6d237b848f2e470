//! Connection handler for one QUIC client
//!
//! Stream layout per connection:
//! - one client-opened bidirectional **control stream** carrying every relay
//!   message in both directions
//! - any number of client-opened unidirectional **data streams** carrying
//!   `ChunkedStart`, `FileChunk` and `FileComplete` frames
//!
//! Inbound frames are decoded and handed to the hub; everything the hub
//! queues for this connection is written back by a single writer task.

use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, RecvStream, SendStream};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::current_timestamp;
use crate::error::{DropError, Result};
use crate::protocol::codec::Message;
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::messages::{ConnectionId, Ping, Pong};

use super::hub::Hub;
use super::relay::Outbox;

/// Interval between keepalive pings
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Per-connection handler
pub struct ConnectionHandler {
    /// Underlying QUIC connection
    connection: Connection,

    /// Relay-assigned connection ID
    connection_id: ConnectionId,

    /// Shared relay state
    hub: Arc<Hub>,

    /// Largest frame payload accepted on any stream
    max_frame_size: usize,

    /// Connection creation time
    created_at: Instant,

    /// Last activity timestamp
    last_activity: RwLock<Instant>,

    /// Ping timestamp for RTT calculation
    last_ping_time: RwLock<Option<Instant>>,

    /// Last measured round trip
    rtt: RwLock<Option<Duration>>,

    /// One task per open data stream
    data_tasks: Mutex<JoinSet<()>>,
}

/// Where a control-stream frame ends up
#[derive(Debug)]
enum Routed {
    /// Relay message for the hub
    Dispatch(Message),
    /// Ping, already answered
    Answered,
    /// Reply to one of our pings
    Pong,
    Goodbye(String),
}

/// Decode a control-stream frame, answering pings in place
fn route_control(frame: &Frame, outbox: &Outbox) -> Result<Routed> {
    if frame.frame_type.is_data_channel() {
        return Err(DropError::protocol(format!(
            "{:?} belongs on a data stream",
            frame.frame_type
        )));
    }

    let routed = match decode(frame)? {
        Message::Ping(ping) => {
            outbox.push(Message::Pong(Pong {
                timestamp: ping.timestamp,
            }))?;
            Routed::Answered
        }
        Message::Pong(_) => Routed::Pong,
        Message::Goodbye(goodbye) => Routed::Goodbye(goodbye.reason),
        other => Routed::Dispatch(other),
    };
    Ok(routed)
}

/// Decode a data-stream frame; only chunked transfer frames belong there
fn route_data(frame: &Frame) -> Result<Message> {
    if !frame.frame_type.is_data_channel() {
        return Err(DropError::protocol(format!(
            "Unexpected {:?} on data stream",
            frame.frame_type
        )));
    }
    decode(frame)
}

fn decode(frame: &Frame) -> Result<Message> {
    Message::decode(frame)
        .map_err(|e| DropError::protocol(format!("Invalid {:?}: {}", frame.frame_type, e)))
}

impl ConnectionHandler {
    pub fn new(
        connection: Connection,
        connection_id: ConnectionId,
        hub: Arc<Hub>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            connection,
            connection_id,
            hub,
            max_frame_size,
            created_at: Instant::now(),
            last_activity: RwLock::new(Instant::now()),
            last_ping_time: RwLock::new(None),
            rtt: RwLock::new(None),
            data_tasks: Mutex::new(JoinSet::new()),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Get the remote address
    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    /// Get connection uptime
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the last inbound frame
    pub async fn idle_for(&self) -> Duration {
        self.last_activity.read().await.elapsed()
    }

    /// Last ping round trip, once one has completed
    pub async fn rtt(&self) -> Option<Duration> {
        *self.rtt.read().await
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Instant::now();
    }

    /// Run the connection until the client goes away.
    ///
    /// Hub cleanup always runs on exit, whatever ended the connection.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = self.remote_address();
        info!("Connection {} from {}", self.connection_id, addr);

        let result = self.accept_and_run().await;

        self.hub.disconnect(&self.connection_id).await;
        self.connection.close(0u32.into(), b"closed");

        match &result {
            Ok(()) => info!("Connection {} from {} closed", self.connection_id, addr),
            Err(e) => info!(
                "Connection {} from {} closed: {}",
                self.connection_id, addr, e
            ),
        }
        result
    }

    async fn accept_and_run(self: &Arc<Self>) -> Result<()> {
        // The client opens the control stream first
        let (send, recv) = self.connection.accept_bi().await.map_err(|e| {
            DropError::connection(format!("Failed to accept control stream: {}", e))
        })?;

        let outbox_rx = self.hub.connect(&self.connection_id).await;
        let outbox = self
            .hub
            .relay()
            .outbox(&self.connection_id)
            .await
            .ok_or_else(|| DropError::internal("outbox missing right after connect"))?;

        debug!("Control stream accepted from {}", self.remote_address());

        let mut writer = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = h.write_loop(send, outbox_rx).await {
                    debug!("Writer for {} stopped: {}", h.connection_id, e);
                }
            })
        };

        let mut control = {
            let h = Arc::clone(self);
            let outbox = outbox.clone();
            tokio::spawn(async move {
                if let Err(e) = h.handle_control_stream(recv, outbox).await {
                    warn!("Control stream error on {}: {}", h.connection_id, e);
                }
            })
        };

        let mut data = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                h.accept_data_streams().await;
            })
        };

        let mut ping = {
            let h = Arc::clone(self);
            tokio::spawn(async move {
                h.ping_loop(outbox).await;
            })
        };

        // Any task ending means the connection is done
        tokio::select! {
            _ = &mut control => {},
            _ = &mut writer => {},
            _ = &mut data => {},
            _ = &mut ping => {},
        }

        // Nothing may touch the hub once this returns
        for task in [control, writer, data, ping] {
            task.abort();
            let _ = task.await;
        }
        self.data_tasks.lock().await.shutdown().await;
        Ok(())
    }

    /// Drain the outbox onto the control stream
    async fn write_loop(
        &self,
        mut send: SendStream,
        mut outbox: mpsc::UnboundedReceiver<Message>,
    ) -> Result<()> {
        while let Some(message) = outbox.recv().await {
            let bytes = message
                .to_bytes()
                .map_err(|e| DropError::serialization(format!("Failed to encode frame: {}", e)))?;
            send.write_all(&bytes).await?;
        }

        let _ = send.finish();
        Ok(())
    }

    async fn handle_control_stream(&self, mut recv: RecvStream, outbox: Outbox) -> Result<()> {
        let mut codec = FrameCodec::with_limit(self.max_frame_size);
        let mut buf = vec![0u8; 16 * 1024];

        loop {
            let Some(n) = recv.read(&mut buf).await? else {
                debug!("Control stream finished");
                return Ok(());
            };
            self.touch().await;
            codec.feed(&buf[..n]);

            loop {
                let frame = match codec.decode_next() {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        let err = DropError::protocol(format!("Frame decode error: {}", e));
                        self.hub.report(&self.connection_id, &err, None).await;
                        return Err(err);
                    }
                };

                match self.handle_control_frame(frame, &outbox).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(()),
                    Err(e) => {
                        warn!("Error handling control frame: {}", e);
                        self.hub.report(&self.connection_id, &e, None).await;
                    }
                }
            }
        }
    }

    /// Returns false once the client said goodbye
    async fn handle_control_frame(&self, frame: Frame, outbox: &Outbox) -> Result<bool> {
        match route_control(&frame, outbox)? {
            Routed::Dispatch(message) => self.hub.dispatch(&self.connection_id, message).await,
            Routed::Answered => {}
            Routed::Pong => {
                if let Some(sent) = self.last_ping_time.write().await.take() {
                    let rtt = sent.elapsed();
                    *self.rtt.write().await = Some(rtt);
                    debug!("RTT for {}: {:?}", self.connection_id, rtt);
                }
            }
            Routed::Goodbye(reason) => {
                info!("{} said goodbye: {}", self.connection_id, reason);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Accept client-initiated data streams
    async fn accept_data_streams(self: &Arc<Self>) {
        loop {
            match self.connection.accept_uni().await {
                Ok(recv) => {
                    let handler = Arc::clone(self);
                    let mut tasks = self.data_tasks.lock().await;
                    while tasks.try_join_next().is_some() {}
                    tasks.spawn(async move {
                        if let Err(e) = handler.handle_data_stream(recv).await {
                            warn!("Data stream error on {}: {}", handler.connection_id, e);
                            handler
                                .hub
                                .report(&handler.connection_id, &e, None)
                                .await;
                        }
                    });
                }
                Err(e) => {
                    debug!("Stopped accepting data streams: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_data_stream(&self, mut recv: RecvStream) -> Result<()> {
        let mut codec = FrameCodec::with_limit(self.max_frame_size);
        let mut buf = vec![0u8; 64 * 1024];

        while let Some(n) = recv.read(&mut buf).await? {
            self.touch().await;
            codec.feed(&buf[..n]);

            while let Some(frame) = codec
                .decode_next()
                .map_err(|e| DropError::protocol(format!("Frame decode error: {}", e)))?
            {
                let message = match route_data(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        let _ = recv.stop(0u32.into());
                        return Err(e);
                    }
                };
                self.hub.dispatch(&self.connection_id, message).await;
            }
        }

        debug!("Data stream from {} finished", self.connection_id);
        Ok(())
    }

    async fn ping_loop(&self, outbox: Outbox) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        // First tick fires immediately
        interval.tick().await;

        loop {
            interval.tick().await;

            *self.last_ping_time.write().await = Some(Instant::now());
            let ping = Message::Ping(Ping {
                timestamp: current_timestamp(),
            });
            if outbox.push(ping).is_err() {
                debug!("Ping loop for {} stopped", self.connection_id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::protocol::codec::Encodable;
    use crate::protocol::frame::FrameType;
    use crate::protocol::messages::{FileComplete, Goodbye, JoinRoom};

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Outbox::new("c".to_string(), tx), rx)
    }

    fn complete_frame() -> Frame {
        FileComplete {
            session_id: "s".to_string(),
        }
        .encode_frame()
        .unwrap()
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (outbox, mut rx) = outbox();
        let frame = Ping { timestamp: 42 }.encode_frame().unwrap();

        assert!(matches!(route_control(&frame, &outbox), Ok(Routed::Answered)));
        match rx.try_recv() {
            Ok(Message::Pong(pong)) => assert_eq!(pong.timestamp, 42),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_pong_and_goodbye_routed() {
        let (outbox, mut rx) = outbox();

        let pong = Pong { timestamp: 1 }.encode_frame().unwrap();
        assert!(matches!(route_control(&pong, &outbox), Ok(Routed::Pong)));

        let bye = Goodbye {
            reason: "done".to_string(),
        }
        .encode_frame()
        .unwrap();
        match route_control(&bye, &outbox) {
            Ok(Routed::Goodbye(reason)) => assert_eq!(reason, "done"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_relay_message_dispatched() {
        let (outbox, _rx) = outbox();
        let frame = JoinRoom {
            room_id: "r1".to_string(),
            peer_address: "addr".to_string(),
        }
        .encode_frame()
        .unwrap();

        match route_control(&frame, &outbox) {
            Ok(Routed::Dispatch(Message::JoinRoom(join))) => assert_eq!(join.room_id, "r1"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_data_frame_on_control_stream_rejected() {
        let (outbox, mut rx) = outbox();
        let err = route_control(&complete_frame(), &outbox).unwrap_err();
        assert!(matches!(err, DropError::Protocol(_)));
        assert_eq!(err.code(), 1003);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_control_frame_on_data_stream_rejected() {
        let frame = Ping { timestamp: 1 }.encode_frame().unwrap();
        let err = route_data(&frame).unwrap_err();
        assert_eq!(err.code(), 1003);

        let message = route_data(&complete_frame()).unwrap();
        assert!(message.is_data_channel());
    }

    #[test]
    fn test_malformed_payload_is_protocol_error() {
        let (outbox, _rx) = outbox();
        let frame = Frame::new(FrameType::JoinRoom, Bytes::from_static(b"not json"));
        assert_eq!(route_control(&frame, &outbox).unwrap_err().code(), 1003);
    }
}
