//! Room-based relay server over QUIC
//!
//! ## Stream Layout
//!
//! - **Control Stream** (client-opened bidirectional): room membership,
//!   signaling, offers and answers, direct payloads, state changes, errors
//! - **Data Streams** (client-opened unidirectional): chunked transfers
//!
//! ## Components
//!
//! - [`RoomDirectory`]: rooms and their members
//! - [`SignalingRelay`]: per-connection outboxes and room broadcast
//! - [`Hub`]: dispatch of inbound messages over directory, relay and transfers
//! - [`RelayServer`]: QUIC endpoint and connection lifecycle

pub mod connection_handler;
pub mod hub;
pub mod relay;
pub mod relay_server;
pub mod room_directory;

pub use connection_handler::ConnectionHandler;
pub use hub::{Hub, HubStats};
pub use relay::{Outbox, SignalingRelay};
pub use relay_server::{ALPN_PROTOCOL, DEFAULT_PORT, RelayServer, ServerConfig, ServerStats};
pub use room_directory::{Departure, JoinOutcome, Peer, Room, RoomDirectory};
