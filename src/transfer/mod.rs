//! File transfer sessions
//!
//! - `session`: per-transfer state machine and progress
//! - `manager`: owner of all sessions, negotiation and abort handling
//! - `reassembly`: receiver-side chunk buffer for chunked transfers

pub mod manager;
pub mod reassembly;
pub mod session;

pub use manager::{Admission, TransferManager, TransferPolicy, Transition};
pub use reassembly::{ChunkProgress, ChunkSet, ReassemblyBuffer};
pub use session::{TransferMode, TransferSession, TransferState};
