//! # collab-relay: realtime room relay for collaborative editing
//!
//! Fans out document-update and presence frames among WebSocket clients that
//! share a room. Payloads are opaque JSON produced by the clients' CRDT
//! engine; the relay only stamps them with `deliveredAt` and forwards them.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐                         ┌──► Client B
//!            │   ┌──────────────────┐  │
//!            ├──►│ Session (A)      │──┤
//!            │   └────────┬─────────┘  └──► Client C
//! Client B ──┘            │
//!                         ▼
//!                ┌──────────────────┐
//!                │ RoomRegistry     │  key → Room (Mutex<members>)
//!                │  admit / remove  │
//!                │  broadcast       │──► per-member bounded queues
//!                └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON frames (`ControlFrame`, `RelayedEvent`)
//! - [`member`]: one live connection and its OPEN/CLOSING/CLOSED state
//! - [`registry`]: rooms, admission and removal
//! - [`broadcast`]: fan-out with per-member backpressure
//! - [`session`]: per-connection task
//! - [`server`]: listener, health check, counters
//! - [`config`]: `RelayConfig`

pub mod broadcast;
pub mod config;
pub mod error;
pub mod member;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

// Re-exports for convenience
pub use broadcast::DeliveryReport;
pub use config::{RelayConfig, DEFAULT_PORT};
pub use error::{RelayError, Result};
pub use member::{DeliveryError, Member, MemberId, MemberState};
pub use protocol::{ControlFrame, ProtocolError, ReceiptClock, RelayedEvent, DELIVERED_AT};
pub use registry::{Room, RoomRegistry};
pub use server::{RelayServer, RelayStats, RelayStatsSnapshot};
pub use session::{CloseReason, Session};
