//! # kanban-sync: Realtime synchronization engine for collaborative kanban boards
//!
//! Clients hold a WebSocket open and send JSON commands that mutate a shared
//! board → list → note hierarchy. Every accepted mutation is committed as one
//! atomic store unit and then fanned out to every connected client, so all
//! views converge on the same order.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   {command, data}   ┌────────────┐      ┌──────────────┐
//! │ Client      │ ──────────────────► │ Dispatcher │ ───► │ Handlers     │
//! │ (browser)   │                     └────────────┘      │  + ordering  │
//! └──────▲──────┘                                         └──────┬───────┘
//!        │                                                       │ atomic unit
//!        │ events                                                ▼
//! ┌──────┴──────┐     ┌──────────┐                         ┌─────────────┐
//! │ Outbox      │ ◄── │ Fanout   │ ◄────── commit ──────── │ Store       │
//! │ (per conn)  │     │ Registry │                         │ (RocksDB)   │
//! └─────────────┘     └──────────┘                         └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: boards, lists, notes and their wire shapes
//! - [`protocol`]: command envelope decoding and outbound events
//! - [`ordering`]: pure sibling reordering
//! - [`broadcast`]: connection registry and fanout
//! - [`dispatcher`]: command routing onto the mutation handlers
//! - [`storage`]: store contract and the RocksDB implementation
//! - [`trust`]: trusted-token gate for upgrades
//! - [`server`]: WebSocket accept loop

pub mod model;
pub mod protocol;
pub mod ordering;
pub mod broadcast;
pub mod dispatcher;
pub mod error;
pub mod storage;
pub mod trust;
pub mod server;
mod handlers;

// Re-exports for convenience
pub use model::{Board, EntityId, List, Note, Position};
pub use protocol::{Command, Event, Inbound, ProtocolError, COMMAND_NOT_SUPPORTED};
pub use ordering::{Anchor, Direction};
pub use broadcast::{ConnectionId, ConnectionRegistry, Fanout, FanoutStats, Outbox, Registry};
pub use dispatcher::Dispatcher;
pub use error::SyncError;
pub use storage::{
    BoardStore, EntityKind, NotePatch, Store, StoreConfig, StoreError, StoreExt, StoreRead, Txn,
};
pub use trust::{TrustStore, TRUST_COOKIE};
pub use server::{KanbanServer, ServerConfig, ServerError, ServerStats};
