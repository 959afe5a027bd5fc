//! # doclet-collab: Real-time collaboration hub for Doclet
//!
//! Relays edit, presence and snapshot events between clients editing the
//! same document, and between hub instances through a NATS broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  WebSocket   ┌──────────────── hub ────────────────┐
//! │ Client A │ ◄──────────► │ ConnectionActor ─► MessageRouter    │
//! └──────────┘   JSON       │        ▲             │        │     │
//! ┌──────────┐              │        │       Registry   BrokerBridge
//! │ Client B │ ◄──────────► │ ConnectionActor ◄──┘        │  ▲     │
//! └──────────┘              └─────────────────────────────┼──┼─────┘
//!                                                         ▼  │
//!                                     <ns>.documents.<doc>.<class>
//!                                                         │  ▲
//!                                                   other hubs, the
//!                                                   document service
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire events
//! - [`presence`]: deterministic display names
//! - [`subject`]: broker subject naming and matching
//! - [`connection`]: per-connection handle and outbound queue
//! - [`registry`]: document → client → connection map, broadcast
//! - [`router`]: routing of inbound events, join announcements
//! - [`actor`]: reader/writer pumps
//! - [`broker`]: broker trait, in-process and NATS backends
//! - [`bridge`]: cross-instance publish and relay
//! - [`snapshot`]: snapshot consumer for the document store
//! - [`server`]: axum HTTP surface and lifecycle
//! - [`config`]: environment-driven configuration

pub mod actor;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod snapshot;
pub mod subject;

// Re-exports for convenience
pub use actor::{ActorConfig, ConnectionActor, ExitReason};
pub use bridge::{BridgeStats, BrokerBridge, EventHandler, MessageHandler, RegistryRelay};
pub use broker::{Broker, BrokerError, MemoryBroker, MessageStream, NatsBroker};
pub use config::{ConfigError, ServerConfig};
pub use connection::{Connection, ConnectionState, Enqueue};
pub use error::CollabError;
pub use presence::display_name;
pub use protocol::{Event, MessageType, ProtocolError};
pub use registry::{BroadcastOutcome, ConnectionRegistry, RegistryStats};
pub use router::{MessageRouter, Route};
pub use server::{CollabServer, ServerStats};
pub use snapshot::{DocumentStore, SnapshotConsumer, SnapshotError, SnapshotMessage, StoreError};
pub use subject::EventClass;
