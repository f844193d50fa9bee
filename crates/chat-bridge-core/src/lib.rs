//! Core abstractions for a resilient chat gateway connection.
//!
//! This crate provides the fundamental building blocks:
//! - `StoredValue` - Binary-safe values persisted by credential stores
//! - `Credentials` - Session credential material
//! - `EventHub` - Ordered broadcast + history of connection events
//! - `MessagesUpsert` - Received messages and their loggable summary
//! - `Fault` - Connection fault descriptor
//! - Store, connector and sender traits

pub mod credentials;
pub mod event_hub;
pub mod events;
pub mod fault;
pub mod store;
pub mod traits;
pub mod value;

pub use credentials::Credentials;
pub use event_hub::{EventHub, EventStream};
pub use events::{
    ConnectionEvent, ConnectionState, ConnectionUpdate, IncomingMessage, MessageKey, MessageSummary,
    MessagesUpsert, UpsertKind,
};
pub use fault::Fault;
pub use store::{CredentialStore, KeyUpdates, StoreError};
pub use traits::{AuthState, ConnectError, Connection, Connector, MessageSender, OutboundMessage, SendError};
pub use value::StoredValue;
