//! MCP client side of the gateway.
//!
//! This module handles:
//! - Transports to backend servers (local process stdio, HTTP stream, push stream)
//! - One `Connection` per backend with its state machine, reconnects and auth
//! - The namespaced capability registry shared by all connections
//! - Routing calls by namespaced id to the owning connection

pub mod auth;
pub mod connection;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod router;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use auth::{CredentialProvider, NoCredentials, StaticCredentials};
pub use connection::{Connection, ConnectionContext, ConnectionStatus};
pub use errors::McpError;
pub use lifecycle::{BackoffPolicy, ConnectionState, Lifecycle};
pub use registry::{CapabilityEntry, CapabilityFilter, CapabilityRegistry, RegistrySnapshot, Resolution};
pub use router::{ConnectionSet, Route, Router, ToolDispatch};
pub use types::{CallOptions, CapabilityKind, ServerDescriptor, ToolCallResult, TransportConfig, TransportKind};
