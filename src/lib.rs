//! toolmesh: aggregation gateway for tool-protocol backends.
//!
//! Connects to many backend tool servers (local processes, HTTP streams,
//! push streams), merges their tools, resources and prompts into one
//! namespaced registry, routes calls to the owning backend, and runs
//! validated multi-step tool chains.
//!
//! - `mcp_client`: transports, connections, registry and router
//! - `chain`: chain validation and execution
//! - `gateway`: the facade tying both halves together
//! - `config`: resolved gateway configuration
//! - `events`: the event sink the core publishes to
//! - `testing`: in-memory backends for tests

pub mod chain;
pub mod config;
pub mod events;
pub mod gateway;
pub mod mcp_client;
pub mod testing;

pub use chain::{ChainResult, ChainSpec, ChainValidator, HardenedChain, RunOptions, ValidationError};
pub use config::{ChainLimits, ConnectionSettings, GatewayConfig};
pub use events::{ChannelEventSink, EventSink, GatewayEvent, NullEventSink, TracingEventSink};
pub use gateway::{Gateway, ReloadReport};
pub use mcp_client::{CallOptions, CapabilityFilter, ConnectionState, McpError, ServerDescriptor};

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "toolmesh=info,warn";

/// Initialize a human-readable tracing subscriber on stderr.
///
/// Honors `RUST_LOG`. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Initialize a JSON-lines tracing subscriber on stderr, for hosts that
/// ship logs to a collector.
///
/// Honors `RUST_LOG`. Does nothing if a global subscriber is already set.
pub fn init_json_tracing() {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let initialized = fmt::fmt()
        .json()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok();

    if initialized {
        tracing::info!(
            version = env!("CARGO_PKG_VERSION"),
            pid = std::process::id(),
            "toolmesh starting"
        );
    }
}

