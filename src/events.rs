//! Outbound event sink.
//!
//! The core publishes three kinds of events: connection state transitions,
//! capability-list changes and chain progress. Publishing is fire and
//! forget: implementations must return promptly and never fail the caller.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::chain::types::{ChainStatus, StepStatus};
use crate::mcp_client::lifecycle::ConnectionState;

// ─── Payloads ────────────────────────────────────────────────────────────────

/// A connection moved from one state to another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    pub server: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    /// Why the transition happened, for failures.
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A server's capability set was replaced or revoked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilitiesChanged {
    pub server: String,
    /// Entries now registered for the server (0 after revocation).
    pub count: usize,
    /// Registry snapshot version after the change.
    pub registry_version: u64,
    pub timestamp: DateTime<Utc>,
}

/// What happened in a running chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainProgressKind {
    StepFinished {
        step_id: String,
        status: StepStatus,
        attempts: u32,
    },
    Compensated {
        step_id: String,
        ok: bool,
    },
    Finished {
        status: ChainStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainProgress {
    pub chain_id: String,
    #[serde(flatten)]
    pub kind: ChainProgressKind,
    /// Steps with a final status so far.
    pub completed: usize,
    pub total: usize,
    pub timestamp: DateTime<Utc>,
}

/// Every event the core emits, for sinks that want a single stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    ConnectionState(StateChange),
    Capabilities(CapabilitiesChanged),
    ChainProgress(ChainProgress),
}

// ─── Sinks ───────────────────────────────────────────────────────────────────

/// Receiver of core events. One method per category.
pub trait EventSink: Send + Sync {
    fn connection_state_changed(&self, change: StateChange);
    fn capabilities_changed(&self, change: CapabilitiesChanged);
    fn chain_progress(&self, progress: ChainProgress);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn connection_state_changed(&self, _change: StateChange) {}
    fn capabilities_changed(&self, _change: CapabilitiesChanged) {}
    fn chain_progress(&self, _progress: ChainProgress) {}
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn connection_state_changed(&self, change: StateChange) {
        match &change.error {
            Some(error) => tracing::warn!(
                server = %change.server,
                from = %change.from,
                to = %change.to,
                error = %error,
                "connection state changed"
            ),
            None => tracing::info!(
                server = %change.server,
                from = %change.from,
                to = %change.to,
                "connection state changed"
            ),
        }
    }

    fn capabilities_changed(&self, change: CapabilitiesChanged) {
        tracing::info!(
            server = %change.server,
            count = change.count,
            version = change.registry_version,
            "capabilities changed"
        );
    }

    fn chain_progress(&self, progress: ChainProgress) {
        tracing::debug!(
            chain_id = %progress.chain_id,
            completed = progress.completed,
            total = progress.total,
            event = ?progress.kind,
            "chain progress"
        );
    }
}

/// Forwards events into an unbounded channel.
///
/// Unbounded so publishing never waits; a dropped receiver silently
/// discards further events.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GatewayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: GatewayEvent) {
        let _ = self.tx.send(event);
    }
}

impl EventSink for ChannelEventSink {
    fn connection_state_changed(&self, change: StateChange) {
        self.send(GatewayEvent::ConnectionState(change));
    }

    fn capabilities_changed(&self, change: CapabilitiesChanged) {
        self.send(GatewayEvent::Capabilities(change));
    }

    fn chain_progress(&self, progress: ChainProgress) {
        self.send(GatewayEvent::ChainProgress(progress));
    }
}
