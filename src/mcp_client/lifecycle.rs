//! Connection lifecycle primitives.
//!
//! The connection state enum, the reconnect backoff policy, and the
//! `Lifecycle` handle the supervisor passes down so shutdown propagates
//! through an explicit cancellation tree instead of global flags.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

// ─── Connection State ────────────────────────────────────────────────────────

/// Where a backend connection currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Switched off; terminal until re-enabled.
    Disabled,
    /// Initial state, or after a deliberate disconnect.
    Disconnected,
    /// Transport opening / handshake / capability fetch in progress.
    Connecting,
    /// Live, capabilities registered.
    Connected,
    /// The backend wants fresh credentials. Never retried automatically.
    AuthRequired,
    /// Last attempt failed or the transport dropped.
    Failed,
}

impl ConnectionState {
    /// Whether `connect()` has anything to do in this state.
    pub fn accepts_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::AuthRequired | Self::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disabled => "disabled",
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::AuthRequired => "auth_required",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

// ─── Backoff ─────────────────────────────────────────────────────────────────

/// Exponential reconnect backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts after which the connection stays `Failed`.
    pub max_attempts: u32,
    /// Upper bound of random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_for(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }

    /// Whether another automatic retry is allowed after `attempts` failures.
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// Shutdown handle owned by the process supervisor.
///
/// Children derived with [`Lifecycle::child`] are cancelled when the parent
/// is, but cancelling a child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    token: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that ends no later than this one.
    pub fn child(&self) -> Lifecycle {
        Lifecycle {
            token: self.token.child_token(),
        }
    }

    /// Begin shutdown of this scope and everything below it.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown has begun.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for `select!` arms and call options.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts: 5,
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            ..BackoffPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_attempt_cap() {
        let policy = BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::default()
        };
        assert!(policy.allows(2));
        assert!(!policy.allows(3));
    }

    #[test]
    fn test_state_accepts_connect() {
        assert!(ConnectionState::Disconnected.accepts_connect());
        assert!(ConnectionState::Failed.accepts_connect());
        assert!(ConnectionState::AuthRequired.accepts_connect());
        assert!(!ConnectionState::Connecting.accepts_connect());
        assert!(!ConnectionState::Connected.accepts_connect());
        assert!(!ConnectionState::Disabled.accepts_connect());
        assert_eq!(ConnectionState::AuthRequired.to_string(), "auth_required");
    }

    #[tokio::test]
    async fn test_child_lifecycle_follows_parent() {
        let root = Lifecycle::new();
        let child = root.child();
        let sibling = root.child();
        sibling.shutdown();
        assert!(!root.is_shutting_down());
        assert!(!child.is_shutting_down());
        root.shutdown();
        child.stopped().await;
        assert!(child.is_shutting_down());
    }
}
