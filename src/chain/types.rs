//! Chain specification and result types.
//!
//! `ChainSpec` is what callers submit. It is only ever executed after the
//! validator turned it into a `HardenedChain` (see `validator.rs`).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::RollbackError;

// ─── Specification ───────────────────────────────────────────────────────────

/// A multi-step workflow over backend tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    pub steps: Vec<Step>,
    /// Chain variables, readable as `vars.<name>`.
    #[serde(default)]
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub options: ChainOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainOptions {
    /// Overall deadline. Filled in and clamped during hardening.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Concurrency bound inside a parallel group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Stop starting new steps after the first failure.
    #[serde(default)]
    pub fail_fast: bool,
    /// Compensate successful write steps when the chain does not succeed.
    #[serde(default)]
    pub rollback_on_error: bool,
    /// The caller explicitly approved write operations.
    #[serde(default)]
    pub approved: bool,
}

/// One tool invocation inside a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Caller-assigned id. Hardening assigns `step-N` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub server: String,
    pub tool: String,
    /// Literal arguments, overlaid by `input_mapping` and transformations.
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Destination argument → source path (`vars.x`, `steps.<id>.result…`,
    /// `previous.result…`).
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    /// Step runs only when this evaluates true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Steps sharing a label run concurrently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Per-call timeout, tighter than the chain deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Undo action used by rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<Compensation>,
}

impl Step {
    /// Minimal step calling `server`/`tool` with no arguments.
    pub fn new(server: &str, tool: &str) -> Self {
        Self {
            id: None,
            server: server.to_string(),
            tool: tool.to_string(),
            arguments: Map::new(),
            input_mapping: BTreeMap::new(),
            transformations: Vec::new(),
            condition: None,
            retry: None,
            parallel_group: None,
            timeout_ms: None,
            compensation: None,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Id used in errors and results: the caller's id or `step-N` (1-based).
    pub fn label(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| format!("step-{}", index + 1))
    }
}

/// Bounded retries with exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Multiplier applied to the delay after every failed attempt.
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_delay_ms() -> u64 {
    1_000
}
fn default_backoff() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Delay after failed attempt `n` (1-based): `delay_ms · backoff^(n-1)`.
    pub fn delay_after(&self, attempt: u32) -> std::time::Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let ms = self.delay_ms as f64 * self.backoff.powi(exponent);
        std::time::Duration::from_millis(ms.clamp(0.0, u64::MAX as f64) as u64)
    }
}

/// Tool call that undoes a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Compensation {
    /// Defaults to the step's server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub tool: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// Same path syntax as a step's `input_mapping`.
    #[serde(default)]
    pub input_mapping: BTreeMap<String, String>,
}

// ─── Transformations ─────────────────────────────────────────────────────────

/// Reshapes context values before the step's call.
///
/// `output` names where the value lands: `args.<name>` writes into the
/// step's arguments, anything else is a chain variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    #[serde(flatten)]
    pub kind: TransformKind,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformKind {
    /// Parse JSON out of a string or text content, then optionally descend.
    ExtractJson {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// Plain text of a value, optionally narrowed by a regex (first group).
    ExtractText {
        source: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    /// `{{path}}` substitution.
    Template { template: String },
    /// Keep array items for which `predicate` (with `item` bound) is true.
    Filter { source: String, predicate: String },
    /// Serialize a value into another text form.
    Format { source: String, format: OutputFormat },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Json,
    JsonPretty,
    Yaml,
    Lines,
}

// ─── Security Metadata ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 10 => Self::High,
            s if s >= 5 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// What the validator learned about a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityReport {
    pub validation_id: String,
    pub validated_at: DateTime<Utc>,
    pub risk_score: u32,
    pub risk_level: RiskLevel,
    /// Tool names classified as writes.
    pub write_operations: Vec<String>,
    pub warnings: Vec<String>,
    /// SHA-256 of the hardened specification.
    pub fingerprint: String,
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// No step failed.
    Succeeded,
    /// Some steps failed, others succeeded.
    Partial,
    Failed,
    TimedOut,
    Cancelled,
}

/// Failure detail for a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub id: String,
    pub server: String,
    pub tool: String,
    pub status: StepStatus,
    /// Backend invocations made (0 when skipped).
    pub attempts: u32,
    /// Arguments after mapping and transformations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    pub duration_ms: u64,
}

impl StepResult {
    /// JSON view exposed to paths as `steps.<id>` and `previous`.
    pub fn view(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "status": self.status,
            "attempts": self.attempts,
            "arguments": self.arguments,
            "result": self.result,
            "error": self.error.as_ref().map(|e| &e.message),
        })
    }
}

/// What rollback did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollbackReport {
    /// Steps whose compensation succeeded, in the order they ran.
    pub compensated: Vec<String>,
    /// Successful write steps that define no compensation.
    pub uncompensated: Vec<String>,
    pub errors: Vec<RollbackError>,
}

/// Structured outcome of a chain run. Returned for every run, whatever
/// happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainResult {
    pub chain_id: String,
    pub validation_id: String,
    pub status: ChainStatus,
    /// One entry per step, in declared order.
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackReport>,
    /// Variables at the end of the run.
    pub variables: Map<String, Value>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ChainResult {
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.id == id)
    }
}
