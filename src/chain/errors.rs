//! Chain error types.

use std::fmt;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Validator pipeline phase that rejected a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationPhase {
    Structural,
    Security,
    Dependencies,
    BusinessRules,
}

impl fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Structural => "structural",
            Self::Security => "security",
            Self::Dependencies => "dependencies",
            Self::BusinessRules => "business_rules",
        })
    }
}

/// A chain was rejected. Nothing ran.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("chain rejected in {phase} validation: {message}")]
pub struct ValidationError {
    pub phase: ValidationPhase,
    /// Stable dotted code, e.g. `validation.security.blocked_content`.
    pub code: String,
    pub message: String,
    /// Step the violation concerns, if any.
    pub step: Option<String>,
    /// Itemized findings. Write gating lists every write operation here.
    pub violations: Vec<String>,
}

impl ValidationError {
    pub(crate) fn new(phase: ValidationPhase, kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            phase,
            code: format!("validation.{phase}.{kind}"),
            violations: vec![message.clone()],
            message,
            step: None,
        }
    }

    pub(crate) fn at_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub(crate) fn with_violations(mut self, violations: Vec<String>) -> Self {
        self.violations = violations;
        self
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Structured context for external callers.
    pub fn context(&self) -> serde_json::Value {
        json!({
            "code": self.code,
            "message": self.to_string(),
            "phase": self.phase,
            "step": self.step,
            "violations": self.violations,
        })
    }
}

/// A compensating call failed during rollback. Recorded, never raised.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("rollback of step '{step}' via '{tool}' failed: {reason}")]
pub struct RollbackError {
    pub step: String,
    pub server: String,
    pub tool: String,
    /// Code of the underlying failure.
    pub cause: String,
    pub reason: String,
}

impl RollbackError {
    pub fn code(&self) -> &'static str {
        "rollback_error"
    }
}

/// A transformation could not produce its output.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    #[error("source '{source_path}' is not valid JSON: {reason}")]
    InvalidJson { source_path: String, reason: String },

    #[error("source '{source_path}' is not an array")]
    NotAnArray { source_path: String },

    #[error("invalid pattern: {reason}")]
    InvalidPattern { reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("could not format value as {format}: {reason}")]
    Format { format: String, reason: String },
}
