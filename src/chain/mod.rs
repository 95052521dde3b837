//! Chains: validated multi-step tool workflows.
//!
//! Submodules:
//! - `types`: Chain specifications, security report, results
//! - `expression`: Restricted path / condition / template language
//! - `references`: Step-to-step references extracted from a step's expressions
//! - `validator`: Five-phase validation producing a `HardenedChain`
//! - `context`: Per-run variables and step records
//! - `transform`: Step transformations
//! - `engine`: Plan, dispatch, retry, deadline and rollback
//! - `errors`: Validation, rollback and transformation errors

pub mod context;
pub mod engine;
pub mod errors;
pub mod expression;
pub mod references;
pub mod transform;
pub mod types;
pub mod validator;

// Re-exports for convenience
pub use engine::{ChainEngine, RunOptions};
pub use errors::{RollbackError, TransformError, ValidationError, ValidationPhase};
pub use types::{
    ChainOptions, ChainResult, ChainSpec, ChainStatus, Compensation, OutputFormat, RetryPolicy, RiskLevel,
    RollbackReport, SecurityReport, Step, StepResult, StepStatus, TransformKind, Transformation,
};
pub use validator::{ChainValidator, HardenedChain};
