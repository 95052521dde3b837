//! Chain execution.
//!
//! Runs a validated chain against a [`ToolDispatch`]:
//! 1. **Plan**: steps without a `parallel_group` run one at a time in
//!    declared order; each group runs as one unit at the position of its
//!    first member, at most `max_parallel` members in flight.
//! 2. **Prepare**: input mapping, condition, transformations. Members of
//!    a group are all prepared against the context as it stood before the
//!    group started.
//! 3. **Dispatch**: the call, retried per the step's policy.
//! 4. **Record**: status and payload land in the execution context and a
//!    progress event goes out.
//!
//! The whole run races the chain deadline and the caller's cancellation
//! token. Every run ends in a [`ChainResult`], whatever happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::errors::RollbackError;
use super::expression::{Expr, Path, Scope};
use super::transform::{self, OutputTarget};
use super::types::{
    ChainResult, ChainStatus, RetryPolicy, RollbackReport, Step, StepError, StepResult, StepStatus,
};
use super::validator::{is_write_operation, HardenedChain};
use crate::config::ChainLimits;
use crate::events::{ChainProgress, ChainProgressKind, EventSink};
use crate::mcp_client::{CallOptions, McpError, ToolCallResult, ToolDispatch};

// ─── Public API ──────────────────────────────────────────────────────────────

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cancelling this token stops the run. In-flight steps fail as
    /// cancelled, steps not yet started are skipped.
    pub cancel: Option<CancellationToken>,
    /// Id used in progress events and the result. A fresh uuid when absent.
    pub chain_id: Option<String>,
}

/// Executes hardened chains.
#[derive(Clone)]
pub struct ChainEngine {
    dispatch: Arc<dyn ToolDispatch>,
    events: Arc<dyn EventSink>,
}

impl ChainEngine {
    pub fn new(dispatch: Arc<dyn ToolDispatch>, events: Arc<dyn EventSink>) -> Self {
        Self { dispatch, events }
    }

    /// Run `chain` to completion, deadline or cancellation.
    pub async fn execute(&self, chain: &HardenedChain, opts: RunOptions) -> ChainResult {
        let spec = chain.spec();
        let chain_id = opts.chain_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = opts
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let deadline = Duration::from_millis(
            spec.options
                .timeout_ms
                .unwrap_or_else(|| ChainLimits::default().default_timeout_ms),
        );
        let started_at = Utc::now();
        let clock = Instant::now();

        tracing::info!(
            chain_id = %chain_id,
            validation_id = %chain.validation_id(),
            steps = spec.steps.len(),
            risk = ?chain.risk_level(),
            timeout_ms = deadline.as_millis() as u64,
            "chain: starting"
        );

        let mut run = Run {
            dispatch: Arc::clone(&self.dispatch),
            events: self.events.as_ref(),
            chain_id: &chain_id,
            steps: &spec.steps,
            labels: spec.steps.iter().enumerate().map(|(i, s)| s.label(i)).collect(),
            max_parallel: spec.options.max_parallel.unwrap_or(1).max(1),
            fail_fast: spec.options.fail_fast,
            token: token.clone(),
            ctx: ExecutionContext::new(spec.variables.clone()),
            in_flight: HashMap::new(),
            aborted_by: None,
        };
        let units = plan(&spec.steps);

        let ending = tokio::select! {
            biased;
            _ = token.cancelled() => Ending::Cancelled,
            _ = run.run_units(&units) => Ending::Completed,
            _ = tokio::time::sleep(deadline) => Ending::TimedOut,
        };
        // Anything still holding a child token stops now.
        token.cancel();

        if ending != Ending::Completed {
            tracing::warn!(chain_id = %chain_id, ending = ?ending, "chain: stopped early");
        }
        run.settle(ending);

        let status = run.status(ending);
        let rollback = if spec.options.rollback_on_error
            && !matches!(status, ChainStatus::Succeeded | ChainStatus::Cancelled)
        {
            Some(run.rollback().await)
        } else {
            None
        };

        run.emit(ChainProgressKind::Finished { status });
        tracing::info!(
            chain_id = %chain_id,
            status = ?status,
            elapsed_ms = clock.elapsed().as_millis() as u64,
            "chain: finished"
        );

        let labels = std::mem::take(&mut run.labels);
        let (variables, mut records) = run.ctx.into_parts();
        ChainResult {
            chain_id: chain_id.clone(),
            validation_id: chain.validation_id().to_string(),
            status,
            steps: labels.iter().filter_map(|id| records.remove(id)).collect(),
            rollback,
            variables,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
        }
    }
}

// ─── Plan ────────────────────────────────────────────────────────────────────

/// Group steps into execution units. A unit is a list of step indices; a
/// sequential step is a unit of one.
fn plan(steps: &[Step]) -> Vec<Vec<usize>> {
    let mut units: Vec<Vec<usize>> = Vec::new();
    let mut groups: HashMap<&str, usize> = HashMap::new();
    for (index, step) in steps.iter().enumerate() {
        match step.parallel_group.as_deref() {
            None => units.push(vec![index]),
            Some(group) => match groups.get(group) {
                Some(&unit) => units[unit].push(index),
                None => {
                    groups.insert(group, units.len());
                    units.push(vec![index]);
                }
            },
        }
    }
    units
}

// ─── Run State ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Completed,
    TimedOut,
    Cancelled,
}

/// A step ready for dispatch.
struct PreparedCall {
    index: usize,
    server: String,
    tool: String,
    arguments: Map<String, Value>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

enum Prepared {
    Call(PreparedCall, Map<String, Value>),
    /// Finished without a dispatch: skipped by condition or failed in a
    /// transformation.
    Done(StepResult),
}

struct InFlight {
    started: Instant,
    arguments: Value,
    attempts: Arc<AtomicU32>,
}

type CallOutcome = (PreparedCall, Result<ToolCallResult, McpError>);

struct Run<'a> {
    dispatch: Arc<dyn ToolDispatch>,
    events: &'a dyn EventSink,
    chain_id: &'a str,
    steps: &'a [Step],
    labels: Vec<String>,
    max_parallel: usize,
    fail_fast: bool,
    token: CancellationToken,
    ctx: ExecutionContext,
    in_flight: HashMap<usize, InFlight>,
    /// Step whose failure tripped `fail_fast`.
    aborted_by: Option<String>,
}

impl Run<'_> {
    async fn run_units(&mut self, units: &[Vec<usize>]) {
        for members in units {
            if let Some(failed) = self.aborted_by.clone() {
                for &index in members {
                    self.skip(index, format!("not started: step '{failed}' failed"), None);
                }
                continue;
            }
            self.run_unit(members).await;
        }
    }

    async fn run_unit(&mut self, members: &[usize]) {
        let mut queue = Vec::with_capacity(members.len());
        let mut done = Vec::new();
        let mut writes = Map::new();
        for &index in members {
            match self.prepare(index) {
                Prepared::Call(call, vars) => {
                    writes.extend(vars);
                    queue.push(call);
                }
                Prepared::Done(result) => done.push(result),
            }
        }
        for (name, value) in writes {
            self.ctx.set_variable(name, value);
        }
        for result in done {
            self.record(result);
        }

        let mut queue = queue.into_iter();
        let mut pending: FuturesUnordered<BoxFuture<'static, CallOutcome>> = FuturesUnordered::new();
        loop {
            while pending.len() < self.max_parallel && self.aborted_by.is_none() {
                let Some(call) = queue.next() else { break };
                pending.push(self.start(call));
            }
            let Some((call, outcome)) = pending.next().await else {
                break;
            };
            self.complete(call, outcome);
        }

        if let Some(failed) = self.aborted_by.clone() {
            for call in queue {
                let arguments = Value::Object(call.arguments);
                self.skip(call.index, format!("not started: step '{failed}' failed"), Some(arguments));
            }
        }
    }

    fn prepare(&self, index: usize) -> Prepared {
        let step = &self.steps[index];
        let no_locals = Map::new();

        let mut arguments = step.arguments.clone();
        for (dest, source) in &step.input_mapping {
            let scope = self.ctx.scope(None, &no_locals);
            let value = Path::parse(source)
                .ok()
                .and_then(|path| scope.lookup(&path))
                .unwrap_or(Value::Null);
            arguments.insert(dest.clone(), value);
        }

        if let Some(condition) = &step.condition {
            let scope = self.ctx.scope(Some(&arguments), &no_locals);
            match Expr::parse(condition) {
                Ok(expr) if expr.is_true(&scope) => {}
                Ok(_) => {
                    return Prepared::Done(StepResult {
                        arguments: Some(Value::Object(arguments)),
                        skip_reason: Some(format!("condition not met: {condition}")),
                        ..self.blank(index, StepStatus::Skipped)
                    })
                }
                Err(e) => return Prepared::Done(self.early_failure(index, "expression_error", e, arguments)),
            }
        }

        let mut locals = Map::new();
        for t in &step.transformations {
            let value = {
                let scope = self.ctx.scope(Some(&arguments), &locals);
                transform::apply(t, &scope)
            };
            match value {
                Ok(value) => match transform::output_target(&t.output) {
                    OutputTarget::Argument(name) => {
                        arguments.insert(name.to_string(), value);
                    }
                    OutputTarget::Variable(name) => {
                        locals.insert(name.to_string(), value);
                    }
                },
                Err(e) => {
                    let message = format!("transformation '{}': {e}", t.output);
                    return Prepared::Done(self.early_failure(index, "transform_error", message, arguments));
                }
            }
        }

        Prepared::Call(
            PreparedCall {
                index,
                server: step.server.clone(),
                tool: step.tool.clone(),
                arguments,
                retry: step.retry.clone(),
                timeout: step.timeout_ms.map(Duration::from_millis),
            },
            locals,
        )
    }

    fn start(&mut self, call: PreparedCall) -> BoxFuture<'static, CallOutcome> {
        let attempts = Arc::new(AtomicU32::new(0));
        self.in_flight.insert(
            call.index,
            InFlight {
                started: Instant::now(),
                arguments: Value::Object(call.arguments.clone()),
                attempts: Arc::clone(&attempts),
            },
        );
        tracing::debug!(
            chain_id = %self.chain_id,
            step = %self.labels[call.index],
            server = %call.server,
            tool = %call.tool,
            "chain: step dispatched"
        );
        invoke(Arc::clone(&self.dispatch), call, self.token.clone(), attempts).boxed()
    }

    fn complete(&mut self, call: PreparedCall, outcome: Result<ToolCallResult, McpError>) {
        let (attempts, duration_ms) = match self.in_flight.remove(&call.index) {
            Some(flight) => (
                flight.attempts.load(Ordering::Relaxed),
                flight.started.elapsed().as_millis() as u64,
            ),
            None => (1, 0),
        };
        let base = StepResult {
            attempts,
            duration_ms,
            arguments: Some(Value::Object(call.arguments)),
            ..self.blank(call.index, StepStatus::Succeeded)
        };
        let result = match outcome {
            Ok(output) => StepResult {
                result: Some(output.payload()),
                ..base
            },
            Err(e) => StepResult {
                status: StepStatus::Failed,
                error: Some(StepError {
                    code: e.code().to_string(),
                    message: e.to_string(),
                }),
                ..base
            },
        };
        self.record(result);
    }

    /// Close out every step without a record after the run stopped.
    fn settle(&mut self, ending: Ending) {
        for index in 0..self.steps.len() {
            if self.ctx.is_recorded(&self.labels[index]) {
                continue;
            }
            let flight = self.in_flight.remove(&index);
            let result = match (ending, flight) {
                (Ending::TimedOut, flight) => self.stopped(index, flight, "timeout", "chain deadline exceeded"),
                (Ending::Cancelled, Some(flight)) => {
                    self.stopped(index, Some(flight), "cancelled", "chain cancelled")
                }
                (Ending::Cancelled, None) => StepResult {
                    skip_reason: Some("not started: chain cancelled".to_string()),
                    ..self.blank(index, StepStatus::Skipped)
                },
                (Ending::Completed, _) => StepResult {
                    skip_reason: Some("not reached".to_string()),
                    ..self.blank(index, StepStatus::Skipped)
                },
            };
            self.record(result);
        }
    }

    fn status(&self, ending: Ending) -> ChainStatus {
        match ending {
            Ending::Cancelled => return ChainStatus::Cancelled,
            Ending::TimedOut => return ChainStatus::TimedOut,
            Ending::Completed => {}
        }
        let count = |status: StepStatus| {
            self.labels
                .iter()
                .filter(|id| self.ctx.result(id).is_some_and(|r| r.status == status))
                .count()
        };
        match (count(StepStatus::Failed), count(StepStatus::Succeeded)) {
            (0, _) => ChainStatus::Succeeded,
            (_, 0) => ChainStatus::Failed,
            _ if self.aborted_by.is_some() => ChainStatus::Failed,
            _ => ChainStatus::Partial,
        }
    }

    /// Best-effort compensation of successful write steps, newest first.
    async fn rollback(&self) -> RollbackReport {
        let mut report = RollbackReport::default();
        let order: Vec<String> = self.ctx.execution_order().iter().rev().cloned().collect();

        for id in order {
            let Some(index) = self.labels.iter().position(|l| *l == id) else {
                continue;
            };
            let step = &self.steps[index];
            let Some(record) = self.ctx.result(&id) else {
                continue;
            };
            if record.status != StepStatus::Succeeded || !is_write_operation(&step.tool) {
                continue;
            }
            let Some(comp) = &step.compensation else {
                report.uncompensated.push(id);
                continue;
            };

            let server = comp.server.clone().unwrap_or_else(|| step.server.clone());
            let mut arguments = comp.arguments.clone();
            {
                let no_locals = Map::new();
                let step_args = record.arguments.as_ref().and_then(Value::as_object);
                let scope = self.ctx.scope(step_args, &no_locals);
                for (dest, source) in &comp.input_mapping {
                    let value = Path::parse(source)
                        .ok()
                        .and_then(|path| scope.lookup(&path))
                        .unwrap_or(Value::Null);
                    arguments.insert(dest.clone(), value);
                }
            }

            let outcome = self
                .dispatch
                .call(&server, &comp.tool, Value::Object(arguments), CallOptions::default())
                .await;
            let ok = outcome.is_ok();
            match outcome {
                Ok(_) => {
                    tracing::info!(chain_id = %self.chain_id, step = %id, tool = %comp.tool, "rollback: compensated");
                    report.compensated.push(id.clone());
                }
                Err(e) => {
                    tracing::warn!(
                        chain_id = %self.chain_id,
                        step = %id,
                        tool = %comp.tool,
                        error = %e,
                        "rollback: compensation failed"
                    );
                    report.errors.push(RollbackError {
                        step: id.clone(),
                        server,
                        tool: comp.tool.clone(),
                        cause: e.code().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
            self.emit(ChainProgressKind::Compensated { step_id: id, ok });
        }
        report
    }

    // ─── Recording ───────────────────────────────────────────────────────

    /// Store a finished step. Under `fail_fast` the first failure, whether
    /// from dispatch or from preparation, stops everything not yet started.
    fn record(&mut self, result: StepResult) {
        if result.status == StepStatus::Failed && self.fail_fast && self.aborted_by.is_none() {
            self.aborted_by = Some(result.id.clone());
        }
        match result.status {
            StepStatus::Failed => tracing::warn!(
                chain_id = %self.chain_id,
                step = %result.id,
                attempts = result.attempts,
                error = ?result.error.as_ref().map(|e| &e.message),
                "chain: step failed"
            ),
            status => tracing::info!(
                chain_id = %self.chain_id,
                step = %result.id,
                status = ?status,
                attempts = result.attempts,
                duration_ms = result.duration_ms,
                "chain: step finished"
            ),
        }
        let kind = ChainProgressKind::StepFinished {
            step_id: result.id.clone(),
            status: result.status,
            attempts: result.attempts,
        };
        self.ctx.record(result);
        self.emit(kind);
    }

    fn skip(&mut self, index: usize, reason: String, arguments: Option<Value>) {
        let result = StepResult {
            arguments,
            skip_reason: Some(reason),
            ..self.blank(index, StepStatus::Skipped)
        };
        self.record(result);
    }

    fn emit(&self, kind: ChainProgressKind) {
        self.events.chain_progress(ChainProgress {
            chain_id: self.chain_id.to_string(),
            kind,
            completed: self.ctx.execution_order().len(),
            total: self.steps.len(),
            timestamp: Utc::now(),
        });
    }

    fn blank(&self, index: usize, status: StepStatus) -> StepResult {
        let step = &self.steps[index];
        StepResult {
            id: self.labels[index].clone(),
            server: step.server.clone(),
            tool: step.tool.clone(),
            status,
            attempts: 0,
            arguments: None,
            result: None,
            error: None,
            skip_reason: None,
            duration_ms: 0,
        }
    }

    fn early_failure(
        &self,
        index: usize,
        code: &str,
        message: impl ToString,
        arguments: Map<String, Value>,
    ) -> StepResult {
        StepResult {
            arguments: Some(Value::Object(arguments)),
            error: Some(StepError {
                code: code.to_string(),
                message: message.to_string(),
            }),
            ..self.blank(index, StepStatus::Failed)
        }
    }

    fn stopped(&self, index: usize, flight: Option<InFlight>, code: &str, message: &str) -> StepResult {
        let (attempts, arguments, duration_ms) = match flight {
            Some(f) => (
                f.attempts.load(Ordering::Relaxed),
                Some(f.arguments),
                f.started.elapsed().as_millis() as u64,
            ),
            None => (0, None, 0),
        };
        StepResult {
            attempts,
            arguments,
            duration_ms,
            error: Some(StepError {
                code: code.to_string(),
                message: message.to_string(),
            }),
            ..self.blank(index, StepStatus::Failed)
        }
    }
}

// ─── Dispatch ────────────────────────────────────────────────────────────────

/// Call the tool, retrying per policy. Cancellation is never retried.
async fn invoke(
    dispatch: Arc<dyn ToolDispatch>,
    call: PreparedCall,
    cancel: CancellationToken,
    attempts: Arc<AtomicU32>,
) -> CallOutcome {
    let max_attempts = call.retry.as_ref().map_or(1, |r| r.max_attempts.max(1));
    let mut attempt = 0;
    loop {
        attempt += 1;
        attempts.store(attempt, Ordering::Relaxed);

        let opts = CallOptions {
            timeout: call.timeout,
            cancel: Some(cancel.child_token()),
        };
        let request = dispatch.call(&call.server, &call.tool, Value::Object(call.arguments.clone()), opts);
        let outcome = match call.timeout {
            Some(limit) => tokio::time::timeout(limit, request).await.unwrap_or_else(|_| {
                Err(McpError::Timeout {
                    server: call.server.clone(),
                    operation: format!("tools/call {}", call.tool),
                    timeout_ms: limit.as_millis() as u64,
                })
            }),
            None => request.await,
        };

        let error = match outcome {
            Ok(output) => return (call, Ok(output)),
            Err(e @ McpError::Cancelled { .. }) => return (call, Err(e)),
            Err(e) if attempt >= max_attempts => return (call, Err(e)),
            Err(e) => e,
        };

        let delay = call
            .retry
            .as_ref()
            .map_or(Duration::ZERO, |policy| policy.delay_after(attempt));
        tracing::warn!(
            server = %call.server,
            tool = %call.tool,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "chain: step attempt failed, retrying"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                let cancelled = McpError::Cancelled {
                    server: call.server.clone(),
                    operation: format!("tools/call {}", call.tool),
                };
                return (call, Err(cancelled));
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
