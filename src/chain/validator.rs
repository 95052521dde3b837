//! Chain validation and hardening.
//!
//! Validation is a pure, fail-fast pipeline. Each phase stops at the first
//! violation, scanning steps in declared order:
//!
//! 1. structural: step count, identifiers, ids, payload sizes, expressions
//! 2. security: allow and deny lists, blocked content, string lengths
//! 3. dependencies: `steps.<id>` references must not form a cycle
//! 4. business rules: write operations need `options.approved`
//! 5. hardening: ids, sanitized variables, clamped limits, risk metadata
//!
//! Only the hardened output can be executed.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::errors::{ValidationError, ValidationPhase};
use super::references::{step_references, Reference};
use super::types::{ChainSpec, RiskLevel, SecurityReport, Step, TransformKind};
use crate::config::ChainLimits;
use crate::mcp_client::registry::namespaced_id;

/// Longest server, tool or group name.
const MAX_IDENTIFIER_LEN: usize = 128;

/// Longest step id.
const MAX_STEP_ID_LEN: usize = 64;

/// Tool-name fragments that mark a write operation.
const WRITE_VERBS: &[&str] = &[
    "create", "update", "delete", "write", "modify", "insert", "put", "patch", "remove",
];

// ─── Blocked Content ─────────────────────────────────────────────────────────

/// Content that never belongs in chain data, with a short label for each.
static BLOCKED_PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();

fn blocked_patterns() -> &'static [(&'static str, Regex)] {
    BLOCKED_PATTERNS.get_or_init(|| {
        let patterns = [
            ("script tag", r"(?i)<\s*script"),
            ("script tag", r"(?i)<\s*/\s*script\s*>"),
            ("javascript: url", r"(?i)javascript\s*:"),
            ("vbscript: url", r"(?i)vbscript\s*:"),
            ("html data url", r"(?i)data\s*:\s*text/html"),
            ("inline event handler", r"(?i)<[^>]*\bon[a-z]+\s*="),
            ("eval call", r"(?i)\beval\s*\("),
            ("Function constructor", r"\bFunction\s*\("),
            ("string timer", r#"(?i)\bset(?:timeout|interval)\s*\(\s*["'`]"#),
            ("dynamic import", r"(?i)\bimport\s*\("),
        ];
        patterns
            .into_iter()
            .filter_map(|(label, pattern)| Regex::new(pattern).ok().map(|re| (label, re)))
            .collect()
    })
}

/// Label of the first blocked pattern `text` contains.
pub fn find_blocked(text: &str) -> Option<&'static str> {
    blocked_patterns()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(label, _)| *label)
}

/// Remove blocked substrings and control characters other than newline and
/// tab.
pub fn sanitize(text: &str) -> String {
    let mut clean: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();
    for (_, re) in blocked_patterns() {
        if re.is_match(&clean) {
            clean = re.replace_all(&clean, "").into_owned();
        }
    }
    clean
}

/// Whether a tool name looks like it mutates something.
///
/// Substring match, so `list_update_history` counts as a write.
pub fn is_write_operation(tool: &str) -> bool {
    let lower = tool.to_lowercase();
    WRITE_VERBS.iter().any(|verb| lower.contains(verb))
}

// ─── Hardened Output ─────────────────────────────────────────────────────────

/// A chain that passed validation. Only the validator creates these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardenedChain {
    spec: ChainSpec,
    security: SecurityReport,
}

impl HardenedChain {
    pub fn spec(&self) -> &ChainSpec {
        &self.spec
    }

    pub fn security(&self) -> &SecurityReport {
        &self.security
    }

    pub fn validation_id(&self) -> &str {
        &self.security.validation_id
    }

    pub fn risk_level(&self) -> RiskLevel {
        self.security.risk_level
    }
}

// ─── Validator ───────────────────────────────────────────────────────────────

/// Five-phase chain validator.
#[derive(Debug, Clone, Default)]
pub struct ChainValidator {
    limits: ChainLimits,
}

/// Per-step facts gathered during the structural phase.
struct StepFacts {
    label: String,
    group: Option<String>,
    refs: Vec<Reference>,
}

impl ChainValidator {
    pub fn new(limits: ChainLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ChainLimits {
        &self.limits
    }

    /// Parse and validate a raw JSON chain.
    pub fn validate_value(&self, raw: &Value) -> Result<HardenedChain, ValidationError> {
        let spec: ChainSpec = serde_json::from_value(raw.clone()).map_err(|e| {
            ValidationError::new(ValidationPhase::Structural, "malformed", format!("malformed chain: {e}"))
        })?;
        self.validate(&spec)
    }

    /// Run every phase and return the hardened chain.
    pub fn validate(&self, spec: &ChainSpec) -> Result<HardenedChain, ValidationError> {
        let result = self.run_phases(spec);
        match &result {
            Ok(hardened) => tracing::info!(
                validation_id = %hardened.security.validation_id,
                steps = hardened.spec.steps.len(),
                risk = ?hardened.security.risk_level,
                warnings = hardened.security.warnings.len(),
                "chain validated"
            ),
            Err(e) => tracing::warn!(code = %e.code, step = ?e.step, error = %e.message, "chain rejected"),
        }
        result
    }

    fn run_phases(&self, spec: &ChainSpec) -> Result<HardenedChain, ValidationError> {
        let facts = self.check_structure(spec)?;
        self.check_security(spec, &facts)?;
        let mut warnings = self.check_dependencies(&facts)?;
        let writes = self.check_writes(spec, &facts)?;
        Ok(self.harden(spec, &facts, writes, &mut warnings))
    }

    // ─── Phase 1: Structure ──────────────────────────────────────────────

    fn check_structure(&self, spec: &ChainSpec) -> Result<Vec<StepFacts>, ValidationError> {
        use ValidationPhase::Structural;

        if spec.steps.is_empty() {
            return Err(ValidationError::new(Structural, "empty", "chain has no steps"));
        }
        if spec.steps.len() > self.limits.max_steps {
            return Err(ValidationError::new(
                Structural,
                "too_many_steps",
                format!(
                    "chain has {} steps, the limit is {}",
                    spec.steps.len(),
                    self.limits.max_steps
                ),
            ));
        }

        let total = serialized_len(spec);
        if total > self.limits.max_payload_bytes {
            return Err(ValidationError::new(
                Structural,
                "payload_too_large",
                format!(
                    "chain is {total} bytes, the limit is {}",
                    self.limits.max_payload_bytes
                ),
            ));
        }

        let mut facts: Vec<StepFacts> = Vec::with_capacity(spec.steps.len());
        for (i, step) in spec.steps.iter().enumerate() {
            let label = step.label(i);
            let fail = |kind: &str, message: String| {
                ValidationError::new(Structural, kind, message).at_step(label.clone())
            };

            if let Some(id) = &step.id {
                if !is_step_id(id) {
                    return Err(fail("invalid_step_id", format!("invalid step id '{id}'")));
                }
            }
            if facts.iter().any(|f| f.label == label) {
                return Err(fail("duplicate_step_id", format!("step id '{label}' is used twice")));
            }
            for (field, value) in [("server", &step.server), ("tool", &step.tool)] {
                if !is_identifier(value) {
                    return Err(fail(
                        "invalid_identifier",
                        format!("step '{label}' has an invalid {field} name '{value}'"),
                    ));
                }
            }
            if let Some(group) = &step.parallel_group {
                if !is_identifier(group) {
                    return Err(fail(
                        "invalid_identifier",
                        format!("step '{label}' has an invalid parallel group '{group}'"),
                    ));
                }
            }
            if let Some(comp) = &step.compensation {
                let server_ok = comp.server.as_deref().map_or(true, is_identifier);
                if !server_ok || !is_identifier(&comp.tool) {
                    return Err(fail(
                        "invalid_identifier",
                        format!("step '{label}' has an invalid compensation target"),
                    ));
                }
            }

            let args = serialized_len(&step.arguments);
            if args > self.limits.max_argument_bytes {
                return Err(fail(
                    "arguments_too_large",
                    format!(
                        "step '{label}' arguments are {args} bytes, the limit is {}",
                        self.limits.max_argument_bytes
                    ),
                ));
            }

            if let Some(retry) = &step.retry {
                if retry.max_attempts == 0 || !retry.backoff.is_finite() || retry.backoff < 1.0 {
                    return Err(fail(
                        "invalid_retry",
                        format!("step '{label}' needs max_attempts >= 1 and a finite backoff >= 1"),
                    ));
                }
            }

            for t in &step.transformations {
                if !is_output_name(&t.output) {
                    return Err(fail(
                        "invalid_output",
                        format!("step '{label}' has an invalid transformation output '{}'", t.output),
                    ));
                }
                if let TransformKind::ExtractText { pattern: Some(p), .. } = &t.kind {
                    if let Err(e) = Regex::new(p) {
                        return Err(fail(
                            "invalid_expression",
                            format!("step '{label}' has an invalid text pattern: {e}"),
                        ));
                    }
                }
            }

            let refs = step_references(step).map_err(|f| {
                fail(
                    "invalid_expression",
                    format!("step '{label}' {}: {}", f.location, f.error),
                )
            })?;

            facts.push(StepFacts {
                label,
                group: step.parallel_group.clone(),
                refs,
            });
        }
        Ok(facts)
    }

    // ─── Phase 2: Security ───────────────────────────────────────────────

    fn check_security(&self, spec: &ChainSpec, facts: &[StepFacts]) -> Result<(), ValidationError> {
        use ValidationPhase::Security;

        for (step, fact) in spec.steps.iter().zip(facts) {
            let targets = std::iter::once((step.server.as_str(), step.tool.as_str())).chain(
                step.compensation
                    .iter()
                    .map(|c| (c.server.as_deref().unwrap_or(step.server.as_str()), c.tool.as_str())),
            );
            for (server, tool) in targets {
                if let Some((kind, message)) = self.access_violation(server, tool) {
                    return Err(ValidationError::new(Security, kind, message).at_step(fact.label.clone()));
                }
            }
        }

        let scan = |location: String, value: &Value| -> Result<(), ValidationError> {
            self.scan_value(&location, value)
                .map_err(|(kind, message)| ValidationError::new(Security, kind, message))
        };

        for (name, value) in &spec.variables {
            self.scan_str(&format!("variables key '{name}'"), name)
                .map_err(|(kind, message)| ValidationError::new(Security, kind, message))?;
            scan(format!("variables.{name}"), value)?;
        }

        for (step, fact) in spec.steps.iter().zip(facts) {
            let at = |e: ValidationError| e.at_step(fact.label.clone());
            for (location, text) in step_strings(step) {
                self.scan_str(&format!("step '{}' {location}", fact.label), text)
                    .map_err(|(kind, message)| at(ValidationError::new(Security, kind, message)))?;
            }
            scan(format!("step '{}' arguments", fact.label), &Value::Object(step.arguments.clone())).map_err(at)?;
            if let Some(comp) = &step.compensation {
                scan(
                    format!("step '{}' compensation arguments", fact.label),
                    &Value::Object(comp.arguments.clone()),
                )
                .map_err(at)?;
            }
        }
        Ok(())
    }

    fn access_violation(&self, server: &str, tool: &str) -> Option<(&'static str, String)> {
        let limits = &self.limits;
        if limits.denied_servers.iter().any(|s| s == server) {
            return Some(("server_denied", format!("server '{server}' is denied")));
        }
        if !limits.allowed_servers.is_empty() && !limits.allowed_servers.iter().any(|s| s == server) {
            return Some(("server_not_allowed", format!("server '{server}' is not in the allow-list")));
        }
        let id = namespaced_id(server, tool);
        let matches = |entry: &String| entry == tool || *entry == id;
        if limits.denied_tools.iter().any(matches) {
            return Some(("tool_denied", format!("tool '{tool}' on '{server}' is denied")));
        }
        if !limits.allowed_tools.is_empty() && !limits.allowed_tools.iter().any(matches) {
            return Some((
                "tool_not_allowed",
                format!("tool '{tool}' on '{server}' is not in the allow-list"),
            ));
        }
        None
    }

    fn scan_value(&self, location: &str, value: &Value) -> Result<(), (&'static str, String)> {
        match value {
            Value::String(s) => self.scan_str(location, s),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, item)| self.scan_value(&format!("{location}[{i}]"), item)),
            Value::Object(map) => map.iter().try_for_each(|(key, item)| {
                self.scan_str(&format!("{location} key '{key}'"), key)?;
                self.scan_value(&format!("{location}.{key}"), item)
            }),
            _ => Ok(()),
        }
    }

    fn scan_str(&self, location: &str, text: &str) -> Result<(), (&'static str, String)> {
        let len = text.chars().count();
        if len > self.limits.max_string_length {
            return Err((
                "string_too_long",
                format!(
                    "{location} is {len} characters, the limit is {}",
                    self.limits.max_string_length
                ),
            ));
        }
        if let Some(label) = find_blocked(text) {
            return Err(("blocked_content", format!("{location} contains blocked content ({label})")));
        }
        Ok(())
    }

    // ─── Phase 3: Dependencies ───────────────────────────────────────────

    /// Reject cycles; return warnings for dangling and forward references.
    fn check_dependencies(&self, facts: &[StepFacts]) -> Result<Vec<String>, ValidationError> {
        let index: HashMap<&str, usize> = facts
            .iter()
            .enumerate()
            .map(|(i, f)| (f.label.as_str(), i))
            .collect();

        let mut warnings = Vec::new();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); facts.len()];
        for (i, fact) in facts.iter().enumerate() {
            for r in &fact.refs {
                match index.get(r.target.as_str()) {
                    None => warnings.push(format!(
                        "step '{}' references unknown step '{}' ({})",
                        fact.label, r.target, r.location
                    )),
                    // Compensations run after the chain, so they order nothing.
                    Some(_) if r.location.starts_with("compensation.") => {}
                    Some(&j) => {
                        let sibling = j != i && fact.group.is_some() && fact.group == facts[j].group;
                        if sibling {
                            // Group members are all prepared before any of them runs.
                            warnings.push(format!(
                                "step '{}' references step '{}' in the same parallel group ({}); it resolves to null",
                                fact.label, r.target, r.location
                            ));
                        } else if j > i {
                            warnings.push(format!(
                                "step '{}' references later step '{}' ({})",
                                fact.label, r.target, r.location
                            ));
                        }
                        if !edges[i].contains(&j) {
                            edges[i].push(j);
                        }
                    }
                }
            }
        }

        if let Some(cycle) = find_cycle(&edges) {
            let names: Vec<&str> = cycle.iter().map(|&i| facts[i].label.as_str()).collect();
            let first = names.first().copied().unwrap_or_default().to_string();
            return Err(ValidationError::new(
                ValidationPhase::Dependencies,
                "cycle",
                format!("dependency cycle: {}", names.join(" -> ")),
            )
            .at_step(first));
        }
        Ok(warnings)
    }

    // ─── Phase 4: Write Gating ───────────────────────────────────────────

    fn check_writes(&self, spec: &ChainSpec, facts: &[StepFacts]) -> Result<Vec<String>, ValidationError> {
        let writes: Vec<(&Step, &StepFacts)> = spec
            .steps
            .iter()
            .zip(facts)
            .filter(|(step, _)| is_write_operation(&step.tool))
            .collect();

        let names: Vec<String> = writes.iter().map(|(step, _)| step.tool.clone()).collect();
        if writes.is_empty() || spec.options.approved {
            return Ok(names);
        }

        let violations = writes
            .iter()
            .map(|(step, fact)| {
                format!(
                    "step '{}' calls write operation '{}' on server '{}'",
                    fact.label, step.tool, step.server
                )
            })
            .collect();
        Err(ValidationError::new(
            ValidationPhase::BusinessRules,
            "write_requires_approval",
            format!("write operations require explicit approval: {}", names.join(", ")),
        )
        .with_violations(violations))
    }

    // ─── Phase 5: Hardening ──────────────────────────────────────────────

    fn harden(
        &self,
        spec: &ChainSpec,
        facts: &[StepFacts],
        write_operations: Vec<String>,
        warnings: &mut Vec<String>,
    ) -> HardenedChain {
        let limits = &self.limits;
        let mut hardened = spec.clone();

        for (step, fact) in hardened.steps.iter_mut().zip(facts) {
            step.id = Some(fact.label.clone());
        }

        hardened.variables = sanitize_map(&hardened.variables);

        let timeout = match hardened.options.timeout_ms {
            None => limits.default_timeout_ms,
            Some(t) if t > limits.max_timeout_ms => {
                warnings.push(format!("timeout_ms {t} clamped to {}", limits.max_timeout_ms));
                limits.max_timeout_ms
            }
            Some(0) => {
                warnings.push(format!("timeout_ms 0 replaced by {}", limits.default_timeout_ms));
                limits.default_timeout_ms
            }
            Some(t) => t,
        };
        hardened.options.timeout_ms = Some(timeout);

        let parallel = match hardened.options.max_parallel {
            None => limits.default_parallel.clamp(1, limits.max_parallel.max(1)),
            Some(p) if p > limits.max_parallel => {
                warnings.push(format!("max_parallel {p} clamped to {}", limits.max_parallel));
                limits.max_parallel.max(1)
            }
            Some(0) => {
                warnings.push("max_parallel 0 raised to 1".to_string());
                1
            }
            Some(p) => p,
        };
        hardened.options.max_parallel = Some(parallel);

        for step in &mut hardened.steps {
            let label = step.id.clone().unwrap_or_default();
            if let Some(retry) = &mut step.retry {
                if retry.max_attempts > limits.max_retry_attempts {
                    warnings.push(format!(
                        "step '{label}' retry attempts {} clamped to {}",
                        retry.max_attempts, limits.max_retry_attempts
                    ));
                    retry.max_attempts = limits.max_retry_attempts.max(1);
                }
                if retry.delay_ms > limits.max_retry_delay_ms {
                    warnings.push(format!(
                        "step '{label}' retry delay {}ms clamped to {}ms",
                        retry.delay_ms, limits.max_retry_delay_ms
                    ));
                    retry.delay_ms = limits.max_retry_delay_ms;
                }
            }
            if let Some(step_timeout) = step.timeout_ms {
                if step_timeout > timeout {
                    warnings.push(format!(
                        "step '{label}' timeout {step_timeout}ms clamped to the chain timeout {timeout}ms"
                    ));
                    step.timeout_ms = Some(timeout);
                }
            }
        }

        if hardened.steps.len() > limits.long_chain_warning {
            warnings.insert(0, format!("very long chain: {} steps", hardened.steps.len()));
        }

        let risk_score = risk_score(&hardened, write_operations.len());
        let fingerprint = {
            let bytes = serde_json::to_vec(&hardened).unwrap_or_default();
            hex(&Sha256::digest(&bytes))
        };

        HardenedChain {
            spec: hardened,
            security: SecurityReport {
                validation_id: uuid::Uuid::new_v4().to_string(),
                validated_at: Utc::now(),
                risk_score,
                risk_level: RiskLevel::from_score(risk_score),
                write_operations,
                warnings: std::mem::take(warnings),
                fingerprint,
            },
        }
    }
}

/// 10 per write, 1 per five steps, 2 per grouped step, 2 per condition,
/// 1 per transformation.
fn risk_score(spec: &ChainSpec, writes: usize) -> u32 {
    let grouped = spec.steps.iter().filter(|s| s.parallel_group.is_some()).count();
    let conditions = spec.steps.iter().filter(|s| s.condition.is_some()).count();
    let transforms: usize = spec.steps.iter().map(|s| s.transformations.len()).sum();
    let score = 10 * writes + spec.steps.len() / 5 + 2 * grouped + 2 * conditions + transforms;
    u32::try_from(score).unwrap_or(u32::MAX)
}

/// Depth-first search; returns the nodes of the first cycle found.
fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(node: usize, edges: &[Vec<usize>], marks: &mut [Mark], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        stack.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::Active => {
                    let start = stack.iter().position(|&n| n == next).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(next, edges, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; edges.len()];
    let mut stack = Vec::new();
    (0..edges.len()).find_map(|node| {
        if marks[node] == Mark::New {
            visit(node, edges, &mut marks, &mut stack)
        } else {
            None
        }
    })
}

/// Expression and template strings a step carries, with their location.
fn step_strings(step: &Step) -> Vec<(String, &str)> {
    let mut out: Vec<(String, &str)> = Vec::new();
    for (dest, source) in &step.input_mapping {
        out.push((format!("input_mapping.{dest}"), source.as_str()));
    }
    if let Some(condition) = &step.condition {
        out.push(("condition".into(), condition.as_str()));
    }
    for (i, t) in step.transformations.iter().enumerate() {
        let base = format!("transformations[{i}]");
        out.push((format!("{base}.output"), t.output.as_str()));
        match &t.kind {
            TransformKind::ExtractJson { source, path } => {
                out.push((format!("{base}.source"), source.as_str()));
                if let Some(p) = path {
                    out.push((format!("{base}.path"), p.as_str()));
                }
            }
            TransformKind::ExtractText { source, pattern } => {
                out.push((format!("{base}.source"), source.as_str()));
                if let Some(p) = pattern {
                    out.push((format!("{base}.pattern"), p.as_str()));
                }
            }
            TransformKind::Template { template } => out.push((format!("{base}.template"), template.as_str())),
            TransformKind::Filter { source, predicate } => {
                out.push((format!("{base}.source"), source.as_str()));
                out.push((format!("{base}.predicate"), predicate.as_str()));
            }
            TransformKind::Format { source, .. } => out.push((format!("{base}.source"), source.as_str())),
        }
    }
    if let Some(comp) = &step.compensation {
        for (dest, source) in &comp.input_mapping {
            out.push((format!("compensation.input_mapping.{dest}"), source.as_str()));
        }
    }
    out
}

fn sanitize_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), sanitize_value(value)))
        .collect()
}

fn sanitize_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize(s)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(sanitize_map(map)),
        other => other.clone(),
    }
}

/// Server, tool and group names: alphanumeric start, then
/// `[A-Za-z0-9_.-]`.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    name.len() <= MAX_IDENTIFIER_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Step ids must be usable as a path segment: `steps.<id>.result`.
fn is_step_id(id: &str) -> bool {
    let mut chars = id.chars();
    id.len() <= MAX_STEP_ID_LEN
        && chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

/// `args.<name>`, `vars.<name>` or a plain variable name.
fn is_output_name(output: &str) -> bool {
    let name = output
        .strip_prefix("args.")
        .or_else(|| output.strip_prefix("vars."))
        .unwrap_or(output);
    is_step_id(name)
}

fn serialized_len<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::{ChainOptions, RetryPolicy, Transformation};
    use serde_json::json;

    fn chain(steps: Vec<Step>) -> ChainSpec {
        ChainSpec {
            steps,
            variables: Map::new(),
            options: ChainOptions::default(),
        }
    }

    fn validator() -> ChainValidator {
        ChainValidator::new(ChainLimits::default())
    }

    fn reads(n: usize) -> Vec<Step> {
        (0..n).map(|_| Step::new("files", "read_file")).collect()
    }

    #[test]
    fn test_write_gating_scenario() {
        let mut spec = chain(vec![Step::new("files", "read_file"), Step::new("files", "delete_file")]);

        let err = validator().validate(&spec).unwrap_err();
        assert_eq!(err.phase, ValidationPhase::BusinessRules);
        assert_eq!(err.code, "validation.business_rules.write_requires_approval");
        assert_eq!(err.violations.len(), 1);
        assert!(err.violations[0].contains("delete_file"));
        assert!(!err.message.contains("read_file"));

        spec.options.approved = true;
        let hardened = validator().validate(&spec).unwrap();
        assert_eq!(hardened.risk_level(), RiskLevel::High);
        assert_eq!(hardened.security().write_operations, vec!["delete_file"]);
    }

    #[test]
    fn test_step_count_ceiling() {
        let err = validator().validate(&chain(reads(51))).unwrap_err();
        assert_eq!(err.code, "validation.structural.too_many_steps");
        assert!(validator().validate(&chain(reads(50))).is_ok());
        assert_eq!(
            validator().validate(&chain(Vec::new())).unwrap_err().code,
            "validation.structural.empty"
        );
    }

    #[test]
    fn test_cycle_rejected_naming_a_member() {
        let mut a = Step::new("s", "read_a").with_id("a");
        a.input_mapping.insert("x".into(), "steps.c.result".into());
        let mut b = Step::new("s", "read_b").with_id("b");
        b.input_mapping.insert("x".into(), "steps.a.result".into());
        let mut c = Step::new("s", "read_c").with_id("c");
        c.condition = Some("steps.b.status == 'succeeded'".into());

        let err = validator().validate(&chain(vec![a, b, c])).unwrap_err();
        assert_eq!(err.phase, ValidationPhase::Dependencies);
        let step = err.step.clone().unwrap();
        assert!(["a", "b", "c"].contains(&step.as_str()));
        assert!(err.message.contains("->"));
    }

    #[test]
    fn test_acyclic_chain_of_same_size_accepted() {
        let a = Step::new("s", "read_a").with_id("a");
        let mut b = Step::new("s", "read_b").with_id("b");
        b.input_mapping.insert("x".into(), "steps.a.result".into());
        let mut c = Step::new("s", "read_c").with_id("c");
        c.condition = Some("steps.b.status == 'succeeded' && exists(steps.a.result)".into());

        let hardened = validator().validate(&chain(vec![a, b, c])).unwrap();
        assert!(hardened.security().warnings.is_empty());
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let mut a = Step::new("s", "read").with_id("a");
        a.condition = Some("exists(steps.a.result)".into());
        let err = validator().validate(&chain(vec![a])).unwrap_err();
        assert_eq!(err.code, "validation.dependencies.cycle");
        assert_eq!(err.step.as_deref(), Some("a"));
    }

    #[test]
    fn test_compensation_may_read_its_own_step() {
        let mut create = Step::new("files", "create_file").with_id("create");
        create.compensation = Some(crate::chain::types::Compensation {
            server: None,
            tool: "delete_file".into(),
            arguments: Map::new(),
            input_mapping: [("path".to_string(), "steps.create.arguments.path".to_string())].into(),
        });
        let mut spec = chain(vec![create]);
        spec.options.approved = true;

        let hardened = validator().validate(&spec).unwrap();
        assert!(hardened.security().warnings.is_empty());
    }

    #[test]
    fn test_unknown_and_forward_references_warn() {
        let mut a = Step::new("s", "read").with_id("a");
        a.input_mapping.insert("x".into(), "steps.ghost.result".into());
        a.input_mapping.insert("y".into(), "steps.b.result".into());
        let b = Step::new("s", "read").with_id("b");

        let hardened = validator().validate(&chain(vec![a, b])).unwrap();
        let warnings = &hardened.security().warnings;
        assert_eq!(warnings.len(), 2);
        assert!(warnings[0].contains("unknown step 'ghost'"));
        assert!(warnings[1].contains("later step 'b'"));
    }

    #[test]
    fn test_sibling_reference_in_group_warns() {
        let mut a = Step::new("s", "read").with_id("a");
        a.parallel_group = Some("fanout".into());
        let mut b = Step::new("s", "read").with_id("b");
        b.parallel_group = Some("fanout".into());
        b.input_mapping.insert("x".into(), "steps.a.result".into());
        let mut c = Step::new("s", "read").with_id("c");
        c.input_mapping.insert("y".into(), "steps.a.result".into());

        let hardened = validator().validate(&chain(vec![a, b, c])).unwrap();
        let warnings = &hardened.security().warnings;
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("step 'b' references step 'a' in the same parallel group"));
    }

    #[test]
    fn test_revalidation_is_idempotent() {
        let mut steps = reads(22);
        steps[3].parallel_group = Some("g".into());
        steps[4].parallel_group = Some("g".into());
        steps[5].condition = Some("vars.go".into());
        steps[6].transformations.push(Transformation {
            kind: TransformKind::Template {
                template: "{{vars.name}}".into(),
            },
            output: "args.name".into(),
        });
        steps[7].retry = Some(RetryPolicy {
            max_attempts: 50,
            delay_ms: 100_000,
            backoff: 2.0,
        });
        steps.push(Step::new("files", "write_file"));
        let mut spec = chain(steps);
        spec.options.approved = true;
        spec.options.max_parallel = Some(99);
        spec.options.timeout_ms = Some(10_000_000);
        spec.variables.insert("go".into(), json!(true));

        let first = validator().validate(&spec).unwrap();
        let second = validator().validate(first.spec()).unwrap();

        assert_eq!(first.risk_level(), second.risk_level());
        assert_eq!(first.security().risk_score, second.security().risk_score);
        for warning in &second.security().warnings {
            assert!(first.security().warnings.contains(warning), "new warning: {warning}");
        }
        assert_eq!(first.spec(), second.spec());
        assert_eq!(first.security().fingerprint, second.security().fingerprint);
        assert_ne!(first.validation_id(), second.validation_id());
    }

    #[test]
    fn test_hardening_fills_and_clamps() {
        let mut step = Step::new("files", "read_file");
        step.retry = Some(RetryPolicy {
            max_attempts: 9,
            delay_ms: 100,
            backoff: 2.0,
        });
        step.timeout_ms = Some(900_000);
        let mut spec = chain(vec![step, Step::new("files", "read_file").with_id("second")]);
        spec.options.max_parallel = Some(64);

        let hardened = validator().validate(&spec).unwrap();
        let out = hardened.spec();
        assert_eq!(out.steps[0].id.as_deref(), Some("step-1"));
        assert_eq!(out.steps[1].id.as_deref(), Some("second"));
        assert_eq!(out.options.max_parallel, Some(10));
        assert_eq!(out.options.timeout_ms, Some(60_000));
        assert_eq!(out.steps[0].retry.as_ref().unwrap().max_attempts, 5);
        assert_eq!(out.steps[0].timeout_ms, Some(60_000));
        assert_eq!(hardened.security().warnings.len(), 3);
        assert_eq!(hardened.security().fingerprint.len(), 64);
        assert_eq!(hardened.risk_level(), RiskLevel::Low);
    }

    #[test]
    fn test_blocked_content_rejected_everywhere() {
        let mut spec = chain(vec![Step::new("web", "fetch")]);
        spec.variables
            .insert("payload".into(), json!({ "html": ["ok", "<script>alert(1)</script>"] }));
        let err = validator().validate(&spec).unwrap_err();
        assert_eq!(err.code, "validation.security.blocked_content");
        assert!(err.message.contains("variables.payload.html[1]"));

        let mut step = Step::new("web", "fetch");
        step.arguments.insert("url".into(), json!("javascript:alert(1)"));
        assert_eq!(
            validator().validate(&chain(vec![step])).unwrap_err().step.as_deref(),
            Some("step-1")
        );

        let mut step = Step::new("web", "fetch");
        step.transformations.push(Transformation {
            kind: TransformKind::Template {
                template: "<img src=x onerror=alert(1)>".into(),
            },
            output: "page".into(),
        });
        assert!(validator().validate(&chain(vec![step])).is_err());
    }

    #[test]
    fn test_string_length_ceiling() {
        let limits = ChainLimits {
            max_string_length: 10,
            ..ChainLimits::default()
        };
        let mut step = Step::new("a", "read");
        step.arguments.insert("q".into(), json!("x".repeat(11)));
        let err = ChainValidator::new(limits).validate(&chain(vec![step])).unwrap_err();
        assert_eq!(err.code, "validation.security.string_too_long");
    }

    #[test]
    fn test_allow_and_deny_lists() {
        let limits = ChainLimits {
            denied_tools: vec!["db__drop_table".into()],
            allowed_servers: vec!["db".into(), "files".into()],
            ..ChainLimits::default()
        };
        let v = ChainValidator::new(limits);

        let err = v.validate(&chain(vec![Step::new("db", "drop_table")])).unwrap_err();
        assert_eq!(err.code, "validation.security.tool_denied");

        let err = v.validate(&chain(vec![Step::new("web", "fetch")])).unwrap_err();
        assert_eq!(err.code, "validation.security.server_not_allowed");

        assert!(v.validate(&chain(vec![Step::new("files", "read_file")])).is_ok());
    }

    #[test]
    fn test_structural_rejections() {
        let err = validator()
            .validate(&chain(vec![Step::new("bad server", "read")]))
            .unwrap_err();
        assert_eq!(err.code, "validation.structural.invalid_identifier");

        let dup = vec![Step::new("a", "read").with_id("x"), Step::new("a", "read").with_id("x")];
        assert_eq!(
            validator().validate(&chain(dup)).unwrap_err().code,
            "validation.structural.duplicate_step_id"
        );

        let clash = vec![Step::new("a", "read"), Step::new("a", "read").with_id("step-1")];
        assert_eq!(
            validator().validate(&chain(clash)).unwrap_err().code,
            "validation.structural.duplicate_step_id"
        );

        let mut step = Step::new("a", "read");
        step.condition = Some("system('rm -rf /')".into());
        assert_eq!(
            validator().validate(&chain(vec![step])).unwrap_err().code,
            "validation.structural.invalid_expression"
        );

        let mut step = Step::new("a", "read");
        step.arguments.insert("blob".into(), json!("x".repeat(70_000)));
        assert_eq!(
            validator().validate(&chain(vec![step])).unwrap_err().code,
            "validation.structural.arguments_too_large"
        );
    }

    #[test]
    fn test_validate_value_rejects_malformed_json() {
        let err = validator().validate_value(&json!({ "steps": "nope" })).unwrap_err();
        assert_eq!(err.code, "validation.structural.malformed");

        let ok = validator()
            .validate_value(&json!({ "steps": [{ "server": "a", "tool": "read" }] }))
            .unwrap();
        assert_eq!(ok.spec().steps[0].id.as_deref(), Some("step-1"));
    }

    #[test]
    fn test_sanitize_strips_blocked_and_control() {
        assert_eq!(sanitize("a\u{0007}b<script>c"), "ab>c");
        assert_eq!(sanitize("line\nnext"), "line\nnext");
        assert!(is_write_operation("Delete_File"));
        assert!(is_write_operation("list_update_history"));
        assert!(!is_write_operation("read_file"));
    }
}
