//! Per-run execution context.
//!
//! Holds the live chain variables and every finished step's record. Paths
//! resolve against it through [`StepScope`]:
//!
//! - `vars.<name>…` (or `variables.`) chain variables
//! - `steps.<id>…` a finished step: `status`, `result`, `arguments`, `error`
//! - `previous…` the most recently finished step
//! - `args.<name>…` the current step's arguments (transformations only)
//! - `item…` the element under test (filter predicates only)
//! - any other root is looked up as a variable name

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::expression::{Path, Scope, Segment};
use super::types::StepResult;

#[derive(Debug, Default)]
pub struct ExecutionContext {
    variables: Map<String, Value>,
    records: HashMap<String, StepResult>,
    /// Ids in the order their results were recorded.
    order: Vec<String>,
}

impl ExecutionContext {
    pub fn new(variables: Map<String, Value>) -> Self {
        Self {
            variables,
            ..Self::default()
        }
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    pub fn set_variable(&mut self, name: String, value: Value) {
        self.variables.insert(name, value);
    }

    /// Store a step's final record; it becomes `previous`.
    pub fn record(&mut self, result: StepResult) {
        self.order.push(result.id.clone());
        self.records.insert(result.id.clone(), result);
    }

    pub fn result(&self, id: &str) -> Option<&StepResult> {
        self.records.get(id)
    }

    pub fn is_recorded(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Step ids in completion order.
    pub fn execution_order(&self) -> &[String] {
        &self.order
    }

    pub fn previous(&self) -> Option<&StepResult> {
        self.order.last().and_then(|id| self.records.get(id))
    }

    /// Scope for a step. `locals` shadow chain variables.
    pub fn scope<'a>(&'a self, args: Option<&'a Map<String, Value>>, locals: &'a Map<String, Value>) -> StepScope<'a> {
        StepScope {
            ctx: self,
            args,
            locals,
            item: None,
        }
    }

    pub fn into_parts(self) -> (Map<String, Value>, HashMap<String, StepResult>) {
        (self.variables, self.records)
    }
}

/// Read-only view used to evaluate one step's expressions.
#[derive(Clone, Copy)]
pub struct StepScope<'a> {
    ctx: &'a ExecutionContext,
    args: Option<&'a Map<String, Value>>,
    locals: &'a Map<String, Value>,
    item: Option<&'a Value>,
}

impl<'a> StepScope<'a> {
    /// Same scope with `item` bound.
    pub fn with_item(self, item: &'a Value) -> Self {
        Self {
            item: Some(item),
            ..self
        }
    }

    fn variable(&self, name: &str) -> Option<&'a Value> {
        self.locals.get(name).or_else(|| self.ctx.variables.get(name))
    }

    fn variables(&self, segments: &[Segment]) -> Option<Value> {
        match segments.split_first() {
            Some((Segment::Field(name), rest)) => Path::walk(rest, self.variable(name)?).cloned(),
            Some((Segment::Index(_), _)) => None,
            None => {
                let mut all = self.ctx.variables.clone();
                all.extend(self.locals.iter().map(|(k, v)| (k.clone(), v.clone())));
                Some(Value::Object(all))
            }
        }
    }
}

impl Scope for StepScope<'_> {
    fn lookup(&self, path: &Path) -> Option<Value> {
        match path.root.as_str() {
            "vars" | "variables" => self.variables(&path.segments),
            "steps" => {
                let (first, rest) = path.segments.split_first()?;
                let Segment::Field(id) = first else {
                    return None;
                };
                let view = self.ctx.result(id)?.view();
                Path::walk(rest, &view).cloned()
            }
            "previous" => {
                let view = self.ctx.previous()?.view();
                Path::walk(&path.segments, &view).cloned()
            }
            "args" => {
                let (first, rest) = path.segments.split_first()?;
                let Segment::Field(name) = first else {
                    return None;
                };
                Path::walk(rest, self.args?.get(name)?).cloned()
            }
            "item" => Path::walk(&path.segments, self.item?).cloned(),
            name => Path::walk(&path.segments, self.variable(name)?).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::expression::Expr;
    use crate::chain::types::StepStatus;
    use serde_json::json;

    fn record(id: &str, status: StepStatus, result: Option<Value>) -> StepResult {
        StepResult {
            id: id.into(),
            server: "s".into(),
            tool: "t".into(),
            status,
            attempts: 1,
            arguments: Some(json!({ "q": 1 })),
            result,
            error: None,
            skip_reason: None,
            duration_ms: 0,
        }
    }

    fn lookup(scope: &StepScope<'_>, path: &str) -> Option<Value> {
        scope.lookup(&Path::parse(path).unwrap())
    }

    #[test]
    fn test_resolves_every_root() {
        let mut vars = Map::new();
        vars.insert("limit".into(), json!(5));
        let mut ctx = ExecutionContext::new(vars);
        ctx.record(record("fetch", StepStatus::Succeeded, Some(json!({ "items": ["a", "b"] }))));
        ctx.record(record("skip", StepStatus::Skipped, None));

        let mut args = Map::new();
        args.insert("path".into(), json!({ "dir": "/tmp" }));
        let mut locals = Map::new();
        locals.insert("limit".into(), json!(9));
        let scope = ctx.scope(Some(&args), &locals);

        assert_eq!(lookup(&scope, "vars.limit"), Some(json!(9)));
        assert_eq!(lookup(&scope, "limit"), Some(json!(9)));
        assert_eq!(lookup(&scope, "steps.fetch.result.items[1]"), Some(json!("b")));
        assert_eq!(lookup(&scope, "steps.fetch.arguments.q"), Some(json!(1)));
        assert_eq!(lookup(&scope, "previous.status"), Some(json!("skipped")));
        assert_eq!(lookup(&scope, "args.path.dir"), Some(json!("/tmp")));
        assert_eq!(lookup(&scope, "steps.ghost.result"), None);
        assert_eq!(lookup(&scope, "item"), None);

        let item = json!({ "size": 3 });
        assert_eq!(lookup(&scope.with_item(&item), "item.size"), Some(json!(3)));
    }

    #[test]
    fn test_conditions_against_context() {
        let mut ctx = ExecutionContext::default();
        ctx.record(record("check", StepStatus::Failed, None));
        let locals = Map::new();
        let scope = ctx.scope(None, &locals);

        let expr = Expr::parse("steps.check.status == 'failed' && !exists(steps.check.result)").unwrap();
        assert!(expr.is_true(&scope));
        assert_eq!(ctx.execution_order(), ["check".to_string()]);
    }
}
