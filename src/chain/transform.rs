//! Step transformations.

use regex::Regex;
use serde_json::Value;

use super::context::StepScope;
use super::errors::TransformError;
use super::expression::{render_template, Expr, Path, Scope, Segment};
use super::types::{OutputFormat, TransformKind, Transformation};

/// Where a transformation's output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget<'a> {
    /// `args.<name>`: the step's arguments.
    Argument(&'a str),
    /// Anything else: a chain variable.
    Variable(&'a str),
}

pub fn output_target(output: &str) -> OutputTarget<'_> {
    match output.strip_prefix("args.") {
        Some(name) => OutputTarget::Argument(name),
        None => OutputTarget::Variable(output.strip_prefix("vars.").unwrap_or(output)),
    }
}

/// Compute a transformation's output value.
pub fn apply(transform: &Transformation, scope: &StepScope<'_>) -> Result<Value, TransformError> {
    match &transform.kind {
        TransformKind::ExtractJson { source, path } => {
            let value = read(source, scope)?;
            let document = if let Value::String(s) = &value {
                parse_json(source, s)?
            } else if is_content(&value) {
                parse_json(source, &text_of(&value))?
            } else {
                value
            };
            match path {
                None => Ok(document),
                Some(path) => {
                    let path = Path::parse(path).map_err(expression)?;
                    let mut segments = vec![Segment::Field(path.root)];
                    segments.extend(path.segments);
                    Ok(Path::walk(&segments, &document).cloned().unwrap_or(Value::Null))
                }
            }
        }
        TransformKind::ExtractText { source, pattern } => {
            let text = text_of(&read(source, scope)?);
            let Some(pattern) = pattern else {
                return Ok(Value::String(text));
            };
            let re = Regex::new(pattern).map_err(|e| TransformError::InvalidPattern { reason: e.to_string() })?;
            Ok(re
                .captures(&text)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map_or(Value::Null, |m| Value::String(m.as_str().to_string())))
        }
        TransformKind::Template { template } => render_template(template, scope)
            .map(Value::String)
            .map_err(expression),
        TransformKind::Filter { source, predicate } => {
            let items = match read(source, scope)? {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                _ => {
                    return Err(TransformError::NotAnArray {
                        source_path: source.clone(),
                    })
                }
            };
            let predicate = Expr::parse(predicate).map_err(expression)?;
            let kept = items
                .into_iter()
                .filter(|item| predicate.is_true(&scope.with_item(item)))
                .collect();
            Ok(Value::Array(kept))
        }
        TransformKind::Format { source, format } => format_value(&read(source, scope)?, *format),
    }
}

fn read(source: &str, scope: &StepScope<'_>) -> Result<Value, TransformError> {
    let path = Path::parse(source).map_err(expression)?;
    Ok(scope.lookup(&path).unwrap_or(Value::Null))
}

fn parse_json(source: &str, text: &str) -> Result<Value, TransformError> {
    serde_json::from_str(text.trim()).map_err(|e| TransformError::InvalidJson {
        source_path: source.to_string(),
        reason: e.to_string(),
    })
}

fn expression(e: impl std::fmt::Display) -> TransformError {
    TransformError::InvalidExpression { reason: e.to_string() }
}

/// Whether `value` looks like a tool `content` array or a result holding
/// one.
fn is_content(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().any(|i| i.get("type").is_some() && i.get("text").is_some()),
        Value::Object(map) => map.get("content").is_some_and(is_content),
        _ => false,
    }
}

/// Plain text of a value. Content blocks contribute their `text`, joined by
/// newlines.
pub fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(_) => item.get("text").and_then(Value::as_str).map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => match (map.get("content"), map.get("text")) {
            (Some(content), _) => text_of(content),
            (None, Some(Value::String(text))) => text.clone(),
            _ => value.to_string(),
        },
        other => other.to_string(),
    }
}

fn format_value(value: &Value, format: OutputFormat) -> Result<Value, TransformError> {
    let failed = |name: &str, e: &dyn std::fmt::Display| TransformError::Format {
        format: name.to_string(),
        reason: e.to_string(),
    };
    let text = match format {
        OutputFormat::Json => serde_json::to_string(value).map_err(|e| failed("json", &e))?,
        OutputFormat::JsonPretty => serde_json::to_string_pretty(value).map_err(|e| failed("json_pretty", &e))?,
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| failed("yaml", &e))?,
        OutputFormat::Lines => match value {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            other => text_of(other),
        },
    };
    Ok(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::context::ExecutionContext;
    use serde_json::{json, Map};

    fn transform(kind: TransformKind) -> Transformation {
        Transformation {
            kind,
            output: "out".into(),
        }
    }

    fn context() -> ExecutionContext {
        let mut vars = Map::new();
        vars.insert("raw".into(), json!("  {\"items\": [{\"name\": \"a\", \"size\": 0}, {\"name\": \"b\", \"size\": 7}]}"));
        vars.insert(
            "content".into(),
            json!([{ "type": "text", "text": "id=42" }, { "type": "text", "text": "done" }]),
        );
        vars.insert("list".into(), json!(["x", 1, true]));
        vars.insert("who".into(), json!("ops"));
        ExecutionContext::new(vars)
    }

    fn run(kind: TransformKind) -> Result<Value, TransformError> {
        let ctx = context();
        let locals = Map::new();
        let scope = ctx.scope(None, &locals);
        apply(&transform(kind), &scope)
    }

    #[test]
    fn test_extract_json_with_path() {
        let out = run(TransformKind::ExtractJson {
            source: "vars.raw".into(),
            path: Some("items[1].name".into()),
        })
        .unwrap();
        assert_eq!(out, json!("b"));

        let err = run(TransformKind::ExtractJson {
            source: "vars.who".into(),
            path: None,
        })
        .unwrap_err();
        assert!(matches!(err, TransformError::InvalidJson { .. }));
    }

    #[test]
    fn test_extract_text_and_pattern() {
        let out = run(TransformKind::ExtractText {
            source: "vars.content".into(),
            pattern: None,
        })
        .unwrap();
        assert_eq!(out, json!("id=42\ndone"));

        let out = run(TransformKind::ExtractText {
            source: "vars.content".into(),
            pattern: Some(r"id=(\d+)".into()),
        })
        .unwrap();
        assert_eq!(out, json!("42"));

        let out = run(TransformKind::ExtractText {
            source: "vars.content".into(),
            pattern: Some("nomatch".into()),
        })
        .unwrap();
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn test_template_and_filter() {
        let out = run(TransformKind::Template {
            template: "hello {{vars.who}}".into(),
        })
        .unwrap();
        assert_eq!(out, json!("hello ops"));

        let ctx = context();
        let mut locals = Map::new();
        let items = run(TransformKind::ExtractJson {
            source: "vars.raw".into(),
            path: Some("items".into()),
        })
        .unwrap();
        locals.insert("items".into(), items);
        let scope = ctx.scope(None, &locals);
        let out = apply(
            &transform(TransformKind::Filter {
                source: "vars.items".into(),
                predicate: "item.size > 0".into(),
            }),
            &scope,
        )
        .unwrap();
        assert_eq!(out, json!([{ "name": "b", "size": 7 }]));

        let err = run(TransformKind::Filter {
            source: "vars.who".into(),
            predicate: "true".into(),
        })
        .unwrap_err();
        assert!(matches!(err, TransformError::NotAnArray { .. }));
    }

    #[test]
    fn test_format_variants() {
        let lines = run(TransformKind::Format {
            source: "vars.list".into(),
            format: OutputFormat::Lines,
        })
        .unwrap();
        assert_eq!(lines, json!("x\n1\ntrue"));

        let compact = run(TransformKind::Format {
            source: "vars.list".into(),
            format: OutputFormat::Json,
        })
        .unwrap();
        assert_eq!(compact, json!("[\"x\",1,true]"));

        let yaml = run(TransformKind::Format {
            source: "vars.list".into(),
            format: OutputFormat::Yaml,
        })
        .unwrap();
        assert!(yaml.as_str().unwrap().contains("- x"));
    }

    #[test]
    fn test_output_targets() {
        assert_eq!(output_target("args.path"), OutputTarget::Argument("path"));
        assert_eq!(output_target("summary"), OutputTarget::Variable("summary"));
        assert_eq!(output_target("vars.summary"), OutputTarget::Variable("summary"));
    }
}
