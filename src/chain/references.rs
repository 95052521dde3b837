//! Step-to-step references.
//!
//! A step depends on another when any of its input mappings, its
//! condition, its transformations or its compensation read
//! `steps.<id>...`. Extraction also parses every expression the step
//! carries, so a malformed one is reported by location.

use super::expression::{parse_template, ExprError, Expr, Path, TemplatePart};
use super::types::{Step, TransformKind};

/// One `steps.<id>` read inside a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Referenced step id.
    pub target: String,
    /// Where in the step the reference sits, e.g. `input_mapping.text`.
    pub location: String,
}

/// An expression inside a step failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionFault {
    pub location: String,
    pub error: ExprError,
}

/// Every step reference in `step`, in a stable order.
pub fn step_references(step: &Step) -> Result<Vec<Reference>, ExpressionFault> {
    let mut refs = Vec::new();

    for (dest, source) in &step.input_mapping {
        let location = format!("input_mapping.{dest}");
        let path = Path::parse(source).map_err(|error| fault(&location, error))?;
        push(&mut refs, [&path], &location);
    }

    if let Some(condition) = &step.condition {
        let expr = Expr::parse(condition).map_err(|error| fault("condition", error))?;
        push(&mut refs, expr.paths(), "condition");
    }

    for (i, transform) in step.transformations.iter().enumerate() {
        let base = format!("transformations[{i}]");
        match &transform.kind {
            TransformKind::ExtractJson { source, path } => {
                source_path(&mut refs, source, &base)?;
                if let Some(inner) = path {
                    // Relative to the extracted document, never a step read.
                    Path::parse(inner).map_err(|error| fault(&format!("{base}.path"), error))?;
                }
            }
            TransformKind::ExtractText { source, .. } | TransformKind::Format { source, .. } => {
                source_path(&mut refs, source, &base)?;
            }
            TransformKind::Template { template } => {
                let location = format!("{base}.template");
                let parts = parse_template(template).map_err(|error| fault(&location, error))?;
                let paths = parts.iter().filter_map(|part| match part {
                    TemplatePart::Placeholder(path) => Some(path),
                    TemplatePart::Text(_) => None,
                });
                push(&mut refs, paths, &location);
            }
            TransformKind::Filter { source, predicate } => {
                source_path(&mut refs, source, &base)?;
                let location = format!("{base}.predicate");
                let expr = Expr::parse(predicate).map_err(|error| fault(&location, error))?;
                push(&mut refs, expr.paths(), &location);
            }
        }
    }

    if let Some(compensation) = &step.compensation {
        for (dest, source) in &compensation.input_mapping {
            let location = format!("compensation.input_mapping.{dest}");
            let path = Path::parse(source).map_err(|error| fault(&location, error))?;
            push(&mut refs, [&path], &location);
        }
    }

    Ok(refs)
}

/// Ids of the steps `step` reads, deduplicated, in first-seen order.
pub fn referenced_steps(refs: &[Reference]) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for r in refs {
        if !out.contains(&r.target.as_str()) {
            out.push(&r.target);
        }
    }
    out
}

fn source_path(refs: &mut Vec<Reference>, source: &str, base: &str) -> Result<(), ExpressionFault> {
    let location = format!("{base}.source");
    let path = Path::parse(source).map_err(|error| fault(&location, error))?;
    push(refs, [&path], &location);
    Ok(())
}

fn push<'a>(refs: &mut Vec<Reference>, paths: impl IntoIterator<Item = &'a Path>, location: &str) {
    for path in paths {
        if let Some(target) = path.step_reference() {
            refs.push(Reference {
                target: target.to_string(),
                location: location.to_string(),
            });
        }
    }
}

fn fault(location: &str, error: ExprError) -> ExpressionFault {
    ExpressionFault {
        location: location.to_string(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::{Compensation, Transformation};
    use serde_json::Map;
    use std::collections::BTreeMap;

    #[test]
    fn test_collects_references_from_every_location() {
        let mut step = Step::new("docs", "summarize");
        step.input_mapping.insert("text".into(), "steps.fetch.result".into());
        step.condition = Some("steps.check.status == 'succeeded' && vars.enabled".into());
        step.transformations.push(Transformation {
            kind: TransformKind::Template {
                template: "{{steps.meta.result.title}} by {{vars.author}}".into(),
            },
            output: "args.title".into(),
        });
        step.transformations.push(Transformation {
            kind: TransformKind::Filter {
                source: "steps.list.result.items".into(),
                predicate: "item.size > 0".into(),
            },
            output: "kept".into(),
        });
        step.compensation = Some(Compensation {
            server: None,
            tool: "delete".into(),
            arguments: Map::new(),
            input_mapping: BTreeMap::from([("id".to_string(), "steps.create.result.id".to_string())]),
        });

        let refs = step_references(&step).unwrap();
        assert_eq!(referenced_steps(&refs), vec!["fetch", "check", "meta", "list", "create"]);
        assert_eq!(refs[0].location, "input_mapping.text");
        assert_eq!(refs[3].location, "transformations[1].source");
    }

    #[test]
    fn test_previous_and_vars_are_not_step_references() {
        let mut step = Step::new("a", "b");
        step.input_mapping.insert("x".into(), "previous.result".into());
        step.input_mapping.insert("y".into(), "vars.steps".into());
        assert!(step_references(&step).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_expression_reports_location() {
        let mut step = Step::new("a", "b");
        step.condition = Some("steps.x.status ==".into());
        let err = step_references(&step).unwrap_err();
        assert_eq!(err.location, "condition");

        let mut step = Step::new("a", "b");
        step.input_mapping.insert("dest".into(), "not a path".into());
        assert_eq!(step_references(&step).unwrap_err().location, "input_mapping.dest");
    }
}
