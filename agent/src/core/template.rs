//! Strict template rendering and template-variable merging.

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::{Map, Value};

/// Render `template` against `vars`.
///
/// Referencing a variable that is not defined is an error rather than an
/// empty string, so config typos surface on the first render.
pub fn render<S: Serialize>(template: &str, vars: &S) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.render_str(template, vars)
        .with_context(|| format!("render template {:?}", preview(template)))
}

fn preview(template: &str) -> String {
    const MAX: usize = 60;
    let mut out: String = template.chars().take(MAX).collect();
    if template.chars().count() > MAX {
        out.push_str("...");
    }
    out
}

/// Merge JSON objects left to right; nested objects merge recursively and
/// later values win for everything else. Non-object inputs are ignored.
pub fn recursive_merge<'a, I>(values: I) -> Value
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut merged = Map::new();
    for value in values {
        if let Value::Object(map) = value {
            merge_into(&mut merged, map);
        }
    }
    Value::Object(merged)
}

fn merge_into(target: &mut Map<String, Value>, source: &Map<String, Value>) {
    for (key, value) in source {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
