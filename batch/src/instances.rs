//! Instance files: the tasks a batch run works through.
//!
//! An instances file is a JSON list of objects with at least `instance_id`
//! and `problem_statement`. Any other fields are kept and exposed to prompt
//! templates.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

const SHUFFLE_SEED: u64 = 42;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: String,
    pub problem_statement: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    /// Template variables for this instance (`instance_id` plus extra fields).
    pub fn template_vars(&self) -> Map<String, Value> {
        let mut vars = self.extra.clone();
        vars.insert("instance_id".to_string(), json!(self.instance_id));
        vars
    }
}

/// Load and validate an instances file.
pub fn load_instances(path: &Path) -> Result<Vec<Instance>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read instances {}", path.display()))?;
    let instances: Vec<Instance> = serde_json::from_str(&contents)
        .with_context(|| format!("parse instances {}", path.display()))?;
    validate_instances(&instances).with_context(|| format!("validate {}", path.display()))?;
    Ok(instances)
}

fn validate_instances(instances: &[Instance]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for instance in instances {
        let id = &instance.instance_id;
        if id.is_empty() || id == "." || id == ".." || id.contains(&['/', '\\'][..]) {
            bail!("invalid instance_id {id:?}: must be a plain file name");
        }
        if !seen.insert(id.as_str()) {
            bail!("duplicate instance_id {id:?}");
        }
    }
    Ok(())
}

/// Which instances to run.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    /// Keep ids that match this regex at their start.
    pub filter: Option<Regex>,
    /// `start:stop` slice applied after filtering.
    pub slice: Option<String>,
    /// Deterministically shuffle before filtering.
    pub shuffle: bool,
}

/// Apply shuffle, id filter and slice, in that order.
pub fn select_instances(
    mut instances: Vec<Instance>,
    selection: &InstanceFilter,
) -> Result<Vec<Instance>> {
    if selection.shuffle {
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances.shuffle(&mut StdRng::seed_from_u64(SHUFFLE_SEED));
    }

    let before = instances.len();
    if let Some(filter) = &selection.filter {
        instances.retain(|instance| {
            filter
                .find(&instance.instance_id)
                .is_some_and(|m| m.start() == 0)
        });
        if instances.len() != before {
            info!(before, after = instances.len(), "instance filter applied");
        }
    }

    if let Some(spec) = &selection.slice {
        let (start, stop) = parse_slice(spec)?;
        let stop = stop.unwrap_or(instances.len()).min(instances.len());
        let start = start.min(stop);
        instances = instances.drain(start..stop).collect();
        info!(before, after = instances.len(), slice = %spec, "instance slice applied");
    }
    Ok(instances)
}

/// Parse `start:stop` where either bound may be omitted.
fn parse_slice(spec: &str) -> Result<(usize, Option<usize>)> {
    let (start, stop) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("slice {spec:?} must look like start:stop"))?;
    let bound = |raw: &str| -> Result<Option<usize>> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        raw.trim()
            .parse::<usize>()
            .map(Some)
            .with_context(|| format!("invalid slice bound {raw:?} in {spec:?}"))
    };
    Ok((bound(start)?.unwrap_or(0), bound(stop)?))
}
