//! `preds.json`: one prediction per instance, shared by all workers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use agent::io::write_json;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const PREDS_FILE: &str = "preds.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_name_or_path: String,
    pub instance_id: String,
    pub model_patch: String,
}

/// Predictions file guarded by a lock so concurrent workers never lose
/// each other's updates.
#[derive(Debug)]
pub struct PredsFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PredsFile {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            path: output_dir.join(PREDS_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Current predictions; empty when the file does not exist yet.
    pub fn load(&self) -> Result<BTreeMap<String, Prediction>> {
        let _guard = self.guard();
        self.read()
    }

    pub fn update(&self, instance_id: &str, model_name: &str, patch: &str) -> Result<()> {
        let _guard = self.guard();
        let mut preds = self.read()?;
        preds.insert(
            instance_id.to_string(),
            Prediction {
                model_name_or_path: model_name.to_string(),
                instance_id: instance_id.to_string(),
                model_patch: patch.to_string(),
            },
        );
        write_json(&self.path, &preds)
    }

    pub fn remove(&self, instance_id: &str) -> Result<()> {
        let _guard = self.guard();
        if !self.path.exists() {
            return Ok(());
        }
        let mut preds = self.read()?;
        if preds.remove(instance_id).is_some() {
            write_json(&self.path, &preds)?;
        }
        Ok(())
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> Result<BTreeMap<String, Prediction>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("parse {}", self.path.display()))
    }
}
