//! Batch plan documents
//!
//! A plan is a JSON document describing a matrix of repo/prompt items with
//! shared defaults and a concurrency bound. Validation happens at load time;
//! a plan that parses but violates the contract never reaches the scheduler.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Result type alias for plan loading.
pub type PlanResult<T> = Result<T, PlanError>;

/// Errors from plan loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("unreadable plan: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed plan: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid plan: {0}")]
    Invalid(String),
}

/// Defaults applied to every matrix item unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDefaults {
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub script_command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub merge_on_pass: bool,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl Default for PlanDefaults {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            script_command: None,
            model: None,
            timeout_sec: None,
            retries: 0,
            merge_on_pass: false,
        }
    }
}

/// One matrix entry. `repo` and `prompt` are required.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanItem {
    pub repo: String,
    pub prompt: String,
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default)]
    pub script_command: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    #[serde(default)]
    pub merge_on_pass: Option<bool>,
}

/// A matrix item with defaults folded in.
#[derive(Debug, Clone)]
pub struct ResolvedItem {
    pub repo: String,
    pub prompt: String,
    pub base_branch: String,
    pub script_command: Option<String>,
    pub model: Option<String>,
    pub timeout_sec: Option<u64>,
    pub merge_on_pass: bool,
}

/// Parsed and validated batch plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPlan {
    #[serde(default)]
    pub run_id: Option<String>,
    pub concurrency: u32,
    #[serde(default)]
    pub defaults: PlanDefaults,
    pub matrix: Vec<PlanItem>,
}

impl BatchPlan {
    pub fn from_json(json: &str) -> PlanResult<Self> {
        let plan: BatchPlan = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: impl AsRef<Path>) -> PlanResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn validate(&self) -> PlanResult<()> {
        if self.concurrency == 0 {
            return Err(PlanError::Invalid("concurrency must be at least 1".into()));
        }
        if self.matrix.is_empty() {
            return Err(PlanError::Invalid("matrix must not be empty".into()));
        }
        for (i, item) in self.matrix.iter().enumerate() {
            if item.repo.trim().is_empty() {
                return Err(PlanError::Invalid(format!("matrix[{i}]: repo is empty")));
            }
            if item.prompt.trim().is_empty() {
                return Err(PlanError::Invalid(format!("matrix[{i}]: prompt is empty")));
            }
        }
        Ok(())
    }

    /// Matrix items with defaults applied, in plan order.
    pub fn resolved_items(&self) -> Vec<ResolvedItem> {
        self.matrix
            .iter()
            .map(|item| ResolvedItem {
                repo: item.repo.clone(),
                prompt: item.prompt.clone(),
                base_branch: item
                    .base_branch
                    .clone()
                    .unwrap_or_else(|| self.defaults.base_branch.clone()),
                script_command: item
                    .script_command
                    .clone()
                    .or_else(|| self.defaults.script_command.clone()),
                model: item.model.clone().or_else(|| self.defaults.model.clone()),
                timeout_sec: item.timeout_sec.or(self.defaults.timeout_sec),
                merge_on_pass: item.merge_on_pass.unwrap_or(self.defaults.merge_on_pass),
            })
            .collect()
    }
}
