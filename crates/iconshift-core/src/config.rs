use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IconError;
use crate::icon::IconRef;
use crate::target::Target;

pub const DEFAULT_MAX_BACKUPS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    #[serde(default)]
    pub auto_cleanup: bool,
    #[serde(default)]
    pub extra_protected_paths: Vec<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_root: None,
            max_backups: default_max_backups(),
            auto_cleanup: false,
            extra_protected_paths: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, IconError> {
        let config: Self = toml::from_str(input)
            .map_err(|err| IconError::Config(format!("failed to parse config: {err}")))?;
        if config.max_backups == 0 {
            return Err(IconError::Config(
                "max_backups must be at least 1".to_string(),
            ));
        }
        if !matches!(
            config.log_level.as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            return Err(IconError::Config(format!(
                "unsupported log_level '{}'",
                config.log_level
            )));
        }
        Ok(config)
    }

    /// Reads the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, IconError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(IconError::io(
                    format!("failed to read config file: {}", path.display()),
                    err,
                ));
            }
        };
        Self::from_toml_str(&raw).map_err(|err| match err {
            IconError::Config(message) => {
                IconError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }
}

/// What a batch run does with the ledger when at least one item failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Rollback,
    Commit,
}

/// A batch description loaded from TOML for run-batch-from-config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchPlan {
    pub icon: PathBuf,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl BatchPlan {
    pub fn from_toml_str(input: &str) -> Result<Self, IconError> {
        let plan: Self = toml::from_str(input)
            .map_err(|err| IconError::Config(format!("failed to parse batch plan: {err}")))?;
        if plan.targets.is_empty() {
            return Err(IconError::Config(
                "batch plan must list at least one target".to_string(),
            ));
        }
        Ok(plan)
    }

    pub fn load(path: &Path) -> Result<Self, IconError> {
        let raw = fs::read_to_string(path).map_err(|err| {
            IconError::io(format!("failed to read batch plan: {}", path.display()), err)
        })?;
        let mut plan = Self::from_toml_str(&raw)?;
        if plan.icon.is_relative() {
            if let Some(parent) = path.parent() {
                plan.icon = parent.join(&plan.icon);
            }
        }
        Ok(plan)
    }

    pub fn icon_ref(&self) -> IconRef {
        IconRef::new(self.icon.clone(), self.index)
    }
}

fn default_max_backups() -> usize {
    DEFAULT_MAX_BACKUPS
}

fn default_log_level() -> String {
    "warn".to_string()
}
