use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Every path the engine persists under one state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.backups_dir().join("manifest.json")
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.backups_dir().join("objects")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.backups_dir().join("tmp")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.backups_dir(), self.objects_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_state_root() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows state root")?;
        return Ok(PathBuf::from(app_data).join("IconShift"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve state root")?;
    Ok(PathBuf::from(home).join(".iconshift"))
}
