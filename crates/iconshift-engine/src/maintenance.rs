use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use iconshift_core::IconResult;
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::command::run_command;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheClearReport {
    pub removed_cache_files: Vec<PathBuf>,
    pub shell_refreshed: bool,
    pub shell_step_skipped: bool,
    pub stale_tmp_removed: usize,
    pub warnings: Vec<String>,
}

/// Drops the per-user shell icon cache so new icons show up, and clears
/// leftover temp files of the backup store.
pub fn clear_icon_cache(store: &BackupStore) -> IconResult<CacheClearReport> {
    if !cfg!(windows) {
        let stale_tmp_removed = store.clear_stale_tmp()?;
        info!("shell icon cache step skipped on non-Windows host");
        return Ok(CacheClearReport {
            shell_step_skipped: true,
            stale_tmp_removed,
            ..CacheClearReport::default()
        });
    }

    let local_app_data = std::env::var_os("LOCALAPPDATA").map(PathBuf::from);
    clear_icon_cache_with_runner(store, local_app_data.as_deref(), run_command)
}

pub(crate) fn clear_icon_cache_with_runner<RunCommand>(
    store: &BackupStore,
    local_app_data: Option<&Path>,
    mut run_command_executor: RunCommand,
) -> IconResult<CacheClearReport>
where
    RunCommand: FnMut(&mut Command, &str) -> anyhow::Result<()>,
{
    let mut report = CacheClearReport {
        stale_tmp_removed: store.clear_stale_tmp()?,
        ..CacheClearReport::default()
    };

    match local_app_data {
        Some(root) => {
            for path in icon_cache_files(root) {
                match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "removed icon cache file");
                        report.removed_cache_files.push(path);
                    }
                    Err(err) => report.warnings.push(format!(
                        "icon cache file in use or protected '{}': {err}",
                        path.display()
                    )),
                }
            }
        }
        None => report
            .warnings
            .push("LOCALAPPDATA is not set; skipped icon cache files".to_string()),
    }

    let mut refresh = Command::new("ie4uinit.exe");
    refresh.arg("-show");
    match run_command_executor(&mut refresh, "failed to refresh shell icon cache") {
        Ok(()) => report.shell_refreshed = true,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "shell icon refresh failed");
            report.warnings.push(format!("{err:#}"));
        }
    }

    info!(
        removed = report.removed_cache_files.len(),
        refreshed = report.shell_refreshed,
        "cleared icon cache"
    );
    Ok(report)
}

/// `IconCache.db` plus the explorer `iconcache_*.db` shards that exist.
fn icon_cache_files(local_app_data: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let legacy = local_app_data.join("IconCache.db");
    if legacy.is_file() {
        files.push(legacy);
    }

    let explorer = local_app_data
        .join("Microsoft")
        .join("Windows")
        .join("Explorer");
    if let Ok(entries) = fs::read_dir(&explorer) {
        let mut shards = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        let lowered = name.to_ascii_lowercase();
                        lowered.starts_with("iconcache_") && lowered.ends_with(".db")
                    })
            })
            .collect::<Vec<_>>();
        shards.sort();
        files.extend(shards);
    }
    files
}
