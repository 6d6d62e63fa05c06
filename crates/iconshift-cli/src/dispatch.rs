use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use iconshift_core::{
    BatchPlan, EngineConfig, ErrorKind, FailurePolicy, FormatIconValidator, IconError, IconRef,
    Target,
};
use iconshift_engine::{
    clear_icon_cache, default_state_root, AccessorTable, Backup, BackupStore, BatchReport,
    BatchSequencer, Replacer, StateLayout,
};
use iconshift_security::{ElevationOutcome, OperationKind, PermissionGate};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::completion::{resolve_completion_shell, write_completions_script};
use crate::render::{
    format_assessment_lines, format_backup_list_lines, format_batch_item_line,
    format_batch_report_lines, format_cache_report_lines, format_integrity_lines,
    format_operation_line, format_restore_lines, OutputStyle, TerminalRenderer,
};
use crate::{BackupsCommands, Cli, Commands};

/// Resolved state root and configuration for one invocation.
#[derive(Debug, Clone)]
pub(crate) struct Session {
    pub(crate) layout: StateLayout,
    pub(crate) config: EngineConfig,
}

pub(crate) fn run_cli(cli: Cli) -> Result<()> {
    if let Commands::Completion { shell } = &cli.command {
        init_tracing(cli.verbose, "warn");
        let shell_env = std::env::var("SHELL").ok();
        let shell = resolve_completion_shell(*shell, shell_env.as_deref(), cfg!(windows));
        let mut stdout = std::io::stdout().lock();
        return write_completions_script(shell, &mut stdout);
    }

    let session = resolve_session(cli.state_root.as_deref(), cli.config.as_deref())?;
    init_tracing(cli.verbose, &session.config.log_level);
    let renderer = TerminalRenderer::current();

    match cli.command {
        Commands::Apply {
            kind,
            value,
            icon,
            index,
            no_commit,
        } => {
            let mut replacer = build_replacer(&session);
            run_apply(
                &mut replacer,
                &session.config,
                &kind.target(&value),
                &IconRef::new(icon, index),
                no_commit,
                cli.elevate,
                renderer,
            )?;
        }
        Commands::Batch { plan } => {
            let plan = BatchPlan::load(&plan)?;
            let mut replacer = build_replacer(&session);
            run_batch(&mut replacer, &plan, &session.config, renderer)?;
        }
        Commands::Restore { backup_id } => {
            let replacer = build_replacer(&session);
            match replacer.restore_backup(&backup_id) {
                Ok(report) => {
                    renderer.print_lines(&format_restore_lines(&report, renderer.style()))
                }
                Err(err) => escalate_or_fail(replacer.gate(), cli.elevate, err, renderer)?,
            }
        }
        Commands::Backups { command } => {
            let store = BackupStore::new(session.layout.clone());
            match command {
                BackupsCommands::List { json } => {
                    let backups = store.list()?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&backups)?);
                    } else {
                        renderer.print_section("backups");
                        renderer.print_lines(&format_backup_list_lines(&backups, renderer.style()));
                    }
                }
                BackupsCommands::Delete { backup_id } => {
                    store.delete(&backup_id)?;
                    renderer.print_status("ok", &format!("deleted backup {backup_id}"));
                }
                BackupsCommands::Cleanup { retain } => {
                    let retain = retain.unwrap_or(session.config.max_backups);
                    let removed = store.cleanup(retain)?;
                    renderer.print_status(
                        "ok",
                        &format!("removed {} backups, kept the newest {retain}", removed.len()),
                    );
                }
            }
        }
        Commands::Verify => {
            let store = BackupStore::new(session.layout.clone());
            let report = store.verify_integrity()?;
            renderer.print_section("integrity");
            renderer.print_lines(&format_integrity_lines(&report, renderer.style()));
            if !report.is_clean() {
                bail!(
                    "backup store integrity check failed ({} missing, {} corrupt objects)",
                    report.missing_objects.len(),
                    report.corrupt_objects.len()
                );
            }
        }
        Commands::ClearCache => {
            let store = BackupStore::new(session.layout.clone());
            let report = clear_icon_cache(&store)?;
            renderer.print_lines(&format_cache_report_lines(&report, renderer.style()));
        }
        Commands::Assess { kind, value } => {
            let target = kind.target(&value).normalized()?;
            let gate = build_gate(&session.config);
            let assessment = gate.assess(&target);
            let preflight = gate.validate_operation(OperationKind::Replace, &target);
            renderer.print_section(&target.to_string());
            renderer.print_lines(&format_assessment_lines(
                &assessment,
                &preflight,
                renderer.style(),
            ));
        }
        Commands::Completion { .. } => {}
    }

    Ok(())
}

/// `--state-root` wins over the configured `state_root`, which wins over the
/// platform default. The config file is looked up under the first root found.
pub(crate) fn resolve_session(
    state_root: Option<&Path>,
    config_path: Option<&Path>,
) -> Result<Session> {
    let base_root = match state_root {
        Some(root) => root.to_path_buf(),
        None => default_state_root()?,
    };
    let config_path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| StateLayout::new(&base_root).config_path());
    let config = EngineConfig::load(&config_path)?;

    let root: PathBuf = match (state_root, &config.state_root) {
        (None, Some(configured)) => configured.clone(),
        _ => base_root,
    };
    Ok(Session {
        layout: StateLayout::new(root),
        config,
    })
}

pub(crate) fn init_tracing(verbose: u8, configured_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(verbose, configured_level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

pub(crate) fn log_filter(verbose: u8, configured_level: &str) -> &str {
    match verbose {
        0 => configured_level,
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn build_gate(config: &EngineConfig) -> PermissionGate {
    let mut gate = PermissionGate::system();
    gate.add_protected_roots(config.extra_protected_paths.iter().cloned());
    gate
}

fn build_replacer(session: &Session) -> Replacer {
    Replacer::new(
        BackupStore::new(session.layout.clone()),
        AccessorTable::platform_default(),
        build_gate(&session.config),
        Box::new(FormatIconValidator::default()),
    )
}

pub(crate) fn run_apply(
    replacer: &mut Replacer,
    config: &EngineConfig,
    target: &Target,
    icon: &IconRef,
    no_commit: bool,
    elevate: bool,
    renderer: TerminalRenderer,
) -> Result<Option<Backup>> {
    let operation = match replacer.replace(target, icon) {
        Ok(operation) => operation,
        Err(err) => {
            escalate_or_fail(replacer.gate(), elevate, err, renderer)?;
            return Ok(None);
        }
    };
    renderer.print_lines(&[format_operation_line(&operation, renderer.style())]);

    if no_commit {
        replacer.rollback_last()?;
        renderer.print_status("ok", "rolled back; no backup written (--no-commit)");
        return Ok(None);
    }
    commit_pending(replacer, config, renderer).map(Some)
}

/// Runs the plan, then commits or rolls back what was applied according to
/// its failure policy. Any failed item still ends in an error.
pub(crate) fn run_batch(
    replacer: &mut Replacer,
    plan: &BatchPlan,
    config: &EngineConfig,
    renderer: TerminalRenderer,
) -> Result<BatchReport> {
    let icon = plan.icon_ref();
    let style = renderer.style();
    let mut progress = renderer.start_progress("batch", plan.targets.len() as u64);
    let report = BatchSequencer::new(replacer).run(
        &plan.targets,
        &icon,
        |update| {
            progress.set(update.index as u64);
            if style == OutputStyle::Plain || !update.succeeded {
                progress.println(&format_batch_item_line(
                    update.index,
                    update.total,
                    &update.target.to_string(),
                    update.succeeded,
                    style,
                ));
            }
            Ok(())
        },
        || false,
    );
    if report.failed.is_empty() {
        progress.finish_success();
    } else {
        progress.finish_abandon();
    }
    renderer.print_lines(&format_batch_report_lines(&report, style));

    if replacer.pending_count() > 0 {
        if !report.failed.is_empty() && plan.on_failure == FailurePolicy::Rollback {
            rollback_pending(replacer, renderer)?;
        } else {
            commit_pending(replacer, config, renderer)?;
        }
    }
    Ok(report.into_result()?)
}

/// A failed commit leaves nothing applied without a backup behind it.
fn commit_pending(
    replacer: &mut Replacer,
    config: &EngineConfig,
    renderer: TerminalRenderer,
) -> Result<Backup> {
    let backup = match replacer.commit() {
        Ok(backup) => backup,
        Err(err) => {
            warn!(error = %err, "commit failed; rolling back pending changes");
            rollback_pending(replacer, renderer)?;
            return Err(err.into());
        }
    };
    renderer.print_status(
        "ok",
        &format!(
            "committed backup {} ({} changes)",
            backup.id,
            backup.entries.len()
        ),
    );

    if config.auto_cleanup {
        let removed = replacer.backup_store().cleanup(config.max_backups)?;
        if !removed.is_empty() {
            renderer.print_status(
                "ok",
                &format!("removed {} old backups", removed.len()),
            );
        }
    }
    Ok(backup)
}

fn rollback_pending(replacer: &mut Replacer, renderer: TerminalRenderer) -> Result<()> {
    let summary = replacer.rollback_all()?;
    if let Some(err) = summary.failure {
        let rolled_back = summary.rolled_back.len();
        let remaining = summary.remaining;
        return Err(anyhow::Error::new(err).context(format!(
            "rolled back {rolled_back} changes, {remaining} remain applied"
        )));
    }
    renderer.print_status(
        "ok",
        &format!("rolled back {} applied changes", summary.rolled_back.len()),
    );
    Ok(())
}

/// Relaunches the current command elevated when asked to; otherwise the
/// error is returned as is.
fn escalate_or_fail(
    gate: &PermissionGate,
    elevate: bool,
    err: IconError,
    renderer: TerminalRenderer,
) -> Result<()> {
    if !elevate || err.kind() != ErrorKind::ElevationRequired {
        return Err(err.into());
    }

    match gate.request_elevation(&err.to_string()) {
        ElevationOutcome::Granted => {
            renderer.print_status("ok", "completed in an elevated process");
            Ok(())
        }
        ElevationOutcome::Denied => {
            Err(anyhow::Error::new(err).context("elevation was declined"))
        }
        ElevationOutcome::Unavailable => {
            Err(anyhow::Error::new(err).context("no elevation prompt on this host"))
        }
    }
}
