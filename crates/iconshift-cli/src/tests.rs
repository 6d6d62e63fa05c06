use super::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::error::ErrorKind as ClapErrorKind;
use iconshift_core::{
    BatchPlan, EngineConfig, ErrorKind, FailurePolicy, FormatIconValidator, IconError, IconRef,
    ResourceKind,
};
use iconshift_engine::{
    AccessorTable, Backup, BackupEntry, BackupStore, BatchFailure, BatchReport, KeyValueStore,
    MemoryKeyStore, NoopAttributes, PriorRecord, Replacer, ResourceAddress, StateLayout,
    UnavailableBridge,
};
use iconshift_security::{ElevationOutcome, PermissionGate, PrivilegeProbe};

use crate::completion::{resolve_completion_shell, write_completions_script};
use crate::dispatch::{log_filter, resolve_session, run_apply, run_batch};
use crate::render::{
    format_backup_list_lines, format_batch_report_lines, format_error_lines,
    render_progress_line, render_status_line, resolve_output_style, OutputStyle,
    TerminalRenderer,
};

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root(label: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!(
        "iconshift-cli-{label}-{}-{nanos}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&root).expect("must create test root");
    fs::canonicalize(&root).expect("must canonicalize test root")
}

struct UserProbe;

impl PrivilegeProbe for UserProbe {
    fn is_admin(&self) -> bool {
        false
    }

    fn request_elevation(&self, _reason: &str) -> ElevationOutcome {
        ElevationOutcome::Denied
    }
}

fn memory_replacer(root: &Path) -> (Replacer, Arc<MemoryKeyStore>) {
    let keys = Arc::new(MemoryKeyStore::new());
    let replacer = Replacer::new(
        BackupStore::new(StateLayout::new(root.join("state"))),
        AccessorTable::from_parts(
            keys.clone(),
            Arc::new(NoopAttributes),
            Arc::new(UnavailableBridge),
        ),
        PermissionGate::with_protected_roots(Box::new(UserProbe), Vec::new()),
        Box::new(FormatIconValidator::default()),
    );
    (replacer, keys)
}

fn write_icon(root: &Path) -> PathBuf {
    let path = root.join("app.ico");
    fs::write(&path, [0_u8, 0, 1, 0, 1, 0]).expect("must write icon");
    path
}

fn plain() -> TerminalRenderer {
    TerminalRenderer::from_style(OutputStyle::Plain)
}

#[test]
fn apply_parses_kind_icon_and_negative_index() {
    let cli = Cli::try_parse_from([
        "iconshift",
        "apply",
        "executable",
        "C:/Tools/app.exe",
        "--icon",
        "C:/Icons/shell32.dll",
        "--index",
        "-4",
        "--no-commit",
    ])
    .expect("must parse apply");

    let Commands::Apply {
        kind,
        value,
        icon,
        index,
        no_commit,
    } = cli.command
    else {
        panic!("expected apply command");
    };
    assert_eq!(kind, CliTargetKind::Executable);
    assert_eq!(
        kind.target(&value),
        Target::executable("C:/Tools/app.exe")
    );
    assert_eq!(icon, PathBuf::from("C:/Icons/shell32.dll"));
    assert_eq!(index, -4);
    assert!(no_commit);
}

#[test]
fn global_flags_are_accepted_after_the_subcommand() {
    let cli = Cli::try_parse_from([
        "iconshift",
        "backups",
        "list",
        "--json",
        "--state-root",
        "/srv/iconshift",
        "-vv",
        "--elevate",
    ])
    .expect("must parse backups list");

    assert_eq!(cli.state_root, Some(PathBuf::from("/srv/iconshift")));
    assert_eq!(cli.verbose, 2);
    assert!(cli.elevate);
    assert!(matches!(
        cli.command,
        Commands::Backups {
            command: BackupsCommands::List { json: true }
        }
    ));
}

#[test]
fn unknown_target_kind_is_rejected() {
    let err = Cli::try_parse_from(["iconshift", "assess", "drive", "C:"])
        .expect_err("drive is not a target kind");
    assert_eq!(err.kind(), ClapErrorKind::InvalidValue);
}

#[test]
fn file_type_kind_uses_kebab_case_spelling() {
    let cli = Cli::try_parse_from(["iconshift", "assess", "file-type", "TXT"])
        .expect("must parse assess");
    let Commands::Assess { kind, value } = cli.command else {
        panic!("expected assess command");
    };
    assert_eq!(kind.target(&value), Target::file_type("TXT"));
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "committed backup bk-1"),
        "committed backup bk-1"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "ok", "committed backup bk-1"),
        "[OK] committed backup bk-1"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "shell refresh skipped"),
        "[WARN] shell refresh skipped"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "restore stopped"),
        "[ERR] restore stopped"
    );
}

#[test]
fn output_style_is_plain_without_a_terminal_or_with_no_color() {
    assert_eq!(resolve_output_style(true, false), OutputStyle::Rich);
    assert_eq!(resolve_output_style(true, true), OutputStyle::Plain);
    assert_eq!(resolve_output_style(false, false), OutputStyle::Plain);
}

#[test]
fn progress_line_is_only_rendered_in_rich_mode() {
    assert_eq!(
        render_progress_line(OutputStyle::Plain, "batch", 2, 4, None),
        None
    );
    let line = render_progress_line(OutputStyle::Rich, "batch", 2, 4, None)
        .expect("rich mode renders a progress line");
    assert!(line.contains(" 50% 2/4"));
}

#[test]
fn error_lines_carry_kind_and_remedy_for_engine_errors() {
    let err = anyhow::Error::new(IconError::ElevationRequired {
        target: "folder 'C:/Windows/Fonts'".to_string(),
        guidance: "administrator rights are required".to_string(),
    })
    .context("elevation was declined");

    let lines = format_error_lines(OutputStyle::Plain, &err);
    assert!(lines[0].starts_with("error: elevation was declined: elevation required"));
    assert_eq!(lines[1], "kind: elevation-required");
    assert!(lines[2].starts_with("hint: "));
    assert!(lines[2].contains("elevated prompt"));
}

#[test]
fn error_lines_list_batch_failures() {
    let err = anyhow::Error::new(IconError::PartialBatchFailure {
        total: 3,
        failures: vec![(
            Target::folder("/missing"),
            "folder not found".to_string(),
        )],
    });
    let lines = format_error_lines(OutputStyle::Rich, &err);
    assert_eq!(lines[0], "[ERR] error: 1 of 3 batch items failed");
    assert_eq!(lines[1], "  - folder '/missing': folder not found");
    assert_eq!(lines[2], "kind: partial-batch-failure");
}

#[test]
fn error_lines_for_plain_errors_have_no_hint() {
    let err = anyhow::anyhow!("HOME is not set");
    assert_eq!(
        format_error_lines(OutputStyle::Plain, &err),
        vec!["error: HOME is not set".to_string()]
    );
}

#[test]
fn verbosity_overrides_configured_log_level() {
    assert_eq!(log_filter(0, "error"), "error");
    assert_eq!(log_filter(1, "error"), "info");
    assert_eq!(log_filter(2, "error"), "debug");
    assert_eq!(log_filter(5, "error"), "trace");
}

#[test]
fn session_reads_config_under_state_root_and_applies_its_overrides() {
    let root = test_root("session");
    let relocated = root.join("relocated");
    fs::write(
        root.join("config.toml"),
        format!(
            "max_backups = 3\nauto_cleanup = true\nstate_root = {:?}\n",
            relocated.display().to_string()
        ),
    )
    .expect("must write config");

    let from_config = resolve_session(None, Some(&root.join("config.toml")))
        .expect("must resolve session");
    assert_eq!(from_config.layout.root(), relocated.as_path());
    assert_eq!(from_config.config.max_backups, 3);
    assert!(from_config.config.auto_cleanup);

    let explicit = resolve_session(Some(&root), None).expect("must resolve session");
    assert_eq!(explicit.layout.root(), root.as_path());
    assert_eq!(explicit.config.max_backups, 3);

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn session_rejects_unknown_config_keys() {
    let root = test_root("session-bad-config");
    fs::write(root.join("config.toml"), "max_backup = 3\n").expect("must write config");

    let err = resolve_session(Some(&root), None).expect_err("unknown key must fail");
    assert_eq!(
        err.downcast_ref::<IconError>().map(IconError::kind),
        Some(ErrorKind::Config)
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn completion_script_targets_the_iconshift_binary() {
    let mut output = Vec::new();
    write_completions_script(CliCompletionShell::Bash, &mut output)
        .expect("must generate completions");
    let script = String::from_utf8(output).expect("script is utf-8");
    assert!(script.contains("iconshift"));
    assert!(script.contains("clear-cache"));
}

#[test]
fn completion_shell_falls_back_to_env_then_platform() {
    assert_eq!(
        resolve_completion_shell(Some(CliCompletionShell::Fish), Some("/bin/zsh"), false),
        CliCompletionShell::Fish
    );
    assert_eq!(
        resolve_completion_shell(None, Some("/usr/bin/zsh"), false),
        CliCompletionShell::Zsh
    );
    assert_eq!(
        resolve_completion_shell(None, Some("C:/Program Files/PowerShell/7/pwsh.exe"), false),
        CliCompletionShell::Powershell
    );
    assert_eq!(
        resolve_completion_shell(None, None, true),
        CliCompletionShell::Powershell
    );
    assert_eq!(
        resolve_completion_shell(None, Some("tcsh"), false),
        CliCompletionShell::Bash
    );
}

#[test]
fn apply_commits_and_honors_auto_cleanup() {
    let root = test_root("apply-commit");
    let icon = IconRef::new(write_icon(&root), 0);
    let (mut replacer, keys) = memory_replacer(&root);
    let config = EngineConfig {
        max_backups: 1,
        auto_cleanup: true,
        ..EngineConfig::default()
    };

    let first = run_apply(
        &mut replacer,
        &config,
        &Target::file_type(".txt"),
        &icon,
        false,
        false,
        plain(),
    )
    .expect("first apply must succeed")
    .expect("first apply must commit");
    let second = run_apply(
        &mut replacer,
        &config,
        &Target::file_type(".md"),
        &icon,
        false,
        false,
        plain(),
    )
    .expect("second apply must succeed")
    .expect("second apply must commit");

    assert_ne!(first.id, second.id);
    let backups = replacer.backup_store().list().expect("must list backups");
    assert_eq!(backups, vec![second]);
    assert!(keys
        .default_value(r"Software\Classes\.txt\DefaultIcon")
        .expect("must read value")
        .is_some());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn apply_with_no_commit_leaves_no_trace() {
    let root = test_root("apply-no-commit");
    let icon = IconRef::new(write_icon(&root), 0);
    let (mut replacer, keys) = memory_replacer(&root);
    let keys_before = keys.key_count();

    let backup = run_apply(
        &mut replacer,
        &EngineConfig::default(),
        &Target::file_type(".log"),
        &icon,
        true,
        false,
        plain(),
    )
    .expect("apply must succeed");

    assert!(backup.is_none());
    assert_eq!(replacer.pending_count(), 0);
    assert_eq!(keys.key_count(), keys_before);
    assert!(replacer
        .backup_store()
        .list()
        .expect("must list backups")
        .is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn apply_without_elevate_reports_elevation_required() {
    let root = test_root("apply-elevation");
    let protected = root.join("system");
    let folder = protected.join("Fonts");
    fs::create_dir_all(&folder).expect("must create folder");
    let icon = IconRef::new(write_icon(&root), 0);
    let mut replacer = Replacer::new(
        BackupStore::new(StateLayout::new(root.join("state"))),
        AccessorTable::from_parts(
            Arc::new(MemoryKeyStore::new()),
            Arc::new(NoopAttributes),
            Arc::new(UnavailableBridge),
        ),
        PermissionGate::with_protected_roots(Box::new(UserProbe), vec![protected]),
        Box::new(FormatIconValidator::default()),
    );

    let err = run_apply(
        &mut replacer,
        &EngineConfig::default(),
        &Target::folder(&folder),
        &icon,
        false,
        true,
        plain(),
    )
    .expect_err("declined elevation must fail");
    assert!(err.to_string().contains("elevation was declined"));
    assert_eq!(
        err.downcast_ref::<IconError>().map(IconError::kind),
        Some(ErrorKind::ElevationRequired)
    );
    assert_eq!(replacer.pending_count(), 0);

    let _ = fs::remove_dir_all(&root);
}

fn batch_plan(root: &Path, on_failure: FailurePolicy) -> BatchPlan {
    BatchPlan {
        icon: write_icon(root),
        index: 0,
        on_failure,
        targets: vec![
            Target::file_type(".aaa"),
            Target::folder(root.join("missing")),
            Target::file_type(".ccc"),
        ],
    }
}

#[test]
fn batch_rollback_policy_undoes_applied_items() {
    let root = test_root("batch-rollback");
    let (mut replacer, keys) = memory_replacer(&root);
    let keys_before = keys.key_count();
    let plan = batch_plan(&root, FailurePolicy::Rollback);

    let err = run_batch(&mut replacer, &plan, &EngineConfig::default(), plain())
        .expect_err("a failed item must fail the batch");
    assert_eq!(
        err.downcast_ref::<IconError>().map(IconError::kind),
        Some(ErrorKind::PartialBatchFailure)
    );
    assert_eq!(replacer.pending_count(), 0);
    assert_eq!(keys.key_count(), keys_before);
    assert!(replacer
        .backup_store()
        .list()
        .expect("must list backups")
        .is_empty());

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn batch_commit_policy_keeps_applied_items() {
    let root = test_root("batch-commit");
    let (mut replacer, _keys) = memory_replacer(&root);
    let plan = batch_plan(&root, FailurePolicy::Commit);

    run_batch(&mut replacer, &plan, &EngineConfig::default(), plain())
        .expect_err("a failed item must fail the batch");
    let backups = replacer.backup_store().list().expect("must list backups");
    assert_eq!(backups.len(), 1);
    assert_eq!(
        backups[0]
            .entries
            .iter()
            .map(|entry| entry.target.clone())
            .collect::<Vec<_>>(),
        vec![Target::file_type(".aaa"), Target::file_type(".ccc")]
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn successful_batch_commits_one_backup() {
    let root = test_root("batch-ok");
    let (mut replacer, _keys) = memory_replacer(&root);
    let mut plan = batch_plan(&root, FailurePolicy::Rollback);
    plan.targets.remove(1);

    let report = run_batch(&mut replacer, &plan, &EngineConfig::default(), plain())
        .expect("batch must succeed");
    assert_eq!(report.succeeded(), 2);
    assert_eq!(
        replacer
            .backup_store()
            .list()
            .expect("must list backups")
            .len(),
        1
    );

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn batch_report_lines_number_failures_from_one() {
    let report = BatchReport {
        total: 3,
        operations: Vec::new(),
        failed: vec![BatchFailure {
            index: 1,
            target: Target::file_type(".bad"),
            kind: ErrorKind::AccessDenied,
            reason: "write refused".to_string(),
        }],
        skipped: 2,
    };
    assert_eq!(
        format_batch_report_lines(&report, OutputStyle::Rich),
        vec![
            "[ERR] item 2 file type '.bad' (access-denied): write refused".to_string(),
            "[WARN] batch: 0 of 3 applied, 1 failed, 2 skipped".to_string(),
        ]
    );
}

#[test]
fn backup_list_lines_show_entries_under_each_backup() {
    assert_eq!(
        format_backup_list_lines(&[], OutputStyle::Plain),
        vec!["no backups".to_string()]
    );

    let backup = Backup {
        id: "bk-1771001234-0123456789ab".to_string(),
        created_at: 1_771_001_234,
        entries: vec![BackupEntry {
            operation_id: "op-1".to_string(),
            target: Target::file_type(".txt"),
            resource_kind: ResourceKind::RegistryValue,
            address: ResourceAddress::RegistryKey {
                key: r"Software\Classes\.txt\DefaultIcon".to_string(),
            },
            prior_value: PriorRecord::Registry {
                value: None,
                missing_keys: Vec::new(),
            },
            new_value: IconRef::new("C:/Icons/text.ico", 0),
            restored_files: Default::default(),
        }],
    };
    assert_eq!(
        format_backup_list_lines(&[backup], OutputStyle::Plain),
        vec![
            "bk-1771001234-0123456789ab created_at=1771001234 entries=1".to_string(),
            "  file type '.txt' -> C:/Icons/text.ico,0 [registry-value]".to_string(),
        ]
    );
}
