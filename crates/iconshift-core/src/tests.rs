use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use super::*;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_dir() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let seq = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "iconshift-core-test-{}-{nanos}-{seq}",
        std::process::id()
    ));
    fs::create_dir_all(&dir).expect("must create test dir");
    dir
}

#[test]
fn file_type_target_normalizes_extension() {
    let target = Target::file_type("TXT").normalized().expect("must normalize");
    assert_eq!(target, Target::file_type(".txt"));

    let dotted = Target::file_type(" .Md ").normalized().expect("must normalize");
    assert_eq!(dotted, Target::file_type(".md"));
}

#[test]
fn file_type_target_rejects_empty_and_invalid_extensions() {
    let err = Target::file_type(".").normalized().expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidTarget);

    let err = Target::file_type("t x t").normalized().expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidTarget);
}

#[test]
fn shortcut_target_requires_lnk_extension() {
    assert!(Target::shortcut("C:/Users/me/Desktop/App.LNK")
        .normalized()
        .is_ok());
    let err = Target::shortcut("C:/Users/me/Desktop/App.url")
        .normalized()
        .expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidTarget);
    assert!(err.to_string().contains(".lnk"));
}

#[test]
fn executable_target_requires_exe_extension() {
    let err = Target::executable("tool.bat")
        .normalized()
        .expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::InvalidTarget);
}

#[test]
fn folder_aliases_normalize_to_one_path() {
    let root = fs::canonicalize(test_dir()).expect("must canonicalize test dir");
    let folder = root.join("f");
    fs::create_dir_all(root.join("x")).expect("must create sibling");
    fs::create_dir_all(&folder).expect("must create folder");

    let direct = Target::folder(&folder).normalized().expect("must normalize");
    let dotted = Target::folder(root.join("x").join("..").join(".").join("f"))
        .normalized()
        .expect("must normalize");
    assert_eq!(direct, dotted);
    assert_eq!(direct, Target::folder(&folder));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn missing_paths_normalize_lexically_to_absolute() {
    let root = fs::canonicalize(test_dir()).expect("must canonicalize test dir");
    let target = Target::executable(root.join("gone").join("..").join("bin").join("tool.exe"))
        .normalized()
        .expect("must normalize");
    assert_eq!(target, Target::executable(root.join("bin").join("tool.exe")));

    let relative = Target::folder("some-missing-dir/../other")
        .normalized()
        .expect("must normalize");
    let path = relative.path().expect("folder has a path");
    assert!(path.is_absolute());
    assert!(path.ends_with("other"));
    assert!(!path.components().any(|part| part.as_os_str() == ".."));

    let _ = fs::remove_dir_all(&root);
}

#[test]
fn targets_map_to_resource_kinds() {
    assert_eq!(
        Target::folder("a").resource_kind(),
        ResourceKind::FolderMarker
    );
    assert_eq!(
        Target::file_type(".txt").resource_kind(),
        ResourceKind::RegistryValue
    );
    assert_eq!(
        Target::executable("a.exe").resource_kind(),
        ResourceKind::RegistryValue
    );
    assert_eq!(
        Target::shortcut("a.lnk").resource_kind(),
        ResourceKind::ShortcutLink
    );
}

#[test]
fn target_kind_builds_targets_from_cli_values() {
    assert_eq!(
        TargetKind::FileType.target_from(".png"),
        Target::file_type(".png")
    );
    assert_eq!(TargetKind::Folder.as_str(), "folder");
}

#[test]
fn target_serializes_with_kind_tag() {
    let plan = BatchPlan {
        icon: PathBuf::from("blue.ico"),
        index: 0,
        on_failure: FailurePolicy::Rollback,
        targets: vec![Target::file_type(".txt")],
    };
    let encoded = toml::to_string(&plan).expect("must encode");
    assert!(encoded.contains("kind = \"file-type\""));
    assert!(encoded.contains("extension = \".txt\""));
}

#[test]
fn icon_location_round_trips_through_parse() {
    let icon = IconRef::new("C:/icons/blue.ico", 3);
    assert_eq!(icon.location(), "C:/icons/blue.ico,3");
    assert_eq!(IconRef::parse_location(&icon.location()), Some(icon));
}

#[test]
fn icon_location_parse_without_index_defaults_to_zero() {
    assert_eq!(
        IconRef::parse_location("\"C:/icons/blue.ico\""),
        Some(IconRef::new("C:/icons/blue.ico", 0))
    );
    assert_eq!(IconRef::parse_location("   "), None);
}

#[test]
fn validator_accepts_minimal_ico_header() {
    let dir = test_dir();
    let icon = dir.join("blue.ico");
    fs::write(&icon, [0_u8, 0, 1, 0, 1, 0]).expect("must write icon");

    FormatIconValidator::default()
        .validate(&IconRef::new(&icon, 0))
        .expect("must accept");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn validator_rejects_missing_unsupported_and_mismatched_icons() {
    let dir = test_dir();
    let validator = FormatIconValidator::default();

    let missing = validator
        .validate(&IconRef::new(dir.join("missing.ico"), 0))
        .expect_err("missing must fail");
    assert_eq!(missing.kind(), ErrorKind::InvalidIcon);

    let text = dir.join("notes.txt");
    fs::write(&text, "hello").expect("must write");
    let unsupported = validator
        .validate(&IconRef::new(&text, 0))
        .expect_err("txt must fail");
    assert!(unsupported.to_string().contains("unsupported format"));

    let fake = dir.join("fake.ico");
    fs::write(&fake, b"PNG!").expect("must write");
    let mismatched = validator
        .validate(&IconRef::new(&fake, 0))
        .expect_err("bad header must fail");
    assert!(mismatched.to_string().contains("header"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn validator_enforces_size_limit() {
    let dir = test_dir();
    let icon = dir.join("big.png");
    fs::write(&icon, vec![0_u8; 64]).expect("must write");

    let err = FormatIconValidator::with_max_bytes(16)
        .validate(&IconRef::new(&icon, 0))
        .expect_err("must reject oversized icon");
    assert!(err.to_string().contains("too large"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn engine_config_defaults_apply_for_empty_document() {
    let config = EngineConfig::from_toml_str("").expect("must parse");
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.max_backups, DEFAULT_MAX_BACKUPS);
    assert_eq!(config.log_level, "warn");
}

#[test]
fn engine_config_rejects_unknown_keys_and_bad_values() {
    let err = EngineConfig::from_toml_str("theme = \"dark\"\n").expect_err("must reject");
    assert_eq!(err.kind(), ErrorKind::Config);

    let err = EngineConfig::from_toml_str("max_backups = 0\n").expect_err("must reject");
    assert!(err.to_string().contains("max_backups"));

    let err = EngineConfig::from_toml_str("log_level = \"loud\"\n").expect_err("must reject");
    assert!(err.to_string().contains("loud"));
}

#[test]
fn engine_config_load_missing_file_returns_defaults() {
    let dir = test_dir();
    let config = EngineConfig::load(&dir.join("config.toml")).expect("must load");
    assert_eq!(config, EngineConfig::default());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn batch_plan_parses_tagged_targets() {
    let plan = BatchPlan::from_toml_str(
        r#"
icon = "C:/icons/blue.ico"
index = 2
on_failure = "commit"

[[targets]]
kind = "folder"
path = "C:/Users/me/Projects"

[[targets]]
kind = "file-type"
extension = ".log"

[[targets]]
kind = "shortcut"
path = "C:/Users/me/Desktop/Editor.lnk"

[[targets]]
kind = "executable"
path = "C:/Tools/editor.exe"
"#,
    )
    .expect("plan must parse");

    assert_eq!(plan.on_failure, FailurePolicy::Commit);
    assert_eq!(plan.icon_ref(), IconRef::new("C:/icons/blue.ico", 2));
    assert_eq!(
        plan.targets,
        vec![
            Target::folder("C:/Users/me/Projects"),
            Target::file_type(".log"),
            Target::shortcut("C:/Users/me/Desktop/Editor.lnk"),
            Target::executable("C:/Tools/editor.exe"),
        ]
    );
}

#[test]
fn batch_plan_requires_targets() {
    let err = BatchPlan::from_toml_str("icon = \"blue.ico\"\n").expect_err("must reject");
    assert!(err.to_string().contains("at least one target"));
}

#[test]
fn batch_plan_load_resolves_relative_icon_against_plan_dir() {
    let dir = test_dir();
    let plan_path = dir.join("plan.toml");
    fs::write(
        &plan_path,
        "icon = \"icons/blue.ico\"\n[[targets]]\nkind = \"file-type\"\nextension = \"txt\"\n",
    )
    .expect("must write plan");

    let plan = BatchPlan::load(&plan_path).expect("must load");
    assert_eq!(plan.icon, dir.join("icons/blue.ico"));
    assert_eq!(plan.on_failure, FailurePolicy::Rollback);

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn error_kinds_and_remedies_are_stable() {
    let err = IconError::ElevationRequired {
        target: "folder 'C:/Windows/Fonts'".to_string(),
        guidance: "protected".to_string(),
    };
    assert_eq!(err.kind(), ErrorKind::ElevationRequired);
    assert_eq!(err.kind().as_str(), "elevation-required");
    assert!(err.remedy().contains("administrator"));

    let err = IconError::NothingToRollback {
        committed_backup: Some("bk-1".to_string()),
    };
    assert!(err.to_string().contains("bk-1"));

    let err = IconError::unavailable("shell automation", "shortcut 'a.lnk'", "COM missing");
    assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    assert_ne!(err.kind(), ErrorKind::AccessDenied);
}
