use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};

use iconshift_core::Target;
use tracing::{debug, info, warn};

/// Result of classifying a target's address. Computed per call, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivilegeAssessment {
    pub is_admin: bool,
    pub path_is_protected: bool,
    pub elevation_required: bool,
    pub guidance_message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElevationOutcome {
    Granted,
    Denied,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Replace,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightBlock {
    Missing,
    Protected,
    NotWritable,
}

/// Answer of [`PermissionGate::validate_operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub can_proceed: bool,
    pub message: String,
    pub needs_elevation: bool,
    pub block: Option<PreflightBlock>,
}

impl Preflight {
    fn passed(message: impl Into<String>) -> Self {
        Self {
            can_proceed: true,
            message: message.into(),
            needs_elevation: false,
            block: None,
        }
    }

    fn blocked(block: PreflightBlock, message: impl Into<String>, needs_elevation: bool) -> Self {
        Self {
            can_proceed: false,
            message: message.into(),
            needs_elevation,
            block: Some(block),
        }
    }
}

/// Host privilege queries. The system implementation shells out; tests
/// substitute a scripted probe.
pub trait PrivilegeProbe {
    fn is_admin(&self) -> bool;

    fn request_elevation(&self, reason: &str) -> ElevationOutcome;

    fn can_write_dir(&self, dir: &Path) -> bool {
        let probe = dir.join(format!(".iconshift-write-probe-{}", std::process::id()));
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&probe)
        {
            Ok(file) => {
                drop(file);
                let _ = fs::remove_file(&probe);
                true
            }
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "write probe failed");
                false
            }
        }
    }

    fn can_write_file(&self, path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(metadata) => !metadata.permissions().readonly(),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPrivilegeProbe;

impl PrivilegeProbe for SystemPrivilegeProbe {
    fn is_admin(&self) -> bool {
        if cfg!(windows) {
            return Command::new("net")
                .arg("session")
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false);
        }

        Command::new("id")
            .arg("-u")
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "0")
            .unwrap_or(false)
    }

    fn request_elevation(&self, reason: &str) -> ElevationOutcome {
        if self.is_admin() {
            return ElevationOutcome::Granted;
        }
        if !cfg!(windows) {
            info!(reason, "elevation prompt is not available on this host");
            return ElevationOutcome::Unavailable;
        }

        let Ok(exe) = std::env::current_exe() else {
            return ElevationOutcome::Unavailable;
        };
        let args = std::env::args()
            .skip(1)
            .map(|arg| quote_powershell(&arg))
            .collect::<Vec<_>>();
        let mut script = format!(
            "$p = Start-Process -FilePath {} -Verb RunAs -Wait -PassThru",
            quote_powershell(&exe.display().to_string())
        );
        if !args.is_empty() {
            script.push_str(&format!(" -ArgumentList {}", args.join(",")));
        }
        script.push_str("; exit $p.ExitCode");

        info!(reason, "requesting elevation");
        match Command::new("powershell")
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(&script)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => ElevationOutcome::Granted,
            Ok(status) => {
                info!(%status, "elevation was declined or the elevated run failed");
                ElevationOutcome::Denied
            }
            Err(err) => {
                warn!(error = %err, "failed to launch elevation prompt");
                ElevationOutcome::Unavailable
            }
        }
    }
}

/// Decides whether the current process may mutate a target.
pub struct PermissionGate {
    protected_roots: Vec<PathBuf>,
    probe: Box<dyn PrivilegeProbe>,
}

impl PermissionGate {
    pub fn new(probe: Box<dyn PrivilegeProbe>) -> Self {
        Self::with_protected_roots(probe, default_protected_roots())
    }

    pub fn system() -> Self {
        Self::new(Box::new(SystemPrivilegeProbe))
    }

    pub fn with_protected_roots(
        probe: Box<dyn PrivilegeProbe>,
        protected_roots: Vec<PathBuf>,
    ) -> Self {
        Self {
            protected_roots,
            probe,
        }
    }

    pub fn add_protected_roots(&mut self, roots: impl IntoIterator<Item = PathBuf>) {
        for root in roots {
            if !self.protected_roots.contains(&root) {
                self.protected_roots.push(root);
            }
        }
    }

    pub fn protected_roots(&self) -> &[PathBuf] {
        &self.protected_roots
    }

    pub fn is_protected_path(&self, path: &Path) -> bool {
        let resolved = fs::canonicalize(path).unwrap_or_else(|_| lexical_normalize(path));
        self.protected_roots.iter().any(|root| {
            let root = fs::canonicalize(root).unwrap_or_else(|_| lexical_normalize(root));
            path_starts_with(&resolved, &root)
        })
    }

    pub fn assess(&self, target: &Target) -> PrivilegeAssessment {
        let is_admin = self.probe.is_admin();
        match target {
            Target::FileType { .. } => PrivilegeAssessment {
                is_admin,
                path_is_protected: false,
                elevation_required: false,
                guidance_message: "per-user file type registration; no elevation needed"
                    .to_string(),
            },
            Target::Executable { path } => PrivilegeAssessment {
                is_admin,
                path_is_protected: self.is_protected_path(path),
                elevation_required: false,
                guidance_message:
                    "per-user application class registration; the executable itself is not modified"
                        .to_string(),
            },
            Target::Folder { path } => self.assess_path(is_admin, path, "folder"),
            Target::Shortcut { path } => {
                let parent = path.parent().unwrap_or(path.as_path());
                self.assess_path(is_admin, parent, "shortcut location")
            }
        }
    }

    pub fn request_elevation(&self, reason: &str) -> ElevationOutcome {
        self.probe.request_elevation(reason)
    }

    /// The single pre-flight check to run before any accessor write.
    pub fn validate_operation(&self, operation: OperationKind, target: &Target) -> Preflight {
        match target {
            Target::FileType { .. } => Preflight::passed("per-user registry write permitted"),
            Target::Executable { path } => {
                if operation == OperationKind::Replace && !path.is_file() {
                    return Preflight::blocked(
                        PreflightBlock::Missing,
                        format!("executable not found: {}", path.display()),
                        false,
                    );
                }
                Preflight::passed("per-user registry write permitted")
            }
            Target::Folder { path } => {
                if !path.is_dir() {
                    return Preflight::blocked(
                        PreflightBlock::Missing,
                        format!("folder not found: {}", path.display()),
                        false,
                    );
                }
                self.validate_location(path, None)
            }
            Target::Shortcut { path } => {
                if operation == OperationKind::Replace && !path.is_file() {
                    return Preflight::blocked(
                        PreflightBlock::Missing,
                        format!("shortcut not found: {}", path.display()),
                        false,
                    );
                }
                let Some(parent) = path.parent().filter(|parent| parent.is_dir()) else {
                    return Preflight::blocked(
                        PreflightBlock::Missing,
                        format!("shortcut directory not found: {}", path.display()),
                        false,
                    );
                };
                let file = path.is_file().then_some(path.as_path());
                self.validate_location(parent, file)
            }
        }
    }

    fn assess_path(&self, is_admin: bool, path: &Path, label: &str) -> PrivilegeAssessment {
        let path_is_protected = self.is_protected_path(path);
        let elevation_required = path_is_protected && !is_admin;
        let guidance_message = if elevation_required {
            format!(
                "{label} {} is in a protected system location; administrator rights are required",
                path.display()
            )
        } else if path_is_protected {
            format!(
                "{label} {} is protected; running with administrator rights",
                path.display()
            )
        } else {
            format!("{label} {} is user-owned", path.display())
        };

        PrivilegeAssessment {
            is_admin,
            path_is_protected,
            elevation_required,
            guidance_message,
        }
    }

    fn validate_location(&self, dir: &Path, file: Option<&Path>) -> Preflight {
        let is_admin = self.probe.is_admin();
        if self.is_protected_path(dir) && !is_admin {
            return Preflight::blocked(
                PreflightBlock::Protected,
                format!(
                    "{} is in a protected system location; administrator rights are required",
                    dir.display()
                ),
                true,
            );
        }

        if !self.probe.can_write_dir(dir) {
            return Preflight::blocked(
                PreflightBlock::NotWritable,
                format!("write permission denied: {}", dir.display()),
                !is_admin,
            );
        }
        if let Some(file) = file {
            if !self.probe.can_write_file(file) {
                return Preflight::blocked(
                    PreflightBlock::NotWritable,
                    format!("file is read-only: {}", file.display()),
                    false,
                );
            }
        }

        Preflight::passed("permission check passed")
    }
}

pub fn default_protected_roots() -> Vec<PathBuf> {
    if cfg!(windows) {
        let mut roots = Vec::new();
        for (var, fallback) in [
            ("SystemRoot", r"C:\Windows"),
            ("ProgramFiles", r"C:\Program Files"),
            ("ProgramFiles(x86)", r"C:\Program Files (x86)"),
            ("ProgramW6432", r"C:\Program Files"),
        ] {
            let root = std::env::var_os(var)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(fallback));
            if !roots.contains(&root) {
                roots.push(root);
            }
        }
        return roots;
    }

    [
        "/bin", "/boot", "/etc", "/lib", "/lib64", "/sbin", "/usr", "/System", "/Library",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn path_starts_with(path: &Path, root: &Path) -> bool {
    let mut path_components = path.components();
    for root_component in root.components() {
        let Some(path_component) = path_components.next() else {
            return false;
        };
        let left = path_component.as_os_str().to_string_lossy();
        let right = root_component.as_os_str().to_string_lossy();
        let equal = if cfg!(windows) {
            left.eq_ignore_ascii_case(&right)
        } else {
            left == right
        };
        if !equal {
            return false;
        }
    }
    true
}

fn quote_powershell(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct ScriptedProbe {
        admin: bool,
        writable: bool,
        elevation: ElevationOutcome,
        elevation_requests: Rc<Cell<u32>>,
    }

    impl ScriptedProbe {
        fn user() -> Self {
            Self {
                admin: false,
                writable: true,
                elevation: ElevationOutcome::Denied,
                elevation_requests: Rc::new(Cell::new(0)),
            }
        }
    }

    impl PrivilegeProbe for ScriptedProbe {
        fn is_admin(&self) -> bool {
            self.admin
        }

        fn request_elevation(&self, _reason: &str) -> ElevationOutcome {
            self.elevation_requests.set(self.elevation_requests.get() + 1);
            self.elevation
        }

        fn can_write_dir(&self, _dir: &Path) -> bool {
            self.writable
        }
    }

    fn test_root(label: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time")
            .as_nanos();
        let root = std::env::temp_dir().join(format!(
            "iconshift-gate-{label}-{}-{nanos}",
            std::process::id()
        ));
        fs::create_dir_all(&root).expect("must create root");
        root
    }

    #[test]
    fn file_type_targets_never_need_elevation() {
        let gate =
            PermissionGate::with_protected_roots(Box::new(ScriptedProbe::user()), Vec::new());
        let assessment = gate.assess(&Target::file_type(".txt"));
        assert!(!assessment.elevation_required);
        assert!(!assessment.path_is_protected);

        let preflight = gate.validate_operation(OperationKind::Replace, &Target::file_type(".txt"));
        assert!(preflight.can_proceed);
        assert!(!preflight.needs_elevation);
    }

    #[test]
    fn folder_under_protected_root_requires_elevation_for_non_admin() {
        let root = test_root("protected");
        let folder = root.join("System32");
        fs::create_dir_all(&folder).expect("must create folder");
        let gate =
            PermissionGate::with_protected_roots(
                Box::new(ScriptedProbe::user()),
                vec![root.clone()],
            );

        let assessment = gate.assess(&Target::folder(&folder));
        assert!(assessment.path_is_protected);
        assert!(assessment.elevation_required);
        assert!(assessment.guidance_message.contains("administrator"));

        let preflight = gate.validate_operation(OperationKind::Replace, &Target::folder(&folder));
        assert!(!preflight.can_proceed);
        assert!(preflight.needs_elevation);
        assert_eq!(preflight.block, Some(PreflightBlock::Protected));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn admin_may_write_protected_folder() {
        let root = test_root("admin");
        let gate = PermissionGate::with_protected_roots(
            Box::new(ScriptedProbe {
                admin: true,
                ..ScriptedProbe::user()
            }),
            vec![root.clone()],
        );

        let preflight = gate.validate_operation(OperationKind::Replace, &Target::folder(&root));
        assert!(preflight.can_proceed);
        assert!(!gate.assess(&Target::folder(&root)).elevation_required);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn unwritable_user_folder_reports_not_writable() {
        let root = test_root("readonly");
        let gate = PermissionGate::with_protected_roots(
            Box::new(ScriptedProbe {
                writable: false,
                ..ScriptedProbe::user()
            }),
            Vec::new(),
        );

        let preflight = gate.validate_operation(OperationKind::Replace, &Target::folder(&root));
        assert!(!preflight.can_proceed);
        assert_eq!(preflight.block, Some(PreflightBlock::NotWritable));
        assert!(preflight.needs_elevation);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_targets_are_reported_without_elevation() {
        let root = test_root("missing");
        let gate =
            PermissionGate::with_protected_roots(Box::new(ScriptedProbe::user()), Vec::new());

        let folder = gate.validate_operation(
            OperationKind::Replace,
            &Target::folder(root.join("nope")),
        );
        assert_eq!(folder.block, Some(PreflightBlock::Missing));
        assert!(!folder.needs_elevation);

        let shortcut = gate.validate_operation(
            OperationKind::Replace,
            &Target::shortcut(root.join("nope.lnk")),
        );
        assert_eq!(shortcut.block, Some(PreflightBlock::Missing));

        let restore = gate.validate_operation(
            OperationKind::Restore,
            &Target::shortcut(root.join("gone.lnk")),
        );
        assert!(restore.can_proceed);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn elevation_denial_is_ordinary_data() {
        let requests = Rc::new(Cell::new(0));
        let gate = PermissionGate::with_protected_roots(
            Box::new(ScriptedProbe {
                elevation_requests: Rc::clone(&requests),
                ..ScriptedProbe::user()
            }),
            Vec::new(),
        );

        assert_eq!(
            gate.request_elevation("change folder icon"),
            ElevationOutcome::Denied
        );
        assert_eq!(requests.get(), 1);
    }

    #[test]
    fn protected_path_matching_is_component_based() {
        let gate = PermissionGate::with_protected_roots(
            Box::new(ScriptedProbe::user()),
            vec![PathBuf::from("/opt/protected")],
        );
        assert!(gate.is_protected_path(Path::new("/opt/protected/app")));
        assert!(gate.is_protected_path(Path::new("/opt/protected/../protected/app")));
        assert!(!gate.is_protected_path(Path::new("/opt/protected-not/app")));
        assert!(!gate.is_protected_path(Path::new("/opt")));
    }

    #[test]
    fn add_protected_roots_deduplicates() {
        let mut gate =
            PermissionGate::with_protected_roots(Box::new(ScriptedProbe::user()), Vec::new());
        gate.add_protected_roots([PathBuf::from("/a"), PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(gate.protected_roots(), [PathBuf::from("/a"), PathBuf::from("/b")]);
    }
}
