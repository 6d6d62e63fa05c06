use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, OnceLock};

use iconshift_core::{IconError, IconRef, IconResult, ResourceKind, Target};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::accessor::{
    io_failure, mismatched_address, mismatched_snapshot, store_failure, ResourceAccessor,
    ResourceAddress, Snapshot,
};
use crate::fs_utils::{remove_file_if_exists, write_atomic};

const SHELL_SUBSYSTEM: &str = "shell automation";

/// Fields of a `.lnk` file that the shell exposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortcutMetadata {
    pub target_path: String,
    pub arguments: String,
    pub working_directory: String,
    pub icon_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortcutSnapshot {
    /// Raw link file; restoring writes these bytes back without the bridge.
    pub link_bytes: Option<Vec<u8>>,
    pub metadata: Option<ShortcutMetadata>,
}

/// Shell automation that can read and edit shortcut files. Check
/// `is_available` before any write.
pub trait ShellBridge {
    fn is_available(&self) -> bool;

    fn read_link(&self, path: &Path) -> IconResult<ShortcutMetadata>;

    fn set_icon_location(&self, path: &Path, location: &str) -> IconResult<()>;
}

/// `WScript.Shell` driven through PowerShell.
#[derive(Debug, Default)]
pub struct PowerShellBridge {
    available: OnceLock<bool>,
}

impl PowerShellBridge {
    fn run_script(&self, path: &Path, script: &str) -> IconResult<String> {
        let output = Command::new("powershell")
            .arg("-NoProfile")
            .arg("-NonInteractive")
            .arg("-Command")
            .arg(script)
            .output()
            .map_err(|err| {
                IconError::unavailable(
                    SHELL_SUBSYSTEM,
                    path.display(),
                    format!("failed to start powershell: {err}"),
                )
            })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("denied") || lowered.contains("unauthorizedaccess") {
            return Err(IconError::access_denied(
                path.display(),
                ResourceKind::ShortcutLink,
                stderr,
            ));
        }
        Err(IconError::unavailable(
            SHELL_SUBSYSTEM,
            path.display(),
            format!("status={} stderr='{stderr}'", output.status),
        ))
    }
}

impl ShellBridge for PowerShellBridge {
    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| {
            cfg!(windows)
                && Command::new("powershell")
                    .arg("-NoProfile")
                    .arg("-NonInteractive")
                    .arg("-Command")
                    .arg("$null = New-Object -ComObject WScript.Shell")
                    .output()
                    .map(|output| output.status.success())
                    .unwrap_or(false)
        })
    }

    fn read_link(&self, path: &Path) -> IconResult<ShortcutMetadata> {
        let script = format!(
            "$s = (New-Object -ComObject WScript.Shell).CreateShortcut({}); \
             Write-Output $s.TargetPath; Write-Output $s.Arguments; \
             Write-Output $s.WorkingDirectory; Write-Output $s.IconLocation",
            quote_powershell(&path.display().to_string())
        );
        let stdout = self.run_script(path, &script)?;
        let mut lines = stdout.lines().map(|line| line.trim_end().to_string());
        Ok(ShortcutMetadata {
            target_path: lines.next().unwrap_or_default(),
            arguments: lines.next().unwrap_or_default(),
            working_directory: lines.next().unwrap_or_default(),
            icon_location: lines.next().unwrap_or_default(),
        })
    }

    fn set_icon_location(&self, path: &Path, location: &str) -> IconResult<()> {
        let script = format!(
            "$s = (New-Object -ComObject WScript.Shell).CreateShortcut({}); \
             $s.IconLocation = {}; $s.Save()",
            quote_powershell(&path.display().to_string()),
            quote_powershell(location)
        );
        self.run_script(path, &script).map(|_| ())
    }
}

/// Bridge for environments without shell automation.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableBridge;

impl ShellBridge for UnavailableBridge {
    fn is_available(&self) -> bool {
        false
    }

    fn read_link(&self, path: &Path) -> IconResult<ShortcutMetadata> {
        Err(IconError::unavailable(
            SHELL_SUBSYSTEM,
            path.display(),
            "no shell automation bridge on this host",
        ))
    }

    fn set_icon_location(&self, path: &Path, _location: &str) -> IconResult<()> {
        Err(IconError::unavailable(
            SHELL_SUBSYSTEM,
            path.display(),
            "no shell automation bridge on this host",
        ))
    }
}

pub struct ShortcutAccessor {
    bridge: Arc<dyn ShellBridge>,
}

impl ShortcutAccessor {
    pub fn new(bridge: Arc<dyn ShellBridge>) -> Self {
        Self { bridge }
    }

    fn path<'a>(&self, address: &'a ResourceAddress) -> IconResult<&'a Path> {
        match address {
            ResourceAddress::ShortcutLink { path } => Ok(path.as_path()),
            other => Err(mismatched_address(ResourceKind::ShortcutLink, other)),
        }
    }
}

impl ResourceAccessor for ShortcutAccessor {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ShortcutLink
    }

    fn resolve(&self, target: &Target) -> IconResult<ResourceAddress> {
        match target {
            Target::Shortcut { path } => Ok(ResourceAddress::ShortcutLink { path: path.clone() }),
            other => Err(IconError::invalid_target(other, "target is not a shortcut")),
        }
    }

    fn read(&self, address: &ResourceAddress) -> IconResult<Snapshot> {
        let path = self.path(address)?;
        if !path.is_file() {
            return Ok(Snapshot::Shortcut(ShortcutSnapshot {
                link_bytes: None,
                metadata: None,
            }));
        }

        let link_bytes = fs::read(path)
            .map_err(|err| io_failure(ResourceKind::ShortcutLink, path, "read shortcut", err))?;
        let metadata = if self.bridge.is_available() {
            match self.bridge.read_link(path) {
                Ok(metadata) => Some(metadata),
                Err(err) => {
                    debug!(
                        shortcut = %path.display(),
                        error = %err,
                        "shortcut metadata unreadable"
                    );
                    None
                }
            }
        } else {
            None
        };

        Ok(Snapshot::Shortcut(ShortcutSnapshot {
            link_bytes: Some(link_bytes),
            metadata,
        }))
    }

    fn write(&self, address: &ResourceAddress, icon: &IconRef) -> IconResult<()> {
        let path = self.path(address)?;
        if !self.bridge.is_available() {
            return Err(IconError::unavailable(
                SHELL_SUBSYSTEM,
                path.display(),
                "shortcut metadata can only be edited through the shell",
            ));
        }
        if !path.is_file() {
            return Err(IconError::InvalidTarget {
                target: path.display().to_string(),
                reason: "shortcut does not exist".to_string(),
            });
        }

        self.bridge.set_icon_location(path, &icon.location())?;
        debug!(shortcut = %path.display(), location = %icon.location(), "updated shortcut icon");
        Ok(())
    }

    fn restore(&self, address: &ResourceAddress, prior: &Snapshot) -> IconResult<()> {
        let path = self.path(address)?;
        let Snapshot::Shortcut(prior) = prior else {
            return Err(mismatched_snapshot(ResourceKind::ShortcutLink, prior));
        };

        match &prior.link_bytes {
            Some(bytes) => {
                if fs::read(path).ok().as_deref() == Some(bytes.as_slice()) {
                    return Ok(());
                }
                let dir = path.parent().unwrap_or_else(|| Path::new("."));
                write_atomic(path, bytes, dir).map_err(|err| {
                    store_failure(ResourceKind::ShortcutLink, path, "restore shortcut", err)
                })
            }
            None => remove_file_if_exists(path).map_err(|err| {
                io_failure(ResourceKind::ShortcutLink, path, "remove shortcut", err)
            }),
        }
    }
}

fn quote_powershell(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
