use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IconError;

const MAX_EXTENSION_LEN: usize = 32;

/// A resource whose displayed icon can be redirected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Target {
    Folder { path: PathBuf },
    FileType { extension: String },
    Shortcut { path: PathBuf },
    Executable { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Folder,
    FileType,
    Shortcut,
    Executable,
}

/// The OS resource family an accessor mutates on behalf of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    RegistryValue,
    FolderMarker,
    ShortcutLink,
}

impl Target {
    pub fn folder(path: impl Into<PathBuf>) -> Self {
        Self::Folder { path: path.into() }
    }

    pub fn file_type(extension: impl Into<String>) -> Self {
        Self::FileType {
            extension: extension.into(),
        }
    }

    pub fn shortcut(path: impl Into<PathBuf>) -> Self {
        Self::Shortcut { path: path.into() }
    }

    pub fn executable(path: impl Into<PathBuf>) -> Self {
        Self::Executable { path: path.into() }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            Self::Folder { .. } => TargetKind::Folder,
            Self::FileType { .. } => TargetKind::FileType,
            Self::Shortcut { .. } => TargetKind::Shortcut,
            Self::Executable { .. } => TargetKind::Executable,
        }
    }

    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::FileType { .. } | Self::Executable { .. } => ResourceKind::RegistryValue,
            Self::Folder { .. } => ResourceKind::FolderMarker,
            Self::Shortcut { .. } => ResourceKind::ShortcutLink,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Folder { path } | Self::Shortcut { path } | Self::Executable { path } => {
                Some(path)
            }
            Self::FileType { .. } => None,
        }
    }

    /// Canonical spelling of the target. Paths that exist are resolved
    /// through the file system; others are made absolute and cleaned of
    /// `.` and `..` segments. Existence is not required here.
    pub fn normalized(&self) -> Result<Self, IconError> {
        match self {
            Self::Folder { path } => {
                require_non_empty_path(self, path)?;
                Ok(Self::Folder {
                    path: canonical_path(path),
                })
            }
            Self::FileType { extension } => Ok(Self::FileType {
                extension: normalized_extension(extension)
                    .map_err(|reason| IconError::invalid_target(self, reason))?,
            }),
            Self::Shortcut { path } => {
                require_non_empty_path(self, path)?;
                require_path_extension(self, path, "lnk")?;
                Ok(Self::Shortcut {
                    path: canonical_path(path),
                })
            }
            Self::Executable { path } => {
                require_non_empty_path(self, path)?;
                require_path_extension(self, path, "exe")?;
                Ok(Self::Executable {
                    path: canonical_path(path),
                })
            }
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Folder { path } => write!(f, "folder '{}'", path.display()),
            Self::FileType { extension } => write!(f, "file type '{extension}'"),
            Self::Shortcut { path } => write!(f, "shortcut '{}'", path.display()),
            Self::Executable { path } => write!(f, "executable '{}'", path.display()),
        }
    }
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::FileType => "file-type",
            Self::Shortcut => "shortcut",
            Self::Executable => "executable",
        }
    }

    /// Builds a target of this kind from its command-line spelling.
    pub fn target_from(&self, value: &str) -> Target {
        match self {
            Self::Folder => Target::folder(value),
            Self::FileType => Target::file_type(value),
            Self::Shortcut => Target::shortcut(value),
            Self::Executable => Target::executable(value),
        }
    }
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistryValue => "registry-value",
            Self::FolderMarker => "folder-marker",
            Self::ShortcutLink => "shortcut-link",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn normalized_extension(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Err("file extension must not be empty".to_string());
    }
    if trimmed.len() > MAX_EXTENSION_LEN {
        return Err(format!(
            "file extension is longer than {MAX_EXTENSION_LEN} characters"
        ));
    }
    if !trimmed
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '+'))
    {
        return Err(format!("file extension contains invalid character(s): {raw}"));
    }

    Ok(format!(".{}", trimmed.to_ascii_lowercase()))
}

pub(crate) fn canonical_path(path: &Path) -> PathBuf {
    match fs::canonicalize(path) {
        Ok(resolved) => strip_verbatim_prefix(resolved),
        Err(_) => {
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(path))
                    .unwrap_or_else(|_| path.to_path_buf())
            };
            lexical_normalize(&absolute)
        }
    }
}

// Drops the `\\?\` prefix that Windows canonicalization adds.
fn strip_verbatim_prefix(path: PathBuf) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path;
    };
    if let Some(share) = raw.strip_prefix(r"\\?\UNC\") {
        return PathBuf::from(format!(r"\\{share}"));
    }
    match raw.strip_prefix(r"\\?\") {
        Some(local) => PathBuf::from(local),
        None => path,
    }
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

fn require_non_empty_path(target: &Target, path: &Path) -> Result<(), IconError> {
    if path.as_os_str().is_empty() {
        return Err(IconError::invalid_target(target, "path must not be empty"));
    }
    Ok(())
}

fn require_path_extension(target: &Target, path: &Path, expected: &str) -> Result<(), IconError> {
    let matches = path
        .extension()
        .and_then(|value| value.to_str())
        .is_some_and(|value| value.eq_ignore_ascii_case(expected));
    if !matches {
        return Err(IconError::invalid_target(
            target,
            format!("expected a .{expected} file"),
        ));
    }
    Ok(())
}
