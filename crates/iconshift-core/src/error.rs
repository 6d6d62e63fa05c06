use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::target::{ResourceKind, Target};

pub type IconResult<T> = Result<T, IconError>;

/// Failures surfaced by the replacement engine. Every variant maps onto a
/// stable [`ErrorKind`] that callers can match on without parsing messages.
#[derive(Debug, Error)]
pub enum IconError {
    #[error("invalid target {target}: {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("unusable icon '{}': {reason}", .path.display())]
    InvalidIcon { path: PathBuf, reason: String },

    #[error("access denied for {target} ({resource}): {detail}")]
    AccessDenied {
        target: String,
        resource: ResourceKind,
        detail: String,
    },

    #[error("elevation required for {target}: {guidance}")]
    ElevationRequired { target: String, guidance: String },

    #[error("{subsystem} is unavailable for {target}: {detail}")]
    ResourceUnavailable {
        subsystem: String,
        target: String,
        detail: String,
    },

    #[error("{}", nothing_to_rollback_message(.committed_backup.as_deref()))]
    NothingToRollback { committed_backup: Option<String> },

    #[error("nothing to commit: the ledger has no pending operations")]
    NothingToCommit,

    #[error("failed to persist backup: {detail}")]
    BackupPersistFailure { detail: String },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error(
        "restore of backup {backup_id} stopped after {restored} of {total} entries at {target}: {reason}"
    )]
    RestoreIncomplete {
        backup_id: String,
        restored: usize,
        total: usize,
        target: String,
        reason: String,
    },

    #[error("{} of {total} batch items failed", .failures.len())]
    PartialBatchFailure {
        total: usize,
        failures: Vec<(Target, String)>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Machine-checkable classification of an [`IconError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidTarget,
    InvalidIcon,
    AccessDenied,
    ElevationRequired,
    ResourceUnavailable,
    NothingToRollback,
    NothingToCommit,
    BackupPersistFailure,
    BackupNotFound,
    RestoreIncomplete,
    PartialBatchFailure,
    Io,
    Config,
}

impl IconError {
    pub fn invalid_target(target: &Target, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            target: target.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_icon(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidIcon {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn access_denied(
        target: impl fmt::Display,
        resource: ResourceKind,
        detail: impl Into<String>,
    ) -> Self {
        Self::AccessDenied {
            target: target.to_string(),
            resource,
            detail: detail.into(),
        }
    }

    pub fn unavailable(
        subsystem: impl Into<String>,
        target: impl fmt::Display,
        detail: impl Into<String>,
    ) -> Self {
        Self::ResourceUnavailable {
            subsystem: subsystem.into(),
            target: target.to_string(),
            detail: detail.into(),
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps an internal store failure; the full context chain is kept in
    /// the message.
    pub fn persist(err: anyhow::Error) -> Self {
        Self::BackupPersistFailure {
            detail: format!("{err:#}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidTarget { .. } => ErrorKind::InvalidTarget,
            Self::InvalidIcon { .. } => ErrorKind::InvalidIcon,
            Self::AccessDenied { .. } => ErrorKind::AccessDenied,
            Self::ElevationRequired { .. } => ErrorKind::ElevationRequired,
            Self::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            Self::NothingToRollback { .. } => ErrorKind::NothingToRollback,
            Self::NothingToCommit => ErrorKind::NothingToCommit,
            Self::BackupPersistFailure { .. } => ErrorKind::BackupPersistFailure,
            Self::BackupNotFound(_) => ErrorKind::BackupNotFound,
            Self::RestoreIncomplete { .. } => ErrorKind::RestoreIncomplete,
            Self::PartialBatchFailure { .. } => ErrorKind::PartialBatchFailure,
            Self::Io { .. } => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// What the user should try next.
    pub fn remedy(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InvalidTarget => "check that the target exists and is spelled correctly",
            ErrorKind::InvalidIcon => {
                "choose an existing .ico, .cur, .bmp, .png, .jpg, .gif, .exe or .dll icon source"
            }
            ErrorKind::AccessDenied => {
                "close programs using the target or check its permissions, then retry"
            }
            ErrorKind::ElevationRequired => {
                "try again after granting administrator rights (re-run from an elevated prompt)"
            }
            ErrorKind::ResourceUnavailable => {
                "the shell automation or registry tools are not reachable; retry on a Windows desktop session"
            }
            ErrorKind::NothingToRollback => {
                "committed changes are reverted with `restore <backup-id>`"
            }
            ErrorKind::NothingToCommit => "apply at least one change before committing",
            ErrorKind::BackupPersistFailure => {
                "check free space and permissions of the state directory; pending changes were kept"
            }
            ErrorKind::BackupNotFound => "list available backups with `backups list`",
            ErrorKind::RestoreIncomplete => {
                "fix the reported target and run the same restore again; the backup was kept"
            }
            ErrorKind::PartialBatchFailure => {
                "inspect the failed items, then commit or roll back the remaining changes"
            }
            ErrorKind::Io => "check that the path is reachable and writable",
            ErrorKind::Config => "fix the configuration file and retry",
        }
    }
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTarget => "invalid-target",
            Self::InvalidIcon => "invalid-icon",
            Self::AccessDenied => "access-denied",
            Self::ElevationRequired => "elevation-required",
            Self::ResourceUnavailable => "resource-unavailable",
            Self::NothingToRollback => "nothing-to-rollback",
            Self::NothingToCommit => "nothing-to-commit",
            Self::BackupPersistFailure => "backup-persist-failure",
            Self::BackupNotFound => "backup-not-found",
            Self::RestoreIncomplete => "restore-incomplete",
            Self::PartialBatchFailure => "partial-batch-failure",
            Self::Io => "io",
            Self::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn nothing_to_rollback_message(committed_backup: Option<&str>) -> String {
    match committed_backup {
        Some(backup_id) => format!(
            "nothing to roll back: previous changes were committed to backup {backup_id}"
        ),
        None => "nothing to roll back: the ledger is empty".to_string(),
    }
}
