use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use iconshift_core::{IconError, IconRef, IconResult, ResourceKind, Target};
use serde::{Deserialize, Serialize};

use crate::folder::{
    AttributeControl, FolderMarkerAccessor, FolderSnapshot, NoopAttributes, WindowsAttributes,
};
use crate::registry::{KeyValueStore, RegCommandStore, RegistryIconAccessor, RegistrySnapshot};
use crate::shortcut::{PowerShellBridge, ShellBridge, ShortcutAccessor, ShortcutSnapshot};

/// Where an accessor reads and writes on behalf of a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ResourceAddress {
    /// Key path relative to the per-user hive.
    RegistryKey { key: String },
    FolderMarker { folder: PathBuf, marker: PathBuf },
    ShortcutLink { path: PathBuf },
}

impl ResourceAddress {
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::RegistryKey { .. } => ResourceKind::RegistryValue,
            Self::FolderMarker { .. } => ResourceKind::FolderMarker,
            Self::ShortcutLink { .. } => ResourceKind::ShortcutLink,
        }
    }

    /// Registry key paths compare without case, like the registry itself.
    pub fn same_resource(&self, other: &ResourceAddress) -> bool {
        match (self, other) {
            (Self::RegistryKey { key: left }, Self::RegistryKey { key: right }) => {
                left.eq_ignore_ascii_case(right)
            }
            _ => self == other,
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegistryKey { key } => write!(f, r"HKCU\{key}"),
            Self::FolderMarker { marker, .. } => write!(f, "{}", marker.display()),
            Self::ShortcutLink { path } => write!(f, "{}", path.display()),
        }
    }
}

/// Opaque prior state captured before a write. Only the accessor that
/// produced a snapshot knows how to put it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Registry(RegistrySnapshot),
    Folder(FolderSnapshot),
    Shortcut(ShortcutSnapshot),
}

impl Snapshot {
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Self::Registry(_) => ResourceKind::RegistryValue,
            Self::Folder(_) => ResourceKind::FolderMarker,
            Self::Shortcut(_) => ResourceKind::ShortcutLink,
        }
    }

    /// True when the resource held no customization before the write.
    pub fn is_absent(&self) -> bool {
        match self {
            Self::Registry(snapshot) => snapshot.value.is_none(),
            Self::Folder(snapshot) => snapshot.marker.is_none(),
            Self::Shortcut(snapshot) => snapshot.link_bytes.is_none(),
        }
    }

    /// Files a restore of this snapshot rewrites or removes.
    pub fn restored_files(&self, address: &ResourceAddress) -> Vec<PathBuf> {
        match (self, address) {
            (Self::Folder(snapshot), ResourceAddress::FolderMarker { marker, .. }) => {
                let mut files = vec![marker.clone()];
                if let Some(icon) = &snapshot.icon_file {
                    files.push(icon.path.clone());
                }
                files
            }
            (Self::Shortcut(_), ResourceAddress::ShortcutLink { path }) => vec![path.clone()],
            _ => Vec::new(),
        }
    }
}

/// Capability interface over one OS resource family.
pub trait ResourceAccessor {
    fn kind(&self) -> ResourceKind;

    fn resolve(&self, target: &Target) -> IconResult<ResourceAddress>;

    /// Reads the current state. Never mutates, even when the resource is absent.
    fn read(&self, address: &ResourceAddress) -> IconResult<Snapshot>;

    /// The snapshot to keep as prior value for a pending write of `icon`.
    fn snapshot_for_write(
        &self,
        address: &ResourceAddress,
        _icon: &IconRef,
    ) -> IconResult<Snapshot> {
        self.read(address)
    }

    fn write(&self, address: &ResourceAddress, icon: &IconRef) -> IconResult<()>;

    /// Puts `prior` back. Restoring an already-restored value is a no-op.
    fn restore(&self, address: &ResourceAddress, prior: &Snapshot) -> IconResult<()>;
}

/// Maps every target variant onto the accessor that owns its resource.
pub struct AccessorTable {
    registry: RegistryIconAccessor,
    folder: FolderMarkerAccessor,
    shortcut: ShortcutAccessor,
}

impl AccessorTable {
    pub fn new(
        registry: RegistryIconAccessor,
        folder: FolderMarkerAccessor,
        shortcut: ShortcutAccessor,
    ) -> Self {
        Self {
            registry,
            folder,
            shortcut,
        }
    }

    pub fn from_parts(
        store: Arc<dyn KeyValueStore>,
        attributes: Arc<dyn AttributeControl>,
        bridge: Arc<dyn ShellBridge>,
    ) -> Self {
        Self::new(
            RegistryIconAccessor::new(store),
            FolderMarkerAccessor::new(attributes),
            ShortcutAccessor::new(bridge),
        )
    }

    /// Accessors backed by the host's registry tool, attribute tool and shell automation.
    pub fn platform_default() -> Self {
        let attributes: Arc<dyn AttributeControl> = if cfg!(windows) {
            Arc::new(WindowsAttributes)
        } else {
            Arc::new(NoopAttributes)
        };
        Self::from_parts(
            Arc::new(RegCommandStore::current_user()),
            attributes,
            Arc::new(PowerShellBridge::default()),
        )
    }

    pub fn for_target(&self, target: &Target) -> &dyn ResourceAccessor {
        match target {
            Target::FileType { .. } | Target::Executable { .. } => &self.registry,
            Target::Folder { .. } => &self.folder,
            Target::Shortcut { .. } => &self.shortcut,
        }
    }

    pub fn for_kind(&self, kind: ResourceKind) -> &dyn ResourceAccessor {
        match kind {
            ResourceKind::RegistryValue => &self.registry,
            ResourceKind::FolderMarker => &self.folder,
            ResourceKind::ShortcutLink => &self.shortcut,
        }
    }
}

pub(crate) fn mismatched_address(expected: ResourceKind, address: &ResourceAddress) -> IconError {
    IconError::InvalidTarget {
        target: address.to_string(),
        reason: format!("address does not belong to the {expected} accessor"),
    }
}

pub(crate) fn mismatched_snapshot(expected: ResourceKind, snapshot: &Snapshot) -> IconError {
    IconError::InvalidTarget {
        target: snapshot.resource_kind().to_string(),
        reason: format!("prior value cannot be restored by the {expected} accessor"),
    }
}

/// Classifies a file-system failure on a resource the way callers pick remedies.
pub(crate) fn io_failure(
    resource: ResourceKind,
    path: &Path,
    action: &str,
    err: io::Error,
) -> IconError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => IconError::access_denied(
            path.display(),
            resource,
            format!("failed to {action}: {err}"),
        ),
        io::ErrorKind::NotFound => IconError::InvalidTarget {
            target: path.display().to_string(),
            reason: format!("failed to {action}: {err}"),
        },
        _ => IconError::io(format!("failed to {action}: {}", path.display()), err),
    }
}

/// Same classification for helpers that report through `anyhow`.
pub(crate) fn store_failure(
    resource: ResourceKind,
    path: &Path,
    action: &str,
    err: anyhow::Error,
) -> IconError {
    match err.root_cause().downcast_ref::<io::Error>() {
        Some(io_err) if io_err.kind() == io::ErrorKind::PermissionDenied => {
            IconError::access_denied(
                path.display(),
                resource,
                format!("failed to {action}: {err:#}"),
            )
        }
        _ => IconError::Io {
            context: format!("failed to {action}: {}", path.display()),
            source: io::Error::other(format!("{err:#}")),
        },
    }
}
