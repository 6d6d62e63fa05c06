use anyhow::{anyhow, Context, Result};
use iconshift_core::{IconError, IconRef, IconResult, ResourceKind, Target};
use iconshift_security::sha256_hex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::accessor::{AccessorTable, ResourceAddress, Snapshot};
use crate::folder::{CapturedFile, FileAttributes, FolderSnapshot, MarkerState};
use crate::fs_utils::write_atomic;
use crate::layout::StateLayout;
use crate::ledger::{current_unix_timestamp, Operation};
use crate::objects::{BlobStore, ObjectState};
use crate::registry::{RegistrySnapshot, RegistryValue};
use crate::shortcut::{ShortcutMetadata, ShortcutSnapshot};

const MANIFEST_VERSION: u32 = 1;

/// Durable record of the prior states of one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub created_at: u64,
    pub entries: Vec<BackupEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub operation_id: String,
    pub target: Target,
    pub resource_kind: ResourceKind,
    pub address: ResourceAddress,
    pub prior_value: PriorRecord,
    pub new_value: IconRef,
    #[serde(default)]
    pub restored_files: BTreeSet<PathBuf>,
}

/// A snapshot as persisted: file contents are replaced by object ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PriorRecord {
    Registry {
        value: Option<RegistryValue>,
        #[serde(default)]
        missing_keys: Vec<String>,
    },
    Folder {
        marker: Option<StoredMarker>,
        folder_attributes: FileAttributes,
        icon_file: Option<StoredFile>,
    },
    Shortcut {
        link_object: Option<String>,
        metadata: Option<ShortcutMetadata>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMarker {
    pub object: String,
    pub attributes: FileAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub path: PathBuf,
    pub object: String,
}

impl PriorRecord {
    pub fn object_ids(&self) -> Vec<&str> {
        match self {
            Self::Registry { .. } => Vec::new(),
            Self::Folder {
                marker, icon_file, ..
            } => marker
                .iter()
                .map(|marker| marker.object.as_str())
                .chain(icon_file.iter().map(|file| file.object.as_str()))
                .collect(),
            Self::Shortcut { link_object, .. } => link_object.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    #[serde(default)]
    backups: Vec<Backup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored: usize,
    pub restored_files: BTreeSet<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub backups_checked: usize,
    pub objects_checked: usize,
    /// `(backup id, object id)` pairs.
    pub missing_objects: Vec<(String, String)>,
    pub corrupt_objects: Vec<(String, String)>,
    pub unreferenced_objects: usize,
    pub stale_tmp_files: Vec<PathBuf>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.missing_objects.is_empty() && self.corrupt_objects.is_empty()
    }
}

/// Backups listed in `backups/manifest.json`, with blobs in the object store.
#[derive(Debug, Clone)]
pub struct BackupStore {
    layout: StateLayout,
    objects: BlobStore,
}

impl BackupStore {
    pub fn new(layout: StateLayout) -> Self {
        let objects = BlobStore::new(&layout);
        Self { layout, objects }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Persists one backup covering `operations`, in order. Blobs are
    /// written before the manifest, so a failure leaves the manifest untouched.
    pub fn create(&self, operations: &[Operation]) -> IconResult<Backup> {
        self.create_inner(operations).map_err(IconError::persist)
    }

    fn create_inner(&self, operations: &[Operation]) -> Result<Backup> {
        if operations.is_empty() {
            return Err(anyhow!("a backup needs at least one operation"));
        }
        self.layout.ensure_base_dirs()?;
        let mut manifest = self.read_manifest()?;

        let mut entries = Vec::with_capacity(operations.len());
        for operation in operations {
            entries.push(BackupEntry {
                operation_id: operation.id.clone(),
                target: operation.target.clone(),
                resource_kind: operation.resource_kind,
                address: operation.address.clone(),
                prior_value: self.record_snapshot(&operation.prior_value)?,
                new_value: operation.new_value.clone(),
                restored_files: operation
                    .prior_value
                    .restored_files(&operation.address)
                    .into_iter()
                    .collect(),
            });
        }

        let created_at = current_unix_timestamp();
        let backup = Backup {
            id: unique_backup_id(&manifest, created_at, operations),
            created_at,
            entries,
        };
        manifest.backups.push(backup.clone());
        self.write_manifest(&manifest)?;

        info!(
            backup_id = %backup.id,
            entries = backup.entries.len(),
            "created backup"
        );
        Ok(backup)
    }

    /// Most recent first.
    pub fn list(&self) -> IconResult<Vec<Backup>> {
        let manifest = self.read_manifest().map_err(|err| self.read_failure(err))?;
        Ok(manifest.backups.into_iter().rev().collect())
    }

    pub fn get(&self, backup_id: &str) -> IconResult<Backup> {
        let manifest = self.read_manifest().map_err(|err| self.read_failure(err))?;
        manifest
            .backups
            .into_iter()
            .find(|backup| backup.id == backup_id)
            .ok_or_else(|| IconError::BackupNotFound(backup_id.to_string()))
    }

    /// Restores entries newest first and stops at the first failure. The
    /// backup is kept either way, so the call can be repeated.
    pub fn restore(&self, backup_id: &str, accessors: &AccessorTable) -> IconResult<RestoreReport> {
        let backup = self.get(backup_id)?;
        let total = backup.entries.len();
        let mut report = RestoreReport {
            backup_id: backup.id.clone(),
            restored: 0,
            restored_files: BTreeSet::new(),
        };

        for entry in backup.entries.iter().rev() {
            let incomplete = |reason: String| IconError::RestoreIncomplete {
                backup_id: backup.id.clone(),
                restored: report.restored,
                total,
                target: entry.target.to_string(),
                reason,
            };
            let snapshot = self
                .load_snapshot(&entry.prior_value)
                .map_err(|err| incomplete(format!("{err:#}")))?;
            accessors
                .for_kind(entry.resource_kind)
                .restore(&entry.address, &snapshot)
                .map_err(|err| {
                    warn!(
                        backup_id = %backup.id,
                        resource = %entry.target,
                        error = %err,
                        "restore stopped"
                    );
                    incomplete(err.to_string())
                })?;

            debug!(backup_id = %backup.id, resource = %entry.target, "restored backup entry");
            report.restored += 1;
            report
                .restored_files
                .extend(entry.restored_files.iter().cloned());
        }

        info!(backup_id = %backup.id, restored = report.restored, "restored backup");
        Ok(report)
    }

    pub fn delete(&self, backup_id: &str) -> IconResult<()> {
        let mut manifest = self.read_manifest().map_err(|err| self.read_failure(err))?;
        let before = manifest.backups.len();
        manifest.backups.retain(|backup| backup.id != backup_id);
        if manifest.backups.len() == before {
            return Err(IconError::BackupNotFound(backup_id.to_string()));
        }

        self.write_manifest(&manifest).map_err(IconError::persist)?;
        self.prune_objects(&manifest).map_err(IconError::persist)?;
        info!(backup_id, "deleted backup");
        Ok(())
    }

    /// Keeps the `retain` most recent backups and returns the deleted ids.
    pub fn cleanup(&self, retain: usize) -> IconResult<Vec<String>> {
        let mut manifest = self.read_manifest().map_err(|err| self.read_failure(err))?;
        if manifest.backups.len() <= retain {
            return Ok(Vec::new());
        }

        let excess = manifest.backups.len() - retain;
        let removed = manifest
            .backups
            .drain(..excess)
            .map(|backup| backup.id)
            .collect::<Vec<_>>();
        self.write_manifest(&manifest).map_err(IconError::persist)?;
        self.prune_objects(&manifest).map_err(IconError::persist)?;
        info!(removed = removed.len(), retain, "cleaned up backups");
        Ok(removed)
    }

    pub fn verify_integrity(&self) -> IconResult<IntegrityReport> {
        self.verify_inner().map_err(|err| self.read_failure(err))
    }

    fn verify_inner(&self) -> Result<IntegrityReport> {
        let manifest = self.read_manifest()?;
        let mut report = IntegrityReport {
            backups_checked: manifest.backups.len(),
            ..IntegrityReport::default()
        };

        let mut referenced = BTreeSet::new();
        let mut verdicts = BTreeMap::new();
        for backup in &manifest.backups {
            for entry in &backup.entries {
                for object in entry.prior_value.object_ids() {
                    referenced.insert(object.to_string());
                    let state = match verdicts.get(object) {
                        Some(state) => *state,
                        None => {
                            let state = self.objects.check(object)?;
                            verdicts.insert(object.to_string(), state);
                            state
                        }
                    };
                    match state {
                        ObjectState::Intact => {}
                        ObjectState::Missing => report
                            .missing_objects
                            .push((backup.id.clone(), object.to_string())),
                        ObjectState::Corrupt => report
                            .corrupt_objects
                            .push((backup.id.clone(), object.to_string())),
                    }
                }
            }
        }
        report.objects_checked = verdicts.len();
        report.unreferenced_objects = self.objects.list()?.difference(&referenced).count();
        report.stale_tmp_files = self.stale_tmp_files()?;
        Ok(report)
    }

    /// Removes leftovers of interrupted writes from `tmp/`.
    pub fn clear_stale_tmp(&self) -> IconResult<usize> {
        let stale = self.stale_tmp_files().map_err(|err| self.read_failure(err))?;
        for path in &stale {
            fs::remove_file(path).map_err(|err| {
                IconError::io(format!("failed to remove {}", path.display()), err)
            })?;
        }
        Ok(stale.len())
    }

    fn stale_tmp_files(&self) -> Result<Vec<PathBuf>> {
        let tmp_dir = self.layout.tmp_dir();
        let entries = match fs::read_dir(&tmp_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", tmp_dir.display()));
            }
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    fn prune_objects(&self, manifest: &Manifest) -> Result<usize> {
        let referenced = manifest
            .backups
            .iter()
            .flat_map(|backup| backup.entries.iter())
            .flat_map(|entry| entry.prior_value.object_ids())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();

        let mut pruned = 0;
        for object in self.objects.list()?.difference(&referenced) {
            self.objects.remove(object)?;
            pruned += 1;
        }
        if pruned > 0 {
            debug!(pruned, "pruned unreferenced backup objects");
        }
        Ok(pruned)
    }

    fn record_snapshot(&self, snapshot: &Snapshot) -> Result<PriorRecord> {
        Ok(match snapshot {
            Snapshot::Registry(snapshot) => PriorRecord::Registry {
                value: snapshot.value.clone(),
                missing_keys: snapshot.missing_keys.clone(),
            },
            Snapshot::Folder(snapshot) => PriorRecord::Folder {
                marker: match &snapshot.marker {
                    Some(marker) => Some(StoredMarker {
                        object: self.objects.put(&marker.bytes)?,
                        attributes: marker.attributes,
                    }),
                    None => None,
                },
                folder_attributes: snapshot.folder_attributes,
                icon_file: match &snapshot.icon_file {
                    Some(file) => Some(StoredFile {
                        path: file.path.clone(),
                        object: self.objects.put(&file.bytes)?,
                    }),
                    None => None,
                },
            },
            Snapshot::Shortcut(snapshot) => PriorRecord::Shortcut {
                link_object: match &snapshot.link_bytes {
                    Some(bytes) => Some(self.objects.put(bytes)?),
                    None => None,
                },
                metadata: snapshot.metadata.clone(),
            },
        })
    }

    fn load_snapshot(&self, record: &PriorRecord) -> Result<Snapshot> {
        Ok(match record {
            PriorRecord::Registry {
                value,
                missing_keys,
            } => Snapshot::Registry(RegistrySnapshot {
                value: value.clone(),
                missing_keys: missing_keys.clone(),
            }),
            PriorRecord::Folder {
                marker,
                folder_attributes,
                icon_file,
            } => Snapshot::Folder(FolderSnapshot {
                marker: match marker {
                    Some(marker) => Some(MarkerState {
                        bytes: self.objects.get(&marker.object)?,
                        attributes: marker.attributes,
                    }),
                    None => None,
                },
                folder_attributes: *folder_attributes,
                icon_file: match icon_file {
                    Some(file) => Some(CapturedFile {
                        path: file.path.clone(),
                        bytes: self.objects.get(&file.object)?,
                    }),
                    None => None,
                },
            }),
            PriorRecord::Shortcut {
                link_object,
                metadata,
            } => Snapshot::Shortcut(ShortcutSnapshot {
                link_bytes: match link_object {
                    Some(object) => Some(self.objects.get(object)?),
                    None => None,
                },
                metadata: metadata.clone(),
            }),
        })
    }

    fn read_manifest(&self) -> Result<Manifest> {
        let path = self.layout.manifest_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Manifest {
                    version: MANIFEST_VERSION,
                    backups: Vec::new(),
                });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read backup manifest: {}", path.display()));
            }
        };

        let manifest: Manifest = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse backup manifest: {}", path.display()))?;
        if manifest.version != MANIFEST_VERSION {
            return Err(anyhow!(
                "unsupported backup manifest version {} in {}",
                manifest.version,
                path.display()
            ));
        }
        Ok(manifest)
    }

    fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.layout.manifest_path();
        let payload = serde_json::to_vec_pretty(manifest).context("failed to encode manifest")?;
        write_atomic(&path, &payload, &self.layout.tmp_dir())
            .with_context(|| format!("failed to write backup manifest: {}", path.display()))
    }

    fn read_failure(&self, err: anyhow::Error) -> IconError {
        IconError::Io {
            context: format!(
                "failed to read backup store at {}",
                self.layout.backups_dir().display()
            ),
            source: io::Error::other(format!("{err:#}")),
        }
    }
}

fn unique_backup_id(manifest: &Manifest, created_at: u64, operations: &[Operation]) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let seed = operations
        .iter()
        .map(|operation| operation.id.as_str())
        .collect::<Vec<_>>()
        .join(",");

    let mut attempt = 0_u32;
    loop {
        let digest = sha256_hex(
            format!("{nanos}:{}:{seed}:{attempt}", std::process::id()).as_bytes(),
        );
        let id = format!("bk-{created_at}-{}", &digest[..12]);
        if !manifest.backups.iter().any(|backup| backup.id == id) {
            return id;
        }
        attempt += 1;
    }
}
