use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use iconshift_core::{IconError, IconRef, IconResult, ResourceKind, Target};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::accessor::{
    io_failure, mismatched_address, mismatched_snapshot, ResourceAccessor, ResourceAddress,
    Snapshot,
};
use crate::command::run_command;
use crate::fs_utils::remove_file_if_exists;

pub const MARKER_FILE_NAME: &str = "desktop.ini";
const SHELL_CLASS_INFO: &str = "[.ShellClassInfo]";
const ICON_RESOURCE_KEY: &str = "IconResource";

const ATTRIBUTE_READONLY: u32 = 0x1;
const ATTRIBUTE_HIDDEN: u32 = 0x2;
const ATTRIBUTE_SYSTEM: u32 = 0x4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub hidden: bool,
    pub system: bool,
    pub readonly: bool,
}

impl FileAttributes {
    pub fn marker() -> Self {
        Self {
            hidden: true,
            system: true,
            readonly: false,
        }
    }

    fn from_raw(raw: u32) -> Self {
        Self {
            hidden: raw & ATTRIBUTE_HIDDEN != 0,
            system: raw & ATTRIBUTE_SYSTEM != 0,
            readonly: raw & ATTRIBUTE_READONLY != 0,
        }
    }
}

/// Reads and sets the hidden/system/read-only bits of a path.
pub trait AttributeControl {
    fn read(&self, path: &Path) -> IconResult<FileAttributes>;

    fn apply(&self, path: &Path, attributes: FileAttributes) -> IconResult<()>;
}

/// Reads attributes from file metadata and sets them with `attrib`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsAttributes;

impl AttributeControl for WindowsAttributes {
    fn read(&self, path: &Path) -> IconResult<FileAttributes> {
        let metadata = fs::metadata(path).map_err(|err| {
            io_failure(ResourceKind::FolderMarker, path, "read attributes", err)
        })?;
        Ok(FileAttributes::from_raw(raw_attributes(&metadata)))
    }

    fn apply(&self, path: &Path, attributes: FileAttributes) -> IconResult<()> {
        let flag = |set: bool, letter: char| format!("{}{letter}", if set { '+' } else { '-' });
        let mut command = Command::new("attrib");
        command
            .arg(flag(attributes.hidden, 'h'))
            .arg(flag(attributes.system, 's'))
            .arg(flag(attributes.readonly, 'r'))
            .arg(path);
        run_command(&mut command, "failed to set file attributes").map_err(|err| {
            IconError::access_denied(path.display(), ResourceKind::FolderMarker, format!("{err:#}"))
        })
    }
}

#[cfg(windows)]
fn raw_attributes(metadata: &fs::Metadata) -> u32 {
    use std::os::windows::fs::MetadataExt;
    metadata.file_attributes()
}

#[cfg(not(windows))]
fn raw_attributes(metadata: &fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        ATTRIBUTE_READONLY
    } else {
        0
    }
}

/// Attribute control for hosts where shell attributes do not exist.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAttributes;

impl AttributeControl for NoopAttributes {
    fn read(&self, _path: &Path) -> IconResult<FileAttributes> {
        Ok(FileAttributes::default())
    }

    fn apply(&self, _path: &Path, _attributes: FileAttributes) -> IconResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerState {
    pub bytes: Vec<u8>,
    pub attributes: FileAttributes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderSnapshot {
    pub marker: Option<MarkerState>,
    pub folder_attributes: FileAttributes,
    /// Icon source bytes, captured only when the folder had no marker.
    pub icon_file: Option<CapturedFile>,
}

/// Folder icons through a hidden `desktop.ini` marker.
pub struct FolderMarkerAccessor {
    attributes: Arc<dyn AttributeControl>,
}

impl FolderMarkerAccessor {
    pub fn new(attributes: Arc<dyn AttributeControl>) -> Self {
        Self { attributes }
    }

    fn paths<'a>(&self, address: &'a ResourceAddress) -> IconResult<(&'a Path, &'a Path)> {
        match address {
            ResourceAddress::FolderMarker { folder, marker } => {
                Ok((folder.as_path(), marker.as_path()))
            }
            other => Err(mismatched_address(ResourceKind::FolderMarker, other)),
        }
    }

    fn unlock_marker(&self, marker: &Path) -> IconResult<()> {
        if marker.exists() {
            self.attributes.apply(marker, FileAttributes::default())?;
        }
        Ok(())
    }
}

impl ResourceAccessor for FolderMarkerAccessor {
    fn kind(&self) -> ResourceKind {
        ResourceKind::FolderMarker
    }

    fn resolve(&self, target: &Target) -> IconResult<ResourceAddress> {
        match target {
            Target::Folder { path } => Ok(ResourceAddress::FolderMarker {
                folder: path.clone(),
                marker: path.join(MARKER_FILE_NAME),
            }),
            other => Err(IconError::invalid_target(other, "target is not a folder")),
        }
    }

    fn read(&self, address: &ResourceAddress) -> IconResult<Snapshot> {
        let (folder, marker) = self.paths(address)?;
        if !folder.is_dir() {
            return Ok(Snapshot::Folder(FolderSnapshot {
                marker: None,
                folder_attributes: FileAttributes::default(),
                icon_file: None,
            }));
        }

        let marker_state = if marker.is_file() {
            let bytes = fs::read(marker).map_err(|err| {
                io_failure(ResourceKind::FolderMarker, marker, "read folder marker", err)
            })?;
            Some(MarkerState {
                bytes,
                attributes: self.attributes.read(marker)?,
            })
        } else {
            None
        };

        Ok(Snapshot::Folder(FolderSnapshot {
            marker: marker_state,
            folder_attributes: self.attributes.read(folder)?,
            icon_file: None,
        }))
    }

    fn snapshot_for_write(
        &self,
        address: &ResourceAddress,
        icon: &IconRef,
    ) -> IconResult<Snapshot> {
        let Snapshot::Folder(mut snapshot) = self.read(address)? else {
            return Err(mismatched_address(ResourceKind::FolderMarker, address));
        };
        if snapshot.marker.is_none() {
            let bytes = fs::read(&icon.path).map_err(|err| {
                io_failure(ResourceKind::FolderMarker, &icon.path, "capture icon file", err)
            })?;
            snapshot.icon_file = Some(CapturedFile {
                path: icon.path.clone(),
                bytes,
            });
        }
        Ok(Snapshot::Folder(snapshot))
    }

    fn write(&self, address: &ResourceAddress, icon: &IconRef) -> IconResult<()> {
        let (folder, marker) = self.paths(address)?;
        if !folder.is_dir() {
            return Err(IconError::InvalidTarget {
                target: folder.display().to_string(),
                reason: "folder does not exist".to_string(),
            });
        }

        let existing = if marker.is_file() {
            Some(fs::read(marker).map_err(|err| {
                io_failure(ResourceKind::FolderMarker, marker, "read folder marker", err)
            })?)
        } else {
            None
        };
        let content = merge_marker(existing.as_deref(), &icon.location());

        self.unlock_marker(marker)?;
        fs::write(marker, content).map_err(|err| {
            io_failure(ResourceKind::FolderMarker, marker, "write folder marker", err)
        })?;
        self.attributes.apply(marker, FileAttributes::marker())?;

        let folder_attributes = self.attributes.read(folder)?;
        if !folder_attributes.system {
            self.attributes.apply(
                folder,
                FileAttributes {
                    system: true,
                    ..folder_attributes
                },
            )?;
        }
        debug!(folder = %folder.display(), location = %icon.location(), "wrote folder marker");
        Ok(())
    }

    fn restore(&self, address: &ResourceAddress, prior: &Snapshot) -> IconResult<()> {
        let (folder, marker) = self.paths(address)?;
        let Snapshot::Folder(prior) = prior else {
            return Err(mismatched_snapshot(ResourceKind::FolderMarker, prior));
        };

        match &prior.marker {
            Some(state) => {
                let current = fs::read(marker).ok();
                if current.as_deref() != Some(state.bytes.as_slice()) {
                    self.unlock_marker(marker)?;
                    fs::write(marker, &state.bytes).map_err(|err| {
                        io_failure(ResourceKind::FolderMarker, marker, "restore folder marker", err)
                    })?;
                }
                if self.attributes.read(marker)? != state.attributes {
                    self.attributes.apply(marker, state.attributes)?;
                }
            }
            None => {
                self.unlock_marker(marker)?;
                remove_file_if_exists(marker).map_err(|err| {
                    io_failure(ResourceKind::FolderMarker, marker, "remove folder marker", err)
                })?;
            }
        }

        if folder.is_dir() && self.attributes.read(folder)? != prior.folder_attributes {
            self.attributes.apply(folder, prior.folder_attributes)?;
        }

        if let Some(icon) = &prior.icon_file {
            if !icon.path.exists() {
                if let Some(parent) = icon.path.parent() {
                    fs::create_dir_all(parent).map_err(|err| {
                        io_failure(
                            ResourceKind::FolderMarker,
                            parent,
                            "recreate icon directory",
                            err,
                        )
                    })?;
                }
                fs::write(&icon.path, &icon.bytes).map_err(|err| {
                    io_failure(ResourceKind::FolderMarker, &icon.path, "recreate icon file", err)
                })?;
                debug!(icon = %icon.path.display(), "recreated captured icon file");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkerEncoding {
    Utf8,
    Utf8Bom,
    Utf16Le,
}

/// Points the marker's `IconResource` at `location`, keeping every other line.
pub(crate) fn merge_marker(existing: Option<&[u8]>, location: &str) -> Vec<u8> {
    let (text, encoding) = match existing {
        Some(bytes) => decode_marker(bytes),
        None => (String::new(), MarkerEncoding::Utf8),
    };
    encode_marker(&merge_marker_text(&text, location), encoding)
}

fn merge_marker_text(text: &str, location: &str) -> String {
    let newline = if text.is_empty() || text.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    };
    let entry = format!("{ICON_RESOURCE_KEY}={location}");

    let mut lines = text.lines().map(str::to_string).collect::<Vec<_>>();
    let mut in_section = false;
    let mut section_index = None;
    let mut replaced = false;
    for (index, line) in lines.iter_mut().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_section = trimmed.eq_ignore_ascii_case(SHELL_CLASS_INFO);
            if in_section && section_index.is_none() {
                section_index = Some(index);
            }
            continue;
        }
        if in_section && !replaced && is_icon_resource_line(trimmed) {
            *line = entry.clone();
            replaced = true;
        }
    }

    if !replaced {
        match section_index {
            Some(index) => lines.insert(index + 1, entry),
            None => {
                lines.insert(0, SHELL_CLASS_INFO.to_string());
                lines.insert(1, entry);
            }
        }
    }

    let mut merged = lines.join(newline);
    merged.push_str(newline);
    merged
}

fn is_icon_resource_line(line: &str) -> bool {
    line.split_once('=')
        .is_some_and(|(key, _)| key.trim().eq_ignore_ascii_case(ICON_RESOURCE_KEY))
}

fn decode_marker(bytes: &[u8]) -> (String, MarkerEncoding) {
    if let Some(body) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units = body
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        return (String::from_utf16_lossy(&units), MarkerEncoding::Utf16Le);
    }
    if let Some(body) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return (
            String::from_utf8_lossy(body).into_owned(),
            MarkerEncoding::Utf8Bom,
        );
    }
    (
        String::from_utf8_lossy(bytes).into_owned(),
        MarkerEncoding::Utf8,
    )
}

fn encode_marker(text: &str, encoding: MarkerEncoding) -> Vec<u8> {
    match encoding {
        MarkerEncoding::Utf8 => text.as_bytes().to_vec(),
        MarkerEncoding::Utf8Bom => {
            let mut bytes = vec![0xEF, 0xBB, 0xBF];
            bytes.extend_from_slice(text.as_bytes());
            bytes
        }
        MarkerEncoding::Utf16Le => {
            let mut bytes = vec![0xFF, 0xFE];
            for unit in text.encode_utf16() {
                bytes.extend_from_slice(&unit.to_le_bytes());
            }
            bytes
        }
    }
}
