use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IconError;

pub const SUPPORTED_ICON_EXTENSIONS: &[&str] = &[
    "ico", "cur", "bmp", "png", "jpg", "jpeg", "gif", "exe", "dll", "icl",
];

pub const MAX_ICON_BYTES: u64 = 50 * 1024 * 1024;

/// An icon source plus the resource index inside it (0 for single-icon files).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IconRef {
    pub path: PathBuf,
    #[serde(default)]
    pub index: i32,
}

impl IconRef {
    pub fn new(path: impl Into<PathBuf>, index: i32) -> Self {
        Self {
            path: path.into(),
            index,
        }
    }

    /// The `"<icon_path>,<index>"` form used by registry values, folder
    /// markers and shortcut icon locations.
    pub fn location(&self) -> String {
        format!("{},{}", self.path.display(), self.index)
    }

    pub fn parse_location(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_matches('"');
        if trimmed.is_empty() {
            return None;
        }

        match trimmed.rsplit_once(',') {
            Some((path, index)) => match index.trim().parse::<i32>() {
                Ok(index) if !path.trim().is_empty() => Some(Self::new(path.trim(), index)),
                _ => Some(Self::new(trimmed, 0)),
            },
            None => Some(Self::new(trimmed, 0)),
        }
    }
}

/// Decides whether a file is a usable icon source.
pub trait IconValidator {
    fn validate(&self, icon: &IconRef) -> Result<(), IconError>;
}

/// Accepts existing files with a supported extension, a sane size and,
/// for `.ico`/`.cur`, a matching header.
#[derive(Debug, Clone)]
pub struct FormatIconValidator {
    max_bytes: u64,
}

impl Default for FormatIconValidator {
    fn default() -> Self {
        Self {
            max_bytes: MAX_ICON_BYTES,
        }
    }
}

impl FormatIconValidator {
    pub fn with_max_bytes(max_bytes: u64) -> Self {
        Self { max_bytes }
    }
}

impl IconValidator for FormatIconValidator {
    fn validate(&self, icon: &IconRef) -> Result<(), IconError> {
        let path = icon.path.as_path();
        let metadata = fs::metadata(path)
            .map_err(|_| IconError::invalid_icon(path, "icon file does not exist"))?;
        if !metadata.is_file() {
            return Err(IconError::invalid_icon(path, "icon path is not a file"));
        }

        let Some(extension) = icon_extension(path) else {
            return Err(IconError::invalid_icon(path, "icon file has no extension"));
        };
        if !SUPPORTED_ICON_EXTENSIONS.contains(&extension.as_str()) {
            return Err(IconError::invalid_icon(
                path,
                format!("unsupported format: .{extension}"),
            ));
        }

        if metadata.len() == 0 {
            return Err(IconError::invalid_icon(path, "icon file is empty"));
        }
        if metadata.len() > self.max_bytes {
            return Err(IconError::invalid_icon(
                path,
                format!(
                    "icon too large: {} bytes (limit {})",
                    metadata.len(),
                    self.max_bytes
                ),
            ));
        }
        if icon.index < 0 && !matches!(extension.as_str(), "exe" | "dll" | "icl") {
            return Err(IconError::invalid_icon(
                path,
                "negative resource ids are only valid for .exe, .dll and .icl sources",
            ));
        }

        let expected_type = match extension.as_str() {
            "ico" => Some(1_u8),
            "cur" => Some(2_u8),
            _ => None,
        };
        if let Some(expected_type) = expected_type {
            let header = read_header(path)?;
            if header != [0, 0, expected_type, 0] {
                return Err(IconError::invalid_icon(
                    path,
                    format!(".{extension} header does not match the file format"),
                ));
            }
        }

        Ok(())
    }
}

fn icon_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase)
}

fn read_header(path: &Path) -> Result<[u8; 4], IconError> {
    let mut file = fs::File::open(path)
        .map_err(|err| IconError::io(format!("failed to open icon {}", path.display()), err))?;
    let mut header = [0_u8; 4];
    file.read_exact(&mut header)
        .map_err(|_| IconError::invalid_icon(path, "icon file is truncated"))?;
    Ok(header)
}
