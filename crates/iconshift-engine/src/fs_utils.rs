use anyhow::{Context, Result};
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Writes `bytes` to a temp file inside `tmp_dir`, syncs it and renames it
/// over `dest`. Readers observe either the old or the new content.
pub fn write_atomic(dest: &Path, bytes: &[u8], tmp_dir: &Path) -> Result<()> {
    fs::create_dir_all(tmp_dir)
        .with_context(|| format!("failed to create {}", tmp_dir.display()))?;
    let file_name = dest
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state");
    let tmp_path = tmp_dir.join(format!(
        ".{file_name}.{}.{}.tmp",
        std::process::id(),
        unique_suffix()
    ));

    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("failed to write temp file: {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to sync temp file: {}", tmp_path.display()))?;
        fs::rename(&tmp_path, dest).with_context(|| {
            format!(
                "failed to move {} into place at {}",
                tmp_path.display(),
                dest.display()
            )
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn unique_suffix() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default()
}
