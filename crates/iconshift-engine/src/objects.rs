use anyhow::{anyhow, Context, Result};
use iconshift_security::{sha256_file_hex, sha256_hex, verify_sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

use crate::fs_utils::{remove_file_if_exists, write_atomic};
use crate::layout::StateLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Intact,
    Missing,
    Corrupt,
}

/// Content-addressed blobs under `objects/<2 hex>/<62 hex>`. Identical
/// content is stored once.
#[derive(Debug, Clone)]
pub struct BlobStore {
    objects_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl BlobStore {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            objects_dir: layout.objects_dir(),
            tmp_dir: layout.tmp_dir(),
        }
    }

    /// Stores `bytes` under their hash. An existing blob with that name is
    /// reused only if its content still matches; a damaged one is rewritten.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = sha256_hex(bytes);
        let path = self.object_path(&hash)?;
        if path.is_file() {
            if sha256_file_hex(&path)? == hash {
                return Ok(hash);
            }
            warn!(object = %hash, "rewriting corrupt backup object");
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        write_atomic(&path, bytes, &self.tmp_dir)?;
        Ok(hash)
    }

    /// Reads a blob and checks it still hashes to its name.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.object_path(hash)?;
        let bytes = fs::read(&path)
            .with_context(|| format!("failed to read backup object: {}", path.display()))?;
        if !verify_sha256(&bytes, hash) {
            return Err(anyhow!(
                "backup object {hash} is corrupt (content hashes to {})",
                sha256_hex(&bytes)
            ));
        }
        Ok(bytes)
    }

    pub fn check(&self, hash: &str) -> Result<ObjectState> {
        let path = self.object_path(hash)?;
        if !path.is_file() {
            return Ok(ObjectState::Missing);
        }
        if sha256_file_hex(&path)? == hash {
            Ok(ObjectState::Intact)
        } else {
            Ok(ObjectState::Corrupt)
        }
    }

    pub fn list(&self) -> Result<BTreeSet<String>> {
        let mut hashes = BTreeSet::new();
        if !self.objects_dir.exists() {
            return Ok(hashes);
        }

        for shard in fs::read_dir(&self.objects_dir).with_context(|| {
            format!(
                "failed to read objects directory: {}",
                self.objects_dir.display()
            )
        })? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for object in fs::read_dir(shard.path())? {
                let object = object?;
                let hash = format!("{prefix}{}", object.file_name().to_string_lossy());
                if is_valid_hash(&hash) {
                    hashes.insert(hash);
                }
            }
        }
        Ok(hashes)
    }

    pub fn remove(&self, hash: &str) -> Result<()> {
        let path = self.object_path(hash)?;
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove backup object: {}", path.display()))?;
        if let Some(shard) = path.parent() {
            let _ = fs::remove_dir(shard);
        }
        Ok(())
    }

    fn object_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_valid_hash(hash) {
            return Err(anyhow!("invalid backup object id: {hash}"));
        }
        Ok(self.objects_dir.join(&hash[..2]).join(&hash[2..]))
    }
}

fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64
        && hash
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}
