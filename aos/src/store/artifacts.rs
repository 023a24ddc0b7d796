//! Content-addressed artifact store.
//!
//! Artifacts live under `artifacts/<first-2-hex>/<sha256>`; references are
//! immutable and hash-verifiable. Writes go through a temp file plus rename
//! so a crash never leaves a partially written object under its final name.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{KernelError, KernelResult};
use crate::types::{ArtifactKind, ArtifactRef, StrategyId};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    base_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(base_dir: impl AsRef<Path>) -> KernelResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn object_path(&self, sha256: &str) -> PathBuf {
        let shard = &sha256[..2.min(sha256.len())];
        self.base_dir.join(shard).join(sha256)
    }

    /// Store `bytes` and return an immutable reference. Storing identical
    /// content twice is a no-op that returns the same address.
    pub fn put(
        &self,
        bytes: &[u8],
        kind: ArtifactKind,
        produced_by: &StrategyId,
    ) -> KernelResult<ArtifactRef> {
        let sha256 = hex_sha256(bytes);
        let path = self.object_path(&sha256);

        if !path.exists() {
            let parent = path
                .parent()
                .ok_or_else(|| KernelError::Store("artifact path has no parent".into()))?;
            fs::create_dir_all(parent)?;
            let tmp = parent.join(format!(".{}.tmp", sha256));
            {
                let mut f = fs::File::create(&tmp)?;
                f.write_all(bytes)?;
                f.sync_data()?;
            }
            fs::rename(&tmp, &path)?;
        }

        Ok(ArtifactRef {
            uri: path.to_string_lossy().to_string(),
            kind,
            sha256,
            size_bytes: bytes.len() as u64,
            produced_by: produced_by.clone(),
        })
    }

    pub fn read(&self, artifact: &ArtifactRef) -> KernelResult<Vec<u8>> {
        let path = self.object_path(&artifact.sha256);
        if !path.exists() {
            return Err(KernelError::Store(format!(
                "artifact {} not found",
                artifact.sha256
            )));
        }
        Ok(fs::read(path)?)
    }

    /// Re-hash the stored content and compare against the reference.
    pub fn verify(&self, artifact: &ArtifactRef) -> KernelResult<bool> {
        let path = self.object_path(&artifact.sha256);
        if !path.exists() {
            return Ok(false);
        }
        let bytes = fs::read(path)?;
        Ok(hex_sha256(&bytes) == artifact.sha256 && bytes.len() as u64 == artifact.size_bytes)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

pub fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_read_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let artifact = store
            .put(b"# quarterly outline\n", ArtifactKind::Md, &"deck.outline".to_string())
            .unwrap();

        assert_eq!(artifact.size_bytes, 20);
        assert!(artifact.uri.contains(&artifact.sha256[..2]));
        assert_eq!(store.read(&artifact).unwrap(), b"# quarterly outline\n");
        assert!(store.verify(&artifact).unwrap());
    }

    #[test]
    fn identical_content_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let a = store
            .put(b"{}", ArtifactKind::Json, &"s1".to_string())
            .unwrap();
        let b = store
            .put(b"{}", ArtifactKind::Json, &"s2".to_string())
            .unwrap();
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.uri, b.uri);
    }

    #[test]
    fn corrupted_object_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let artifact = store
            .put(b"payload", ArtifactKind::Binary, &"s".to_string())
            .unwrap();
        std::fs::write(&artifact.uri, b"other").unwrap();
        assert!(!store.verify(&artifact).unwrap());
    }
}
