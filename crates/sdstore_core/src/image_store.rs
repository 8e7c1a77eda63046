//! Content-addressed media storage (§4.11).
//!
//! Images live at `media/<imageId>.<ext>` inside an SD, named by the sha256
//! of their bytes. Puts are therefore idempotent (re-putting identical bytes
//! is a no-op beyond the hash check) and gets fall back to probing every
//! other registered SD before failing, since a note can reference an image
//! that physically lives in a different SD than the note itself.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::error::{Result, SdError};
use crate::fs::FileSystemAdapter;
use crate::ids::SdId;

/// How long an unreferenced image is kept before the orphan sweep deletes
/// it, giving in-flight writes (a note referencing the image but not yet
/// flushed) time to catch up.
pub const ORPHAN_GRACE_PERIOD_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Content-addressed id for a stored image: the lowercase hex sha256 of its
/// bytes.
pub type ImageId = String;

/// Compute the content-addressed id for a blob of image bytes.
pub fn hash_image(bytes: &[u8]) -> ImageId {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn is_valid_image_id(id: &str) -> bool {
    let hex_id = id.len() >= 32 && id.len() <= 64 && id.chars().all(|c| c.is_ascii_hexdigit());
    let uuid_id = uuid::Uuid::parse_str(id).is_ok();
    hex_id || uuid_id
}

/// Locates one SD's `media/` directory and knows how to reach every other
/// registered SD for cross-SD fallback lookups.
pub struct ImageStore {
    fs: Arc<dyn FileSystemAdapter>,
}

impl ImageStore {
    /// Build an image store over a shared filesystem adapter. SD roots are
    /// passed per-call so one `ImageStore` serves every SD in the process.
    pub fn new(fs: Arc<dyn FileSystemAdapter>) -> Self {
        Self { fs }
    }

    fn media_dir(sd_path: &std::path::Path) -> PathBuf {
        sd_path.join("media")
    }

    /// Store `bytes` under `sd_path`'s `media/` directory, returning the
    /// content-addressed id. Idempotent: re-putting identical bytes writes
    /// the same path again (a cheap no-op on a real filesystem) rather than
    /// erroring.
    pub async fn put(&self, sd_path: &std::path::Path, bytes: &[u8], ext: &str) -> Result<ImageId> {
        let id = hash_image(bytes);
        let path = Self::media_dir(sd_path).join(format!("{id}.{ext}"));
        self.fs.write_file(&path, bytes).await?;
        Ok(id)
    }

    /// Locate an image by id, first in `sd_path`'s own `media/` directory
    /// (trying every extension present), then by probing
    /// `other_sds` in order.
    pub async fn get(&self, sd_path: &std::path::Path, image_id: &str, other_sds: &[(SdId, PathBuf)]) -> Result<Vec<u8>> {
        if !is_valid_image_id(image_id) {
            return Err(SdError::NotFound(format!("invalid image id '{image_id}'")));
        }
        if let Some(bytes) = self.find_locally(sd_path, image_id).await? {
            return Ok(bytes);
        }
        for (_sd_id, other_path) in other_sds {
            if let Some(bytes) = self.find_locally(other_path, image_id).await? {
                return Ok(bytes);
            }
        }
        Err(SdError::NotFound(format!("image '{image_id}' not found in any registered SD")))
    }

    async fn find_locally(&self, sd_path: &std::path::Path, image_id: &str) -> Result<Option<Vec<u8>>> {
        let dir = Self::media_dir(sd_path);
        let names = self.fs.list_dir(&dir).await?;
        for name in names {
            if name.strip_prefix(image_id).map(|rest| rest.starts_with('.')).unwrap_or(false) {
                let bytes = self.fs.read_file(&dir.join(&name)).await?;
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    /// Sweep `sd_path`'s `media/` directory, deleting any file older than
    /// [`ORPHAN_GRACE_PERIOD_MS`] whose id is not present in
    /// `referenced_ids`. Never deletes a referenced image regardless of age.
    pub async fn sweep_orphans(
        &self,
        sd_path: &std::path::Path,
        referenced_ids: &std::collections::HashSet<String>,
        now_ms: i64,
    ) -> Result<Vec<String>> {
        let dir = Self::media_dir(sd_path);
        let names = self.fs.list_dir(&dir).await?;
        let mut deleted = Vec::new();
        for name in names {
            let id = name.split('.').next().unwrap_or(&name).to_string();
            if referenced_ids.contains(&id) {
                continue;
            }
            let path = dir.join(&name);
            let mtime = self.fs.stat_mtime_ms(&path).await.unwrap_or(now_ms);
            if now_ms.saturating_sub(mtime) >= ORPHAN_GRACE_PERIOD_MS {
                self.fs.delete_file(&path).await?;
                deleted.push(id);
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFsAdapter;

    #[test]
    fn hash_is_stable_and_deterministic() {
        let a = hash_image(b"hello");
        let b = hash_image(b"hello");
        let c = hash_image(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let store = ImageStore::new(fs.clone());
        let sd = PathBuf::from("/sd");
        let id = store.put(&sd, b"pngbytes", "png").await.unwrap();
        let bytes = store.get(&sd, &id, &[]).await.unwrap();
        assert_eq!(bytes, b"pngbytes");
    }

    #[tokio::test]
    async fn get_falls_back_to_other_sds() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let store = ImageStore::new(fs.clone());
        let sd_a = PathBuf::from("/sdA");
        let sd_b = PathBuf::from("/sdB");
        let id = store.put(&sd_b, b"elsewhere", "jpg").await.unwrap();

        let other_sds = vec![(SdId::from_raw("b"), sd_b.clone())];
        let bytes = store.get(&sd_a, &id, &other_sds).await.unwrap();
        assert_eq!(bytes, b"elsewhere");
    }

    #[tokio::test]
    async fn orphan_sweep_never_deletes_referenced_images() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let store = ImageStore::new(fs.clone());
        let sd = PathBuf::from("/sd");
        let id = store.put(&sd, b"keep-me", "png").await.unwrap();

        let mut referenced = std::collections::HashSet::new();
        referenced.insert(id.clone());

        let deleted = store.sweep_orphans(&sd, &referenced, i64::MAX).await.unwrap();
        assert!(deleted.is_empty());
        assert_eq!(store.get(&sd, &id, &[]).await.unwrap(), b"keep-me");
    }

    #[tokio::test]
    async fn orphan_sweep_deletes_unreferenced_old_images() {
        let fs = Arc::new(MemoryFsAdapter::new());
        let store = ImageStore::new(fs.clone());
        let sd = PathBuf::from("/sd");
        let id = store.put(&sd, b"orphan", "png").await.unwrap();

        let referenced = std::collections::HashSet::new();
        let deleted = store.sweep_orphans(&sd, &referenced, i64::MAX).await.unwrap();
        assert_eq!(deleted, vec![id.clone()]);
        assert!(store.get(&sd, &id, &[]).await.is_err());
    }

    #[test]
    fn invalid_image_ids_are_rejected_to_prevent_path_traversal() {
        assert!(!is_valid_image_id("../../etc/passwd"));
        assert!(!is_valid_image_id(""));
        assert!(is_valid_image_id(&"a".repeat(64)));
    }
}
