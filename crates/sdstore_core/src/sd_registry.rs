//! Registry of storage directories known to this profile (§4.12).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::ids::SdId;

/// In-memory `sdId -> path` map, also mirrored into the profile's persisted
/// config so a restart remembers which SDs to reopen.
#[derive(Default)]
pub struct SdRegistry {
    entries: RwLock<HashMap<SdId, PathBuf>>,
}

impl SdRegistry {
    /// Build an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry pre-populated from persisted `(sdId, path)` pairs.
    pub fn from_entries(entries: impl IntoIterator<Item = (SdId, PathBuf)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    /// Register (or re-point) an SD.
    pub fn register(&self, sd_id: SdId, path: PathBuf) {
        self.entries.write().unwrap().insert(sd_id, path);
    }

    /// Drop an SD from the registry. Does not touch anything on disk.
    pub fn unregister(&self, sd_id: &SdId) -> Option<PathBuf> {
        self.entries.write().unwrap().remove(sd_id)
    }

    /// Resolve an SD id to its filesystem path.
    pub fn path_of(&self, sd_id: &SdId) -> Option<PathBuf> {
        self.entries.read().unwrap().get(sd_id).cloned()
    }

    /// Every registered SD, as `(id, path)` pairs, for cross-SD fallback
    /// lookups such as [`crate::image_store::ImageStore::get`].
    pub fn all(&self) -> Vec<(SdId, PathBuf)> {
        self.entries.read().unwrap().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    /// Every registered SD except the one given, preserving registration
    /// order is not guaranteed (backed by a hash map).
    pub fn all_except(&self, exclude: &SdId) -> Vec<(SdId, PathBuf)> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id != exclude)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Whether any registered SD resolves to this filesystem path.
    pub fn contains_path(&self, path: &Path) -> bool {
        self.entries.read().unwrap().values().any(|p| p == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve() {
        let registry = SdRegistry::new();
        let id = SdId::from_raw("sd-1");
        registry.register(id.clone(), PathBuf::from("/a/b"));
        assert_eq!(registry.path_of(&id), Some(PathBuf::from("/a/b")));
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = SdRegistry::new();
        let id = SdId::from_raw("sd-1");
        registry.register(id.clone(), PathBuf::from("/a/b"));
        registry.unregister(&id);
        assert_eq!(registry.path_of(&id), None);
    }

    #[test]
    fn all_except_excludes_the_given_id() {
        let registry = SdRegistry::new();
        let a = SdId::from_raw("a");
        let b = SdId::from_raw("b");
        registry.register(a.clone(), PathBuf::from("/a"));
        registry.register(b.clone(), PathBuf::from("/b"));
        let rest = registry.all_except(&a);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].0, b);
    }
}
