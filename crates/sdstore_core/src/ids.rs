//! Identifier helpers.
//!
//! Per §3, `noteId`, `folderId`, `sdId`, `profileId` are UUIDs and `instanceId`
//! is a per-install random id; all of them are treated as opaque non-empty
//! strings in filenames. The parser must not enforce fixed lengths, so these
//! are thin `String` newtypes rather than `uuid::Uuid` wrappers — callers
//! that want a freshly generated id should use [`new_id`].

use std::fmt;

/// Generate a new random identifier (UUID v4, lowercase hyphenated).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

macro_rules! opaque_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a fresh random id of this kind.
            pub fn generate() -> Self {
                Self(new_id())
            }

            /// Wrap an existing, possibly peer-supplied, id string.
            ///
            /// No length or format restriction is enforced: any non-empty
            /// opaque id string, including one supplied by a peer, is valid.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

opaque_id!(NoteId, "A note's stable identifier.");
opaque_id!(FolderId, "A folder's stable identifier.");
opaque_id!(SdId, "A storage directory's stable identifier.");
opaque_id!(ProfileId, "A user profile's identifier within one app install.");
opaque_id!(InstanceId, "A per-install random identifier.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_non_empty_and_unique() {
        let a = NoteId::generate();
        let b = NoteId::generate();
        assert!(!a.as_str().is_empty());
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_accepts_any_non_empty_string() {
        // The spec explicitly forbids enforcing fixed lengths on parsed ids.
        let id = InstanceId::from_raw("short");
        assert_eq!(id.as_str(), "short");
    }
}
