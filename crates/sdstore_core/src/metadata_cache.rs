//! Local SQL mirror of titles, folder membership, tags, and presence (§4.13).
//!
//! `MetadataCache` is derived state: it can be rebuilt from the CRDTs at any
//! time and is written only after a CRDT persist has already succeeded,
//! never ahead of it. One `rusqlite`-backed database file per profile.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;
use crate::ids::{FolderId, NoteId, ProfileId, SdId};

/// One row of the `notes` mirror table.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteMetadata {
    pub note_id: NoteId,
    pub sd_id: SdId,
    pub title: String,
    pub folder_id: Option<FolderId>,
    pub content_text: String,
    pub modified_ms: i64,
    pub deleted: bool,
    pub pinned: bool,
}

/// One row of the `folders` mirror table.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderMetadata {
    pub folder_id: FolderId,
    pub sd_id: SdId,
    pub parent_id: Option<FolderId>,
    pub name: String,
    pub order: i64,
    pub deleted: bool,
}

/// Cached presence fields for one profile within one SD, mirroring
/// `profiles/<profileId>.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfilePresence {
    pub profile_id: ProfileId,
    pub sd_id: SdId,
    pub profile_name: String,
    pub user: String,
    pub username: String,
    pub hostname: String,
    pub platform: String,
    pub app_version: String,
    pub last_updated_ms: i64,
}

/// One profile's local metadata mirror, backed by a SQLite database file.
///
/// All operations run on `tokio::task::spawn_blocking` so the coordinator's
/// cooperative event loop never blocks on a SQLite call.
pub struct MetadataCache {
    conn: Mutex<Connection>,
}

impl MetadataCache {
    /// Open (creating if absent) the profile's metadata database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let cache = Self { conn: Mutex::new(conn) };
        cache.init_schema()?;
        Ok(cache)
    }

    /// Open an in-memory database, for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let cache = Self { conn: Mutex::new(conn) };
        cache.init_schema()?;
        Ok(cache)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notes (
                id TEXT PRIMARY KEY,
                sd_id TEXT NOT NULL,
                title TEXT NOT NULL,
                folder_id TEXT,
                content_text TEXT NOT NULL,
                modified_ms INTEGER NOT NULL,
                deleted_flag INTEGER NOT NULL DEFAULT 0,
                pinned INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_notes_sd_deleted ON notes(sd_id, deleted_flag);

            CREATE VIRTUAL TABLE IF NOT EXISTS notes_fts USING fts5(
                id UNINDEXED, content_text, content='', tokenize='porter unicode61'
            );

            CREATE TABLE IF NOT EXISTS folders (
                id TEXT PRIMARY KEY,
                sd_id TEXT NOT NULL,
                parent_id TEXT,
                name TEXT NOT NULL,
                sort_order INTEGER NOT NULL DEFAULT 0,
                deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_folders_sd ON folders(sd_id);

            CREATE TABLE IF NOT EXISTS tags (
                note_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                PRIMARY KEY (note_id, tag)
            );

            CREATE TABLE IF NOT EXISTS profile_presence (
                profile_id TEXT NOT NULL,
                sd_id TEXT NOT NULL,
                profile_name TEXT NOT NULL,
                user TEXT NOT NULL,
                username TEXT NOT NULL,
                hostname TEXT NOT NULL,
                platform TEXT NOT NULL,
                app_version TEXT NOT NULL,
                last_updated_ms INTEGER NOT NULL,
                PRIMARY KEY (profile_id, sd_id)
            );
            "#,
        )?;
        Ok(())
    }

    /// Insert or replace a note's cached metadata, following a successful
    /// CRDT persist.
    pub fn upsert_note(&self, meta: &NoteMetadata) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO notes (id, sd_id, title, folder_id, content_text, modified_ms, deleted_flag, pinned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                sd_id=excluded.sd_id, title=excluded.title, folder_id=excluded.folder_id,
                content_text=excluded.content_text, modified_ms=excluded.modified_ms,
                deleted_flag=excluded.deleted_flag, pinned=excluded.pinned",
            params![
                meta.note_id.as_str(),
                meta.sd_id.as_str(),
                meta.title,
                meta.folder_id.as_ref().map(|f| f.as_str()),
                meta.content_text,
                meta.modified_ms,
                meta.deleted as i64,
                meta.pinned as i64,
            ],
        )?;
        conn.execute("DELETE FROM notes_fts WHERE id = ?1", params![meta.note_id.as_str()])?;
        conn.execute(
            "INSERT INTO notes_fts (id, content_text) VALUES (?1, ?2)",
            params![meta.note_id.as_str(), meta.content_text],
        )?;
        Ok(())
    }

    /// Remove a note from the cache entirely (used after a permanent delete's
    /// physical cleanup).
    pub fn remove_note(&self, note_id: &NoteId) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM notes WHERE id = ?1", params![note_id.as_str()])?;
        conn.execute("DELETE FROM notes_fts WHERE id = ?1", params![note_id.as_str()])?;
        conn.execute("DELETE FROM tags WHERE note_id = ?1", params![note_id.as_str()])?;
        Ok(())
    }

    /// Fetch one note's cached metadata.
    pub fn get_note(&self, note_id: &NoteId) -> Result<Option<NoteMetadata>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, sd_id, title, folder_id, content_text, modified_ms, deleted_flag, pinned
                 FROM notes WHERE id = ?1",
                params![note_id.as_str()],
                row_to_note_metadata,
            )
            .optional()?;
        Ok(row)
    }

    /// List notes in an SD, optionally filtered to one folder, excluding
    /// soft/hard-deleted notes.
    pub fn list_notes(&self, sd_id: &SdId, folder_id: Option<&FolderId>) -> Result<Vec<NoteMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match folder_id {
            Some(_) => conn.prepare(
                "SELECT id, sd_id, title, folder_id, content_text, modified_ms, deleted_flag, pinned
                 FROM notes WHERE sd_id = ?1 AND folder_id = ?2 AND deleted_flag = 0
                 ORDER BY modified_ms DESC",
            )?,
            None => conn.prepare(
                "SELECT id, sd_id, title, folder_id, content_text, modified_ms, deleted_flag, pinned
                 FROM notes WHERE sd_id = ?1 AND deleted_flag = 0
                 ORDER BY modified_ms DESC",
            )?,
        };
        let rows = match folder_id {
            Some(fid) => stmt.query_map(params![sd_id.as_str(), fid.as_str()], row_to_note_metadata)?,
            None => stmt.query_map(params![sd_id.as_str()], row_to_note_metadata)?,
        };
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Full-text search over cached note content within one SD.
    pub fn search(&self, sd_id: &SdId, query: &str) -> Result<Vec<NoteMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT n.id, n.sd_id, n.title, n.folder_id, n.content_text, n.modified_ms, n.deleted_flag, n.pinned
             FROM notes n JOIN notes_fts f ON n.id = f.id
             WHERE n.sd_id = ?1 AND n.deleted_flag = 0 AND f.content_text MATCH ?2
             ORDER BY rank",
        )?;
        let rows = stmt.query_map(params![sd_id.as_str(), query], row_to_note_metadata)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Insert or replace a folder's cached metadata.
    pub fn upsert_folder(&self, meta: &FolderMetadata) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO folders (id, sd_id, parent_id, name, sort_order, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                sd_id=excluded.sd_id, parent_id=excluded.parent_id, name=excluded.name,
                sort_order=excluded.sort_order, deleted=excluded.deleted",
            params![
                meta.folder_id.as_str(),
                meta.sd_id.as_str(),
                meta.parent_id.as_ref().map(|f| f.as_str()),
                meta.name,
                meta.order,
                meta.deleted as i64,
            ],
        )?;
        Ok(())
    }

    /// List every cached folder for one SD, including deleted ones (callers
    /// apply visibility rules the way [`crate::crdt::FolderTreeDoc`] does).
    pub fn list_folders(&self, sd_id: &SdId) -> Result<Vec<FolderMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, sd_id, parent_id, name, sort_order, deleted FROM folders WHERE sd_id = ?1",
        )?;
        let rows = stmt.query_map(params![sd_id.as_str()], |row| {
            Ok(FolderMetadata {
                folder_id: FolderId::from_raw(row.get::<_, String>(0)?),
                sd_id: SdId::from_raw(row.get::<_, String>(1)?),
                parent_id: row.get::<_, Option<String>>(2)?.map(FolderId::from_raw),
                name: row.get(3)?,
                order: row.get(4)?,
                deleted: row.get::<_, i64>(5)? != 0,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Replace the tag set for a note.
    pub fn set_tags(&self, note_id: &NoteId, tags: &[String]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tags WHERE note_id = ?1", params![note_id.as_str()])?;
        for tag in tags {
            conn.execute("INSERT OR IGNORE INTO tags (note_id, tag) VALUES (?1, ?2)", params![note_id.as_str(), tag])?;
        }
        Ok(())
    }

    /// Tags recorded for a note.
    pub fn get_tags(&self, note_id: &NoteId) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT tag FROM tags WHERE note_id = ?1 ORDER BY tag")?;
        let rows = stmt.query_map(params![note_id.as_str()], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Cache one profile's presence fields for an SD.
    pub fn upsert_presence(&self, presence: &ProfilePresence) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO profile_presence
                (profile_id, sd_id, profile_name, user, username, hostname, platform, app_version, last_updated_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(profile_id, sd_id) DO UPDATE SET
                profile_name=excluded.profile_name, user=excluded.user, username=excluded.username,
                hostname=excluded.hostname, platform=excluded.platform, app_version=excluded.app_version,
                last_updated_ms=excluded.last_updated_ms",
            params![
                presence.profile_id.as_str(),
                presence.sd_id.as_str(),
                presence.profile_name,
                presence.user,
                presence.username,
                presence.hostname,
                presence.platform,
                presence.app_version,
                presence.last_updated_ms,
            ],
        )?;
        Ok(())
    }

    /// Every cached peer presence recorded for an SD.
    pub fn list_presence(&self, sd_id: &SdId) -> Result<Vec<ProfilePresence>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT profile_id, sd_id, profile_name, user, username, hostname, platform, app_version, last_updated_ms
             FROM profile_presence WHERE sd_id = ?1",
        )?;
        let rows = stmt.query_map(params![sd_id.as_str()], |row| {
            Ok(ProfilePresence {
                profile_id: ProfileId::from_raw(row.get::<_, String>(0)?),
                sd_id: SdId::from_raw(row.get::<_, String>(1)?),
                profile_name: row.get(2)?,
                user: row.get(3)?,
                username: row.get(4)?,
                hostname: row.get(5)?,
                platform: row.get(6)?,
                app_version: row.get(7)?,
                last_updated_ms: row.get(8)?,
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn row_to_note_metadata(row: &rusqlite::Row) -> rusqlite::Result<NoteMetadata> {
    Ok(NoteMetadata {
        note_id: NoteId::from_raw(row.get::<_, String>(0)?),
        sd_id: SdId::from_raw(row.get::<_, String>(1)?),
        title: row.get(2)?,
        folder_id: row.get::<_, Option<String>>(3)?.map(FolderId::from_raw),
        content_text: row.get(4)?,
        modified_ms: row.get(5)?,
        deleted: row.get::<_, i64>(6)? != 0,
        pinned: row.get::<_, i64>(7)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(note_id: &str, sd: &str, title: &str, folder: Option<&str>) -> NoteMetadata {
        NoteMetadata {
            note_id: NoteId::from_raw(note_id),
            sd_id: SdId::from_raw(sd),
            title: title.to_string(),
            folder_id: folder.map(FolderId::from_raw),
            content_text: title.to_string(),
            modified_ms: 1000,
            deleted: false,
            pinned: false,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let cache = MetadataCache::in_memory().unwrap();
        let meta = sample("n1", "sd1", "Hello world", Some("f1"));
        cache.upsert_note(&meta).unwrap();
        let fetched = cache.get_note(&NoteId::from_raw("n1")).unwrap().unwrap();
        assert_eq!(fetched.title, "Hello world");
        assert_eq!(fetched.folder_id, Some(FolderId::from_raw("f1")));
    }

    #[test]
    fn list_notes_filters_by_sd_and_folder() {
        let cache = MetadataCache::in_memory().unwrap();
        cache.upsert_note(&sample("n1", "sd1", "A", Some("f1"))).unwrap();
        cache.upsert_note(&sample("n2", "sd1", "B", Some("f2"))).unwrap();
        cache.upsert_note(&sample("n3", "sd2", "C", Some("f1"))).unwrap();

        let in_f1 = cache.list_notes(&SdId::from_raw("sd1"), Some(&FolderId::from_raw("f1"))).unwrap();
        assert_eq!(in_f1.len(), 1);
        assert_eq!(in_f1[0].note_id, NoteId::from_raw("n1"));

        let all_sd1 = cache.list_notes(&SdId::from_raw("sd1"), None).unwrap();
        assert_eq!(all_sd1.len(), 2);
    }

    #[test]
    fn deleted_notes_are_excluded_from_listing() {
        let cache = MetadataCache::in_memory().unwrap();
        let mut meta = sample("n1", "sd1", "Gone", None);
        meta.deleted = true;
        cache.upsert_note(&meta).unwrap();
        assert!(cache.list_notes(&SdId::from_raw("sd1"), None).unwrap().is_empty());
    }

    #[test]
    fn full_text_search_finds_matching_content() {
        let cache = MetadataCache::in_memory().unwrap();
        cache.upsert_note(&sample("n1", "sd1", "Grocery list", None)).unwrap();
        cache.upsert_note(&sample("n2", "sd1", "Meeting notes", None)).unwrap();

        let results = cache.search(&SdId::from_raw("sd1"), "grocery").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].note_id, NoteId::from_raw("n1"));
    }

    #[test]
    fn remove_note_clears_metadata_and_tags() {
        let cache = MetadataCache::in_memory().unwrap();
        let note = NoteId::from_raw("n1");
        cache.upsert_note(&sample("n1", "sd1", "bye", None)).unwrap();
        cache.set_tags(&note, &["a".to_string(), "b".to_string()]).unwrap();

        cache.remove_note(&note).unwrap();
        assert!(cache.get_note(&note).unwrap().is_none());
        assert!(cache.get_tags(&note).unwrap().is_empty());
    }

    #[test]
    fn tags_round_trip_and_replace() {
        let cache = MetadataCache::in_memory().unwrap();
        let note = NoteId::from_raw("n1");
        cache.set_tags(&note, &["work".to_string(), "urgent".to_string()]).unwrap();
        assert_eq!(cache.get_tags(&note).unwrap(), vec!["urgent".to_string(), "work".to_string()]);

        cache.set_tags(&note, &["personal".to_string()]).unwrap();
        assert_eq!(cache.get_tags(&note).unwrap(), vec!["personal".to_string()]);
    }

    #[test]
    fn presence_round_trips_per_sd() {
        let cache = MetadataCache::in_memory().unwrap();
        let presence = ProfilePresence {
            profile_id: ProfileId::from_raw("p1"),
            sd_id: SdId::from_raw("sd1"),
            profile_name: "Ada".to_string(),
            user: "ada@example.com".to_string(),
            username: "ada".to_string(),
            hostname: "adas-mac".to_string(),
            platform: "macos".to_string(),
            app_version: "1.0.0".to_string(),
            last_updated_ms: 1000,
        };
        cache.upsert_presence(&presence).unwrap();
        let listed = cache.list_presence(&SdId::from_raw("sd1")).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].profile_name, "Ada");
    }
}
