//! SQLite-backed metadata store.
//!
//! This pool is the single source of truth shared by the filesystem handler
//! and the sync engine. All multi-step state transitions are expressed as
//! state-guarded UPDATEs so a concurrent writer on the other side loses the
//! race cleanly instead of corrupting an entry.

use std::path::Path;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::Result;
use crate::metadata::{ConflictAudit, DeviceRecord, FileEntry, SyncState};

/// Number of entries in each sync state, for `status` reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StateCounts {
    pub clean: i64,
    pub locally_modified: i64,
    pub uploading: i64,
    pub downloading: i64,
    pub remotely_modified: i64,
    pub conflicted: i64,
    pub deleted: i64,
    pub tombstoned: i64,
}

impl StateCounts {
    pub fn pending(&self) -> i64 {
        self.locally_modified + self.remotely_modified + self.deleted + self.conflicted
    }

    pub fn total(&self) -> i64 {
        self.clean
            + self.locally_modified
            + self.uploading
            + self.downloading
            + self.remotely_modified
            + self.conflicted
            + self.deleted
            + self.tombstoned
    }
}

/// Connection pool over the metadata database.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Opens (creating if needed) the metadata database at `path` and runs
    /// migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("metadata store opened at {:?}", path);
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                path TEXT PRIMARY KEY,
                local_hash TEXT NOT NULL DEFAULT '',
                remote_version TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                mtime INTEGER NOT NULL DEFAULT 0,
                sync_state TEXT NOT NULL,
                device_origin TEXT NOT NULL DEFAULT '',
                encrypted INTEGER NOT NULL DEFAULT 0,
                is_dir INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_entries_state ON entries(sync_state)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                last_seen INTEGER NOT NULL,
                is_local INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflict_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL,
                winner TEXT NOT NULL,
                loser_hash TEXT NOT NULL,
                policy TEXT NOT NULL,
                resolved_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // --- entries ---

    pub async fn get(&self, path: &str) -> Result<Option<FileEntry>> {
        let row = sqlx::query("SELECT * FROM entries WHERE path = ?")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| entry_from_row(&r)))
    }

    /// Inserts or fully replaces the entry for a path.
    pub async fn upsert(&self, entry: &FileEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entries
                (path, local_hash, remote_version, size, mtime, sync_state,
                 device_origin, encrypted, is_dir, attempts, last_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                local_hash = excluded.local_hash,
                remote_version = excluded.remote_version,
                size = excluded.size,
                mtime = excluded.mtime,
                sync_state = excluded.sync_state,
                device_origin = excluded.device_origin,
                encrypted = excluded.encrypted,
                is_dir = excluded.is_dir,
                attempts = excluded.attempts,
                last_error = excluded.last_error
            "#,
        )
        .bind(&entry.path)
        .bind(&entry.local_hash)
        .bind(&entry.remote_version)
        .bind(entry.size as i64)
        .bind(entry.mtime)
        .bind(entry.sync_state.as_str())
        .bind(&entry.device_origin)
        .bind(entry.encrypted as i64)
        .bind(entry.is_dir as i64)
        .bind(entry.attempts as i64)
        .bind(&entry.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All entries under a logical prefix (`"/"` for everything), ordered
    /// by path. The prefix is taken literally: `_` and `%` in path names
    /// do not act as LIKE wildcards.
    pub async fn list(&self, prefix: &str) -> Result<Vec<FileEntry>> {
        let pattern = format!("{}%", escape_like(prefix));
        let rows =
            sqlx::query("SELECT * FROM entries WHERE path LIKE ? ESCAPE '\\' ORDER BY path")
                .bind(pattern)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// Immediate children of a directory path, for readdir.
    pub async fn children(&self, dir: &str) -> Result<Vec<FileEntry>> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{}/", dir.trim_end_matches('/'))
        };
        let all = self.list(&prefix).await?;
        Ok(all
            .into_iter()
            .filter(|e| {
                e.path.len() > prefix.len() && !e.path[prefix.len()..].contains('/')
            })
            .collect())
    }

    /// Atomically moves `path` from `from` to `to` state. Returns whether
    /// this caller won the transition; a `false` means someone else changed
    /// the entry first and the caller must re-read and re-decide.
    pub async fn compare_and_swap(
        &self,
        path: &str,
        from: SyncState,
        to: SyncState,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE entries SET sync_state = ? WHERE path = ? AND sync_state = ?",
        )
        .bind(to.as_str())
        .bind(path)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        let won = result.rows_affected() == 1;
        debug!(path, from = %from, to = %to, won, "state transition");
        Ok(won)
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM entries WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Retargets an entry to a new logical path, in one transaction.
    ///
    /// If the old path had ever been uploaded, a tombstone entry stays
    /// behind at the old path so the engine deletes the old remote object.
    /// If the destination already had an entry, the moved entry inherits
    /// its remote version so the next upload replaces the overwritten
    /// object conditionally instead of create-only.
    pub async fn rename(&self, from: &str, to: &str, device: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let old = sqlx::query("SELECT * FROM entries WHERE path = ?")
            .bind(from)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| entry_from_row(&r));
        let Some(old) = old else {
            tx.commit().await?;
            return Ok(());
        };

        let target = sqlx::query("SELECT * FROM entries WHERE path = ?")
            .bind(to)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| entry_from_row(&r));
        let inherited_version = target
            .map(|t| t.remote_version)
            .unwrap_or_default();

        sqlx::query("DELETE FROM entries WHERE path = ?")
            .bind(to)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM entries WHERE path = ?")
            .bind(from)
            .execute(&mut *tx)
            .await?;

        if !old.is_dir {
            let state = if old.sync_state == SyncState::RemotelyModified {
                // Content not materialized yet; keep waiting for download at
                // the new path.
                SyncState::RemotelyModified
            } else {
                SyncState::LocallyModified
            };
            sqlx::query(
                r#"
                INSERT INTO entries
                    (path, local_hash, remote_version, size, mtime, sync_state,
                     device_origin, encrypted, is_dir, attempts, last_error)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, NULL)
                "#,
            )
            .bind(to)
            .bind(&old.local_hash)
            .bind(&inherited_version)
            .bind(old.size as i64)
            .bind(old.mtime)
            .bind(state.as_str())
            .bind(device)
            .bind(old.encrypted as i64)
            .execute(&mut *tx)
            .await?;

            if !old.remote_version.is_empty() {
                sqlx::query(
                    r#"
                    INSERT INTO entries
                        (path, local_hash, remote_version, size, mtime, sync_state,
                         device_origin, encrypted, is_dir, attempts, last_error)
                    VALUES (?, '', ?, 0, ?, 'deleted', ?, ?, 0, 0, NULL)
                    "#,
                )
                .bind(from)
                .bind(&old.remote_version)
                .bind(Utc::now().timestamp())
                .bind(device)
                .bind(old.encrypted as i64)
                .execute(&mut *tx)
                .await?;
            }
        } else {
            sqlx::query(
                r#"
                INSERT INTO entries
                    (path, local_hash, remote_version, size, mtime, sync_state,
                     device_origin, encrypted, is_dir, attempts, last_error)
                VALUES (?, '', '', 0, ?, 'clean', ?, 0, 1, 0, NULL)
                "#,
            )
            .bind(to)
            .bind(old.mtime)
            .bind(device)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Renames a directory subtree: the directory entry itself plus every
    /// descendant, each through [`rename`] so synced files leave tombstones
    /// behind.
    ///
    /// [`rename`]: MetadataStore::rename
    pub async fn rename_prefix(&self, from: &str, to: &str, device: &str) -> Result<()> {
        let from = from.trim_end_matches('/');
        let to = to.trim_end_matches('/');
        let descendants = self.list(&format!("{}/", from)).await?;
        self.rename(from, to, device).await?;
        for entry in descendants {
            let suffix = &entry.path[from.len()..];
            self.rename(&entry.path, &format!("{}{}", to, suffix), device)
                .await?;
        }
        Ok(())
    }

    /// Paths that currently need sync work, oldest first, skipping entries
    /// whose attempt budget is spent.
    pub async fn pending(&self, max_attempts: u32) -> Result<Vec<FileEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM entries
            WHERE sync_state IN ('locally-modified', 'remotely-modified',
                                 'conflicted', 'deleted')
              AND attempts < ?
              AND is_dir = 0
            ORDER BY mtime ASC
            "#,
        )
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// Entries whose attempt budget is exhausted, for `status` reporting.
    pub async fn failed(&self, max_attempts: u32) -> Result<Vec<FileEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM entries WHERE attempts >= ? ORDER BY path",
        )
        .bind(max_attempts as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(entry_from_row).collect())
    }

    /// Records a failed attempt on a path.
    pub async fn mark_error(&self, path: &str, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE entries SET attempts = attempts + 1, last_error = ? WHERE path = ?",
        )
        .bind(message)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Completes an upload: only applies while the path is still in
    /// `uploading`, so a handler write that re-dirtied the path during the
    /// upload keeps its `locally-modified` state and a re-upload follows.
    pub async fn finish_upload(&self, path: &str, version: &str, hash: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entries
            SET sync_state = 'clean', remote_version = ?, local_hash = ?,
                attempts = 0, last_error = NULL
            WHERE path = ? AND sync_state = 'uploading'
            "#,
        )
        .bind(version)
        .bind(hash)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Completes a download, same state guard as [`finish_upload`].
    ///
    /// [`finish_upload`]: MetadataStore::finish_upload
    pub async fn finish_download(
        &self,
        path: &str,
        version: &str,
        hash: &str,
        size: u64,
        mtime: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entries
            SET sync_state = 'clean', remote_version = ?, local_hash = ?,
                size = ?, mtime = ?, attempts = 0, last_error = NULL
            WHERE path = ? AND sync_state = 'downloading'
            "#,
        )
        .bind(version)
        .bind(hash)
        .bind(size as i64)
        .bind(mtime)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Marks an entry clean at a given remote version without touching its
    /// content fields, for trivial merges where both sides hold identical
    /// bytes.
    pub async fn merge_clean(&self, path: &str, version: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE entries
            SET sync_state = 'clean', remote_version = ?,
                attempts = 0, last_error = NULL
            WHERE path = ?
            "#,
        )
        .bind(version)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Adopts a remote version token while keeping local content dirty, so
    /// the next upload overwrites that remote version conditionally.
    pub async fn adopt_remote_version(&self, path: &str, version: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE entries
            SET sync_state = 'locally-modified', remote_version = ?,
                attempts = 0, last_error = NULL
            WHERE path = ?
            "#,
        )
        .bind(version)
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Updates only the remote version token, leaving state and content
    /// fields alone. Used when an upload lands but the entry moved on in
    /// the meantime; whatever state it is in, it must now target the
    /// version we just wrote.
    pub async fn set_remote_version(&self, path: &str, version: &str) -> Result<()> {
        sqlx::query("UPDATE entries SET remote_version = ? WHERE path = ?")
            .bind(version)
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forgets the remote version for a path, making the next upload a
    /// create-only put. Used when the remote object disappeared under a
    /// locally modified entry.
    pub async fn clear_remote_version(&self, path: &str) -> Result<()> {
        sqlx::query(
            "UPDATE entries SET remote_version = '', sync_state = 'locally-modified' WHERE path = ?",
        )
        .bind(path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rolls in-flight states back to their pending form. Run once at
    /// startup; any `uploading`, `downloading` or `tombstoned` entry found
    /// here belonged to a worker that died with the previous process.
    pub async fn recover(&self) -> Result<u64> {
        let mut recovered = 0;
        for (from, to) in [
            ("uploading", "locally-modified"),
            ("downloading", "remotely-modified"),
            ("tombstoned", "deleted"),
        ] {
            let result = sqlx::query(
                "UPDATE entries SET sync_state = ? WHERE sync_state = ?",
            )
            .bind(to)
            .bind(from)
            .execute(&self.pool)
            .await?;
            recovered += result.rows_affected();
        }
        if recovered > 0 {
            info!(recovered, "rolled back in-flight entries from previous run");
        }
        Ok(recovered)
    }

    pub async fn counts(&self) -> Result<StateCounts> {
        let rows = sqlx::query(
            "SELECT sync_state, COUNT(*) as count FROM entries GROUP BY sync_state",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.get("sync_state");
            let count: i64 = row.get("count");
            match state.as_str() {
                "clean" => counts.clean = count,
                "locally-modified" => counts.locally_modified = count,
                "uploading" => counts.uploading = count,
                "downloading" => counts.downloading = count,
                "remotely-modified" => counts.remotely_modified = count,
                "conflicted" => counts.conflicted = count,
                "deleted" => counts.deleted = count,
                "tombstoned" => counts.tombstoned = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    // --- conflict audit ---

    pub async fn record_conflict(&self, audit: &ConflictAudit) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_audit (path, winner, loser_hash, policy, resolved_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&audit.path)
        .bind(&audit.winner)
        .bind(&audit.loser_hash)
        .bind(&audit.policy)
        .bind(audit.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn conflicts(&self) -> Result<Vec<ConflictAudit>> {
        let rows = sqlx::query("SELECT * FROM conflict_audit ORDER BY resolved_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| ConflictAudit {
                path: r.get("path"),
                winner: r.get("winner"),
                loser_hash: r.get("loser_hash"),
                policy: r.get("policy"),
                resolved_at: r.get("resolved_at"),
            })
            .collect())
    }

    // --- devices ---

    /// Returns the local device record, creating it on first run. The
    /// stable id is a random UUID; the name defaults to the hostname-like
    /// `name` argument when no record exists yet.
    pub async fn ensure_local_device(&self, name: &str) -> Result<DeviceRecord> {
        let row = sqlx::query("SELECT * FROM devices WHERE is_local = 1")
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let record = device_from_row(&row);
            self.touch_device(&record.device_id).await?;
            return Ok(record);
        }

        let record = DeviceRecord {
            device_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            last_seen: Utc::now().timestamp(),
            is_local: true,
        };
        sqlx::query(
            "INSERT INTO devices (device_id, name, last_seen, is_local) VALUES (?, ?, ?, 1)",
        )
        .bind(&record.device_id)
        .bind(&record.name)
        .bind(record.last_seen)
        .execute(&self.pool)
        .await?;
        info!(device = %record.name, id = %record.device_id, "registered local device");
        Ok(record)
    }

    pub async fn touch_device(&self, device_id: &str) -> Result<()> {
        sqlx::query("UPDATE devices SET last_seen = ? WHERE device_id = ?")
            .bind(Utc::now().timestamp())
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// `_` and `%` are LIKE metacharacters but legal in path names.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn entry_from_row(row: &SqliteRow) -> FileEntry {
    let state: String = row.get("sync_state");
    FileEntry {
        path: row.get("path"),
        local_hash: row.get("local_hash"),
        remote_version: row.get("remote_version"),
        size: row.get::<i64, _>("size") as u64,
        mtime: row.get("mtime"),
        // Unknown states cannot appear through this store's own writes;
        // treat any as conflicted so a human looks at them.
        sync_state: SyncState::parse(&state).unwrap_or(SyncState::Conflicted),
        device_origin: row.get("device_origin"),
        encrypted: row.get::<i64, _>("encrypted") != 0,
        is_dir: row.get::<i64, _>("is_dir") != 0,
        attempts: row.get::<i64, _>("attempts") as u32,
        last_error: row.get("last_error"),
    }
}

fn device_from_row(row: &SqliteRow) -> DeviceRecord {
    DeviceRecord {
        device_id: row.get("device_id"),
        name: row.get("name"),
        last_seen: row.get("last_seen"),
        is_local: row.get::<i64, _>("is_local") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(entries: &[FileEntry]) -> MetadataStore {
        let store = MetadataStore::in_memory().await.unwrap();
        for entry in entries {
            store.upsert(entry).await.unwrap();
        }
        store
    }

    fn dirty(path: &str) -> FileEntry {
        FileEntry::local_create(path, "abc123", 10, 1_700_000_000, "laptop", false)
    }

    #[tokio::test]
    async fn test_upsert_get_roundtrip() {
        let store = store_with(&[dirty("/a.txt")]).await;
        let entry = store.get("/a.txt").await.unwrap().unwrap();
        assert_eq!(entry.sync_state, SyncState::LocallyModified);
        assert_eq!(entry.local_hash, "abc123");
        assert!(store.get("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compare_and_swap_single_winner() {
        let store = store_with(&[dirty("/a.txt")]).await;
        let first = store
            .compare_and_swap("/a.txt", SyncState::LocallyModified, SyncState::Uploading)
            .await
            .unwrap();
        let second = store
            .compare_and_swap("/a.txt", SyncState::LocallyModified, SyncState::Uploading)
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[tokio::test]
    async fn test_finish_upload_loses_to_concurrent_dirty() {
        let store = store_with(&[dirty("/a.txt")]).await;
        store
            .compare_and_swap("/a.txt", SyncState::LocallyModified, SyncState::Uploading)
            .await
            .unwrap();
        // A write lands mid-upload and re-dirties the entry.
        let mut entry = store.get("/a.txt").await.unwrap().unwrap();
        entry.sync_state = SyncState::LocallyModified;
        entry.local_hash = "newer".to_string();
        store.upsert(&entry).await.unwrap();

        assert!(!store.finish_upload("/a.txt", "v1", "abc123").await.unwrap());
        let after = store.get("/a.txt").await.unwrap().unwrap();
        assert_eq!(after.sync_state, SyncState::LocallyModified);
        assert_eq!(after.local_hash, "newer");
    }

    #[tokio::test]
    async fn test_rename_tombstones_synced_source() {
        let store = MetadataStore::in_memory().await.unwrap();
        let mut entry = dirty("/old.txt");
        entry.remote_version = "v7".to_string();
        entry.sync_state = SyncState::Clean;
        store.upsert(&entry).await.unwrap();

        store.rename("/old.txt", "/new.txt", "laptop").await.unwrap();

        let old = store.get("/old.txt").await.unwrap().unwrap();
        assert_eq!(old.sync_state, SyncState::Deleted);
        assert_eq!(old.remote_version, "v7");

        let new = store.get("/new.txt").await.unwrap().unwrap();
        assert_eq!(new.sync_state, SyncState::LocallyModified);
        assert_eq!(new.remote_version, "");
    }

    #[tokio::test]
    async fn test_rename_inherits_target_version() {
        let store = MetadataStore::in_memory().await.unwrap();
        store.upsert(&dirty("/src.txt")).await.unwrap();
        let mut target = dirty("/dst.txt");
        target.remote_version = "v3".to_string();
        target.sync_state = SyncState::Clean;
        store.upsert(&target).await.unwrap();

        store.rename("/src.txt", "/dst.txt", "laptop").await.unwrap();

        let dst = store.get("/dst.txt").await.unwrap().unwrap();
        assert_eq!(dst.remote_version, "v3");
        assert_eq!(dst.sync_state, SyncState::LocallyModified);
        // Source was never uploaded, so no tombstone stays behind.
        assert!(store.get("/src.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_prefix_moves_subtree() {
        let store = MetadataStore::in_memory().await.unwrap();
        store
            .upsert(&FileEntry::directory("/docs", 0, "laptop"))
            .await
            .unwrap();
        let mut synced = dirty("/docs/a.txt");
        synced.remote_version = "v1".to_string();
        synced.sync_state = SyncState::Clean;
        store.upsert(&synced).await.unwrap();
        store.upsert(&dirty("/docs/sub/b.txt")).await.unwrap();

        store.rename_prefix("/docs", "/papers", "laptop").await.unwrap();

        assert!(store.get("/papers").await.unwrap().unwrap().is_dir);
        assert!(store.get("/papers/a.txt").await.unwrap().is_some());
        assert!(store.get("/papers/sub/b.txt").await.unwrap().is_some());
        // The synced child leaves a tombstone at its old path.
        let old = store.get("/docs/a.txt").await.unwrap().unwrap();
        assert_eq!(old.sync_state, SyncState::Deleted);
        assert!(store.get("/docs/sub/b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rename_prefix_leaves_wildcard_siblings_alone() {
        let store = MetadataStore::in_memory().await.unwrap();
        store
            .upsert(&FileEntry::directory("/my_docs", 0, "laptop"))
            .await
            .unwrap();
        store.upsert(&dirty("/my_docs/a.txt")).await.unwrap();
        // Matches "/my_docs" only if `_` acts as a LIKE wildcard.
        store.upsert(&dirty("/myxdocs/b.txt")).await.unwrap();

        store
            .rename_prefix("/my_docs", "/papers", "laptop")
            .await
            .unwrap();

        assert!(store.get("/papers/a.txt").await.unwrap().is_some());
        assert!(store.get("/my_docs/a.txt").await.unwrap().is_none());
        assert!(store.get("/myxdocs/b.txt").await.unwrap().is_some());
        assert!(store.get("/papers/b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_takes_prefix_literally() {
        let store =
            store_with(&[dirty("/a_b/x.txt"), dirty("/axb/y.txt"), dirty("/100%/z.txt")]).await;

        let under = store.list("/a_b/").await.unwrap();
        assert_eq!(under.len(), 1);
        assert_eq!(under[0].path, "/a_b/x.txt");

        let percent = store.list("/100%/").await.unwrap();
        assert_eq!(percent.len(), 1);
        assert_eq!(percent[0].path, "/100%/z.txt");
    }

    #[tokio::test]
    async fn test_pending_skips_exhausted_attempts() {
        let store = store_with(&[dirty("/a.txt"), dirty("/b.txt")]).await;
        for _ in 0..5 {
            store.mark_error("/a.txt", "boom").await.unwrap();
        }
        let pending = store.pending(5).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].path, "/b.txt");

        let failed = store.failed(5).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_recover_rolls_back_in_flight() {
        let store = store_with(&[dirty("/a.txt")]).await;
        store
            .compare_and_swap("/a.txt", SyncState::LocallyModified, SyncState::Uploading)
            .await
            .unwrap();
        assert_eq!(store.recover().await.unwrap(), 1);
        let entry = store.get("/a.txt").await.unwrap().unwrap();
        assert_eq!(entry.sync_state, SyncState::LocallyModified);
    }

    #[tokio::test]
    async fn test_children_lists_only_direct() {
        let store = store_with(&[dirty("/docs/a.txt"), dirty("/docs/sub/b.txt"), dirty("/c.txt")])
            .await;
        let children = store.children("/docs").await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path, "/docs/a.txt");

        let root = store.children("/").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].path, "/c.txt");
    }

    #[tokio::test]
    async fn test_ensure_local_device_is_stable() {
        let store = MetadataStore::in_memory().await.unwrap();
        let first = store.ensure_local_device("laptop").await.unwrap();
        let second = store.ensure_local_device("other-name").await.unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(second.name, "laptop");
    }

    #[tokio::test]
    async fn test_counts() {
        let store = store_with(&[dirty("/a.txt"), dirty("/b.txt")]).await;
        let mut clean = dirty("/c.txt");
        clean.sync_state = SyncState::Clean;
        store.upsert(&clean).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.locally_modified, 2);
        assert_eq!(counts.clean, 1);
        assert_eq!(counts.pending(), 2);
        assert_eq!(counts.total(), 3);
    }
}
