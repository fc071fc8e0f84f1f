//! SQLite-based anchor and session storage

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::traits::{AnchorStore, SessionStore};
use crate::models::{Cursor, DataTypeId, UserKey};

/// Slot name of the single active session row
const SESSION_SLOT: &str = "current";

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Read position per (user, data type)
            CREATE TABLE anchors (
                user_key TEXT NOT NULL,
                type_id TEXT NOT NULL,
                cursor TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_key, type_id)
            );

            -- Full-export completion per user
            CREATE TABLE full_export (
                user_key TEXT PRIMARY KEY,
                done INTEGER NOT NULL DEFAULT 0
            );

            -- Resumable sync session (at most one row)
            CREATE TABLE sync_session (
                slot TEXT PRIMARY KEY,
                user_key TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        ),
    ])
}

/// SQLite-backed [`AnchorStore`] and [`SessionStore`]
///
/// Every cursor is its own row, so writes for different types never
/// contend on a shared document.
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

impl SqliteSyncStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL keeps readers unblocked while a pass commits cursors;
        // NORMAL sync is durable enough with WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sync store connection lock poisoned"))
    }

    /// All cursors for a user, ordered by type id
    pub fn list_cursors(&self, user: &UserKey) -> Result<Vec<(DataTypeId, Cursor)>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT type_id, cursor FROM anchors WHERE user_key = ? ORDER BY type_id")?;

        let cursors = stmt
            .query_map([user.as_str()], |row| {
                Ok((
                    DataTypeId::new(row.get::<_, String>(0)?),
                    Cursor::new(row.get::<_, String>(1)?),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(cursors)
    }
}

impl AnchorStore for SqliteSyncStore {
    fn get_cursor(&self, user: &UserKey, type_id: &DataTypeId) -> Result<Option<Cursor>> {
        let conn = self.conn()?;
        let cursor: Option<String> = conn
            .query_row(
                "SELECT cursor FROM anchors WHERE user_key = ? AND type_id = ?",
                params![user.as_str(), type_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.map(Cursor::new))
    }

    fn set_cursor(&self, user: &UserKey, type_id: &DataTypeId, cursor: &Cursor) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO anchors (user_key, type_id, cursor, updated_at)
             VALUES (?, ?, ?, ?)",
            params![
                user.as_str(),
                type_id.as_str(),
                cursor.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn compare_and_set_cursor(
        &self,
        user: &UserKey,
        type_id: &DataTypeId,
        expected: Option<&Cursor>,
        cursor: &Cursor,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let current: Option<String> = tx
            .query_row(
                "SELECT cursor FROM anchors WHERE user_key = ? AND type_id = ?",
                params![user.as_str(), type_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        if current.as_deref() != expected.map(Cursor::as_str) {
            return Ok(false);
        }

        tx.execute(
            "INSERT OR REPLACE INTO anchors (user_key, type_id, cursor, updated_at)
             VALUES (?, ?, ?, ?)",
            params![
                user.as_str(),
                type_id.as_str(),
                cursor.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn is_full_export_done(&self, user: &UserKey) -> Result<bool> {
        let conn = self.conn()?;
        let done: Option<bool> = conn
            .query_row(
                "SELECT done FROM full_export WHERE user_key = ?",
                [user.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(done.unwrap_or(false))
    }

    fn set_full_export_done(&self, user: &UserKey, done: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO full_export (user_key, done) VALUES (?, ?)",
            params![user.as_str(), done],
        )?;
        Ok(())
    }

    fn reset_all(&self, user: &UserKey) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM anchors WHERE user_key = ?", [user.as_str()])?;
        tx.execute("DELETE FROM full_export WHERE user_key = ?", [user.as_str()])?;
        tx.commit()?;
        Ok(())
    }
}

impl SessionStore for SqliteSyncStore {
    fn load_session(&self) -> Result<Option<(UserKey, String)>> {
        let conn = self.conn()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT user_key, data FROM sync_session WHERE slot = ?",
                [SESSION_SLOT],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(user_key, data)| (UserKey::new(user_key), data)))
    }

    fn save_session(&self, user: &UserKey, data: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sync_session (slot, user_key, data, updated_at)
             VALUES (?, ?, ?, ?)",
            params![SESSION_SLOT, user.as_str(), data, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn delete_session(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sync_session WHERE slot = ?", [SESSION_SLOT])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteSyncStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        // Use .test.sqlite extension to clearly distinguish from production databases
        let db_path = dir.path().join("sync.test.sqlite");
        let store = SqliteSyncStore::new(&db_path).unwrap();
        (store, dir)
    }

    #[test]
    fn test_cursor_crud() {
        let (store, _dir) = create_test_store();
        let user = UserKey::for_user("u1");
        let steps = DataTypeId::new("steps");

        assert!(store.get_cursor(&user, &steps).unwrap().is_none());

        store.set_cursor(&user, &steps, &Cursor::new("c1")).unwrap();
        store.set_cursor(&user, &steps, &Cursor::new("c2")).unwrap();
        assert_eq!(
            store.get_cursor(&user, &steps).unwrap(),
            Some(Cursor::new("c2"))
        );

        store
            .set_cursor(&user, &DataTypeId::new("heartRate"), &Cursor::new("h1"))
            .unwrap();
        let all = store.list_cursors(&user).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, DataTypeId::new("heartRate"));
    }

    #[test]
    fn test_compare_and_set() {
        let (store, _dir) = create_test_store();
        let user = UserKey::for_user("u1");
        let steps = DataTypeId::new("steps");

        assert!(store
            .compare_and_set_cursor(&user, &steps, None, &Cursor::new("c1"))
            .unwrap());
        assert!(!store
            .compare_and_set_cursor(&user, &steps, None, &Cursor::new("c0"))
            .unwrap());
        assert_eq!(
            store.get_cursor(&user, &steps).unwrap(),
            Some(Cursor::new("c1"))
        );
    }

    #[test]
    fn test_full_export_flag_and_reset() {
        let (store, _dir) = create_test_store();
        let user = UserKey::for_user("u1");
        let steps = DataTypeId::new("steps");

        assert!(!store.is_full_export_done(&user).unwrap());
        store.set_full_export_done(&user, true).unwrap();
        store.set_cursor(&user, &steps, &Cursor::new("c1")).unwrap();
        assert!(store.is_full_export_done(&user).unwrap());

        store.reset_all(&user).unwrap();
        assert!(!store.is_full_export_done(&user).unwrap());
        assert!(store.get_cursor(&user, &steps).unwrap().is_none());
    }

    #[test]
    fn test_session_survives_reopen() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("sync.test.sqlite");
        let user = UserKey::for_user("u1");

        {
            let store = SqliteSyncStore::new(&db_path).unwrap();
            store.save_session(&user, r#"{"resume_index":2}"#).unwrap();
        }

        let store = SqliteSyncStore::new(&db_path).unwrap();
        let (owner, data) = store.load_session().unwrap().unwrap();
        assert_eq!(owner, user);
        assert!(data.contains("resume_index"));

        store.delete_session().unwrap();
        assert!(store.load_session().unwrap().is_none());
    }
}
