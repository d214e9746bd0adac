use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Key under which the last selected bucket is remembered
pub const CURRENT_BUCKET_KEY: &str = "current_bucket";

/// Small key-value store for client state that survives restarts
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    pub fn open() -> anyhow::Result<Self> {
        let db_path = Self::db_path()?;
        Self::open_at(&db_path)
    }

    pub fn open_at(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn db_path() -> anyhow::Result<PathBuf> {
        let data = dirs::data_local_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(data.join("shelf/state.db"))
    }

    fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("db lock: {}", e))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS client_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("db lock: {}", e))?;
        let mut stmt = conn.prepare("SELECT value FROM client_state WHERE key = ?")?;
        let result = stmt.query_row([key], |row| row.get(0));
        match result {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("db lock: {}", e))?;
        conn.execute(
            "INSERT OR REPLACE INTO client_state (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    pub fn current_bucket(&self) -> anyhow::Result<Option<String>> {
        self.get(CURRENT_BUCKET_KEY)
    }

    pub fn set_current_bucket(&self, bucket: &str) -> anyhow::Result<()> {
        self.set(CURRENT_BUCKET_KEY, bucket)
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }
}

/// Pick the bucket to work in: the remembered one if the backend still has
/// it, otherwise the first available.
pub fn resolve_bucket(saved: Option<&str>, available: &[String]) -> Option<String> {
    match saved {
        Some(saved) if available.iter().any(|b| b == saved) => Some(saved.to_string()),
        _ => available.first().cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_init() {
        let db = StateDb::open_memory().expect("open_memory should succeed");
        let conn = db.conn.lock().unwrap();
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(tables.contains(&"client_state".to_string()), "client_state table missing");
    }

    #[test]
    fn test_current_bucket_roundtrip() {
        let db = StateDb::open_memory().unwrap();
        assert_eq!(db.current_bucket().unwrap(), None);
        db.set_current_bucket("photos").unwrap();
        db.set_current_bucket("media").unwrap();
        assert_eq!(db.current_bucket().unwrap().as_deref(), Some("media"));
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("state.db");
        StateDb::open_at(&path).unwrap().set_current_bucket("media").unwrap();
        let reopened = StateDb::open_at(&path).unwrap();
        assert_eq!(reopened.current_bucket().unwrap().as_deref(), Some("media"));
    }

    #[test]
    fn test_resolve_bucket() {
        let available = vec!["a".to_string(), "b".to_string()];
        assert_eq!(resolve_bucket(Some("b"), &available).as_deref(), Some("b"));
        assert_eq!(resolve_bucket(Some("gone"), &available).as_deref(), Some("a"));
        assert_eq!(resolve_bucket(None, &available).as_deref(), Some("a"));
        assert_eq!(resolve_bucket(Some("b"), &[]), None);
    }
}
