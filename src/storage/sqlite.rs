use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use directories::ProjectDirs;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use super::{CookieOptions, CookieStore, StoreError};

#[derive(Debug, Error)]
pub enum SqliteJarError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("unable to determine data directory")]
    DataDir,
}

impl From<SqliteJarError> for StoreError {
    fn from(err: SqliteJarError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Cookie jar persisted in SQLite so attribution survives between runs of
/// the command-line tracker.
pub struct SqliteCookieJar {
    pool: Pool<SqliteConnectionManager>,
}

#[derive(Debug)]
struct SqliteCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(1))
    }
}

impl SqliteCookieJar {
    pub fn open() -> Result<Self, SqliteJarError> {
        Self::open_at(&database_path()?)
    }

    pub fn open_at(path: &Path) -> Result<Self, SqliteJarError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|_| SqliteJarError::DataDir)?;
        }

        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder()
            .max_size(2)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)?;

        let conn = pool.get()?;
        initialise_schema(&conn)?;

        Ok(Self { pool })
    }

    fn read(&self, name: &str) -> Result<Option<String>, SqliteJarError> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT value FROM cookies
             WHERE name = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![name, unix_timestamp()],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .map_err(Into::into)
    }

    fn write(&self, name: &str, value: &str, options: &CookieOptions) -> Result<(), SqliteJarError> {
        let conn = self.pool.get()?;
        let expires_at = options
            .max_age
            .map(|age| unix_timestamp() + age.as_secs() as i64);
        conn.execute(
            "INSERT OR REPLACE INTO cookies (name, value, expires_at, written_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![name, value, expires_at, unix_timestamp()],
        )?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), SqliteJarError> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM cookies WHERE name = ?1", params![name])?;
        Ok(())
    }
}

impl CookieStore for SqliteCookieJar {
    fn get(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read(name)?)
    }

    fn set(&self, name: &str, value: &str, options: &CookieOptions) -> Result<(), StoreError> {
        Ok(self.write(name, value, options)?)
    }

    fn remove(&self, name: &str) -> Result<(), StoreError> {
        Ok(self.delete(name)?)
    }
}

fn database_path() -> Result<PathBuf, SqliteJarError> {
    if let Ok(dir) = std::env::var("LEAD_TRACKER_DATA_DIR") {
        let mut path = PathBuf::from(dir);
        path.push("cookies.sqlite3");
        return Ok(path);
    }

    if let Some(dirs) = ProjectDirs::from("org", "LeadTracker", "LeadTracker") {
        let mut data_dir = dirs.data_dir().to_path_buf();
        data_dir.push("cookies.sqlite3");
        Ok(data_dir)
    } else {
        Err(SqliteJarError::DataDir)
    }
}

fn initialise_schema(conn: &Connection) -> Result<(), SqliteJarError> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        CREATE TABLE IF NOT EXISTS cookies (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at INTEGER,
            written_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
