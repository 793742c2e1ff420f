//! SQLite-backed geolocation store with migrations
//!
//! Locations survive restarts here; the in-process caches do not.

use super::{GeoLocation, GeoStore};
use crate::error::{HopscopeError, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Persistent address → location table
pub struct SqliteGeoStore {
    pool: DbPool,
}

impl SqliteGeoStore {
    /// Open (and migrate) the store at `db_path`
    pub fn open(db_path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| HopscopeError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(4).build(manager)?;

        {
            let conn = pool.get()?;
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA busy_timeout = 5000;
                ",
            )?;
        }

        let store = Self { pool };
        store.migrate()?;

        tracing::info!("Geolocation store ready at {}", db_path.display());

        Ok(store)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Number of stored locations
    pub fn count(&self) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM geolocations", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying migration {}", version);

                conn.execute_batch(migration)?;
                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }
}

impl GeoStore for SqliteGeoStore {
    fn find(&self, address: &str) -> Result<Option<GeoLocation>> {
        let conn = self.get_conn()?;
        let location = conn
            .query_row(
                "SELECT latitude, longitude FROM geolocations WHERE address = ?1",
                params![address],
                |row| {
                    Ok(GeoLocation {
                        latitude: row.get(0)?,
                        longitude: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(location)
    }

    fn save(&self, address: &str, location: GeoLocation) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO geolocations (address, latitude, longitude, resolved_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(address) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                resolved_at = excluded.resolved_at",
            params![
                address,
                location.latitude,
                location.longitude,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }
}

/// Store migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Initial schema
    r#"
    CREATE TABLE geolocations (
        address TEXT PRIMARY KEY,
        latitude REAL NOT NULL,
        longitude REAL NOT NULL,
        resolved_at INTEGER NOT NULL
    );

    CREATE INDEX idx_geolocations_resolved_at ON geolocations(resolved_at);
    "#,
];
