//! Database schema management
//!
//! This module handles schema initialization and migrations with explicit
//! versioning. A fresh database is created at the current version in one
//! pass. An unversioned database from an earlier deployment is adopted by
//! adding whichever known columns and tables it is missing, then stamped
//! with the current version.

use std::collections::HashSet;

use rusqlite::Connection;
use tracing::info;

use super::{StoreError, StoreResult};

/// Database schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Full column set of the images table, in declaration order. Migration
/// adds any of these a legacy table is missing.
pub(crate) const IMAGE_COLUMNS: &[(&str, &str)] = &[
    ("id", "TEXT PRIMARY KEY"),
    ("filename", "TEXT NOT NULL"),
    ("description", "TEXT"),
    ("alt_description", "TEXT"),
    ("user_name", "TEXT"),
    ("user_username", "TEXT"),
    ("user_id", "TEXT"),
    ("image_url_raw", "TEXT"),
    ("image_url_full", "TEXT"),
    ("image_url_regular", "TEXT"),
    ("image_url_small", "TEXT"),
    ("image_url_thumb", "TEXT"),
    ("download_time", "TEXT"),
    ("width", "INTEGER"),
    ("height", "INTEGER"),
    ("color", "TEXT"),
    ("likes", "INTEGER"),
    ("tags", "TEXT"),
    ("category", "TEXT"),
    ("category_slug", "TEXT"),
    ("created_at", "TEXT"),
    ("updated_at", "TEXT"),
    ("exif_data", "TEXT"),
    ("location_data", "TEXT"),
    ("download_status", "TEXT DEFAULT 'success'"),
    ("error_message", "TEXT"),
    ("file_size", "INTEGER"),
    ("file_hash", "TEXT"),
    ("api_request_id", "TEXT"),
    ("unsplash_link", "TEXT"),
    ("fetch_strategy", "TEXT"),
    ("search_keyword", "TEXT"),
    ("category_confidence", "REAL"),
];

/// Bring a connection's schema to the current version. Safe to call on
/// every startup.
pub(crate) fn ensure_schema(conn: &Connection) -> StoreResult<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::Schema(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version == 0 {
        if table_exists(conn, "images")? {
            // Unversioned database from an earlier deployment
            upgrade_strategy_tracking(conn)?;
            info!(
                "Adopted legacy database at schema version {}",
                SCHEMA_VERSION
            );
        } else {
            create_initial_schema(conn)?;
            info!("Database schema initialized to version {}", SCHEMA_VERSION);
        }
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        run_migrations(conn, current_version)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        info!(
            "Database schema migrated from version {} to {}",
            current_version, SCHEMA_VERSION
        );
    }

    Ok(())
}

/// Create the full current-version schema
fn create_initial_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS images (
            id TEXT PRIMARY KEY,
            filename TEXT NOT NULL,
            description TEXT,
            alt_description TEXT,
            user_name TEXT,
            user_username TEXT,
            user_id TEXT,
            image_url_raw TEXT,
            image_url_full TEXT,
            image_url_regular TEXT,
            image_url_small TEXT,
            image_url_thumb TEXT,
            download_time TEXT,
            width INTEGER,
            height INTEGER,
            color TEXT,
            likes INTEGER,
            tags TEXT,
            category TEXT,
            category_slug TEXT,
            created_at TEXT,
            updated_at TEXT,
            exif_data TEXT,
            location_data TEXT,
            download_status TEXT DEFAULT 'success',
            error_message TEXT,
            file_size INTEGER,
            file_hash TEXT,
            api_request_id TEXT,
            unsplash_link TEXT,
            fetch_strategy TEXT,
            search_keyword TEXT,
            category_confidence REAL
        )",
        [],
    )?;

    create_aux_tables(conn)?;
    create_indexes(conn)?;

    Ok(())
}

/// Create every table except images
fn create_aux_tables(conn: &Connection) -> StoreResult<()> {
    // Daily download counters
    conn.execute(
        "CREATE TABLE IF NOT EXISTS download_stats (
            date TEXT PRIMARY KEY,
            total_downloaded INTEGER DEFAULT 0,
            failed_downloads INTEGER DEFAULT 0,
            total_file_size INTEGER DEFAULT 0
        )",
        [],
    )?;

    // One row per image/tag pair
    conn.execute(
        "CREATE TABLE IF NOT EXISTS image_tags (
            image_id TEXT,
            tag TEXT,
            UNIQUE(image_id, tag)
        )",
        [],
    )?;

    // Per-category totals, keyed by display name
    conn.execute(
        "CREATE TABLE IF NOT EXISTS category_stats (
            category TEXT PRIMARY KEY,
            category_slug TEXT,
            count INTEGER DEFAULT 0,
            last_updated TEXT
        )",
        [],
    )?;

    // URL access audit trail
    conn.execute(
        "CREATE TABLE IF NOT EXISTS download_urls (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_id TEXT,
            url_type TEXT,
            url TEXT,
            accessed_time TEXT,
            status_code INTEGER,
            response_time REAL,
            FOREIGN KEY (image_id) REFERENCES images (id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS error_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            image_id TEXT,
            error_type TEXT,
            error_message TEXT,
            error_time TEXT,
            url TEXT,
            stack_trace TEXT
        )",
        [],
    )?;

    // Per-strategy request and yield counters
    conn.execute(
        "CREATE TABLE IF NOT EXISTS api_strategy_stats (
            strategy TEXT PRIMARY KEY,
            total_requests INTEGER DEFAULT 0,
            successful_requests INTEGER DEFAULT 0,
            total_images INTEGER DEFAULT 0,
            new_images INTEGER DEFAULT 0,
            last_used TEXT
        )",
        [],
    )?;

    // Schema version table
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            id INTEGER PRIMARY KEY,
            version INTEGER NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    Ok(())
}

/// Create database indexes
fn create_indexes(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_images_category_slug ON images(category_slug)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_images_download_time ON images(download_time)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_image_tags_tag ON image_tags(tag)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_download_urls_image_id ON download_urls(image_id)",
        [],
    )?;

    Ok(())
}

/// Run database migrations between schema versions
fn run_migrations(conn: &Connection, from_version: u32) -> StoreResult<()> {
    match from_version {
        1 => upgrade_strategy_tracking(conn)?,
        _ => {
            return Err(StoreError::Schema(format!(
                "no migration path from version {}",
                from_version
            )));
        }
    }

    Ok(())
}

/// Version 2 upgrade: strategy tracking columns, the api_strategy_stats
/// table, and any other known column a legacy images table is missing.
fn upgrade_strategy_tracking(conn: &Connection) -> StoreResult<()> {
    add_missing_image_columns(conn)?;
    create_aux_tables(conn)?;
    create_indexes(conn)?;
    Ok(())
}

/// Compare PRAGMA table_info against the known column set and ADD COLUMN
/// whatever is absent. Existing columns and their data are left untouched.
fn add_missing_image_columns(conn: &Connection) -> StoreResult<()> {
    let existing: HashSet<String> = image_column_names(conn)?.into_iter().collect();

    for (name, definition) in IMAGE_COLUMNS {
        if !existing.contains(*name) {
            conn.execute(
                &format!("ALTER TABLE images ADD COLUMN {} {}", name, definition),
                [],
            )?;
            info!(column = name, "Added missing images column");
        }
    }

    Ok(())
}

pub(crate) fn image_column_names(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA table_info(images)")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;

    let mut names = Vec::new();
    for name in rows {
        names.push(name?);
    }
    Ok(names)
}

pub(crate) fn table_exists(conn: &Connection, table_name: &str) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Get current schema version, 0 when the database is unversioned
fn get_schema_version(conn: &Connection) -> StoreResult<u32> {
    if !table_exists(conn, "schema_version")? {
        return Ok(0);
    }

    let version: u32 = conn
        .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        [version],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tables every healthy database carries.
    const REQUIRED_TABLES: &[&str] = &[
        "images",
        "download_stats",
        "image_tags",
        "category_stats",
        "download_urls",
        "error_logs",
        "api_strategy_stats",
        "schema_version",
    ];

    fn open_memory() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn fresh_database_gets_the_full_schema() {
        let conn = open_memory();
        ensure_schema(&conn).unwrap();

        for table in REQUIRED_TABLES {
            assert!(table_exists(&conn, table).unwrap(), "missing {table}");
        }

        let columns = image_column_names(&conn).unwrap();
        let expected: Vec<&str> = IMAGE_COLUMNS.iter().map(|(name, _)| *name).collect();
        assert_eq!(columns, expected);

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn ensure_schema_is_idempotent() {
        let conn = open_memory();
        ensure_schema(&conn).unwrap();
        let tables_before = table_names(&conn);
        let columns_before = image_column_names(&conn).unwrap();

        ensure_schema(&conn).unwrap();
        assert_eq!(table_names(&conn), tables_before);
        assert_eq!(image_column_names(&conn).unwrap(), columns_before);
    }

    #[test]
    fn legacy_database_gains_missing_columns_and_tables() {
        let conn = open_memory();
        conn.execute(
            "CREATE TABLE images (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                description TEXT,
                download_time TEXT
            )",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO images (id, filename) VALUES ('legacy-1', 'a.jpg')",
            [],
        )
        .unwrap();

        ensure_schema(&conn).unwrap();

        let columns: HashSet<String> = image_column_names(&conn).unwrap().into_iter().collect();
        for (name, _) in IMAGE_COLUMNS {
            assert!(columns.contains(*name), "missing column {name}");
        }
        assert!(table_exists(&conn, "api_strategy_stats").unwrap());
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Pre-existing rows survive the upgrade
        let id: String = conn
            .query_row("SELECT id FROM images WHERE filename = 'a.jpg'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(id, "legacy-1");
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let conn = open_memory();
        ensure_schema(&conn).unwrap();
        set_schema_version(&conn, SCHEMA_VERSION + 1).unwrap();

        assert!(ensure_schema(&conn).is_err());
    }
}
