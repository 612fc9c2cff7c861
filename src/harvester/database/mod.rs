//! Metadata store for harvested images
//!
//! This module provides the single-writer database layer:
//! 1. One SQLite connection behind an async mutex
//! 2. Transactional persistence of image metadata and counters
//! 3. Duplicate detection by image id
//! 4. Daily, per-category, and per-strategy statistics

mod schema;

pub use schema::SCHEMA_VERSION;

use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use rusqlite::{params, Connection};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::harvester::api_client::PhotoRecord;
use crate::harvester::categorizer::{CategoryTable, Classification};
use crate::harvester::strategy::FetchStrategy;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Schema error: {0}")]
    Schema(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the store records about one downloaded image.
pub struct NewImage<'a> {
    pub photo: &'a PhotoRecord,
    pub filename: &'a str,
    pub classification: &'a Classification,
    pub strategy: FetchStrategy,
    pub search_keyword: Option<&'a str>,
    pub file_size: u64,
    pub file_hash: &'a str,
    pub request_id: &'a str,
}

/// One day's counters from download_stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyStats {
    pub date: String,
    pub total_downloaded: u64,
    pub failed_downloads: u64,
    pub total_file_size: u64,
}

#[derive(Debug, Clone)]
pub struct CategoryCount {
    pub category: String,
    pub slug: String,
    pub count: u64,
}

#[derive(Debug, Clone)]
pub struct StrategyStats {
    pub strategy: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_images: u64,
    pub new_images: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StoreTotals {
    pub images: u64,
    pub total_file_size: u64,
}

/// Today's date in the download_stats key format.
pub fn today() -> String {
    Local::now().format("%Y-%m-%d").to_string()
}

/// Single-writer store over one SQLite connection.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    log_url_access: bool,
}

impl Database {
    /// Open (creating if necessary) the database and bring its schema to
    /// the current version. A connection that cannot be opened is fatal.
    pub fn open(
        db_path: impl AsRef<Path>,
        categories: &CategoryTable,
        log_url_access: bool,
    ) -> StoreResult<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
                relax_directory_permissions(parent);
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Audit rows are written before their parent images row exists, and
        // the bundled SQLite defaults enforcement on
        conn.pragma_update(None, "foreign_keys", "OFF")?;

        schema::ensure_schema(&conn)?;
        seed_category_stats(&conn, categories)?;

        info!("Database initialized: {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            log_url_access,
        })
    }

    /// Whether an image id already has a metadata row.
    pub async fn is_downloaded(&self, image_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT 1 FROM images WHERE id = ?1",
            params![image_id],
            |_row| Ok(()),
        ) {
            Ok(()) => Ok(true),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Persist one image's metadata row, tag rows, and counter updates in a
    /// single transaction. On any failure nothing is recorded.
    pub async fn persist_image(&self, image: &NewImage<'_>) -> StoreResult<()> {
        let photo = image.photo;
        let tag_titles = photo.tag_titles();
        let tags_json = serde_json::to_string(&tag_titles)?;
        let exif_json = match &photo.exif {
            Some(value) => serde_json::to_string(value)?,
            None => "{}".to_string(),
        };
        let location_json = match &photo.location {
            Some(value) => serde_json::to_string(value)?,
            None => "{}".to_string(),
        };
        let now = Local::now().to_rfc3339();
        let date = today();

        let conn = self.conn.lock().await;

        conn.execute("BEGIN TRANSACTION", [])?;
        debug!("Started metadata transaction for image {}", photo.id);

        let result = (|| -> StoreResult<()> {
            conn.execute(
                "INSERT OR REPLACE INTO images (
                    id, filename, description, alt_description,
                    user_name, user_username, user_id,
                    image_url_raw, image_url_full, image_url_regular,
                    image_url_small, image_url_thumb,
                    download_time, width, height, color, likes, tags,
                    category, category_slug, created_at, updated_at,
                    exif_data, location_data, file_size, file_hash,
                    api_request_id, unsplash_link,
                    fetch_strategy, search_keyword, category_confidence
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                    ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
                    ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31
                )",
                params![
                    photo.id,
                    image.filename,
                    photo.description.as_deref().unwrap_or(""),
                    photo.alt_description.as_deref().unwrap_or(""),
                    photo.user.name,
                    photo.user.username,
                    photo.user.id,
                    photo.urls.raw,
                    photo.urls.full,
                    photo.urls.regular,
                    photo.urls.small,
                    photo.urls.thumb,
                    now,
                    photo.width,
                    photo.height,
                    photo.color.as_deref().unwrap_or(""),
                    photo.likes,
                    tags_json,
                    image.classification.name,
                    image.classification.slug,
                    photo.created_at.as_deref().unwrap_or(""),
                    photo.updated_at.as_deref().unwrap_or(""),
                    exif_json,
                    location_json,
                    image.file_size,
                    image.file_hash,
                    image.request_id,
                    photo.links.html,
                    image.strategy.as_str(),
                    image.search_keyword.unwrap_or(""),
                    image.classification.confidence,
                ],
            )?;

            for tag in &tag_titles {
                conn.execute(
                    "INSERT OR IGNORE INTO image_tags (image_id, tag) VALUES (?1, ?2)",
                    params![photo.id, tag],
                )?;
            }

            conn.execute(
                "INSERT INTO category_stats (category, category_slug, count, last_updated)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(category) DO UPDATE SET
                     count = count + 1,
                     last_updated = ?3",
                params![image.classification.name, image.classification.slug, now],
            )?;

            conn.execute(
                "INSERT INTO download_stats (date, total_downloaded, failed_downloads, total_file_size)
                 VALUES (?1, 1, 0, ?2)
                 ON CONFLICT(date) DO UPDATE SET
                     total_downloaded = total_downloaded + 1,
                     total_file_size = total_file_size + ?2",
                params![date, image.file_size],
            )?;

            Ok(())
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
            debug!("Committed metadata for image {}", photo.id);
        } else {
            conn.execute("ROLLBACK", [])?;
            error!(
                "Rolled back metadata transaction for image {}: {:?}",
                photo.id, result
            );
        }

        result
    }

    /// Count one failed download against today's stats row.
    pub async fn record_failed_download(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO download_stats (date, total_downloaded, failed_downloads, total_file_size)
             VALUES (?1, 0, 1, 0)
             ON CONFLICT(date) DO UPDATE SET
                 failed_downloads = failed_downloads + 1",
            params![today()],
        )?;
        Ok(())
    }

    /// Append a URL access audit row. A no-op when URL logging is disabled
    /// in the configuration.
    pub async fn record_download_url(
        &self,
        image_id: &str,
        url_type: &str,
        url: &str,
        status_code: Option<u16>,
        response_time_secs: f64,
    ) -> StoreResult<()> {
        if !self.log_url_access {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO download_urls (image_id, url_type, url, accessed_time, status_code, response_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                image_id,
                url_type,
                url,
                Local::now().to_rfc3339(),
                status_code,
                response_time_secs,
            ],
        )?;
        Ok(())
    }

    pub async fn log_error(
        &self,
        image_id: Option<&str>,
        error_type: &str,
        error_message: &str,
        url: Option<&str>,
        stack_trace: Option<&str>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO error_logs (image_id, error_type, error_message, error_time, url, stack_trace)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                image_id,
                error_type,
                error_message,
                Local::now().to_rfc3339(),
                url,
                stack_trace,
            ],
        )?;
        Ok(())
    }

    /// Fold one batch's outcome into the per-strategy counters.
    pub async fn record_strategy_use(
        &self,
        strategy: FetchStrategy,
        success: bool,
        images_returned: u64,
        new_images: u64,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO api_strategy_stats
                 (strategy, total_requests, successful_requests, total_images, new_images, last_used)
             VALUES (?1, 1, ?2, ?3, ?4, ?5)
             ON CONFLICT(strategy) DO UPDATE SET
                 total_requests = total_requests + 1,
                 successful_requests = successful_requests + ?2,
                 total_images = total_images + ?3,
                 new_images = new_images + ?4,
                 last_used = ?5",
            params![
                strategy.as_str(),
                if success { 1u64 } else { 0 },
                images_returned,
                new_images,
                Local::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn category_counters(&self) -> StoreResult<Vec<CategoryCount>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT category, category_slug, count FROM category_stats
             ORDER BY count DESC, category ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(CategoryCount {
                category: row.get(0)?,
                slug: row.get(1)?,
                count: row.get(2)?,
            })
        })?;

        let mut counters = Vec::new();
        for row in rows {
            counters.push(row?);
        }
        Ok(counters)
    }

    pub async fn strategy_stats(&self) -> StoreResult<Vec<StrategyStats>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT strategy, total_requests, successful_requests, total_images, new_images
             FROM api_strategy_stats ORDER BY strategy",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StrategyStats {
                strategy: row.get(0)?,
                total_requests: row.get(1)?,
                successful_requests: row.get(2)?,
                total_images: row.get(3)?,
                new_images: row.get(4)?,
            })
        })?;

        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }

    /// Counters for one date, zeros when no row exists yet.
    pub async fn daily_stats(&self, date: &str) -> StoreResult<DailyStats> {
        let conn = self.conn.lock().await;
        match conn.query_row(
            "SELECT total_downloaded, failed_downloads, total_file_size
             FROM download_stats WHERE date = ?1",
            params![date],
            |row| {
                Ok(DailyStats {
                    date: date.to_string(),
                    total_downloaded: row.get(0)?,
                    failed_downloads: row.get(1)?,
                    total_file_size: row.get(2)?,
                })
            },
        ) {
            Ok(stats) => Ok(stats),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(DailyStats {
                date: date.to_string(),
                total_downloaded: 0,
                failed_downloads: 0,
                total_file_size: 0,
            }),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    pub async fn totals(&self) -> StoreResult<StoreTotals> {
        let conn = self.conn.lock().await;
        let images: u64 = conn.query_row("SELECT COUNT(*) FROM images", [], |row| row.get(0))?;
        let total_file_size: u64 = conn.query_row(
            "SELECT COALESCE(SUM(file_size), 0) FROM images",
            [],
            |row| row.get(0),
        )?;
        Ok(StoreTotals {
            images,
            total_file_size,
        })
    }

    /// Drop the tag table so tests can force a persistence failure after
    /// the images insert has already succeeded.
    #[cfg(test)]
    pub(crate) async fn break_tag_table(&self) {
        let conn = self.conn.lock().await;
        conn.execute("DROP TABLE image_tags", []).unwrap();
    }
}

/// Ensure every known category has a stats row so startup summaries list
/// them all, including those with zero downloads.
fn seed_category_stats(conn: &Connection, categories: &CategoryTable) -> StoreResult<()> {
    let now = Local::now().to_rfc3339();

    for category in categories.iter() {
        conn.execute(
            "INSERT OR IGNORE INTO category_stats (category, category_slug, count, last_updated)
             VALUES (?1, ?2, 0, ?3)",
            params![category.name, category.slug, now],
        )?;
    }

    let fallback = categories.fallback();
    conn.execute(
        "INSERT OR IGNORE INTO category_stats (category, category_slug, count, last_updated)
         VALUES (?1, ?2, 0, ?3)",
        params![fallback.name, fallback.slug, now],
    )?;

    Ok(())
}

#[cfg(unix)]
fn relax_directory_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(dir) {
        Ok(metadata) => metadata,
        Err(_) => return,
    };

    if metadata.permissions().mode() & 0o200 == 0 {
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o755);
        match std::fs::set_permissions(dir, permissions) {
            Ok(()) => info!("Relaxed permissions on {}", dir.display()),
            Err(e) => warn!("Failed to relax permissions on {}: {}", dir.display(), e),
        }
    }
}

#[cfg(not(unix))]
fn relax_directory_permissions(_dir: &Path) {}
