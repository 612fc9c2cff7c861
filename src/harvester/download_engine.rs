//! Streaming image download engine
//!
//! This module fetches image payloads and:
//! 1. Streams response bodies to disk without buffering them in memory
//! 2. Stages each transfer through a `.part` file so an interrupted or
//!    failed download never leaves a partial image in a category directory
//! 3. Computes a SHA-256 content hash of the completed file
//!
//! There is no retry loop here. A failed item is recorded and the next
//! scheduled batch is the retry vector.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use futures::stream::StreamExt;
use reqwest::{Client, Response};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Error types for image downloads
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error: status {status}")]
    Status { status: u16 },
}

/// Result type for download operations
pub type DownloadResult<T> = Result<T, DownloadError>;

/// A completed transfer with the facts the metadata writer records.
#[derive(Debug, Clone)]
pub struct Downloaded {
    pub file_path: PathBuf,
    pub file_name: String,
    pub byte_size: u64,
    pub content_hash: String,
    pub status: u16,
    pub transfer_secs: f64,
}

/// Transfer seam between the orchestration loop and the network.
pub trait Downloader {
    fn fetch_and_store(
        &self,
        url: &str,
        dest_dir: &Path,
        image_id: &str,
    ) -> impl Future<Output = DownloadResult<Downloaded>> + Send;
}

/// Download engine backed by a pooled HTTP client.
pub struct DownloadEngine {
    client: Client,
}

impl DownloadEngine {
    pub fn new(timeout_secs: u64) -> DownloadResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("unsplash_harvester/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .build()?;

        Ok(Self { client })
    }
}

impl Downloader for DownloadEngine {
    #[instrument(skip(self, url, dest_dir), fields(image_id = %image_id))]
    async fn fetch_and_store(
        &self,
        url: &str,
        dest_dir: &Path,
        image_id: &str,
    ) -> DownloadResult<Downloaded> {
        tokio::fs::create_dir_all(dest_dir).await?;

        let file_name = build_file_name(image_id);
        let file_path = dest_dir.join(&file_name);
        let temp_path = file_path.with_extension("jpg.part");

        let started = Instant::now();
        let response = self.client.get(url).send().await?;
        let status = response.status();

        if !status.is_success() {
            warn!(status = status.as_u16(), "Image request failed");
            return Err(DownloadError::Status {
                status: status.as_u16(),
            });
        }

        if let Err(e) = stream_to_file(response, &temp_path).await {
            // Never leave a partial file behind
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e);
        }

        tokio::fs::rename(&temp_path, &file_path).await?;
        let transfer_secs = started.elapsed().as_secs_f64();

        let byte_size = tokio::fs::metadata(&file_path).await?.len();
        let content_hash = match hash_file(&file_path) {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Failed to hash {}: {}", file_path.display(), e);
                String::new()
            }
        };

        debug!(
            file = %file_path.display(),
            bytes = byte_size,
            "Stored image"
        );

        Ok(Downloaded {
            file_path,
            file_name,
            byte_size,
            content_hash,
            status: status.as_u16(),
            transfer_secs,
        })
    }
}

/// Timestamped file name, unique per image within a second.
fn build_file_name(image_id: &str) -> String {
    format!("{}_{}.jpg", Local::now().format("%Y%m%d_%H%M%S"), image_id)
}

/// Stream a response body to a file
async fn stream_to_file(response: Response, file_path: &Path) -> DownloadResult<()> {
    let mut file = tokio::fs::File::create(file_path).await?;

    let mut stream = response.bytes_stream();
    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result?;
        file.write_all(&chunk).await?;
    }

    // Ensure all data is written to disk
    file.flush().await?;

    Ok(())
}

/// Memory-efficient SHA-256 hash calculation with memory mapping for large
/// files. Smaller files go through a heap-allocated read buffer.
pub(crate) fn hash_file(file_path: &Path) -> io::Result<String> {
    const LARGE_FILE_THRESHOLD: u64 = 32 * 1024 * 1024; // 32MB

    let file = File::open(file_path)?;
    let file_size = file.metadata()?.len();

    if file_size > LARGE_FILE_THRESHOLD {
        let mmap = unsafe { memmap2::Mmap::map(&file)? };

        let mut hasher = Sha256::new();
        hasher.update(&mmap[..]);

        Ok(hex::encode(hasher.finalize()))
    } else {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0; 1024 * 1024];
        let mut reader = &file;

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hashes_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.jpg");
        fs::write(&path, b"hello world").unwrap();

        let hash = hash_file(&path).unwrap();
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn hashes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.jpg");
        fs::write(&path, b"").unwrap();

        let hash = hash_file(&path).unwrap();
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn file_names_carry_timestamp_and_image_id() {
        let name = build_file_name("AbC-123_x");
        let stem = name.strip_suffix(".jpg").unwrap();

        let (timestamp, id) = stem.split_at(15);
        assert_eq!(&timestamp[8..9], "_");
        assert!(timestamp[..8].chars().all(|c| c.is_ascii_digit()));
        assert!(timestamp[9..].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(id, "_AbC-123_x");
    }
}
