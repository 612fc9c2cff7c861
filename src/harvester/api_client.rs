//! Remote photo API client
//!
//! One endpoint matters here: the random-batch endpoint, parameterized by
//! count, orientation, and one of query/collections depending on the fetch
//! strategy. Authentication is a `Client-ID` header. Anything other than a 200
//! with a decodable body is a fetch failure; retrying is the next batch's job.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::harvester::config_loader::ApiConfig;
use crate::harvester::strategy::FetchStrategy;

/// Error types for batch fetches
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API returned status {status}")]
    Status { status: u16 },
}

/// Result type for fetch operations
pub type FetchResult<T> = Result<T, FetchError>;

/// One image record as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct PhotoRecord {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub alt_description: Option<String>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub likes: u32,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub urls: PhotoUrls,
    #[serde(default)]
    pub user: PhotoUser,
    #[serde(default)]
    pub tags: Vec<PhotoTag>,
    #[serde(default)]
    pub exif: Option<serde_json::Value>,
    #[serde(default)]
    pub location: Option<serde_json::Value>,
    #[serde(default)]
    pub links: PhotoLinks,
}

/// Candidate URLs by resolution tier. `raw` is the one worth storing bytes of.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoUrls {
    #[serde(default)]
    pub raw: String,
    #[serde(default)]
    pub full: String,
    #[serde(default)]
    pub regular: String,
    #[serde(default)]
    pub small: String,
    #[serde(default)]
    pub thumb: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoTag {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PhotoLinks {
    #[serde(default)]
    pub html: String,
}

impl PhotoRecord {
    /// Titles of all tags that carry one.
    pub fn tag_titles(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter_map(|tag| tag.title.clone())
            .collect()
    }

    /// Descriptive text, preferring the curated description over the
    /// generated alt text.
    pub fn description_text(&self) -> &str {
        match self.description.as_deref() {
            Some(text) if !text.is_empty() => text,
            _ => self.alt_description.as_deref().unwrap_or(""),
        }
    }
}

/// Image orientation filter accepted by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Orientation {
    Landscape,
    Portrait,
    Squarish,
}

impl Orientation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Landscape => "landscape",
            Orientation::Portrait => "portrait",
            Orientation::Squarish => "squarish",
        }
    }
}

/// Pick an orientation at random, including "no preference".
pub fn random_orientation() -> Option<Orientation> {
    const CHOICES: [Option<Orientation>; 4] = [
        Some(Orientation::Landscape),
        Some(Orientation::Portrait),
        Some(Orientation::Squarish),
        None,
    ];
    CHOICES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(None)
}

/// Parameters for one batch fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub strategy: FetchStrategy,
    /// Query term for the category and search strategies.
    pub query: Option<String>,
    /// Collection ids for the collections strategy.
    pub collections: Vec<u64>,
    pub count: u32,
    pub orientation: Option<Orientation>,
}

/// A successfully fetched batch with its request bookkeeping.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub records: Vec<PhotoRecord>,
    /// Short id stamped onto every record of the batch for the audit trail.
    pub request_id: String,
    pub api_time_secs: f64,
}

/// The remote-API seam. The production implementation talks HTTP; scenario
/// tests substitute a scripted one.
pub trait FetchClient {
    fn fetch_batch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = FetchResult<FetchedBatch>> + Send;
}

/// HTTP-backed client for the photo API.
pub struct UnsplashClient {
    client: Client,
    base_url: String,
    access_key: String,
}

impl UnsplashClient {
    pub fn new(config: &ApiConfig) -> FetchResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("unsplash_harvester/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()
            .map_err(FetchError::Transport)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            access_key: config.access_key.clone(),
        })
    }

    fn request_params(request: &FetchRequest) -> Vec<(&'static str, String)> {
        let mut params = vec![("count", request.count.to_string())];

        match request.strategy {
            FetchStrategy::Category | FetchStrategy::Search => {
                if let Some(query) = &request.query {
                    params.push(("query", query.clone()));
                }
            }
            FetchStrategy::Collections => {
                let ids = request
                    .collections
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                if !ids.is_empty() {
                    params.push(("collections", ids));
                }
            }
            FetchStrategy::Random => {}
        }

        if let Some(orientation) = request.orientation {
            params.push(("orientation", orientation.as_str().to_string()));
        }

        params
    }
}

impl FetchClient for UnsplashClient {
    async fn fetch_batch(&self, request: &FetchRequest) -> FetchResult<FetchedBatch> {
        let url = format!("{}/photos/random", self.base_url);
        let params = Self::request_params(request);

        let started = Instant::now();
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Client-ID {}", self.access_key))
            .header("Accept-Version", "v1")
            .query(&params)
            .send()
            .await?;
        let api_time_secs = started.elapsed().as_secs_f64();

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            warn!(
                status = status.as_u16(),
                body = %snippet,
                "API request failed"
            );
            return Err(FetchError::Status {
                status: status.as_u16(),
            });
        }

        let records = response.json::<Vec<PhotoRecord>>().await?;

        let mut request_id = Uuid::new_v4().simple().to_string();
        request_id.truncate(8);

        debug!(
            count = records.len(),
            request_id = %request_id,
            elapsed_secs = api_time_secs,
            "Fetched photo batch"
        );

        Ok(FetchedBatch {
            records,
            request_id,
            api_time_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_sparse_record() {
        let json = r#"{
            "id": "abc123",
            "width": 4000,
            "height": 3000,
            "urls": { "raw": "https://images.example/raw.jpg" },
            "tags": [
                { "title": "nature" },
                { "notitle": true },
                { "title": "mountain" }
            ]
        }"#;

        let record: PhotoRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(record.likes, 0);
        assert_eq!(record.urls.raw, "https://images.example/raw.jpg");
        assert_eq!(record.urls.full, "");
        assert_eq!(record.tag_titles(), vec!["nature", "mountain"]);
        assert_eq!(record.description_text(), "");
    }

    #[test]
    fn description_text_falls_back_to_alt() {
        let json = r#"{ "id": "x", "alt_description": "a red door" }"#;
        let record: PhotoRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.description_text(), "a red door");
    }

    #[test]
    fn orientation_draws_come_from_the_fixed_set() {
        let allowed = ["landscape", "portrait", "squarish", "none"];
        for _ in 0..100 {
            let drawn = random_orientation().map_or("none", |o| o.as_str());
            assert!(allowed.contains(&drawn));
        }
    }

    #[test]
    fn request_params_match_the_strategy() {
        let base = FetchRequest {
            strategy: FetchStrategy::Search,
            query: Some("sunset".to_string()),
            collections: vec![317_099, 1_053_828],
            count: 10,
            orientation: Some(Orientation::Landscape),
        };
        let params = UnsplashClient::request_params(&base);
        assert!(params.contains(&("count", "10".to_string())));
        assert!(params.contains(&("query", "sunset".to_string())));
        assert!(params.contains(&("orientation", "landscape".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "collections"));

        let collections = FetchRequest {
            strategy: FetchStrategy::Collections,
            query: None,
            ..base.clone()
        };
        let params = UnsplashClient::request_params(&collections);
        assert!(params.contains(&("collections", "317099,1053828".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "query"));

        let random = FetchRequest {
            strategy: FetchStrategy::Random,
            query: None,
            orientation: None,
            ..base
        };
        let params = UnsplashClient::request_params(&random);
        assert_eq!(params, vec![("count", "10".to_string())]);
    }
}
