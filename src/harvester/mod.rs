//! Harvester module for the Unsplash image harvester
//! Contains the orchestration loop, its collaborators, and the metadata store

pub mod api_client;
pub mod categorizer;
pub mod config_loader;
pub mod database;
pub mod download_engine;
pub mod error;
pub mod logger;
pub mod orchestrator;
pub mod quality_filter;
pub mod strategy;

// Re-export commonly used types for convenience
pub use config_loader::{AppConfig, ConfigError, ConfigManager, ConfigResult};

pub use error::{HarvestError, HarvestResult};

pub use api_client::{
    FetchClient, FetchError, FetchRequest, FetchResult, FetchedBatch, PhotoRecord,
    UnsplashClient,
};

pub use categorizer::{Categorizer, Category, CategoryTable, Classification};

pub use strategy::{FetchStrategy, KeywordPool, StrategyRotator};

pub use quality_filter::QualityFilter;

pub use download_engine::{DownloadEngine, DownloadError, DownloadResult, Downloaded, Downloader};

pub use database::{
    Database, DailyStats, NewImage, StoreError, StoreResult, StrategyStats,
};

pub use orchestrator::{
    IterationReport, OrchestrationState, Orchestrator, OrchestratorSettings,
};

pub use logger::init_tracing;
