//! Orchestration loop for continuous harvesting
//!
//! This module drives the whole pipeline:
//! 1. Rotates fetch strategies batch by batch
//! 2. Filters, classifies, downloads, and persists each record in order
//! 3. Applies cooldowns when fetch errors or stagnation accumulate
//! 4. Honors shutdown signals between batches and between items

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::harvester::api_client::{
    random_orientation, FetchClient, FetchRequest, FetchedBatch, PhotoRecord,
};
use crate::harvester::categorizer::Categorizer;
use crate::harvester::config_loader::AppConfig;
use crate::harvester::database::{today, Database, NewImage};
use crate::harvester::download_engine::Downloader;
use crate::harvester::error::{HarvestError, HarvestResult};
use crate::harvester::quality_filter::QualityFilter;
use crate::harvester::strategy::{FetchStrategy, KeywordPool, StrategyRotator};

/// Tunables for the harvest loop, in resolved form.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub batch_size: u32,
    pub batch_interval: Duration,
    pub item_interval: Duration,
    pub error_threshold: u32,
    pub error_cooldown: Duration,
    pub stagnation_threshold: u32,
    pub stagnation_cooldown: Duration,
    pub keywords: Vec<String>,
    pub download_directory: PathBuf,
    pub collections: Vec<u64>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.harvest.batch_size,
            batch_interval: Duration::from_secs(config.harvest.batch_interval_secs),
            item_interval: Duration::from_secs(config.harvest.item_interval_secs),
            error_threshold: config.harvest.error_threshold,
            error_cooldown: Duration::from_secs(config.harvest.error_cooldown_secs),
            stagnation_threshold: config.harvest.stagnation_threshold,
            stagnation_cooldown: Duration::from_secs(config.harvest.stagnation_cooldown_secs),
            keywords: config.harvest.keywords.clone(),
            download_directory: PathBuf::from(&config.storage.download_directory),
            collections: config.api.collections.clone(),
        }
    }
}

/// Mutable loop state, threaded through every iteration.
pub struct OrchestrationState {
    pub consecutive_errors: u32,
    pub consecutive_duplicates: u32,
    pub rotator: StrategyRotator,
    pub keyword_pool: KeywordPool,
}

impl OrchestrationState {
    pub fn new(keywords: Vec<String>) -> Self {
        Self {
            consecutive_errors: 0,
            consecutive_duplicates: 0,
            rotator: StrategyRotator::new(),
            keyword_pool: KeywordPool::new(keywords),
        }
    }
}

/// What one iteration did, for logging and for tests.
#[derive(Debug)]
pub struct IterationReport {
    pub strategy: FetchStrategy,
    pub fetched: usize,
    pub filtered_out: usize,
    pub duplicates: usize,
    pub new_images: usize,
    pub failed: usize,
    pub cooldown: Option<Duration>,
    pub forced_advance: bool,
    pub interrupted: bool,
}

impl IterationReport {
    fn new(strategy: FetchStrategy) -> Self {
        Self {
            strategy,
            fetched: 0,
            filtered_out: 0,
            duplicates: 0,
            new_images: 0,
            failed: 0,
            cooldown: None,
            forced_advance: false,
            interrupted: false,
        }
    }
}

/// The harvest loop over its collaborators. Records within a batch are
/// processed sequentially by a single worker.
pub struct Orchestrator<C, D> {
    client: C,
    downloader: D,
    database: Arc<Database>,
    categorizer: Categorizer,
    quality: QualityFilter,
    settings: OrchestratorSettings,
}

impl<C: FetchClient, D: Downloader> Orchestrator<C, D> {
    pub fn new(
        client: C,
        downloader: D,
        database: Arc<Database>,
        categorizer: Categorizer,
        quality: QualityFilter,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            client,
            downloader,
            database,
            categorizer,
            quality,
            settings,
        }
    }

    /// Run until a shutdown signal arrives.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("Harvest loop started");
        let mut state = OrchestrationState::new(self.settings.keywords.clone());

        loop {
            if shutdown_requested(&mut shutdown) {
                break;
            }

            let report = self.run_iteration(&mut state, &mut shutdown).await;

            match self.database.daily_stats(&today()).await {
                Ok(stats) => info!(
                    date = %stats.date,
                    downloaded = stats.total_downloaded,
                    failed = stats.failed_downloads,
                    bytes = stats.total_file_size,
                    "Daily progress"
                ),
                Err(e) => warn!("Failed to read daily stats: {}", e),
            }

            if report.interrupted {
                break;
            }

            if !self.pace(self.settings.batch_interval, &mut shutdown).await {
                break;
            }
        }

        info!("Harvest loop stopped");
    }

    /// Fetch and process one batch under the next strategy in rotation.
    pub async fn run_iteration(
        &self,
        state: &mut OrchestrationState,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> IterationReport {
        let strategy = state.rotator.next();
        let keyword = self.keyword_for(strategy, state);
        let mut report = IterationReport::new(strategy);

        let request = FetchRequest {
            strategy,
            query: keyword.clone(),
            collections: if strategy == FetchStrategy::Collections {
                self.settings.collections.clone()
            } else {
                Vec::new()
            },
            count: self.settings.batch_size,
            orientation: random_orientation(),
        };

        info!(
            strategy = %strategy,
            keyword = keyword.as_deref().unwrap_or(""),
            "Fetching batch"
        );

        let batch = match self.client.fetch_batch(&request).await {
            Ok(batch) => {
                state.consecutive_errors = 0;
                batch
            }
            Err(e) => {
                self.handle_fetch_failure(e.into(), strategy, state, shutdown, &mut report)
                    .await;
                return report;
            }
        };

        report.fetched = batch.records.len();

        for photo in &batch.records {
            if shutdown_requested(shutdown) {
                report.interrupted = true;
                break;
            }

            if !self.quality.accept(photo) {
                report.filtered_out += 1;
                debug!(
                    image_id = %photo.id,
                    width = photo.width,
                    height = photo.height,
                    likes = photo.likes,
                    "Rejected by quality filter"
                );
                continue;
            }

            match self.database.is_downloaded(&photo.id).await {
                Ok(true) => {
                    report.duplicates += 1;
                    debug!(image_id = %photo.id, "Already downloaded, skipping");
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    // A failed lookup must not drop the image
                    warn!(
                        image_id = %photo.id,
                        "Duplicate check failed, treating as new: {}", e
                    );
                }
            }

            match self
                .harvest_one(photo, &batch, strategy, keyword.as_deref())
                .await
            {
                Ok(()) => {
                    report.new_images += 1;
                    if !self.pace(self.settings.item_interval, shutdown).await {
                        report.interrupted = true;
                        break;
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    error!(image_id = %photo.id, "Failed to harvest image: {}", err);
                    if let Err(log_err) = self
                        .database
                        .log_error(
                            Some(&photo.id),
                            err.kind(),
                            &err.to_string(),
                            Some(&photo.urls.raw),
                            Some(&format!("{err:?}")),
                        )
                        .await
                    {
                        warn!("Failed to record error: {}", log_err);
                    }
                    if let Err(stat_err) = self.database.record_failed_download().await {
                        warn!("Failed to record failed download: {}", stat_err);
                    }
                }
            }
        }

        if let Err(e) = self
            .database
            .record_strategy_use(
                strategy,
                true,
                report.fetched as u64,
                report.new_images as u64,
            )
            .await
        {
            warn!("Failed to record strategy use: {}", e);
        }

        info!(
            strategy = %strategy,
            fetched = report.fetched,
            new = report.new_images,
            duplicates = report.duplicates,
            filtered = report.filtered_out,
            failed = report.failed,
            "Batch complete"
        );

        if report.interrupted {
            return report;
        }

        if report.new_images == 0 {
            state.consecutive_duplicates += 1;
            if state.consecutive_duplicates >= self.settings.stagnation_threshold {
                state.rotator.force_advance();
                state.consecutive_duplicates = 0;
                report.forced_advance = true;
                report.cooldown = Some(self.settings.stagnation_cooldown);
                warn!(
                    threshold = self.settings.stagnation_threshold,
                    "No new images in consecutive batches, advancing strategy and cooling down"
                );
                if !self.pace(self.settings.stagnation_cooldown, shutdown).await {
                    report.interrupted = true;
                }
            }
        } else {
            state.consecutive_duplicates = 0;
        }

        report
    }

    async fn handle_fetch_failure(
        &self,
        err: HarvestError,
        strategy: FetchStrategy,
        state: &mut OrchestrationState,
        shutdown: &mut broadcast::Receiver<()>,
        report: &mut IterationReport,
    ) {
        state.consecutive_errors += 1;
        warn!(
            strategy = %strategy,
            consecutive = state.consecutive_errors,
            "Batch fetch failed: {}", err
        );

        if let Err(log_err) = self
            .database
            .log_error(None, err.kind(), &err.to_string(), None, None)
            .await
        {
            warn!("Failed to record error: {}", log_err);
        }
        if let Err(stat_err) = self.database.record_strategy_use(strategy, false, 0, 0).await {
            warn!("Failed to record strategy use: {}", stat_err);
        }

        if state.consecutive_errors >= self.settings.error_threshold {
            warn!(
                threshold = self.settings.error_threshold,
                "Error threshold reached, cooling down"
            );
            state.consecutive_errors = 0;
            report.cooldown = Some(self.settings.error_cooldown);
            if !self.pace(self.settings.error_cooldown, shutdown).await {
                report.interrupted = true;
            }
        }
    }

    /// Download one record and persist its metadata. On a metadata failure
    /// the downloaded file is removed again so disk and store stay in step.
    #[instrument(skip(self, photo, batch, keyword), fields(image_id = %photo.id))]
    async fn harvest_one(
        &self,
        photo: &PhotoRecord,
        batch: &FetchedBatch,
        strategy: FetchStrategy,
        keyword: Option<&str>,
    ) -> HarvestResult<()> {
        let classification = self.categorizer.classify(photo, strategy, keyword);
        let dest_dir = self.settings.download_directory.join(&classification.name);
        let image_url = &photo.urls.raw;

        // Pre-transfer audit row carries the API round-trip time
        if let Err(e) = self
            .database
            .record_download_url(
                &photo.id,
                "raw_download",
                image_url,
                Some(200),
                batch.api_time_secs,
            )
            .await
        {
            warn!("Failed to record URL access: {}", e);
        }

        let downloaded = self
            .downloader
            .fetch_and_store(image_url, &dest_dir, &photo.id)
            .await?;

        if let Err(e) = self
            .database
            .record_download_url(
                &photo.id,
                "image_response",
                image_url,
                Some(downloaded.status),
                downloaded.transfer_secs,
            )
            .await
        {
            warn!("Failed to record URL access: {}", e);
        }

        let image = NewImage {
            photo,
            filename: &downloaded.file_name,
            classification: &classification,
            strategy,
            search_keyword: keyword,
            file_size: downloaded.byte_size,
            file_hash: &downloaded.content_hash,
            request_id: &batch.request_id,
        };

        if let Err(e) = self.database.persist_image(&image).await {
            let rolled_back = std::fs::remove_file(&downloaded.file_path).is_ok();
            error!(
                rolled_back,
                "Metadata commit failed, removing file: {}", e
            );
            return Err(HarvestError::Integrity {
                image_id: photo.id.clone(),
                rolled_back,
            });
        }

        info!(
            file = %downloaded.file_path.display(),
            category = %classification.name,
            confidence = classification.confidence,
            "Harvested image"
        );
        Ok(())
    }

    fn keyword_for(
        &self,
        strategy: FetchStrategy,
        state: &mut OrchestrationState,
    ) -> Option<String> {
        match strategy {
            FetchStrategy::Search => state.keyword_pool.next_keyword(),
            FetchStrategy::Category => self
                .categorizer
                .table()
                .random_category()
                .map(|category| category.slug.clone()),
            FetchStrategy::Collections | FetchStrategy::Random => None,
        }
    }

    /// Sleep, but wake early on shutdown. Returns false when the loop
    /// should stop.
    async fn pace(&self, duration: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
        if duration.is_zero() {
            return true;
        }

        tokio::select! {
            _ = sleep(duration) => true,
            _ = shutdown.recv() => {
                info!("Shutdown requested during pause");
                false
            }
        }
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(
        shutdown.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::Mutex;

    use tempfile::TempDir;

    use crate::harvester::api_client::{FetchError, FetchResult};
    use crate::harvester::categorizer::CategoryTable;
    use crate::harvester::config_loader::{CategoriesSection, QualityConfig};
    use crate::harvester::download_engine::{DownloadResult, Downloaded};

    struct ScriptedClient {
        batches: Mutex<VecDeque<FetchResult<Vec<PhotoRecord>>>>,
    }

    impl ScriptedClient {
        fn new(batches: Vec<FetchResult<Vec<PhotoRecord>>>) -> Self {
            Self {
                batches: Mutex::new(batches.into()),
            }
        }
    }

    impl FetchClient for ScriptedClient {
        async fn fetch_batch(&self, _request: &FetchRequest) -> FetchResult<FetchedBatch> {
            let next = self
                .batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()));
            next.map(|records| FetchedBatch {
                records,
                request_id: "testreq1".to_string(),
                api_time_secs: 0.01,
            })
        }
    }

    #[derive(Clone, Default)]
    struct MockDownloader {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Downloader for MockDownloader {
        async fn fetch_and_store(
            &self,
            _url: &str,
            dest_dir: &Path,
            image_id: &str,
        ) -> DownloadResult<Downloaded> {
            tokio::fs::create_dir_all(dest_dir).await?;
            let file_name = format!("test_{image_id}.jpg");
            let file_path = dest_dir.join(&file_name);
            tokio::fs::write(&file_path, b"jpegdata").await?;
            self.calls.lock().unwrap().push(image_id.to_string());

            Ok(Downloaded {
                file_path,
                file_name,
                byte_size: 8,
                content_hash: "deadbeef".to_string(),
                status: 200,
                transfer_secs: 0.05,
            })
        }
    }

    fn record(id: &str, width: u32, height: u32) -> PhotoRecord {
        serde_json::from_str(&format!(
            r#"{{
                "id": "{id}",
                "width": {width},
                "height": {height},
                "likes": 50,
                "urls": {{
                    "raw": "https://images.example/raw/{id}",
                    "full": "https://images.example/full/{id}",
                    "regular": "https://images.example/regular/{id}",
                    "small": "https://images.example/small/{id}",
                    "thumb": "https://images.example/thumb/{id}"
                }},
                "user": {{ "id": "u1", "name": "Test User", "username": "testuser" }},
                "tags": [{{ "title": "skyline" }}],
                "links": {{ "html": "https://unsplash.example/photos/{id}" }}
            }}"#
        ))
        .unwrap()
    }

    fn good(id: &str) -> PhotoRecord {
        record(id, 4000, 3000)
    }

    struct Harness {
        orchestrator: Orchestrator<ScriptedClient, MockDownloader>,
        database: Arc<Database>,
        downloads: Arc<Mutex<Vec<String>>>,
        image_dir: PathBuf,
        _dir: TempDir,
    }

    fn harness(batches: Vec<FetchResult<Vec<PhotoRecord>>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let image_dir = dir.path().join("images");

        let table = CategoryTable::from_config(&CategoriesSection::default());
        let database =
            Arc::new(Database::open(dir.path().join("test.db"), &table, true).unwrap());
        let downloader = MockDownloader::default();
        let downloads = downloader.calls.clone();

        let settings = OrchestratorSettings {
            batch_size: 10,
            batch_interval: Duration::ZERO,
            item_interval: Duration::ZERO,
            error_threshold: 5,
            error_cooldown: Duration::ZERO,
            stagnation_threshold: 5,
            stagnation_cooldown: Duration::ZERO,
            keywords: vec!["sunset".to_string(), "ocean".to_string()],
            download_directory: image_dir.clone(),
            collections: vec![317099],
        };

        let orchestrator = Orchestrator::new(
            ScriptedClient::new(batches),
            downloader,
            database.clone(),
            Categorizer::new(table),
            QualityFilter::new(&QualityConfig {
                min_width: 1920,
                min_height: 1080,
                min_likes: 0,
            }),
            settings,
        );

        Harness {
            orchestrator,
            database,
            downloads,
            image_dir,
            _dir: dir,
        }
    }

    fn count_files(dir: &Path) -> usize {
        let mut count = 0;
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                count += count_files(&path);
            } else {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn mixed_batch_downloads_only_new_acceptable_images() {
        let first: Vec<PhotoRecord> = (0..5).map(|i| good(&format!("old-{i}"))).collect();
        let mut second: Vec<PhotoRecord> = vec![
            record("small-0", 1200, 800),
            record("small-1", 1280, 720),
            record("small-2", 640, 480),
            good("old-0"),
            good("old-3"),
        ];
        second.extend((0..5).map(|i| good(&format!("new-{i}"))));

        let h = harness(vec![Ok(first), Ok(second)]);
        let (_tx, mut shutdown) = broadcast::channel(1);
        let mut state = OrchestrationState::new(vec!["sunset".to_string()]);

        let warmup = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;
        assert_eq!(warmup.new_images, 5);

        let report = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;

        assert_eq!(report.fetched, 10);
        assert_eq!(report.filtered_out, 3);
        assert_eq!(report.duplicates, 2);
        assert_eq!(report.new_images, 5);
        assert_eq!(report.failed, 0);
        assert!(report.cooldown.is_none());
        assert!(!report.forced_advance);
        assert_eq!(state.consecutive_duplicates, 0);

        {
            let calls = h.downloads.lock().unwrap();
            assert_eq!(calls.len(), 10);
            assert!(!calls.iter().any(|id| id.starts_with("small-")));
        }

        let stats = h.database.daily_stats(&today()).await.unwrap();
        assert_eq!(stats.total_downloaded, 10);
        assert_eq!(stats.failed_downloads, 0);
    }

    #[tokio::test]
    async fn duplicates_within_one_batch_are_downloaded_once() {
        let h = harness(vec![Ok(vec![good("dup-1"), good("dup-1")])]);
        let (_tx, mut shutdown) = broadcast::channel(1);
        let mut state = OrchestrationState::new(Vec::new());

        let report = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;

        assert_eq!(report.new_images, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(h.downloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stagnation_advances_the_rotation_and_cools_down() {
        let h = harness((0..5).map(|_| Ok(Vec::new())).collect());
        let (_tx, mut shutdown) = broadcast::channel(1);
        let mut state = OrchestrationState::new(Vec::new());

        for round in 0..4 {
            let report = h
                .orchestrator
                .run_iteration(&mut state, &mut shutdown)
                .await;
            assert!(!report.forced_advance, "advanced too early on round {round}");
            assert!(report.cooldown.is_none());
        }
        assert_eq!(state.consecutive_duplicates, 4);

        let fifth = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;
        assert!(fifth.forced_advance);
        assert!(fifth.cooldown.is_some());
        assert_eq!(state.consecutive_duplicates, 0);

        // Rotation so far: category, search, collections, random, category.
        // The forced advance skips search, so the next batch uses collections.
        let sixth = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;
        assert_eq!(sixth.strategy, FetchStrategy::Collections);
    }

    #[tokio::test]
    async fn repeated_fetch_failures_trigger_one_cooldown() {
        let batches = (0..5)
            .map(|_| Err(FetchError::Status { status: 500 }))
            .collect();
        let h = harness(batches);
        let (_tx, mut shutdown) = broadcast::channel(1);
        let mut state = OrchestrationState::new(Vec::new());

        for round in 0..4 {
            let report = h
                .orchestrator
                .run_iteration(&mut state, &mut shutdown)
                .await;
            assert!(report.cooldown.is_none(), "cooled down early on {round}");
        }
        assert_eq!(state.consecutive_errors, 4);

        let fifth = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;
        assert!(fifth.cooldown.is_some());
        assert_eq!(state.consecutive_errors, 0);

        let stats = h.database.strategy_stats().await.unwrap();
        let total: u64 = stats.iter().map(|s| s.total_requests).sum();
        let successful: u64 = stats.iter().map(|s| s.successful_requests).sum();
        assert_eq!(total, 5);
        assert_eq!(successful, 0);
    }

    #[tokio::test]
    async fn fetch_success_resets_the_error_streak() {
        let h = harness(vec![
            Err(FetchError::Status { status: 500 }),
            Err(FetchError::Status { status: 502 }),
            Ok(vec![good("fresh-1")]),
        ]);
        let (_tx, mut shutdown) = broadcast::channel(1);
        let mut state = OrchestrationState::new(Vec::new());

        for _ in 0..2 {
            h.orchestrator
                .run_iteration(&mut state, &mut shutdown)
                .await;
        }
        assert_eq!(state.consecutive_errors, 2);

        h.orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;
        assert_eq!(state.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn metadata_failure_removes_the_downloaded_file() {
        let h = harness(vec![Ok(vec![good("doomed-1")])]);
        h.database.break_tag_table().await;

        let (_tx, mut shutdown) = broadcast::channel(1);
        let mut state = OrchestrationState::new(Vec::new());

        let report = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;

        assert_eq!(report.new_images, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(h.downloads.lock().unwrap().len(), 1);

        assert!(!h.database.is_downloaded("doomed-1").await.unwrap());
        assert_eq!(count_files(&h.image_dir), 0);
        assert_eq!(
            h.database.daily_stats(&today()).await.unwrap().failed_downloads,
            1
        );
    }

    #[tokio::test]
    async fn shutdown_interrupts_before_the_next_item() {
        let h = harness(vec![Ok(vec![good("a-1"), good("a-2"), good("a-3")])]);
        let (tx, mut shutdown) = broadcast::channel(1);
        let mut state = OrchestrationState::new(Vec::new());

        tx.send(()).unwrap();
        let report = h
            .orchestrator
            .run_iteration(&mut state, &mut shutdown)
            .await;

        assert!(report.interrupted);
        assert_eq!(report.new_images, 0);
        assert!(h.downloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_an_already_signaled_shutdown() {
        let h = harness(Vec::new());
        let (tx, shutdown) = broadcast::channel(1);
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), h.orchestrator.run(shutdown))
            .await
            .expect("run did not stop");
    }
}
