//! Shared test utilities.

use std::sync::Arc;
use std::time::Duration;

use folio_server::config::{Config, DeletionPolicy};
use folio_server::db::{create_pool, SqliteCatalog};
use folio_server::ingest::{IngestPipeline, IngestRequest, IngestSettings, StagingArea};
use folio_server::retrieval::RetrievalAssembler;
use folio_server::state::AppState;
use folio_server::storage::{FileRecord, LocalBlobStorage, Reclaimer};
use tempfile::TempDir;

pub const MIB: usize = 1024 * 1024;

/// Storage engine wired to a temporary directory.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub blobs: LocalBlobStorage,
    pub catalog: SqliteCatalog,
    pub pipeline: IngestPipeline,
    pub assembler: RetrievalAssembler,
    pub reclaimer: Reclaimer,
    temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn new(chunk_size: usize, policy: DeletionPolicy) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let blobs = LocalBlobStorage::open(temp_dir.path().join("blobs"))
            .await
            .expect("Failed to open blob store");
        let url = format!("sqlite:{}", temp_dir.path().join("folio.db").display());
        let catalog = SqliteCatalog::new(create_pool(&url).await.expect("Failed to open catalog"));
        let staging = StagingArea::open(temp_dir.path().join("staging"))
            .await
            .expect("Failed to open staging area");

        let pipeline = IngestPipeline::new(
            Arc::new(blobs.clone()),
            Arc::new(catalog.clone()),
            staging,
            IngestSettings {
                chunk_size,
                max_file_size: 64 * MIB as u64,
                concurrency: 4,
            },
        );
        let assembler = RetrievalAssembler::new(Arc::new(blobs.clone()), Arc::new(catalog.clone()), true);
        // No grace period: tests delete files right after ingesting them
        let reclaimer = Reclaimer::new(
            Arc::new(blobs.clone()),
            Arc::new(catalog.clone()),
            policy,
            Duration::ZERO,
        );

        Self {
            blobs,
            catalog,
            pipeline,
            assembler,
            reclaimer,
            temp_dir,
        }
    }

    /// Ingest `data` through the staging area, as an upload would
    pub async fn ingest(&self, file_name: &str, data: &[u8]) -> FileRecord {
        let parts: Vec<Result<Vec<u8>, std::io::Error>> =
            data.chunks(64 * 1024).map(|c| Ok(c.to_vec())).collect();
        self.pipeline
            .ingest_stream(futures::stream::iter(parts), request(file_name))
            .await
            .expect("Ingestion failed")
    }

    pub fn staging_is_empty(&self) -> bool {
        std::fs::read_dir(self.temp_dir.path().join("staging"))
            .expect("Failed to read staging directory")
            .next()
            .is_none()
    }
}

#[allow(dead_code)]
pub fn request(file_name: &str) -> IngestRequest {
    IngestRequest {
        file_name: file_name.to_string(),
        uploaded_by: "librarian".to_string(),
        declared_size: None,
        book_id: None,
    }
}

/// Deterministic, non-repeating test payload
#[allow(dead_code)]
pub fn test_data(len: usize, seed: u8) -> Vec<u8> {
    let mut state = 0x9E37_79B9u32 ^ (seed as u32).wrapping_mul(0x85EB_CA6B);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Full application state rooted in a temporary directory
#[allow(dead_code)]
pub async fn test_app_state(chunk_size: usize, policy: DeletionPolicy) -> (TempDir, AppState) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

    let mut config = Config::default();
    config.storage.root = temp_dir.path().join("blobs");
    config.storage.staging_dir = temp_dir.path().join("staging");
    config.storage.chunk_size = chunk_size;
    config.storage.deletion_policy = policy;
    config.storage.orphan_min_age_secs = 0;
    config.database.url = format!("sqlite:{}", temp_dir.path().join("folio.db").display());

    let pool = create_pool(&config.database.url)
        .await
        .expect("Failed to open catalog");
    let state = AppState::new(config, pool)
        .await
        .expect("Failed to create app state");

    (temp_dir, state)
}
