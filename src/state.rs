//! Application state management

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::SqliteCatalog;
use crate::error::Result;
use crate::ingest::{IngestPipeline, IngestSettings, StagingArea};
use crate::retrieval::RetrievalAssembler;
use crate::storage::{BlobStorage, Catalog, LocalBlobStorage, Reclaimer};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    catalog: Arc<dyn Catalog>,
    pipeline: IngestPipeline,
    assembler: RetrievalAssembler,
    reclaimer: Reclaimer,
}

impl AppState {
    /// Create a new application state
    ///
    /// Opens the blob store and staging directories, creating them if needed.
    pub async fn new(config: Config, db: SqlitePool) -> Result<Self> {
        let storage = &config.storage;

        let blobs: Arc<dyn BlobStorage> = Arc::new(LocalBlobStorage::open(&storage.root).await?);
        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::new(db.clone()));
        let staging = StagingArea::open(&storage.staging_dir).await?;

        let pipeline = IngestPipeline::new(
            blobs.clone(),
            catalog.clone(),
            staging,
            IngestSettings::from(storage),
        );
        let assembler = RetrievalAssembler::new(blobs.clone(), catalog.clone(), storage.verify_on_read);
        let reclaimer = Reclaimer::new(
            blobs,
            catalog.clone(),
            storage.deletion_policy,
            Duration::from_secs(storage.orphan_min_age_secs),
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                catalog,
                pipeline,
                assembler,
                reclaimer,
            }),
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the file catalog
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.inner.catalog
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.inner.pipeline
    }

    pub fn assembler(&self) -> &RetrievalAssembler {
        &self.inner.assembler
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.inner.reclaimer
    }
}
