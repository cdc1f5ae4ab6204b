//! The request/response interface a front end calls into.
//!
//! [`Library`] bundles the injected store and catalog handles with the
//! single-flight ingestion gate. It is cheap to clone; every clone shares
//! the same store, catalog client and gate.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::catalog::CatalogClient;
use crate::ingest::{spawn_ingest, IngestHandle, IngestMode};
use crate::query::{self, QueryError, SearchRequest};
use crate::storage::{Category, Database, Item, StorageError};

/// Default number of items returned by [`Library::get_recent_items`].
pub const DEFAULT_RECENT_LIMIT: i64 = 10;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Query(#[from] QueryError),
    /// A catalog update is already running
    #[error("A data update is already in progress")]
    UpdateInProgress,
}

#[derive(Clone)]
pub struct Library {
    db: Database,
    catalog: Arc<CatalogClient>,
    mode: IngestMode,
    recent_limit: i64,
    ingest_gate: Arc<Mutex<()>>,
}

impl Library {
    pub fn new(db: Database, catalog: Arc<CatalogClient>, mode: IngestMode) -> Self {
        Self {
            db,
            catalog,
            mode,
            recent_limit: DEFAULT_RECENT_LIMIT,
            ingest_gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_recent_limit(mut self, limit: i64) -> Self {
        self.recent_limit = limit;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn ingest_mode(&self) -> IngestMode {
        self.mode
    }

    /// Whether a catalog update is currently running.
    pub fn is_updating(&self) -> bool {
        self.ingest_gate.try_lock().is_err()
    }

    /// Storage failures surface as `LibraryError::Storage`, like every other
    /// call; only request validation errors are `LibraryError::Query`.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<Item>, LibraryError> {
        query::search(&self.db, request).await.map_err(|e| match e {
            QueryError::Storage(inner) => LibraryError::Storage(inner),
            other => LibraryError::Query(other),
        })
    }

    /// Item detail; counts as a view.
    pub async fn get_item_detail(&self, item_id: &str) -> Result<Item, LibraryError> {
        Ok(self.db.get_item_by_id(item_id).await?)
    }

    /// Start a catalog update in the background.
    ///
    /// # Errors
    ///
    /// `LibraryError::UpdateInProgress` if another update holds the gate.
    pub fn update_data(&self) -> Result<IngestHandle, LibraryError> {
        let gate = self
            .ingest_gate
            .clone()
            .try_lock_owned()
            .map_err(|_| LibraryError::UpdateInProgress)?;

        tracing::info!(mode = %self.mode, "Starting catalog update");
        Ok(spawn_ingest(
            self.db.clone(),
            Arc::clone(&self.catalog),
            self.mode,
            gate,
        ))
    }

    pub async fn toggle_bookmark(
        &self,
        item_id: &str,
        bookmarked: bool,
    ) -> Result<(), LibraryError> {
        Ok(self.db.toggle_bookmark(item_id, bookmarked).await?)
    }

    pub async fn save_note(&self, item_id: &str, text: &str) -> Result<(), LibraryError> {
        Ok(self.db.save_note(item_id, text).await?)
    }

    pub async fn get_categories(&self) -> Result<Vec<Category>, LibraryError> {
        Ok(self.db.list_categories().await?)
    }

    pub async fn get_category_items(&self, category_id: &str) -> Result<Vec<Item>, LibraryError> {
        Ok(self.db.list_by_category(category_id).await?)
    }

    pub async fn get_bookmarked_items(&self) -> Result<Vec<Item>, LibraryError> {
        Ok(self.db.list_bookmarked().await?)
    }

    pub async fn get_recent_items(&self) -> Result<Vec<Item>, LibraryError> {
        Ok(self.db.list_recent(self.recent_limit).await?)
    }

    /// Every item with its annotation, for an external snapshot writer.
    pub async fn export_all(&self) -> Result<Vec<Item>, LibraryError> {
        Ok(self.db.export_all().await?)
    }

    /// Wipe items, annotations and the search index.
    ///
    /// Holds the ingestion gate for the duration so a reset can never
    /// interleave with an update.
    pub async fn reset_all_data(&self) -> Result<(), LibraryError> {
        let _gate = self
            .ingest_gate
            .try_lock()
            .map_err(|_| LibraryError::UpdateInProgress)?;
        Ok(self.db.reset().await?)
    }

    /// Close the store. Later calls on any clone fail with `StorageError::Closed`.
    pub async fn close(&self) {
        self.db.close().await;
    }
}
