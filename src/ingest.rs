//! Catalog → store ingestion as a cancellable background task.
//!
//! Two persistence policies, chosen explicitly by configuration:
//!
//! - [`IngestMode::Batch`]: every page is downloaded first, then all items
//!   are written in one transaction. A failed or cancelled run leaves the
//!   store exactly as it was.
//! - [`IngestMode::Streaming`]: each page is written in its own transaction
//!   as soon as it arrives. A failed or cancelled run keeps the pages already
//!   committed; nothing from the failing page onward is written.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::{normalize_page, CatalogClient, FetchError, Progress};
use crate::storage::{Database, NewItem, StorageError};

/// Capacity of the progress channel; a slow consumer back-pressures the task.
const EVENT_BUFFER: usize = 32;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("Update cancelled")]
    Cancelled,
    /// The background task panicked or was aborted
    #[error("Update task failed: {0}")]
    Task(String),
}

/// When downloaded items are written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// One transaction after the full download
    #[default]
    Batch,
    /// One transaction per page
    Streaming,
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IngestMode::Batch => "batch",
            IngestMode::Streaming => "streaming",
        })
    }
}

impl FromStr for IngestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "batch" => Ok(IngestMode::Batch),
            "streaming" | "stream" => Ok(IngestMode::Streaming),
            other => Err(format!("unknown ingest mode '{}' (expected batch or streaming)", other)),
        }
    }
}

/// Events emitted by a running ingestion, in order: one `Started`, one
/// `Progress` per page, then exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum IngestEvent {
    #[serde(rename_all = "camelCase")]
    Started { total_count: u64, total_pages: u64 },
    Progress(Progress),
    Completed { count: usize, skipped: usize },
    Failed { message: String },
    Cancelled,
}

impl IngestEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IngestEvent::Completed { .. } | IngestEvent::Failed { .. } | IngestEvent::Cancelled
        )
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestSummary {
    /// Items written to the store
    pub count: usize,
    /// Records dropped for lack of an id
    pub skipped: usize,
    pub pages: u64,
}

async fn emit(events: &mpsc::Sender<IngestEvent>, event: IngestEvent) {
    if events.send(event).await.is_err() {
        tracing::trace!("Ingest event dropped (receiver gone)");
    }
}

/// Download the catalog and write it to `db` according to `mode`.
///
/// Sends `Started` and per-page `Progress` events; the terminal event is the
/// caller's job (see [`spawn_ingest`]). Cancellation is observed while
/// waiting on the count request, each page fetch and the inter-page delay,
/// and before every write.
pub async fn run_ingest(
    db: &Database,
    catalog: &CatalogClient,
    mode: IngestMode,
    events: &mpsc::Sender<IngestEvent>,
    cancel: &CancellationToken,
) -> Result<IngestSummary, IngestError> {
    let mut download = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(IngestError::Cancelled),
        download = catalog.begin_download() => download?,
    };

    emit(
        events,
        IngestEvent::Started {
            total_count: download.total_count(),
            total_pages: download.total_pages(),
        },
    )
    .await;

    let mut summary = IngestSummary::default();
    let mut pending: Vec<NewItem> = Vec::new();

    loop {
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
            page = download.next_page() => page?,
        };
        let Some(page) = page else { break };

        let normalized = normalize_page(&page.records);
        summary.skipped += normalized.skipped;
        summary.pages = page.page;

        match mode {
            IngestMode::Batch => pending.extend(normalized.items),
            IngestMode::Streaming => {
                if cancel.is_cancelled() {
                    return Err(IngestError::Cancelled);
                }
                summary.count += db.bulk_upsert_items(&normalized.items).await?;
            }
        }

        emit(events, IngestEvent::Progress(page.progress())).await;
    }

    if mode == IngestMode::Batch {
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        summary.count = db.bulk_upsert_items(&pending).await?;
    }

    tracing::info!(
        mode = %mode,
        count = summary.count,
        skipped = summary.skipped,
        pages = summary.pages,
        "Catalog ingestion completed"
    );
    Ok(summary)
}

// ============================================================================
// Background Task
// ============================================================================

/// A running ingestion.
///
/// Drain [`IngestHandle::next_event`] until a terminal event arrives, or call
/// [`IngestHandle::wait`] to ignore progress and just await the result.
pub struct IngestHandle {
    events: mpsc::Receiver<IngestEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Result<IngestSummary, IngestError>>,
}

impl IngestHandle {
    /// Next event, or `None` once the task has finished and the channel is drained.
    pub async fn next_event(&mut self) -> Option<IngestEvent> {
        self.events.recv().await
    }

    /// Request cancellation. The task stops at its next cancellation point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this run, e.g. for a Ctrl-C handler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the task to finish, discarding any undelivered events.
    pub async fn wait(self) -> Result<IngestSummary, IngestError> {
        drop(self.events);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(IngestError::Task(e.to_string())),
        }
    }
}

/// Spawn [`run_ingest`] on the runtime and report its terminal event.
///
/// `gate` is held for the whole run so that only one ingestion can be in
/// flight per gate.
pub fn spawn_ingest(
    db: Database,
    catalog: Arc<CatalogClient>,
    mode: IngestMode,
    gate: OwnedMutexGuard<()>,
) -> IngestHandle {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let task = tokio::spawn(async move {
        let _gate = gate;
        let result = run_ingest(&db, &catalog, mode, &tx, &token).await;

        let terminal = match &result {
            Ok(summary) => IngestEvent::Completed {
                count: summary.count,
                skipped: summary.skipped,
            },
            Err(IngestError::Cancelled) => {
                tracing::info!(mode = %mode, "Catalog ingestion cancelled");
                IngestEvent::Cancelled
            }
            Err(e) => {
                tracing::warn!(mode = %mode, error = %e, "Catalog ingestion failed");
                IngestEvent::Failed {
                    message: e.to_string(),
                }
            }
        };
        emit(&tx, terminal).await;
        result
    });

    IngestHandle {
        events: rx,
        cancel,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogSettings;
    use crate::storage::SearchFilters;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Catalog of five records served two per page; page 3 (record 5) can be
    /// made to fail.
    async fn catalog_server(fail_last_page: bool) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("recordcountperpage", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "TOTAL_COUNT": "5" })))
            .mount(&server)
            .await;

        for (first, ids) in [("1", vec!["1", "2"]), ("3", vec!["3", "4"])] {
            let items: Vec<_> = ids
                .iter()
                .map(|id| json!({ "IDX": id, "NAME": format!("Item {}", id) }))
                .collect();
            Mock::given(method("GET"))
                .and(query_param("firstindex", first))
                .and(query_param("recordcountperpage", "2"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": items })))
                .mount(&server)
                .await;
        }

        let last = if fail_last_page {
            ResponseTemplate::new(404)
        } else {
            ResponseTemplate::new(200).set_body_json(json!({
                "items": [{ "IDX": "5", "NAME": "Item 5" }, { "NAME": "no id" }]
            }))
        };
        Mock::given(method("GET"))
            .and(query_param("firstindex", "5"))
            .and(query_param("recordcountperpage", "2"))
            .respond_with(last)
            .mount(&server)
            .await;

        server
    }

    fn client(server: &MockServer, page_delay: Duration) -> CatalogClient {
        CatalogClient::new(CatalogSettings {
            base_url: format!("{}/kor/openapi.do", server.uri()),
            page_size: 2,
            page_delay,
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        })
        .unwrap()
    }

    async fn run(
        db: &Database,
        catalog: &CatalogClient,
        mode: IngestMode,
    ) -> (Result<IngestSummary, IngestError>, Vec<IngestEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let result = run_ingest(db, catalog, mode, &tx, &CancellationToken::new()).await;
        drop(tx);
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (result, events)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("batch".parse::<IngestMode>().unwrap(), IngestMode::Batch);
        assert_eq!("Streaming".parse::<IngestMode>().unwrap(), IngestMode::Streaming);
        assert!("sometimes".parse::<IngestMode>().is_err());
        assert_eq!(IngestMode::default(), IngestMode::Batch);
    }

    #[tokio::test]
    async fn test_batch_ingest_writes_everything() {
        let server = catalog_server(false).await;
        let db = Database::open(":memory:").await.unwrap();
        let catalog = client(&server, Duration::from_millis(1));

        let (result, events) = run(&db, &catalog, IngestMode::Batch).await;
        let summary = result.unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.pages, 3);

        assert_eq!(
            events[0],
            IngestEvent::Started {
                total_count: 5,
                total_pages: 3
            }
        );
        let percents: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                IngestEvent::Progress(p) => Some(p.percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, vec![33, 66, 100]);

        assert_eq!(db.item_count().await.unwrap(), 5);
        assert!(db.check_index_consistency().await.unwrap().is_consistent);
    }

    #[tokio::test]
    async fn test_batch_failure_leaves_store_untouched() {
        let server = catalog_server(true).await;
        let db = Database::open(":memory:").await.unwrap();
        db.upsert_item(&NewItem {
            id: "existing".into(),
            name: "Dolmen".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let catalog = client(&server, Duration::from_millis(1));

        let (result, _) = run(&db, &catalog, IngestMode::Batch).await;
        assert!(matches!(
            result,
            Err(IngestError::Fetch(FetchError::HttpStatus(404)))
        ));

        let all = db.search_items("", &SearchFilters::default()).await.unwrap();
        let ids: Vec<_> = all.iter().map(|i| i.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["existing"]);
    }

    #[tokio::test]
    async fn test_streaming_failure_keeps_committed_pages() {
        let server = catalog_server(true).await;
        let db = Database::open(":memory:").await.unwrap();
        let catalog = client(&server, Duration::from_millis(1));

        let (result, events) = run(&db, &catalog, IngestMode::Streaming).await;
        assert!(matches!(result, Err(IngestError::Fetch(_))));

        // Pages 1 and 2 committed before page 3 failed
        assert_eq!(db.item_count().await.unwrap(), 4);
        assert!(db.get_item_by_id("5").await.is_err());
        let progress_events = events
            .iter()
            .filter(|e| matches!(e, IngestEvent::Progress(_)))
            .count();
        assert_eq!(progress_events, 2);
    }

    #[tokio::test]
    async fn test_streaming_success() {
        let server = catalog_server(false).await;
        let db = Database::open(":memory:").await.unwrap();
        let catalog = client(&server, Duration::from_millis(1));

        let (result, _) = run(&db, &catalog, IngestMode::Streaming).await;
        assert_eq!(result.unwrap().count, 5);
        assert_eq!(db.item_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cancel_before_start_writes_nothing() {
        let server = catalog_server(false).await;
        let db = Database::open(":memory:").await.unwrap();
        let catalog = client(&server, Duration::from_millis(1));

        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_ingest(&db, &catalog, IngestMode::Batch, &tx, &cancel).await;
        assert!(matches!(result, Err(IngestError::Cancelled)));
        assert_eq!(db.item_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawned_streaming_cancel_during_page_delay() {
        let server = catalog_server(false).await;
        let db = Database::open(":memory:").await.unwrap();
        let catalog = Arc::new(client(&server, Duration::from_secs(30)));
        let gate = Arc::new(tokio::sync::Mutex::new(()));
        let guard = gate.clone().try_lock_owned().unwrap();

        let mut handle = spawn_ingest(db.clone(), catalog, IngestMode::Streaming, guard);

        // Page 1 is committed before its progress event is sent
        loop {
            match handle.next_event().await.unwrap() {
                IngestEvent::Progress(p) if p.page == 1 => break,
                _ => {}
            }
        }
        assert!(gate.try_lock().is_err());
        handle.cancel();

        let mut terminal = None;
        while let Some(event) = handle.next_event().await {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        assert_eq!(terminal, Some(IngestEvent::Cancelled));
        assert!(matches!(handle.wait().await, Err(IngestError::Cancelled)));

        assert_eq!(db.item_count().await.unwrap(), 2);
        assert!(gate.try_lock().is_ok());
    }

    #[tokio::test]
    async fn test_spawned_empty_catalog_reports_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "TOTAL_COUNT": 0 })))
            .mount(&server)
            .await;
        let db = Database::open(":memory:").await.unwrap();
        let catalog = Arc::new(client(&server, Duration::from_millis(1)));
        let gate = Arc::new(tokio::sync::Mutex::new(()));

        let mut handle = spawn_ingest(
            db,
            catalog,
            IngestMode::Batch,
            gate.try_lock_owned().unwrap(),
        );
        match handle.next_event().await {
            Some(IngestEvent::Failed { message }) => assert!(message.contains("no records")),
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(matches!(
            handle.wait().await,
            Err(IngestError::Fetch(FetchError::EmptyCatalog))
        ));
    }
}
