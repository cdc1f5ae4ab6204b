use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors with user-friendly messages
#[derive(Debug, Error)]
pub enum StorageError {
    /// The store could not be created or opened (unwritable location, corrupt file).
    /// Fatal: the application cannot persist anything without it.
    #[error("Failed to initialize dictionary store: {0}")]
    Init(String),

    /// Another process holds the database lock
    #[error("Another instance of archdict appears to be using the database. Please close it and try again.")]
    Locked,

    /// No dictionary item with the requested id
    #[error("Dictionary item not found: {0}")]
    NotFound(String),

    /// Operation attempted after `Database::close`
    #[error("Dictionary store is closed")]
    Closed,

    /// Search text rejected before reaching FTS5
    #[error("Invalid search query: {0}")]
    InvalidQuery(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => StorageError::Closed,
            other => StorageError::Database(other),
        }
    }
}

impl StorageError {
    /// Classify an error raised while opening or migrating the store.
    ///
    /// SQLITE_BUSY / SQLITE_LOCKED mean another process has the file;
    /// everything else (SQLITE_CANTOPEN, SQLITE_NOTADB, I/O) is an init failure.
    pub(crate) fn from_open(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
        {
            return StorageError::Locked;
        }

        StorageError::Init(err.to_string())
    }
}

// ============================================================================
// Search Index Consistency Report
// ============================================================================

/// Consistency of `items_fts` relative to `dictionary_items`.
#[derive(Debug)]
pub struct IndexConsistencyReport {
    /// Number of rows in dictionary_items
    pub items_count: i64,
    /// Number of rows in items_fts
    pub index_count: i64,
    /// Index rows with no corresponding item
    pub orphaned_entries: i64,
    /// Items with no index row
    pub missing_entries: i64,
    /// True if counts match and there are no orphans or missing rows
    pub is_consistent: bool,
}

// ============================================================================
// Domain Enums
// ============================================================================

/// Dictionary section an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DictionaryType {
    /// Archaeological site
    Site,
    /// Terminology entry
    Term,
}

impl DictionaryType {
    pub fn as_str(self) -> &'static str {
        match self {
            DictionaryType::Site => "site",
            DictionaryType::Term => "term",
        }
    }
}

impl fmt::Display for DictionaryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when text does not name a dictionary type.
#[derive(Debug, Error)]
#[error("Unknown dictionary type: {0}")]
pub struct UnknownDictionaryType(pub String);

impl FromStr for DictionaryType {
    type Err = UnknownDictionaryType;

    /// Accepts the canonical names (any case) and the catalog's Korean labels.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "site" | "유적" => Ok(DictionaryType::Site),
            "term" | "용어" => Ok(DictionaryType::Term),
            _ => Err(UnknownDictionaryType(trimmed.to_owned())),
        }
    }
}

/// Ordering for listings (empty query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOption {
    /// Name, case-insensitive
    #[default]
    Name,
    /// `last_viewed`; never-viewed items always sort last
    Recent,
    /// `view_count`
    Count,
}

impl SortOption {
    /// Direction used when the caller does not specify one.
    pub fn default_direction(self) -> SortDirection {
        match self {
            SortOption::Name => SortDirection::Asc,
            SortOption::Recent | SortOption::Count => SortDirection::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

// ============================================================================
// Query Parameters
// ============================================================================

/// Default page size for `search_items`.
pub const DEFAULT_SEARCH_LIMIT: i64 = 100;

/// Structured filters for `Database::search_items`. All filters AND together.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    /// `type_code` equality (category)
    pub type_code: Option<String>,
    /// `dictionary_type` equality
    pub dictionary_type: Option<DictionaryType>,
    /// Only items whose annotation has `is_bookmarked = 1`
    pub bookmarked_only: bool,
    pub limit: i64,
    pub offset: i64,
    /// Ignored when the query text is non-empty (relevance ranking applies)
    pub sort: SortOption,
    /// `None` uses `sort.default_direction()`
    pub direction: Option<SortDirection>,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            type_code: None,
            dictionary_type: None,
            bookmarked_only: false,
            limit: DEFAULT_SEARCH_LIMIT,
            offset: 0,
            sort: SortOption::Name,
            direction: None,
        }
    }
}

// ============================================================================
// Ingestion Input
// ============================================================================

/// A normalized catalog record ready for upsert.
///
/// Optional fields stay `None` when the catalog did not supply them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewItem {
    pub id: String,
    pub name: String,
    pub content: Option<String>,
    pub reference: Option<String>,
    pub dictionary_type: Option<DictionaryType>,
    pub type_code: Option<String>,
    pub type_name: Option<String>,
    pub copyright: Option<String>,
    pub data_link: Option<String>,
}

// ============================================================================
// Data Structures
// ============================================================================

/// Catalog record as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DictionaryItem {
    pub id: String,
    pub name: String,
    pub content: Option<String>,
    pub reference: Option<String>,
    pub dictionary_type: Option<DictionaryType>,
    pub type_code: Option<String>,
    pub type_name: Option<String>,
    pub copyright: Option<String>,
    pub data_link: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-item user state. `Default` is the state of an item never touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub is_bookmarked: bool,
    pub note: Option<String>,
    pub last_viewed: Option<DateTime<Utc>>,
    pub view_count: i64,
}

/// A dictionary item joined with its annotation; the unit every read returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    #[serde(flatten)]
    pub entry: DictionaryItem,
    #[serde(flatten)]
    pub annotation: Annotation,
    /// Name with matched terms wrapped in [`HIGHLIGHT_OPEN`]/[`HIGHLIGHT_CLOSE`].
    /// Set only by free-text searches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_highlight: Option<String>,
    /// Excerpt of the content around the matched terms, marked the same way.
    /// `None` for listings and for items without content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_highlight: Option<String>,
}

/// Markers around matched terms in [`Item::name_highlight`] and
/// [`Item::content_highlight`].
pub const HIGHLIGHT_OPEN: &str = "<mark>";
pub const HIGHLIGHT_CLOSE: &str = "</mark>";

/// A `(type_code, type_name)` pair present in the store, with its item count.
///
/// Items without a category are grouped under `id: None`, so the counts
/// always add up to the number of stored items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Category {
    pub id: Option<String>,
    pub name: Option<String>,
    pub count: i64,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for joined item queries (used by sqlx FromRow).
///
/// Annotation columns are COALESCEd in SQL so items without an annotation
/// row decode with defaults.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: String,
    pub name: String,
    pub content: Option<String>,
    pub reference: Option<String>,
    pub dictionary_type: Option<String>,
    pub type_code: Option<String>,
    pub type_name: Option<String>,
    pub copyright: Option<String>,
    pub data_link: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_bookmarked: bool,
    pub note: Option<String>,
    pub last_viewed: Option<i64>,
    pub view_count: i64,
    /// Only selected by free-text searches
    #[sqlx(default)]
    pub name_highlight: Option<String>,
    #[sqlx(default)]
    pub content_highlight: Option<String>,
}

impl ItemDbRow {
    pub(crate) fn into_item(self) -> Item {
        let dictionary_type = self.dictionary_type.as_deref().and_then(|raw| {
            raw.parse::<DictionaryType>()
                .map_err(|e| {
                    tracing::debug!(
                        id = %self.id,
                        error = %e,
                        "Stored dictionary type not recognized"
                    );
                })
                .ok()
        });

        Item {
            entry: DictionaryItem {
                id: self.id,
                name: self.name,
                content: self.content,
                reference: self.reference,
                dictionary_type,
                type_code: self.type_code,
                type_name: self.type_name,
                copyright: self.copyright,
                data_link: self.data_link,
                created_at: from_millis(self.created_at),
                updated_at: from_millis(self.updated_at),
            },
            annotation: Annotation {
                is_bookmarked: self.is_bookmarked,
                note: self.note,
                last_viewed: self.last_viewed.map(from_millis),
                view_count: self.view_count,
            },
            name_highlight: self.name_highlight,
            content_highlight: self.content_highlight,
        }
    }
}

/// Current time in the store's timestamp unit (ms since epoch).
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
