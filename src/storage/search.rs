use sqlx::QueryBuilder;

use super::items::ITEM_SELECT;
use super::schema::Database;
use super::types::{
    IndexConsistencyReport, Item, ItemDbRow, SearchFilters, SortOption, StorageError,
    DEFAULT_SEARCH_LIMIT, HIGHLIGHT_CLOSE, HIGHLIGHT_OPEN,
};

// ============================================================================
// Query Validation
// ============================================================================

const MAX_QUERY_CHARS: usize = 256;
const MAX_QUERY_TERMS: usize = 8;

/// Maximum number of items returned from a single search page (OOM protection)
const MAX_SEARCH_LIMIT: i64 = 2000;

/// Tokens of context kept in a content excerpt.
const EXCERPT_TOKENS: u32 = 24;

/// Turn free text into an FTS5 expression: every whitespace-separated term is
/// quoted (so FTS5 operators in user input are inert) and prefix-matched.
///
/// Terms with no letters or digits are dropped since they cannot match a
/// token. Returns `Ok(None)` when nothing searchable remains.
fn build_match_expression(query: &str) -> Result<Option<String>, StorageError> {
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(StorageError::InvalidQuery(format!(
            "query exceeds maximum length of {} characters",
            MAX_QUERY_CHARS
        )));
    }

    let terms: Vec<&str> = query
        .split_whitespace()
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .collect();

    if terms.len() > MAX_QUERY_TERMS {
        return Err(StorageError::InvalidQuery(format!(
            "query contains too many terms (max {})",
            MAX_QUERY_TERMS
        )));
    }
    if terms.is_empty() {
        return Ok(None);
    }

    let expression = terms
        .iter()
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ");
    Ok(Some(expression))
}

impl Database {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Search or list items, joined with their annotations.
    ///
    /// An empty (or whitespace-only) `query` lists items matching `filters`
    /// in the requested sort order. Otherwise every term is prefix-matched
    /// against name, content, reference and type name, and results are ranked
    /// by relevance; `filters.sort` does not apply in that mode. Ranked
    /// results carry `name_highlight` and a `content_highlight` excerpt with
    /// the matched terms marked.
    ///
    /// Filters compose with AND. `limit` is capped at 2000 (non-positive
    /// values use the default of 100) and a negative `offset` counts as 0.
    ///
    /// # Errors
    ///
    /// `StorageError::InvalidQuery` for queries over 256 characters or with
    /// more than 8 terms.
    pub async fn search_items(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<Item>, StorageError> {
        let query = query.trim();
        let match_expression = if query.is_empty() {
            None
        } else {
            match build_match_expression(query)? {
                Some(expression) => Some(expression),
                // Only punctuation: nothing in the index can match
                None => return Ok(Vec::new()),
            }
        };

        let limit = if filters.limit <= 0 {
            DEFAULT_SEARCH_LIMIT
        } else {
            filters.limit.min(MAX_SEARCH_LIMIT)
        };
        let offset = filters.offset.max(0);

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(ITEM_SELECT);
        if match_expression.is_some() {
            // items_fts columns: 0 name, 1 content
            builder.push(format!(
                ", highlight(items_fts, 0, '{open}', '{close}') AS name_highlight, \
                 NULLIF(snippet(items_fts, 1, '{open}', '{close}', '...', {tokens}), '') AS content_highlight",
                open = HIGHLIGHT_OPEN,
                close = HIGHLIGHT_CLOSE,
                tokens = EXCERPT_TOKENS,
            ));
        }
        builder.push(" FROM dictionary_items i ");
        if match_expression.is_some() {
            builder.push("JOIN items_fts ON items_fts.rowid = i.rowid ");
        }
        builder.push("LEFT JOIN user_annotations ud ON ud.item_id = i.id WHERE 1 = 1");

        if let Some(expression) = &match_expression {
            builder.push(" AND items_fts MATCH ");
            builder.push_bind(expression.clone());
        }
        if let Some(type_code) = &filters.type_code {
            builder.push(" AND i.type_code = ");
            builder.push_bind(type_code.clone());
        }
        if let Some(dictionary_type) = filters.dictionary_type {
            builder.push(" AND i.dictionary_type = ");
            builder.push_bind(dictionary_type.as_str());
        }
        if filters.bookmarked_only {
            builder.push(" AND ud.is_bookmarked = 1");
        }

        if match_expression.is_some() {
            builder.push(" ORDER BY items_fts.rank, i.name COLLATE NOCASE, i.id");
        } else {
            let direction = filters
                .direction
                .unwrap_or_else(|| filters.sort.default_direction())
                .sql();
            match filters.sort {
                SortOption::Name => {
                    builder.push(format!(" ORDER BY i.name COLLATE NOCASE {}, i.id", direction));
                }
                SortOption::Recent => {
                    builder.push(format!(
                        " ORDER BY ud.last_viewed IS NULL, ud.last_viewed {}, i.name COLLATE NOCASE, i.id",
                        direction
                    ));
                }
                SortOption::Count => {
                    builder.push(format!(
                        " ORDER BY COALESCE(ud.view_count, 0) {}, i.name COLLATE NOCASE, i.id",
                        direction
                    ));
                }
            }
        }

        builder.push(" LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        tracing::debug!(
            query = %query,
            limit = limit,
            offset = offset,
            ranked = match_expression.is_some(),
            "search_items"
        );

        let rows = builder
            .build_query_as::<ItemDbRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    // ========================================================================
    // Search Index Maintenance
    // ========================================================================

    /// Compare `items_fts` against `dictionary_items`.
    ///
    /// Counts both tables and the index rows with no item (orphaned) and the
    /// items with no index row (missing).
    pub async fn check_index_consistency(&self) -> Result<IndexConsistencyReport, StorageError> {
        let (items_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dictionary_items")
            .fetch_one(&self.pool)
            .await?;

        let (index_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items_fts")
            .fetch_one(&self.pool)
            .await?;

        let (orphaned,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM items_fts LEFT JOIN dictionary_items i ON items_fts.rowid = i.rowid WHERE i.rowid IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let (missing,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM dictionary_items i LEFT JOIN items_fts ON i.rowid = items_fts.rowid WHERE items_fts.rowid IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let is_consistent = orphaned == 0 && missing == 0 && items_count == index_count;

        tracing::debug!(
            items = items_count,
            index = index_count,
            orphaned = orphaned,
            missing = missing,
            is_consistent = is_consistent,
            "Search index consistency check"
        );

        Ok(IndexConsistencyReport {
            items_count,
            index_count,
            orphaned_entries: orphaned,
            missing_entries: missing,
            is_consistent,
        })
    }

    /// Clear and repopulate the search index from `dictionary_items`.
    ///
    /// Runs in one transaction. Returns the number of items indexed.
    pub async fn rebuild_search_index(&self) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM items_fts").execute(&mut *tx).await?;
        let indexed = sqlx::query(
            r#"
            INSERT INTO items_fts(rowid, name, content, reference, type_name)
            SELECT rowid, name, content, reference, type_name FROM dictionary_items
        "#,
        )
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        tracing::info!(indexed = indexed, "Search index rebuilt");
        Ok(indexed)
    }
}
