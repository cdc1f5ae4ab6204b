//! UI-facing search requests.
//!
//! A [`SearchRequest`] carries the loosely typed fields a front end sends
//! (sort names as strings, optional paging) and is translated into storage
//! [`SearchFilters`] for a single [`Database::search_items`] call.

use serde::Deserialize;
use thiserror::Error;

use crate::storage::{
    Database, DictionaryType, Item, SearchFilters, SortDirection, SortOption, StorageError,
    DEFAULT_SEARCH_LIMIT,
};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Unknown sort option '{0}' (expected name, recent or count)")]
    UnknownSort(String),
    #[error("Unknown sort direction '{0}' (expected asc or desc)")]
    UnknownDirection(String),
    #[error(transparent)]
    UnknownType(#[from] crate::storage::UnknownDictionaryType),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Free text plus structured filters, paging and sort.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchRequest {
    pub query: String,
    /// Category (`type_code`) filter
    pub category_id: Option<String>,
    /// Dictionary type filter (`site` / `term`)
    #[serde(rename = "type")]
    pub dictionary_type: Option<String>,
    pub bookmarked: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// `name`, `recent` or `count`
    pub sort: Option<String>,
    /// `asc` or `desc`; defaults per sort option
    pub sort_dir: Option<String>,
}

fn parse_sort(raw: &str) -> Result<SortOption, QueryError> {
    match raw.trim().to_lowercase().as_str() {
        "" | "name" => Ok(SortOption::Name),
        "recent" | "last_viewed" | "lastviewed" => Ok(SortOption::Recent),
        "count" | "view_count" | "viewcount" => Ok(SortOption::Count),
        _ => Err(QueryError::UnknownSort(raw.to_owned())),
    }
}

fn parse_direction(raw: &str) -> Result<SortDirection, QueryError> {
    match raw.trim().to_lowercase().as_str() {
        "asc" => Ok(SortDirection::Asc),
        "desc" => Ok(SortDirection::Desc),
        _ => Err(QueryError::UnknownDirection(raw.to_owned())),
    }
}

impl SearchRequest {
    /// Convenience constructor for a plain text search.
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    /// Translate into storage filters, validating the string-typed fields.
    pub fn to_filters(&self) -> Result<SearchFilters, QueryError> {
        let sort = self.sort.as_deref().map(parse_sort).transpose()?.unwrap_or_default();
        let direction = self.sort_dir.as_deref().map(parse_direction).transpose()?;
        let dictionary_type = self
            .dictionary_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(str::parse::<DictionaryType>)
            .transpose()?;

        Ok(SearchFilters {
            type_code: self.category_id.clone().filter(|c| !c.is_empty()),
            dictionary_type,
            bookmarked_only: self.bookmarked.unwrap_or(false),
            limit: self.limit.unwrap_or(DEFAULT_SEARCH_LIMIT),
            offset: self.offset.unwrap_or(0),
            sort,
            direction,
        })
    }
}

/// Run a search request. Free-text relevance overrides any requested sort.
pub async fn search(db: &Database, request: &SearchRequest) -> Result<Vec<Item>, QueryError> {
    let filters = request.to_filters()?;
    let query = request.query.trim();

    if !query.is_empty() && (filters.sort != SortOption::Name || filters.direction.is_some()) {
        tracing::debug!(
            query = %query,
            sort = ?filters.sort,
            "Relevance ranking overrides requested sort"
        );
    }

    Ok(db.search_items(query, &filters).await?)
}
