//! Remote dictionary catalog: paged download and record normalization.
//!
//! - [`fetcher`] - HTTP paging with retry, timeouts and progress
//! - [`normalize`] - mapping raw JSON records onto [`crate::storage::NewItem`]

mod fetcher;
mod normalize;

pub use fetcher::{
    CatalogClient, CatalogDownload, CatalogPage, CatalogSettings, FetchError, Progress,
};
pub use normalize::{normalize_page, normalize_record, NormalizedPage};
