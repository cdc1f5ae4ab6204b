//! Offline archaeology dictionary.
//!
//! The catalog is downloaded page by page from the heritage portal's Open API
//! ([`catalog`]), persisted into a SQLite store with an FTS5 index
//! ([`storage`]) by the [`ingest`] pipeline, and read back through
//! [`query`]. [`library::Library`] bundles these behind the request/response
//! calls a front end makes.

pub mod catalog;
pub mod config;
pub mod ingest;
pub mod library;
pub mod query;
pub mod storage;
pub mod util;
