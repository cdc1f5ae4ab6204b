//! Small shared helpers.
//!
//! - **URL validation** for the configured catalog endpoint
//! - **Text processing** for terminal output: Unicode-aware width
//!   calculation and truncation, control-character stripping

mod text;
mod url_validator;

pub use text::{display_width, fit_to_width, single_line, strip_control_chars, truncate_to_width};
pub use url_validator::{validate_catalog_url, UrlValidationError};
