use thiserror::Error;
use url::Url;

/// Errors that can occur while validating the catalog endpoint URL.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("URL has no host")]
    MissingHost,
}

/// Validates the catalog endpoint URL.
///
/// Only `http` and `https` URLs with a host are accepted. Private and
/// loopback hosts are allowed: the endpoint comes from local configuration,
/// and a local mirror of the catalog is a legitimate setup.
///
/// # Examples
///
/// ```
/// use archdict::util::validate_catalog_url;
///
/// let url = validate_catalog_url("http://portal.nrich.go.kr/kor/openapi.do").unwrap();
/// assert_eq!(url.host_str(), Some("portal.nrich.go.kr"));
///
/// assert!(validate_catalog_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_catalog_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(UrlValidationError::MissingHost),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_http_and_https() {
        assert!(validate_catalog_url("http://portal.nrich.go.kr/kor/openapi.do").is_ok());
        assert!(validate_catalog_url("https://example.org/api?x=1").is_ok());
    }

    #[test]
    fn test_accepts_local_mirror() {
        let url = validate_catalog_url("http://127.0.0.1:8080/openapi.do").unwrap();
        assert_eq!(url.port(), Some(8080));
    }

    #[test]
    fn test_trims_surrounding_whitespace() {
        let url = validate_catalog_url("  https://example.org/api \n").unwrap();
        assert_eq!(url.path(), "/api");
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(matches!(
            validate_catalog_url("ftp://example.org/dump"),
            Err(UrlValidationError::UnsupportedScheme(s)) if s == "ftp"
        ));
        assert!(matches!(
            validate_catalog_url("file:///etc/passwd"),
            Err(UrlValidationError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_rejects_unparseable() {
        assert!(matches!(
            validate_catalog_url("not a url"),
            Err(UrlValidationError::InvalidUrl(_))
        ));
        assert!(validate_catalog_url("").is_err());
    }
}
