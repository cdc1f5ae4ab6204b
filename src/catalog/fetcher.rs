use futures::StreamExt;
use reqwest::redirect::Policy;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::util::validate_catalog_url;

const MAX_PAGE_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while talking to the remote catalog.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[source] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// Body was not the JSON shape the catalog documents
    #[error("Unexpected catalog response: {0}")]
    Parse(String),
    /// The catalog reported zero records
    #[error("The catalog has no records to download")]
    EmptyCatalog,
    /// Configured endpoint is not a usable http(s) URL
    #[error("Invalid catalog URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Connection and paging parameters for [`CatalogClient`].
#[derive(Debug, Clone)]
pub struct CatalogSettings {
    /// Open API endpoint
    pub base_url: String,
    /// Dataset index of the archaeology dictionary on the portal
    pub api_index: u32,
    /// Records requested per page
    pub page_size: u32,
    /// Pause before every page after the first
    pub page_delay: Duration,
    /// Bound on each HTTP request, body included
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Retries for 429, 5xx and truncated bodies; 0 disables retrying
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry
    pub retry_base_delay: Duration,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            base_url: "http://portal.nrich.go.kr/kor/openapi.do".to_string(),
            api_index: 39,
            page_size: 100,
            page_delay: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            user_agent: concat!("archdict/", env!("CARGO_PKG_VERSION")).to_string(),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1000),
        }
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Download progress, reported after each page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    /// 1-based page just completed
    pub page: u64,
    pub total_pages: u64,
    /// 0..=100
    pub percent: u8,
    pub message: String,
}

/// One downloaded page of raw records.
#[derive(Debug)]
pub struct CatalogPage {
    pub page: u64,
    pub total_pages: u64,
    /// 1-based index of the first record requested
    pub first_index: u64,
    pub total_count: u64,
    pub records: Vec<Value>,
}

impl CatalogPage {
    pub fn progress(&self) -> Progress {
        let percent = if self.total_pages == 0 {
            100
        } else {
            (self.page.saturating_mul(100) / self.total_pages).min(100) as u8
        };
        let last_index = self
            .first_index
            .saturating_add(self.records.len() as u64)
            .saturating_sub(1)
            .max(self.first_index);
        Progress {
            page: self.page,
            total_pages: self.total_pages,
            percent,
            message: format!(
                "Downloaded page {}/{} (records {}-{} of {})",
                self.page, self.total_pages, self.first_index, last_index, self.total_count
            ),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Create a redirect policy with loop detection and limited hops.
fn create_redirect_policy() -> Policy {
    Policy::custom(|attempt| {
        if attempt.previous().len() >= 3 {
            return attempt.error("Too many redirects (max 3)");
        }

        let url = attempt.url();
        if attempt.previous().iter().any(|prev| prev == url) {
            return attempt.error("Redirect loop detected");
        }

        tracing::debug!(
            from = %attempt.previous().last().map(|u| u.as_str()).unwrap_or("initial"),
            to = %url,
            hop = attempt.previous().len() + 1,
            "Following redirect"
        );

        attempt.follow()
    })
}

/// HTTP client for the paginated dictionary catalog.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: reqwest::Client,
    base_url: Url,
    settings: CatalogSettings,
}

impl CatalogClient {
    /// Build a client for `settings`.
    ///
    /// # Errors
    ///
    /// `FetchError::InvalidUrl` if the endpoint is not an http(s) URL, or
    /// `FetchError::Network` if the HTTP client cannot be constructed.
    pub fn new(settings: CatalogSettings) -> Result<Self, FetchError> {
        let base_url = validate_catalog_url(&settings.base_url)
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

        let http = reqwest::Client::builder()
            .redirect(create_redirect_policy())
            .user_agent(settings.user_agent.clone())
            .timeout(settings.request_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(FetchError::Network)?;

        Ok(Self {
            http,
            base_url,
            settings,
        })
    }

    pub fn settings(&self) -> &CatalogSettings {
        &self.settings
    }

    fn page_url(&self, first_index: u64, count: u32) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("idx", &self.settings.api_index.to_string())
            .append_pair("firstindex", &first_index.to_string())
            .append_pair("recordcountperpage", &count.to_string())
            .append_pair("resulttype", "json");
        url
    }

    /// Number of records the catalog currently holds.
    ///
    /// `TOTAL_COUNT` may arrive as a string or a number; a response without
    /// it counts as an empty catalog.
    pub async fn total_count(&self) -> Result<u64, FetchError> {
        let body = self.get_json(self.page_url(1, 1)).await?;

        match body.get("TOTAL_COUNT") {
            Some(Value::Number(n)) => n
                .as_u64()
                .ok_or_else(|| FetchError::Parse(format!("TOTAL_COUNT is not a count: {}", n))),
            Some(Value::String(s)) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| FetchError::Parse(format!("TOTAL_COUNT is not a count: {:?}", s))),
            Some(Value::Null) | None => {
                tracing::warn!("Catalog response has no TOTAL_COUNT");
                Ok(0)
            }
            Some(other) => Err(FetchError::Parse(format!(
                "TOTAL_COUNT is not a count: {}",
                other
            ))),
        }
    }

    /// Fetch the record count and start a paged download.
    ///
    /// # Errors
    ///
    /// `FetchError::EmptyCatalog` when the count is zero; any error from the
    /// count request itself.
    pub async fn begin_download(&self) -> Result<CatalogDownload<'_>, FetchError> {
        let total_count = self.total_count().await?;
        if total_count == 0 {
            return Err(FetchError::EmptyCatalog);
        }

        let page_size = u64::from(self.settings.page_size.max(1));
        let total_pages = total_count.div_ceil(page_size);

        tracing::info!(
            total_count = total_count,
            total_pages = total_pages,
            page_size = page_size,
            "Catalog download starting"
        );

        Ok(CatalogDownload {
            client: self,
            total_count,
            total_pages,
            next_page: 1,
        })
    }

    /// GET `url` and decode the body as JSON, retrying transient failures.
    ///
    /// 429 and 5xx responses and truncated bodies back off exponentially
    /// (`retry_base_delay * 2^attempt`) up to `max_retries` times. Other
    /// 4xx statuses and timeouts fail immediately.
    async fn get_json(&self, url: Url) -> Result<Value, FetchError> {
        let max_retries = self.settings.max_retries;
        let mut retry_count: u32 = 0;

        let bytes = loop {
            let response = tokio::time::timeout(
                self.settings.request_timeout,
                self.http
                    .get(url.clone())
                    .header(reqwest::header::ACCEPT, "application/json")
                    .send(),
            )
            .await
            .map_err(|_| FetchError::Timeout)??;

            let status = response.status();
            let delay = self
                .settings
                .retry_base_delay
                .saturating_mul(2u32.saturating_pow(retry_count));

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= max_retries {
                    return Err(FetchError::RateLimited(max_retries));
                }
                tracing::warn!(
                    url = %url,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if status.is_server_error() {
                if retry_count >= max_retries {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                }
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            match read_limited_bytes(response, MAX_PAGE_SIZE).await {
                Ok(bytes) => break bytes,
                Err(FetchError::IncompleteResponse { expected, received })
                    if retry_count < max_retries =>
                {
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(e.to_string()))
    }
}

/// Cursor over the pages of one download, created by
/// [`CatalogClient::begin_download`].
pub struct CatalogDownload<'a> {
    client: &'a CatalogClient,
    total_count: u64,
    total_pages: u64,
    next_page: u64,
}

impl CatalogDownload<'_> {
    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Fetch the next page, or `None` once every page has been returned.
    ///
    /// Sleeps the configured page delay before every page except the first.
    ///
    /// # Errors
    ///
    /// Any transport error, or `FetchError::Parse` when the page has no
    /// `items` array. The download should be abandoned after an error.
    pub async fn next_page(&mut self) -> Result<Option<CatalogPage>, FetchError> {
        if self.next_page > self.total_pages {
            return Ok(None);
        }

        let page = self.next_page;
        let settings = &self.client.settings;
        if page > 1 && !settings.page_delay.is_zero() {
            tokio::time::sleep(settings.page_delay).await;
        }

        let first_index = (page - 1) * u64::from(settings.page_size.max(1)) + 1;
        let url = self.client.page_url(first_index, settings.page_size.max(1));
        let mut body = self.client.get_json(url).await?;

        let records = match body.get_mut("items").map(Value::take) {
            Some(Value::Array(records)) => records,
            _ => {
                return Err(FetchError::Parse(format!(
                    "page {} of {} has no items array",
                    page, self.total_pages
                )))
            }
        };

        tracing::debug!(
            page = page,
            total_pages = self.total_pages,
            records = records.len(),
            "Catalog page downloaded"
        );

        self.next_page += 1;
        Ok(Some(CatalogPage {
            page,
            total_pages: self.total_pages,
            first_index,
            total_count: self.total_count,
            records,
        }))
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
