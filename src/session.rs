use std::io::Read;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RANGE, USER_AGENT};

use crate::error::MlhubError;

const MAX_RETRIES: usize = 5;
const BASE_DELAY_MS: u64 = 200;

/// An open byte stream for one remote file, positioned at `range_start`.
pub struct RemoteStream {
    /// Total remote size in bytes, including any portion before `range_start`.
    pub total_len: u64,
    pub reader: Box<dyn Read + Send>,
}

/// HTTP collaborator for the catalog API and asset hosts.
///
/// Implementations retry transient failures (timeouts, connection resets,
/// 429/5xx) internally with backoff; 401/403/404 surface as errors.
pub trait ApiSession: Send + Sync {
    fn get_json(&self, path: &str, params: &[(&str, String)])
    -> Result<serde_json::Value, MlhubError>;

    /// Open a streaming GET, optionally resuming from a byte offset.
    ///
    /// When `range_start` equals the remote size the returned stream is
    /// empty and `total_len == range_start`.
    fn open_stream(&self, url: &str, range_start: u64) -> Result<RemoteStream, MlhubError>;
}

#[derive(Clone)]
pub struct HttpSession {
    client: Client,
    base_url: String,
}

impl HttpSession {
    pub fn new(api_key: &str) -> Result<Self, MlhubError> {
        Self::with_base_url(api_key, "https://api.radiant.earth/mlhub/v1")
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, MlhubError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("stac-dm/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MlhubError::ApiHttp(err.to_string()))?,
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|err| MlhubError::ApiHttp(err.to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| MlhubError::ApiHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn absolute_url(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            return normalize_asset_url(path_or_url);
        }
        format!("{}/{}", self.base_url, path_or_url.trim_start_matches('/'))
    }

    fn send_with_retries<F>(
        &self,
        mut make_req: F,
    ) -> Result<reqwest::blocking::Response, MlhubError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS << attempt;
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS << attempt;
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(MlhubError::ApiHttp(err.to_string()));
                }
            }
        }
    }
}

impl ApiSession for HttpSession {
    fn get_json(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, MlhubError> {
        let url = self.absolute_url(path);
        let response = self.send_with_retries(|| {
            let mut request = self.client.get(&url);
            for (key, value) in params {
                request = request.query(&[(key, value.as_str())]);
            }
            request
        })?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "MLHub request failed".to_string());
            return Err(MlhubError::ApiStatus { status, message });
        }
        response
            .json()
            .map_err(|err| MlhubError::ApiDecode(err.to_string()))
    }

    fn open_stream(&self, url: &str, range_start: u64) -> Result<RemoteStream, MlhubError> {
        let url = self.absolute_url(url);
        let response = self.send_with_retries(|| {
            let mut request = self.client.get(&url);
            if range_start > 0 {
                request = request.header(RANGE, format!("bytes={range_start}-"));
            }
            request
        })?;

        let status = response.status().as_u16();
        if status == 416 {
            // local bytes already cover the remote file
            let total_len = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(range_start);
            return Ok(RemoteStream {
                total_len,
                reader: Box::new(std::io::empty()),
            });
        }
        if !response.status().is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "download request failed".to_string());
            return Err(MlhubError::ApiStatus { status, message });
        }

        let total_len = if range_start > 0 {
            if status != 206 {
                return Err(MlhubError::ApiHttp(format!(
                    "server ignored range request for {url} (status {status})"
                )));
            }
            response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_content_range_total)
                .ok_or_else(|| {
                    MlhubError::ApiHttp(format!("missing content-range header for {url}"))
                })?
        } else {
            response
                .content_length()
                .ok_or_else(|| {
                    MlhubError::ApiHttp(format!("missing content-length header for {url}"))
                })?
        };

        Ok(RemoteStream {
            total_len,
            reader: Box::new(response),
        })
    }
}

/// Some asset hrefs use `s3://` URIs; rewrite them to the public HTTPS
/// endpoint rather than pulling in an S3 client.
pub fn normalize_asset_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("s3://") {
        match rest.split_once('/') {
            Some((bucket, key)) => return format!("https://{bucket}.s3.amazonaws.com/{key}"),
            None => return format!("https://{rest}.s3.amazonaws.com"),
        }
    }
    url.to_string()
}

/// Extract the total length from a `Content-Range: bytes start-end/total` value.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
