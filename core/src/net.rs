use std::collections::HashMap;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_RANGES, CONTENT_LENGTH, RANGE};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Inclusive byte range.
    pub range: Option<(u64, u64)>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: HashMap::new(),
            range: None,
        }
    }

    pub fn with_range(&self, start: u64, end: u64) -> Self {
        let mut req = self.clone();
        req.range = Some((start, end));
        req
    }
}

#[derive(Debug, Clone)]
pub struct HeadResponse {
    pub status_code: u16,
    pub total_bytes: Option<u64>,
    pub accept_ranges: bool,
}

pub struct StreamResponse {
    pub status_code: u16,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl StreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

pub trait NetClient: Send + Sync {
    fn head(&self, req: &DownloadRequest) -> CoreResult<HeadResponse>;
    fn get(&self, req: &DownloadRequest) -> CoreResult<StreamResponse>;
}

/// Supplies the cookie/header values that authorize stream requests.
pub trait CredentialProvider: Send + Sync {
    fn headers(&self) -> HashMap<String, String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    headers: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self { headers }
    }

    pub fn with_cookie(cookie: impl Into<String>) -> Self {
        let mut headers = HashMap::new();
        headers.insert("Cookie".to_string(), cookie.into());
        Self { headers }
    }
}

impl CredentialProvider for StaticCredentials {
    fn headers(&self) -> HashMap<String, String> {
        self.headers.clone()
    }
}

#[derive(Clone)]
pub struct ReqwestNetClient {
    client: Client,
}

impl ReqwestNetClient {
    pub fn new(user_agent: &str, connect_timeout_secs: u64) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            // whole-stream reads can legitimately take minutes
            .timeout(None)
            .build()
            .map_err(|err| CoreError::Transfer(err.to_string()))?;
        Ok(Self { client })
    }

    fn request_headers(&self, req: &DownloadRequest) -> CoreResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (key, value) in &req.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|err| CoreError::InvalidRequest(err.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| CoreError::InvalidRequest(err.to_string()))?;
            headers.insert(name, value);
        }
        if let Some((start, end)) = req.range {
            let value = format!("bytes={}-{}", start, end);
            headers.insert(
                RANGE,
                HeaderValue::from_str(&value)
                    .map_err(|err| CoreError::InvalidRequest(err.to_string()))?,
            );
        }
        Ok(headers)
    }
}

/// Connect and timeout failures are the retryable network class.
pub(crate) fn classify_reqwest_error(err: reqwest::Error) -> CoreError {
    if err.is_connect() || err.is_timeout() {
        CoreError::Network(err.to_string())
    } else {
        CoreError::Transfer(err.to_string())
    }
}

/// Same split for errors surfacing from a body read.
pub(crate) fn classify_io_error(err: std::io::Error) -> CoreError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::ConnectionRefused | ErrorKind::NotConnected => {
            CoreError::Network(err.to_string())
        }
        _ => CoreError::Transfer(err.to_string()),
    }
}

impl NetClient for ReqwestNetClient {
    fn head(&self, req: &DownloadRequest) -> CoreResult<HeadResponse> {
        let resp = self
            .client
            .head(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(classify_reqwest_error)?;
        let headers = resp.headers();
        let total_bytes = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        let accept_ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);

        Ok(HeadResponse {
            status_code: resp.status().as_u16(),
            total_bytes,
            accept_ranges,
        })
    }

    fn get(&self, req: &DownloadRequest) -> CoreResult<StreamResponse> {
        let resp = self
            .client
            .get(&req.url)
            .headers(self.request_headers(req)?)
            .send()
            .map_err(classify_reqwest_error)?;
        Ok(StreamResponse {
            status_code: resp.status().as_u16(),
            content_length: resp.content_length(),
            body: Box::new(resp),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        let client = ReqwestNetClient::new("test-agent", 5).unwrap();
        let req = DownloadRequest::new("https://cdn.example.com/v.m4s").with_range(0, 2_499_999);
        let headers = client.request_headers(&req).unwrap();
        assert_eq!(headers.get(RANGE).unwrap(), "bytes=0-2499999");
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let client = ReqwestNetClient::new("test-agent", 5).unwrap();
        let mut req = DownloadRequest::new("https://cdn.example.com/v.m4s");
        req.headers.insert("bad header".to_string(), "x".to_string());
        assert!(matches!(
            client.request_headers(&req),
            Err(CoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn io_errors_split_by_kind() {
        use std::io::{Error, ErrorKind};
        assert!(classify_io_error(Error::new(ErrorKind::TimedOut, "slow")).is_retryable());
        assert!(!classify_io_error(Error::new(ErrorKind::UnexpectedEof, "eof")).is_retryable());
    }
}
