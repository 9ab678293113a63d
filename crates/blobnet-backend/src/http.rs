//! HTTP backend client speaking the test backend wire protocol.
//!
//! - `HEAD /files/<path>` answers `200` with a `Size` header, or `404`.
//! - `GET /files/<path>` answers the blob bytes, or `404`.
//! - `POST /files/<path>` stores the request body.
//! - `GET /list/<prefix>` answers a recursive JSON name listing.
//!
//! The server is namespace-agnostic; namespaces only drive router
//! selection. Pagination is applied client-side since the wire protocol
//! always returns the full listing.

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::client::{BackendClient, BlobInfo, ListOptions, ListResult};
use crate::error::{BackendError, BackendResult};

/// Configuration for [`HttpBackendClient`].
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Backend address as `host:port`.
    pub address: String,
}

/// Client for the HTTP test-protocol backend.
pub struct HttpBackendClient {
    config: HttpBackendConfig,
    client: reqwest::Client,
}

impl HttpBackendClient {
    /// Build a client for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Config`] when the address is empty.
    pub fn new(config: HttpBackendConfig) -> BackendResult<Self> {
        if config.address.trim().is_empty() {
            return Err(BackendError::Config {
                field: "address",
                reason: "empty",
            });
        }
        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn files_url(&self, name: &str) -> String {
        format!("http://{}/files/{name}", self.config.address)
    }

    fn list_url(&self, prefix: &str) -> String {
        format!("http://{}/list/{prefix}", self.config.address)
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn stat(&self, _namespace: &str, name: &str) -> BackendResult<BlobInfo> {
        let response = self
            .client
            .head(self.files_url(name))
            .send()
            .await
            .map_err(|e| BackendError::http("stat", e))?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(BackendError::BlobNotFound {
                    name: name.to_string(),
                });
            }
            status => {
                return Err(BackendError::InvalidResponse {
                    operation: "stat",
                    reason: "unexpected status",
                    status: Some(status.as_u16()),
                });
            }
        }
        let size = response
            .headers()
            .get("Size")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or(BackendError::InvalidResponse {
                operation: "stat",
                reason: "missing or malformed Size header",
                status: Some(200),
            })?;
        Ok(BlobInfo { size })
    }

    async fn upload(
        &self,
        _namespace: &str,
        name: &str,
        source: &mut (dyn std::io::Read + Send),
    ) -> BackendResult<()> {
        let mut body = Vec::new();
        source
            .read_to_end(&mut body)
            .map_err(|e| BackendError::io("upload.read", e))?;
        let response = self
            .client
            .post(self.files_url(name))
            .body(body)
            .send()
            .await
            .map_err(|e| BackendError::http("upload", e))?;
        if response.status() != StatusCode::OK {
            return Err(BackendError::InvalidResponse {
                operation: "upload",
                reason: "unexpected status",
                status: Some(response.status().as_u16()),
            });
        }
        Ok(())
    }

    async fn download(
        &self,
        _namespace: &str,
        name: &str,
        sink: &mut (dyn std::io::Write + Send),
    ) -> BackendResult<u64> {
        let response = self
            .client
            .get(self.files_url(name))
            .send()
            .await
            .map_err(|e| BackendError::http("download", e))?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(BackendError::BlobNotFound {
                    name: name.to_string(),
                });
            }
            status => {
                return Err(BackendError::InvalidResponse {
                    operation: "download",
                    reason: "unexpected status",
                    status: Some(status.as_u16()),
                });
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::http("download", e))?;
        sink.write_all(&bytes)
            .map_err(|e| BackendError::io("download.write", e))?;
        Ok(bytes.len() as u64)
    }

    async fn list(&self, prefix: &str, options: ListOptions) -> BackendResult<ListResult> {
        let response = self
            .client
            .get(self.list_url(prefix))
            .send()
            .await
            .map_err(|e| BackendError::http("list", e))?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                return Err(BackendError::DirNotFound {
                    prefix: prefix.to_string(),
                });
            }
            status => {
                return Err(BackendError::InvalidResponse {
                    operation: "list",
                    reason: "unexpected status",
                    status: Some(status.as_u16()),
                });
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BackendError::http("list", e))?;
        let names: Vec<String> =
            serde_json::from_slice(&bytes).map_err(|_| BackendError::InvalidResponse {
                operation: "list",
                reason: "expected a json string array",
                status: Some(200),
            })?;
        Ok(paginate(names, &options))
    }
}

/// Client-side pagination over a complete listing: the continuation
/// token encodes the next offset.
fn paginate(names: Vec<String>, options: &ListOptions) -> ListResult {
    if !options.paginated || options.max_keys == 0 {
        return ListResult {
            names,
            continuation_token: None,
        };
    }
    let offset = options
        .continuation_token
        .as_deref()
        .and_then(|token| token.parse::<usize>().ok())
        .unwrap_or(0);
    let end = (offset + options.max_keys).min(names.len());
    let page = names
        .get(offset..end)
        .map(<[String]>::to_vec)
        .unwrap_or_default();
    let continuation_token = (end < names.len()).then(|| end.to_string());
    ListResult {
        names: page,
        continuation_token,
    }
}
