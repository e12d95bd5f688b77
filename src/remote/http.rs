//! reqwest client for the drive API.

use super::{RemoteApi, TransferProgress};
use crate::config::RemoteConfig;
use crate::error::SyncError;
use crate::listing::{
    clamp_listen_timeout, parse_full_listing, ContinueResponse, FullListing, ListenResponse,
    ListingRequest, RemoteFile,
};
use crate::types::SyncTime;
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::{self, BufReader};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{debug, warn};

const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// Response envelope of JSON endpoints
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: String,
    data: Option<T>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    #[serde(default)]
    description: String,
}

/// HttpRemoteApi: bearer-authenticated client rooted at a drive base URL
pub struct HttpRemoteApi {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    listing_limit: usize,
}

impl HttpRemoteApi {
    pub fn new(config: &RemoteConfig) -> Result<Self, SyncError> {
        // Long-poll requests must outlive the listen timeout
        let timeout = Duration::from_secs(config.request_timeout_secs)
            .max(clamp_listen_timeout(Duration::from_secs(config.listen_timeout_secs)) + Duration::from_secs(5));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .gzip(true)
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            listing_limit: config.listing_limit,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.url(path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, SyncError> {
        let response = builder.send().await.map_err(network_error)?;
        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            warn!(status = status.as_u16(), url = %url, "Drive API request failed");
            return Err(SyncError::Http {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> Result<T, SyncError> {
        let response = self.send(builder).await?;
        let envelope: Envelope<T> = response.json().await.map_err(network_error)?;
        if envelope.result != "success" {
            let detail = envelope
                .error
                .map(|e| format!("{}: {}", e.code, e.description))
                .unwrap_or_else(|| envelope.result.clone());
            return Err(SyncError::Network(format!("Drive API error {}", detail)));
        }
        envelope
            .data
            .ok_or_else(|| SyncError::Network("Drive API response without data".to_string()))
    }
}

fn network_error(error: reqwest::Error) -> SyncError {
    match error.status() {
        Some(status) => SyncError::Http {
            status: status.as_u16(),
            url: error.url().map(|u| u.to_string()).unwrap_or_default(),
        },
        None => SyncError::Network(error.to_string()),
    }
}

/// Request body sent in chunks, reporting the bytes handed to the connection
fn upload_body(content: Vec<u8>, progress: TransferProgress) -> reqwest::Body {
    let chunks: Vec<Vec<u8>> = content.chunks(UPLOAD_CHUNK_SIZE).map(<[u8]>::to_vec).collect();
    let mut sent = 0u64;
    let stream = futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        progress(sent);
        Ok::<_, io::Error>(chunk)
    });
    reqwest::Body::wrap_stream(stream)
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn full_listing(&self, directory_id: &str) -> Result<FullListing, SyncError> {
        let request = ListingRequest::full(directory_id, self.listing_limit);
        let path = format!("files/{}/listing/full", directory_id);
        let builder = self
            .request(reqwest::Method::GET, &path)
            .query(&request.query_pairs());
        let response = self.send(builder).await?;
        let body = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))),
        );
        // The parser reads synchronously; feed it from the body stream on a blocking thread
        let reader = SyncIoBridge::new(StreamReader::new(body));
        let listing = tokio::task::spawn_blocking(move || parse_full_listing(BufReader::new(reader)))
            .await
            .map_err(|e| SyncError::Aborted(format!("listing parser stopped: {}", e)))??;
        debug!(items = listing.items.len(), directory_id, "Received full listing");
        Ok(listing)
    }

    async fn continue_listing(&self, cursor: &str) -> Result<ContinueResponse, SyncError> {
        let builder = self
            .request(reqwest::Method::GET, "files/listing/continue")
            .query(&[("cursor", cursor), ("with", "capabilities,is_link")]);
        self.send_json(builder).await
    }

    async fn listen(&self, cursor: &str, timeout: Duration) -> Result<ListenResponse, SyncError> {
        let timeout = clamp_listen_timeout(timeout);
        let builder = self
            .request(reqwest::Method::GET, "files/listing/listen")
            .query(&[
                ("cursor", cursor.to_string()),
                ("timeout", timeout.as_secs().to_string()),
            ]);
        self.send_json(builder).await
    }

    async fn create_directory(&self, parent_id: &str, name: &str) -> Result<RemoteFile, SyncError> {
        let path = format!("files/{}/directory", parent_id);
        let builder = self
            .request(reqwest::Method::POST, &path)
            .json(&serde_json::json!({ "name": name }));
        self.send_json(builder).await
    }

    async fn upload(
        &self,
        parent_id: &str,
        name: &str,
        source: &Path,
        last_modified: SyncTime,
        progress: TransferProgress,
    ) -> Result<RemoteFile, SyncError> {
        let content = tokio::fs::read(source)
            .await
            .map_err(|e| SyncError::io(source, e))?;
        let total_size = content.len();
        let path = format!("files/{}/upload", parent_id);
        let builder = self
            .request(reqwest::Method::POST, &path)
            .query(&[
                ("file_name", name.to_string()),
                ("total_size", total_size.to_string()),
                ("last_modified_at", last_modified.to_string()),
                ("conflict", "error".to_string()),
            ])
            .body(upload_body(content, progress));
        self.send_json(builder).await
    }

    async fn upload_replace(
        &self,
        file_id: &str,
        source: &Path,
        last_modified: SyncTime,
        progress: TransferProgress,
    ) -> Result<RemoteFile, SyncError> {
        let content = tokio::fs::read(source)
            .await
            .map_err(|e| SyncError::io(source, e))?;
        let total_size = content.len();
        let path = format!("files/{}/upload", file_id);
        let builder = self
            .request(reqwest::Method::POST, &path)
            .query(&[
                ("total_size", total_size.to_string()),
                ("last_modified_at", last_modified.to_string()),
                ("conflict", "version".to_string()),
            ])
            .body(upload_body(content, progress));
        self.send_json(builder).await
    }

    async fn download(&self, file_id: &str, destination: &Path, progress: TransferProgress) -> Result<(), SyncError> {
        let path = format!("files/{}/download", file_id);
        let mut response = self.send(self.request(reqwest::Method::GET, &path)).await?;
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| SyncError::io(destination, e))?;
        let mut received = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(network_error)? {
            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::io(destination, e))?;
            received += chunk.len() as u64;
            progress(received);
        }
        file.flush().await.map_err(|e| SyncError::io(destination, e))?;
        Ok(())
    }

    async fn move_item(&self, file_id: &str, destination_parent_id: &str) -> Result<RemoteFile, SyncError> {
        let path = format!("files/{}/move/{}", file_id, destination_parent_id);
        self.send_json(self.request(reqwest::Method::POST, &path)).await
    }

    async fn rename(&self, file_id: &str, name: &str) -> Result<RemoteFile, SyncError> {
        let path = format!("files/{}/rename", file_id);
        let builder = self
            .request(reqwest::Method::POST, &path)
            .json(&serde_json::json!({ "name": name }));
        self.send_json(builder).await
    }

    async fn delete(&self, file_id: &str) -> Result<(), SyncError> {
        let path = format!("files/{}", file_id);
        self.send(self.request(reqwest::Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_error_detail() {
        let json = r#"{"result":"error","error":{"code":"not_authorized","description":"no"}}"#;
        let envelope: Envelope<RemoteFile> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.result, "error");
        assert!(envelope.data.is_none());
        assert_eq!(envelope.error.unwrap().code, "not_authorized");
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let config = RemoteConfig {
            base_url: "https://api.example.test/drive/7/".to_string(),
            ..RemoteConfig::default()
        };
        let api = HttpRemoteApi::new(&config).unwrap();
        assert_eq!(api.url("files/1/listing/full"), "https://api.example.test/drive/7/files/1/listing/full");
    }
}
