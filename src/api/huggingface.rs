//! Hugging Face hub client for file listing, size probing and shard download

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{RemoteBody, RemoteFile, WeightRepository};
use crate::config::HubSettings;
use crate::error::{Error, Result};

/// Hugging Face API client
pub struct HfHubClient {
    client: Client,
    base_url: String,
}

impl HfHubClient {
    /// Create new Hugging Face client
    pub fn new(settings: &HubSettings) -> Result<Self> {
        let mut headers = header::HeaderMap::new();

        // Add authorization header if token provided
        if let Some(token) = &settings.token {
            let auth_value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::Config(format!("Invalid token format: {}", e)))?;
            headers.insert(header::AUTHORIZATION, auth_value);
        }

        let user_agent = header::HeaderValue::from_str(&settings.user_agent)
            .map_err(|e| Error::Config(format!("Invalid user agent: {}", e)))?;
        headers.insert(header::USER_AGENT, user_agent);

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(settings.timeout_secs))
            .read_timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get API URL for a repository listing
    fn tree_url(&self, repository: &str, revision: &str) -> String {
        format!(
            "{}/api/models/{}/tree/{}?recursive=true",
            self.base_url, repository, revision
        )
    }

    fn check_status(url: &str, response: Response) -> Result<Response> {
        status_error(url, response.status()).map_or(Ok(response), Err)
    }
}

fn status_error(url: &str, status: StatusCode) -> Option<Error> {
    if status.is_success() {
        return None;
    }
    Some(Error::network(
        url,
        Some(status.as_u16()),
        status.canonical_reason().unwrap_or("request failed"),
    ))
}

/// What a HEAD response means for a size probe
#[derive(Debug)]
enum HeadOutcome {
    /// Headers carry the size
    Sized,
    /// The server refuses HEAD; read the headers of a GET instead
    RetryWithGet,
    Failed(Error),
}

fn classify_head(url: &str, status: StatusCode) -> HeadOutcome {
    match status {
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED => HeadOutcome::RetryWithGet,
        status => status_error(url, status).map_or(HeadOutcome::Sized, HeadOutcome::Failed),
    }
}

/// Content-Length as sent by the server; HEAD bodies are empty so the
/// response size hint cannot be used
fn header_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .or_else(|| headers.get("x-linked-size"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Parse the tree endpoint payload into plain files
fn parse_listing(files: Vec<HuggingFaceFileInfo>) -> Vec<RemoteFile> {
    files
        .into_iter()
        .filter(|f| f.type_field == "file")
        .map(|f| RemoteFile {
            size: f.lfs.and_then(|l| l.size).or(f.size),
            path: f.path,
        })
        .collect()
}

#[async_trait]
impl WeightRepository for HfHubClient {
    fn file_url(&self, repository: &str, revision: &str, path: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.base_url, repository, revision, path)
    }

    async fn list_files(&self, repository: &str, revision: &str) -> Result<Vec<RemoteFile>> {
        let url = self.tree_url(repository, revision);
        let response = self.client.get(&url).send().await?;
        let response = Self::check_status(&url, response)?;

        let files: Vec<HuggingFaceFileInfo> = response.json().await?;
        let files = parse_listing(files);
        debug!("Listed {} files in {}@{}", files.len(), repository, revision);
        Ok(files)
    }

    async fn probe_size(&self, url: &str) -> Result<Option<u64>> {
        let response = self.client.head(url).send().await?;
        match classify_head(url, response.status()) {
            HeadOutcome::Sized => Ok(header_length(response.headers())),
            HeadOutcome::RetryWithGet => {
                // the GET body is dropped unread
                debug!("HEAD unsupported for {}, probing with GET", url);
                let response = self.client.get(url).send().await?;
                let response = Self::check_status(url, response)?;
                Ok(header_length(response.headers()))
            }
            HeadOutcome::Failed(e) => Err(e),
        }
    }

    async fn fetch(&self, url: &str) -> Result<RemoteBody> {
        let response = self.client.get(url).send().await?;
        let response = Self::check_status(url, response)?;
        let content_length = header_length(response.headers());
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(RemoteBody {
            content_length,
            stream,
        })
    }
}

/// Hugging Face file info from the tree API
#[derive(Debug, Deserialize)]
struct HuggingFaceFileInfo {
    pub path: String,
    pub size: Option<u64>,
    pub lfs: Option<HuggingFaceLfsInfo>,

    #[serde(rename = "type")]
    pub type_field: String,
}

#[derive(Debug, Deserialize)]
struct HuggingFaceLfsInfo {
    pub size: Option<u64>,
}
