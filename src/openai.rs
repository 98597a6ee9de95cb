//! Client for the `/v1/images/edits` endpoint of an OpenAI-compatible API.
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config;

const EDITS_PATH: &str = "v1/images/edits";

/// Everything that can go wrong in one call to the image API.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("image API credential is not configured")]
    NotConfigured,
    #[error("failed to read image {}: {source}", .path.display())]
    ReadImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image API request timed out: {0}")]
    Timeout(#[source] reqwest::Error),
    #[error("image API request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("image API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed image API response: {0}")]
    Malformed(String),
    #[error("image API response carried no image payload")]
    EmptyPayload,
}

impl From<reqwest::Error> for EditError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EditError::Timeout(err)
        } else {
            EditError::Transport(err)
        }
    }
}

/// The external image-editing step of a generation attempt.
#[async_trait]
pub trait ImageEditor: Send + Sync {
    /// False when no credential is available; callers skip the network call.
    fn is_configured(&self) -> bool;

    /// Send the PNG at `image_path` for editing and return the decoded result.
    async fn edit_image(&self, image_path: &Path) -> Result<Vec<u8>, EditError>;
}

#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    prompt: String,
}

impl fmt::Debug for OpenAiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiClient")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl OpenAiClient {
    pub fn from_config(cfg: &config::OpenAi) -> anyhow::Result<Self> {
        let mut base = cfg.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|url| url.join(EDITS_PATH))
            .context("invalid openai.base_url")?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("openai.base_url must be http or https, got {}", endpoint.scheme());
        }
        let http = Client::builder()
            .user_agent("sketch-thumbnailer/0.1")
            .connect_timeout(cfg.connect_timeout())
            .timeout(cfg.read_timeout())
            .build()
            .context("failed to build HTTP client")?;
        let api_key = cfg
            .api_key
            .as_ref()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        Ok(Self {
            http,
            endpoint,
            api_key,
            model: cfg.model.clone(),
            prompt: cfg.prompt.clone(),
        })
    }

    pub fn build_request(&self, image: Vec<u8>, filename: &str) -> Result<reqwest::Request, EditError> {
        let api_key = self.api_key.as_deref().ok_or(EditError::NotConfigured)?;
        let form = Form::new()
            .text("model", self.model.clone())
            .text("prompt", self.prompt.clone())
            .part(
                "image",
                Part::bytes(image)
                    .file_name(filename.to_string())
                    .mime_str("image/png")?,
            );
        Ok(self
            .http
            .post(self.endpoint.clone())
            .bearer_auth(api_key)
            .multipart(form)
            .build()?)
    }
}

#[async_trait]
impl ImageEditor for OpenAiClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn edit_image(&self, image_path: &Path) -> Result<Vec<u8>, EditError> {
        let image = fs::read(image_path)
            .await
            .map_err(|source| EditError::ReadImage {
                path: image_path.to_path_buf(),
                source,
            })?;
        let filename = png_file_name(image_path);
        let request = self.build_request(image, &filename)?;
        info!(url = %request.url(), model = %self.model, "sending image edit request");

        let started = Instant::now();
        let res = self.http.execute(request).await?;
        let status = res.status();
        debug!(%status, elapsed_ms = started.elapsed().as_millis() as u64, "image API responded");

        if status != StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "image API error");
            return Err(EditError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = res.text().await?;
        parse_edit_response(&body)
    }
}

/// Filename sent with the multipart `image` part; always ends in `.png`.
fn png_file_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("sketch");
    format!("{stem}.png")
}

#[derive(Deserialize)]
struct EditResponse {
    #[serde(default)]
    data: Vec<EditDatum>,
}

#[derive(Deserialize)]
struct EditDatum {
    #[serde(default)]
    b64_json: Option<String>,
}

/// Extract and decode `data[0].b64_json`.
pub fn parse_edit_response(body: &str) -> Result<Vec<u8>, EditError> {
    let payload: EditResponse = serde_json::from_str(body)
        .map_err(|e| EditError::Malformed(format!("invalid JSON: {e}")))?;
    let b64 = payload
        .data
        .into_iter()
        .next()
        .and_then(|d| d.b64_json)
        .filter(|s| !s.trim().is_empty())
        .ok_or(EditError::EmptyPayload)?;
    STANDARD
        .decode(b64.trim())
        .map_err(|e| EditError::Malformed(format!("invalid base64 payload: {e}")))
}
