use crate::upload::types::{AssetKind, FileDescriptor, UploadCredential};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server refused the upload descriptor (HTTP {status}): {message}")]
    Rejected { status: StatusCode, message: String },
    #[error("credential response is missing '{0}'")]
    MalformedResponse(&'static str),
}

/// Requests a time-limited, single-use write credential for one upload
/// attempt. No retry happens here; retry policy belongs to the caller and
/// always needs a fresh credential.
#[async_trait]
pub trait CredentialApi: Send + Sync {
    async fn request_credential(
        &self,
        target_id: u64,
        file: &FileDescriptor,
        kind: AssetKind,
    ) -> Result<UploadCredential, CredentialError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PresignRequest<'a> {
    file_name: &'a str,
    file_type: &'a str,
    content_type: &'a str,
    file_size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresignResponse {
    presigned_url: Option<String>,
    s3_key: Option<String>,
}

impl PresignResponse {
    fn into_credential(self) -> Result<UploadCredential, CredentialError> {
        let write_url = self
            .presigned_url
            .filter(|url| !url.is_empty())
            .ok_or(CredentialError::MalformedResponse("presignedUrl"))?;
        let storage_key = self
            .s3_key
            .filter(|key| !key.is_empty())
            .ok_or(CredentialError::MalformedResponse("s3Key"))?;
        Ok(UploadCredential {
            write_url,
            storage_key,
        })
    }
}

/// Production credential acquirer: one `POST /presigned-url` round trip
/// against the application server.
pub struct HttpCredentialApi {
    client: Client,
    base_url: String,
}

impl HttpCredentialApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CredentialApi for HttpCredentialApi {
    async fn request_credential(
        &self,
        target_id: u64,
        file: &FileDescriptor,
        kind: AssetKind,
    ) -> Result<UploadCredential, CredentialError> {
        let url = format!("{}/projects/{}/presigned-url", self.base_url, target_id);
        let request = PresignRequest {
            file_name: &file.file_name,
            file_type: kind.wire_name(),
            content_type: &file.content_type,
            file_size: file.size_bytes,
        };

        debug!(target_id, file_name = %file.file_name, "requesting upload credential");

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected { status, message });
        }

        let body: PresignResponse = response.json().await?;
        body.into_credential()
    }
}
