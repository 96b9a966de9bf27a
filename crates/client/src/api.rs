//! Document upload boundary: one multipart POST returning the new
//! document's id.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use super::config::ClientConfig;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentUpload {
    pub document_id: String,
}

pub struct ApiClient {
    http: reqwest::Client,
    api_base_url: String,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base_url: config.api_base_url.clone(),
        }
    }

    pub async fn upload_document(&self, path: &Path) -> ApiResult<DocumentUpload> {
        let bytes = tokio::fs::read(path).await.context(ReadDocumentSnafu {
            stage: "read-document",
            path: path.to_path_buf(),
        })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());

        tracing::info!(file = %file_name, size_bytes = bytes.len(), "uploading document");

        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(format!("{}/upload", self.api_base_url))
            .multipart(form)
            .send()
            .await
            .context(UploadRequestSnafu {
                stage: "upload-request",
            })?;

        let status = response.status();
        if !status.is_success() {
            return UploadStatusSnafu {
                stage: "upload-status",
                status: status.as_u16(),
            }
            .fail();
        }

        let upload = response
            .json::<DocumentUpload>()
            .await
            .context(DecodeUploadSnafu {
                stage: "upload-decode",
            })?;
        tracing::info!(document_id = %upload.document_id, "document uploaded");
        Ok(upload)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("failed to read document at {path:?}"))]
    ReadDocument {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("upload request failed on `{stage}`"))]
    UploadRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("upload rejected with HTTP status {status}"))]
    UploadStatus { stage: &'static str, status: u16 },
    #[snafu(display("upload response did not match the expected shape"))]
    DecodeUpload {
        stage: &'static str,
        source: reqwest::Error,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;
