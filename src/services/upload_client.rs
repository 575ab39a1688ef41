//! Outbound multipart upload client for the exchange's `/upload` contract.

use crate::services::burst::{ArchiveUploader, BundleError};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::Path;
use tokio_util::io::ReaderStream;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
    error: Option<String>,
}

/// Posts files to the exchange as `multipart/form-data` and returns the
/// download link from the response body.
///
/// The contract is at-least-once: there is no idempotency token, so a
/// caller retrying after a network error cannot assume the first attempt
/// never landed. This client does not retry on its own; failures surface
/// verbatim to the burst originator.
#[derive(Clone)]
pub struct HttpUploader {
    client: Client,
    upload_url: String,
}

impl HttpUploader {
    pub fn new(upload_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            upload_url: upload_url.into(),
        }
    }
}

#[async_trait]
impl ArchiveUploader for HttpUploader {
    async fn upload(&self, path: &Path, file_name: &str) -> Result<String, BundleError> {
        // Stream the file so archive size never has to fit in memory.
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|err| BundleError::Upload(format!("opening {}: {}", path.display(), err)))?;
        let length = file
            .metadata()
            .await
            .map_err(|err| BundleError::Upload(format!("reading {}: {}", path.display(), err)))?
            .len();

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = reqwest::multipart::Part::stream_with_length(body, length)
            .file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|err| BundleError::Upload(err.to_string()))?;

        let status = response.status();
        let payload: UploadResponse = response
            .json()
            .await
            .map_err(|err| BundleError::Upload(format!("HTTP {}: {}", status, err)))?;

        if status.is_success() {
            let url = payload
                .url
                .ok_or_else(|| BundleError::Upload("response carried no url".to_string()))?;
            debug!(file_name, url = %url, "archive uploaded");
            Ok(url)
        } else {
            Err(BundleError::Upload(
                payload
                    .error
                    .unwrap_or_else(|| format!("upload failed: HTTP {status}")),
            ))
        }
    }
}
