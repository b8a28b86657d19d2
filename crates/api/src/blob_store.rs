//! Blob store collaborator for attachments
//!
//! Uploaded bytes are forwarded untouched; only the returned descriptor is
//! kept on messages.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use deskline_shared::{Attachment, ContentKind};

/// Descriptor of a stored blob
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBlob {
    #[serde(flatten)]
    pub attachment: Attachment,
    /// Container format reported by the store (e.g. `webm` for voice notes)
    pub format: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Blob store returned an invalid descriptor: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, bytes: Vec<u8>, kind: ContentKind, name: &str) -> Result<StoredBlob, BlobError>;
}

/// Upstream response body
#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
    size: i64,
    mime: String,
    #[serde(default)]
    format: Option<String>,
}

/// Blob store reached over HTTP
#[derive(Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn store(&self, bytes: Vec<u8>, kind: ContentKind, name: &str) -> Result<StoredBlob, BlobError> {
        if kind == ContentKind::Text {
            return Err(BlobError::InvalidResponse("text is not a blob kind".to_string()));
        }

        let size = bytes.len();
        let response: UploadResponse = self
            .client
            .post(format!("{}/upload", self.base_url))
            .query(&[("kind", kind.as_str()), ("name", name)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.url.is_empty() {
            return Err(BlobError::InvalidResponse("empty url".to_string()));
        }

        tracing::debug!(kind = %kind, size, url = %response.url, "Stored blob");

        Ok(StoredBlob {
            attachment: Attachment {
                url: response.url,
                name: name.to_string(),
                size: response.size,
                mime: response.mime,
            },
            format: response.format,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_decodes_descriptor() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/upload")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("kind".into(), "voice".into()),
                Matcher::UrlEncoded("name".into(), "note.webm".into()),
            ]))
            .match_body(b"RIFF".to_vec())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "url": "https://blobs.example/abc",
                    "size": 4,
                    "mime": "audio/webm",
                    "format": "webm"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let store = HttpBlobStore::new(format!("{}/", server.url()));
        let blob = store
            .store(b"RIFF".to_vec(), ContentKind::Voice, "note.webm")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(blob.attachment.url, "https://blobs.example/abc");
        assert_eq!(blob.attachment.name, "note.webm");
        assert_eq!(blob.attachment.size, 4);
        assert_eq!(blob.format.as_deref(), Some("webm"));

        let value = serde_json::to_value(&blob).unwrap();
        assert_eq!(value["mime"], "audio/webm");
        assert_eq!(value["format"], "webm");
    }

    #[tokio::test]
    async fn test_upstream_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/upload")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let store = HttpBlobStore::new(server.url());
        assert!(matches!(
            store.store(vec![1, 2, 3], ContentKind::File, "a.bin").await,
            Err(BlobError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_text_kind() {
        let store = HttpBlobStore::new("http://127.0.0.1:9");
        assert!(store.store(vec![1], ContentKind::Text, "a.txt").await.is_err());
    }
}
