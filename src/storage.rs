use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::CoreError;
use crate::models::DocumentSource;

/// Blob storage is an external collaborator: the core only ever needs
/// `download(bucket, key) -> bytes`.
#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoreError>;
}

/// HTTP-backed implementation. Supabase (and S3-compatible) storage
/// exposes plain object downloads over HTTPS, so a `reqwest` GET against
/// `{base_url}/storage/v1/object/public/{bucket}/{key}` is sufficient --
/// no object-storage SDK is needed for a read-only consumer.
pub struct HttpBlobStorage {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobStorage {
    pub fn new(base_url: String) -> Self {
        Self { client: reqwest::Client::new(), base_url }
    }
}

#[async_trait]
impl BlobStorage for HttpBlobStorage {
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CoreError> {
        let url = format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url.trim_end_matches('/'),
            bucket,
            key
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::Storage(format!("download request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::Storage(format!(
                "download of {bucket}/{key} failed with status {}",
                response.status()
            )));
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| CoreError::Storage(format!("failed reading download body: {e}")))
    }
}

fn storage_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/storage/v1/object/(?:(?:public|sign)/)?(.+)$").unwrap())
}

/// Resolves a raw `supabase_path` value into `(bucket, key)`.
/// `supabase_path` may be a plain bucket-relative key, or a
/// full URL matching the storage object pattern. The bucket used for the
/// download is always inferred from `document_source`; any bucket name
/// embedded in the URL is stripped, not trusted.
pub fn resolve_storage_key(supabase_path: &str, document_source: DocumentSource) -> String {
    let bucket = document_source.bucket();

    let captured = storage_url_regex()
        .captures(supabase_path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    let raw_key = captured.unwrap_or_else(|| supabase_path.to_string());

    let prefix = format!("{bucket}/");
    if let Some(stripped) = raw_key.strip_prefix(&prefix) {
        stripped.to_string()
    } else {
        raw_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_key_passes_through() {
        assert_eq!(
            resolve_storage_key("2024/01/doc.pdf", DocumentSource::Index),
            "2024/01/doc.pdf"
        );
    }

    #[test]
    fn public_url_strips_prefix_and_bucket() {
        let url = "https://x.supabase.co/storage/v1/object/public/index/2024/01/doc.pdf";
        assert_eq!(resolve_storage_key(url, DocumentSource::Index), "2024/01/doc.pdf");
    }

    #[test]
    fn signed_url_strips_prefix_and_bucket() {
        let url = "https://x.supabase.co/storage/v1/object/sign/actes/2024/01/doc.pdf?token=abc";
        assert_eq!(resolve_storage_key(url, DocumentSource::Acte), "2024/01/doc.pdf?token=abc");
    }

    #[test]
    fn url_without_matching_bucket_keeps_whole_capture() {
        let url = "https://x.supabase.co/storage/v1/object/public/other-bucket/doc.pdf";
        assert_eq!(resolve_storage_key(url, DocumentSource::Index), "other-bucket/doc.pdf");
    }
}
