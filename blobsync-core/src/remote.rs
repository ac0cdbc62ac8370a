use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::TransferError;

/// Caller-supplied metadata attached to an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_metadata: BTreeMap<String, String>,
}

impl UploadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_metadata.insert(key.into(), value.into());
        self
    }
}

/// Opaque progress marker for a chunked upload.
///
/// Only the [`RemoteTransfer`] implementation that issued a token knows how to
/// read it; everyone else stores and replays it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Metadata the remote service reports once an upload is finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub path: String,
    pub size: u64,
    pub generation: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default)]
    pub download_token: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
}

/// Result of sending one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// More chunks remain; the token reflects everything acknowledged so far.
    Continue(ResumeToken),
    /// The remote object is complete.
    Finish(RemoteMetadata),
}

#[async_trait]
pub trait RemoteTransfer: Send + Sync {
    /// Opens a chunked upload session. No content bytes are sent yet.
    async fn begin_upload(
        &self,
        path: &str,
        content: &[u8],
        metadata: &UploadMetadata,
    ) -> Result<ResumeToken, TransferError>;

    /// Sends the next chunk after the position recorded in `token`.
    async fn advance(
        &self,
        token: &ResumeToken,
        content: &[u8],
    ) -> Result<ChunkOutcome, TransferError>;

    async fn delete(&self, path: &str) -> Result<(), TransferError>;

    /// Asks the remote for a download reference of an existing object.
    /// Unknown paths fail with [`TransferError::NotFound`].
    async fn lookup_download_reference(&self, path: &str) -> Result<Url, TransferError>;

    /// Derives a stable download reference from finish metadata.
    fn download_reference(&self, metadata: &RemoteMetadata) -> Url;
}
