use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode, redirect};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::remote::{ChunkOutcome, RemoteMetadata, RemoteTransfer, ResumeToken, UploadMetadata};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("remote object not found: {path}")]
    NotFound { path: String },
    #[error("resume token is not readable: {0}")]
    InvalidToken(#[from] serde_json::Error),
    #[error("content length {actual} does not match upload session length {expected}")]
    ContentMismatch { expected: u64, actual: u64 },
    #[error("malformed range header: {0}")]
    MalformedRange(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl TransferError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            TransferError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request(err) => err.is_timeout() || err.is_connect(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

/// HTTP client for the blob service's resumable upload API.
#[derive(Clone)]
pub struct BlobServiceClient {
    http: Client,
    base_url: Url,
    download_url: Url,
    token: String,
}

#[derive(Debug, Serialize)]
struct BeginUploadRequest<'a> {
    size: u64,
    #[serde(flatten)]
    metadata: &'a UploadMetadata,
}

#[derive(Debug, Deserialize)]
struct BeginUploadResponse {
    upload_url: Url,
    chunk_size: u64,
}

/// What the client packs into a [`ResumeToken`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct UploadSession {
    upload_url: Url,
    offset: u64,
    chunk_size: u64,
    total: u64,
}

impl UploadSession {
    fn decode(token: &ResumeToken) -> Result<Self, TransferError> {
        Ok(serde_json::from_str(token.as_str())?)
    }

    fn encode(&self) -> Result<ResumeToken, TransferError> {
        Ok(ResumeToken::new(serde_json::to_string(self)?))
    }
}

impl BlobServiceClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, TransferError> {
        let base_url = Url::parse(base_url)?;
        let download_url = base_url.join("/v1/objects/download")?;
        // 308 is the "keep sending" answer of the upload protocol, not a redirect.
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            base_url,
            download_url,
            token: token.into(),
        })
    }

    pub async fn get_metadata(&self, path: &str) -> Result<RemoteMetadata, TransferError> {
        let mut url = self.endpoint("/v1/objects/metadata")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransferError::NotFound {
                path: path.to_string(),
            });
        }
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransferError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransferError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(Self::api_error(response).await)
        }
    }

    async fn api_error(response: reqwest::Response) -> TransferError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        TransferError::Api { status, body }
    }
}

#[async_trait]
impl RemoteTransfer for BlobServiceClient {
    async fn begin_upload(
        &self,
        path: &str,
        content: &[u8],
        metadata: &UploadMetadata,
    ) -> Result<ResumeToken, TransferError> {
        let mut url = self.endpoint("/v1/uploads")?;
        url.query_pairs_mut().append_pair("path", path);
        let total = content.len() as u64;
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&BeginUploadRequest {
                size: total,
                metadata,
            })
            .send()
            .await?;
        let started: BeginUploadResponse = Self::handle_response(response).await?;
        UploadSession {
            upload_url: started.upload_url,
            offset: 0,
            chunk_size: started.chunk_size.max(1),
            total,
        }
        .encode()
    }

    async fn advance(
        &self,
        token: &ResumeToken,
        content: &[u8],
    ) -> Result<ChunkOutcome, TransferError> {
        let session = UploadSession::decode(token)?;
        let actual = content.len() as u64;
        if actual != session.total {
            return Err(TransferError::ContentMismatch {
                expected: session.total,
                actual,
            });
        }

        let start = session.offset.min(session.total);
        let end = start.saturating_add(session.chunk_size).min(session.total);
        let chunk = content[start as usize..end as usize].to_vec();
        let range = if session.total == 0 {
            "bytes */0".to_string()
        } else {
            format!("bytes {}-{}/{}", start, end.saturating_sub(1), session.total)
        };

        let response = self
            .http
            .put(session.upload_url.clone())
            .bearer_auth(&self.token)
            .header(CONTENT_RANGE, range)
            .body(chunk)
            .send()
            .await?;

        match response.status() {
            StatusCode::PERMANENT_REDIRECT => {
                let offset = match response.headers().get(RANGE) {
                    Some(value) => {
                        let value = value
                            .to_str()
                            .map_err(|_| TransferError::MalformedRange(format!("{value:?}")))?;
                        let offset = parse_acknowledged_range(value)?;
                        if offset > session.total {
                            return Err(TransferError::MalformedRange(value.to_string()));
                        }
                        offset
                    }
                    None => 0,
                };
                Ok(ChunkOutcome::Continue(
                    UploadSession { offset, ..session }.encode()?,
                ))
            }
            status if status.is_success() => Ok(ChunkOutcome::Finish(response.json().await?)),
            _ => Err(Self::api_error(response).await),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), TransferError> {
        let mut url = self.endpoint("/v1/objects")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::api_error(response).await)
    }

    async fn lookup_download_reference(&self, path: &str) -> Result<Url, TransferError> {
        let metadata = self.get_metadata(path).await?;
        Ok(self.download_reference(&metadata))
    }

    fn download_reference(&self, metadata: &RemoteMetadata) -> Url {
        let mut url = self.download_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", &metadata.path);
            query.append_pair("generation", &metadata.generation);
            if let Some(token) = &metadata.download_token {
                query.append_pair("token", token);
            }
        }
        url
    }
}

/// Parses `bytes=0-<last>` into the offset of the next unacknowledged byte.
fn parse_acknowledged_range(value: &str) -> Result<u64, TransferError> {
    let malformed = || TransferError::MalformedRange(value.to_string());
    let (first, last) = value
        .trim()
        .strip_prefix("bytes=")
        .and_then(|range| range.split_once('-'))
        .ok_or_else(malformed)?;
    if first.trim() != "0" {
        return Err(malformed());
    }
    let last: u64 = last.trim().parse().map_err(|_| malformed())?;
    last.checked_add(1).ok_or_else(malformed)
}
