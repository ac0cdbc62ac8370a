mod client;
mod remote;

pub use client::{ApiErrorClass, BlobServiceClient, TransferError};
pub use remote::{
    ChunkOutcome, RemoteMetadata, RemoteTransfer, ResumeToken, UploadMetadata,
};
pub use reqwest::StatusCode;
pub use url::Url;
