use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::backoff::RetryPolicy;
use crate::store::{self, CollectionNames};

const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RETRY_MAX_MS: u64 = 60_000;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub collections: CollectionNames,
    pub retry: RetryPolicy,
}

impl SyncConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path = match read_string_env("BLOBSYNC_DB_PATH") {
            Some(value) => PathBuf::from(value),
            None => store::default_db_path().context("no default database location")?,
        };
        let defaults = CollectionNames::default();
        let collections = CollectionNames {
            cache: read_string_env("BLOBSYNC_CACHE_COLLECTION").unwrap_or(defaults.cache),
            resolved: read_string_env("BLOBSYNC_RESOLVED_COLLECTION")
                .unwrap_or(defaults.resolved),
            queue: read_string_env("BLOBSYNC_QUEUE_COLLECTION").unwrap_or(defaults.queue),
            failed: read_string_env("BLOBSYNC_FAILED_COLLECTION").unwrap_or(defaults.failed),
        };
        collections
            .validate()
            .context("invalid collection name in environment")?;
        let retry = retry_policy(
            read_u64_env("BLOBSYNC_RETRY_MAX_ATTEMPTS", 0),
            read_u64_env("BLOBSYNC_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
            read_u64_env("BLOBSYNC_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS),
        );

        Ok(Self {
            db_path,
            api_url: read_string_env("BLOBSYNC_API_URL"),
            api_token: read_string_env("BLOBSYNC_API_TOKEN"),
            collections,
            retry,
        })
    }
}

/// Zero attempts keeps the halt-on-error policy.
fn retry_policy(max_attempts: u64, base_ms: u64, max_ms: u64) -> RetryPolicy {
    if max_attempts == 0 {
        return RetryPolicy::Halt;
    }
    RetryPolicy::backoff(
        u32::try_from(max_attempts).unwrap_or(u32::MAX),
        Duration::from_millis(base_ms),
        Duration::from_millis(max_ms.max(base_ms)),
    )
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
