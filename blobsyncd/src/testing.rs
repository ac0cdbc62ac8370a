//! In-process stand-in for the blob service used by the crate's tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use blobsync_core::{
    ChunkOutcome, RemoteMetadata, RemoteTransfer, ResumeToken, StatusCode, TransferError,
    UploadMetadata,
};
use tokio::sync::Semaphore;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Begin(String),
    /// An acknowledged chunk starting at `offset`.
    Chunk { path: String, offset: usize },
    Delete(String),
    Lookup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Begin,
    /// The chunk starting at this offset.
    Chunk(usize),
    Delete,
}

struct Injected {
    path: String,
    at: FailAt,
    remaining: u32,
    status: StatusCode,
}

struct Session {
    path: String,
    total: usize,
    metadata: UploadMetadata,
}

#[derive(Default)]
struct State {
    sessions: HashMap<u64, Session>,
    objects: HashMap<String, RemoteMetadata>,
    calls: Vec<Call>,
    failures: Vec<Injected>,
    gates: HashMap<String, Arc<Semaphore>>,
    waiting: HashMap<String, usize>,
    next_session: u64,
    next_generation: u64,
}

pub struct FakeRemote {
    chunk_size: usize,
    state: Mutex<State>,
}

impl FakeRemote {
    pub fn new(chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            chunk_size,
            state: Mutex::new(State::default()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn chunk_offsets(&self, path: &str) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Chunk { path: p, offset } if p == path => Some(offset),
                _ => None,
            })
            .collect()
    }

    pub fn object(&self, path: &str) -> Option<RemoteMetadata> {
        self.state.lock().unwrap().objects.get(path).cloned()
    }

    pub fn put_object(&self, path: &str, size: u64) -> RemoteMetadata {
        let mut state = self.state.lock().unwrap();
        state.next_generation += 1;
        let metadata = RemoteMetadata {
            path: path.to_string(),
            size,
            generation: state.next_generation.to_string(),
            content_type: None,
            md5: None,
            download_token: None,
            updated: None,
        };
        state.objects.insert(path.to_string(), metadata.clone());
        metadata
    }

    pub fn fail(&self, path: &str, at: FailAt, times: u32, status: StatusCode) {
        self.state.lock().unwrap().failures.push(Injected {
            path: path.to_string(),
            at,
            remaining: times,
            status,
        });
    }

    /// Parks every chunk and delete for `path` until [`FakeRemote::open_gate`].
    pub fn gate(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .gates
            .insert(path.to_string(), Arc::new(Semaphore::new(0)));
    }

    /// Removes the gate, letting parked and future requests through.
    pub fn open_gate(&self, path: &str) {
        if let Some(gate) = self.state.lock().unwrap().gates.remove(path) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Waits until a request for `path` is parked at its gate.
    pub async fn wait_blocked(&self, path: &str) {
        for _ in 0..500 {
            if self.state.lock().unwrap().waiting.get(path).copied().unwrap_or(0) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("nothing blocked on {path}");
    }

    async fn pass_gate(&self, path: &str) {
        let gate = {
            let mut state = self.state.lock().unwrap();
            let gate = state.gates.get(path).cloned();
            if gate.is_some() {
                *state.waiting.entry(path.to_string()).or_default() += 1;
            }
            gate
        };
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
            let mut state = self.state.lock().unwrap();
            if let Some(count) = state.waiting.get_mut(path) {
                *count -= 1;
            }
        }
    }

    fn injected(&self, path: &str, at: FailAt) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        let hit = state
            .failures
            .iter_mut()
            .find(|f| f.path == path && f.at == at && f.remaining > 0);
        match hit {
            Some(failure) => {
                failure.remaining -= 1;
                Err(TransferError::Api {
                    status: failure.status,
                    body: "injected".into(),
                })
            }
            None => Ok(()),
        }
    }
}

fn encode(session: u64, offset: usize) -> ResumeToken {
    ResumeToken::new(format!("fake:{session}:{offset}"))
}

fn decode(token: &ResumeToken) -> (u64, usize) {
    let mut parts = token.as_str().split(':').skip(1);
    let session = parts.next().unwrap().parse().unwrap();
    let offset = parts.next().unwrap().parse().unwrap();
    (session, offset)
}

#[async_trait]
impl RemoteTransfer for FakeRemote {
    async fn begin_upload(
        &self,
        path: &str,
        content: &[u8],
        metadata: &UploadMetadata,
    ) -> Result<ResumeToken, TransferError> {
        self.injected(path, FailAt::Begin)?;
        let mut state = self.state.lock().unwrap();
        state.next_session += 1;
        let id = state.next_session;
        state.sessions.insert(
            id,
            Session {
                path: path.to_string(),
                total: content.len(),
                metadata: metadata.clone(),
            },
        );
        state.calls.push(Call::Begin(path.to_string()));
        Ok(encode(id, 0))
    }

    async fn advance(
        &self,
        token: &ResumeToken,
        content: &[u8],
    ) -> Result<ChunkOutcome, TransferError> {
        let (id, offset) = decode(token);
        let (path, total, content_type) = {
            let state = self.state.lock().unwrap();
            let session = &state.sessions[&id];
            (
                session.path.clone(),
                session.total,
                session.metadata.content_type.clone(),
            )
        };
        if content.len() != total {
            return Err(TransferError::ContentMismatch {
                expected: total as u64,
                actual: content.len() as u64,
            });
        }
        self.pass_gate(&path).await;
        self.injected(&path, FailAt::Chunk(offset))?;

        let end = (offset + self.chunk_size).min(total);
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Chunk {
            path: path.clone(),
            offset,
        });
        if end < total {
            return Ok(ChunkOutcome::Continue(encode(id, end)));
        }
        state.next_generation += 1;
        let metadata = RemoteMetadata {
            path: path.clone(),
            size: total as u64,
            generation: state.next_generation.to_string(),
            content_type,
            md5: None,
            download_token: None,
            updated: None,
        };
        state.objects.insert(path, metadata.clone());
        Ok(ChunkOutcome::Finish(metadata))
    }

    async fn delete(&self, path: &str) -> Result<(), TransferError> {
        self.pass_gate(path).await;
        self.injected(path, FailAt::Delete)?;
        let mut state = self.state.lock().unwrap();
        state.objects.remove(path);
        state.calls.push(Call::Delete(path.to_string()));
        Ok(())
    }

    async fn lookup_download_reference(&self, path: &str) -> Result<Url, TransferError> {
        let metadata = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Lookup(path.to_string()));
            state.objects.get(path).cloned()
        };
        match metadata {
            Some(metadata) => Ok(self.download_reference(&metadata)),
            None => Err(TransferError::NotFound {
                path: path.to_string(),
            }),
        }
    }

    fn download_reference(&self, metadata: &RemoteMetadata) -> Url {
        let mut url = Url::parse("https://fake.blobs/download").unwrap();
        url.query_pairs_mut()
            .append_pair("path", &metadata.path)
            .append_pair("generation", &metadata.generation);
        url
    }
}
