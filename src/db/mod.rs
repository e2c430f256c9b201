mod cleaner;
mod compactor;
mod object;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::Settings;
use crate::crypt::EncryptionKey;
use crate::error::{Error, Result};
use crate::index::{Clock, SystemClock};
use crate::key::Key;
use object::DatabaseObject;

/// Capacity of the actor's mailbox. Senders briefly park once it fills; the
/// actor always drains.
const QUEUE_DEPTH: usize = 256;

/// Work posted to the cache queue. Public operations carry a oneshot for the
/// reply; the rest are completions posted back by background workers.
pub(crate) enum Task {
    Open {
        key: EncryptionKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Put {
        key: Key,
        value: Vec<u8>,
        tag: u8,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        key: Key,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Remove {
        key: Key,
        reply: oneshot::Sender<()>,
    },
    Clear {
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<Stats>,
    },
    CompactorDone {
        generation: u64,
        result: std::result::Result<compactor::Done, ()>,
    },
    CleanerDone {
        generation: u64,
    },
}

/// Aggregate numbers over the live index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    pub entries: usize,
    pub total_size: i64,
}

/// An encrypted, bounded, LRU-ish cache of byte blobs under one directory.
///
/// All operations post to a single-threaded actor owning the index and the
/// binlog; callers may be on any task or thread. Dropping the handle shuts
/// the actor down after it finishes the queued work.
pub struct Database {
    base: PathBuf,
    sender: mpsc::Sender<Task>,
}

impl Database {
    /// Creates the store handle and spawns its actor. Must run inside a tokio
    /// runtime. No files are touched until [`open`](Self::open).
    pub fn new(path: impl Into<PathBuf>, settings: Settings) -> Result<Self> {
        Self::with_clock(path, settings, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new) with an injected wall clock.
    pub fn with_clock(
        path: impl Into<PathBuf>,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        let base = path.into();
        let (sender, receiver) = mpsc::channel(QUEUE_DEPTH);
        let object = DatabaseObject::new(base.clone(), settings, clock, sender.downgrade());
        tokio::spawn(run(object, receiver));
        Ok(Self { base, sender })
    }

    pub async fn open(&self, key: EncryptionKey) -> Result<()> {
        self.request(|reply| Task::Open { key, reply })
            .await
            .unwrap_or_else(|| Err(self.gone()))
    }

    pub async fn put(&self, key: Key, value: Vec<u8>) -> Result<()> {
        self.put_tagged(key, value, 0).await
    }

    /// A put carrying a caller-defined tag byte, persisted with the entry.
    pub async fn put_tagged(&self, key: Key, value: Vec<u8>, tag: u8) -> Result<()> {
        self.request(|reply| Task::Put {
            key,
            value,
            tag,
            reply,
        })
        .await
        .unwrap_or_else(|| Err(self.gone()))
    }

    /// The stored value, or empty on a miss or corruption.
    pub async fn get(&self, key: Key) -> Vec<u8> {
        self.request(|reply| Task::Get { key, reply })
            .await
            .unwrap_or_default()
    }

    pub async fn remove(&self, key: Key) {
        let _ = self.request(|reply| Task::Remove { key, reply }).await;
    }

    /// Flushes pending bundles, stops background workers and releases the
    /// files. Idempotent; the store can be opened again afterwards.
    pub async fn close(&self) {
        let _ = self.request(|reply| Task::Close { reply }).await;
    }

    /// Rotates to a fresh, empty version. Only valid while closed.
    pub async fn clear(&self) -> Result<()> {
        self.request(|reply| Task::Clear { reply })
            .await
            .unwrap_or_else(|| Err(self.gone()))
    }

    pub async fn stats(&self) -> Stats {
        self.request(|reply| Task::Stats { reply })
            .await
            .unwrap_or_default()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Task) -> Option<T> {
        let (reply, response) = oneshot::channel();
        if self.sender.send(build(reply)).await.is_err() {
            return None;
        }
        response.await.ok()
    }

    fn gone(&self) -> Error {
        Error::Io(self.base.clone())
    }
}

/// The cache queue: one loop owning all mutable state, woken by tasks and by
/// the two timer deadlines the object arms.
async fn run(mut object: DatabaseObject, mut tasks: mpsc::Receiver<Task>) {
    loop {
        tokio::select! {
            task = tasks.recv() => match task {
                Some(task) => object.handle(task),
                None => {
                    // Every handle dropped: flush and stop.
                    object.close();
                    break;
                }
            },
            _ = deadline(object.write_bundles_at) => object.on_write_bundles_timer(),
            _ = deadline(object.prune_at) => object.on_prune_timer(),
        }
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
