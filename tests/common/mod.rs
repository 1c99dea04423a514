#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use chunked_store::{
    Backend, ByteRange, Chunker, ChunkerConfig, ChunkerError, ChunkerResult, CompositeObject,
    Features, HashType, MemoryBackend, ObjectInfo, SourceInfo,
    backend::BoxReader,
    models::object::{BaseObject, DirEntry},
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with small chunks and the test naming pattern.
pub fn config(chunk_size: u64) -> ChunkerConfig {
    ChunkerConfig {
        chunk_size,
        name_format: "*.chunk.###".into(),
        ..ChunkerConfig::default()
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub async fn put(chunker: &Chunker, remote: &str, data: &[u8]) -> CompositeObject {
    let info = ObjectInfo::new(remote, Some(data.len() as u64), Utc::now());
    chunker.put(data, &info).await.unwrap()
}

/// Store an object directly on the wrapped backend.
pub async fn put_raw(base: &dyn Backend, remote: &str, data: &[u8]) -> BaseObject {
    let info = ObjectInfo::new(remote, Some(data.len() as u64), Utc::now());
    let mut reader = data;
    base.put(&mut reader, &info).await.unwrap()
}

pub async fn read_all(chunker: &Chunker, obj: &CompositeObject, range: ByteRange) -> Vec<u8> {
    let mut reader = chunker.open(obj, range).await.unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await.unwrap();
    out
}

/// What to do on the chosen call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fail the `n`-th call only.
    Fail,
    /// Fail the `n`-th call and every later one.
    FailFrom,
    Hang,
}

/// Backend method whose calls are counted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    Put,
    Copy,
    Rename,
}

/// Memory backend whose `n`-th call (1 based) of one method fails or never
/// completes. Puts are targeted unless [`FaultyBackend::on`] says otherwise.
pub struct FaultyBackend {
    pub inner: Arc<MemoryBackend>,
    op: FaultOp,
    fault_at: usize,
    fault: Fault,
    calls: AtomicUsize,
}

impl FaultyBackend {
    pub fn new(inner: Arc<MemoryBackend>, fault_at: usize, fault: Fault) -> Self {
        Self {
            inner,
            op: FaultOp::Put,
            fault_at,
            fault,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on(mut self, op: FaultOp) -> Self {
        self.op = op;
        self
    }

    async fn inject(&self, op: FaultOp) -> ChunkerResult<()> {
        if op != self.op {
            return Ok(());
        }
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let hit = match self.fault {
            Fault::FailFrom => count >= self.fault_at,
            Fault::Fail | Fault::Hang => count == self.fault_at,
        };
        if !hit {
            return Ok(());
        }
        match self.fault {
            Fault::Fail | Fault::FailFrom => Err(ChunkerError::Io(std::io::Error::other(
                format!("injected {op:?} failure"),
            ))),
            Fault::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Backend for FaultyBackend {
    fn config_id(&self) -> String {
        self.inner.config_id()
    }

    fn features(&self) -> Features {
        self.inner.features()
    }

    fn hashes(&self) -> Vec<HashType> {
        self.inner.hashes()
    }

    async fn list(&self, dir: &str) -> ChunkerResult<Vec<DirEntry>> {
        self.inner.list(dir).await
    }

    async fn stat(&self, remote: &str) -> ChunkerResult<BaseObject> {
        self.inner.stat(remote).await
    }

    async fn open(&self, obj: &BaseObject, range: ByteRange) -> ChunkerResult<BoxReader> {
        self.inner.open(obj, range).await
    }

    async fn put(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        info: &dyn SourceInfo,
    ) -> ChunkerResult<BaseObject> {
        self.inject(FaultOp::Put).await?;
        self.inner.put(reader, info).await
    }

    async fn remove(&self, obj: &BaseObject) -> ChunkerResult<()> {
        self.inner.remove(obj).await
    }

    async fn rename(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        self.inject(FaultOp::Rename).await?;
        self.inner.rename(obj, remote).await
    }

    async fn copy(&self, obj: &BaseObject, remote: &str) -> ChunkerResult<BaseObject> {
        self.inject(FaultOp::Copy).await?;
        self.inner.copy(obj, remote).await
    }

    async fn hash(&self, obj: &BaseObject, kind: HashType) -> ChunkerResult<Option<String>> {
        self.inner.hash(obj, kind).await
    }
}
