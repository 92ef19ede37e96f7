//! Resumable stream context
//!
//! A producer task drains a chat turn's SSE frames into a [`StreamStore`] so
//! that a client can reattach by stream id, replaying what it missed and then
//! following the live tail. The store is configured once, on first use, from
//! `STREAM_STORE_URL`.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use lru::LruCache;
use thiserror::Error;
use tokio::sync::{OnceCell, broadcast};
use url::Url;
use uuid::Uuid;

use crate::config::AppConfig;

const DEFAULT_CAPACITY: usize = 1000;
const LIVE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum StreamContextError {
    #[error("invalid stream store URL '{0}'")]
    InvalidUrl(String),
    #[error("unsupported stream store scheme '{0}'")]
    UnsupportedScheme(String),
    #[error("stream '{0}' already exists")]
    AlreadyExists(Uuid),
}

/// One SSE frame with its event id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub data: String,
}

pub type FrameStream = BoxStream<'static, Frame>;

/// Output of [`StreamContext::resumable_stream`]
pub enum StreamOutput {
    /// Live reader over the stored stream
    Resumable(FrameStream),
    /// No store is configured; the source is handed back untouched
    Plain(BoxStream<'static, String>),
}

/// Producer side of a stored stream
#[async_trait]
pub trait StreamWriter: Send {
    async fn write(&mut self, data: String);
    async fn finish(self: Box<Self>);
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn create(&self, stream_id: Uuid) -> Result<Box<dyn StreamWriter>, StreamContextError>;

    /// Frames after `after` followed by the live tail. `None` for unknown
    /// streams and for finished streams with nothing left to replay.
    async fn resume(&self, stream_id: Uuid, after: Option<u64>) -> Option<FrameStream>;
}

struct StreamBuffer {
    frames: Vec<Frame>,
    live: Option<broadcast::Sender<Frame>>,
}

impl StreamBuffer {
    fn is_done(&self) -> bool {
        self.live.is_none()
    }
}

type SharedBuffer = Arc<Mutex<StreamBuffer>>;

fn lock(buffer: &SharedBuffer) -> MutexGuard<'_, StreamBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process store keeping the most recent streams
pub struct MemoryStreamStore {
    streams: Mutex<LruCache<Uuid, SharedBuffer>>,
}

impl MemoryStreamStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            streams: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn get(&self, stream_id: &Uuid) -> Option<SharedBuffer> {
        let mut streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
        streams.get(stream_id).cloned()
    }
}

impl Default for MemoryStreamStore {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

struct MemoryStreamWriter {
    buffer: SharedBuffer,
    next_id: u64,
}

#[async_trait]
impl StreamWriter for MemoryStreamWriter {
    async fn write(&mut self, data: String) {
        self.next_id += 1;
        let frame = Frame {
            id: self.next_id,
            data,
        };
        let mut buffer = lock(&self.buffer);
        if let Some(live) = &buffer.live {
            // No receivers is fine: the frame stays in the replay buffer
            let _ = live.send(frame.clone());
        }
        buffer.frames.push(frame);
    }

    async fn finish(self: Box<Self>) {
        // Dropping the sender ends every live receiver after its backlog
        lock(&self.buffer).live = None;
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn create(&self, stream_id: Uuid) -> Result<Box<dyn StreamWriter>, StreamContextError> {
        let buffer = Arc::new(Mutex::new(StreamBuffer {
            frames: Vec::new(),
            live: Some(broadcast::channel(LIVE_CHANNEL_CAPACITY).0),
        }));

        {
            let mut streams = self.streams.lock().unwrap_or_else(|p| p.into_inner());
            if streams.contains(&stream_id) {
                return Err(StreamContextError::AlreadyExists(stream_id));
            }
            if let Some((evicted, _)) = streams.push(stream_id, buffer.clone()) {
                tracing::debug!(stream_id = %evicted, "Evicted stream from memory store");
            }
        }

        Ok(Box::new(MemoryStreamWriter { buffer, next_id: 0 }))
    }

    async fn resume(&self, stream_id: Uuid, after: Option<u64>) -> Option<FrameStream> {
        let buffer = self.get(&stream_id)?;
        let after = after.unwrap_or(0);

        // Subscribe under the same lock as the snapshot so no frame falls between them
        let (replay, receiver) = {
            let buffer = lock(&buffer);
            let replay: Vec<Frame> = buffer.frames.iter().filter(|f| f.id > after).cloned().collect();
            if buffer.is_done() && (after == 0 || replay.is_empty()) {
                return None;
            }
            (replay, buffer.live.as_ref().map(broadcast::Sender::subscribe))
        };

        let tail = LiveTail {
            buffer,
            receiver,
            backlog: replay.into(),
            last: after,
        };
        Some(stream::unfold(tail, LiveTail::next).boxed())
    }
}

/// Reader state: buffered frames first, then the broadcast channel
struct LiveTail {
    buffer: SharedBuffer,
    receiver: Option<broadcast::Receiver<Frame>>,
    backlog: VecDeque<Frame>,
    last: u64,
}

impl LiveTail {
    /// Refills the backlog from the buffer after the channel dropped frames.
    fn catch_up(&mut self) {
        let buffer = lock(&self.buffer);
        let last = self.last;
        self.backlog
            .extend(buffer.frames.iter().filter(|f| f.id > last).cloned());
        self.receiver = buffer.live.as_ref().map(broadcast::Sender::subscribe);
    }

    async fn next(mut self) -> Option<(Frame, Self)> {
        loop {
            if let Some(frame) = self.backlog.pop_front() {
                self.last = frame.id;
                return Some((frame, self));
            }
            let received = match self.receiver.as_mut() {
                Some(receiver) => receiver.recv().await,
                None => return None,
            };
            match received {
                Ok(frame) if frame.id <= self.last => continue,
                Ok(frame) => {
                    self.last = frame.id;
                    return Some((frame, self));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Stream reader lagged, replaying from buffer");
                    self.catch_up();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Builds the store named by a `STREAM_STORE_URL` value.
pub fn store_from_url(raw: &str) -> Result<Arc<dyn StreamStore>, StreamContextError> {
    let url = Url::parse(raw).map_err(|_| StreamContextError::InvalidUrl(raw.to_string()))?;
    match url.scheme() {
        "memory" => {
            let capacity = url
                .query_pairs()
                .find(|(key, _)| key == "capacity")
                .map(|(_, value)| value.parse::<NonZeroUsize>())
                .transpose()
                .map_err(|_| StreamContextError::InvalidUrl(raw.to_string()))?
                .unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN));
            Ok(Arc::new(MemoryStreamStore::new(capacity)))
        }
        other => Err(StreamContextError::UnsupportedScheme(other.to_string())),
    }
}

/// Lazily configured access to the stream store
pub struct StreamContext {
    url: Option<String>,
    store: OnceCell<Option<Arc<dyn StreamStore>>>,
}

impl StreamContext {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            url: config.stream_store_url.clone().filter(|u| !u.trim().is_empty()),
            store: OnceCell::new(),
        }
    }

    /// Context backed by an already built store
    pub fn with_store(store: Arc<dyn StreamStore>) -> Self {
        Self {
            url: None,
            store: OnceCell::new_with(Some(Some(store))),
        }
    }

    /// Context that never resumes
    pub fn disabled() -> Self {
        Self {
            url: None,
            store: OnceCell::new_with(Some(None)),
        }
    }

    /// The configured store, or `None` in non-resumable mode.
    pub async fn store(&self) -> Result<Option<Arc<dyn StreamStore>>, StreamContextError> {
        self.store
            .get_or_try_init(|| async {
                let Some(url) = &self.url else {
                    tracing::info!("Resumable streams are disabled due to missing STREAM_STORE_URL");
                    return Ok(None);
                };
                let store = store_from_url(url)?;
                tracing::info!("Resumable stream store initialized");
                Ok::<_, StreamContextError>(Some(store))
            })
            .await
            .cloned()
    }

    /// Stores `source` under `stream_id` and returns a live reader. Falls
    /// back to handing `source` back when no store is usable.
    ///
    /// The producer keeps draining `source` after the reader is dropped.
    pub async fn resumable_stream(
        &self,
        stream_id: Uuid,
        source: BoxStream<'static, String>,
    ) -> StreamOutput {
        let store = match self.store().await {
            Ok(Some(store)) => store,
            Ok(None) => return StreamOutput::Plain(source),
            Err(error) => {
                tracing::error!(%error, "Stream store unavailable, streaming without resumption");
                return StreamOutput::Plain(source);
            }
        };

        let mut writer = match store.create(stream_id).await {
            Ok(writer) => writer,
            Err(error) => {
                tracing::error!(%stream_id, %error, "Failed to create resumable stream");
                return StreamOutput::Plain(source);
            }
        };
        let reader = store
            .resume(stream_id, None)
            .await
            .unwrap_or_else(|| stream::empty().boxed());

        tokio::spawn(async move {
            let mut source = source;
            while let Some(data) = source.next().await {
                writer.write(data).await;
            }
            writer.finish().await;
            tracing::debug!(%stream_id, "Stream producer finished");
        });

        StreamOutput::Resumable(reader)
    }

    /// Reattaches to a stored stream after `after_event_id`.
    pub async fn resume_existing_stream(
        &self,
        stream_id: Uuid,
        after_event_id: Option<u64>,
    ) -> Result<Option<FrameStream>, StreamContextError> {
        match self.store().await? {
            Some(store) => Ok(store.resume(stream_id, after_event_id).await),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_all(writer: &mut Box<dyn StreamWriter>, frames: &[&str]) {
        for frame in frames {
            writer.write(frame.to_string()).await;
        }
    }

    fn data(frames: Vec<Frame>) -> Vec<String> {
        frames.into_iter().map(|f| f.data).collect()
    }

    #[tokio::test]
    async fn test_replay_then_live() {
        let store = MemoryStreamStore::default();
        let id = Uuid::new_v4();
        let mut writer = store.create(id).await.unwrap();
        write_all(&mut writer, &["a", "b"]).await;

        let reader = store.resume(id, None).await.unwrap();
        write_all(&mut writer, &["c"]).await;
        writer.finish().await;

        let frames: Vec<Frame> = reader.collect().await;
        assert_eq!(data(frames.clone()), vec!["a", "b", "c"]);
        assert_eq!(frames.iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_resume_after_event_id() {
        let store = MemoryStreamStore::default();
        let id = Uuid::new_v4();
        let mut writer = store.create(id).await.unwrap();
        write_all(&mut writer, &["a", "b", "c"]).await;

        let reader = store.resume(id, Some(2)).await.unwrap();
        writer.finish().await;
        assert_eq!(data(reader.collect().await), vec!["c"]);
    }

    #[tokio::test]
    async fn test_slow_reader_catches_up_from_buffer() {
        let store = MemoryStreamStore::default();
        let id = Uuid::new_v4();
        let mut writer = store.create(id).await.unwrap();
        let reader = store.resume(id, None).await.unwrap();

        // Overrun the live channel before the reader polls once
        let total = LIVE_CHANNEL_CAPACITY as u64 + 200;
        for i in 0..total {
            writer.write(format!("word {i}")).await;
        }
        writer.finish().await;

        let ids: Vec<u64> = reader.map(|f| f.id).collect().await;
        assert_eq!(ids, (1..=total).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_finished_stream_not_resumable() {
        let store = MemoryStreamStore::default();
        let id = Uuid::new_v4();
        let mut writer = store.create(id).await.unwrap();
        write_all(&mut writer, &["a", "b"]).await;
        writer.finish().await;

        assert!(store.resume(id, None).await.is_none());
        assert!(store.resume(id, Some(2)).await.is_none());
        // A client that dropped mid-stream still gets the rest
        assert_eq!(data(store.resume(id, Some(1)).await.unwrap().collect().await), vec!["b"]);
        assert!(store.resume(Uuid::new_v4(), None).await.is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_and_duplicates() {
        let store = MemoryStreamStore::new(NonZeroUsize::new(1).unwrap());
        let first = Uuid::new_v4();
        let _w1 = store.create(first).await.unwrap();
        assert!(matches!(
            store.create(first).await,
            Err(StreamContextError::AlreadyExists(_))
        ));

        let _w2 = store.create(Uuid::new_v4()).await.unwrap();
        assert!(store.resume(first, None).await.is_none());
    }

    #[test]
    fn test_store_from_url() {
        assert!(store_from_url("memory://").is_ok());
        assert!(store_from_url("memory://local?capacity=10").is_ok());
        assert!(matches!(
            store_from_url("memory://local?capacity=0"),
            Err(StreamContextError::InvalidUrl(_))
        ));
        assert!(matches!(
            store_from_url("redis://localhost:6379"),
            Err(StreamContextError::UnsupportedScheme(_))
        ));
        assert!(matches!(store_from_url("not a url"), Err(StreamContextError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_context_without_url_is_disabled() {
        let context = StreamContext::from_config(&AppConfig::default());
        assert!(context.store().await.unwrap().is_none());

        let source = stream::iter(vec!["x".to_string()]).boxed();
        let output = context.resumable_stream(Uuid::new_v4(), source).await;
        let StreamOutput::Plain(source) = output else {
            panic!("expected the source back");
        };
        assert_eq!(source.collect::<Vec<_>>().await, vec!["x"]);
    }

    #[tokio::test]
    async fn test_context_with_bad_scheme_errors() {
        let config = AppConfig {
            stream_store_url: Some("redis://localhost".to_string()),
            ..Default::default()
        };
        let context = StreamContext::from_config(&config);
        assert!(context.store().await.is_err());

        let source = stream::iter(vec!["x".to_string()]).boxed();
        let output = context.resumable_stream(Uuid::new_v4(), source).await;
        assert!(matches!(output, StreamOutput::Plain(_)));
    }

    #[tokio::test]
    async fn test_producer_outlives_reader() {
        let context = StreamContext::with_store(Arc::new(MemoryStreamStore::default()));
        let id = Uuid::new_v4();
        let source = stream::iter(vec!["one".to_string(), "two".to_string()]).boxed();

        let output = context.resumable_stream(id, source).await;
        assert!(matches!(output, StreamOutput::Resumable(_)));
        drop(output);

        // Wait for the producer to drain the source
        for _ in 0..50 {
            if context.resume_existing_stream(id, None).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let rest = context.resume_existing_stream(id, Some(1)).await.unwrap().unwrap();
        assert_eq!(data(rest.collect().await), vec!["two"]);
    }
}
