// Media buffer engine adapter: serializes operations per content type over
// the platform sink and answers buffered-range queries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use presentation::StreamType;

use crate::error::{ErrorDetail, PlayerError};
use crate::media::BufferedRange;

/// Errors from the platform sink. Quota is special-cased so the streaming
/// engine can evict and retry.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("append exceeded the buffer quota")]
    QuotaExceeded,
    #[error("buffer operation failed: {0}")]
    Failed(String),
}

/// One platform source buffer (SourceBuffer analog).
#[async_trait]
pub trait SourceBufferSink: Send + Sync {
    async fn append(&self, data: Bytes) -> Result<(), SinkError>;
    async fn remove(&self, start: f64, end: f64) -> Result<(), SinkError>;
    fn buffered(&self) -> Vec<BufferedRange>;
    fn set_timestamp_offset(&self, offset: f64);
    fn set_append_window(&self, start: f64, end: f64);
}

/// The platform media-buffer surface (MediaSource analog).
#[async_trait]
pub trait MediaSink: Send + Sync {
    fn create_source_buffer(
        &self,
        content_type: StreamType,
        full_mime_type: &str,
    ) -> Result<Arc<dyn SourceBufferSink>, PlayerError>;
    fn set_duration(&self, duration: f64);
    fn duration(&self) -> f64;
    async fn end_of_stream(&self) -> Result<(), PlayerError>;
}

struct TypeBuffer {
    sink: Arc<dyn SourceBufferSink>,
    /// Serializes operations on this buffer; platform buffers reject
    /// overlapping operations.
    op_lock: Arc<tokio::sync::Mutex<()>>,
    mime: String,
}

/// Per-type buffered totals, as reported by `get_buffered_info`.
#[derive(Debug, Clone, Default)]
pub struct BufferedInfo {
    pub total: Vec<BufferedRange>,
    pub audio: Vec<BufferedRange>,
    pub video: Vec<BufferedRange>,
    pub text: Vec<BufferedRange>,
}

/// Adapter the streaming engine drives. Policy (eviction, quota back-off,
/// windows) lives in the engine; this layer only executes operations.
pub struct MediaBufferEngine {
    sink: Arc<dyn MediaSink>,
    buffers: RwLock<HashMap<StreamType, TypeBuffer>>,
}

impl MediaBufferEngine {
    pub fn new(sink: Arc<dyn MediaSink>) -> Self {
        Self {
            sink,
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Creates one source buffer per content type.
    pub fn init(&self, mime_types: &[(StreamType, String)]) -> Result<(), PlayerError> {
        let mut buffers = self.buffers.write();
        for (content_type, mime) in mime_types {
            let sink = self.sink.create_source_buffer(*content_type, mime)?;
            buffers.insert(
                *content_type,
                TypeBuffer {
                    sink,
                    op_lock: Arc::new(tokio::sync::Mutex::new(())),
                    mime: mime.clone(),
                },
            );
        }
        Ok(())
    }

    pub fn has_type(&self, content_type: StreamType) -> bool {
        self.buffers.read().contains_key(&content_type)
    }

    pub fn mime_for(&self, content_type: StreamType) -> Option<String> {
        self.buffers.read().get(&content_type).map(|b| b.mime.clone())
    }

    /// Recreates the text buffer for a new MIME type (after a text-stream
    /// switch across container formats).
    pub fn reinit_text(&self, full_mime_type: &str) -> Result<(), PlayerError> {
        let sink = self
            .sink
            .create_source_buffer(StreamType::Text, full_mime_type)?;
        self.buffers.write().insert(
            StreamType::Text,
            TypeBuffer {
                sink,
                op_lock: Arc::new(tokio::sync::Mutex::new(())),
                mime: full_mime_type.to_string(),
            },
        );
        Ok(())
    }

    fn buffer(&self, content_type: StreamType) -> Result<(Arc<dyn SourceBufferSink>, Arc<tokio::sync::Mutex<()>>), PlayerError> {
        self.buffers
            .read()
            .get(&content_type)
            .map(|b| (b.sink.clone(), b.op_lock.clone()))
            .ok_or_else(|| {
                PlayerError::critical(ErrorDetail::MediaSourceOperationFailed {
                    reason: format!("no buffer for {content_type}"),
                })
            })
    }

    pub fn set_duration(&self, duration: f64) {
        self.sink.set_duration(duration);
    }

    pub fn duration(&self) -> f64 {
        self.sink.duration()
    }

    /// Applies the timestamp offset and append window before segments of a
    /// new period or stream are appended.
    pub async fn set_stream_properties(
        &self,
        content_type: StreamType,
        timestamp_offset: f64,
        append_window_start: f64,
        append_window_end: f64,
    ) -> Result<(), PlayerError> {
        let (sink, lock) = self.buffer(content_type)?;
        let _guard = lock.lock().await;
        sink.set_timestamp_offset(timestamp_offset);
        sink.set_append_window(append_window_start, append_window_end);
        Ok(())
    }

    /// Appends media bytes; quota errors pass through as [`SinkError`] for
    /// the engine's eviction-and-retry loop.
    pub async fn append_buffer(
        &self,
        content_type: StreamType,
        data: Bytes,
    ) -> Result<(), SinkError> {
        let (sink, lock) = self
            .buffer(content_type)
            .map_err(|e| SinkError::Failed(e.to_string()))?;
        let _guard = lock.lock().await;
        sink.append(data).await
    }

    pub async fn remove(
        &self,
        content_type: StreamType,
        start: f64,
        end: f64,
    ) -> Result<(), PlayerError> {
        let (sink, lock) = self.buffer(content_type)?;
        let _guard = lock.lock().await;
        sink.remove(start, end).await.map_err(|e| {
            PlayerError::critical(ErrorDetail::MediaSourceOperationFailed {
                reason: e.to_string(),
            })
        })
    }

    pub async fn clear(&self, content_type: StreamType) -> Result<(), PlayerError> {
        debug!(content_type = %content_type, "Clearing buffer");
        self.remove(content_type, 0.0, f64::INFINITY).await
    }

    pub async fn end_of_stream(&self) -> Result<(), PlayerError> {
        self.sink.end_of_stream().await
    }

    pub fn buffered(&self, content_type: StreamType) -> Vec<BufferedRange> {
        self.buffers
            .read()
            .get(&content_type)
            .map(|b| b.sink.buffered())
            .unwrap_or_default()
    }

    pub fn is_buffered(&self, content_type: StreamType, time: f64) -> bool {
        self.buffered(content_type).iter().any(|r| r.contains(time))
    }

    /// Seconds buffered ahead of `time`, within the range containing it.
    pub fn buffered_ahead_of(&self, content_type: StreamType, time: f64) -> f64 {
        // A small fudge keeps range-edge jitter from reading as "nothing
        // buffered".
        const EDGE_FUDGE: f64 = 0.05;
        self.buffered(content_type)
            .iter()
            .find(|r| r.contains(time + EDGE_FUDGE) || r.contains(time))
            .map(|r| (r.end - time).max(0.0))
            .unwrap_or(0.0)
    }

    pub fn buffer_start(&self, content_type: StreamType) -> Option<f64> {
        self.buffered(content_type).first().map(|r| r.start)
    }

    pub fn buffer_end(&self, content_type: StreamType) -> Option<f64> {
        self.buffered(content_type).last().map(|r| r.end)
    }

    /// Ranges playable across all active A/V types: the intersection of
    /// per-type buffered ranges. Text does not gate playback.
    pub fn playable_ranges(&self) -> Vec<BufferedRange> {
        let buffers = self.buffers.read();
        let mut av_types = [StreamType::Audio, StreamType::Video]
            .into_iter()
            .filter(|t| buffers.contains_key(t));
        let Some(first) = av_types.next() else {
            return Vec::new();
        };
        let mut result = buffers[&first].sink.buffered();
        for content_type in av_types {
            result = intersect(&result, &buffers[&content_type].sink.buffered());
        }
        result
    }

    pub fn get_buffered_info(&self) -> BufferedInfo {
        BufferedInfo {
            total: self.playable_ranges(),
            audio: self.buffered(StreamType::Audio),
            video: self.buffered(StreamType::Video),
            text: self.buffered(StreamType::Text),
        }
    }
}

fn intersect(a: &[BufferedRange], b: &[BufferedRange]) -> Vec<BufferedRange> {
    let mut out = Vec::new();
    for range_a in a {
        for range_b in b {
            let start = range_a.start.max(range_b.start);
            let end = range_a.end.min(range_b.end);
            if start < end {
                out.push(BufferedRange::new(start, end));
            }
        }
    }
    out
}

pub mod fake;
