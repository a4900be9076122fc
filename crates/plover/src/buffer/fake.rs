// In-memory media sink for tests and headless operation. Media payloads
// are tiny tagged blobs carrying their own timing, so the fake can track
// buffered ranges the way a real platform derives them from the container.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

use presentation::StreamType;

use crate::buffer::{MediaSink, SinkError, SourceBufferSink};
use crate::error::{ErrorDetail, PlayerError};
use crate::media::BufferedRange;

const SEGMENT_MAGIC: &[u8; 8] = b"PLVRSEG\0";
const INIT_MAGIC: &[u8; 8] = b"PLVRINIT";

/// Builds a fake media segment spanning `[start, end)` seconds.
pub fn segment_bytes(start: f64, end: f64) -> Bytes {
    segment_bytes_sized(start, end, 24)
}

/// Builds a fake media segment padded to `total_len` bytes, for bandwidth
/// estimation tests.
pub fn segment_bytes_sized(start: f64, end: f64, total_len: usize) -> Bytes {
    let mut out = BytesMut::with_capacity(total_len.max(24));
    out.put_slice(SEGMENT_MAGIC);
    out.put_f64_le(start);
    out.put_f64_le(end);
    while out.len() < total_len {
        out.put_u8(0);
    }
    out.freeze()
}

/// Builds a fake init segment.
pub fn init_bytes() -> Bytes {
    Bytes::from_static(INIT_MAGIC)
}

fn parse_segment(data: &[u8]) -> Option<(f64, f64)> {
    if data.len() < 24 || &data[..8] != SEGMENT_MAGIC {
        return None;
    }
    let start = f64::from_le_bytes(data[8..16].try_into().ok()?);
    let end = f64::from_le_bytes(data[16..24].try_into().ok()?);
    Some((start, end))
}

fn merge_in(ranges: &mut Vec<BufferedRange>, new: BufferedRange) {
    const EPS: f64 = 1e-6;
    ranges.push(new);
    ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
    let mut merged: Vec<BufferedRange> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if range.start <= last.end + EPS => {
                last.end = last.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    *ranges = merged;
}

fn remove_span(ranges: &mut Vec<BufferedRange>, start: f64, end: f64) {
    let mut out = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        if range.end <= start || range.start >= end {
            out.push(range);
            continue;
        }
        if range.start < start {
            out.push(BufferedRange::new(range.start, start));
        }
        if range.end > end {
            out.push(BufferedRange::new(end, range.end));
        }
    }
    *ranges = out;
}

#[derive(Default)]
struct FakeBufferState {
    ranges: Vec<BufferedRange>,
    timestamp_offset: f64,
    append_window: (f64, f64),
    init_appends: u32,
    /// `(shifted_start, shifted_end)` of every media append, in order.
    appends: Vec<(f64, f64)>,
}

pub struct FakeSourceBuffer {
    state: Mutex<FakeBufferState>,
    shared: Arc<SinkShared>,
}

impl FakeSourceBuffer {
    pub fn appended_ranges(&self) -> Vec<(f64, f64)> {
        self.state.lock().appends.clone()
    }

    pub fn init_append_count(&self) -> u32 {
        self.state.lock().init_appends
    }

    fn buffered_seconds(&self) -> f64 {
        self.state
            .lock()
            .ranges
            .iter()
            .map(|r| r.end - r.start)
            .sum()
    }
}

#[async_trait]
impl SourceBufferSink for FakeSourceBuffer {
    async fn append(&self, data: Bytes) -> Result<(), SinkError> {
        if data.len() >= 8 && &data[..8] == INIT_MAGIC {
            self.state.lock().init_appends += 1;
            return Ok(());
        }
        let Some((start, end)) = parse_segment(&data) else {
            return Err(SinkError::Failed("unparseable fake media".to_string()));
        };
        let mut state = self.state.lock();
        let shifted_start = start + state.timestamp_offset;
        let shifted_end = end + state.timestamp_offset;
        let (window_start, window_end) = state.append_window;
        let clipped_start = shifted_start.max(window_start);
        let clipped_end = shifted_end.min(window_end);
        if clipped_start >= clipped_end {
            // Entirely outside the window: platform drops it silently.
            return Ok(());
        }

        if let Some(quota) = *self.shared.quota_seconds.lock() {
            let current: f64 = state.ranges.iter().map(|r| r.end - r.start).sum();
            if current + (clipped_end - clipped_start) > quota {
                return Err(SinkError::QuotaExceeded);
            }
        }

        state.appends.push((clipped_start, clipped_end));
        merge_in(&mut state.ranges, BufferedRange::new(clipped_start, clipped_end));
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> Result<(), SinkError> {
        remove_span(&mut self.state.lock().ranges, start, end);
        Ok(())
    }

    fn buffered(&self) -> Vec<BufferedRange> {
        self.state.lock().ranges.clone()
    }

    fn set_timestamp_offset(&self, offset: f64) {
        self.state.lock().timestamp_offset = offset;
    }

    fn set_append_window(&self, start: f64, end: f64) {
        self.state.lock().append_window = (start, end);
    }
}

#[derive(Default)]
struct SinkShared {
    quota_seconds: Mutex<Option<f64>>,
}

#[derive(Default)]
struct FakeSinkState {
    buffers: HashMap<StreamType, Arc<FakeSourceBuffer>>,
    created_mimes: Vec<(StreamType, String)>,
    duration: f64,
    end_of_stream_calls: u32,
    fail_buffer_creation: bool,
}

pub struct FakeMediaSink {
    state: Mutex<FakeSinkState>,
    shared: Arc<SinkShared>,
}

impl FakeMediaSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeSinkState::default()),
            shared: Arc::new(SinkShared::default()),
        })
    }

    /// Caps each buffer at `seconds` of content; appends past the cap fail
    /// with [`SinkError::QuotaExceeded`].
    pub fn set_quota_seconds(&self, seconds: f64) {
        *self.shared.quota_seconds.lock() = Some(seconds);
    }

    pub fn set_fail_buffer_creation(&self, fail: bool) {
        self.state.lock().fail_buffer_creation = fail;
    }

    pub fn buffer(&self, content_type: StreamType) -> Option<Arc<FakeSourceBuffer>> {
        self.state.lock().buffers.get(&content_type).cloned()
    }

    pub fn created_mimes(&self) -> Vec<(StreamType, String)> {
        self.state.lock().created_mimes.clone()
    }

    pub fn end_of_stream_calls(&self) -> u32 {
        self.state.lock().end_of_stream_calls
    }
}

#[async_trait]
impl MediaSink for FakeMediaSink {
    fn create_source_buffer(
        &self,
        content_type: StreamType,
        full_mime_type: &str,
    ) -> Result<Arc<dyn SourceBufferSink>, PlayerError> {
        let mut state = self.state.lock();
        if state.fail_buffer_creation {
            return Err(PlayerError::critical(ErrorDetail::ContentUnsupportedByBrowser));
        }
        let buffer = Arc::new(FakeSourceBuffer {
            state: Mutex::new(FakeBufferState {
                append_window: (0.0, f64::INFINITY),
                ..Default::default()
            }),
            shared: self.shared.clone(),
        });
        state
            .created_mimes
            .push((content_type, full_mime_type.to_string()));
        state.buffers.insert(content_type, buffer.clone());
        Ok(buffer)
    }

    fn set_duration(&self, duration: f64) {
        self.state.lock().duration = duration;
    }

    fn duration(&self) -> f64 {
        self.state.lock().duration
    }

    async fn end_of_stream(&self) -> Result<(), PlayerError> {
        self.state.lock().end_of_stream_calls += 1;
        Ok(())
    }
}
