use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::index::SegmentIndexHandle;
use crate::timeline::PresentationTimeline;
use crate::GAP_OVERLAP_TOLERANCE;

pub type StreamId = u32;
pub type VariantId = u32;

/// Content type of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamType {
    Audio,
    Video,
    Text,
}

impl StreamType {
    pub const ALL: [StreamType; 3] = [StreamType::Audio, StreamType::Video, StreamType::Text];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
            StreamType::Text => "text",
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inclusive byte range within a resource.
///
/// `end` of `None` means "until the end of the resource". HLS
/// `EXT-X-BYTERANGE` (length@offset) and DASH `first-last` ranges both map
/// onto this form losslessly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Length in bytes, when the range is closed.
    pub fn length(&self) -> Option<u64> {
        self.end.map(|end| end + 1 - self.start)
    }

    /// Formats as an HTTP `Range` header value.
    pub fn to_http_range(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// A 128-bit (usually) DRM key identifier.
///
/// Parsed case-insensitively from hex; always emitted as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyId(Vec<u8>);

impl KeyId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(hex_str: &str) -> Option<Self> {
        hex::decode(hex_str.trim()).ok().map(Self)
    }

    /// Parses a UUID-formatted key id (dashes tolerated, any case).
    pub fn from_uuid(uuid: &str) -> Option<Self> {
        Self::from_hex(&uuid.replace('-', ""))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One entry of DRM initialization data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitData {
    pub data: Bytes,
    /// Init data type, e.g. `cenc`, `keyids`, `webm`.
    pub init_data_type: String,
    pub key_id: Option<KeyId>,
}

/// DRM scheme information attached to a [`Variant`].
#[derive(Debug, Clone, Default)]
pub struct DrmInfo {
    /// Key system reverse-domain name, e.g. `com.widevine.alpha`.
    pub key_system: String,
    pub license_server_uri: Option<String>,
    pub distinctive_identifier_required: bool,
    pub persistent_state_required: bool,
    pub audio_robustness: String,
    pub video_robustness: String,
    pub server_certificate: Option<Bytes>,
    pub init_data: Vec<InitData>,
    pub key_ids: Vec<KeyId>,
}

/// Reference to an init segment (container header) shared by the media
/// segments of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct InitSegmentReference {
    pub uris: Vec<String>,
    pub byte_range: Option<ByteRange>,
}

impl InitSegmentReference {
    pub fn new(uris: Vec<String>, byte_range: Option<ByteRange>) -> Self {
        Self { uris, byte_range }
    }
}

type UriResolver = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// Reference to one media segment.
///
/// Times are in seconds relative to the owning period's start. URIs are
/// produced lazily so that template-derived indexes do not materialize
/// thousands of strings up front; the resolver returns an ordered fallback
/// list.
#[derive(Clone)]
pub struct SegmentReference {
    pub position: u64,
    pub start_time: f64,
    pub end_time: f64,
    uri_resolver: UriResolver,
    pub byte_range: Option<ByteRange>,
    pub init_segment: Option<Arc<InitSegmentReference>>,
}

impl SegmentReference {
    pub fn new(
        position: u64,
        start_time: f64,
        end_time: f64,
        uri_resolver: impl Fn() -> Vec<String> + Send + Sync + 'static,
        byte_range: Option<ByteRange>,
        init_segment: Option<Arc<InitSegmentReference>>,
    ) -> Self {
        Self {
            position,
            start_time,
            end_time,
            uri_resolver: Arc::new(uri_resolver),
            byte_range,
            init_segment,
        }
    }

    /// Convenience constructor for references whose URIs are already known.
    pub fn with_uris(
        position: u64,
        start_time: f64,
        end_time: f64,
        uris: Vec<String>,
        byte_range: Option<ByteRange>,
        init_segment: Option<Arc<InitSegmentReference>>,
    ) -> Self {
        Self::new(
            position,
            start_time,
            end_time,
            move || uris.clone(),
            byte_range,
            init_segment,
        )
    }

    /// Resolves the ordered URI fallback list for this segment.
    pub fn uris(&self) -> Vec<String> {
        (self.uri_resolver)()
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }
}

impl fmt::Debug for SegmentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentReference")
            .field("position", &self.position)
            .field("start_time", &self.start_time)
            .field("end_time", &self.end_time)
            .field("byte_range", &self.byte_range)
            .finish()
    }
}

/// The finest unit of selection: one elementary stream.
#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub stream_type: StreamType,
    pub mime_type: String,
    pub codecs: String,
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub channels_count: Option<u32>,
    pub language: String,
    pub label: Option<String>,
    /// Text kind, e.g. `subtitle`, `caption`.
    pub kind: Option<String>,
    pub roles: Vec<String>,
    pub primary: bool,
    pub encrypted: bool,
    pub key_id: Option<KeyId>,
    pub init_segment: Option<Arc<InitSegmentReference>>,
    /// Offset subtracted from media timestamps to map them into period time.
    pub presentation_time_offset: f64,
    /// Id of the low-bitrate trick-play rendition of this (video) stream.
    pub trick_mode_video: Option<StreamId>,
    /// Segment index; empty until the owning parser creates it.
    pub index: SegmentIndexHandle,
}

impl Stream {
    /// Full MIME type including codecs, as given to the media buffer engine.
    pub fn full_mime_type(&self) -> String {
        if self.codecs.is_empty() {
            self.mime_type.clone()
        } else {
            format!("{}; codecs=\"{}\"", self.mime_type, self.codecs)
        }
    }
}

/// A playable pairing of at most one audio and one video stream.
#[derive(Debug, Clone)]
pub struct Variant {
    pub id: VariantId,
    pub language: String,
    pub primary: bool,
    /// Combined bandwidth in bits per second.
    pub bandwidth: u64,
    pub audio: Option<StreamId>,
    pub video: Option<StreamId>,
    pub drm_infos: Vec<DrmInfo>,
    pub allowed_by_application: bool,
    pub allowed_by_key_system: bool,
}

impl Variant {
    /// A variant is playable iff the application and the key system both
    /// allow it. Stream-level restriction checks are applied by the caller,
    /// which owns the restriction configuration.
    pub fn is_playable(&self) -> bool {
        self.allowed_by_application && self.allowed_by_key_system
    }
}

/// A contiguous presentation interval with its own set of tracks.
#[derive(Debug, Clone, Default)]
pub struct Period {
    /// Stable id, used to reconcile periods across manifest updates.
    pub id: String,
    /// Start time in presentation seconds.
    pub start_time: f64,
    /// Stream arena; variants and text lists refer into it by id.
    pub streams: BTreeMap<StreamId, Stream>,
    pub variants: Vec<Variant>,
    pub text_streams: Vec<StreamId>,
}

impl Period {
    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn variant(&self, id: VariantId) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == id)
    }

    pub fn variant_mut(&mut self, id: VariantId) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == id)
    }

    /// All streams referenced by a variant, in audio-video order.
    pub fn variant_streams(&self, variant: &Variant) -> Vec<&Stream> {
        variant
            .audio
            .iter()
            .chain(variant.video.iter())
            .filter_map(|id| self.stream(*id))
            .collect()
    }
}

/// Root container for a parsed manifest.
#[derive(Debug, Clone)]
pub struct Presentation {
    /// Minimum amount of content, in seconds, that should be buffered before
    /// playback begins.
    pub min_buffer_time: f64,
    /// Persistent DRM session ids recorded for offline continuity.
    pub offline_session_ids: Vec<String>,
    pub timeline: PresentationTimeline,
    /// Ordered by `start_time`.
    pub periods: Vec<Period>,
}

impl Presentation {
    pub fn new(timeline: PresentationTimeline) -> Self {
        Self {
            min_buffer_time: 0.0,
            offline_session_ids: Vec::new(),
            timeline,
            periods: Vec::new(),
        }
    }

    /// Index of the period containing `time`, defaulting to the last period
    /// whose start precedes `time`.
    pub fn find_period_index(&self, time: f64) -> Option<usize> {
        if self.periods.is_empty() {
            return None;
        }
        let mut found = 0;
        for (i, period) in self.periods.iter().enumerate() {
            if period.start_time <= time + GAP_OVERLAP_TOLERANCE {
                found = i;
            } else {
                break;
            }
        }
        Some(found)
    }

    /// Duration of the period at `index`, derived from the next period's
    /// start or the presentation duration.
    pub fn period_duration(&self, index: usize) -> f64 {
        let Some(period) = self.periods.get(index) else {
            return 0.0;
        };
        match self.periods.get(index + 1) {
            Some(next) => next.start_time - period.start_time,
            None => self.timeline.duration() - period.start_time,
        }
    }

    /// End time of the period at `index` in presentation seconds.
    pub fn period_end(&self, index: usize) -> f64 {
        self.periods
            .get(index)
            .map(|p| p.start_time + self.period_duration(index))
            .unwrap_or(0.0)
    }

    /// Verifies the ordering invariant on period start times.
    pub fn periods_are_ordered(&self) -> bool {
        self.periods
            .windows(2)
            .all(|w| w[0].start_time < w[1].start_time)
    }
}
