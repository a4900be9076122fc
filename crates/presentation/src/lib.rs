// Manifest data model shared by the parsers and the streaming engine.

pub mod index;
pub mod timeline;
mod types;

pub use index::{SegmentIndex, SegmentIndexHandle};
pub use timeline::{Clock, PresentationTimeline, SystemClock};
pub use types::{
    ByteRange, DrmInfo, InitData, InitSegmentReference, KeyId, Period, Presentation,
    SegmentReference, Stream, StreamId, StreamType, Variant, VariantId,
};

/// Maximum gap or overlap, in seconds, tolerated between adjacent periods
/// and between adjacent segment references.
pub const GAP_OVERLAP_TOLERANCE: f64 = 1.0;
