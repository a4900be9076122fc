// plover: an adaptive streaming core. Consumes DASH and HLS manifests,
// drives a platform media-buffer engine, and selects qualities dynamically
// over unreliable networks. Decode and render stay on the platform side of
// the `MediaElement` / `MediaSink` / `CdmFactory` traits.

pub mod abr;
pub mod buffer;
pub mod config;
pub mod drm;
pub mod error;
pub mod events;
pub mod manifest;
pub mod media;
pub mod net;
pub mod player;
pub mod playhead;
pub mod stats;
pub mod streaming;

pub use abr::{AbrController, BandwidthEstimator};
pub use buffer::{MediaBufferEngine, MediaSink, SinkError, SourceBufferSink};
pub use config::{AbrConfig, DrmConfig, GapDisposition, ManifestConfig, PlayerConfig, Restrictions, StreamingConfig};
pub use error::{Category, ErrorDetail, PlayerError, Severity};
pub use events::{EmsgInfo, PlayerEvent, TimelineRegion};
pub use media::{BufferedRange, FrameStats, MediaElement};
pub use net::{NetworkingEngine, Request, RequestType, Response, RetryParameters, SchemePlugin};
pub use player::{Player, PlayerDeps, Track, TrackType};
pub use stats::{PlaybackState, Stats};
pub use streaming::{ChosenStreams, StreamingEngine, StreamingListener};

// The manifest model is re-exported so integrators need only one crate.
pub use presentation;
