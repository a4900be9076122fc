// Player events, fanned out over a broadcast channel.

use bytes::Bytes;

use crate::error::PlayerError;

/// A tagged interval on the presentation timeline, from manifest event
/// streams. Enter/exit events fire as the playhead crosses it.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineRegion {
    pub scheme_id_uri: String,
    pub value: String,
    pub id: String,
    pub start_time: f64,
    pub end_time: f64,
    pub event_data: Option<String>,
}

/// An inband `emsg` event surfaced to the application.
#[derive(Debug, Clone)]
pub struct EmsgInfo {
    pub scheme_id_uri: String,
    pub value: String,
    pub start_time: f64,
    pub end_time: f64,
    pub timescale: u32,
    pub id: u32,
    pub message_data: Bytes,
}

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Error(PlayerError),
    Buffering { buffering: bool },
    Loading,
    Unloading,
    Streaming,
    /// ABR changed the active variant.
    Adaptation,
    TracksChanged,
    TextTrackVisibility { visible: bool },
    ExpirationUpdated,
    DrmSessionUpdate,
    TimelineRegionAdded(TimelineRegion),
    TimelineRegionEnter(TimelineRegion),
    TimelineRegionExit(TimelineRegion),
    /// A gap larger than the small-gap limit was hit. Whether it is jumped
    /// is decided by configuration and the `on_large_gap` callback.
    LargeGap { current_time: f64, gap_size: f64 },
    Emsg(EmsgInfo),
}

impl PlayerEvent {
    /// Stable event-type string, mirroring the wire names integrators see.
    pub fn event_type(&self) -> &'static str {
        match self {
            PlayerEvent::Error(_) => "error",
            PlayerEvent::Buffering { .. } => "buffering",
            PlayerEvent::Loading => "loading",
            PlayerEvent::Unloading => "unloading",
            PlayerEvent::Streaming => "streaming",
            PlayerEvent::Adaptation => "adaptation",
            PlayerEvent::TracksChanged => "trackschanged",
            PlayerEvent::TextTrackVisibility { .. } => "texttrackvisibility",
            PlayerEvent::ExpirationUpdated => "expirationupdated",
            PlayerEvent::DrmSessionUpdate => "drmsessionupdate",
            PlayerEvent::TimelineRegionAdded(_) => "timelineregionadded",
            PlayerEvent::TimelineRegionEnter(_) => "timelineregionenter",
            PlayerEvent::TimelineRegionExit(_) => "timelineregionexit",
            PlayerEvent::LargeGap { .. } => "largegap",
            PlayerEvent::Emsg(_) => "emsg",
        }
    }
}
