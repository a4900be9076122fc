// MPEG-DASH manifest support: MPD deserialization, template expansion,
// segment-index construction, and ISO-BMFF `sidx`/`emsg` parsing.
//
// This crate is pure: it never performs I/O. Deferred work that requires a
// fetch (`SegmentBase@indexRange`) is described as a [`SidxJob`] for the
// engine's DASH driver to resolve.

pub mod boxes;
pub mod error;
pub mod mapping;
pub mod mpd;
pub mod template;

pub use boxes::{parse_emsg_boxes, parse_sidx, EmsgBox, SidxEntry};
pub use error::DashError;
pub use mapping::{map_mpd, MappedManifest, MappedPeriod, SidxJob, StreamIdAllocator};
pub use mpd::{parse_mpd, Mpd};

/// DASH inband event scheme that requests an immediate manifest refresh.
pub const MANIFEST_REFRESH_SCHEME: &str = "urn:mpeg:dash:event:2012";
