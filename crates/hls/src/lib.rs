// HLS (HTTP Live Streaming) playlist mapping.
//
// Pure crate: master and media playlist text goes in (tokenized by
// m3u8-rs), presentation-model pieces come out. Fetching and refresh
// scheduling belong to the engine's HLS driver.

pub mod error;
pub mod master;
pub mod media;
pub mod mime;

pub use error::HlsError;
pub use master::{parse_master, MasterMap, MasterRendition, MasterVariant};
pub use media::{map_media_playlist, MediaPlaylistKind, MediaPlaylistMap};
pub use mime::{guess_mime_type, split_codecs};
