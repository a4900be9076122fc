// Master playlist mapping: variants and rendition groups, with URIs
// resolved against the master playlist location.

use m3u8_rs::{AlternativeMediaType, Playlist};
use tracing::debug;
use url::Url;

use crate::error::HlsError;

/// One `EXT-X-STREAM-INF` entry.
#[derive(Debug, Clone)]
pub struct MasterVariant {
    pub uri: String,
    pub bandwidth: u64,
    pub average_bandwidth: Option<u64>,
    pub codecs: Option<String>,
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<f64>,
    pub audio_group: Option<String>,
    pub subtitles_group: Option<String>,
}

/// One `EXT-X-MEDIA` rendition.
#[derive(Debug, Clone)]
pub struct MasterRendition {
    pub group_id: String,
    /// Absent for renditions muxed into the variant's own playlist.
    pub uri: Option<String>,
    pub language: Option<String>,
    pub name: String,
    pub default: bool,
    pub autoselect: bool,
    pub channels: Option<u32>,
}

/// The master playlist, mapped and URL-resolved.
#[derive(Debug, Clone, Default)]
pub struct MasterMap {
    pub variants: Vec<MasterVariant>,
    pub audio: Vec<MasterRendition>,
    pub subtitles: Vec<MasterRendition>,
}

fn resolve(base: &Url, uri: &str) -> String {
    base.join(uri)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| uri.to_string())
}

/// Parses a master playlist and resolves all URIs against `base_uri`.
pub fn parse_master(content: &str, base_uri: &str) -> Result<MasterMap, HlsError> {
    let playlist = m3u8_rs::parse_playlist_res(content.as_bytes())
        .map_err(|e| HlsError::InvalidPlaylist(format!("{e:?}")))?;
    let master = match playlist {
        Playlist::MasterPlaylist(master) => master,
        Playlist::MediaPlaylist(_) => return Err(HlsError::NotMasterPlaylist),
    };
    let base = Url::parse(base_uri)
        .map_err(|e| HlsError::InvalidPlaylist(format!("bad base URI {base_uri}: {e}")))?;

    let mut out = MasterMap::default();
    for variant in &master.variants {
        if variant.is_i_frame {
            // I-frame playlists are trick-play material, handled separately.
            continue;
        }
        if variant.uri.is_empty() {
            return Err(HlsError::RequiredAttributeMissing("URI"));
        }
        if variant.bandwidth == 0 {
            return Err(HlsError::RequiredAttributeMissing("BANDWIDTH"));
        }
        out.variants.push(MasterVariant {
            uri: resolve(&base, &variant.uri),
            bandwidth: variant.bandwidth,
            average_bandwidth: variant.average_bandwidth,
            codecs: variant.codecs.clone(),
            resolution: variant
                .resolution
                .map(|r| (r.width as u32, r.height as u32)),
            frame_rate: variant.frame_rate,
            audio_group: variant.audio.clone(),
            subtitles_group: variant.subtitles.clone(),
        });
    }
    if out.variants.is_empty() {
        return Err(HlsError::RequiredTagMissing("EXT-X-STREAM-INF"));
    }

    for alternative in &master.alternatives {
        let rendition = MasterRendition {
            group_id: alternative.group_id.clone(),
            uri: alternative.uri.as_deref().map(|u| resolve(&base, u)),
            language: alternative.language.clone(),
            name: alternative.name.clone(),
            default: alternative.default,
            autoselect: alternative.autoselect,
            channels: alternative
                .channels
                .as_deref()
                .and_then(|c| c.split('/').next())
                .and_then(|c| c.parse().ok()),
        };
        match alternative.media_type {
            AlternativeMediaType::Audio => out.audio.push(rendition),
            AlternativeMediaType::Subtitles => out.subtitles.push(rendition),
            ref other => {
                debug!(media_type = ?other, name = %alternative.name, "Ignoring rendition type");
            }
        }
    }
    Ok(out)
}
