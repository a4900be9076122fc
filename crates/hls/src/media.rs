// Media playlist mapping: segments to references with media-sequence
// positions, byte-range continuation, init sections, and key tags.

use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use m3u8_rs::{KeyMethod, Playlist};
use tracing::{debug, warn};
use url::Url;

use presentation::{ByteRange, DrmInfo, InitData, InitSegmentReference, SegmentReference};

use crate::error::HlsError;

pub const WIDEVINE_KEY_FORMAT: &str = "urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed";
pub const FAIRPLAY_KEY_FORMAT: &str = "com.apple.streamingkeydelivery";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaPlaylistKind {
    Vod,
    Event,
    Live,
}

/// A media playlist mapped to presentation-model pieces.
#[derive(Debug)]
pub struct MediaPlaylistMap {
    /// References positioned by media sequence number; times start at zero
    /// within this playlist. The driver re-anchors times on live refresh.
    pub references: Vec<SegmentReference>,
    pub init_segment: Option<Arc<InitSegmentReference>>,
    pub drm_infos: Vec<DrmInfo>,
    pub kind: MediaPlaylistKind,
    pub target_duration: f64,
    pub media_sequence: u64,
    pub total_duration: f64,
    /// URI of the first segment, for container MIME guessing.
    pub first_segment_uri: Option<String>,
}

fn resolve(base: &Url, uri: &str) -> String {
    base.join(uri)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| uri.to_string())
}

/// Maps an `EXT-X-KEY` tag to a [`DrmInfo`], when it describes a real key
/// system rather than transport encryption.
fn map_key(key: &m3u8_rs::Key) -> Option<DrmInfo> {
    match &key.method {
        KeyMethod::None => return None,
        KeyMethod::AES128 => {
            // Whole-segment AES: transport-level, not a DRM key system.
            debug!("Ignoring AES-128 key tag for DRM purposes");
            return None;
        }
        KeyMethod::SampleAES | KeyMethod::Other(_) => {}
    }
    let keyformat = key.keyformat.as_deref().unwrap_or("identity");
    if keyformat.eq_ignore_ascii_case(WIDEVINE_KEY_FORMAT) {
        let mut info = DrmInfo {
            key_system: "com.widevine.alpha".to_string(),
            ..Default::default()
        };
        if let Some(uri) = key.uri.as_deref() {
            match decode_data_uri_base64(uri) {
                Some(data) => info.init_data.push(InitData {
                    data,
                    init_data_type: "cenc".to_string(),
                    key_id: None,
                }),
                None => warn!(uri, "Widevine key URI is not base64 data:; ignoring init data"),
            }
        }
        Some(info)
    } else if keyformat.eq_ignore_ascii_case(FAIRPLAY_KEY_FORMAT) {
        Some(DrmInfo {
            key_system: "com.apple.fps.1_0".to_string(),
            license_server_uri: key.uri.clone(),
            ..Default::default()
        })
    } else {
        debug!(keyformat, "Unrecognized key format");
        None
    }
}

fn decode_data_uri_base64(uri: &str) -> Option<Bytes> {
    let payload = uri.strip_prefix("data:")?;
    let (header, data) = payload.split_once(',')?;
    if !header.ends_with(";base64") {
        return None;
    }
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .ok()
        .map(Bytes::from)
}

/// Parses and maps a media playlist fetched from `base_uri`.
pub fn map_media_playlist(content: &str, base_uri: &str) -> Result<MediaPlaylistMap, HlsError> {
    let playlist = m3u8_rs::parse_playlist_res(content.as_bytes())
        .map_err(|e| HlsError::InvalidPlaylist(format!("{e:?}")))?;
    let media = match playlist {
        Playlist::MediaPlaylist(media) => media,
        Playlist::MasterPlaylist(_) => return Err(HlsError::NotMediaPlaylist),
    };
    if media.target_duration == 0 {
        return Err(HlsError::RequiredTagMissing("EXT-X-TARGETDURATION"));
    }
    let base = Url::parse(base_uri)
        .map_err(|e| HlsError::InvalidPlaylist(format!("bad base URI {base_uri}: {e}")))?;

    let kind = if media.end_list {
        MediaPlaylistKind::Vod
    } else if media.playlist_type == Some(m3u8_rs::MediaPlaylistType::Event) {
        MediaPlaylistKind::Event
    } else {
        MediaPlaylistKind::Live
    };

    let mut init_segment: Option<Arc<InitSegmentReference>> = None;
    let mut drm_infos: Vec<DrmInfo> = Vec::new();
    let mut references = Vec::with_capacity(media.segments.len());
    let mut time = 0.0f64;
    let mut previous_range_end: Option<u64> = None;

    for (i, segment) in media.segments.iter().enumerate() {
        if let Some(map) = &segment.map {
            let map_range = map
                .byte_range
                .as_ref()
                .map(|r| byte_range_from_m3u8(r, None))
                .transpose()?;
            let candidate = InitSegmentReference::new(
                vec![resolve(&base, &map.uri)],
                map_range,
            );
            match &init_segment {
                None => init_segment = Some(Arc::new(candidate)),
                Some(existing) if **existing == candidate => {}
                Some(_) => return Err(HlsError::MultipleMediaInitSections),
            }
        }
        if let Some(key) = &segment.key {
            if let Some(info) = map_key(key) {
                if !drm_infos.iter().any(|d| d.key_system == info.key_system) {
                    drm_infos.push(info);
                }
            }
        }

        let byte_range = segment
            .byte_range
            .as_ref()
            .map(|r| byte_range_from_m3u8(r, previous_range_end))
            .transpose()?;
        previous_range_end = byte_range.and_then(|r| r.end);

        let duration = segment.duration as f64;
        let position = media.media_sequence + i as u64;
        references.push(SegmentReference::with_uris(
            position,
            time,
            time + duration,
            vec![resolve(&base, &segment.uri)],
            byte_range,
            init_segment.clone(),
        ));
        time += duration;
    }

    Ok(MediaPlaylistMap {
        first_segment_uri: media.segments.first().map(|s| resolve(&base, &s.uri)),
        references,
        init_segment,
        drm_infos,
        kind,
        target_duration: media.target_duration as f64,
        media_sequence: media.media_sequence,
        total_duration: time,
    })
}

/// Converts `length@offset`; a missing offset continues from the previous
/// segment's range, per RFC 8216 §4.3.2.2.
fn byte_range_from_m3u8(
    range: &m3u8_rs::ByteRange,
    previous_end: Option<u64>,
) -> Result<ByteRange, HlsError> {
    let start = match (range.offset, previous_end) {
        (Some(offset), _) => offset,
        (None, Some(previous)) => previous + 1,
        (None, None) => {
            return Err(HlsError::InvalidByteRange(format!(
                "{}@<missing> with no previous range",
                range.length
            )))
        }
    };
    if range.length == 0 {
        return Err(HlsError::InvalidByteRange("zero-length range".to_string()));
    }
    Ok(ByteRange::new(start, Some(start + range.length - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://cdn.example/video/720/playlist.m3u8";

    #[test]
    fn maps_vod_playlist_with_map_and_msn() {
        let content = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:10\n\
            #EXT-X-MEDIA-SEQUENCE:5\n\
            #EXT-X-MAP:URI=\"init.mp4\"\n\
            #EXTINF:10.0,\nseg5.m4s\n\
            #EXTINF:8.5,\nseg6.m4s\n\
            #EXT-X-ENDLIST\n";
        let map = map_media_playlist(content, BASE).unwrap();
        assert_eq!(map.kind, MediaPlaylistKind::Vod);
        assert_eq!(map.media_sequence, 5);
        assert_eq!(map.references.len(), 2);
        assert_eq!(map.references[0].position, 5);
        assert_eq!(map.references[1].position, 6);
        assert_eq!(map.references[1].start_time, 10.0);
        assert_eq!(map.total_duration, 18.5);
        assert_eq!(
            map.init_segment.as_ref().unwrap().uris[0],
            "https://cdn.example/video/720/init.mp4"
        );
        assert_eq!(
            map.references[0].uris()[0],
            "https://cdn.example/video/720/seg5.m4s"
        );
    }

    #[test]
    fn byte_ranges_continue_from_previous_segment() {
        let content = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:6\n\
            #EXTINF:6,\n#EXT-X-BYTERANGE:1000@0\nall.ts\n\
            #EXTINF:6,\n#EXT-X-BYTERANGE:500\nall.ts\n\
            #EXTINF:6,\n#EXT-X-BYTERANGE:300@2000\nall.ts\n\
            #EXT-X-ENDLIST\n";
        let map = map_media_playlist(content, BASE).unwrap();
        let ranges: Vec<_> = map.references.iter().map(|r| r.byte_range.unwrap()).collect();
        assert_eq!(ranges[0], ByteRange::new(0, Some(999)));
        assert_eq!(ranges[1], ByteRange::new(1000, Some(1499)));
        assert_eq!(ranges[2], ByteRange::new(2000, Some(2299)));
    }

    #[test]
    fn byterange_without_offset_and_without_predecessor_is_rejected() {
        let content = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:6\n\
            #EXTINF:6,\n#EXT-X-BYTERANGE:500\nall.ts\n\
            #EXT-X-ENDLIST\n";
        assert!(matches!(
            map_media_playlist(content, BASE),
            Err(HlsError::InvalidByteRange(_))
        ));
    }

    #[test]
    fn widevine_key_tag_maps_to_drm_info() {
        // base64("pssh-blob") carried in a data: URI, SAMPLE-AES-CTR scheme.
        let content = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:4\n\
            #EXT-X-KEY:METHOD=SAMPLE-AES-CTR,KEYFORMAT=\"urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed\",URI=\"data:text/plain;base64,cHNzaC1ibG9i\"\n\
            #EXTINF:4,\nseg0.m4s\n\
            #EXT-X-ENDLIST\n";
        let map = map_media_playlist(content, BASE).unwrap();
        assert_eq!(map.drm_infos.len(), 1);
        let info = &map.drm_infos[0];
        assert_eq!(info.key_system, "com.widevine.alpha");
        assert_eq!(&info.init_data[0].data[..], b"pssh-blob");
        assert_eq!(info.init_data[0].init_data_type, "cenc");
    }

    #[test]
    fn aes128_key_is_not_drm() {
        let content = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:4\n\
            #EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n\
            #EXTINF:4,\nseg0.ts\n\
            #EXT-X-ENDLIST\n";
        let map = map_media_playlist(content, BASE).unwrap();
        assert!(map.drm_infos.is_empty());
    }

    #[test]
    fn conflicting_init_sections_rejected() {
        let content = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:4\n\
            #EXT-X-MAP:URI=\"init_a.mp4\"\n\
            #EXTINF:4,\nseg0.m4s\n\
            #EXT-X-MAP:URI=\"init_b.mp4\"\n\
            #EXTINF:4,\nseg1.m4s\n\
            #EXT-X-ENDLIST\n";
        assert!(matches!(
            map_media_playlist(content, BASE),
            Err(HlsError::MultipleMediaInitSections)
        ));
    }

    #[test]
    fn live_playlist_kind_and_target_duration() {
        let content = "#EXTM3U\n\
            #EXT-X-TARGETDURATION:6\n\
            #EXT-X-MEDIA-SEQUENCE:100\n\
            #EXTINF:6,\nseg100.ts\n\
            #EXTINF:6,\nseg101.ts\n";
        let map = map_media_playlist(content, BASE).unwrap();
        assert_eq!(map.kind, MediaPlaylistKind::Live);
        assert_eq!(map.target_duration, 6.0);
        assert_eq!(map.references[0].position, 100);
    }

    #[test]
    fn missing_target_duration_is_required_tag_error() {
        let content = "#EXTM3U\n#EXTINF:6,\nseg0.ts\n#EXT-X-ENDLIST\n";
        assert!(matches!(
            map_media_playlist(content, BASE),
            Err(HlsError::RequiredTagMissing(_))
        ));
    }
}
