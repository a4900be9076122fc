// MIME and codec guessing for HLS streams, which rarely declare either.

use presentation::StreamType;

use crate::error::HlsError;

/// Guesses a container MIME type from a segment or playlist URI extension.
pub fn guess_mime_type(uri: &str, stream_type: StreamType) -> Result<&'static str, HlsError> {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    let guessed = match (extension.as_str(), stream_type) {
        ("ts", _) => Some("video/mp2t"),
        ("mp4" | "m4s" | "m4v" | "cmfv", StreamType::Video) => Some("video/mp4"),
        ("mp4" | "m4s" | "m4a" | "cmfa", StreamType::Audio) => Some("audio/mp4"),
        ("mp4" | "m4s", StreamType::Text) => Some("application/mp4"),
        ("aac", _) => Some("audio/aac"),
        ("mp3", _) => Some("audio/mpeg"),
        ("vtt" | "webvtt", _) => Some("text/vtt"),
        ("ttml" | "xml", _) => Some("application/ttml+xml"),
        _ => None,
    };
    guessed.ok_or_else(|| HlsError::CouldNotGuessMimeType(uri.to_string()))
}

fn is_audio_codec(codec: &str) -> bool {
    let base = codec.split('.').next().unwrap_or(codec);
    matches!(
        base,
        "mp4a" | "ac-3" | "ec-3" | "opus" | "flac" | "vorbis" | "alac"
    )
}

fn is_video_codec(codec: &str) -> bool {
    let base = codec.split('.').next().unwrap_or(codec);
    matches!(
        base,
        "avc1" | "avc3" | "hvc1" | "hev1" | "vp8" | "vp9" | "vp09" | "av01" | "dvh1" | "dvhe"
    )
}

/// Splits an RFC 6381 `CODECS` attribute into `(video, audio)` codec
/// strings. Unrecognized codecs are classified as video, matching how they
/// are most likely to fail loudly downstream.
pub fn split_codecs(codecs: &str) -> (Vec<String>, Vec<String>) {
    let mut video = Vec::new();
    let mut audio = Vec::new();
    for codec in codecs.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if is_audio_codec(codec) {
            audio.push(codec.to_string());
        } else if is_video_codec(codec) {
            video.push(codec.to_string());
        } else {
            video.push(codec.to_string());
        }
    }
    (video, audio)
}
