// HLS manifest driver: master/media playlist fetching, rendition-group
// crossing, lazy per-rendition index creation, and live refresh. Pure
// playlist mapping lives in the `hls` crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hls::{
    guess_mime_type, map_media_playlist, parse_master, split_codecs, HlsError, MasterMap,
    MediaPlaylistKind, MediaPlaylistMap,
};
use presentation::{
    Period, Presentation, PresentationTimeline, SegmentIndex, Stream, StreamId, StreamType,
    Variant, VariantId,
};

use crate::config::ManifestConfig;
use crate::error::PlayerError;
use crate::manifest::{ManifestParser, ParserHost, SegmentIndexCreator, SharedPresentation};
use crate::net::{Request, RequestType};

/// Presentation delay for live HLS, in target durations (RFC 8216 asks
/// players to stay three target durations from the end).
const LIVE_DELAY_TARGET_DURATIONS: f64 = 3.0;

#[derive(Default)]
struct HlsParserState {
    host: Option<Arc<dyn ParserHost>>,
    presentation: Option<SharedPresentation>,
    /// Media playlist URI per stream, for lazy index creation and refresh.
    playlist_uris: HashMap<StreamId, String>,
    /// Streams whose playlists have been fetched at least once.
    fetched: HashMap<StreamId, MediaPlaylistKind>,
    stream_ids_by_uri: HashMap<String, StreamId>,
    next_stream_id: StreamId,
    target_duration: f64,
    is_live: bool,
}

pub struct HlsManifestParser {
    config: ManifestConfig,
    token: CancellationToken,
    state: Arc<Mutex<HlsParserState>>,
}

impl HlsManifestParser {
    pub fn new(config: ManifestConfig, token: CancellationToken) -> Self {
        Self {
            config,
            token,
            state: Arc::new(Mutex::new(HlsParserState::default())),
        }
    }

    async fn fetch_text(
        &self,
        host: &Arc<dyn ParserHost>,
        uri: &str,
        request_type: RequestType,
    ) -> Result<(String, String), PlayerError> {
        let response = host
            .networking()
            .request(
                request_type,
                Request::get(vec![uri.to_string()], self.config.retry.clone()),
                &self.token,
            )
            .await?;
        Ok((
            String::from_utf8_lossy(&response.data).into_owned(),
            response.uri,
        ))
    }

    fn allocate_stream_id(state: &mut HlsParserState, uri: &str) -> StreamId {
        if let Some(id) = state.stream_ids_by_uri.get(uri) {
            return *id;
        }
        let id = state.next_stream_id;
        state.next_stream_id += 1;
        state.stream_ids_by_uri.insert(uri.to_string(), id);
        id
    }

    /// Builds the single period from the master map. Indexes stay empty
    /// until `create_segment_index` fetches each rendition's playlist.
    fn build_period(&self, master: &MasterMap) -> Result<Period, PlayerError> {
        let mut state = self.state.lock();
        let mut period = Period {
            id: "hls".to_string(),
            ..Default::default()
        };
        let mut next_variant_id: VariantId = 0;

        let blank_stream = |id: StreamId, stream_type: StreamType| Stream {
            id,
            stream_type,
            mime_type: match stream_type {
                StreamType::Audio => "audio/mp4".to_string(),
                StreamType::Video => "video/mp4".to_string(),
                StreamType::Text => "text/vtt".to_string(),
            },
            codecs: String::new(),
            bandwidth: 0,
            width: None,
            height: None,
            frame_rate: None,
            channels_count: None,
            language: String::new(),
            label: None,
            kind: None,
            roles: Vec::new(),
            primary: false,
            encrypted: false,
            key_id: None,
            init_segment: None,
            presentation_time_offset: 0.0,
            trick_mode_video: None,
            index: presentation::SegmentIndexHandle::new(),
        };

        for master_variant in &master.variants {
            let (mut video_codecs, mut audio_codecs) = master_variant
                .codecs
                .as_deref()
                .map(split_codecs)
                .unwrap_or_default();
            if video_codecs.is_empty() && audio_codecs.is_empty() {
                video_codecs = vec![self.config.hls.default_video_codec.clone()];
                audio_codecs = vec![self.config.hls.default_audio_codec.clone()];
            }
            let audio_renditions: Vec<_> = master_variant
                .audio_group
                .as_deref()
                .map(|group| {
                    master
                        .audio
                        .iter()
                        .filter(|r| r.group_id == group && r.uri.is_some())
                        .collect()
                })
                .unwrap_or_default();
            let demuxed_audio = !audio_renditions.is_empty();

            // The variant playlist itself: video, or muxed audio+video.
            let video_id = Self::allocate_stream_id(&mut state, &master_variant.uri);
            let is_audio_only = video_codecs.is_empty() && !demuxed_audio;
            let video_stream_type = if is_audio_only {
                StreamType::Audio
            } else {
                StreamType::Video
            };
            let mut video_stream = blank_stream(video_id, video_stream_type);
            video_stream.bandwidth = master_variant.bandwidth;
            video_stream.codecs = if demuxed_audio || is_audio_only {
                if is_audio_only {
                    audio_codecs.join(",")
                } else {
                    video_codecs.join(",")
                }
            } else {
                // Muxed rendition carries both codec strings.
                video_codecs
                    .iter()
                    .chain(audio_codecs.iter())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(",")
            };
            if let Some((width, height)) = master_variant.resolution {
                video_stream.width = Some(width);
                video_stream.height = Some(height);
            }
            video_stream.frame_rate = master_variant.frame_rate;
            state.playlist_uris.insert(video_id, master_variant.uri.clone());
            period.streams.entry(video_id).or_insert(video_stream);

            if demuxed_audio {
                for rendition in &audio_renditions {
                    let uri = rendition.uri.as_deref().expect("filtered to Some");
                    let audio_id = Self::allocate_stream_id(&mut state, uri);
                    let mut audio_stream = blank_stream(audio_id, StreamType::Audio);
                    audio_stream.codecs = audio_codecs.join(",");
                    audio_stream.language = rendition.language.clone().unwrap_or_default();
                    audio_stream.label = Some(rendition.name.clone());
                    audio_stream.primary = rendition.default;
                    audio_stream.channels_count = rendition.channels;
                    let language = audio_stream.language.clone();
                    state.playlist_uris.insert(audio_id, uri.to_string());
                    period.streams.entry(audio_id).or_insert(audio_stream);

                    period.variants.push(Variant {
                        id: next_variant_id,
                        language,
                        primary: rendition.default,
                        bandwidth: master_variant.bandwidth,
                        audio: Some(audio_id),
                        video: if is_audio_only { None } else { Some(video_id) },
                        drm_infos: Vec::new(),
                        allowed_by_application: true,
                        allowed_by_key_system: true,
                    });
                    next_variant_id += 1;
                }
            } else {
                period.variants.push(Variant {
                    id: next_variant_id,
                    language: String::new(),
                    primary: false,
                    bandwidth: master_variant.bandwidth,
                    audio: if is_audio_only { Some(video_id) } else { None },
                    video: if is_audio_only { None } else { Some(video_id) },
                    drm_infos: Vec::new(),
                    allowed_by_application: true,
                    allowed_by_key_system: true,
                });
                next_variant_id += 1;
            }
        }

        for rendition in &master.subtitles {
            let Some(uri) = rendition.uri.as_deref() else {
                continue;
            };
            let text_id = Self::allocate_stream_id(&mut state, uri);
            let mut text_stream = blank_stream(text_id, StreamType::Text);
            text_stream.codecs = String::new();
            text_stream.language = rendition.language.clone().unwrap_or_default();
            text_stream.label = Some(rendition.name.clone());
            text_stream.kind = Some("subtitle".to_string());
            text_stream.primary = rendition.default;
            state.playlist_uris.insert(text_id, uri.to_string());
            period.streams.entry(text_id).or_insert(text_stream);
            period.text_streams.push(text_id);
        }

        Ok(period)
    }

    /// Applies a fetched media playlist to its stream: index, init segment,
    /// refined MIME type, DRM info.
    fn apply_media_playlist(
        &self,
        stream_id: StreamId,
        map: &MediaPlaylistMap,
        shared: &SharedPresentation,
    ) -> Result<(), PlayerError> {
        let mut presentation = shared.write();
        let Some(period) = presentation.periods.first_mut() else {
            return Ok(());
        };

        if !map.drm_infos.is_empty() {
            for variant in &mut period.variants {
                for info in &map.drm_infos {
                    if !variant.drm_infos.iter().any(|d| d.key_system == info.key_system) {
                        variant.drm_infos.push(info.clone());
                    }
                }
            }
        }

        let Some(stream) = period.stream_mut(stream_id) else {
            return Ok(());
        };
        if let Some(first_uri) = &map.first_segment_uri {
            stream.mime_type = guess_mime_type(first_uri, stream.stream_type)
                .map_err(PlayerError::from)?
                .to_string();
        }
        stream.init_segment = map.init_segment.clone();
        stream.encrypted = stream.encrypted || !map.drm_infos.is_empty();

        if stream.index.is_created() {
            // Live refresh: merge, re-anchoring new reference times onto the
            // established period timeline via a shared position.
            let mut references = map.references.clone();
            let delta = references.first().and_then(|first| {
                stream
                    .index
                    .get(first.position)
                    .map(|old| old.start_time - first.start_time)
            });
            if let Some(delta) = delta {
                for reference in &mut references {
                    reference.start_time += delta;
                    reference.end_time += delta;
                }
            } else if let Some(first) = references.first() {
                // The window slid past our tail; anchor after the last known
                // reference.
                let anchor = stream
                    .index
                    .with(|i| i.references().last().map(|r| (r.position, r.end_time)))
                    .flatten();
                if let Some((last_position, last_end)) = anchor {
                    if first.position > last_position {
                        let shift = last_end - references[0].start_time;
                        for reference in &mut references {
                            reference.start_time += shift;
                            reference.end_time += shift;
                        }
                    }
                }
            }
            stream.index.with_mut(|index| index.merge(references));
        } else {
            stream.index.set(SegmentIndex::new(map.references.clone()));
        }

        let max_duration = map
            .references
            .iter()
            .map(|r| r.duration())
            .fold(0.0f64, f64::max);
        presentation.timeline.notify_max_segment_duration(max_duration);
        Ok(())
    }

    async fn fetch_playlist_for(
        &self,
        stream_id: StreamId,
        request_type: RequestType,
    ) -> Result<(), PlayerError> {
        let (host, uri, shared) = {
            let state = self.state.lock();
            let Some(uri) = state.playlist_uris.get(&stream_id).cloned() else {
                return Ok(());
            };
            (state.host.clone(), uri, state.presentation.clone())
        };
        let (Some(host), Some(shared)) = (host, shared) else {
            return Ok(());
        };
        let (text, final_uri) = self.fetch_text(&host, &uri, request_type).await?;
        let map = map_media_playlist(&text, &final_uri).map_err(PlayerError::from)?;
        self.apply_media_playlist(stream_id, &map, &shared)?;
        self.state.lock().fetched.insert(stream_id, map.kind);
        Ok(())
    }

    fn spawn_refresh_loop(&self, host: Arc<dyn ParserHost>) {
        let parser = HlsManifestParser {
            config: self.config.clone(),
            token: self.token.clone(),
            state: self.state.clone(),
        };
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                let target_duration = parser.state.lock().target_duration.max(1.0);
                // Half the target duration, the conventional refresh cadence.
                let delay = Duration::from_secs_f64(target_duration * 0.5);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if let Err(error) = parser.update().await {
                    warn!(error = %error, "HLS playlist refresh failed");
                    host.on_error(error.into_recoverable());
                } else {
                    host.on_manifest_updated();
                }
            }
        });
    }
}

#[async_trait]
impl SegmentIndexCreator for HlsManifestParser {
    async fn create_segment_index(&self, stream_id: StreamId) -> Result<(), PlayerError> {
        let already = {
            let state = self.state.lock();
            state.fetched.contains_key(&stream_id)
        };
        if already {
            return Ok(());
        }
        self.fetch_playlist_for(stream_id, RequestType::Manifest)
            .await
    }
}

#[async_trait]
impl ManifestParser for HlsManifestParser {
    async fn start(
        &self,
        uri: &str,
        host: Arc<dyn ParserHost>,
    ) -> Result<SharedPresentation, PlayerError> {
        self.state.lock().host = Some(host.clone());
        let (text, final_uri) = self.fetch_text(&host, uri, RequestType::Manifest).await?;

        // A media playlist served directly becomes a single-variant master.
        let master = match parse_master(&text, &final_uri) {
            Ok(master) => master,
            Err(HlsError::NotMasterPlaylist) => {
                debug!("URI is a media playlist; synthesizing a master");
                MasterMap {
                    variants: vec![hls::MasterVariant {
                        uri: final_uri.clone(),
                        bandwidth: 1,
                        average_bandwidth: None,
                        codecs: None,
                        resolution: None,
                        frame_rate: None,
                        audio_group: None,
                        subtitles_group: None,
                    }],
                    audio: Vec::new(),
                    subtitles: Vec::new(),
                }
            }
            Err(other) => return Err(other.into()),
        };

        let mut period = self.build_period(&master)?;
        host.filter_new_period(&mut period);

        // Probe the first variant's playlist to establish the timeline.
        let probe_stream_id = master
            .variants
            .first()
            .and_then(|v| self.state.lock().stream_ids_by_uri.get(&v.uri).copied())
            .unwrap_or(0);
        let probe_uri = self
            .state
            .lock()
            .playlist_uris
            .get(&probe_stream_id)
            .cloned()
            .unwrap_or_else(|| final_uri.clone());
        let (probe_text, probe_final) = self
            .fetch_text(&host, &probe_uri, RequestType::Manifest)
            .await?;
        let probe_map = map_media_playlist(&probe_text, &probe_final).map_err(PlayerError::from)?;

        let timeline = match probe_map.kind {
            MediaPlaylistKind::Vod => PresentationTimeline::new_static(probe_map.total_duration),
            MediaPlaylistKind::Event | MediaPlaylistKind::Live => {
                let clock = host.clock();
                let now = clock.now();
                let availability = self
                    .config
                    .availability_window_override
                    .unwrap_or(probe_map.total_duration);
                let delay = LIVE_DELAY_TARGET_DURATIONS * probe_map.target_duration;
                // Anchor presentation time zero so the live edge lands at
                // the end of the fetched window.
                let start =
                    now - TimeDelta::milliseconds((probe_map.total_duration * 1000.0) as i64);
                PresentationTimeline::new_live(start, availability, delay).with_clock(clock)
            }
        };

        {
            let mut state = self.state.lock();
            state.target_duration = probe_map.target_duration;
            state.is_live = probe_map.kind != MediaPlaylistKind::Vod;
            let mut presentation = Presentation::new(timeline);
            presentation.periods.push(period);
            state.presentation = Some(Arc::new(parking_lot::RwLock::new(presentation)));
        }

        let shared = self.state.lock().presentation.clone().expect("just set");
        self.apply_media_playlist(probe_stream_id, &probe_map, &shared)?;
        self.state
            .lock()
            .fetched
            .insert(probe_stream_id, probe_map.kind);

        if self.state.lock().is_live {
            info!(target_duration = probe_map.target_duration, "Live HLS presentation");
            self.spawn_refresh_loop(host.clone());
        }
        Ok(shared)
    }

    async fn stop(&self) {
        self.token.cancel();
        // Drop the host reference so the parser cannot keep the player's
        // load state alive after unload.
        self.state.lock().host = None;
    }

    /// Refreshes every playlist fetched so far (live only).
    async fn update(&self) -> Result<(), PlayerError> {
        let targets: Vec<StreamId> = {
            let state = self.state.lock();
            if !state.is_live {
                return Ok(());
            }
            state.fetched.keys().copied().collect()
        };
        for stream_id in targets {
            self.fetch_playlist_for(stream_id, RequestType::Manifest)
                .await?;
        }
        Ok(())
    }
}
