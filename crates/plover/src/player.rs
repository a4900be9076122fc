// Player facade: wires the subsystems, owns configuration and stats, and
// exposes the public API. The load pipeline is a cancellable chain; a new
// load, an unload, or destroy interrupts it with `LOAD_INTERRUPTED`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use presentation::{
    Clock, Period, SegmentIndex, SegmentIndexHandle, SegmentReference, Stream, StreamId,
    StreamType, SystemClock, Variant, VariantId,
};

use crate::abr::{AbrController, AbrVariant};
use crate::buffer::{BufferedInfo, MediaBufferEngine, MediaSink};
use crate::config::PlayerConfig;
use crate::drm::cdm::{CdmFactory, KeyStatus};
use crate::drm::{DrmCallbacks, DrmEngine};
use crate::error::{ErrorDetail, PlayerError};
use crate::events::PlayerEvent;
use crate::manifest::{
    ManifestParser, ParserHost, ParserRegistry, SegmentIndexCreator, SharedPresentation,
};
use crate::media::MediaElement;
use crate::net::NetworkingEngine;
use crate::playhead::{resolve_start_time, Playhead};
use crate::stats::{Stats, TrackChoice};
use crate::streaming::{ChosenStreams, StreamingDeps, StreamingEngine, StreamingListener};

/// Platform surfaces the player drives but does not own.
pub struct PlayerDeps {
    pub media: Arc<dyn MediaElement>,
    pub sink: Arc<dyn MediaSink>,
    pub cdm: Option<Arc<dyn CdmFactory>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Variant,
    Text,
}

/// A selectable track, as shown to the application.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub track_type: TrackType,
    pub active: bool,
    pub language: String,
    pub bandwidth: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub label: Option<String>,
    pub kind: Option<String>,
    pub roles: Vec<String>,
    pub primary: bool,
}

struct ActiveLoad {
    token: CancellationToken,
    manifest_uri: String,
    parser: Arc<dyn ManifestParser>,
    presentation: SharedPresentation,
    engine: StreamingEngine,
    playhead: Arc<Playhead>,
    buffer: Arc<MediaBufferEngine>,
    abr: Arc<AbrController>,
    drm: Option<DrmEngine>,
    shared: Arc<LoadShared>,
}

/// State shared between the facade and the engine listener.
struct LoadShared {
    /// Swapped to the parser's live handle once `start` returns.
    presentation_slot: RwLock<SharedPresentation>,
    abr: Arc<AbrController>,
    config: Arc<RwLock<PlayerConfig>>,
    events: broadcast::Sender<PlayerEvent>,
    stats: Arc<Mutex<Stats>>,
    media: Arc<dyn MediaElement>,
    clock: Arc<dyn Clock>,
    engine: Mutex<Option<StreamingEngine>>,
    playhead: Mutex<Option<Arc<Playhead>>>,
    pending_regions: Mutex<Vec<crate::events::TimelineRegion>>,
    parser: Mutex<Option<Arc<dyn ManifestParser>>>,
    net: Arc<NetworkingEngine>,
    active_variant: Mutex<Option<VariantId>>,
    active_text: Mutex<Option<StreamId>>,
    text_visible: Mutex<bool>,
    drm: Mutex<Option<DrmEngine>>,
    played_once: Mutex<bool>,
}

impl LoadShared {
    fn presentation(&self) -> SharedPresentation {
        self.presentation_slot.read().clone()
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    /// Filters a period's variants through restrictions and allowance
    /// flags, feeding the result to ABR.
    fn refresh_abr_variants(&self, period: &Period) {
        let restrictions = self.config.read().restrictions.clone();
        let variants: Vec<AbrVariant> = period
            .variants
            .iter()
            .map(|variant| AbrVariant {
                id: variant.id,
                bandwidth: variant.bandwidth,
                playable: variant.is_playable()
                    && period
                        .variant_streams(variant)
                        .iter()
                        .all(|stream| restrictions.allows(stream)),
            })
            .collect();
        self.abr.set_variants(variants);
    }

    fn record_switch(&self, variant_id: VariantId, bandwidth: u64, from_adaptation: bool) {
        let now_ms = self.clock.now().timestamp_millis();
        self.stats.lock().switch_history.push(TrackChoice {
            timestamp_ms: now_ms,
            variant_id,
            bandwidth,
            from_adaptation,
        });
    }
}

struct LoadListener {
    shared: Arc<LoadShared>,
}

#[async_trait]
impl StreamingListener for LoadListener {
    async fn on_choose_streams(&self, period_index: usize) -> ChosenStreams {
        let shared = &self.shared;
        let (variant, bandwidth, text) = {
            let presentation = shared.presentation();
            let presentation = presentation.read();
            let Some(period) = presentation.periods.get(period_index) else {
                return ChosenStreams::default();
            };
            shared.refresh_abr_variants(period);
            let variant_id = shared.abr.choose_variant();
            if variant_id.is_none() && !period.variants.is_empty() {
                shared.emit(PlayerEvent::Error(PlayerError::critical(
                    ErrorDetail::RestrictionsCannotBeMet,
                )));
            }
            let bandwidth = variant_id
                .and_then(|id| period.variant(id))
                .map(|v| v.bandwidth)
                .unwrap_or(0);

            let text = if *shared.text_visible.lock() {
                choose_text_stream(
                    period,
                    &shared.config.read().preferred_text_language,
                    *shared.active_text.lock(),
                )
            } else {
                None
            };
            (variant_id, bandwidth, text)
        };
        if let Some(variant_id) = variant {
            *shared.active_variant.lock() = Some(variant_id);
            shared.record_switch(variant_id, bandwidth, true);
        }
        *shared.active_text.lock() = text;
        ChosenStreams { variant, text }
    }

    fn on_can_switch(&self, period_index: usize) {
        debug!(period_index, "Period settled; switches are safe");
    }

    fn on_initial_streams_setup(&self) {
        let shared = &self.shared;
        // Segment-boundary start adjustment needs the chosen streams, so it
        // runs here rather than before engine init.
        let config = shared.config.read();
        if !config.streaming.start_at_segment_boundary {
            return;
        }
        drop(config);
        let presentation = shared.presentation();
        let presentation = presentation.read();
        let time = shared.media.current_time();
        let Some(period_index) = presentation.find_period_index(time) else {
            return;
        };
        let Some(period) = presentation.periods.get(period_index) else {
            return;
        };
        let variant = shared.active_variant.lock().and_then(|id| period.variant(id).cloned());
        let Some(variant) = variant else {
            return;
        };
        let streams: Vec<&Stream> = period.variant_streams(&variant);
        let adjusted = resolve_start_time(&presentation, Some(time), true, &streams);
        if (adjusted - time).abs() > 1e-6 {
            info!(requested = time, adjusted, "Start adjusted to segment boundary");
            shared.media.set_current_time(adjusted);
        }
    }

    fn on_transition(&self, pending: bool) {
        // ABR must not switch while streams for a new period settle.
        if pending {
            self.shared.abr.disable();
        } else if self.shared.config.read().abr.enabled {
            self.shared.abr.enable();
        }
    }

    fn on_error(&self, error: PlayerError) {
        if matches!(
            error.detail,
            ErrorDetail::LoadInterrupted | ErrorDetail::OperationAborted
        ) {
            return;
        }
        self.shared.emit(PlayerEvent::Error(error));
    }

    fn on_event(&self, event: PlayerEvent) {
        self.shared.emit(event);
    }

    fn on_manifest_refresh_requested(&self) {
        let parser = self.shared.parser.lock().clone();
        if let Some(parser) = parser {
            tokio::spawn(async move {
                if let Err(error) = parser.update().await {
                    warn!(error = %error, "emsg-triggered manifest refresh failed");
                }
            });
        }
    }
}

fn choose_text_stream(
    period: &Period,
    preferred_language: &str,
    current: Option<StreamId>,
) -> Option<StreamId> {
    if let Some(current) = current {
        if period.stream(current).is_some() {
            return Some(current);
        }
    }
    let by_language = period.text_streams.iter().find(|id| {
        period
            .stream(**id)
            .map(|s| !preferred_language.is_empty() && s.language == preferred_language)
            .unwrap_or(false)
    });
    by_language.or_else(|| period.text_streams.first()).copied()
}

struct LoadHost {
    shared: Arc<LoadShared>,
}

impl ParserHost for LoadHost {
    fn networking(&self) -> Arc<NetworkingEngine> {
        self.shared.net.clone()
    }

    fn clock(&self) -> Arc<dyn Clock> {
        self.shared.clock.clone()
    }

    fn on_timeline_region_added(&self, region: crate::events::TimelineRegion) {
        // Regions can arrive before the playhead exists; buffer them.
        let playhead = self.shared.playhead.lock().clone();
        match playhead {
            Some(playhead) => playhead.add_timeline_region(region),
            None => self.shared.pending_regions.lock().push(region),
        }
    }

    fn on_event(&self, event: PlayerEvent) {
        self.shared.emit(event);
    }

    fn on_error(&self, error: PlayerError) {
        // Interruption noise from a teardown in progress is not an error.
        if matches!(
            error.detail,
            ErrorDetail::OperationAborted | ErrorDetail::LoadInterrupted
        ) {
            return;
        }
        self.shared.emit(PlayerEvent::Error(error));
    }

    fn on_manifest_updated(&self) {
        if let Some(engine) = self.shared.engine.lock().as_ref() {
            engine.notify_manifest_updated();
        }
    }
}

pub struct Player {
    deps: PlayerDeps,
    net: Arc<NetworkingEngine>,
    registry: ParserRegistry,
    config: Arc<RwLock<PlayerConfig>>,
    events: broadcast::Sender<PlayerEvent>,
    stats: Arc<Mutex<Stats>>,
    clock: Arc<dyn Clock>,
    active: tokio::sync::Mutex<Option<ActiveLoad>>,
    load_token: Mutex<Option<CancellationToken>>,
}

impl Player {
    pub fn new(deps: PlayerDeps) -> Self {
        Self::with_clock(deps, Arc::new(SystemClock))
    }

    pub fn with_clock(deps: PlayerDeps, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            deps,
            net: Arc::new(NetworkingEngine::new()),
            registry: ParserRegistry::with_defaults(),
            config: Arc::new(RwLock::new(PlayerConfig::default())),
            events,
            stats: Arc::new(Mutex::new(Stats::default())),
            clock,
            active: tokio::sync::Mutex::new(None),
            load_token: Mutex::new(None),
        }
    }

    /// The networking engine, for scheme plugins and filters.
    pub fn networking(&self) -> Arc<NetworkingEngine> {
        self.net.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    pub fn configure(&self, mutate: impl FnOnce(&mut PlayerConfig)) {
        let mut config = self.config.write();
        mutate(&mut config);
        config.validate();
    }

    pub fn get_configuration(&self) -> PlayerConfig {
        self.config.read().clone()
    }

    pub fn reset_configuration(&self) {
        *self.config.write() = PlayerConfig::default();
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn check(token: &CancellationToken) -> Result<(), PlayerError> {
        if token.is_cancelled() {
            Err(PlayerError::load_interrupted())
        } else {
            Ok(())
        }
    }

    /// Loads a manifest and starts streaming. Rejects with
    /// `LOAD_INTERRUPTED` when superseded by another load, an unload, or
    /// destroy.
    pub async fn load(&self, uri: &str, start_time: Option<f64>) -> Result<(), PlayerError> {
        self.load_with_mime(uri, start_time, None).await
    }

    pub async fn load_with_mime(
        &self,
        uri: &str,
        start_time: Option<f64>,
        mime_override: Option<&str>,
    ) -> Result<(), PlayerError> {
        // Interrupt whatever load is in flight, then take the slot.
        let token = CancellationToken::new();
        {
            let mut slot = self.load_token.lock();
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        let mut active = self.active.lock().await;
        Self::check(&token)?;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }

        let load_started = Instant::now();
        self.emit(PlayerEvent::Loading);

        let parser =
            self.registry
                .create(uri, mime_override, self.config.read().manifest.clone(), token.child_token())?;

        let shared = Arc::new(LoadShared {
            presentation_slot: RwLock::new(Arc::new(RwLock::new(
                presentation::Presentation::new(presentation::PresentationTimeline::new_static(
                    0.0,
                )),
            ))),
            abr: Arc::new(AbrController::new(self.config.read().abr.clone())),
            config: self.config.clone(),
            events: self.events.clone(),
            stats: self.stats.clone(),
            media: self.deps.media.clone(),
            clock: self.clock.clone(),
            engine: Mutex::new(None),
            playhead: Mutex::new(None),
            pending_regions: Mutex::new(Vec::new()),
            parser: Mutex::new(Some(parser.clone())),
            net: self.net.clone(),
            active_variant: Mutex::new(None),
            active_text: Mutex::new(None),
            text_visible: Mutex::new(false),
            drm: Mutex::new(None),
            played_once: Mutex::new(false),
        });

        // Bandwidth samples flow into this load's estimator; a weak ref
        // keeps dead loads from pinning their controllers.
        {
            let abr_weak = Arc::downgrade(&shared.abr);
            self.net.add_observer(Arc::new(move |request_type, ms, bytes| {
                if request_type == crate::net::RequestType::Segment {
                    if let Some(abr) = abr_weak.upgrade() {
                        abr.segment_downloaded(ms, bytes);
                    }
                }
            }));
        }

        let host: Arc<dyn ParserHost> = Arc::new(LoadHost {
            shared: shared.clone(),
        });
        let presentation = match parser.start(uri, host).await {
            Ok(presentation) => presentation,
            Err(error) => {
                parser.stop().await;
                return Err(if token.is_cancelled() {
                    PlayerError::load_interrupted()
                } else {
                    error
                });
            }
        };
        Self::check(&token)?;

        // Point the shared slot at the parser's live handle so manifest
        // refreshes stay visible everywhere.
        *shared.presentation_slot.write() = presentation.clone();
        let shared_presentation = presentation;

        {
            let presentation = shared_presentation.read();
            if presentation.periods.is_empty() {
                return Err(PlayerError::critical(ErrorDetail::NoPeriods));
            }
        }

        // DRM, before any encrypted bytes hit the buffers.
        let drm = self.init_drm(&shared, &token).await?;
        Self::check(&token)?;

        let buffer = Arc::new(MediaBufferEngine::new(self.deps.sink.clone()));
        let playhead = Playhead::new(
            self.deps.media.clone(),
            shared_presentation.clone(),
            buffer.clone(),
            self.config.clone(),
            {
                let shared = shared.clone();
                Arc::new(move |event| shared.emit(event))
            },
            &token,
        );
        *shared.playhead.lock() = Some(playhead.clone());
        for region in shared.pending_regions.lock().drain(..) {
            playhead.add_timeline_region(region);
        }

        // Initial position: clamped now, boundary-adjusted once streams are
        // chosen.
        let initial = {
            let presentation = shared_presentation.read();
            resolve_start_time(&presentation, start_time, false, &[])
        };
        self.deps.media.set_current_time(initial);

        let listener = Arc::new(LoadListener {
            shared: shared.clone(),
        });
        let engine = StreamingEngine::start(
            StreamingDeps {
                presentation: shared_presentation.clone(),
                net: self.net.clone(),
                buffer: buffer.clone(),
                media: self.deps.media.clone(),
                listener,
                index_creator: parser_as_index_creator(parser.clone()),
                config: self.config.clone(),
            },
            &token,
        );
        *shared.engine.lock() = Some(engine.clone());

        {
            let engine_for_seek = engine.clone();
            playhead.set_seek_callback(Arc::new(move || engine_for_seek.seeked()));
        }
        {
            let shared_for_state = shared.clone();
            playhead.set_state_callback(Arc::new(move |state, delta| {
                let now_ms = shared_for_state.clock.now().timestamp_millis();
                shared_for_state.stats.lock().note_state(state, now_ms, delta);
                if state == crate::stats::PlaybackState::Playing {
                    let mut played = shared_for_state.played_once.lock();
                    if !*played {
                        *played = true;
                        if let Some(drm) = shared_for_state.drm.lock().as_ref() {
                            drm.on_played();
                        }
                    }
                }
            }));
        }
        playhead.start();

        if self.config.read().abr.enabled {
            shared.abr.enable();
        }
        {
            let shared_for_switch = shared.clone();
            shared.abr.set_switch_callback(Arc::new(move |variant_id| {
                let bandwidth = {
                    let presentation = shared_for_switch.presentation();
                    let presentation = presentation.read();
                    presentation
                        .periods
                        .iter()
                        .find_map(|p| p.variant(variant_id))
                        .map(|v| v.bandwidth)
                        .unwrap_or(0)
                };
                *shared_for_switch.active_variant.lock() = Some(variant_id);
                shared_for_switch.record_switch(variant_id, bandwidth, true);
                if let Some(engine) = shared_for_switch.engine.lock().as_ref() {
                    engine.switch_variant(variant_id, false, 0.0);
                }
                shared_for_switch.emit(PlayerEvent::Adaptation);
            }));
        }

        self.stats.lock().load_latency = load_started.elapsed().as_secs_f64();
        *active = Some(ActiveLoad {
            token,
            manifest_uri: uri.to_string(),
            parser,
            presentation: shared_presentation,
            engine,
            playhead,
            buffer,
            abr: shared.abr.clone(),
            drm,
            shared,
        });
        self.emit(PlayerEvent::Streaming);
        Ok(())
    }

    async fn init_drm(
        &self,
        shared: &Arc<LoadShared>,
        token: &CancellationToken,
    ) -> Result<Option<DrmEngine>, PlayerError> {
        let (drm_infos, any_encrypted) = {
            let presentation = shared.presentation();
            let presentation = presentation.read();
            let mut infos = Vec::new();
            let mut encrypted = false;
            if let Some(period) = presentation.periods.first() {
                for variant in &period.variants {
                    infos.extend(variant.drm_infos.iter().cloned());
                    encrypted |= period
                        .variant_streams(variant)
                        .iter()
                        .any(|s| s.encrypted);
                }
            }
            (infos, encrypted)
        };
        let clear_keys_configured = !self.config.read().drm.clear_keys.is_empty();
        if drm_infos.is_empty() && !any_encrypted && !clear_keys_configured {
            return Ok(None);
        }

        let Some(factory) = self.deps.cdm.clone() else {
            if any_encrypted {
                return Err(PlayerError::critical(ErrorDetail::NoRecognizedKeySystems));
            }
            return Ok(None);
        };

        let shared_for_status = shared.clone();
        let shared_for_event = shared.clone();
        let shared_for_error = shared.clone();
        let callbacks = DrmCallbacks {
            on_key_status: Arc::new(move |statuses| {
                apply_key_statuses(&shared_for_status, statuses);
            }),
            on_event: Arc::new(move |event| shared_for_event.emit(event)),
            on_error: Arc::new(move |error| {
                shared_for_error.emit(PlayerEvent::Error(error));
            }),
        };
        let drm = DrmEngine::new(
            self.net.clone(),
            factory,
            self.config.read().drm.clone(),
            callbacks,
            token,
        );
        drm.init(&drm_infos, any_encrypted).await?;
        Self::check(token)?;
        if drm.is_active() {
            drm.attach(self.deps.media.as_ref())?;
            let session_ids = {
                let presentation = shared.presentation();
                let ids = presentation.read().offline_session_ids.clone();
                ids
            };
            if !session_ids.is_empty() {
                drm.load_persistent_sessions(&session_ids).await?;
            }
            drm.create_sessions(&drm_infos).await?;
        }
        *shared.drm.lock() = Some(drm.clone());
        Ok(Some(drm))
    }

    async fn teardown(&self, load: ActiveLoad) {
        load.token.cancel();
        self.emit(PlayerEvent::Unloading);
        load.engine.destroy();
        load.playhead.stop();
        load.parser.stop().await;
        if let Some(drm) = &load.drm {
            drm.destroy().await;
        }
        let _ = self.deps.media.set_media_keys(None);
        debug!(uri = %load.manifest_uri, "Unloaded");
    }

    pub async fn unload(&self) {
        {
            let mut slot = self.load_token.lock();
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
        }
        let mut active = self.active.lock().await;
        if let Some(load) = active.take() {
            self.teardown(load).await;
        }
    }

    /// Idempotent; equivalent to a final unload.
    pub async fn destroy(&self) {
        self.unload().await;
    }

    fn with_active<R>(&self, f: impl FnOnce(&ActiveLoad) -> R) -> Option<R> {
        // Public read-only surface; never blocks on in-flight loads.
        let guard = self.active.try_lock().ok()?;
        guard.as_ref().map(f)
    }

    pub fn get_manifest_uri(&self) -> Option<String> {
        self.with_active(|load| load.manifest_uri.clone())
    }

    pub fn is_live(&self) -> bool {
        self.with_active(|load| load.presentation.read().timeline.is_live())
            .unwrap_or(false)
    }

    pub fn is_in_progress(&self) -> bool {
        self.with_active(|load| load.presentation.read().timeline.is_in_progress())
            .unwrap_or(false)
    }

    pub fn seek_range(&self) -> (f64, f64) {
        self.with_active(|load| load.presentation.read().timeline.seek_range())
            .unwrap_or((0.0, 0.0))
    }

    pub fn is_buffering(&self) -> bool {
        self.with_active(|load| load.playhead.is_buffering())
            .unwrap_or(false)
    }

    pub fn is_audio_only(&self) -> bool {
        self.with_active(|load| {
            let presentation = load.presentation.read();
            let variants: Vec<&Variant> =
                presentation.periods.iter().flat_map(|p| &p.variants).collect();
            !variants.is_empty() && variants.iter().all(|v| v.video.is_none())
        })
        .unwrap_or(false)
    }

    pub fn get_buffered_info(&self) -> BufferedInfo {
        self.with_active(|load| load.buffer.get_buffered_info())
            .unwrap_or_default()
    }

    pub fn get_stats(&self) -> Stats {
        let mut stats = self.stats.lock().clone();
        let frames = self.deps.media.frame_stats();
        stats.decoded_frames = frames.decoded;
        stats.dropped_frames = frames.dropped;
        self.with_active(|load| {
            stats.estimated_bandwidth = load.abr.get_bandwidth_estimate();
            let presentation = load.presentation.read();
            if let Some(variant_id) = *load.shared.active_variant.lock() {
                if let Some((period, variant)) = presentation
                    .periods
                    .iter()
                    .find_map(|p| p.variant(variant_id).map(|v| (p, v)))
                {
                    stats.stream_bandwidth = variant.bandwidth;
                    if let Some(video) = variant.video.and_then(|id| period.stream(id)) {
                        stats.width = video.width.unwrap_or(0);
                        stats.height = video.height.unwrap_or(0);
                    }
                }
            }
        });
        stats
    }

    pub fn get_expiration(&self) -> Option<f64> {
        self.with_active(|load| load.drm.as_ref().and_then(|d| d.get_expiration()))
            .flatten()
    }

    pub fn key_system(&self) -> String {
        self.with_active(|load| {
            load.drm
                .as_ref()
                .map(|d| d.key_system())
                .unwrap_or_default()
        })
        .unwrap_or_default()
    }

    pub fn drm_info(&self) -> Option<presentation::DrmInfo> {
        self.with_active(|load| load.drm.as_ref().and_then(|d| d.drm_info()))
            .flatten()
    }

    pub async fn retry_streaming(&self) -> bool {
        let engine = self.with_active(|load| load.engine.clone());
        match engine {
            Some(engine) => engine.retry().await,
            None => false,
        }
    }

    fn current_period_index(&self, load: &ActiveLoad) -> usize {
        let time = self.deps.media.current_time();
        load.presentation.read().find_period_index(time).unwrap_or(0)
    }

    pub fn get_variant_tracks(&self) -> Vec<Track> {
        self.with_active(|load| {
            let active = *load.shared.active_variant.lock();
            let presentation = load.presentation.read();
            let Some(period) = presentation.periods.get(self.current_period_index(load)) else {
                return Vec::new();
            };
            period
                .variants
                .iter()
                .map(|variant| {
                    let video = variant.video.and_then(|id| period.stream(id));
                    let audio = variant.audio.and_then(|id| period.stream(id));
                    Track {
                        id: variant.id,
                        track_type: TrackType::Variant,
                        active: active == Some(variant.id),
                        language: variant.language.clone(),
                        bandwidth: variant.bandwidth,
                        width: video.and_then(|s| s.width),
                        height: video.and_then(|s| s.height),
                        frame_rate: video.and_then(|s| s.frame_rate),
                        label: audio.and_then(|s| s.label.clone()),
                        kind: None,
                        roles: audio
                            .map(|s| s.roles.clone())
                            .or_else(|| video.map(|s| s.roles.clone()))
                            .unwrap_or_default(),
                        primary: variant.primary,
                    }
                })
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn get_text_tracks(&self) -> Vec<Track> {
        self.with_active(|load| {
            let active = *load.shared.active_text.lock();
            let presentation = load.presentation.read();
            let Some(period) = presentation.periods.get(self.current_period_index(load)) else {
                return Vec::new();
            };
            period
                .text_streams
                .iter()
                .filter_map(|id| period.stream(*id))
                .map(|stream| Track {
                    id: stream.id,
                    track_type: TrackType::Text,
                    active: active == Some(stream.id),
                    language: stream.language.clone(),
                    bandwidth: stream.bandwidth,
                    width: None,
                    height: None,
                    frame_rate: None,
                    label: stream.label.clone(),
                    kind: stream.kind.clone(),
                    roles: stream.roles.clone(),
                    primary: stream.primary,
                })
                .collect()
        })
        .unwrap_or_default()
    }

    /// Switches to a specific variant; manual selection turns ABR off.
    pub fn select_variant_track(&self, track_id: VariantId, clear_buffer: bool) {
        self.with_active(|load| {
            load.abr.disable();
            let bandwidth = load
                .presentation
                .read()
                .periods
                .iter()
                .find_map(|p| p.variant(track_id))
                .map(|v| v.bandwidth)
                .unwrap_or(0);
            *load.shared.active_variant.lock() = Some(track_id);
            load.shared.record_switch(track_id, bandwidth, false);
            let margin = self.config.read().streaming.default_clear_safe_margin;
            load.engine.switch_variant(track_id, clear_buffer, margin);
            load.shared.emit(PlayerEvent::TracksChanged);
        });
    }

    pub fn select_text_track(&self, track_id: StreamId) {
        self.with_active(|load| {
            *load.shared.active_text.lock() = Some(track_id);
            if *load.shared.text_visible.lock() {
                load.engine.switch_text_stream(Some(track_id));
            }
            load.shared.emit(PlayerEvent::TracksChanged);
        });
    }

    pub fn select_audio_language(&self, language: &str, role: Option<&str>) {
        self.with_active(|load| {
            let chosen = {
                let presentation = load.presentation.read();
                let period_index = self.current_period_index(load);
                presentation.periods.get(period_index).and_then(|period| {
                    period
                        .variants
                        .iter()
                        .filter(|v| v.language == language && v.is_playable())
                        .find(|v| {
                            role.is_none()
                                || v.audio
                                    .and_then(|id| period.stream(id))
                                    .map(|s| s.roles.iter().any(|r| Some(r.as_str()) == role))
                                    .unwrap_or(false)
                        })
                        .map(|v| v.id)
                })
            };
            if let Some(variant_id) = chosen {
                *load.shared.active_variant.lock() = Some(variant_id);
                load.engine.switch_variant(variant_id, true, 0.0);
                load.shared.emit(PlayerEvent::TracksChanged);
            } else {
                debug!(language, "No variant for requested audio language");
            }
        });
    }

    pub fn select_text_language(&self, language: &str, _role: Option<&str>) {
        self.with_active(|load| {
            let chosen = {
                let presentation = load.presentation.read();
                let period_index = self.current_period_index(load);
                presentation.periods.get(period_index).and_then(|period| {
                    period
                        .text_streams
                        .iter()
                        .find(|id| {
                            period
                                .stream(**id)
                                .map(|s| s.language == language)
                                .unwrap_or(false)
                        })
                        .copied()
                })
            };
            if let Some(stream_id) = chosen {
                self.select_text_track(stream_id);
            }
        });
    }

    pub fn set_text_track_visibility(&self, visible: bool) {
        self.with_active(|load| {
            *load.shared.text_visible.lock() = visible;
            if visible {
                let chosen = {
                    let presentation = load.presentation.read();
                    let period_index = self.current_period_index(load);
                    presentation.periods.get(period_index).and_then(|period| {
                        choose_text_stream(
                            period,
                            &self.config.read().preferred_text_language,
                            *load.shared.active_text.lock(),
                        )
                    })
                };
                *load.shared.active_text.lock() = chosen;
                load.engine.switch_text_stream(chosen);
            } else {
                load.engine.switch_text_stream(None);
            }
            load.shared.emit(PlayerEvent::TextTrackVisibility { visible });
        });
    }

    pub fn is_text_track_visible(&self) -> bool {
        self.with_active(|load| *load.shared.text_visible.lock())
            .unwrap_or(false)
    }

    /// Adds a side-loaded text track spanning the whole presentation.
    pub async fn add_text_track(
        &self,
        uri: &str,
        language: &str,
        kind: &str,
        mime: &str,
        codec: Option<&str>,
        label: Option<&str>,
    ) -> Result<Track, PlayerError> {
        let result = self.with_active(|load| {
            let mut presentation = load.presentation.write();
            let duration = presentation.timeline.duration();
            let end = if duration.is_finite() { duration } else { f64::MAX };
            let Some(period) = presentation.periods.first_mut() else {
                return Err(PlayerError::critical(ErrorDetail::NoPeriods));
            };
            let id = period.streams.keys().max().copied().unwrap_or(0) + 1000;
            let reference = SegmentReference::with_uris(
                0,
                0.0,
                end,
                vec![uri.to_string()],
                None,
                None,
            );
            let stream = Stream {
                id,
                stream_type: StreamType::Text,
                mime_type: mime.to_string(),
                codecs: codec.unwrap_or_default().to_string(),
                bandwidth: 0,
                width: None,
                height: None,
                frame_rate: None,
                channels_count: None,
                language: language.to_string(),
                label: label.map(|l| l.to_string()),
                kind: Some(kind.to_string()),
                roles: Vec::new(),
                primary: false,
                encrypted: false,
                key_id: None,
                init_segment: None,
                presentation_time_offset: 0.0,
                trick_mode_video: None,
                index: SegmentIndexHandle::with_index(SegmentIndex::new(vec![reference])),
            };
            let track = Track {
                id,
                track_type: TrackType::Text,
                active: false,
                language: stream.language.clone(),
                bandwidth: 0,
                width: None,
                height: None,
                frame_rate: None,
                label: stream.label.clone(),
                kind: stream.kind.clone(),
                roles: Vec::new(),
                primary: false,
            };
            period.streams.insert(id, stream);
            period.text_streams.push(id);
            Ok(track)
        });
        let track = result.unwrap_or_else(|| {
            Err(PlayerError::critical(ErrorDetail::NoPeriods))
        })?;
        self.emit(PlayerEvent::TracksChanged);
        Ok(track)
    }

    /// Starts trick play at `rate`, using the trick-mode rendition when the
    /// active video stream has one.
    pub fn trick_play(&self, rate: f64) {
        self.deps.media.set_playback_rate(rate);
        self.with_active(|load| {
            if rate.abs() > 1.0 {
                load.engine.set_trick_play(true);
            }
        });
    }

    pub fn cancel_trick_play(&self) {
        self.deps.media.set_playback_rate(1.0);
        self.with_active(|load| load.engine.set_trick_play(false));
    }

    pub fn get_playback_rate(&self) -> f64 {
        self.deps.media.playback_rate()
    }
}

/// Marks variants disallowed by key status and re-chooses if the active
/// variant died.
fn apply_key_statuses(shared: &Arc<LoadShared>, statuses: &HashMap<String, KeyStatus>) {
    let mut changed = false;
    let shared_presentation = shared.presentation();
    {
        let mut presentation = shared_presentation.write();
        let periods = &mut presentation.periods;
        for period in periods.iter_mut() {
            let disallowed_streams: Vec<StreamId> = period
                .streams
                .values()
                .filter(|stream| {
                    stream
                        .key_id
                        .as_ref()
                        .and_then(|kid| statuses.get(&kid.to_hex()))
                        .map(|status| status.disallows_playback())
                        .unwrap_or(false)
                })
                .map(|stream| stream.id)
                .collect();
            for variant in &mut period.variants {
                let hit = variant
                    .audio
                    .iter()
                    .chain(variant.video.iter())
                    .any(|id| disallowed_streams.contains(id));
                if hit && variant.allowed_by_key_system {
                    variant.allowed_by_key_system = false;
                    changed = true;
                }
            }
        }
    }
    if changed {
        shared.emit(PlayerEvent::TracksChanged);
        let presentation = shared_presentation.read();
        if let Some(period) = presentation.periods.first() {
            shared.refresh_abr_variants(period);
        }
        let active = *shared.active_variant.lock();
        let active_dead = active
            .and_then(|id| {
                presentation
                    .periods
                    .iter()
                    .find_map(|p| p.variant(id))
                    .map(|v| !v.is_playable())
            })
            .unwrap_or(false);
        if active_dead {
            if let Some(next) = shared.abr.choose_variant() {
                *shared.active_variant.lock() = Some(next);
                if let Some(engine) = shared.engine.lock().as_ref() {
                    engine.switch_variant(next, true, 0.0);
                }
                shared.emit(PlayerEvent::Adaptation);
            }
        }
    }
}

fn parser_as_index_creator(parser: Arc<dyn ManifestParser>) -> Arc<dyn SegmentIndexCreator> {
    struct Adapter(Arc<dyn ManifestParser>);
    #[async_trait]
    impl SegmentIndexCreator for Adapter {
        async fn create_segment_index(&self, stream_id: StreamId) -> Result<(), PlayerError> {
            self.0.create_segment_index(stream_id).await
        }
    }
    Arc::new(Adapter(parser))
}
