// Streaming engine: the per-content-type fetch-append state machine that
// keeps audio, video, and text advancing in lock-step with the playhead.
//
// All engine state lives in one task; public methods are commands over a
// channel, so no locks guard the media states and every await site is
// raced against the destroy token.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use presentation::{
    InitSegmentReference, SegmentReference, Stream, StreamId, StreamType, VariantId,
};

use crate::buffer::{MediaBufferEngine, SinkError};
use crate::config::PlayerConfig;
use crate::error::{Category, ErrorDetail, PlayerError};
use crate::events::{EmsgInfo, PlayerEvent};
use crate::manifest::{SegmentIndexCreator, SharedPresentation};
use crate::media::MediaElement;
use crate::net::{NetworkingEngine, Request, RequestType};

/// Fudge subtracted from the append window start so the first frames of a
/// period survive rounding in the container timestamps.
const APPEND_WINDOW_FUDGE: f64 = 0.05;
/// Slack when deciding that a period's content is exhausted.
const PERIOD_EDGE_SLACK: f64 = 0.1;
/// Shrink factor applied to `buffer_behind` after a quota error.
const QUOTA_BACKOFF_FACTOR: f64 = 0.8;
/// Consecutive quota failures before `QUOTA_EXCEEDED_ERROR` surfaces.
const MAX_QUOTA_FAILURES: u32 = 3;

/// Streams chosen for one period.
#[derive(Debug, Clone, Default)]
pub struct ChosenStreams {
    pub variant: Option<VariantId>,
    pub text: Option<StreamId>,
}

/// The engine's upcalls into its owner.
#[async_trait]
pub trait StreamingListener: Send + Sync {
    /// Picks the variant and text stream for a period.
    async fn on_choose_streams(&self, period_index: usize) -> ChosenStreams;
    /// All media states have settled in `period_index`; switches are safe.
    fn on_can_switch(&self, period_index: usize);
    fn on_initial_streams_setup(&self) {}
    /// A period transition began or ended; ABR must stay quiet while true.
    fn on_transition(&self, _pending: bool) {}
    fn on_error(&self, error: PlayerError);
    fn on_event(&self, _event: PlayerEvent) {}
    /// An inband event asked for a manifest refresh.
    fn on_manifest_refresh_requested(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ClearMode {
    All,
    FromPlayhead(f64),
}

enum Command {
    SwitchVariant {
        variant_id: VariantId,
        clear_buffer: bool,
        safe_margin: f64,
    },
    SwitchText(Option<StreamId>),
    SetTrickPlay(bool),
    Seeked,
    ManifestUpdated,
    Retry(oneshot::Sender<bool>),
}

struct MediaState {
    stream_id: StreamId,
    period_index: usize,
    last_position: Option<u64>,
    last_init: Option<Arc<InitSegmentReference>>,
    needs_init: bool,
    needs_properties: bool,
    timestamp_offset: f64,
    waiting_to_clear: Option<ClearMode>,
    end_of_stream: bool,
    halted: bool,
    next_update: Instant,
    effective_buffer_behind: f64,
    quota_failures: u32,
}

impl MediaState {
    fn new(stream_id: StreamId, period_index: usize, timestamp_offset: f64, behind: f64) -> Self {
        Self {
            stream_id,
            period_index,
            last_position: None,
            last_init: None,
            needs_init: true,
            needs_properties: true,
            timestamp_offset,
            waiting_to_clear: None,
            end_of_stream: false,
            halted: false,
            next_update: Instant::now(),
            effective_buffer_behind: behind,
            quota_failures: 0,
        }
    }

    fn is_idle(&self) -> bool {
        self.halted || self.end_of_stream
    }
}

pub struct StreamingDeps {
    pub presentation: SharedPresentation,
    pub net: Arc<NetworkingEngine>,
    pub buffer: Arc<MediaBufferEngine>,
    pub media: Arc<dyn MediaElement>,
    pub listener: Arc<dyn StreamingListener>,
    pub index_creator: Arc<dyn SegmentIndexCreator>,
    pub config: Arc<RwLock<PlayerConfig>>,
}

/// Handle to a running engine task. Cloning clones the handle, not the
/// engine.
#[derive(Clone)]
pub struct StreamingEngine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    token: CancellationToken,
}

impl StreamingEngine {
    /// Spawns the engine task; it initializes itself and starts fetching.
    pub fn start(deps: StreamingDeps, parent_token: &CancellationToken) -> Self {
        let token = parent_token.child_token();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = EngineTask {
            deps,
            token: token.clone(),
            cmd_rx,
            states: BTreeMap::new(),
            setup_periods: HashMap::new(),
            transition_target: None,
            deferred: VecDeque::new(),
            trick_play_backup: None,
            eos_fired: false,
        };
        tokio::spawn(task.run());
        Self { cmd_tx, token }
    }

    pub fn switch_variant(&self, variant_id: VariantId, clear_buffer: bool, safe_margin: f64) {
        let _ = self.cmd_tx.send(Command::SwitchVariant {
            variant_id,
            clear_buffer,
            safe_margin,
        });
    }

    pub fn switch_text_stream(&self, stream: Option<StreamId>) {
        let _ = self.cmd_tx.send(Command::SwitchText(stream));
    }

    pub fn set_trick_play(&self, on: bool) {
        let _ = self.cmd_tx.send(Command::SetTrickPlay(on));
    }

    pub fn seeked(&self) {
        let _ = self.cmd_tx.send(Command::Seeked);
    }

    pub fn notify_manifest_updated(&self) {
        let _ = self.cmd_tx.send(Command::ManifestUpdated);
    }

    /// Restarts halted streams after a failure; false when nothing was
    /// halted or the engine is gone.
    pub async fn retry(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Retry(tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn destroy(&self) {
        self.token.cancel();
    }
}

struct EngineTask {
    deps: StreamingDeps,
    token: CancellationToken,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    states: BTreeMap<StreamType, MediaState>,
    /// Streams chosen per period, cached so a period is chosen once.
    setup_periods: HashMap<usize, ChosenStreams>,
    /// Period a transition is under way toward; switches defer until done.
    transition_target: Option<usize>,
    deferred: VecDeque<Command>,
    /// Original video stream while trick play is engaged.
    trick_play_backup: Option<StreamId>,
    eos_fired: bool,
}

/// Snapshot of the stream and period geometry one update cycle works with.
struct CycleContext {
    stream: Stream,
    period_start: f64,
    period_end: f64,
    is_last_period: bool,
    is_live: bool,
    max_segment_duration: f64,
}

impl EngineTask {
    async fn run(mut self) {
        if let Err(error) = self.init().await {
            if !self.token.is_cancelled() {
                self.deps.listener.on_error(error);
            }
            return;
        }

        loop {
            let next_due = self
                .states
                .values()
                .filter(|s| !s.is_idle())
                .map(|s| s.next_update)
                .min();
            tokio::select! {
                _ = self.token.cancelled() => break,
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if next_due.is_some() => {
                    let now = Instant::now();
                    let due: Vec<StreamType> = self
                        .states
                        .iter()
                        .filter(|(_, s)| !s.is_idle() && s.next_update <= now)
                        .map(|(t, _)| *t)
                        .collect();
                    for content_type in due {
                        if self.token.is_cancelled() {
                            return;
                        }
                        self.update(content_type).await;
                    }
                    self.maybe_finish_transition();
                    self.check_end_of_stream().await;
                }
            }
        }
    }

    async fn init(&mut self) -> Result<(), PlayerError> {
        let start_time = self.deps.media.current_time();
        let period_index = self
            .deps
            .presentation
            .read()
            .find_period_index(start_time)
            .unwrap_or(0);
        let chosen = self.deps.listener.on_choose_streams(period_index).await;
        self.setup_periods.insert(period_index, chosen.clone());

        let stream_ids = self.stream_ids_for(period_index, &chosen)?;
        for (_, stream_id) in &stream_ids {
            self.deps.index_creator.create_segment_index(*stream_id).await?;
            if self.token.is_cancelled() {
                return Err(PlayerError::aborted());
            }
        }

        // Buffer engine init with the chosen streams' full MIME types.
        let mut mimes = Vec::new();
        {
            let presentation = self.deps.presentation.read();
            let period = presentation
                .periods
                .get(period_index)
                .ok_or_else(|| PlayerError::critical(ErrorDetail::NoPeriods))?;
            for (content_type, stream_id) in &stream_ids {
                let stream = period.stream(*stream_id).ok_or_else(|| {
                    PlayerError::critical(ErrorDetail::MediaSourceOperationFailed {
                        reason: format!("chosen stream {stream_id} missing"),
                    })
                })?;
                mimes.push((*content_type, stream.full_mime_type()));
            }
        }
        self.deps.buffer.init(&mimes)?;

        let (duration, behind) = {
            let presentation = self.deps.presentation.read();
            (
                presentation.timeline.duration(),
                self.deps.config.read().streaming.buffer_behind,
            )
        };
        if duration.is_finite() {
            self.deps.buffer.set_duration(duration);
        }

        for (content_type, stream_id) in stream_ids {
            let offset = self.timestamp_offset_for(period_index, stream_id);
            self.states.insert(
                content_type,
                MediaState::new(stream_id, period_index, offset, behind),
            );
        }

        self.deps.listener.on_initial_streams_setup();
        self.deps.listener.on_can_switch(period_index);
        info!(period_index, streams = self.states.len(), "Streaming engine started");
        Ok(())
    }

    /// Maps a period's chosen variant/text into per-type stream ids.
    fn stream_ids_for(
        &self,
        period_index: usize,
        chosen: &ChosenStreams,
    ) -> Result<Vec<(StreamType, StreamId)>, PlayerError> {
        let presentation = self.deps.presentation.read();
        let period = presentation
            .periods
            .get(period_index)
            .ok_or_else(|| PlayerError::critical(ErrorDetail::NoPeriods))?;
        let mut out = Vec::new();
        if let Some(variant_id) = chosen.variant {
            let variant = period.variant(variant_id).ok_or_else(|| {
                PlayerError::critical(ErrorDetail::UnplayablePeriod {
                    start_time: period.start_time,
                })
            })?;
            if let Some(audio) = variant.audio {
                out.push((StreamType::Audio, audio));
            }
            if let Some(video) = variant.video {
                out.push((StreamType::Video, video));
            }
        }
        if let Some(text) = chosen.text {
            out.push((StreamType::Text, text));
        }
        if out.is_empty() {
            return Err(PlayerError::critical(ErrorDetail::UnplayablePeriod {
                start_time: presentation
                    .periods
                    .get(period_index)
                    .map(|p| p.start_time)
                    .unwrap_or(0.0),
            }));
        }
        Ok(out)
    }

    fn timestamp_offset_for(&self, period_index: usize, stream_id: StreamId) -> f64 {
        let presentation = self.deps.presentation.read();
        let Some(period) = presentation.periods.get(period_index) else {
            return 0.0;
        };
        let pto = period
            .stream(stream_id)
            .map(|s| s.presentation_time_offset)
            .unwrap_or(0.0);
        period.start_time - pto
    }

    fn schedule(&mut self, content_type: StreamType, delay: Duration) {
        if let Some(state) = self.states.get_mut(&content_type) {
            state.next_update = Instant::now() + delay;
        }
    }

    fn cycle_context(&self, content_type: StreamType) -> Option<CycleContext> {
        let state = self.states.get(&content_type)?;
        let presentation = self.deps.presentation.read();
        let period = presentation.periods.get(state.period_index)?;
        let stream = period.stream(state.stream_id)?.clone();
        Some(CycleContext {
            stream,
            period_start: period.start_time,
            period_end: presentation.period_end(state.period_index),
            is_last_period: state.period_index + 1 >= presentation.periods.len(),
            is_live: presentation.timeline.is_live(),
            max_segment_duration: presentation.timeline.max_segment_duration(),
        })
    }

    /// One fetch-append cycle for one content type.
    async fn update(&mut self, content_type: StreamType) {
        let (buffering_goal, update_cap, buffer_behind) = {
            let config = self.deps.config.read();
            (
                config.streaming.buffering_goal,
                Duration::from_secs_f64(config.streaming.update_interval_cap.max(0.1)),
                config.streaming.buffer_behind,
            )
        };
        let playhead = self.deps.media.current_time();

        // A pending clear blocks everything else for this type.
        if let Some(mode) = self
            .states
            .get_mut(&content_type)
            .and_then(|s| s.waiting_to_clear.take())
        {
            let result = match mode {
                ClearMode::All => self.deps.buffer.clear(content_type).await,
                ClearMode::FromPlayhead(margin) => {
                    self.deps
                        .buffer
                        .remove(content_type, playhead + margin, f64::INFINITY)
                        .await
                }
            };
            if let Err(error) = result {
                self.handle_failure(content_type, error).await;
                return;
            }
            if let Some(state) = self.states.get_mut(&content_type) {
                state.last_position = None;
                state.needs_init = true;
                state.needs_properties = true;
                state.end_of_stream = false;
            }
            self.eos_fired = false;
            self.schedule(content_type, Duration::ZERO);
            return;
        }

        let Some(context) = self.cycle_context(content_type) else {
            self.schedule(content_type, update_cap);
            return;
        };

        // Text buffers are created lazily and only re-created when the
        // stream's container type actually changed.
        if content_type == StreamType::Text {
            let mime = context.stream.full_mime_type();
            let needs_reinit = self
                .deps
                .buffer
                .mime_for(StreamType::Text)
                .map(|current| current != mime)
                .unwrap_or(true);
            if needs_reinit {
                if let Err(error) = self.deps.buffer.reinit_text(&mime) {
                    self.handle_failure(content_type, error).await;
                    return;
                }
            }
        }

        let buffered_ahead = self.deps.buffer.buffered_ahead_of(content_type, playhead);

        // Lock-step fairness: no A/V type may run more than one segment
        // ahead of the slowest one.
        if content_type != StreamType::Text {
            let min_other = [StreamType::Audio, StreamType::Video]
                .into_iter()
                .filter(|t| *t != content_type)
                .filter_map(|t| {
                    self.states
                        .get(&t)
                        .filter(|s| !s.is_idle())
                        .map(|_| self.deps.buffer.buffered_ahead_of(t, playhead))
                })
                .fold(f64::INFINITY, f64::min);
            if min_other.is_finite()
                && buffered_ahead > min_other + context.max_segment_duration.max(1.0)
            {
                self.schedule(content_type, Duration::from_millis(100));
                return;
            }
        }

        if buffered_ahead >= buffering_goal {
            self.schedule(content_type, update_cap);
            return;
        }

        // Make sure the index exists before asking it anything.
        if !context.stream.index.is_created() {
            if let Err(error) = self
                .deps
                .index_creator
                .create_segment_index(context.stream.id)
                .await
            {
                self.handle_failure(content_type, error).await;
                return;
            }
            if self.token.is_cancelled() {
                return;
            }
        }

        let state = self.states.get(&content_type).expect("state exists");
        let position = match state.last_position {
            Some(position) => Some(position + 1),
            None => {
                // First unbuffered time, in period-relative terms.
                let target = (playhead + buffered_ahead - context.period_start).max(0.0);
                context.stream.index.find(target)
            }
        };
        let reference = position.and_then(|p| context.stream.index.get(p));

        let Some(reference) = reference else {
            self.on_reference_exhausted(content_type, &context, playhead, buffered_ahead, update_cap)
                .await;
            return;
        };

        if let Err(error) = self
            .fetch_and_append(content_type, &context, &reference, playhead, buffer_behind)
            .await
        {
            self.handle_failure(content_type, error).await;
            return;
        }
        if self.token.is_cancelled() {
            return;
        }

        let new_ahead = self.deps.buffer.buffered_ahead_of(content_type, playhead);
        let delay = (reference.duration() - new_ahead).max(0.0);
        self.schedule(
            content_type,
            Duration::from_secs_f64(delay).min(update_cap),
        );
    }

    /// The index had no next reference: period transition, end of stream,
    /// or waiting on a live manifest update.
    async fn on_reference_exhausted(
        &mut self,
        content_type: StreamType,
        context: &CycleContext,
        playhead: f64,
        buffered_ahead: f64,
        update_cap: Duration,
    ) {
        let reached_period_end =
            playhead + buffered_ahead >= context.period_end - PERIOD_EDGE_SLACK;

        if !context.is_last_period && reached_period_end {
            let current_period = self.states[&content_type].period_index;
            self.begin_period_transition(content_type, current_period + 1).await;
            return;
        }

        if context.is_last_period && !context.is_live && reached_period_end {
            if let Some(state) = self.states.get_mut(&content_type) {
                if !state.end_of_stream {
                    debug!(content_type = %content_type, "Stream reached end");
                    state.end_of_stream = true;
                }
            }
            return;
        }

        // Live: the manifest will grow; back off and look again.
        self.schedule(content_type, update_cap);
    }

    async fn begin_period_transition(&mut self, content_type: StreamType, target: usize) {
        let chosen = match self.setup_periods.get(&target) {
            Some(chosen) => chosen.clone(),
            None => {
                self.transition_target = Some(target);
                self.deps.listener.on_transition(true);
                let chosen = self.deps.listener.on_choose_streams(target).await;
                if self.token.is_cancelled() {
                    return;
                }
                self.setup_periods.insert(target, chosen.clone());
                chosen
            }
        };

        let Ok(stream_ids) = self.stream_ids_for(target, &chosen) else {
            let start_time = self
                .deps
                .presentation
                .read()
                .periods
                .get(target)
                .map(|p| p.start_time)
                .unwrap_or(0.0);
            self.handle_failure(
                content_type,
                PlayerError::critical(ErrorDetail::UnplayablePeriod { start_time }),
            )
            .await;
            return;
        };

        let new_stream = stream_ids
            .iter()
            .find(|(t, _)| *t == content_type)
            .map(|(_, id)| *id);
        let Some(new_stream) = new_stream else {
            // The new period has no stream of this type (e.g. text ended).
            if let Some(state) = self.states.get_mut(&content_type) {
                state.end_of_stream = true;
            }
            return;
        };

        if let Err(error) = self.deps.index_creator.create_segment_index(new_stream).await {
            self.handle_failure(content_type, error).await;
            return;
        }
        let offset = self.timestamp_offset_for(target, new_stream);
        if let Some(state) = self.states.get_mut(&content_type) {
            state.stream_id = new_stream;
            state.period_index = target;
            state.last_position = None;
            state.needs_init = true;
            state.needs_properties = true;
            state.timestamp_offset = offset;
        }
        debug!(content_type = %content_type, period = target, "Period transition");
        self.schedule(content_type, Duration::ZERO);
    }

    /// Finishes a transition once every active state has arrived in the
    /// target period, then replays deferred switches.
    fn maybe_finish_transition(&mut self) {
        let Some(target) = self.transition_target else {
            return;
        };
        let all_arrived = self
            .states
            .values()
            .filter(|s| !s.halted)
            .all(|s| s.period_index >= target || s.end_of_stream);
        if !all_arrived {
            return;
        }
        self.transition_target = None;
        self.deps.listener.on_transition(false);
        self.deps.listener.on_can_switch(target);
        let deferred: Vec<Command> = self.deferred.drain(..).collect();
        for command in deferred {
            self.apply_switch(command);
        }
    }

    async fn fetch_and_append(
        &mut self,
        content_type: StreamType,
        context: &CycleContext,
        reference: &SegmentReference,
        playhead: f64,
        buffer_behind: f64,
    ) -> Result<(), PlayerError> {
        let retry = self.deps.config.read().streaming.retry.clone();

        // Evict behind the playhead before growing the buffer.
        let state_behind = self.states[&content_type].effective_buffer_behind;
        let behind_limit = state_behind.min(buffer_behind);
        if let Some(buffer_start) = self.deps.buffer.buffer_start(content_type) {
            let evict_to = playhead - behind_limit;
            if buffer_start < evict_to {
                self.deps.buffer.remove(content_type, 0.0, evict_to).await?;
            }
        }

        // Append window and timestamp offset for this period.
        if self.states[&content_type].needs_properties {
            let window_start = (context.period_start - APPEND_WINDOW_FUDGE).max(0.0);
            let window_end = if context.period_end.is_finite() {
                context.period_end
            } else {
                f64::INFINITY
            };
            self.deps
                .buffer
                .set_stream_properties(
                    content_type,
                    self.states[&content_type].timestamp_offset,
                    window_start,
                    window_end,
                )
                .await?;
            if let Some(state) = self.states.get_mut(&content_type) {
                state.needs_properties = false;
            }
        }

        // Init segment, unless the current one is already appended.
        let wanted_init = reference
            .init_segment
            .clone()
            .or_else(|| context.stream.init_segment.clone());
        let force_init = self.states[&content_type].needs_init;
        if let Some(init) = wanted_init {
            let unchanged = self.states[&content_type]
                .last_init
                .as_ref()
                .map(|last| **last == *init)
                .unwrap_or(false);
            if force_init || !unchanged {
                let mut request = Request::get(init.uris.clone(), retry.clone());
                if let Some(range) = &init.byte_range {
                    request = request.with_header("range", range.to_http_range());
                }
                let response = self
                    .deps
                    .net
                    .request(RequestType::Segment, request, &self.token)
                    .await?;
                self.append_with_quota_retry(content_type, response.data, playhead)
                    .await?;
                if let Some(state) = self.states.get_mut(&content_type) {
                    state.last_init = Some(init);
                    state.needs_init = false;
                }
            }
        } else if let Some(state) = self.states.get_mut(&content_type) {
            state.needs_init = false;
        }

        // The media segment itself.
        let mut request = Request::get(reference.uris(), retry);
        if let Some(range) = &reference.byte_range {
            request = request.with_header("range", range.to_http_range());
        }
        let response = self
            .deps
            .net
            .request(RequestType::Segment, request, &self.token)
            .await?;
        if self.token.is_cancelled() {
            return Err(PlayerError::aborted());
        }

        // Inband events ride on video segments only.
        if content_type == StreamType::Video && context.stream.mime_type.contains("mp4") {
            self.scan_emsg(context, reference, &response.data);
        }

        self.append_with_quota_retry(content_type, response.data, playhead)
            .await?;
        if let Some(state) = self.states.get_mut(&content_type) {
            state.last_position = Some(reference.position);
            state.quota_failures = 0;
        }
        Ok(())
    }

    fn scan_emsg(
        &self,
        context: &CycleContext,
        reference: &SegmentReference,
        data: &[u8],
    ) {
        for emsg in dash::parse_emsg_boxes(data) {
            if emsg.scheme_id_uri == dash::MANIFEST_REFRESH_SCHEME {
                info!("Inband event requested a manifest refresh");
                self.deps.listener.on_manifest_refresh_requested();
                continue;
            }
            let timescale = emsg.timescale.max(1) as f64;
            let start = match emsg.presentation_time {
                Some(absolute) => context.period_start + absolute as f64 / timescale,
                None => {
                    context.period_start
                        + reference.start_time
                        + emsg.presentation_time_delta.unwrap_or(0) as f64 / timescale
                }
            };
            self.deps.listener.on_event(PlayerEvent::Emsg(EmsgInfo {
                scheme_id_uri: emsg.scheme_id_uri,
                value: emsg.value,
                start_time: start,
                end_time: start + emsg.event_duration as f64 / timescale,
                timescale: emsg.timescale,
                id: emsg.id,
                message_data: emsg.message_data,
            }));
        }
    }

    async fn append_with_quota_retry(
        &mut self,
        content_type: StreamType,
        data: bytes::Bytes,
        playhead: f64,
    ) -> Result<(), PlayerError> {
        loop {
            match self.deps.buffer.append_buffer(content_type, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(SinkError::QuotaExceeded) => {
                    let failures = {
                        let state = self.states.get_mut(&content_type).expect("state exists");
                        state.quota_failures += 1;
                        state.effective_buffer_behind *= QUOTA_BACKOFF_FACTOR;
                        state.quota_failures
                    };
                    if failures > MAX_QUOTA_FAILURES {
                        return Err(PlayerError::critical(ErrorDetail::QuotaExceededError {
                            content_type: content_type.to_string(),
                        }));
                    }
                    let behind = self.states[&content_type].effective_buffer_behind;
                    warn!(
                        content_type = %content_type,
                        buffer_behind = behind,
                        "Quota exceeded; evicting and retrying"
                    );
                    self.deps
                        .buffer
                        .remove(content_type, 0.0, (playhead - behind).max(0.0))
                        .await?;
                }
                Err(SinkError::Failed(reason)) => {
                    return Err(PlayerError::critical(
                        ErrorDetail::MediaSourceOperationFailed { reason },
                    ));
                }
            }
        }
    }

    /// Applies the §4.7.4 policy to a failed cycle.
    async fn handle_failure(&mut self, content_type: StreamType, error: PlayerError) {
        if self.token.is_cancelled() || error.code() == ErrorDetail::OperationAborted.code() {
            return;
        }
        let is_live = self.deps.presentation.read().timeline.is_live();
        let retriable_network = error.category() == Category::Network
            && matches!(error.code(), 1001 | 1002 | 1003);

        if is_live && retriable_network {
            let recoverable = error.into_recoverable();
            warn!(content_type = %content_type, error = %recoverable, "Recoverable live failure");
            self.deps.listener.on_error(recoverable.clone());
            let callback = self.deps.config.read().streaming.failure_callback.clone();
            if let Some(callback) = callback {
                callback(&recoverable);
            }
            let cap = self.deps.config.read().streaming.update_interval_cap;
            self.schedule(content_type, Duration::from_secs_f64(cap.max(0.1)));
            return;
        }

        if content_type == StreamType::Text
            && self.deps.config.read().streaming.ignore_text_stream_failures
        {
            warn!(error = %error, "Ignoring text stream failure");
            if let Some(state) = self.states.get_mut(&content_type) {
                state.halted = true;
            }
            return;
        }

        warn!(content_type = %content_type, error = %error, "Halting stream after failure");
        if let Some(state) = self.states.get_mut(&content_type) {
            state.halted = true;
        }
        self.deps.listener.on_error(error);
    }

    async fn check_end_of_stream(&mut self) {
        if self.eos_fired || self.states.is_empty() {
            return;
        }
        let all_done = self
            .states
            .values()
            .all(|s| s.end_of_stream || s.halted);
        let any_eos = self.states.values().any(|s| s.end_of_stream);
        if !all_done || !any_eos {
            return;
        }
        self.eos_fired = true;
        info!("All streams ended; signaling end of stream");
        // Finalize the duration to the observed maximum.
        let observed_end = [StreamType::Audio, StreamType::Video, StreamType::Text]
            .into_iter()
            .filter_map(|t| self.deps.buffer.buffer_end(t))
            .fold(0.0f64, f64::max);
        {
            let mut presentation = self.deps.presentation.write();
            if !presentation.timeline.duration().is_finite() && observed_end > 0.0 {
                presentation.timeline.set_duration(observed_end);
            }
        }
        if let Err(error) = self.deps.buffer.end_of_stream().await {
            self.deps.listener.on_error(error);
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Seeked => self.on_seeked().await,
            Command::ManifestUpdated => {
                // Wake anything that was waiting on the manifest.
                for state in self.states.values_mut() {
                    if !state.is_idle() {
                        state.next_update = Instant::now();
                    }
                }
            }
            Command::Retry(reply) => {
                let mut restarted = false;
                for state in self.states.values_mut() {
                    if state.halted {
                        state.halted = false;
                        state.next_update = Instant::now();
                        restarted = true;
                    }
                }
                let _ = reply.send(restarted);
            }
            Command::SetTrickPlay(on) => self.apply_trick_play(on),
            other @ (Command::SwitchVariant { .. } | Command::SwitchText(_)) => {
                if self.transition_target.is_some() {
                    // Mid-transition switches settle after the transition.
                    self.deferred.push_back(other);
                } else {
                    self.apply_switch(other);
                }
            }
        }
    }

    fn apply_switch(&mut self, command: Command) {
        match command {
            Command::SwitchVariant {
                variant_id,
                clear_buffer,
                safe_margin,
            } => self.apply_switch_variant(variant_id, clear_buffer, safe_margin),
            Command::SwitchText(stream) => self.apply_switch_text(stream),
            _ => {}
        }
    }

    fn apply_switch_variant(&mut self, variant_id: VariantId, clear_buffer: bool, safe_margin: f64) {
        let period_index = self
            .states
            .get(&StreamType::Video)
            .or_else(|| self.states.get(&StreamType::Audio))
            .map(|s| s.period_index)
            .unwrap_or(0);
        let (audio, video) = {
            let presentation = self.deps.presentation.read();
            let Some(variant) = presentation
                .periods
                .get(period_index)
                .and_then(|p| p.variant(variant_id))
            else {
                warn!(variant_id, period_index, "Switch to unknown variant ignored");
                return;
            };
            (variant.audio, variant.video)
        };

        let mut changed = false;
        for (content_type, new_stream) in [(StreamType::Audio, audio), (StreamType::Video, video)]
        {
            let Some(new_stream) = new_stream else {
                continue;
            };
            let offset = self.timestamp_offset_for(period_index, new_stream);
            let Some(state) = self.states.get_mut(&content_type) else {
                continue;
            };
            if state.stream_id == new_stream {
                continue;
            }
            debug!(content_type = %content_type, from = state.stream_id, to = new_stream, "Switching stream");
            state.stream_id = new_stream;
            state.needs_init = true;
            state.needs_properties = true;
            state.last_position = None;
            state.timestamp_offset = offset;
            state.end_of_stream = false;
            if clear_buffer {
                state.waiting_to_clear = Some(ClearMode::FromPlayhead(safe_margin));
            }
            state.next_update = Instant::now();
            changed = true;
        }
        if changed {
            self.eos_fired = false;
        }
    }

    fn apply_switch_text(&mut self, stream: Option<StreamId>) {
        match stream {
            None => {
                self.states.remove(&StreamType::Text);
            }
            Some(new_stream) => {
                let period_index = self
                    .states
                    .values()
                    .map(|s| s.period_index)
                    .max()
                    .unwrap_or(0);
                let offset = self.timestamp_offset_for(period_index, new_stream);
                let behind = self.deps.config.read().streaming.buffer_behind;
                match self.states.get_mut(&StreamType::Text) {
                    Some(state) if state.stream_id == new_stream => {}
                    Some(state) => {
                        state.stream_id = new_stream;
                        state.needs_init = true;
                        state.needs_properties = true;
                        state.last_position = None;
                        state.timestamp_offset = offset;
                        state.end_of_stream = false;
                        state.waiting_to_clear = Some(ClearMode::All);
                        state.next_update = Instant::now();
                    }
                    None => {
                        self.states.insert(
                            StreamType::Text,
                            MediaState::new(new_stream, period_index, offset, behind),
                        );
                    }
                }
            }
        }
    }

    fn apply_trick_play(&mut self, on: bool) {
        if on {
            if self.trick_play_backup.is_some() {
                return;
            }
            let Some(state) = self.states.get(&StreamType::Video) else {
                return;
            };
            let trick_stream = {
                let presentation = self.deps.presentation.read();
                presentation
                    .periods
                    .get(state.period_index)
                    .and_then(|p| p.stream(state.stream_id))
                    .and_then(|s| s.trick_mode_video)
            };
            let Some(trick_stream) = trick_stream else {
                debug!("No trick-play rendition; keeping normal video");
                return;
            };
            let period_index = state.period_index;
            let offset = self.timestamp_offset_for(period_index, trick_stream);
            let state = self.states.get_mut(&StreamType::Video).expect("checked");
            self.trick_play_backup = Some(state.stream_id);
            state.stream_id = trick_stream;
            state.needs_init = true;
            state.needs_properties = true;
            state.last_position = None;
            state.timestamp_offset = offset;
            state.next_update = Instant::now();
            info!(trick_stream, "Trick play engaged");
        } else if let Some(original) = self.trick_play_backup.take() {
            let period_index = self
                .states
                .get(&StreamType::Video)
                .map(|s| s.period_index)
                .unwrap_or(0);
            let offset = self.timestamp_offset_for(period_index, original);
            if let Some(state) = self.states.get_mut(&StreamType::Video) {
                state.stream_id = original;
                state.needs_init = true;
                state.needs_properties = true;
                state.last_position = None;
                state.timestamp_offset = offset;
                // Refetch normal quality from the playhead forward.
                state.waiting_to_clear = Some(ClearMode::FromPlayhead(0.0));
                state.next_update = Instant::now();
            }
            info!("Trick play disengaged");
        }
    }

    async fn on_seeked(&mut self) {
        let playhead = self.deps.media.current_time();
        debug!(playhead, "Seek observed; reconciling buffers");
        let new_period = self
            .deps
            .presentation
            .read()
            .find_period_index(playhead)
            .unwrap_or(0);

        let types: Vec<StreamType> = self.states.keys().copied().collect();
        for content_type in types {
            let buffered = self.deps.buffer.is_buffered(content_type, playhead);
            let state = self.states.get_mut(&content_type).expect("state exists");
            state.end_of_stream = false;
            state.halted = false;
            if buffered {
                // Continue appending from the end of the buffered range.
                state.last_position = None;
                state.next_update = Instant::now();
                continue;
            }
            state.waiting_to_clear = Some(ClearMode::All);
            state.last_position = None;
            state.next_update = Instant::now();
            if state.period_index != new_period {
                // Re-route the state through the normal transition flow so
                // the right streams are chosen for the seek target period.
                self.begin_period_transition(content_type, new_period).await;
                if let Some(state) = self.states.get_mut(&content_type) {
                    state.waiting_to_clear = Some(ClearMode::All);
                }
            }
        }
        self.maybe_finish_transition();
        self.eos_fired = false;
    }
}

#[cfg(test)]
mod tests;
