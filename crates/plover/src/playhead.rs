// Playhead: start-time resolution, seek clamping, gap recovery, buffering
// state, and timeline-region observation. Runs a poll loop against the
// media element, the platform's analog of timeupdate events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use presentation::{Presentation, Stream};

use crate::buffer::MediaBufferEngine;
use crate::config::{GapDisposition, PlayerConfig};
use crate::events::{PlayerEvent, TimelineRegion};
use crate::media::MediaElement;
use crate::stats::PlaybackState;

/// How far a playhead may sit before a range end and still count as inside
/// it.
const GAP_DETECTION_THRESHOLD: f64 = 0.01;
/// Landing exactly on a range edge re-stalls some platforms; overshoot a
/// little.
const GAP_JUMP_OVERSHOOT: f64 = 0.001;

pub type SeekCallback = Arc<dyn Fn() + Send + Sync>;
pub type EventCallback = Arc<dyn Fn(PlayerEvent) + Send + Sync>;
/// Invoked each observer tick with the current state and the tick length.
pub type StateCallback = Arc<dyn Fn(PlaybackState, f64) + Send + Sync>;

/// Resolves the initial playhead position.
///
/// The requested time is clamped into the seek range; with
/// `start_at_segment_boundary`, each active stream contributes the start of
/// the segment containing the clamped time, and the latest of those wins
/// (anything earlier would force buffering a preceding partial segment).
pub fn resolve_start_time(
    presentation: &Presentation,
    requested: Option<f64>,
    start_at_segment_boundary: bool,
    active_streams: &[&Stream],
) -> f64 {
    let (range_start, range_end) = presentation.timeline.seek_range();
    let default_start = if presentation.timeline.is_live() {
        range_end
    } else {
        range_start
    };
    let mut start = requested.unwrap_or(default_start).clamp(range_start, range_end);

    if start_at_segment_boundary {
        let period_index = presentation.find_period_index(start).unwrap_or(0);
        let period_start = presentation
            .periods
            .get(period_index)
            .map(|p| p.start_time)
            .unwrap_or(0.0);
        let mut boundary = start;
        for stream in active_streams {
            let in_period = start - period_start;
            if let Some(position) = stream.index.find(in_period) {
                if let Some(reference) = stream.index.get(position) {
                    boundary = boundary.max(period_start + reference.start_time);
                }
            }
        }
        start = boundary.clamp(range_start, range_end);
    }
    start
}

struct ObserverState {
    buffering: bool,
    regions: Vec<(TimelineRegion, bool)>,
}

pub struct Playhead {
    media: Arc<dyn MediaElement>,
    presentation: Arc<RwLock<Presentation>>,
    buffer: Arc<MediaBufferEngine>,
    config: Arc<RwLock<PlayerConfig>>,
    on_event: EventCallback,
    on_seek: Mutex<Option<SeekCallback>>,
    on_state: Mutex<Option<StateCallback>>,
    poll_interval: Mutex<Duration>,
    state: Mutex<ObserverState>,
    token: CancellationToken,
}

impl Playhead {
    pub fn new(
        media: Arc<dyn MediaElement>,
        presentation: Arc<RwLock<Presentation>>,
        buffer: Arc<MediaBufferEngine>,
        config: Arc<RwLock<PlayerConfig>>,
        on_event: EventCallback,
        parent_token: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            media,
            presentation,
            buffer,
            config,
            on_event,
            on_seek: Mutex::new(None),
            on_state: Mutex::new(None),
            poll_interval: Mutex::new(Duration::from_millis(250)),
            state: Mutex::new(ObserverState {
                buffering: true,
                regions: Vec::new(),
            }),
            token: parent_token.child_token(),
        })
    }

    /// Adjusts the observer cadence; takes effect at the next `start`.
    pub fn set_poll_interval(self: Arc<Self>, interval: Duration) -> Arc<Self> {
        *self.poll_interval.lock() = interval;
        self
    }

    pub fn set_seek_callback(&self, callback: SeekCallback) {
        *self.on_seek.lock() = Some(callback);
    }

    pub fn set_state_callback(&self, callback: StateCallback) {
        *self.on_state.lock() = Some(callback);
    }

    pub fn is_buffering(&self) -> bool {
        self.state.lock().buffering
    }

    pub fn current_time(&self) -> f64 {
        self.media.current_time()
    }

    /// Registers a timeline region and announces it; enter/exit fire from
    /// the observer as the playhead crosses it.
    pub fn add_timeline_region(&self, region: TimelineRegion) {
        let mut state = self.state.lock();
        if state.regions.iter().any(|(r, _)| *r == region) {
            return;
        }
        state.regions.push((region.clone(), false));
        drop(state);
        (self.on_event)(PlayerEvent::TimelineRegionAdded(region));
    }

    /// Spawns the observer loop.
    pub fn start(self: &Arc<Self>) {
        let playhead = self.clone();
        let token = self.token.clone();
        let interval = *self.poll_interval.lock();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => playhead.on_poll(),
                }
            }
        });
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    fn on_poll(&self) {
        if self.media.take_seeked() {
            self.clamp_into_seek_range();
            if let Some(callback) = self.on_seek.lock().clone() {
                callback();
            }
        } else {
            self.maybe_jump_gap();
        }
        self.update_buffering_state();
        self.update_regions();
        self.report_state();
    }

    fn clamp_into_seek_range(&self) {
        let (start, end) = self.presentation.read().timeline.seek_range();
        let time = self.media.current_time();
        let clamped = time.clamp(start, end.max(start));
        if (clamped - time).abs() > 1e-6 {
            info!(requested = time, clamped, "Clamping seek into seek range");
            self.media.set_current_time(clamped);
        }
    }

    fn maybe_jump_gap(&self) {
        if self.media.paused() || self.media.ended() {
            return;
        }
        let time = self.media.current_time();
        let ranges = self.buffer.playable_ranges();
        if ranges.is_empty() {
            return;
        }
        let inside = ranges
            .iter()
            .any(|r| r.contains(time) && r.end - time > GAP_DETECTION_THRESHOLD);
        if inside {
            return;
        }
        let Some(next) = ranges
            .iter()
            .find(|r| r.start > time - GAP_DETECTION_THRESHOLD && r.end > time)
        else {
            return;
        };
        let gap = next.start - time;
        if gap <= 0.0 {
            return;
        }

        let (small_gap_limit, jump_large_gaps, large_gap_callback) = {
            let config = self.config.read();
            (
                config.streaming.small_gap_limit,
                config.streaming.jump_large_gaps,
                config.streaming.on_large_gap.clone(),
            )
        };

        if gap <= small_gap_limit {
            debug!(gap, target = next.start, "Jumping small gap");
            self.media.set_current_time(next.start + GAP_JUMP_OVERSHOOT);
            return;
        }

        (self.on_event)(PlayerEvent::LargeGap {
            current_time: time,
            gap_size: gap,
        });
        let handled = large_gap_callback
            .map(|callback| callback(time, gap) == GapDisposition::Handled)
            .unwrap_or(false);
        if jump_large_gaps && !handled {
            info!(gap, target = next.start, "Jumping large gap");
            self.media.set_current_time(next.start + GAP_JUMP_OVERSHOOT);
        }
    }

    fn update_buffering_state(&self) {
        let time = self.media.current_time();
        let ended = self.media.ended();
        let rebuffering_goal = self.config.read().streaming.rebuffering_goal;
        let ahead = self
            .buffer
            .playable_ranges()
            .iter()
            .find(|r| r.contains(time) || r.contains(time + GAP_DETECTION_THRESHOLD))
            .map(|r| r.end - time)
            .unwrap_or(0.0);

        let mut state = self.state.lock();
        // Enter below the goal, leave at the goal or at end of stream.
        let next = ahead < rebuffering_goal && !ended;
        if next != state.buffering {
            state.buffering = next;
            drop(state);
            (self.on_event)(PlayerEvent::Buffering { buffering: next });
        }
    }

    fn update_regions(&self) {
        let time = self.media.current_time();
        let mut fired = Vec::new();
        {
            let mut state = self.state.lock();
            for (region, inside) in state.regions.iter_mut() {
                let now_inside = time >= region.start_time && time < region.end_time;
                if now_inside != *inside {
                    *inside = now_inside;
                    fired.push(if now_inside {
                        PlayerEvent::TimelineRegionEnter(region.clone())
                    } else {
                        PlayerEvent::TimelineRegionExit(region.clone())
                    });
                }
            }
        }
        for event in fired {
            (self.on_event)(event);
        }
    }

    fn report_state(&self) {
        let Some(callback) = self.on_state.lock().clone() else {
            return;
        };
        let state = if self.media.ended() {
            PlaybackState::Ended
        } else if self.is_buffering() {
            PlaybackState::Buffering
        } else if self.media.paused() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };
        callback(state, self.poll_interval.lock().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::fake::{segment_bytes, FakeMediaSink};
    use crate::media::FakeMediaElement;
    use presentation::{PresentationTimeline, StreamType};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Harness {
        playhead: Arc<Playhead>,
        media: Arc<FakeMediaElement>,
        buffer: Arc<MediaBufferEngine>,
        events: Arc<Mutex<Vec<PlayerEvent>>>,
        config: Arc<RwLock<PlayerConfig>>,
    }

    async fn harness(configure: impl FnOnce(&mut PlayerConfig)) -> Harness {
        let media = FakeMediaElement::new();
        let sink = FakeMediaSink::new();
        let buffer = Arc::new(MediaBufferEngine::new(sink));
        buffer
            .init(&[
                (StreamType::Audio, "audio/mp4".to_string()),
                (StreamType::Video, "video/mp4".to_string()),
            ])
            .unwrap();

        let mut config_value = PlayerConfig::default();
        configure(&mut config_value);
        let config = Arc::new(RwLock::new(config_value));
        let presentation = Arc::new(RwLock::new(Presentation::new(
            PresentationTimeline::new_static(60.0),
        )));
        let events = Arc::new(Mutex::new(Vec::new()));
        let events_cb = events.clone();
        let playhead = Playhead::new(
            media.clone(),
            presentation,
            buffer.clone(),
            config.clone(),
            Arc::new(move |event| events_cb.lock().push(event)),
            &CancellationToken::new(),
        )
        .set_poll_interval(Duration::from_millis(5));
        playhead.start();
        Harness {
            playhead,
            media,
            buffer,
            events,
            config,
        }
    }

    async fn buffer_both(h: &Harness, start: f64, end: f64) {
        for content_type in [StreamType::Audio, StreamType::Video] {
            h.buffer
                .append_buffer(content_type, segment_bytes(start, end))
                .await
                .unwrap();
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    #[tokio::test]
    async fn small_gap_is_jumped_silently() {
        let h = harness(|_| {}).await;
        buffer_both(&h, 0.0, 10.0).await;
        buffer_both(&h, 10.3, 20.0).await;
        h.media.set_paused(false);
        h.media.set_current_time(10.0);
        settle().await;

        assert!(h.media.current_time() >= 10.3, "jumped to {}", h.media.current_time());
        assert!(
            !h.events.lock().iter().any(|e| matches!(e, PlayerEvent::LargeGap { .. })),
            "no largegap event for a small gap"
        );
    }

    #[tokio::test]
    async fn large_gap_emits_event_and_stalls_by_default() {
        let h = harness(|_| {}).await;
        buffer_both(&h, 0.0, 10.0).await;
        buffer_both(&h, 12.0, 20.0).await;
        h.media.set_paused(false);
        h.media.set_current_time(10.0);
        settle().await;

        assert!(h.media.current_time() < 10.5, "did not jump: {}", h.media.current_time());
        let events = h.events.lock();
        let gap = events
            .iter()
            .find_map(|e| match e {
                PlayerEvent::LargeGap { current_time, gap_size } => Some((*current_time, *gap_size)),
                _ => None,
            })
            .expect("largegap emitted");
        assert_eq!(gap.0, 10.0);
        assert!((gap.1 - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn large_gap_jumped_when_configured() {
        let h = harness(|config| {
            config.streaming.jump_large_gaps = true;
        })
        .await;
        buffer_both(&h, 0.0, 10.0).await;
        buffer_both(&h, 12.0, 20.0).await;
        h.media.set_paused(false);
        h.media.set_current_time(10.0);
        settle().await;
        assert!(h.media.current_time() >= 12.0);
    }

    #[tokio::test]
    async fn large_gap_callback_can_prevent_jump() {
        let handled = Arc::new(AtomicBool::new(false));
        let handled_clone = handled.clone();
        let h = harness(move |config| {
            config.streaming.jump_large_gaps = true;
            config.streaming.on_large_gap = Some(Arc::new(move |_t, _gap| {
                handled_clone.store(true, Ordering::SeqCst);
                GapDisposition::Handled
            }));
        })
        .await;
        buffer_both(&h, 0.0, 10.0).await;
        buffer_both(&h, 12.0, 20.0).await;
        h.media.set_paused(false);
        h.media.set_current_time(10.0);
        settle().await;
        assert!(handled.load(Ordering::SeqCst));
        assert!(h.media.current_time() < 12.0, "prevent_default stops the jump");
    }

    #[tokio::test]
    async fn buffering_events_fire_on_edges_only() {
        let h = harness(|config| {
            config.streaming.rebuffering_goal = 2.0;
        })
        .await;
        assert!(h.playhead.is_buffering());
        settle().await;
        assert!(h.events.lock().is_empty(), "no edge yet");

        buffer_both(&h, 0.0, 10.0).await;
        settle().await;
        {
            let events = h.events.lock();
            let buffering_events: Vec<_> = events
                .iter()
                .filter_map(|e| match e {
                    PlayerEvent::Buffering { buffering } => Some(*buffering),
                    _ => None,
                })
                .collect();
            assert_eq!(buffering_events, vec![false], "one exit edge");
        }
        assert!(!h.playhead.is_buffering());

        // Play to the end of the buffer: re-enter buffering once.
        h.media.set_current_time(10.0);
        settle().await;
        let events = h.events.lock();
        let buffering_events: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::Buffering { buffering } => Some(*buffering),
                _ => None,
            })
            .collect();
        assert_eq!(buffering_events, vec![false, true]);
    }

    #[tokio::test]
    async fn ended_exits_buffering() {
        let h = harness(|_| {}).await;
        assert!(h.playhead.is_buffering());
        h.media.set_ended(true);
        settle().await;
        assert!(!h.playhead.is_buffering());
    }

    #[tokio::test]
    async fn seek_clamps_into_seek_range_and_notifies() {
        let h = harness(|_| {}).await;
        let seeked = Arc::new(AtomicBool::new(false));
        let seeked_clone = seeked.clone();
        h.playhead
            .set_seek_callback(Arc::new(move || seeked_clone.store(true, Ordering::SeqCst)));

        h.media.seek(100.0); // past the 60 s duration
        settle().await;
        assert!(seeked.load(Ordering::SeqCst));
        assert!(h.media.current_time() <= 60.0);
    }

    #[tokio::test]
    async fn timeline_region_enter_and_exit() {
        let h = harness(|_| {}).await;
        let region = TimelineRegion {
            scheme_id_uri: "urn:example:ad".to_string(),
            value: String::new(),
            id: "1".to_string(),
            start_time: 5.0,
            end_time: 8.0,
            event_data: None,
        };
        h.playhead.add_timeline_region(region.clone());
        // Duplicate registration is a no-op.
        h.playhead.add_timeline_region(region);
        settle().await;

        h.media.set_current_time(6.0);
        settle().await;
        h.media.set_current_time(9.0);
        settle().await;

        let events = h.events.lock();
        let kinds: Vec<&str> = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    PlayerEvent::TimelineRegionAdded(_)
                        | PlayerEvent::TimelineRegionEnter(_)
                        | PlayerEvent::TimelineRegionExit(_)
                )
            })
            .map(|e| e.event_type())
            .collect();
        assert_eq!(
            kinds,
            vec!["timelineregionadded", "timelineregionenter", "timelineregionexit"]
        );
    }

    #[test]
    fn start_time_defaults_and_boundary_adjustment() {
        use presentation::{Period, SegmentIndex, SegmentReference, Stream};
        use std::collections::BTreeMap;

        let mut presentation = Presentation::new(PresentationTimeline::new_static(40.0));
        let make_stream = |id, seg_duration: f64| {
            let refs: Vec<SegmentReference> = (0..8)
                .map(|i| {
                    SegmentReference::with_uris(
                        i as u64,
                        i as f64 * seg_duration,
                        (i + 1) as f64 * seg_duration,
                        vec![format!("s{i}")],
                        None,
                        None,
                    )
                })
                .collect();
            Stream {
                id,
                stream_type: StreamType::Video,
                mime_type: "video/mp4".into(),
                codecs: String::new(),
                bandwidth: 0,
                width: None,
                height: None,
                frame_rate: None,
                channels_count: None,
                language: String::new(),
                label: None,
                kind: None,
                roles: vec![],
                primary: false,
                encrypted: false,
                key_id: None,
                init_segment: None,
                presentation_time_offset: 0.0,
                trick_mode_video: None,
                index: presentation::SegmentIndexHandle::with_index(SegmentIndex::new(refs)),
            }
        };
        let audio = make_stream(1, 4.0); // boundaries at 0,4,8,...
        let video = make_stream(2, 5.0); // boundaries at 0,5,10,...
        presentation.periods.push(Period {
            id: "p0".into(),
            start_time: 0.0,
            streams: BTreeMap::new(),
            variants: vec![],
            text_streams: vec![],
        });

        // Without boundary adjustment: clamped verbatim.
        assert_eq!(resolve_start_time(&presentation, Some(11.0), false, &[]), 11.0);
        assert_eq!(resolve_start_time(&presentation, Some(-5.0), false, &[]), 0.0);
        assert_eq!(resolve_start_time(&presentation, None, false, &[]), 0.0);

        // With adjustment: audio's segment starts at 8, video's at 10; the
        // max wins.
        let adjusted = resolve_start_time(&presentation, Some(11.0), true, &[&audio, &video]);
        assert_eq!(adjusted, 10.0);
    }
}
