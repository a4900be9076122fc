use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use url::Url;

use presentation::{
    InitSegmentReference, Period, Presentation, PresentationTimeline, SegmentIndex,
    SegmentIndexHandle, SegmentReference, Stream, StreamId, StreamType, Variant,
};

use crate::buffer::fake::{init_bytes, segment_bytes, FakeMediaSink};
use crate::buffer::{MediaBufferEngine, SourceBufferSink};
use crate::config::PlayerConfig;
use crate::error::{ErrorDetail, PlayerError, Severity};
use crate::manifest::SegmentIndexCreator;
use crate::media::{FakeMediaElement, MediaElement};
use crate::net::{NetworkingEngine, Request, Response, RetryParameters, SchemePlugin};

use super::{ChosenStreams, StreamingDeps, StreamingEngine, StreamingListener};

/// Serves fake media for URIs of the form `test://media/<label>/<s>-<e>`
/// and init bytes for `test://init/...`, recording every request.
struct MediaPlugin {
    log: Mutex<Vec<String>>,
    /// `(substring, http status)`: matching URIs fail with that status.
    fail_matching: Mutex<Option<(String, u16)>>,
}

impl MediaPlugin {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            fail_matching: Mutex::new(None),
        })
    }

    fn fail(&self, substring: &str, status: u16) {
        *self.fail_matching.lock() = Some((substring.to_string(), status));
    }

    fn requested(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl SchemePlugin for MediaPlugin {
    async fn request(&self, uri: &Url, _request: &Request) -> Result<Response, PlayerError> {
        let uri_str = uri.to_string();
        self.log.lock().push(uri_str.clone());
        if let Some((substring, status)) = self.fail_matching.lock().clone() {
            if uri_str.contains(&substring) {
                return Err(PlayerError::recoverable(ErrorDetail::BadHttpStatus {
                    uri: uri_str,
                    status,
                }));
            }
        }
        let data = if uri_str.contains("/init/") {
            init_bytes()
        } else {
            let times = uri_str
                .rsplit('/')
                .next()
                .and_then(|tail| tail.split_once('-'))
                .and_then(|(s, e)| Some((s.parse::<f64>().ok()?, e.parse::<f64>().ok()?)));
            let Some((start, end)) = times else {
                return Err(PlayerError::recoverable(ErrorDetail::BadHttpStatus {
                    uri: uri_str,
                    status: 404,
                }));
            };
            segment_bytes(start, end)
        };
        Ok(Response {
            uri: uri_str,
            data,
            headers: Default::default(),
            elapsed: Duration::ZERO,
        })
    }
}

fn make_stream(
    id: StreamId,
    stream_type: StreamType,
    label: &str,
    segment_count: usize,
    segment_duration: f64,
    trick_mode_video: Option<StreamId>,
) -> Stream {
    let init = Arc::new(InitSegmentReference::new(
        vec![format!("test://init/{label}")],
        None,
    ));
    let references: Vec<SegmentReference> = (0..segment_count)
        .map(|i| {
            let start = i as f64 * segment_duration;
            let end = start + segment_duration;
            SegmentReference::with_uris(
                i as u64,
                start,
                end,
                vec![format!("test://media/{label}/{start}-{end}")],
                None,
                Some(init.clone()),
            )
        })
        .collect();
    Stream {
        id,
        stream_type,
        mime_type: match stream_type {
            StreamType::Audio => "audio/mp4".to_string(),
            StreamType::Video => "video/mp4".to_string(),
            StreamType::Text => "text/vtt".to_string(),
        },
        codecs: String::new(),
        bandwidth: 100_000,
        width: None,
        height: None,
        frame_rate: None,
        channels_count: None,
        language: String::new(),
        label: Some(label.to_string()),
        kind: None,
        roles: Vec::new(),
        primary: false,
        encrypted: false,
        key_id: None,
        init_segment: Some(init),
        presentation_time_offset: 0.0,
        trick_mode_video,
        index: SegmentIndexHandle::with_index(SegmentIndex::new(references)),
    }
}

struct PeriodSpec {
    start: f64,
    segment_count: usize,
    segment_duration: f64,
    /// Extra variant (e.g. for switch tests).
    second_variant: bool,
    trick_play: bool,
    text: bool,
}

impl Default for PeriodSpec {
    fn default() -> Self {
        Self {
            start: 0.0,
            segment_count: 2,
            segment_duration: 10.0,
            second_variant: false,
            trick_play: false,
            text: false,
        }
    }
}

fn build_presentation(timeline: PresentationTimeline, specs: &[PeriodSpec]) -> Presentation {
    let mut presentation = Presentation::new(timeline);
    presentation.timeline.notify_max_segment_duration(
        specs
            .iter()
            .map(|s| s.segment_duration)
            .fold(0.0, f64::max),
    );
    let mut next_stream_id: StreamId = 0;
    for (period_index, spec) in specs.iter().enumerate() {
        let mut streams = BTreeMap::new();
        let mut variants = Vec::new();
        let mut text_streams = Vec::new();
        let mut add_variant = |streams: &mut BTreeMap<StreamId, Stream>,
                               variant_id: u32,
                               label: &str,
                               trick: bool| {
            let audio_id = next_stream_id;
            let video_id = next_stream_id + 1;
            let trick_id = next_stream_id + 2;
            next_stream_id += if trick { 3 } else { 2 };
            streams.insert(
                audio_id,
                make_stream(
                    audio_id,
                    StreamType::Audio,
                    &format!("p{period_index}/{label}/audio"),
                    spec.segment_count,
                    spec.segment_duration,
                    None,
                ),
            );
            streams.insert(
                video_id,
                make_stream(
                    video_id,
                    StreamType::Video,
                    &format!("p{period_index}/{label}/video"),
                    spec.segment_count,
                    spec.segment_duration,
                    trick.then_some(trick_id),
                ),
            );
            if trick {
                streams.insert(
                    trick_id,
                    make_stream(
                        trick_id,
                        StreamType::Video,
                        &format!("p{period_index}/{label}/trick"),
                        spec.segment_count,
                        spec.segment_duration,
                        None,
                    ),
                );
            }
            variants.push(Variant {
                id: variant_id,
                language: "en".to_string(),
                primary: variant_id == 0,
                bandwidth: 200_000 * (variant_id as u64 + 1),
                audio: Some(audio_id),
                video: Some(video_id),
                drm_infos: Vec::new(),
                allowed_by_application: true,
                allowed_by_key_system: true,
            });
        };
        add_variant(&mut streams, 0, "v0", spec.trick_play);
        if spec.second_variant {
            add_variant(&mut streams, 1, "v1", false);
        }
        if spec.text {
            let text_id = next_stream_id;
            next_stream_id += 1;
            streams.insert(
                text_id,
                make_stream(
                    text_id,
                    StreamType::Text,
                    &format!("p{period_index}/text"),
                    spec.segment_count,
                    spec.segment_duration,
                    None,
                ),
            );
            text_streams.push(text_id);
        }
        presentation.periods.push(Period {
            id: format!("p{period_index}"),
            start_time: spec.start,
            streams,
            variants,
            text_streams,
        });
    }
    presentation
}

struct NoopIndexCreator;

#[async_trait]
impl SegmentIndexCreator for NoopIndexCreator {
    async fn create_segment_index(&self, _stream_id: StreamId) -> Result<(), PlayerError> {
        Ok(())
    }
}

#[derive(Default)]
struct ListenerLog {
    chosen_periods: Vec<usize>,
    can_switch: Vec<usize>,
    errors: Vec<PlayerError>,
    initial_setup: bool,
}

struct TestListener {
    log: Mutex<ListenerLog>,
    /// Which variant to choose, and whether to attach the text stream.
    variant: AtomicU32,
    choose_text: bool,
    presentation: crate::manifest::SharedPresentation,
}

#[async_trait]
impl StreamingListener for TestListener {
    async fn on_choose_streams(&self, period_index: usize) -> ChosenStreams {
        self.log.lock().chosen_periods.push(period_index);
        let presentation = self.presentation.read();
        let text = if self.choose_text {
            presentation
                .periods
                .get(period_index)
                .and_then(|p| p.text_streams.first())
                .copied()
        } else {
            None
        };
        ChosenStreams {
            variant: Some(self.variant.load(Ordering::SeqCst)),
            text,
        }
    }

    fn on_can_switch(&self, period_index: usize) {
        self.log.lock().can_switch.push(period_index);
    }

    fn on_initial_streams_setup(&self) {
        self.log.lock().initial_setup = true;
    }

    fn on_error(&self, error: PlayerError) {
        self.log.lock().errors.push(error);
    }
}

struct Harness {
    engine: StreamingEngine,
    sink: Arc<FakeMediaSink>,
    media: Arc<FakeMediaElement>,
    plugin: Arc<MediaPlugin>,
    listener: Arc<TestListener>,
}

fn fast_retry() -> RetryParameters {
    RetryParameters {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        backoff_factor: 1.0,
        fuzz_factor: 0.0,
        timeout: None,
    }
}

fn start_engine(
    presentation: Presentation,
    choose_text: bool,
    configure: impl FnOnce(&mut PlayerConfig),
) -> Harness {
    let plugin = MediaPlugin::new();
    let net = Arc::new(NetworkingEngine::empty());
    net.register_scheme("test", plugin.clone());

    let sink = FakeMediaSink::new();
    let buffer = Arc::new(MediaBufferEngine::new(sink.clone()));
    let media = FakeMediaElement::new();

    let mut config_value = PlayerConfig::default();
    config_value.streaming.retry = fast_retry();
    config_value.streaming.buffering_goal = 60.0;
    config_value.streaming.update_interval_cap = 0.1;
    configure(&mut config_value);
    let config = Arc::new(RwLock::new(config_value));
    let shared = Arc::new(RwLock::new(presentation));
    let listener = Arc::new(TestListener {
        log: Mutex::new(ListenerLog::default()),
        variant: AtomicU32::new(0),
        choose_text,
        presentation: shared.clone(),
    });

    let engine = StreamingEngine::start(
        StreamingDeps {
            presentation: shared,
            net,
            buffer,
            media: media.clone(),
            listener: listener.clone(),
            index_creator: Arc::new(NoopIndexCreator),
            config,
        },
        &CancellationToken::new(),
    );
    Harness {
        engine,
        sink,
        media,
        plugin,
        listener,
    }
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn appended(sink: &FakeMediaSink, content_type: StreamType) -> Vec<(f64, f64)> {
    sink.buffer(content_type)
        .map(|b| b.appended_ranges())
        .unwrap_or_default()
}

#[tokio::test]
async fn vod_two_periods_walkthrough() {
    // Two 20 s periods, two 10 s segments per stream per period.
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[
            PeriodSpec::default(),
            PeriodSpec {
                start: 20.0,
                ..Default::default()
            },
        ],
    );
    let h = start_engine(presentation, false, |_| {});
    settle(700).await;

    for content_type in [StreamType::Audio, StreamType::Video] {
        let ranges = appended(&h.sink, content_type);
        assert_eq!(
            ranges,
            vec![(0.0, 10.0), (10.0, 20.0), (20.0, 30.0), (30.0, 40.0)],
            "{content_type} appends"
        );
        // Appends are monotone in start time.
        assert!(ranges.windows(2).all(|w| w[1].0 >= w[0].0));
        assert!(h.sink.buffer(content_type).unwrap().init_append_count() >= 2);
    }
    assert_eq!(h.sink.end_of_stream_calls(), 1);

    let log = h.listener.log.lock();
    assert!(log.initial_setup);
    assert_eq!(log.chosen_periods, vec![0, 1]);
    assert_eq!(log.can_switch, vec![0, 1]);
    assert!(log.errors.is_empty(), "errors: {:?}", log.errors);
}

#[tokio::test]
async fn buffering_goal_limits_lookahead() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            segment_count: 4,
            ..Default::default()
        }],
    );
    let h = start_engine(presentation, false, |config| {
        config.streaming.buffering_goal = 12.0;
    });
    settle(400).await;

    // Two segments cover 20 s >= goal of 12 s; the rest must wait.
    let ranges = appended(&h.sink, StreamType::Video);
    assert_eq!(ranges.len(), 2, "ranges: {ranges:?}");
    assert_eq!(h.sink.end_of_stream_calls(), 0);

    // Playhead movement frees the goal and fetching resumes.
    h.media.advance_time(15.0);
    settle(400).await;
    assert!(appended(&h.sink, StreamType::Video).len() >= 3);
}

#[tokio::test]
async fn switch_variant_with_clear_refetches_from_new_streams() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            segment_count: 4,
            second_variant: true,
            ..Default::default()
        }],
    );
    let h = start_engine(presentation, false, |config| {
        config.streaming.buffering_goal = 15.0;
    });
    settle(300).await;
    assert!(h.plugin.requested().iter().any(|u| u.contains("/v0/")));
    assert!(!h.plugin.requested().iter().any(|u| u.contains("/v1/")));

    h.engine.switch_variant(1, true, 0.0);
    h.media.set_paused(false);
    settle(400).await;

    let requested = h.plugin.requested();
    assert!(requested.iter().any(|u| u.contains("/v1/video")), "{requested:?}");
    assert!(requested.iter().any(|u| u.contains("/v1/audio")));
    // The cleared buffer was refilled from the playhead forward by v1.
    let ranges = appended(&h.sink, StreamType::Video);
    assert!(ranges.iter().any(|(s, _)| *s == 0.0));
}

#[tokio::test]
async fn identical_switch_is_a_no_op() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec::default()],
    );
    let h = start_engine(presentation, false, |_| {});
    settle(300).await;
    let appends_before = appended(&h.sink, StreamType::Video).len();

    h.engine.switch_variant(0, true, 0.0);
    settle(200).await;
    // No clear happened: ranges were not re-appended.
    assert_eq!(appended(&h.sink, StreamType::Video).len(), appends_before);
}

#[tokio::test]
async fn trick_play_switches_video_only_and_back() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            segment_count: 4,
            trick_play: true,
            ..Default::default()
        }],
    );
    let h = start_engine(presentation, false, |config| {
        config.streaming.buffering_goal = 15.0;
    });
    settle(300).await;

    h.engine.set_trick_play(true);
    h.media.advance_time(12.0);
    settle(300).await;
    let requested = h.plugin.requested();
    assert!(requested.iter().any(|u| u.contains("/trick/")), "{requested:?}");
    // Audio kept its normal stream.
    assert!(requested.iter().all(|u| !u.contains("audio/trick")));

    let before_cancel = appended(&h.sink, StreamType::Video).len();
    h.engine.set_trick_play(false);
    settle(300).await;
    let requested = h.plugin.requested();
    // Normal video was fetched again after cancel.
    assert!(
        requested
            .iter()
            .filter(|u| u.contains("/v0/video"))
            .count()
            >= 2
    );
    assert!(appended(&h.sink, StreamType::Video).len() > before_cancel);
}

#[tokio::test]
async fn seek_to_unbuffered_position_clears_and_refetches() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            segment_count: 4,
            ..Default::default()
        }],
    );
    let h = start_engine(presentation, false, |config| {
        config.streaming.buffering_goal = 5.0;
    });
    settle(300).await;
    // Only the first segment is buffered under the tiny goal.
    assert_eq!(appended(&h.sink, StreamType::Video).len(), 1);

    h.media.set_current_time(35.0);
    h.engine.seeked();
    settle(400).await;

    let ranges = h.sink.buffer(StreamType::Video).unwrap().buffered();
    assert!(
        ranges.iter().any(|r| r.start <= 30.0 + 1e-6 && r.end >= 40.0 - 1e-6),
        "ranges: {ranges:?}"
    );
    // The old head of the buffer is gone (cleared before refetch).
    assert!(ranges.iter().all(|r| r.end > 30.0));
}

#[tokio::test]
async fn live_network_failures_are_downgraded_and_retried() {
    let epoch = chrono::DateTime::<chrono::Utc>::from_timestamp(1_700_000_000, 0).unwrap();
    let presentation = build_presentation(
        PresentationTimeline::new_live(epoch, 120.0, 0.0),
        &[PeriodSpec {
            segment_count: 2,
            ..Default::default()
        }],
    );
    let failures = Arc::new(AtomicU32::new(0));
    let failures_clone = failures.clone();

    let h = start_engine(presentation, false, move |config| {
        config.streaming.failure_callback = Some(Arc::new(move |_error| {
            failures_clone.fetch_add(1, Ordering::SeqCst);
        }));
    });
    h.plugin.fail("/v0/", 503);
    settle(500).await;

    assert!(failures.load(Ordering::SeqCst) >= 1, "failure callback ran");
    let log = h.listener.log.lock();
    assert!(!log.errors.is_empty());
    assert!(
        log.errors.iter().all(|e| e.severity == Severity::Recoverable),
        "live network errors are downgraded: {:?}",
        log.errors
    );
}

#[tokio::test]
async fn vod_network_failure_halts_stream_and_retry_restarts_it() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec::default()],
    );
    let h = start_engine(presentation, false, |_| {});
    h.plugin.fail("/v0/video", 404);
    settle(300).await;

    {
        let log = h.listener.log.lock();
        assert!(log.errors.iter().any(|e| e.is_critical()));
    }
    let video_appends = appended(&h.sink, StreamType::Video).len();
    // Audio kept going even though video halted.
    assert!(appended(&h.sink, StreamType::Audio).len() >= video_appends);

    // Fix the network and retry.
    *h.plugin.fail_matching.lock() = None;
    assert!(h.engine.retry().await);
    settle(400).await;
    assert!(appended(&h.sink, StreamType::Video).len() > video_appends);
}

#[tokio::test]
async fn text_failures_are_ignored_when_configured() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            text: true,
            ..Default::default()
        }],
    );
    let h = start_engine(presentation, true, |config| {
        config.streaming.ignore_text_stream_failures = true;
    });
    h.plugin.fail("/text/", 404);
    settle(500).await;

    let log = h.listener.log.lock();
    assert!(log.errors.is_empty(), "text failure not surfaced: {:?}", log.errors);
    assert_eq!(appended(&h.sink, StreamType::Video).len(), 2);
    assert_eq!(h.sink.end_of_stream_calls(), 1, "A/V still reach end of stream");
}

#[tokio::test]
async fn quota_backoff_gives_up_with_quota_error() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            segment_count: 4,
            ..Default::default()
        }],
    );
    let h = start_engine(presentation, false, |_| {});
    h.sink.set_quota_seconds(15.0);
    settle(400).await;

    let log = h.listener.log.lock();
    assert!(
        log.errors.iter().any(|e| e.code() == 3002),
        "quota error surfaced: {:?}",
        log.errors
    );
}

#[tokio::test]
async fn destroy_silences_all_activity() {
    let presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            segment_count: 4,
            ..Default::default()
        }],
    );
    let h = start_engine(presentation, false, |config| {
        config.streaming.buffering_goal = 60.0;
    });
    settle(150).await;
    h.engine.destroy();
    settle(50).await;

    let requests_at_destroy = h.plugin.requested().len();
    let errors_at_destroy = h.listener.log.lock().errors.len();
    settle(300).await;
    assert_eq!(h.plugin.requested().len(), requests_at_destroy);
    assert_eq!(h.listener.log.lock().errors.len(), errors_at_destroy);
}

#[tokio::test]
async fn text_switch_mid_stream_reinits_text_only() {
    let mut presentation = build_presentation(
        PresentationTimeline::new_static(40.0),
        &[PeriodSpec {
            text: true,
            ..Default::default()
        }],
    );
    // A second text stream to switch to.
    let second_text_id = 100;
    let period = &mut presentation.periods[0];
    period.streams.insert(
        second_text_id,
        make_stream(second_text_id, StreamType::Text, "p0/text-de", 2, 10.0, None),
    );
    period.text_streams.push(second_text_id);

    let h = start_engine(presentation, true, |_| {});
    settle(300).await;
    let video_appends = appended(&h.sink, StreamType::Video).len();

    h.engine.switch_text_stream(Some(second_text_id));
    settle(300).await;

    let requested = h.plugin.requested();
    assert!(requested.iter().any(|u| u.contains("text-de")), "{requested:?}");
    // Audio/video buffers were not cleared by the text switch.
    assert!(appended(&h.sink, StreamType::Video).len() >= video_appends);
}
