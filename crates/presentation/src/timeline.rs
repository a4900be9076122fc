// Presentation timeline: the authoritative source for what is seekable,
// available, and fetchable, and for mapping wall clock to media time.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

/// Wall clock abstraction so live-window math is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Computes which presentation times are seekable and fetchable.
///
/// For live presentations the seek range slides with the wall clock; for
/// static (VOD) presentations it is `[0, duration - duration_backoff]`.
#[derive(Clone)]
pub struct PresentationTimeline {
    is_static: bool,
    /// Total presentation duration in seconds; `f64::INFINITY` while a live
    /// presentation is in progress.
    duration: f64,
    /// Wall-clock time of presentation time zero (live only).
    presentation_start_time: Option<DateTime<Utc>>,
    /// How long segments stay fetchable behind the live edge.
    segment_availability_duration: f64,
    max_segment_duration: f64,
    /// Correction added to the local wall clock, from clock sync.
    clock_offset_ms: i64,
    /// Distance, in seconds, the playhead should stay behind the live edge.
    presentation_delay: f64,
    /// Distance kept from the exact duration when seeking VOD content.
    duration_backoff: f64,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PresentationTimeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresentationTimeline")
            .field("is_static", &self.is_static)
            .field("duration", &self.duration)
            .field("presentation_start_time", &self.presentation_start_time)
            .field(
                "segment_availability_duration",
                &self.segment_availability_duration,
            )
            .field("max_segment_duration", &self.max_segment_duration)
            .field("clock_offset_ms", &self.clock_offset_ms)
            .field("presentation_delay", &self.presentation_delay)
            .finish()
    }
}

impl PresentationTimeline {
    /// Creates a static (VOD) timeline.
    pub fn new_static(duration: f64) -> Self {
        Self {
            is_static: true,
            duration,
            presentation_start_time: None,
            segment_availability_duration: f64::INFINITY,
            max_segment_duration: 0.0,
            clock_offset_ms: 0,
            presentation_delay: 0.0,
            duration_backoff: 0.0,
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates a live timeline anchored at `start` wall-clock time.
    pub fn new_live(start: DateTime<Utc>, availability_duration: f64, delay: f64) -> Self {
        Self {
            is_static: false,
            duration: f64::INFINITY,
            presentation_start_time: Some(start),
            segment_availability_duration: availability_duration,
            max_segment_duration: 0.0,
            clock_offset_ms: 0,
            presentation_delay: delay,
            duration_backoff: 0.0,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_live(&self) -> bool {
        !self.is_static
    }

    /// True for an in-progress recording: a live presentation whose final
    /// duration is already known.
    pub fn is_in_progress(&self) -> bool {
        self.is_live() && self.duration.is_finite()
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Sets the presentation duration. The duration only ever shrinks; a
    /// larger value is ignored so a stale manifest update cannot expand a
    /// finalized timeline.
    pub fn set_duration(&mut self, duration: f64) {
        if duration > self.duration {
            warn!(
                current = self.duration,
                requested = duration,
                "Ignoring duration expansion"
            );
            return;
        }
        self.duration = duration;
    }

    pub fn max_segment_duration(&self) -> f64 {
        self.max_segment_duration
    }

    /// Folds an observed segment duration into the running maximum.
    pub fn notify_max_segment_duration(&mut self, duration: f64) {
        self.max_segment_duration = self.max_segment_duration.max(duration);
    }

    pub fn segment_availability_duration(&self) -> f64 {
        self.segment_availability_duration
    }

    pub fn set_segment_availability_duration(&mut self, duration: f64) {
        self.segment_availability_duration = duration;
    }

    pub fn presentation_delay(&self) -> f64 {
        self.presentation_delay
    }

    pub fn set_presentation_delay(&mut self, delay: f64) {
        self.presentation_delay = delay;
    }

    pub fn set_duration_backoff(&mut self, backoff: f64) {
        self.duration_backoff = backoff;
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms
    }

    /// Replaces the wall-clock offset obtained from clock synchronisation.
    pub fn set_clock_offset(&mut self, offset_ms: i64) {
        self.clock_offset_ms = offset_ms;
    }

    /// Current wall clock in presentation seconds (live only).
    fn now_in_presentation_time(&self) -> f64 {
        let Some(start) = self.presentation_start_time else {
            return 0.0;
        };
        let now = self.clock.now();
        let elapsed_ms = (now - start).num_milliseconds() + self.clock_offset_ms;
        elapsed_ms as f64 / 1000.0
    }

    /// Latest presentation time for which segments may exist.
    pub fn segment_availability_end(&self) -> f64 {
        if self.is_static {
            return self.duration;
        }
        self.now_in_presentation_time().min(self.duration)
    }

    /// Earliest presentation time for which segments are still fetchable.
    pub fn segment_availability_start(&self) -> f64 {
        if self.segment_availability_duration.is_infinite() {
            return 0.0;
        }
        (self.segment_availability_end() - self.segment_availability_duration).max(0.0)
    }

    /// Start of the seek range. For live, half a maximum segment duration is
    /// added past the availability start so that a seek target always has a
    /// fully fetchable segment under it.
    pub fn seek_range_start(&self) -> f64 {
        if self.is_static {
            return 0.0;
        }
        self.segment_availability_start() + self.max_segment_duration / 2.0
    }

    /// End of the seek range: the live edge minus the presentation delay, or
    /// the duration minus the configured backoff for VOD.
    pub fn seek_range_end(&self) -> f64 {
        let end = if self.is_static {
            self.duration - self.duration_backoff
        } else {
            self.segment_availability_end() - self.presentation_delay
        };
        end.max(self.seek_range_start())
    }

    pub fn seek_range(&self) -> (f64, f64) {
        (self.seek_range_start(), self.seek_range_end())
    }
}
