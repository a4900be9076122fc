// Media element contract: the platform surface the core drives but does
// not own. Decode and render live behind this trait.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::drm::cdm::MediaKeys;
use crate::error::PlayerError;

/// A contiguous buffered interval, in presentation seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferedRange {
    pub start: f64,
    pub end: f64,
}

impl BufferedRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats {
    pub decoded: u64,
    pub dropped: u64,
}

/// The platform media element.
pub trait MediaElement: Send + Sync {
    fn current_time(&self) -> f64;
    fn set_current_time(&self, time: f64);
    fn playback_rate(&self) -> f64;
    fn set_playback_rate(&self, rate: f64);
    fn paused(&self) -> bool;
    fn ended(&self) -> bool;
    /// Returns true once after each platform-initiated seek.
    fn take_seeked(&self) -> bool {
        false
    }
    fn frame_stats(&self) -> FrameStats {
        FrameStats::default()
    }
    /// Attaches (or detaches, with `None`) the CDM's media keys.
    fn set_media_keys(&self, _keys: Option<Arc<dyn MediaKeys>>) -> Result<(), PlayerError> {
        Ok(())
    }
}

/// An in-memory media element for tests and headless use.
#[derive(Default)]
pub struct FakeMediaElement {
    state: Mutex<FakeMediaElementState>,
}

#[derive(Default)]
struct FakeMediaElementState {
    current_time: f64,
    playback_rate: f64,
    paused: bool,
    ended: bool,
    seeked: bool,
    frame_stats: FrameStats,
}

impl FakeMediaElement {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeMediaElementState {
                playback_rate: 1.0,
                paused: true,
                ..Default::default()
            }),
        })
    }

    /// Moves the playhead as the platform would during playback, without
    /// flagging a seek.
    pub fn advance_time(&self, delta: f64) {
        self.state.lock().current_time += delta;
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().paused = paused;
    }

    pub fn set_ended(&self, ended: bool) {
        self.state.lock().ended = ended;
    }

    /// Seeks like a user would, flagging the seek for the observer.
    pub fn seek(&self, time: f64) {
        let mut state = self.state.lock();
        state.current_time = time;
        state.seeked = true;
    }
}

impl MediaElement for FakeMediaElement {
    fn current_time(&self) -> f64 {
        self.state.lock().current_time
    }

    fn set_current_time(&self, time: f64) {
        self.state.lock().current_time = time;
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().playback_rate
    }

    fn set_playback_rate(&self, rate: f64) {
        self.state.lock().playback_rate = rate;
    }

    fn paused(&self) -> bool {
        self.state.lock().paused
    }

    fn ended(&self) -> bool {
        self.state.lock().ended
    }

    fn take_seeked(&self) -> bool {
        std::mem::take(&mut self.state.lock().seeked)
    }

    fn frame_stats(&self) -> FrameStats {
        self.state.lock().frame_stats
    }
}
