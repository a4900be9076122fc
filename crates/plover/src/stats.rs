// Playback statistics, accumulated by the facade and the playhead
// observer.

/// One entry of the track-switch history.
#[derive(Debug, Clone)]
pub struct TrackChoice {
    /// Wall-clock milliseconds since the UNIX epoch.
    pub timestamp_ms: i64,
    pub variant_id: u32,
    pub bandwidth: u64,
    /// Whether ABR made the choice (as opposed to the application).
    pub from_adaptation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Buffering,
    Playing,
    Paused,
    Ended,
}

#[derive(Debug, Clone)]
pub struct StateChange {
    pub timestamp_ms: i64,
    pub state: PlaybackState,
    /// Seconds spent in this state (running total for the current state).
    pub duration: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub width: u32,
    pub height: u32,
    /// Bandwidth of the active variant, bits per second.
    pub stream_bandwidth: u64,
    pub decoded_frames: u64,
    pub dropped_frames: u64,
    /// Current ABR bandwidth estimate, bits per second.
    pub estimated_bandwidth: f64,
    /// Seconds from `load()` to the first frame being appendable.
    pub load_latency: f64,
    pub play_time: f64,
    pub buffering_time: f64,
    pub switch_history: Vec<TrackChoice>,
    pub state_history: Vec<StateChange>,
}

impl Stats {
    /// Appends to the state history, folding repeats of the current state
    /// into its running duration.
    pub fn note_state(&mut self, state: PlaybackState, now_ms: i64, delta_seconds: f64) {
        match self.state_history.last_mut() {
            Some(last) if last.state == state => last.duration += delta_seconds,
            _ => self.state_history.push(StateChange {
                timestamp_ms: now_ms,
                state,
                duration: delta_seconds,
            }),
        }
        match state {
            PlaybackState::Playing => self.play_time += delta_seconds,
            PlaybackState::Buffering => self.buffering_time += delta_seconds,
            _ => {}
        }
    }
}
