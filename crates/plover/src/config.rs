// Player configuration tree. `Player::configure` applies a mutation to a
// clone of the tree, validates it, and swaps it in; `reset_configuration`
// restores the defaults.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::error::PlayerError;
use crate::net::RetryParameters;

/// Outcome of a large-gap callback; `Handled` is `prevent_default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapDisposition {
    Default,
    Handled,
}

pub type FailureCallback = Arc<dyn Fn(&PlayerError) + Send + Sync>;
/// Called with `(current_time, gap_size)` when a large gap is hit.
pub type LargeGapCallback = Arc<dyn Fn(f64, f64) -> GapDisposition + Send + Sync>;

#[derive(Clone)]
pub struct StreamingConfig {
    pub retry: RetryParameters,
    /// Seconds of content needed ahead of the playhead to leave buffering.
    pub rebuffering_goal: f64,
    /// Seconds of content the engine tries to keep buffered ahead.
    pub buffering_goal: f64,
    /// Seconds of content kept behind the playhead before eviction.
    pub buffer_behind: f64,
    pub ignore_text_stream_failures: bool,
    pub jump_large_gaps: bool,
    /// Gaps up to this size are jumped silently.
    pub small_gap_limit: f64,
    pub start_at_segment_boundary: bool,
    /// Upper bound on the delay between update cycles of one stream.
    pub update_interval_cap: f64,
    /// Seconds kept in front of the playhead when clearing on a switch.
    pub default_clear_safe_margin: f64,
    /// Invoked on recoverable streaming failures (live network errors).
    pub failure_callback: Option<FailureCallback>,
    /// Consulted before acting on a large gap.
    pub on_large_gap: Option<LargeGapCallback>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            retry: RetryParameters::default(),
            rebuffering_goal: 2.0,
            buffering_goal: 10.0,
            buffer_behind: 30.0,
            ignore_text_stream_failures: false,
            jump_large_gaps: false,
            small_gap_limit: 0.5,
            start_at_segment_boundary: false,
            update_interval_cap: 1.0,
            default_clear_safe_margin: 0.0,
            failure_callback: None,
            on_large_gap: None,
        }
    }
}

impl fmt::Debug for StreamingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingConfig")
            .field("rebuffering_goal", &self.rebuffering_goal)
            .field("buffering_goal", &self.buffering_goal)
            .field("buffer_behind", &self.buffer_behind)
            .field("ignore_text_stream_failures", &self.ignore_text_stream_failures)
            .field("jump_large_gaps", &self.jump_large_gaps)
            .field("small_gap_limit", &self.small_gap_limit)
            .field("start_at_segment_boundary", &self.start_at_segment_boundary)
            .field("update_interval_cap", &self.update_interval_cap)
            .field("has_failure_callback", &self.failure_callback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AbrConfig {
    pub enabled: bool,
    /// Bits per second assumed before any measurement lands.
    pub default_bandwidth_estimate: f64,
    /// Minimum seconds between automatic switches.
    pub switch_interval: f64,
    /// Fraction of the estimate a variant may use when switching up.
    pub bandwidth_upgrade_target: f64,
    /// Fraction of the estimate a variant may use when switching down.
    pub bandwidth_downgrade_target: f64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_bandwidth_estimate: 500_000.0,
            switch_interval: 8.0,
            bandwidth_upgrade_target: 0.85,
            bandwidth_downgrade_target: 0.95,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdvancedDrmConfig {
    pub distinctive_identifier_required: bool,
    pub persistent_state_required: bool,
    pub audio_robustness: String,
    pub video_robustness: String,
    pub server_certificate: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct DrmConfig {
    pub retry: RetryParameters,
    /// Key system → license server URI.
    pub servers: HashMap<String, String>,
    /// Key system → extra capability requirements.
    pub advanced: HashMap<String, AdvancedDrmConfig>,
    /// Key id hex → key hex; synthesizes an `org.w3.clearkey` config.
    pub clear_keys: HashMap<String, String>,
    /// Queue the first license request until playback starts.
    pub delay_license_request_until_played: bool,
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            retry: RetryParameters::default(),
            servers: HashMap::new(),
            advanced: HashMap::new(),
            clear_keys: HashMap::new(),
            delay_license_request_until_played: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DashManifestConfig {
    /// Clock sync URI used when the MPD carries no `UTCTiming`.
    pub clock_sync_uri: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HlsManifestConfig {
    /// Codec assumed for variants that do not declare an audio codec.
    pub default_audio_codec: String,
    /// Codec assumed for variants that do not declare a video codec.
    pub default_video_codec: String,
}

impl Default for HlsManifestConfig {
    fn default() -> Self {
        Self {
            default_audio_codec: "mp4a.40.2".to_string(),
            default_video_codec: "avc1.42E01E".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestConfig {
    pub retry: RetryParameters,
    pub dash: DashManifestConfig,
    pub hls: HlsManifestConfig,
    /// Overrides the manifest's segment availability window (seconds).
    pub availability_window_override: Option<f64>,
}

/// Track restrictions; a stream outside any bound disqualifies its variant.
#[derive(Debug, Clone)]
pub struct Restrictions {
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
    pub min_bandwidth: u64,
    pub max_bandwidth: u64,
}

impl Default for Restrictions {
    fn default() -> Self {
        Self {
            min_width: 0,
            max_width: u32::MAX,
            min_height: 0,
            max_height: u32::MAX,
            min_bandwidth: 0,
            max_bandwidth: u64::MAX,
        }
    }
}

impl Restrictions {
    pub fn allows(&self, stream: &presentation::Stream) -> bool {
        if stream.bandwidth < self.min_bandwidth || stream.bandwidth > self.max_bandwidth {
            return false;
        }
        if let Some(width) = stream.width {
            if width < self.min_width || width > self.max_width {
                return false;
            }
        }
        if let Some(height) = stream.height {
            if height < self.min_height || height > self.max_height {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlayerConfig {
    pub manifest: ManifestConfig,
    pub streaming: StreamingConfig,
    pub abr: AbrConfig,
    pub drm: DrmConfig,
    pub restrictions: Restrictions,
    pub preferred_audio_language: String,
    pub preferred_text_language: String,
}

impl PlayerConfig {
    /// Clamps out-of-range values, warning about each correction.
    pub fn validate(&mut self) {
        if self.streaming.rebuffering_goal > self.streaming.buffering_goal {
            warn!(
                rebuffering_goal = self.streaming.rebuffering_goal,
                buffering_goal = self.streaming.buffering_goal,
                "rebuffering_goal exceeds buffering_goal; raising buffering_goal"
            );
            self.streaming.buffering_goal = self.streaming.rebuffering_goal;
        }
        if self.streaming.small_gap_limit <= 0.0 {
            warn!("small_gap_limit must be positive; using 0.5");
            self.streaming.small_gap_limit = 0.5;
        }
        for (name, target) in [
            ("bandwidth_upgrade_target", &mut self.abr.bandwidth_upgrade_target),
            ("bandwidth_downgrade_target", &mut self.abr.bandwidth_downgrade_target),
        ] {
            if *target <= 0.0 || *target > 1.0 {
                warn!(value = *target, "{name} outside (0, 1]; using 0.95");
                *target = 0.95;
            }
        }
        if self.abr.switch_interval < 0.0 {
            self.abr.switch_interval = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_clamps_goals_and_targets() {
        let mut config = PlayerConfig::default();
        config.streaming.rebuffering_goal = 20.0;
        config.streaming.buffering_goal = 10.0;
        config.abr.bandwidth_upgrade_target = 1.5;
        config.streaming.small_gap_limit = -1.0;
        config.validate();
        assert_eq!(config.streaming.buffering_goal, 20.0);
        assert_eq!(config.abr.bandwidth_upgrade_target, 0.95);
        assert_eq!(config.streaming.small_gap_limit, 0.5);
    }

    #[test]
    fn restrictions_filter_streams() {
        let restrictions = Restrictions {
            max_height: 720,
            min_bandwidth: 100_000,
            ..Default::default()
        };
        let mut stream = presentation::Stream {
            id: 0,
            stream_type: presentation::StreamType::Video,
            mime_type: "video/mp4".into(),
            codecs: String::new(),
            bandwidth: 600_000,
            width: Some(1280),
            height: Some(720),
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
            index: presentation::SegmentIndexHandle::new(),
        };
        assert!(restrictions.allows(&stream));
        stream.height = Some(1080);
        assert!(!restrictions.allows(&stream));
        stream.height = Some(720);
        stream.bandwidth = 50_000;
        assert!(!restrictions.allows(&stream));
    }
}
