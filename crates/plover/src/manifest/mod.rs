// Manifest parser contract and registry. Parsers own the presentation and
// mutate it on refresh; everyone else reads through the shared handle and
// reconciles by id.

pub mod dash;
pub mod hls;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use presentation::{Clock, Period, Presentation, StreamId};

use crate::config::ManifestConfig;
use crate::error::{ErrorDetail, PlayerError};
use crate::events::{PlayerEvent, TimelineRegion};
use crate::net::NetworkingEngine;

pub type SharedPresentation = Arc<RwLock<Presentation>>;

/// Creates segment indexes on demand; the streaming engine calls this
/// before first use of a stream.
#[async_trait]
pub trait SegmentIndexCreator: Send + Sync {
    async fn create_segment_index(&self, stream_id: StreamId) -> Result<(), PlayerError>;
}

/// The player surface offered to parsers.
pub trait ParserHost: Send + Sync {
    fn networking(&self) -> Arc<NetworkingEngine>;
    fn clock(&self) -> Arc<dyn Clock>;
    /// Lets the player adjust a period before it becomes visible.
    fn filter_new_period(&self, _period: &mut Period) {}
    fn on_timeline_region_added(&self, region: TimelineRegion);
    fn on_event(&self, event: PlayerEvent);
    fn on_error(&self, error: PlayerError);
    /// The manifest changed; the engine should re-evaluate stalled streams.
    fn on_manifest_updated(&self);
}

#[async_trait]
pub trait ManifestParser: SegmentIndexCreator {
    async fn start(
        &self,
        uri: &str,
        host: Arc<dyn ParserHost>,
    ) -> Result<SharedPresentation, PlayerError>;
    async fn stop(&self);
    /// Forces a refresh (inband event or application request).
    async fn update(&self) -> Result<(), PlayerError>;
    fn on_expiration_updated(&self, _session_id: &str, _expiration_ms: f64) {}
}

pub type ParserFactory =
    Arc<dyn Fn(ManifestConfig, CancellationToken) -> Arc<dyn ManifestParser> + Send + Sync>;

/// Registry of parser factories keyed by file extension and MIME type.
/// Populated at construction; immutable once playback starts.
pub struct ParserRegistry {
    by_extension: RwLock<HashMap<String, ParserFactory>>,
    by_mime: RwLock<HashMap<String, ParserFactory>>,
}

impl ParserRegistry {
    pub fn empty() -> Self {
        Self {
            by_extension: RwLock::new(HashMap::new()),
            by_mime: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        let dash_factory: ParserFactory = Arc::new(|config, token| {
            Arc::new(dash::DashManifestParser::new(config, token)) as Arc<dyn ManifestParser>
        });
        let hls_factory: ParserFactory = Arc::new(|config, token| {
            Arc::new(hls::HlsManifestParser::new(config, token)) as Arc<dyn ManifestParser>
        });
        registry.register_extension("mpd", dash_factory.clone());
        registry.register_mime("application/dash+xml", dash_factory);
        registry.register_extension("m3u8", hls_factory.clone());
        registry.register_mime("application/vnd.apple.mpegurl", hls_factory.clone());
        registry.register_mime("application/x-mpegurl", hls_factory);
        registry
    }

    pub fn register_extension(&self, extension: &str, factory: ParserFactory) {
        self.by_extension
            .write()
            .insert(extension.to_ascii_lowercase(), factory);
    }

    pub fn register_mime(&self, mime: &str, factory: ParserFactory) {
        self.by_mime
            .write()
            .insert(mime.to_ascii_lowercase(), factory);
    }

    /// Picks a parser from the URI extension or an explicit MIME override.
    pub fn create(
        &self,
        uri: &str,
        mime_override: Option<&str>,
        config: ManifestConfig,
        token: CancellationToken,
    ) -> Result<Arc<dyn ManifestParser>, PlayerError> {
        if let Some(mime) = mime_override {
            if let Some(factory) = self.by_mime.read().get(&mime.to_ascii_lowercase()) {
                return Ok(factory(config, token));
            }
        }
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        let extension = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        if let Some(factory) = self.by_extension.read().get(&extension) {
            return Ok(factory(config, token));
        }
        Err(PlayerError::critical(ErrorDetail::UnableToGuessManifestType {
            uri: uri.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_guesses_by_extension_and_mime() {
        let registry = ParserRegistry::with_defaults();
        let token = CancellationToken::new();
        assert!(registry
            .create(
                "https://x/manifest.mpd?token=1",
                None,
                ManifestConfig::default(),
                token.clone()
            )
            .is_ok());
        assert!(registry
            .create(
                "https://x/master.m3u8",
                None,
                ManifestConfig::default(),
                token.clone()
            )
            .is_ok());
        assert!(registry
            .create(
                "https://x/stream",
                Some("application/dash+xml"),
                ManifestConfig::default(),
                token.clone()
            )
            .is_ok());
        let error = match registry.create("https://x/stream", None, ManifestConfig::default(), token) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(error.code(), 4016);
    }
}
