// DRM orchestrator: key-system probing, session lifecycle, license
// round-trips, and key-status aggregation.

pub mod cdm;
pub mod fake;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use presentation::{DrmInfo, InitData, KeyId};

use crate::config::DrmConfig;
use crate::drm::cdm::{
    CdmSession, KeyStatus, KeySystemConfig, MediaKeys, MessageType, SessionEvent, SessionType,
};
use crate::error::{ErrorDetail, PlayerError};
use crate::events::PlayerEvent;
use crate::media::MediaElement;
use crate::net::{NetworkingEngine, Request, RequestType};

pub const CLEARKEY_KEY_SYSTEM: &str = "org.w3.clearkey";

/// Key-status snapshot keyed by lowercase hex key id.
pub type KeyStatusMap = HashMap<String, KeyStatus>;

/// Invoked with the aggregated status map after each change.
pub type KeyStatusCallback = Arc<dyn Fn(&KeyStatusMap) + Send + Sync>;
pub type DrmEventCallback = Arc<dyn Fn(PlayerEvent) + Send + Sync>;
pub type DrmErrorCallback = Arc<dyn Fn(PlayerError) + Send + Sync>;

pub struct DrmCallbacks {
    pub on_key_status: KeyStatusCallback,
    pub on_event: DrmEventCallback,
    pub on_error: DrmErrorCallback,
}

struct SessionRecord {
    session: Arc<dyn CdmSession>,
    /// Init data the session was generated from, for re-issue after a
    /// CDM-level close.
    init_data: Option<InitData>,
}

#[derive(Default)]
struct DrmState {
    key_system: String,
    media_keys: Option<Arc<dyn MediaKeys>>,
    /// License server and flags for the chosen key system.
    chosen: Option<DrmInfo>,
    sessions: Vec<SessionRecord>,
    seen_init_data: HashSet<Vec<u8>>,
    seen_key_ids: HashSet<KeyId>,
    key_statuses: KeyStatusMap,
    all_keys_expired: bool,
    /// First license message queued until playback starts.
    delayed_message: Option<(Arc<dyn CdmSession>, Bytes)>,
    any_license_sent: bool,
    played: bool,
    expiration_ms: Option<f64>,
}

struct DrmInner {
    net: Arc<NetworkingEngine>,
    factory: Arc<dyn cdm::CdmFactory>,
    config: DrmConfig,
    callbacks: DrmCallbacks,
    token: CancellationToken,
    state: Mutex<DrmState>,
}

/// The DRM engine. One instance per load; `destroy` is idempotent and
/// interrupts any in-flight initialization or license exchange.
#[derive(Clone)]
pub struct DrmEngine {
    inner: Arc<DrmInner>,
}

impl DrmEngine {
    pub fn new(
        net: Arc<NetworkingEngine>,
        factory: Arc<dyn cdm::CdmFactory>,
        config: DrmConfig,
        callbacks: DrmCallbacks,
        parent_token: &CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(DrmInner {
                net,
                factory,
                config,
                callbacks,
                token: parent_token.child_token(),
                state: Mutex::new(DrmState::default()),
            }),
        }
    }

    /// Whether a key system was chosen and sessions may exist.
    pub fn is_active(&self) -> bool {
        !self.inner.state.lock().key_system.is_empty()
    }

    pub fn key_system(&self) -> String {
        self.inner.state.lock().key_system.clone()
    }

    pub fn drm_info(&self) -> Option<DrmInfo> {
        self.inner.state.lock().chosen.clone()
    }

    pub fn key_statuses(&self) -> KeyStatusMap {
        self.inner.state.lock().key_statuses.clone()
    }

    /// Soonest license expiration across sessions, in ms since epoch.
    pub fn get_expiration(&self) -> Option<f64> {
        self.inner.state.lock().expiration_ms
    }

    /// Builds candidate configurations and probes them in order.
    ///
    /// Candidates with a configured license server come first, preserving
    /// manifest order inside each partition. With no manifest DRM info but
    /// configured clear keys, a ClearKey configuration is synthesized.
    pub async fn init(&self, drm_infos: &[DrmInfo], any_encrypted: bool) -> Result<(), PlayerError> {
        let inner = &self.inner;

        let mut candidates: Vec<DrmInfo> = Vec::new();
        for info in drm_infos {
            if !candidates.iter().any(|c| c.key_system == info.key_system) {
                candidates.push(info.clone());
            } else if let Some(existing) = candidates
                .iter_mut()
                .find(|c| c.key_system == info.key_system)
            {
                // Merge init data from repeated entries of one key system.
                for init_data in &info.init_data {
                    if !existing.init_data.contains(init_data) {
                        existing.init_data.push(init_data.clone());
                    }
                }
                if existing.license_server_uri.is_none() {
                    existing.license_server_uri = info.license_server_uri.clone();
                }
            }
        }

        if candidates.is_empty() {
            if !inner.config.clear_keys.is_empty() {
                candidates.push(self.synthesize_clear_key_info());
            } else if any_encrypted {
                return Err(PlayerError::critical(
                    ErrorDetail::EncryptedContentWithoutDrmInfo,
                ));
            } else {
                debug!("Content is clear; DRM engine stays inactive");
                return Ok(());
            }
        }

        // Enrich from configuration and partition by server availability.
        for candidate in &mut candidates {
            if let Some(server) = inner.config.servers.get(&candidate.key_system) {
                candidate.license_server_uri = Some(server.clone());
            }
            if let Some(advanced) = inner.config.advanced.get(&candidate.key_system) {
                candidate.distinctive_identifier_required |=
                    advanced.distinctive_identifier_required;
                candidate.persistent_state_required |= advanced.persistent_state_required;
                if candidate.audio_robustness.is_empty() {
                    candidate.audio_robustness = advanced.audio_robustness.clone();
                }
                if candidate.video_robustness.is_empty() {
                    candidate.video_robustness = advanced.video_robustness.clone();
                }
                if candidate.server_certificate.is_none() {
                    candidate.server_certificate = advanced.server_certificate.clone();
                }
            }
        }
        let (with_server, without_server): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| c.license_server_uri.is_some());
        let ordered: Vec<DrmInfo> = with_server.into_iter().chain(without_server).collect();

        let mut chosen: Option<(DrmInfo, Arc<dyn cdm::CdmAccess>)> = None;
        for candidate in ordered {
            if inner.token.is_cancelled() {
                return Err(PlayerError::aborted());
            }
            let config = KeySystemConfig {
                key_system: candidate.key_system.clone(),
                distinctive_identifier_required: candidate.distinctive_identifier_required,
                persistent_state_required: candidate.persistent_state_required,
                audio_robustness: candidate.audio_robustness.clone(),
                video_robustness: candidate.video_robustness.clone(),
                init_data_types: candidate
                    .init_data
                    .iter()
                    .map(|d| d.init_data_type.clone())
                    .collect(),
            };
            match inner.factory.request_access(&config).await {
                Ok(access) => {
                    info!(key_system = %candidate.key_system, "Key system selected");
                    chosen = Some((candidate, access));
                    break;
                }
                Err(error) => {
                    debug!(key_system = %candidate.key_system, error = %error, "Key system probe failed");
                }
            }
        }
        let Some((chosen_info, access)) = chosen else {
            return Err(PlayerError::critical(
                ErrorDetail::RequestedKeySystemConfigUnavailable,
            ));
        };

        if chosen_info.license_server_uri.is_none()
            && chosen_info.key_system != CLEARKEY_KEY_SYSTEM
        {
            return Err(PlayerError::critical(ErrorDetail::NoLicenseServerGiven {
                key_system: chosen_info.key_system.clone(),
            }));
        }

        if inner.token.is_cancelled() {
            return Err(PlayerError::aborted());
        }
        let media_keys = access.create_media_keys().await.map_err(|e| {
            PlayerError::critical(ErrorDetail::FailedToCreateCdm {
                reason: e.to_string(),
            })
        })?;
        if inner.token.is_cancelled() {
            return Err(PlayerError::aborted());
        }

        if let Some(certificate) = &chosen_info.server_certificate {
            let accepted = media_keys
                .set_server_certificate(certificate)
                .await
                .map_err(|_| PlayerError::critical(ErrorDetail::InvalidServerCertificate))?;
            if !accepted {
                warn!("CDM ignored the server certificate");
            }
        }

        let mut state = inner.state.lock();
        state.key_system = chosen_info.key_system.clone();
        state.chosen = Some(chosen_info);
        state.media_keys = Some(media_keys);
        Ok(())
    }

    fn synthesize_clear_key_info(&self) -> DrmInfo {
        // ClearKey init data is a `keyids` JSON listing the configured ids.
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let kids: Vec<String> = self
            .inner
            .config
            .clear_keys
            .keys()
            .filter_map(|hex_id| KeyId::from_hex(hex_id))
            .map(|kid| b64.encode(kid.as_bytes()))
            .collect();
        let body = serde_json::json!({ "kids": kids, "type": "temporary" });
        DrmInfo {
            key_system: CLEARKEY_KEY_SYSTEM.to_string(),
            init_data: vec![InitData {
                data: Bytes::from(body.to_string()),
                init_data_type: "keyids".to_string(),
                key_id: None,
            }],
            key_ids: self
                .inner
                .config
                .clear_keys
                .keys()
                .filter_map(|hex_id| KeyId::from_hex(hex_id))
                .collect(),
            ..Default::default()
        }
    }

    /// Attaches the created media keys to the media element.
    pub fn attach(&self, media: &dyn MediaElement) -> Result<(), PlayerError> {
        let media_keys = self.inner.state.lock().media_keys.clone();
        let Some(media_keys) = media_keys else {
            return Ok(());
        };
        media
            .set_media_keys(Some(media_keys))
            .map_err(|_| PlayerError::critical(ErrorDetail::FailedToAttachToVideo))
    }

    /// Creates one session per distinct init-data entry and issues the
    /// license requests. Entries are deduplicated by key id AND by raw
    /// bytes.
    pub async fn create_sessions(&self, drm_infos: &[DrmInfo]) -> Result<(), PlayerError> {
        let (key_system, chosen) = {
            let state = self.inner.state.lock();
            (state.key_system.clone(), state.chosen.clone())
        };
        if key_system.is_empty() {
            return Ok(());
        }

        let mut init_entries: Vec<InitData> = Vec::new();
        for info in drm_infos
            .iter()
            .filter(|i| i.key_system == key_system)
            .chain(chosen.iter().filter(|c| c.key_system == CLEARKEY_KEY_SYSTEM))
        {
            init_entries.extend(info.init_data.iter().cloned());
        }

        for entry in init_entries {
            let fresh = {
                let mut state = self.inner.state.lock();
                let fresh_bytes = state.seen_init_data.insert(entry.data.to_vec());
                let fresh_key = match &entry.key_id {
                    Some(key_id) => state.seen_key_ids.insert(key_id.clone()),
                    None => true,
                };
                fresh_bytes && fresh_key
            };
            if !fresh {
                debug!("Skipping duplicate init data");
                continue;
            }
            self.create_session_for(entry).await?;
        }
        Ok(())
    }

    async fn create_session_for(&self, entry: InitData) -> Result<(), PlayerError> {
        let inner = &self.inner;
        if inner.token.is_cancelled() {
            return Err(PlayerError::aborted());
        }
        let (media_keys, persistent) = {
            let state = inner.state.lock();
            (
                state.media_keys.clone(),
                state
                    .chosen
                    .as_ref()
                    .map(|c| c.persistent_state_required)
                    .unwrap_or(false),
            )
        };
        let Some(media_keys) = media_keys else {
            return Ok(());
        };
        let session_type = if persistent {
            SessionType::PersistentLicense
        } else {
            SessionType::Temporary
        };
        let session = media_keys
            .create_session(session_type)
            .map_err(|_| PlayerError::critical(ErrorDetail::FailedToCreateSession))?;

        if let Some(events) = session.take_events() {
            self.spawn_session_pump(session.clone(), events);
        }

        session
            .generate_request(&entry.init_data_type, &entry.data)
            .await
            .map_err(|e| {
                PlayerError::critical(ErrorDetail::FailedToGenerateLicenseRequest {
                    reason: e.to_string(),
                })
            })?;

        inner.state.lock().sessions.push(SessionRecord {
            session,
            init_data: Some(entry),
        });
        Ok(())
    }

    /// Loads persistent sessions recorded by a previous run.
    pub async fn load_persistent_sessions(&self, session_ids: &[String]) -> Result<(), PlayerError> {
        let media_keys = self.inner.state.lock().media_keys.clone();
        let Some(media_keys) = media_keys else {
            return Ok(());
        };
        for session_id in session_ids {
            if self.inner.token.is_cancelled() {
                return Err(PlayerError::aborted());
            }
            let session = media_keys
                .create_session(SessionType::PersistentLicense)
                .map_err(|_| PlayerError::critical(ErrorDetail::FailedToCreateSession))?;
            if let Some(events) = session.take_events() {
                self.spawn_session_pump(session.clone(), events);
            }
            match session.load(session_id).await {
                Ok(true) => {
                    self.inner.state.lock().sessions.push(SessionRecord {
                        session,
                        init_data: None,
                    });
                }
                Ok(false) => warn!(session_id, "Stored session not found in CDM"),
                Err(error) => warn!(session_id, error = %error, "Failed to load stored session"),
            }
        }
        Ok(())
    }

    fn spawn_session_pump(
        &self,
        session: Arc<dyn CdmSession>,
        mut events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let engine = self.clone();
        let token = self.inner.token.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    SessionEvent::Message { message_type, data } => {
                        engine.on_session_message(&session, message_type, data).await;
                    }
                    SessionEvent::KeyStatuses(statuses) => {
                        engine.on_key_statuses(statuses);
                    }
                    SessionEvent::ExpirationUpdated(expiration) => {
                        engine.inner.state.lock().expiration_ms = expiration;
                        (engine.inner.callbacks.on_event)(PlayerEvent::ExpirationUpdated);
                    }
                    SessionEvent::Closed => {
                        engine.on_session_closed(&session).await;
                        break;
                    }
                }
            }
        });
    }

    async fn on_session_message(
        &self,
        session: &Arc<dyn CdmSession>,
        message_type: MessageType,
        data: Bytes,
    ) {
        let delay = {
            let mut state = self.inner.state.lock();
            // Only the very first license request can be delayed; renewals
            // never are.
            let is_first = !state.any_license_sent;
            let should_delay = self.inner.config.delay_license_request_until_played
                && message_type == MessageType::LicenseRequest
                && is_first
                && !state.played;
            if should_delay {
                state.delayed_message = Some((session.clone(), data.clone()));
            } else {
                state.any_license_sent = true;
            }
            should_delay
        };
        if delay {
            debug!("Queueing first license request until playback starts");
            return;
        }
        if let Err(error) = self.send_license_request(session, &data).await {
            (self.inner.callbacks.on_error)(error);
        }
    }

    async fn send_license_request(
        &self,
        session: &Arc<dyn CdmSession>,
        body: &Bytes,
    ) -> Result<(), PlayerError> {
        let inner = &self.inner;
        let (key_system, server) = {
            let state = inner.state.lock();
            (
                state.key_system.clone(),
                state
                    .chosen
                    .as_ref()
                    .and_then(|c| c.license_server_uri.clone()),
            )
        };

        let license = if key_system == CLEARKEY_KEY_SYSTEM && server.is_none() {
            self.build_clear_key_license(body)?
        } else {
            let Some(server) = server else {
                return Err(PlayerError::critical(ErrorDetail::NoLicenseServerGiven {
                    key_system,
                }));
            };
            let request = Request::post(server, body.clone(), inner.config.retry.clone())
                .with_header("content-type", "application/octet-stream".to_string());
            let response = inner
                .net
                .request(RequestType::License, request, &inner.token)
                .await
                .map_err(|e| {
                    PlayerError::critical(ErrorDetail::LicenseRequestFailed {
                        source: Box::new(e),
                    })
                })?;
            response.data
        };

        if inner.token.is_cancelled() {
            return Err(PlayerError::aborted());
        }
        session.update(&license).await.map_err(|e| {
            PlayerError::critical(ErrorDetail::LicenseResponseRejected {
                reason: e.to_string(),
            })
        })?;
        (inner.callbacks.on_event)(PlayerEvent::DrmSessionUpdate);
        Ok(())
    }

    /// Answers a ClearKey request locally from the configured key map.
    fn build_clear_key_license(&self, request: &Bytes) -> Result<Bytes, PlayerError> {
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let parsed: serde_json::Value = serde_json::from_slice(request).map_err(|e| {
            PlayerError::critical(ErrorDetail::LicenseResponseRejected {
                reason: format!("unparseable clearkey request: {e}"),
            })
        })?;
        let mut keys = Vec::new();
        if let Some(kids) = parsed.get("kids").and_then(|v| v.as_array()) {
            for kid_b64 in kids.iter().filter_map(|v| v.as_str()) {
                let Ok(kid_bytes) = b64.decode(kid_b64) else {
                    continue;
                };
                let kid_hex = hex::encode(&kid_bytes);
                if let Some(key_hex) = self.inner.config.clear_keys.get(&kid_hex) {
                    if let Ok(key_bytes) = hex::decode(key_hex) {
                        keys.push(serde_json::json!({
                            "kty": "oct",
                            "kid": kid_b64,
                            "k": b64.encode(key_bytes),
                        }));
                    }
                }
            }
        }
        let response = serde_json::json!({ "keys": keys, "type": "temporary" });
        Ok(Bytes::from(response.to_string()))
    }

    fn on_key_statuses(&self, statuses: Vec<(KeyId, KeyStatus)>) {
        let (snapshot, expired_transition) = {
            let mut state = self.inner.state.lock();
            for (key_id, status) in statuses {
                state.key_statuses.insert(key_id.to_hex(), status);
            }
            let all_expired = !state.key_statuses.is_empty()
                && state
                    .key_statuses
                    .values()
                    .all(|s| *s == KeyStatus::Expired);
            let transition = all_expired && !state.all_keys_expired;
            state.all_keys_expired = all_expired;
            (state.key_statuses.clone(), transition)
        };
        (self.inner.callbacks.on_key_status)(&snapshot);
        if expired_transition {
            // Exactly one EXPIRED per all-expired transition.
            (self.inner.callbacks.on_error)(PlayerError::critical(ErrorDetail::Expired));
        }
    }

    async fn on_session_closed(&self, session: &Arc<dyn CdmSession>) {
        if self.inner.token.is_cancelled() {
            return;
        }
        let init_data = {
            let mut state = self.inner.state.lock();
            let closed_id = session.session_id();
            let index = state
                .sessions
                .iter()
                .position(|r| r.session.session_id() == closed_id);
            index.and_then(|i| state.sessions.remove(i).init_data)
        };
        // A CDM-level close with the content still encrypted: re-issue the
        // request from the stored init data.
        if let Some(entry) = init_data {
            warn!(session_id = %session.session_id(), "Session closed by CDM; recreating");
            if let Err(error) = self.create_session_for(entry).await {
                (self.inner.callbacks.on_error)(error);
            }
        }
    }

    /// Called when playback starts; flushes a delayed first license request.
    pub fn on_played(&self) {
        let delayed = {
            let mut state = self.inner.state.lock();
            state.played = true;
            state.delayed_message.take()
        };
        if let Some((session, data)) = delayed {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.inner.state.lock().any_license_sent = true;
                if let Err(error) = engine.send_license_request(&session, &data).await {
                    (engine.inner.callbacks.on_error)(error);
                }
            });
        }
    }

    /// Tears the engine down. Every awaited step is raced against the
    /// cancellation token, so a destroy during initialization or a license
    /// exchange terminates that chain without surfacing an error.
    pub async fn destroy(&self) {
        self.inner.token.cancel();
        let sessions: Vec<Arc<dyn CdmSession>> = {
            let mut state = self.inner.state.lock();
            state.delayed_message = None;
            state.sessions.drain(..).map(|r| r.session).collect()
        };
        for session in sessions {
            if let Err(error) = session.close().await {
                debug!(error = %error, "Ignoring session close failure during destroy");
            }
        }
        self.inner.state.lock().media_keys = None;
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCdm;
    use super::*;
    use crate::net::{RetryParameters, SchemePlugin};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    struct LicenseServer {
        requests: Mutex<Vec<Bytes>>,
        response: Bytes,
    }

    #[async_trait]
    impl SchemePlugin for LicenseServer {
        async fn request(
            &self,
            uri: &Url,
            request: &Request,
        ) -> Result<crate::net::Response, PlayerError> {
            self.requests
                .lock()
                .push(request.body.clone().unwrap_or_default());
            Ok(crate::net::Response {
                uri: uri.to_string(),
                data: self.response.clone(),
                headers: HashMap::new(),
                elapsed: std::time::Duration::ZERO,
            })
        }
    }

    struct Harness {
        engine: DrmEngine,
        cdm: Arc<FakeCdm>,
        license: Arc<LicenseServer>,
        errors: Arc<Mutex<Vec<PlayerError>>>,
        statuses: Arc<Mutex<Vec<KeyStatusMap>>>,
        session_updates: Arc<AtomicU32>,
    }

    fn widevine_info(license_server: Option<&str>) -> DrmInfo {
        DrmInfo {
            key_system: "com.widevine.alpha".to_string(),
            license_server_uri: license_server.map(|s| s.to_string()),
            init_data: vec![InitData {
                data: Bytes::from_static(b"pssh-data"),
                init_data_type: "cenc".to_string(),
                key_id: None,
            }],
            ..Default::default()
        }
    }

    fn harness(config: DrmConfig, supported: &[&str]) -> Harness {
        let net = Arc::new(NetworkingEngine::empty());
        let license = Arc::new(LicenseServer {
            requests: Mutex::new(Vec::new()),
            response: Bytes::from_static(b"the-license"),
        });
        net.register_scheme("test", license.clone());

        let cdm = FakeCdm::supporting(supported);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let session_updates = Arc::new(AtomicU32::new(0));

        let errors_cb = errors.clone();
        let statuses_cb = statuses.clone();
        let updates_cb = session_updates.clone();
        let callbacks = DrmCallbacks {
            on_key_status: Arc::new(move |map| statuses_cb.lock().push(map.clone())),
            on_event: Arc::new(move |event| {
                if matches!(event, PlayerEvent::DrmSessionUpdate) {
                    updates_cb.fetch_add(1, Ordering::SeqCst);
                }
            }),
            on_error: Arc::new(move |error| errors_cb.lock().push(error)),
        };
        let engine = DrmEngine::new(net, cdm.clone(), config, callbacks, &CancellationToken::new());
        Harness {
            engine,
            cdm,
            license,
            errors,
            statuses,
            session_updates,
        }
    }

    fn fast_config() -> DrmConfig {
        DrmConfig {
            retry: RetryParameters::no_retries(),
            ..Default::default()
        }
    }

    async fn settle() {
        // Let session pump tasks run.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn probes_configured_server_systems_first() {
        let mut config = fast_config();
        config
            .servers
            .insert("com.microsoft.playready".to_string(), "test://pr".to_string());
        let h = harness(config, &["com.microsoft.playready"]);

        // Manifest order: widevine first, playready second; only playready
        // has a configured server so it is probed first.
        let infos = vec![
            widevine_info(None),
            DrmInfo {
                key_system: "com.microsoft.playready".to_string(),
                init_data: vec![InitData {
                    data: Bytes::from_static(b"pro"),
                    init_data_type: "cenc".to_string(),
                    key_id: None,
                }],
                ..Default::default()
            },
        ];
        h.engine.init(&infos, true).await.unwrap();
        assert_eq!(h.cdm.probed()[0], "com.microsoft.playready");
        assert_eq!(h.engine.key_system(), "com.microsoft.playready");
    }

    #[tokio::test]
    async fn no_supported_system_is_an_error() {
        let mut config = fast_config();
        config
            .servers
            .insert("com.widevine.alpha".to_string(), "test://wv".to_string());
        let h = harness(config, &[]);
        let error = h.engine.init(&[widevine_info(None)], true).await.unwrap_err();
        assert_eq!(error.code(), 6001);
    }

    #[tokio::test]
    async fn encrypted_without_drm_info_is_an_error() {
        let h = harness(fast_config(), &["com.widevine.alpha"]);
        let error = h.engine.init(&[], true).await.unwrap_err();
        assert_eq!(error.code(), 6010);
    }

    #[tokio::test]
    async fn clear_content_leaves_engine_inactive() {
        let h = harness(fast_config(), &[]);
        h.engine.init(&[], false).await.unwrap();
        assert!(!h.engine.is_active());
    }

    #[tokio::test]
    async fn license_round_trip() {
        let mut config = fast_config();
        config
            .servers
            .insert("com.widevine.alpha".to_string(), "test://license".to_string());
        let h = harness(config, &["com.widevine.alpha"]);
        let infos = vec![widevine_info(None)];
        h.engine.init(&infos, true).await.unwrap();
        h.engine.create_sessions(&infos).await.unwrap();

        let session = &h.cdm.sessions()[0];
        assert_eq!(session.generate_requests().len(), 1);
        assert_eq!(&session.generate_requests()[0].1[..], b"pssh-data");

        session.emit(SessionEvent::Message {
            message_type: MessageType::LicenseRequest,
            data: Bytes::from_static(b"challenge"),
        });
        settle().await;

        assert_eq!(&h.license.requests.lock()[0][..], b"challenge");
        assert_eq!(&session.updates()[0][..], b"the-license");
        assert_eq!(h.session_updates.load(Ordering::SeqCst), 1);
        assert!(h.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn duplicate_init_data_creates_one_session() {
        let mut config = fast_config();
        config
            .servers
            .insert("com.widevine.alpha".to_string(), "test://license".to_string());
        let h = harness(config, &["com.widevine.alpha"]);
        let infos = vec![widevine_info(None), widevine_info(None)];
        h.engine.init(&infos, true).await.unwrap();
        h.engine.create_sessions(&infos).await.unwrap();
        assert_eq!(h.cdm.sessions().len(), 1);
    }

    #[tokio::test]
    async fn delayed_license_until_played() {
        let mut config = fast_config();
        config.delay_license_request_until_played = true;
        config
            .servers
            .insert("com.widevine.alpha".to_string(), "test://license".to_string());
        let h = harness(config, &["com.widevine.alpha"]);
        let infos = vec![widevine_info(None)];
        h.engine.init(&infos, true).await.unwrap();
        h.engine.create_sessions(&infos).await.unwrap();

        let session = &h.cdm.sessions()[0];
        session.emit(SessionEvent::Message {
            message_type: MessageType::LicenseRequest,
            data: Bytes::from_static(b"challenge"),
        });
        settle().await;
        assert!(h.license.requests.lock().is_empty());

        h.engine.on_played();
        settle().await;
        assert_eq!(h.license.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn key_status_aggregation_and_expired_transition() {
        let mut config = fast_config();
        config
            .servers
            .insert("com.widevine.alpha".to_string(), "test://license".to_string());
        let h = harness(config, &["com.widevine.alpha"]);
        let infos = vec![widevine_info(None)];
        h.engine.init(&infos, true).await.unwrap();
        h.engine.create_sessions(&infos).await.unwrap();
        let session = &h.cdm.sessions()[0];

        let kid_a = KeyId::from_hex("00000000000000000000000000000001").unwrap();
        let kid_b = KeyId::from_hex("00000000000000000000000000000002").unwrap();
        session.emit(SessionEvent::KeyStatuses(vec![
            (kid_a.clone(), KeyStatus::Usable),
            (kid_b.clone(), KeyStatus::Expired),
        ]));
        settle().await;
        assert!(h.errors.lock().is_empty());
        let snapshot = h.statuses.lock().last().unwrap().clone();
        assert_eq!(snapshot["00000000000000000000000000000001"], KeyStatus::Usable);

        // All keys expired: exactly one EXPIRED error on the transition.
        session.emit(SessionEvent::KeyStatuses(vec![(kid_a, KeyStatus::Expired)]));
        settle().await;
        assert_eq!(h.errors.lock().len(), 1);
        assert_eq!(h.errors.lock()[0].code(), 6011);

        session.emit(SessionEvent::KeyStatuses(vec![(kid_b, KeyStatus::Expired)]));
        settle().await;
        assert_eq!(h.errors.lock().len(), 1, "no second EXPIRED for same transition");
    }

    #[tokio::test]
    async fn clear_keys_synthesize_clearkey_system() {
        let mut config = fast_config();
        config.clear_keys.insert(
            "abba971340473855bbf046ba0f814870".to_string(),
            "69eaa802a6763af979e8d1940fb88392".to_string(),
        );
        let h = harness(config, &[CLEARKEY_KEY_SYSTEM]);
        h.engine.init(&[], true).await.unwrap();
        assert_eq!(h.engine.key_system(), CLEARKEY_KEY_SYSTEM);
        h.engine.create_sessions(&[]).await.unwrap();
        assert_eq!(h.cdm.sessions().len(), 1);
        let (init_type, _) = &h.cdm.sessions()[0].generate_requests()[0];
        assert_eq!(init_type, "keyids");

        // The license is served locally from the configured keys.
        let b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let kid = b64.encode(hex::decode("abba971340473855bbf046ba0f814870").unwrap());
        let request = serde_json::json!({ "kids": [kid] }).to_string();
        let session = &h.cdm.sessions()[0];
        session.emit(SessionEvent::Message {
            message_type: MessageType::LicenseRequest,
            data: Bytes::from(request),
        });
        settle().await;
        let update = &session.updates()[0];
        let parsed: serde_json::Value = serde_json::from_slice(update).unwrap();
        assert_eq!(parsed["keys"][0]["kty"], "oct");
        assert_eq!(h.session_updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn destroy_interrupts_and_closes_sessions() {
        let mut config = fast_config();
        config
            .servers
            .insert("com.widevine.alpha".to_string(), "test://license".to_string());
        let h = harness(config, &["com.widevine.alpha"]);
        let infos = vec![widevine_info(None)];
        h.engine.init(&infos, true).await.unwrap();
        h.engine.create_sessions(&infos).await.unwrap();

        h.engine.destroy().await;
        assert!(h.cdm.sessions()[0].is_closed());

        // Post-destroy events are dropped silently.
        h.cdm.sessions()[0].emit(SessionEvent::Message {
            message_type: MessageType::LicenseRequest,
            data: Bytes::from_static(b"late"),
        });
        settle().await;
        assert!(h.license.requests.lock().is_empty());
        assert!(h.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn session_closed_by_cdm_is_recreated() {
        let mut config = fast_config();
        config
            .servers
            .insert("com.widevine.alpha".to_string(), "test://license".to_string());
        let h = harness(config, &["com.widevine.alpha"]);
        let infos = vec![widevine_info(None)];
        h.engine.init(&infos, true).await.unwrap();
        h.engine.create_sessions(&infos).await.unwrap();
        assert_eq!(h.cdm.sessions().len(), 1);

        h.cdm.sessions()[0].emit(SessionEvent::Closed);
        settle().await;
        // A replacement session was created and the request re-issued.
        assert_eq!(h.cdm.sessions().len(), 2);
        assert_eq!(h.cdm.sessions()[1].generate_requests().len(), 1);
    }
}
