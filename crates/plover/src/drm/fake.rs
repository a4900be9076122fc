// In-memory CDM for tests and headless use: scriptable key systems,
// recorded requests, and test-driven session events.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::drm::cdm::{
    CdmAccess, CdmFactory, CdmSession, KeySystemConfig, MediaKeys, SessionEvent, SessionType,
};
use crate::error::{ErrorDetail, PlayerError};

#[derive(Default)]
struct Shared {
    supported_key_systems: Vec<String>,
    probed: Vec<String>,
    sessions: Vec<Arc<FakeCdmSession>>,
    server_certificates: Vec<Bytes>,
    next_session_number: u32,
    fail_media_keys: bool,
}

pub struct FakeCdm {
    shared: Arc<Mutex<Shared>>,
}

impl FakeCdm {
    pub fn supporting(key_systems: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Mutex::new(Shared {
                supported_key_systems: key_systems.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            })),
        })
    }

    /// Key systems probed, in order.
    pub fn probed(&self) -> Vec<String> {
        self.shared.lock().probed.clone()
    }

    pub fn sessions(&self) -> Vec<Arc<FakeCdmSession>> {
        self.shared.lock().sessions.clone()
    }

    pub fn server_certificates(&self) -> Vec<Bytes> {
        self.shared.lock().server_certificates.clone()
    }

    pub fn set_fail_media_keys(&self, fail: bool) {
        self.shared.lock().fail_media_keys = fail;
    }
}

#[async_trait]
impl CdmFactory for FakeCdm {
    async fn request_access(
        &self,
        config: &KeySystemConfig,
    ) -> Result<Arc<dyn CdmAccess>, PlayerError> {
        let mut shared = self.shared.lock();
        shared.probed.push(config.key_system.clone());
        if !shared.supported_key_systems.contains(&config.key_system) {
            return Err(PlayerError::critical(
                ErrorDetail::RequestedKeySystemConfigUnavailable,
            ));
        }
        Ok(Arc::new(FakeCdmAccess {
            key_system: config.key_system.clone(),
            shared: self.shared.clone(),
        }))
    }
}

struct FakeCdmAccess {
    key_system: String,
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl CdmAccess for FakeCdmAccess {
    fn key_system(&self) -> String {
        self.key_system.clone()
    }

    async fn create_media_keys(&self) -> Result<Arc<dyn MediaKeys>, PlayerError> {
        if self.shared.lock().fail_media_keys {
            return Err(PlayerError::critical(ErrorDetail::FailedToCreateCdm {
                reason: "fake CDM configured to fail".to_string(),
            }));
        }
        Ok(Arc::new(FakeMediaKeys {
            shared: self.shared.clone(),
        }))
    }
}

struct FakeMediaKeys {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl MediaKeys for FakeMediaKeys {
    async fn set_server_certificate(&self, certificate: &[u8]) -> Result<bool, PlayerError> {
        self.shared
            .lock()
            .server_certificates
            .push(Bytes::copy_from_slice(certificate));
        Ok(true)
    }

    fn create_session(
        &self,
        session_type: SessionType,
    ) -> Result<Arc<dyn CdmSession>, PlayerError> {
        let mut shared = self.shared.lock();
        shared.next_session_number += 1;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Arc::new(FakeCdmSession {
            id: format!("fake-session-{}", shared.next_session_number),
            session_type,
            events_tx,
            state: Mutex::new(FakeSessionState {
                events_rx: Some(events_rx),
                ..Default::default()
            }),
        });
        shared.sessions.push(session.clone());
        Ok(session)
    }
}

#[derive(Default)]
struct FakeSessionState {
    generate_requests: Vec<(String, Bytes)>,
    updates: Vec<Bytes>,
    loaded: Option<String>,
    closed: bool,
    reject_updates: bool,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
}

pub struct FakeCdmSession {
    id: String,
    pub session_type: SessionType,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<FakeSessionState>,
}

impl FakeCdmSession {
    /// Pushes an event as the platform CDM would.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn generate_requests(&self) -> Vec<(String, Bytes)> {
        self.state.lock().generate_requests.clone()
    }

    pub fn updates(&self) -> Vec<Bytes> {
        self.state.lock().updates.clone()
    }

    pub fn loaded_id(&self) -> Option<String> {
        self.state.lock().loaded.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn set_reject_updates(&self, reject: bool) {
        self.state.lock().reject_updates = reject;
    }
}

#[async_trait]
impl CdmSession for FakeCdmSession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn generate_request(
        &self,
        init_data_type: &str,
        init_data: &[u8],
    ) -> Result<(), PlayerError> {
        self.state
            .lock()
            .generate_requests
            .push((init_data_type.to_string(), Bytes::copy_from_slice(init_data)));
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<bool, PlayerError> {
        self.state.lock().loaded = Some(session_id.to_string());
        Ok(true)
    }

    async fn update(&self, response: &[u8]) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        if state.reject_updates {
            return Err(PlayerError::critical(ErrorDetail::LicenseResponseRejected {
                reason: "rejected by fake CDM".to_string(),
            }));
        }
        state.updates.push(Bytes::copy_from_slice(response));
        Ok(())
    }

    async fn close(&self) -> Result<(), PlayerError> {
        self.state.lock().closed = true;
        let _ = self.events_tx.send(SessionEvent::Closed);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.state.lock().events_rx.take()
    }
}
