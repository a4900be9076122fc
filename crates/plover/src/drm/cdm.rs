// Platform CDM contract (EME analog). The real implementation lives in the
// host; the core only drives this surface.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use presentation::KeyId;

use crate::error::PlayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Usable,
    Expired,
    OutputRestricted,
    InternalError,
    StatusPending,
    Released,
}

impl KeyStatus {
    /// Statuses that disqualify the variants the key belongs to.
    pub fn disallows_playback(&self) -> bool {
        matches!(self, KeyStatus::OutputRestricted | KeyStatus::InternalError)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Temporary,
    PersistentLicense,
}

/// Events a CDM session emits after `generate_request`/`update`.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message {
        message_type: MessageType,
        data: Bytes,
    },
    KeyStatuses(Vec<(KeyId, KeyStatus)>),
    ExpirationUpdated(Option<f64>),
    Closed,
}

/// One candidate key-system configuration offered to the platform.
#[derive(Debug, Clone)]
pub struct KeySystemConfig {
    pub key_system: String,
    pub distinctive_identifier_required: bool,
    pub persistent_state_required: bool,
    pub audio_robustness: String,
    pub video_robustness: String,
    pub init_data_types: Vec<String>,
}

#[async_trait]
pub trait CdmFactory: Send + Sync {
    /// Probes whether the platform supports `config`; the EME
    /// `requestMediaKeySystemAccess` analog.
    async fn request_access(
        &self,
        config: &KeySystemConfig,
    ) -> Result<std::sync::Arc<dyn CdmAccess>, PlayerError>;
}

#[async_trait]
pub trait CdmAccess: Send + Sync {
    fn key_system(&self) -> String;
    async fn create_media_keys(&self) -> Result<std::sync::Arc<dyn MediaKeys>, PlayerError>;
}

#[async_trait]
pub trait MediaKeys: Send + Sync {
    /// Returns false when the CDM does not support server certificates.
    async fn set_server_certificate(&self, certificate: &[u8]) -> Result<bool, PlayerError>;
    fn create_session(
        &self,
        session_type: SessionType,
    ) -> Result<std::sync::Arc<dyn CdmSession>, PlayerError>;
}

#[async_trait]
pub trait CdmSession: Send + Sync {
    fn session_id(&self) -> String;
    async fn generate_request(
        &self,
        init_data_type: &str,
        init_data: &[u8],
    ) -> Result<(), PlayerError>;
    /// Loads a stored persistent session; false when unknown.
    async fn load(&self, session_id: &str) -> Result<bool, PlayerError>;
    async fn update(&self, response: &[u8]) -> Result<(), PlayerError>;
    async fn close(&self) -> Result<(), PlayerError>;
    /// Hands over the session's event stream; callable once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>>;
}
