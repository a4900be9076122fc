// Player error taxonomy: every error carries a severity, a category, and a
// stable numeric code so integrators can switch on them across releases.

use dash::DashError;
use hls::HlsError;

/// How much of the pipeline an error takes down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Surfaced to listeners, but the engine keeps running.
    Recoverable,
    /// The affected subsystem halts.
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Network = 1,
    Text = 2,
    Media = 3,
    Manifest = 4,
    Streaming = 5,
    Drm = 6,
    Player = 7,
    Cast = 8,
    Storage = 9,
}

/// The concrete error kind. Codes are grouped per category in the
/// thousands: 1xxx network, 3xxx media, 4xxx manifest, 6xxx DRM, 7xxx
/// player.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorDetail {
    // --- Network ---
    #[error("HTTP status {status} for {uri}")]
    BadHttpStatus { uri: String, status: u16 },
    #[error("HTTP error for {uri}: {reason}")]
    HttpError { uri: String, reason: String },
    #[error("request timed out: {uri}")]
    Timeout { uri: String },
    #[error("malformed data: URI")]
    MalformedDataUri,
    #[error("unknown data: URI encoding")]
    UnknownDataUriEncoding,
    #[error("operation aborted")]
    OperationAborted,
    #[error("no scheme plugin for `{scheme}`")]
    UnsupportedScheme { scheme: String },

    // --- Text ---
    #[error("text stream failed: {reason}")]
    TextStreamFailure { reason: String },

    // --- Media ---
    #[error("media buffer operation failed: {reason}")]
    MediaSourceOperationFailed { reason: String },
    #[error("media buffer quota exceeded for {content_type}")]
    QuotaExceededError { content_type: String },
    #[error("video element error")]
    VideoError,
    #[error("content unsupported by platform")]
    ContentUnsupportedByBrowser,

    // --- Manifest ---
    #[error("invalid DASH manifest: {reason}")]
    DashInvalidXml { reason: String },
    #[error("DASH period `{period_id}` has no adaptation sets")]
    DashEmptyPeriod { period_id: String },
    #[error("DASH adaptation set has no representations")]
    DashEmptyAdaptationSet,
    #[error("duplicate DASH representation id `{representation_id}`")]
    DashDuplicateRepresentationId { representation_id: String },
    #[error("manifest has no periods")]
    NoPeriods,
    #[error("period at {start_time}s has no playable streams")]
    UnplayablePeriod { start_time: f64 },
    #[error("restrictions cannot be met by any variant")]
    RestrictionsCannotBeMet,
    #[error("HLS required attribute missing: {attribute}")]
    HlsRequiredAttributeMissing { attribute: String },
    #[error("HLS required tag missing: {tag}")]
    HlsRequiredTagMissing { tag: String },
    #[error("could not guess MIME type for {uri}")]
    HlsCouldNotGuessMimeType { uri: String },
    #[error("could not guess codecs: {codecs}")]
    HlsCouldNotGuessCodecs { codecs: String },
    #[error("multiple HLS media init sections found")]
    HlsMultipleMediaInitSectionsFound,
    #[error("invalid HLS playlist: {reason}")]
    HlsInvalidPlaylist { reason: String },
    #[error("could not determine manifest type for {uri}")]
    UnableToGuessManifestType { uri: String },

    // --- DRM ---
    #[error("none of the requested key system configurations are available")]
    RequestedKeySystemConfigUnavailable,
    #[error("no recognized key systems")]
    NoRecognizedKeySystems,
    #[error("failed to create CDM: {reason}")]
    FailedToCreateCdm { reason: String },
    #[error("failed to attach media keys to the media element")]
    FailedToAttachToVideo,
    #[error("the server certificate was rejected")]
    InvalidServerCertificate,
    #[error("failed to create DRM session")]
    FailedToCreateSession,
    #[error("failed to generate license request: {reason}")]
    FailedToGenerateLicenseRequest { reason: String },
    #[error("license request failed: {source}")]
    LicenseRequestFailed {
        #[source]
        source: Box<PlayerError>,
    },
    #[error("license response rejected: {reason}")]
    LicenseResponseRejected { reason: String },
    #[error("content is encrypted but the manifest carries no DRM info")]
    EncryptedContentWithoutDrmInfo,
    #[error("all keys in the session have expired")]
    Expired,
    #[error("no license server configured for `{key_system}`")]
    NoLicenseServerGiven { key_system: String },

    // --- Player ---
    #[error("load was interrupted by a new load, unload, or destroy")]
    LoadInterrupted,
}

impl ErrorDetail {
    pub fn category(&self) -> Category {
        use ErrorDetail::*;
        match self {
            BadHttpStatus { .. } | HttpError { .. } | Timeout { .. } | MalformedDataUri
            | UnknownDataUriEncoding | OperationAborted | UnsupportedScheme { .. } => {
                Category::Network
            }
            TextStreamFailure { .. } => Category::Text,
            MediaSourceOperationFailed { .. }
            | QuotaExceededError { .. }
            | VideoError
            | ContentUnsupportedByBrowser => Category::Media,
            DashInvalidXml { .. }
            | DashEmptyPeriod { .. }
            | DashEmptyAdaptationSet
            | DashDuplicateRepresentationId { .. }
            | NoPeriods
            | UnplayablePeriod { .. }
            | RestrictionsCannotBeMet
            | HlsRequiredAttributeMissing { .. }
            | HlsRequiredTagMissing { .. }
            | HlsCouldNotGuessMimeType { .. }
            | HlsCouldNotGuessCodecs { .. }
            | HlsMultipleMediaInitSectionsFound
            | HlsInvalidPlaylist { .. }
            | UnableToGuessManifestType { .. } => Category::Manifest,
            RequestedKeySystemConfigUnavailable
            | NoRecognizedKeySystems
            | FailedToCreateCdm { .. }
            | FailedToAttachToVideo
            | InvalidServerCertificate
            | FailedToCreateSession
            | FailedToGenerateLicenseRequest { .. }
            | LicenseRequestFailed { .. }
            | LicenseResponseRejected { .. }
            | EncryptedContentWithoutDrmInfo
            | Expired
            | NoLicenseServerGiven { .. } => Category::Drm,
            LoadInterrupted => Category::Player,
        }
    }

    pub fn code(&self) -> u32 {
        use ErrorDetail::*;
        match self {
            BadHttpStatus { .. } => 1001,
            HttpError { .. } => 1002,
            Timeout { .. } => 1003,
            MalformedDataUri => 1004,
            UnknownDataUriEncoding => 1005,
            OperationAborted => 1006,
            UnsupportedScheme { .. } => 1007,

            TextStreamFailure { .. } => 2001,

            MediaSourceOperationFailed { .. } => 3001,
            QuotaExceededError { .. } => 3002,
            VideoError => 3003,
            ContentUnsupportedByBrowser => 3004,

            DashInvalidXml { .. } => 4001,
            DashEmptyPeriod { .. } => 4002,
            DashEmptyAdaptationSet => 4003,
            DashDuplicateRepresentationId { .. } => 4004,
            NoPeriods => 4005,
            UnplayablePeriod { .. } => 4006,
            RestrictionsCannotBeMet => 4007,
            HlsRequiredAttributeMissing { .. } => 4010,
            HlsRequiredTagMissing { .. } => 4011,
            HlsCouldNotGuessMimeType { .. } => 4012,
            HlsCouldNotGuessCodecs { .. } => 4013,
            HlsMultipleMediaInitSectionsFound => 4014,
            HlsInvalidPlaylist { .. } => 4015,
            UnableToGuessManifestType { .. } => 4016,

            RequestedKeySystemConfigUnavailable => 6001,
            NoRecognizedKeySystems => 6002,
            FailedToCreateCdm { .. } => 6003,
            FailedToAttachToVideo => 6004,
            InvalidServerCertificate => 6005,
            FailedToCreateSession => 6006,
            FailedToGenerateLicenseRequest { .. } => 6007,
            LicenseRequestFailed { .. } => 6008,
            LicenseResponseRejected { .. } => 6009,
            EncryptedContentWithoutDrmInfo => 6010,
            Expired => 6011,
            NoLicenseServerGiven { .. } => 6012,

            LoadInterrupted => 7000,
        }
    }

    /// Whether the networking engine may retry a request that failed with
    /// this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            // 5xx and 429 are worth retrying; other statuses are not.
            ErrorDetail::BadHttpStatus { status, .. } => *status >= 500 || *status == 429,
            ErrorDetail::HttpError { .. } | ErrorDetail::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// An error with its severity; the payload the `error` event carries.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{detail}")]
pub struct PlayerError {
    pub severity: Severity,
    pub detail: ErrorDetail,
}

impl PlayerError {
    pub fn critical(detail: ErrorDetail) -> Self {
        Self {
            severity: Severity::Critical,
            detail,
        }
    }

    pub fn recoverable(detail: ErrorDetail) -> Self {
        Self {
            severity: Severity::Recoverable,
            detail,
        }
    }

    pub fn category(&self) -> Category {
        self.detail.category()
    }

    pub fn code(&self) -> u32 {
        self.detail.code()
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }

    pub fn into_recoverable(mut self) -> Self {
        self.severity = Severity::Recoverable;
        self
    }

    pub fn aborted() -> Self {
        Self::critical(ErrorDetail::OperationAborted)
    }

    pub fn load_interrupted() -> Self {
        Self::critical(ErrorDetail::LoadInterrupted)
    }
}

impl From<DashError> for PlayerError {
    fn from(error: DashError) -> Self {
        let detail = match error {
            DashError::NoPeriods => ErrorDetail::NoPeriods,
            DashError::EmptyPeriod(period_id) => ErrorDetail::DashEmptyPeriod { period_id },
            DashError::EmptyAdaptationSet(_) => ErrorDetail::DashEmptyAdaptationSet,
            DashError::DuplicateRepresentationId(representation_id) => {
                ErrorDetail::DashDuplicateRepresentationId { representation_id }
            }
            other => ErrorDetail::DashInvalidXml {
                reason: other.to_string(),
            },
        };
        PlayerError::critical(detail)
    }
}

impl From<HlsError> for PlayerError {
    fn from(error: HlsError) -> Self {
        let detail = match error {
            HlsError::RequiredAttributeMissing(attribute) => {
                ErrorDetail::HlsRequiredAttributeMissing {
                    attribute: attribute.to_string(),
                }
            }
            HlsError::RequiredTagMissing(tag) => ErrorDetail::HlsRequiredTagMissing {
                tag: tag.to_string(),
            },
            HlsError::CouldNotGuessMimeType(uri) => ErrorDetail::HlsCouldNotGuessMimeType { uri },
            HlsError::CouldNotGuessCodecs(codecs) => {
                ErrorDetail::HlsCouldNotGuessCodecs { codecs }
            }
            HlsError::MultipleMediaInitSections => ErrorDetail::HlsMultipleMediaInitSectionsFound,
            other => ErrorDetail::HlsInvalidPlaylist {
                reason: other.to_string(),
            },
        };
        PlayerError::critical(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_categories() {
        let cases = [
            (ErrorDetail::Timeout { uri: "u".into() }, Category::Network, 1003),
            (
                ErrorDetail::QuotaExceededError {
                    content_type: "video".into(),
                },
                Category::Media,
                3002,
            ),
            (ErrorDetail::NoPeriods, Category::Manifest, 4005),
            (ErrorDetail::Expired, Category::Drm, 6011),
            (ErrorDetail::LoadInterrupted, Category::Player, 7000),
        ];
        for (detail, category, code) in cases {
            assert_eq!(detail.category(), category);
            assert_eq!(detail.code(), code);
        }
    }

    #[test]
    fn retryability_of_http_statuses() {
        let server = ErrorDetail::BadHttpStatus { uri: "u".into(), status: 503 };
        let client = ErrorDetail::BadHttpStatus { uri: "u".into(), status: 404 };
        let throttled = ErrorDetail::BadHttpStatus { uri: "u".into(), status: 429 };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!ErrorDetail::MalformedDataUri.is_retryable());
    }

    #[test]
    fn severity_downgrade() {
        let error = PlayerError::critical(ErrorDetail::Timeout { uri: "u".into() });
        assert!(error.is_critical());
        let downgraded = error.into_recoverable();
        assert_eq!(downgraded.severity, Severity::Recoverable);
        assert_eq!(downgraded.code(), 1003);
    }

    #[test]
    fn manifest_errors_convert() {
        let error: PlayerError = DashError::NoPeriods.into();
        assert_eq!(error.code(), 4005);
        let error: PlayerError = HlsError::MultipleMediaInitSections.into();
        assert_eq!(error.code(), 4014);
        assert_eq!(error.category(), Category::Manifest);
    }
}
