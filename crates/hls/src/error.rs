#[derive(Debug, Clone, thiserror::Error)]
pub enum HlsError {
    #[error("invalid playlist: {0}")]
    InvalidPlaylist(String),

    #[error("expected a master playlist")]
    NotMasterPlaylist,

    #[error("expected a media playlist")]
    NotMediaPlaylist,

    #[error("required attribute `{0}` is missing")]
    RequiredAttributeMissing(&'static str),

    #[error("required tag `{0}` is missing")]
    RequiredTagMissing(&'static str),

    #[error("could not guess MIME type for `{0}`")]
    CouldNotGuessMimeType(String),

    #[error("could not guess codecs from `{0}`")]
    CouldNotGuessCodecs(String),

    #[error("multiple media init sections found in one playlist")]
    MultipleMediaInitSections,

    #[error("invalid byte range `{0}`")]
    InvalidByteRange(String),
}
