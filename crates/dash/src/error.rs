#[derive(Debug, Clone, thiserror::Error)]
pub enum DashError {
    #[error("invalid MPD XML: {0}")]
    InvalidXml(String),

    #[error("MPD contains no periods")]
    NoPeriods,

    #[error("period `{0}` contains no adaptation sets")]
    EmptyPeriod(String),

    #[error("adaptation set in period `{0}` contains no representations")]
    EmptyAdaptationSet(String),

    #[error("duplicate representation id `{0}`")]
    DuplicateRepresentationId(String),

    #[error("representation `{id}` is missing required attribute `{attribute}`")]
    MissingAttribute { id: String, attribute: &'static str },

    #[error("invalid xs:duration `{0}`")]
    InvalidDuration(String),

    #[error("invalid dateTime `{0}`")]
    InvalidDateTime(String),

    #[error("invalid byte range `{0}`")]
    InvalidByteRange(String),

    #[error("malformed `{box_type}` box: {reason}")]
    MalformedBox {
        box_type: &'static str,
        reason: String,
    },
}
