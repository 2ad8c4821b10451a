use thiserror::Error;

/// Input rejected before any side effect takes place.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message text is empty")]
    EmptyText,

    #[error("sender identity is missing")]
    MissingSender,

    #[error("room is missing")]
    MissingRoom,

    #[error("unknown message: {0}")]
    UnknownMessage(String),

    #[error("{0} is not a participant of room {1}")]
    NotParticipant(String, String),
}

impl ValidationError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::EmptyText => "empty_text",
            Self::MissingSender => "missing_sender",
            Self::MissingRoom => "missing_room",
            Self::UnknownMessage(_) => "unknown_message",
            Self::NotParticipant(..) => "not_participant",
        }
    }
}
