use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("field not found: {event_id}.{path}")]
    FieldNotFound { event_id: String, path: String },
    #[error("invalid value for {event_id}.{path}: {reason}")]
    InvalidFieldValue {
        event_id: String,
        path: String,
        reason: String,
    },
    #[error("event not found: {0}")]
    EventNotFound(String),
    #[error("unknown timing strategy: {0}")]
    UnknownTimingStrategy(String),
    #[error("unknown broken channel strategy: {0}")]
    UnknownBrokenChannelStrategy(String),
    #[error("unknown partial ack strategy: {0}")]
    UnknownPartialAckStrategy(String),
    #[error("invalid replay state: {0}")]
    InvalidState(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("channel closed: {0}")]
    ChannelClosed(String),
    #[error("host error: {0}")]
    Host(String),
    #[error("script not found: {0}")]
    ScriptNotFound(String),
    #[error("synthesis error: {0}")]
    Synthesis(String),
}

impl ReplayError {
    /// Configuration and programmer errors that must abort the current replay.
    pub fn is_fatal_config(&self) -> bool {
        matches!(
            self,
            Self::UnknownTimingStrategy(_)
                | Self::UnknownBrokenChannelStrategy(_)
                | Self::UnknownPartialAckStrategy(_)
                | Self::InvalidState(_)
        )
    }
}
