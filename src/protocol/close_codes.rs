//! Gateway close codes and how a shard reacts to each of them

use crate::error::ConnectionError;

/// Normal closure
pub const NORMAL_CLOSURE: u16 = 1000;
/// Endpoint going away
pub const GOING_AWAY: u16 = 1001;
/// Connection dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Gateway-specific close codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Unknown error occurred
    UnknownError = 4000,
    /// Invalid opcode sent
    UnknownOpcode = 4001,
    /// Payload could not be decoded
    DecodeError = 4002,
    /// Sent a payload before identifying
    NotAuthenticated = 4003,
    /// Invalid token
    AuthenticationFailed = 4004,
    /// Sent identify twice
    AlreadyAuthenticated = 4005,
    /// Session is no longer valid
    SessionNoLongerValid = 4006,
    /// Invalid sequence number on resume
    InvalidSequence = 4007,
    /// Sending too fast
    RateLimited = 4008,
    /// Session has timed out
    SessionTimeout = 4009,
    /// Invalid shard in identify
    InvalidShard = 4010,
    /// Too many guilds for one connection
    ShardingRequired = 4011,
    /// Invalid gateway version
    InvalidApiVersion = 4012,
    /// Invalid intents bitmask
    InvalidIntents = 4013,
    /// Privileged intents not enabled for this application
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Create a `CloseCode` from a raw u16 value
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4006 => Some(Self::SessionNoLongerValid),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimeout),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    /// Get the raw u16 value
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Human-readable description used as the error message
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown gateway error",
            Self::UnknownOpcode => "Gateway received invalid OP code",
            Self::DecodeError => "Gateway received invalid message",
            Self::NotAuthenticated => "Not authenticated",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::SessionNoLongerValid => "Invalid session",
            Self::InvalidSequence => "Invalid sequence number",
            Self::RateLimited => "Gateway connection was ratelimited",
            Self::SessionTimeout => "Session timed out",
            Self::InvalidShard => "Invalid shard key",
            Self::ShardingRequired => "Shard has too many guilds (>2500)",
            Self::InvalidApiVersion => "Invalid gateway version",
            Self::InvalidIntents => "Invalid intents specified",
            Self::DisallowedIntents => "Disallowed intents specified",
        }
    }

    /// What happens to the held session after this code
    #[must_use]
    pub const fn session_action(self) -> SessionAction {
        match self {
            Self::NotAuthenticated
            | Self::AuthenticationFailed
            | Self::SessionNoLongerValid
            | Self::SessionTimeout
            | Self::InvalidShard
            | Self::ShardingRequired
            | Self::InvalidApiVersion
            | Self::InvalidIntents
            | Self::DisallowedIntents => SessionAction::Clear,
            Self::InvalidSequence => SessionAction::ResetSequence,
            Self::UnknownError
            | Self::UnknownOpcode
            | Self::DecodeError
            | Self::AlreadyAuthenticated
            | Self::RateLimited => SessionAction::Keep,
        }
    }

    /// Whether the shard must stay down until its configuration changes
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed
                | Self::InvalidShard
                | Self::ShardingRequired
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.description(), self.as_u16())
    }
}

/// Effect of a close on the shard's resumable session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Session id and sequence survive; the next connect resumes
    Keep,
    /// Session id is forgotten; the next connect identifies
    Clear,
    /// Session id survives but the sequence goes back to zero
    ResetSequence,
}

/// Outcome of classifying a transport close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseDisposition {
    /// Error to surface, if the close was not a clean one
    pub error: Option<ConnectionError>,
    /// What to do with the session
    pub session: SessionAction,
    /// Whether the shard should reconnect
    pub reconnect: bool,
}

/// Classify a transport close into an error, a session action and a reconnect decision.
///
/// Codes that are not recognized keep the session and reconnect. That is a
/// policy choice: a future gateway code that should be fatal will retry
/// until it is added to [`CloseCode`].
#[must_use]
pub fn classify(code: u16, reason: &str) -> CloseDisposition {
    if let Some(known) = CloseCode::from_u16(code) {
        let fatal = known.is_fatal();
        return CloseDisposition {
            error: Some(ConnectionError::new(code, known.description()).with_fatal(fatal)),
            session: known.session_action(),
            reconnect: !fatal,
        };
    }

    let error = match code {
        NORMAL_CLOSURE => None,
        ABNORMAL_CLOSURE => Some(ConnectionError::new(code, "Connection reset by peer")),
        _ if reason.is_empty() => Some(ConnectionError::new(code, format!("Closed with code {code}"))),
        _ => Some(ConnectionError::new(code, format!("{code}: {reason}"))),
    };

    CloseDisposition {
        error,
        session: SessionAction::Keep,
        reconnect: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_roundtrip() {
        for raw in 4000..=4014u16 {
            if let Some(code) = CloseCode::from_u16(raw) {
                assert_eq!(code.as_u16(), raw);
            }
        }
        assert_eq!(CloseCode::from_u16(4015), None);
        assert_eq!(CloseCode::from_u16(1000), None);
    }

    #[test]
    fn test_normal_closure_is_quiet() {
        let disposition = classify(NORMAL_CLOSURE, "");
        assert!(disposition.error.is_none());
        assert_eq!(disposition.session, SessionAction::Keep);
        assert!(disposition.reconnect);
    }

    #[test]
    fn test_network_reset_reconnects_and_keeps_session() {
        let disposition = classify(ABNORMAL_CLOSURE, "");
        let error = disposition.error.unwrap();
        assert_eq!(error.message, "Connection reset by peer");
        assert!(!error.is_fatal());
        assert_eq!(disposition.session, SessionAction::Keep);
        assert!(disposition.reconnect);
    }

    #[test]
    fn test_protocol_errors_keep_session() {
        for code in [4001, 4002, 4005, 4008] {
            let disposition = classify(code, "");
            assert_eq!(disposition.session, SessionAction::Keep, "code {code}");
            assert!(disposition.reconnect, "code {code}");
            assert!(disposition.error.is_some(), "code {code}");
        }
    }

    #[test]
    fn test_not_authenticated_clears_session_but_reconnects() {
        let disposition = classify(4003, "");
        assert_eq!(disposition.session, SessionAction::Clear);
        assert!(disposition.reconnect);
    }

    #[test]
    fn test_invalid_sequence_resets_sequence() {
        let disposition = classify(4007, "");
        assert_eq!(disposition.session, SessionAction::ResetSequence);
        assert!(disposition.reconnect);
    }

    #[test]
    fn test_fatal_codes_never_reconnect() {
        for code in [4004, 4010, 4011, 4012, 4013, 4014] {
            let disposition = classify(code, "");
            assert!(!disposition.reconnect, "code {code}");
            assert_eq!(disposition.session, SessionAction::Clear, "code {code}");
            let error = disposition.error.unwrap();
            assert!(error.is_fatal(), "code {code}");
            assert_eq!(error.code, Some(code));
        }
    }

    #[test]
    fn test_unknown_code_keeps_session_and_reconnects() {
        let disposition = classify(4999, "something new");
        assert_eq!(disposition.session, SessionAction::Keep);
        assert!(disposition.reconnect);
        assert_eq!(disposition.error.unwrap().message, "4999: something new");

        let disposition = classify(GOING_AWAY, "");
        assert!(disposition.reconnect);
        assert_eq!(disposition.error.unwrap().code, Some(GOING_AWAY));
    }
}
