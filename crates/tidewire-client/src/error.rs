//! The client error taxonomy.
//!
//! Errors are classified the way database client code wants to branch on
//! them: interface (connection/protocol, always fatal to the session),
//! login, operational, programming, integrity, data (client-side value
//! range) and timeout. Server messages classify by message number.

use thiserror::Error;
use tidewire_proto::token::ServerMessage;
use tidewire_stream::StreamError;

/// Message numbers reported for syntax and name-resolution failures.
pub const PROGRAMMING_NUMBERS: &[i32] = &[102, 105, 207, 208, 2812, 4104];

/// Message numbers reported for constraint violations.
pub const INTEGRITY_NUMBERS: &[i32] = &[515, 547, 2601, 2627];

/// Login-phase message numbers for which retrying cannot help.
pub const LOGIN_NO_RETRY_NUMBERS: &[i32] = &[18452, 18456, 18486, 18487, 18488];

/// "The statement has been terminated." — noise accompanying a real error.
pub const STATEMENT_TERMINATED: i32 = 3621;

/// Client-facing error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Protocol framing, closed connection, invalid state transitions.
    /// Fatal to the session.
    #[error("interface error: {0}")]
    Interface(String),

    /// Transport or protocol failure; same class as [`Error::Interface`].
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Login-phase failure reported by the server.
    #[error("login failed: {message} (number {number})")]
    Login {
        /// Server message number.
        number: i32,
        /// Server message text.
        message: String,
    },

    /// Server-side operational failure (deadlock, server timeout, ...).
    #[error("operational error {number}: {message}")]
    Operational {
        /// Server message number.
        number: i32,
        /// Server message text.
        message: String,
    },

    /// Syntax errors, unknown objects, bad procedure names.
    #[error("programming error {number}: {message}")]
    Programming {
        /// Server message number.
        number: i32,
        /// Server message text.
        message: String,
    },

    /// Constraint violations.
    #[error("integrity error {number}: {message}")]
    Integrity {
        /// Server message number.
        number: i32,
        /// Server message text.
        message: String,
    },

    /// A client-side value does not fit the chosen wire type.
    #[error("data error: {0}")]
    Data(String),

    /// The query timeout elapsed; a CANCEL was sent before surfacing this.
    #[error("query timed out")]
    Timeout,
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, Error>;

impl From<tidewire_proto::ProtocolError> for Error {
    fn from(e: tidewire_proto::ProtocolError) -> Self {
        Self::Stream(StreamError::Protocol(e))
    }
}

impl Error {
    /// Classify a server message into the taxonomy.
    #[must_use]
    pub fn from_server_message(msg: &ServerMessage) -> Self {
        if INTEGRITY_NUMBERS.contains(&msg.number) {
            Self::Integrity {
                number: msg.number,
                message: msg.message.clone(),
            }
        } else if PROGRAMMING_NUMBERS.contains(&msg.number) {
            Self::Programming {
                number: msg.number,
                message: msg.message.clone(),
            }
        } else if LOGIN_NO_RETRY_NUMBERS.contains(&msg.number) {
            Self::Login {
                number: msg.number,
                message: msg.message.clone(),
            }
        } else {
            Self::Operational {
                number: msg.number,
                message: msg.message.clone(),
            }
        }
    }

    /// True when a connect retry cannot succeed (bad credentials, locked
    /// or expired accounts).
    #[must_use]
    pub fn suppresses_retry(&self) -> bool {
        matches!(self, Self::Login { number, .. } if LOGIN_NO_RETRY_NUMBERS.contains(number))
    }

    /// True for errors that leave the session unusable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Interface(_) | Self::Stream(_))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn msg(number: i32) -> ServerMessage {
        ServerMessage {
            is_error: true,
            number,
            state: 1,
            class: 14,
            message: "boom".into(),
            server: "srv".into(),
            procedure: String::new(),
            line: 1,
        }
    }

    #[test]
    fn classification_by_number() {
        assert!(matches!(
            Error::from_server_message(&msg(2627)),
            Error::Integrity { .. }
        ));
        assert!(matches!(
            Error::from_server_message(&msg(208)),
            Error::Programming { .. }
        ));
        assert!(matches!(
            Error::from_server_message(&msg(18456)),
            Error::Login { .. }
        ));
        assert!(matches!(
            Error::from_server_message(&msg(1205)),
            Error::Operational { .. }
        ));
    }

    #[test]
    fn login_failures_suppress_retry() {
        assert!(Error::from_server_message(&msg(18456)).suppresses_retry());
        assert!(!Error::from_server_message(&msg(1205)).suppresses_retry());
    }
}
