use std::fmt;

use mqtt_core::err::{DecodeError, EncodeError};

/// Status-code taxonomy for the client engine, carried as a typed error rather than
/// the integer return codes of the source API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    InvalidArgument,
    NoResources,
    TransportError,
    ProtocolError,
    Timeout,
    PersistenceError,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ClientError {
    kind: ClientErrorKind,
    message: String,
}

impl ClientError {
    pub fn new(kind: ClientErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ClientErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClientError {}

impl From<std::io::Error> for ClientError {
    fn from(value: std::io::Error) -> Self {
        Self {
            kind: ClientErrorKind::TransportError,
            message: value.to_string(),
        }
    }
}

impl From<DecodeError> for ClientError {
    fn from(value: DecodeError) -> Self {
        Self {
            kind: ClientErrorKind::ProtocolError,
            message: value.message().to_string(),
        }
    }
}

impl From<EncodeError> for ClientError {
    fn from(value: EncodeError) -> Self {
        Self {
            kind: ClientErrorKind::InvalidArgument,
            message: value.message().to_string(),
        }
    }
}
