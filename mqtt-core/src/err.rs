use std::{error::Error, fmt::Display};

#[derive(Debug, Clone)]
pub struct EncodeError {
    kind: EncodeErrorKind,
    message: String,
}

impl EncodeError {
    pub fn new(kind: EncodeErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    pub fn kind(&self) -> EncodeErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Error for EncodeError {}

impl Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum EncodeErrorKind {
    OversizedPayload,
    MissingField,
}

#[derive(Debug, Clone)]
pub struct DecodeError {
    kind: DecodeErrorKind,
    message: String,
}

impl Error for DecodeError {}

impl Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl DecodeError {
    pub fn new(kind: DecodeErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    pub fn kind(&self) -> DecodeErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeErrorKind {
    FlagBits,
    PacketType,
    WillQoS,
    Will,
    QoS,
    Utf8ParseError,
    MalformedLength,
    MalformedTopicFilter,
    MalformedTopicName,
    UsernamePassword,
    InvalidProtocol,
    InvalidReturnCode,
    ImproperDisconnect,
    ProtocolError,
    Timeout,
    UnexpectedEof,
}
