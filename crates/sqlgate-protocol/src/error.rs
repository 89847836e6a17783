use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("incomplete frame: declared {declared} bytes, {available} available")]
    IncompleteFrame { declared: usize, available: usize },
    #[error("invalid frame length: {0}")]
    InvalidLength(i32),
    #[error("declared frame length {length} exceeds limit {limit}")]
    FrameTooLarge { length: i32, limit: i32 },
    #[error("truncated message payload")]
    TruncatedPayload,
    #[error("missing string terminator in message payload")]
    UnterminatedString,
    #[error("invalid utf-8 in message payload")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(i32),
    #[error("unknown statement: {0:?}")]
    UnknownStatement(String),
    #[error("password authentication failed for user {0:?}")]
    AuthenticationFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
