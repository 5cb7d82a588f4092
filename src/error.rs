//! Error taxonomy and RFC 6455 close codes.

use std::fmt;

use thiserror::Error;

/// Normal closure; the purpose for which the connection was established has
/// been fulfilled.
pub const CLOSE_NORMAL_CLOSURE: u16 = 1000;
/// Endpoint is going away (server shutdown, browser navigating off the page).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Connection terminated because of a protocol error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Endpoint received a data type it cannot accept.
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
/// Reserved: no status code was present in the close frame.
pub const CLOSE_NO_STATUS_RECEIVED: u16 = 1005;
/// Reserved: connection dropped without a close frame.
pub const CLOSE_ABNORMAL_CLOSURE: u16 = 1006;
/// Payload data was inconsistent with the message type (e.g. non-UTF-8 text).
pub const CLOSE_INVALID_FRAME_PAYLOAD_DATA: u16 = 1007;
/// Message violated the endpoint's policy.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Message too big to process.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;
/// Client expected the server to negotiate one or more extensions.
pub const CLOSE_MANDATORY_EXTENSION: u16 = 1010;
/// Server encountered an unexpected condition.
pub const CLOSE_INTERNAL_SERVER_ERROR: u16 = 1011;
/// Server is restarting.
pub const CLOSE_SERVICE_RESTART: u16 = 1012;
/// Server is overloaded; try again later.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
/// Reserved: TLS handshake failure below the WebSocket layer.
pub const CLOSE_TLS_HANDSHAKE: u16 = 1015;

/// Human-readable label for a recognized close code, empty for unknown codes.
pub fn close_code_label(code: u16) -> &'static str {
    match code {
        CLOSE_NORMAL_CLOSURE => "normal closure",
        CLOSE_GOING_AWAY => "going away",
        CLOSE_PROTOCOL_ERROR => "protocol error",
        CLOSE_UNSUPPORTED_DATA => "unsupported data",
        CLOSE_NO_STATUS_RECEIVED => "no status",
        CLOSE_ABNORMAL_CLOSURE => "abnormal closure",
        CLOSE_INVALID_FRAME_PAYLOAD_DATA => "invalid payload data",
        CLOSE_POLICY_VIOLATION => "policy violation",
        CLOSE_MESSAGE_TOO_BIG => "message too big",
        CLOSE_MANDATORY_EXTENSION => "mandatory extension missing",
        CLOSE_INTERNAL_SERVER_ERROR => "internal server error",
        CLOSE_SERVICE_RESTART => "service restart",
        CLOSE_TRY_AGAIN_LATER => "try again later",
        CLOSE_TLS_HANDSHAKE => "TLS handshake error",
        _ => "",
    }
}

/// Close status delivered when either side ends the connection: the numeric
/// code from the close frame plus its optional UTF-8 reason text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseError {
    pub code: u16,
    pub reason: String,
}

impl CloseError {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "websocket: close {}", self.code)?;
        let label = close_code_label(self.code);
        if !label.is_empty() {
            write!(f, " ({label})")?;
        }
        if !self.reason.is_empty() {
            write!(f, ": {}", self.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

/// Everything that can go wrong on a WebSocket endpoint.
///
/// Protocol violations always attempt a best-effort close frame before the
/// stream is released; transport errors are terminal for the connection.
/// Nothing is retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// Handshake validation failed on either side; no framed phase begins.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// The handshake deadline expired before the exchange completed.
    #[error("websocket handshake timed out")]
    Timeout,

    /// The peer violated the framing protocol. A close frame carrying `code`
    /// was sent best-effort before the connection was torn down.
    #[error("websocket protocol violation: {reason}")]
    Protocol { code: u16, reason: &'static str },

    /// The peer sent a close frame, or a locally initiated close surfaced
    /// from the read loop.
    #[error("{0}")]
    Close(CloseError),

    /// Transport failure on the underlying stream; the connection is closed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The operation requires a connection in the `Connected` state.
    #[error("connection is not in the connected state")]
    NotConnected,

    #[error("invalid websocket url: {0}")]
    Url(#[from] url::ParseError),
}

impl Error {
    /// The close code associated with this error, when there is one.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::Close(e) => Some(e.code),
            Error::Protocol { code, .. } => Some(*code),
            _ => None,
        }
    }
}
