//! RFC 6455 WebSocket endpoint library.
//!
//! Implements the Upgrade handshake, the binary frame codec (masking,
//! fragmentation, control interleave) and a message-oriented connection for
//! both client and server roles over a plain TCP byte stream, or any
//! `AsyncRead + AsyncWrite` stream the caller layers underneath (e.g. TLS
//! for `wss`).
//!
//! Client side:
//!
//! ```no_run
//! # async fn run() -> Result<(), wavesock::Error> {
//! let (conn, _response) = wavesock::dial("ws://127.0.0.1:9001/chat").await?;
//! conn.write_message(wavesock::MessageType::Text, b"hello").await?;
//! let (_, echoed) = conn.read_message().await?;
//! conn.close_normal().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Server side:
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:9001").await?;
//! let upgrader = wavesock::Upgrader::default();
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let _ = upgrader
//!         .accept(stream, |conn| async move {
//!             while let Ok((message_type, data)) = conn.read_message().await {
//!                 if conn.write_message(message_type, &data).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         })
//!         .await;
//! }
//! # }
//! ```

mod client;
mod conn;
mod error;
mod frame;
mod handshake;
mod server;

pub use client::{dial, Dialer, HandshakeResponse};
pub use conn::{Conn, MessageType, State, DEFAULT_FRAME_SIZE};
pub use error::{
    close_code_label, CloseError, Error, CLOSE_ABNORMAL_CLOSURE, CLOSE_GOING_AWAY,
    CLOSE_INTERNAL_SERVER_ERROR, CLOSE_INVALID_FRAME_PAYLOAD_DATA, CLOSE_MANDATORY_EXTENSION,
    CLOSE_MESSAGE_TOO_BIG, CLOSE_NORMAL_CLOSURE, CLOSE_NO_STATUS_RECEIVED, CLOSE_POLICY_VIOLATION,
    CLOSE_PROTOCOL_ERROR, CLOSE_SERVICE_RESTART, CLOSE_TLS_HANDSHAKE, CLOSE_TRY_AGAIN_LATER,
    CLOSE_UNSUPPORTED_DATA,
};
pub use frame::Opcode;
pub use server::{Request, Upgrader};
