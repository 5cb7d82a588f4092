//! The message-oriented connection: owns the split, buffered halves of the
//! underlying stream and drives the frame codec.
//!
//! One logical reader at a time; concurrent writers are serialized by the
//! writer mutex, which spans a whole fragmented message so its frames are
//! contiguous on the wire. The read loop transparently answers pings,
//! dispatches pongs to the registered callback and turns close frames into
//! [`Error::Close`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{close_code_label, CloseError, Error, CLOSE_NORMAL_CLOSURE, CLOSE_PROTOCOL_ERROR, CLOSE_UNSUPPORTED_DATA};
use crate::frame::{self, Frame, Opcode, MAX_HEADER_SIZE};
use crate::handshake;

/// Default per-frame payload size; larger messages are fragmented.
pub const DEFAULT_FRAME_SIZE: usize = 65535;

/// Which side of the connection this endpoint is. Clients mask every
/// outgoing frame and reject masked incoming frames; servers do the
/// opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// Connection lifecycle states. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// The kind of a data message, mapping onto the text and binary opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

impl MessageType {
    fn opcode(self) -> Opcode {
        match self {
            MessageType::Text => Opcode::Text,
            MessageType::Binary => Opcode::Binary,
        }
    }
}

type PongHandler = Box<dyn Fn(&[u8]) + Send + Sync>;

/// A WebSocket connection over any byte stream.
///
/// Created by [`crate::Dialer`] (client role) or [`crate::Upgrader`]
/// (server role) once the handshake succeeds. All methods take `&self`;
/// writes from concurrent tasks interleave only at frame boundaries.
pub struct Conn<S> {
    reader: Mutex<BufReader<ReadHalf<S>>>,
    writer: Mutex<BufWriter<WriteHalf<S>>>,
    role: Role,
    state: RwLock<State>,
    frame_size: usize,
    pong_handler: RwLock<Option<PongHandler>>,
    read_timeout: RwLock<Option<Duration>>,
    write_timeout: RwLock<Option<Duration>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<S> std::fmt::Debug for Conn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("role", &self.role)
            .field("state", &*self.state.read())
            .field("frame_size", &self.frame_size)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

/// Apply an optional deadline to a framed I/O future.
async fn timed<T, F>(limit: Option<Duration>, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match limit {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "websocket i/o deadline exceeded",
            ))),
        },
        None => fut.await,
    }
}

impl<S> Conn<S>
where
    S: AsyncRead + AsyncWrite,
{
    pub(crate) fn new(
        stream: S,
        role: Role,
        frame_size: usize,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Conn<S> {
        let frame_size = frame_size.max(1);
        let (read_half, write_half) = tokio::io::split(stream);
        Conn {
            // Sized so a full frame of the configured size fits in one
            // buffer refill alongside the largest possible header.
            reader: Mutex::new(BufReader::with_capacity(
                frame_size + MAX_HEADER_SIZE,
                read_half,
            )),
            writer: Mutex::new(BufWriter::new(write_half)),
            role,
            state: RwLock::new(State::Connecting),
            frame_size,
            pong_handler: RwLock::new(None),
            read_timeout: RwLock::new(None),
            write_timeout: RwLock::new(None),
            local_addr,
            peer_addr,
        }
    }

    /// Read the next data message, reassembling fragments and handling
    /// control frames along the way. Returns the message type and payload,
    /// or [`Error::Close`] once the peer closes.
    pub async fn read_message(&self) -> Result<(MessageType, Vec<u8>), Error> {
        self.ensure_connected()?;
        let mut reader = self.reader.lock().await;

        let (opcode, mut buf, mut fin) = self.next_data_frame(&mut reader, false).await?;
        let message_type = if opcode == Opcode::Binary {
            MessageType::Binary
        } else {
            MessageType::Text
        };
        while !fin {
            let (_, chunk, last) = self.next_data_frame(&mut reader, true).await?;
            buf.extend_from_slice(&chunk);
            fin = last;
        }

        Ok((message_type, buf))
    }

    /// Write one data message, fragmenting when the payload exceeds the
    /// frame size. The writer mutex is held for the whole message.
    pub async fn write_message(&self, message_type: MessageType, data: &[u8]) -> Result<(), Error> {
        self.ensure_connected()?;
        let frames = frame::fragment_message(
            message_type.opcode(),
            data,
            self.role == Role::Client,
            self.frame_size,
        );
        self.write_frames(&frames).await
    }

    /// Write a single control frame (close, ping or pong) with at most 125
    /// payload bytes.
    pub async fn write_control(&self, opcode: Opcode, payload: &[u8]) -> Result<(), Error> {
        self.ensure_connected()?;
        if !opcode.is_control() {
            return Err(Error::Protocol {
                code: CLOSE_PROTOCOL_ERROR,
                reason: "write_control requires a control opcode",
            });
        }
        if payload.len() > 125 {
            return Err(Error::Protocol {
                code: CLOSE_PROTOCOL_ERROR,
                reason: "control frame payload longer than 125 bytes",
            });
        }
        self.write_control_frame(opcode, payload).await
    }

    /// Send a ping carrying the payload `"ping"`. The peer's read loop
    /// answers with a pong that reaches the handler registered via
    /// [`Conn::set_pong_handler`].
    pub async fn ping(&self) -> Result<(), Error> {
        self.write_control(Opcode::Ping, b"ping").await
    }

    /// Initiate the close handshake: send a close frame with the given code
    /// best-effort, shut the stream down and move to `Closed`. Safe to call
    /// more than once.
    pub async fn close(&self, code: u16) -> Result<(), Error> {
        {
            let mut state = self.state.write();
            if matches!(*state, State::Closing | State::Closed) {
                return Ok(());
            }
            *state = State::Closing;
        }
        debug!(code, "closing connection");

        let sent = self.send_close_frame(code, close_code_label(code)).await;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        *self.state.write() = State::Closed;
        sent
    }

    /// [`Conn::close`] with code 1000.
    pub async fn close_normal(&self) -> Result<(), Error> {
        self.close(CLOSE_NORMAL_CLOSURE).await
    }

    /// Read a source to its end and send the bytes as one binary message.
    pub async fn send_from<R>(&self, mut source: R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin,
    {
        self.ensure_connected()?;
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.write_message(MessageType::Binary, &data).await
    }

    /// Read one binary message, streaming each fragment's payload into the
    /// sink as it arrives instead of buffering the whole message. Returns
    /// the number of bytes written.
    pub async fn receive_into<W>(&self, mut sink: W) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin,
    {
        self.ensure_connected()?;
        let mut reader = self.reader.lock().await;

        let (opcode, chunk, mut fin) = self.next_data_frame(&mut reader, false).await?;
        if opcode != Opcode::Binary {
            return Err(self
                .fail_protocol(CLOSE_UNSUPPORTED_DATA, "expected a binary message")
                .await);
        }
        sink.write_all(&chunk).await?;
        let mut total = chunk.len() as u64;

        while !fin {
            let (_, chunk, last) = self.next_data_frame(&mut reader, true).await?;
            sink.write_all(&chunk).await?;
            total += chunk.len() as u64;
            fin = last;
        }
        sink.flush().await?;

        Ok(total)
    }

    /// Pull frames until a data frame arrives, dispatching control frames
    /// on the way. With `open == false` only a text/binary opener is legal;
    /// with `open == true` only a continuation is. Returns the data opcode,
    /// the fragment payload and the fin flag.
    async fn next_data_frame(
        &self,
        reader: &mut BufReader<ReadHalf<S>>,
        open: bool,
    ) -> Result<(Opcode, Vec<u8>, bool), Error> {
        loop {
            let limit = *self.read_timeout.read();
            let frame = match timed(limit, Frame::read(&mut *reader)).await {
                Ok(frame) => frame,
                Err(Error::Protocol { code, reason }) => {
                    return Err(self.fail_protocol(code, reason).await);
                }
                Err(err) => {
                    if matches!(err, Error::Io(_)) {
                        self.abort().await;
                    }
                    return Err(err);
                }
            };
            trace!(opcode = ?frame.opcode, len = frame.payload.len(), fin = frame.fin, "frame received");

            // Clients must receive unmasked frames, servers masked ones.
            if frame.mask != (self.role == Role::Server) {
                let reason = if frame.mask {
                    "received a masked frame from the server"
                } else {
                    "received an unmasked frame from the client"
                };
                return Err(self.fail_protocol(CLOSE_PROTOCOL_ERROR, reason).await);
            }

            match frame.opcode {
                Opcode::Text | Opcode::Binary => {
                    if open {
                        return Err(self
                            .fail_protocol(
                                CLOSE_PROTOCOL_ERROR,
                                "data frame received while a fragmented message is open",
                            )
                            .await);
                    }
                    return Ok((frame.opcode, frame.payload, frame.fin));
                }
                Opcode::Continuation => {
                    if !open {
                        return Err(self
                            .fail_protocol(
                                CLOSE_PROTOCOL_ERROR,
                                "continuation frame without an open message",
                            )
                            .await);
                    }
                    return Ok((frame.opcode, frame.payload, frame.fin));
                }
                Opcode::Ping => {
                    self.write_control_frame(Opcode::Pong, &frame.payload).await?;
                }
                Opcode::Pong => {
                    let handler = self.pong_handler.read();
                    if let Some(handler) = handler.as_ref() {
                        handler(&frame.payload);
                    }
                }
                Opcode::Close => {
                    return Err(self.handle_close(frame.payload).await);
                }
            }
        }
    }

    /// Peer sent a close frame: parse code and reason, reply unless we
    /// started the close ourselves, then tear the connection down.
    async fn handle_close(&self, payload: Vec<u8>) -> Error {
        let (code, reason) = if payload.len() >= 2 {
            (
                u16::from_be_bytes([payload[0], payload[1]]),
                String::from_utf8_lossy(&payload[2..]).into_owned(),
            )
        } else {
            (CLOSE_NORMAL_CLOSURE, String::new())
        };
        debug!(code, reason = %reason, "peer sent close frame");

        let reply = !matches!(*self.state.read(), State::Closing);
        if reply {
            let _ = self.send_close_frame(code, close_code_label(code)).await;
        }
        self.abort().await;

        Error::Close(CloseError::new(code, reason))
    }

    /// Peer violated the protocol: best-effort close frame with the given
    /// code, then teardown.
    async fn fail_protocol(&self, code: u16, reason: &'static str) -> Error {
        warn!(code, reason, "protocol violation");
        let _ = self.send_close_frame(code, reason).await;
        self.abort().await;
        Error::Protocol { code, reason }
    }

    async fn send_close_frame(&self, code: u16, reason: &str) -> Result<(), Error> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        payload.truncate(125);
        self.write_control_frame(Opcode::Close, &payload).await
    }

    /// Control-frame write without the `Connected` gate; close replies go
    /// out while the state is already `Closing`.
    async fn write_control_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), Error> {
        let frame = Frame::control(opcode, self.role == Role::Client, payload);
        self.write_frames(std::slice::from_ref(&frame)).await
    }

    /// Serialize and write a frame sequence under the writer mutex, flushing
    /// after the last frame. An I/O failure closes the connection.
    async fn write_frames(&self, frames: &[Frame]) -> Result<(), Error> {
        let limit = *self.write_timeout.read();
        let mut writer = self.writer.lock().await;
        let res = timed(limit, async {
            for frame in frames {
                trace!(opcode = ?frame.opcode, len = frame.payload.len(), fin = frame.fin, "frame sent");
                writer.write_all(&frame.encode()).await?;
            }
            writer.flush().await?;
            Ok(())
        })
        .await;

        if matches!(res, Err(Error::Io(_))) {
            *self.state.write() = State::Closed;
            let _ = writer.shutdown().await;
        }
        res
    }

    /// Release the stream and mark the connection closed.
    async fn abort(&self) {
        *self.state.write() = State::Closed;
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Raw write used by the handshake phase, before framing starts.
    pub(crate) async fn write_raw(&self, bytes: &[u8]) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read an HTTP head off the stream. The returned flag reports whether
    /// more bytes were already buffered behind the head, which the server
    /// side treats as data sent before the handshake completed.
    pub(crate) async fn read_handshake_head(&self) -> Result<(Vec<u8>, bool), Error> {
        let mut reader = self.reader.lock().await;
        let head = handshake::read_head(&mut *reader).await?;
        let buffered = !reader.buffer().is_empty();
        Ok((head, buffered))
    }
}

impl<S> Conn<S> {
    fn ensure_connected(&self) -> Result<(), Error> {
        if matches!(*self.state.read(), State::Connected) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    pub(crate) fn set_connected(&self) {
        *self.state.write() = State::Connected;
    }

    pub fn state(&self) -> State {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state.read(), State::Connected)
    }

    /// Register a callback invoked with the payload of every pong the read
    /// loop encounters.
    pub fn set_pong_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.pong_handler.write() = Some(Box::new(handler));
    }

    /// Local socket address, when the connection was built from a TCP
    /// stream.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Peer socket address, when the connection was built from a TCP
    /// stream.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Deadline applied to each framed read; `None` waits indefinitely.
    pub fn set_read_timeout(&self, limit: Option<Duration>) {
        *self.read_timeout.write() = limit;
    }

    /// Deadline applied to each framed write; `None` waits indefinitely.
    pub fn set_write_timeout(&self, limit: Option<Duration>) {
        *self.write_timeout.write() = limit;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;

    use parking_lot::Mutex as PlMutex;
    use tokio::io::DuplexStream;

    use super::*;
    use crate::error::{CLOSE_MESSAGE_TOO_BIG, CLOSE_UNSUPPORTED_DATA};

    fn pair() -> (Conn<DuplexStream>, Conn<DuplexStream>) {
        pair_with_frame_size(DEFAULT_FRAME_SIZE)
    }

    fn pair_with_frame_size(frame_size: usize) -> (Conn<DuplexStream>, Conn<DuplexStream>) {
        let (a, b) = tokio::io::duplex(4 * 1024 * 1024);
        let client = Conn::new(a, Role::Client, frame_size, None, None);
        let server = Conn::new(b, Role::Server, frame_size, None, None);
        client.set_connected();
        server.set_connected();
        (client, server)
    }

    /// A server-role conn on one end, the raw stream on the other, for
    /// wire-level assertions.
    fn server_and_raw() -> (Conn<DuplexStream>, DuplexStream) {
        let (a, b) = tokio::io::duplex(4 * 1024 * 1024);
        let server = Conn::new(a, Role::Server, DEFAULT_FRAME_SIZE, None, None);
        server.set_connected();
        (server, b)
    }

    fn client_and_raw() -> (Conn<DuplexStream>, DuplexStream) {
        let (a, b) = tokio::io::duplex(4 * 1024 * 1024);
        let client = Conn::new(a, Role::Client, DEFAULT_FRAME_SIZE, None, None);
        client.set_connected();
        (client, b)
    }

    #[tokio::test]
    async fn text_round_trip_client_to_server() {
        let (client, server) = pair();
        client
            .write_message(MessageType::Text, b"hello")
            .await
            .unwrap();
        let (message_type, data) = server.read_message().await.unwrap();
        assert_eq!(message_type, MessageType::Text);
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn binary_round_trip_server_to_client() {
        let (client, server) = pair();
        server
            .write_message(MessageType::Binary, b"thank you")
            .await
            .unwrap();
        let (message_type, data) = client.read_message().await.unwrap();
        assert_eq!(message_type, MessageType::Binary);
        assert_eq!(data, b"thank you");
    }

    #[tokio::test]
    async fn fragmented_message_reassembles() {
        let (client, server) = pair();
        let payload: Vec<u8> = (0..65535 + 10).map(|i| (i % 251) as u8).collect();
        client
            .write_message(MessageType::Binary, &payload)
            .await
            .unwrap();
        let (message_type, data) = server.read_message().await.unwrap();
        assert_eq!(message_type, MessageType::Binary);
        assert_eq!(data, payload);
    }

    #[tokio::test]
    async fn fragmented_wire_layout() {
        let (server, mut raw) = server_and_raw();
        let payload = vec![0x5au8; 65535 + 10];
        server
            .write_message(MessageType::Binary, &payload)
            .await
            .unwrap();

        let mut wire = vec![0u8; 4 + 65535 + 2 + 10];
        raw.read_exact(&mut wire).await.unwrap();

        // First frame: binary, not final, 16-bit extended length of 65535.
        assert_eq!(wire[0], 0x02);
        assert_eq!(wire[1], 126);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 65535);
        // Tail frame: continuation, final, 10 literal bytes.
        let tail = &wire[4 + 65535..];
        assert_eq!(tail[0], 0x80);
        assert_eq!(tail[1], 10);
    }

    #[tokio::test]
    async fn client_frames_are_masked_on_the_wire() {
        let (client, mut raw) = client_and_raw();
        client
            .write_message(MessageType::Text, b"hello")
            .await
            .unwrap();

        let mut wire = vec![0u8; 2 + 4 + 5];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1], 0x80 | 5);
        let key = [wire[2], wire[3], wire[4], wire[5]];
        assert_ne!(key, [0u8; 4]);
        assert_ne!(&wire[6..], b"hello");
        let mut unmasked = wire[6..].to_vec();
        frame::apply_mask(&mut unmasked, key);
        assert_eq!(unmasked, b"hello");
    }

    #[tokio::test]
    async fn server_frames_are_unmasked_on_the_wire() {
        let (server, mut raw) = server_and_raw();
        server
            .write_message(MessageType::Text, b"hello")
            .await
            .unwrap();
        let mut wire = vec![0u8; 2 + 5];
        raw.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire[0], 0x81);
        assert_eq!(wire[1], 5);
        assert_eq!(&wire[2..], b"hello");
    }

    #[tokio::test]
    async fn ping_is_transparent_and_pong_reaches_handler() {
        let (client, server) = pair();
        let pongs: Arc<PlMutex<Vec<Vec<u8>>>> = Arc::new(PlMutex::new(Vec::new()));
        let sink = pongs.clone();
        client.set_pong_handler(move |payload| sink.lock().push(payload.to_vec()));

        client.ping().await.unwrap();
        client
            .write_message(MessageType::Text, b"after ping")
            .await
            .unwrap();

        // The server's read loop answers the ping and only surfaces the
        // data message.
        let (_, data) = server.read_message().await.unwrap();
        assert_eq!(data, b"after ping");

        server.write_message(MessageType::Text, b"done").await.unwrap();
        let (_, data) = client.read_message().await.unwrap();
        assert_eq!(data, b"done");
        assert_eq!(pongs.lock().as_slice(), &[b"ping".to_vec()]);
    }

    #[tokio::test]
    async fn close_handshake() {
        let (client, server) = pair();
        client.close(CLOSE_NORMAL_CLOSURE).await.unwrap();
        assert_eq!(client.state(), State::Closed);

        let err = server.read_message().await.unwrap_err();
        match err {
            Error::Close(close) => assert_eq!(close.code, CLOSE_NORMAL_CLOSURE),
            other => panic!("expected close error, got {other:?}"),
        }
        assert_eq!(server.state(), State::Closed);

        // Terminal state: everything fails fast, closing again is a no-op.
        assert!(matches!(
            client.write_message(MessageType::Text, b"x").await,
            Err(Error::NotConnected)
        ));
        client.close(CLOSE_NORMAL_CLOSURE).await.unwrap();
    }

    #[tokio::test]
    async fn close_frame_wire_layout() {
        let (server, mut raw) = server_and_raw();
        server.close(CLOSE_NORMAL_CLOSURE).await.unwrap();

        let mut head = [0u8; 2];
        raw.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], 0x88);
        let len = (head[1] & 0x7F) as usize;
        let mut payload = vec![0u8; len];
        raw.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload[..2], &[0x03, 0xE8]);
        assert_eq!(&payload[2..], b"normal closure");
    }

    #[tokio::test]
    async fn unmasked_client_frame_is_rejected_with_1002() {
        let (client, server) = pair();
        // Forge an unmasked text frame where a masked one is required.
        client.write_raw(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o']).await.unwrap();

        let err = server.read_message().await.unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_PROTOCOL_ERROR));
        assert_eq!(server.state(), State::Closed);

        // The server announced the violation with a close 1002.
        let err = client.read_message().await.unwrap_err();
        match err {
            Error::Close(close) => assert_eq!(close.code, CLOSE_PROTOCOL_ERROR),
            other => panic!("expected close error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn continuation_without_open_message_is_rejected() {
        let (client, server) = pair();
        let frames = [Frame::data(Opcode::Continuation, true, true, b"stray")];
        client.write_frames(&frames).await.unwrap();

        let err = server.read_message().await.unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn new_data_frame_inside_open_message_is_rejected() {
        let (client, server) = pair();
        let frames = [
            Frame::data(Opcode::Text, false, true, b"first half"),
            Frame::data(Opcode::Text, true, true, b"interloper"),
        ];
        client.write_frames(&frames).await.unwrap();

        let err = server.read_message().await.unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_PROTOCOL_ERROR));
    }

    #[tokio::test]
    async fn oversize_frame_announcement_closes_with_1009() {
        let (client, server) = pair();
        let mut forged = vec![0x82, 0x80 | 127];
        forged.extend_from_slice(&(frame::MAX_FRAME_PAYLOAD + 1).to_be_bytes());
        forged.extend_from_slice(&[1, 2, 3, 4]);
        client.write_raw(&forged).await.unwrap();

        let err = server.read_message().await.unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_MESSAGE_TOO_BIG));
    }

    #[tokio::test]
    async fn operations_refused_before_connected() {
        let (a, _b) = tokio::io::duplex(1024);
        let conn = Conn::new(a, Role::Client, DEFAULT_FRAME_SIZE, None, None);
        assert_eq!(conn.state(), State::Connecting);
        assert!(matches!(conn.read_message().await, Err(Error::NotConnected)));
        assert!(matches!(
            conn.write_message(MessageType::Text, b"x").await,
            Err(Error::NotConnected)
        ));
        assert!(matches!(conn.ping().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn write_control_refuses_data_opcodes_and_long_payloads() {
        let (client, _server) = pair();
        assert!(client.write_control(Opcode::Text, b"x").await.is_err());
        let long = vec![0u8; 126];
        assert!(client.write_control(Opcode::Ping, &long).await.is_err());
    }

    #[tokio::test]
    async fn send_from_and_receive_into_round_trip() {
        let (client, server) = pair_with_frame_size(1024);
        let contents: Vec<u8> = (0..10_000).map(|i| (i % 239) as u8).collect();

        client.send_from(&contents[..]).await.unwrap();

        let mut sink = Cursor::new(Vec::new());
        let written = server.receive_into(&mut sink).await.unwrap();
        assert_eq!(written, contents.len() as u64);
        assert_eq!(sink.into_inner(), contents);
    }

    #[tokio::test]
    async fn receive_into_refuses_text_messages() {
        let (client, server) = pair();
        client.write_message(MessageType::Text, b"not a file").await.unwrap();

        let mut sink = Cursor::new(Vec::new());
        let err = server.receive_into(&mut sink).await.unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_UNSUPPORTED_DATA));
    }

    #[tokio::test]
    async fn eof_surfaces_as_io_error_and_closes() {
        let (client, server) = pair();
        drop(client);
        let err = server.read_message().await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(server.state(), State::Closed);
    }

    #[tokio::test]
    async fn read_timeout_fires() {
        let (_client, server) = pair();
        server.set_read_timeout(Some(Duration::from_millis(20)));
        let err = server.read_message().await.unwrap_err();
        match err {
            Error::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
