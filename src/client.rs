//! Client-side endpoint: URL parsing, TCP dialing and the Upgrade
//! handshake that transitions the stream into framed mode.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::conn::{Conn, Role, DEFAULT_FRAME_SIZE};
use crate::error::Error;
use crate::handshake::{accept_key, generate_challenge_key, Head};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a WebSocket URL points: the endpoint to dial plus the request
/// line pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    port: u16,
    /// Value for the `Host` header; carries the port only when it is not
    /// the scheme default.
    authority: String,
    /// Path plus optional query, as sent on the GET line.
    resource: String,
}

/// Map a `ws://` or `wss://` URL to host:port. Any other scheme is
/// rejected. `wss` only selects port 443 here; TLS itself is layered by
/// the caller via [`Dialer::handshake`].
fn parse_url(raw: &str) -> Result<Target, Error> {
    let url = Url::parse(raw)?;

    let default_port = match url.scheme() {
        "ws" => 80,
        "wss" => 443,
        _ => {
            return Err(Error::Handshake(
                "only ws and wss url schemes are supported".into(),
            ))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| Error::Handshake("url has no host".into()))?
        .to_string();
    let port = url.port().unwrap_or(default_port);

    let authority = match url.port() {
        Some(p) => format!("{host}:{p}"),
        None => host.clone(),
    };

    let mut resource = url.path().to_string();
    if resource.is_empty() {
        resource.push('/');
    }
    if let Some(query) = url.query() {
        resource.push('?');
        resource.push_str(query);
    }

    Ok(Target {
        host,
        port,
        authority,
        resource,
    })
}

/// The server's side of a successful handshake, kept for callers that want
/// to inspect the negotiated subprotocol or other headers.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    pub status: u16,
    head: Head,
}

impl HandshakeResponse {
    /// Header value from the 101 response, case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// The subprotocol the server selected, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.header("Sec-WebSocket-Protocol")
    }

    /// All response headers in wire order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.head.headers()
    }
}

/// Client-side connector. Configure, then [`Dialer::dial`].
pub struct Dialer {
    /// Deadline for the whole handshake, connect included.
    pub timeout: Duration,
    /// Subprotocols offered in `Sec-WebSocket-Protocol`, in preference
    /// order.
    pub subprotocols: Vec<String>,
    /// Largest payload carried by a single outgoing frame.
    pub frame_size: usize,
}

impl Default for Dialer {
    fn default() -> Self {
        Dialer {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            subprotocols: Vec::new(),
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

impl Dialer {
    /// Open a TCP connection to the URL's endpoint, perform the Upgrade
    /// handshake and return the connection in `Connected` state together
    /// with the server's response.
    pub async fn dial(&self, url: &str) -> Result<(Conn<TcpStream>, HandshakeResponse), Error> {
        let target = parse_url(url)?;
        tokio::time::timeout(self.timeout, self.dial_target(target))
            .await
            .map_err(|_| Error::Timeout)?
    }

    /// Perform the handshake over a stream the caller already established,
    /// e.g. a TLS session for a `wss` URL.
    pub async fn handshake<S>(
        &self,
        stream: S,
        url: &str,
    ) -> Result<(Conn<S>, HandshakeResponse), Error>
    where
        S: AsyncRead + AsyncWrite,
    {
        let target = parse_url(url)?;
        tokio::time::timeout(self.timeout, self.handshake_target(stream, &target, None, None))
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn dial_target(
        &self,
        target: Target,
    ) -> Result<(Conn<TcpStream>, HandshakeResponse), Error> {
        let stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        self.handshake_target(stream, &target, local_addr, peer_addr)
            .await
    }

    async fn handshake_target<S>(
        &self,
        stream: S,
        target: &Target,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Result<(Conn<S>, HandshakeResponse), Error>
    where
        S: AsyncRead + AsyncWrite,
    {
        let conn = Conn::new(stream, Role::Client, self.frame_size, local_addr, peer_addr);
        let key = generate_challenge_key();

        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n",
            target.resource, target.authority, key
        );
        if !self.subprotocols.is_empty() {
            request.push_str(&format!(
                "Sec-WebSocket-Protocol: {}\r\n",
                self.subprotocols.join(",")
            ));
        }
        request.push_str("\r\n");

        conn.write_raw(request.as_bytes()).await?;

        // Any bytes a pipelining server sends after its head stay in the
        // connection's read buffer for the framed phase.
        let (raw_head, _) = conn.read_handshake_head().await?;
        let head = Head::parse(&raw_head)?;
        let response = validate_response(head, &key)?;

        conn.set_connected();
        debug!(host = %target.authority, "websocket handshake complete");
        Ok((conn, response))
    }
}

fn validate_response(head: Head, key: &str) -> Result<HandshakeResponse, Error> {
    let status: u16 = head
        .start_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Handshake(format!("malformed status line: {}", head.start_line)))?;

    if status != 101 {
        return Err(Error::Handshake(format!(
            "unexpected handshake status {status}"
        )));
    }
    if !head.header_eq("Upgrade", "websocket") {
        return Err(Error::Handshake(format!(
            "invalid Upgrade header: {:?}",
            head.header("Upgrade")
        )));
    }
    if !head.header_eq("Connection", "Upgrade") {
        return Err(Error::Handshake(format!(
            "invalid Connection header: {:?}",
            head.header("Connection")
        )));
    }
    if head.header("Sec-WebSocket-Accept") != Some(accept_key(key)).as_deref() {
        return Err(Error::Handshake(
            "Sec-WebSocket-Accept does not match the challenge key".into(),
        ));
    }

    Ok(HandshakeResponse { status, head })
}

/// [`Dialer::dial`] with default options.
pub async fn dial(url: &str) -> Result<(Conn<TcpStream>, HandshakeResponse), Error> {
    Dialer::default().dial(url).await
}
