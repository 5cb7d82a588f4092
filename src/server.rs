//! Server-side endpoint: validates the Upgrade request, emits the 101
//! response and hands the framed connection to a per-connection handler
//! task.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, error};
use url::Url;

use crate::conn::{Conn, Role, DEFAULT_FRAME_SIZE};
use crate::error::Error;
use crate::handshake::{accept_key, Head};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The parsed Upgrade request, as seen by the origin predicate.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    resource: String,
    head: Head,
}

impl Request {
    fn parse(raw: &[u8]) -> Result<Request, Error> {
        let head = Head::parse(raw)?;
        let mut parts = head.start_line.split_whitespace();
        let (method, resource, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(r), Some(v)) => (m.to_string(), r.to_string(), v),
            _ => {
                return Err(Error::Handshake(format!(
                    "malformed request line: {}",
                    head.start_line
                )))
            }
        };
        if !version.starts_with("HTTP/1.") {
            return Err(Error::Handshake(format!(
                "unsupported http version: {version}"
            )));
        }
        Ok(Request {
            method,
            resource,
            head,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Request target from the GET line, path plus optional query.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Header value, case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }
}

type OriginPredicate = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// Server-side handshake acceptor. Configure, then call
/// [`Upgrader::accept`] with each incoming TCP stream.
pub struct Upgrader {
    /// Deadline for the whole handshake exchange.
    pub timeout: Duration,
    /// Subprotocols this server speaks, in preference order.
    pub subprotocols: Vec<String>,
    /// Largest payload carried by a single outgoing frame.
    pub frame_size: usize,
    /// Cross-origin admission check. `None` applies the default rule:
    /// accept when no `Origin` header is present, otherwise require its
    /// host to match the request `Host`.
    pub check_origin: Option<OriginPredicate>,
}

impl Default for Upgrader {
    fn default() -> Self {
        Upgrader {
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            subprotocols: Vec::new(),
            frame_size: DEFAULT_FRAME_SIZE,
            check_origin: None,
        }
    }
}

impl Upgrader {
    /// Upgrade an accepted TCP stream. Captures the socket addresses, then
    /// behaves like [`Upgrader::upgrade`].
    pub async fn accept<F, Fut>(&self, stream: TcpStream, handler: F) -> Result<(), Error>
    where
        F: FnOnce(Conn<TcpStream>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let conn = Conn::new(stream, Role::Server, self.frame_size, local_addr, peer_addr);
        self.run(conn, handler).await
    }

    /// Upgrade any byte stream, e.g. one the caller already wrapped in TLS.
    /// On success the handler is spawned on a fresh task with the connected
    /// `Conn`; a panic inside the handler is caught and logged, never
    /// propagated past the handshake boundary.
    pub async fn upgrade<S, F, Fut>(&self, stream: S, handler: F) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnOnce(Conn<S>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let conn = Conn::new(stream, Role::Server, self.frame_size, None, None);
        self.run(conn, handler).await
    }

    async fn run<S, F, Fut>(&self, conn: Conn<S>, handler: F) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        F: FnOnce(Conn<S>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, self.handshake(&conn)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::Timeout),
        }

        let fut = handler(conn);
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let reason = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("non-string panic payload");
                error!(panic = reason, "websocket connection handler panicked");
            }
        });
        Ok(())
    }

    async fn handshake<S>(&self, conn: &Conn<S>) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite,
    {
        let (raw_head, buffered) = conn.read_handshake_head().await?;
        let request = Request::parse(&raw_head)?;

        if request.method() != "GET" {
            return self
                .reject(conn, 405, "Method Not Allowed", "websocket handshake requires a GET request")
                .await;
        }
        if !request.head.header_eq("Upgrade", "websocket") {
            return self
                .reject(conn, 400, "Bad Request", "invalid Upgrade header, expected websocket")
                .await;
        }
        if !request.head.header_eq("Connection", "Upgrade") {
            return self
                .reject(conn, 400, "Bad Request", "invalid Connection header, expected Upgrade")
                .await;
        }
        if !request.head.header_eq("Sec-WebSocket-Version", "13") {
            return self
                .reject(conn, 400, "Bad Request", "invalid Sec-WebSocket-Version, expected 13")
                .await;
        }
        let key = match request.header("Sec-WebSocket-Key") {
            Some(k) if !k.is_empty() => k.to_string(),
            _ => {
                return self
                    .reject(conn, 400, "Bad Request", "Sec-WebSocket-Key must not be empty")
                    .await;
            }
        };
        let origin_ok = match &self.check_origin {
            Some(predicate) => predicate(&request),
            None => default_origin_ok(&request),
        };
        if !origin_ok {
            return self
                .reject(conn, 400, "Bad Request", "origin not allowed")
                .await;
        }

        // No client bytes may arrive between the request head and the 101.
        if buffered {
            return Err(Error::Handshake(
                "client sent data before handshake completed".into(),
            ));
        }

        let protocol = self.select_subprotocol(&request);

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n",
            accept_key(&key)
        );
        if let Some(protocol) = &protocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        response.push_str("\r\n");

        conn.write_raw(response.as_bytes()).await?;
        conn.set_connected();
        debug!(resource = %request.resource(), protocol = ?protocol, "websocket upgrade complete");
        Ok(())
    }

    /// First client-offered subprotocol that this server also speaks. No
    /// match means no `Sec-WebSocket-Protocol` header in the response.
    fn select_subprotocol(&self, request: &Request) -> Option<String> {
        let offered = request.header("Sec-WebSocket-Protocol")?;
        offered
            .split(',')
            .map(str::trim)
            .find(|offer| self.subprotocols.iter().any(|p| p == offer))
            .map(str::to_string)
    }

    /// Write an error response with the reason as its body, then fail the
    /// upgrade.
    async fn reject<S>(
        &self,
        conn: &Conn<S>,
        status: u16,
        status_text: &str,
        reason: &str,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite,
    {
        let response = format!(
            "HTTP/1.1 {status} {status_text}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {reason}",
            reason.len()
        );
        conn.write_raw(response.as_bytes()).await?;
        Err(Error::Handshake(reason.to_string()))
    }
}

/// Default cross-origin rule: no `Origin` header is fine; one that is
/// present must name the same host the request was addressed to.
fn default_origin_ok(request: &Request) -> bool {
    let Some(origin) = request.header("Origin") else {
        return true;
    };
    let Some(host) = request.header("Host") else {
        return false;
    };
    let request_host = host.split(':').next().unwrap_or(host);
    match Url::parse(origin) {
        Ok(url) => url
            .host_str()
            .map_or(false, |h| h.eq_ignore_ascii_case(request_host)),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap()
    }

    #[test]
    fn parses_request_line_and_headers() {
        let req = request(
            "GET /chat?room=1 HTTP/1.1\r\n\
             Host: server.example.com\r\n\
             Upgrade: websocket\r\n\
             \r\n",
        );
        assert_eq!(req.method(), "GET");
        assert_eq!(req.resource(), "/chat?room=1");
        assert_eq!(req.header("host"), Some("server.example.com"));
    }

    #[test]
    fn rejects_malformed_request_line() {
        assert!(Request::parse(b"GET\r\n\r\n").is_err());
        assert!(Request::parse(b"GET / SPDY/3\r\n\r\n").is_err());
    }

    #[test]
    fn default_origin_rule() {
        let no_origin = request("GET / HTTP/1.1\r\nHost: a.example\r\n\r\n");
        assert!(default_origin_ok(&no_origin));

        let same_host = request(
            "GET / HTTP/1.1\r\nHost: a.example\r\nOrigin: http://a.example\r\n\r\n",
        );
        assert!(default_origin_ok(&same_host));

        let same_host_with_port = request(
            "GET / HTTP/1.1\r\nHost: a.example:9001\r\nOrigin: http://a.example:9001\r\n\r\n",
        );
        assert!(default_origin_ok(&same_host_with_port));

        let cross_origin = request(
            "GET / HTTP/1.1\r\nHost: a.example\r\nOrigin: http://evil.example\r\n\r\n",
        );
        assert!(!default_origin_ok(&cross_origin));

        let garbage_origin =
            request("GET / HTTP/1.1\r\nHost: a.example\r\nOrigin: not a url\r\n\r\n");
        assert!(!default_origin_ok(&garbage_origin));
    }

    #[test]
    fn subprotocol_selection_prefers_client_order_and_omits_on_no_match() {
        let upgrader = Upgrader {
            subprotocols: vec!["chat".to_string(), "superchat".to_string()],
            ..Upgrader::default()
        };

        let offered = request(
            "GET / HTTP/1.1\r\nSec-WebSocket-Protocol: superchat, chat\r\n\r\n",
        );
        assert_eq!(upgrader.select_subprotocol(&offered), Some("superchat".into()));

        let no_match = request("GET / HTTP/1.1\r\nSec-WebSocket-Protocol: graphql-ws\r\n\r\n");
        assert_eq!(upgrader.select_subprotocol(&no_match), None);

        let none_offered = request("GET / HTTP/1.1\r\n\r\n");
        assert_eq!(upgrader.select_subprotocol(&none_offered), None);
    }
}
