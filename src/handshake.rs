//! Shared handshake machinery: challenge and accept keys, plus a bounded
//! HTTP/1.1 head reader used by both the dialer and the upgrader.

use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Fixed GUID appended to the client key when computing the accept key.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on a handshake request or response head.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Generate the `Sec-WebSocket-Key` challenge: 16 bytes from the CSPRNG,
/// base64-encoded.
pub(crate) fn generate_challenge_key() -> String {
    let bytes: [u8; 16] = rand::random();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Compute the `Sec-WebSocket-Accept` value for a challenge key:
/// `base64(sha1(key ++ GUID))`.
pub(crate) fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Read an HTTP head byte-wise until the `\r\n\r\n` terminator. Reading
/// through the connection's buffered reader means any bytes a pipelining
/// peer sends right after the head stay buffered for the framed phase.
pub(crate) async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        head.push(byte[0]);

        if head.len() >= 4 && head[head.len() - 4..] == *b"\r\n\r\n" {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(Error::Handshake("http head too large".into()));
        }
    }
}

/// A parsed HTTP head: the start line plus headers with case-insensitive
/// name lookup.
#[derive(Debug, Clone)]
pub(crate) struct Head {
    pub start_line: String,
    headers: Vec<(String, String)>,
}

impl Head {
    pub fn parse(raw: &[u8]) -> Result<Head, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::Handshake("http head is not valid utf-8".into()))?;

        let mut lines = text.split("\r\n");
        let start_line = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or_else(|| Error::Handshake("missing http start line".into()))?
            .to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Handshake(format!("malformed header line: {line}")))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Head {
            start_line,
            headers,
        })
    }

    /// First header value with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the header is present and its value matches
    /// case-insensitively.
    pub fn header_eq(&self, name: &str, value: &str) -> bool {
        self.header(name)
            .map_or(false, |v| v.eq_ignore_ascii_case(value))
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}
