//! RFC 6455 frame model and codec.
//!
//! A frame is the smallest self-describing unit on the wire: a 2-byte packed
//! header, an optional extended length (16 or 64 bits), an optional 4-byte
//! masking key, and the payload. Everything here is byte-order and bit-layout
//! work; connection semantics live in [`crate::conn`].

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, CLOSE_MESSAGE_TOO_BIG, CLOSE_PROTOCOL_ERROR};

/// Largest possible frame header: 2 bytes packed + 8 bytes extended length
/// + 4 bytes masking key.
pub(crate) const MAX_HEADER_SIZE: usize = 14;

/// Hard cap on a single incoming frame's payload. Peers announcing more are
/// refused with close 1009 before any allocation happens.
pub(crate) const MAX_FRAME_PAYLOAD: u64 = 64 * 1024 * 1024;

/// Frame opcode, the 4-bit type tag in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub(crate) fn from_u8(value: u8) -> Option<Opcode> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Close, ping and pong are control opcodes; they never fragment and
    /// carry at most 125 payload bytes.
    pub fn is_control(self) -> bool {
        self as u8 >= 0x8
    }
}

/// A single decoded or to-be-encoded frame. `payload` is always the clear
/// bytes; masking is applied on encode and removed on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: Opcode,
    pub mask: bool,
    pub masking_key: [u8; 4],
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a data frame. A masked frame gets a fresh random key.
    pub fn data(opcode: Opcode, fin: bool, masked: bool, payload: &[u8]) -> Frame {
        Frame {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: masked,
            masking_key: if masked { generate_masking_key() } else { [0; 4] },
            payload: payload.to_vec(),
        }
    }

    /// Build a control frame: always final, payload at most 125 bytes.
    pub fn control(opcode: Opcode, masked: bool, payload: &[u8]) -> Frame {
        debug_assert!(opcode.is_control());
        debug_assert!(payload.len() <= 125);
        Frame::data(opcode, true, masked, payload)
    }

    /// Serialize the frame: packed header, extended length, masking key,
    /// payload (masked on the fly when the mask bit is set).
    pub fn encode(&self) -> Vec<u8> {
        let len = self.payload.len();
        let mut buf = Vec::with_capacity(MAX_HEADER_SIZE + len);

        buf.push(
            (self.fin as u8) << 7
                | (self.rsv1 as u8) << 6
                | (self.rsv2 as u8) << 5
                | (self.rsv3 as u8) << 4
                | self.opcode as u8,
        );

        let mask_bit = (self.mask as u8) << 7;
        if len <= 125 {
            buf.push(mask_bit | len as u8);
        } else if len <= 65535 {
            buf.push(mask_bit | 126);
            buf.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            buf.push(mask_bit | 127);
            buf.extend_from_slice(&(len as u64).to_be_bytes());
        }

        if self.mask {
            buf.extend_from_slice(&self.masking_key);
            buf.extend(
                self.payload
                    .iter()
                    .enumerate()
                    .map(|(i, b)| b ^ self.masking_key[i % 4]),
            );
        } else {
            buf.extend_from_slice(&self.payload);
        }

        buf
    }

    /// Decode one frame from the stream in staged reads: 2 header bytes,
    /// then 0/2/8 extended length bytes, then 0/4 key bytes, then exactly
    /// the announced payload, unmasked in place when the mask bit is set.
    pub async fn read<R>(reader: &mut R) -> Result<Frame, Error>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; 2];
        reader.read_exact(&mut head).await?;

        let fin = head[0] & 0x80 != 0;
        let rsv1 = head[0] & 0x40 != 0;
        let rsv2 = head[0] & 0x20 != 0;
        let rsv3 = head[0] & 0x10 != 0;
        let opcode = Opcode::from_u8(head[0] & 0x0F).ok_or(Error::Protocol {
            code: CLOSE_PROTOCOL_ERROR,
            reason: "unknown opcode",
        })?;
        let mask = head[1] & 0x80 != 0;

        let mut len = u64::from(head[1] & 0x7F);
        if len == 126 {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            len = u64::from(u16::from_be_bytes(ext));
        } else if len == 127 {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            if ext[0] & 0x80 != 0 {
                return Err(Error::Protocol {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: "64-bit payload length has the high bit set",
                });
            }
            len = u64::from_be_bytes(ext);
        }

        if rsv1 || rsv2 || rsv3 {
            return Err(Error::Protocol {
                code: CLOSE_PROTOCOL_ERROR,
                reason: "reserved bits are not zero",
            });
        }
        if opcode.is_control() && (!fin || len > 125) {
            return Err(Error::Protocol {
                code: CLOSE_PROTOCOL_ERROR,
                reason: "control frame fragmented or longer than 125 bytes",
            });
        }
        if len > MAX_FRAME_PAYLOAD {
            return Err(Error::Protocol {
                code: CLOSE_MESSAGE_TOO_BIG,
                reason: "frame payload exceeds the 64 MiB limit",
            });
        }

        let masking_key = if mask {
            let mut key = [0u8; 4];
            reader.read_exact(&mut key).await?;
            if key == [0; 4] {
                return Err(Error::Protocol {
                    code: CLOSE_PROTOCOL_ERROR,
                    reason: "masked frame carries an unset masking key",
                });
            }
            key
        } else {
            [0u8; 4]
        };

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;
        if mask {
            apply_mask(&mut payload, masking_key);
        }

        Ok(Frame {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            mask,
            masking_key,
            payload,
        })
    }
}

/// XOR the payload with the key, `payload[i] ^= key[i % 4]`. Self-inverse,
/// so the same call masks and unmasks.
pub(crate) fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Draw a 4-byte masking key from the CSPRNG. An all-zero key is
/// indistinguishable from an unset one on the wire, so it is rerolled.
pub(crate) fn generate_masking_key() -> [u8; 4] {
    loop {
        let key: [u8; 4] = rand::random();
        if key != [0; 4] {
            return key;
        }
    }
}

/// Split a message into its frame sequence: one final frame when it fits,
/// otherwise `frame_size` chunks where the first carries the data opcode,
/// the rest are continuations, and only the tail is final.
pub(crate) fn fragment_message(
    opcode: Opcode,
    payload: &[u8],
    masked: bool,
    frame_size: usize,
) -> Vec<Frame> {
    let frame_size = frame_size.max(1);
    if payload.len() <= frame_size {
        return vec![Frame::data(opcode, true, masked, payload)];
    }

    let chunks: Vec<&[u8]> = payload.chunks(frame_size).collect();
    let last = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let op = if i == 0 { opcode } else { Opcode::Continuation };
            Frame::data(op, i == last, masked, chunk)
        })
        .collect()
}
