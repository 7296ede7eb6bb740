//! WebSocket frame codec.
//!
//! ```text
//! Byte 0:      [FIN:1][RSV:3][Opcode:4]
//! Byte 1:      [MASK:1][Len:7]        Len 0-125 literal, 126 => u16, 127 => u64
//! Bytes 2..:   extended length (0, 2 or 8 bytes, big-endian)
//!              mask key (4 bytes, present when MASK is set)
//!              payload (XOR-ed with the mask key when masked)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

const FIN_BIT: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_MASK: u8 = 0x0F;
const LENGTH_MASK: u8 = 0x7F;
const LENGTH_MARKER_U16: u8 = 126;
const LENGTH_MARKER_U64: u8 = 127;

/// Largest payload that fits the 7-bit length field. Also the control frame limit.
pub const MAX_SMALL_PAYLOAD: usize = 125;
/// Largest header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub const MAX_HEADER_SIZE: usize = 14;
/// Default ceiling for a single frame or a reassembled message.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

impl TryFrom<u8> for OpCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// A complete frame. Fragmented data messages are delivered reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(OpCode::Text, Bytes::from(text.into()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data)
    }

    /// Close frame with a status code and a reason truncated to fit a control frame.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut buf = BytesMut::with_capacity(2 + reason.len());
        buf.put_u16(code);
        let mut end = reason.len().min(MAX_SMALL_PAYLOAD - 2);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        buf.put_slice(&reason.as_bytes()[..end]);
        Self::new(OpCode::Close, buf.freeze())
    }

    /// Status code carried in the first two bytes of a close frame.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    pub fn close_reason(&self) -> Option<&str> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        std::str::from_utf8(&self.payload[2..]).ok()
    }

    pub fn as_text(&self) -> Option<&str> {
        match self.opcode {
            OpCode::Text | OpCode::Binary => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({:?}, {} bytes)", self.opcode, self.payload.len())
    }
}

/// Which side of the connection this codec speaks for. Clients mask every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown opcode: {0:#x}")]
    UnknownOpcode(u8),
    #[error("payload too large: declared {declared}, max {max}")]
    TooLarge { declared: u64, max: usize },
}

#[derive(Debug, Clone, Copy)]
struct FrameHeader {
    fin: bool,
    opcode: u8,
    mask: Option<[u8; 4]>,
    payload_len: u64,
    header_len: usize,
}

/// Parse a header without consuming it. `None` means more bytes are needed.
fn peek_header(src: &[u8]) -> Option<FrameHeader> {
    let mut cur = src;
    if cur.remaining() < 2 {
        return None;
    }
    let byte0 = cur.get_u8();
    let byte1 = cur.get_u8();

    let payload_len = match byte1 & LENGTH_MASK {
        LENGTH_MARKER_U16 => {
            if cur.remaining() < 2 {
                return None;
            }
            cur.get_u16() as u64
        }
        LENGTH_MARKER_U64 => {
            if cur.remaining() < 8 {
                return None;
            }
            cur.get_u64()
        }
        n => n as u64,
    };

    let mask = if byte1 & MASK_BIT != 0 {
        if cur.remaining() < 4 {
            return None;
        }
        let mut key = [0u8; 4];
        cur.copy_to_slice(&mut key);
        Some(key)
    } else {
        None
    };

    Some(FrameHeader {
        fin: byte0 & FIN_BIT != 0,
        opcode: byte0 & OPCODE_MASK,
        mask,
        payload_len,
        header_len: src.len() - cur.remaining(),
    })
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Incremental encoder/decoder for WebSocket frames.
///
/// Decoding never fails on bad input: malformed frames are logged and
/// dropped, and decoding resumes at the next frame boundary.
pub struct FrameCodec {
    role: Role,
    max_payload: usize,
    /// Bytes of an oversized frame still to discard.
    skip_remaining: u64,
    /// Opcode and accumulated payload of a fragmented message.
    fragments: Option<(OpCode, BytesMut)>,
    /// Buffer backing [`FrameCodec::feed`].
    pending: BytesMut,
}

impl FrameCodec {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            max_payload: DEFAULT_MAX_PAYLOAD,
            skip_remaining: 0,
            fragments: None,
            pending: BytesMut::new(),
        }
    }

    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Encode one final frame into a fresh buffer.
    pub fn encode(&self, payload: &[u8], opcode: OpCode) -> Bytes {
        let mut dst = BytesMut::with_capacity(payload.len() + MAX_HEADER_SIZE);
        self.encode_into(opcode, payload, &mut dst);
        dst.freeze()
    }

    /// Feed raw socket bytes and collect every frame completed by them.
    /// Trailing partial data stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut pending = std::mem::take(&mut self.pending);
        pending.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            match self.decode(&mut pending) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("frame decode failed: {e}");
                    pending.clear();
                    break;
                }
            }
        }
        self.pending = pending;
        frames
    }

    fn encode_into(&self, opcode: OpCode, payload: &[u8], dst: &mut BytesMut) {
        dst.reserve(payload.len() + MAX_HEADER_SIZE);
        dst.put_u8(FIN_BIT | opcode as u8);

        let mask_bit = match self.role {
            Role::Client => MASK_BIT,
            Role::Server => 0,
        };
        match payload.len() {
            n if n <= MAX_SMALL_PAYLOAD => dst.put_u8(mask_bit | n as u8),
            n if n <= u16::MAX as usize => {
                dst.put_u8(mask_bit | LENGTH_MARKER_U16);
                dst.put_u16(n as u16);
            }
            n => {
                dst.put_u8(mask_bit | LENGTH_MARKER_U64);
                dst.put_u64(n as u64);
            }
        }

        match self.role {
            Role::Client => {
                let key: [u8; 4] = rand::random();
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(payload);
                apply_mask(&mut dst[start..], key);
            }
            Role::Server => dst.put_slice(payload),
        }
    }

    /// Discard bytes of an oversized frame. Returns true once nothing is left to skip.
    fn drain_skipped(&mut self, src: &mut BytesMut) -> bool {
        if self.skip_remaining == 0 {
            return true;
        }
        let n = self.skip_remaining.min(src.len() as u64) as usize;
        src.advance(n);
        self.skip_remaining -= n as u64;
        self.skip_remaining == 0
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            if !self.drain_skipped(src) {
                return Ok(None);
            }

            let Some(header) = peek_header(src) else {
                return Ok(None);
            };

            if header.payload_len > self.max_payload as u64 {
                tracing::error!(
                    declared = header.payload_len,
                    max = self.max_payload,
                    "dropping oversized frame"
                );
                src.advance(header.header_len);
                self.skip_remaining = header.payload_len;
                continue;
            }

            let payload_len = header.payload_len as usize;
            let total = header.header_len + payload_len;
            if src.len() < total {
                src.reserve(total - src.len());
                return Ok(None);
            }

            src.advance(header.header_len);
            let mut payload = src.split_to(payload_len);
            if let Some(key) = header.mask {
                apply_mask(&mut payload, key);
            }

            let opcode = match OpCode::try_from(header.opcode) {
                Ok(op) => op,
                Err(e) => {
                    tracing::error!("dropping frame: {e}");
                    continue;
                }
            };

            if opcode.is_control() {
                if !header.fin || payload.len() > MAX_SMALL_PAYLOAD {
                    tracing::error!(?opcode, len = payload.len(), "dropping malformed control frame");
                    continue;
                }
                return Ok(Some(Frame::new(opcode, payload.freeze())));
            }

            match (opcode, header.fin) {
                (OpCode::Continuation, fin) => {
                    let Some((first_opcode, mut message)) = self.fragments.take() else {
                        tracing::error!("dropping continuation frame with no message in progress");
                        continue;
                    };
                    if message.len() + payload.len() > self.max_payload {
                        tracing::error!(
                            len = message.len() + payload.len(),
                            max = self.max_payload,
                            "dropping oversized fragmented message"
                        );
                        continue;
                    }
                    message.extend_from_slice(&payload);
                    if fin {
                        return Ok(Some(Frame::new(first_opcode, message.freeze())));
                    }
                    self.fragments = Some((first_opcode, message));
                }
                (op, true) => {
                    if self.fragments.take().is_some() {
                        tracing::warn!("new message interrupted a fragmented one; partial data discarded");
                    }
                    return Ok(Some(Frame::new(op, payload.freeze())));
                }
                (op, false) => {
                    if self.fragments.is_some() {
                        tracing::warn!("new fragmented message interrupted a previous one");
                    }
                    self.fragments = Some((op, payload));
                }
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.opcode.is_control() && frame.payload.len() > MAX_SMALL_PAYLOAD {
            return Err(FrameError::TooLarge {
                declared: frame.payload.len() as u64,
                max: MAX_SMALL_PAYLOAD,
            });
        }
        self.encode_into(frame.opcode, &frame.payload, dst);
        Ok(())
    }
}
