//! WebSocket frame codec (RFC 6455 §5).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! | Masking-key, if MASK set to 1 |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! The decoder is an incremental state machine: feed it a growing
//! [`BytesMut`] and it yields one frame at a time, or `None` until enough
//! bytes arrive. Masking direction is enforced by [`WsRole`]: frames from a
//! client must be masked, frames from a server must not be.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Frame opcode (4 bits on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// UTF-8 text message.
    Text = 0x1,
    /// Binary message.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl Opcode {
    /// True for Close/Ping/Pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Parses the 4-bit opcode field, rejecting reserved values.
    pub const fn from_wire(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(FrameError::ReservedOpcode(other)),
        }
    }
}

/// Which end of the connection this codec speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRole {
    /// Masks outbound frames; rejects masked inbound frames.
    Client,
    /// Sends unmasked; requires inbound frames to be masked.
    Server,
}

/// A single parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// A final text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    /// A final binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    /// A ping frame echoing `payload`.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    /// A pong frame echoing `payload`.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// A close frame carrying an optional status code and reason.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut buf = BytesMut::with_capacity(2 + reason.len());
                buf.put_u16(code);
                buf.put_slice(reason.as_bytes());
                buf.freeze()
            }
            None => Bytes::new(),
        };
        Self {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }

    /// Parses a close frame payload into `(code, reason)`.
    pub fn close_body(&self) -> Result<(Option<u16>, String), FrameError> {
        match self.payload.len() {
            0 => Ok((None, String::new())),
            1 => Err(FrameError::BadClosePayload),
            _ => {
                let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
                let reason = std::str::from_utf8(&self.payload[2..])
                    .map_err(|_| FrameError::BadClosePayload)?
                    .to_owned();
                Ok((Some(code), reason))
            }
        }
    }
}

/// Close status codes defined by RFC 6455 §7.4.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure.
    Normal = 1000,
    /// Endpoint going away.
    GoingAway = 1001,
    /// Protocol error.
    ProtocolError = 1002,
    /// Data type not acceptable.
    Unsupported = 1003,
    /// Invalid payload data.
    InvalidPayload = 1007,
    /// Policy violation.
    PolicyViolation = 1008,
    /// Message too big.
    MessageTooBig = 1009,
    /// Internal server error.
    InternalError = 1011,
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code as Self
    }
}

/// Frame-level protocol violations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Opcode value reserved by the RFC.
    ReservedOpcode(u8),
    /// RSV bits set without a negotiated extension.
    ReservedBitsSet,
    /// Control frame payload over 125 bytes.
    ControlTooLarge(usize),
    /// Control frame without FIN.
    FragmentedControl,
    /// Inbound client frame without the mask bit.
    UnmaskedClientFrame,
    /// Inbound server frame with the mask bit.
    MaskedServerFrame,
    /// Payload larger than the configured cap.
    PayloadTooLarge {
        /// Announced payload size.
        size: u64,
        /// Configured cap.
        max: usize,
    },
    /// Close payload of one byte, or a non-UTF-8 reason.
    BadClosePayload,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedOpcode(op) => write!(f, "reserved opcode 0x{op:X}"),
            Self::ReservedBitsSet => write!(f, "reserved bits set without extension"),
            Self::ControlTooLarge(size) => {
                write!(f, "control frame payload of {size} bytes exceeds 125")
            }
            Self::FragmentedControl => write!(f, "control frame must not be fragmented"),
            Self::UnmaskedClientFrame => write!(f, "client frame must be masked"),
            Self::MaskedServerFrame => write!(f, "server frame must not be masked"),
            Self::PayloadTooLarge { size, max } => {
                write!(f, "payload of {size} bytes exceeds cap of {max}")
            }
            Self::BadClosePayload => write!(f, "malformed close frame payload"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Partially decoded header carried between decoder states.
#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    fin: bool,
    opcode: Opcode,
    masked: bool,
}

#[derive(Debug)]
enum DecodeState {
    /// Waiting for the two fixed header bytes.
    Header,
    /// Waiting for a 2- or 8-byte extended length.
    Length { header: PendingHeader, width: usize },
    /// Waiting for the 4-byte masking key.
    MaskKey { header: PendingHeader, len: u64 },
    /// Waiting for the payload.
    Payload {
        header: PendingHeader,
        mask_key: Option<[u8; 4]>,
        len: u64,
    },
}

/// Incremental frame decoder and encoder for one connection.
#[derive(Debug)]
pub struct FrameCodec {
    role: WsRole,
    max_payload: usize,
    state: DecodeState,
}

impl FrameCodec {
    /// Default payload cap: 16 MiB.
    pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

    /// Creates a codec for the given role.
    #[must_use]
    pub fn new(role: WsRole) -> Self {
        Self {
            role,
            max_payload: Self::DEFAULT_MAX_PAYLOAD,
            state: DecodeState::Header,
        }
    }

    /// Sets the maximum accepted payload size.
    #[must_use]
    pub fn max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Decodes one frame from `src`, consuming its bytes.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered. After an
    /// error the stream position is undefined; the connection must be torn
    /// down, which is what the connection layer does.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let b0 = src[0];
                    let b1 = src[1];

                    if b0 & 0x70 != 0 {
                        return Err(FrameError::ReservedBitsSet);
                    }
                    let header = PendingHeader {
                        fin: b0 & 0x80 != 0,
                        opcode: Opcode::from_wire(b0 & 0x0F)?,
                        masked: b1 & 0x80 != 0,
                    };

                    // Masking direction is fixed by role.
                    match self.role {
                        WsRole::Server if !header.masked => {
                            return Err(FrameError::UnmaskedClientFrame)
                        }
                        WsRole::Client if header.masked => {
                            return Err(FrameError::MaskedServerFrame)
                        }
                        _ => {}
                    }

                    let len7 = b1 & 0x7F;
                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(FrameError::FragmentedControl);
                        }
                        if len7 > 125 {
                            return Err(FrameError::ControlTooLarge(len7 as usize));
                        }
                    }

                    src.advance(2);
                    self.state = match len7 {
                        126 => DecodeState::Length { header, width: 2 },
                        127 => DecodeState::Length { header, width: 8 },
                        n => self.after_length(header, u64::from(n))?,
                    };
                }

                DecodeState::Length { header, width } => {
                    if src.len() < width {
                        return Ok(None);
                    }
                    let len = if width == 2 {
                        u64::from(src.get_u16())
                    } else {
                        src.get_u64()
                    };
                    self.state = self.after_length(header, len)?;
                }

                DecodeState::MaskKey { header, len } => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let mut mask_key = [0u8; 4];
                    mask_key.copy_from_slice(&src.split_to(4));
                    self.state = DecodeState::Payload {
                        header,
                        mask_key: Some(mask_key),
                        len,
                    };
                }

                DecodeState::Payload {
                    header,
                    mask_key,
                    len,
                } => {
                    let len = len as usize;
                    if src.len() < len {
                        return Ok(None);
                    }
                    let mut payload = src.split_to(len);
                    if let Some(key) = mask_key {
                        apply_mask(&mut payload, key);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(Frame {
                        fin: header.fin,
                        opcode: header.opcode,
                        payload: payload.freeze(),
                    }));
                }
            }
        }
    }

    /// Picks the state following the length field, enforcing the cap.
    fn after_length(&self, header: PendingHeader, len: u64) -> Result<DecodeState, FrameError> {
        if len > self.max_payload as u64 {
            return Err(FrameError::PayloadTooLarge {
                size: len,
                max: self.max_payload,
            });
        }
        Ok(if header.masked {
            DecodeState::MaskKey { header, len }
        } else {
            DecodeState::Payload {
                header,
                mask_key: None,
                len,
            }
        })
    }

    /// Encodes `frame` into `dst`. Client codecs mask with a fresh random
    /// key per frame; server codecs send in the clear.
    pub fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = frame.payload.len();
        if frame.opcode.is_control() {
            if !frame.fin {
                return Err(FrameError::FragmentedControl);
            }
            if len > 125 {
                return Err(FrameError::ControlTooLarge(len));
            }
        }

        let mask = match self.role {
            WsRole::Client => Some(fresh_mask_key()),
            WsRole::Server => None,
        };
        let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

        dst.reserve(2 + 8 + 4 + len);
        let first = u8::from(frame.fin) << 7 | frame.opcode as u8;
        dst.put_u8(first);
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= usize::from(u16::MAX) {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        match mask {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&frame.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&frame.payload),
        }
        Ok(())
    }
}

/// XORs `buf` with the 4-byte key; applying twice restores the input.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Per-frame masking key from the OS RNG (RFC 6455 §5.3 requires fresh
/// entropy per frame).
fn fresh_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key).expect("OS RNG unavailable");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_classification() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
    }

    #[test]
    fn reserved_opcodes_rejected() {
        for raw in [0x3, 0x4, 0x7, 0xB, 0xF] {
            assert_eq!(Opcode::from_wire(raw), Err(FrameError::ReservedOpcode(raw)));
        }
    }

    #[test]
    fn mask_roundtrip() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, key);
        assert_ne!(&data, b"Hello");
        apply_mask(&mut data, key);
        assert_eq!(&data, b"Hello");
    }

    #[test]
    fn client_to_server_roundtrip() {
        let mut client = FrameCodec::new(WsRole::Client);
        let mut server = FrameCodec::new(WsRole::Server);

        let mut wire = BytesMut::new();
        client.encode(&Frame::text("Hello"), &mut wire).unwrap();
        // Client frames carry the mask bit.
        assert_ne!(wire[1] & 0x80, 0);

        let frame = server.decode(&mut wire).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert!(wire.is_empty());
    }

    #[test]
    fn server_to_client_is_unmasked() {
        let mut server = FrameCodec::new(WsRole::Server);
        let mut client = FrameCodec::new(WsRole::Client);

        let mut wire = BytesMut::new();
        server.encode(&Frame::text("hi"), &mut wire).unwrap();
        assert_eq!(wire[1] & 0x80, 0);

        let frame = client.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"hi");
    }

    #[test]
    fn server_rejects_unmasked_frame() {
        let mut server = FrameCodec::new(WsRole::Server);
        // Text "hi" without a mask bit.
        let mut wire = BytesMut::from(&[0x81u8, 0x02, b'h', b'i'][..]);
        assert_eq!(
            server.decode(&mut wire),
            Err(FrameError::UnmaskedClientFrame)
        );
    }

    #[test]
    fn client_rejects_masked_frame() {
        let mut client = FrameCodec::new(WsRole::Client);
        let mut wire = BytesMut::from(&[0x81u8, 0x82, 1, 2, 3, 4, 0, 0][..]);
        assert_eq!(client.decode(&mut wire), Err(FrameError::MaskedServerFrame));
    }

    #[test]
    fn reserved_bits_rejected() {
        let mut client = FrameCodec::new(WsRole::Client);
        let mut wire = BytesMut::from(&[0xC1u8, 0x00][..]); // RSV1 set
        assert_eq!(client.decode(&mut wire), Err(FrameError::ReservedBitsSet));
    }

    #[test]
    fn fragmented_control_rejected() {
        let mut client = FrameCodec::new(WsRole::Client);
        let mut wire = BytesMut::from(&[0x09u8, 0x00][..]); // ping without FIN
        assert_eq!(client.decode(&mut wire), Err(FrameError::FragmentedControl));

        let mut codec = FrameCodec::new(WsRole::Server);
        let mut ping = Frame::ping("x");
        ping.fin = false;
        let mut out = BytesMut::new();
        assert_eq!(
            codec.encode(&ping, &mut out),
            Err(FrameError::FragmentedControl)
        );
    }

    #[test]
    fn oversized_control_rejected() {
        let mut codec = FrameCodec::new(WsRole::Server);
        let ping = Frame::ping(Bytes::from(vec![0u8; 126]));
        let mut out = BytesMut::new();
        assert_eq!(
            codec.encode(&ping, &mut out),
            Err(FrameError::ControlTooLarge(126))
        );
    }

    #[test]
    fn extended_length_16bit() {
        let mut server = FrameCodec::new(WsRole::Server);
        let mut client = FrameCodec::new(WsRole::Client);
        let payload = Bytes::from(vec![0xAB; 300]);

        let mut wire = BytesMut::new();
        server
            .encode(&Frame::binary(payload.clone()), &mut wire)
            .unwrap();
        assert_eq!(wire[1] & 0x7F, 126);

        let frame = client.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn extended_length_64bit() {
        let mut server = FrameCodec::new(WsRole::Server);
        let mut client = FrameCodec::new(WsRole::Client);
        let payload = Bytes::from(vec![0x5A; 70_000]);

        let mut wire = BytesMut::new();
        server
            .encode(&Frame::binary(payload.clone()), &mut wire)
            .unwrap();
        assert_eq!(wire[1] & 0x7F, 127);

        let frame = client.decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
    }

    #[test]
    fn partial_input_yields_none() {
        let mut client = FrameCodec::new(WsRole::Client);
        let mut server = FrameCodec::new(WsRole::Server);
        let mut wire = BytesMut::new();
        client
            .encode(&Frame::text("fragmented arrival"), &mut wire)
            .unwrap();

        let mut first = wire.split_to(5);
        assert!(server.decode(&mut first).unwrap().is_none());
        first.unsplit(wire);
        let frame = server.decode(&mut first).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"fragmented arrival");
    }

    #[test]
    fn payload_cap_enforced() {
        let mut server = FrameCodec::new(WsRole::Server).max_payload(64);
        let mut wire = BytesMut::new();
        // Client header announcing 200 bytes, masked.
        wire.put_u8(0x82);
        wire.put_u8(0x80 | 126);
        wire.put_u16(200);
        assert!(matches!(
            server.decode(&mut wire),
            Err(FrameError::PayloadTooLarge { size: 200, .. })
        ));
    }

    #[test]
    fn close_body_parsing() {
        let frame = Frame::close(Some(1000), "done");
        let (code, reason) = frame.close_body().unwrap();
        assert_eq!(code, Some(1000));
        assert_eq!(reason, "done");

        let empty = Frame::close(None, "");
        assert_eq!(empty.close_body().unwrap(), (None, String::new()));

        let mut bad = Frame::close(None, "");
        bad.payload = Bytes::from_static(&[0x03]);
        assert_eq!(bad.close_body(), Err(FrameError::BadClosePayload));
    }

    #[test]
    fn fresh_mask_key_varies_per_frame() {
        let mut client = FrameCodec::new(WsRole::Client);
        let mut a = BytesMut::new();
        let mut b = BytesMut::new();
        client.encode(&Frame::text("same"), &mut a).unwrap();
        client.encode(&Frame::text("same"), &mut b).unwrap();
        // Identical plaintext, different key, different wire bytes.
        assert_ne!(a[2..6], b[2..6]);
    }
}
