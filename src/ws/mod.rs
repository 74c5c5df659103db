//! WebSocket protocol layer: upgrade handshake and frame channel.

pub mod connection;
pub mod frame;
pub mod handshake;

pub use connection::{HandshakeDecision, Message, WsConnection, WsState};
pub use frame::{apply_mask, CloseCode, Frame, FrameCodec, FrameError, Opcode, WsRole};
pub use handshake::{
    compute_accept_key, contains_token, generate_client_key, ClientHandshake, HandshakeError,
    HttpHead, UpgradeRequest, WsUrl,
};

/// Magic GUID concatenated with the client key to prove the handshake
/// (RFC 6455 §1.3).
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only protocol version this crate speaks.
pub const VERSION: &str = "13";

/// `Sec-WebSocket-Key` header name.
pub const HDR_KEY: &str = "Sec-WebSocket-Key";
/// `Sec-WebSocket-Accept` header name.
pub const HDR_ACCEPT: &str = "Sec-WebSocket-Accept";
/// `Sec-WebSocket-Protocol` header name.
pub const HDR_PROTOCOL: &str = "Sec-WebSocket-Protocol";
/// `Sec-WebSocket-Extensions` header name.
pub const HDR_EXTENSIONS: &str = "Sec-WebSocket-Extensions";
/// `Sec-WebSocket-Version` header name.
pub const HDR_VERSION: &str = "Sec-WebSocket-Version";
