//! TLS engine interface and the rustls-backed implementation.
//!
//! The transport never sees TLS details: it routes its byte-stream
//! operations through a [`TlsEngine`] when the socket was opened with the
//! TLS flag. The engine owns the handshake state machine; the socket calls
//! [`TlsEngine::handshake`] on every readiness event until it reports
//! [`HandshakeStatus::Complete`].
//!
//! Built without the `tls` feature, the engine factories return
//! [`ErrorCode::Unsupported`] and everything else compiles away.

#[cfg(feature = "tls")]
mod rustls_engine;

#[cfg(feature = "tls")]
pub use rustls_engine::RustlsEngine;

use crate::error::{Error, ErrorCode, Result};
use std::io::{self, IoSlice, Read, Write};

/// Byte transport the engine performs record I/O on.
///
/// Blanket-implemented for anything readable and writable; the TCP layer
/// passes `&mut &TcpStream`.
pub trait Transport: Read + Write {}

impl<T: Read + Write> Transport for T {}

/// Handshake progress as seen by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More readiness events are needed.
    InProgress,
    /// The session is established; application data may flow.
    Complete,
}

/// Which side of the handshake this engine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    /// Initiates the handshake after TCP connect.
    Client,
    /// Responds to a handshake on an accepted descriptor.
    Server,
}

/// A TLS session bound to one socket.
///
/// Read/write semantics follow the plain socket: `Ok(0)` from
/// [`read`](Self::read) means the peer closed the session, `WouldBlock`
/// means retry on the next readiness event, and partial writes are normal.
pub trait TlsEngine {
    /// Drives the handshake one step; call on every readiness event until
    /// it returns [`HandshakeStatus::Complete`].
    fn handshake(&mut self, io: &mut dyn Transport) -> Result<HandshakeStatus>;

    /// True while the handshake has not completed.
    fn is_handshaking(&self) -> bool;

    /// Reads decrypted application data.
    fn read(&mut self, io: &mut dyn Transport, buf: &mut [u8]) -> io::Result<usize>;

    /// Encrypts and writes application data, returning bytes accepted.
    fn write(&mut self, io: &mut dyn Transport, buf: &[u8]) -> io::Result<usize>;

    /// Vectored variant of [`write`](Self::write).
    fn write_vectored(&mut self, io: &mut dyn Transport, bufs: &[IoSlice<'_>])
        -> io::Result<usize>;

    /// True if encrypted records are buffered and waiting for writability.
    fn wants_write(&self) -> bool;

    /// Flushes buffered records; called on write-readiness.
    fn flush(&mut self, io: &mut dyn Transport) -> io::Result<()>;

    /// Sends close-notify on a best-effort basis.
    fn close(&mut self, io: &mut dyn Transport);
}

/// Per-socket TLS configuration.
///
/// Carried by every socket; empty (and free) unless the `tls` feature is
/// enabled and the user installs a config.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Client-side session configuration.
    #[cfg(feature = "tls")]
    pub client_config: Option<std::sync::Arc<rustls::ClientConfig>>,
    /// Server-side session configuration.
    #[cfg(feature = "tls")]
    pub server_config: Option<std::sync::Arc<rustls::ServerConfig>>,
}

impl std::fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsOptions").finish_non_exhaustive()
    }
}

/// True when the crate was built with a TLS engine.
#[must_use]
pub const fn is_available() -> bool {
    cfg!(feature = "tls")
}

/// Creates a client engine for `server_name`.
#[cfg(feature = "tls")]
pub(crate) fn client_engine(
    options: &TlsOptions,
    server_name: &str,
) -> Result<Box<dyn TlsEngine>> {
    let config = options
        .client_config
        .clone()
        .ok_or_else(|| Error::new(ErrorCode::InvalidParam).with_context("no client TLS config"))?;
    Ok(Box::new(RustlsEngine::client(config, server_name)?))
}

/// Creates a server engine for an accepted descriptor.
#[cfg(feature = "tls")]
pub(crate) fn server_engine(options: &TlsOptions) -> Result<Box<dyn TlsEngine>> {
    let config = options
        .server_config
        .clone()
        .ok_or_else(|| Error::new(ErrorCode::InvalidParam).with_context("no server TLS config"))?;
    Ok(Box::new(RustlsEngine::server(config)?))
}

/// Stub factory: TLS was not compiled in.
#[cfg(not(feature = "tls"))]
pub(crate) fn client_engine(
    _options: &TlsOptions,
    _server_name: &str,
) -> Result<Box<dyn TlsEngine>> {
    Err(Error::new(ErrorCode::Unsupported).with_context("built without the tls feature"))
}

/// Stub factory: TLS was not compiled in.
#[cfg(not(feature = "tls"))]
pub(crate) fn server_engine(_options: &TlsOptions) -> Result<Box<dyn TlsEngine>> {
    Err(Error::new(ErrorCode::Unsupported).with_context("built without the tls feature"))
}
