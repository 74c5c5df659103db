//! rustls-backed TLS engine.

use super::{HandshakeStatus, TlsEngine, Transport};
use crate::error::{Error, ErrorCode, Result};
use crate::tracing_compat::debug;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use std::io::{self, IoSlice, Write};
use std::sync::Arc;

/// TLS session driven by rustls over a nonblocking transport.
///
/// The engine shuttles TLS records between the rustls connection and the
/// socket; `WouldBlock` from the transport pauses the exchange until the
/// next readiness event.
pub struct RustlsEngine {
    conn: Connection,
    failed: bool,
}

impl RustlsEngine {
    /// Creates a client session targeting `server_name`.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string()).map_err(|e| {
            Error::new(ErrorCode::InvalidParam)
                .with_context(format!("invalid TLS server name {server_name:?}"))
                .with_source(e)
        })?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| Error::new(ErrorCode::TlsFailed).with_source(e))?;
        Ok(Self {
            conn: Connection::Client(conn),
            failed: false,
        })
    }

    /// Creates a server session for an accepted connection.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self> {
        let conn = ServerConnection::new(config)
            .map_err(|e| Error::new(ErrorCode::TlsFailed).with_source(e))?;
        Ok(Self {
            conn: Connection::Server(conn),
            failed: false,
        })
    }

    /// Writes buffered records out; stops at would-block.
    fn write_records(&mut self, io: &mut dyn Transport) -> io::Result<bool> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut io_adapter(io)) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport closed while flushing TLS records",
                    ))
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Pulls records in and decrypts; true if progress was made.
    fn read_records(&mut self, io: &mut dyn Transport) -> io::Result<bool> {
        match self.conn.read_tls(&mut io_adapter(io)) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => {
                self.conn.process_new_packets().map_err(|e| {
                    self.failed = true;
                    io::Error::new(io::ErrorKind::InvalidData, e)
                })?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn io_adapter(io: &mut dyn Transport) -> impl io::Read + io::Write + '_ {
    struct Adapter<'a>(&'a mut dyn Transport);
    impl io::Read for Adapter<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }
    impl io::Write for Adapter<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.0.flush()
        }
    }
    Adapter(io)
}

impl TlsEngine for RustlsEngine {
    fn handshake(&mut self, io: &mut dyn Transport) -> Result<HandshakeStatus> {
        if self.failed {
            return Err(Error::new(ErrorCode::TlsFailed).with_context("handshake already failed"));
        }
        loop {
            // Flush anything the last step produced before reading more.
            match self.write_records(io) {
                Ok(true) => {}
                Ok(false) => {
                    if self.conn.is_handshaking() {
                        return Ok(HandshakeStatus::InProgress);
                    }
                }
                Err(e) => {
                    self.failed = true;
                    return Err(Error::new(ErrorCode::TlsFailed).with_source(e));
                }
            }
            if !self.conn.is_handshaking() {
                debug!("tls handshake complete");
                return Ok(HandshakeStatus::Complete);
            }
            match self.read_records(io) {
                Ok(true) => {}
                Ok(false) => return Ok(HandshakeStatus::InProgress),
                Err(e) => {
                    self.failed = true;
                    return Err(Error::new(ErrorCode::TlsFailed).with_source(e));
                }
            }
        }
    }

    fn is_handshaking(&self) -> bool {
        !self.failed && self.conn.is_handshaking()
    }

    fn read(&mut self, io: &mut dyn Transport, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match io::Read::read(&mut self.conn.reader(), buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; try to pull more records.
                    match self.read_records(io) {
                        Ok(true) => continue,
                        Ok(false) => return Err(io::ErrorKind::WouldBlock.into()),
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    fn write(&mut self, io: &mut dyn Transport, buf: &[u8]) -> io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        // Best effort: leftover records flush on the next write-readiness.
        let _ = self.write_records(io)?;
        Ok(n)
    }

    fn write_vectored(
        &mut self,
        io: &mut dyn Transport,
        bufs: &[IoSlice<'_>],
    ) -> io::Result<usize> {
        let n = self.conn.writer().write_vectored(bufs)?;
        let _ = self.write_records(io)?;
        Ok(n)
    }

    fn wants_write(&self) -> bool {
        self.conn.wants_write()
    }

    fn flush(&mut self, io: &mut dyn Transport) -> io::Result<()> {
        self.write_records(io).map(|_| ())
    }

    fn close(&mut self, io: &mut dyn Transport) {
        self.conn.send_close_notify();
        let _ = self.write_records(io);
    }
}

impl std::fmt::Debug for RustlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}
