//! Callback-driven HTTP/1.1 stream over a [`TcpSocket`].
//!
//! This is the thin HTTP layer an upgrade protocol needs and nothing more:
//! it emits one request or response head, parses the peer's head, and from
//! then on passes bytes through untouched. Everything after the blank line
//! (including bytes that arrived in the same read as the head) flows to the
//! data callback raw, which is exactly what a WebSocket connection wants.
//!
//! Outbound data is buffered: a send that would block parks the remainder
//! in an internal queue, write-readiness drains it, and the write-ready
//! callback fires once the queue is empty again.

use super::head::HttpHead;
use crate::error::{Error, ErrorCode, Result};
use crate::event_loop::EventLoop;
use crate::net::{SocketFlags, TcpSocket};
use crate::tls::TlsOptions;
use crate::tracing_compat::{debug, warn};
use bytes::{Buf, Bytes, BytesMut};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::IoSlice;
use std::net;
use std::rc::Rc;
use std::time::Duration;

const READ_CHUNK: usize = 8 * 1024;

type HeadCallback = Box<dyn FnMut(&HttpHead)>;
type DataCallback = Box<dyn FnMut(&mut BytesMut)>;
type WriteCallback = Box<dyn FnMut()>;
type ErrorCallback = Box<dyn FnMut(Error)>;

struct H1Core {
    ev: EventLoop,
    sock: Option<TcpSocket>,
    server: bool,
    connect_timeout: Option<Duration>,
    tls_options: TlsOptions,
    /// Deferred request line, emitted once the transport connects.
    pending_head: Option<String>,
    outgoing_headers: Vec<(String, String)>,
    head_parsed: bool,
    recv_buf: BytesMut,
    send_queue: VecDeque<Bytes>,
    cb_head: Option<HeadCallback>,
    cb_data: Option<DataCallback>,
    cb_write_ready: Option<WriteCallback>,
    cb_error: Option<ErrorCallback>,
    error_fired: bool,
}

impl H1Core {
    fn emit_outgoing_head(&mut self, start_line: &str) -> Bytes {
        let mut head = String::with_capacity(start_line.len() + 2 + self.outgoing_headers.len() * 32);
        head.push_str(start_line);
        head.push_str("\r\n");
        for (name, value) in self.outgoing_headers.drain(..) {
            head.push_str(&name);
            head.push_str(": ");
            head.push_str(&value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        Bytes::from(head.into_bytes())
    }
}

/// An HTTP/1.1 stream that parses one message head, then hands the raw
/// byte stream to its owner.
pub struct H1Stream {
    core: Rc<RefCell<H1Core>>,
}

impl H1Stream {
    fn new(ev: &EventLoop, server: bool) -> Self {
        Self {
            core: Rc::new(RefCell::new(H1Core {
                ev: ev.clone(),
                sock: None,
                server,
                connect_timeout: None,
                tls_options: TlsOptions::default(),
                pending_head: None,
                outgoing_headers: Vec::new(),
                head_parsed: false,
                recv_buf: BytesMut::new(),
                send_queue: VecDeque::new(),
                cb_head: None,
                cb_data: None,
                cb_write_ready: None,
                cb_error: None,
                error_fired: false,
            })),
        }
    }

    /// Creates a client stream (sends a request, parses a response).
    #[must_use]
    pub fn client(ev: &EventLoop) -> Self {
        Self::new(ev, false)
    }

    /// Creates a server stream (parses a request, sends a response).
    #[must_use]
    pub fn server(ev: &EventLoop) -> Self {
        Self::new(ev, true)
    }

    /// True for the server side.
    #[must_use]
    pub fn is_server(&self) -> bool {
        self.core.borrow().server
    }

    /// True when the transport accepts application data.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core
            .borrow()
            .sock
            .as_ref()
            .map_or(false, TcpSocket::is_ready)
    }

    /// True when nothing is parked in the outbound queue.
    #[must_use]
    pub fn can_send(&self) -> bool {
        let core = self.core.borrow();
        core.send_queue.is_empty() && core.sock.as_ref().map_or(false, TcpSocket::is_ready)
    }

    /// Bounds the transport connect started by [`send_request`](Self::send_request).
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.core.borrow_mut().connect_timeout = Some(timeout);
    }

    /// TLS configuration for an `https` request target.
    pub fn set_tls_options(&self, options: TlsOptions) {
        self.core.borrow_mut().tls_options = options;
    }

    /// Callback fired once when the peer's message head is parsed.
    pub fn set_head_callback(&self, cb: impl FnMut(&HttpHead) + 'static) {
        self.core.borrow_mut().cb_head = Some(Box::new(cb));
    }

    /// Callback fired with raw bytes following the head. The callback
    /// drains what it consumes from the buffer.
    pub fn set_data_callback(&self, cb: impl FnMut(&mut BytesMut) + 'static) {
        self.core.borrow_mut().cb_data = Some(Box::new(cb));
    }

    /// Callback fired when a parked outbound queue fully drains.
    pub fn set_write_ready_callback(&self, cb: impl FnMut() + 'static) {
        self.core.borrow_mut().cb_write_ready = Some(Box::new(cb));
    }

    /// Callback fired at most once on transport failure.
    pub fn set_error_callback(&self, cb: impl FnMut(Error) + 'static) {
        self.core.borrow_mut().cb_error = Some(Box::new(cb));
    }

    /// Queues a header for the outgoing message head.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.core
            .borrow_mut()
            .outgoing_headers
            .push((name.into(), value.into()));
    }

    /// Connects to `url` (`http` or `https` scheme) and sends the request
    /// head once the transport is up.
    pub fn send_request(&self, method: &str, url: &str) -> Result<()> {
        if self.core.borrow().server {
            return Err(Error::new(ErrorCode::InvalidState).with_context("server stream"));
        }
        let parsed = parse_http_url(url)?;

        let start_line = format!("{method} {} HTTP/1.1", parsed.path);
        let (ev, timeout, tls_options) = {
            let mut core = self.core.borrow_mut();
            core.pending_head = Some(start_line);
            (
                core.ev.clone(),
                core.connect_timeout,
                core.tls_options.clone(),
            )
        };

        let sock = TcpSocket::new(&ev);
        sock.set_tls_options(tls_options);
        self.install_socket_callbacks(&sock);
        let weak = Rc::downgrade(&self.core);
        let flags = if parsed.tls {
            SocketFlags::TLS
        } else {
            SocketFlags::NONE
        };
        sock.connect(
            &parsed.host,
            parsed.port,
            move |result| {
                let Some(core) = weak.upgrade() else { return };
                match result {
                    Ok(()) => on_connected(&core),
                    Err(err) => on_stream_error(&core, err),
                }
            },
            flags,
            timeout,
        )?;
        self.core.borrow_mut().sock = Some(sock);
        Ok(())
    }

    /// Adopts an accepted connection and starts parsing its request.
    pub fn attach_stream(&self, stream: net::TcpStream) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if core.sock.is_some() {
            return Err(Error::new(ErrorCode::InvalidState).with_context("already attached"));
        }
        let sock = TcpSocket::new(&core.ev);
        drop(core);
        self.install_socket_callbacks(&sock);
        sock.attach_stream(stream, SocketFlags::NONE)?;
        self.core.borrow_mut().sock = Some(sock);
        Ok(())
    }

    /// Sends a response head (server side).
    pub fn send_response(&self, status: u16, reason: &str) -> Result<()> {
        {
            let core = self.core.borrow();
            if !core.server {
                return Err(Error::new(ErrorCode::InvalidState).with_context("client stream"));
            }
            if core.sock.is_none() {
                return Err(Error::new(ErrorCode::InvalidState).with_context("not attached"));
            }
        }
        let head = {
            let mut core = self.core.borrow_mut();
            core.emit_outgoing_head(&format!("HTTP/1.1 {status} {reason}"))
        };
        queue_send(&self.core, head);
        Ok(())
    }

    /// Sends raw bytes after the head exchange. The whole buffer is
    /// accepted; what the kernel will not take now is parked and drained on
    /// write-readiness.
    pub fn send_data(&self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::new(ErrorCode::InvalidState).with_context("transport not open"));
        }
        queue_send(&self.core, Bytes::copy_from_slice(data));
        Ok(())
    }

    /// Vectored variant of [`send_data`](Self::send_data); segments are
    /// sent as one contiguous unit.
    pub fn send_data_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::new(ErrorCode::InvalidState).with_context("transport not open"));
        }
        let total = bufs.iter().map(|b| b.len()).sum();
        let mut joined = BytesMut::with_capacity(total);
        for buf in bufs {
            joined.extend_from_slice(buf);
        }
        queue_send(&self.core, joined.freeze());
        Ok(())
    }

    /// Tears the transport down. Idempotent; no further callbacks fire.
    pub fn close(&self) {
        let mut core = self.core.borrow_mut();
        core.error_fired = true;
        core.send_queue.clear();
        if let Some(sock) = core.sock.take() {
            sock.close();
        }
    }

    fn install_socket_callbacks(&self, sock: &TcpSocket) {
        let weak = Rc::downgrade(&self.core);
        sock.set_read_callback(move || {
            if let Some(core) = weak.upgrade() {
                on_readable(&core);
            }
        });
        let weak = Rc::downgrade(&self.core);
        sock.set_write_callback(move || {
            if let Some(core) = weak.upgrade() {
                on_writable(&core);
            }
        });
        let weak = Rc::downgrade(&self.core);
        sock.set_error_callback(move |err| {
            if let Some(core) = weak.upgrade() {
                on_stream_error(&core, err);
            }
        });
    }
}

impl Drop for H1Stream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for H1Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("H1Stream")
            .field("server", &core.server)
            .field("head_parsed", &core.head_parsed)
            .field("queued", &core.send_queue.len())
            .finish_non_exhaustive()
    }
}

struct HttpUrl {
    host: String,
    port: u16,
    path: String,
    tls: bool,
}

/// Just enough URL parsing for an outbound request target.
fn parse_http_url(url: &str) -> Result<HttpUrl> {
    let param = |msg: &str| Error::new(ErrorCode::InvalidParam).with_context(format!("{msg}: {url}"));
    let (scheme, rest) = url.split_once("://").ok_or_else(|| param("missing scheme"))?;
    let tls = match scheme {
        "http" => false,
        "https" => true,
        _ => return Err(param("unsupported scheme")),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = if let Some(end) = authority.find(']') {
        if !authority.starts_with('[') {
            return Err(param("bad IPv6 literal"));
        }
        let port = match authority[end + 1..].strip_prefix(':') {
            Some(port) => port.parse().map_err(|_| param("bad port"))?,
            None => {
                if tls {
                    443
                } else {
                    80
                }
            }
        };
        (authority[1..end].to_owned(), port)
    } else if let Some((host, port)) = authority.rsplit_once(':') {
        (
            host.to_owned(),
            port.parse().map_err(|_| param("bad port"))?,
        )
    } else {
        (authority.to_owned(), if tls { 443 } else { 80 })
    };
    if host.is_empty() {
        return Err(param("empty host"));
    }
    Ok(HttpUrl {
        host,
        port,
        path: path.to_owned(),
        tls,
    })
}

/// Client transport is up: emit the deferred request head.
fn on_connected(core_rc: &Rc<RefCell<H1Core>>) {
    let head = {
        let mut core = core_rc.borrow_mut();
        let Some(start_line) = core.pending_head.take() else {
            return;
        };
        core.emit_outgoing_head(&start_line)
    };
    debug!("transport connected, sending request head");
    queue_send(core_rc, head);
}

fn on_readable(core_rc: &Rc<RefCell<H1Core>>) {
    // Drain the socket into the receive buffer first.
    loop {
        let mut chunk = [0u8; READ_CHUNK];
        let result = {
            let core = core_rc.borrow();
            let Some(sock) = core.sock.as_ref() else { return };
            if !sock.is_ready() {
                return;
            }
            sock.recv(&mut chunk)
        };
        match result {
            Ok(0) => break,
            Ok(n) => core_rc.borrow_mut().recv_buf.extend_from_slice(&chunk[..n]),
            Err(err) => {
                // Surface buffered bytes before the failure.
                dispatch_buffered(core_rc);
                on_stream_error(core_rc, err);
                return;
            }
        }
    }
    dispatch_buffered(core_rc);
}

/// Parses the head if still pending, then forwards remaining bytes.
fn dispatch_buffered(core_rc: &Rc<RefCell<H1Core>>) {
    if !core_rc.borrow().head_parsed {
        let head = {
            let mut core = core_rc.borrow_mut();
            let Some(end) = find_head_end(&core.recv_buf) else {
                return;
            };
            let head_bytes = core.recv_buf.split_to(end);
            match HttpHead::parse(&head_bytes) {
                Ok(head) => {
                    core.head_parsed = true;
                    head
                }
                Err(err) => {
                    drop(core);
                    warn!(error = %err, "malformed message head");
                    on_stream_error(
                        core_rc,
                        Error::new(ErrorCode::ProtoError).with_context(err.to_string()),
                    );
                    return;
                }
            }
        };
        let Some(mut cb) = core_rc.borrow_mut().cb_head.take() else {
            return;
        };
        cb(&head);
        let mut core = core_rc.borrow_mut();
        if core.cb_head.is_none() {
            core.cb_head = Some(cb);
        }
    }

    // Bytes past the head flow raw; the consumer drains the buffer.
    if core_rc.borrow().recv_buf.is_empty() {
        return;
    }
    let Some(mut cb) = core_rc.borrow_mut().cb_data.take() else {
        return;
    };
    let mut buf = std::mem::take(&mut core_rc.borrow_mut().recv_buf);
    cb(&mut buf);
    let mut core = core_rc.borrow_mut();
    // Whatever the consumer left stays queued ahead of future reads.
    if !buf.is_empty() {
        buf.unsplit(std::mem::take(&mut core.recv_buf));
        core.recv_buf = buf;
    }
    if core.cb_data.is_none() {
        core.cb_data = Some(cb);
    }
}

/// Index just past the `\r\n\r\n` (or `\n\n`) terminating the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| idx + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|idx| idx + 2))
}

/// Appends to the outbound queue and pushes as much as the kernel takes.
fn queue_send(core_rc: &Rc<RefCell<H1Core>>, data: Bytes) {
    core_rc.borrow_mut().send_queue.push_back(data);
    drain_send_queue(core_rc, false);
}

fn on_writable(core_rc: &Rc<RefCell<H1Core>>) {
    drain_send_queue(core_rc, true);
}

fn drain_send_queue(core_rc: &Rc<RefCell<H1Core>>, notify_when_empty: bool) {
    loop {
        let result = {
            let mut core = core_rc.borrow_mut();
            let Some(front) = core.send_queue.front().cloned() else {
                break;
            };
            let Some(sock) = core.sock.as_ref() else { return };
            if !sock.is_ready() {
                return;
            }
            match sock.send(&front) {
                Ok(n) if n == front.len() => {
                    core.send_queue.pop_front();
                    Ok(true)
                }
                Ok(n) => {
                    // Partial write: keep the tail at the queue head. The
                    // socket already armed writable interest.
                    let front = core.send_queue.front_mut().expect("non-empty queue");
                    front.advance(n);
                    Ok(false)
                }
                Err(err) => Err(err),
            }
        };
        match result {
            Ok(true) => continue,
            Ok(false) => return,
            Err(err) => {
                on_stream_error(core_rc, err);
                return;
            }
        }
    }
    if notify_when_empty {
        let Some(mut cb) = core_rc.borrow_mut().cb_write_ready.take() else {
            return;
        };
        cb();
        let mut core = core_rc.borrow_mut();
        if core.cb_write_ready.is_none() {
            core.cb_write_ready = Some(cb);
        }
    }
}

/// Transport failure: tear down and surface once.
fn on_stream_error(core_rc: &Rc<RefCell<H1Core>>, err: Error) {
    let cb = {
        let mut core = core_rc.borrow_mut();
        if core.error_fired {
            None
        } else {
            core.error_fired = true;
            core.send_queue.clear();
            if let Some(sock) = core.sock.take() {
                sock.close();
            }
            core.cb_error.take()
        }
    };
    if let Some(mut cb) = cb {
        cb(err);
    }
}
