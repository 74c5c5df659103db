//! Nonblocking TCP socket with a callback interface.
//!
//! A [`TcpSocket`] registers itself with an [`EventLoop`] and drives the
//! state machine
//!
//! ```text
//! Idle ──bind/connect──► Connecting ──writable, SO_ERROR=0──► Open ──► Closed
//!                      │                                    │
//!                      └─writable, SO_ERROR≠0──► Closed     └─close()─► Closed
//! Idle ──attach_stream──► Open
//! ```
//!
//! All I/O is level-triggered: writable interest is armed only while a send
//! has would-blocked and parked again once the kernel accepts data, so the
//! loop never spins on an idle writable socket.
//!
//! User callbacks may close or drop the socket from inside any callback.
//! The dispatch path holds a strong reference for the duration of one event
//! and re-checks the socket's generation counter after every callback, so a
//! mid-callback teardown stops the remaining dispatch instead of touching
//! dead state.

use crate::error::{Error, ErrorCode, Result};
use crate::event_loop::{EventLoop, TimerHandle};
use crate::poll::Interest;
use crate::tls::{self, HandshakeStatus, TlsEngine, TlsOptions, TlsRole};
use crate::tracing_compat::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::cell::RefCell;
use std::io::{self, IoSlice, Read, Write};
use std::net::{self, IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

/// Option flags applied at connect/attach time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketFlags(u32);

impl SocketFlags {
    /// No options.
    pub const NONE: SocketFlags = SocketFlags(0);
    /// Wrap the byte stream in TLS.
    pub const TLS: SocketFlags = SocketFlags(0b1);

    /// Returns true if the TLS flag is set.
    #[must_use]
    pub const fn is_tls(self) -> bool {
        self.0 & Self::TLS.0 != 0
    }

    /// Combines flag sets.
    #[must_use]
    pub const fn with(self, other: SocketFlags) -> Self {
        Self(self.0 | other.0)
    }
}

/// Lifecycle state of a [`TcpSocket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No descriptor yet.
    Idle,
    /// Nonblocking connect in flight.
    Connecting,
    /// Connected (TLS handshake may still be running).
    Open,
    /// Torn down; terminal.
    Closed,
}

type ConnectCallback = Box<dyn FnOnce(Result<()>)>;
type EventCallback = Box<dyn FnMut()>;
type ErrorCallback = Box<dyn FnMut(Error)>;

struct TcpCore {
    ev: EventLoop,
    stream: Option<net::TcpStream>,
    /// Socket created by `bind`, consumed by the next `connect`.
    bound: Option<Socket>,
    state: SocketState,
    flags: SocketFlags,
    registered: bool,
    /// Bumped on every teardown; in-flight dispatch compares and aborts.
    generation: u64,
    tls: Option<Box<dyn TlsEngine>>,
    tls_options: TlsOptions,
    peer_host: Option<String>,
    connect_timer: Option<TimerHandle>,
    cb_connect: Option<ConnectCallback>,
    cb_read: Option<EventCallback>,
    cb_write: Option<EventCallback>,
    cb_error: Option<ErrorCallback>,
    error_fired: bool,
}

impl TcpCore {
    fn is_ready(&self) -> bool {
        self.state == SocketState::Open
            && self.tls.as_ref().map_or(true, |t| !t.is_handshaking())
    }

    fn fd(&self) -> Option<i32> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Tears the transport down: cancels the connect timer, closes TLS,
    /// shuts down receive, unregisters, and drops the descriptor.
    fn cleanup(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.connect_timer.take() {
            timer.cancel();
        }
        if let Some(mut engine) = self.tls.take() {
            if let Some(stream) = self.stream.as_ref() {
                let mut io = stream;
                engine.close(&mut io);
            }
        }
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(net::Shutdown::Read);
            if self.registered {
                self.registered = false;
                let _ = self.ev.unregister_fd(stream.as_raw_fd());
            }
        }
        self.bound = None;
    }
}

/// A nonblocking TCP endpoint owned by one event loop.
///
/// The socket is the unique owner of its descriptor; dropping it closes the
/// connection. The loop must outlive the socket, which the shared loop core
/// guarantees as long as either is alive.
pub struct TcpSocket {
    core: Rc<RefCell<TcpCore>>,
}

impl TcpSocket {
    /// Creates an idle socket bound to `ev`.
    #[must_use]
    pub fn new(ev: &EventLoop) -> Self {
        Self {
            core: Rc::new(RefCell::new(TcpCore {
                ev: ev.clone(),
                stream: None,
                bound: None,
                state: SocketState::Idle,
                flags: SocketFlags::NONE,
                registered: false,
                generation: 0,
                tls: None,
                tls_options: TlsOptions::default(),
                peer_host: None,
                connect_timer: None,
                cb_connect: None,
                cb_read: None,
                cb_write: None,
                cb_error: None,
                error_fired: false,
            })),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SocketState {
        self.core.borrow().state
    }

    /// True when application data may flow (open, TLS established).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.core.borrow().is_ready()
    }

    /// Installs the TLS configuration used by a later TLS connect/attach.
    pub fn set_tls_options(&self, options: TlsOptions) {
        self.core.borrow_mut().tls_options = options;
    }

    /// Callback invoked when the socket becomes readable.
    pub fn set_read_callback(&self, cb: impl FnMut() + 'static) {
        self.core.borrow_mut().cb_read = Some(Box::new(cb));
    }

    /// Callback invoked when a would-blocked send can make progress again.
    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.core.borrow_mut().cb_write = Some(Box::new(cb));
    }

    /// Callback invoked at most once, on a transport error.
    pub fn set_error_callback(&self, cb: impl FnMut(Error) + 'static) {
        self.core.borrow_mut().cb_error = Some(Box::new(cb));
    }

    /// Local address of the underlying descriptor.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let core = self.core.borrow();
        let stream = stream_ref(&core)?;
        stream
            .local_addr()
            .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))
    }

    /// Peer address of the underlying descriptor.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let core = self.core.borrow();
        let stream = stream_ref(&core)?;
        stream
            .peer_addr()
            .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))
    }

    /// Binds a local address before connecting. Numeric addresses only; no
    /// name resolution happens here. Only valid in `Idle`; on failure the
    /// socket stays `Idle` with nothing allocated.
    pub fn bind(&self, local_ip: &str, port: u16) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if core.state != SocketState::Idle {
            return Err(state_error("bind", core.state));
        }
        let ip: IpAddr = local_ip.parse().map_err(|_| {
            Error::new(ErrorCode::InvalidParam)
                .with_context(format!("not a numeric address: {local_ip:?}"))
        })?;
        let addr = SocketAddr::new(ip, port);
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))?;
        core.bound = Some(socket);
        Ok(())
    }

    /// Starts a nonblocking connect.
    ///
    /// `cb` fires exactly once: with `Ok` when the transport (and TLS, if
    /// flagged) is established, or with `Err` on failure or when
    /// `timeout` elapses first. Name resolution is allowed and happens
    /// synchronously, as does an immediate connect refusal.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        cb: impl FnOnce(Result<()>) + 'static,
        flags: SocketFlags,
        timeout: Option<Duration>,
    ) -> Result<()> {
        {
            let core = self.core.borrow();
            if core.state != SocketState::Idle {
                return Err(state_error("connect", core.state));
            }
            if flags.is_tls() && !tls::is_available() {
                return Err(Error::new(ErrorCode::Unsupported)
                    .with_context("TLS requested but not compiled in"));
            }
        }

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::new(ErrorCode::InvalidParam).with_source(e))?
            .next()
            .ok_or_else(|| {
                Error::new(ErrorCode::InvalidParam)
                    .with_context(format!("no address for {host}:{port}"))
            })?;

        let socket = match self.core.borrow_mut().bound.take() {
            Some(bound) => bound,
            None => Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
                .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))?,
        };
        configure(&socket);

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => {
                self.core.borrow_mut().state = SocketState::Closed;
                return Err(Error::new(ErrorCode::Failed)
                    .with_context(format!("connect {host}:{port}"))
                    .with_source(e));
            }
        }

        {
            let mut core = self.core.borrow_mut();
            core.stream = Some(socket.into());
            core.flags = flags;
            core.peer_host = Some(host.to_string());
            core.cb_connect = Some(Box::new(cb));
            core.state = SocketState::Connecting;
            core.error_fired = false;
        }
        debug!(host, port, "tcp connect started");

        // Completion (or refusal) arrives as writability.
        if let Err(e) = register(&self.core, Interest::writable()) {
            let mut core = self.core.borrow_mut();
            core.cleanup();
            core.state = SocketState::Closed;
            return Err(e);
        }

        if let Some(timeout) = timeout {
            let weak = Rc::downgrade(&self.core);
            let generation = self.core.borrow().generation;
            let handle = self.core.borrow().ev.schedule_timer(timeout, move || {
                if let Some(core) = weak.upgrade() {
                    on_connect_timeout(&core, generation);
                }
            });
            self.core.borrow_mut().connect_timer = Some(handle);
        }
        Ok(())
    }

    /// Adopts an already-connected stream (server-accept path).
    ///
    /// Applies nonblocking options, starts the server TLS handshake when
    /// flagged, registers for readability, and moves straight to `Open`.
    pub fn attach_stream(&self, stream: net::TcpStream, flags: SocketFlags) -> Result<()> {
        {
            let core = self.core.borrow();
            if core.state != SocketState::Idle {
                return Err(state_error("attach_stream", core.state));
            }
            if flags.is_tls() && !tls::is_available() {
                return Err(Error::new(ErrorCode::Unsupported)
                    .with_context("TLS requested but not compiled in"));
            }
        }
        stream
            .set_nonblocking(true)
            .map_err(|e| Error::new(ErrorCode::Failed).with_source(e))?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY");
        }
        {
            let mut core = self.core.borrow_mut();
            core.stream = Some(stream);
            core.flags = flags;
            core.state = SocketState::Open;
            core.error_fired = false;
        }
        let result = (|| {
            if flags.is_tls() {
                start_tls(&self.core, TlsRole::Server)?;
            }
            let interest = if self.core.borrow().tls.is_some() {
                Interest::all()
            } else {
                Interest::readable()
            };
            register(&self.core, interest)
        })();
        if result.is_err() {
            let mut core = self.core.borrow_mut();
            core.cleanup();
            core.state = SocketState::Closed;
        }
        result
    }

    /// Transfers the descriptor out without closing it.
    ///
    /// The socket unregisters from the loop and becomes `Closed`. Refused
    /// for TLS sockets: a descriptor mid-session is not reusable by a new
    /// owner.
    pub fn detach_stream(&self) -> Result<net::TcpStream> {
        let mut core = self.core.borrow_mut();
        if core.flags.is_tls() || core.tls.is_some() {
            return Err(Error::new(ErrorCode::InvalidState)
                .with_context("cannot detach a TLS socket"));
        }
        let stream = core
            .stream
            .take()
            .ok_or_else(|| state_error("detach_stream", core.state))?;
        if core.registered {
            core.registered = false;
            let _ = core.ev.unregister_fd(stream.as_raw_fd());
        }
        if let Some(timer) = core.connect_timer.take() {
            timer.cancel();
        }
        core.generation += 1;
        core.state = SocketState::Closed;
        Ok(stream)
    }

    /// Sends bytes, returning how many the kernel accepted.
    ///
    /// `Ok(0)` means would-block; writable interest is armed and the write
    /// callback will fire when there is room. A hard error tears the socket
    /// down and is returned (the error callback is reserved for
    /// loop-detected failures).
    pub fn send(&self, data: &[u8]) -> Result<usize> {
        self.send_inner(data, &[], false)
    }

    /// Vectored variant of [`send`](Self::send).
    pub fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        self.send_inner(&[], bufs, true)
    }

    fn send_inner(&self, data: &[u8], bufs: &[IoSlice<'_>], vectored: bool) -> Result<usize> {
        let mut core = self.core.borrow_mut();
        if !core.is_ready() {
            return Err(state_error("send", core.state));
        }
        let total = if vectored {
            bufs.iter().map(|b| b.len()).sum()
        } else {
            data.len()
        };
        if total == 0 {
            return Ok(0);
        }
        let core = &mut *core;
        let stream = core.stream.as_ref().expect("ready socket has a stream");
        let result = match core.tls.as_mut() {
            Some(engine) => {
                let mut io = stream;
                if vectored {
                    engine.write_vectored(&mut io, bufs)
                } else {
                    engine.write(&mut io, data)
                }
            }
            None => {
                let mut w = stream;
                if vectored {
                    w.write_vectored(bufs)
                } else {
                    w.write(data)
                }
            }
        };
        match result {
            Ok(n) => {
                if n < total {
                    arm_write_interest(core);
                }
                Ok(n)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                arm_write_interest(core);
                Ok(0)
            }
            Err(e) => {
                warn!(error = %e, "send failed");
                core.cleanup();
                core.state = SocketState::Closed;
                Err(Error::from(e))
            }
        }
    }

    /// Receives bytes into `buf`.
    ///
    /// `Ok(0)` means would-block. An orderly peer close tears the socket
    /// down and returns [`ErrorCode::Closed`]; hard errors likewise tear
    /// down and are returned.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut core = self.core.borrow_mut();
        if !core.is_ready() {
            return Err(state_error("recv", core.state));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let core = &mut *core;
        let stream = core.stream.as_ref().expect("ready socket has a stream");
        let result = match core.tls.as_mut() {
            Some(engine) => {
                let mut io = stream;
                engine.read(&mut io, buf)
            }
            None => {
                let mut r = stream;
                r.read(buf)
            }
        };
        match result {
            Ok(0) => {
                debug!("peer closed");
                core.cleanup();
                core.state = SocketState::Closed;
                Err(Error::new(ErrorCode::Closed).with_context("peer closed"))
            }
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(0)
            }
            Err(e) => {
                warn!(error = %e, "recv failed");
                core.cleanup();
                core.state = SocketState::Closed;
                Err(Error::from(e))
            }
        }
    }

    /// Shuts down and releases the descriptor. Idempotent.
    pub fn close(&self) {
        let mut core = self.core.borrow_mut();
        core.cleanup();
        core.state = SocketState::Closed;
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("TcpSocket")
            .field("state", &core.state)
            .field("fd", &core.fd())
            .field("tls", &core.tls.is_some())
            .finish_non_exhaustive()
    }
}

fn state_error(op: &str, state: SocketState) -> Error {
    Error::new(ErrorCode::InvalidState).with_context(format!("{op} in state {state:?}"))
}

fn stream_ref(core: &TcpCore) -> Result<&net::TcpStream> {
    core.stream
        .as_ref()
        .ok_or_else(|| Error::new(ErrorCode::InvalidState).with_context("no descriptor"))
}

fn connect_in_progress(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    ) || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Socket options applied to every outbound descriptor.
fn configure(socket: &Socket) {
    if let Err(e) = socket.set_nonblocking(true) {
        warn!(error = %e, "failed to set nonblocking");
    }
    if let Err(e) = socket.set_nodelay(true) {
        warn!(error = %e, "failed to set TCP_NODELAY");
    }
    #[cfg(unix)]
    if let Err(e) = socket.set_cloexec(true) {
        warn!(error = %e, "failed to set CLOEXEC");
    }
}

/// Registers the socket's descriptor; the loop callback holds a weak
/// reference plus the generation current at registration time.
fn register(core_rc: &Rc<RefCell<TcpCore>>, interest: Interest) -> Result<()> {
    let (ev, fd, generation) = {
        let core = core_rc.borrow();
        let fd = core.fd().ok_or_else(|| state_error("register", core.state))?;
        (core.ev.clone(), fd, core.generation)
    };
    let weak = Rc::downgrade(core_rc);
    ev.register_fd(fd, interest, move |ready| {
        let Some(core) = weak.upgrade() else { return };
        if core.borrow().generation != generation {
            return;
        }
        io_ready(&core, ready);
    })?;
    core_rc.borrow_mut().registered = true;
    Ok(())
}

fn arm_write_interest(core: &mut TcpCore) {
    if let Some(fd) = core.fd() {
        if core.registered {
            let _ = core.ev.update_fd(fd, Interest::all());
        }
    }
}

fn disarm_write_interest(core: &mut TcpCore) {
    if let Some(fd) = core.fd() {
        if core.registered {
            let _ = core.ev.update_fd(fd, Interest::readable());
        }
    }
}

fn io_ready(core_rc: &Rc<RefCell<TcpCore>>, ready: Interest) {
    let state = core_rc.borrow().state;
    match state {
        SocketState::Connecting => connecting_ready(core_rc, ready),
        SocketState::Open => open_ready(core_rc, ready),
        _ => {}
    }
}

/// Readiness while a connect is pending: writability reports the outcome,
/// with `SO_ERROR` distinguishing success from refusal.
fn connecting_ready(core_rc: &Rc<RefCell<TcpCore>>, ready: Interest) {
    let connect_err: Option<Error> = {
        let core = core_rc.borrow();
        let Some(stream) = core.stream.as_ref() else {
            return;
        };
        if ready.is_error() {
            Some(Error::new(ErrorCode::PollError).with_context("error readiness during connect"))
        } else {
            match stream.take_error() {
                Ok(Some(e)) => Some(Error::new(ErrorCode::PollError).with_source(e)),
                Ok(None) => None,
                Err(e) => Some(Error::new(ErrorCode::Failed).with_source(e)),
            }
        }
    };

    if let Some(err) = connect_err {
        finish_connect(core_rc, Err(err));
        return;
    }

    let tls_flagged = {
        let mut core = core_rc.borrow_mut();
        core.state = SocketState::Open;
        if let Some(timer) = core.connect_timer.take() {
            timer.cancel();
        }
        disarm_write_interest(&mut core);
        core.flags.is_tls()
    };

    if tls_flagged {
        // The connect callback fires when the handshake completes.
        if let Err(err) = start_tls(core_rc, TlsRole::Client) {
            finish_connect(core_rc, Err(err));
        }
        return;
    }

    let generation = core_rc.borrow().generation;
    finish_connect(core_rc, Ok(()));

    // Connected data may already be readable; deliver it after the connect
    // callback, unless that callback tore the socket down.
    if ready.is_readable() && alive(core_rc, generation) {
        on_receive(core_rc);
    }
}

/// True if the socket survived the last user callback untouched.
fn alive(core_rc: &Rc<RefCell<TcpCore>>, generation: u64) -> bool {
    let core = core_rc.borrow();
    core.generation == generation && core.state == SocketState::Open
}

fn finish_connect(core_rc: &Rc<RefCell<TcpCore>>, result: Result<()>) {
    let cb = {
        let mut core = core_rc.borrow_mut();
        if result.is_err() {
            core.cleanup();
            core.state = SocketState::Closed;
        }
        core.cb_connect.take()
    };
    if let Some(cb) = cb {
        cb(result);
    }
}

fn on_connect_timeout(core_rc: &Rc<RefCell<TcpCore>>, generation: u64) {
    {
        let core = core_rc.borrow();
        if core.generation != generation || core.state != SocketState::Connecting {
            return;
        }
    }
    debug!("connect timed out");
    finish_connect(core_rc, Err(Error::new(ErrorCode::Timeout)));
}

/// Creates the TLS engine and runs the first handshake step.
fn start_tls(core_rc: &Rc<RefCell<TcpCore>>, role: TlsRole) -> Result<()> {
    let engine = {
        let core = core_rc.borrow();
        match role {
            TlsRole::Client => {
                let host = core.peer_host.clone().unwrap_or_default();
                tls::client_engine(&core.tls_options, &host)
            }
            TlsRole::Server => tls::server_engine(&core.tls_options),
        }
    }?;
    core_rc.borrow_mut().tls = Some(engine);
    continue_tls(core_rc)
}

/// Drives the handshake one step; `Ok` covers both progress and completion.
fn continue_tls(core_rc: &Rc<RefCell<TcpCore>>) -> Result<()> {
    let status = {
        let mut core = core_rc.borrow_mut();
        let core = &mut *core;
        let (Some(stream), Some(engine)) = (core.stream.as_ref(), core.tls.as_mut()) else {
            return Err(Error::new(ErrorCode::InvalidState));
        };
        let mut io = stream;
        engine.handshake(&mut io)
    };
    match status {
        Ok(HandshakeStatus::InProgress) => {
            let mut core = core_rc.borrow_mut();
            arm_write_interest(&mut core);
            Ok(())
        }
        Ok(HandshakeStatus::Complete) => {
            {
                let mut core = core_rc.borrow_mut();
                disarm_write_interest(&mut core);
            }
            // Client path: this is where the pending connect completes.
            finish_connect(core_rc, Ok(()));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Readiness on an open socket. TLS handshake first, then reads, then
/// errors, then writes: a peer close that delivered final bytes must
/// surface those bytes before the error does.
fn open_ready(core_rc: &Rc<RefCell<TcpCore>>, ready: Interest) {
    let handshaking = {
        let core = core_rc.borrow();
        core.tls.as_ref().is_some_and(|t| t.is_handshaking())
    };
    if handshaking {
        let result = if ready.is_error() {
            Err(Error::new(ErrorCode::PollError).with_context("error readiness during handshake"))
        } else {
            continue_tls(core_rc)
        };
        if let Err(err) = result {
            let err = if err.is(ErrorCode::PollError) {
                err
            } else {
                Error::new(ErrorCode::TlsFailed).with_source(err)
            };
            if core_rc.borrow().cb_connect.is_some() {
                finish_connect(core_rc, Err(err));
            } else {
                on_close(core_rc, err);
            }
            return;
        }
        let still_handshaking = {
            let core = core_rc.borrow();
            core.state != SocketState::Open
                || core.tls.as_ref().is_some_and(|t| t.is_handshaking())
        };
        if still_handshaking {
            return;
        }
        // Handshake just finished: the final records may have carried
        // application data that is now buffered in the engine, and a
        // waiting writer can resume. Dispatch as if both were signalled.
        dispatch_open(core_rc, Interest::all());
        return;
    }
    dispatch_open(core_rc, ready);
}

fn dispatch_open(core_rc: &Rc<RefCell<TcpCore>>, ready: Interest) {
    let generation = core_rc.borrow().generation;

    if ready.is_readable() {
        on_receive(core_rc);
        if !alive(core_rc, generation) {
            return;
        }
    }
    if ready.is_error() {
        on_close(
            core_rc,
            Error::new(ErrorCode::PollError).with_context("error readiness"),
        );
        return;
    }
    if ready.is_writable() {
        on_send(core_rc);
    }
}

fn on_receive(core_rc: &Rc<RefCell<TcpCore>>) {
    if !core_rc.borrow().is_ready() {
        return;
    }
    let Some(mut cb) = core_rc.borrow_mut().cb_read.take() else {
        return;
    };
    cb();
    let mut core = core_rc.borrow_mut();
    if core.cb_read.is_none() {
        core.cb_read = Some(cb);
    }
}

fn on_send(core_rc: &Rc<RefCell<TcpCore>>) {
    {
        let mut core = core_rc.borrow_mut();
        // Park writable interest; a future would-block re-arms it.
        disarm_write_interest(&mut core);
        let core = &mut *core;
        if let (Some(stream), Some(engine)) = (core.stream.as_ref(), core.tls.as_mut()) {
            if engine.wants_write() {
                let mut io = stream;
                let _ = engine.flush(&mut io);
            }
        }
    }
    if !core_rc.borrow().is_ready() {
        return;
    }
    let Some(mut cb) = core_rc.borrow_mut().cb_write.take() else {
        return;
    };
    cb();
    let mut core = core_rc.borrow_mut();
    if core.cb_write.is_none() {
        core.cb_write = Some(cb);
    }
}

/// Transport failure detected by the loop: tear down, then surface once.
fn on_close(core_rc: &Rc<RefCell<TcpCore>>, err: Error) {
    let cb = {
        let mut core = core_rc.borrow_mut();
        core.cleanup();
        core.state = SocketState::Closed;
        if core.error_fired {
            None
        } else {
            core.error_fired = true;
            core.cb_error.take()
        }
    };
    if let Some(mut cb) = cb {
        cb(err);
    }
}
