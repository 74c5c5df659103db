//! WebSocket connection: HTTP upgrade, then the framed channel.
//!
//! [`WsConnection`] drives `Idle → Upgrading → Open → {InError, Closed}` on
//! top of an [`H1Stream`]. The client side emits the upgrade request and
//! validates the server's proof; the server side validates the request and
//! delegates the accept/reject decision (plus subprotocol selection) to a
//! handshake callback. After `Open`, inbound bytes run through the frame
//! codec: fragmented messages are reassembled, control frames are handled
//! eagerly between fragments (pings answered, close echoed), and complete
//! messages reach the message callback.

use super::frame::{Frame, FrameCodec, FrameError, Opcode, WsRole};
use super::handshake::{ClientHandshake, HttpHead, UpgradeRequest, WsUrl};
use super::{HDR_ACCEPT, HDR_EXTENSIONS, HDR_KEY, HDR_PROTOCOL, HDR_VERSION, VERSION};
use crate::error::{Error, ErrorCode, Result};
use crate::event_loop::EventLoop;
use crate::http::H1Stream;
use crate::tracing_compat::{debug, warn};
use bytes::{Bytes, BytesMut};
use std::cell::RefCell;
use std::io::IoSlice;
use std::net;
use std::rc::Rc;
use std::time::Duration;

/// Maximum scatter-gather segments accepted by a vectored send.
pub const MAX_SEND_SEGMENTS: usize = 8;

/// Lifecycle state of a [`WsConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    /// Created, not yet connecting.
    Idle,
    /// HTTP upgrade in flight.
    Upgrading,
    /// Frames may flow.
    Open,
    /// Protocol or transport failure; terminal.
    InError,
    /// Closed (locally or by close-frame exchange); terminal.
    Closed,
}

/// A complete, reassembled application message.
#[derive(Debug, Clone)]
pub struct Message {
    /// [`Opcode::Text`] or [`Opcode::Binary`].
    pub opcode: Opcode,
    /// Full payload, fragments joined.
    pub payload: Bytes,
}

impl Message {
    /// True for text messages.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self.opcode, Opcode::Text)
    }
}

/// Server-side verdict from the handshake callback.
#[derive(Debug, Clone)]
pub enum HandshakeDecision {
    /// Complete the upgrade, optionally selecting one subprotocol and a
    /// subset of the offered extensions.
    Accept {
        /// Chosen subprotocol, from the client's offer.
        subprotocol: Option<String>,
        /// Accepted extensions, from the client's offer.
        extensions: Vec<String>,
    },
    /// Refuse with `403 Forbidden`.
    Reject,
}

impl HandshakeDecision {
    /// Accept with no subprotocol or extensions.
    #[must_use]
    pub const fn accept() -> Self {
        Self::Accept {
            subprotocol: None,
            extensions: Vec::new(),
        }
    }
}

type OpenCallback = Box<dyn FnOnce(Result<()>)>;
type MessageCallback = Box<dyn FnMut(Message)>;
type WriteCallback = Box<dyn FnMut()>;
type CloseCallback = Box<dyn FnMut(Option<u16>, String)>;
type ErrorCallback = Box<dyn FnMut(Error)>;
type HandshakeCallback = Box<dyn FnMut(&UpgradeRequest) -> HandshakeDecision>;

struct WsCore {
    stream: H1Stream,
    role: WsRole,
    state: WsState,
    /// Client: `Origin` header to offer. Server: origin received.
    origin: Option<String>,
    /// Client-side offers.
    offer_protocols: Vec<String>,
    offer_extensions: Vec<String>,
    /// Outcome of negotiation.
    selected_protocol: Option<String>,
    selected_extensions: Vec<String>,
    client_hs: Option<ClientHandshake>,
    handshake_cb: Option<HandshakeCallback>,
    codec: FrameCodec,
    frame_buf: BytesMut,
    fragment_opcode: Option<Opcode>,
    fragment_buf: BytesMut,
    close_sent: bool,
    cb_open: Option<OpenCallback>,
    cb_message: Option<MessageCallback>,
    cb_write: Option<WriteCallback>,
    cb_close: Option<CloseCallback>,
    cb_error: Option<ErrorCallback>,
    error_fired: bool,
}

/// A WebSocket endpoint bound to one event loop.
pub struct WsConnection {
    core: Rc<RefCell<WsCore>>,
}

impl WsConnection {
    fn new(ev: &EventLoop, role: WsRole) -> Self {
        let stream = match role {
            WsRole::Client => H1Stream::client(ev),
            WsRole::Server => H1Stream::server(ev),
        };
        // The inbound codec validates frames from the peer, so it runs with
        // our own role: a server codec requires masked frames, etc.
        let conn = Self {
            core: Rc::new(RefCell::new(WsCore {
                stream,
                role,
                state: WsState::Idle,
                origin: None,
                offer_protocols: Vec::new(),
                offer_extensions: Vec::new(),
                selected_protocol: None,
                selected_extensions: Vec::new(),
                client_hs: None,
                handshake_cb: None,
                codec: FrameCodec::new(role),
                frame_buf: BytesMut::new(),
                fragment_opcode: None,
                fragment_buf: BytesMut::new(),
                close_sent: false,
                cb_open: None,
                cb_message: None,
                cb_write: None,
                cb_close: None,
                cb_error: None,
                error_fired: false,
            })),
        };
        conn.wire_stream();
        conn
    }

    /// Creates a client connection.
    #[must_use]
    pub fn client(ev: &EventLoop) -> Self {
        Self::new(ev, WsRole::Client)
    }

    /// Creates a server connection for an accepted transport.
    #[must_use]
    pub fn server(ev: &EventLoop) -> Self {
        Self::new(ev, WsRole::Server)
    }

    fn wire_stream(&self) {
        let core = self.core.borrow();
        let weak = Rc::downgrade(&self.core);
        core.stream.set_head_callback(move |head| {
            if let Some(core) = weak.upgrade() {
                on_head(&core, head);
            }
        });
        let weak = Rc::downgrade(&self.core);
        core.stream.set_data_callback(move |buf| {
            if let Some(core) = weak.upgrade() {
                on_data(&core, buf);
            }
        });
        let weak = Rc::downgrade(&self.core);
        core.stream.set_write_ready_callback(move || {
            if let Some(core) = weak.upgrade() {
                on_write_ready(&core);
            }
        });
        let weak = Rc::downgrade(&self.core);
        core.stream.set_error_callback(move |err| {
            if let Some(core) = weak.upgrade() {
                fail(&core, err);
            }
        });
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> WsState {
        self.core.borrow().state
    }

    /// Role of this endpoint.
    #[must_use]
    pub fn role(&self) -> WsRole {
        self.core.borrow().role
    }

    /// Negotiated subprotocol, once open.
    #[must_use]
    pub fn subprotocol(&self) -> Option<String> {
        self.core.borrow().selected_protocol.clone()
    }

    /// Negotiated extensions, once open.
    #[must_use]
    pub fn extensions(&self) -> Vec<String> {
        self.core.borrow().selected_extensions.clone()
    }

    /// Peer origin (server side) or the origin this client offers.
    #[must_use]
    pub fn origin(&self) -> Option<String> {
        self.core.borrow().origin.clone()
    }

    /// Client: sets the `Origin` header for the upgrade request.
    pub fn set_origin(&self, origin: impl Into<String>) {
        self.core.borrow_mut().origin = Some(origin.into());
    }

    /// Client: offers a subprotocol.
    pub fn offer_protocol(&self, protocol: impl Into<String>) {
        self.core.borrow_mut().offer_protocols.push(protocol.into());
    }

    /// Client: offers an extension.
    pub fn offer_extension(&self, extension: impl Into<String>) {
        self.core
            .borrow_mut()
            .offer_extensions
            .push(extension.into());
    }

    /// Bounds the transport connect of [`connect`](Self::connect).
    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.core.borrow().stream.set_connect_timeout(timeout);
    }

    /// TLS configuration for a `wss://` connect.
    pub fn set_tls_options(&self, options: crate::tls::TlsOptions) {
        self.core.borrow().stream.set_tls_options(options);
    }

    /// Callback for complete inbound messages.
    pub fn set_message_callback(&self, cb: impl FnMut(Message) + 'static) {
        self.core.borrow_mut().cb_message = Some(Box::new(cb));
    }

    /// Callback fired when a congested send path drains.
    pub fn set_write_callback(&self, cb: impl FnMut() + 'static) {
        self.core.borrow_mut().cb_write = Some(Box::new(cb));
    }

    /// Callback fired when the peer's close frame arrives.
    pub fn set_close_callback(&self, cb: impl FnMut(Option<u16>, String) + 'static) {
        self.core.borrow_mut().cb_close = Some(Box::new(cb));
    }

    /// Callback fired at most once on protocol or transport failure.
    pub fn set_error_callback(&self, cb: impl FnMut(Error) + 'static) {
        self.core.borrow_mut().cb_error = Some(Box::new(cb));
    }

    /// Client: starts the upgrade against `url` (`ws://` or `wss://`).
    ///
    /// `cb` fires once: `Ok` when the connection reaches `Open`, `Err` if
    /// the transport or the handshake fails first.
    pub fn connect(&self, url: &str, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        {
            let core = self.core.borrow();
            if core.role != WsRole::Client {
                return Err(Error::new(ErrorCode::InvalidState).with_context("server connection"));
            }
            if core.state != WsState::Idle {
                return Err(state_error("connect", core.state));
            }
        }
        let parsed = WsUrl::parse(url)
            .map_err(|e| Error::new(ErrorCode::InvalidParam).with_context(e.to_string()))?;
        let handshake = ClientHandshake::new();

        {
            let mut core = self.core.borrow_mut();
            let stream = &core.stream;
            stream.add_header("Upgrade", "websocket");
            stream.add_header("Connection", "Upgrade");
            stream.add_header("Host", parsed.host_header());
            if let Some(origin) = &core.origin {
                stream.add_header("Origin", origin.clone());
            }
            stream.add_header(HDR_KEY, handshake.key().to_owned());
            if !core.offer_protocols.is_empty() {
                stream.add_header(HDR_PROTOCOL, core.offer_protocols.join(", "));
            }
            if !core.offer_extensions.is_empty() {
                stream.add_header(HDR_EXTENSIONS, core.offer_extensions.join(", "));
            }
            stream.add_header(HDR_VERSION, VERSION);

            core.client_hs = Some(handshake);
            core.cb_open = Some(Box::new(cb));
            core.state = WsState::Upgrading;
        }

        // The request rides plain HTTP; ws maps to http, wss to https.
        let result = self
            .core
            .borrow()
            .stream
            .send_request("GET", &parsed.http_url());
        if let Err(err) = result {
            let mut core = self.core.borrow_mut();
            core.state = WsState::InError;
            core.cb_open = None;
            return Err(err);
        }
        Ok(())
    }

    /// Server: adopts an accepted transport and awaits the upgrade request.
    ///
    /// The handshake callback decides accept/reject and selects the
    /// subprotocol and extensions from the client's offer.
    pub fn attach(
        &self,
        stream: net::TcpStream,
        handshake_cb: impl FnMut(&UpgradeRequest) -> HandshakeDecision + 'static,
    ) -> Result<()> {
        {
            let core = self.core.borrow();
            if core.role != WsRole::Server {
                return Err(Error::new(ErrorCode::InvalidState).with_context("client connection"));
            }
            if core.state != WsState::Idle {
                return Err(state_error("attach", core.state));
            }
        }
        self.core.borrow_mut().handshake_cb = Some(Box::new(handshake_cb));
        self.core.borrow_mut().state = WsState::Upgrading;
        let result = self.core.borrow().stream.attach_stream(stream);
        if let Err(err) = result {
            self.core.borrow_mut().state = WsState::InError;
            return Err(err);
        }
        Ok(())
    }

    /// Sends a text message.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_frame(&Frame::text(Bytes::copy_from_slice(text.as_bytes())))
    }

    /// Sends a binary message.
    pub fn send_binary(&self, data: &[u8]) -> Result<()> {
        self.send_frame(&Frame::binary(Bytes::copy_from_slice(data)))
    }

    /// Sends one message gathered from up to [`MAX_SEND_SEGMENTS`] slices.
    pub fn send_vectored(&self, opcode: Opcode, bufs: &[IoSlice<'_>]) -> Result<()> {
        if bufs.len() > MAX_SEND_SEGMENTS {
            return Err(Error::new(ErrorCode::InvalidParam)
                .with_context(format!("{} segments exceed the cap of {MAX_SEND_SEGMENTS}", bufs.len())));
        }
        if !matches!(opcode, Opcode::Text | Opcode::Binary) {
            return Err(Error::new(ErrorCode::InvalidParam).with_context("data opcodes only"));
        }
        let total = bufs.iter().map(|b| b.len()).sum();
        let mut payload = BytesMut::with_capacity(total);
        for buf in bufs {
            payload.extend_from_slice(buf);
        }
        self.send_frame(&Frame {
            fin: true,
            opcode,
            payload: payload.freeze(),
        })
    }

    /// Sends a ping with an optional payload.
    pub fn send_ping(&self, payload: &[u8]) -> Result<()> {
        self.send_frame(&Frame::ping(Bytes::copy_from_slice(payload)))
    }

    /// Initiates the closing handshake, then tears the transport down.
    pub fn close(&self, code: Option<u16>, reason: &str) {
        let was_open = {
            let core = self.core.borrow();
            core.state == WsState::Open && !core.close_sent
        };
        if was_open {
            let _ = self.send_frame(&Frame::close(code, reason));
            self.core.borrow_mut().close_sent = true;
        }
        let mut core = self.core.borrow_mut();
        if !matches!(core.state, WsState::InError) {
            core.state = WsState::Closed;
        }
        core.error_fired = true;
        core.stream.close();
    }

    /// True when a send would not queue behind earlier data.
    #[must_use]
    pub fn can_send(&self) -> bool {
        let core = self.core.borrow();
        core.state == WsState::Open && core.stream.can_send()
    }

    fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut core = self.core.borrow_mut();
        if core.state != WsState::Open {
            return Err(state_error("send", core.state));
        }
        if core.close_sent {
            return Err(state_error("send after close", core.state));
        }
        let mut wire = BytesMut::new();
        let core = &mut *core;
        core.codec
            .encode(frame, &mut wire)
            .map_err(proto_error)?;
        core.stream.send_data(&wire)
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.close(None, "");
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("WsConnection")
            .field("role", &core.role)
            .field("state", &core.state)
            .finish_non_exhaustive()
    }
}

fn state_error(op: &str, state: WsState) -> Error {
    Error::new(ErrorCode::InvalidState).with_context(format!("{op} in state {state:?}"))
}

fn proto_error(err: FrameError) -> Error {
    Error::new(ErrorCode::ProtoError).with_context(err.to_string())
}

/// Message head arrived: request (server) or response (client).
fn on_head(core_rc: &Rc<RefCell<WsCore>>, head: &HttpHead) {
    let role = core_rc.borrow().role;
    match role {
        WsRole::Server => on_upgrade_request(core_rc, head),
        WsRole::Client => on_upgrade_response(core_rc, head),
    }
}

fn on_upgrade_request(core_rc: &Rc<RefCell<WsCore>>, head: &HttpHead) {
    let request = match UpgradeRequest::from_head(head) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "malformed upgrade request");
            send_reject(core_rc, 400, "Bad Request");
            fail(
                core_rc,
                Error::new(ErrorCode::ProtoError).with_context(err.to_string()),
            );
            return;
        }
    };
    core_rc.borrow_mut().origin = request.origin.clone();

    // Policy belongs to the application: take the callback out, let it run
    // arbitrary re-entrant code, and only proceed if the connection is
    // still upgrading afterwards.
    let Some(mut cb) = core_rc.borrow_mut().handshake_cb.take() else {
        send_reject(core_rc, 403, "Forbidden");
        fail(core_rc, Error::new(ErrorCode::Rejected));
        return;
    };
    let decision = cb(&request);
    if core_rc.borrow().state != WsState::Upgrading {
        return;
    }

    match decision {
        HandshakeDecision::Accept {
            subprotocol,
            extensions,
        } => {
            let accept_key = super::compute_accept_key(&request.key);
            {
                let mut core = core_rc.borrow_mut();
                core.selected_protocol = subprotocol;
                core.selected_extensions = extensions;
                let stream = &core.stream;
                stream.add_header("Upgrade", "websocket");
                stream.add_header("Connection", "Upgrade");
                stream.add_header(HDR_ACCEPT, accept_key);
                if let Some(protocol) = &core.selected_protocol {
                    stream.add_header(HDR_PROTOCOL, protocol.clone());
                }
                if !core.selected_extensions.is_empty() {
                    stream.add_header(HDR_EXTENSIONS, core.selected_extensions.join(", "));
                }
                stream.add_header(HDR_VERSION, VERSION);
            }
            let sent = core_rc
                .borrow()
                .stream
                .send_response(101, "Switching Protocols");
            match sent {
                Ok(()) => {
                    debug!("upgrade accepted");
                    core_rc.borrow_mut().state = WsState::Open;
                    finish_open(core_rc, Ok(()));
                }
                Err(err) => fail(core_rc, err),
            }
        }
        HandshakeDecision::Reject => {
            debug!("upgrade rejected by policy");
            send_reject(core_rc, 403, "Forbidden");
            fail(core_rc, Error::new(ErrorCode::Rejected));
        }
    }
}

/// Emits a non-101 response with the version header mirrored.
fn send_reject(core_rc: &Rc<RefCell<WsCore>>, status: u16, reason: &str) {
    let core = core_rc.borrow();
    core.stream.add_header(HDR_VERSION, VERSION);
    if let Err(err) = core.stream.send_response(status, reason) {
        warn!(error = %err, status, "failed to send rejection response");
    }
}

fn on_upgrade_response(core_rc: &Rc<RefCell<WsCore>>, head: &HttpHead) {
    let validation = {
        let core = core_rc.borrow();
        match core.client_hs.as_ref() {
            Some(handshake) => handshake.validate_response(head),
            None => return,
        }
    };
    match validation {
        Ok(()) => {
            {
                let mut core = core_rc.borrow_mut();
                core.selected_protocol = head.header(HDR_PROTOCOL).map(str::to_owned);
                core.selected_extensions = head
                    .header_values(HDR_EXTENSIONS)
                    .flat_map(|v| v.split(','))
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect();
                core.state = WsState::Open;
            }
            debug!("upgrade completed");
            finish_open(core_rc, Ok(()));
        }
        Err(err) => {
            warn!(error = %err, "upgrade response rejected");
            fail(
                core_rc,
                Error::new(ErrorCode::ProtoError).with_context(err.to_string()),
            );
        }
    }
}

/// Fires the one-shot open callback.
fn finish_open(core_rc: &Rc<RefCell<WsCore>>, result: Result<()>) {
    let cb = core_rc.borrow_mut().cb_open.take();
    if let Some(cb) = cb {
        cb(result);
    }
}

/// Raw bytes after the upgrade: run them through the frame codec.
fn on_data(core_rc: &Rc<RefCell<WsCore>>, buf: &mut BytesMut) {
    {
        let mut core = core_rc.borrow_mut();
        let incoming = buf.split_to(buf.len());
        if core.frame_buf.is_empty() {
            core.frame_buf = incoming;
        } else {
            core.frame_buf.unsplit(incoming);
        }
    }
    while core_rc.borrow().state == WsState::Open {
        let decoded = {
            let mut core = core_rc.borrow_mut();
            let core = &mut *core;
            core.codec.decode(&mut core.frame_buf)
        };
        match decoded {
            Ok(Some(frame)) => handle_frame(core_rc, frame),
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "frame decode failed");
                fail(core_rc, proto_error(err));
                break;
            }
        }
    }
}

fn handle_frame(core_rc: &Rc<RefCell<WsCore>>, frame: Frame) {
    match frame.opcode {
        Opcode::Ping => {
            debug!(len = frame.payload.len(), "ping");
            respond(core_rc, &Frame::pong(frame.payload));
        }
        Opcode::Pong => {}
        Opcode::Close => on_close_frame(core_rc, &frame),
        Opcode::Text | Opcode::Binary => {
            let in_fragment = core_rc.borrow().fragment_opcode.is_some();
            if in_fragment {
                fail(
                    core_rc,
                    Error::new(ErrorCode::ProtoError)
                        .with_context("data frame while a fragmented message is in progress"),
                );
                return;
            }
            if frame.fin {
                deliver(core_rc, frame.opcode, frame.payload);
            } else {
                let mut core = core_rc.borrow_mut();
                core.fragment_opcode = Some(frame.opcode);
                core.fragment_buf.extend_from_slice(&frame.payload);
            }
        }
        Opcode::Continuation => {
            let completed = {
                let mut core = core_rc.borrow_mut();
                let Some(opcode) = core.fragment_opcode else {
                    drop(core);
                    fail(
                        core_rc,
                        Error::new(ErrorCode::ProtoError)
                            .with_context("continuation without a preceding fragment"),
                    );
                    return;
                };
                if core.fragment_buf.len() + frame.payload.len() > FrameCodec::DEFAULT_MAX_PAYLOAD {
                    drop(core);
                    fail(
                        core_rc,
                        Error::new(ErrorCode::ProtoError)
                            .with_context("reassembled message exceeds payload cap"),
                    );
                    return;
                }
                core.fragment_buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    core.fragment_opcode = None;
                    Some((opcode, core.fragment_buf.split().freeze()))
                } else {
                    None
                }
            };
            if let Some((opcode, payload)) = completed {
                deliver(core_rc, opcode, payload);
            }
        }
    }
}

fn on_close_frame(core_rc: &Rc<RefCell<WsCore>>, frame: &Frame) {
    let body = frame.close_body();
    let (code, reason) = match body {
        Ok(parts) => parts,
        Err(err) => {
            fail(core_rc, proto_error(err));
            return;
        }
    };
    debug!(?code, "close frame received");
    let echo = !core_rc.borrow().close_sent;
    if echo {
        respond(core_rc, &Frame::close(code, ""));
        core_rc.borrow_mut().close_sent = true;
    }
    {
        let mut core = core_rc.borrow_mut();
        core.state = WsState::Closed;
        core.stream.close();
    }
    let cb = core_rc.borrow_mut().cb_close.take();
    if let Some(mut cb) = cb {
        cb(code, reason);
    }
}

/// Sends a protocol-generated frame (pong, close echo); failures on an
/// already-dying transport are ignored.
fn respond(core_rc: &Rc<RefCell<WsCore>>, frame: &Frame) {
    let mut core = core_rc.borrow_mut();
    if core.state != WsState::Open {
        return;
    }
    let mut wire = BytesMut::new();
    let core = &mut *core;
    if core.codec.encode(frame, &mut wire).is_ok() {
        let _ = core.stream.send_data(&wire);
    }
}

/// Delivers a complete message, tolerating re-entrant teardown.
fn deliver(core_rc: &Rc<RefCell<WsCore>>, opcode: Opcode, payload: Bytes) {
    let Some(mut cb) = core_rc.borrow_mut().cb_message.take() else {
        return;
    };
    cb(Message { opcode, payload });
    let mut core = core_rc.borrow_mut();
    if core.cb_message.is_none() {
        core.cb_message = Some(cb);
    }
}

fn on_write_ready(core_rc: &Rc<RefCell<WsCore>>) {
    if core_rc.borrow().state != WsState::Open {
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

/// Protocol or transport failure: enter `InError`, close the transport,
/// surface exactly once.
fn fail(core_rc: &Rc<RefCell<WsCore>>, err: Error) {
    let (open_cb, error_cb) = {
        let mut core = core_rc.borrow_mut();
        if matches!(core.state, WsState::InError | WsState::Closed) {
            core.stream.close();
            return;
        }
        core.state = WsState::InError;
        core.stream.close();
        let error_cb = if core.error_fired {
            None
        } else {
            core.error_fired = true;
            core.cb_error.take()
        };
        (core.cb_open.take(), error_cb)
    };
    // A pending connect learns about the failure through its own callback.
    if let Some(cb) = open_cb {
        cb(Err(err.clone()));
    } else if let Some(mut cb) = error_cb {
        cb(err);
    }
}
