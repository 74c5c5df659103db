//! Evio: single-threaded, callback-driven network I/O.
//!
//! # Overview
//!
//! Evio drives many concurrent sockets from one thread. A reactor-style
//! [`EventLoop`] multiplexes readiness notifications, dispatches timers, and
//! executes cross-thread task submissions; a [`TcpSocket`] layers a
//! nonblocking connect/open/closed state machine (with optional TLS) on top
//! of it; and a [`WsConnection`](ws::WsConnection) rides an HTTP/1.1 stream
//! through the RFC 6455 upgrade into a framed bidirectional channel.
//!
//! # Core Guarantees
//!
//! - **Single-threaded ownership**: every socket, timer, and callback
//!   belongs to exactly one loop thread; foreign threads submit through a
//!   [`LoopHandle`]
//! - **Deterministic dispatch order**: deferred tasks, then I/O readiness,
//!   then timers, within every loop iteration
//! - **Re-entrant callbacks**: closing or dropping an object from inside its
//!   own callback is safe; generation counters stop stale dispatch
//! - **One error, once**: transport and protocol failures surface through a
//!   single error callback and leave the object terminal
//!
//! # Module Structure
//!
//! - [`poll`]: readiness backends (`PollBackend`, the platform poller)
//! - [`event_loop`]: the reactor, timers, cross-thread submission
//! - [`net`]: the nonblocking TCP socket state machine
//! - [`tls`]: TLS engine interface; rustls implementation behind `tls`
//! - [`http`]: minimal HTTP/1.1 stream for upgrade-style protocols
//! - [`ws`]: WebSocket handshake, frame codec, and connection
//! - [`error`]: error codes and the crate error type
//!
//! # Example
//!
//! ```no_run
//! use evio::{EventLoop, TcpSocket, SocketFlags};
//! use std::time::Duration;
//!
//! let ev = EventLoop::new()?;
//! let sock = TcpSocket::new(&ev);
//! sock.set_read_callback(|| { /* recv from the socket here */ });
//! sock.connect(
//!     "example.com",
//!     80,
//!     |result| println!("connected: {result:?}"),
//!     SocketFlags::NONE,
//!     Some(Duration::from_secs(10)),
//! )?;
//! ev.run(None)?;
//! # Ok::<(), evio::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod event_loop;
pub mod http;
pub mod net;
pub mod poll;
pub mod test_utils;
pub mod tls;
pub mod tracing_compat;
pub mod ws;

pub use error::{Error, ErrorCode, Result};
pub use event_loop::{EventLoop, LoopHandle, LoopListener, TimerHandle};
pub use net::{SocketFlags, SocketState, TcpSocket};
pub use poll::{Interest, PollBackend, PollType};
pub use ws::{Message, WsConnection};
