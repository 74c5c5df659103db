//! Networking primitives driven by an [`EventLoop`](crate::EventLoop).

mod tcp;

pub use tcp::{SocketFlags, SocketState, TcpSocket};
