//! Minimal HTTP/1.1 stream support for upgrade-style protocols.

mod h1;
mod head;

pub use h1::H1Stream;
pub use head::{HeadError, HttpHead};
