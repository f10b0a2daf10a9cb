//! Network primitives for the IPC transport.
//!
//! A mio-based UDP socket plus the backend-agnostic [`Endpoint`] type used in
//! configuration and peer tables.

pub mod endpoint;
pub mod socket;

pub use endpoint::Endpoint;
pub use socket::UdpSocket;
