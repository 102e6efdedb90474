//! Connection managers for plain transports.
//!
//! The pool itself is transport-agnostic; this module ships a ready-made
//! [`ManageConnection`](crate::manager::ManageConnection) for blocking TCP
//! sockets.

mod tcp;

pub use tcp::TcpConnector;
