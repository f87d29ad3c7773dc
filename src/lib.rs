//! Socket transport for a Sun RPC server.
//!
//! Sockets of one service live in a [`registry::Registry`]. The network
//! stack reports readiness on them, which puts them on the registry's ready
//! queue or hands them straight to an idle [`registry::Worker`]. A worker
//! receives one request ([`svc::Request`]) from the socket, dispatches it and
//! sends the reply, and the socket goes back to the stack.

pub mod common;
pub mod error;
pub mod facade;
pub mod registry;
pub mod simulated;
pub mod sock;
pub mod stats;
pub mod svc;
mod tcp;
mod udp;
pub mod framework {
    pub mod os;
}
pub mod app {
    pub mod echo;
    pub mod mock;
}
