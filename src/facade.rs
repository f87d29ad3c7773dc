//! Seams between the socket transport and its collaborators.
//!
//! Below the transport sits the network stack: something that owns real
//! sockets, moves bytes, and reports readiness. It is reached through
//! [`DatagramSocket`], [`StreamSocket`] and [`ListenSocket`], plus [`Watch`]
//! to hook up readiness notifications. [`framework::os`] implements them on
//! top of std sockets and mio, [`simulated`] implements them in memory.
//!
//! Above the transport sits the call dispatcher ([`Dispatch`]), beside it the
//! port mapper ([`Register`]).
//!
//! [`framework::os`]: crate::framework::os
//! [`simulated`]: crate::simulated

use std::{
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use crate::{
    common::{internet_checksum, Opaque, Program, Protocol},
    svc::Request,
};

/// Receiver of readiness notifications.
///
/// Implementations are called from whatever context the network stack
/// notifies in, so they must not block and should do little more than set a
/// flag.
pub trait Readiness: Send + Sync {
    /// Data can be read, or for a listening socket, a connection is waiting.
    fn data_ready(&self);
    /// The connection left the established state.
    fn state_change(&self);
}

pub trait Watch {
    /// Route future readiness notifications to `readiness`. Whatever became
    /// ready before is not replayed.
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()>;
    /// Release the underlying socket. Called once, after the last user is
    /// gone.
    fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// The stack has already validated the datagram.
    Verified,
    /// Checksum as transmitted, still to be compared against the payload.
    Unverified(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub payload: Opaque,
    pub checksum: Checksum,
}

impl Datagram {
    pub fn checksum_ok(&self) -> bool {
        match self.checksum {
            Checksum::Verified => true,
            Checksum::Unverified(checksum) => internet_checksum(&self.payload) == checksum,
        }
    }
}

pub trait DatagramSocket: Watch + Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    /// Never blocks. An error of a refused/reset kind reports an ICMP error
    /// queued on the socket, not a datagram.
    fn recv_datagram(&self) -> io::Result<Datagram>;
    /// Never blocks.
    fn send_datagram(&self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize>;
}

pub trait StreamSocket: Watch + Send + Sync {
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    /// Never blocks. `Ok(0)` means the peer has closed its side.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Bytes readable without blocking, capped at `limit`. May report less
    /// than is buffered when `limit` is large.
    fn available(&self, limit: usize) -> io::Result<usize>;
    /// Blocks, returns how many bytes were handed to the stack. Less than
    /// `bytes.len()` only if the connection broke halfway.
    fn write(&self, bytes: &[u8]) -> io::Result<usize>;
}

pub trait ListenSocket: Watch + Send + Sync {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    /// Never blocks.
    fn accept(&self) -> io::Result<(Box<dyn StreamSocket>, SocketAddr)>;
}

/// Port mapper client.
pub trait Register: Send + Sync {
    /// Advertise `program` on `port`. Port 0 withdraws the advertisement.
    fn register(&self, program: Program, protocol: Protocol, port: u16) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Reply,
    Drop,
}

/// Call dispatcher. Reads `request.arg`, appends the reply to `request.res`
/// (which already starts with the XID), and says whether to send it.
pub trait Dispatch {
    fn dispatch(&mut self, request: &mut Request) -> Disposition;
}

impl<T: Watch + ?Sized> Watch for Arc<T> {
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        (**self).watch(readiness)
    }
    fn close(&self) {
        (**self).close()
    }
}

impl<T: DatagramSocket + ?Sized> DatagramSocket for Arc<T> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
    fn recv_datagram(&self) -> io::Result<Datagram> {
        (**self).recv_datagram()
    }
    fn send_datagram(&self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        (**self).send_datagram(peer, bytes)
    }
}

impl<T: StreamSocket + ?Sized> StreamSocket for Arc<T> {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }
    fn available(&self, limit: usize) -> io::Result<usize> {
        (**self).available(limit)
    }
    fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }
}

impl<T: ListenSocket + ?Sized> ListenSocket for Arc<T> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
    fn accept(&self) -> io::Result<(Box<dyn StreamSocket>, SocketAddr)> {
        (**self).accept()
    }
}

impl<T: Register + ?Sized> Register for Arc<T> {
    fn register(&self, program: Program, protocol: Protocol, port: u16) -> io::Result<()> {
        (**self).register(program, protocol, port)
    }
}
