//! In-memory network stack.
//!
//! Sockets here never block and never touch the OS. Tests drive them from
//! the outside: deliver a datagram, push bytes into a connection, connect to
//! a listener, hang up. Each of those fires the readiness callback the way a
//! real stack would, after the socket's own lock is released.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

use tracing::trace;

use crate::{
    common::{internet_checksum, Opaque, Program, Protocol},
    facade::{
        Checksum, Datagram, DatagramSocket, ListenSocket, Readiness, Register, StreamSocket,
        Watch,
    },
};

#[derive(Default)]
struct Notify(Mutex<Option<Weak<dyn Readiness>>>);

impl Notify {
    fn set(&self, readiness: Weak<dyn Readiness>) {
        *self.0.lock().unwrap() = Some(readiness);
    }

    fn get(&self) -> Option<Arc<dyn Readiness>> {
        self.0.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn data_ready(&self) {
        if let Some(readiness) = self.get() {
            readiness.data_ready();
        }
    }

    fn state_change(&self) {
        if let Some(readiness) = self.get() {
            readiness.state_change();
        }
    }
}

pub struct UdpSocket {
    addr: SocketAddr,
    inner: Mutex<UdpInner>,
    notify: Notify,
}

#[derive(Default)]
struct UdpInner {
    inbox: VecDeque<Result<Datagram, io::ErrorKind>>,
    sent: Vec<(SocketAddr, Opaque)>,
    refuse: usize,
    blocked: bool,
    closed: usize,
}

impl UdpSocket {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            inner: Default::default(),
            notify: Default::default(),
        })
    }

    /// Put a datagram in the receive queue without a notification, as if it
    /// arrived before anyone was watching.
    pub fn queue(&self, peer: SocketAddr, payload: Opaque) {
        let checksum = Checksum::Unverified(internet_checksum(&payload));
        self.queue_datagram(Datagram {
            peer,
            payload,
            checksum,
        });
    }

    pub fn queue_datagram(&self, datagram: Datagram) {
        self.inner.lock().unwrap().inbox.push_back(Ok(datagram));
    }

    /// Queue an error report, e.g. an ICMP port unreachable.
    pub fn queue_error(&self, kind: io::ErrorKind) {
        self.inner.lock().unwrap().inbox.push_back(Err(kind));
    }

    pub fn deliver(&self, peer: SocketAddr, payload: Opaque) {
        self.queue(peer, payload);
        self.notify.data_ready();
    }

    /// Deliver a datagram that was damaged in flight.
    pub fn deliver_corrupted(&self, peer: SocketAddr, payload: Opaque) {
        let checksum = Checksum::Unverified(!internet_checksum(&payload));
        self.queue_datagram(Datagram {
            peer,
            payload,
            checksum,
        });
        self.notify.data_ready();
    }

    /// Datagrams not yet received.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.inbox.iter().filter(|entry| entry.is_ok()).count()
    }

    pub fn sent(&self) -> Vec<(SocketAddr, Opaque)> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Fail the next `n` sends as refused.
    pub fn refuse_sends(&self, n: usize) {
        self.inner.lock().unwrap().refuse = n;
    }

    /// Make sends fail as if the send buffer were full.
    pub fn block_sends(&self, blocked: bool) {
        self.inner.lock().unwrap().blocked = blocked;
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().closed
    }
}

impl Watch for UdpSocket {
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        self.notify.set(readiness);
        Ok(())
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed += 1;
    }
}

impl DatagramSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn recv_datagram(&self) -> io::Result<Datagram> {
        match self.inner.lock().unwrap().inbox.pop_front() {
            Some(Ok(datagram)) => Ok(datagram),
            Some(Err(kind)) => Err(kind.into()),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn send_datagram(&self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.blocked {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        if inner.refuse > 0 {
            inner.refuse -= 1;
            return Err(io::ErrorKind::ConnectionRefused.into());
        }
        trace!("{} -> {}: {} bytes", self.addr, peer, bytes.len());
        inner.sent.push((peer, bytes.to_vec()));
        Ok(bytes.len())
    }
}

pub struct TcpStream {
    peer: SocketAddr,
    inner: Mutex<StreamInner>,
    notify: Notify,
}

#[derive(Default)]
struct StreamInner {
    input: VecDeque<u8>,
    output: Vec<u8>,
    hung_up: bool,
    write_budget: Option<usize>,
    closed: usize,
}

impl TcpStream {
    pub fn new(peer: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            peer,
            inner: Default::default(),
            notify: Default::default(),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes arriving from the peer.
    pub fn push(&self, bytes: &[u8]) {
        self.inner.lock().unwrap().input.extend(bytes);
        self.notify.data_ready();
    }

    /// The peer closes its end.
    pub fn hang_up(&self) {
        self.inner.lock().unwrap().hung_up = true;
        self.notify.state_change();
    }

    /// Everything written to the peer so far.
    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().unwrap().output.clone()
    }

    /// Accept only `n` more bytes of writes, as if the connection broke
    /// after that.
    pub fn limit_writes(&self, n: usize) {
        self.inner.lock().unwrap().write_budget = Some(n);
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().closed
    }
}

impl Watch for TcpStream {
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        self.notify.set(readiness);
        Ok(())
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed += 1;
    }
}

impl StreamSocket for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.input.is_empty() {
            if inner.hung_up {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(inner.input.len());
        for (slot, byte) in buf.iter_mut().zip(inner.input.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn available(&self, limit: usize) -> io::Result<usize> {
        Ok(self.inner.lock().unwrap().input.len().min(limit))
    }

    fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed > 0 || inner.hung_up {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let n = match &mut inner.write_budget {
            Some(budget) => {
                let n = bytes.len().min(*budget);
                *budget -= n;
                n
            }
            None => bytes.len(),
        };
        inner.output.extend_from_slice(&bytes[..n]);
        Ok(n)
    }
}

pub struct TcpListener {
    addr: SocketAddr,
    inner: Mutex<ListenInner>,
    notify: Notify,
}

#[derive(Default)]
struct ListenInner {
    // None for a connection the peer aborted before it was accepted
    backlog: VecDeque<Option<Arc<TcpStream>>>,
    closed: usize,
}

impl TcpListener {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            inner: Default::default(),
            notify: Default::default(),
        })
    }

    pub fn connect(&self, stream: Arc<TcpStream>) {
        self.inner.lock().unwrap().backlog.push_back(Some(stream));
        self.notify.data_ready();
    }

    pub fn connect_aborted(&self) {
        self.inner.lock().unwrap().backlog.push_back(None);
        self.notify.data_ready();
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().unwrap().closed
    }
}

impl Watch for TcpListener {
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        self.notify.set(readiness);
        Ok(())
    }

    fn close(&self) {
        self.inner.lock().unwrap().closed += 1;
    }
}

impl ListenSocket for TcpListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }

    fn accept(&self) -> io::Result<(Box<dyn StreamSocket>, SocketAddr)> {
        match self.inner.lock().unwrap().backlog.pop_front() {
            Some(Some(stream)) => {
                let peer = stream.peer;
                Ok((Box::new(stream), peer))
            }
            Some(None) => Err(io::ErrorKind::ConnectionAborted.into()),
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }
}

/// Port mapper that remembers every registration.
#[derive(Default)]
pub struct Portmap {
    entries: Mutex<Vec<(Program, Protocol, u16)>>,
}

impl Portmap {
    pub fn entries(&self) -> Vec<(Program, Protocol, u16)> {
        self.entries.lock().unwrap().clone()
    }
}

impl Register for Portmap {
    fn register(&self, program: Program, protocol: Protocol, port: u16) -> io::Result<()> {
        self.entries.lock().unwrap().push((program, protocol, port));
        Ok(())
    }
}
