//! Socket wrapper.
//!
//! A [`SvcSock`] owns one socket of the network stack and the bookkeeping
//! that lets readiness notifications and workers cooperate on it:
//!
//! * readiness counters and state bits, behind the wrapper's own lock;
//! * the `busy` bit, which keeps at most one worker on the socket;
//! * a reference count of workers holding the socket, so deletion can be
//!   deferred until the last of them lets go;
//! * for connected TCP sockets, the record being reassembled.
//!
//! Lock order is socket lock first, registry lock second.

use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Instant,
};

use tracing::{info, trace};

use crate::{
    common::{Opaque, Protocol, MARKER_LEN},
    facade::{DatagramSocket, ListenSocket, Readiness, StreamSocket},
    registry::Registry,
    tcp, udp,
};

pub type SockId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Udp,
    TcpListener,
    TcpStream,
}

pub(crate) enum Xprt {
    Udp(Box<dyn DatagramSocket>),
    Listener(Box<dyn ListenSocket>),
    Stream(Box<dyn StreamSocket>),
}

impl Xprt {
    fn kind(&self) -> Kind {
        match self {
            Self::Udp(_) => Kind::Udp,
            Self::Listener(_) => Kind::TcpListener,
            Self::Stream(_) => Kind::TcpStream,
        }
    }

    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        match self {
            Self::Udp(socket) => socket.watch(readiness),
            Self::Listener(listener) => listener.watch(readiness),
            Self::Stream(stream) => stream.watch(readiness),
        }
    }

    fn close(&self) {
        match self {
            Self::Udp(socket) => socket.close(),
            Self::Listener(listener) => listener.close(),
            Self::Stream(stream) => stream.close(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Flags {
    /// Data notifications not yet consumed by a receive.
    pub data: u32,
    /// Connection notifications not yet consumed, listeners only.
    pub conn: u32,
    /// Peer closed or the connection errored. Teardown is due.
    pub close: bool,
    /// Owned by a worker, or on the ready queue waiting for one.
    pub busy: bool,
    /// Deleted. The socket is released when the last reference goes.
    pub dead: bool,
    pub last_used: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// `received` bytes of the record marker are in.
    AwaitingMarker { received: usize },
    /// Marker parsed, `received` of `length` body bytes are in.
    AwaitingBody { length: usize, received: usize },
}

#[derive(Debug)]
pub(crate) struct Record {
    pub marker: [u8; MARKER_LEN],
    pub state: RecordState,
    pub body: Opaque,
}

impl Default for Record {
    fn default() -> Self {
        Self {
            marker: [0; MARKER_LEN],
            state: RecordState::AwaitingMarker { received: 0 },
            body: Opaque::new(),
        }
    }
}

impl Record {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One received call, before the XID is taken off.
#[derive(Debug)]
pub(crate) struct Call {
    pub payload: Opaque,
    pub peer: SocketAddr,
    pub protocol: Protocol,
}

#[derive(Debug)]
pub(crate) enum Recv {
    Call(Call),
    /// Nothing (complete) to read yet.
    Retry,
    /// Handled something that is not a call: an accept, a teardown, a
    /// dropped datagram.
    Nothing,
}

pub struct SvcSock {
    id: SockId,
    xprt: Xprt,
    peer: Option<SocketAddr>,
    temp: bool,
    flags: Mutex<Flags>,
    // on the registry's ready queue; guarded by the registry lock
    queued: AtomicBool,
    in_use: AtomicUsize,
    freed: AtomicBool,
    record: Mutex<Record>,
    registry: Weak<Registry>,
    me: Weak<SvcSock>,
}

impl SvcSock {
    pub(crate) fn new(
        id: SockId,
        xprt: Xprt,
        peer: Option<SocketAddr>,
        temp: bool,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            xprt,
            peer,
            temp,
            flags: Mutex::new(Flags {
                data: 0,
                conn: 0,
                close: false,
                busy: false,
                dead: false,
                last_used: Instant::now(),
            }),
            queued: AtomicBool::new(false),
            in_use: AtomicUsize::new(0),
            freed: AtomicBool::new(false),
            record: Mutex::new(Record::default()),
            registry,
            me: me.clone(),
        })
    }

    pub fn id(&self) -> SockId {
        self.id
    }

    pub fn kind(&self) -> Kind {
        self.xprt.kind()
    }

    /// Remote end of an accepted connection.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Accepted connection, subject to aging and the connection limit.
    pub fn is_temp(&self) -> bool {
        self.temp
    }

    pub fn flags_snapshot(&self) -> Flags {
        self.flags().clone()
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }

    pub fn record_state(&self) -> RecordState {
        self.record().state
    }

    pub(crate) fn flags(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap()
    }

    pub(crate) fn record(&self) -> MutexGuard<'_, Record> {
        self.record.lock().unwrap()
    }

    pub(crate) fn xprt(&self) -> &Xprt {
        &self.xprt
    }

    pub(crate) fn registry(&self) -> Option<Arc<Registry>> {
        self.registry.upgrade()
    }

    pub(crate) fn set_queued(&self, queued: bool) {
        self.queued.store(queued, Ordering::SeqCst);
    }

    /// Data notifications seen so far, the amount a receive may consume.
    pub(crate) fn ready(&self) -> u32 {
        self.flags().data
    }

    pub(crate) fn watch(&self) -> io::Result<()> {
        let readiness: Weak<dyn Readiness> = self.me.clone();
        self.xprt.watch(readiness)
    }

    /// Assume one notification got lost while callbacks were not yet wired,
    /// and get the socket looked at.
    pub(crate) fn precharge(&self) {
        let mut flags = self.flags();
        match self.kind() {
            Kind::TcpListener => flags.conn += 1,
            Kind::Udp | Kind::TcpStream => flags.data += 1,
        }
        self.enqueue_locked(&mut flags);
    }

    pub(crate) fn enqueue(&self) {
        let mut flags = self.flags();
        self.enqueue_locked(&mut flags);
    }

    /// Hand the socket to an idle worker or park it on the ready queue.
    /// Nothing happens for a busy socket: whoever holds it re-checks on
    /// release.
    pub(crate) fn enqueue_locked(&self, flags: &mut Flags) {
        if flags.dead {
            trace!("socket {} is dead, not enqueued", self.id);
            return;
        }
        if flags.busy {
            trace!("socket {} is busy, not enqueued", self.id);
            return;
        }
        let (registry, me) = match (self.registry.upgrade(), self.me.upgrade()) {
            (Some(registry), Some(me)) => (registry, me),
            _ => return,
        };
        flags.busy = true;
        registry.enqueue(me);
    }

    /// Give the socket back after a receive (and, for a call, its reply).
    /// `consumed` data notifications are taken off the counter, and the
    /// socket goes back in the queue if anything is still pending.
    pub(crate) fn received(&self, consumed: u32) {
        let mut flags = self.flags();
        flags.data = flags.data.saturating_sub(consumed);
        flags.busy = false;
        flags.last_used = Instant::now();
        if flags.conn > 0 || flags.data > 0 || flags.close {
            self.enqueue_locked(&mut flags);
        }
    }

    pub(crate) fn get(&self) {
        self.in_use.fetch_add(1, Ordering::SeqCst);
    }

    /// Undo a `get` whose reference never reached a worker. The caller
    /// holds the socket lock, and the socket is known to be alive.
    pub(crate) fn unget(&self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn put(&self) {
        if self.in_use.fetch_sub(1, Ordering::SeqCst) == 1 && self.flags().dead {
            self.free();
        }
    }

    /// Release the underlying socket, at most once.
    pub(crate) fn free(&self) {
        if self.freed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("socket {} released", self.id);
        self.xprt.close();
    }

    pub(crate) fn receive(&self) -> io::Result<Recv> {
        match &self.xprt {
            Xprt::Udp(socket) => udp::receive(self, &**socket),
            Xprt::Listener(_) | Xprt::Stream(_) => tcp::receive(self),
        }
    }

    pub(crate) fn send(&self, peer: SocketAddr, reply: &[u8]) -> io::Result<usize> {
        match &self.xprt {
            Xprt::Udp(socket) => udp::send(self, &**socket, peer, reply),
            Xprt::Stream(stream) => tcp::send(self, &**stream, reply),
            Xprt::Listener(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "send on listening socket",
            )),
        }
    }
}

impl Readiness for SvcSock {
    fn data_ready(&self) {
        let mut flags = self.flags();
        match self.kind() {
            Kind::TcpListener => flags.conn += 1,
            Kind::Udp | Kind::TcpStream => flags.data += 1,
        }
        self.enqueue_locked(&mut flags);
    }

    fn state_change(&self) {
        let mut flags = self.flags();
        flags.close = true;
        self.enqueue_locked(&mut flags);
    }
}
