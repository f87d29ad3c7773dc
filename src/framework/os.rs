//! Network stack on OS sockets, with mio for readiness.
//!
//! One [`Poller`] thread waits on the mio poll and turns events into
//! [`Readiness`] calls. Sockets are plain std sockets in non-blocking mode,
//! registered with the poll by file descriptor. mio is edge-triggered, which
//! the transport copes with by draining a socket before it gives it back.

use std::{
    collections::HashMap,
    io::{self, Read, Write},
    net::{self, Shutdown, SocketAddr, ToSocketAddrs},
    os::unix::io::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use mio::{event::Event, unix::SourceFd, Events, Interest, Poll, Token};
use tracing::{debug, info};

use crate::{
    common::{Program, Protocol},
    facade::{
        Checksum, Datagram, DatagramSocket, ListenSocket, Readiness, Register, StreamSocket,
        Watch,
    },
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MAX_DATAGRAM: usize = 65536;
const PEEK_LEN: usize = 4096;

struct Watcher {
    readiness: Weak<dyn Readiness>,
    // connected stream: errors and hangups are state changes
    stream: bool,
}

pub struct Reactor {
    registry: mio::Registry,
    table: Mutex<HashMap<Token, Watcher>>,
    next_token: AtomicUsize,
}

impl Reactor {
    fn watch(&self, fd: RawFd, stream: bool, readiness: Weak<dyn Readiness>) -> io::Result<Token> {
        let token = Token(self.next_token.fetch_add(1, Ordering::SeqCst));
        self.table
            .lock()
            .unwrap()
            .insert(token, Watcher { readiness, stream });
        if let Err(err) = self
            .registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            self.table.lock().unwrap().remove(&token);
            return Err(err);
        }
        Ok(token)
    }

    fn unwatch(&self, fd: RawFd, token: Token) {
        self.table.lock().unwrap().remove(&token);
        if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
            debug!("deregister fd {}: {}", fd, err);
        }
    }

    fn dispatch(&self, event: &Event) {
        let (readiness, stream) = match self.table.lock().unwrap().get(&event.token()) {
            Some(watcher) => (watcher.readiness.upgrade(), watcher.stream),
            None => return,
        };
        let readiness = match readiness {
            Some(readiness) => readiness,
            None => return,
        };
        if event.is_readable() || (!stream && event.is_error()) {
            readiness.data_ready();
        }
        if stream && (event.is_read_closed() || event.is_error()) {
            readiness.state_change();
        }
    }
}

pub struct Poller {
    poll: Poll,
    reactor: Arc<Reactor>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let reactor = Arc::new(Reactor {
            registry: poll.registry().try_clone()?,
            table: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
        });
        Ok(Self { poll, reactor })
    }

    pub fn reactor(&self) -> Arc<Reactor> {
        self.reactor.clone()
    }

    /// Deliver readiness until `shutdown` says stop, checked at least every
    /// 100ms.
    pub fn run(&mut self, mut shutdown: impl FnMut() -> bool) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        while !shutdown() {
            match self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            for event in &events {
                self.reactor.dispatch(event);
            }
        }
        Ok(())
    }
}

struct Watched {
    reactor: Arc<Reactor>,
    fd: RawFd,
    token: Mutex<Option<Token>>,
}

impl Watched {
    fn new(reactor: &Arc<Reactor>, fd: RawFd) -> Self {
        Self {
            reactor: reactor.clone(),
            fd,
            token: Mutex::new(None),
        }
    }

    fn watch(&self, stream: bool, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        let mut token = self.token.lock().unwrap();
        if let Some(token) = token.take() {
            self.reactor.unwatch(self.fd, token);
        }
        *token = Some(self.reactor.watch(self.fd, stream, readiness)?);
        Ok(())
    }

    fn unwatch(&self) {
        if let Some(token) = self.token.lock().unwrap().take() {
            self.reactor.unwatch(self.fd, token);
        }
    }
}

impl Drop for Watched {
    fn drop(&mut self) {
        self.unwatch();
    }
}

pub struct UdpSocket {
    // drops before the socket, so the fd is still open on deregister
    watched: Watched,
    socket: net::UdpSocket,
}

impl UdpSocket {
    pub fn bind(reactor: &Arc<Reactor>, addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = net::UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            watched: Watched::new(reactor, socket.as_raw_fd()),
            socket,
        })
    }
}

impl Watch for UdpSocket {
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        self.watched.watch(false, readiness)
    }

    fn close(&self) {
        self.watched.unwatch();
    }
}

impl DatagramSocket for UdpSocket {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn recv_datagram(&self) -> io::Result<Datagram> {
        let mut payload = vec![0; MAX_DATAGRAM];
        let (len, peer) = self.socket.recv_from(&mut payload)?;
        payload.truncate(len);
        Ok(Datagram {
            peer,
            payload,
            // the kernel drops datagrams that fail it
            checksum: Checksum::Verified,
        })
    }

    fn send_datagram(&self, peer: SocketAddr, bytes: &[u8]) -> io::Result<usize> {
        self.socket.send_to(bytes, peer)
    }
}

pub struct TcpListener {
    watched: Watched,
    listener: net::TcpListener,
}

impl TcpListener {
    pub fn bind(reactor: &Arc<Reactor>, addr: impl ToSocketAddrs) -> io::Result<Self> {
        let listener = net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            watched: Watched::new(reactor, listener.as_raw_fd()),
            listener,
        })
    }
}

impl Watch for TcpListener {
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        self.watched.watch(false, readiness)
    }

    fn close(&self) {
        self.watched.unwatch();
    }
}

impl ListenSocket for TcpListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept(&self) -> io::Result<(Box<dyn StreamSocket>, SocketAddr)> {
        let (stream, peer) = self.listener.accept()?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let stream = TcpStream {
            watched: Watched::new(&self.watched.reactor, stream.as_raw_fd()),
            stream,
        };
        Ok((Box::new(stream), peer))
    }
}

pub struct TcpStream {
    watched: Watched,
    stream: net::TcpStream,
}

impl TcpStream {
    fn blocking<T>(&self, f: impl FnOnce(&net::TcpStream) -> io::Result<T>) -> io::Result<T> {
        self.stream.set_nonblocking(false)?;
        let result = f(&self.stream);
        self.stream.set_nonblocking(true)?;
        result
    }
}

impl Watch for TcpStream {
    fn watch(&self, readiness: Weak<dyn Readiness>) -> io::Result<()> {
        self.watched.watch(true, readiness)
    }

    fn close(&self) {
        self.watched.unwatch();
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown fd {}: {}", self.watched.fd, err);
        }
    }
}

impl StreamSocket for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn available(&self, limit: usize) -> io::Result<usize> {
        let mut scratch = [0; PEEK_LEN];
        match self.stream.peek(&mut scratch[..limit.min(PEEK_LEN)]) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err),
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<usize> {
        self.blocking(|mut stream| {
            let mut sent = 0;
            while sent < bytes.len() {
                match stream.write(&bytes[sent..]) {
                    Ok(0) => break,
                    Ok(n) => sent += n,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) if sent == 0 => return Err(err),
                    Err(_) => break,
                }
            }
            Ok(sent)
        })
    }
}

/// Port mapper stand-in for hosts without one: records nothing, logs every
/// registration.
#[derive(Debug, Default)]
pub struct LocalRegister;

impl Register for LocalRegister {
    fn register(&self, program: Program, protocol: Protocol, port: u16) -> io::Result<()> {
        if port == 0 {
            info!("unset program {} on {}", program, protocol);
        } else {
            info!("set program {} on {} port {}", program, protocol, port);
        }
        Ok(())
    }
}
