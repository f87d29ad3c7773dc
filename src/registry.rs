//! Service registry and dispatch queue.
//!
//! A [`Registry`] holds every socket of one service, the queue of sockets
//! that have work but no worker, and the queue of workers that have no work.
//! A ready socket is handed to an idle worker right away if there is one, so
//! under the registry lock at most one of the two queues is non-empty.
//!
//! The registry lock only ever covers list operations. Sockets are never
//! locked while it is held; the other way round is fine.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use crossbeam::channel::{after, bounded, never, select, unbounded, Receiver, SendError, Sender};
use tracing::{debug, info, trace, warn};

use crate::{
    common::{Config, Protocol},
    error::{Error, Result},
    facade::{DatagramSocket, ListenSocket, Register, StreamSocket},
    sock::{SvcSock, Xprt},
    stats::{Latency, LocalLatency, Stats},
};

pub type WorkerId = usize;

pub struct Registry {
    config: Config,
    portmap: Arc<dyn Register>,
    inner: Mutex<Inner>,
    next_sock: AtomicU64,
    next_worker: AtomicUsize,
    n_worker: AtomicUsize,
    stats: Stats,
    latency: Mutex<Latency>,
}

#[derive(Default)]
struct Inner {
    all: Vec<Arc<SvcSock>>,
    ready: VecDeque<Arc<SvcSock>>,
    idle: VecDeque<Idle>,
    n_temp: usize,
    registered: Vec<Protocol>,
}

struct Idle {
    id: WorkerId,
    assign: Sender<Arc<SvcSock>>,
}

impl Registry {
    pub fn new(config: Config, portmap: Arc<dyn Register>) -> Arc<Self> {
        Arc::new(Self {
            config,
            portmap,
            inner: Mutex::new(Inner::default()),
            next_sock: AtomicU64::new(1),
            next_worker: AtomicUsize::new(0),
            n_worker: AtomicUsize::new(0),
            stats: Stats::default(),
            latency: Mutex::new(Latency::new("dispatch")),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn n_worker(&self) -> usize {
        self.n_worker.load(Ordering::SeqCst)
    }

    pub fn latency_local(&self) -> LocalLatency {
        self.latency.lock().unwrap().local()
    }

    pub fn latency_report(&self) -> String {
        let mut latency = self.latency.lock().unwrap();
        latency.refresh();
        latency.to_string()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn sockets(&self) -> Vec<Arc<SvcSock>> {
        self.inner().all.clone()
    }

    pub fn idle_count(&self) -> usize {
        self.inner().idle.len()
    }

    pub fn ready_count(&self) -> usize {
        self.inner().ready.len()
    }

    pub fn worker(self: &Arc<Self>) -> Worker {
        self.n_worker.fetch_add(1, Ordering::SeqCst);
        let (assign_tx, assign_rx) = unbounded();
        // at most one interrupt pending, like a signal
        let (interrupt_tx, interrupt_rx) = bounded(1);
        Worker {
            id: self.next_worker.fetch_add(1, Ordering::SeqCst),
            registry: self.clone(),
            assign_tx,
            assign_rx,
            interrupt_tx,
            interrupt_rx,
        }
    }

    /// Serve the program on a bound datagram socket.
    pub fn add_udp(self: &Arc<Self>, socket: Box<dyn DatagramSocket>) -> io::Result<Arc<SvcSock>> {
        let port = socket.local_addr()?.port();
        self.register(Protocol::Udp, port)?;
        self.setup(Xprt::Udp(socket), None, false)
    }

    /// Serve the program on a listening socket.
    pub fn add_listener(
        self: &Arc<Self>,
        listener: Box<dyn ListenSocket>,
    ) -> io::Result<Arc<SvcSock>> {
        let port = listener.local_addr()?.port();
        self.register(Protocol::Tcp, port)?;
        self.setup(Xprt::Listener(listener), None, false)
    }

    /// Wrap a freshly accepted connection.
    pub(crate) fn add_stream(
        self: &Arc<Self>,
        stream: Box<dyn StreamSocket>,
        peer: SocketAddr,
    ) -> io::Result<Arc<SvcSock>> {
        let sock = self.setup(Xprt::Stream(stream), Some(peer), true)?;
        self.limit_connections();
        Ok(sock)
    }

    fn register(&self, protocol: Protocol, port: u16) -> io::Result<()> {
        self.portmap.register(self.config.program, protocol, port)?;
        info!(
            "registered program {} on {} port {}",
            self.config.program, protocol, port
        );
        let mut inner = self.inner();
        if !inner.registered.contains(&protocol) {
            inner.registered.push(protocol);
        }
        Ok(())
    }

    fn setup(
        self: &Arc<Self>,
        xprt: Xprt,
        peer: Option<SocketAddr>,
        temp: bool,
    ) -> io::Result<Arc<SvcSock>> {
        let id = self.next_sock.fetch_add(1, Ordering::SeqCst);
        let sock = SvcSock::new(id, xprt, peer, temp, Arc::downgrade(self));
        {
            let mut inner = self.inner();
            inner.all.push(sock.clone());
            if temp {
                inner.n_temp += 1;
            }
        }
        if let Err(err) = sock.watch() {
            self.delete_socket(&sock);
            return Err(err);
        }
        debug!("socket {} set up as {:?}", id, sock.kind());
        sock.precharge();
        Ok(sock)
    }

    /// Second half of enqueueing, called with the socket lock held.
    pub(crate) fn enqueue(&self, sock: Arc<SvcSock>) {
        let mut inner = self.inner();
        while let Some(idle) = inner.idle.pop_front() {
            debug_assert!(inner.ready.is_empty());
            let assigned = sock.clone();
            assigned.get();
            match idle.assign.send(assigned) {
                Ok(()) => {
                    trace!("socket {} assigned to worker {}", sock.id(), idle.id);
                    return;
                }
                Err(SendError(assigned)) => assigned.unget(),
            }
        }
        trace!("socket {} queued", sock.id());
        sock.set_queued(true);
        inner.ready.push_back(sock);
    }

    /// Take the socket out of service. The underlying socket is released
    /// now if no worker holds it, otherwise by the last one to let go.
    pub fn delete_socket(&self, sock: &SvcSock) {
        let mut flags = sock.flags();
        if flags.dead {
            return;
        }
        flags.dead = true;
        flags.close = true;
        {
            let mut inner = self.inner();
            inner.all.retain(|other| other.id() != sock.id());
            if sock.is_queued() {
                inner.ready.retain(|other| other.id() != sock.id());
                sock.set_queued(false);
            }
            if sock.is_temp() {
                inner.n_temp -= 1;
            }
        }
        drop(flags);
        info!("socket {} deleted", sock.id());
        if sock.in_use() == 0 {
            sock.free();
        }
    }

    fn limit_connections(&self) {
        let limit = self.config.connection_limit(self.n_worker());
        let temp: Vec<_> = {
            let inner = self.inner();
            if inner.n_temp <= limit {
                return;
            }
            inner.all.iter().filter(|sock| sock.is_temp()).cloned().collect()
        };
        // connections already closing do not count as a choice
        let oldest = temp
            .iter()
            .filter_map(|sock| {
                let flags = sock.flags();
                (!flags.close).then(|| (flags.last_used, sock))
            })
            .min_by_key(|(last_used, _)| *last_used)
            .map(|(_, sock)| sock);
        if let Some(oldest) = oldest {
            warn!(
                "too many open connections ({} > {}), closing socket {}",
                temp.len(),
                limit,
                oldest.id()
            );
            let mut flags = oldest.flags();
            flags.close = true;
            oldest.enqueue_locked(&mut flags);
        }
    }

    /// Close accepted connections that nobody used for longer than the
    /// configured age.
    pub fn age_temp_sockets(&self) {
        let max_age = self.config.connection_max_age;
        let temp: Vec<_> = self
            .inner()
            .all
            .iter()
            .filter(|sock| sock.is_temp())
            .cloned()
            .collect();
        for sock in temp {
            let mut flags = sock.flags();
            if flags.busy || flags.close || sock.in_use() > 0 {
                continue;
            }
            if flags.last_used.elapsed() < max_age {
                continue;
            }
            debug!("socket {} aged out", sock.id());
            flags.close = true;
            sock.enqueue_locked(&mut flags);
        }
    }

    /// Delete every socket and withdraw the port mapper registrations.
    pub fn shutdown(&self) {
        let (all, registered) = {
            let inner = self.inner();
            (inner.all.clone(), inner.registered.clone())
        };
        for sock in &all {
            self.delete_socket(sock);
        }
        for protocol in registered {
            if let Err(err) = self.portmap.register(self.config.program, protocol, 0) {
                warn!("failed to unregister {}: {}", protocol, err);
            }
        }
        info!("service shut down, {} sockets deleted", all.len());
    }
}

/// Handle of one worker thread on the registry.
pub struct Worker {
    id: WorkerId,
    registry: Arc<Registry>,
    assign_tx: Sender<Arc<SvcSock>>,
    assign_rx: Receiver<Arc<SvcSock>>,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
}

/// Cancels a worker's wait for work, like a signal would.
#[derive(Clone)]
pub struct Interrupter(Sender<()>);

impl Interrupter {
    pub fn interrupt(&self) {
        // full: one is already pending; disconnected: worker is gone
        let _ = self.0.try_send(());
    }
}

impl Worker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter(self.interrupt_tx.clone())
    }

    /// Claim a ready socket, waiting for one if there is none. On success
    /// the worker holds a reference on the socket and is the only one
    /// working it.
    ///
    /// A pending interrupt cuts the wait short with `Interrupted`, running
    /// out of `timeout` gives `Timeout`. A socket assigned concurrently with
    /// either still wins.
    pub fn acquire_work(&mut self, timeout: Option<Duration>) -> Result<Arc<SvcSock>> {
        let mut inner = self.registry.inner();
        if let Some(sock) = inner.ready.pop_front() {
            debug_assert!(inner.idle.is_empty());
            sock.set_queued(false);
            sock.get();
            trace!("worker {} took socket {}", self.id, sock.id());
            return Ok(sock);
        }
        inner.idle.push_back(Idle {
            id: self.id,
            assign: self.assign_tx.clone(),
        });
        drop(inner);

        let deadline = timeout.map(after).unwrap_or_else(never);
        let error = select! {
            recv(self.assign_rx) -> sock => match sock {
                Ok(sock) => return Ok(sock),
                Err(_) => Error::Interrupted,
            },
            recv(self.interrupt_rx) -> _ => Error::Interrupted,
            recv(deadline) -> _ => Error::Timeout,
        };

        let mut inner = self.registry.inner();
        inner.idle.retain(|idle| idle.id != self.id);
        if let Ok(sock) = self.assign_rx.try_recv() {
            return Ok(sock);
        }
        Err(error)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.registry.n_worker.fetch_sub(1, Ordering::SeqCst);
    }
}
