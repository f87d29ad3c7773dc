//! Stream transport.
//!
//! Calls and replies travel as records, each behind a 4-byte big-endian
//! marker whose high bit flags the last fragment and whose low 31 bits give
//! the length. A record that has not fully arrived stays in the socket's
//! reassembly state until a later notification completes it; the receive
//! never waits for it.

use std::{io, mem};

use tracing::{info, trace, warn};

use crate::{
    common::{parse_record_marker, record_marker, Protocol, MARKER_LEN, MAX_FRAGMENT},
    facade::{ListenSocket, StreamSocket},
    sock::{Call, Record, RecordState, Recv, SvcSock, Xprt},
};

// largest single read into a record body
const READ_CHUNK: usize = 64 << 10;

pub(crate) fn receive(sock: &SvcSock) -> io::Result<Recv> {
    let (close, conn) = {
        let flags = sock.flags();
        (flags.close, flags.conn)
    };
    if close {
        if let Some(registry) = sock.registry() {
            registry.delete_socket(sock);
        }
        return Ok(Recv::Nothing);
    }
    match sock.xprt() {
        Xprt::Listener(listener) => {
            if conn > 0 {
                accept(sock, &**listener, conn);
            }
            Ok(Recv::Nothing)
        }
        Xprt::Stream(stream) => receive_record(sock, &**stream),
        Xprt::Udp(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "not a stream socket",
        )),
    }
}

fn accept(sock: &SvcSock, listener: &dyn ListenSocket, pending: u32) {
    match listener.accept() {
        Ok((stream, peer)) => {
            let registry = match sock.registry() {
                Some(registry) => registry,
                None => {
                    stream.close();
                    return;
                }
            };
            match registry.add_stream(stream, peer) {
                Ok(new) => {
                    info!(
                        "socket {}: connection from {} as socket {}",
                        sock.id(),
                        peer,
                        new.id()
                    );
                    registry.stats().count_connection();
                }
                Err(err) => warn!("socket {}: failed to set up connection: {}", sock.id(), err),
            }
            // the pending count stays, another connection may be waiting
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            let mut flags = sock.flags();
            flags.conn = flags.conn.saturating_sub(pending);
        }
        Err(err) => {
            warn!("socket {}: accept failed: {}", sock.id(), err);
            // a failed attempt still uses up one pending connection
            let mut flags = sock.flags();
            flags.conn = flags.conn.saturating_sub(1);
        }
    }
}

fn receive_record(sock: &SvcSock, stream: &dyn StreamSocket) -> io::Result<Recv> {
    let max_record = sock
        .registry()
        .map(|registry| registry.config().max_record)
        .unwrap_or(MAX_FRAGMENT);
    let mut record = sock.record();
    let state = record.state;
    let length = match state {
        RecordState::AwaitingBody { length, .. } => length,
        RecordState::AwaitingMarker { received } => {
            match receive_marker(sock, stream, &mut record, received, max_record)? {
                Some(length) => length,
                None => return Ok(Recv::Retry),
            }
        }
    };

    // read until the body is complete or the socket runs dry, so the next
    // arrival raises a fresh notification
    while record.body.len() < length {
        let received = record.body.len();
        let chunk = (length - received).min(READ_CHUNK);
        record.body.resize(received + chunk, 0);
        let n = match stream.read(&mut record.body[received..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                record.body.truncate(received);
                record.state = RecordState::AwaitingBody { length, received };
                trace!(
                    "socket {}: {} of {} record bytes in",
                    sock.id(),
                    received,
                    length
                );
                return Ok(Recv::Retry);
            }
            Err(err) => return Err(err),
        };
        record.body.truncate(received + n);
    }
    let payload = mem::take(&mut record.body);
    record.reset();
    drop(record);
    // the next record may be in already, with no notification of its own
    if stream.available(1)? > 0 {
        sock.flags().data += 1;
    }

    let peer = match sock.peer() {
        Some(peer) => peer,
        None => stream.peer_addr()?,
    };
    if let Some(registry) = sock.registry() {
        registry.stats().count_call(Protocol::Tcp);
    }
    Ok(Recv::Call(Call {
        payload,
        peer,
        protocol: Protocol::Tcp,
    }))
}

// Some(length) once the marker is complete, None if it is still partial.
fn receive_marker(
    sock: &SvcSock,
    stream: &dyn StreamSocket,
    record: &mut Record,
    mut received: usize,
    max_record: usize,
) -> io::Result<Option<usize>> {
    while received < MARKER_LEN {
        match stream.read(&mut record.marker[received..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))
            }
            Ok(n) => received += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                record.state = RecordState::AwaitingMarker { received };
                trace!("socket {}: {} marker bytes in", sock.id(), received);
                return Ok(None);
            }
            Err(err) => return Err(err),
        }
    }

    let length = parse_record_marker(record.marker).map_err(|err| {
        warn!("socket {}: {}", sock.id(), err);
        err
    })?;
    if length > max_record {
        warn!(
            "socket {}: record of {} bytes over limit {}",
            sock.id(),
            length,
            max_record
        );
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "record too large",
        ));
    }
    record.state = RecordState::AwaitingBody {
        length,
        received: 0,
    };
    Ok(Some(length))
}

pub(crate) fn send(sock: &SvcSock, stream: &dyn StreamSocket, reply: &[u8]) -> io::Result<usize> {
    let mut record = Vec::with_capacity(MARKER_LEN + reply.len());
    record.extend_from_slice(&record_marker(reply.len()));
    record.extend_from_slice(reply);
    let sent = stream.write(&record)?;
    if sent < record.len() {
        // not resumed; the connection is most likely unusable from here
        warn!(
            "socket {}: short write, {} of {} bytes sent",
            sock.id(),
            sent,
            record.len()
        );
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Weak,
        },
        time::Duration,
    };

    use rand::{thread_rng, Rng};

    use super::*;
    use crate::{
        common::{Config, Opaque},
        error::Error,
        facade::{Readiness, Watch},
        registry::{Registry, Worker},
        simulated::{Portmap, TcpListener, TcpStream},
        sock::Kind,
        tests::TRACING,
    };

    fn peer() -> SocketAddr {
        "10.0.0.2:700".parse().unwrap()
    }

    struct Setup {
        registry: Arc<Registry>,
        listener: Arc<TcpListener>,
        worker: Worker,
    }

    fn setup(config: Config) -> Setup {
        let registry = Registry::new(config, Arc::new(Portmap::default()));
        let listener = TcpListener::new("0.0.0.0:2049".parse().unwrap());
        registry.add_listener(Box::new(listener.clone())).unwrap();
        let mut setup = Setup {
            worker: registry.worker(),
            registry,
            listener,
        };
        setup.settle();
        setup
    }

    impl Setup {
        /// Run the worker until no socket has anything left to do.
        fn settle(&mut self) {
            loop {
                match self.worker.receive_request(Some(Duration::ZERO)) {
                    Err(Error::WouldBlock) => continue,
                    Err(Error::Timeout) => return,
                    Ok(request) => panic!("unexpected request {:#x}", request.xid),
                    Err(err) => panic!("unexpected {}", err),
                }
            }
        }

        fn accept(&mut self, stream: &Arc<TcpStream>) -> Arc<SvcSock> {
            self.listener.connect(stream.clone());
            self.settle();
            self.registry
                .sockets()
                .into_iter()
                .find(|sock| sock.peer() == Some(stream.peer()))
                .unwrap()
        }
    }

    fn record(body: &[u8]) -> Opaque {
        let mut record = record_marker(body.len()).to_vec();
        record.extend_from_slice(body);
        record
    }

    fn take_call(sock: &SvcSock) -> Option<Opaque> {
        match sock.receive().unwrap() {
            Recv::Call(call) => {
                assert_eq!(call.protocol, Protocol::Tcp);
                Some(call.payload)
            }
            Recv::Retry => None,
            Recv::Nothing => panic!("stream reported nothing"),
        }
    }

    #[test]
    fn split_record_waits_for_body() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        assert!(!sock.is_queued());

        let body: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let wire = record(&body);
        stream.push(&wire[..54]);
        assert!(sock.is_queued());
        assert!(matches!(
            setup.worker.receive_request(Some(Duration::ZERO)),
            Err(Error::WouldBlock)
        ));
        assert_eq!(
            sock.record_state(),
            RecordState::AwaitingBody {
                length: 100,
                received: 50
            }
        );
        let flags = sock.flags_snapshot();
        assert_eq!(flags.data, 0);
        assert!(!flags.busy);
        assert!(!sock.is_queued());

        stream.push(&wire[54..]);
        let request = setup.worker.receive_request(Some(Duration::ZERO)).unwrap();
        assert_eq!(request.socket().id(), sock.id());
        assert_eq!(request.xid, 0x0001_0203);
        assert_eq!(request.arg.remaining(), &body[4..]);
        drop(request);
        assert_eq!(
            sock.record_state(),
            RecordState::AwaitingMarker { received: 0 }
        );
    }

    #[test]
    fn fragmented_and_whole_record_agree() {
        *TRACING;
        let mut setup = setup(Config::default());
        let body: Vec<u8> = (0..300).map(|i| (i * 7) as u8).collect();
        let wire = record(&body);

        let whole = TcpStream::new(peer());
        let whole_sock = setup.accept(&whole);
        whole.push(&wire);
        let whole_payload = take_call(&whole_sock).unwrap();

        let bytewise = TcpStream::new("10.0.0.3:700".parse().unwrap());
        let bytewise_sock = setup.accept(&bytewise);
        let mut bytewise_payload = None;
        for byte in &wire {
            assert!(bytewise_payload.is_none());
            bytewise.push(&[*byte]);
            bytewise_payload = take_call(&bytewise_sock);
        }

        let random = TcpStream::new("10.0.0.4:700".parse().unwrap());
        let random_sock = setup.accept(&random);
        let mut random_payload = None;
        let mut rng = thread_rng();
        let mut rest = &wire[..];
        while !rest.is_empty() {
            let (chunk, tail) = rest.split_at(rng.gen_range(1..=rest.len().min(17)));
            rest = tail;
            random.push(chunk);
            random_payload = take_call(&random_sock);
        }

        assert_eq!(whole_payload, body);
        assert_eq!(bytewise_payload.unwrap(), whole_payload);
        assert_eq!(random_payload.unwrap(), whole_payload);
        for sock in [&whole_sock, &bytewise_sock, &random_sock] {
            assert_eq!(
                sock.record_state(),
                RecordState::AwaitingMarker { received: 0 }
            );
        }
    }

    #[test]
    fn record_body_read_in_chunks() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        let body: Vec<u8> = (0..3 * READ_CHUNK + 5).map(|i| (i % 251) as u8).collect();
        let wire = record(&body);
        stream.push(&wire[..READ_CHUNK + 100]);
        assert_eq!(take_call(&sock), None);
        assert_eq!(
            sock.record_state(),
            RecordState::AwaitingBody {
                length: body.len(),
                received: READ_CHUNK + 96
            }
        );
        stream.push(&wire[READ_CHUNK + 100..]);
        assert_eq!(take_call(&sock).unwrap(), body);
    }

    struct FailingListener {
        attempts: Arc<AtomicUsize>,
    }

    impl Watch for FailingListener {
        fn watch(&self, _readiness: Weak<dyn Readiness>) -> io::Result<()> {
            Ok(())
        }
        fn close(&self) {}
    }

    impl ListenSocket for FailingListener {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("0.0.0.0:2049".parse().unwrap())
        }
        fn accept(&self) -> io::Result<(Box<dyn StreamSocket>, SocketAddr)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "Too many open files"))
        }
    }

    #[test]
    fn failing_accept_does_not_spin() {
        *TRACING;
        let registry = Registry::new(Config::default(), Arc::new(Portmap::default()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let sock = registry
            .add_listener(Box::new(FailingListener {
                attempts: attempts.clone(),
            }))
            .unwrap();
        for _ in 0..3 {
            sock.data_ready();
        }
        assert_eq!(sock.flags_snapshot().conn, 4);

        let mut worker = registry.worker();
        let mut passes = 0;
        loop {
            match worker.receive_request(Some(Duration::ZERO)) {
                Err(Error::WouldBlock) => passes += 1,
                Err(Error::Timeout) => break,
                Ok(_) => panic!("request from a listener"),
                Err(err) => panic!("unexpected {}", err),
            }
            assert!(passes <= 4, "listener still queued after {} passes", passes);
        }
        assert_eq!(passes, 4);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(sock.flags_snapshot().conn, 0);
        assert_eq!(registry.ready_count(), 0);
        assert!(!sock.is_freed());
    }

    #[test]
    fn back_to_back_records() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        let mut wire = record(b"\x00\x00\x00\x01first");
        wire.extend(record(b"\x00\x00\x00\x02second"));
        stream.push(&wire);
        assert_eq!(take_call(&sock).unwrap(), b"\x00\x00\x00\x01first");
        assert_eq!(take_call(&sock).unwrap(), b"\x00\x00\x00\x02second");
        assert_eq!(take_call(&sock), None);
    }

    #[test]
    fn continuation_marker_is_invalid() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        stream.push(&[0x00, 0x00, 0x00, 0x10]);
        let err = sock.receive().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn broken_stream_torn_down() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        stream.push(&[0x00, 0x00, 0x00, 0x10]);
        stream.push(&[0; 16]);
        setup.settle();

        assert!(sock.is_freed());
        assert_eq!(stream.close_count(), 1);
        assert!(!setup
            .registry
            .sockets()
            .iter()
            .any(|other| other.id() == sock.id()));
        assert_eq!(setup.listener.close_count(), 0);
    }

    #[test]
    fn oversized_record_refused() {
        *TRACING;
        let mut setup = setup(Config {
            max_record: 64,
            ..Config::default()
        });
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        stream.push(&record_marker(65));
        let err = sock.receive().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn data_before_accept_is_received() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        // 20 bytes in before any callback is wired
        stream.push(&record(b"\x12\x34\x56\x78sixteen-byte"));
        setup.listener.connect(stream.clone());

        let request = loop {
            match setup.worker.receive_request(Some(Duration::ZERO)) {
                Ok(request) => break request,
                Err(Error::WouldBlock) => continue,
                Err(err) => panic!("unexpected {}", err),
            }
        };
        assert_eq!(request.xid, 0x1234_5678);
        assert_eq!(request.arg.remaining(), b"sixteen-byte");
        assert_eq!(request.peer, peer());
        assert!(request.socket().is_temp());
        assert_eq!(setup.registry.stats().connections(), 1);
    }

    #[test]
    fn aborted_connection_spares_listener() {
        *TRACING;
        let mut setup = setup(Config::default());
        setup.listener.connect_aborted();
        let stream = TcpStream::new(peer());
        setup.listener.connect(stream.clone());
        setup.settle();

        let sockets = setup.registry.sockets();
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].kind(), Kind::TcpListener);
        assert_eq!(sockets[0].flags_snapshot().conn, 0);
        assert_eq!(sockets[1].peer(), Some(peer()));
        assert_eq!(setup.listener.close_count(), 0);
    }

    #[test]
    fn peer_close_tears_down() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        stream.hang_up();
        setup.settle();
        assert!(sock.is_freed());
        assert_eq!(stream.close_count(), 1);
        assert_eq!(setup.registry.sockets().len(), 1);
    }

    #[test]
    fn reply_is_record_marked() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        assert_eq!(sock.send(peer(), b"\x00\x00\x00\x01done").unwrap(), 12);
        assert_eq!(stream.output(), record(b"\x00\x00\x00\x01done"));
    }

    #[test]
    fn short_write_is_reported() {
        *TRACING;
        let mut setup = setup(Config::default());
        let stream = TcpStream::new(peer());
        let sock = setup.accept(&stream);
        stream.limit_writes(6);
        assert_eq!(sock.send(peer(), b"\x00\x00\x00\x01done").unwrap(), 6);
        assert_eq!(stream.output(), record(b"\x00\x00\x00\x01done")[..6].to_vec());
    }
}
