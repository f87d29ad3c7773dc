//! Datagram transport: one datagram is one call, one reply is one datagram.

use std::{io, net::SocketAddr};

use tracing::debug;

use crate::{
    common::Protocol,
    facade::DatagramSocket,
    sock::{Call, Recv, SvcSock},
};

// Errors a datagram socket reports for ICMP messages about earlier sends.
fn is_icmp_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
    )
}

pub(crate) fn receive(sock: &SvcSock, socket: &dyn DatagramSocket) -> io::Result<Recv> {
    let datagram = loop {
        match socket.recv_datagram() {
            Ok(datagram) => break datagram,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Recv::Retry),
            Err(err) if is_icmp_error(&err) => {
                debug!("socket {}: recvfrom returned error: {}", sock.id(), err);
            }
            Err(err) => return Err(err),
        }
    };
    // there may be more queued behind this one
    sock.flags().data += 1;

    if !datagram.checksum_ok() {
        debug!(
            "socket {}: bad checksum from {}, dropped",
            sock.id(),
            datagram.peer
        );
        return Ok(Recv::Nothing);
    }
    if let Some(registry) = sock.registry() {
        registry.stats().count_call(Protocol::Udp);
    }
    Ok(Recv::Call(Call {
        payload: datagram.payload,
        peer: datagram.peer,
        protocol: Protocol::Udp,
    }))
}

pub(crate) fn send(
    sock: &SvcSock,
    socket: &dyn DatagramSocket,
    peer: SocketAddr,
    reply: &[u8],
) -> io::Result<usize> {
    match socket.send_datagram(peer, reply) {
        // an ICMP error left over from an earlier send, not about this one
        Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
            debug!("socket {}: sendto refused, retrying", sock.id());
            socket.send_datagram(peer, reply)
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        common::Config,
        error::Error,
        facade::{Checksum, Datagram},
        registry::Registry,
        simulated::{Portmap, UdpSocket},
        sock::SvcSock,
        tests::TRACING,
    };

    fn setup() -> (Arc<Registry>, Arc<UdpSocket>, Arc<SvcSock>) {
        let registry = Registry::new(Config::default(), Arc::new(Portmap::default()));
        let socket = UdpSocket::new("0.0.0.0:2049".parse().unwrap());
        let sock = registry.add_udp(Box::new(socket.clone())).unwrap();
        (registry, socket, sock)
    }

    fn peer() -> SocketAddr {
        "10.0.0.2:700".parse().unwrap()
    }

    #[test]
    fn empty_socket_retries() {
        *TRACING;
        let (_registry, _socket, sock) = setup();
        assert!(matches!(sock.receive().unwrap(), Recv::Retry));
    }

    #[test]
    fn good_datagram_becomes_call() {
        *TRACING;
        let (registry, socket, sock) = setup();
        socket.queue(peer(), b"\x00\x00\x00\x01hello".to_vec());
        let data = sock.flags_snapshot().data;
        match sock.receive().unwrap() {
            Recv::Call(call) => {
                assert_eq!(call.payload, b"\x00\x00\x00\x01hello");
                assert_eq!(call.peer, peer());
                assert_eq!(call.protocol, Protocol::Udp);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sock.flags_snapshot().data, data + 1);
        assert_eq!(registry.stats().udp_calls(), 1);
    }

    #[test]
    fn corrupted_datagram_never_reaches_dispatch() {
        *TRACING;
        let (registry, socket, sock) = setup();
        socket.queue_datagram(Datagram {
            peer: peer(),
            payload: b"\x00\x00\x00\x01hello".to_vec(),
            checksum: Checksum::Unverified(0x1234),
        });
        let data = sock.flags_snapshot().data;
        assert!(matches!(sock.receive().unwrap(), Recv::Nothing));
        // the next datagram may already be waiting
        assert_eq!(sock.flags_snapshot().data, data + 1);
        assert_eq!(registry.stats().calls(), 0);

        let mut worker = registry.worker();
        socket.deliver_corrupted(peer(), b"\x00\x00\x00\x02".to_vec());
        loop {
            match worker.receive_request(Some(Duration::ZERO)) {
                Err(Error::WouldBlock) => continue,
                Err(Error::Timeout) => break,
                Ok(request) => panic!("corrupted datagram {:#x} dispatched", request.xid),
                Err(err) => panic!("unexpected {}", err),
            }
        }
    }

    #[test]
    fn icmp_error_is_skipped() {
        *TRACING;
        let (_registry, socket, sock) = setup();
        socket.queue_error(io::ErrorKind::ConnectionRefused);
        assert!(matches!(sock.receive().unwrap(), Recv::Retry));

        socket.queue_error(io::ErrorKind::ConnectionRefused);
        socket.queue(peer(), b"\x00\x00\x00\x01".to_vec());
        assert!(matches!(sock.receive().unwrap(), Recv::Call(_)));
    }

    #[test]
    fn refused_send_retried_once() {
        *TRACING;
        let (_registry, socket, sock) = setup();
        socket.refuse_sends(1);
        assert_eq!(sock.send(peer(), b"reply").unwrap(), 5);
        assert_eq!(socket.sent(), vec![(peer(), b"reply".to_vec())]);

        socket.refuse_sends(2);
        let err = sock.send(peer(), b"again").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert_eq!(socket.sent().len(), 1);
    }

    #[test]
    fn blocked_send_is_reported_as_would_block() {
        *TRACING;
        let (_registry, socket, sock) = setup();
        socket.block_sends(true);
        let err = sock.send(peer(), b"reply").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(socket.sent().is_empty());
    }
}
