//! Worker-facing entry points: receive one request, send its reply.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    common::{ArgBuf, Protocol, ResBuf, Xid},
    error::{Error, Result},
    facade::{Dispatch, Disposition},
    registry::Worker,
    sock::{Kind, Recv, SvcSock},
};

/// One call in flight.
///
/// Holds its socket busy until the reply is sent or the request is dropped,
/// whichever way the request goes away.
pub struct Request {
    sock: Arc<SvcSock>,
    // data notifications this request accounts for
    ready: u32,
    pub xid: Xid,
    pub protocol: Protocol,
    pub peer: SocketAddr,
    /// Call bytes, positioned past the XID.
    pub arg: ArgBuf,
    /// Reply bytes, starting with the XID.
    pub res: ResBuf,
}

impl Worker {
    /// Wait for a ready socket and receive one request from it.
    ///
    /// `WouldBlock` means the socket had nothing for us (no complete record,
    /// a dropped datagram, an accepted connection, a teardown); just call
    /// again.
    pub fn receive_request(&mut self, timeout: Option<Duration>) -> Result<Request> {
        let sock = self.acquire_work(timeout)?;
        let ready = sock.ready();
        let call = match sock.receive() {
            Ok(Recv::Call(call)) => call,
            Ok(Recv::Retry | Recv::Nothing) => {
                sock.received(ready);
                sock.put();
                return Err(Error::WouldBlock);
            }
            Err(err) => {
                warn!("socket {}: receive failed: {}", sock.id(), err);
                if sock.kind() == Kind::TcpStream {
                    if let Some(registry) = sock.registry() {
                        registry.delete_socket(&sock);
                    }
                }
                sock.received(ready);
                sock.put();
                return Err(Error::WouldBlock);
            }
        };

        let mut arg = ArgBuf::new(call.payload);
        let xid = match arg.get_u32() {
            Some(xid) => xid,
            None => {
                debug!("socket {}: short request dropped", sock.id());
                sock.received(ready);
                sock.put();
                return Err(Error::WouldBlock);
            }
        };
        let mut res = ResBuf::new();
        res.put_u32(xid);
        Ok(Request {
            sock,
            ready,
            xid,
            protocol: call.protocol,
            peer: call.peer,
            arg,
            res,
        })
    }

    /// Serve requests with `dispatch` until `shutdown` says stop. The
    /// predicate is checked after every wakeup, including interrupts.
    pub fn run(&mut self, dispatch: &mut impl Dispatch, mut shutdown: impl FnMut() -> bool) {
        let mut latency = self.registry().latency_local();
        let timeout = self.registry().config().worker_timeout;
        while !shutdown() {
            let mut request = match self.receive_request(timeout) {
                Ok(request) => request,
                Err(Error::WouldBlock | Error::Timeout | Error::Interrupted) => continue,
                Err(err) => {
                    warn!("worker {}: {}", self.id(), err);
                    continue;
                }
            };
            let measure = latency.measure();
            match dispatch.dispatch(&mut request) {
                Disposition::Reply => {
                    if let Err(err) = request.send_reply() {
                        warn!("worker {}: send failed: {}", self.id(), err);
                    }
                }
                Disposition::Drop => request.drop_request(),
            }
            latency += measure;
        }
        debug!("worker {} exits", self.id());
    }
}

impl Request {
    pub fn socket(&self) -> &Arc<SvcSock> {
        &self.sock
    }

    /// Send `res` to the caller and release the socket. Failures the client
    /// recovers from by retransmitting are reported as success.
    pub fn send_reply(self) -> Result<()> {
        match self.sock.send(self.peer, self.res.as_slice()) {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::NotConnected
                        | io::ErrorKind::WouldBlock
                ) =>
            {
                debug!("reply {:#010x} to {} lost: {}", self.xid, self.peer, err);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Release the socket without replying.
    pub fn drop_request(self) {
        debug!("request {:#010x} from {} dropped", self.xid, self.peer);
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.sock.received(self.ready);
        self.sock.put();
    }
}
