use std::{mem::replace, net::SocketAddr};

use crate::{
    common::{Opaque, Protocol, ResBuf, Xid},
    facade::{Dispatch, Disposition},
    svc::Request,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logged {
    pub xid: Xid,
    pub protocol: Protocol,
    pub peer: SocketAddr,
    pub arg: Opaque,
}

type Stub = Box<dyn Fn(&mut App, &[u8], &mut ResBuf) -> Disposition + Send + Sync>;

pub struct App {
    dispatch_stub: Stub,
    pub request_log: Vec<Logged>,
}

impl App {
    pub fn new(
        dispatch_stub: impl Fn(&mut App, &[u8], &mut ResBuf) -> Disposition + Send + Sync + 'static,
    ) -> Self {
        Self {
            dispatch_stub: Box::new(dispatch_stub),
            request_log: Vec::new(),
        }
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new(|_, arg, res| {
            res.extend_from_slice(b"reply: ");
            res.extend_from_slice(arg);
            Disposition::Reply
        })
    }
}

impl Dispatch for App {
    fn dispatch(&mut self, request: &mut Request) -> Disposition {
        self.request_log.push(Logged {
            xid: request.xid,
            protocol: request.protocol,
            peer: request.peer,
            arg: request.arg.remaining().to_vec(),
        });
        let dispatch_stub = replace(&mut self.dispatch_stub, Box::new(|_, _, _| unreachable!()));
        let disposition = dispatch_stub(self, request.arg.remaining(), &mut request.res);
        let _ = replace(&mut self.dispatch_stub, dispatch_stub);
        disposition
    }
}
