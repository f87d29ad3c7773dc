use tracing::trace;

use crate::{
    facade::{Dispatch, Disposition},
    svc::Request,
};

/// Replies with the call body as it came in. Calls without a body are
/// pings, answered with the XID alone.
#[derive(Debug, Default)]
pub struct Echo {
    pub n_call: u64,
}

impl Dispatch for Echo {
    fn dispatch(&mut self, request: &mut Request) -> Disposition {
        self.n_call += 1;
        trace!(
            "echo {:#010x} from {} over {}, {} bytes",
            request.xid,
            request.peer,
            request.protocol,
            request.arg.len()
        );
        request.res.extend_from_slice(request.arg.remaining());
        request.arg.advance(request.arg.len());
        Disposition::Reply
    }
}
