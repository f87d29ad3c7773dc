use std::io;

use thiserror::Error;

/// Worker-facing failure of a receive or send.
///
/// Only `Io` is a real fault. The rest tell the worker loop why it came back
/// empty-handed so it can decide between calling again and shutting down.
#[derive(Debug, Error)]
pub enum Error {
    /// A socket was serviced but produced no request. It has already been
    /// released and requeued if needed.
    #[error("no request available, try again")]
    WouldBlock,
    #[error("interrupted while waiting for work")]
    Interrupted,
    #[error("timed out waiting for work")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
