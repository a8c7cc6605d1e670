/*!
    register access to the motor board through its uart link

    The central resource is the [RegisterClient] which owns the [Transport] and serializes every exchange on it,
    so that at most one request is in flight on the wire whatever the task issuing it.

    - [Transport] sends bytes and receives an exact amount of bytes within a deadline
    - [RegisterClient] speaks the register protocol of [crate::frame] on top of it and never fails past its boundary:
      writes report a `bool`, reads an `Option`
*/

/// byte level access to the serial port
mod transport;
/// register protocol, this is the tricky part of the code
mod client;


pub use transport::{Transport, TransportError};
pub use client::RegisterClient;

use thiserror::Error;
use crate::frame::FrameError;

/// failure of one register exchange, only used for diagnostics
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameError),
    #[error("write rejected by the board")]
    Rejected,
}
impl LinkError {
    /// whether stray input may be left on the wire after this error
    fn desynchronizes(&self) -> bool {
        match self {
            LinkError::Transport(TransportError::Closed) => false,
            LinkError::Transport(_) => true,
            LinkError::Protocol(FrameError::PayloadTooLong(_)) => false,
            LinkError::Protocol(_) => true,
            LinkError::Rejected => false,
        }
    }
}
