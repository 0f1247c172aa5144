//! Protocol state machines.
//!
//! Each machine is a pure transition function `(state, event) -> (state,
//! effect)`. Machines never touch the transport themselves; [`drive`]
//! performs the requested effect and feeds its outcome back as the next
//! event. This keeps one request in flight at a time and lets tests step a
//! machine through every state without a device.

pub mod firmware;
pub mod retrieval;

pub use firmware::{FirmwareProgress, FirmwareState, FirmwareUpdate};
pub use retrieval::{RetrievalState, SnapshotRetrieval};

use std::fmt;

use tracing::trace;

use crate::error::ProtocolError;
use crate::transport::{TransportError, UsbTransport};

/// Outcome of the previous effect, fed into the next transition.
#[derive(Debug)]
pub enum Event {
    /// Start the machine.
    Begin,
    /// The requested frame was written.
    Sent,
    SendFailed(TransportError),
    /// A response arrived (possibly empty).
    Received(Vec<u8>),
    ReceiveFailed(TransportError),
    /// The caller accepted an emitted item.
    Emitted,
}

impl Event {
    /// Short name for logs and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Begin => "Begin",
            Event::Sent => "Sent",
            Event::SendFailed(_) => "SendFailed",
            Event::Received(_) => "Received",
            Event::ReceiveFailed(_) => "ReceiveFailed",
            Event::Emitted => "Emitted",
        }
    }
}

/// What the machine wants done next.
#[derive(Debug)]
pub enum Effect<T> {
    /// Write one frame.
    Send(Vec<u8>),
    /// Read one response of at most this many bytes.
    Receive(usize),
    /// Hand an item to the caller.
    Emit(T),
    /// Success terminal.
    Finish,
    /// Failure terminal.
    Abort(ProtocolError),
}

/// A request/response state machine.
pub trait ProtocolMachine {
    /// Item handed to the caller on [`Effect::Emit`].
    type Output;
    type State: fmt::Debug;

    /// Apply one event and return the next effect.
    fn step(&mut self, event: Event) -> Effect<Self::Output>;

    fn state(&self) -> &Self::State;

    fn is_terminal(&self) -> bool;

    /// The caller refused an emitted item. Moves to the failure terminal.
    fn abort(&mut self);
}

/// Rejection for an event the current state does not expect.
pub(crate) fn invalid<S: fmt::Debug>(state: &S, event: &Event) -> ProtocolError {
    ProtocolError::InvalidTransition {
        state: format!("{state:?}"),
        event: event.name().to_string(),
    }
}

/// Run `machine` against `transport` until it finishes or aborts.
///
/// Each emitted item goes to `on_emit`; an error from it aborts the machine
/// and is returned as is.
pub fn drive<M, T, F>(machine: &mut M, transport: &T, mut on_emit: F) -> Result<(), ProtocolError>
where
    M: ProtocolMachine,
    T: UsbTransport + ?Sized,
    F: FnMut(M::Output) -> Result<(), ProtocolError>,
{
    let mut event = Event::Begin;
    loop {
        match machine.step(event) {
            Effect::Send(frame) => {
                trace!(opcode = frame.first().copied(), len = frame.len(), "send");
                event = match transport.write(&frame) {
                    Ok(_) => Event::Sent,
                    Err(e) => Event::SendFailed(e),
                };
            }
            Effect::Receive(max_len) => {
                event = match transport.read(max_len) {
                    Ok(bytes) => {
                        trace!(len = bytes.len(), "receive");
                        Event::Received(bytes)
                    }
                    Err(e) => Event::ReceiveFailed(e),
                };
            }
            Effect::Emit(item) => {
                if let Err(err) = on_emit(item) {
                    machine.abort();
                    return Err(err);
                }
                event = Event::Emitted;
            }
            Effect::Finish => return Ok(()),
            Effect::Abort(err) => return Err(err),
        }
    }
}
