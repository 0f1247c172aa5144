//! Snapshot retrieval.
//!
//! GET_SNAPSHOT returns the metadata of the next stored snapshot, and
//! GET_SNAPSHOT_PAGE then returns its samples. The device advances its read
//! position on every page, so a failed page cannot be re-read: any transport
//! failure ends the retrieval.

use tracing::{debug, info, warn};

use super::{Effect, Event, ProtocolMachine, invalid};
use crate::error::ProtocolError;
use crate::payload::{RetrievedSnapshot, SnapshotPayload};
use crate::protocol::constants::{RESPONSE_SIZE, SNAPSHOT_PAGE_SIZE};
use crate::protocol::{Command, SnapshotMeta};
use crate::transport::TransportError;

/// `index` counts snapshots already emitted.
#[derive(Debug, Clone, PartialEq)]
pub enum RetrievalState {
    Idle,
    RequestMeta { index: usize },
    AwaitMeta { index: usize },
    RequestPage { index: usize, meta: SnapshotMeta },
    AwaitPage { index: usize, meta: SnapshotMeta },
    Emitting { index: usize },
    /// The device reported no further snapshots.
    NoMoreData { count: usize },
    Failed { count: usize },
}

impl RetrievalState {
    /// Snapshots emitted so far.
    pub fn emitted(&self) -> usize {
        match *self {
            RetrievalState::Idle => 0,
            RetrievalState::RequestMeta { index }
            | RetrievalState::AwaitMeta { index }
            | RetrievalState::RequestPage { index, .. }
            | RetrievalState::AwaitPage { index, .. } => index,
            RetrievalState::Emitting { index } => index + 1,
            RetrievalState::NoMoreData { count } | RetrievalState::Failed { count } => count,
        }
    }
}

fn request_meta(index: usize) -> (RetrievalState, Effect<RetrievedSnapshot>) {
    (
        RetrievalState::RequestMeta { index },
        Effect::Send(Command::GetSnapshot.encode()),
    )
}

fn abort(
    count: usize,
    stage: &'static str,
    source: TransportError,
) -> (RetrievalState, Effect<RetrievedSnapshot>) {
    (
        RetrievalState::Failed { count },
        Effect::Abort(ProtocolError::aborted(stage, source)),
    )
}

fn empty_response() -> TransportError {
    TransportError::ReadFailed("empty response".into())
}

/// The retrieval transition function.
pub fn transition(
    state: RetrievalState,
    event: Event,
) -> (RetrievalState, Effect<RetrievedSnapshot>) {
    match (state, event) {
        (RetrievalState::Idle, Event::Begin) => request_meta(0),

        (RetrievalState::RequestMeta { index }, Event::Sent) => (
            RetrievalState::AwaitMeta { index },
            Effect::Receive(RESPONSE_SIZE),
        ),
        (RetrievalState::RequestMeta { index }, Event::SendFailed(e)) => {
            abort(index, "snapshot meta request", e)
        }

        (RetrievalState::AwaitMeta { index }, Event::Received(frame)) => {
            if frame.is_empty() {
                return abort(index, "snapshot meta", empty_response());
            }
            match SnapshotMeta::validity(&frame) {
                Ok(false) => (
                    RetrievalState::NoMoreData { count: index },
                    Effect::Finish,
                ),
                Ok(true) => match SnapshotMeta::decode(&frame) {
                    Ok(meta) => (
                        RetrievalState::RequestPage { index, meta },
                        Effect::Send(Command::GetSnapshotPage.encode()),
                    ),
                    Err(e) => (
                        RetrievalState::Failed { count: index },
                        Effect::Abort(e.into()),
                    ),
                },
                Err(e) => (
                    RetrievalState::Failed { count: index },
                    Effect::Abort(e.into()),
                ),
            }
        }
        (RetrievalState::AwaitMeta { index }, Event::ReceiveFailed(e)) => {
            abort(index, "snapshot meta", e)
        }

        (RetrievalState::RequestPage { index, meta }, Event::Sent) => (
            RetrievalState::AwaitPage { index, meta },
            Effect::Receive(SNAPSHOT_PAGE_SIZE),
        ),
        (RetrievalState::RequestPage { index, .. }, Event::SendFailed(e)) => {
            abort(index, "snapshot page request", e)
        }

        (RetrievalState::AwaitPage { index, meta }, Event::Received(page)) => {
            if page.is_empty() {
                return abort(index, "snapshot page", empty_response());
            }
            (
                RetrievalState::Emitting { index },
                Effect::Emit(RetrievedSnapshot {
                    index,
                    meta,
                    payload: SnapshotPayload::from_page(page),
                }),
            )
        }
        (RetrievalState::AwaitPage { index, .. }, Event::ReceiveFailed(e)) => {
            abort(index, "snapshot page", e)
        }

        (RetrievalState::Emitting { index }, Event::Emitted) => request_meta(index + 1),

        (state, event) => {
            let err = invalid(&state, &event);
            (
                RetrievalState::Failed {
                    count: state.emitted(),
                },
                Effect::Abort(err),
            )
        }
    }
}

/// Reads every stored snapshot until the device signals the end.
#[derive(Debug)]
pub struct SnapshotRetrieval {
    state: RetrievalState,
}

impl SnapshotRetrieval {
    pub fn new() -> Self {
        Self {
            state: RetrievalState::Idle,
        }
    }

    /// Snapshots emitted so far.
    pub fn emitted(&self) -> usize {
        self.state.emitted()
    }
}

impl Default for SnapshotRetrieval {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolMachine for SnapshotRetrieval {
    type Output = RetrievedSnapshot;
    type State = RetrievalState;

    fn step(&mut self, event: Event) -> Effect<RetrievedSnapshot> {
        let state = std::mem::replace(&mut self.state, RetrievalState::Idle);
        let (next, effect) = transition(state, event);
        match &next {
            RetrievalState::AwaitPage { index, meta } => {
                debug!(index, timestamp = %meta.timestamp, "Reading snapshot page");
            }
            RetrievalState::NoMoreData { count } => info!(count, "No more snapshots"),
            RetrievalState::Failed { count } => warn!(count, "Snapshot retrieval failed"),
            _ => {}
        }
        self.state = next;
        effect
    }

    fn state(&self) -> &RetrievalState {
        &self.state
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            RetrievalState::NoMoreData { .. } | RetrievalState::Failed { .. }
        )
    }

    fn abort(&mut self) {
        let count = self.state.emitted();
        warn!(count, "Snapshot retrieval stopped by caller");
        self.state = RetrievalState::Failed { count };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{MSG_GET_SNAPSHOT, MSG_GET_SNAPSHOT_PAGE, SNAPSHOT_SIZE};
    use crate::protocol::snapshot_meta::encode_for_test;
    use crate::state::drive;
    use crate::transport::MockTransport;

    fn queue_snapshot(mock: &MockTransport, secs: u32, fill: u8) {
        mock.queue_response(&encode_for_test(true, secs, 0, 1024 + 200, 400));
        mock.queue_response(&vec![fill; SNAPSHOT_PAGE_SIZE]);
    }

    fn queue_end(mock: &MockTransport) {
        mock.queue_response(&encode_for_test(false, 0, 0, 0, 0));
    }

    #[test]
    fn test_emits_every_snapshot_then_stops() {
        let mock = MockTransport::new();
        for i in 0..3 {
            queue_snapshot(&mock, 1_600_000_000 + i, i as u8 + 1);
        }
        queue_end(&mock);

        let mut machine = SnapshotRetrieval::new();
        let mut got = Vec::new();
        drive(&mut machine, &mock, |s| {
            got.push(s);
            Ok(())
        })
        .unwrap();

        assert_eq!(got.len(), 3);
        assert_eq!(machine.state(), &RetrievalState::NoMoreData { count: 3 });
        for (i, snapshot) in got.iter().enumerate() {
            assert_eq!(snapshot.index, i);
            assert_eq!(snapshot.meta.timestamp.timestamp(), 1_600_000_000 + i as i64);
            assert_eq!(snapshot.payload.len(), SNAPSHOT_SIZE);
            assert_eq!(snapshot.payload.as_bytes()[0], i as u8 + 1);
        }
        assert_eq!(
            mock.written_opcodes(),
            vec![
                MSG_GET_SNAPSHOT,
                MSG_GET_SNAPSHOT_PAGE,
                MSG_GET_SNAPSHOT,
                MSG_GET_SNAPSHOT_PAGE,
                MSG_GET_SNAPSHOT,
                MSG_GET_SNAPSHOT_PAGE,
                MSG_GET_SNAPSHOT,
            ]
        );
        assert_eq!(
            mock.get_read_lengths(),
            vec![
                RESPONSE_SIZE,
                SNAPSHOT_PAGE_SIZE,
                RESPONSE_SIZE,
                SNAPSHOT_PAGE_SIZE,
                RESPONSE_SIZE,
                SNAPSHOT_PAGE_SIZE,
                RESPONSE_SIZE,
            ]
        );
    }

    #[test]
    fn test_empty_device() {
        let mock = MockTransport::new();
        queue_end(&mock);

        let mut machine = SnapshotRetrieval::new();
        let mut count = 0;
        drive(&mut machine, &mock, |_| {
            count += 1;
            Ok(())
        })
        .unwrap();

        assert_eq!(count, 0);
        assert!(machine.is_terminal());
        assert_eq!(mock.written_opcodes(), vec![MSG_GET_SNAPSHOT]);
    }

    #[test]
    fn test_page_failure_at_item_k() {
        // Pages 1 and 2 arrive, the third page read fails.
        let k = 3;
        let mock = MockTransport::new();
        for i in 0..k - 1 {
            queue_snapshot(&mock, i as u32, 0);
        }
        mock.queue_response(&encode_for_test(true, 99, 0, 0, 0));
        mock.queue_read_failure();
        queue_snapshot(&mock, 100, 0);
        queue_end(&mock);

        let mut machine = SnapshotRetrieval::new();
        let mut count = 0;
        let err = drive(&mut machine, &mock, |_| {
            count += 1;
            Ok(())
        })
        .unwrap_err();

        assert_eq!(count, k - 1);
        assert_eq!(machine.state(), &RetrievalState::Failed { count: k - 1 });
        assert!(matches!(
            err,
            ProtocolError::TransferAborted {
                stage: "snapshot page",
                ..
            }
        ));
        // No retry and nothing read past the failure.
        assert_eq!(mock.pending_responses(), 3);
    }

    #[test]
    fn test_short_page_is_padded() {
        let mock = MockTransport::new();
        mock.queue_response(&encode_for_test(true, 5, 0, 0, 0));
        mock.queue_response(&[0xEE; 100]);
        queue_end(&mock);

        let mut machine = SnapshotRetrieval::new();
        let mut got = Vec::new();
        drive(&mut machine, &mock, |s| {
            got.push(s);
            Ok(())
        })
        .unwrap();

        let bytes = got[0].payload.as_bytes();
        assert_eq!(bytes.len(), SNAPSHOT_SIZE);
        assert_eq!(bytes[99], 0xEE);
        assert_eq!(bytes[100], 0);
    }

    #[test]
    fn test_empty_page_aborts() {
        let mock = MockTransport::new();
        mock.queue_response(&encode_for_test(true, 5, 0, 0, 0));
        mock.queue_response(&[]);

        let mut machine = SnapshotRetrieval::new();
        let err = drive(&mut machine, &mock, |_| Ok(())).unwrap_err();
        assert!(matches!(err, ProtocolError::TransferAborted { .. }));
    }

    #[test]
    fn test_truncated_meta_is_malformed() {
        let mock = MockTransport::new();
        let frame = encode_for_test(true, 5, 0, 0, 0);
        mock.queue_response(&frame[..10]);

        let mut machine = SnapshotRetrieval::new();
        let err = drive(&mut machine, &mock, |_| Ok(())).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(machine.state(), &RetrievalState::Failed { count: 0 });
        // The page was never requested.
        assert_eq!(mock.written_opcodes(), vec![MSG_GET_SNAPSHOT]);
    }

    #[test]
    fn test_meta_send_failure() {
        let mock = MockTransport::new();
        queue_snapshot(&mock, 1, 0);
        queue_end(&mock);
        mock.fail_writes_after(2);

        let mut machine = SnapshotRetrieval::new();
        let mut count = 0;
        let err = drive(&mut machine, &mock, |_| {
            count += 1;
            Ok(())
        })
        .unwrap_err();
        assert_eq!(count, 1);
        assert!(matches!(
            err,
            ProtocolError::TransferAborted {
                stage: "snapshot meta request",
                ..
            }
        ));
    }

    #[test]
    fn test_caller_can_stop_retrieval() {
        let mock = MockTransport::new();
        queue_snapshot(&mock, 1, 0);
        queue_snapshot(&mock, 2, 0);

        let mut machine = SnapshotRetrieval::new();
        let err = drive(&mut machine, &mock, |_| {
            Err(ProtocolError::SnapshotLimit { limit: 1 })
        })
        .unwrap_err();
        assert!(matches!(err, ProtocolError::SnapshotLimit { limit: 1 }));
        assert_eq!(machine.emitted(), 1);
        assert!(machine.is_terminal());
        assert_eq!(machine.state(), &RetrievalState::Failed { count: 1 });
        // The second snapshot was never requested.
        assert_eq!(mock.pending_responses(), 2);
    }

    #[test]
    fn test_unexpected_event_is_rejected() {
        let (state, effect) = transition(RetrievalState::Idle, Event::Sent);
        assert_eq!(state, RetrievalState::Failed { count: 0 });
        assert!(matches!(
            effect,
            Effect::Abort(ProtocolError::InvalidTransition { .. })
        ));

        let (state, effect) =
            transition(RetrievalState::NoMoreData { count: 4 }, Event::Begin);
        assert_eq!(state, RetrievalState::Failed { count: 4 });
        assert!(matches!(effect, Effect::Abort(_)));
    }
}
