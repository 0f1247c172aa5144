//! Firmware update.
//!
//! FIRMWARE_INIT erases the external flash slot, the image then goes over
//! page by page, FIRMWARE_CRC asks the device what it received, and only a
//! matching CRC is followed by FIRMWARE_FLASH, which copies the slot into
//! internal flash and restarts the receiver.

use tracing::{debug, info, warn};

use super::{Effect, Event, ProtocolMachine, invalid};
use crate::error::ProtocolError;
use crate::payload::FirmwareImage;
use crate::protocol::constants::RESPONSE_SIZE;
use crate::protocol::{Ack, Command};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareState {
    Idle,
    Init,
    AwaitInitAck,
    SendPage { page: usize },
    AwaitPageAck { page: usize },
    PageSent { page: usize },
    RequestCrc,
    AwaitCrc,
    Load,
    AwaitLoadAck,
    /// The device is copying the image and will restart.
    Done,
    Failed,
}

/// Emitted after every acknowledged page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareProgress {
    /// Pages acknowledged so far.
    pub sent: usize,
    pub total: usize,
}

fn abort(stage: &'static str, source: TransportError) -> (FirmwareState, Effect<FirmwareProgress>) {
    (
        FirmwareState::Failed,
        Effect::Abort(ProtocolError::aborted(stage, source)),
    )
}

fn send_page(image: &FirmwareImage, page: usize) -> (FirmwareState, Effect<FirmwareProgress>) {
    match image.page(page) {
        Some(bytes) => (FirmwareState::SendPage { page }, Effect::Send(bytes.to_vec())),
        None => (
            FirmwareState::RequestCrc,
            Effect::Send(Command::FirmwareCrc.encode()),
        ),
    }
}

fn await_ack(next: FirmwareState) -> (FirmwareState, Effect<FirmwareProgress>) {
    (next, Effect::Receive(RESPONSE_SIZE))
}

/// The firmware transition function, over the image being sent.
pub fn transition(
    state: FirmwareState,
    event: Event,
    image: &FirmwareImage,
) -> (FirmwareState, Effect<FirmwareProgress>) {
    use FirmwareState as S;

    match (state, event) {
        (S::Idle, Event::Begin) => (S::Init, Effect::Send(Command::FirmwareInit.encode())),

        (S::Init, Event::Sent) => await_ack(S::AwaitInitAck),
        (S::Init, Event::SendFailed(e)) => abort("firmware init", e),
        (S::AwaitInitAck, Event::Received(frame)) => match Ack::from_frame(frame) {
            Some(_) => send_page(image, 0),
            None => abort("firmware init", no_ack()),
        },
        (S::AwaitInitAck, Event::ReceiveFailed(e)) => abort("firmware init", e),

        (S::SendPage { page }, Event::Sent) => await_ack(S::AwaitPageAck { page }),
        (S::SendPage { .. }, Event::SendFailed(e)) => abort("firmware page", e),
        (S::AwaitPageAck { page }, Event::Received(frame)) => match Ack::from_frame(frame) {
            Some(_) => (
                S::PageSent { page },
                Effect::Emit(FirmwareProgress {
                    sent: page + 1,
                    total: image.page_count(),
                }),
            ),
            None => abort("firmware page", no_ack()),
        },
        (S::AwaitPageAck { .. }, Event::ReceiveFailed(e)) => abort("firmware page", e),
        (S::PageSent { page }, Event::Emitted) => send_page(image, page + 1),

        (S::RequestCrc, Event::Sent) => await_ack(S::AwaitCrc),
        (S::RequestCrc, Event::SendFailed(e)) => abort("firmware crc", e),
        (S::AwaitCrc, Event::Received(frame)) => {
            let Some(ack) = Ack::from_frame(frame) else {
                return abort("firmware crc", no_ack());
            };
            match ack.firmware_crc() {
                Ok(reported) if reported == image.crc() => {
                    (S::Load, Effect::Send(Command::FirmwareFlash.encode()))
                }
                Ok(reported) => (
                    S::Failed,
                    Effect::Abort(ProtocolError::IntegrityMismatch {
                        expected: image.crc(),
                        reported,
                    }),
                ),
                Err(e) => (S::Failed, Effect::Abort(e.into())),
            }
        }
        (S::AwaitCrc, Event::ReceiveFailed(e)) => abort("firmware crc", e),

        (S::Load, Event::Sent) => await_ack(S::AwaitLoadAck),
        (S::Load, Event::SendFailed(e)) => abort("firmware flash", e),
        (S::AwaitLoadAck, Event::Received(frame)) => match Ack::from_frame(frame) {
            Some(_) => (S::Done, Effect::Finish),
            None => abort("firmware flash", no_ack()),
        },
        (S::AwaitLoadAck, Event::ReceiveFailed(e)) => abort("firmware flash", e),

        (state, event) => (S::Failed, Effect::Abort(invalid(&state, &event))),
    }
}

fn no_ack() -> TransportError {
    TransportError::ReadFailed("no acknowledgement".into())
}

/// Sends one image and verifies it before activating it.
#[derive(Debug)]
pub struct FirmwareUpdate<'a> {
    image: &'a FirmwareImage,
    state: FirmwareState,
}

impl<'a> FirmwareUpdate<'a> {
    pub fn new(image: &'a FirmwareImage) -> Self {
        Self {
            image,
            state: FirmwareState::Idle,
        }
    }
}

impl ProtocolMachine for FirmwareUpdate<'_> {
    type Output = FirmwareProgress;
    type State = FirmwareState;

    fn step(&mut self, event: Event) -> Effect<FirmwareProgress> {
        let (next, effect) = transition(self.state, event, self.image);
        match next {
            FirmwareState::SendPage { page } => {
                debug!(page, total = self.image.page_count(), "Sending firmware page")
            }
            FirmwareState::RequestCrc => info!("All pages sent, requesting CRC"),
            FirmwareState::Load => {
                info!(crc = %format!("0x{:04X}", self.image.crc()), "CRC verified, loading firmware")
            }
            FirmwareState::Done => info!("Firmware loaded, device restarting"),
            FirmwareState::Failed => warn!(from = ?self.state, "Firmware update failed"),
            _ => {}
        }
        self.state = next;
        effect
    }

    fn state(&self) -> &FirmwareState {
        &self.state
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state, FirmwareState::Done | FirmwareState::Failed)
    }

    fn abort(&mut self) {
        warn!(from = ?self.state, "Firmware update stopped by caller");
        self.state = FirmwareState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::{
        FIRMWARE_SIZE, FLASH_PAGE_SIZE, MSG_FIRMWARE_CRC, MSG_FIRMWARE_FLASH, MSG_FIRMWARE_INIT,
    };
    use crate::state::drive;
    use crate::transport::MockTransport;

    fn crc_frame(crc: u16) -> Vec<u8> {
        let mut frame = vec![0u8; RESPONSE_SIZE];
        frame[0] = MSG_FIRMWARE_CRC;
        frame[1..3].copy_from_slice(&crc.to_le_bytes());
        frame
    }

    /// Script a device that acknowledges init and every page.
    fn script_transfer(mock: &MockTransport, image: &FirmwareImage) {
        mock.queue_ack(MSG_FIRMWARE_INIT);
        for _ in 0..image.page_count() {
            mock.queue_ack(0);
        }
    }

    type Outcome = (Result<(), ProtocolError>, FirmwareState, Vec<FirmwareProgress>);

    fn run(mock: &MockTransport, image: &FirmwareImage) -> Outcome {
        let mut machine = FirmwareUpdate::new(image);
        let mut progress = Vec::new();
        let result = drive(&mut machine, mock, |p| {
            progress.push(p);
            Ok(())
        });
        (result, *machine.state(), progress)
    }

    fn count(opcodes: &[u8], opcode: u8) -> usize {
        opcodes.iter().filter(|&&op| op == opcode).count()
    }

    #[test]
    fn test_matching_crc_loads_once() {
        let image = FirmwareImage::new(&[0x42; 10_000], FIRMWARE_SIZE, FLASH_PAGE_SIZE).unwrap();
        let mock = MockTransport::new();
        script_transfer(&mock, &image);
        mock.queue_response(&crc_frame(image.crc()));
        mock.queue_ack(MSG_FIRMWARE_FLASH);

        let (result, state, progress) = run(&mock, &image);
        result.unwrap();
        assert_eq!(state, FirmwareState::Done);
        assert_eq!(progress.len(), 24);
        assert_eq!(progress.last(), Some(&FirmwareProgress { sent: 24, total: 24 }));

        let writes = mock.get_writes();
        assert_eq!(writes.len(), 1 + 24 + 2);
        assert_eq!(writes[0], vec![MSG_FIRMWARE_INIT]);
        // Pages go out in order and cover the padded image exactly.
        let sent: Vec<u8> = writes[1..25].concat();
        assert_eq!(sent, image.raw_data());
        assert_eq!(writes[25], vec![MSG_FIRMWARE_CRC]);
        assert_eq!(writes[26], vec![MSG_FIRMWARE_FLASH]);
    }

    #[test]
    fn test_crc_mismatch_never_loads() {
        let image = FirmwareImage::new(&[0x42; 100], FIRMWARE_SIZE, FLASH_PAGE_SIZE).unwrap();
        let mock = MockTransport::new();
        script_transfer(&mock, &image);
        mock.queue_response(&crc_frame(image.crc() ^ 0x0001));

        let (result, state, _) = run(&mock, &image);
        match result.unwrap_err() {
            ProtocolError::IntegrityMismatch { expected, reported } => {
                assert_eq!(expected, image.crc());
                assert_eq!(reported, image.crc() ^ 0x0001);
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(state, FirmwareState::Failed);
        assert_eq!(count(&mock.written_opcodes(), MSG_FIRMWARE_FLASH), 0);
    }

    #[test]
    fn test_image_is_padded_before_paging() {
        let image = FirmwareImage::new(&[1, 2, 3], FIRMWARE_SIZE, FLASH_PAGE_SIZE).unwrap();
        let mock = MockTransport::new();
        script_transfer(&mock, &image);
        mock.queue_response(&crc_frame(image.crc()));
        mock.queue_ack(MSG_FIRMWARE_FLASH);

        run(&mock, &image).0.unwrap();
        let pages = &mock.get_writes()[1..25];
        let total: usize = pages.iter().map(Vec::len).sum();
        assert_eq!(total, 48 * 1024);
        assert!(pages[23].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_page_ack_failure_aborts_without_retry() {
        let image = FirmwareImage::new(&[0; 4096], 8192, 2048).unwrap();
        let mock = MockTransport::new();
        mock.queue_ack(MSG_FIRMWARE_INIT);
        mock.queue_ack(0);
        mock.queue_read_failure();

        let (result, state, progress) = run(&mock, &image);
        assert!(matches!(
            result.unwrap_err(),
            ProtocolError::TransferAborted {
                stage: "firmware page",
                ..
            }
        ));
        assert_eq!(state, FirmwareState::Failed);
        assert_eq!(progress.len(), 1);
        // Init plus two pages, the second never acknowledged.
        assert_eq!(mock.get_writes().len(), 3);
    }

    #[test]
    fn test_caller_can_stop_after_a_page() {
        let image = FirmwareImage::new(&[0x42; 100], FIRMWARE_SIZE, FLASH_PAGE_SIZE).unwrap();
        let mock = MockTransport::new();
        script_transfer(&mock, &image);

        let mut machine = FirmwareUpdate::new(&image);
        let err = drive(&mut machine, &mock, |_| {
            Err(ProtocolError::InvalidArgument("stop".into()))
        })
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidArgument(_)));
        assert!(machine.is_terminal());
        assert_eq!(machine.state(), &FirmwareState::Failed);

        let opcodes = mock.written_opcodes();
        assert_eq!(count(&opcodes, MSG_FIRMWARE_CRC), 0);
        assert_eq!(count(&opcodes, MSG_FIRMWARE_FLASH), 0);
        assert_eq!(mock.get_writes().len(), 2);
    }

    #[test]
    fn test_missing_init_ack() {
        let image = FirmwareImage::new(&[0; 16], 64, 16).unwrap();
        let mock = MockTransport::new();
        mock.queue_response(&[]);

        let (result, _, _) = run(&mock, &image);
        assert!(matches!(
            result.unwrap_err(),
            ProtocolError::TransferAborted {
                stage: "firmware init",
                ..
            }
        ));
        assert_eq!(mock.written_opcodes(), vec![MSG_FIRMWARE_INIT]);
    }

    #[test]
    fn test_short_crc_response_is_malformed() {
        let image = FirmwareImage::new(&[0; 16], 32, 16).unwrap();
        let mock = MockTransport::new();
        script_transfer(&mock, &image);
        mock.queue_response(&[MSG_FIRMWARE_CRC, 0x12]);

        let (result, _, _) = run(&mock, &image);
        assert!(matches!(result.unwrap_err(), ProtocolError::Malformed(_)));
        assert_eq!(count(&mock.written_opcodes(), MSG_FIRMWARE_FLASH), 0);
    }

    #[test]
    fn test_disconnect_mid_transfer() {
        let image = FirmwareImage::new(&[0; 16], 64, 16).unwrap();
        let mock = MockTransport::new();
        script_transfer(&mock, &image);
        mock.fail_writes_after(2);

        let (result, state, _) = run(&mock, &image);
        assert!(matches!(
            result.unwrap_err(),
            ProtocolError::TransferAborted { .. }
        ));
        assert_eq!(state, FirmwareState::Failed);
    }

    #[test]
    fn test_rejects_events_out_of_order() {
        let image = FirmwareImage::new(&[0; 16], 32, 16).unwrap();
        let (state, effect) = transition(FirmwareState::AwaitCrc, Event::Emitted, &image);
        assert_eq!(state, FirmwareState::Failed);
        assert!(matches!(
            effect,
            Effect::Abort(ProtocolError::InvalidTransition { .. })
        ));
    }
}
