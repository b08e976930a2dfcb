//! Vehicle bus transport.

use crate::protocol::{FrameBuffer, Message};
use crate::Error;
use embedded_can::{ExtendedId, Frame, Id, StandardId};
use embedded_hal::delay::DelayNs;

/// Transmissions tried before a frame is dropped.
pub const SEND_ATTEMPTS: u8 = 4;
/// Wait between two transmission attempts.
pub const RETRY_BACKOFF_US: u32 = 2000;

/// Log target of the raw frame dumps.
pub const FRAME_LOG_TARGET: &str = "bc::frame";

/// A frame as it appears on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame {
    pub id: u32,
    pub payload: FrameBuffer,
}

/// Where the controller sends its telemetry and polls for commands.
pub trait FrameBus {
    /// Sends `payload` with the id `base + code`.
    fn send_raw(&mut self, code: u32, payload: &[u8]) -> Result<(), Error>;

    /// Next queued inbound frame, never blocks.
    fn poll(&mut self) -> Option<RawFrame>;

    fn send<M: Message>(&mut self, message: &M) -> Result<(), Error> {
        self.send_raw(M::CODE, &message.encode())
    }
}

/// Maps a numeric identifier to the smallest CAN id format that holds it.
pub fn frame_id(id: u32) -> Result<Id, Error> {
    if let Ok(standard) = u16::try_from(id) {
        if let Some(standard) = StandardId::new(standard) {
            return Ok(Id::Standard(standard));
        }
    }
    ExtendedId::new(id)
        .map(Id::Extended)
        .ok_or(Error::FrameId(id))
}

pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(id) => u32::from(id.as_raw()),
        Id::Extended(id) => id.as_raw(),
    }
}

/// Plain classic CAN frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    id: Id,
    remote: bool,
    dlc: usize,
    data: FrameBuffer,
}

impl Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Some(Self {
            id: id.into(),
            remote: false,
            dlc: data.len(),
            data: FrameBuffer::from_slice(data).ok()?,
        })
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > crate::protocol::FRAME_CAPACITY {
            return None;
        }
        Some(Self {
            id: id.into(),
            remote: true,
            dlc,
            data: FrameBuffer::default(),
        })
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.remote
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

/// [`FrameBus`] over any non-blocking CAN controller.
pub struct CanInterface<C, D> {
    can: C,
    delay: D,
    tx_base: u32,
}

impl<C, D> CanInterface<C, D>
where
    C: embedded_can::nb::Can,
    D: DelayNs,
{
    /// Frames are sent with ids `tx_base + code`.
    pub fn new(can: C, delay: D, tx_base: u32) -> Self {
        Self { can, delay, tx_base }
    }

    pub fn inner(&mut self) -> &mut C {
        &mut self.can
    }
}

impl<C, D> FrameBus for CanInterface<C, D>
where
    C: embedded_can::nb::Can,
    D: DelayNs,
{
    fn send_raw(&mut self, code: u32, payload: &[u8]) -> Result<(), Error> {
        let id = self.tx_base + code;
        let frame = C::Frame::new(frame_id(id)?, payload).ok_or(Error::FrameLength {
            expected: crate::protocol::FRAME_CAPACITY,
            received: payload.len(),
        })?;

        for attempt in 1..=SEND_ATTEMPTS {
            match self.can.transmit(&frame) {
                Ok(_) => {
                    log::trace!(target: FRAME_LOG_TARGET, "TX {id:03X} {payload:02X?}");
                    return Ok(());
                }
                Err(nb::Error::WouldBlock) => {
                    log::trace!("Failed try {} of {}: bus busy", attempt, SEND_ATTEMPTS);
                }
                Err(nb::Error::Other(error)) => {
                    log::trace!("Failed try {} of {}: {:?}", attempt, SEND_ATTEMPTS, error);
                }
            }
            if attempt < SEND_ATTEMPTS {
                self.delay.delay_us(RETRY_BACKOFF_US);
            }
        }

        log::warn!("Failed CAN write of {id:03X} {payload:02X?}");
        Err(Error::Transmit {
            id,
            attempts: SEND_ATTEMPTS,
        })
    }

    fn poll(&mut self) -> Option<RawFrame> {
        loop {
            let frame = match self.can.receive() {
                Ok(frame) => frame,
                Err(nb::Error::WouldBlock) => return None,
                Err(nb::Error::Other(error)) => {
                    log::warn!("CAN receive failed: {error:?}");
                    return None;
                }
            };
            if frame.is_remote_frame() {
                continue;
            }
            let id = raw_id(frame.id());
            log::trace!(target: FRAME_LOG_TARGET, "RX {id:03X} {:02X?}", frame.data());
            match FrameBuffer::from_slice(frame.data()) {
                Ok(payload) => return Some(RawFrame { id, payload }),
                Err(error) => log::warn!("Dropping frame {id:03X}: {error}"),
            }
        }
    }
}
