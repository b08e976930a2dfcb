//! Vehicle bus message catalog.
//!
//! Every frame has a fixed layout and a small code. On the bus the code is
//! offset by the outbound base (frames sent by the controller) or by the
//! inbound base (commands received by the controller). Fields are packed
//! little-endian, padded like the equivalent plain C struct.

use crate::Error;
use std::fmt;
use std::ops::{Deref, DerefMut};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest payload of a classic CAN frame.
pub const FRAME_CAPACITY: usize = 8;

/// Payload of a single frame.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameBuffer {
    data: [u8; FRAME_CAPACITY],
    len: u8,
}

impl FrameBuffer {
    fn zeroed(len: usize) -> Self {
        debug_assert!(len <= FRAME_CAPACITY);
        Self {
            data: [0; FRAME_CAPACITY],
            len: len as u8,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
        if data.len() > FRAME_CAPACITY {
            return Err(Error::FrameLength {
                expected: FRAME_CAPACITY,
                received: data.len(),
            });
        }
        let mut buffer = Self::zeroed(data.len());
        buffer.data[..data.len()].copy_from_slice(data);
        Ok(buffer)
    }
}

impl Deref for FrameBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data[..usize::from(self.len)]
    }
}

impl DerefMut for FrameBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data[..usize::from(self.len)]
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X?}", self.deref())
    }
}

/// A frame of the catalog.
pub trait Message: Sized {
    /// Code relative to the outbound or inbound base address.
    const CODE: u32;
    const LENGTH: usize;
    const NAME: &'static str;

    fn encode(&self) -> FrameBuffer;

    fn decode(data: &[u8]) -> Result<Self, Error>;
}

fn validate_len(name: &str, data: &[u8], length: usize) -> Result<(), Error> {
    if data.len() != length {
        log::warn!(
            "Malformed frame: {} must have length {} - received={}",
            name,
            length,
            data.len()
        );
        return Err(Error::FrameLength {
            expected: length,
            received: data.len(),
        });
    }
    Ok(())
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

bitflags::bitflags! {
    /// Fault conditions, as carried by the [`tx::Issue`] frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct FaultFlags: u32 {
        /// Under the preferred minimum voltage.
        const UNDERVOLTAGE = 1 << 0;
        /// Over the preferred maximum voltage.
        const OVERVOLTAGE = 1 << 1;
        /// Under the absolute minimum voltage.
        const UNDER_VOLTAGE_LOCKOUT = 1 << 2;
        /// Over the absolute maximum voltage.
        const OVER_VOLTAGE_LOCKOUT = 1 << 3;
        const OVER_CHARGE_CURRENT = 1 << 4;
        const OVER_DISCHARGE_CURRENT = 1 << 5;
        /// A contactor did not confirm a switch.
        const CONTACTOR = 1 << 6;
        const OVER_TEMPERATURE = 1 << 7;
        const UNDER_TEMPERATURE = 1 << 8;
        const PRECHARGE_FAIL = 1 << 9;
        const HEARTBEAT_TIMEOUT = 1 << 10;
        const UNKNOWN = 1 << 31;
    }
}

impl FaultFlags {
    /// Flags that only an unlock command clears.
    pub const LATCHING: Self = Self::UNDER_VOLTAGE_LOCKOUT
        .union(Self::OVER_VOLTAGE_LOCKOUT)
        .union(Self::OVER_CHARGE_CURRENT)
        .union(Self::OVER_DISCHARGE_CURRENT)
        .union(Self::CONTACTOR)
        .union(Self::PRECHARGE_FAIL)
        .union(Self::UNKNOWN);
}

/// Frames sent by the controller.
pub mod tx {
    use super::*;

    /// Shows the controller is alive and which state it is in.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct Heartbeat {
        pub state: u8,
    }

    impl Heartbeat {
        pub const MAGIC: u32 = 0x4361_7473;
    }

    impl Message for Heartbeat {
        const CODE: u32 = 0x0;
        // u32 + u8, padded to the alignment of the u32
        const LENGTH: usize = 8;
        const NAME: &'static str = "Heartbeat";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer[0..4].copy_from_slice(&Self::MAGIC.to_le_bytes());
            buffer[4] = self.state;
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            let magic = read_u32(data, 0);
            if magic != Self::MAGIC {
                return Err(Error::HeartbeatMagic(magic));
            }
            Ok(Self { state: data[4] })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct PackVoltage {
        /// mV
        pub pack_voltage: i32,
        /// mV
        pub car_voltage: i32,
    }

    impl Message for PackVoltage {
        const CODE: u32 = 0x1;
        const LENGTH: usize = 8;
        const NAME: &'static str = "PackVoltage";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer[0..4].copy_from_slice(&self.pack_voltage.to_le_bytes());
            buffer[4..8].copy_from_slice(&self.car_voltage.to_le_bytes());
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            Ok(Self {
                pack_voltage: read_u32(data, 0) as i32,
                car_voltage: read_u32(data, 4) as i32,
            })
        }
    }

    /// Pack current as measured by the shunt.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct PackCurrent {
        /// mA, positive while charging
        pub pack_current: i32,
    }

    impl Message for PackCurrent {
        const CODE: u32 = 0x2;
        const LENGTH: usize = 4;
        const NAME: &'static str = "PackCurrent";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer.copy_from_slice(&self.pack_current.to_le_bytes());
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            Ok(Self {
                pack_current: read_u32(data, 0) as i32,
            })
        }
    }

    /// Something went wrong.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct Issue {
        pub what_went_wrong: FaultFlags,
    }

    impl Message for Issue {
        const CODE: u32 = 0x3;
        const LENGTH: usize = 4;
        const NAME: &'static str = "Issue";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer.copy_from_slice(&self.what_went_wrong.bits().to_le_bytes());
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            Ok(Self {
                what_went_wrong: FaultFlags::from_bits_retain(read_u32(data, 0)),
            })
        }
    }

    /// Readings of two cells.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct CmuReading {
        pub cell_id: [u8; 2],
        /// 1/10 mV
        pub cell_voltage: [u16; 2],
        /// Scaled thermistor code, see [`crate::thermistor`].
        pub cell_temperature: [u8; 2],
    }

    impl Message for CmuReading {
        const CODE: u32 = 0x4;
        const LENGTH: usize = 8;
        const NAME: &'static str = "CMUReading";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer[0..2].copy_from_slice(&self.cell_id);
            buffer[2..4].copy_from_slice(&self.cell_voltage[0].to_le_bytes());
            buffer[4..6].copy_from_slice(&self.cell_voltage[1].to_le_bytes());
            buffer[6..8].copy_from_slice(&self.cell_temperature);
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            Ok(Self {
                cell_id: [data[0], data[1]],
                cell_voltage: [read_u16(data, 2), read_u16(data, 4)],
                cell_temperature: [data[6], data[7]],
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct ChargeState {
        pub percentage: f32,
        pub amp_hours: f32,
    }

    impl Message for ChargeState {
        const CODE: u32 = 0x5;
        const LENGTH: usize = 8;
        const NAME: &'static str = "ChargeState";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer[0..4].copy_from_slice(&self.percentage.to_le_bytes());
            buffer[4..8].copy_from_slice(&self.amp_hours.to_le_bytes());
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            Ok(Self {
                percentage: f32::from_bits(read_u32(data, 0)),
                amp_hours: f32::from_bits(read_u32(data, 4)),
            })
        }
    }
}

/// Frames received by the controller.
pub mod rx {
    use super::*;

    /// Liveness signal of the supervisory node.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct Heartbeat;

    impl Heartbeat {
        pub const MAGIC: u32 = 0x536F_6C72;
    }

    impl Message for Heartbeat {
        const CODE: u32 = 0x0;
        const LENGTH: usize = 4;
        const NAME: &'static str = "Heartbeat";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer.copy_from_slice(&Self::MAGIC.to_le_bytes());
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            let magic = read_u32(data, 0);
            if magic != Self::MAGIC {
                log::warn!("Malformed frame: incoming heartbeat has incorrect magic number of {magic:08X}");
                return Err(Error::HeartbeatMagic(magic));
            }
            Ok(Self)
        }
    }

    /// Button state of the driver interface.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct HmiStatus {
        pub buttons: u8,
    }

    impl HmiStatus {
        /// Horn button; its noise corrupts cell readings while pressed.
        pub const HORN: u8 = 1 << 2;

        pub fn horn(&self) -> bool {
            self.buttons & Self::HORN != 0
        }
    }

    impl Message for HmiStatus {
        const CODE: u32 = 0x01;
        const LENGTH: usize = 1;
        const NAME: &'static str = "HMIStatus";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer[0] = self.buttons;
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            Ok(Self { buttons: data[0] })
        }
    }

    /// Requested state; see [`crate::state::State`] for the codes.
    #[derive(Debug, Clone, PartialEq)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct StateChange {
        pub new_state: u8,
    }

    impl Message for StateChange {
        const CODE: u32 = 0x21;
        const LENGTH: usize = 1;
        const NAME: &'static str = "StateChange";

        fn encode(&self) -> FrameBuffer {
            let mut buffer = FrameBuffer::zeroed(Self::LENGTH);
            buffer[0] = self.new_state;
            buffer
        }

        fn decode(data: &[u8]) -> Result<Self, Error> {
            validate_len(Self::NAME, data, Self::LENGTH)?;
            Ok(Self {
                new_state: data[0],
            })
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Inbound {
    Heartbeat(rx::Heartbeat),
    HmiStatus(rx::HmiStatus),
    StateChange(rx::StateChange),
}

impl Inbound {
    /// Decodes a frame received on `id`.
    ///
    /// Returns `Ok(None)` for ids below `rx_base` and for codes that are not
    /// part of the catalog.
    pub fn parse(id: u32, rx_base: u32, data: &[u8]) -> Result<Option<Self>, Error> {
        let Some(code) = id.checked_sub(rx_base) else {
            return Ok(None);
        };
        Ok(match code {
            rx::Heartbeat::CODE => Some(Self::Heartbeat(rx::Heartbeat::decode(data)?)),
            rx::HmiStatus::CODE => Some(Self::HmiStatus(rx::HmiStatus::decode(data)?)),
            rx::StateChange::CODE => Some(Self::StateChange(rx::StateChange::decode(data)?)),
            _ => None,
        })
    }
}

/// A decoded outbound frame, as seen by another node on the bus.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Outbound {
    Heartbeat(tx::Heartbeat),
    PackVoltage(tx::PackVoltage),
    PackCurrent(tx::PackCurrent),
    Issue(tx::Issue),
    CmuReading(tx::CmuReading),
    ChargeState(tx::ChargeState),
}

impl Outbound {
    /// Decodes a frame sent on `id`; same filtering rules as [`Inbound::parse`].
    pub fn parse(id: u32, tx_base: u32, data: &[u8]) -> Result<Option<Self>, Error> {
        let Some(code) = id.checked_sub(tx_base) else {
            return Ok(None);
        };
        Ok(match code {
            tx::Heartbeat::CODE => Some(Self::Heartbeat(tx::Heartbeat::decode(data)?)),
            tx::PackVoltage::CODE => Some(Self::PackVoltage(tx::PackVoltage::decode(data)?)),
            tx::PackCurrent::CODE => Some(Self::PackCurrent(tx::PackCurrent::decode(data)?)),
            tx::Issue::CODE => Some(Self::Issue(tx::Issue::decode(data)?)),
            tx::CmuReading::CODE => Some(Self::CmuReading(tx::CmuReading::decode(data)?)),
            tx::ChargeState::CODE => Some(Self::ChargeState(tx::ChargeState::decode(data)?)),
            _ => None,
        })
    }
}
