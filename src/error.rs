use embedded_hal::{digital, spi};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A wire frame did not have the length of its layout.
    #[error("Invalid frame length - expected={expected} received={received}")]
    FrameLength { expected: usize, received: usize },
    #[error("Invalid heartbeat magic {0:#010X}")]
    HeartbeatMagic(u32),
    #[error("Unknown state code {0}")]
    UnknownState(u8),
    /// PEC of a register group read back from the cell monitor chain did not match.
    #[error("PEC mismatch on IC {ic} group {group} - calculated={calculated:#06X} received={received:#06X}")]
    Pec {
        ic: usize,
        group: u8,
        calculated: u16,
        received: u16,
    },
    #[error("SPI error: {0:?}")]
    Spi(spi::ErrorKind),
    #[error("Pin error: {0:?}")]
    Pin(digital::ErrorKind),
    #[error("Frame {id:#X} dropped after {attempts} attempts")]
    Transmit { id: u32, attempts: u8 },
    #[error("Cannot build a CAN frame with id {0:#X}")]
    FrameId(u32),
    #[error("Invalid SLCAN line {0:?}")]
    Slcan(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn spi<E: spi::Error>(err: E) -> Self {
        log::warn!("SPI transfer failed: {err:?}");
        Error::Spi(err.kind())
    }

    pub(crate) fn pin<E: digital::Error>(err: E) -> Self {
        log::warn!("Pin access failed: {err:?}");
        Error::Pin(err.kind())
    }
}
