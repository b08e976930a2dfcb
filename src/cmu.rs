//! Driver for the daisy chain of cell monitor ICs.
//!
//! Each IC measures 12 cells and, through an I2C multiplexer on its COMM
//! port, 12 thermistors. The chain shares one SPI bus and chip select.
//! Commands are broadcast; register reads return one 8 byte block (6 data
//! bytes plus PEC) per IC, nearest IC first, while register writes carry one
//! block per IC, furthest IC first.

use crate::config::CELLS_PER_IC;
use crate::pec;
use crate::protocol::tx::CmuReading;
use crate::thermistor;
use crate::Error;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

/// Data bytes of one register group.
pub const GROUP_LEN: usize = 6;
/// Register group plus PEC, as exchanged per IC.
pub const BLOCK_LEN: usize = GROUP_LEN + 2;

const CELLS_PER_GROUP: usize = 3;
const MUX_CHANNELS: u8 = 6;

/// Chip select set up and hold time.
const CS_DELAY_US: u32 = 35;
const WAKEUP_SLEEP_US: u32 = 300;
const WAKEUP_IDLE_US: u32 = 10;
const CONVERSION_MS: u32 = 7;
const MUX_SETTLE_MS: u32 = 10;
/// Clock cycles required by the COMM transfer, sent as dummy bytes.
const STCOMM_CLOCK_BYTES: usize = 72;

/// Command opcodes.
pub mod opcode {
    pub const WRCFG: [u8; 2] = [0x00, 0x01];
    pub const RDCVA: [u8; 2] = [0x00, 0x04];
    pub const RDCVB: [u8; 2] = [0x00, 0x06];
    pub const RDCVC: [u8; 2] = [0x00, 0x08];
    pub const RDCVD: [u8; 2] = [0x00, 0x0A];
    pub const RDAUXA: [u8; 2] = [0x00, 0x0C];
    pub const RDAUXB: [u8; 2] = [0x00, 0x0E];
    pub const WRCOMM: [u8; 2] = [0x07, 0x21];
    pub const STCOMM: [u8; 2] = [0x07, 0x23];

    pub const CELL_GROUPS: [[u8; 2]; 4] = [RDCVA, RDCVB, RDCVC, RDCVD];
}

/// Conversion mode of the ADCs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcMode {
    Fast = 1,
    Normal = 2,
    Filtered = 3,
}

/// ADCV and ADAX opcodes for a conversion setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcCommands {
    pub adcv: [u8; 2],
    pub adax: [u8; 2],
}

impl AdcCommands {
    /// `cell_channels` and `aux_channels` select what is converted, 0 for all.
    pub fn new(mode: AdcMode, discharge_permitted: bool, cell_channels: u8, aux_channels: u8) -> Self {
        let md = mode as u8;
        let high = (md & 0x02) >> 1;
        let low = (md & 0x01) << 7;
        Self {
            adcv: [
                high + 0x02,
                low + 0x60 + (u8::from(discharge_permitted) << 4) + (cell_channels & 0x07),
            ],
            adax: [high + 0x04, low + 0x60 + (aux_channels & 0x07)],
        }
    }
}

impl Default for AdcCommands {
    fn default() -> Self {
        Self::new(AdcMode::Filtered, false, 0, 0)
    }
}

/// Configuration register group: GPIO pull-downs off, reference on,
/// thresholds unused, discharge switches from `balance`.
pub fn config_group(balance: u16) -> [u8; GROUP_LEN] {
    [0xFD, 0x00, 0x00, 0x00, balance as u8, ((balance >> 8) & 0x0F) as u8]
}

/// COMM register group selecting `channel` of the thermistor multiplexer.
pub fn mux_group(channel: u8) -> [u8; GROUP_LEN] {
    const START: u8 = 0x6;
    const BLANK: u8 = 0x0;
    const NO_TRANSMIT: u8 = 0x7;
    const NACK: u8 = 0x8;
    const NACK_STOP: u8 = 0x9;
    // multiplexer address 0x90, then 0x8n selects channel n
    [
        (START << 4) + 0x09,
        NACK,
        BLANK << 4,
        ((0x8 + (channel & 0x7)) << 4) + NACK_STOP,
        NO_TRANSMIT << 4,
        0x00,
    ]
}

/// Discharge switch bitmap of one IC: bit k is set when cell k is above
/// `threshold` mV. Cells flagged in `stale` are left off.
pub fn balance_bitmap(cells: &[u16; CELLS_PER_IC], stale: u16, threshold: i32) -> u16 {
    cells
        .iter()
        .enumerate()
        .filter(|(cell, _)| stale & (1 << cell) == 0)
        .filter(|(_, code)| i32::from(**code / 10) > threshold)
        .fold(0, |bitmap, (cell, _)| bitmap | (1 << cell))
}

/// Lowest and highest cell of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellExtremes {
    /// mV
    pub min: i32,
    /// Chain wide index, `ic * 12 + cell`.
    pub min_index: usize,
    pub max: i32,
    pub max_index: usize,
    /// Sum of all cells in mV.
    pub sum: i32,
}

/// Last acquired values of the whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellBank<const N: usize> {
    /// Cell voltages in 1/10 mV, chain order.
    pub voltages: [[u16; CELLS_PER_IC]; N],
    /// Scaled thermistor codes, see [`crate::thermistor`].
    pub temperatures: [[u8; CELLS_PER_IC]; N],
    /// Per IC, cells whose last read failed the PEC check.
    pub stale: [u16; N],
}

impl<const N: usize> Default for CellBank<N> {
    fn default() -> Self {
        Self {
            voltages: [[u16::MAX; CELLS_PER_IC]; N],
            temperatures: [[thermistor::SATURATED_HIGH; CELLS_PER_IC]; N],
            stale: [0; N],
        }
    }
}

impl<const N: usize> CellBank<N> {
    /// True when every cell was verified on the last read.
    pub fn is_clean(&self) -> bool {
        self.stale.iter().all(|stale| *stale == 0)
    }

    pub fn cell_voltage(&self, index: usize) -> Option<i32> {
        let ic = self.voltages.get(index / CELLS_PER_IC)?;
        Some(i32::from(ic[index % CELLS_PER_IC] / 10))
    }

    pub fn extremes(&self) -> CellExtremes {
        let mut extremes = CellExtremes {
            min: i32::MAX,
            min_index: 0,
            max: i32::MIN,
            max_index: 0,
            sum: 0,
        };
        let cells = self.voltages.iter().flatten().map(|code| i32::from(code / 10));
        for (index, voltage) in cells.enumerate() {
            extremes.sum += voltage;
            if voltage < extremes.min {
                extremes.min = voltage;
                extremes.min_index = index;
            }
            if voltage > extremes.max {
                extremes.max = voltage;
                extremes.max_index = index;
            }
        }
        extremes
    }

    /// Coldest and hottest thermistor, sentinel codes excluded.
    pub fn temperature_range(&self) -> Option<(u8, u8)> {
        let mut codes = self
            .temperatures
            .iter()
            .flatten()
            .copied()
            .filter(|code| !thermistor::is_saturated(*code));
        let first = codes.next()?;
        Some(codes.fold((first, first), |(min, max), code| {
            (min.min(code), max.max(code))
        }))
    }

    /// One [`CmuReading`] per cell pair, in chain order.
    pub fn readings(&self) -> impl Iterator<Item = CmuReading> + '_ {
        (0..N).flat_map(move |ic| {
            (0..CELLS_PER_IC).step_by(2).map(move |cell| {
                let first = ic * CELLS_PER_IC + cell;
                CmuReading {
                    cell_id: [first as u8, (first + 1) as u8],
                    cell_voltage: [self.voltages[ic][cell], self.voltages[ic][cell + 1]],
                    cell_temperature: [
                        self.temperatures[ic][cell],
                        self.temperatures[ic][cell + 1],
                    ],
                }
            })
        })
    }
}

/// Chain of `N` cell monitor ICs behind one chip select.
pub struct CellMonitor<SPI, CS, D, const N: usize> {
    spi: SPI,
    cs: CS,
    delay: D,
    commands: AdcCommands,
    config: [[u8; GROUP_LEN]; N],
    bank: CellBank<N>,
    pec_errors: u32,
}

impl<SPI, CS, D, const N: usize> CellMonitor<SPI, CS, D, N>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: DelayNs,
{
    /// Wakes the chain and writes the default configuration.
    pub fn new(spi: SPI, cs: CS, delay: D) -> Result<Self, Error> {
        let mut monitor = Self {
            spi,
            cs,
            delay,
            commands: AdcCommands::default(),
            config: [config_group(0); N],
            bank: CellBank::default(),
            pec_errors: 0,
        };
        monitor.cs.set_high().map_err(Error::pin)?;
        monitor.wakeup_sleep()?;
        monitor.write_config()?;
        Ok(monitor)
    }

    /// Copy of the last acquired values.
    pub fn snapshot(&self) -> CellBank<N> {
        self.bank
    }

    /// PEC mismatches since construction.
    pub fn pec_errors(&self) -> u32 {
        self.pec_errors
    }

    /// Holds chip select long enough to wake the chain from sleep.
    pub fn wakeup_sleep(&mut self) -> Result<(), Error> {
        self.pulse_cs(WAKEUP_SLEEP_US)
    }

    /// Wakes the isoSPI ports from idle.
    pub fn wakeup_idle(&mut self) -> Result<(), Error> {
        self.pulse_cs(WAKEUP_IDLE_US)
    }

    fn pulse_cs(&mut self, us: u32) -> Result<(), Error> {
        self.cs.set_low().map_err(Error::pin)?;
        self.delay.delay_us(us);
        self.cs.set_high().map_err(Error::pin)
    }

    fn select(&mut self) -> Result<(), Error> {
        self.cs.set_low().map_err(Error::pin)?;
        self.delay.delay_us(CS_DELAY_US);
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), Error> {
        self.spi.flush().map_err(Error::spi)?;
        self.delay.delay_us(CS_DELAY_US);
        self.cs.set_high().map_err(Error::pin)
    }

    fn command_frame(opcode: [u8; 2]) -> [u8; 4] {
        let [pec_high, pec_low] = pec::pec15_bytes(&opcode);
        [opcode[0], opcode[1], pec_high, pec_low]
    }

    /// Broadcasts a command without payload.
    pub fn command(&mut self, opcode: [u8; 2]) -> Result<(), Error> {
        self.wakeup_idle()?;
        self.select()?;
        self.spi
            .write(&Self::command_frame(opcode))
            .map_err(Error::spi)?;
        self.deselect()
    }

    /// Broadcasts a write command followed by one register group per IC.
    /// `groups` is in chain order; it is sent furthest IC first.
    pub fn write_groups(&mut self, opcode: [u8; 2], groups: &[[u8; GROUP_LEN]; N]) -> Result<(), Error> {
        let mut blocks = [[0u8; BLOCK_LEN]; N];
        for (block, group) in blocks.iter_mut().zip(groups.iter().rev()) {
            block[..GROUP_LEN].copy_from_slice(group);
            block[GROUP_LEN..].copy_from_slice(&pec::pec15_bytes(group));
        }
        log::trace!("Write {opcode:02X?}: {blocks:02X?}");

        self.wakeup_idle()?;
        self.select()?;
        self.spi
            .write(&Self::command_frame(opcode))
            .map_err(Error::spi)?;
        self.spi.write(blocks.as_flattened()).map_err(Error::spi)?;
        self.deselect()
    }

    /// Reads one register group from every IC, unverified.
    pub fn read_blocks(&mut self, opcode: [u8; 2]) -> Result<[[u8; BLOCK_LEN]; N], Error> {
        let mut blocks = [[0xFFu8; BLOCK_LEN]; N];
        self.wakeup_idle()?;
        self.select()?;
        self.spi
            .write(&Self::command_frame(opcode))
            .map_err(Error::spi)?;
        self.spi
            .transfer_in_place(blocks.as_flattened_mut())
            .map_err(Error::spi)?;
        self.deselect()?;
        log::trace!("Read {opcode:02X?}: {blocks:02X?}");
        Ok(blocks)
    }

    /// Reads one register group and checks the PEC of every IC.
    pub fn read_group(&mut self, opcode: [u8; 2], group: u8) -> Result<[Result<[u16; 3], Error>; N], Error> {
        let blocks = self.read_blocks(opcode)?;
        let mut failed = 0;
        let codes = core::array::from_fn(|ic| {
            let block = &blocks[ic];
            let (data, received) = block.split_at(GROUP_LEN);
            match pec::verify(data, [received[0], received[1]]) {
                Ok(()) => Ok(core::array::from_fn(|i| {
                    u16::from_le_bytes([data[2 * i], data[2 * i + 1]])
                })),
                Err((calculated, received)) => {
                    failed += 1;
                    Err(Error::Pec {
                        ic,
                        group,
                        calculated,
                        received,
                    })
                }
            }
        });
        self.pec_errors += failed;
        Ok(codes)
    }

    /// Writes the configuration register of every IC.
    pub fn write_config(&mut self) -> Result<(), Error> {
        let config = self.config;
        self.write_groups(opcode::WRCFG, &config)
    }

    /// Starts a conversion of all cell voltages.
    pub fn start_cell_conversion(&mut self) -> Result<(), Error> {
        self.command(self.commands.adcv)
    }

    /// Starts a conversion of the GPIO (thermistor) inputs.
    pub fn start_aux_conversion(&mut self) -> Result<(), Error> {
        self.command(self.commands.adax)
    }

    /// Reads back all four cell voltage groups.
    ///
    /// A group failing its PEC keeps the previous values and marks its cells
    /// stale. Returns `true` if every group of every IC was verified.
    pub fn read_cell_voltages(&mut self) -> Result<bool, Error> {
        let mut clean = true;
        for (group, opcode) in opcode::CELL_GROUPS.into_iter().enumerate() {
            let first = group * CELLS_PER_GROUP;
            let mask = 0b111 << first;
            for (ic, result) in self.read_group(opcode, group as u8)?.into_iter().enumerate() {
                match result {
                    Ok(codes) => {
                        self.bank.voltages[ic][first..first + CELLS_PER_GROUP]
                            .copy_from_slice(&codes);
                        self.bank.stale[ic] &= !mask;
                    }
                    Err(error) => {
                        log::warn!("Discarding cell voltages: {error}");
                        self.bank.stale[ic] |= mask;
                        clean = false;
                    }
                }
            }
        }
        Ok(clean)
    }

    /// Reads the first two GPIO inputs of every IC, `None` on PEC mismatch.
    fn read_thermistors(&mut self) -> Result<[Option<[u16; 2]>; N], Error> {
        let group_a = self.read_group(opcode::RDAUXA, 0)?;
        // group B is read to keep the register sequence of a full aux read
        let group_b = self.read_group(opcode::RDAUXB, 1)?;
        let mut readings = [None; N];
        for (ic, (a, b)) in group_a.into_iter().zip(group_b).enumerate() {
            match (a, b) {
                (Ok(a), Ok(_)) => readings[ic] = Some([a[0], a[1]]),
                (Err(error), _) | (_, Err(error)) => {
                    log::warn!("Discarding temperatures: {error}");
                }
            }
        }
        Ok(readings)
    }

    /// Points the thermistor multiplexer of every IC at `channel`.
    pub fn select_mux_channel(&mut self, channel: u8) -> Result<(), Error> {
        log::debug!("Set mux to channel {channel}");
        self.wakeup_sleep()?;
        self.delay.delay_us(10);
        self.write_groups(opcode::WRCOMM, &[mux_group(channel); N])?;
        self.delay.delay_us(1);

        self.wakeup_idle()?;
        self.select()?;
        self.spi
            .write(&Self::command_frame(opcode::STCOMM))
            .map_err(Error::spi)?;
        self.spi
            .write(&[0xFF; STCOMM_CLOCK_BYTES])
            .map_err(Error::spi)?;
        self.deselect()
    }

    /// Converts and reads all cell voltages.
    pub fn do_cell_conversion(&mut self) -> Result<bool, Error> {
        self.wakeup_sleep()?;
        self.start_cell_conversion()?;
        self.delay.delay_ms(CONVERSION_MS);
        self.read_cell_voltages()
    }

    /// Steps the multiplexer through its channels and reads two thermistors
    /// per IC at each step. Returns `true` if every read was verified.
    pub fn do_temperature_conversion(&mut self) -> Result<bool, Error> {
        log::debug!("Temperature conversion");
        let mut clean = true;
        for channel in 0..MUX_CHANNELS {
            self.select_mux_channel(channel)?;
            self.delay.delay_ms(MUX_SETTLE_MS);
            self.wakeup_sleep()?;
            self.start_aux_conversion()?;
            self.delay.delay_ms(CONVERSION_MS);

            let channel = usize::from(channel);
            for (ic, reading) in self.read_thermistors()?.into_iter().enumerate() {
                let Some([low, high]) = reading else {
                    clean = false;
                    continue;
                };
                let temperatures = &mut self.bank.temperatures[ic];
                temperatures[channel] = thermistor::scale(low);
                temperatures[channel + usize::from(MUX_CHANNELS)] = thermistor::scale(high);
                log::trace!(
                    "IC {ic} cells {},{} = {}, {} (raw {low}, {high})",
                    channel + 1,
                    channel + 7,
                    temperatures[channel],
                    temperatures[channel + 6]
                );
            }
        }
        Ok(clean)
    }

    /// Closes the discharge switch of every cell above `threshold` mV.
    pub fn do_cell_balance(&mut self, threshold: i32) -> Result<(), Error> {
        for ic in 0..N {
            let bitmap = balance_bitmap(&self.bank.voltages[ic], self.bank.stale[ic], threshold);
            if bitmap != 0 {
                log::debug!("IC {ic} balancing {bitmap:03X}");
            }
            self.config[ic] = config_group(bitmap);
        }
        self.wakeup_sleep()?;
        self.write_config()
    }

    /// Balance bitmap currently written to `ic`.
    pub fn balance_state(&self, ic: usize) -> Option<u16> {
        self.config
            .get(ic)
            .map(|group| u16::from(group[4]) | (u16::from(group[5] & 0x0F) << 8))
    }
}
