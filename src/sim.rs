//! Simulated hardware.
//!
//! Implements the embedded-hal and embedded-can traits on top of a shared
//! [`PackModel`], so the real drivers and the real state machine can run on a
//! host: the cell chain answers the register commands with valid PEC, the
//! contactors drive a precharge model and the bus is a pair of queues.
//! Everything runs on a virtual clock advanced only by the delays.

use crate::can::{frame_id, CanFrame, CanInterface, RawFrame};
use crate::cmu::{opcode, CellMonitor, BLOCK_LEN, GROUP_LEN};
use crate::config::{Config, CELLS_PER_IC};
use crate::controller::{AnalogInput, BatteryController, Ticker};
use crate::output::{Contactor, ContactorBank, ContactorChannel, Fan};
use crate::pec;
use crate::protocol::{FrameBuffer, Message, Outbound};
use crate::thermistor::BREAKPOINTS;
use crate::Error;
use embedded_can::Frame;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::pwm::SetDutyCycle;
use embedded_hal::spi::SpiBus;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

/// Precharge resistor and bus capacitance time constant.
const PRECHARGE_TAU_MS: f32 = 100.0;
/// Discharge of the car rail with every contactor open.
const BLEED_TAU_MS: f32 = 1000.0;
/// Second reference of the auxiliary ADC, reported in register AUXB.
const VREF2_CODE: u16 = 30_000;

/// Virtual time in nanoseconds.
#[derive(Debug, Clone, Default)]
pub struct SimClock(Rc<Cell<u64>>);

impl SimClock {
    pub fn now_ns(&self) -> u64 {
        self.0.get()
    }

    pub fn now_ms(&self) -> u64 {
        self.0.get() / 1_000_000
    }

    pub fn advance_ns(&self, ns: u64) {
        self.0.set(self.0.get() + ns);
    }
}

/// Delay that advances the virtual clock instead of sleeping.
#[derive(Debug, Clone)]
pub struct SimDelay(pub SimClock);

impl DelayNs for SimDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.0.advance_ns(u64::from(ns));
    }
}

/// Microsecond counter of the virtual clock; wraps like a hardware timer.
#[derive(Debug, Clone)]
pub struct SimTicker(pub SimClock);

impl Ticker for SimTicker {
    fn now_us(&mut self) -> u32 {
        (self.0.now_ns() / 1000) as u32
    }
}

/// Physical state of the pack and everything wired to the controller.
#[derive(Debug)]
pub struct PackModel {
    /// Cell voltages in mV, chain order.
    pub cells: Vec<f32>,
    /// Thermistor temperatures in degC, chain order.
    pub temperatures: Vec<f32>,
    /// mA, positive while charging.
    pub current: f32,
    /// Car side of the contactors, mV.
    pub car_voltage: f32,
    pub contactors: [bool; 4],
    /// Auxiliary contacts welded closed.
    pub welded: [bool; 4],
    pub indicators: [bool; 4],
    /// Fan duty, 0..=1000.
    pub fans: [u16; 2],
    /// Discharge switches per IC, as last written.
    pub balancing: Vec<u16>,
    /// Number of upcoming register blocks sent with a broken PEC.
    pub corrupt_blocks: u32,
    /// Peak measurement noise in mV.
    pub noise: f32,
    rng: StdRng,
}

impl PackModel {
    pub fn new(ics: usize, seed: u64) -> Self {
        Self {
            cells: vec![3900.0; ics * CELLS_PER_IC],
            temperatures: vec![25.0; ics * CELLS_PER_IC],
            current: 0.0,
            car_voltage: 0.0,
            contactors: [false; 4],
            welded: [false; 4],
            indicators: [false; 4],
            fans: [0; 2],
            balancing: vec![0; ics],
            corrupt_blocks: 0,
            noise: 0.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Sum of the cells, mV.
    pub fn pack_voltage(&self) -> f32 {
        self.cells.iter().sum()
    }

    pub fn contactor(&self, contactor: Contactor) -> bool {
        self.contactors[contactor as usize]
    }

    fn noise(&mut self) -> f32 {
        if self.noise <= 0.0 {
            return 0.0;
        }
        self.rng.gen_range(-self.noise..=self.noise)
    }

    /// Moves the car rail towards its steady state over `elapsed_ms`.
    fn settle(&mut self, elapsed_ms: f32) {
        let grounded = self.contactor(Contactor::Ground);
        let pack = self.pack_voltage();
        if grounded && self.contactor(Contactor::Positive) {
            self.car_voltage = pack;
        } else if grounded && self.contactor(Contactor::Precharge) {
            let k = 1.0 - (-elapsed_ms / PRECHARGE_TAU_MS).exp();
            self.car_voltage += (pack - self.car_voltage) * k;
        } else {
            self.car_voltage *= (-elapsed_ms / BLEED_TAU_MS).exp();
        }
    }
}

pub type SharedPack = Rc<RefCell<PackModel>>;

/// Auxiliary ADC code of a thermistor at `temperature` degC.
pub fn thermistor_code(temperature: f32) -> u16 {
    if temperature < 0.0 {
        return BREAKPOINTS[0] + 100;
    }
    if temperature > 90.0 {
        return BREAKPOINTS[BREAKPOINTS.len() - 1] - 100;
    }
    let bucket = ((temperature / 10.0) as usize).min(BREAKPOINTS.len() - 2);
    let fraction = (temperature - bucket as f32 * 10.0) / 10.0;
    let upper = f32::from(BREAKPOINTS[bucket]);
    let lower = f32::from(BREAKPOINTS[bucket + 1]);
    (upper - fraction * (upper - lower)).round() as u16
}

/// Registers of the simulated cell monitor chain.
#[derive(Debug)]
struct Chain {
    pack: SharedPack,
    cells: Vec<[u16; CELLS_PER_IC]>,
    aux: Vec<[u16; 6]>,
    comm: Vec<[u8; GROUP_LEN]>,
    mux: Vec<u8>,
    /// Bytes clocked in since chip select went low.
    shifted: Vec<u8>,
}

impl Chain {
    fn new(ics: usize, pack: SharedPack) -> Self {
        Self {
            pack,
            cells: vec![[0; CELLS_PER_IC]; ics],
            aux: vec![[0; 6]; ics],
            comm: vec![[0; GROUP_LEN]; ics],
            mux: vec![0; ics],
            shifted: Vec::new(),
        }
    }

    fn ics(&self) -> usize {
        self.cells.len()
    }

    fn command(&self) -> Option<[u8; 2]> {
        let frame = self.shifted.get(..4)?;
        let command = [frame[0], frame[1]];
        if pec::pec15_bytes(&command) != [frame[2], frame[3]] {
            log::warn!("Chain: command {command:02X?} with bad PEC");
            return None;
        }
        Some(command)
    }

    /// Register group `opcode` reads, chain order.
    fn register(&self, command: [u8; 2], ic: usize) -> Option<[u8; GROUP_LEN]> {
        let words: &[u16] = match command {
            opcode::RDCVA => &self.cells[ic][0..3],
            opcode::RDCVB => &self.cells[ic][3..6],
            opcode::RDCVC => &self.cells[ic][6..9],
            opcode::RDCVD => &self.cells[ic][9..12],
            opcode::RDAUXA => &self.aux[ic][0..3],
            opcode::RDAUXB => &self.aux[ic][3..6],
            _ => return None,
        };
        let mut group = [0; GROUP_LEN];
        for (bytes, word) in group.chunks_exact_mut(2).zip(words) {
            bytes.copy_from_slice(&word.to_le_bytes());
        }
        Some(group)
    }

    /// Answers a read command while its response is clocked out.
    fn respond(&mut self, words: &mut [u8]) {
        words.fill(0xFF);
        let Some(command) = self.command() else {
            return;
        };
        let mut pack = self.pack.borrow_mut();
        for (ic, block) in words.chunks_exact_mut(BLOCK_LEN).take(self.ics()).enumerate() {
            let Some(group) = self.register(command, ic) else {
                return;
            };
            block[..GROUP_LEN].copy_from_slice(&group);
            block[GROUP_LEN..].copy_from_slice(&pec::pec15_bytes(&group));
            if pack.corrupt_blocks > 0 {
                pack.corrupt_blocks -= 1;
                block[BLOCK_LEN - 1] ^= 0x01;
            }
        }
    }

    /// Payload of a write command, chain order.
    fn written_groups(&self) -> Vec<Option<[u8; GROUP_LEN]>> {
        let payload = self.shifted.get(4..).unwrap_or_default();
        let mut groups: Vec<_> = payload
            .chunks_exact(BLOCK_LEN)
            .take(self.ics())
            .map(|block| {
                let (data, received) = block.split_at(GROUP_LEN);
                pec::verify(data, [received[0], received[1]])
                    .ok()
                    .map(|()| {
                        let mut group = [0; GROUP_LEN];
                        group.copy_from_slice(data);
                        group
                    })
            })
            .collect();
        // furthest IC is shifted in first
        groups.reverse();
        groups
    }

    /// Executes the command clocked in, on the rising edge of chip select.
    fn end_transaction(&mut self) {
        let Some(command) = self.command() else {
            self.shifted.clear();
            return;
        };
        match command {
            opcode::WRCFG => {
                let groups = self.written_groups();
                let mut pack = self.pack.borrow_mut();
                for (ic, group) in groups.into_iter().enumerate() {
                    if let Some(group) = group {
                        pack.balancing[ic] =
                            u16::from(group[4]) | (u16::from(group[5] & 0x0F) << 8);
                    }
                }
            }
            opcode::WRCOMM => {
                for (ic, group) in self.written_groups().into_iter().enumerate() {
                    if let Some(group) = group {
                        self.comm[ic] = group;
                    }
                }
            }
            opcode::STCOMM => {
                for (mux, comm) in self.mux.iter_mut().zip(&self.comm) {
                    *mux = (comm[3] >> 4) & 0x07;
                }
            }
            [0x02 | 0x03, second] if second & 0x60 == 0x60 => self.convert_cells(),
            [0x04 | 0x05, second] if second & 0x60 == 0x60 => self.convert_aux(),
            _ => log::trace!("Chain: ignoring {command:02X?}"),
        }
        self.shifted.clear();
    }

    fn convert_cells(&mut self) {
        let mut pack = self.pack.borrow_mut();
        for ic in 0..self.cells.len() {
            for cell in 0..CELLS_PER_IC {
                let noise = pack.noise();
                let voltage = pack.cells[ic * CELLS_PER_IC + cell] + noise;
                self.cells[ic][cell] = (voltage * 10.0).clamp(0.0, 65_535.0) as u16;
            }
        }
    }

    fn convert_aux(&mut self) {
        let pack = self.pack.borrow();
        for (ic, aux) in self.aux.iter_mut().enumerate() {
            let channel = usize::from(self.mux[ic]);
            let first = ic * CELLS_PER_IC + channel;
            *aux = [
                thermistor_code(pack.temperatures[first]),
                thermistor_code(pack.temperatures[first + 6]),
                0,
                0,
                0,
                VREF2_CODE,
            ];
        }
    }
}

/// SPI side of the simulated chain.
pub struct SimSpi(Rc<RefCell<Chain>>);

impl embedded_hal::spi::ErrorType for SimSpi {
    type Error = Infallible;
}

impl SpiBus for SimSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.0.borrow_mut().respond(words);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        self.0.borrow_mut().shifted.extend_from_slice(words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        let mut chain = self.0.borrow_mut();
        chain.respond(read);
        chain.shifted.extend_from_slice(write);
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.0.borrow_mut().respond(words);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// Chip select of the simulated chain.
pub struct SimCs(Rc<RefCell<Chain>>);

impl embedded_hal::digital::ErrorType for SimCs {
    type Error = Infallible;
}

impl OutputPin for SimCs {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().shifted.clear();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().end_transaction();
        Ok(())
    }
}

/// Contactor coil or indicator LED.
pub struct SimPin {
    pack: SharedPack,
    contactor: Contactor,
    indicator: bool,
}

impl embedded_hal::digital::ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.set(true);
        Ok(())
    }
}

impl SimPin {
    fn set(&mut self, high: bool) {
        let mut pack = self.pack.borrow_mut();
        let index = self.contactor as usize;
        if self.indicator {
            pack.indicators[index] = high;
        } else {
            pack.contactors[index] = high;
        }
    }
}

/// Auxiliary contact: high while the contactor is open.
pub struct SimFeedback {
    pack: SharedPack,
    contactor: Contactor,
}

impl embedded_hal::digital::ErrorType for SimFeedback {
    type Error = Infallible;
}

impl InputPin for SimFeedback {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        let pack = self.pack.borrow();
        let index = self.contactor as usize;
        Ok(!(pack.contactors[index] || pack.welded[index]))
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        self.is_high().map(|high| !high)
    }
}

pub struct SimPwm {
    pack: SharedPack,
    fan: Fan,
}

impl embedded_hal::pwm::ErrorType for SimPwm {
    type Error = Infallible;
}

impl SetDutyCycle for SimPwm {
    fn max_duty_cycle(&self) -> u16 {
        1000
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Infallible> {
        self.pack.borrow_mut().fans[self.fan as usize] = duty;
        Ok(())
    }
}

/// Shunt amplifier and car rail divider.
pub struct SimAnalog {
    pack: SharedPack,
    clock: SimClock,
    last_ns: u64,
    /// ADC counts at 0 A.
    pub zero: i32,
    current_scaling: f32,
    voltage_scaling: f32,
}

impl SimAnalog {
    pub fn new(pack: SharedPack, clock: SimClock, config: &Config) -> Self {
        Self {
            pack,
            last_ns: clock.now_ns(),
            clock,
            zero: config.pack_current_offset,
            current_scaling: config.pack_current_scaling,
            voltage_scaling: config.pack_voltage_scaling,
        }
    }
}

impl AnalogInput for SimAnalog {
    fn read_current(&mut self) -> Result<i32, Error> {
        let mut pack = self.pack.borrow_mut();
        let noise = pack.noise();
        let current = pack.current + noise;
        Ok(self.zero - (current / self.current_scaling).round() as i32)
    }

    fn read_voltage(&mut self) -> Result<i32, Error> {
        let now = self.clock.now_ns();
        let elapsed_ms = (now - self.last_ns) as f32 / 1_000_000.0;
        self.last_ns = now;
        let mut pack = self.pack.borrow_mut();
        pack.settle(elapsed_ms);
        Ok((pack.car_voltage / self.voltage_scaling).round() as i32)
    }
}

/// Both directions of the simulated bus.
#[derive(Debug, Default)]
pub struct CanWire {
    pub to_controller: VecDeque<CanFrame>,
    pub from_controller: VecDeque<CanFrame>,
    /// Transmissions rejected as busy before the next one succeeds.
    pub busy: u32,
    pub bus_off: bool,
}

/// The controller is not participating in bus traffic.
#[derive(Debug)]
pub struct BusOff;

impl embedded_can::Error for BusOff {
    fn kind(&self) -> embedded_can::ErrorKind {
        embedded_can::ErrorKind::Other
    }
}

/// Controller side of a [`CanWire`].
pub struct SimCan(pub Rc<RefCell<CanWire>>);

impl embedded_can::nb::Can for SimCan {
    type Frame = CanFrame;
    type Error = BusOff;

    fn transmit(&mut self, frame: &CanFrame) -> nb::Result<Option<CanFrame>, BusOff> {
        let mut wire = self.0.borrow_mut();
        if wire.bus_off {
            return Err(nb::Error::Other(BusOff));
        }
        if wire.busy > 0 {
            wire.busy -= 1;
            return Err(nb::Error::WouldBlock);
        }
        wire.from_controller.push_back(*frame);
        Ok(None)
    }

    fn receive(&mut self) -> nb::Result<CanFrame, BusOff> {
        self.0
            .borrow_mut()
            .to_controller
            .pop_front()
            .ok_or(nb::Error::WouldBlock)
    }
}

pub type SimOutputs = ContactorBank<SimPin, SimFeedback, SimPwm, SimDelay>;

pub type SimController<const N: usize> = BatteryController<
    SimSpi,
    SimCs,
    SimDelay,
    SimOutputs,
    SimAnalog,
    SimTicker,
    CanInterface<SimCan, SimDelay>,
    N,
>;

/// A controller wired to a simulated pack of `N` cell monitor ICs.
pub struct Simulation<const N: usize> {
    pub controller: SimController<N>,
    pub pack: SharedPack,
    pub wire: Rc<RefCell<CanWire>>,
    pub clock: SimClock,
    rx_base: u32,
    tx_base: u32,
}

impl<const N: usize> Simulation<N> {
    pub fn new(config: Config, seed: u64) -> Result<Self, Error> {
        let clock = SimClock::default();
        let delay = SimDelay(clock.clone());
        let pack = Rc::new(RefCell::new(PackModel::new(N, seed)));

        let chain = Rc::new(RefCell::new(Chain::new(N, pack.clone())));
        let monitor = CellMonitor::new(SimSpi(chain.clone()), SimCs(chain), delay.clone())?;

        let channel = |contactor: Contactor| {
            let pin = |indicator| SimPin {
                pack: pack.clone(),
                contactor,
                indicator,
            };
            let channel = ContactorChannel::new(pin(false)).with_indicator(pin(true));
            // the charge contactor has no auxiliary contact
            if contactor == Contactor::Charge {
                channel
            } else {
                channel.with_feedback(SimFeedback {
                    pack: pack.clone(),
                    contactor,
                })
            }
        };
        let fan = |fan| SimPwm {
            pack: pack.clone(),
            fan,
        };
        let output = ContactorBank::new(
            channel(Contactor::Ground),
            channel(Contactor::Positive),
            channel(Contactor::Precharge),
            channel(Contactor::Charge),
            delay.clone(),
            config.charge_contactor_delay,
        )
        .with_fan(Fan::One, fan(Fan::One))
        .with_fan(Fan::Two, fan(Fan::Two));

        let wire = Rc::new(RefCell::new(CanWire::default()));
        let bus = CanInterface::new(SimCan(wire.clone()), delay.clone(), config.can_tx_base);
        let analog = SimAnalog::new(pack.clone(), clock.clone(), &config);
        let (rx_base, tx_base) = (config.can_rx_base, config.can_tx_base);

        let controller = BatteryController::new(
            config,
            monitor,
            output,
            analog,
            SimTicker(clock.clone()),
            bus,
            delay,
        );
        Ok(Self {
            controller,
            pack,
            wire,
            clock,
            rx_base,
            tx_base,
        })
    }

    /// Queues a command for the controller.
    pub fn send<M: Message>(&self, message: &M) -> Result<(), Error> {
        let id = frame_id(self.rx_base + M::CODE)?;
        let frame = CanFrame::new(id, &message.encode()).ok_or(Error::FrameLength {
            expected: M::LENGTH,
            received: message.encode().len(),
        })?;
        self.wire.borrow_mut().to_controller.push_back(frame);
        Ok(())
    }

    /// Drains everything the controller sent.
    pub fn sent_frames(&self) -> Vec<RawFrame> {
        self.wire
            .borrow_mut()
            .from_controller
            .drain(..)
            .filter_map(|frame| {
                Some(RawFrame {
                    id: crate::can::raw_id(frame.id()),
                    payload: FrameBuffer::from_slice(frame.data()).ok()?,
                })
            })
            .collect()
    }

    /// Drains and decodes everything the controller sent.
    pub fn received(&self) -> Vec<Outbound> {
        self.sent_frames()
            .iter()
            .filter_map(
                |frame| match Outbound::parse(frame.id, self.tx_base, &frame.payload) {
                    Ok(message) => message,
                    Err(error) => {
                        log::warn!("Undecodable frame {:03X}: {error}", frame.id);
                        None
                    }
                },
            )
            .collect()
    }

    /// Runs the main loop until `ms` of virtual time have passed.
    pub fn run_for(&mut self, ms: u64) -> Result<(), Error> {
        let end = self.clock.now_ms() + ms;
        while self.clock.now_ms() < end {
            self.controller.run_cycle()?;
        }
        Ok(())
    }
}
