//! The acquisition loop.
//!
//! One [`BatteryController::run_cycle`] ticks the state machine, samples the
//! shunt and the car rail, and converts the cell chain. Every
//! `slow_acquisition_divider` cycles it additionally balances, reads the
//! thermistors and broadcasts the per cell readings.

use crate::can::FrameBus;
use crate::cmu::CellMonitor;
use crate::config::Config;
use crate::output::{Fan, OutputInterface};
use crate::state_machine::StateMachine;
use crate::Error;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_hal::spi::SpiBus;

/// Default pause at the end of every cycle.
pub const LOOP_DELAY_MS: u32 = 5;

/// Free running microsecond counter.
pub trait Ticker {
    fn now_us(&mut self) -> u32;
}

/// Shunt and car rail ADC, raw counts.
pub trait AnalogInput {
    fn read_current(&mut self) -> Result<i32, Error>;

    fn read_voltage(&mut self) -> Result<i32, Error>;
}

pub struct BatteryController<SPI, CS, D, O, A, T, B, const N: usize> {
    machine: StateMachine<O, D>,
    monitor: CellMonitor<SPI, CS, D, N>,
    analog: A,
    ticker: T,
    bus: B,
    delay: D,
    loop_delay_ms: u32,
    /// Running average of the cell sum, mV.
    pack_voltage: Option<i32>,
    acquisitions: u16,
}

impl<SPI, CS, D, O, A, T, B, const N: usize> BatteryController<SPI, CS, D, O, A, T, B, N>
where
    SPI: SpiBus,
    CS: OutputPin,
    D: DelayNs + Clone,
    O: OutputInterface,
    A: AnalogInput,
    T: Ticker,
    B: FrameBus,
{
    pub fn new(
        config: Config,
        monitor: CellMonitor<SPI, CS, D, N>,
        output: O,
        analog: A,
        ticker: T,
        bus: B,
        delay: D,
    ) -> Self {
        let mut machine = StateMachine::new(config, output, delay.clone());
        machine.output_mut().set_fan_speed(Fan::Two, u8::MAX);
        Self {
            machine,
            monitor,
            analog,
            ticker,
            bus,
            delay,
            loop_delay_ms: LOOP_DELAY_MS,
            pack_voltage: None,
            acquisitions: 0,
        }
    }

    pub fn set_loop_delay(&mut self, ms: u32) {
        self.loop_delay_ms = ms;
    }

    pub fn machine(&self) -> &StateMachine<O, D> {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut StateMachine<O, D> {
        &mut self.machine
    }

    pub fn monitor(&self) -> &CellMonitor<SPI, CS, D, N> {
        &self.monitor
    }

    /// Takes the current shunt reading as zero. Call with the contactors open.
    pub fn calibrate_shunt(&mut self) -> Result<i32, Error> {
        let raw = self.analog.read_current()?;
        log::info!("Shunt offset calibrated to {raw}");
        self.machine.config_mut().pack_current_offset = raw;
        Ok(raw)
    }

    /// One pass of the main loop: tick, sample shunt and rail, convert the
    /// cells. Readings are evaluated as they arrive; the telemetry of the tick
    /// reports the previous pass.
    pub fn run_cycle(&mut self) -> Result<(), Error> {
        let now = self.ticker.now_us();
        self.machine.tick(now, &mut self.bus);
        self.sample_inputs()?;
        self.update_pack_voltage()?;
        self.delay.delay_ms(self.loop_delay_ms);
        Ok(())
    }

    /// Runs forever; a failed cycle is logged and the next one started.
    pub fn run(&mut self) -> ! {
        loop {
            if let Err(error) = self.run_cycle() {
                log::error!("Cycle failed: {error}");
            }
        }
    }

    fn sample_inputs(&mut self) -> Result<(), Error> {
        let raw_current = self.analog.read_current()?;
        let current = self.machine.config().scale_current(raw_current);
        self.machine.set_current(current);

        let raw_voltage = self.analog.read_voltage()?;
        let voltage = self.machine.config().scale_voltage(raw_voltage);
        self.machine.set_car_voltage(voltage);
        Ok(())
    }

    fn update_pack_voltage(&mut self) -> Result<(), Error> {
        self.acquisitions += 1;
        let slow = self.acquisitions >= self.machine.config().slow_acquisition_divider;
        if slow {
            self.acquisitions = 0;
            let threshold = self.machine.config().cell_balance_voltage;
            self.monitor.do_cell_balance(threshold)?;
        }

        let clean = self.monitor.do_cell_conversion()?;

        if slow {
            if !self.monitor.do_temperature_conversion()? {
                log::debug!("Some thermistor reads were discarded");
            }
            let bank = self.monitor.snapshot();
            for reading in bank.readings() {
                if let Err(error) = self.bus.send(&reading) {
                    log::warn!("Dropped cell reading {:?}: {error}", reading.cell_id);
                }
            }
            if let Some((coldest, hottest)) = bank.temperature_range() {
                self.machine.handle_cell_temperature(coldest, hottest);
            }
        }

        if !clean {
            log::debug!("Cell readings incomplete, skipping evaluation");
            return Ok(());
        }

        let extremes = self.monitor.snapshot().extremes();
        log::trace!(
            "Cells: min {} mV (#{}), max {} mV (#{}), sum {} mV",
            extremes.min,
            extremes.min_index,
            extremes.max,
            extremes.max_index,
            extremes.sum
        );
        self.machine.handle_cell_voltage(extremes.min, extremes.max);

        let n = i32::from(self.machine.config().pack_voltage_average_n.max(1));
        let average = match self.pack_voltage {
            None => extremes.sum,
            Some(average) => average - average / n + extremes.sum / n,
        };
        self.pack_voltage = Some(average);
        self.machine.set_pack_voltage(average);
        Ok(())
    }
}
