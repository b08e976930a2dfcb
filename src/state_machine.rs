//! The safety state machine.
//!
//! Fuses pack current and voltages, cell extremes and bus commands into the
//! operating state, drives the contactors on every transition and emits the
//! periodic telemetry. Faults never surface as `Err`: they are flag bits plus
//! a transition, reported through the `Issue` frame.

use crate::can::FrameBus;
use crate::config::{Config, VoltageLimits};
use crate::output::{Contactor, OutputInterface};
use crate::protocol::{tx, FaultFlags, Inbound, Message};
use crate::soc;
use crate::state::{self, Reason, State, Transition};
use embedded_hal::delay::DelayNs;
use std::fmt;

#[cfg(feature = "serde")]
use serde::Serialize;

/// Precharge to run: wait before closing the main positive contactor.
const POSITIVE_CLOSE_DELAY_MS: u32 = 200;
/// Precharge to run: wait before opening the precharge contactor.
const PRECHARGE_OPEN_DELAY_MS: u32 = 50;
/// Precharge to run: wait before closing the charge contactor.
const CHARGE_CLOSE_DELAY_MS: u32 = 500;

/// Which reading a voltage check applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rail {
    Cell,
    Pack,
}

impl fmt::Display for Rail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rail::Cell => write!(f, "cell"),
            Rail::Pack => write!(f, "pack"),
        }
    }
}

/// Externally visible state, as logged and printed by the tools.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Status {
    pub state: State,
    pub faults: FaultFlags,
    /// Milliseconds since the first tick.
    pub time: u64,
    pub pack_voltage: Option<i32>,
    pub car_voltage: Option<i32>,
    pub pack_current: Option<i32>,
    pub cell_checks_suppressed: bool,
}

pub struct StateMachine<O, D> {
    config: Config,
    output: O,
    delay: D,

    state: State,
    faults: FaultFlags,
    last: Option<Transition>,

    last_ticker: Option<u32>,
    ticker_remainder_us: u64,
    current_time: u64,
    last_transition: u64,
    last_heartbeat: u64,
    last_fast: u64,
    last_slow: u64,

    pack_current: Option<i32>,
    pack_voltage: Option<i32>,
    car_voltage: Option<i32>,
    /// Set while the horn is sounding; its noise corrupts the cell readings.
    suppress_cell_checks: bool,
    /// Soft under-voltage per rail; [`FaultFlags::UNDERVOLTAGE`] is their union.
    cell_undervoltage: bool,
    pack_undervoltage: bool,
}

fn send<B: FrameBus, M: Message>(bus: &mut B, message: &M) {
    if let Err(error) = bus.send(message) {
        log::warn!("Dropped {}: {error}", M::NAME);
    }
}

impl<O, D> StateMachine<O, D>
where
    O: OutputInterface,
    D: DelayNs,
{
    /// Starts in [`State::Idle`] with every contactor open.
    pub fn new(config: Config, output: O, delay: D) -> Self {
        let mut machine = Self {
            config,
            output,
            delay,
            state: State::Idle,
            faults: FaultFlags::empty(),
            last: None,
            last_ticker: None,
            ticker_remainder_us: 0,
            current_time: 0,
            last_transition: 0,
            last_heartbeat: 0,
            last_fast: 0,
            last_slow: 0,
            pack_current: None,
            pack_voltage: None,
            car_voltage: None,
            suppress_cell_checks: false,
            cell_undervoltage: false,
            pack_undervoltage: false,
        };
        machine.execute(Transition {
            from: State::Idle,
            to: State::Idle,
            reason: Reason::IdleCommand,
        });
        machine
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn faults(&self) -> FaultFlags {
        self.faults
    }

    /// The most recent transition.
    pub fn last_transition(&self) -> Option<Transition> {
        self.last
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut O {
        &mut self.output
    }

    /// Milliseconds since the first tick.
    pub fn now(&self) -> u64 {
        self.current_time
    }

    pub fn status(&self) -> Status {
        Status {
            state: self.state,
            faults: self.faults,
            time: self.current_time,
            pack_voltage: self.pack_voltage,
            car_voltage: self.car_voltage,
            pack_current: self.pack_current,
            cell_checks_suppressed: self.suppress_cell_checks,
        }
    }

    fn since(&self, then: u64) -> u64 {
        self.current_time.saturating_sub(then)
    }

    /// Raises the faults of `reason` and takes the transition, if any.
    fn apply(&mut self, reason: Reason) -> Option<Transition> {
        self.faults |= reason.fault();
        let transition = state::next(self.state, reason)?;
        self.execute(transition);
        Some(transition)
    }

    fn execute(&mut self, transition: Transition) {
        log::info!("State change: {transition}");
        self.enter(transition);
        self.state = transition.to;
        self.last_transition = self.current_time;
        self.last = Some(transition);
    }

    fn enter(&mut self, transition: Transition) {
        match (transition.to, transition.reason) {
            (State::Idle | State::Error, _) => {
                if !self.output.shutdown() {
                    log::error!("Shutdown not confirmed");
                    self.faults |= FaultFlags::CONTACTOR;
                }
            }
            (State::Precharge, _) => {
                self.switch(Contactor::Ground, true);
                self.delay.delay_ms(self.config.ground_settle_delay);
                self.switch(Contactor::Precharge, true);
            }
            (State::Run, Reason::PrechargeComplete) => {
                self.delay.delay_ms(POSITIVE_CLOSE_DELAY_MS);
                self.switch(Contactor::Positive, true);
                self.delay.delay_ms(PRECHARGE_OPEN_DELAY_MS);
                self.switch(Contactor::Precharge, false);
                self.delay.delay_ms(CHARGE_CLOSE_DELAY_MS);
                self.switch(Contactor::Charge, true);
            }
            (State::Run, Reason::ChargeResume) => self.switch(Contactor::Charge, true),
            (State::Charged, _) => self.switch(Contactor::Charge, false),
            _ => {}
        }
    }

    fn switch(&mut self, contactor: Contactor, closed: bool) {
        if !self.output.set_contactor(contactor, closed) {
            log::error!("{contactor:?} contactor failed to switch");
            self.faults |= FaultFlags::CONTACTOR;
        }
    }

    /// Moves to `state` regardless of the transition table. Bring-up only.
    pub fn force_transition(&mut self, state: State) -> Option<Transition> {
        if state == State::ErrorUnlock {
            log::warn!("Cannot force the unlock pseudo state");
            return None;
        }
        let transition = Transition {
            from: self.state,
            to: state,
            reason: Reason::Forced,
        };
        self.execute(transition);
        log::warn!("Transition forced to state {state}!");
        Some(transition)
    }

    /// Advances the clock from a free running microsecond counter, which may
    /// wrap around.
    fn advance_clock(&mut self, now_us: u32) {
        if let Some(last) = self.last_ticker {
            let elapsed = u64::from(now_us.wrapping_sub(last)) + self.ticker_remainder_us;
            self.current_time += elapsed / 1000;
            self.ticker_remainder_us = elapsed % 1000;
        }
        self.last_ticker = Some(now_us);
    }

    /// Periodic update: timeouts, telemetry and inbound commands.
    pub fn tick<B: FrameBus>(&mut self, now_us: u32, bus: &mut B) {
        self.advance_clock(now_us);

        if !matches!(self.state, State::Idle | State::Error)
            && self.since(self.last_heartbeat) > u64::from(self.config.heartbeat_timeout)
        {
            log::warn!(
                "Heartbeat timeout! Diff: {} ms",
                self.since(self.last_heartbeat)
            );
            self.apply(Reason::HeartbeatTimeout);
        }

        if self.state == State::Precharge {
            self.check_precharge();
        }

        if self.since(self.last_fast) >= u64::from(self.config.fast_telemetry_period) {
            self.last_fast = self.current_time;
            self.send_fast(bus);
        }

        if self.since(self.last_slow) >= u64::from(self.config.slow_telemetry_period) {
            self.last_slow = self.current_time;
            self.send_slow(bus);
        }

        while let Some(frame) = bus.poll() {
            self.handle_frame(frame.id, &frame.payload);
        }
    }

    fn send_fast<B: FrameBus>(&mut self, bus: &mut B) {
        let pack_voltage = self.pack_voltage.unwrap_or(0);
        let pack_current = self.pack_current.unwrap_or(0);
        send(
            bus,
            &tx::PackVoltage {
                pack_voltage,
                car_voltage: self.car_voltage.unwrap_or(0),
            },
        );
        send(bus, &tx::PackCurrent { pack_current });

        if self.state == State::Error {
            self.output.toggle_indicators();
        }

        send(bus, &soc::estimate(pack_voltage, pack_current, &self.config));
    }

    fn send_slow<B: FrameBus>(&mut self, bus: &mut B) {
        send(
            bus,
            &tx::Heartbeat {
                state: self.state.code(),
            },
        );
        if !self.faults.is_empty() {
            send(
                bus,
                &tx::Issue {
                    what_went_wrong: self.faults,
                },
            );
        }
        log::debug!(
            "Pack voltage: {:?} mV, car voltage: {:?} mV, current: {:?} mA",
            self.pack_voltage,
            self.car_voltage,
            self.pack_current
        );
    }

    fn precharge_complete(&self) -> bool {
        match (self.car_voltage, self.pack_voltage) {
            (Some(car), Some(pack)) if pack > 0 => {
                car as f32 >= self.config.precharge_complete_fraction * pack as f32
            }
            _ => false,
        }
    }

    fn check_precharge(&mut self) {
        let elapsed = self.since(self.last_transition);
        if elapsed >= u64::from(self.config.precharge_timeout) {
            log::error!("Precharge failed!");
            self.apply(Reason::PrechargeTimeout);
        } else if elapsed >= u64::from(self.config.precharge_min_time) && self.precharge_complete()
        {
            self.apply(Reason::PrechargeComplete);
        }
    }

    /// New pack current reading, mA.
    pub fn set_current(&mut self, current: i32) {
        self.pack_current = Some(current);
        if self.state == State::Error {
            return;
        }

        if current < self.config.max_discharge_current {
            log::error!("Discharge current limit exceeded: {current} mA");
            self.apply(Reason::OverDischargeCurrent);
        } else if current > self.config.max_charge_current {
            log::error!("Charge current limit exceeded: {current} mA");
            self.apply(Reason::OverChargeCurrent);
        }
    }

    /// New (averaged) pack voltage, mV.
    pub fn set_pack_voltage(&mut self, voltage: i32) {
        self.pack_voltage = Some(voltage);
        if self.state == State::Error {
            return;
        }

        let limits = self.config.pack_limits();
        self.evaluate_voltage(voltage, voltage, limits, Rail::Pack);
        if self.state == State::Precharge {
            self.check_precharge();
        }
    }

    /// New car rail voltage, mV.
    pub fn set_car_voltage(&mut self, voltage: i32) {
        self.car_voltage = Some(voltage);
        if self.state == State::Precharge {
            self.check_precharge();
        }
    }

    /// Lowest and highest cell voltage of a verified acquisition, mV.
    pub fn handle_cell_voltage(&mut self, min: i32, max: i32) {
        if self.state == State::Error {
            return;
        }
        if self.suppress_cell_checks {
            log::trace!("Horn active, skipping cell voltage check");
            return;
        }
        let limits = self.config.cell_limits();
        self.evaluate_voltage(min, max, limits, Rail::Cell);
    }

    fn evaluate_voltage(&mut self, low: i32, high: i32, limits: VoltageLimits, source: Rail) {
        if high > limits.over {
            log::error!("Over {source} voltage: {high} mV");
            self.apply(Reason::OverVoltage);
            return;
        }

        if high > limits.max && matches!(self.state, State::Run | State::Balance) {
            log::debug!("Stop charging, {source} at {high} mV");
            self.apply(Reason::ChargeComplete);
        }

        if high < limits.cutin && self.state == State::Charged {
            log::debug!("Resume charging, {source} at {high} mV");
            self.apply(Reason::ChargeResume);
        }

        if low < limits.under {
            log::error!("Under {source} voltage: {low} mV");
            self.apply(Reason::UnderVoltage);
            return;
        }

        let warn = low < limits.min && !matches!(self.state, State::Idle | State::Run);
        match source {
            Rail::Cell => self.cell_undervoltage = warn,
            Rail::Pack => self.pack_undervoltage = warn,
        }
        let undervoltage = self.cell_undervoltage || self.pack_undervoltage;
        self.set_condition(FaultFlags::UNDERVOLTAGE, undervoltage);
    }

    /// Raises or clears a condition that does not latch; latching flags only
    /// leave through an unlock.
    fn set_condition(&mut self, flag: FaultFlags, active: bool) {
        debug_assert!(!flag.intersects(FaultFlags::LATCHING), "{flag:?} latches");
        self.faults.set(flag.difference(FaultFlags::LATCHING), active);
    }

    /// Coldest and hottest valid thermistor code, whole degC.
    pub fn handle_cell_temperature(&mut self, coldest: u8, hottest: u8) {
        if self.state == State::Error {
            return;
        }

        let over = i32::from(hottest) * 10 > self.config.max_cell_temperature;
        let under = i32::from(coldest) * 10 < self.config.min_cell_temperature;
        if over && !self.faults.contains(FaultFlags::OVER_TEMPERATURE) {
            log::warn!("Over temperature: {hottest} degC");
        }
        if under && !self.faults.contains(FaultFlags::UNDER_TEMPERATURE) {
            log::warn!("Under temperature: {coldest} degC");
        }
        self.set_condition(FaultFlags::OVER_TEMPERATURE, over);
        self.set_condition(FaultFlags::UNDER_TEMPERATURE, under);
    }

    /// Dispatches one inbound frame.
    pub fn handle_frame(&mut self, id: u32, data: &[u8]) {
        let inbound = match Inbound::parse(id, self.config.can_rx_base, data) {
            Ok(Some(inbound)) => inbound,
            Ok(None) => return,
            Err(error) => {
                log::debug!("Discarding frame {id:03X}: {error}");
                return;
            }
        };

        match inbound {
            Inbound::StateChange(request) => self.handle_state_request(request.new_state),
            Inbound::Heartbeat(_) => {
                self.last_heartbeat = self.current_time;
                self.set_condition(FaultFlags::HEARTBEAT_TIMEOUT, false);
            }
            Inbound::HmiStatus(status) => {
                if status.horn() != self.suppress_cell_checks {
                    log::debug!("Cell voltage checks suppressed: {}", status.horn());
                }
                self.suppress_cell_checks = status.horn();
            }
        }
    }

    fn handle_state_request(&mut self, code: u8) {
        match State::try_from(code) {
            Ok(State::Idle) => {
                if self.apply(Reason::IdleCommand).is_none() {
                    log::debug!("Ignoring idle request in {}", self.state);
                }
            }
            Ok(State::Run) => {
                if self.apply(Reason::RunCommand).is_none() {
                    log::debug!("Ignoring run request in {}", self.state);
                }
            }
            Ok(State::Error) => {
                log::error!("CAN-initiated error state!");
                self.apply(Reason::ErrorCommand);
            }
            Ok(State::ErrorUnlock) => {
                if self.state != State::Error {
                    log::debug!("Ignoring unlock in {}", self.state);
                    return;
                }
                log::warn!("CAN forced state from error to idle!");
                self.output.clear_indicators();
                log::info!("Clearing fault flags {:?}", self.faults);
                self.faults = FaultFlags::empty();
                self.cell_undervoltage = false;
                self.pack_undervoltage = false;
                self.apply(Reason::Unlock);
            }
            Ok(other) => log::warn!("Malformed CAN: got state change request to {other}"),
            Err(error) => log::warn!("Malformed CAN: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::RawFrame;
    use crate::output::Fan;
    use crate::protocol::{rx, FrameBuffer};
    use crate::Error;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct Outputs {
        switched: Vec<(Contactor, bool)>,
        shutdowns: usize,
        stuck: Option<Contactor>,
        toggles: usize,
        cleared: usize,
    }

    impl OutputInterface for Outputs {
        fn set_contactor(&mut self, contactor: Contactor, closed: bool) -> bool {
            self.switched.push((contactor, closed));
            self.stuck != Some(contactor)
        }

        fn shutdown(&mut self) -> bool {
            self.shutdowns += 1;
            self.stuck.is_none()
        }

        fn set_fan_speed(&mut self, _fan: Fan, _speed: u8) {}

        fn toggle_indicators(&mut self) {
            self.toggles += 1;
        }

        fn clear_indicators(&mut self) {
            self.cleared += 1;
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    #[derive(Default)]
    struct Bus {
        sent: Vec<RawFrame>,
        inbox: VecDeque<RawFrame>,
    }

    impl Bus {
        fn sent_codes(&self) -> Vec<u32> {
            self.sent.iter().map(|frame| frame.id - 0x600).collect()
        }
    }

    impl FrameBus for Bus {
        fn send_raw(&mut self, code: u32, payload: &[u8]) -> Result<(), Error> {
            self.sent.push(RawFrame {
                id: 0x600 + code,
                payload: FrameBuffer::from_slice(payload)?,
            });
            Ok(())
        }

        fn poll(&mut self) -> Option<RawFrame> {
            self.inbox.pop_front()
        }
    }

    struct Rig {
        machine: StateMachine<Outputs, NoDelay>,
        bus: Bus,
        now_us: u32,
    }

    impl Rig {
        fn new(config: Config) -> Self {
            let mut rig = Self {
                machine: StateMachine::new(config, Outputs::default(), NoDelay),
                bus: Bus::default(),
                now_us: 0,
            };
            rig.machine.tick(0, &mut rig.bus);
            rig
        }

        fn advance(&mut self, ms: u32) {
            self.now_us = self.now_us.wrapping_add(ms * 1000);
            self.machine.tick(self.now_us, &mut self.bus);
        }

        fn receive<M: Message>(&mut self, message: &M) {
            self.bus.inbox.push_back(RawFrame {
                id: 0x200 + M::CODE,
                payload: message.encode(),
            });
        }

        fn command(&mut self, state: u8) {
            self.receive(&rx::StateChange { new_state: state });
            self.advance(0);
        }

        /// Idle -> Precharge -> Run with a healthy pack.
        fn run(&mut self) {
            self.command(State::Run.code());
            assert_eq!(self.machine.state(), State::Precharge);
            self.machine.set_pack_voltage(150_000);
            self.machine.set_car_voltage(145_000);
            self.advance(500);
            assert_eq!(self.machine.state(), State::Run);
        }
    }

    fn fresh() -> Rig {
        Rig::new(Config::default())
    }

    #[test]
    fn starts_idle_with_contactors_open() {
        let rig = fresh();
        assert_eq!(rig.machine.state(), State::Idle);
        assert_eq!(rig.machine.output().shutdowns, 1);
        assert!(rig.machine.faults().is_empty());
    }

    #[test]
    fn run_command_precharges() {
        let mut rig = fresh();
        rig.command(State::Run.code());
        assert_eq!(rig.machine.state(), State::Precharge);
        assert_eq!(
            rig.machine.output().switched,
            [(Contactor::Ground, true), (Contactor::Precharge, true)]
        );
    }

    #[test]
    fn precharge_completes_after_minimum_time() {
        let mut rig = fresh();
        rig.command(State::Run.code());
        rig.machine.set_pack_voltage(150_000);
        rig.machine.set_car_voltage(143_000);
        rig.advance(495);
        assert_eq!(rig.machine.state(), State::Precharge);
        rig.advance(5);
        assert_eq!(rig.machine.state(), State::Run);
        assert_eq!(
            rig.machine.output().switched[2..],
            [
                (Contactor::Positive, true),
                (Contactor::Precharge, false),
                (Contactor::Charge, true)
            ]
        );
        assert_eq!(
            rig.machine.last_transition().unwrap().reason,
            Reason::PrechargeComplete
        );
    }

    #[test]
    fn precharge_completes_on_car_voltage_update() {
        let mut rig = fresh();
        rig.command(State::Run.code());
        rig.machine.set_pack_voltage(150_000);
        rig.machine.set_car_voltage(100_000);
        rig.advance(700);
        assert_eq!(rig.machine.state(), State::Precharge);
        rig.machine.set_car_voltage(143_000);
        assert_eq!(rig.machine.state(), State::Run);
    }

    #[test]
    fn precharge_times_out() {
        let mut rig = fresh();
        rig.command(State::Run.code());
        rig.machine.set_pack_voltage(150_000);
        rig.machine.set_car_voltage(140_000);
        rig.advance(995);
        assert_eq!(rig.machine.state(), State::Precharge);
        rig.advance(5);
        assert_eq!(rig.machine.state(), State::Error);
        assert!(rig.machine.faults().contains(FaultFlags::PRECHARGE_FAIL));
        // late completion changes nothing
        rig.machine.set_car_voltage(150_000);
        assert_eq!(rig.machine.state(), State::Error);
    }

    #[test]
    fn precharge_needs_a_pack_voltage() {
        let mut rig = fresh();
        rig.command(State::Run.code());
        rig.machine.set_car_voltage(0);
        rig.advance(600);
        assert_eq!(rig.machine.state(), State::Precharge);
    }

    #[test]
    fn heartbeat_timeout_once_per_episode() {
        let mut rig = Rig::new(Config {
            heartbeat_timeout: 2000,
            ..Config::default()
        });
        rig.receive(&rx::Heartbeat);
        rig.run();
        rig.advance(1000);
        assert_eq!(rig.machine.state(), State::Run);
        rig.advance(1005);
        assert_eq!(rig.machine.state(), State::Idle);
        assert_eq!(
            rig.machine.last_transition().unwrap().reason,
            Reason::HeartbeatTimeout
        );
        assert!(rig.machine.faults().contains(FaultFlags::HEARTBEAT_TIMEOUT));

        let shutdowns = rig.machine.output().shutdowns;
        for _ in 0..10 {
            rig.advance(1000);
        }
        assert_eq!(rig.machine.output().shutdowns, shutdowns);
        assert_eq!(rig.machine.state(), State::Idle);

        rig.receive(&rx::Heartbeat);
        rig.advance(5);
        assert!(!rig.machine.faults().contains(FaultFlags::HEARTBEAT_TIMEOUT));
    }

    #[test]
    fn heartbeat_keeps_the_pack_running() {
        let mut rig = Rig::new(Config {
            heartbeat_timeout: 2000,
            ..Config::default()
        });
        rig.receive(&rx::Heartbeat);
        rig.run();
        for _ in 0..10 {
            rig.receive(&rx::Heartbeat);
            rig.advance(1000);
        }
        assert_eq!(rig.machine.state(), State::Run);
    }

    #[test]
    fn bad_heartbeat_is_discarded() {
        let mut rig = fresh();
        rig.bus.inbox.push_back(RawFrame {
            id: 0x200,
            payload: FrameBuffer::from_slice(&[0, 0, 0, 0]).unwrap(),
        });
        rig.advance(0);
        assert_eq!(rig.machine.state(), State::Idle);
    }

    #[test]
    fn lockout_survives_everything_but_unlock() {
        let mut rig = fresh();
        rig.run();
        rig.machine.set_pack_voltage(4401 * 36);
        assert_eq!(rig.machine.state(), State::Error);
        let lockout = FaultFlags::OVER_VOLTAGE_LOCKOUT;
        assert!(rig.machine.faults().contains(lockout));

        for step in 0..50 {
            let voltage = 90_000 + step * 2_000;
            rig.machine.set_pack_voltage(voltage);
            rig.machine.set_car_voltage(voltage);
            rig.machine.set_current(-60_000 + step * 2_500);
            rig.machine.handle_cell_voltage(2500 + step * 10, 3000 + step * 30);
            rig.machine.handle_cell_temperature(0, 90);
            rig.receive(&rx::Heartbeat);
            rig.receive(&rx::HmiStatus { buttons: step as u8 });
            rig.command(State::Idle.code());
            rig.command(State::Run.code());
            rig.command(State::Error.code());
            rig.advance(100);
            assert_eq!(rig.machine.state(), State::Error);
            assert!(rig.machine.faults().contains(lockout));
        }

        rig.command(State::ErrorUnlock.code());
        assert_eq!(rig.machine.state(), State::Idle);
        assert!(rig.machine.faults().is_empty());
        assert_eq!(rig.machine.output().cleared, 1);
    }

    #[test]
    fn unlock_outside_error_is_a_no_op() {
        let mut rig = fresh();
        rig.machine.handle_cell_temperature(20, 70);
        let faults = rig.machine.faults();
        let shutdowns = rig.machine.output().shutdowns;
        rig.command(State::ErrorUnlock.code());
        assert_eq!(rig.machine.state(), State::Idle);
        assert_eq!(rig.machine.faults(), faults);
        assert_eq!(rig.machine.output().shutdowns, shutdowns);
        assert_eq!(rig.machine.output().cleared, 0);
    }

    #[test]
    fn current_limits() {
        let mut rig = fresh();
        rig.run();
        rig.machine.set_current(-50_000);
        assert_eq!(rig.machine.state(), State::Run);
        rig.machine.set_current(-50_001);
        assert_eq!(rig.machine.state(), State::Error);
        assert!(rig
            .machine
            .faults()
            .contains(FaultFlags::OVER_DISCHARGE_CURRENT));

        let mut rig = fresh();
        rig.machine.set_current(50_001);
        assert_eq!(rig.machine.state(), State::Error);
        assert!(rig.machine.faults().contains(FaultFlags::OVER_CHARGE_CURRENT));
    }

    #[test]
    fn error_command() {
        let mut rig = fresh();
        rig.command(State::Error.code());
        assert_eq!(rig.machine.state(), State::Error);
        assert_eq!(rig.machine.faults(), FaultFlags::UNKNOWN);
        assert_eq!(rig.machine.output().shutdowns, 2);
    }

    #[test]
    fn idle_command() {
        let mut rig = fresh();
        rig.run();
        rig.command(State::Idle.code());
        assert_eq!(rig.machine.state(), State::Idle);
        // not a request the bus may make
        rig.command(State::Charged.code());
        rig.command(42);
        assert_eq!(rig.machine.state(), State::Idle);
    }

    #[test]
    fn charge_cycle_on_cell_voltage() {
        let mut rig = fresh();
        rig.run();
        rig.machine.handle_cell_voltage(4100, 4251);
        assert_eq!(rig.machine.state(), State::Charged);
        assert_eq!(
            rig.machine.output().switched.last(),
            Some(&(Contactor::Charge, false))
        );
        rig.machine.handle_cell_voltage(4100, 4210);
        assert_eq!(rig.machine.state(), State::Charged);
        rig.machine.handle_cell_voltage(4100, 4199);
        assert_eq!(rig.machine.state(), State::Run);
        assert_eq!(
            rig.machine.output().switched.last(),
            Some(&(Contactor::Charge, true))
        );
    }

    #[test]
    fn cell_lockouts() {
        let mut rig = fresh();
        rig.run();
        rig.machine.handle_cell_voltage(2699, 4000);
        assert_eq!(rig.machine.state(), State::Error);
        assert!(rig
            .machine
            .faults()
            .contains(FaultFlags::UNDER_VOLTAGE_LOCKOUT));

        let mut rig = fresh();
        rig.machine.handle_cell_voltage(3500, 4401);
        assert_eq!(rig.machine.state(), State::Error);
        assert!(rig
            .machine
            .faults()
            .contains(FaultFlags::OVER_VOLTAGE_LOCKOUT));
    }

    #[test]
    fn soft_undervoltage_is_not_latching() {
        let mut rig = fresh();
        rig.run();
        rig.machine.handle_cell_voltage(4000, 4251);
        assert_eq!(rig.machine.state(), State::Charged);
        rig.machine.handle_cell_voltage(2900, 4240);
        assert!(rig.machine.faults().contains(FaultFlags::UNDERVOLTAGE));
        rig.machine.handle_cell_voltage(3100, 4240);
        assert!(!rig.machine.faults().contains(FaultFlags::UNDERVOLTAGE));

        // not raised while running
        let mut rig = fresh();
        rig.run();
        rig.machine.handle_cell_voltage(2900, 4000);
        assert!(rig.machine.faults().is_empty());
    }

    #[test]
    fn undervoltage_is_tracked_per_rail() {
        let mut rig = fresh();
        rig.run();
        rig.machine.handle_cell_voltage(4000, 4251);
        assert_eq!(rig.machine.state(), State::Charged);

        // a healthy pack reading does not hide a weak cell
        rig.machine.handle_cell_voltage(2900, 4240);
        rig.machine.set_pack_voltage(35 * 4240 + 2900);
        assert_eq!(rig.machine.state(), State::Charged);
        assert!(rig.machine.faults().contains(FaultFlags::UNDERVOLTAGE));
        rig.machine.handle_cell_voltage(3100, 4240);
        assert!(!rig.machine.faults().contains(FaultFlags::UNDERVOLTAGE));

        // nor do healthy cells hide a weak pack
        let mut rig = fresh();
        rig.command(State::Run.code());
        assert_eq!(rig.machine.state(), State::Precharge);
        rig.machine.set_pack_voltage(3000 * 36 - 1);
        rig.machine.handle_cell_voltage(3500, 3600);
        assert!(rig.machine.faults().contains(FaultFlags::UNDERVOLTAGE));
        rig.machine.set_pack_voltage(3500 * 36);
        assert!(rig.machine.faults().is_empty());
    }

    #[test]
    fn recovering_conditions_leave_latched_faults() {
        let outputs = Outputs {
            stuck: Some(Contactor::Precharge),
            ..Default::default()
        };
        let mut rig = Rig {
            machine: StateMachine::new(Config::default(), outputs, NoDelay),
            bus: Bus::default(),
            now_us: 0,
        };
        rig.advance(0);
        assert_eq!(rig.machine.faults(), FaultFlags::CONTACTOR);

        rig.machine.handle_cell_temperature(20, 70);
        rig.machine.handle_cell_temperature(20, 40);
        rig.receive(&rx::Heartbeat);
        rig.advance(5);
        assert_eq!(rig.machine.faults(), FaultFlags::CONTACTOR);
    }

    #[test]
    fn horn_suppresses_cell_checks_only() {
        let mut rig = fresh();
        rig.run();
        rig.receive(&rx::HmiStatus {
            buttons: rx::HmiStatus::HORN,
        });
        rig.advance(5);
        assert!(rig.machine.status().cell_checks_suppressed);
        rig.machine.handle_cell_voltage(1000, 5000);
        assert_eq!(rig.machine.state(), State::Run);
        rig.machine.set_pack_voltage(5000 * 36);
        assert_eq!(rig.machine.state(), State::Error);

        let mut rig = fresh();
        rig.receive(&rx::HmiStatus {
            buttons: rx::HmiStatus::HORN,
        });
        rig.receive(&rx::HmiStatus { buttons: 0 });
        rig.advance(5);
        rig.machine.handle_cell_voltage(1000, 4000);
        assert_eq!(rig.machine.state(), State::Error);
    }

    #[test]
    fn temperature_flags_follow_the_readings() {
        let mut rig = fresh();
        rig.machine.handle_cell_temperature(20, 66);
        assert_eq!(rig.machine.faults(), FaultFlags::OVER_TEMPERATURE);
        rig.machine.handle_cell_temperature(9, 40);
        assert_eq!(rig.machine.faults(), FaultFlags::UNDER_TEMPERATURE);
        rig.machine.handle_cell_temperature(10, 65);
        assert!(rig.machine.faults().is_empty());
        assert_eq!(rig.machine.state(), State::Idle);
    }

    #[test]
    fn stuck_contactor_raises_a_fault() {
        let outputs = Outputs {
            stuck: Some(Contactor::Precharge),
            ..Default::default()
        };
        let mut machine = StateMachine::new(Config::default(), outputs, NoDelay);
        assert_eq!(machine.faults(), FaultFlags::CONTACTOR);
        machine.force_transition(State::Precharge);
        assert_eq!(machine.state(), State::Precharge);
        assert_eq!(machine.faults(), FaultFlags::CONTACTOR);
    }

    #[test]
    fn telemetry_groups() {
        let mut rig = fresh();
        assert!(rig.bus.sent.is_empty());

        for _ in 0..40 {
            rig.advance(5);
        }
        assert_eq!(rig.bus.sent_codes(), [1, 2, 5]);
        rig.bus.sent.clear();

        rig.command(State::Error.code());
        for _ in 0..160 {
            rig.advance(5);
        }
        let codes = rig.bus.sent_codes();
        assert_eq!(codes.iter().filter(|code| **code == 0).count(), 1);
        assert_eq!(codes.iter().filter(|code| **code == 3).count(), 1);
        assert_eq!(codes.iter().filter(|code| **code == 1).count(), 4);
        assert_eq!(rig.machine.output().toggles, 4);

        let heartbeat = rig
            .bus
            .sent
            .iter()
            .find(|frame| frame.id == 0x600)
            .unwrap();
        assert_eq!(
            tx::Heartbeat::decode(&heartbeat.payload).unwrap().state,
            State::Error.code()
        );
    }

    #[test]
    fn clock_survives_counter_wrap() {
        let mut rig = fresh();
        rig.now_us = u32::MAX - 1_500;
        rig.machine.tick(rig.now_us, &mut rig.bus);
        let before = rig.machine.now();
        rig.advance(3);
        assert_eq!(rig.machine.now() - before, 3);
        // sub-millisecond steps accumulate
        for _ in 0..4 {
            rig.now_us = rig.now_us.wrapping_add(250);
            rig.machine.tick(rig.now_us, &mut rig.bus);
        }
        assert_eq!(rig.machine.now() - before, 4);
    }

    #[test]
    fn frames_outside_the_catalog_are_ignored() {
        let mut rig = fresh();
        rig.machine.handle_frame(0x1FF, &[2]);
        rig.machine.handle_frame(0x222, &[2]);
        rig.machine.handle_frame(0x221, &[2, 0]);
        assert_eq!(rig.machine.state(), State::Idle);
        rig.machine.handle_frame(0x221, &[2]);
        assert_eq!(rig.machine.state(), State::Precharge);
    }
}
