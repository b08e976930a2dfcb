//! Contactor, fan and indicator outputs.

use crate::Error;
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin, PinState};
use embedded_hal::pwm::SetDutyCycle;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Time a contactor has to confirm a switch.
pub const SWITCH_TIMEOUT_MS: u32 = 30;
/// Feedback poll interval while waiting for a switch.
pub const SWITCH_POLL_MS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Contactor {
    Ground = 0,
    Positive = 1,
    Precharge = 2,
    Charge = 3,
}

impl Contactor {
    pub const ALL: [Contactor; 4] = [
        Contactor::Ground,
        Contactor::Positive,
        Contactor::Precharge,
        Contactor::Charge,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Fan {
    One = 0,
    Two = 1,
}

/// Everything the state machine switches.
pub trait OutputInterface {
    /// Switches a contactor and waits for its confirmation.
    ///
    /// Returns `true` if the contactor confirmed the switch in time, or if it
    /// has no feedback contact.
    fn set_contactor(&mut self, contactor: Contactor, closed: bool) -> bool;

    /// Opens the charge contactor, waits for the charger to back off and then
    /// opens everything else. Returns `true` if every contactor confirmed.
    fn shutdown(&mut self) -> bool;

    /// 0 stops the fan, 255 is full speed.
    fn set_fan_speed(&mut self, fan: Fan, speed: u8);

    /// Blinks the fault indicators.
    fn toggle_indicators(&mut self);

    fn clear_indicators(&mut self);
}

/// Drive coil, auxiliary contact and indicator of one contactor.
pub struct ContactorChannel<P, F> {
    drive: P,
    /// Reads high while the contactor is open.
    feedback: Option<F>,
    indicator: Option<P>,
    indicator_lit: bool,
}

impl<P: OutputPin, F: InputPin> ContactorChannel<P, F> {
    pub fn new(drive: P) -> Self {
        Self {
            drive,
            feedback: None,
            indicator: None,
            indicator_lit: false,
        }
    }

    pub fn with_feedback(mut self, feedback: F) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn with_indicator(mut self, indicator: P) -> Self {
        self.indicator = Some(indicator);
        self
    }

    /// Drives the coil without waiting for the contact.
    fn set_state(&mut self, closed: bool) -> Result<(), Error> {
        self.drive
            .set_state(PinState::from(closed))
            .map_err(Error::pin)?;
        self.set_indicator(closed)
    }

    fn set_indicator(&mut self, lit: bool) -> Result<(), Error> {
        if let Some(indicator) = &mut self.indicator {
            indicator
                .set_state(PinState::from(lit))
                .map_err(Error::pin)?;
        }
        self.indicator_lit = lit;
        Ok(())
    }

    /// Polls the auxiliary contact until it reports `closed`.
    fn wait_switch(&mut self, closed: bool, delay: &mut impl DelayNs) -> Result<bool, Error> {
        let Some(feedback) = &mut self.feedback else {
            log::trace!("No feedback, assuming successful switch");
            return Ok(true);
        };
        // the last read lands on the timeout itself
        let polls = SWITCH_TIMEOUT_MS / SWITCH_POLL_MS;
        for poll in 0..=polls {
            if feedback.is_high().map_err(Error::pin)? != closed {
                return Ok(true);
            }
            if poll < polls {
                delay.delay_ms(SWITCH_POLL_MS);
            }
        }
        Ok(false)
    }
}

/// The four contactors of the pack plus the cooling fans.
pub struct ContactorBank<P, F, PWM, D> {
    contactors: [ContactorChannel<P, F>; 4],
    fans: [Option<PWM>; 2],
    delay: D,
    /// Wait between opening the charge contactor and the others.
    charge_settle_ms: u32,
}

impl<P, F, PWM, D> ContactorBank<P, F, PWM, D>
where
    P: OutputPin,
    F: InputPin,
    PWM: SetDutyCycle,
    D: DelayNs,
{
    pub fn new(
        ground: ContactorChannel<P, F>,
        positive: ContactorChannel<P, F>,
        precharge: ContactorChannel<P, F>,
        charge: ContactorChannel<P, F>,
        delay: D,
        charge_settle_ms: u32,
    ) -> Self {
        Self {
            contactors: [ground, positive, precharge, charge],
            fans: [None, None],
            delay,
            charge_settle_ms,
        }
    }

    pub fn with_fan(mut self, fan: Fan, pwm: PWM) -> Self {
        self.fans[fan as usize] = Some(pwm);
        self
    }

    fn channel(&mut self, contactor: Contactor) -> &mut ContactorChannel<P, F> {
        &mut self.contactors[contactor as usize]
    }

    fn switch(&mut self, contactor: Contactor, closed: bool) -> Result<bool, Error> {
        self.channel(contactor).set_state(closed)?;
        let channel = &mut self.contactors[contactor as usize];
        channel.wait_switch(closed, &mut self.delay)
    }

    fn open_all(&mut self) -> Result<bool, Error> {
        let charge_open = self.switch(Contactor::Charge, false)?;
        self.delay.delay_ms(self.charge_settle_ms);

        let rest = [Contactor::Positive, Contactor::Precharge, Contactor::Ground];
        for contactor in rest {
            self.channel(contactor).set_state(false)?;
        }
        let mut confirmed = charge_open;
        for contactor in rest {
            let channel = &mut self.contactors[contactor as usize];
            if !channel.wait_switch(false, &mut self.delay)? {
                log::error!("{contactor:?} contactor did not open");
                confirmed = false;
            }
        }
        Ok(confirmed)
    }
}

impl<P, F, PWM, D> OutputInterface for ContactorBank<P, F, PWM, D>
where
    P: OutputPin,
    F: InputPin,
    PWM: SetDutyCycle,
    D: DelayNs,
{
    fn set_contactor(&mut self, contactor: Contactor, closed: bool) -> bool {
        log::debug!(
            "{} {contactor:?} contactor",
            if closed { "Closing" } else { "Opening" }
        );
        match self.switch(contactor, closed) {
            Ok(true) => true,
            Ok(false) => {
                log::error!("{contactor:?} contactor switch not confirmed");
                false
            }
            Err(error) => {
                log::error!("{contactor:?} contactor: {error}");
                false
            }
        }
    }

    fn shutdown(&mut self) -> bool {
        log::debug!("Shutdown");
        self.open_all().unwrap_or_else(|error| {
            log::error!("Shutdown failed: {error}");
            false
        })
    }

    fn set_fan_speed(&mut self, fan: Fan, speed: u8) {
        let Some(pwm) = &mut self.fans[fan as usize] else {
            log::debug!("Fan {fan:?} not fitted");
            return;
        };
        if let Err(error) = pwm.set_duty_cycle_fraction(u16::from(speed), 255) {
            log::warn!("Cannot set fan {fan:?} speed: {error:?}");
        }
    }

    fn toggle_indicators(&mut self) {
        for channel in &mut self.contactors {
            let lit = !channel.indicator_lit;
            if let Err(error) = channel.set_indicator(lit) {
                log::warn!("Cannot toggle indicator: {error}");
            }
        }
    }

    fn clear_indicators(&mut self) {
        for channel in &mut self.contactors {
            if let Err(error) = channel.set_indicator(false) {
                log::warn!("Cannot clear indicator: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::convert::Infallible;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Pin(Rc<Cell<bool>>);

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.set(true);
            Ok(())
        }
    }

    /// Auxiliary contact following a drive pin, or stuck closed.
    struct Feedback {
        drive: Rc<Cell<bool>>,
        stuck_closed: bool,
    }

    impl embedded_hal::digital::ErrorType for Feedback {
        type Error = Infallible;
    }

    impl InputPin for Feedback {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(!(self.stuck_closed || self.drive.get()))
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            self.is_high().map(|high| !high)
        }
    }

    /// Auxiliary contact that reports closed only from its `settles_on`th read.
    struct SlowContact {
        reads: u32,
        settles_on: u32,
    }

    impl embedded_hal::digital::ErrorType for SlowContact {
        type Error = Infallible;
    }

    impl InputPin for SlowContact {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            self.reads += 1;
            Ok(self.reads < self.settles_on)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            self.is_high().map(|high| !high)
        }
    }

    struct Pwm(Rc<Cell<u16>>);

    impl embedded_hal::pwm::ErrorType for Pwm {
        type Error = Infallible;
    }

    impl SetDutyCycle for Pwm {
        fn max_duty_cycle(&self) -> u16 {
            1000
        }

        fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Infallible> {
            self.0.set(duty);
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct Delay(Rc<RefCell<u64>>);

    impl DelayNs for Delay {
        fn delay_ns(&mut self, ns: u32) {
            *self.0.borrow_mut() += u64::from(ns);
        }
    }

    struct Bench {
        drives: [Pin; 4],
        indicators: [Pin; 4],
        waited: Delay,
    }

    fn rig(stuck: Option<Contactor>) -> (ContactorBank<Pin, Feedback, Pwm, Delay>, Bench) {
        let drives: [Pin; 4] = Default::default();
        let indicators: [Pin; 4] = Default::default();
        let waited = Delay::default();
        let channel = |i: usize| {
            let mut channel = ContactorChannel::new(drives[i].clone())
                .with_indicator(indicators[i].clone());
            // charge contactor has no auxiliary contact
            if i != Contactor::Charge as usize {
                channel = channel.with_feedback(Feedback {
                    drive: drives[i].0.clone(),
                    stuck_closed: stuck.map(|c| c as usize) == Some(i),
                });
            }
            channel
        };
        let bank = ContactorBank::new(
            channel(0),
            channel(1),
            channel(2),
            channel(3),
            waited.clone(),
            50,
        );
        (
            bank,
            Bench {
                drives,
                indicators,
                waited,
            },
        )
    }

    #[test]
    fn switch_is_confirmed_by_feedback() {
        let (mut bank, bench) = rig(None);
        assert!(bank.set_contactor(Contactor::Ground, true));
        assert!(bench.drives[0].0.get());
        assert!(bench.indicators[0].0.get());
        assert_eq!(*bench.waited.0.borrow(), 0);
    }

    #[test]
    fn stuck_contactor_times_out() {
        let (mut bank, bench) = rig(Some(Contactor::Positive));
        assert!(!bank.set_contactor(Contactor::Positive, false));
        assert_eq!(*bench.waited.0.borrow(), 30_000_000);
    }

    #[test]
    fn contact_settling_at_the_timeout_is_confirmed() {
        let polls = SWITCH_TIMEOUT_MS / SWITCH_POLL_MS;
        let mut delay = Delay::default();
        let mut channel = ContactorChannel::new(Pin::default()).with_feedback(SlowContact {
            reads: 0,
            settles_on: polls + 1,
        });
        assert!(channel.set_state(true).is_ok());
        assert!(channel.wait_switch(true, &mut delay).unwrap());
        assert_eq!(*delay.0.borrow(), 30_000_000);

        let mut channel = ContactorChannel::new(Pin::default()).with_feedback(SlowContact {
            reads: 0,
            settles_on: polls + 2,
        });
        assert!(!channel.wait_switch(true, &mut delay).unwrap());
    }

    #[test]
    fn shutdown_opens_charge_first_and_confirms_the_rest() {
        let (mut bank, bench) = rig(None);
        for contactor in Contactor::ALL {
            assert!(bank.set_contactor(contactor, true));
        }
        assert!(bank.shutdown());
        assert!(bench.drives.iter().all(|pin| !pin.0.get()));
        assert_eq!(*bench.waited.0.borrow(), 50_000_000);

        let (mut bank, _) = rig(Some(Contactor::Ground));
        assert!(!bank.shutdown());
    }

    #[test]
    fn indicators() {
        let (mut bank, bench) = rig(None);
        bank.toggle_indicators();
        assert!(bench.indicators.iter().all(|pin| pin.0.get()));
        bank.toggle_indicators();
        assert!(bench.indicators.iter().all(|pin| !pin.0.get()));
        bank.toggle_indicators();
        bank.clear_indicators();
        assert!(bench.indicators.iter().all(|pin| !pin.0.get()));
    }

    #[test]
    fn fan_speed_is_a_fraction_of_full_scale() {
        let (bank, _) = rig(None);
        let duty = Rc::new(Cell::new(0));
        let mut bank = bank.with_fan(Fan::Two, Pwm(duty.clone()));
        bank.set_fan_speed(Fan::Two, 255);
        assert_eq!(duty.get(), 1000);
        bank.set_fan_speed(Fan::Two, 0);
        assert_eq!(duty.get(), 0);
        // not fitted
        bank.set_fan_speed(Fan::One, 128);
    }
}
