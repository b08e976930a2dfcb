use anyhow::{Context, Result};
use battery_controller_lib::config::Config;
use battery_controller_lib::protocol::rx;
use battery_controller_lib::sim::Simulation;
use battery_controller_lib::state::State;
use chrono::Local;
use log::info;
use std::time::Duration;

use crate::commandline::OutputFormat;
use crate::monitor;

/// Cell monitor ICs of the simulated pack.
const ICS: usize = 3;
const HEARTBEAT_PERIOD_MS: u64 = 1000;
/// Voltage the faulty cell jumps to, mV.
const FAULTY_CELL_VOLTAGE: f32 = 4450.0;

pub struct Script {
    pub duration: Duration,
    pub tick: Duration,
    pub seed: u64,
    pub over_voltage_at: Option<Duration>,
    pub format: OutputFormat,
}

/// Brings the simulated pack up to run, keeps the heartbeat going and prints
/// every frame the controller sends, stamped with virtual time.
pub fn run(config: Config, script: Script) -> Result<()> {
    info!(
        "Simulating {} of a {ICS} IC pack: tick={:?}, seed={}",
        humantime::format_duration(script.duration),
        script.tick,
        script.seed
    );
    let mut sim = Simulation::<ICS>::new(config.clone(), script.seed)
        .with_context(|| "Cannot set up the simulated pack")?;
    sim.controller
        .set_loop_delay(u32::try_from(script.tick.as_millis()).unwrap_or(u32::MAX));
    sim.pack.borrow_mut().noise = 1.0;

    sim.send(&rx::Heartbeat)
        .with_context(|| "Cannot queue the heartbeat")?;
    sim.send(&rx::StateChange {
        new_state: State::Run.code(),
    })
    .with_context(|| "Cannot queue the run command")?;

    let start = Local::now();
    let end_ms = u64::try_from(script.duration.as_millis()).unwrap_or(u64::MAX);
    let mut fault_ms = script
        .over_voltage_at
        .map(|at| u64::try_from(at.as_millis()).unwrap_or(u64::MAX));
    let mut next_heartbeat = HEARTBEAT_PERIOD_MS;

    while sim.clock.now_ms() < end_ms {
        sim.controller
            .run_cycle()
            .with_context(|| format!("Controller cycle failed at {} ms", sim.clock.now_ms()))?;

        let now_ms = sim.clock.now_ms();
        let timestamp = start + chrono::Duration::milliseconds(now_ms as i64);
        for frame in sim.sent_frames() {
            monitor::report(script.format, timestamp, &frame, &config);
        }

        if now_ms >= next_heartbeat {
            sim.send(&rx::Heartbeat)
                .with_context(|| "Cannot queue the heartbeat")?;
            next_heartbeat += HEARTBEAT_PERIOD_MS;
        }
        if fault_ms.is_some_and(|at| now_ms >= at) {
            info!("Raising cell 0 to {FAULTY_CELL_VOLTAGE} mV");
            sim.pack.borrow_mut().cells[0] = FAULTY_CELL_VOLTAGE;
            fault_ms = None;
        }
    }

    let status = sim.controller.machine().status();
    match script.format {
        OutputFormat::Console => println!("Final status: {status:?}"),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&status).with_context(|| "Cannot serialize the final status")?
        ),
    }
    Ok(())
}
