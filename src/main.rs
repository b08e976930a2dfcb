use anyhow::{Context, Result};
use battery_controller_lib::can::FrameBus;
use battery_controller_lib::protocol::rx;
use battery_controller_lib::{pec, soc};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod config_file;
mod monitor;
mod simulate;

use commandline::{CliArgs, CliCommands, SendCommands};

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .with_context(|| "Cannot init logging")?
        .start()
        .with_context(|| "Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let config = config_file::load(&args.config)?;

    match args.command {
        CliCommands::Decode { id, data, json } => {
            match monitor::decode(id, &data.0, &config)
                .with_context(|| format!("Cannot decode frame {id:03X} {:02X?}", data.0))?
            {
                Some(frame) if json => println!(
                    "{}",
                    serde_json::to_string(&frame).with_context(|| "Cannot serialize frame")?
                ),
                Some(frame) => println!("{frame:?}"),
                None => println!("Frame {id:03X} is not part of the catalog"),
            }
        }
        CliCommands::Pec { data } => {
            let code = pec::pec15(&data.0);
            println!("PEC: {code:#06X} (wire bytes {:02X?})", pec::pec15_bytes(&data.0));
        }
        CliCommands::Soc {
            pack_mv,
            current_ma,
        } => {
            let voltage = soc::compensated_voltage(pack_mv, current_ma, &config);
            println!("Compensated cell voltage: {voltage:.3} V");
            println!("Charge state: {:?}", soc::charge_state(voltage, &config));
        }
        CliCommands::Simulate {
            duration,
            tick,
            seed,
            over_voltage_at,
            format,
        } => simulate::run(
            config,
            simulate::Script {
                duration,
                tick,
                seed,
                over_voltage_at,
                format,
            },
        )?,
        CliCommands::Monitor { adapter, format } => {
            let bus = monitor::open_adapter(&adapter.device, adapter.bitrate, config.can_tx_base)?;
            monitor::run(bus, &config, format)?
        }
        CliCommands::Send { adapter, command } => {
            // inbound commands travel on the controller's receive base
            let mut bus =
                monitor::open_adapter(&adapter.device, adapter.bitrate, config.can_rx_base)?;
            match command {
                SendCommands::State { code } => bus
                    .send(&rx::StateChange { new_state: code })
                    .with_context(|| format!("Cannot send state change {code:#04X}"))?,
                SendCommands::Heartbeat => bus
                    .send(&rx::Heartbeat)
                    .with_context(|| "Cannot send heartbeat")?,
                SendCommands::Hmi { buttons } => bus
                    .send(&rx::HmiStatus { buttons })
                    .with_context(|| "Cannot send HMI status")?,
            }
            info!("Sent {command:?}");
        }
    }

    Ok(())
}
