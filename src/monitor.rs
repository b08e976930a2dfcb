use anyhow::{Context, Result};
use battery_controller_lib::can::{CanInterface, FrameBus, RawFrame};
use battery_controller_lib::config::Config;
use battery_controller_lib::protocol::{Inbound, Outbound};
use battery_controller_lib::slcan::{SlcanPort, StdDelay};
use battery_controller_lib::Error;
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

use crate::commandline::OutputFormat;

/// Pause while the adapter has nothing to deliver.
const IDLE_POLL: Duration = Duration::from_millis(1);

/// A catalog frame with the side of the bus it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "direction", content = "message", rename_all = "lowercase")]
pub enum Decoded {
    /// Sent to the controller.
    Inbound(Inbound),
    /// Sent by the controller.
    Outbound(Outbound),
}

/// Decodes a frame seen on the bus; the closest base at or below `id` decides
/// the direction.
pub fn decode(id: u32, data: &[u8], config: &Config) -> Result<Option<Decoded>, Error> {
    let (tx_base, rx_base) = (config.can_tx_base, config.can_rx_base);
    let outbound = id >= tx_base && (tx_base >= rx_base || id < rx_base);
    if outbound {
        Ok(Outbound::parse(id, tx_base, data)?.map(Decoded::Outbound))
    } else {
        Ok(Inbound::parse(id, rx_base, data)?.map(Decoded::Inbound))
    }
}

pub fn print_frame(
    format: OutputFormat,
    timestamp: DateTime<Local>,
    id: u32,
    frame: &Decoded,
) -> Result<()> {
    match format {
        OutputFormat::Console => println!("{} {id:03X} {frame:?}", timestamp.to_rfc3339()),
        OutputFormat::Json => {
            let mut object = serde_json::Map::new();
            object.insert("timestamp".to_string(), json!(timestamp.to_rfc3339()));
            object.insert("id".to_string(), json!(id));
            object.insert(
                "frame".to_string(),
                serde_json::to_value(frame)
                    .with_context(|| format!("Cannot serialize frame {id:03X}"))?,
            );
            println!("{}", serde_json::Value::Object(object));
        }
    }
    Ok(())
}

/// Decodes and prints one received frame; frames outside the catalog are
/// only logged.
pub fn report(format: OutputFormat, timestamp: DateTime<Local>, frame: &RawFrame, config: &Config) {
    match decode(frame.id, &frame.payload, config) {
        Ok(Some(decoded)) => {
            if let Err(e) = print_frame(format, timestamp, frame.id, &decoded) {
                error!("{e:#}");
            }
        }
        Ok(None) => debug!("Frame {:03X} {:02X?} is not part of the catalog", frame.id, &frame.payload[..]),
        Err(e) => warn!("Cannot decode frame {:03X}: {e}", frame.id),
    }
}

pub fn open_adapter(device: &str, bitrate: u32, tx_base: u32) -> Result<CanInterface<SlcanPort, StdDelay>> {
    let port = SlcanPort::open(device, bitrate)
        .with_context(|| format!("Cannot open SLCAN adapter '{device}' at {bitrate} bit/s"))?;
    Ok(CanInterface::new(port, StdDelay, tx_base))
}

pub fn run(mut bus: CanInterface<SlcanPort, StdDelay>, config: &Config, format: OutputFormat) -> Result<()> {
    info!(
        "Monitoring vehicle bus: format={format:?}, inbound base={:#X}, outbound base={:#X}",
        config.can_rx_base, config.can_tx_base
    );
    loop {
        match bus.poll() {
            Some(frame) => report(format, Local::now(), &frame, config),
            None => std::thread::sleep(IDLE_POLL),
        }
    }
}
