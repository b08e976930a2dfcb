use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

/// Bytes given as hex, e.g. "0004", "00 04" or "0x00,0x04".
#[derive(Debug, Clone, PartialEq)]
pub struct HexBytes(pub Vec<u8>);

pub fn parse_hex_bytes(s: &str) -> Result<HexBytes, String> {
    let digits: String = s
        .split([' ', ',', ':'])
        .map(|part| part.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in '{s}'"));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            digits
                .get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex byte at position {i} in '{s}'"))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(HexBytes)
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    /// One human readable line per frame
    Console,
    /// One JSON object per frame
    Json,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct AdapterArgs {
    /// Serial port of the SLCAN adapter (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// CAN bit rate
    #[arg(long, default_value_t = 500_000)]
    pub bitrate: u32,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum SendCommands {
    /// Request a state change (0 idle, 2 run, 5 error, 0xFF unlock)
    State {
        #[arg(value_parser = maybe_hex::<u8>)]
        code: u8,
    },
    /// Send one supervisory heartbeat
    Heartbeat,
    /// Send the driver interface button state
    Hmi {
        #[arg(value_parser = maybe_hex::<u8>)]
        buttons: u8,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Decode one vehicle bus frame; the direction follows from the address bases
    Decode {
        /// Frame identifier (e.g., 0x621 or 1569)
        #[arg(value_parser = maybe_hex::<u32>)]
        id: u32,
        /// Payload in hex (e.g., "02" or "72 6C 6F 53")
        #[arg(value_parser = parse_hex_bytes)]
        data: HexBytes,
        /// Print the decoded frame as JSON
        #[clap(long, action)]
        json: bool,
    },
    /// Print the CRC15 packet error code of a byte string
    Pec {
        /// Bytes in hex (e.g., "0004" for the read cell group A command)
        #[arg(value_parser = parse_hex_bytes)]
        data: HexBytes,
    },
    /// Estimate the state of charge from pack voltage and current
    Soc {
        /// Pack voltage in mV
        #[arg(long)]
        pack_mv: i32,
        /// Pack current in mA, positive while charging
        #[arg(long, allow_hyphen_values = true, default_value_t = 0)]
        current_ma: i32,
    },
    /// Run the controller against simulated hardware and print every frame it sends
    Simulate {
        /// Simulated time to run (e.g., "10s", "1m")
        #[arg(value_parser = humantime::parse_duration, long, default_value = "10s")]
        duration: Duration,
        /// Pause at the end of every controller cycle
        #[arg(value_parser = humantime::parse_duration, long, default_value = "5ms")]
        tick: Duration,
        /// Seed of the measurement noise
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Raise one cell above the lockout voltage at this point of the run
        #[arg(value_parser = humantime::parse_duration, long)]
        over_voltage_at: Option<Duration>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,
    },
    /// Decode the vehicle bus through an SLCAN adapter
    Monitor {
        #[command(flatten)]
        adapter: AdapterArgs,
        #[arg(long, value_enum, default_value_t = OutputFormat::Console)]
        format: OutputFormat,
    },
    /// Send a command to the controller through an SLCAN adapter
    Send {
        #[command(flatten)]
        adapter: AdapterArgs,
        #[command(subcommand)]
        command: SendCommands,
    },
}

const fn about_text() -> &'static str {
    "battery controller command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Controller configuration; defaults are used when the file does not exist
    #[arg(short, long, default_value = crate::config_file::DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: CliCommands,
}
