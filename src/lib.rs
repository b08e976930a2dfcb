#![cfg_attr(docsrs, feature(doc_cfg))]
//! # battery_controller_lib
//!
//! Control core of an electric vehicle battery controller: the safety state
//! machine deciding whether the pack may charge, discharge or must be isolated,
//! the driver for the daisy chain of cell monitor ICs, and the fixed message
//! catalog spoken on the vehicle bus.
//!
//! Hardware is reached through the `embedded-hal` 1.0 and `embedded-can` 0.4
//! traits, so the same code runs on a microcontroller, against an SLCAN adapter
//! on a host, or against the simulated hardware in [`sim`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `battery-controller` command-line tool and pulls in `serialport`, `serde` and `sim`.
//!
//! ### Transport Features
//! - `serialport`: Enables the SLCAN adapter transport using the `serialport` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for the configuration and the wire messages.
//! - `sim`: Enables the simulated cell monitor chain, contactors, analog inputs and bus.
//! - `bin-dependencies`: Enables all features required by the `battery-controller` binary executable.

/// Contains error types for the library.
mod error;
/// Vehicle bus message catalog.
pub mod protocol;

/// CRC15 packet error code of the cell monitor chain.
pub mod pec;
pub mod thermistor;

pub mod config;
pub mod soc;
pub mod state;

pub mod can;
pub mod cmu;
pub mod output;

pub mod controller;
pub mod state_machine;

pub use error::Error;

/// SLCAN adapter transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod slcan;

/// Simulated hardware.
#[cfg_attr(docsrs, doc(cfg(feature = "sim")))]
#[cfg(feature = "sim")]
pub mod sim;
