//! State of charge estimate from the open circuit cell voltage.

use crate::config::Config;
use crate::protocol::tx::ChargeState;

/// Internal resistance of one parallel group in ohms.
pub const CELL_RESISTANCE: f32 = 0.06;

/// Open circuit cell voltage of a full pack.
pub const FULL_VOLTAGE: f32 = 4.2;

/// One linear piece of the discharge curve, valid above `above` volts.
///
/// Inside a piece the used capacity of one cell is
/// `(voltage - intercept) / slope` Ah below the rated capacity.
struct Segment {
    above: f32,
    intercept: f32,
    slope: f32,
}

#[rustfmt::skip]
const DISCHARGE_CURVE: [Segment; 8] = [
    Segment { above: 4.17,  intercept: 4.2303, slope: 0.437 },
    Segment { above: 4.14,  intercept: 4.197,  slope: 0.206 },
    Segment { above: 4.12,  intercept: 4.183,  slope: 0.149 },
    Segment { above: 4.09,  intercept: 4.216,  slope: 0.229 },
    Segment { above: 3.5,   intercept: 4.215,  slope: 0.262 },
    Segment { above: 3.485, intercept: 4.021,  slope: 0.195 },
    Segment { above: 3.32,  intercept: 5.28,   slope: 0.653 },
    Segment { above: 3.0,   intercept: 6.516,  slope: 1.065 },
];

/// Cell voltage corrected for the drop across the internal resistance.
pub fn compensated_voltage(pack_voltage: i32, pack_current: i32, config: &Config) -> f32 {
    let cell_voltage = pack_voltage as f32 / (f32::from(config.cells_in_series) * 1000.0);
    let group_current = pack_current as f32 / (f32::from(config.parallel_groups) * 1000.0);
    cell_voltage - group_current * CELL_RESISTANCE
}

/// Maps a compensated cell voltage onto the discharge curve.
pub fn charge_state(voltage: f32, config: &Config) -> ChargeState {
    let pack_capacity = config.pack_capacity_ah();
    if voltage >= FULL_VOLTAGE {
        return ChargeState {
            percentage: 100.0,
            amp_hours: pack_capacity,
        };
    }

    let Some(segment) = DISCHARGE_CURVE.iter().find(|s| voltage > s.above) else {
        return ChargeState {
            percentage: 0.0,
            amp_hours: 0.0,
        };
    };

    let cell_ah = config.cell_capacity_ah() + (voltage - segment.intercept) / segment.slope;
    let amp_hours = (f32::from(config.parallel_groups) * cell_ah).clamp(0.0, pack_capacity);
    ChargeState {
        percentage: (100.0 * amp_hours / pack_capacity).clamp(0.0, 100.0),
        amp_hours,
    }
}

/// Estimate sent with the fast telemetry group.
pub fn estimate(pack_voltage: i32, pack_current: i32, config: &Config) -> ChargeState {
    charge_state(
        compensated_voltage(pack_voltage, pack_current, config),
        config,
    )
}
