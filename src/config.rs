//! Tunables of the battery controller.
//!
//! Voltages are in mV, currents in mA (positive = charging), temperatures in
//! 1/10 degC and times in ms. The defaults are the values the pack was
//! commissioned with.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Cells measured by one cell-monitor IC.
pub const CELLS_PER_IC: usize = 12;

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub cells_in_series: u16,

    pub max_charge_current: i32,
    /// Negative: discharge current limit.
    pub max_discharge_current: i32,

    /// Cell voltage at which the contactors open.
    pub over_cell_voltage: i32,
    /// Cell voltage at which charging stops.
    pub max_cell_voltage: i32,
    /// Cell voltage above which the balance switch is closed.
    pub cell_balance_voltage: i32,
    /// Cell voltage at which charging resumes.
    pub charge_cutin_cell_voltage: i32,
    /// Cell voltage below which the under-voltage warning is asserted.
    pub min_cell_voltage: i32,
    /// Cell voltage at which the contactors open.
    pub under_cell_voltage: i32,

    pub max_cell_temperature: i32,
    pub min_cell_temperature: i32,

    /// Fraction of the pack voltage the car rail must reach to finish precharge.
    pub precharge_complete_fraction: f32,
    pub precharge_min_time: u32,
    pub precharge_timeout: u32,
    /// Wait between closing the ground and the precharge contactor.
    pub ground_settle_delay: u32,
    /// Wait between opening the charge contactor and the others on shutdown.
    pub charge_contactor_delay: u32,

    pub heartbeat_timeout: u32,
    pub fast_telemetry_period: u32,
    pub slow_telemetry_period: u32,

    pub can_tx_base: u32,
    pub can_rx_base: u32,

    /// Window of the running pack voltage average.
    pub pack_voltage_average_n: u16,
    /// Every nth acquisition pass also balances, reads temperatures and
    /// broadcasts the cell readings.
    pub slow_acquisition_divider: u16,

    /// Capacity of one cell in mAh.
    pub cell_capacity: u16,
    pub parallel_groups: u16,

    /// mA per ADC count.
    pub pack_current_scaling: f32,
    /// ADC counts at 0 A.
    pub pack_current_offset: i32,
    /// mV per ADC count.
    pub pack_voltage_scaling: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cells_in_series: 36,
            max_charge_current: 50_000,
            max_discharge_current: -50_000,
            over_cell_voltage: 4400,
            max_cell_voltage: 4250,
            cell_balance_voltage: 4230,
            charge_cutin_cell_voltage: 4200,
            min_cell_voltage: 3000,
            under_cell_voltage: 2700,
            max_cell_temperature: 650,
            min_cell_temperature: 100,
            precharge_complete_fraction: 0.95,
            precharge_min_time: 500,
            precharge_timeout: 1000,
            ground_settle_delay: 500,
            charge_contactor_delay: 50,
            heartbeat_timeout: 10_000_000,
            fast_telemetry_period: 200,
            slow_telemetry_period: 1000,
            can_tx_base: 0x600,
            can_rx_base: 0x200,
            pack_voltage_average_n: 10,
            slow_acquisition_divider: 200,
            cell_capacity: 3200,
            parallel_groups: 11,
            pack_current_scaling: 3.263,
            pack_current_offset: 0,
            pack_voltage_scaling: 2.0 * 6.28,
        }
    }
}

impl Config {
    fn pack(&self, cell: i32) -> i32 {
        cell * i32::from(self.cells_in_series)
    }

    /// Pack voltage at which the contactors open.
    pub fn over_pack_voltage(&self) -> i32 {
        self.pack(self.over_cell_voltage)
    }

    /// Pack voltage at which charging stops.
    pub fn max_pack_voltage(&self) -> i32 {
        self.pack(self.max_cell_voltage)
    }

    pub fn charge_cutin_pack_voltage(&self) -> i32 {
        self.pack(self.charge_cutin_cell_voltage)
    }

    pub fn min_pack_voltage(&self) -> i32 {
        self.pack(self.min_cell_voltage)
    }

    pub fn under_pack_voltage(&self) -> i32 {
        self.pack(self.under_cell_voltage)
    }

    /// Pack capacity in Ah.
    pub fn pack_capacity_ah(&self) -> f32 {
        f32::from(self.parallel_groups) * self.cell_capacity_ah()
    }

    pub fn cell_capacity_ah(&self) -> f32 {
        f32::from(self.cell_capacity) / 1000.0
    }

    /// Converts a raw shunt ADC reading to mA.
    pub fn scale_current(&self, raw: i32) -> i32 {
        ((self.pack_current_offset - raw) as f32 * self.pack_current_scaling) as i32
    }

    /// Converts a raw rail voltage ADC reading to mV.
    pub fn scale_voltage(&self, raw: i32) -> i32 {
        (raw as f32 * self.pack_voltage_scaling) as i32
    }

    /// Pack voltage thresholds for the configured series count.
    pub fn pack_limits(&self) -> VoltageLimits {
        VoltageLimits {
            over: self.over_pack_voltage(),
            max: self.max_pack_voltage(),
            cutin: self.charge_cutin_pack_voltage(),
            min: self.min_pack_voltage(),
            under: self.under_pack_voltage(),
        }
    }

    /// Single cell voltage thresholds.
    pub fn cell_limits(&self) -> VoltageLimits {
        VoltageLimits {
            over: self.over_cell_voltage,
            max: self.max_cell_voltage,
            cutin: self.charge_cutin_cell_voltage,
            min: self.min_cell_voltage,
            under: self.under_cell_voltage,
        }
    }
}

/// One set of thresholds, either for the pack or for a single cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoltageLimits {
    pub over: i32,
    pub max: i32,
    pub cutin: i32,
    pub min: i32,
    pub under: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_limits_scale_with_series_count() {
        let config = Config::default();
        let pack = config.pack_limits();
        assert_eq!(pack.over, 4400 * 36);
        assert_eq!(pack.max, 4250 * 36);
        assert_eq!(pack.cutin, 4200 * 36);
        assert_eq!(pack.min, 3000 * 36);
        assert_eq!(pack.under, 2700 * 36);
    }

    #[test]
    fn adc_scaling() {
        let config = Config {
            pack_current_offset: 10,
            ..Config::default()
        };
        // Shunt reads below the offset while charging.
        assert_eq!(config.scale_current(0), 32);
        assert_eq!(config.scale_current(10), 0);
        assert_eq!(config.scale_voltage(1000), 12560);
    }

    #[test]
    fn pack_capacity() {
        let config = Config::default();
        assert!((config.pack_capacity_ah() - 35.2).abs() < 1e-4);
    }
}
