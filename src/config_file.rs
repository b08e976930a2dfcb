use anyhow::{Context, Result};
use battery_controller_lib::config::Config;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "battery-controller.yaml";

/// Reads the controller configuration; a missing file yields the defaults.
pub fn load(path: &Path) -> Result<Config> {
    if !path.exists() {
        log::debug!("No config file at {path:?}, using defaults");
        return Ok(Config::default());
    }
    log::debug!("Loading config file from {path:?}");
    let config_file = std::fs::File::open(path)
        .with_context(|| format!("Cannot open config file {path:?}"))?;
    let config: Config = serde_yaml::from_reader(&config_file)
        .with_context(|| format!("Cannot read config from file: {path:?}"))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cells_in_series: 24").unwrap();
        writeln!(file, "can_tx_base: 0x700").unwrap();
        writeln!(file, "precharge_complete_fraction: 0.9").unwrap();

        let config = load(file.path()).unwrap();
        assert_eq!(config.cells_in_series, 24);
        assert_eq!(config.can_tx_base, 0x700);
        assert_eq!(config.precharge_complete_fraction, 0.9);
        assert_eq!(config.can_rx_base, Config::default().can_rx_base);
        assert_eq!(config.heartbeat_timeout, Config::default().heartbeat_timeout);
    }

    #[test]
    fn malformed_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cells_in_series: many").unwrap();

        let error = load(file.path()).unwrap_err();
        assert!(error.to_string().starts_with("Cannot read config"));
    }
}
