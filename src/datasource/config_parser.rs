use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;

use crate::{
    error::{GovernorError, GovernorResult},
    model::decision_engine::{Direction, Heuristic, HeuristicKind},
    utils::constants::{EVENT_COUNT, strategy, telemetry},
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub update_interval_floor_ns: u64,
    pub ring_buffer_capacity: usize,
    pub heuristic: HeuristicKind,
    pub heuristic_direction: Option<Direction>,
    pub heuristic_lo_threshold: u64,
    pub heuristic_hi_threshold: u64,
    pub event_names: [String; EVENT_COUNT],
    pub log_capacity_bytes: usize,
    pub export_dir: Option<PathBuf>,
    pub export_interval_ms: u64,
    pub export_rotate_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_interval_floor_ns: strategy::UPDATE_INTERVAL_FLOOR_NS,
            ring_buffer_capacity: telemetry::RING_BUFFER_CAPACITY,
            heuristic: HeuristicKind::StallRatio,
            heuristic_direction: None,
            heuristic_lo_threshold: strategy::HEURISTIC_LO_THRESHOLD,
            heuristic_hi_threshold: strategy::HEURISTIC_HI_THRESHOLD,
            event_names: strategy::DEFAULT_EVENT_NAMES.map(String::from),
            log_capacity_bytes: telemetry::LOG_CAPACITY_BYTES,
            export_dir: None,
            export_interval_ms: telemetry::EXPORT_INTERVAL_MS,
            export_rotate_bytes: telemetry::EXPORT_ROTATE_BYTES,
        }
    }
}

impl Config {
    pub fn validate(&self) -> GovernorResult<()> {
        let invalid = |msg: String| Err(GovernorError::InvalidConfig(msg));

        if self.heuristic_hi_threshold == 0 {
            return invalid("heuristic_hi_threshold must be greater than 0".into());
        }
        if self.heuristic_lo_threshold >= self.heuristic_hi_threshold {
            return invalid(format!(
                "heuristic_lo_threshold ({}) must be below heuristic_hi_threshold ({})",
                self.heuristic_lo_threshold, self.heuristic_hi_threshold
            ));
        }
        if self.ring_buffer_capacity == 0 {
            return invalid("ring_buffer_capacity must be greater than 0".into());
        }
        if let Some(index) = self.event_names.iter().position(|name| name.trim().is_empty()) {
            return invalid(format!("event_names[{index}] is empty"));
        }
        if self.export_interval_ms == 0 {
            return invalid("export_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// The configured heuristic with its direction override applied
    pub fn heuristic(&self) -> GovernorResult<Heuristic> {
        let heuristic = Heuristic::new(
            self.heuristic,
            self.heuristic_lo_threshold,
            self.heuristic_hi_threshold,
        )?;
        Ok(match self.heuristic_direction {
            Some(direction) => heuristic.with_direction(direction),
            None => heuristic,
        })
    }

    /// Minimum spacing between two decisions on a domain
    pub fn update_interval_ns(&self, transition_delay_ns: u64) -> u64 {
        transition_delay_ns.max(self.update_interval_floor_ns)
    }
}

pub fn config_parse(content: &str) -> GovernorResult<Config> {
    let config: Config =
        toml::from_str(content).map_err(|e| GovernorError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Loads the config file, falling back to defaults when it does not exist
pub fn config_read(config_file: &str) -> Result<Config> {
    if !std::path::Path::new(config_file).exists() {
        warn!("Config file not found: {config_file}, using defaults");
        return Ok(Config::default());
    }

    let content = fs::read_to_string(config_file)
        .with_context(|| format!("Failed to read config file: {config_file}"))?;
    let config = config_parse(&content)
        .with_context(|| format!("Failed to parse config file: {config_file}"))?;

    info!("Load config succeed");
    debug!("{config:?}");
    info!(
        "Heuristic: {:?}, thresholds: {}..{}",
        config.heuristic, config.heuristic_lo_threshold, config.heuristic_hi_threshold
    );
    for (i, name) in config.event_names.iter().enumerate() {
        info!("Event[{i}]: {name}");
    }

    Ok(config)
}
