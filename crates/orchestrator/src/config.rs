//! Run configuration parsing and validation.

use std::fs;

use serde::{Deserialize, Serialize};

use kernel::error::{Result, SimulationError};

/// Knobs of one run. Everything the core reads is listed here; no implicit
/// environment is consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable run name.
    pub name: String,
    /// Rank grid (nx, ny, nz); the world communicator must match.
    pub ranks: [i32; 3],
    /// Global box extent.
    pub domain: [f32; 3],
    /// Timestep size.
    pub dt: f32,
    /// Write a checkpoint every this many steps (0 disables).
    #[serde(default)]
    pub checkpoint_every: u64,
    /// Folder checkpoints go to.
    #[serde(default = "default_checkpoint_folder")]
    pub checkpoint_folder: String,
    /// Tolerance used when deduplicating and matching cell-list cutoffs.
    #[serde(default = "default_rc_tolerance")]
    pub rc_tolerance: f32,
}

fn default_checkpoint_folder() -> String {
    "restart".to_string()
}

fn default_rc_tolerance() -> f32 {
    1e-5
}

impl SimulationConfig {
    /// Config with required fields set and defaults elsewhere.
    pub fn new(name: &str, ranks: [i32; 3], domain: [f32; 3], dt: f32) -> Self {
        Self {
            name: name.to_string(),
            ranks,
            domain,
            dt,
            checkpoint_every: 0,
            checkpoint_folder: default_checkpoint_folder(),
            rc_tolerance: default_rc_tolerance(),
        }
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            SimulationError::Configuration(format!("failed to read config file {path}: {e}"))
        })?;
        let config: SimulationConfig = serde_json::from_str(&contents).map_err(|e| {
            SimulationError::Configuration(format!("failed to parse config JSON: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.ranks.iter().any(|&n| n <= 0) {
            return Err(SimulationError::Configuration(
                "rank grid entries must be positive".into(),
            ));
        }
        if self.domain.iter().any(|&l| l <= 0.0) {
            return Err(SimulationError::Configuration(
                "domain extents must be positive".into(),
            ));
        }
        if self.dt <= 0.0 {
            return Err(SimulationError::Configuration(
                "timestep must be positive".into(),
            ));
        }
        if self.rc_tolerance <= 0.0 {
            return Err(SimulationError::Configuration(
                "cutoff tolerance must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_catches_bad_fields() {
        let mut config = SimulationConfig::new("test", [2, 1, 1], [16.0, 8.0, 8.0], 0.01);
        assert!(config.validate().is_ok());

        config.dt = 0.0;
        assert!(config.validate().is_err());
        config.dt = 0.01;

        config.ranks = [0, 1, 1];
        assert!(config.validate().is_err());
        config.ranks = [1, 1, 1];

        config.domain = [8.0, -1.0, 8.0];
        assert!(config.validate().is_err());
    }

    #[test]
    fn json_roundtrip_with_defaults() {
        let text = r#"{"name":"run","ranks":[1,1,1],"domain":[8.0,8.0,8.0],"dt":0.01}"#;
        let config: SimulationConfig = serde_json::from_str(text).unwrap();
        config.validate().unwrap();
        assert_eq!(config.checkpoint_every, 0);
        assert_eq!(config.checkpoint_folder, "restart");
        assert!((config.rc_tolerance - 1e-5).abs() < 1e-12);
    }
}
