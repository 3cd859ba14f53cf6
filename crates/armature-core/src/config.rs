use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Serde default functions
// ---------------------------------------------------------------------------

const fn default_max_iterations() -> u32 {
    20
}
const fn default_tolerance() -> f32 {
    1e-3
}
const fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// SolverFeatures
// ---------------------------------------------------------------------------

/// Per-solver feature toggles.
///
/// The closed set of switches the solve loop consults. Constraints and joint
/// rotations are on by default; target rotations are opt-in since the
/// decayed rotation pass costs an extra sweep per chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverFeatures {
    /// Clamp joint rotations through attached constraint chains.
    #[serde(default = "default_true")]
    pub constraints: bool,

    /// After position convergence, rotate the tip toward the effector's
    /// target rotation with per-level decay.
    #[serde(default)]
    pub target_rotations: bool,

    /// Derive joint rotations from solved positions and write them back.
    /// When off, only positions are solved (debug/visualization use).
    #[serde(default = "default_true")]
    pub joint_rotations: bool,
}

impl Default for SolverFeatures {
    fn default() -> Self {
        Self {
            constraints: true,
            target_rotations: false,
            joint_rotations: true,
        }
    }
}

// ---------------------------------------------------------------------------
// SolverConfig
// ---------------------------------------------------------------------------

/// Solver configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Maximum solve iterations per call (default: 20). Must be >= 1.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Positional convergence tolerance in world units (default: 1e-3).
    /// Must be > 0.
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,

    /// Feature toggles.
    #[serde(default)]
    pub features: SolverFeatures,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            features: SolverFeatures::default(),
        }
    }
}

impl SolverConfig {
    /// Check invariants on the configured values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `max_iterations` is zero or `tolerance`
    /// is not a positive finite number.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations < 1 {
            return Err(ConfigError::InvalidMaxIterations);
        }
        if !(self.tolerance > 0.0) || !self.tolerance.is_finite() {
            return Err(ConfigError::InvalidTolerance(self.tolerance));
        }
        Ok(())
    }

    /// Parse a configuration from a TOML string and validate it.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Toml`] on malformed input and the
    /// corresponding validation error on out-of-range values.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise
    /// the same errors as [`SolverConfig::from_toml_str`].
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
