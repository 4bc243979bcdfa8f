//! Run Configuration Module
//!
//! Everything a transpose run is parameterized by. Invalid combinations are
//! rejected by [`TransposeConfig::validate`] before any rank communicates.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransposeError};
use crate::handler::diagonal::DiagonalPairing;
use crate::topology::GridTopology;

/// Largest single transfer most message layers accept (i32 element count)
pub const DEFAULT_MAX_TRANSFER_VALUES: usize = i32::MAX as usize;

/// How the matrix blocks are distributed over the ranks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyKind {
    /// Mirrored pairs of ranks swap their whole local matrix
    #[serde(rename = "DIAG")]
    Diagonal,
    /// Block-cyclic distribution over a P x Q grid
    #[serde(rename = "PQ")]
    Grid,
}

impl PolicyKind {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::Diagonal => "DIAG",
            PolicyKind::Grid => "PQ",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = TransposeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DIAG" | "DIAGONAL" => Ok(PolicyKind::Diagonal),
            "PQ" | "GRID" => Ok(PolicyKind::Grid),
            _ => Err(TransposeError::config(format!(
                "unknown distribution policy '{}', expected DIAG or PQ",
                s
            ))),
        }
    }
}

/// Complete run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransposeConfig {
    /// Matrix width and height in blocks
    pub matrix_size_in_blocks: usize,
    /// Values per block side
    pub block_size: usize,
    /// Grid width P; Q is derived from the number of ranks
    pub grid_width: usize,
    pub policy: PolicyKind,
    /// Measured exchange + kernel iterations
    pub repetitions: usize,
    /// Upper bound on values per single message of a pairwise exchange
    pub max_transfer_values: usize,
    /// Receive timeout; `None` waits forever
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for TransposeConfig {
    fn default() -> Self {
        TransposeConfig {
            matrix_size_in_blocks: 12,
            block_size: 32,
            grid_width: 2,
            policy: PolicyKind::Grid,
            repetitions: 3,
            max_transfer_values: DEFAULT_MAX_TRANSFER_VALUES,
            timeout_ms: None,
        }
    }
}

impl TransposeConfig {
    /// Matrix width in values
    pub fn matrix_size(&self) -> usize {
        self.matrix_size_in_blocks * self.block_size
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Tiny matrix on a 2 x 2 grid, quick to run
    pub fn small() -> Self {
        TransposeConfig {
            matrix_size_in_blocks: 4,
            block_size: 4,
            grid_width: 2,
            repetitions: 1,
            ..Default::default()
        }
    }

    /// Non-square grid with P=2, Q=3 (6 ranks); 12 blocks are two LCM tiles
    pub fn grid_2x3() -> Self {
        TransposeConfig {
            matrix_size_in_blocks: 12,
            block_size: 8,
            grid_width: 2,
            ..Default::default()
        }
    }

    /// Check every constraint that depends on the number of ranks
    pub fn validate(&self, world_size: usize) -> Result<()> {
        if self.block_size == 0 || self.matrix_size_in_blocks == 0 {
            return Err(TransposeError::config(format!(
                "matrix of {} blocks with block size {} is empty",
                self.matrix_size_in_blocks, self.block_size
            )));
        }
        if world_size == 0 {
            return Err(TransposeError::config("at least one rank is required"));
        }
        if self.max_transfer_values == 0 {
            return Err(TransposeError::config("max_transfer_values must be at least 1"));
        }
        if self.repetitions == 0 {
            return Err(TransposeError::config("repetitions must be at least 1"));
        }
        match self.policy {
            PolicyKind::Grid => {
                let topology = GridTopology::new(0, world_size, self.grid_width)?;
                check_lcm_granularity(&topology, self.matrix_size_in_blocks)
            }
            PolicyKind::Diagonal => {
                DiagonalPairing::new(world_size, self.matrix_size_in_blocks).map(|_| ())
            }
        }
    }

    /// Settings as printable key/value pairs
    pub fn settings_map(&self, world_size: usize) -> BTreeMap<&'static str, String> {
        let mut map = BTreeMap::new();
        map.insert("Matrix Size", self.matrix_size().to_string());
        map.insert("Block Size", self.block_size.to_string());
        map.insert("Data Handler", self.policy.to_string());
        map.insert("Ranks", world_size.to_string());
        if self.policy == PolicyKind::Grid && self.grid_width > 0 {
            map.insert(
                "Grid (P x Q)",
                format!("{} x {}", self.grid_width, world_size / self.grid_width),
            );
        }
        map.insert("Repetitions", self.repetitions.to_string());
        map
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &str) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Load configuration from TOML file
    pub fn load(path: &str) -> Result<Self> {
        let toml_str = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&toml_str)?)
    }
}

/// P != Q grids only exchange whole LCM tiles
pub fn check_lcm_granularity(topology: &GridTopology, width_in_blocks: usize) -> Result<()> {
    if topology.is_square() || width_in_blocks % topology.lcm == 0 {
        return Ok(());
    }
    Err(TransposeError::config(format!(
        "matrix width of {} blocks is not a multiple of lcm(P={}, Q={}) = {}; \
         a {}x{} grid requires the width in blocks to be divisible by {}",
        width_in_blocks,
        topology.width,
        topology.height,
        topology.lcm,
        topology.width,
        topology.height,
        topology.lcm
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_names() {
        assert_eq!("PQ".parse::<PolicyKind>().unwrap(), PolicyKind::Grid);
        assert_eq!("diag".parse::<PolicyKind>().unwrap(), PolicyKind::Diagonal);
        assert!("ROW".parse::<PolicyKind>().is_err());
        assert_eq!(PolicyKind::Diagonal.to_string(), "DIAG");
    }

    #[test]
    fn test_config_serialization() {
        let config = TransposeConfig::grid_2x3();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"PQ\""));
        let recovered: TransposeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, recovered);

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let recovered: TransposeConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, recovered);
    }

    #[test]
    fn test_missing_timeout_defaults_to_none() {
        let text = r#"
            matrix_size_in_blocks = 6
            block_size = 2
            grid_width = 1
            policy = "DIAG"
            repetitions = 1
            max_transfer_values = 100
        "#;
        let config: TransposeConfig = toml::from_str(text).unwrap();
        assert_eq!(config.policy, PolicyKind::Diagonal);
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_lcm_granularity() {
        let config = TransposeConfig {
            matrix_size_in_blocks: 4,
            ..TransposeConfig::grid_2x3()
        };
        let err = config.validate(6).unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("lcm(P=2, Q=3) = 6"));

        assert!(TransposeConfig::grid_2x3().validate(6).is_ok());
        // square grids accept any width
        let square = TransposeConfig {
            matrix_size_in_blocks: 5,
            ..TransposeConfig::small()
        };
        assert!(square.validate(4).is_ok());
    }

    #[test]
    fn test_world_size_must_fit_grid() {
        let err = TransposeConfig::small().validate(5).unwrap_err();
        assert!(err.to_string().contains("P=2"));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("ptrans-config-{}.toml", std::process::id()));
        let path = path.to_str().unwrap();
        let config = TransposeConfig {
            timeout_ms: Some(500),
            ..TransposeConfig::small()
        };
        config.save(path).unwrap();
        let loaded = TransposeConfig::load(path).unwrap();
        std::fs::remove_file(path).unwrap();
        assert_eq!(config, loaded);
    }
}
