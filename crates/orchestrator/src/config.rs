//! Configuration parsing and validation for particle redistribution runs

use particle_kernel::{Aabb, BoundaryKind};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::partition::DomainPartition;
use crate::system::SystemSettings;

/// Main run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Human-readable run name (also the `{name}` of checkpoint file patterns)
    pub name: String,
    /// Root domain bounds; its length fixes the dimension
    pub root_domain: DomainBounds,
    /// Boundary condition per axis; empty means periodic on every axis
    #[serde(default)]
    pub boundary: Vec<BoundaryKind>,
    /// Process grid; the product must equal the number of processes
    pub grid: Vec<usize>,
    /// Average load-balancing samples drawn per process
    #[serde(default = "default_samples_per_process")]
    pub samples_per_process: usize,
    /// Slack of the per-process sample floor
    #[serde(default = "default_sample_floor_ratio")]
    pub sample_floor_ratio: f64,
    /// Run seed for sampling
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Initial particle capacity per process
    #[serde(default)]
    pub capacity_hint: usize,
    /// Where checkpoints go, if anywhere
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

/// Root domain bounding box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainBounds {
    /// Minimum corner
    pub min: Vec<f64>,
    /// Maximum corner
    pub max: Vec<f64>,
}

/// Checkpoint file settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// File name pattern with optional `{name}`, `{nproc}` and `{rank}` placeholders
    pub pattern: String,
    /// One file for the whole group, written and read by rank 0
    #[serde(default)]
    pub single_file: bool,
}

// Default values
fn default_samples_per_process() -> usize {
    particle_kernel::sampling::DEFAULT_SAMPLES_PER_PROCESS
}

fn default_sample_floor_ratio() -> f64 {
    particle_kernel::sampling::DEFAULT_SAMPLE_FLOOR_RATIO
}

fn default_seed() -> u64 {
    0x5EED
}

impl SystemConfig {
    /// Configuration with defaults for everything but the geometry.
    pub fn new(name: &str, min: Vec<f64>, max: Vec<f64>, grid: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            root_domain: DomainBounds { min, max },
            boundary: Vec::new(),
            grid,
            samples_per_process: default_samples_per_process(),
            sample_floor_ratio: default_sample_floor_ratio(),
            seed: default_seed(),
            capacity_hint: 0,
            checkpoint: None,
        }
    }

    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, String> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        let config: SystemConfig = serde_json::from_str(&contents)
            .map_err(|e| format!("Failed to parse config JSON: {}", e))?;

        config.validate()?;
        Ok(config)
    }

    /// Number of spatial dimensions.
    pub fn dimension(&self) -> usize {
        self.root_domain.min.len()
    }

    /// Number of processes the grid is laid out for.
    pub fn process_count(&self) -> usize {
        self.grid.iter().product()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let dim = self.dimension();
        if dim == 0 {
            return Err("Root domain needs at least one axis".to_string());
        }
        if self.root_domain.max.len() != dim {
            return Err(format!(
                "Root domain min has {} axes but max has {}",
                dim,
                self.root_domain.max.len()
            ));
        }
        for (k, (lo, hi)) in self
            .root_domain
            .min
            .iter()
            .zip(&self.root_domain.max)
            .enumerate()
        {
            if !lo.is_finite() || !hi.is_finite() {
                return Err(format!("Root domain axis {} must be finite", k));
            }
            if lo >= hi {
                return Err(format!("Root domain min[{}] must be less than max[{}]", k, k));
            }
        }

        if !self.boundary.is_empty() && self.boundary.len() != dim {
            return Err(format!(
                "Expected {} boundary kinds, got {}",
                dim,
                self.boundary.len()
            ));
        }

        if self.grid.len() != dim {
            return Err(format!("Grid must have {} axes, got {}", dim, self.grid.len()));
        }
        if self.grid.iter().any(|&n| n == 0) {
            return Err("Every grid axis needs at least one process".to_string());
        }

        if self.samples_per_process == 0 {
            return Err("samples_per_process must be at least 1".to_string());
        }
        if !self.sample_floor_ratio.is_finite() || self.sample_floor_ratio < 0.0 {
            return Err("sample_floor_ratio must be non-negative".to_string());
        }

        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.pattern.is_empty() {
                return Err("Checkpoint pattern must not be empty".to_string());
            }
            if !checkpoint.single_file && !checkpoint.pattern.contains("{rank}") {
                return Err("Per-rank checkpoint pattern must contain {rank}".to_string());
            }
        }

        Ok(())
    }

    fn check_dimension<const D: usize>(&self) -> Result<(), String> {
        if self.dimension() != D {
            return Err(format!(
                "Configuration is {}-dimensional, requested {}",
                self.dimension(),
                D
            ));
        }
        Ok(())
    }

    /// Root domain as a `D`-dimensional box.
    pub fn root_box<const D: usize>(&self) -> Result<Aabb<D>, String> {
        self.check_dimension::<D>()?;
        Ok(Aabb::new(
            std::array::from_fn(|k| self.root_domain.min[k]),
            std::array::from_fn(|k| self.root_domain.max[k]),
        ))
    }

    /// Boundary kind of every axis.
    pub fn boundary_kinds<const D: usize>(&self) -> Result<[BoundaryKind; D], String> {
        self.check_dimension::<D>()?;
        Ok(std::array::from_fn(|k| {
            self.boundary.get(k).copied().unwrap_or(BoundaryKind::Periodic)
        }))
    }

    /// Process grid shape.
    pub fn grid_shape<const D: usize>(&self) -> Result<[usize; D], String> {
        self.check_dimension::<D>()?;
        Ok(std::array::from_fn(|k| self.grid[k]))
    }

    /// Evenly cut starting partition.
    pub fn initial_partition<const D: usize>(&self) -> Result<DomainPartition<D>, String> {
        DomainPartition::uniform(
            self.root_box()?,
            self.grid_shape()?,
            self.boundary_kinds()?,
        )
        .map_err(|e| e.to_string())
    }

    /// Settings for [`crate::ParticleSystem::configure`].
    pub fn settings(&self) -> SystemSettings {
        SystemSettings {
            samples_per_process: self.samples_per_process,
            sample_floor_ratio: self.sample_floor_ratio,
            seed: self.seed,
            capacity_hint: self.capacity_hint,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube() -> SystemConfig {
        SystemConfig::new("test", vec![0.0; 3], vec![1.0; 3], vec![2, 2, 1])
    }

    #[test]
    fn test_defaults_from_json() {
        let json = r#"{
            "name": "quad",
            "root_domain": { "min": [0.0, 0.0, 0.0], "max": [1.0, 1.0, 1.0] },
            "grid": [2, 2, 1]
        }"#;
        let config: SystemConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.samples_per_process, 30);
        assert!((config.sample_floor_ratio - 0.2).abs() < 1e-12);
        assert_eq!(config.process_count(), 4);
        assert_eq!(config.boundary_kinds::<3>().unwrap(), [BoundaryKind::Periodic; 3]);
    }

    #[test]
    fn test_boundary_kinds_parse() {
        let json = r#"{
            "name": "slab",
            "root_domain": { "min": [0.0, 0.0], "max": [2.0, 1.0] },
            "boundary": ["Periodic", "Open"],
            "grid": [4, 1]
        }"#;
        let config: SystemConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config.boundary_kinds::<2>().unwrap(),
            [BoundaryKind::Periodic, BoundaryKind::Open]
        );
        assert!(config.root_box::<3>().is_err());
    }

    #[test]
    fn test_validation_domain_bounds() {
        let mut config = cube();
        config.root_domain.min[0] = 1.0;
        config.root_domain.max[0] = 0.0;
        assert!(config.validate().is_err());

        config.root_domain.min[0] = 0.0;
        config.root_domain.max[0] = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_grid() {
        let mut config = cube();
        config.grid = vec![2, 2];
        assert!(config.validate().is_err());
        config.grid = vec![2, 0, 1];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_checkpoint_pattern() {
        let mut config = cube();
        config.checkpoint = Some(CheckpointConfig {
            pattern: "out/{name}.jsonl".to_string(),
            single_file: false,
        });
        assert!(config.validate().is_err());
        config.checkpoint = Some(CheckpointConfig {
            pattern: "out/{name}.{nproc}.{rank}.jsonl".to_string(),
            single_file: false,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_initial_partition() {
        let partition = cube().initial_partition::<3>().unwrap();
        assert_eq!(partition.len(), 4);
        assert_eq!(partition.grid(), [2, 2, 1]);
    }
}
