use crate::error::{FluidError, FluidResult};
use crate::physics::DT;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Largest bucket load accepted for the adaptive tree. Diffusion is O(k²)
/// per leaf, so leaves must stay small.
pub const MAX_BUCKET_LOAD: usize = 32;

// MARK: Tree Configuration
/// How the octree decides where to stop subdividing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Subdivide to `depth` levels up front. Every node at that depth is a
    /// leaf, occupied or not.
    FixedDepth { depth: u32 },
    /// Split a leaf once it holds more than `load` vortons, never below
    /// `max_depth` (coincident vortons would otherwise split forever).
    Bucket { load: usize, max_depth: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    pub split: SplitPolicy,
    /// Barnes-Hut acceptance ratio. When set, a far cell is still opened if
    /// `cell_size / distance >= opening_angle`.
    #[serde(default)]
    pub opening_angle: Option<f64>,
}

impl TreeConfig {
    pub fn fixed_depth(depth: u32) -> Self {
        TreeConfig {
            split: SplitPolicy::FixedDepth { depth },
            opening_angle: None,
        }
    }

    pub fn bucket(load: usize, max_depth: u32) -> Self {
        TreeConfig {
            split: SplitPolicy::Bucket { load, max_depth },
            opening_angle: None,
        }
    }

    pub fn with_opening_angle(mut self, theta: f64) -> Self {
        self.opening_angle = Some(theta);
        self
    }

    pub fn validate(&self) -> FluidResult<()> {
        match self.split {
            SplitPolicy::FixedDepth { depth } => {
                if depth == 0 {
                    return Err(FluidError::invalid("octree depth must be at least 1"));
                }
                // 8^depth leaves are allocated up front
                if depth > 7 {
                    return Err(FluidError::invalid(format!(
                        "octree depth {} is too deep for a fixed-depth tree (max 7)",
                        depth
                    )));
                }
            }
            SplitPolicy::Bucket { load, max_depth } => {
                if load == 0 || load > MAX_BUCKET_LOAD {
                    return Err(FluidError::invalid(format!(
                        "bucket load must be in 1..={}, got {}",
                        MAX_BUCKET_LOAD, load
                    )));
                }
                if max_depth == 0 {
                    return Err(FluidError::invalid("bucket tree max depth must be at least 1"));
                }
            }
        }
        if let Some(theta) = self.opening_angle {
            if !theta.is_finite() || theta <= 0.0 {
                return Err(FluidError::invalid(format!(
                    "opening angle must be positive, got {}",
                    theta
                )));
            }
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig::fixed_depth(4)
    }
}

// MARK: Simulation Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Size of the vorton pool. Fixed for the lifetime of a simulation; a
    /// perfect cube gives the most symmetric grid seeding.
    pub vorton_count: usize,
    /// Rough kinematic viscosity. Water is about 1.0.
    pub viscosity: f64,
    /// Fixed simulation step in seconds.
    pub timestep: f64,
    pub tree: TreeConfig,
    /// Run the vorticity stretch/tilt phase before diffusion.
    pub stretch_tilt: bool,
    /// Worker thread count for pools built from this config. `None` uses
    /// the host's available parallelism.
    pub workers: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            vorton_count: 1000,
            viscosity: 0.5,
            timestep: DT,
            tree: TreeConfig::default(),
            stretch_tilt: false,
            workers: None,
        }
    }
}

impl SimulationConfig {
    /// Config for `vorton_count` vortons with a fixed-depth tree.
    pub fn new(vorton_count: usize, viscosity: f64, octree_depth: u32) -> Self {
        SimulationConfig {
            vorton_count,
            viscosity,
            tree: TreeConfig::fixed_depth(octree_depth),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> FluidResult<()> {
        if !self.viscosity.is_finite() || self.viscosity < 0.0 {
            return Err(FluidError::invalid(format!(
                "viscosity must be a non-negative number, got {}",
                self.viscosity
            )));
        }
        if !self.timestep.is_finite() || self.timestep <= 0.0 {
            return Err(FluidError::invalid(format!(
                "timestep must be positive, got {}",
                self.timestep
            )));
        }
        if self.workers == Some(0) {
            return Err(FluidError::invalid("worker count must be at least 1"));
        }
        self.tree.validate()
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> FluidResult<Self> {
        let file = File::open(path.as_ref())?;
        let config: SimulationConfig = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> FluidResult<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}
