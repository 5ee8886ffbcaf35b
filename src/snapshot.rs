use crate::error::{FluidError, FluidResult};
use crate::octree::Octree;
use crate::physics::DT;
use crate::simulation::{TracerField, run_tracer_phase};
use crate::threading::{KernelGroup, PhaseReport, WorkerPool};
use crate::tracer::Tracer;
use crate::vorton::{Vec3, Vorton};
use log::info;
use nalgebra::{Isometry3, Point3};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

// MARK: Persistence
/// Write a finalized tree snapshot as JSON.
pub fn save_snapshot<P: AsRef<Path>>(tree: &Octree, path: P) -> FluidResult<()> {
    let path = path.as_ref();
    info!("saving tree snapshot to {}", path.display());
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), tree)?;
    Ok(())
}

pub fn load_snapshot<P: AsRef<Path>>(path: P) -> FluidResult<Octree> {
    let path = path.as_ref();
    info!("loading tree snapshot from {}", path.display());
    let file = File::open(path)?;
    let tree: Octree = serde_json::from_reader(BufReader::new(file))?;
    if !tree.is_finalized() {
        return Err(FluidError::invalid("snapshot tree was saved before aggregation"));
    }
    tree.validate()?;
    Ok(tree)
}

// MARK: Frozen Field
/// Tracer playback against a static snapshot. The vortons never move; the
/// whole field follows `object_transform` so it can ride on a moving host.
pub struct FrozenField {
    tree: Octree,
    tracer_group: KernelGroup<Vec<Vorton>>,
    object_transform: Isometry3<f64>,
    timestep: f64,
}

impl FrozenField {
    /// Playback with the default timestep of [`DT`].
    pub fn new(tree: Octree, pool: Arc<WorkerPool>) -> FluidResult<Self> {
        if !tree.is_finalized() {
            return Err(FluidError::invalid("frozen field needs a finalized tree"));
        }
        tree.validate()?;
        Ok(FrozenField {
            tree,
            tracer_group: KernelGroup::new(pool, "frozen-tracers", Vec::new),
            object_transform: Isometry3::identity(),
            timestep: DT,
        })
    }

    /// Cap each tracer move at `timestep` instead of [`DT`], to match the
    /// simulation the snapshot was taken from.
    pub fn with_timestep(mut self, timestep: f64) -> FluidResult<Self> {
        if !(timestep.is_finite() && timestep > 0.0) {
            return Err(FluidError::invalid(format!(
                "timestep must be positive and finite, got {}",
                timestep
            )));
        }
        self.timestep = timestep;
        Ok(self)
    }

    pub fn timestep(&self) -> f64 {
        self.timestep
    }

    pub fn from_file<P: AsRef<Path>>(path: P, pool: Arc<WorkerPool>) -> FluidResult<Self> {
        FrozenField::new(load_snapshot(path)?, pool)
    }

    pub fn n_vortons(&self) -> usize {
        self.tree.n_vortons()
    }

    pub fn tree(&self) -> &Octree {
        &self.tree
    }

    pub fn update_transform(&mut self, transform: Isometry3<f64>) {
        self.object_transform = transform;
    }
}

impl TracerField for FrozenField {
    /// Nothing to simulate.
    fn step_simulation(&mut self, _elapsed: f64) -> FluidResult<bool> {
        Ok(false)
    }

    fn advect_tracers(&mut self, tracers: &mut [Tracer], elapsed: f64) -> FluidResult<PhaseReport> {
        run_tracer_phase(
            &mut self.tracer_group,
            &self.tree,
            Some(&self.object_transform),
            tracers,
            elapsed,
            self.timestep,
        )
    }

    /// Vorton positions in world space.
    fn trace_vortons(&self, out: &mut Vec<Vec3>) {
        out.clear();
        out.extend(self.tree.vortons().iter().map(|v| {
            self.object_transform
                .transform_point(&Point3::from(v.position))
                .coords
        }));
    }
}
