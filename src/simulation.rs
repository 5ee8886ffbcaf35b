use crate::config::SimulationConfig;
use crate::error::{FluidError, FluidResult};
use crate::octree::Octree;
use crate::physics;
use crate::threading::{KernelGroup, PhaseReport, WorkerPool};
use crate::tracer::Tracer;
use crate::vorton::{Vec3, Vorton, VortonBuffers};

// External crates
use log::{debug, info, warn};
use nalgebra::{Isometry3, Point3};
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Instant;

// MARK: Data Structures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationStats {
    pub steps: u64,
    pub simulated_time: f64,
    pub tree_nodes: usize,
    pub rebuild_ms: f64,
    pub stretch_ms: Option<f64>,
    pub diffuse_ms: f64,
    pub advect_ms: f64,
    pub tracer_ms: f64,
}

/// Something tracers can be advected through: a live simulation or a frozen
/// snapshot of one.
pub trait TracerField {
    /// Feed elapsed wall time. Returns whether a simulation step ran.
    fn step_simulation(&mut self, elapsed: f64) -> FluidResult<bool>;

    fn advect_tracers(&mut self, tracers: &mut [Tracer], elapsed: f64) -> FluidResult<PhaseReport>;

    /// Current vorton positions, for display.
    fn trace_vortons(&self, out: &mut Vec<Vec3>);
}

/// Read-only inputs shared by every vorton kernel of one step.
#[derive(Clone, Copy)]
struct FieldContext<'a> {
    tree: &'a Octree,
    positions: &'a [Vec3],
    vorticities: &'a [Vec3],
    viscosity: f64,
    dt: f64,
}

struct TracerContext<'a> {
    tree: &'a Octree,
    elapsed: f64,
    timestep: f64,
    object_transform: Option<&'a Isometry3<f64>>,
}

/// Advect live tracers through `tree`. With an object transform, tracers
/// are sampled in the tree's local frame and the velocity is rotated back.
pub(crate) fn run_tracer_phase(
    group: &mut KernelGroup<Vec<Vorton>>,
    tree: &Octree,
    object_transform: Option<&Isometry3<f64>>,
    tracers: &mut [Tracer],
    elapsed: f64,
    timestep: f64,
) -> FluidResult<PhaseReport> {
    let context = TracerContext {
        tree,
        elapsed,
        timestep,
        object_transform,
    };
    group.run(tracers, &context, |mut task, influences| {
        let ctx = task.context;
        for (_, tracer) in task.iter_mut() {
            if !tracer.is_alive() {
                continue;
            }
            let local = match ctx.object_transform {
                Some(transform) => transform
                    .inverse_transform_point(&Point3::from(tracer.position))
                    .coords,
                None => tracer.position,
            };
            influences.clear();
            ctx.tree.query_within(&local, tracer.radius, None, influences);
            let mut velocity = physics::velocity_at(&local, influences);
            if let Some(transform) = ctx.object_transform {
                velocity = transform.rotation * velocity;
            }
            physics::move_tracer(tracer, &velocity, ctx.elapsed, ctx.timestep);
        }
    })
}

// MARK: Vorton Space
/// A vorton simulation: a fixed pool of vortons, the spatial index built
/// over them and the kernel groups that advance them.
pub struct VortonSpace {
    config: SimulationConfig,
    buffers: VortonBuffers,
    tree: Option<Octree>,
    // stretched vorticities, only allocated when stretch/tilt is enabled
    stretched: Vec<Vec3>,
    stretch_group: KernelGroup<Vec<Vorton>>,
    diffuse_group: KernelGroup<()>,
    advect_group: KernelGroup<Vec<Vorton>>,
    tracer_group: KernelGroup<Vec<Vorton>>,
    time_accumulator: f64,
    input_transform: Isometry3<f64>,
    stats: SimulationStats,
}

impl VortonSpace {
    pub fn new(config: SimulationConfig, pool: Arc<WorkerPool>) -> FluidResult<Self> {
        config.validate()?;
        let n = config.vorton_count;
        if n == 0 {
            warn!("vorton space created with an empty vorton pool");
        }

        info!(
            "created vorton space: {} vortons, viscosity {}, {:?}, {} workers",
            n,
            config.viscosity,
            config.tree.split,
            pool.n_workers()
        );

        Ok(VortonSpace {
            buffers: VortonBuffers::new(n),
            tree: None,
            stretched: if config.stretch_tilt {
                vec![Vec3::zeros(); n]
            } else {
                Vec::new()
            },
            stretch_group: KernelGroup::new(Arc::clone(&pool), "stretch", Vec::new),
            diffuse_group: KernelGroup::new(Arc::clone(&pool), "diffuse", || ()),
            advect_group: KernelGroup::new(Arc::clone(&pool), "advect", Vec::new),
            tracer_group: KernelGroup::new(pool, "advect-tracers", Vec::new),
            time_accumulator: 0.0,
            input_transform: Isometry3::identity(),
            stats: SimulationStats::default(),
            config,
        })
    }

    /// `vorton_count` vortons with a fixed-depth tree of `octree_depth`.
    pub fn create(
        vorton_count: usize,
        viscosity: f64,
        octree_depth: u32,
        pool: Arc<WorkerPool>,
    ) -> FluidResult<Self> {
        VortonSpace::new(SimulationConfig::new(vorton_count, viscosity, octree_depth), pool)
    }

    /// Build a simulation with its own worker pool, sized by `config.workers`.
    pub fn with_own_pool(config: SimulationConfig) -> FluidResult<Self> {
        let pool = match config.workers {
            Some(n) => WorkerPool::with_workers(n)?,
            None => WorkerPool::new()?,
        };
        VortonSpace::new(config, Arc::new(pool))
    }

    // MARK: Accessors
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn vorton(&self, index: usize) -> Vorton {
        self.buffers.vorton(index)
    }

    pub fn vortons(&self) -> Vec<Vorton> {
        (0..self.len()).map(|i| self.buffers.vorton(i)).collect()
    }

    pub fn positions(&self) -> &[Vec3] {
        self.buffers.positions()
    }

    pub fn vorticities(&self) -> &[Vec3] {
        self.buffers.vorticities()
    }

    /// Most recently built spatial index, if any.
    pub fn tree(&self) -> Option<&Octree> {
        self.tree.as_ref()
    }

    pub fn stats(&self) -> &SimulationStats {
        &self.stats
    }

    pub fn time_accumulator(&self) -> f64 {
        self.time_accumulator
    }

    pub fn input_transform(&self) -> &Isometry3<f64> {
        &self.input_transform
    }

    /// Transform applied to positions and directions passed to the seeding
    /// operations.
    pub fn set_input_transform(&mut self, transform: Isometry3<f64>) {
        self.input_transform = transform;
    }

    fn transform_point(&self, point: &Vec3) -> Vec3 {
        self.input_transform.transform_point(&Point3::from(*point)).coords
    }

    fn transform_direction(&self, direction: &Vec3) -> FluidResult<Vec3> {
        self.input_transform
            .transform_vector(direction)
            .try_normalize(f64::EPSILON)
            .ok_or_else(|| FluidError::invalid("direction must be non-zero"))
    }

    // MARK: Seeding
    /// Replace the whole vorton state. The pool size is fixed, so `vortons`
    /// must hold exactly one entry per vorton.
    pub fn set_vortons(&mut self, vortons: &[Vorton]) -> FluidResult<()> {
        if vortons.len() != self.len() {
            return Err(FluidError::LengthMismatch {
                name: "vortons",
                expected: self.len(),
                actual: vortons.len(),
            });
        }
        for (index, vorton) in vortons.iter().enumerate() {
            self.buffers.initialize(index, vorton.position, vorton.vorticity);
        }
        Ok(())
    }

    /// Place the vortons on a regular grid spanning `[min, max)`, with zero
    /// vorticity. `jitter` displaces each vorton by up to that fraction of a
    /// grid cell on every axis.
    pub fn distribute_vortons_uniform_grid(&mut self, min: &Vec3, max: &Vec3, jitter: f64) {
        self.distribute_vortons_uniform_grid_with(&mut rand::rng(), min, max, jitter);
    }

    pub fn distribute_vortons_uniform_grid_with<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        min: &Vec3,
        max: &Vec3,
        jitter: f64,
    ) {
        let n = self.len();
        if n == 0 {
            return;
        }
        // smallest cube that holds every vorton
        let mut per_side = (n as f64).cbrt().round() as usize;
        while per_side.pow(3) < n {
            per_side += 1;
        }
        let step = (max - min) / per_side as f64;

        let mut index = 0;
        'grid: for i in 0..per_side {
            for j in 0..per_side {
                for k in 0..per_side {
                    if index >= n {
                        break 'grid;
                    }
                    let mut cell = Vec3::new(k as f64, j as f64, i as f64);
                    if jitter > 0.0 {
                        cell += Vec3::new(
                            rng.random_range(-jitter..=jitter),
                            rng.random_range(-jitter..=jitter),
                            rng.random_range(-jitter..=jitter),
                        );
                    }
                    let position = self.transform_point(&(min + step.component_mul(&cell)));
                    self.buffers.initialize(index, position, Vec3::zeros());
                    index += 1;
                }
            }
        }
        info!("distributed {} vortons on a {}³ grid", n, per_side);
    }

    /// Scatter vortons randomly in the unit cube with random vorticity of up
    /// to `amplitude` per component.
    pub fn randomize_vortons(&mut self, amplitude: f64) {
        self.randomize_vortons_with(&mut rand::rng(), amplitude);
    }

    pub fn randomize_vortons_with<R: Rng + ?Sized>(&mut self, rng: &mut R, amplitude: f64) {
        for index in 0..self.len() {
            let position = Vec3::new(rng.random(), rng.random(), rng.random());
            let vorticity = Vec3::new(rng.random(), rng.random(), rng.random()) * amplitude;
            self.buffers.initialize(index, position, vorticity);
        }
        info!("randomized {} vortons", self.len());
    }

    /// Add the vorticity of a smooth vortex ring travelling along
    /// `direction`. Vortons within `thickness` of the ring's core circle
    /// receive azimuthal vorticity with a raised-cosine profile.
    pub fn inject_vortex_ring(
        &mut self,
        radius: f64,
        thickness: f64,
        strength: f64,
        direction: &Vec3,
        center: &Vec3,
    ) -> FluidResult<()> {
        let direction = self.transform_direction(direction)?;
        let center = self.transform_point(center);

        let mut touched = 0;
        for index in 0..self.len() {
            let from_center = self.buffers.positions()[index] - center;
            let along = from_center.dot(&direction);
            let rho = from_center - direction * along;
            let core_distance = ((rho.norm() - radius).powi(2) + along * along).sqrt();
            if core_distance >= thickness {
                continue;
            }
            let Some(rho_hat) = rho.try_normalize(f64::EPSILON) else {
                continue;
            };
            let profile = 0.5 * ((PI * core_distance / thickness).cos() + 1.0);
            let phi_hat = direction.cross(&rho_hat);
            self.buffers.accumulate_vorticity(index, phi_hat * (profile * strength));
            touched += 1;
        }
        debug!("vortex ring touched {} vortons", touched);
        Ok(())
    }

    /// Add the vorticity of a jet-driven ring: vortons in the annulus
    /// `radius < rho < radius + thickness` and within `height` of the center
    /// plane get azimuthal vorticity.
    pub fn inject_jet_ring(
        &mut self,
        radius: f64,
        thickness: f64,
        height: f64,
        strength: f64,
        direction: &Vec3,
        center: &Vec3,
    ) -> FluidResult<()> {
        let direction = self.transform_direction(direction)?;
        let center = self.transform_point(center);
        let radius_outer = radius + thickness;

        let mut touched = 0;
        for index in 0..self.len() {
            let from_center = self.buffers.positions()[index] - center;
            let along = from_center.dot(&direction);
            let rho = from_center - direction * along;
            let rho_len = rho.norm();
            if rho_len >= radius_outer || rho_len <= radius {
                continue;
            }
            let streamwise = if along.abs() < height {
                0.5 * ((PI * along / radius).cos() + 1.0)
            } else {
                0.0
            };
            let radial = (PI * (rho_len - radius) / thickness).sin();
            let vort_phi = streamwise * radial * PI / thickness;

            let Some(rho_hat) = rho.try_normalize(f64::EPSILON) else {
                continue;
            };
            let phi_hat = direction.cross(&rho_hat);
            self.buffers.accumulate_vorticity(index, phi_hat * (vort_phi * strength));
            touched += 1;
        }
        debug!("jet ring touched {} vortons", touched);
        Ok(())
    }

    /// Add a radial vorticity pattern around `center` in the xy plane:
    /// `ω_z = strength * (x² - y²) / (x² + y²)^(3/2)`.
    pub fn inject_radial(&mut self, strength: f64, center: &Vec3) {
        for index in 0..self.len() {
            let offset = self.buffers.positions()[index] - center;
            let planar_sq = offset.x * offset.x + offset.y * offset.y;
            // on the axis the pattern is singular
            if offset.norm() <= 0.001 || planar_sq <= 1e-12 {
                continue;
            }
            let z = (offset.x * offset.x - offset.y * offset.y) / planar_sq.powf(1.5);
            self.buffers
                .accumulate_vorticity(index, Vec3::new(0.0, 0.0, z * strength));
        }
    }

    /// Horizontal radial injection: `samples` small jet rings spaced evenly
    /// on a circle of `radius` around `center`, each pointing outward and
    /// tilted up by `z_fudge`.
    pub fn inject_radial_ring(
        &mut self,
        height: f64,
        radius: f64,
        strength: f64,
        z_fudge: f64,
        samples: usize,
        center: &Vec3,
    ) -> FluidResult<()> {
        if samples == 0 {
            return Ok(());
        }
        let step = 2.0 * PI / samples as f64;
        for i in 0..samples {
            let angle = step * i as f64;
            let offset = Vec3::new(radius * angle.cos(), radius * angle.sin(), 0.0);
            let mut direction = offset.try_normalize(f64::EPSILON).unwrap_or_else(Vec3::x);
            direction.z += z_fudge;
            self.inject_jet_ring(0.01, height, 0.2, strength, &direction, &(center + offset))?;
        }
        Ok(())
    }

    // MARK: Stepping
    /// Rebuild the spatial index from the current stable state.
    pub fn rebuild_tree(&mut self) {
        let non_finite = self
            .buffers
            .positions()
            .iter()
            .filter(|p| !p.iter().all(|c| c.is_finite()))
            .count();
        if non_finite > 0 {
            warn!("{} vortons have non-finite positions", non_finite);
        }
        let config = self.config.tree;
        let tree = self.tree.get_or_insert_with(|| Octree::new(config));
        tree.rebuild(self.buffers.positions(), self.buffers.vorticities());
        self.stats.tree_nodes = tree.nodes().len();
    }

    /// Accumulate `elapsed` seconds and run at most one fixed step once the
    /// accumulated time exceeds the timestep. Excess time carries over to
    /// later calls.
    ///
    /// An error leaves the previous stable state untouched.
    pub fn step_simulation(&mut self, elapsed: f64) -> FluidResult<bool> {
        self.time_accumulator += elapsed;
        if self.time_accumulator <= self.config.timestep {
            return Ok(false);
        }
        self.run_step()?;
        self.time_accumulator -= self.config.timestep;
        Ok(true)
    }

    /// Rebuild, (stretch), diffuse and advect. Results land in the front
    /// buffers and are published by the swap at the end.
    fn run_step(&mut self) -> FluidResult<()> {
        let rebuild_start = Instant::now();
        self.rebuild_tree();
        let rebuild_ms = rebuild_start.elapsed().as_secs_f64() * 1000.0;

        let Some(tree) = self.tree.as_ref() else {
            return Err(FluidError::TreeNotBuilt);
        };
        let phase = self.buffers.split();
        let context = FieldContext {
            tree,
            positions: phase.positions,
            vorticities: phase.vorticities,
            viscosity: self.config.viscosity,
            dt: self.config.timestep,
        };

        let stretch_ms = if self.config.stretch_tilt {
            let report = self.stretch_group.run(&mut self.stretched, &context, |mut task, influences| {
                let ctx = task.context;
                for (i, slot) in task.iter_mut() {
                    influences.clear();
                    ctx.tree.query_influences(&ctx.positions[i], Some(i), influences);
                    let gradient = physics::jacobian(&ctx.positions[i], influences);
                    *slot = physics::stretch_tilt(&ctx.vorticities[i], &gradient, ctx.dt);
                }
            })?;
            Some(report.elapsed_ms())
        } else {
            None
        };

        let diffuse_context = if self.config.stretch_tilt {
            FieldContext {
                vorticities: &self.stretched,
                ..context
            }
        } else {
            context
        };
        let diffuse = self.diffuse_group.run(phase.front_vorticities, &diffuse_context, |mut task, _| {
            let ctx = task.context;
            for (i, slot) in task.iter_mut() {
                let group = ctx.tree.node(ctx.tree.leaf_of(i)).items();
                *slot = physics::diffuse_vorton(i, group, ctx.vorticities, ctx.viscosity, ctx.dt);
            }
        })?;

        let advect = self.advect_group.run(phase.front_positions, &context, |mut task, influences| {
            let ctx = task.context;
            for (i, slot) in task.iter_mut() {
                let position = ctx.positions[i];
                influences.clear();
                ctx.tree.query_influences(&position, Some(i), influences);
                let velocity = physics::velocity_at(&position, influences);
                *slot = physics::advect_position(&position, &velocity, ctx.dt);
            }
        })?;

        self.buffers.swap();

        self.stats.steps += 1;
        self.stats.simulated_time += self.config.timestep;
        self.stats.rebuild_ms = rebuild_ms;
        self.stats.stretch_ms = stretch_ms;
        self.stats.diffuse_ms = diffuse.elapsed_ms();
        self.stats.advect_ms = advect.elapsed_ms();
        debug!(
            "step {}: rebuild {:.3} ms, diffuse {:.3} ms, advect {:.3} ms",
            self.stats.steps, rebuild_ms, self.stats.diffuse_ms, self.stats.advect_ms
        );
        Ok(())
    }

    /// Advect tracers through the most recent spatial index, building one
    /// first if no step has run yet. Each live tracer moves by
    /// `min(elapsed, timestep)`.
    pub fn advect_tracers(&mut self, tracers: &mut [Tracer], elapsed: f64) -> FluidResult<PhaseReport> {
        if self.tree.is_none() {
            self.rebuild_tree();
        }
        let Some(tree) = self.tree.as_ref() else {
            return Err(FluidError::TreeNotBuilt);
        };
        let report = run_tracer_phase(
            &mut self.tracer_group,
            tree,
            None,
            tracers,
            elapsed,
            self.config.timestep,
        )?;
        self.stats.tracer_ms = report.elapsed_ms();
        Ok(report)
    }

    /// Field velocity at `position` from the current spatial index.
    pub fn velocity_at(&self, position: &Vec3) -> FluidResult<Vec3> {
        let tree = self.tree.as_ref().ok_or(FluidError::TreeNotBuilt)?;
        let mut influences = Vec::new();
        tree.query_influences(position, None, &mut influences);
        Ok(physics::velocity_at(position, &influences))
    }

    /// Deep copy of the current spatial index, independent of later steps.
    pub fn snapshot(&self) -> FluidResult<Octree> {
        self.tree.clone().ok_or(FluidError::TreeNotBuilt)
    }

    pub fn trace_vortons(&self, out: &mut Vec<Vec3>) {
        out.clear();
        out.extend_from_slice(self.buffers.positions());
    }
}

impl TracerField for VortonSpace {
    fn step_simulation(&mut self, elapsed: f64) -> FluidResult<bool> {
        VortonSpace::step_simulation(self, elapsed)
    }

    fn advect_tracers(&mut self, tracers: &mut [Tracer], elapsed: f64) -> FluidResult<PhaseReport> {
        VortonSpace::advect_tracers(self, tracers, elapsed)
    }

    fn trace_vortons(&self, out: &mut Vec<Vec3>) {
        VortonSpace::trace_vortons(self, out)
    }
}
