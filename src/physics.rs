use crate::tracer::Tracer;
use crate::vorton::{Vec3, Vorton};
use nalgebra::Matrix3;
use once_cell::sync::Lazy;
use std::f64::consts::PI;

// Simulation constants
pub const DT: f64 = 1.0 / 60.0; // s, fixed simulation step
pub const VORTON_RADIUS: f64 = 0.1; // core radius of a single vorton
pub const VORTON_RADIUS_SQ: f64 = VORTON_RADIUS * VORTON_RADIUS;
pub const AVOID_SINGULARITY: f64 = 1e-5; // added to every squared distance
pub const JACOBIAN_D: f64 = 0.001; // finite difference step for the velocity gradient

const FOUR_THIRDS_PI_R3: f64 = 4.0 / 3.0 * PI * VORTON_RADIUS * VORTON_RADIUS * VORTON_RADIUS;
const ONE_OVER_4_PI: f64 = 1.0 / (4.0 * PI);

/// Sample offsets for the velocity gradient, as (-x, +x, -y, +y, -z, +z).
pub static JACOBIAN_OFFSETS: Lazy<[Vec3; 6]> = Lazy::new(|| {
    [
        Vec3::new(-JACOBIAN_D, 0.0, 0.0),
        Vec3::new(JACOBIAN_D, 0.0, 0.0),
        Vec3::new(0.0, -JACOBIAN_D, 0.0),
        Vec3::new(0.0, JACOBIAN_D, 0.0),
        Vec3::new(0.0, 0.0, -JACOBIAN_D),
        Vec3::new(0.0, 0.0, JACOBIAN_D),
    ]
});

/// MARK: Biot-Savart
/// Unscaled velocity induced at `position` by one vorton. Inside the core
/// radius the falloff is regularized so coincident points stay finite.
pub fn velocity_contribution(position: &Vec3, vorton: &Vorton) -> Vec3 {
    let d = position - vorton.position;
    let r2 = d.norm_squared() + AVOID_SINGULARITY;
    let one_over_r = 1.0 / r2.sqrt();
    let falloff = if r2 < VORTON_RADIUS_SQ {
        one_over_r / VORTON_RADIUS_SQ
    } else {
        one_over_r / r2
    };
    (vorton.vorticity * FOUR_THIRDS_PI_R3).cross(&d) * falloff
}

/// MARK: Field Velocity
/// Velocity at `position` induced by a list of influences. Contributions
/// are summed in list order.
pub fn velocity_at(position: &Vec3, influences: &[Vorton]) -> Vec3 {
    let mut velocity = Vec3::zeros();
    for vorton in influences {
        velocity += velocity_contribution(position, vorton);
    }
    velocity * ONE_OVER_4_PI
}

/// MARK: Diffusion
/// New vorticity for `vorticities[index]` after exchanging with the rest of
/// its leaf group, damped by `(1 - viscosity * dt)`.
pub fn diffuse_vorton(
    index: usize,
    group: &[usize],
    vorticities: &[Vec3],
    viscosity: f64,
    dt: f64,
) -> Vec3 {
    let own = vorticities[index];
    let mut exchange = Vec3::zeros();
    for &other in group {
        if other == index {
            continue;
        }
        exchange += (vorticities[other] - own) * viscosity;
    }
    (own + exchange * dt) * (1.0 - viscosity * dt)
}

/// MARK: Stretch/Tilt
/// Velocity gradient at `position` by central differences; column `i` is
/// the derivative of the velocity along axis `i`.
pub fn jacobian(position: &Vec3, influences: &[Vorton]) -> Matrix3<f64> {
    let samples: Vec<Vec3> = JACOBIAN_OFFSETS
        .iter()
        .map(|offset| velocity_at(&(position + offset), influences))
        .collect();
    let inv = 1.0 / (2.0 * JACOBIAN_D);
    Matrix3::from_columns(&[
        (samples[1] - samples[0]) * inv,
        (samples[3] - samples[2]) * inv,
        (samples[5] - samples[4]) * inv,
    ])
}

/// Vorticity after one step of stretching and tilting by the local gradient.
pub fn stretch_tilt(vorticity: &Vec3, gradient: &Matrix3<f64>, dt: f64) -> Vec3 {
    vorticity + (gradient * vorticity) * dt
}

/// MARK: Advection
/// Explicit Euler position update.
pub fn advect_position(position: &Vec3, velocity: &Vec3, dt: f64) -> Vec3 {
    position + velocity * dt
}

/// Move a tracer through a fluid moving at `fluid_velocity`.
///
/// Drag pulls the tracer's inertia toward the fluid with a force of
/// `0.5 * |inertia - fluid|² * drag * πr²`. The tracer then moves with a
/// blend of its inertia and the fluid velocity, weighted by its Reynolds
/// ratio. Both the move and the age use `min(elapsed, timestep)`.
pub fn move_tracer(tracer: &mut Tracer, fluid_velocity: &Vec3, elapsed: f64, timestep: f64) {
    let step = elapsed.min(timestep);

    let relative = tracer.inertia - fluid_velocity;
    let force = 0.5
        * relative.norm_squared()
        * tracer.drag
        * (PI * tracer.radius * tracer.radius);
    if let Some(direction) = (-relative).try_normalize(f64::EPSILON) {
        tracer.inertia += direction * (force * step);
    }

    tracer.velocity = tracer.inertia.lerp(fluid_velocity, tracer.reynolds_ratio);
    tracer.position += tracer.velocity * step;
    tracer.age += step;
}
