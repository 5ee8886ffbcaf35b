use crate::vorton::Vec3;
use rand::Rng;
use serde::{Deserialize, Serialize};

// MARK: Tracer
/// A passive particle carried through the vorton field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tracer {
    pub position: Vec3,
    /// Velocity applied on the last advection step.
    pub velocity: Vec3,
    /// Velocity the tracer carries on its own, driven by drag and forces.
    pub inertia: Vec3,
    /// Sampling radius for the influence query, also the drag cross-section.
    pub radius: f64,
    pub drag: f64,
    /// Blend between inertia (0) and fluid velocity (1).
    pub reynolds_ratio: f64,
    pub age: f64,
    pub lifetime: f64,
}

impl Tracer {
    pub fn new(position: Vec3, radius: f64, lifetime: f64) -> Self {
        Tracer {
            position,
            velocity: Vec3::zeros(),
            inertia: Vec3::zeros(),
            radius,
            drag: 1.0,
            reynolds_ratio: 1.0,
            age: 0.0,
            lifetime,
        }
    }

    /// Tracers past their lifetime, or with a negative age, are skipped by
    /// advection until reset.
    pub fn is_alive(&self) -> bool {
        !(self.age > self.lifetime || self.age < 0.0)
    }

    pub fn reset(&mut self, position: Vec3, inertia: Vec3) {
        self.position = position;
        self.inertia = inertia;
        self.velocity = Vec3::zeros();
        self.age = 0.0;
    }
}

/// Uniformly random unit vector.
pub fn random_direction<R: Rng + ?Sized>(rng: &mut R) -> Vec3 {
    loop {
        let candidate = Vec3::new(
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
            rng.random_range(-1.0..1.0),
        );
        let norm_sq = candidate.norm_squared();
        if norm_sq > 1e-12 && norm_sq <= 1.0 {
            return candidate / norm_sq.sqrt();
        }
    }
}

/// Seed `count` tracers at random points inside a sphere.
pub fn scatter_in_sphere<R: Rng + ?Sized>(
    rng: &mut R,
    center: &Vec3,
    radius: f64,
    count: usize,
    tracer_radius: f64,
    lifetime: f64,
) -> Vec<Tracer> {
    (0..count)
        .map(|_| {
            let offset = random_direction(rng) * rng.random_range(0.0..=radius);
            Tracer::new(center + offset, tracer_radius, lifetime)
        })
        .collect()
}
