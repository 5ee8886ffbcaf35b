use crate::tracer::Tracer;
use crate::vorton::Vec3;
use serde::{Deserialize, Serialize};

/// External forces acting on tracer inertia
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracerForce {
    /// No external force
    None,

    /// Constant pull of `strength` toward each center, independent of distance
    Gravitational {
        centers: Vec<Vec3>,
        strength: f64,
    },

    /// Same acceleration everywhere (e.g. gravity or buoyancy)
    Uniform {
        acceleration: Vec3,
    },
}

impl TracerForce {
    pub fn gravitational(center: Vec3, strength: f64) -> Self {
        TracerForce::Gravitational {
            centers: vec![center],
            strength,
        }
    }

    /// Acceleration this force applies to a tracer at `position`
    pub fn acceleration_at(&self, position: &Vec3) -> Vec3 {
        match self {
            TracerForce::None => Vec3::zeros(),

            TracerForce::Gravitational { centers, strength } => centers
                .iter()
                .filter_map(|center| (center - position).try_normalize(f64::EPSILON))
                .map(|direction| direction * *strength)
                .sum(),

            TracerForce::Uniform { acceleration } => *acceleration,
        }
    }

    /// Add `dt` worth of this force to the tracer's inertia
    pub fn apply(&self, tracer: &mut Tracer, dt: f64) {
        tracer.inertia += self.acceleration_at(&tracer.position) * dt;
    }
}

/// Apply every force to every live tracer
pub fn apply_forces(forces: &[TracerForce], tracers: &mut [Tracer], dt: f64) {
    for tracer in tracers.iter_mut().filter(|t| t.is_alive()) {
        for force in forces {
            force.apply(tracer, dt);
        }
    }
}
