//! Vortex-particle ("vorton") fluid simulation.
//!
//! Vorticity is carried by point vortons; the velocity they induce is
//! evaluated through an octree of aggregated "super-vortons", and passive
//! tracers are advected through the same field. Each step rebuilds the
//! tree, diffuses vorticity within leaf cells and advects the vortons, with
//! every phase spread over a shared pool of worker threads.

pub mod config;
pub mod error;
pub mod extfields;
pub mod octree;
pub mod physics;
pub mod simulation;
pub mod snapshot;
pub mod threading;
pub mod tracer;
pub mod visualisation;
pub mod vorton;

pub use config::{SimulationConfig, SplitPolicy, TreeConfig};
pub use error::{FluidError, FluidResult};
pub use octree::Octree;
pub use simulation::{SimulationStats, TracerField, VortonSpace};
pub use snapshot::FrozenField;
pub use threading::{KernelGroup, WorkRange, WorkerPool, divide_work};
pub use tracer::Tracer;
pub use vorton::{Vec3, Vorton};
