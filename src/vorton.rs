use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

pub type Vec3 = Vector3<f64>;

// MARK: Vorton
/// A point carrier of vorticity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vorton {
    pub position: Vec3,
    pub vorticity: Vec3,
}

impl Vorton {
    pub fn new(position: Vec3, vorticity: Vec3) -> Self {
        Vorton { position, vorticity }
    }

    pub fn has_vorticity(&self) -> bool {
        self.vorticity != Vec3::zeros()
    }
}

// MARK: Double Buffer
/// Position and vorticity for every vorton in a simulation, stored twice.
///
/// The back buffer is the stable state: kernels read it and the spatial
/// index is built from it. The front buffer receives the results of the
/// phase in progress. `swap` is the only transition between the two and
/// takes `&mut self`, so it can never race with a running phase.
#[derive(Debug, Clone)]
pub struct VortonBuffers {
    positions: [Vec<Vec3>; 2],
    vorticities: [Vec<Vec3>; 2],
    back: usize,
}

/// Stable state and output slots of one phase.
pub struct PhaseBuffers<'a> {
    pub positions: &'a [Vec3],
    pub vorticities: &'a [Vec3],
    pub front_positions: &'a mut [Vec3],
    pub front_vorticities: &'a mut [Vec3],
}

/// Split borrow of a buffer pair: read the back half, write the front half.
fn split_pair(pair: &mut [Vec<Vec3>; 2], back: usize) -> (&[Vec3], &mut [Vec3]) {
    let (lo, hi) = pair.split_at_mut(1);
    if back == 0 {
        (&lo[0], &mut hi[0])
    } else {
        (&hi[0], &mut lo[0])
    }
}

impl VortonBuffers {
    pub fn new(count: usize) -> Self {
        VortonBuffers {
            positions: [vec![Vec3::zeros(); count], vec![Vec3::zeros(); count]],
            vorticities: [vec![Vec3::zeros(); count], vec![Vec3::zeros(); count]],
            back: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.positions[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn front(&self) -> usize {
        1 - self.back
    }

    /// Current stable state of vorton `index`.
    pub fn vorton(&self, index: usize) -> Vorton {
        Vorton::new(
            self.positions[self.back][index],
            self.vorticities[self.back][index],
        )
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions[self.back]
    }

    pub fn vorticities(&self) -> &[Vec3] {
        &self.vorticities[self.back]
    }

    /// Set a vorton in both buffers.
    pub fn initialize(&mut self, index: usize, position: Vec3, vorticity: Vec3) {
        for buffer in 0..2 {
            self.positions[buffer][index] = position;
            self.vorticities[buffer][index] = vorticity;
        }
    }

    /// Add to the stable vorticity of a vorton. Only valid between phases.
    pub fn accumulate_vorticity(&mut self, index: usize, contribution: Vec3) {
        self.vorticities[self.back][index] += contribution;
    }

    /// Borrow the back buffers for reading and the front buffers for
    /// writing, for the duration of one phase.
    pub fn split(&mut self) -> PhaseBuffers<'_> {
        let (positions, front_positions) = split_pair(&mut self.positions, self.back);
        let (vorticities, front_vorticities) = split_pair(&mut self.vorticities, self.back);
        PhaseBuffers {
            positions,
            vorticities,
            front_positions,
            front_vorticities,
        }
    }

    pub fn front_positions(&self) -> &[Vec3] {
        &self.positions[self.front()]
    }

    pub fn front_vorticities(&self) -> &[Vec3] {
        &self.vorticities[self.front()]
    }

    /// Publish the front buffers as the new stable state.
    pub fn swap(&mut self) {
        self.back = self.front();
    }
}
