//! Octree spatial index over vortons.
//!
//! Space is recursively split into eight octants. Every node keeps a running
//! aggregate of the vortons that passed through it on insertion; after
//! [`Octree::finalize_aggregates`] that aggregate is a "super-vorton" (total
//! vorticity at the vorticity-weighted centroid) standing in for the whole
//! subtree when the field is sampled far away.
//!
//! Nodes live in a flat arena addressed by [`NodeId`]. Rebuilding for the
//! next step reforms the existing nodes in place (new bounds, zeroed
//! aggregates, cleared leaf lists) instead of reallocating them, so the cost
//! of a rebuild follows the vorton count rather than the tree size. A bucket
//! tree drops back to a single root leaf and regrows its splits inside the
//! arena's existing capacity.

use crate::config::{SplitPolicy, TreeConfig};
use crate::error::{FluidError, FluidResult};
use crate::vorton::{Vec3, Vorton};
use serde::{Deserialize, Serialize};

pub type NodeId = usize;

pub const ROOT: NodeId = 0;

// MARK: Node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeContents {
    /// Handles of the vortons stored in this cell.
    Leaf(Vec<usize>),
    /// Children indexed by octant, see [`OctreeNode::octant`].
    Internal([NodeId; 8]),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Aggregate {
    vorticity: Vec3,
    weighted_position: Vec3,
    weight: f64,
    position_sum: Vec3,
    count: usize,
    centroid: Vec3,
}

impl Aggregate {
    fn accumulate(&mut self, vorton: &Vorton) {
        let weight = vorton.vorticity.norm();
        self.vorticity += vorton.vorticity;
        self.weighted_position += vorton.position * weight;
        self.weight += weight;
        self.position_sum += vorton.position;
        self.count += 1;
    }

    fn finalize(&mut self, fallback: Vec3) {
        self.centroid = if self.weight > f64::EPSILON {
            self.weighted_position / self.weight
        } else if self.count > 0 {
            self.position_sum / self.count as f64
        } else {
            fallback
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OctreeNode {
    pub min: Vec3,
    pub max: Vec3,
    pub level: u32,
    pub contents: NodeContents,
    aggregate: Aggregate,
}

impl OctreeNode {
    fn new(min: Vec3, max: Vec3, level: u32) -> Self {
        OctreeNode {
            min,
            max,
            level,
            contents: NodeContents::Leaf(Vec::new()),
            aggregate: Aggregate::default(),
        }
    }

    pub fn split_point(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Inclusive containment test against the cell bounds.
    pub fn contains(&self, position: &Vec3) -> bool {
        (0..3).all(|axis| position[axis] >= self.min[axis] && position[axis] <= self.max[axis])
    }

    pub fn intersects_sphere(&self, center: &Vec3, radius: f64) -> bool {
        let closest = center.sup(&self.min).inf(&self.max);
        (closest - center).norm_squared() <= radius * radius
    }

    /// Octant of `position` relative to the split point: bit 0 is set for
    /// the high half on x, bit 1 on y, bit 2 on z.
    pub fn octant(&self, position: &Vec3) -> usize {
        let split = self.split_point();
        let mut index = 0;
        for axis in 0..3 {
            if position[axis] > split[axis] {
                index |= 1 << axis;
            }
        }
        index
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.contents, NodeContents::Leaf(_))
    }

    /// Vorton handles stored here. Empty for internal nodes.
    pub fn items(&self) -> &[usize] {
        match &self.contents {
            NodeContents::Leaf(items) => items,
            NodeContents::Internal(_) => &[],
        }
    }

    pub fn children(&self) -> Option<&[NodeId; 8]> {
        match &self.contents {
            NodeContents::Internal(children) => Some(children),
            NodeContents::Leaf(_) => None,
        }
    }

    /// Number of vortons inserted through this node.
    pub fn vorton_count(&self) -> usize {
        self.aggregate.count
    }

    /// Aggregate vorticity and centroid of every vorton below this node.
    /// The position is only meaningful after aggregation is finalized.
    pub fn super_vorton(&self) -> Vorton {
        Vorton::new(self.aggregate.centroid, self.aggregate.vorticity)
    }

    fn reset(&mut self) {
        self.aggregate = Aggregate::default();
        if let NodeContents::Leaf(items) = &mut self.contents {
            items.clear();
        }
    }
}

fn octant_bounds(min: &Vec3, max: &Vec3, split: &Vec3, octant: usize) -> (Vec3, Vec3) {
    let mut lo = *min;
    let mut hi = *split;
    for axis in 0..3 {
        if octant & (1 << axis) != 0 {
            lo[axis] = split[axis];
            hi[axis] = max[axis];
        }
    }
    (lo, hi)
}

/// Axis-aligned bounds of every finite position. Returns a zero box when
/// there is nothing to bound.
pub fn bounds_of(positions: &[Vec3]) -> (Vec3, Vec3) {
    let mut min = Vec3::repeat(f64::INFINITY);
    let mut max = Vec3::repeat(f64::NEG_INFINITY);
    for position in positions.iter().filter(|p| p.iter().all(|c| c.is_finite())) {
        min = min.inf(position);
        max = max.sup(position);
    }
    if min.x > max.x {
        (Vec3::zeros(), Vec3::zeros())
    } else {
        (min, max)
    }
}

// MARK: Tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Octree {
    config: TreeConfig,
    nodes: Vec<OctreeNode>,
    /// Copy of every inserted vorton; a handle is an index into this list.
    vortons: Vec<Vorton>,
    leaf_of: Vec<NodeId>,
    allocated_depth: Option<u32>,
    finalized: bool,
}

impl Octree {
    pub fn new(config: TreeConfig) -> Self {
        Octree {
            config,
            nodes: vec![OctreeNode::new(Vec3::zeros(), Vec3::zeros(), 0)],
            vortons: Vec::new(),
            leaf_of: Vec::new(),
            allocated_depth: None,
            finalized: false,
        }
    }

    /// Build a finalized tree over the given vortons in one call.
    pub fn from_vortons(config: TreeConfig, vortons: &[Vorton]) -> Self {
        let mut tree = Octree::new(config);
        let positions: Vec<Vec3> = vortons.iter().map(|v| v.position).collect();
        let (min, max) = bounds_of(&positions);
        tree.reform(min, max);
        for vorton in vortons {
            tree.insert(*vorton);
        }
        tree.finalize_aggregates();
        tree
    }

    /// Reform the tree around the current vorton state, insert every vorton
    /// (handle `i` is vorton `i`) and finalize the aggregates.
    pub fn rebuild(&mut self, positions: &[Vec3], vorticities: &[Vec3]) {
        let (min, max) = bounds_of(positions);
        self.reform(min, max);
        for (position, vorticity) in positions.iter().zip(vorticities) {
            self.insert(Vorton::new(*position, *vorticity));
        }
        self.finalize_aggregates();
    }

    /// Reset the tree to cover `[min, max]` with no vortons, reusing the
    /// existing nodes. A fixed-depth tree allocates its full topology the
    /// first time (or when the depth changes) and afterwards only moves its
    /// cell bounds; a bucket tree is cut back to an empty root leaf.
    pub fn reform(&mut self, min: Vec3, max: Vec3) {
        self.vortons.clear();
        self.leaf_of.clear();
        self.finalized = false;

        match self.config.split {
            SplitPolicy::FixedDepth { depth } if self.allocated_depth != Some(depth) => {
                self.split_to(min, max, depth);
                return;
            }
            SplitPolicy::FixedDepth { .. } => {}
            SplitPolicy::Bucket { .. } => {
                // truncate keeps the arena's capacity for the next regrowth
                self.nodes.truncate(1);
                if self.nodes.is_empty() {
                    self.nodes.push(OctreeNode::new(min, max, 0));
                }
                let root = &mut self.nodes[ROOT];
                root.min = min;
                root.max = max;
                root.level = 0;
                if !root.is_leaf() {
                    root.contents = NodeContents::Leaf(Vec::new());
                }
                root.reset();
                return;
            }
        }

        self.nodes[ROOT].min = min;
        self.nodes[ROOT].max = max;
        // children are always stored after their parent
        for id in 0..self.nodes.len() {
            self.nodes[id].reset();
            let node = &self.nodes[id];
            if let NodeContents::Internal(children) = &node.contents {
                let children = *children;
                let (node_min, node_max) = (node.min, node.max);
                let split = node.split_point();
                for (octant, child) in children.into_iter().enumerate() {
                    let (lo, hi) = octant_bounds(&node_min, &node_max, &split, octant);
                    self.nodes[child].min = lo;
                    self.nodes[child].max = hi;
                }
            }
        }
    }

    /// Allocate a complete tree of `depth` levels below the root.
    fn split_to(&mut self, min: Vec3, max: Vec3, depth: u32) {
        self.nodes.clear();
        self.nodes.push(OctreeNode::new(min, max, 0));
        let mut id = 0;
        while id < self.nodes.len() {
            if self.nodes[id].level < depth {
                self.subdivide(id);
            }
            id += 1;
        }
        self.allocated_depth = Some(depth);
    }

    /// Turn leaf `id` into an internal node with eight fresh children and
    /// hand back the handles it held.
    fn subdivide(&mut self, id: NodeId) -> Vec<usize> {
        let (min, max, level) = (self.nodes[id].min, self.nodes[id].max, self.nodes[id].level);
        let split = self.nodes[id].split_point();
        let mut children = [0; 8];
        for (octant, child) in children.iter_mut().enumerate() {
            let (lo, hi) = octant_bounds(&min, &max, &split, octant);
            *child = self.nodes.len();
            self.nodes.push(OctreeNode::new(lo, hi, level + 1));
        }
        match std::mem::replace(&mut self.nodes[id].contents, NodeContents::Internal(children)) {
            NodeContents::Leaf(items) => items,
            NodeContents::Internal(_) => Vec::new(),
        }
    }

    /// Insert a vorton and return its handle. Every node on the way down
    /// accumulates it into its aggregate. Single-threaded by construction:
    /// it needs `&mut self`.
    pub fn insert(&mut self, vorton: Vorton) -> usize {
        let handle = self.vortons.len();
        self.vortons.push(vorton);
        self.leaf_of.push(ROOT);
        self.finalized = false;
        self.insert_from(ROOT, handle);
        handle
    }

    fn insert_from(&mut self, start: NodeId, handle: usize) {
        let vorton = self.vortons[handle];
        let mut id = start;
        loop {
            let octant = self.nodes[id].octant(&vorton.position);
            let node = &mut self.nodes[id];
            node.aggregate.accumulate(&vorton);
            match &mut node.contents {
                NodeContents::Internal(children) => id = children[octant],
                NodeContents::Leaf(items) => {
                    items.push(handle);
                    break;
                }
            }
        }
        self.leaf_of[handle] = id;

        if let SplitPolicy::Bucket { load, max_depth } = self.config.split {
            let leaf = &self.nodes[id];
            if leaf.items().len() > load && leaf.level < max_depth {
                self.split_bucket(id);
            }
        }
    }

    /// Split an overfull bucket leaf. Its items move to the new children;
    /// the node's own aggregate already counts them and is left alone.
    fn split_bucket(&mut self, id: NodeId) {
        let items = self.subdivide(id);
        for handle in items {
            let octant = self.nodes[id].octant(&self.vortons[handle].position);
            if let NodeContents::Internal(children) = &self.nodes[id].contents {
                let child = children[octant];
                self.insert_from(child, handle);
            }
        }
    }

    /// Turn the summed positions into centroids. Must run after the last
    /// insertion and before any query.
    pub fn finalize_aggregates(&mut self) {
        // reverse arena order visits children before their parents
        for node in self.nodes.iter_mut().rev() {
            let middle = node.split_point();
            node.aggregate.finalize(middle);
        }
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Check the arena links of a tree that did not come from this process,
    /// such as a deserialized snapshot. Queries index the arena directly and
    /// would panic on a dangling child or handle.
    pub fn validate(&self) -> FluidResult<()> {
        if self.nodes.is_empty() {
            return Err(FluidError::invalid("octree has no root node"));
        }
        if self.leaf_of.len() != self.vortons.len() {
            return Err(FluidError::LengthMismatch {
                name: "leaf_of",
                expected: self.vortons.len(),
                actual: self.leaf_of.len(),
            });
        }
        for (id, node) in self.nodes.iter().enumerate() {
            match &node.contents {
                NodeContents::Internal(children) => {
                    // children after their parent also rules out cycles
                    if let Some(&child) = children.iter().find(|&&c| c <= id || c >= self.nodes.len()) {
                        return Err(FluidError::invalid(format!(
                            "octree node {} has invalid child {}",
                            id, child
                        )));
                    }
                }
                NodeContents::Leaf(items) => {
                    if let Some(&handle) = items.iter().find(|&&h| h >= self.vortons.len()) {
                        return Err(FluidError::invalid(format!(
                            "octree leaf {} holds unknown vorton {}",
                            id, handle
                        )));
                    }
                }
            }
        }
        if let Some(handle) = self.leaf_of.iter().position(|&leaf| {
            self.nodes.get(leaf).is_none_or(|node| !node.is_leaf())
        }) {
            return Err(FluidError::invalid(format!(
                "vorton {} points at a node that is not a leaf",
                handle
            )));
        }
        Ok(())
    }

    // MARK: Queries
    /// Collect the vortons (elementary and aggregated) that contribute to
    /// the velocity at `position`. Cells that do not contain the position
    /// contribute their super-vorton, unless its vorticity is zero. Cells
    /// that do are opened down to their leaves, whose vortons are copied
    /// in order. `exclude` drops one elementary vorton, so a vorton never
    /// sees its own singular self-term.
    ///
    /// Takes `&self` only; any number of threads may query a finalized tree.
    pub fn query_influences(&self, position: &Vec3, exclude: Option<usize>, out: &mut Vec<Vorton>) {
        self.query_within(position, 0.0, exclude, out);
    }

    /// Like [`Octree::query_influences`], but a cell is opened whenever it
    /// intersects the sphere of `radius` around `position`.
    pub fn query_within(
        &self,
        position: &Vec3,
        radius: f64,
        exclude: Option<usize>,
        out: &mut Vec<Vorton>,
    ) {
        debug_assert!(self.finalized, "octree queried before finalize_aggregates");
        self.gather(ROOT, position, radius, exclude, out);
    }

    fn gather(
        &self,
        id: NodeId,
        position: &Vec3,
        radius: f64,
        exclude: Option<usize>,
        out: &mut Vec<Vorton>,
    ) {
        let node = &self.nodes[id];
        if node.aggregate.count == 0 {
            return;
        }

        let near = if radius > 0.0 {
            node.intersects_sphere(position, radius)
        } else {
            node.contains(position)
        };

        if !near && !self.should_open(node, position) {
            if node.aggregate.vorticity != Vec3::zeros() {
                out.push(node.super_vorton());
            }
            return;
        }

        match &node.contents {
            NodeContents::Leaf(items) => out.extend(
                items
                    .iter()
                    .filter(|&&handle| Some(handle) != exclude)
                    .map(|&handle| self.vortons[handle]),
            ),
            NodeContents::Internal(children) => {
                for &child in children {
                    self.gather(child, position, radius, exclude, out);
                }
            }
        }
    }

    /// Barnes-Hut acceptance test for a cell that does not contain the
    /// query point.
    fn should_open(&self, node: &OctreeNode, position: &Vec3) -> bool {
        let Some(theta) = self.config.opening_angle else {
            return false;
        };
        let size = (node.max - node.min).norm();
        let distance = (node.aggregate.centroid - position).norm();
        distance <= f64::EPSILON || size / distance >= theta
    }

    /// Handles of every vorton in the leaf cell(s) containing `position`.
    pub fn query_cell_neighbors(&self, position: &Vec3, out: &mut Vec<usize>) {
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if !node.contains(position) {
                continue;
            }
            match &node.contents {
                NodeContents::Leaf(items) => out.extend_from_slice(items),
                NodeContents::Internal(children) => stack.extend(children.iter().rev()),
            }
        }
    }

    // MARK: Accessors
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn root(&self) -> &OctreeNode {
        &self.nodes[ROOT]
    }

    pub fn node(&self, id: NodeId) -> &OctreeNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    /// Number of vortons inserted since the last reform.
    pub fn n_vortons(&self) -> usize {
        self.vortons.len()
    }

    pub fn vorton(&self, handle: usize) -> &Vorton {
        &self.vortons[handle]
    }

    /// Every inserted vorton, in handle order.
    pub fn vortons(&self) -> &[Vorton] {
        &self.vortons
    }

    /// Leaf that stores the vorton with this handle.
    pub fn leaf_of(&self, handle: usize) -> NodeId {
        self.leaf_of[handle]
    }

    /// Leaves holding at least one vorton, in pre-order.
    pub fn leaves(&self) -> Vec<NodeId> {
        self.pre_order()
            .into_iter()
            .filter(|&id| !self.nodes[id].items().is_empty())
            .collect()
    }

    /// Elementary vortons gathered leaf by leaf in pre-order.
    pub fn vortons_in_tree(&self) -> Vec<Vorton> {
        self.leaves()
            .into_iter()
            .flat_map(move |id| self.nodes[id].items().iter().map(move |&handle| self.vortons[handle]))
            .collect()
    }

    pub fn pre_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![ROOT];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let NodeContents::Internal(children) = &self.nodes[id].contents {
                stack.extend(children.iter().rev());
            }
        }
        order
    }
}
