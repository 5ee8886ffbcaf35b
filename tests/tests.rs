use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use vorton_space::octree::NodeContents;
use vorton_space::physics::{self, DT};
use vorton_space::snapshot::{FrozenField, load_snapshot, save_snapshot};
use vorton_space::{
    FluidError, KernelGroup, Octree, SimulationConfig, Tracer, TracerField, TreeConfig, Vec3, Vorton,
    VortonSpace, WorkerPool, divide_work,
};

/// Isolated pool for one test
pub fn pool(workers: usize) -> Arc<WorkerPool> {
    Arc::new(WorkerPool::with_workers(workers).unwrap())
}

/// Random vortons in the unit cube with vorticity components in [-1, 1)
pub fn random_vortons(n: usize, seed: u64) -> Vec<Vorton> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Vorton::new(
                Vec3::new(rng.random(), rng.random(), rng.random()),
                Vec3::new(
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                ),
            )
        })
        .collect()
}

/// Seeded simulation of `n` randomized vortons
pub fn random_space(n: usize, workers: usize, seed: u64) -> VortonSpace {
    let mut space = VortonSpace::create(n, 0.5, 3, pool(workers)).unwrap();
    space.randomize_vortons_with(&mut StdRng::seed_from_u64(seed), 0.5);
    space
}

/// Frame time that always carries the accumulator past one timestep
const FRAME: f64 = DT * 1.5;

fn assert_close(a: &Vec3, b: &Vec3, tol: f64) {
    assert!((a - b).norm() <= tol, "{:?} != {:?} (tol {})", a, b, tol);
}

// ==================================================================================
// Work partitioning
// ==================================================================================

#[test]
fn partition_is_exact_for_random_sizes() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..200 {
        let n = rng.random_range(0..5000);
        let w = rng.random_range(1..33);
        let ranges = divide_work(n, w);

        let mut covered = vec![0u8; n];
        for range in &ranges {
            assert!(range.first <= range.last);
            for i in range.indices() {
                covered[i] += 1;
            }
        }
        assert!(covered.iter().all(|&c| c == 1), "n = {}, w = {}", n, w);
        if n == 0 {
            assert!(ranges.is_empty());
        }
    }
}

#[test]
fn fewer_items_than_workers_gives_single_item_ranges() {
    let ranges = divide_work(3, 8);
    assert_eq!(ranges.len(), 3);
    assert!(ranges.iter().all(|r| r.len() == 1));
}

// ==================================================================================
// Octree invariants
// ==================================================================================

#[test]
fn root_vorticity_equals_sum_of_vortons() {
    let vortons = random_vortons(500, 1);
    let total: Vec3 = vortons.iter().map(|v| v.vorticity).sum();

    for config in [TreeConfig::fixed_depth(4), TreeConfig::bucket(8, 10)] {
        let tree = Octree::from_vortons(config, &vortons);
        assert_close(&tree.root().super_vorton().vorticity, &total, 1e-9);
    }
}

#[test]
fn parent_vorticity_equals_sum_of_children() {
    let tree = Octree::from_vortons(TreeConfig::bucket(4, 8), &random_vortons(300, 2));
    for node in tree.nodes() {
        if let NodeContents::Internal(children) = &node.contents {
            let sum: Vec3 = children.iter().map(|&c| tree.node(c).super_vorton().vorticity).sum();
            assert_close(&node.super_vorton().vorticity, &sum, 1e-9);
        }
    }
}

#[test]
fn leaves_contain_their_vortons_and_parents_contain_children() {
    let vortons = random_vortons(400, 3);
    for config in [TreeConfig::fixed_depth(3), TreeConfig::bucket(6, 10)] {
        let tree = Octree::from_vortons(config, &vortons);
        for (handle, vorton) in vortons.iter().enumerate() {
            let leaf = tree.node(tree.leaf_of(handle));
            assert!(leaf.contains(&vorton.position));
            assert!(leaf.items().contains(&handle));
        }
        for node in tree.nodes() {
            if let Some(children) = node.children() {
                for &c in children {
                    let child = tree.node(c);
                    assert!(node.contains(&child.min) && node.contains(&child.max));
                }
            }
        }
    }
}

#[test]
fn every_vorton_is_stored_in_exactly_one_leaf() {
    let tree = Octree::from_vortons(TreeConfig::bucket(5, 10), &random_vortons(250, 4));
    let mut seen = vec![0; 250];
    for id in tree.leaves() {
        for &handle in tree.node(id).items() {
            seen[handle] += 1;
        }
    }
    assert!(seen.iter().all(|&count| count == 1));
    assert_eq!(tree.vortons_in_tree().len(), 250);
}

#[test]
fn influences_never_include_the_excluded_vorton() {
    let vortons = random_vortons(300, 5);
    let tree = Octree::from_vortons(TreeConfig::fixed_depth(3), &vortons);
    let mut influences = Vec::new();
    for (i, vorton) in vortons.iter().enumerate() {
        influences.clear();
        tree.query_influences(&vorton.position, Some(i), &mut influences);
        assert!(!influences.contains(vorton), "vorton {} sees itself", i);
    }
}

#[test]
fn large_radius_query_returns_every_elementary_vorton() {
    let vortons = random_vortons(200, 6);
    let tree = Octree::from_vortons(TreeConfig::fixed_depth(3), &vortons);
    let mut influences = Vec::new();
    tree.query_within(&Vec3::repeat(0.5), 10.0, None, &mut influences);
    assert_eq!(influences.len(), 200);
}

#[test]
fn far_query_uses_fewer_influences_than_vortons() {
    let vortons = random_vortons(1000, 7);
    let tree = Octree::from_vortons(TreeConfig::fixed_depth(4), &vortons);
    let mut influences = Vec::new();
    tree.query_influences(&Vec3::repeat(0.5), None, &mut influences);
    assert!(influences.len() < vortons.len());

    // outside the root cell the whole tree collapses to one super-vorton
    influences.clear();
    tree.query_influences(&Vec3::repeat(4.0), None, &mut influences);
    assert_eq!(influences, vec![tree.root().super_vorton()]);
}

// ==================================================================================
// Concrete scenarios
// ==================================================================================

#[test]
fn single_vorton_follows_right_hand_rule() {
    let vorton = Vorton::new(Vec3::zeros(), Vec3::new(0.0, 1.0, 0.0));
    let tree = Octree::from_vortons(TreeConfig::fixed_depth(2), &[vorton]);
    let query = Vec3::new(0.0, 0.0, 1.0);

    let mut influences = Vec::new();
    tree.query_influences(&query, None, &mut influences);
    let velocity = physics::velocity_at(&query, &influences);

    let expected = vorton.vorticity.cross(&(query - vorton.position));
    assert!(velocity.norm() > 0.0);
    assert!(velocity.normalize().dot(&expected.normalize()) > 1.0 - 1e-12);
    assert!(velocity.x > 0.0);
}

#[test]
fn opposite_vortons_cancel_in_far_field() {
    let vortons = [
        Vorton::new(Vec3::repeat(0.25), Vec3::new(1.0, 2.0, 3.0)),
        Vorton::new(Vec3::repeat(0.25), Vec3::new(-1.0, -2.0, -3.0)),
    ];
    let tree = Octree::from_vortons(TreeConfig::fixed_depth(3), &vortons);
    assert_eq!(tree.root().super_vorton().vorticity, Vec3::zeros());

    let mut influences = Vec::new();
    tree.query_influences(&Vec3::new(5.0, 5.0, 5.0), None, &mut influences);
    assert!(influences.is_empty());
}

#[test]
fn grid_of_1000_fills_only_occupied_leaves() {
    let mut space = VortonSpace::create(1000, 0.5, 4, pool(2)).unwrap();
    space.distribute_vortons_uniform_grid(&Vec3::zeros(), &Vec3::repeat(1.0), 0.0);
    space.rebuild_tree();

    let tree = space.tree().unwrap();
    let leaves = tree.leaves();
    assert!(!leaves.is_empty());
    assert!(leaves.iter().all(|&id| !tree.node(id).items().is_empty()));
    let stored: usize = leaves.iter().map(|&id| tree.node(id).items().len()).sum();
    assert_eq!(stored, 1000);
}

#[test]
fn tracer_on_top_of_a_vorton_stays_finite() {
    let mut space = random_space(64, 2, 8);
    let target = space.vorton(10).position;
    let mut tracers = vec![Tracer::new(target, 0.1, 5.0)];

    space.advect_tracers(&mut tracers, DT).unwrap();
    assert!(tracers[0].position.iter().all(|c| c.is_finite()));
    assert!(tracers[0].velocity.iter().all(|c| c.is_finite()));

    let velocity = space.velocity_at(&target).unwrap();
    assert!(velocity.iter().all(|c| c.is_finite()));
}

// ==================================================================================
// Simulation stepping
// ==================================================================================

#[test]
fn identical_inputs_give_identical_steps() {
    let mut a = random_space(200, 3, 9);
    let mut b = random_space(200, 3, 9);
    for _ in 0..2 {
        assert!(a.step_simulation(FRAME).unwrap());
        assert!(b.step_simulation(FRAME).unwrap());
    }
    assert_eq!(a.positions(), b.positions());
    assert_eq!(a.vorticities(), b.vorticities());
}

#[test]
fn worker_count_does_not_change_results() {
    let mut a = random_space(150, 1, 10);
    let mut b = random_space(150, 4, 10);
    a.step_simulation(FRAME).unwrap();
    b.step_simulation(FRAME).unwrap();
    assert_eq!(a.positions(), b.positions());
}

#[test]
fn step_moves_vortons_and_diffuses_vorticity() {
    let mut space = random_space(125, 2, 12);
    let before = space.vortons();
    assert!(space.step_simulation(FRAME).unwrap());
    let after = space.vortons();

    assert!(before.iter().zip(&after).any(|(b, a)| b.position != a.position));
    let spread = |vs: &[Vorton]| {
        let mean: Vec3 = vs.iter().map(|v| v.vorticity).sum::<Vec3>() / vs.len() as f64;
        vs.iter().map(|v| (v.vorticity - mean).norm_squared()).sum::<f64>()
    };
    assert!(spread(&after) < spread(&before));
}

#[test]
fn fixed_depth_tree_is_reused_between_steps() {
    let mut space = random_space(100, 2, 13);
    space.step_simulation(FRAME).unwrap();
    let nodes = space.tree().unwrap().nodes().len();
    for _ in 0..3 {
        space.step_simulation(FRAME).unwrap();
    }
    assert_eq!(space.tree().unwrap().nodes().len(), nodes);
    assert_eq!(space.stats().steps, 4);
}

#[test]
fn bucket_tree_simulation_steps() {
    let mut config = SimulationConfig::new(200, 0.5, 4);
    config.tree = TreeConfig::bucket(16, 8).with_opening_angle(0.7);
    let mut space = VortonSpace::new(config, pool(2)).unwrap();
    space.randomize_vortons_with(&mut StdRng::seed_from_u64(14), 0.5);
    for _ in 0..3 {
        assert!(space.step_simulation(FRAME).unwrap());
    }
    assert!(space.positions().iter().all(|p| p.iter().all(|c| c.is_finite())));
}

#[test]
fn empty_simulation_steps_without_work() {
    let mut space = VortonSpace::create(0, 0.5, 2, pool(2)).unwrap();
    assert!(space.step_simulation(FRAME).unwrap());
    let mut tracers = Vec::new();
    let report = space.advect_tracers(&mut tracers, DT).unwrap();
    assert_eq!(report.ranges, 0);
}

#[test]
fn invalid_config_is_rejected() {
    let result = VortonSpace::create(10, f64::NAN, 3, pool(1));
    assert!(matches!(result, Err(FluidError::InvalidConfig(_))));
}

// ==================================================================================
// Shutdown and aborted phases
// ==================================================================================

#[test]
fn stepping_on_a_stopped_pool_keeps_state() {
    let workers = pool(2);
    let mut space = VortonSpace::create(64, 0.5, 3, Arc::clone(&workers)).unwrap();
    space.randomize_vortons_with(&mut StdRng::seed_from_u64(15), 0.5);
    let before = space.vortons();

    workers.shutdown();
    let result = space.step_simulation(FRAME);
    assert!(matches!(result, Err(FluidError::PoolShutDown { .. })));
    assert_eq!(space.vortons(), before);
    assert_eq!(space.stats().steps, 0);
}

#[test]
fn shutdown_mid_phase_skips_remaining_ranges() {
    let workers = pool(1);
    let mut group = KernelGroup::new(Arc::clone(&workers), "abort", || ()).with_range_count(4);
    let mut out = vec![0u32; 40];
    let stopper = Arc::clone(&workers);

    let result = group.run(&mut out, &(), |mut task, _| {
        stopper.shutdown();
        for (_, slot) in task.iter_mut() {
            *slot = 1;
        }
    });

    match result {
        Err(FluidError::PhaseAborted { skipped, total, .. }) => {
            assert_eq!(total, 4);
            assert_eq!(skipped, 3);
        }
        other => panic!("expected an aborted phase, got {:?}", other),
    }
    assert_eq!(out.iter().filter(|&&v| v == 1).count(), 10);
}

// ==================================================================================
// Tracers
// ==================================================================================

#[test]
fn tracer_advection_builds_the_tree_lazily() {
    let mut space = random_space(64, 2, 16);
    assert!(space.tree().is_none());
    let mut tracers = vec![Tracer::new(Vec3::repeat(0.5), 0.2, 5.0)];
    space.advect_tracers(&mut tracers, DT).unwrap();
    assert!(space.tree().is_some());
    assert!((tracers[0].age - DT).abs() < 1e-12);
}

#[test]
fn expired_tracers_do_not_move() {
    let mut space = random_space(64, 2, 17);
    let mut tracers = vec![Tracer::new(Vec3::repeat(0.5), 0.2, 1.0); 2];
    tracers[1].age = 2.0;
    space.advect_tracers(&mut tracers, 0.5).unwrap();
    assert_eq!(tracers[1].position, Vec3::repeat(0.5));
    assert_eq!(tracers[1].age, 2.0);
    assert!((tracers[0].age - DT).abs() < 1e-12);
}

// ==================================================================================
// Snapshots and frozen playback
// ==================================================================================

#[test]
fn snapshot_is_independent_of_later_steps() {
    let mut space = random_space(80, 2, 18);
    space.step_simulation(FRAME).unwrap();
    let snapshot = space.snapshot().unwrap();
    let frozen_positions: Vec<Vec3> = snapshot.vortons().iter().map(|v| v.position).collect();

    space.step_simulation(FRAME).unwrap();
    space.step_simulation(FRAME).unwrap();

    let still: Vec<Vec3> = snapshot.vortons().iter().map(|v| v.position).collect();
    assert_eq!(frozen_positions, still);
    assert_ne!(space.tree().unwrap().vortons()[0].position, still[0]);
}

#[test]
fn snapshot_before_any_tree_is_an_error() {
    let space = random_space(8, 1, 19);
    assert!(matches!(space.snapshot(), Err(FluidError::TreeNotBuilt)));
}

#[test]
fn snapshot_survives_a_json_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");

    let mut space = random_space(100, 2, 20);
    space.step_simulation(FRAME).unwrap();
    let snapshot = space.snapshot().unwrap();
    save_snapshot(&snapshot, &path).unwrap();

    let loaded = load_snapshot(&path).unwrap();
    assert_eq!(loaded.nodes().len(), snapshot.nodes().len());
    assert_eq!(loaded.n_vortons(), snapshot.n_vortons());
    for (a, b) in loaded.vortons().iter().zip(snapshot.vortons()) {
        assert_close(&a.position, &b.position, 1e-12);
        assert_close(&a.vorticity, &b.vorticity, 1e-12);
    }
    for (a, b) in loaded.nodes().iter().zip(snapshot.nodes()) {
        assert_eq!(a.items(), b.items());
        assert_close(&a.super_vorton().vorticity, &b.super_vorton().vorticity, 1e-12);
    }
}

#[test]
fn corrupt_snapshot_is_rejected_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");

    let mut space = random_space(100, 2, 23);
    space.step_simulation(FRAME).unwrap();
    save_snapshot(&space.snapshot().unwrap(), &path).unwrap();

    let mut json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    json["nodes"][0]["contents"]["Internal"][3] = serde_json::json!(999);
    std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();

    assert!(matches!(load_snapshot(&path), Err(FluidError::InvalidConfig(_))));
    assert!(FrozenField::from_file(&path, pool(1)).is_err());
}

#[test]
fn frozen_field_caps_moves_at_its_timestep() {
    let mut space = random_space(64, 2, 24);
    space.step_simulation(FRAME).unwrap();
    let mut frozen = FrozenField::new(space.snapshot().unwrap(), pool(1))
        .unwrap()
        .with_timestep(0.1)
        .unwrap();

    let mut tracers = vec![Tracer::new(Vec3::repeat(0.5), 0.15, 10.0)];
    frozen.advect_tracers(&mut tracers, 0.05).unwrap();
    assert!((tracers[0].age - 0.05).abs() < 1e-12);
    frozen.advect_tracers(&mut tracers, 1.0).unwrap();
    assert!((tracers[0].age - 0.15).abs() < 1e-12);

    assert!(FrozenField::new(space.snapshot().unwrap(), pool(1)).unwrap().with_timestep(0.0).is_err());
}

#[test]
fn frozen_field_matches_live_tracer_advection() {
    let mut space = random_space(100, 2, 21);
    space.step_simulation(FRAME).unwrap();
    let mut frozen = FrozenField::new(space.snapshot().unwrap(), pool(2)).unwrap();

    let start = Vec3::new(0.4, 0.5, 0.6);
    let mut live = vec![Tracer::new(start, 0.15, 5.0)];
    let mut replay = live.clone();
    space.advect_tracers(&mut live, DT).unwrap();
    frozen.advect_tracers(&mut replay, DT).unwrap();
    assert_close(&live[0].position, &replay[0].position, 1e-12);

    assert!(!frozen.step_simulation(FRAME).unwrap());
}

#[test]
fn frozen_field_follows_its_object_transform() {
    let mut space = random_space(100, 2, 22);
    space.step_simulation(FRAME).unwrap();
    let snapshot = space.snapshot().unwrap();

    let mut still = FrozenField::new(snapshot.clone(), pool(1)).unwrap();
    let mut moved = FrozenField::new(snapshot, pool(1)).unwrap();
    let offset = Vec3::new(3.0, -2.0, 1.0);
    moved.update_transform(nalgebra::Isometry3::translation(offset.x, offset.y, offset.z));

    let start = Vec3::new(0.5, 0.5, 0.5);
    let mut a = vec![Tracer::new(start, 0.15, 5.0)];
    let mut b = vec![Tracer::new(start + offset, 0.15, 5.0)];
    still.advect_tracers(&mut a, DT).unwrap();
    moved.advect_tracers(&mut b, DT).unwrap();
    assert_close(&(b[0].position - offset), &a[0].position, 1e-9);

    let mut traced = Vec::new();
    moved.trace_vortons(&mut traced);
    assert_eq!(traced.len(), moved.n_vortons());
}

#[test]
fn config_round_trips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    let mut config = SimulationConfig::new(343, 0.25, 5);
    config.stretch_tilt = true;
    config.workers = Some(3);
    config.timestep = 0.02;
    config.save_json(&path).unwrap();
    assert_eq!(SimulationConfig::from_json_file(&path).unwrap(), config);
}

#[test]
fn explicit_vorton_state_must_match_pool_size() {
    let mut space = VortonSpace::create(2, 0.5, 2, pool(1)).unwrap();
    let result = space.set_vortons(&[Vorton::default()]);
    assert!(matches!(
        result,
        Err(FluidError::LengthMismatch { expected: 2, actual: 1, .. })
    ));

    let pair = [
        Vorton::new(Vec3::zeros(), Vec3::new(0.0, 1.0, 0.0)),
        Vorton::new(Vec3::new(0.0, 0.0, 1.0), Vec3::zeros()),
    ];
    space.set_vortons(&pair).unwrap();
    space.rebuild_tree();
    // the zero-vorticity vorton is carried along by its neighbour's field
    let velocity = space.velocity_at(&Vec3::new(0.0, 0.0, 1.0)).unwrap();
    assert!(velocity.x > 0.0);
}
