use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{LevelFilter, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use vorton_space::extfields::{TracerForce, apply_forces};
use vorton_space::physics::DT;
use vorton_space::snapshot::{load_snapshot, save_snapshot};
use vorton_space::tracer::scatter_in_sphere;
use vorton_space::visualisation::{save_statistics, save_tracers_vtk, save_tree_vtk, save_vortons_vtk};
use vorton_space::{
    FluidResult, FrozenField, SimulationConfig, TracerField, TreeConfig, Vec3, VortonSpace, WorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "vorton-space", about = "Vortex particle fluid simulation")]
struct Args {
    /// JSON simulation config; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    vortons: Option<usize>,

    #[arg(long)]
    viscosity: Option<f64>,

    /// Fixed octree depth
    #[arg(long)]
    depth: Option<u32>,

    /// Use an adaptive tree with this bucket load instead of a fixed depth
    #[arg(long)]
    bucket: Option<usize>,

    #[arg(long)]
    opening_angle: Option<f64>,

    #[arg(long)]
    stretch_tilt: bool,

    #[arg(long)]
    workers: Option<usize>,

    /// Number of frames to run
    #[arg(long, default_value_t = 300)]
    steps: usize,

    #[arg(long, default_value_t = 2000)]
    tracers: usize,

    /// Pull tracers toward the origin with this strength
    #[arg(long)]
    gravity: Option<f64>,

    /// Replay tracers through a saved snapshot instead of simulating
    #[arg(long)]
    frozen: Option<PathBuf>,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Log level (error, warn, info, debug, trace); falls back to RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: Option<&str>) {
    let level = level
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .or_else(|| std::env::var("RUST_LOG").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(level).init();
}

fn build_config(args: &Args) -> FluidResult<SimulationConfig> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_json_file(path)?,
        None => SimulationConfig::default(),
    };
    if let Some(n) = args.vortons {
        config.vorton_count = n;
    }
    if let Some(v) = args.viscosity {
        config.viscosity = v;
    }
    if let Some(depth) = args.depth {
        config.tree = TreeConfig::fixed_depth(depth);
    }
    if let Some(load) = args.bucket {
        config.tree = TreeConfig::bucket(load, 12);
    }
    if let Some(theta) = args.opening_angle {
        config.tree = config.tree.with_opening_angle(theta);
    }
    if args.stretch_tilt {
        config.stretch_tilt = true;
    }
    if args.workers.is_some() {
        config.workers = args.workers;
    }
    config.validate()?;
    Ok(config)
}

fn progress_bar(len: usize) -> ProgressBar {
    let bar = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({eta}) {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }
    bar
}

/// Smoke ring demo: a grid of vortons with a vortex ring and a jet ring
/// travelling up the z axis.
fn demo_scene(config: SimulationConfig, pool: Arc<WorkerPool>, rng: &mut StdRng) -> FluidResult<VortonSpace> {
    let mut space = VortonSpace::new(config, pool)?;
    space.distribute_vortons_uniform_grid_with(rng, &Vec3::repeat(-1.0), &Vec3::repeat(1.0), 0.05);
    space.inject_vortex_ring(0.5, 0.25, 2.0, &Vec3::z(), &Vec3::new(0.0, 0.0, -0.5))?;
    space.inject_jet_ring(0.3, 0.2, 0.3, 1.0, &Vec3::z(), &Vec3::new(0.0, 0.0, 0.2))?;
    Ok(space)
}

fn run_frames<F: TracerField>(field: &mut F, args: &Args, rng: &mut StdRng) -> FluidResult<()> {
    let mut tracers = scatter_in_sphere(rng, &Vec3::new(0.0, 0.0, -0.5), 0.6, args.tracers, 0.05, 10.0);
    let forces: Vec<TracerForce> = args
        .gravity
        .map(|strength| TracerForce::gravitational(Vec3::zeros(), strength))
        .into_iter()
        .collect();

    let bar = progress_bar(args.steps);
    for frame in 0..args.steps {
        field.step_simulation(DT)?;
        apply_forces(&forces, &mut tracers, DT);
        field.advect_tracers(&mut tracers, DT)?;

        bar.set_position(frame as u64 + 1);
        if frame % 30 == 0 {
            let alive = tracers.iter().filter(|t| t.is_alive()).count();
            bar.set_message(format!("{} tracers alive", alive));
        }
    }
    bar.finish_with_message("done");

    save_tracers_vtk(&tracers, args.output.join("tracers.vtk"))?;
    Ok(())
}

fn main() -> FluidResult<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());
    fs::create_dir_all(&args.output)?;

    let mut rng = StdRng::seed_from_u64(args.seed);

    let config = build_config(&args)?;

    if let Some(path) = &args.frozen {
        let snapshot = load_snapshot(path)?;
        let pool = Arc::new(match config.workers {
            Some(n) => WorkerPool::with_workers(n)?,
            None => WorkerPool::new()?,
        });
        info!("replaying {} frames through {}", args.steps, path.display());
        let mut field = FrozenField::new(snapshot, pool)?.with_timestep(config.timestep)?;
        return run_frames(&mut field, &args, &mut rng);
    }

    if config.vorton_count < 8 {
        warn!("only {} vortons, the field will be mostly empty", config.vorton_count);
    }
    let pool = Arc::new(match config.workers {
        Some(n) => WorkerPool::with_workers(n)?,
        None => WorkerPool::new()?,
    });
    config.save_json(args.output.join("config.json"))?;

    let mut space = demo_scene(config, pool, &mut rng)?;
    run_frames(&mut space, &args, &mut rng)?;

    save_vortons_vtk(&space.vortons(), args.output.join("vortons.vtk"))?;
    if space.tree().is_none() {
        space.rebuild_tree();
    }
    let snapshot = space.snapshot()?;
    save_tree_vtk(&snapshot, args.output.join("tree.vtk"))?;
    save_snapshot(&snapshot, args.output.join("snapshot.json"))?;
    save_statistics(space.stats(), args.output.join("stats.json"))?;

    info!(
        "finished {} steps ({:.2} s simulated) in {}",
        space.stats().steps,
        space.stats().simulated_time,
        args.output.display()
    );
    Ok(())
}
