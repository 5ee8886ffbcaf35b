use crate::octree::Octree;
use crate::simulation::SimulationStats;
use crate::tracer::Tracer;
use crate::vorton::{Vec3, Vorton};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

fn write_header<W: Write>(out: &mut W, title: &str, dataset: &str) -> io::Result<()> {
    writeln!(out, "# vtk DataFile Version 3.0")?;
    writeln!(out, "{}", title)?;
    writeln!(out, "ASCII")?;
    writeln!(out, "DATASET {}", dataset)
}

fn write_points<'a, W: Write>(
    out: &mut W,
    count: usize,
    points: impl Iterator<Item = &'a Vec3>,
) -> io::Result<()> {
    writeln!(out, "POINTS {} double", count)?;
    for p in points {
        writeln!(out, "{} {} {}", p.x, p.y, p.z)?;
    }
    Ok(())
}

fn write_vertices<W: Write>(out: &mut W, count: usize) -> io::Result<()> {
    writeln!(out, "VERTICES {} {}", count, count * 2)?;
    for i in 0..count {
        writeln!(out, "1 {}", i)?;
    }
    Ok(())
}

// Vortons as points with their vorticity vectors
pub fn save_vortons_vtk<P: AsRef<Path>>(vortons: &[Vorton], path: P) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_vortons(&mut file, vortons)?;
    file.flush()
}

pub fn write_vortons<W: Write>(out: &mut W, vortons: &[Vorton]) -> io::Result<()> {
    write_header(out, "Vorton positions and vorticity", "POLYDATA")?;
    write_points(out, vortons.len(), vortons.iter().map(|v| &v.position))?;
    write_vertices(out, vortons.len())?;

    writeln!(out, "POINT_DATA {}", vortons.len())?;
    writeln!(out, "VECTORS vorticity double")?;
    for v in vortons {
        writeln!(out, "{} {} {}", v.vorticity.x, v.vorticity.y, v.vorticity.z)?;
    }
    writeln!(out, "SCALARS vorticity_magnitude double 1")?;
    writeln!(out, "LOOKUP_TABLE default")?;
    for v in vortons {
        writeln!(out, "{}", v.vorticity.norm())?;
    }
    Ok(())
}

// Live tracers with age and velocity
pub fn save_tracers_vtk<P: AsRef<Path>>(tracers: &[Tracer], path: P) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_tracers(&mut file, tracers)?;
    file.flush()
}

pub fn write_tracers<W: Write>(out: &mut W, tracers: &[Tracer]) -> io::Result<()> {
    let alive: Vec<&Tracer> = tracers.iter().filter(|t| t.is_alive()).collect();

    write_header(out, "Fluid tracers", "POLYDATA")?;
    write_points(out, alive.len(), alive.iter().map(|t| &t.position))?;
    write_vertices(out, alive.len())?;

    writeln!(out, "POINT_DATA {}", alive.len())?;
    writeln!(out, "VECTORS velocity double")?;
    for t in &alive {
        writeln!(out, "{} {} {}", t.velocity.x, t.velocity.y, t.velocity.z)?;
    }
    writeln!(out, "SCALARS age double 1")?;
    writeln!(out, "LOOKUP_TABLE default")?;
    for t in &alive {
        writeln!(out, "{}", t.age)?;
    }
    Ok(())
}

// Occupied leaf cells as hexahedra, for debugging the tree layout
pub fn save_tree_vtk<P: AsRef<Path>>(tree: &Octree, path: P) -> io::Result<()> {
    let mut file = BufWriter::new(File::create(path)?);
    write_tree(&mut file, tree)?;
    file.flush()
}

pub fn write_tree<W: Write>(out: &mut W, tree: &Octree) -> io::Result<()> {
    let leaves = tree.leaves();

    write_header(out, "Octree leaf cells", "UNSTRUCTURED_GRID")?;
    writeln!(out, "POINTS {} double", leaves.len() * 8)?;
    for &id in &leaves {
        let node = tree.node(id);
        let (lo, hi) = (node.min, node.max);
        // VTK_HEXAHEDRON corner order
        let corners = [
            [lo.x, lo.y, lo.z],
            [hi.x, lo.y, lo.z],
            [hi.x, hi.y, lo.z],
            [lo.x, hi.y, lo.z],
            [lo.x, lo.y, hi.z],
            [hi.x, lo.y, hi.z],
            [hi.x, hi.y, hi.z],
            [lo.x, hi.y, hi.z],
        ];
        for c in corners {
            writeln!(out, "{} {} {}", c[0], c[1], c[2])?;
        }
    }

    writeln!(out, "CELLS {} {}", leaves.len(), leaves.len() * 9)?;
    for i in 0..leaves.len() {
        let base = i * 8;
        write!(out, "8")?;
        for k in 0..8 {
            write!(out, " {}", base + k)?;
        }
        writeln!(out)?;
    }

    writeln!(out, "CELL_TYPES {}", leaves.len())?;
    for _ in &leaves {
        writeln!(out, "12")?;
    }

    writeln!(out, "CELL_DATA {}", leaves.len())?;
    writeln!(out, "SCALARS vorton_count int 1")?;
    writeln!(out, "LOOKUP_TABLE default")?;
    for &id in &leaves {
        writeln!(out, "{}", tree.node(id).items().len())?;
    }
    Ok(())
}

// Save run statistics as JSON
pub fn save_statistics<P: AsRef<Path>>(stats: &SimulationStats, path: P) -> io::Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, stats)?;
    Ok(())
}
