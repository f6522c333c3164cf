#![allow(dead_code)]
use mesh_cmfe::algs::communicator::LocalComm;
use mesh_cmfe::data::{Centering, Field, MeshPiece};
use mesh_cmfe::topology::cell_type::CellType;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Run `f` once per rank of a `size`-rank in-process group, each on its own
/// thread; results come back in rank order.
pub fn run_ranks<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(&LocalComm) -> R + Sync,
    R: Send,
{
    let comms = LocalComm::group(size);
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(&comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

/// Linear test field; trilinear interpolation reproduces it exactly.
pub fn linear(p: [f64; 3]) -> f64 {
    1.0 + p[0] + 2.0 * p[1] - 0.5 * p[2]
}

/// Structured hex block covering cells `lo..hi` (per axis) of a grid with
/// spacing `h`, carrying the nodal field `u = linear(x)`.
pub fn hex_block(lo: [usize; 3], hi: [usize; 3], h: f64) -> MeshPiece {
    let n = [hi[0] - lo[0] + 1, hi[1] - lo[1] + 1, hi[2] - lo[2] + 1];
    let idx = |i: usize, j: usize, k: usize| i + n[0] * (j + n[1] * k);
    let mut points = Vec::with_capacity(n[0] * n[1] * n[2]);
    for k in 0..n[2] {
        for j in 0..n[1] {
            for i in 0..n[0] {
                points.push([
                    (lo[0] + i) as f64 * h,
                    (lo[1] + j) as f64 * h,
                    (lo[2] + k) as f64 * h,
                ]);
            }
        }
    }
    let mut cells = Vec::new();
    for k in 0..n[2] - 1 {
        for j in 0..n[1] - 1 {
            for i in 0..n[0] - 1 {
                cells.push((
                    CellType::Hexahedron,
                    vec![
                        idx(i, j, k),
                        idx(i + 1, j, k),
                        idx(i + 1, j + 1, k),
                        idx(i, j + 1, k),
                        idx(i, j, k + 1),
                        idx(i + 1, j, k + 1),
                        idx(i + 1, j + 1, k + 1),
                        idx(i, j + 1, k + 1),
                    ],
                ));
            }
        }
    }
    let values = points.iter().map(|&p| linear(p)).collect();
    let mut piece = MeshPiece::new(points, cells).expect("valid hex block");
    piece
        .add_field("u", Field::scalar(Centering::Nodal, values))
        .expect("nodal field");
    piece
}

/// Unit-cube grid of `n^3` cells split into `slabs` blocks along x.
pub fn hex_slabs(n: usize, slabs: usize) -> Vec<MeshPiece> {
    let h = 1.0 / n as f64;
    (0..slabs)
        .map(|s| hex_block([s * n / slabs, 0, 0], [(s + 1) * n / slabs, n, n], h))
        .collect()
}

/// Point cloud piece (one vertex cell per point) with nodal default `d`.
pub fn probes(points: Vec<[f64; 3]>, default: f64) -> MeshPiece {
    let n = points.len();
    let cells = (0..n).map(|i| (CellType::Vertex, vec![i])).collect();
    let mut piece = MeshPiece::new(points, cells).expect("valid probe piece");
    piece
        .add_field("d", Field::scalar(Centering::Nodal, vec![default; n]))
        .expect("default field");
    piece
}

/// `n` uniform random points in `[lo, hi)^3`.
pub fn random_points(seed: u64, n: usize, lo: f64, hi: f64) -> Vec<[f64; 3]> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..n)
        .map(|_| [rng.gen_range(lo..hi), rng.gen_range(lo..hi), rng.gen_range(lo..hi)])
        .collect()
}

pub fn inside_unit_cube(p: [f64; 3]) -> bool {
    p.iter().all(|&x| (0.0..=1.0).contains(&x))
}
