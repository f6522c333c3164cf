//! Recursive histogram-driven spatial partitioning.
//!
//! The global bounding box is split into exactly `P` boxes, one per rank.
//! Each active [`Boundary`] proposes [`NUM_PIVOTS`] pivots along its current
//! axis; every rank bins its local items (query points and source cell
//! centroids) into the [`NUM_BUCKETS`] buckets those pivots delimit, and all
//! histograms of a round are summed in one batched reduction. The decision to
//! refine or split ([`attempt_split`]) is a pure function of the reduced
//! histogram, so every rank grows the same tree and issues the same sequence
//! of collectives.

use crate::algs::communicator::Communicator;
use crate::debug_invariants::DebugInvariants;
use crate::geometry::bbox::Aabb;
use crate::geometry::box_tree::BoxTree;
use crate::mesh_error::MeshCmfeError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Candidate split positions proposed per boundary per round.
pub const NUM_PIVOTS: usize = 5;
/// Histogram buckets delimited by the pivots.
pub const NUM_BUCKETS: usize = NUM_PIVOTS + 1;

/// Padding applied on both sides of an axis along which the global box is flat.
const FLAT_AXIS_PAD: f64 = 1.0;

/// Tuning of the recursive partitioner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Accept a pivot whose lower-side proportion is this close to the ideal.
    pub balance_tolerance: f64,
    /// Rounds of pivot refinement before the best pivot is forced.
    pub max_refinements: usize,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            balance_tolerance: 0.02,
            max_refinements: 3,
        }
    }
}

/// Per-boundary state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum BoundaryState {
    /// Still looking for a pivot along `axis`; `window` is the current search
    /// interval the pivots are spread over.
    Splitting {
        axis: usize,
        pivots: [f64; NUM_PIVOTS],
        window: (f64, f64),
        attempts: usize,
    },
    /// Owned by a single rank.
    Leaf { rank: usize },
}

/// A box of space shared by `process_count` consecutive ranks starting at
/// `first_rank`.
#[derive(Clone, Debug, PartialEq)]
pub struct Boundary {
    pub bounds: Aabb,
    pub first_rank: usize,
    pub process_count: usize,
    /// Axes along which the global box was flat; never split along them.
    pub flat: [bool; 3],
    pub state: BoundaryState,
}

/// Outcome of one round for one boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum SplitResult {
    Leaf { rank: usize },
    /// Try again next round with narrower pivots.
    Refine(Boundary),
    /// Lower and upper child.
    Split(Boundary, Boundary),
}

fn pivots_in(lo: f64, hi: f64) -> [f64; NUM_PIVOTS] {
    let step = (hi - lo) / (NUM_PIVOTS + 1) as f64;
    std::array::from_fn(|i| lo + step * (i + 1) as f64)
}

fn next_axis(axis: usize, flat: &[bool; 3]) -> usize {
    (1..=3)
        .map(|k| (axis + k) % 3)
        .find(|&a| !flat[a])
        .unwrap_or((axis + 1) % 3)
}

impl Boundary {
    /// A boundary over `bounds` for ranks `first_rank..first_rank + process_count`,
    /// splitting first along `axis`.
    pub fn new(bounds: Aabb, first_rank: usize, process_count: usize, axis: usize, flat: [bool; 3]) -> Self {
        let state = if process_count <= 1 {
            BoundaryState::Leaf { rank: first_rank }
        } else {
            let window = (bounds.min[axis], bounds.max[axis]);
            BoundaryState::Splitting {
                axis,
                pivots: pivots_in(window.0, window.1),
                window,
                attempts: 0,
            }
        };
        Self {
            bounds,
            first_rank,
            process_count,
            flat,
            state,
        }
    }

    /// Root boundary for `parts` ranks over the (already padded) global box.
    pub fn root(bounds: Aabb, parts: usize, flat: [bool; 3]) -> Self {
        let axis = if flat[0] { next_axis(0, &flat) } else { 0 };
        Self::new(bounds, 0, parts, axis, flat)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.state, BoundaryState::Leaf { .. })
    }

    /// Histogram bucket of `p`: the number of pivots strictly below `p` along
    /// the current axis. Points on a pivot count toward the lower side, which
    /// matches the lower child owning shared faces.
    pub fn bucket(&self, p: [f64; 3]) -> Option<usize> {
        match &self.state {
            BoundaryState::Splitting { axis, pivots, .. } => {
                Some(pivots.partition_point(|&pv| pv < p[*axis]))
            }
            BoundaryState::Leaf { .. } => None,
        }
    }

    /// Ideal fraction of the load on the lower side: the lower child takes
    /// `process_count / 2` ranks.
    pub fn ideal_ratio(&self) -> f64 {
        (self.process_count / 2) as f64 / self.process_count as f64
    }

    fn children(&self, axis: usize, at: f64) -> (Boundary, Boundary) {
        let (lo, hi) = self.bounds.split(axis, at);
        let n_lo = self.process_count / 2;
        let axis = next_axis(axis, &self.flat);
        (
            Boundary::new(lo, self.first_rank, n_lo, axis, self.flat),
            Boundary::new(hi, self.first_rank + n_lo, self.process_count - n_lo, axis, self.flat),
        )
    }
}

/// Decide what a boundary does with the globally reduced histogram of one round.
pub fn attempt_split(
    boundary: &Boundary,
    histogram: &[u64; NUM_BUCKETS],
    cfg: &PartitionConfig,
) -> SplitResult {
    let (axis, pivots, window, attempts) = match &boundary.state {
        BoundaryState::Leaf { rank } => return SplitResult::Leaf { rank: *rank },
        BoundaryState::Splitting {
            axis,
            pivots,
            window,
            attempts,
        } => (*axis, *pivots, *window, *attempts),
    };

    let total: u64 = histogram.iter().sum();
    if total == 0 {
        let mid = 0.5 * (boundary.bounds.min[axis] + boundary.bounds.max[axis]);
        let (lo, hi) = boundary.children(axis, mid);
        return SplitResult::Split(lo, hi);
    }

    let ideal = boundary.ideal_ratio();
    let mut below = 0u64;
    let mut best = 0usize;
    let mut best_ratio = 0.0;
    let mut best_err = f64::INFINITY;
    for (i, &count) in histogram[..NUM_PIVOTS].iter().enumerate() {
        below += count;
        let ratio = below as f64 / total as f64;
        let err = (ratio - ideal).abs();
        if err < best_err {
            best = i;
            best_ratio = ratio;
            best_err = err;
        }
    }

    if best_err <= cfg.balance_tolerance || attempts >= cfg.max_refinements {
        let (lo, hi) = boundary.children(axis, pivots[best]);
        return SplitResult::Split(lo, hi);
    }

    // The ideal cut lies in the bucket next to the best pivot, on the side
    // where the cumulative proportion still has to move.
    let window = if best_ratio < ideal {
        let hi = pivots.get(best + 1).copied().unwrap_or(window.1);
        (pivots[best], hi)
    } else {
        let lo = if best == 0 { window.0 } else { pivots[best - 1] };
        (lo, pivots[best])
    };
    let mut refined = boundary.clone();
    refined.state = BoundaryState::Splitting {
        axis,
        pivots: pivots_in(window.0, window.1),
        window,
        attempts: attempts + 1,
    };
    SplitResult::Refine(refined)
}

/// Pad `bounds` along flat axes; returns the padded box and the flat mask.
/// An empty box (no data anywhere) becomes the unit cube.
pub fn padded_global_bounds(bounds: &Aabb) -> (Aabb, [bool; 3]) {
    if bounds.is_empty() {
        return (Aabb::new([0.0; 3], [1.0; 3]), [false; 3]);
    }
    let mut out = *bounds;
    let mut flat = [false; 3];
    for (axis, f) in flat.iter_mut().enumerate() {
        if bounds.extent(axis) <= 0.0 {
            *f = true;
            out.pad_axis(axis, FLAT_AXIS_PAD);
        }
    }
    if flat.iter().all(|&f| f) {
        flat = [false; 3];
    }
    (out, flat)
}

/// Partition the global box into one box per rank of `comm`.
///
/// `items` are this rank's load samples; `global_bounds` must be identical on
/// every rank.
pub fn create_partition<C: Communicator + ?Sized>(
    items: &[[f64; 3]],
    global_bounds: &Aabb,
    comm: &C,
    cfg: &PartitionConfig,
) -> Result<SpatialPartition, MeshCmfeError> {
    partition_into(items, global_bounds, comm.size(), comm, cfg)
}

/// Partition into `parts` boxes, reducing histograms over `comm`.
///
/// With a serial communicator this partitions a local cloud into any number of
/// parts, which is what the benchmarks and single-process tests rely on.
pub fn partition_into<C: Communicator + ?Sized>(
    items: &[[f64; 3]],
    global_bounds: &Aabb,
    parts: usize,
    comm: &C,
    cfg: &PartitionConfig,
) -> Result<SpatialPartition, MeshCmfeError> {
    if parts == 0 {
        return Err(MeshCmfeError::ImproperUse(
            "cannot partition into zero boxes".into(),
        ));
    }
    let (bounds, flat) = padded_global_bounds(global_bounds);
    let mut leaves: Vec<Option<Aabb>> = vec![None; parts];
    let mut active = Vec::new();
    place(Boundary::root(bounds, parts, flat), &mut leaves, &mut active);

    let mut hits = Vec::new();
    let mut round = 0usize;
    while !active.is_empty() {
        let tree = BoxTree::from_boxes(active.iter().map(|b| b.bounds).collect());
        let mut hist = vec![0u64; active.len() * NUM_BUCKETS];
        for &p in items {
            tree.query_point(p, &mut hits);
            // shared faces go to the boundary holding the lowest ranks
            let Some(&b) = hits.iter().min_by_key(|&&i| active[i].first_rank) else {
                continue;
            };
            if let Some(k) = active[b].bucket(p) {
                hist[b * NUM_BUCKETS + k] += 1;
            }
        }
        comm.allreduce_sum_u64(&mut hist)?;

        let mut next = Vec::with_capacity(active.len() * 2);
        let mut splits = 0usize;
        for (b, h) in active.iter().zip(hist.chunks_exact(NUM_BUCKETS)) {
            let mut counts = [0u64; NUM_BUCKETS];
            counts.copy_from_slice(h);
            match attempt_split(b, &counts, cfg) {
                SplitResult::Leaf { rank } => leaves[rank] = Some(b.bounds),
                SplitResult::Refine(r) => next.push(r),
                SplitResult::Split(lo, hi) => {
                    splits += 1;
                    place(lo, &mut leaves, &mut next);
                    place(hi, &mut leaves, &mut next);
                }
            }
        }
        log::debug!(
            "[rank {}] partition round {round}: {} active, {splits} split, {} pending",
            comm.rank(),
            active.len(),
            next.len()
        );
        active = next;
        round += 1;
    }

    let boxes = leaves
        .into_iter()
        .enumerate()
        .map(|(rank, b)| {
            b.ok_or_else(|| MeshCmfeError::ImproperUse(format!("rank {rank} received no partition box")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let partition = SpatialPartition::new(boxes);
    crate::debug_invariants!(partition.validate_invariants(), "SpatialPartition after create_partition");
    Ok(partition)
}

fn place(b: Boundary, leaves: &mut [Option<Aabb>], active: &mut Vec<Boundary>) {
    match b.state {
        BoundaryState::Leaf { rank } => leaves[rank] = Some(b.bounds),
        BoundaryState::Splitting { .. } => active.push(b),
    }
}

/// Diagnostic single-owner answer for a box.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CellOwner {
    /// Overlaps no partition box.
    None,
    /// Overlaps several partition boxes.
    Ambiguous(Vec<usize>),
    Unique(usize),
}

/// Final tiling: box `i` belongs to rank `i`.
#[derive(Clone, Debug)]
pub struct SpatialPartition {
    tree: BoxTree,
}

impl SpatialPartition {
    pub fn new(boxes: Vec<Aabb>) -> Self {
        Self {
            tree: BoxTree::from_boxes(boxes),
        }
    }

    /// Number of boxes (= number of ranks).
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Box owned by each rank, in rank order.
    pub fn boxes(&self) -> Vec<Aabb> {
        (0..self.tree.len())
            .filter_map(|i| self.tree.get(i).copied())
            .collect()
    }

    /// Rank owning `p`; the lowest rank wins on shared faces.
    pub fn processor_for_point(&self, p: [f64; 3]) -> Result<usize, MeshCmfeError> {
        let mut hits = Vec::new();
        self.processor_for_point_with(p, &mut hits)
    }

    /// As [`Self::processor_for_point`], reusing a scratch buffer.
    pub fn processor_for_point_with(&self, p: [f64; 3], scratch: &mut Vec<usize>) -> Result<usize, MeshCmfeError> {
        self.tree.query_point(p, scratch);
        scratch.first().copied().ok_or_else(|| {
            MeshCmfeError::ImproperUse(format!("point {p:?} lies in no partition box"))
        })
    }

    /// Every rank whose box overlaps `b`, ascending.
    pub fn processors_for_box(&self, b: &Aabb) -> Vec<usize> {
        let mut hits = Vec::new();
        self.tree.query_box(b, &mut hits);
        hits
    }

    /// Single-owner view of a cell's bounding box. Only used for diagnostics;
    /// redistribution relies on [`Self::processors_for_box`].
    pub fn cell_owner(&self, b: &Aabb) -> CellOwner {
        let ranks = self.processors_for_box(b);
        match ranks.len() {
            0 => CellOwner::None,
            1 => CellOwner::Unique(ranks[0]),
            _ => CellOwner::Ambiguous(ranks),
        }
    }
}

impl DebugInvariants for SpatialPartition {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "SpatialPartition");
    }

    fn validate_invariants(&self) -> Result<(), MeshCmfeError> {
        if self.tree.is_empty() {
            return Err(MeshCmfeError::ImproperUse("partition has no boxes".into()));
        }
        let boxes = self.boxes();
        if let Some(rank) = boxes.iter().position(Aabb::is_empty) {
            return Err(MeshCmfeError::ImproperUse(format!("partition box of rank {rank} is empty")));
        }
        // boxes tile their hull: interiors are disjoint and volumes add up
        let volume = |b: &Aabb| (0..3).map(|a| b.extent(a)).product::<f64>();
        for ((i, a), (j, b)) in boxes.iter().enumerate().tuple_combinations() {
            let shared: f64 = (0..3)
                .map(|k| (a.max[k].min(b.max[k]) - a.min[k].max(b.min[k])).max(0.0))
                .product();
            if shared > 1e-12 * volume(a).max(volume(b)).max(1.0) {
                return Err(MeshCmfeError::ImproperUse(format!(
                    "partition boxes of ranks {i} and {j} overlap"
                )));
            }
        }
        let hull = boxes.iter().fold(Aabb::empty(), |acc, b| acc.union(b));
        let sum: f64 = boxes.iter().map(volume).sum();
        let whole = volume(&hull);
        if (sum - whole).abs() > 1e-9 * whole.max(1.0) {
            return Err(MeshCmfeError::ImproperUse(format!(
                "partition boxes cover volume {sum}, hull volume is {whole}"
            )));
        }
        Ok(())
    }
}
