//! Source-cell index: finds the cell containing a point and interpolates
//! the source field there.
//!
//! Every cell of every registered piece gets one entry in an R-tree,
//! numbered by prefix sums over the pieces. Cells that cannot contribute
//! (ghost-masked, or on a piece lacking the field) get an empty box so the
//! numbering stays a pure prefix sum.

use crate::algs::communicator::{Communicator, agree_on};
use crate::algs::partition::SpatialPartition;
use crate::algs::wire::BlobEnvelope;
use crate::data::mesh_piece::{Centering, MeshPiece};
use crate::geometry::bbox::Aabb;
use crate::geometry::box_tree::BoxTree;
use crate::geometry::metrics::locate_in_cell;
use crate::io::fragment::{decode_fragment, encode_fragment};
use crate::mesh_error::MeshCmfeError;
use std::sync::Arc;

/// Reusable buffers for [`SpatialIndex::evaluate_with`].
#[derive(Debug, Default)]
pub struct EvalScratch {
    candidates: Vec<usize>,
    vertices: Vec<[f64; 3]>,
}

#[derive(Clone, Debug)]
pub struct SpatialIndex {
    field: String,
    ghost_var: Option<String>,
    tolerance: f64,
    meshes: Vec<Arc<MeshPiece>>,
    offsets: Vec<usize>,
    tree: BoxTree,
}

impl SpatialIndex {
    /// Index interpolating the field named `field`.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ghost_var: None,
            tolerance: 1e-6,
            meshes: Vec::new(),
            offsets: vec![0],
            tree: BoxTree::new(),
        }
    }

    /// Reference-space slack of the point-in-cell test.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Skip cells flagged non-zero in the zonal field `name`.
    pub fn with_ghost_mask(mut self, name: Option<String>) -> Self {
        self.ghost_var = name;
        self
    }

    pub fn field_name(&self) -> &str {
        &self.field
    }

    pub fn add_mesh(&mut self, mesh: Arc<MeshPiece>) {
        self.meshes.push(mesh);
    }

    /// Release every piece; the index must be finalized again before use.
    pub fn clear_meshes(&mut self) {
        self.meshes.clear();
        self.offsets = vec![0];
        self.tree = BoxTree::new();
    }

    pub fn meshes(&self) -> &[Arc<MeshPiece>] {
        &self.meshes
    }

    /// Total cells over every piece, ghosts included.
    pub fn num_cells(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    fn contributes(&self, mesh: &MeshPiece, c: usize) -> bool {
        mesh.has_field(&self.field)
            && !self
                .ghost_var
                .as_deref()
                .is_some_and(|g| mesh.is_ghost(g, c))
    }

    /// Cell bounding box grown by the containment slack. Points cross the
    /// wire in single precision, so the slack also covers f32 rounding.
    fn search_box(&self, mesh: &MeshPiece, c: usize) -> Aabb {
        let mut b = mesh.cell_bounds(c);
        let magnitude = (0..3)
            .map(|a| b.min[a].abs().max(b.max[a].abs()))
            .fold(0.0, f64::max);
        let pad = self.tolerance * b.diagonal() + 4.0 * f64::from(f32::EPSILON) * magnitude;
        for a in 0..3 {
            b.pad_axis(a, pad);
        }
        b
    }

    /// Rebuild numbering and tree over the registered pieces. With no cells
    /// at all a single placeholder entry keeps the tree non-empty.
    pub fn finalize(&mut self) {
        self.offsets.clear();
        self.offsets.push(0);
        let mut boxes = Vec::new();
        for mesh in &self.meshes {
            for c in 0..mesh.num_cells() {
                boxes.push(if self.contributes(mesh, c) {
                    self.search_box(mesh, c)
                } else {
                    Aabb::empty()
                });
            }
            self.offsets.push(boxes.len());
        }
        if boxes.is_empty() {
            boxes.push(Aabb::empty());
        }
        self.tree = BoxTree::from_boxes(boxes);
    }

    /// `(piece, cell)` of a tree id; `None` for the placeholder.
    fn locate_id(&self, id: usize) -> Option<(usize, usize)> {
        if id >= self.num_cells() {
            return None;
        }
        let m = self.offsets.partition_point(|&o| o <= id) - 1;
        Some((m, id - self.offsets[m]))
    }

    /// Value of the field at `p`, written to `out`. Returns false when no
    /// contributing cell contains `p`.
    pub fn evaluate(&self, p: [f64; 3], out: &mut [f64]) -> bool {
        self.evaluate_with(p, out, &mut EvalScratch::default())
    }

    pub fn evaluate_with(&self, p: [f64; 3], out: &mut [f64], scratch: &mut EvalScratch) -> bool {
        self.tree.query_point(p, &mut scratch.candidates);
        for &id in &scratch.candidates {
            let Some((m, c)) = self.locate_id(id) else {
                continue;
            };
            let mesh = &self.meshes[m];
            let Some(field) = mesh.field(&self.field) else {
                continue;
            };
            mesh.cell_vertices_into(c, &mut scratch.vertices);
            let Ok(Some(loc)) = locate_in_cell(mesh.cell_type(c), &scratch.vertices, p, self.tolerance) else {
                continue;
            };
            out.fill(0.0);
            let n = out.len().min(field.components);
            match field.centering {
                Centering::Zonal => out[..n].copy_from_slice(&field.tuple(c)[..n]),
                Centering::Nodal => {
                    for (w, &pid) in loc.weights.iter().zip(mesh.cell_points(c)) {
                        for (o, v) in out[..n].iter_mut().zip(field.tuple(pid)) {
                            *o += w * v;
                        }
                    }
                }
            }
            return true;
        }
        false
    }

    /// Centroids of every contributing cell, the index's share of the
    /// partitioner load.
    pub fn cell_centroids(&self) -> Vec<[f64; 3]> {
        let mut out = Vec::new();
        for mesh in &self.meshes {
            out.extend(
                (0..mesh.num_cells())
                    .filter(|&c| self.contributes(mesh, c))
                    .map(|c| mesh.cell_centroid(c)),
            );
        }
        out
    }

    /// Bounds of every contributing cell.
    pub fn local_bounds(&self) -> Aabb {
        let mut b = Aabb::empty();
        for mesh in &self.meshes {
            for c in (0..mesh.num_cells()).filter(|&c| self.contributes(mesh, c)) {
                b = b.union(&mesh.cell_bounds(c));
            }
        }
        b
    }

    /// Ship every contributing cell to each rank whose partition box its
    /// bounding box overlaps, then replace the local pieces with what arrived
    /// and finalize.
    pub fn redistribute<C: Communicator + ?Sized>(
        &mut self,
        partition: &SpatialPartition,
        comm: &C,
    ) -> Result<(), MeshCmfeError> {
        let ranks = comm.size();
        let (env, sent) = agree_on(comm, self.pack_fragments(partition, comm.rank(), ranks))?;

        let received = env.exchange(comm)?;
        let pieces = received
            .iter()
            .flatten()
            .map(|blob| decode_fragment(blob))
            .collect::<Result<Vec<_>, _>>();
        let pieces = agree_on(comm, pieces)?;
        self.clear_meshes();
        let mut got = 0usize;
        for piece in pieces {
            got += piece.num_cells();
            self.add_mesh(Arc::new(piece));
        }
        log::debug!(
            "[rank {}] cell redistribution: sent {sent}, received {got} in {} fragments",
            comm.rank(),
            self.meshes.len()
        );
        self.finalize();
        Ok(())
    }

    /// Fragments per destination rank, and the number of cells they hold.
    fn pack_fragments(
        &self,
        partition: &SpatialPartition,
        rank: usize,
        ranks: usize,
    ) -> Result<(BlobEnvelope, usize), MeshCmfeError> {
        let keep = [self.field.as_str()];
        let mut env = BlobEnvelope::new(ranks);
        let mut sent = 0usize;
        let mut orphans = 0usize;
        for mesh in &self.meshes {
            let mut per_rank: Vec<Vec<usize>> = vec![Vec::new(); ranks];
            for c in (0..mesh.num_cells()).filter(|&c| self.contributes(mesh, c)) {
                let dests = partition.processors_for_box(&self.search_box(mesh, c));
                if dests.is_empty() {
                    orphans += 1;
                }
                for r in dests {
                    if r >= ranks {
                        return Err(MeshCmfeError::ImproperUse(format!(
                            "partition rank {r} outside communicator of size {ranks}"
                        )));
                    }
                    per_rank[r].push(c);
                }
            }
            for (r, cells) in per_rank.iter().enumerate() {
                if cells.is_empty() {
                    continue;
                }
                sent += cells.len();
                let sub = mesh.extract_cells(cells, &keep)?;
                env.push(r, encode_fragment(&sub, &keep)?);
            }
        }
        if orphans > 0 {
            log::warn!("[rank {rank}] {orphans} source cells overlap no partition box");
        }
        Ok((env, sent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::data::mesh_piece::Field;
    use crate::topology::cell_type::CellType;

    fn unit_hex(offset: f64) -> MeshPiece {
        let mut pts = Vec::new();
        for &(x, y, z) in &[
            (0.0, 0.0, 0.0),
            (1.0, 0.0, 0.0),
            (1.0, 1.0, 0.0),
            (0.0, 1.0, 0.0),
            (0.0, 0.0, 1.0),
            (1.0, 0.0, 1.0),
            (1.0, 1.0, 1.0),
            (0.0, 1.0, 1.0),
        ] {
            pts.push([x + offset, y, z]);
        }
        MeshPiece::new(pts, vec![(CellType::Hexahedron, (0..8).collect())]).unwrap()
    }

    fn hex_with_nodal_field() -> MeshPiece {
        let mut m = unit_hex(0.0);
        m.add_field("f", Field::scalar(Centering::Nodal, (0..8).map(f64::from).collect()))
            .unwrap();
        m
    }

    #[test]
    fn hex_centroid_interpolates_to_mean() {
        let mut idx = SpatialIndex::new("f");
        idx.add_mesh(Arc::new(hex_with_nodal_field()));
        idx.finalize();
        let mut out = [0.0];
        assert!(idx.evaluate([0.5, 0.5, 0.5], &mut out));
        assert!((out[0] - 3.5).abs() < 1e-12);
        assert!(!idx.evaluate([10.0, 10.0, 10.0], &mut out));
    }

    #[test]
    fn zonal_field_is_copied_and_extra_components_zeroed() {
        let mut m = unit_hex(0.0);
        m.add_field("f", Field::scalar(Centering::Zonal, vec![42.0])).unwrap();
        let mut idx = SpatialIndex::new("f");
        idx.add_mesh(Arc::new(m));
        idx.finalize();
        let mut out = [9.0, 9.0];
        assert!(idx.evaluate([0.1, 0.9, 0.3], &mut out));
        assert_eq!(out, [42.0, 0.0]);
    }

    #[test]
    fn empty_index_has_placeholder_and_finds_nothing() {
        let mut idx = SpatialIndex::new("f");
        idx.finalize();
        assert_eq!(idx.num_cells(), 0);
        let mut out = [0.0];
        assert!(!idx.evaluate([0.0; 3], &mut out));
        assert!(idx.local_bounds().is_empty());
    }

    #[test]
    fn ghost_cells_and_fieldless_pieces_are_skipped() {
        let mut ghost = hex_with_nodal_field();
        ghost
            .add_field("ghost", Field::scalar(Centering::Zonal, vec![1.0]))
            .unwrap();
        let mut idx = SpatialIndex::new("f").with_ghost_mask(Some("ghost".into()));
        idx.add_mesh(Arc::new(ghost));
        idx.add_mesh(Arc::new(unit_hex(2.0)));
        idx.finalize();
        assert_eq!(idx.num_cells(), 2);
        let mut out = [0.0];
        assert!(!idx.evaluate([0.5; 3], &mut out));
        assert!(!idx.evaluate([2.5, 0.5, 0.5], &mut out));
        assert!(idx.cell_centroids().is_empty());
    }

    #[test]
    fn second_piece_is_found_through_prefix_numbering() {
        let mut a = unit_hex(0.0);
        a.add_field("f", Field::scalar(Centering::Zonal, vec![1.0])).unwrap();
        let mut b = unit_hex(1.0);
        b.add_field("f", Field::scalar(Centering::Zonal, vec![2.0])).unwrap();
        let mut idx = SpatialIndex::new("f");
        idx.add_mesh(Arc::new(a));
        idx.add_mesh(Arc::new(b));
        idx.finalize();
        let mut out = [0.0];
        assert!(idx.evaluate([1.5, 0.5, 0.5], &mut out));
        assert_eq!(out[0], 2.0);
        // shared face: the lower-numbered cell answers
        assert!(idx.evaluate([1.0, 0.5, 0.5], &mut out));
        assert_eq!(out[0], 1.0);
        assert_eq!(idx.cell_centroids(), vec![[0.5; 3], [1.5, 0.5, 0.5]]);
    }

    #[test]
    fn serial_redistribute_keeps_evaluation() {
        let mut idx = SpatialIndex::new("f");
        idx.add_mesh(Arc::new(hex_with_nodal_field()));
        idx.finalize();
        let part = SpatialPartition::new(vec![Aabb::new([-1.0; 3], [2.0; 3])]);
        idx.redistribute(&part, &NoComm).unwrap();
        assert_eq!(idx.meshes().len(), 1);
        let mut out = [0.0];
        assert!(idx.evaluate([0.5, 0.5, 0.5], &mut out));
        assert!((out[0] - 3.5).abs() < 1e-12);
    }
}
