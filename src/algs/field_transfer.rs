//! Cross-mesh field evaluation (CMFE) by position.
//!
//! [`evaluate_position_cmfe`] samples a field of the `source` collection at
//! the nodes (or cell centroids) of the `target` collection. With more than
//! one rank the query points and the source cells are first moved to the
//! owner of a spatial partition, evaluated there, and the values are sent
//! back. Points that no source cell contains take the target piece's default
//! variable instead.

use crate::algs::communicator::{Communicator, agree_on};
use crate::algs::partition::{PartitionConfig, create_partition};
use crate::algs::point_set::{PointSet, UNRESOLVED};
use crate::algs::spatial_index::SpatialIndex;
use crate::data::mesh_piece::{Centering, Field, MeshPiece};
use crate::data::mesh_tree::MeshTree;
use crate::debug_invariants::DebugInvariants;
use crate::geometry::bbox::Aabb;
use crate::mesh_error::MeshCmfeError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Options of one CMFE invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmfeConfig {
    /// Field sampled on the source pieces.
    pub input_var: String,
    /// Name of the field attached to the output pieces.
    pub output_var: String,
    /// Target field used where no source cell contains a point.
    pub default_var: String,
    pub partition: PartitionConfig,
    /// Reference-space slack of the point-in-cell test.
    pub containment_tolerance: f64,
    /// Zonal mask on source pieces; cells with a non-zero value are ignored.
    pub ghost_var: Option<String>,
}

impl Default for CmfeConfig {
    fn default() -> Self {
        Self {
            input_var: String::new(),
            output_var: String::new(),
            default_var: String::new(),
            partition: PartitionConfig::default(),
            containment_tolerance: 1e-6,
            ghost_var: None,
        }
    }
}

impl CmfeConfig {
    pub fn new(
        input_var: impl Into<String>,
        output_var: impl Into<String>,
        default_var: impl Into<String>,
    ) -> Self {
        Self {
            input_var: input_var.into(),
            output_var: output_var.into(),
            default_var: default_var.into(),
            ..Default::default()
        }
    }
}

const CENTERING_NONE: u64 = 0;
const CENTERING_ZONAL: u64 = 1;
const CENTERING_NODAL: u64 = 2;

/// Centering and component count of the input field agreed on by all ranks.
/// Nodal wins over zonal when pieces disagree.
fn agree_on_layout<C: Communicator + ?Sized>(
    sources: &[Arc<MeshPiece>],
    name: &str,
    comm: &C,
) -> Result<(Centering, usize), MeshCmfeError> {
    let mut meta = [u64::from(!sources.is_empty()), 0, CENTERING_NONE];
    for piece in sources {
        if let Some(f) = piece.field(name) {
            meta[1] = meta[1].max(f.components as u64);
            let code = match f.centering {
                Centering::Zonal => CENTERING_ZONAL,
                Centering::Nodal => CENTERING_NODAL,
            };
            meta[2] = meta[2].max(code);
        }
    }
    comm.allreduce_max_u64(&mut meta)?;
    if meta[0] == 0 {
        return Err(MeshCmfeError::NoSourceData);
    }
    let centering = match meta[2] {
        CENTERING_NODAL => Centering::Nodal,
        CENTERING_ZONAL => Centering::Zonal,
        _ => {
            return Err(MeshCmfeError::DegenerateVariable {
                name: name.to_string(),
            });
        }
    };
    if meta[1] == 0 {
        return Err(MeshCmfeError::DegenerateVariable {
            name: name.to_string(),
        });
    }
    Ok((centering, meta[1] as usize))
}

fn query_points(piece: &MeshPiece, centering: Centering) -> Vec<[f64; 3]> {
    match centering {
        Centering::Nodal => piece.points().to_vec(),
        Centering::Zonal => (0..piece.num_cells()).map(|c| piece.cell_centroid(c)).collect(),
    }
}

/// Global bounds of the query points and the contributing source cells.
fn global_bounds<C: Communicator + ?Sized>(
    points: &PointSet,
    index: &SpatialIndex,
    comm: &C,
) -> Result<Aabb, MeshCmfeError> {
    let local = Aabb::from_points(points.points().iter()).union(&index.local_bounds());
    let mut min = local.min;
    let mut max = local.max;
    comm.allreduce_min_f64(&mut min)?;
    comm.allreduce_max_f64(&mut max)?;
    Ok(Aabb::new(min, max))
}

/// Output field of target piece `dataset`: computed values, with the
/// piece's default variable filling unresolved points. `None` when a
/// fallback is needed but the piece has no default variable.
fn assemble_output(
    piece: &MeshPiece,
    dataset: usize,
    points: &PointSet,
    centering: Centering,
    components: usize,
    default_var: &str,
) -> Result<(Option<Field>, usize), MeshCmfeError> {
    let n = points.group_len(dataset).unwrap_or(0);
    let mut data = Vec::with_capacity(n * components);
    let mut fallback: Option<Field> = None;
    let mut misses = 0usize;
    for l in 0..n {
        let v = points.value(dataset, l)?;
        if v[0] != UNRESOLVED {
            data.extend_from_slice(v);
            continue;
        }
        misses += 1;
        if fallback.is_none() {
            if !piece.has_field(default_var) {
                return Ok((None, misses));
            }
            let f = piece.recentered_field(default_var, centering)?;
            if f.components != components {
                log::warn!(
                    "default variable `{default_var}` has {} components, output has {components}; copying {}",
                    f.components,
                    f.components.min(components)
                );
            }
            fallback = Some(f);
        }
        if let Some(f) = &fallback {
            let m = f.components.min(components);
            data.extend_from_slice(&f.tuple(l)[..m]);
            data.extend(std::iter::repeat_n(0.0, components - m));
        }
    }
    Ok((Some(Field::new(centering, components, data)), misses))
}

/// Evaluate `cfg.input_var` of `source` at every node (or cell centroid) of
/// `target` and return `target` with the result attached as `cfg.output_var`.
///
/// Every rank of `comm` must call this collectively. The returned tree has
/// the shape of `target`; each piece shares its geometry and existing fields
/// with the input piece.
///
/// # Errors
/// * [`MeshCmfeError::NoSourceData`] when no rank holds a source piece.
/// * [`MeshCmfeError::DegenerateVariable`] when no source piece carries the
///   input field with at least one component.
/// * [`MeshCmfeError::MissingDefaultVariable`] when some point on some rank
///   needs the fallback and its piece lacks the default variable. Every rank
///   returns this error.
pub fn evaluate_position_cmfe<C: Communicator + ?Sized>(
    target: &MeshTree,
    source: &MeshTree,
    cfg: &CmfeConfig,
    comm: &C,
) -> Result<MeshTree, MeshCmfeError> {
    let sources = source.pieces();
    let targets = target.pieces();
    let (centering, components) = agree_on_layout(&sources, &cfg.input_var, comm)?;

    let mut index = SpatialIndex::new(cfg.input_var.as_str())
        .with_tolerance(cfg.containment_tolerance)
        .with_ghost_mask(cfg.ghost_var.clone());
    for piece in &sources {
        index.add_mesh(Arc::clone(piece));
    }
    let mut points = PointSet::new(components);
    for piece in &targets {
        points.add_group(query_points(piece, centering));
    }
    points.finalize();

    if comm.size() > 1 {
        let bounds = global_bounds(&points, &index, comm)?;
        let mut items = points.points().to_vec();
        items.extend(index.cell_centroids());
        let partition = create_partition(&items, &bounds, comm, &cfg.partition)?;
        points.redistribute(&partition, comm)?;
        index.redistribute(&partition, comm)?;
    } else {
        index.finalize();
    }

    let resolved = points.resolve_each(|p, out| index.evaluate(p, out));
    let evaluated = points.len();
    log::debug!(
        "[rank {}] resolved {resolved} of {evaluated} points locally",
        comm.rank()
    );
    if points.is_redistributed() {
        points.unredistribute(comm)?;
    }
    points.debug_assert_invariants();

    let assembled = targets.iter().enumerate().try_fold(
        (Vec::with_capacity(targets.len()), 0usize),
        |(mut fields, fallbacks), (g, piece)| -> Result<_, MeshCmfeError> {
            let (field, misses) =
                assemble_output(piece, g, &points, centering, components, &cfg.default_var)?;
            let field = field.ok_or_else(|| MeshCmfeError::MissingDefaultVariable {
                name: cfg.default_var.clone(),
            })?;
            fields.push(Some(field));
            Ok((fields, fallbacks + misses))
        },
    );
    let (mut fields, fallbacks) = agree_on(comm, assembled)?;

    log::info!(
        "[rank {}] cmfe `{}` -> `{}`: {} target points, {fallbacks} from `{}`",
        comm.rank(),
        cfg.input_var,
        cfg.output_var,
        points.len(),
        cfg.default_var
    );

    target.try_map(|i, piece| {
        let field = fields
            .get_mut(i)
            .and_then(Option::take)
            .ok_or(MeshCmfeError::OutOfRange {
                index: i,
                len: targets.len(),
            })?;
        piece.with_field(cfg.output_var.as_str(), field)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::cell_type::CellType;

    fn hex_at(x0: f64) -> MeshPiece {
        let corners = [
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 1.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0],
            [0.0, 1.0, 1.0],
        ];
        let pts = corners.iter().map(|c| [c[0] + x0, c[1], c[2]]).collect();
        MeshPiece::new(pts, vec![(CellType::Hexahedron, (0..8).collect())]).unwrap()
    }

    fn source() -> MeshTree {
        let mut m = hex_at(0.0);
        m.add_field("u", Field::scalar(Centering::Nodal, (0..8).map(f64::from).collect()))
            .unwrap();
        MeshTree::from(m)
    }

    fn probe(points: Vec<[f64; 3]>, default: Option<f64>) -> MeshPiece {
        let cells = (0..points.len()).map(|i| (CellType::Vertex, vec![i])).collect();
        let n = points.len();
        let mut m = MeshPiece::new(points, cells).unwrap();
        if let Some(d) = default {
            m.add_field("d", Field::scalar(Centering::Nodal, vec![d; n])).unwrap();
        }
        m
    }

    #[test]
    fn centroid_and_fallback_examples() {
        let target = MeshTree::from(probe(vec![[0.5, 0.5, 0.5], [10.0, 10.0, 10.0]], Some(99.0)));
        let cfg = CmfeConfig::new("u", "out", "d");
        let out = evaluate_position_cmfe(&target, &source(), &cfg, &NoComm).unwrap();
        let piece = &out.pieces()[0];
        let f = piece.field("out").unwrap();
        assert_eq!(f.centering, Centering::Nodal);
        assert!((f.data[0] - 3.5).abs() < 1e-12);
        assert_eq!(f.data[1], 99.0);
        assert!(piece.has_field("d"));
    }

    #[test]
    fn empty_source_everywhere() {
        let target = MeshTree::from(probe(vec![[0.5; 3]], Some(0.0)));
        let cfg = CmfeConfig::new("u", "out", "d");
        let err = evaluate_position_cmfe(&target, &MeshTree::empty(), &cfg, &NoComm).unwrap_err();
        assert_eq!(err, MeshCmfeError::NoSourceData);
    }

    #[test]
    fn absent_input_is_degenerate() {
        let target = MeshTree::from(probe(vec![[0.5; 3]], Some(0.0)));
        let cfg = CmfeConfig::new("nope", "out", "d");
        let err = evaluate_position_cmfe(&target, &source(), &cfg, &NoComm).unwrap_err();
        assert_eq!(err, MeshCmfeError::DegenerateVariable { name: "nope".into() });
    }

    #[test]
    fn missing_default_only_matters_when_needed() {
        let cfg = CmfeConfig::new("u", "out", "d");
        let inside = MeshTree::from(probe(vec![[0.5; 3]], None));
        assert!(evaluate_position_cmfe(&inside, &source(), &cfg, &NoComm).is_ok());

        let outside = MeshTree::from(probe(vec![[3.0; 3]], None));
        let err = evaluate_position_cmfe(&outside, &source(), &cfg, &NoComm).unwrap_err();
        assert_eq!(err, MeshCmfeError::MissingDefaultVariable { name: "d".into() });
    }

    #[test]
    fn zonal_source_samples_target_centroids() {
        let mut src = hex_at(0.0);
        src.add_field("z", Field::new(Centering::Zonal, 2, vec![4.0, 5.0])).unwrap();
        let mut tgt = hex_at(0.0);
        tgt.add_field("d", Field::scalar(Centering::Zonal, vec![-1.0])).unwrap();
        let cfg = CmfeConfig::new("z", "out", "d");
        let out = evaluate_position_cmfe(&MeshTree::from(tgt), &MeshTree::from(src), &cfg, &NoComm).unwrap();
        let f = out.pieces()[0].field("out").cloned().unwrap();
        assert_eq!(f, Field::new(Centering::Zonal, 2, vec![4.0, 5.0]));
    }

    #[test]
    fn fallback_is_recentered_and_padded() {
        let mut src = hex_at(0.0);
        src.add_field("z", Field::new(Centering::Zonal, 2, vec![4.0, 5.0])).unwrap();
        let mut tgt = hex_at(5.0);
        tgt.add_field("d", Field::scalar(Centering::Nodal, (0..8).map(f64::from).collect()))
            .unwrap();
        let cfg = CmfeConfig::new("z", "out", "d");
        let out = evaluate_position_cmfe(&MeshTree::from(tgt), &MeshTree::from(src), &cfg, &NoComm).unwrap();
        let f = out.pieces()[0].field("out").cloned().unwrap();
        assert_eq!(f.data, vec![3.5, 0.0]);
    }

    #[test]
    fn output_shares_target_geometry() {
        let tgt = probe(vec![[0.5; 3]], Some(0.0));
        let tree = MeshTree::Node(vec![MeshTree::Leaf(None), MeshTree::from(tgt)]);
        let cfg = CmfeConfig::new("u", "out", "d");
        let out = evaluate_position_cmfe(&tree, &source(), &cfg, &NoComm).unwrap();
        let before = tree.pieces();
        let after = out.pieces();
        assert!(after[0].shares_geometry_with(&before[0]));
        assert!(matches!(out, MeshTree::Node(ref c) if matches!(c[0], MeshTree::Leaf(None))));
    }
}
