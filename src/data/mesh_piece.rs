//! One piece of a decomposed unstructured mesh plus its named fields.
//!
//! Geometry and field arrays sit behind `Arc`, so cloning a piece is a shallow
//! copy: the CMFE output shares every array of the input piece and only adds
//! the new field.

use crate::geometry::bbox::Aabb;
use crate::mesh_error::MeshCmfeError;
use crate::topology::cell_type::CellType;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Whether field values live on points or on cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Centering {
    Nodal,
    Zonal,
}

/// A named array of `components`-tuples, one per point or per cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub centering: Centering,
    pub components: usize,
    pub data: Vec<f64>,
}

impl Field {
    pub fn new(centering: Centering, components: usize, data: Vec<f64>) -> Self {
        Self {
            centering,
            components,
            data,
        }
    }

    /// Scalar field.
    pub fn scalar(centering: Centering, data: Vec<f64>) -> Self {
        Self::new(centering, 1, data)
    }

    /// Number of tuples stored.
    pub fn len(&self) -> usize {
        if self.components == 0 {
            0
        } else {
            self.data.len() / self.components
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn tuple(&self, i: usize) -> &[f64] {
        &self.data[i * self.components..(i + 1) * self.components]
    }
}

/// Point coordinates and cell connectivity (CSR layout).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub points: Vec<[f64; 3]>,
    pub cell_types: Vec<CellType>,
    /// `offsets[c]..offsets[c + 1]` indexes `connectivity` for cell `c`.
    pub offsets: Vec<usize>,
    pub connectivity: Vec<usize>,
}

impl Geometry {
    pub fn validate(&self) -> Result<(), MeshCmfeError> {
        if let Some(i) = self.points.iter().position(|p| p.iter().any(|c| !c.is_finite())) {
            return Err(MeshCmfeError::InvalidGeometry(format!(
                "point {i} has a non-finite coordinate {:?}",
                self.points[i]
            )));
        }
        if self.offsets.len() != self.cell_types.len() + 1 {
            return Err(MeshCmfeError::InvalidGeometry(format!(
                "{} cells need {} offsets, got {}",
                self.cell_types.len(),
                self.cell_types.len() + 1,
                self.offsets.len()
            )));
        }
        for (c, ct) in self.cell_types.iter().enumerate() {
            let (a, b) = (self.offsets[c], self.offsets[c + 1]);
            if b < a || b > self.connectivity.len() || b - a != ct.vertex_count() {
                return Err(MeshCmfeError::InvalidGeometry(format!(
                    "cell {c} ({ct:?}) has a malformed connectivity range {a}..{b}"
                )));
            }
            if let Some(&bad) = self.connectivity[a..b]
                .iter()
                .find(|&&p| p >= self.points.len())
            {
                return Err(MeshCmfeError::InvalidGeometry(format!(
                    "cell {c} references point {bad}, but the piece has {} points",
                    self.points.len()
                )));
            }
        }
        Ok(())
    }
}

/// A mesh piece: shared geometry plus shared named fields.
#[derive(Clone, Debug, Default)]
pub struct MeshPiece {
    geometry: Arc<Geometry>,
    fields: BTreeMap<String, Arc<Field>>,
}

impl MeshPiece {
    /// Build a piece from points and `(type, vertex ids)` cells.
    pub fn new(
        points: Vec<[f64; 3]>,
        cells: Vec<(CellType, Vec<usize>)>,
    ) -> Result<Self, MeshCmfeError> {
        let mut geometry = Geometry {
            points,
            cell_types: Vec::with_capacity(cells.len()),
            offsets: Vec::with_capacity(cells.len() + 1),
            connectivity: Vec::new(),
        };
        geometry.offsets.push(0);
        for (ct, ids) in cells {
            geometry.cell_types.push(ct);
            geometry.connectivity.extend(ids);
            geometry.offsets.push(geometry.connectivity.len());
        }
        Self::from_geometry(geometry)
    }

    pub fn from_geometry(geometry: Geometry) -> Result<Self, MeshCmfeError> {
        geometry.validate()?;
        Ok(Self {
            geometry: Arc::new(geometry),
            fields: BTreeMap::new(),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn num_points(&self) -> usize {
        self.geometry.points.len()
    }

    pub fn num_cells(&self) -> usize {
        self.geometry.cell_types.len()
    }

    pub fn points(&self) -> &[[f64; 3]] {
        &self.geometry.points
    }

    pub fn cell_type(&self, c: usize) -> CellType {
        self.geometry.cell_types[c]
    }

    pub fn cell_points(&self, c: usize) -> &[usize] {
        let g = &self.geometry;
        &g.connectivity[g.offsets[c]..g.offsets[c + 1]]
    }

    /// Coordinates of cell `c`'s vertices, written into `out`.
    pub fn cell_vertices_into(&self, c: usize, out: &mut Vec<[f64; 3]>) {
        out.clear();
        out.extend(self.cell_points(c).iter().map(|&p| self.geometry.points[p]));
    }

    pub fn cell_bounds(&self, c: usize) -> Aabb {
        Aabb::from_points(self.cell_points(c).iter().map(|&p| &self.geometry.points[p]))
    }

    /// Mean of the cell's vertices.
    pub fn cell_centroid(&self, c: usize) -> [f64; 3] {
        let ids = self.cell_points(c);
        let mut sum = [0.0; 3];
        for &p in ids {
            let x = self.geometry.points[p];
            sum[0] += x[0];
            sum[1] += x[1];
            sum[2] += x[2];
        }
        let inv = 1.0 / ids.len().max(1) as f64;
        [sum[0] * inv, sum[1] * inv, sum[2] * inv]
    }

    /// Bounding box of every point of the piece.
    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.geometry.points.iter())
    }

    fn entity_count(&self, centering: Centering) -> usize {
        match centering {
            Centering::Nodal => self.num_points(),
            Centering::Zonal => self.num_cells(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name).map(Arc::as_ref)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Attach (or replace) a field after checking its length.
    pub fn add_field(&mut self, name: impl Into<String>, field: Field) -> Result<(), MeshCmfeError> {
        let name = name.into();
        let expected = self.entity_count(field.centering) * field.components;
        if field.data.len() != expected {
            return Err(MeshCmfeError::FieldLength {
                name,
                expected,
                actual: field.data.len(),
            });
        }
        self.fields.insert(name, Arc::new(field));
        Ok(())
    }

    /// Shallow copy carrying one extra field.
    pub fn with_field(&self, name: impl Into<String>, field: Field) -> Result<Self, MeshCmfeError> {
        let mut out = self.clone();
        out.add_field(name, field)?;
        Ok(out)
    }

    /// True when cell `c` is flagged non-zero in the zonal mask `mask_name`.
    /// Pieces without the mask have no ghost cells.
    pub fn is_ghost(&self, mask_name: &str, c: usize) -> bool {
        match self.field(mask_name) {
            Some(mask) if mask.centering == Centering::Zonal && mask.components > 0 => {
                mask.tuple(c)[0] != 0.0
            }
            _ => false,
        }
    }

    /// New piece holding only `cells` (in the given order), their points
    /// renumbered compactly in first-use order, and the fields in `keep`.
    pub fn extract_cells(&self, cells: &[usize], keep: &[&str]) -> Result<Self, MeshCmfeError> {
        let g = &self.geometry;
        let mut remap: HashMap<usize, usize> = HashMap::new();
        let mut old_points = Vec::new();
        let mut sub = Geometry {
            points: Vec::new(),
            cell_types: Vec::with_capacity(cells.len()),
            offsets: Vec::with_capacity(cells.len() + 1),
            connectivity: Vec::new(),
        };
        sub.offsets.push(0);
        for &c in cells {
            if c >= self.num_cells() {
                return Err(MeshCmfeError::OutOfRange {
                    index: c,
                    len: self.num_cells(),
                });
            }
            sub.cell_types.push(g.cell_types[c]);
            for &p in self.cell_points(c) {
                let next = old_points.len();
                let id = *remap.entry(p).or_insert_with(|| {
                    old_points.push(p);
                    next
                });
                sub.connectivity.push(id);
            }
            sub.offsets.push(sub.connectivity.len());
        }
        sub.points = old_points.iter().map(|&p| g.points[p]).collect();

        let mut out = Self::from_geometry(sub)?;
        for &name in keep {
            let Some(field) = self.field(name) else {
                continue;
            };
            let picked: &[usize] = match field.centering {
                Centering::Nodal => &old_points,
                Centering::Zonal => cells,
            };
            let mut data = Vec::with_capacity(picked.len() * field.components);
            for &i in picked {
                data.extend_from_slice(field.tuple(i));
            }
            out.add_field(name, Field::new(field.centering, field.components, data))?;
        }
        Ok(out)
    }

    /// Copy of field `name` expressed with `target` centering.
    ///
    /// Nodal to zonal averages each cell's vertices; zonal to nodal averages
    /// the cells incident to each point (points touching no cell get 0).
    pub fn recentered_field(&self, name: &str, target: Centering) -> Result<Field, MeshCmfeError> {
        let field = self.field(name).ok_or_else(|| MeshCmfeError::MissingField {
            name: name.to_string(),
        })?;
        let nc = field.components;
        match (field.centering, target) {
            (Centering::Nodal, Centering::Zonal) => {
                let mut data = vec![0.0; self.num_cells() * nc];
                for c in 0..self.num_cells() {
                    let ids = self.cell_points(c);
                    let inv = 1.0 / ids.len().max(1) as f64;
                    let out = &mut data[c * nc..(c + 1) * nc];
                    for &p in ids {
                        for (o, v) in out.iter_mut().zip(field.tuple(p)) {
                            *o += v * inv;
                        }
                    }
                }
                Ok(Field::new(Centering::Zonal, nc, data))
            }
            (Centering::Zonal, Centering::Nodal) => {
                let mut data = vec![0.0; self.num_points() * nc];
                let mut hits = vec![0usize; self.num_points()];
                for c in 0..self.num_cells() {
                    for &p in self.cell_points(c) {
                        hits[p] += 1;
                        for (o, v) in data[p * nc..(p + 1) * nc].iter_mut().zip(field.tuple(c)) {
                            *o += v;
                        }
                    }
                }
                for (p, &n) in hits.iter().enumerate() {
                    if n > 1 {
                        let inv = 1.0 / n as f64;
                        data[p * nc..(p + 1) * nc].iter_mut().for_each(|v| *v *= inv);
                    }
                }
                Ok(Field::new(Centering::Nodal, nc, data))
            }
            _ => Ok(field.clone()),
        }
    }

    pub(crate) fn from_shared(geometry: Geometry, fields: BTreeMap<String, Field>) -> Result<Self, MeshCmfeError> {
        let mut piece = Self::from_geometry(geometry)?;
        for (name, field) in fields {
            piece.add_field(name, field)?;
        }
        Ok(piece)
    }

    pub(crate) fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Whether two pieces share the same geometry allocation.
    pub fn shares_geometry_with(&self, other: &MeshPiece) -> bool {
        Arc::ptr_eq(&self.geometry, &other.geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two unit quads side by side: points 0..6, cells [0,1,4,3] and [1,2,5,4].
    fn two_quads() -> MeshPiece {
        let points = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [1.0, 1.0, 0.0],
            [2.0, 1.0, 0.0],
        ];
        MeshPiece::new(
            points,
            vec![
                (CellType::Quadrilateral, vec![0, 1, 4, 3]),
                (CellType::Quadrilateral, vec![1, 2, 5, 4]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn malformed_connectivity_is_rejected() {
        let err = MeshPiece::new(vec![[0.0; 3]], vec![(CellType::Segment, vec![0, 1])]).unwrap_err();
        assert!(matches!(err, MeshCmfeError::InvalidGeometry(_)));
        let err = MeshPiece::new(vec![[0.0; 3]; 3], vec![(CellType::Triangle, vec![0, 1])]).unwrap_err();
        assert!(matches!(err, MeshCmfeError::InvalidGeometry(_)));
    }

    #[test]
    fn non_finite_points_are_rejected() {
        let err = MeshPiece::new(vec![[f64::NAN, 0.5, 0.5]], vec![(CellType::Vertex, vec![0])]).unwrap_err();
        assert!(matches!(err, MeshCmfeError::InvalidGeometry(_)));
        let err = MeshPiece::new(vec![[0.0, f64::INFINITY, 0.0]], Vec::new()).unwrap_err();
        assert!(matches!(err, MeshCmfeError::InvalidGeometry(_)));
    }

    #[test]
    fn field_length_is_checked() {
        let mut m = two_quads();
        let err = m
            .add_field("t", Field::scalar(Centering::Zonal, vec![1.0]))
            .unwrap_err();
        assert_eq!(
            err,
            MeshCmfeError::FieldLength {
                name: "t".into(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn with_field_is_shallow() {
        let m = two_quads();
        let out = m
            .with_field("t", Field::scalar(Centering::Zonal, vec![1.0, 2.0]))
            .unwrap();
        assert!(out.shares_geometry_with(&m));
        assert!(out.has_field("t"));
        assert!(!m.has_field("t"));
    }

    #[test]
    fn cell_bounds_and_centroid() {
        let m = two_quads();
        assert_eq!(m.cell_bounds(1), Aabb::new([1.0, 0.0, 0.0], [2.0, 1.0, 0.0]));
        assert_eq!(m.cell_centroid(0), [0.5, 0.5, 0.0]);
    }

    #[test]
    fn extract_keeps_requested_fields_only() {
        let mut m = two_quads();
        m.add_field("n", Field::scalar(Centering::Nodal, (0..6).map(f64::from).collect()))
            .unwrap();
        m.add_field("z", Field::scalar(Centering::Zonal, vec![10.0, 20.0]))
            .unwrap();
        let sub = m.extract_cells(&[1], &["n", "z"]).unwrap();
        assert_eq!(sub.num_cells(), 1);
        assert_eq!(sub.num_points(), 4);
        assert_eq!(sub.cell_points(0), &[0, 1, 2, 3]);
        assert_eq!(sub.field("n").unwrap().data, vec![1.0, 2.0, 5.0, 4.0]);
        assert_eq!(sub.field("z").unwrap().data, vec![20.0]);

        let bare = m.extract_cells(&[0], &["z"]).unwrap();
        assert!(!bare.has_field("n"));
    }

    #[test]
    fn recentering_both_ways() {
        let mut m = two_quads();
        m.add_field("z", Field::scalar(Centering::Zonal, vec![2.0, 4.0]))
            .unwrap();
        let nodal = m.recentered_field("z", Centering::Nodal).unwrap();
        // shared points 1 and 4 average both cells
        assert_eq!(nodal.data, vec![2.0, 3.0, 4.0, 2.0, 3.0, 4.0]);
        let back = {
            let mut n = m.clone();
            n.add_field("n", nodal).unwrap();
            n.recentered_field("n", Centering::Zonal).unwrap()
        };
        assert_eq!(back.data, vec![2.5, 3.5]);
    }

    #[test]
    fn ghost_mask() {
        let mut m = two_quads();
        assert!(!m.is_ghost("ghost", 0));
        m.add_field("ghost", Field::scalar(Centering::Zonal, vec![0.0, 1.0]))
            .unwrap();
        assert!(!m.is_ghost("ghost", 0));
        assert!(m.is_ghost("ghost", 1));
    }
}
