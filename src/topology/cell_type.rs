//! Cell type metadata for mesh cells.

use serde::{Deserialize, Serialize};

/// Linear cell types understood by the point-in-cell evaluator.
///
/// Vertex ordering follows the reference elements documented in
/// [`crate::geometry::metrics`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum CellType {
    /// 0D vertex.
    Vertex,
    /// 1D segment/edge.
    Segment,
    /// 2D simplex (triangle).
    Triangle,
    /// 2D tensor-product cell (quad).
    Quadrilateral,
    /// 3D simplex (tet).
    Tetrahedron,
    /// 3D tensor-product cell (hex).
    Hexahedron,
    /// 3D wedge/prism.
    Prism,
    /// 3D pyramid.
    Pyramid,
}

impl Default for CellType {
    fn default() -> Self {
        CellType::Vertex
    }
}

impl CellType {
    /// Topological dimension of the cell.
    pub fn dimension(self) -> usize {
        match self {
            CellType::Vertex => 0,
            CellType::Segment => 1,
            CellType::Triangle | CellType::Quadrilateral => 2,
            CellType::Tetrahedron | CellType::Hexahedron | CellType::Prism | CellType::Pyramid => 3,
        }
    }

    /// Number of vertices in the connectivity of one cell.
    pub fn vertex_count(self) -> usize {
        match self {
            CellType::Vertex => 1,
            CellType::Segment => 2,
            CellType::Triangle => 3,
            CellType::Quadrilateral | CellType::Tetrahedron => 4,
            CellType::Pyramid => 5,
            CellType::Prism => 6,
            CellType::Hexahedron => 8,
        }
    }

    /// A point strictly inside the reference element; Newton starts here.
    pub fn reference_centre(self) -> [f64; 3] {
        match self {
            CellType::Vertex => [0.0; 3],
            CellType::Segment => [0.5, 0.0, 0.0],
            CellType::Triangle => [1.0 / 3.0, 1.0 / 3.0, 0.0],
            CellType::Quadrilateral => [0.5, 0.5, 0.0],
            CellType::Tetrahedron => [0.25, 0.25, 0.25],
            CellType::Hexahedron => [0.5, 0.5, 0.5],
            CellType::Prism => [1.0 / 3.0, 1.0 / 3.0, 0.5],
            CellType::Pyramid => [0.5, 0.5, 0.2],
        }
    }
}
