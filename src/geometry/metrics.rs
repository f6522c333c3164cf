//! Reference-element mappings and exact point-in-cell location.
//!
//! The reference elements use the following vertex ordering:
//! - Segment: `[v0, v1]` with `r \in [0, 1]`.
//! - Triangle: `[v0, v1, v2]` with `(r, s)` in the unit right triangle.
//! - Quadrilateral: `[v0, v1, v2, v3]` with `(r, s)` in `[0, 1]^2`.
//! - Tetrahedron: `[v0, v1, v2, v3]` with `(r, s, t)` in the unit tetrahedron.
//! - Hexahedron: `[v0, .., v7]` with `(r, s, t)` in `[0, 1]^3`, bottom face first.
//! - Prism: `[v0, .., v5]` with `(r, s)` in the unit triangle and `t` in `[0, 1]`.
//! - Pyramid: `[v0, .., v4]` with `(r, s)` in `[0, 1]^2` and apex at `t = 1`.
//!
//! Natural coordinates are always returned as `[f64; 3]`; components beyond
//! the cell dimension are zero. Lower-dimensional cells may be embedded in 3-D,
//! in which case the inverse map is a least-squares fit and containment also
//! requires the fit residual (distance to the cell) to be small.

use crate::mesh_error::MeshCmfeError;
use crate::topology::cell_type::CellType;

const EPS: f64 = 1e-14;
const NEWTON_ITERS: usize = 25;

/// Where a point sits inside a cell.
#[derive(Clone, Debug, PartialEq)]
pub struct CellLocation {
    /// Natural (reference) coordinates of the point.
    pub natural: [f64; 3],
    /// One interpolation weight per cell vertex; they sum to 1.
    pub weights: Vec<f64>,
}

/// Shape function values and reference gradients at `r`.
pub fn shape_functions(cell_type: CellType, r: [f64; 3]) -> (Vec<f64>, Vec<[f64; 3]>) {
    let [r, s, t] = r;
    match cell_type {
        CellType::Vertex => (vec![1.0], vec![[0.0; 3]]),
        CellType::Segment => (vec![1.0 - r, r], vec![[-1.0, 0.0, 0.0], [1.0, 0.0, 0.0]]),
        CellType::Triangle => (
            vec![1.0 - r - s, r, s],
            vec![[-1.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        ),
        CellType::Quadrilateral => {
            let (rm, sm) = (1.0 - r, 1.0 - s);
            (
                vec![rm * sm, r * sm, r * s, rm * s],
                vec![[-sm, -rm, 0.0], [sm, -r, 0.0], [s, r, 0.0], [-s, rm, 0.0]],
            )
        }
        CellType::Tetrahedron => (
            vec![1.0 - r - s - t, r, s, t],
            vec![
                [-1.0, -1.0, -1.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
            ],
        ),
        CellType::Hexahedron => {
            let (rm, sm, tm) = (1.0 - r, 1.0 - s, 1.0 - t);
            (
                vec![
                    rm * sm * tm,
                    r * sm * tm,
                    r * s * tm,
                    rm * s * tm,
                    rm * sm * t,
                    r * sm * t,
                    r * s * t,
                    rm * s * t,
                ],
                vec![
                    [-sm * tm, -rm * tm, -rm * sm],
                    [sm * tm, -r * tm, -r * sm],
                    [s * tm, r * tm, -r * s],
                    [-s * tm, rm * tm, -rm * s],
                    [-sm * t, -rm * t, rm * sm],
                    [sm * t, -r * t, r * sm],
                    [s * t, r * t, r * s],
                    [-s * t, rm * t, rm * s],
                ],
            )
        }
        CellType::Prism => {
            let (u, tm) = (1.0 - r - s, 1.0 - t);
            (
                vec![u * tm, r * tm, s * tm, u * t, r * t, s * t],
                vec![
                    [-tm, -tm, -u],
                    [tm, 0.0, -r],
                    [0.0, tm, -s],
                    [-t, -t, u],
                    [t, 0.0, r],
                    [0.0, t, s],
                ],
            )
        }
        CellType::Pyramid => {
            let (rm, sm, tm) = (1.0 - r, 1.0 - s, 1.0 - t);
            (
                vec![tm * rm * sm, tm * r * sm, tm * r * s, tm * rm * s, t],
                vec![
                    [-tm * sm, -tm * rm, -rm * sm],
                    [tm * sm, -tm * r, -r * sm],
                    [tm * s, tm * r, -r * s],
                    [-tm * s, tm * rm, -rm * s],
                    [0.0, 0.0, 1.0],
                ],
            )
        }
    }
}

fn check_vertices(cell_type: CellType, vertices: &[[f64; 3]]) -> Result<(), MeshCmfeError> {
    let expected = cell_type.vertex_count();
    if vertices.len() != expected {
        return Err(MeshCmfeError::InvalidGeometry(format!(
            "{cell_type:?} needs {expected} vertices, got {}",
            vertices.len()
        )));
    }
    Ok(())
}

/// Map a point in reference coordinates to physical coordinates.
pub fn reference_to_physical(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    r: [f64; 3],
) -> Result<[f64; 3], MeshCmfeError> {
    check_vertices(cell_type, vertices)?;
    let (weights, _) = shape_functions(cell_type, r);
    Ok(weighted_sum(&weights, vertices))
}

fn weighted_sum(weights: &[f64], vertices: &[[f64; 3]]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (w, v) in weights.iter().zip(vertices) {
        out[0] += w * v[0];
        out[1] += w * v[1];
        out[2] += w * v[2];
    }
    out
}

/// Map a physical point back to reference coordinates with Gauss-Newton.
///
/// Returns the reference point and the remaining physical-space residual.
/// For 3-D cells the residual is ~0 whenever the iteration converged; for
/// embedded 1-D/2-D cells it is the distance from the point to the cell's
/// line/surface.
pub fn physical_to_reference(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    x: [f64; 3],
) -> Result<([f64; 3], f64), MeshCmfeError> {
    check_vertices(cell_type, vertices)?;
    let dim = cell_type.dimension();
    let mut r = cell_type.reference_centre();
    if dim == 0 {
        return Ok((r, norm(sub(x, vertices[0]))));
    }
    for _ in 0..NEWTON_ITERS {
        let (weights, grads) = shape_functions(cell_type, r);
        let mapped = weighted_sum(&weights, vertices);
        let res = sub(x, mapped);

        // columns of the 3 x dim Jacobian
        let mut cols = [[0.0; 3]; 3];
        for (v, g) in vertices.iter().zip(&grads) {
            for (k, col) in cols.iter_mut().enumerate().take(dim) {
                col[0] += v[0] * g[k];
                col[1] += v[1] * g[k];
                col[2] += v[2] * g[k];
            }
        }
        let step = solve_normal_equations(&cols[..dim], res)?;
        let mut step_norm = 0.0;
        for k in 0..dim {
            r[k] += step[k];
            step_norm += step[k] * step[k];
        }
        if step_norm.sqrt() <= 1e-13 {
            break;
        }
    }
    let (weights, _) = shape_functions(cell_type, r);
    let residual = norm(sub(x, weighted_sum(&weights, vertices)));
    Ok((r, residual))
}

/// Solve `(J^T J) d = J^T res` for the `dim` columns of `J`.
fn solve_normal_equations(cols: &[[f64; 3]], res: [f64; 3]) -> Result<[f64; 3], MeshCmfeError> {
    let degenerate = || MeshCmfeError::InvalidGeometry("degenerate jacobian".into());
    match cols.len() {
        1 => {
            let a = dot(cols[0], cols[0]);
            if a.abs() <= EPS {
                return Err(degenerate());
            }
            Ok([dot(cols[0], res) / a, 0.0, 0.0])
        }
        2 => {
            let a = dot(cols[0], cols[0]);
            let b = dot(cols[0], cols[1]);
            let c = dot(cols[1], cols[1]);
            let det = a * c - b * b;
            if det.abs() <= EPS * a.max(c).max(1.0) {
                return Err(degenerate());
            }
            let (r0, r1) = (dot(cols[0], res), dot(cols[1], res));
            Ok([(c * r0 - b * r1) / det, (a * r1 - b * r0) / det, 0.0])
        }
        3 => {
            // square system: solve J d = res directly (Cramer)
            let det = dot(cols[0], cross(cols[1], cols[2]));
            if det.abs() <= EPS {
                return Err(degenerate());
            }
            Ok([
                dot(res, cross(cols[1], cols[2])) / det,
                dot(cols[0], cross(res, cols[2])) / det,
                dot(cols[0], cross(cols[1], res)) / det,
            ])
        }
        n => Err(MeshCmfeError::InvalidGeometry(format!(
            "unsupported reference dimension: {n}"
        ))),
    }
}

/// Whether reference coordinates lie inside the reference element, with `tol` slack.
pub fn reference_contains(cell_type: CellType, r: [f64; 3], tol: f64) -> bool {
    let unit = |x: f64| x >= -tol && x <= 1.0 + tol;
    let [r, s, t] = r;
    match cell_type {
        CellType::Vertex => true,
        CellType::Segment => unit(r),
        CellType::Triangle => r >= -tol && s >= -tol && r + s <= 1.0 + tol,
        CellType::Quadrilateral => unit(r) && unit(s),
        CellType::Tetrahedron => r >= -tol && s >= -tol && t >= -tol && r + s + t <= 1.0 + tol,
        CellType::Hexahedron | CellType::Pyramid => unit(r) && unit(s) && unit(t),
        CellType::Prism => r >= -tol && s >= -tol && r + s <= 1.0 + tol && unit(t),
    }
}

/// Exact point-in-cell test.
///
/// Returns natural coordinates and interpolation weights when `x` lies in
/// the cell (within `tol` in reference space and `tol * diameter` off the
/// cell manifold), `None` otherwise.
pub fn locate_in_cell(
    cell_type: CellType,
    vertices: &[[f64; 3]],
    x: [f64; 3],
    tol: f64,
) -> Result<Option<CellLocation>, MeshCmfeError> {
    check_vertices(cell_type, vertices)?;
    let (natural, residual) = match physical_to_reference(cell_type, vertices, x) {
        Ok(found) => found,
        // only a singular jacobian is left: a collapsed cell contains nothing
        Err(_) => return Ok(None),
    };
    if !reference_contains(cell_type, natural, tol) {
        return Ok(None);
    }
    let scale = diameter(vertices).max(f64::MIN_POSITIVE);
    if residual > tol * scale {
        return Ok(None);
    }
    let (weights, _) = shape_functions(cell_type, natural);
    Ok(Some(CellLocation { natural, weights }))
}

fn diameter(vertices: &[[f64; 3]]) -> f64 {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for v in vertices {
        for a in 0..3 {
            lo[a] = lo[a].min(v[a]);
            hi[a] = hi[a].max(v[a]);
        }
    }
    norm(sub(hi, lo))
}

fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}
