//! Axis-aligned bounding boxes in 3-D.
//!
//! 2-D data is carried with `z = 0`; a box that is flat along an axis is still
//! a valid box and contains points on its plane.

use serde::{Deserialize, Serialize};

/// Closed axis-aligned box `[min, max]`. An *empty* box has `min > max` on
/// every axis and is the identity of [`Aabb::union`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for Aabb {
    fn default() -> Self {
        Self::empty()
    }
}

impl Aabb {
    pub const fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    pub const fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    /// Smallest box containing every point (empty for no points).
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a [f64; 3]>) -> Self {
        let mut b = Self::empty();
        for p in points {
            b.include(*p);
        }
        b
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|a| self.min[a] > self.max[a])
    }

    pub fn include(&mut self, p: [f64; 3]) {
        for a in 0..3 {
            self.min[a] = self.min[a].min(p[a]);
            self.max[a] = self.max[a].max(p[a]);
        }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        let mut out = *self;
        for a in 0..3 {
            out.min[a] = out.min[a].min(other.min[a]);
            out.max[a] = out.max[a].max(other.max[a]);
        }
        out
    }

    #[inline]
    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|a| self.min[a] <= p[a] && p[a] <= self.max[a])
    }

    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        (0..3).all(|a| self.min[a] <= other.max[a] && other.min[a] <= self.max[a])
    }

    pub fn centre(&self) -> [f64; 3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    #[inline]
    pub fn extent(&self, axis: usize) -> f64 {
        self.max[axis] - self.min[axis]
    }

    /// Length of the diagonal; 0 for empty or point boxes.
    pub fn diagonal(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        (0..3).map(|a| self.extent(a).powi(2)).sum::<f64>().sqrt()
    }

    /// Grow the box by `pad` on both sides of `axis`.
    pub fn pad_axis(&mut self, axis: usize, pad: f64) {
        self.min[axis] -= pad;
        self.max[axis] += pad;
    }

    /// Split at `at` along `axis` into a lower and an upper box sharing a face.
    pub fn split(&self, axis: usize, at: f64) -> (Aabb, Aabb) {
        let mut lo = *self;
        let mut hi = *self;
        lo.max[axis] = at;
        hi.min[axis] = at;
        (lo, hi)
    }
}
