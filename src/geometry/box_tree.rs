//! R-tree over axis-aligned boxes.
//!
//! A thin wrapper over [`rstar::RTree`] that remembers the id each box was
//! given at build time. Queries return ids in ascending order, so callers that
//! pick "the lowest id" never depend on the tree layout. Empty boxes keep
//! their id but are not indexed and never match.

use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{AABB, RTree};

use super::bbox::Aabb;

type Entry = GeomWithData<Rectangle<[f64; 3]>, usize>;

/// Bulk-loaded box index answering "which boxes contain this point" and
/// "which boxes overlap this box".
#[derive(Clone, Debug)]
pub struct BoxTree {
    boxes: Vec<Aabb>,
    tree: RTree<Entry>,
}

impl Default for BoxTree {
    fn default() -> Self {
        Self::from_boxes(Vec::new())
    }
}

fn envelope(b: &Aabb) -> AABB<[f64; 3]> {
    AABB::from_corners(b.min, b.max)
}

impl BoxTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list of boxes; box `i` gets id `i`.
    pub fn from_boxes(boxes: Vec<Aabb>) -> Self {
        let entries: Vec<Entry> = boxes
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(id, b)| GeomWithData::new(Rectangle::from_corners(b.min, b.max), id))
            .collect();
        Self {
            boxes,
            tree: RTree::bulk_load(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Aabb> {
        self.boxes.get(id)
    }

    /// Union of every box (empty when nothing is indexed).
    pub fn bounds(&self) -> Aabb {
        self.boxes.iter().fold(Aabb::empty(), |acc, b| acc.union(b))
    }

    /// Ids of every box containing `p`, ascending.
    pub fn query_point(&self, p: [f64; 3], results: &mut Vec<usize>) {
        results.clear();
        if p.iter().any(|c| c.is_nan()) {
            return;
        }
        results.extend(
            self.tree
                .locate_in_envelope_intersecting(&AABB::from_point(p))
                .map(|e| e.data),
        );
        results.sort_unstable();
    }

    /// Ids of every box overlapping `q` (shared faces count), ascending.
    pub fn query_box(&self, q: &Aabb, results: &mut Vec<usize>) {
        results.clear();
        if q.is_empty() || q.min.iter().chain(&q.max).any(|c| c.is_nan()) {
            return;
        }
        results.extend(
            self.tree
                .locate_in_envelope_intersecting(&envelope(q))
                .map(|e| e.data),
        );
        results.sort_unstable();
    }
}
