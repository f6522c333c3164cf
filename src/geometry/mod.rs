//! Geometry utilities for mesh-cmfe.
//!
//! Bounding boxes, the R-tree used both for source cells and for
//! partition boxes, and exact point-in-cell location.

pub mod bbox;
pub mod box_tree;
pub mod metrics;

pub use bbox::Aabb;
pub use box_tree::BoxTree;
