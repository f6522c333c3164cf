//! Data module: mesh pieces, their fields, and piece collections.

pub mod mesh_piece;
pub mod mesh_tree;

pub use mesh_piece::{Centering, Field, Geometry, MeshPiece};
pub use mesh_tree::MeshTree;
