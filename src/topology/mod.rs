//! Top-level module for mesh topology metadata.
//!
//! Only cell kinds are needed here; connectivity lives with the mesh pieces
//! in [`crate::data`].

pub mod cell_type;

pub use cell_type::CellType;
