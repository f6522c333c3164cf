#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-cmfe
//!
//! mesh-cmfe evaluates a field defined on one decomposed unstructured mesh at
//! the points of a second, independently decomposed mesh. It runs on any
//! number of cooperating ranks: query points and source cells are moved to the
//! owner of a balanced spatial partition, evaluated exactly there, and the
//! results travel back to the ranks that asked.
//!
//! ## Features
//! - Histogram-driven recursive spatial partitioning with one batched
//!   reduction per round
//! - Exact point-in-cell location for linear segments, triangles, quads,
//!   tetrahedra, hexahedra, prisms and pyramids
//! - Pluggable communication backends (serial, in-process threads, MPI)
//! - Default-variable fallback for points outside the source mesh
//!
//! ## Determinism
//!
//! Every split decision is made from globally reduced histograms, so all
//! ranks build the same partition and issue the same collectives. Running on
//! one rank gives the same values as running on many, up to the single
//! precision used on the wire.
//!
//! ## Usage
//! Add `mesh-cmfe` as a dependency in your `Cargo.toml` and enable features as needed:
//!
//! ```toml
//! [dependencies]
//! mesh-cmfe = "0.3"
//! # Optional features:
//! # features = ["mpi-support","rayon"]
//! ```
//!
//! ```no_run
//! use mesh_cmfe::prelude::*;
//!
//! # fn run(target: &MeshTree, source: &MeshTree) -> Result<MeshTree, MeshCmfeError> {
//! let cfg = CmfeConfig::new("pressure", "pressure_on_target", "pressure_default");
//! evaluate_position_cmfe(target, source, &cfg, &NoComm)
//! # }
//! ```

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod geometry;
pub mod io;
pub mod mesh_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, LocalComm, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::field_transfer::{CmfeConfig, evaluate_position_cmfe};
    pub use crate::algs::partition::{
        CellOwner, PartitionConfig, SpatialPartition, create_partition,
    };
    pub use crate::algs::point_set::PointSet;
    pub use crate::algs::spatial_index::SpatialIndex;
    pub use crate::data::{Centering, Field, MeshPiece, MeshTree};
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::geometry::Aabb;
    pub use crate::mesh_error::MeshCmfeError;
    pub use crate::topology::cell_type::CellType;
}
