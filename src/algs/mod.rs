//! Re-export public algorithms.

pub mod communicator;
pub mod field_transfer;
pub mod partition;
pub mod point_set;
pub mod spatial_index;
pub mod wire;

pub use field_transfer::{CmfeConfig, evaluate_position_cmfe};
pub use partition::{SpatialPartition, create_partition};
