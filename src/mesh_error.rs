//! MeshCmfeError: Unified error type for mesh-cmfe public APIs
//!
//! Configuration errors (empty source, degenerate or missing variables) and
//! invariant violations (a point owned by no partition box) are fatal and are
//! returned identically on every rank. A point that falls outside every source
//! cell is *not* an error; it is recorded as unresolved and later filled from
//! the default variable.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for cross-mesh field evaluation.
///
/// Serializable so that a failure detected on one rank can be handed to every
/// other rank before the next collective.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshCmfeError {
    /// The source collection is empty on every rank.
    #[error("no source data: the source collection is empty on every process")]
    NoSourceData,
    /// The requested variable resolved to zero components on every rank.
    #[error("degenerate variable `{name}`: no source piece provides any components")]
    DegenerateVariable { name: String },
    /// A target piece needs the fallback value but does not carry the default variable.
    #[error("missing default variable `{name}`: required to fill points outside the source mesh")]
    MissingDefaultVariable { name: String },
    /// A named field is not present on a mesh piece.
    #[error("mesh piece has no field named `{name}`")]
    MissingField { name: String },
    /// A field's data length does not match its centering and component count.
    #[error("field `{name}` has {actual} values, expected {expected}")]
    FieldLength {
        name: String,
        expected: usize,
        actual: usize,
    },
    /// Flattened point / dataset index outside `[0, len)`.
    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },
    /// A partition contract was broken (e.g. a point owned by zero boxes).
    #[error("improper use: {0}")]
    ImproperUse(String),
    /// Malformed cell connectivity, unsupported cell, or degenerate mapping.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),
    /// Transport-level failure while talking to `neighbor`.
    #[error("communication error with rank {neighbor}: {detail}")]
    CommError { neighbor: usize, detail: String },
    /// A received buffer does not match the fixed wire layout.
    #[error("wire format error: {0}")]
    WireFormat(String),
    /// Encoding or decoding an opaque mesh fragment failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for MeshCmfeError {
    fn from(e: bincode::Error) -> Self {
        MeshCmfeError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn comm_error_carries_text_detail() {
        let e = MeshCmfeError::CommError {
            neighbor: 3,
            detail: "no message for collective #7".into(),
        };
        assert_eq!(
            e.to_string(),
            "communication error with rank 3: no message for collective #7"
        );
        assert!(e.source().is_none());
    }

    #[test]
    fn errors_survive_bincode() {
        let e = MeshCmfeError::FieldLength {
            name: "u".into(),
            expected: 8,
            actual: 7,
        };
        let back: MeshCmfeError = bincode::deserialize(&bincode::serialize(&e).unwrap()).unwrap();
        assert_eq!(back, e);
    }
}
