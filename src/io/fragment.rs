//! Opaque byte encoding of mesh pieces for shipping between ranks.
//!
//! A fragment carries the geometry and a chosen subset of fields, serialized
//! with bincode behind a small versioned header. Receivers only decode; they
//! never need to know which rank produced the bytes.

use crate::data::mesh_piece::{Field, Geometry, MeshPiece};
use crate::mesh_error::MeshCmfeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const FRAGMENT_FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct FragmentRef<'a> {
    version: u32,
    geometry: &'a Geometry,
    fields: BTreeMap<&'a str, &'a Field>,
}

#[derive(Deserialize)]
struct FragmentOwned {
    version: u32,
    geometry: Geometry,
    fields: BTreeMap<String, Field>,
}

/// Serialize `piece`, keeping only the fields named in `keep` that exist.
pub fn encode_fragment(piece: &MeshPiece, keep: &[&str]) -> Result<Vec<u8>, MeshCmfeError> {
    let fields = piece
        .fields()
        .filter(|(name, _)| keep.contains(name))
        .collect();
    let frag = FragmentRef {
        version: FRAGMENT_FORMAT_VERSION,
        geometry: piece.geometry(),
        fields,
    };
    Ok(bincode::serialize(&frag)?)
}

/// Rebuild a piece from bytes written by [`encode_fragment`].
pub fn decode_fragment(bytes: &[u8]) -> Result<MeshPiece, MeshCmfeError> {
    let frag: FragmentOwned = bincode::deserialize(bytes)?;
    if frag.version != FRAGMENT_FORMAT_VERSION {
        return Err(MeshCmfeError::Serialization(format!(
            "fragment format version {} (expected {FRAGMENT_FORMAT_VERSION})",
            frag.version
        )));
    }
    MeshPiece::from_shared(frag.geometry, frag.fields)
}
