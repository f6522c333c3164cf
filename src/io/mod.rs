//! Byte encodings of mesh data exchanged between ranks.

pub mod fragment;

pub use fragment::{decode_fragment, encode_fragment};
