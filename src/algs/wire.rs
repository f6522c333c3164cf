//! Fixed, versioned, little-endian wire types for CMFE redistribution.
//!
//! Point and value traffic is a flat array of single-precision records per
//! destination (3 floats per point, N floats per value tuple) with no header:
//! the record count is the buffer length divided by the record size.
//! Mesh-fragment traffic is a versioned, length-prefixed list of opaque blobs.
//!
//! [`Envelope`] and [`BlobEnvelope`] keep the all-to-all-v mechanics generic:
//! callers push typed records per destination and get typed records back per
//! source, in the order they were pushed.

use crate::algs::communicator::{Communicator, agree_on};
use crate::mesh_error::MeshCmfeError;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Header kind of a mesh-fragment blob list.
pub const KIND_FRAGMENTS: u16 = 3;

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

/// Copy a byte buffer into freshly allocated, properly aligned records.
pub fn pod_vec_from_bytes<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, MeshCmfeError> {
    let rec = size_of::<T>();
    if rec == 0 || bytes.len() % rec != 0 {
        return Err(MeshCmfeError::WireFormat(format!(
            "buffer of {} bytes is not a whole number of {rec}-byte records",
            bytes.len()
        )));
    }
    let mut out = vec![T::zeroed(); bytes.len() / rec];
    bytemuck::cast_slice_mut(&mut out).copy_from_slice(bytes);
    Ok(out)
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), MeshCmfeError> {
    if actual == expected {
        Ok(())
    } else {
        Err(MeshCmfeError::WireFormat(format!(
            "expected {expected} bytes, got {actual}"
        )))
    }
}

/// Finite values saturate at `±f32::MAX`; infinities and NaN pass through,
/// so only the unresolved marker arrives as `+inf`.
#[inline]
fn f32_le(x: f64) -> u32 {
    let x = if x.is_finite() {
        x.clamp(-f64::from(f32::MAX), f64::from(f32::MAX))
    } else {
        x
    };
    (x as f32).to_bits().to_le()
}

#[inline]
fn from_f32_le(bits: u32) -> f64 {
    f32::from_bits(u32::from_le(bits)) as f64
}

// ===== Records =============================================================

/// A query point: three single-precision coordinates.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WirePoint {
    pub xyz_le: [u32; 3],
}

impl WirePoint {
    pub fn new(p: [f64; 3]) -> Self {
        Self {
            xyz_le: [f32_le(p[0]), f32_le(p[1]), f32_le(p[2])],
        }
    }
    pub fn get(&self) -> [f64; 3] {
        [
            from_f32_le(self.xyz_le[0]),
            from_f32_le(self.xyz_le[1]),
            from_f32_le(self.xyz_le[2]),
        ]
    }
}

/// One field component. Value tuples travel as `N` consecutive records.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireScalar {
    pub bits_le: u32,
}

impl WireScalar {
    pub fn new(x: f64) -> Self {
        Self { bits_le: f32_le(x) }
    }
    pub fn get(&self) -> f64 {
        from_f32_le(self.bits_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32, // future use; keep zero
}

impl WireHdr {
    pub fn new(kind: u16) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
        }
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Result<Self, MeshCmfeError> {
        let n = u32::try_from(n).map_err(|_| {
            MeshCmfeError::WireFormat(format!("count {n} does not fit in a 32-bit wire field"))
        })?;
        Ok(Self { n_le: n.to_le() })
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

const_assert_eq!(size_of::<WirePoint>(), 12);
const_assert_eq!(size_of::<WireScalar>(), 4);
const_assert_eq!(size_of::<WireHdr>(), 8);
const_assert_eq!(size_of::<WireCount>(), 4);

// ===== Envelopes ===========================================================

/// Per-destination buffers of fixed-size records.
#[derive(Clone, Debug)]
pub struct Envelope<T: Pod> {
    slots: Vec<Vec<T>>,
}

impl<T: Pod> Envelope<T> {
    pub fn new(ranks: usize) -> Self {
        Self {
            slots: vec![Vec::new(); ranks],
        }
    }

    #[inline]
    pub fn push(&mut self, dest: usize, rec: T) {
        self.slots[dest].push(rec);
    }

    pub fn extend(&mut self, dest: usize, recs: impl IntoIterator<Item = T>) {
        self.slots[dest].extend(recs);
    }

    /// Number of records queued for each destination.
    pub fn counts(&self) -> Vec<usize> {
        self.slots.iter().map(Vec::len).collect()
    }

    pub fn into_buffers(self) -> Vec<Vec<u8>> {
        self.slots
            .into_iter()
            .map(|s| cast_slice(&s).to_vec())
            .collect()
    }

    /// Decode received buffers, one per source rank.
    pub fn unpack(bufs: &[Vec<u8>]) -> Result<Vec<Vec<T>>, MeshCmfeError> {
        bufs.iter().map(|b| pod_vec_from_bytes(b)).collect()
    }

    /// Send every slot to its destination and return what each source sent us.
    /// A malformed buffer on any rank fails the exchange on every rank.
    pub fn exchange<C>(self, comm: &C) -> Result<Vec<Vec<T>>, MeshCmfeError>
    where
        C: Communicator + ?Sized,
    {
        let received = comm.all_to_all_v(self.into_buffers())?;
        agree_on(comm, Self::unpack(&received))
    }
}

/// Per-destination lists of opaque byte blobs.
#[derive(Clone, Debug)]
pub struct BlobEnvelope {
    slots: Vec<Vec<Vec<u8>>>,
}

impl BlobEnvelope {
    pub fn new(ranks: usize) -> Self {
        Self {
            slots: vec![Vec::new(); ranks],
        }
    }

    pub fn push(&mut self, dest: usize, blob: Vec<u8>) {
        self.slots[dest].push(blob);
    }

    pub fn counts(&self) -> Vec<usize> {
        self.slots.iter().map(Vec::len).collect()
    }

    /// Layout: `WireHdr`, `WireCount n`, `n` x `WireCount len`, blob bytes.
    pub fn into_buffers(self) -> Result<Vec<Vec<u8>>, MeshCmfeError> {
        self.slots
            .into_iter()
            .map(|blobs| {
                let body: usize = blobs.iter().map(Vec::len).sum();
                let mut buf = Vec::with_capacity(
                    size_of::<WireHdr>() + size_of::<WireCount>() * (blobs.len() + 1) + body,
                );
                buf.extend_from_slice(cast_slice(&[WireHdr::new(KIND_FRAGMENTS)]));
                buf.extend_from_slice(cast_slice(&[WireCount::new(blobs.len())?]));
                let lens = blobs
                    .iter()
                    .map(|b| WireCount::new(b.len()))
                    .collect::<Result<Vec<_>, _>>()?;
                buf.extend_from_slice(cast_slice(&lens));
                for b in &blobs {
                    buf.extend_from_slice(b);
                }
                Ok(buf)
            })
            .collect()
    }

    pub fn unpack(bufs: &[Vec<u8>]) -> Result<Vec<Vec<Vec<u8>>>, MeshCmfeError> {
        bufs.iter().map(|b| unpack_blobs(b)).collect()
    }

    pub fn exchange<C>(self, comm: &C) -> Result<Vec<Vec<Vec<u8>>>, MeshCmfeError>
    where
        C: Communicator + ?Sized,
    {
        let buffers = agree_on(comm, self.into_buffers())?;
        let received = comm.all_to_all_v(buffers)?;
        agree_on(comm, Self::unpack(&received))
    }
}

fn unpack_blobs(buf: &[u8]) -> Result<Vec<Vec<u8>>, MeshCmfeError> {
    let hdr_len = size_of::<WireHdr>();
    let cnt_len = size_of::<WireCount>();
    if buf.len() < hdr_len + cnt_len {
        return Err(MeshCmfeError::WireFormat(format!(
            "blob list of {} bytes is shorter than its header",
            buf.len()
        )));
    }
    let hdr: WireHdr = pod_vec_from_bytes(&buf[..hdr_len])?[0];
    if hdr.version() != WIRE_VERSION || hdr.kind() != KIND_FRAGMENTS {
        return Err(MeshCmfeError::WireFormat(format!(
            "unexpected header: version {} kind {}",
            hdr.version(),
            hdr.kind()
        )));
    }
    let n = pod_vec_from_bytes::<WireCount>(&buf[hdr_len..hdr_len + cnt_len])?[0].get();
    let lens_start = hdr_len + cnt_len;
    let lens_end = lens_start + n * cnt_len;
    if buf.len() < lens_end {
        return Err(MeshCmfeError::WireFormat(format!(
            "blob list truncated: {n} lengths do not fit in {} bytes",
            buf.len()
        )));
    }
    let lens: Vec<WireCount> = pod_vec_from_bytes(&buf[lens_start..lens_end])?;
    let body: usize = lens.iter().map(WireCount::get).sum();
    expect_exact_len(buf.len(), lens_end + body)?;

    let mut out = Vec::with_capacity(n);
    let mut at = lens_end;
    for len in lens {
        let len = len.get();
        out.push(buf[at..at + len].to_vec());
        at += len;
    }
    Ok(out)
}
