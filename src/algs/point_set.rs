//! Query points and their value buffer.
//!
//! Points are registered in groups (one per target piece) and addressed
//! through a flattened index `[0, len)`. Each point owns `components`
//! consecutive values; a first component of `+inf` marks it unresolved.
//!
//! [`PointSet::redistribute`] ships every point to the rank whose partition
//! box contains it. While redistributed, group `r` holds the points received
//! from rank `r`. [`PointSet::unredistribute`] sends the values back along the
//! same routes and restores the original groups in their original order.

use crate::algs::communicator::{Communicator, agree_on};
use crate::algs::partition::SpatialPartition;
use crate::algs::wire::{Envelope, WirePoint, WireScalar, expect_exact_len};
use crate::debug_invariants::DebugInvariants;
use crate::mesh_error::MeshCmfeError;

/// Marker stored in the first component of an unresolved point.
pub const UNRESOLVED: f64 = f64::INFINITY;

#[derive(Clone, Debug)]
struct Routes {
    groups: Vec<Vec<[f64; 3]>>,
    /// Destination rank of every original point, in flattened order.
    owners: Vec<usize>,
    /// Points received from each rank.
    recv_counts: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct PointSet {
    components: usize,
    groups: Vec<Vec<[f64; 3]>>,
    offsets: Vec<usize>,
    points: Vec<[f64; 3]>,
    values: Vec<f64>,
    routes: Option<Routes>,
}

impl PointSet {
    /// An empty set whose points each carry `components` values.
    pub fn new(components: usize) -> Self {
        Self {
            components,
            offsets: vec![0],
            ..Default::default()
        }
    }

    pub fn components(&self) -> usize {
        self.components
    }

    /// Register one point group; returns its dataset index.
    pub fn add_group(&mut self, points: Vec<[f64; 3]>) -> usize {
        self.groups.push(points);
        self.groups.len() - 1
    }

    /// Flatten the groups and reset every value to unresolved.
    pub fn finalize(&mut self) {
        self.offsets.clear();
        self.offsets.push(0);
        self.points.clear();
        for g in &self.groups {
            self.points.extend_from_slice(g);
            self.offsets.push(self.points.len());
        }
        self.values = vec![0.0; self.points.len() * self.components];
        if self.components > 0 {
            self.values
                .chunks_exact_mut(self.components)
                .for_each(|v| v[0] = UNRESOLVED);
        }
    }

    /// Total number of flattened points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group_len(&self, dataset: usize) -> Option<usize> {
        self.groups.get(dataset).map(Vec::len)
    }

    pub fn is_redistributed(&self) -> bool {
        self.routes.is_some()
    }

    pub fn points(&self) -> &[[f64; 3]] {
        &self.points
    }

    pub fn point(&self, i: usize) -> Result<[f64; 3], MeshCmfeError> {
        self.points
            .get(i)
            .copied()
            .ok_or(MeshCmfeError::OutOfRange {
                index: i,
                len: self.points.len(),
            })
    }

    /// `(dataset, local)` of flattened index `i`.
    pub fn locate(&self, i: usize) -> Result<(usize, usize), MeshCmfeError> {
        if i >= self.points.len() {
            return Err(MeshCmfeError::OutOfRange {
                index: i,
                len: self.points.len(),
            });
        }
        let g = self.offsets.partition_point(|&o| o <= i) - 1;
        Ok((g, i - self.offsets[g]))
    }

    fn flat_index(&self, dataset: usize, local: usize) -> Result<usize, MeshCmfeError> {
        let groups = self.offsets.len().saturating_sub(1);
        if dataset >= groups {
            return Err(MeshCmfeError::OutOfRange {
                index: dataset,
                len: groups,
            });
        }
        let len = self.offsets[dataset + 1] - self.offsets[dataset];
        if local >= len {
            return Err(MeshCmfeError::OutOfRange { index: local, len });
        }
        Ok(self.offsets[dataset] + local)
    }

    /// Values of point `local` of group `dataset`.
    pub fn value(&self, dataset: usize, local: usize) -> Result<&[f64], MeshCmfeError> {
        let i = self.flat_index(dataset, local)?;
        Ok(&self.values[i * self.components..(i + 1) * self.components])
    }

    pub fn value_mut(&mut self, dataset: usize, local: usize) -> Result<&mut [f64], MeshCmfeError> {
        let i = self.flat_index(dataset, local)?;
        Ok(&mut self.values[i * self.components..(i + 1) * self.components])
    }

    /// Values of flattened point `i`.
    pub fn value_at(&self, i: usize) -> Result<&[f64], MeshCmfeError> {
        if i >= self.points.len() {
            return Err(MeshCmfeError::OutOfRange {
                index: i,
                len: self.points.len(),
            });
        }
        Ok(&self.values[i * self.components..(i + 1) * self.components])
    }

    pub fn set_value(&mut self, i: usize, v: &[f64]) -> Result<(), MeshCmfeError> {
        let len = self.points.len();
        if i >= len {
            return Err(MeshCmfeError::OutOfRange { index: i, len });
        }
        let out = &mut self.values[i * self.components..(i + 1) * self.components];
        let n = out.len().min(v.len());
        out[..n].copy_from_slice(&v[..n]);
        Ok(())
    }

    pub fn is_resolved(&self, i: usize) -> bool {
        self.components > 0
            && self
                .values
                .get(i * self.components)
                .is_some_and(|&v| v != UNRESOLVED)
    }

    /// Evaluate every point with `f`, which writes the point's values and
    /// reports whether it resolved. Points it does not resolve are marked
    /// unresolved. Returns the number of resolved points.
    pub fn resolve_each<F>(&mut self, f: F) -> usize
    where
        F: Fn([f64; 3], &mut [f64]) -> bool + Sync,
    {
        if self.components == 0 {
            return 0;
        }
        let visit = |(p, out): (&[f64; 3], &mut [f64])| {
            if f(*p, out) {
                1
            } else {
                out.fill(0.0);
                out[0] = UNRESOLVED;
                0
            }
        };
        #[cfg(feature = "rayon")]
        {
            use rayon::prelude::*;
            self.points
                .par_iter()
                .zip(self.values.par_chunks_exact_mut(self.components))
                .map(visit)
                .sum()
        }
        #[cfg(not(feature = "rayon"))]
        {
            self.points
                .iter()
                .zip(self.values.chunks_exact_mut(self.components))
                .map(visit)
                .sum()
        }
    }

    /// Send every point to the rank owning its location.
    ///
    /// Points are packed per destination in dataset order, then point order.
    /// Afterwards the set holds what was received (group `r` from rank `r`)
    /// and is finalized.
    pub fn redistribute<C: Communicator + ?Sized>(
        &mut self,
        partition: &SpatialPartition,
        comm: &C,
    ) -> Result<(), MeshCmfeError> {
        let ranks = comm.size();
        let packed = if self.routes.is_some() {
            Err(MeshCmfeError::ImproperUse("point set is already redistributed".into()))
        } else {
            if self.offsets.last().copied() != Some(self.groups.iter().map(Vec::len).sum()) {
                self.finalize();
            }
            self.pack_by_owner(partition, ranks)
        };
        let (env, owners) = agree_on(comm, packed)?;
        let sent = owners.len();
        let received = env.exchange(comm)?;
        let recv_counts: Vec<usize> = received.iter().map(Vec::len).collect();
        let groups = received
            .into_iter()
            .map(|recs| recs.iter().map(WirePoint::get).collect())
            .collect();
        let original = std::mem::replace(&mut self.groups, groups);
        self.routes = Some(Routes {
            groups: original,
            owners,
            recv_counts,
        });
        self.finalize();
        log::debug!(
            "[rank {}] point redistribution: sent {sent}, received {}",
            comm.rank(),
            self.points.len()
        );
        Ok(())
    }

    fn pack_by_owner(
        &self,
        partition: &SpatialPartition,
        ranks: usize,
    ) -> Result<(Envelope<WirePoint>, Vec<usize>), MeshCmfeError> {
        let mut env = Envelope::<WirePoint>::new(ranks);
        let mut owners = Vec::with_capacity(self.points.len());
        let mut scratch = Vec::new();
        for &p in &self.points {
            let dest = partition.processor_for_point_with(p, &mut scratch)?;
            if dest >= ranks {
                return Err(MeshCmfeError::ImproperUse(format!(
                    "partition rank {dest} outside communicator of size {ranks}"
                )));
            }
            env.push(dest, WirePoint::new(p));
            owners.push(dest);
        }
        Ok((env, owners))
    }

    /// Send values back to the ranks the points came from and restore the
    /// original groups, order and coordinates.
    pub fn unredistribute<C: Communicator + ?Sized>(&mut self, comm: &C) -> Result<(), MeshCmfeError> {
        let nc = self.components;
        let ranks = comm.size();
        let routes = self
            .routes
            .take()
            .ok_or_else(|| MeshCmfeError::ImproperUse("point set was not redistributed".into()))
            .and_then(|routes| {
                if routes.recv_counts.len() != ranks || self.groups.len() != ranks {
                    return Err(MeshCmfeError::ImproperUse(format!(
                        "redistributed over {} ranks, communicator has {ranks}",
                        routes.recv_counts.len()
                    )));
                }
                Ok(routes)
            });
        let routes = agree_on(comm, routes)?;

        let mut env = Envelope::<WireScalar>::new(ranks);
        for (src, &count) in routes.recv_counts.iter().enumerate() {
            let start = self.offsets[src] * nc;
            let vals = &self.values[start..start + count * nc];
            env.extend(src, vals.iter().map(|&v| WireScalar::new(v)));
        }
        let back = env.exchange(comm)?;

        let mut sent_to = vec![0usize; ranks];
        for &o in &routes.owners {
            sent_to[o] += 1;
        }
        let lengths = back
            .iter()
            .enumerate()
            .try_for_each(|(r, buf)| expect_exact_len(buf.len(), sent_to[r] * nc));
        agree_on(comm, lengths)?;

        self.groups = routes.groups;
        self.finalize();
        let mut cursor = vec![0usize; ranks];
        for (i, &o) in routes.owners.iter().enumerate() {
            let src = &back[o][cursor[o]..cursor[o] + nc];
            cursor[o] += nc;
            for (dst, rec) in self.values[i * nc..(i + 1) * nc].iter_mut().zip(src) {
                *dst = rec.get();
            }
        }
        Ok(())
    }
}

impl DebugInvariants for PointSet {
    fn debug_assert_invariants(&self) {
        crate::debug_invariants!(self.validate_invariants(), "PointSet");
    }

    fn validate_invariants(&self) -> Result<(), MeshCmfeError> {
        if self.offsets.first() != Some(&0) || self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(MeshCmfeError::ImproperUse(
                "point set offsets are not monotone".into(),
            ));
        }
        if self.offsets.last() != Some(&self.points.len()) {
            return Err(MeshCmfeError::ImproperUse(
                "point set offsets do not cover the points".into(),
            ));
        }
        if self.values.len() != self.points.len() * self.components {
            return Err(MeshCmfeError::ImproperUse(format!(
                "value buffer has {} entries for {} points x {} components",
                self.values.len(),
                self.points.len(),
                self.components
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::geometry::bbox::Aabb;

    fn two_groups() -> PointSet {
        let mut ps = PointSet::new(2);
        ps.add_group(vec![[0.0; 3], [1.0, 0.0, 0.0]]);
        ps.add_group(vec![[2.0, 0.0, 0.0]]);
        ps.finalize();
        ps
    }

    #[test]
    fn finalize_marks_everything_unresolved() {
        let ps = two_groups();
        assert_eq!(ps.len(), 3);
        assert!((0..3).all(|i| !ps.is_resolved(i)));
        assert_eq!(ps.value(1, 0).unwrap(), &[UNRESOLVED, 0.0]);
        ps.validate_invariants().unwrap();
    }

    #[test]
    fn indexing_errors() {
        let ps = two_groups();
        assert_eq!(ps.point(2).unwrap(), [2.0, 0.0, 0.0]);
        assert_eq!(ps.point(3), Err(MeshCmfeError::OutOfRange { index: 3, len: 3 }));
        assert_eq!(ps.value(2, 0), Err(MeshCmfeError::OutOfRange { index: 2, len: 2 }));
        assert!(ps.value(1, 1).is_err());
        assert_eq!(ps.locate(2).unwrap(), (1, 0));
    }

    #[test]
    fn empty_groups_keep_offsets_monotone() {
        let mut ps = PointSet::new(1);
        ps.add_group(Vec::new());
        ps.add_group(vec![[1.0; 3]]);
        ps.add_group(Vec::new());
        ps.finalize();
        assert_eq!(ps.locate(0).unwrap(), (1, 0));
        assert!(ps.value(2, 0).is_err());
        ps.validate_invariants().unwrap();
    }

    #[test]
    fn resolve_each_marks_misses() {
        let mut ps = two_groups();
        let hits = ps.resolve_each(|p, out| {
            if p[0] < 1.5 {
                out[0] = p[0];
                out[1] = 7.0;
                true
            } else {
                out[1] = 3.0;
                false
            }
        });
        assert_eq!(hits, 2);
        assert_eq!(ps.value_at(1).unwrap(), &[1.0, 7.0]);
        assert!(!ps.is_resolved(2));
        assert_eq!(ps.value_at(2).unwrap(), &[UNRESOLVED, 0.0]);
    }

    #[test]
    fn serial_round_trip_is_identity() {
        let mut ps = two_groups();
        let part = SpatialPartition::new(vec![Aabb::new([-1.0; 3], [3.0; 3])]);
        ps.redistribute(&part, &NoComm).unwrap();
        assert!(ps.is_redistributed());
        ps.set_value(2, &[5.0, 6.0]).unwrap();
        ps.unredistribute(&NoComm).unwrap();
        assert_eq!(ps.num_groups(), 2);
        assert_eq!(ps.value(1, 0).unwrap(), &[5.0, 6.0]);
        assert_eq!(ps.point(1).unwrap(), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn unredistribute_without_redistribute_is_improper() {
        let mut ps = two_groups();
        assert!(matches!(ps.unredistribute(&NoComm), Err(MeshCmfeError::ImproperUse(_))));
    }

    #[test]
    fn point_outside_partition_is_improper() {
        let mut ps = two_groups();
        let part = SpatialPartition::new(vec![Aabb::new([0.0; 3], [1.0; 3])]);
        assert!(matches!(
            ps.redistribute(&part, &NoComm),
            Err(MeshCmfeError::ImproperUse(_))
        ));
    }
}
