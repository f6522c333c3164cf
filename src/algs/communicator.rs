//! Thin façade over the collective operations CMFE needs.
//!
//! Every operation here is *blocking and collective*: all ranks must call the
//! same sequence of operations the same number of times, whether or not they
//! hold local data. Control flow in the algorithms is therefore only ever
//! decided from globally reduced values.
//!
//! Messages are contiguous byte buffers, one per destination rank. Reductions
//! have default implementations on top of [`Communicator::all_to_all_v`], so a
//! backend only has to provide the exchange; MPI overrides them with native
//! reductions.

use crate::algs::wire::pod_vec_from_bytes;
use crate::mesh_error::MeshCmfeError;
use bytemuck::Pod;
use bytes::Bytes;
use dashmap::DashMap;
use std::cell::Cell;
use std::sync::{Arc, Barrier};

/// Collective communication interface injected into every CMFE component.
pub trait Communicator {
    /// This process's rank in `[0, size)`.
    fn rank(&self) -> usize;
    /// Number of cooperating processes.
    fn size(&self) -> usize;

    /// True for the serial mock, which skips every exchange.
    fn is_no_comm(&self) -> bool {
        false
    }

    /// Exchange one buffer with every rank. `send[r]` goes to rank `r`; the
    /// result's entry `r` is what rank `r` sent to us.
    fn all_to_all_v(&self, send: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MeshCmfeError>;

    /// Element-wise global sum.
    fn allreduce_sum_u64(&self, vals: &mut [u64]) -> Result<(), MeshCmfeError> {
        allreduce_by_exchange(self, vals, |acc, x| *acc += x)
    }

    /// Element-wise global maximum.
    fn allreduce_max_u64(&self, vals: &mut [u64]) -> Result<(), MeshCmfeError> {
        allreduce_by_exchange(self, vals, |acc, x| *acc = (*acc).max(x))
    }

    /// Element-wise global minimum.
    fn allreduce_min_f64(&self, vals: &mut [f64]) -> Result<(), MeshCmfeError> {
        allreduce_by_exchange(self, vals, |acc, x| *acc = acc.min(x))
    }

    /// Element-wise global maximum.
    fn allreduce_max_f64(&self, vals: &mut [f64]) -> Result<(), MeshCmfeError> {
        allreduce_by_exchange(self, vals, |acc, x| *acc = acc.max(x))
    }
}

/// Turn a rank-local outcome into a collective one.
///
/// Every rank calls this at the same point. When any rank holds an error, the
/// error of the lowest failing rank is returned on every rank, so no rank is
/// left waiting in a later exchange.
pub fn agree_on<C, T>(comm: &C, local: Result<T, MeshCmfeError>) -> Result<T, MeshCmfeError>
where
    C: Communicator + ?Sized,
{
    let size = comm.size();
    if size == 1 {
        return local;
    }
    let rank = comm.rank();
    let mut worst = [match &local {
        Ok(_) => 0,
        Err(_) => u64::MAX - rank as u64,
    }];
    comm.allreduce_max_u64(&mut worst)?;
    if worst[0] == 0 {
        return local;
    }
    let failed = (u64::MAX - worst[0]) as usize;
    let msg = match &local {
        Err(e) if rank == failed => bincode::serialize(e).unwrap_or_default(),
        _ => Vec::new(),
    };
    let received = comm.all_to_all_v(vec![msg; size])?;
    match local {
        Err(e) if rank == failed => Err(e),
        _ => Err(bincode::deserialize(&received[failed])?),
    }
}

/// Reduce `vals` across all ranks by sending the local slice to everyone and
/// folding what comes back in rank order. Folding in rank order keeps the
/// result identical on every rank.
fn allreduce_by_exchange<C, T, F>(comm: &C, vals: &mut [T], op: F) -> Result<(), MeshCmfeError>
where
    C: Communicator + ?Sized,
    T: Pod,
    F: Fn(&mut T, T),
{
    let size = comm.size();
    if size == 1 {
        return Ok(());
    }
    let local: Vec<u8> = bytemuck::cast_slice(vals).to_vec();
    let received = comm.all_to_all_v(vec![local; size])?;
    for (src, buf) in received.iter().enumerate() {
        if buf.len() != std::mem::size_of_val(vals) {
            return Err(MeshCmfeError::CommError {
                neighbor: src,
                detail: format!(
                    "reduction buffer of {} bytes, expected {}",
                    buf.len(),
                    std::mem::size_of_val(vals)
                ),
            });
        }
    }
    let parts = received
        .iter()
        .map(|buf| pod_vec_from_bytes::<T>(buf))
        .collect::<Result<Vec<_>, _>>()?;
    for (i, slot) in vals.iter_mut().enumerate() {
        let mut acc = parts[0][i];
        for part in &parts[1..] {
            op(&mut acc, part[i]);
        }
        *slot = acc;
    }
    Ok(())
}

/// Serial mock: a single rank, every collective is the identity.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn is_no_comm(&self) -> bool {
        true
    }
    fn all_to_all_v(&self, send: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MeshCmfeError> {
        if send.len() != 1 {
            return Err(MeshCmfeError::ImproperUse(format!(
                "all_to_all_v on a single rank needs 1 buffer, got {}",
                send.len()
            )));
        }
        Ok(send)
    }
    fn allreduce_sum_u64(&self, _vals: &mut [u64]) -> Result<(), MeshCmfeError> {
        Ok(())
    }
    fn allreduce_max_u64(&self, _vals: &mut [u64]) -> Result<(), MeshCmfeError> {
        Ok(())
    }
    fn allreduce_min_f64(&self, _vals: &mut [f64]) -> Result<(), MeshCmfeError> {
        Ok(())
    }
    fn allreduce_max_f64(&self, _vals: &mut [f64]) -> Result<(), MeshCmfeError> {
        Ok(())
    }
}

// --- LocalComm: several ranks as threads of one process ---

/// (collective sequence number, src, dst)
type Key = (u64, usize, usize);

struct Hub {
    size: usize,
    barrier: Barrier,
    mailbox: DashMap<Key, Bytes>,
}

/// In-process multi-rank communicator. Each rank must live on its own thread;
/// collectives rendezvous on a shared barrier.
pub struct LocalComm {
    rank: usize,
    hub: Arc<Hub>,
    seq: Cell<u64>,
}

impl LocalComm {
    /// Create `size` connected ranks, indexed by rank.
    pub fn group(size: usize) -> Vec<LocalComm> {
        let hub = Arc::new(Hub {
            size,
            barrier: Barrier::new(size),
            mailbox: DashMap::new(),
        });
        (0..size)
            .map(|rank| LocalComm {
                rank,
                hub: Arc::clone(&hub),
                seq: Cell::new(0),
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.hub.size
    }

    fn all_to_all_v(&self, send: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MeshCmfeError> {
        let size = self.hub.size;
        if send.len() != size {
            return Err(MeshCmfeError::ImproperUse(format!(
                "all_to_all_v needs {size} buffers, got {}",
                send.len()
            )));
        }
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        for (dst, buf) in send.into_iter().enumerate() {
            self.hub.mailbox.insert((seq, self.rank, dst), Bytes::from(buf));
        }
        // every deposit for `seq` happens before anyone collects
        self.hub.barrier.wait();
        let mut out = Vec::with_capacity(size);
        for src in 0..size {
            let (_, bytes) = self
                .hub
                .mailbox
                .remove(&(seq, src, self.rank))
                .ok_or_else(|| MeshCmfeError::CommError {
                    neighbor: src,
                    detail: format!("no message for collective #{seq}"),
                })?;
            out.push(bytes.to_vec());
        }
        Ok(out)
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::Count;
    use mpi::collective::SystemOperation;
    use mpi::datatype::{Partition, PartitionMut};
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    pub struct MpiComm {
        _universe: Universe,
        pub world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, MeshCmfeError> {
            let universe = mpi::initialize().ok_or_else(|| MeshCmfeError::CommError {
                neighbor: 0,
                detail: "MPI was already initialized".into(),
            })?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                _universe: universe,
                world,
                rank,
                size,
            })
        }
    }

    fn displacements(counts: &[Count]) -> Vec<Count> {
        counts
            .iter()
            .scan(0, |acc, &x| {
                let old = *acc;
                *acc += x;
                Some(old)
            })
            .collect()
    }

    impl Communicator for MpiComm {
        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }

        fn all_to_all_v(&self, send: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, MeshCmfeError> {
            if send.len() != self.size {
                return Err(MeshCmfeError::ImproperUse(format!(
                    "all_to_all_v needs {} buffers, got {}",
                    self.size,
                    send.len()
                )));
            }
            // Counts and displacements are `Count` (i32); an oversized send
            // travels as zero counts and the failure is agreed on below.
            let send_fits = Count::try_from(send.iter().map(Vec::len).sum::<usize>()).is_ok();
            let counts: Vec<Count> = if send_fits {
                send.iter()
                    .map(|b| Count::try_from(b.len()).unwrap_or(0))
                    .collect()
            } else {
                vec![0; self.size]
            };
            let mut recv_counts = vec![0 as Count; self.size];
            self.world.all_to_all_into(&counts[..], &mut recv_counts[..]);

            let recv_fits = recv_counts
                .iter()
                .try_fold(0 as Count, |acc, &c| acc.checked_add(c))
                .is_some();
            let local_bad = Count::from(!(send_fits && recv_fits));
            let mut any_bad: Count = 0;
            self.world
                .all_reduce_into(&local_bad, &mut any_bad, SystemOperation::max());
            if any_bad != 0 {
                return Err(MeshCmfeError::CommError {
                    neighbor: self.rank,
                    detail: "all_to_all_v volume exceeds the MPI count range".into(),
                });
            }

            let send_displs = displacements(&counts);
            let recv_displs = displacements(&recv_counts);
            let flat: Vec<u8> = send.concat();
            let total: usize = recv_counts.iter().map(|&c| c as usize).sum();
            let mut recv = vec![0u8; total];
            {
                let send_partition = Partition::new(&flat[..], &counts[..], &send_displs[..]);
                let mut recv_partition =
                    PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
                self.world
                    .all_to_all_varcount_into(&send_partition, &mut recv_partition);
            }
            Ok(recv_counts
                .iter()
                .zip(recv_displs.iter())
                .map(|(&c, &d)| recv[d as usize..(d + c) as usize].to_vec())
                .collect())
        }

        fn allreduce_sum_u64(&self, vals: &mut [u64]) -> Result<(), MeshCmfeError> {
            let local = vals.to_vec();
            self.world
                .all_reduce_into(&local[..], vals, SystemOperation::sum());
            Ok(())
        }

        fn allreduce_max_u64(&self, vals: &mut [u64]) -> Result<(), MeshCmfeError> {
            let local = vals.to_vec();
            self.world
                .all_reduce_into(&local[..], vals, SystemOperation::max());
            Ok(())
        }

        fn allreduce_min_f64(&self, vals: &mut [f64]) -> Result<(), MeshCmfeError> {
            let local = vals.to_vec();
            self.world
                .all_reduce_into(&local[..], vals, SystemOperation::min());
            Ok(())
        }

        fn allreduce_max_f64(&self, vals: &mut [f64]) -> Result<(), MeshCmfeError> {
            let local = vals.to_vec();
            self.world
                .all_reduce_into(&local[..], vals, SystemOperation::max());
            Ok(())
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
