// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! In-process communication backend
//!
//! A [`LocalGroup`] is a set of communicators, one per rank, that exchange
//! data through shared memory. Each rank drives its own communicator from its
//! own thread, exactly as separate processes would drive an MPI
//! communicator. Collectives match by call order: the n-th collective posted
//! by every rank forms one operation.
//!
//! Posting only registers the collective. A request copies its rank's
//! contribution into the group the first time it is tested and finds the
//! source buffer free, so `test` never waits on a buffer lock. Once every
//! rank has contributed, each request computes and delivers its rank's
//! result the next time it is tested.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, TryLockError};

use crate::data_types::Type;
use crate::error::{NbcError, NbcResult};
use crate::gpu::HostBuffer;

use super::comm_operations::{reduce_into, ReduceOp};
use super::communicator::Communicator;
use super::{CommType, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CollectiveKind {
    Scatter,
    Gather,
    Bcast,
    Allreduce,
    Reduce,
    ReduceScatter,
}

/// What every rank must agree on for one collective
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Signature {
    kind: CollectiveKind,
    count: usize,
    data_type: Type,
    root: i32,
    op: Option<ReduceOp>,
}

struct Slot {
    signature: Signature,
    contributions: Vec<Option<Vec<u8>>>,
    posted: usize,
    finished: usize,
}

impl Slot {
    fn contribution(&self, rank: usize) -> NbcResult<&[u8]> {
        self.contributions
            .get(rank)
            .and_then(|c| c.as_deref())
            .ok_or_else(|| NbcError::Communication(format!("rank {} has not contributed", rank)))
    }
}

struct GroupShared {
    size: usize,
    slots: Mutex<HashMap<u64, Slot>>,
    barrier: Barrier,
}

/// Factory for in-process communicator groups
pub struct LocalGroup;

impl LocalGroup {
    /// `size` communicators, all on one node
    pub fn create(size: usize) -> NbcResult<Vec<Arc<LocalCommunicator>>> {
        Self::create_on_nodes(size, size)
    }

    /// `size` communicators spread over nodes of `ranks_per_node` members
    pub fn create_on_nodes(
        size: usize,
        ranks_per_node: usize,
    ) -> NbcResult<Vec<Arc<LocalCommunicator>>> {
        if size == 0 || ranks_per_node == 0 {
            return Err(NbcError::Invalid(
                "a local group needs at least one rank per node".into(),
            ));
        }
        let shared = Arc::new(GroupShared {
            size,
            slots: Mutex::new(HashMap::new()),
            barrier: Barrier::new(size),
        });
        Ok((0..size)
            .map(|rank| {
                let node_start = rank - rank % ranks_per_node;
                Arc::new(LocalCommunicator {
                    rank,
                    local_rank: rank % ranks_per_node,
                    local_size: ranks_per_node.min(size - node_start),
                    shared: Arc::clone(&shared),
                    sequence: AtomicU64::new(0),
                    calls: AtomicUsize::new(0),
                })
            })
            .collect())
    }
}

/// One rank of a [`LocalGroup`]
pub struct LocalCommunicator {
    rank: usize,
    local_rank: usize,
    local_size: usize,
    shared: Arc<GroupShared>,
    sequence: AtomicU64,
    calls: AtomicUsize,
}

impl LocalCommunicator {
    /// Number of collective primitives this rank has posted
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn check_root(&self, root: i32) -> NbcResult<usize> {
        usize::try_from(root)
            .ok()
            .filter(|&r| r < self.size())
            .ok_or_else(|| NbcError::Invalid(format!("root {} outside group of {}", root, self.size())))
    }

    fn post(
        &self,
        signature: Signature,
        contribution: Contribution,
        delivery: Delivery,
    ) -> NbcResult<Box<dyn Request>> {
        if signature.count == 0 {
            return Err(NbcError::Invalid(
                "zero-element collective posted to the backend".into(),
            ));
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let size = self.size();

        let mut slots = self
            .shared
            .slots
            .lock()
            .map_err(|_| NbcError::poisoned("local group"))?;
        let slot = slots.entry(seq).or_insert_with(|| Slot {
            signature,
            contributions: vec![None; size],
            posted: 0,
            finished: 0,
        });
        if slot.signature != signature {
            return Err(NbcError::Communication(format!(
                "rank {} posted {:?} as collective #{} but the group expects {:?}",
                self.rank, signature, seq, slot.signature
            )));
        }

        Ok(Box::new(LocalRequest {
            shared: Arc::clone(&self.shared),
            seq,
            rank: self.rank,
            signature,
            contribution: Some(contribution),
            delivery,
            done: false,
        }))
    }
}

/// This rank's input to a collective, not yet handed to the group
enum Contribution {
    Bytes(Vec<u8>),
    Region {
        buffer: HostBuffer,
        start: usize,
        len: usize,
    },
}

impl Contribution {
    fn empty() -> Self {
        Contribution::Bytes(Vec::new())
    }

    fn region(buffer: &HostBuffer, start: usize, len: usize) -> NbcResult<Self> {
        check_len(buffer, start + len)?;
        Ok(Contribution::Region {
            buffer: buffer.clone(),
            start,
            len,
        })
    }
}

fn check_len(buffer: &HostBuffer, needed: usize) -> NbcResult<()> {
    if buffer.len_bytes() < needed {
        return Err(NbcError::IndexError(format!(
            "host buffer of {} bytes used for {} bytes",
            buffer.len_bytes(),
            needed
        )));
    }
    Ok(())
}

impl Communicator for LocalCommunicator {
    fn get_rank(&self) -> i32 {
        self.rank as i32
    }

    fn get_world_size(&self) -> i32 {
        self.size() as i32
    }

    fn get_local_rank(&self) -> i32 {
        self.local_rank as i32
    }

    fn get_local_size(&self) -> i32 {
        self.local_size as i32
    }

    fn get_comm_type(&self) -> CommType {
        CommType::Local
    }

    fn barrier(&self) -> NbcResult<()> {
        self.shared.barrier.wait();
        Ok(())
    }

    fn iscatter(
        &self,
        send: &HostBuffer,
        recv: Option<&HostBuffer>,
        count: usize,
        data_type: Type,
        root: i32,
    ) -> NbcResult<Box<dyn Request>> {
        let is_root = self.check_root(root)? == self.rank;
        let n = data_type.bytes_for(count);
        let contribution = if is_root {
            Contribution::region(send, 0, n * self.size())?
        } else {
            Contribution::empty()
        };
        let delivery = match recv {
            Some(recv) => {
                check_len(recv, n)?;
                Delivery::Scatter(recv.clone())
            }
            None if is_root => Delivery::Nothing,
            None => {
                return Err(NbcError::Invalid(
                    "in-place scatter is only valid on the root".into(),
                ))
            }
        };
        let signature = Signature {
            kind: CollectiveKind::Scatter,
            count,
            data_type,
            root,
            op: None,
        };
        self.post(signature, contribution, delivery)
    }

    fn igather(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        count: usize,
        data_type: Type,
        root: i32,
    ) -> NbcResult<Box<dyn Request>> {
        let is_root = self.check_root(root)? == self.rank;
        let n = data_type.bytes_for(count);
        let contribution = match send {
            Some(send) => Contribution::region(send, 0, n)?,
            None if is_root => Contribution::region(recv, self.rank * n, n)?,
            None => {
                return Err(NbcError::Invalid(
                    "in-place gather is only valid on the root".into(),
                ))
            }
        };
        let delivery = if is_root {
            check_len(recv, n * self.size())?;
            Delivery::Gather(recv.clone())
        } else {
            Delivery::Nothing
        };
        let signature = Signature {
            kind: CollectiveKind::Gather,
            count,
            data_type,
            root,
            op: None,
        };
        self.post(signature, contribution, delivery)
    }

    fn ibcast(
        &self,
        buffer: &HostBuffer,
        count: usize,
        data_type: Type,
        root: i32,
    ) -> NbcResult<Box<dyn Request>> {
        let is_root = self.check_root(root)? == self.rank;
        let n = data_type.bytes_for(count);
        check_len(buffer, n)?;
        let (contribution, delivery) = if is_root {
            (Contribution::region(buffer, 0, n)?, Delivery::Nothing)
        } else {
            (Contribution::empty(), Delivery::Bcast(buffer.clone()))
        };
        let signature = Signature {
            kind: CollectiveKind::Bcast,
            count,
            data_type,
            root,
            op: None,
        };
        self.post(signature, contribution, delivery)
    }

    fn iallreduce(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> NbcResult<Box<dyn Request>> {
        let n = data_type.bytes_for(count);
        check_len(recv, n)?;
        let contribution = Contribution::region(send.unwrap_or(recv), 0, n)?;
        let signature = Signature {
            kind: CollectiveKind::Allreduce,
            count,
            data_type,
            root: 0,
            op: Some(op),
        };
        self.post(
            signature,
            contribution,
            Delivery::Reduce {
                recv: recv.clone(),
                block: None,
            },
        )
    }

    fn ireduce(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        count: usize,
        data_type: Type,
        op: ReduceOp,
        root: i32,
    ) -> NbcResult<Box<dyn Request>> {
        let is_root = self.check_root(root)? == self.rank;
        let n = data_type.bytes_for(count);
        let contribution = Contribution::region(send.unwrap_or(recv), 0, n)?;
        let delivery = if is_root {
            check_len(recv, n)?;
            Delivery::Reduce {
                recv: recv.clone(),
                block: None,
            }
        } else {
            Delivery::Nothing
        };
        let signature = Signature {
            kind: CollectiveKind::Reduce,
            count,
            data_type,
            root,
            op: Some(op),
        };
        self.post(signature, contribution, delivery)
    }

    fn ireduce_scatter(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        recv_count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> NbcResult<Box<dyn Request>> {
        let n = data_type.bytes_for(recv_count);
        check_len(recv, n)?;
        let contribution = Contribution::region(send.unwrap_or(recv), 0, n * self.size())?;
        let signature = Signature {
            kind: CollectiveKind::ReduceScatter,
            count: recv_count,
            data_type,
            root: 0,
            op: Some(op),
        };
        self.post(
            signature,
            contribution,
            Delivery::Reduce {
                recv: recv.clone(),
                block: Some(self.rank),
            },
        )
    }
}

/// Where this rank's result goes once every rank has posted
enum Delivery {
    Nothing,
    Scatter(HostBuffer),
    Gather(HostBuffer),
    Bcast(HostBuffer),
    Reduce {
        recv: HostBuffer,
        block: Option<usize>,
    },
}

struct LocalRequest {
    shared: Arc<GroupShared>,
    seq: u64,
    rank: usize,
    signature: Signature,
    /// `None` once handed to the group
    contribution: Option<Contribution>,
    delivery: Delivery,
    done: bool,
}

impl LocalRequest {
    /// Write this rank's result. `Ok(false)` if the target buffer is busy.
    fn deliver(&self, slot: &Slot) -> NbcResult<bool> {
        let sig = &self.signature;
        let n = sig.data_type.bytes_for(sig.count);
        let root = sig.root as usize;
        match &self.delivery {
            Delivery::Nothing => Ok(true),
            Delivery::Scatter(recv) => {
                let data = slot.contribution(root)?;
                let chunk = &data[self.rank * n..(self.rank + 1) * n];
                write_at(recv, 0, chunk)
            }
            Delivery::Bcast(buffer) => write_at(buffer, 0, slot.contribution(root)?),
            Delivery::Gather(recv) => {
                let mut bytes = match recv.try_lock()? {
                    Some(bytes) => bytes,
                    None => return Ok(false),
                };
                for rank in 0..self.shared.size {
                    bytes[rank * n..(rank + 1) * n].copy_from_slice(slot.contribution(rank)?);
                }
                Ok(true)
            }
            Delivery::Reduce { recv, block } => {
                let op = sig.op.ok_or_else(|| {
                    NbcError::Communication("reduction posted without an operator".into())
                })?;
                let mut acc = slot.contribution(0)?.to_vec();
                for rank in 1..self.shared.size {
                    reduce_into(sig.data_type, op, &mut acc, slot.contribution(rank)?)?;
                }
                let result = match block {
                    Some(block) => &acc[block * n..(block + 1) * n],
                    None => &acc[..],
                };
                write_at(recv, 0, result)
            }
        }
    }
}

fn write_at(buffer: &HostBuffer, offset: usize, data: &[u8]) -> NbcResult<bool> {
    match buffer.try_lock()? {
        Some(mut bytes) => {
            bytes[offset..offset + data.len()].copy_from_slice(data);
            Ok(true)
        }
        None => Ok(false),
    }
}

impl Request for LocalRequest {
    fn test(&mut self) -> NbcResult<bool> {
        if self.done {
            return Ok(true);
        }
        // Copy out of the caller's buffer before touching the group lock, and
        // keep the copy if the group is busy.
        if let Some(Contribution::Region { buffer, start, len }) = &self.contribution {
            let copied = match buffer.try_lock()? {
                Some(bytes) => bytes[*start..*start + *len].to_vec(),
                None => return Ok(false),
            };
            self.contribution = Some(Contribution::Bytes(copied));
        }
        let mut slots = match self.shared.slots.try_lock() {
            Ok(slots) => slots,
            Err(TryLockError::WouldBlock) => return Ok(false),
            Err(TryLockError::Poisoned(_)) => return Err(NbcError::poisoned("local group")),
        };
        let slot = slots.get_mut(&self.seq).ok_or_else(|| {
            NbcError::Communication(format!("collective #{} is no longer tracked", self.seq))
        })?;
        if let Some(Contribution::Bytes(bytes)) = self.contribution.take() {
            slot.contributions[self.rank] = Some(bytes);
            slot.posted += 1;
        }
        if slot.posted < self.shared.size {
            return Ok(false);
        }
        if !self.deliver(slot)? {
            return Ok(false);
        }
        slot.finished += 1;
        if slot.finished == self.shared.size {
            slots.remove(&self.seq);
        }
        self.done = true;
        Ok(true)
    }
}
