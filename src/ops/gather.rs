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

//! Host-staged gather

use std::sync::Arc;

use crate::ctx::NbcContext;
use crate::data_types::{Element, Type};
use crate::error::{NbcError, NbcResult};
use crate::gpu::{DeviceBuffer, Event, GpuWait, PinnedBuffer, PinnedMemoryPool, Stream};
use crate::net::{Communicator, Request};
use crate::progress::{ExecutionContext, OperationState, PeAction};

use super::{check_device_len, check_root};

/// Gather `count` elements from every rank into `recv` on `root`.
///
/// Rank `i`'s elements land at `[i * count, (i + 1) * count)` of the root's
/// `recv`. On the root, `send` and `recv` may be the same buffer, in which
/// case the root's share is read from its slot. Ordered on `stream`.
pub fn gather<T: Element>(
    ctx: &NbcContext,
    send: &DeviceBuffer<T>,
    recv: &DeviceBuffer<T>,
    count: usize,
    root: i32,
    stream: &Stream,
) -> NbcResult<()> {
    if count == 0 {
        return Ok(());
    }
    let state = HostStagedGather::new(
        ctx.get_communicator(),
        &ctx.get_memory_pool(),
        send,
        recv,
        count,
        root,
        stream,
    )?;
    ctx.get_engine().enqueue(Box::new(state))
}

pub struct HostStagedGather {
    rank: i32,
    root: i32,
    count: usize,
    data_type: Type,
    host_mem: PinnedBuffer,
    comm: Arc<dyn Communicator>,
    context: ExecutionContext,
    gpuwait: GpuWait,
    d2h_event: Event,
    h2d_event: Event,
    request: Option<Box<dyn Request>>,
    mem_xfer_done: bool,
    gather_started: bool,
    gather_done: bool,
}

impl HostStagedGather {
    pub fn new<T: Element>(
        comm: Arc<dyn Communicator>,
        pool: &Arc<PinnedMemoryPool>,
        send: &DeviceBuffer<T>,
        recv: &DeviceBuffer<T>,
        count: usize,
        root: i32,
        stream: &Stream,
    ) -> NbcResult<Self> {
        if count == 0 {
            return Err(NbcError::Invalid("gather of zero elements".into()));
        }
        let rank = comm.get_rank();
        let size = comm.get_world_size();
        check_root(root, size)?;
        let i_am_root = rank == root;
        let total = size as usize * count;

        let host_mem = pool.get(T::TYPE.bytes_for(if i_am_root { total } else { count }))?;
        let gpuwait = GpuWait::new();
        let d2h_event = Event::new();
        let h2d_event = Event::new();

        if i_am_root {
            check_device_len("gather receive buffer", recv, total)?;
            let slot = rank as usize * count;
            let src_offset = if send.same_allocation(recv) {
                slot
            } else {
                check_device_len("gather send buffer", send, count)?;
                0
            };
            stream.memcpy_d2h(&host_mem, slot, send, src_offset, count)?;
            d2h_event.record(stream)?;
            // Hold the stream until every contribution has arrived.
            gpuwait.wait(stream)?;
            stream.memcpy_h2d(recv, 0, &host_mem, 0, total)?;
            h2d_event.record(stream)?;
        } else {
            check_device_len("gather send buffer", send, count)?;
            stream.memcpy_d2h(&host_mem, 0, send, 0, count)?;
            d2h_event.record(stream)?;
        }

        Ok(Self {
            rank,
            root,
            count,
            data_type: T::TYPE,
            host_mem,
            comm,
            context: stream.execution_context(),
            gpuwait,
            d2h_event,
            h2d_event,
            request: None,
            mem_xfer_done: false,
            gather_started: false,
            gather_done: false,
        })
    }
}

impl OperationState for HostStagedGather {
    fn step(&mut self) -> NbcResult<PeAction> {
        if !self.mem_xfer_done {
            if self.d2h_event.query() {
                self.mem_xfer_done = true;
                return Ok(PeAction::Advance);
            }
            return Ok(PeAction::Continue);
        }

        if !self.gather_started {
            let send = if self.rank == self.root {
                None
            } else {
                Some(&*self.host_mem)
            };
            self.request = Some(self.comm.igather(
                send,
                &self.host_mem,
                self.count,
                self.data_type,
                self.root,
            )?);
            self.gather_started = true;
        }

        if !self.gather_done {
            let done = match self.request.as_mut() {
                Some(request) => request.test()?,
                None => true,
            };
            if !done {
                return Ok(PeAction::Continue);
            }
            self.gather_done = true;
            if self.rank != self.root {
                return Ok(PeAction::Complete);
            }
            self.gpuwait.signal();
        }

        if self.h2d_event.query() {
            Ok(PeAction::Complete)
        } else {
            Ok(PeAction::Continue)
        }
    }

    fn get_execution_context(&self) -> ExecutionContext {
        self.context
    }

    fn needs_completion(&self) -> bool {
        false
    }

    fn get_name(&self) -> &str {
        "HTGather"
    }

    fn get_desc(&self) -> String {
        format!(
            "rank={} root={} count={} type={}",
            self.rank, self.root, self.count, self.data_type
        )
    }
}
