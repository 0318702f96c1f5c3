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

//! Host-staged broadcast

use std::sync::Arc;

use crate::ctx::NbcContext;
use crate::data_types::{Element, Type};
use crate::error::{NbcError, NbcResult};
use crate::gpu::{DeviceBuffer, Event, GpuWait, PinnedBuffer, PinnedMemoryPool, Stream};
use crate::net::{Communicator, Request};
use crate::progress::{ExecutionContext, OperationState, PeAction};

use super::{check_device_len, check_root};

/// Broadcast the first `count` elements of `buffer` on `root` to every rank.
pub fn bcast<T: Element>(
    ctx: &NbcContext,
    buffer: &DeviceBuffer<T>,
    count: usize,
    root: i32,
    stream: &Stream,
) -> NbcResult<()> {
    if count == 0 {
        return Ok(());
    }
    let state = HostStagedBcast::new(
        ctx.get_communicator(),
        &ctx.get_memory_pool(),
        buffer,
        count,
        root,
        stream,
    )?;
    ctx.get_engine().enqueue(Box::new(state))
}

pub struct HostStagedBcast {
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
    bcast_started: bool,
    bcast_done: bool,
}

impl HostStagedBcast {
    pub fn new<T: Element>(
        comm: Arc<dyn Communicator>,
        pool: &Arc<PinnedMemoryPool>,
        buffer: &DeviceBuffer<T>,
        count: usize,
        root: i32,
        stream: &Stream,
    ) -> NbcResult<Self> {
        if count == 0 {
            return Err(NbcError::Invalid("broadcast of zero elements".into()));
        }
        let rank = comm.get_rank();
        check_root(root, comm.get_world_size())?;
        check_device_len("broadcast buffer", buffer, count)?;

        let host_mem = pool.get(T::TYPE.bytes_for(count))?;
        let gpuwait = GpuWait::new();
        let d2h_event = Event::new();
        let h2d_event = Event::new();

        if rank == root {
            stream.memcpy_d2h(&host_mem, 0, buffer, 0, count)?;
            d2h_event.record(stream)?;
        } else {
            d2h_event.record(stream)?;
            gpuwait.wait(stream)?;
            stream.memcpy_h2d(buffer, 0, &host_mem, 0, count)?;
            h2d_event.record(stream)?;
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
            bcast_started: false,
            bcast_done: false,
        })
    }
}

impl OperationState for HostStagedBcast {
    fn step(&mut self) -> NbcResult<PeAction> {
        if !self.mem_xfer_done {
            if self.d2h_event.query() {
                self.mem_xfer_done = true;
                return Ok(PeAction::Advance);
            }
            return Ok(PeAction::Continue);
        }

        if !self.bcast_started {
            self.request = Some(self.comm.ibcast(
                &self.host_mem,
                self.count,
                self.data_type,
                self.root,
            )?);
            self.bcast_started = true;
        }

        if !self.bcast_done {
            let done = match self.request.as_mut() {
                Some(request) => request.test()?,
                None => true,
            };
            if !done {
                return Ok(PeAction::Continue);
            }
            self.bcast_done = true;
            if self.rank == self.root {
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
        "HTBcast"
    }

    fn get_desc(&self) -> String {
        format!(
            "rank={} root={} count={} type={}",
            self.rank, self.root, self.count, self.data_type
        )
    }
}
