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

//! Host-staged allreduce

use std::sync::Arc;

use crate::ctx::NbcContext;
use crate::data_types::{Element, Type};
use crate::error::{NbcError, NbcResult};
use crate::gpu::{DeviceBuffer, Event, GpuWait, PinnedBuffer, PinnedMemoryPool, Stream};
use crate::net::{Communicator, ReduceOp, Request};
use crate::progress::{ExecutionContext, OperationState, PeAction};

use super::check_device_len;

/// Reduce `count` elements of `send` across all ranks with `op`, leaving the
/// result in `recv` everywhere. `send` and `recv` may be the same buffer.
pub fn allreduce<T: Element>(
    ctx: &NbcContext,
    send: &DeviceBuffer<T>,
    recv: &DeviceBuffer<T>,
    count: usize,
    op: ReduceOp,
    stream: &Stream,
) -> NbcResult<()> {
    if count == 0 {
        return Ok(());
    }
    let state = HostStagedAllreduce::new(
        ctx.get_communicator(),
        &ctx.get_memory_pool(),
        send,
        recv,
        count,
        op,
        stream,
    )?;
    ctx.get_engine().enqueue(Box::new(state))
}

pub struct HostStagedAllreduce {
    count: usize,
    data_type: Type,
    op: ReduceOp,
    host_mem: PinnedBuffer,
    comm: Arc<dyn Communicator>,
    context: ExecutionContext,
    gpuwait: GpuWait,
    d2h_event: Event,
    h2d_event: Event,
    request: Option<Box<dyn Request>>,
    mem_xfer_done: bool,
    allreduce_started: bool,
    allreduce_done: bool,
}

impl HostStagedAllreduce {
    pub fn new<T: Element>(
        comm: Arc<dyn Communicator>,
        pool: &Arc<PinnedMemoryPool>,
        send: &DeviceBuffer<T>,
        recv: &DeviceBuffer<T>,
        count: usize,
        op: ReduceOp,
        stream: &Stream,
    ) -> NbcResult<Self> {
        if count == 0 {
            return Err(NbcError::Invalid("allreduce of zero elements".into()));
        }
        if !op.supports(T::TYPE) {
            return Err(NbcError::TypeError(format!(
                "reduction {} is not defined for {}",
                op,
                T::TYPE
            )));
        }
        check_device_len("allreduce send buffer", send, count)?;
        check_device_len("allreduce receive buffer", recv, count)?;

        let host_mem = pool.get(T::TYPE.bytes_for(count))?;
        let gpuwait = GpuWait::new();
        let d2h_event = Event::new();
        let h2d_event = Event::new();

        stream.memcpy_d2h(&host_mem, 0, send, 0, count)?;
        d2h_event.record(stream)?;
        gpuwait.wait(stream)?;
        stream.memcpy_h2d(recv, 0, &host_mem, 0, count)?;
        h2d_event.record(stream)?;

        Ok(Self {
            count,
            data_type: T::TYPE,
            op,
            host_mem,
            comm,
            context: stream.execution_context(),
            gpuwait,
            d2h_event,
            h2d_event,
            request: None,
            mem_xfer_done: false,
            allreduce_started: false,
            allreduce_done: false,
        })
    }
}

impl OperationState for HostStagedAllreduce {
    fn step(&mut self) -> NbcResult<PeAction> {
        if !self.mem_xfer_done {
            if self.d2h_event.query() {
                self.mem_xfer_done = true;
                return Ok(PeAction::Advance);
            }
            return Ok(PeAction::Continue);
        }

        if !self.allreduce_started {
            self.request = Some(self.comm.iallreduce(
                None,
                &self.host_mem,
                self.count,
                self.data_type,
                self.op,
            )?);
            self.allreduce_started = true;
        }

        if !self.allreduce_done {
            let done = match self.request.as_mut() {
                Some(request) => request.test()?,
                None => true,
            };
            if !done {
                return Ok(PeAction::Continue);
            }
            self.allreduce_done = true;
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
        "HTAllreduce"
    }

    fn get_desc(&self) -> String {
        format!("count={} type={} op={}", self.count, self.data_type, self.op)
    }
}
