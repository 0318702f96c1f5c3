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

//! Non-blocking collectives on host buffers

use std::sync::Arc;

use crate::ctx::NbcContext;
use crate::data_types::{Element, Type};
use crate::error::{NbcError, NbcResult};
use crate::gpu::HostBuffer;
use crate::net::{Communicator, ReduceOp, Request};
use crate::progress::{CompletionHandle, OperationState, PeAction};

use super::check_root;

fn check_host_len(buffer: &HostBuffer, data_type: Type, count: usize) -> NbcResult<()> {
    let needed = data_type.bytes_for(count);
    if buffer.len_bytes() < needed {
        return Err(NbcError::IndexError(format!(
            "host buffer of {} bytes cannot hold {} {} elements",
            buffer.len_bytes(),
            count,
            data_type
        )));
    }
    Ok(())
}

/// In-place allreduce of the first `count` elements of `buffer`.
///
/// Returns a handle that completes once `buffer` holds the result.
pub fn iallreduce<T: Element>(
    ctx: &NbcContext,
    buffer: &HostBuffer,
    count: usize,
    op: ReduceOp,
) -> NbcResult<CompletionHandle> {
    if count == 0 {
        return Ok(CompletionHandle::null());
    }
    let state = HostAllreduce::new(ctx.get_communicator(), buffer, count, T::TYPE, op)?;
    let handle = state.handle.clone();
    ctx.get_engine().enqueue(Box::new(state))?;
    Ok(handle)
}

/// Broadcast the first `count` elements of `buffer` on `root`.
pub fn ibcast<T: Element>(
    ctx: &NbcContext,
    buffer: &HostBuffer,
    count: usize,
    root: i32,
) -> NbcResult<CompletionHandle> {
    if count == 0 {
        return Ok(CompletionHandle::null());
    }
    let state = HostBcast::new(ctx.get_communicator(), buffer, count, T::TYPE, root)?;
    let handle = state.handle.clone();
    ctx.get_engine().enqueue(Box::new(state))?;
    Ok(handle)
}

pub struct HostAllreduce {
    comm: Arc<dyn Communicator>,
    buffer: HostBuffer,
    count: usize,
    data_type: Type,
    op: ReduceOp,
    handle: CompletionHandle,
    request: Option<Box<dyn Request>>,
}

impl HostAllreduce {
    pub fn new(
        comm: Arc<dyn Communicator>,
        buffer: &HostBuffer,
        count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> NbcResult<Self> {
        if count == 0 {
            return Err(NbcError::Invalid("allreduce of zero elements".into()));
        }
        if !op.supports(data_type) {
            return Err(NbcError::TypeError(format!(
                "reduction {} is not defined for {}",
                op, data_type
            )));
        }
        check_host_len(buffer, data_type, count)?;
        Ok(Self {
            comm,
            buffer: buffer.clone(),
            count,
            data_type,
            op,
            handle: CompletionHandle::new(),
            request: None,
        })
    }

    pub fn completion_handle(&self) -> CompletionHandle {
        self.handle.clone()
    }
}

impl OperationState for HostAllreduce {
    fn step(&mut self) -> NbcResult<PeAction> {
        if self.request.is_none() {
            self.request = Some(self.comm.iallreduce(
                None,
                &self.buffer,
                self.count,
                self.data_type,
                self.op,
            )?);
        }
        let done = match self.request.as_mut() {
            Some(request) => request.test()?,
            None => false,
        };
        if done {
            Ok(PeAction::Complete)
        } else {
            Ok(PeAction::Continue)
        }
    }

    fn get_completion_handle(&self) -> Option<&CompletionHandle> {
        Some(&self.handle)
    }

    fn get_name(&self) -> &str {
        "MPIAllreduce"
    }

    fn get_desc(&self) -> String {
        format!("count={} type={} op={}", self.count, self.data_type, self.op)
    }
}

pub struct HostBcast {
    comm: Arc<dyn Communicator>,
    buffer: HostBuffer,
    count: usize,
    data_type: Type,
    root: i32,
    handle: CompletionHandle,
    request: Option<Box<dyn Request>>,
}

impl HostBcast {
    pub fn new(
        comm: Arc<dyn Communicator>,
        buffer: &HostBuffer,
        count: usize,
        data_type: Type,
        root: i32,
    ) -> NbcResult<Self> {
        if count == 0 {
            return Err(NbcError::Invalid("broadcast of zero elements".into()));
        }
        check_root(root, comm.get_world_size())?;
        check_host_len(buffer, data_type, count)?;
        Ok(Self {
            comm,
            buffer: buffer.clone(),
            count,
            data_type,
            root,
            handle: CompletionHandle::new(),
            request: None,
        })
    }

    pub fn completion_handle(&self) -> CompletionHandle {
        self.handle.clone()
    }
}

impl OperationState for HostBcast {
    fn step(&mut self) -> NbcResult<PeAction> {
        if self.request.is_none() {
            self.request = Some(self.comm.ibcast(
                &self.buffer,
                self.count,
                self.data_type,
                self.root,
            )?);
        }
        let done = match self.request.as_mut() {
            Some(request) => request.test()?,
            None => false,
        };
        if done {
            Ok(PeAction::Complete)
        } else {
            Ok(PeAction::Continue)
        }
    }

    fn get_completion_handle(&self) -> Option<&CompletionHandle> {
        Some(&self.handle)
    }

    fn get_name(&self) -> &str {
        "MPIBcast"
    }

    fn get_desc(&self) -> String {
        format!("root={} count={} type={}", self.root, self.count, self.data_type)
    }
}
