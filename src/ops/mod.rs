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

//! Non-blocking collectives
//!
//! Device collectives stage data through pinned host memory: the payload is
//! copied off the device on the caller's stream, exchanged by the network
//! backend, and copied back on the same stream. They are stream-ordered, so
//! later work on the stream observes the result without any host-side wait.
//!
//! Host collectives operate on host buffers directly and report completion
//! through a [`CompletionHandle`](crate::progress::CompletionHandle).
//!
//! Every entry point returns immediately. A call with a zero element count
//! does nothing: no operation state is created, no memory is taken from the
//! pool and the backend is not contacted.

pub mod allreduce;
pub mod bcast;
pub mod gather;
pub mod host;
pub mod scatter;

pub use allreduce::{allreduce, HostStagedAllreduce};
pub use bcast::{bcast, HostStagedBcast};
pub use gather::{gather, HostStagedGather};
pub use host::{iallreduce, ibcast, HostAllreduce, HostBcast};
pub use scatter::{scatter, HostStagedScatter};

use crate::data_types::Element;
use crate::error::{NbcError, NbcResult};
use crate::gpu::DeviceBuffer;

pub(crate) fn check_root(root: i32, world_size: i32) -> NbcResult<()> {
    if root < 0 || root >= world_size {
        return Err(NbcError::Invalid(format!(
            "root {} outside group of {}",
            root, world_size
        )));
    }
    Ok(())
}

pub(crate) fn check_device_len<T: Element>(
    what: &str,
    buffer: &DeviceBuffer<T>,
    needed: usize,
) -> NbcResult<()> {
    if buffer.len() < needed {
        return Err(NbcError::IndexError(format!(
            "{} holds {} elements but {} are required",
            what,
            buffer.len(),
            needed
        )));
    }
    Ok(())
}
