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

//! Communicator trait
//!
//! The interface every network backend implements. Collective primitives are
//! non-blocking: they post the operation against host buffers and return a
//! [`Request`] that is polled until it reports completion. Buffers must stay
//! untouched until then.

use crate::data_types::Type;
use crate::error::NbcResult;
use crate::gpu::HostBuffer;

use super::comm_operations::ReduceOp;
use super::{CommType, Request};

/// Communicator trait - main interface for distributed operations
pub trait Communicator: Send + Sync {
    fn get_rank(&self) -> i32;
    fn get_world_size(&self) -> i32;
    /// Rank among the group members on this node
    fn get_local_rank(&self) -> i32;
    /// Number of group members on this node
    fn get_local_size(&self) -> i32;
    fn get_comm_type(&self) -> CommType;

    /// Blocking barrier. Never called from the progress thread.
    fn barrier(&self) -> NbcResult<()>;

    /// Scatter `count` elements per rank from `send` on `root`.
    ///
    /// `recv` of `None` means in place: only valid on the root, whose share
    /// stays where it is in `send`. Non-roots ignore `send`.
    fn iscatter(
        &self,
        send: &HostBuffer,
        recv: Option<&HostBuffer>,
        count: usize,
        data_type: Type,
        root: i32,
    ) -> NbcResult<Box<dyn Request>>;

    /// Gather `count` elements from every rank into `recv` on `root`.
    ///
    /// `send` of `None` means in place: only valid on the root, whose share
    /// is already at its slot in `recv`. Non-roots ignore `recv`.
    fn igather(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        count: usize,
        data_type: Type,
        root: i32,
    ) -> NbcResult<Box<dyn Request>>;

    fn ibcast(
        &self,
        buffer: &HostBuffer,
        count: usize,
        data_type: Type,
        root: i32,
    ) -> NbcResult<Box<dyn Request>>;

    /// `send` of `None` means in place: the input is read from `recv`.
    fn iallreduce(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> NbcResult<Box<dyn Request>>;

    /// Like [`iallreduce`](Self::iallreduce) but only `root` receives the result.
    fn ireduce(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        count: usize,
        data_type: Type,
        op: ReduceOp,
        root: i32,
    ) -> NbcResult<Box<dyn Request>>;

    /// Reduce `world_size * recv_count` elements and leave block `rank` in
    /// the first `recv_count` elements of `recv`.
    ///
    /// `send` of `None` means in place: the full input is read from `recv`.
    fn ireduce_scatter(
        &self,
        send: Option<&HostBuffer>,
        recv: &HostBuffer,
        recv_count: usize,
        data_type: Type,
        op: ReduceOp,
    ) -> NbcResult<Box<dyn Request>>;
}
