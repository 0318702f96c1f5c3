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

//! Networking and communication components
//!
//! The collectives only need non-blocking primitives: each call posts the
//! operation and returns a [`Request`] the progress engine polls.

use std::thread;

use crate::error::NbcResult;

pub mod comm_operations;
pub mod communicator;
pub mod local;

pub use comm_operations::ReduceOp;
pub use communicator::Communicator;
pub use local::{LocalCommunicator, LocalGroup};

/// Communication backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommType {
    /// In-process group of communicators, one per rank
    Local,
}

/// Handle to a posted non-blocking primitive
pub trait Request: Send {
    /// Poll for completion without blocking
    fn test(&mut self) -> NbcResult<bool>;

    /// Block until complete. Never called from the progress thread.
    fn wait(&mut self) -> NbcResult<()> {
        while !self.test()? {
            thread::yield_now();
        }
        Ok(())
    }
}
