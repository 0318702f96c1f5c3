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

//! The operation state interface driven by the progress engine

use std::fmt;

use crate::error::NbcResult;
use crate::progress::request::CompletionHandle;

/// What the engine should do with an operation after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeAction {
    /// Nothing is ready yet; step again on the next pass
    Continue,
    /// Ready to move to the next pipeline stage
    Advance,
    /// Finished; the engine signals and destroys the state
    Complete,
}

/// Whether an operation consumes one of the engine's concurrency slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    Bounded,
    Unbounded,
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunType::Bounded => write!(f, "bounded"),
            RunType::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Identity of an independent ordering domain, such as one device stream.
///
/// Operations sharing a context are admitted and staged in FIFO order;
/// nothing is guaranteed across contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContext(u64);

impl ExecutionContext {
    /// The context used by host-only operations
    pub const DEFAULT: ExecutionContext = ExecutionContext(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// One in-flight collective, advanced by repeated non-blocking steps.
///
/// Every collective algorithm implements this independently. Once enqueued
/// the state belongs to the engine, which calls [`step`](Self::step) from its
/// own thread until the state reports [`PeAction::Complete`] and then drops
/// it.
///
/// `step` must never wait: anything that is not ready yet is expressed by
/// returning [`PeAction::Continue`]. An `Err` from `step` means a backend
/// primitive failed, which is fatal for the whole process.
pub trait OperationState: Send {
    /// Make as much progress as possible without blocking
    fn step(&mut self) -> NbcResult<PeAction>;

    /// Routing key for queue and pipeline selection; must not change
    fn get_execution_context(&self) -> ExecutionContext {
        ExecutionContext::DEFAULT
    }

    fn get_run_type(&self) -> RunType {
        RunType::Bounded
    }

    /// Whether the origin queue must admit nothing else until this completes
    fn blocks(&self) -> bool {
        false
    }

    /// Whether the engine signals [`get_completion_handle`](Self::get_completion_handle)
    /// on completion. Stream-ordered operations signal through the device instead.
    fn needs_completion(&self) -> bool {
        true
    }

    fn get_completion_handle(&self) -> Option<&CompletionHandle> {
        None
    }

    /// Called once, at admission. Instrumentation only.
    fn start(&mut self) {}

    fn get_name(&self) -> &str;

    fn get_desc(&self) -> String {
        String::new()
    }
}
