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

//! The progress engine
//!
//! A single dedicated thread owns every submission queue and pipeline and is
//! the only place where [`OperationState::step`] runs. Callers construct an
//! operation state, hand it to [`ProgressEngine::enqueue`] and observe the
//! outcome through a [`CompletionHandle`].
//!
//! ```text
//!  caller threads                      progress thread
//!  ──────────────                      ───────────────
//!  enqueue(state) ──► [queue ctx 0] ──► admit ──► stage 0 ──► stage 1 ──► complete
//!  enqueue(state) ──► [queue ctx 1] ──► admit ──► stage 0 ──► ...
//!  is_complete(handle) ◄──────────────────────────────────────────── signal
//! ```

pub mod affinity;
pub mod engine;
pub mod fatal;
mod pipeline;
pub mod queue;
pub mod request;
pub mod state;

pub use affinity::{GroupPlacement, Topology};
pub use engine::{EngineStats, ProgressEngine};
pub use fatal::FatalReporter;
pub use queue::SubmissionQueue;
pub use request::CompletionHandle;
pub use state::{ExecutionContext, OperationState, PeAction, RunType};
