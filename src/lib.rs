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

//! nbcoll: non-blocking collective communication
//!
//! Collectives (scatter, gather, broadcast, allreduce) are issued without
//! blocking the caller. Each call becomes an operation state that a
//! dedicated progress thread admits, pipelines and drives to completion,
//! keeping strict order within each execution context and a cap on how
//! many operations run at once.

pub mod config;
pub mod ctx;
pub mod data_types;
pub mod error;
pub mod gpu;
pub mod net;
pub mod ops;
pub mod progress;
pub mod util;

// Re-export commonly used types
pub use crate::config::{EngineConfig, FatalPolicy, IdlePolicy};
pub use crate::ctx::NbcContext;
pub use crate::data_types::{Element, Type};
pub use crate::error::{Code, FatalError, NbcError, NbcResult};
pub use crate::progress::{
    CompletionHandle, ExecutionContext, OperationState, PeAction, ProgressEngine, RunType,
};

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
