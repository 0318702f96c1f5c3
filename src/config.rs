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

//! Configuration types for the progress engine.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{NbcError, NbcResult};

/// Environment variable overriding the core the progress thread binds to
pub const ENV_PROGRESS_CORE: &str = "NBC_PROGRESS_CORE";
/// Environment variable overriding how many group members share a NUMA node
pub const ENV_RANKS_PER_NUMA_NODE: &str = "NBC_PROGRESS_RANKS_PER_NUMA_NODE";
/// Environment variable enabling the hang detector (seconds)
pub const ENV_HANG_CHECK_SECS: &str = "NBC_HANG_CHECK_SECS";

/// What happens when the engine hits an unrecoverable condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log, write the error dump if configured, then abort the process
    #[default]
    Abort,
    /// Log, then panic on the thread that observed the condition
    Panic,
}

/// How the scheduler and waiters behave when a pass makes no progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum IdlePolicy {
    /// Busy-poll
    #[default]
    Spin,
    /// Yield the time slice between idle passes
    Yield,
}

/// Main configuration for the progress engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Maximum number of distinct execution contexts ever tracked
    pub max_contexts: usize,
    /// Number of pipeline stages per execution context
    pub pipeline_stages: usize,
    /// Cap on concurrently admitted bounded operations
    pub max_concurrent_ops: usize,
    /// Capacity of each submission queue
    pub queue_capacity: usize,
    /// Core index (within the NUMA node) to bind the progress thread to
    pub progress_core: Option<usize>,
    /// Number of group members sharing one NUMA node
    pub ranks_per_numa_node: Option<usize>,
    /// Whether the progress thread pins itself to a core at startup
    pub bind_to_core: bool,
    /// Report operations stuck in the pipeline longer than this
    pub hang_timeout: Option<Duration>,
    /// Idle behaviour of the scheduler loop and of `wait_for_completion`
    pub idle_policy: IdlePolicy,
    /// Handling of fatal conditions
    pub fatal_policy: FatalPolicy,
    /// Directory receiving `<host>.<pid>.dump.txt` reports on fatal errors
    pub dump_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_contexts: 64,
            pipeline_stages: 2,
            max_concurrent_ops: 4,
            queue_capacity: 4096,
            progress_core: None,
            ranks_per_numa_node: None,
            bind_to_core: true,
            hang_timeout: None,
            idle_policy: IdlePolicy::Spin,
            fatal_policy: FatalPolicy::Abort,
            dump_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default configuration with the environment overrides applied
    pub fn from_env() -> NbcResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `NBC_PROGRESS_CORE`, `NBC_PROGRESS_RANKS_PER_NUMA_NODE` and
    /// `NBC_HANG_CHECK_SECS` on top of this configuration.
    pub fn with_env_overrides(mut self) -> NbcResult<Self> {
        if let Some(core) = read_env_usize(ENV_PROGRESS_CORE)? {
            self.progress_core = Some(core);
        }
        if let Some(ranks) = read_env_usize(ENV_RANKS_PER_NUMA_NODE)? {
            if ranks == 0 {
                return Err(NbcError::Config(format!(
                    "{} must be at least 1",
                    ENV_RANKS_PER_NUMA_NODE
                )));
            }
            self.ranks_per_numa_node = Some(ranks);
        }
        if let Some(secs) = read_env_usize(ENV_HANG_CHECK_SECS)? {
            self.hang_timeout = Some(Duration::from_secs(secs as u64));
        }
        Ok(self)
    }

    pub fn with_max_contexts(mut self, max_contexts: usize) -> Self {
        self.max_contexts = max_contexts;
        self
    }

    pub fn with_pipeline_stages(mut self, stages: usize) -> Self {
        self.pipeline_stages = stages;
        self
    }

    pub fn with_max_concurrent_ops(mut self, cap: usize) -> Self {
        self.max_concurrent_ops = cap;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_progress_core(mut self, core: usize) -> Self {
        self.progress_core = Some(core);
        self
    }

    pub fn with_ranks_per_numa_node(mut self, ranks: usize) -> Self {
        self.ranks_per_numa_node = Some(ranks);
        self
    }

    pub fn with_bind_to_core(mut self, bind: bool) -> Self {
        self.bind_to_core = bind;
        self
    }

    pub fn with_hang_timeout(mut self, timeout: Duration) -> Self {
        self.hang_timeout = Some(timeout);
        self
    }

    pub fn with_idle_policy(mut self, policy: IdlePolicy) -> Self {
        self.idle_policy = policy;
        self
    }

    pub fn with_fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.fatal_policy = policy;
        self
    }

    pub fn with_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dump_dir = Some(dir.into());
        self
    }

    /// Reject configurations the scheduler cannot run with
    pub fn validate(&self) -> NbcResult<()> {
        if self.max_contexts == 0 {
            return Err(NbcError::Config("max_contexts must be at least 1".into()));
        }
        if self.pipeline_stages == 0 {
            return Err(NbcError::Config("pipeline_stages must be at least 1".into()));
        }
        if self.max_concurrent_ops == 0 {
            return Err(NbcError::Config(
                "max_concurrent_ops must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(NbcError::Config("queue_capacity must be at least 1".into()));
        }
        if self.ranks_per_numa_node == Some(0) {
            return Err(NbcError::Config(
                "ranks_per_numa_node must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn read_env_usize(key: &str) -> NbcResult<Option<usize>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| NbcError::Config(format!("{}={} is not a valid count", key, value))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(NbcError::Config(format!("{}: {}", key, e))),
    }
}
