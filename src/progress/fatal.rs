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

//! Reporting of unrecoverable conditions

use std::backtrace::Backtrace;
use std::fmt::Write as _;
use std::path::PathBuf;

use crate::config::{EngineConfig, FatalPolicy};
use crate::error::FatalError;
use crate::util::dump;

/// Terminates according to the configured [`FatalPolicy`] after logging the
/// condition and, if a dump directory is configured, writing the error dump.
#[derive(Clone, Debug)]
pub struct FatalReporter {
    policy: FatalPolicy,
    dump_dir: Option<PathBuf>,
}

impl FatalReporter {
    pub fn new(policy: FatalPolicy, dump_dir: Option<PathBuf>) -> Self {
        Self { policy, dump_dir }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.fatal_policy, config.dump_dir.clone())
    }

    pub fn policy(&self) -> FatalPolicy {
        self.policy
    }

    /// Report `error` with the engine state captured by the caller. Never returns.
    pub fn raise(&self, error: FatalError, engine_state: &str) -> ! {
        crate::nbc_error!("Fatal: {}", error);

        let mut report = String::new();
        let _ = writeln!(report, "Fatal error: {}", error);
        let mut source = std::error::Error::source(&error);
        while let Some(cause) = source {
            let _ = writeln!(report, "  caused by: {}", cause);
            source = cause.source();
        }
        let _ = writeln!(report, "\nBacktrace:\n{}", Backtrace::force_capture());
        let _ = writeln!(report, "\n{}", engine_state);

        if let Some(dir) = &self.dump_dir {
            match dump::write_error_dump(dir, &report) {
                Ok(path) => crate::nbc_error!("Error dump written to {}", path.display()),
                Err(e) => crate::nbc_error!("Could not write error dump: {}", e),
            }
        }

        match self.policy {
            FatalPolicy::Abort => {
                eprintln!("{}", report);
                std::process::abort()
            }
            FatalPolicy::Panic => panic!("{}", error),
        }
    }
}
