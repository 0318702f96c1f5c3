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

//! Staged run queues for one execution context
//!
//! Each stage is an ordered list of admitted operations. Only the head of a
//! stage may move to the next stage. A non-head operation that asks to
//! advance is paused (no longer stepped) until everything ahead of it has
//! left the stage, which keeps the relative order of operations intact from
//! one stage to the next.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::error::FatalError;
use crate::progress::state::{ExecutionContext, OperationState, PeAction, RunType};

/// An admitted operation plus the bookkeeping the scheduler keeps for it
pub(crate) struct InFlight {
    pub(crate) state: Box<dyn OperationState>,
    pub(crate) id: u64,
    /// Index of the submission queue the operation came from
    pub(crate) origin: usize,
    pub(crate) stage: usize,
    pub(crate) paused_for_advance: bool,
    pub(crate) run_type: RunType,
    pub(crate) blocks: bool,
    pub(crate) admitted_at: Instant,
    /// Last admission or stage transition
    last_progress: Instant,
    hang_reported: bool,
}

impl InFlight {
    pub(crate) fn new(
        state: Box<dyn OperationState>,
        id: u64,
        origin: usize,
        run_type: RunType,
        blocks: bool,
    ) -> Self {
        let now = Instant::now();
        Self {
            state,
            id,
            origin,
            stage: 0,
            paused_for_advance: false,
            run_type,
            blocks,
            admitted_at: now,
            last_progress: now,
            hang_reported: false,
        }
    }

    fn check_hang(&mut self, context: ExecutionContext, timeout: Duration) {
        if self.hang_reported {
            return;
        }
        let elapsed = self.last_progress.elapsed();
        if elapsed > timeout {
            self.hang_reported = true;
            crate::nbc_warn!(
                "Operation {} #{} on {} has made no progress for {:?} (stage {}): {}",
                self.state.get_name(),
                self.id,
                context,
                elapsed,
                self.stage,
                self.state.get_desc()
            );
        }
    }
}

pub(crate) struct Pipeline {
    context: ExecutionContext,
    stages: Vec<VecDeque<InFlight>>,
}

impl Pipeline {
    pub(crate) fn new(context: ExecutionContext, num_stages: usize) -> Self {
        Self {
            context,
            stages: (0..num_stages).map(|_| VecDeque::new()).collect(),
        }
    }

    pub(crate) fn admit(&mut self, op: InFlight) {
        if let Some(first) = self.stages.first_mut() {
            first.push_back(op);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.stages.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.stages.iter().all(VecDeque::is_empty)
    }

    /// Run one pass over every stage, in stage order.
    ///
    /// Completed operations are handed to `retire`. Returns how many steps
    /// produced something other than [`PeAction::Continue`].
    pub(crate) fn run<F>(
        &mut self,
        hang_timeout: Option<Duration>,
        mut retire: F,
    ) -> Result<usize, FatalError>
    where
        F: FnMut(InFlight),
    {
        let num_stages = self.stages.len();
        let mut progress = 0;

        for stage in 0..num_stages {
            let mut i = 0;
            while i < self.stages[stage].len() {
                let entry = &mut self.stages[stage][i];
                if entry.paused_for_advance {
                    i += 1;
                    continue;
                }

                let action = match entry.state.step() {
                    Ok(action) => action,
                    Err(source) => {
                        return Err(FatalError::Backend {
                            name: entry.state.get_name().to_string(),
                            source,
                        })
                    }
                };

                match action {
                    PeAction::Continue => {
                        if let Some(timeout) = hang_timeout {
                            entry.check_hang(self.context, timeout);
                        }
                        i += 1;
                    }
                    PeAction::Advance => {
                        progress += 1;
                        if stage + 1 >= num_stages {
                            return Err(FatalError::PipelineOverflow {
                                name: entry.state.get_name().to_string(),
                                stage,
                                stages: num_stages,
                            });
                        }
                        entry.last_progress = Instant::now();
                        if i == 0 {
                            if let Some(op) = self.stages[stage].pop_front() {
                                self.push_to_next(stage, op);
                            }
                        } else {
                            entry.paused_for_advance = true;
                            i += 1;
                        }
                    }
                    PeAction::Complete => {
                        progress += 1;
                        if let Some(op) = self.stages[stage].remove(i) {
                            retire(op);
                        }
                    }
                }
            }

            // Release paused operations that have reached the head.
            while self.stages[stage]
                .front()
                .map_or(false, |op| op.paused_for_advance)
            {
                if let Some(mut op) = self.stages[stage].pop_front() {
                    op.paused_for_advance = false;
                    self.push_to_next(stage, op);
                }
            }
        }

        Ok(progress)
    }

    fn push_to_next(&mut self, stage: usize, mut op: InFlight) {
        op.stage = stage + 1;
        op.last_progress = Instant::now();
        self.stages[stage + 1].push_back(op);
    }

    pub(crate) fn describe(&self, out: &mut String) {
        let _ = writeln!(out, "Pipeline for {} ({} in flight):", self.context, self.len());
        for (stage, ops) in self.stages.iter().enumerate() {
            let _ = writeln!(out, "  Stage {} run queue ({}):", stage, ops.len());
            for (position, op) in ops.iter().enumerate() {
                let _ = writeln!(
                    out,
                    "    {}: #{} {} {} paused={} blocks={} age={:?} {}",
                    position,
                    op.id,
                    op.state.get_name(),
                    op.run_type,
                    op.paused_for_advance,
                    op.blocks,
                    op.admitted_at.elapsed(),
                    op.state.get_desc()
                );
            }
        }
    }
}
