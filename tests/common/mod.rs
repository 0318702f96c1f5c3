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

//! Shared helpers for integration tests: scripted operation states and
//! polling utilities.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nbcoll::config::{EngineConfig, FatalPolicy, IdlePolicy};
use nbcoll::ctx::NbcContext;
use nbcoll::error::NbcResult;
use nbcoll::net::{Communicator, LocalCommunicator, LocalGroup};
use nbcoll::progress::{CompletionHandle, ExecutionContext, OperationState, PeAction, RunType};

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Unbound, cooperative engine configuration suitable for shared test machines
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
        .with_bind_to_core(false)
        .with_idle_policy(IdlePolicy::Yield)
        .with_fatal_policy(FatalPolicy::Panic)
}

/// Run `body` once per rank of a fresh in-process group, each rank on its
/// own thread with its own context, and collect the results in rank order.
pub fn run_ranks<R, F>(size: usize, body: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(Arc<LocalCommunicator>, Arc<NbcContext>) -> R + Send + Sync + 'static,
{
    let comms = LocalGroup::create(size).unwrap();
    let body = Arc::new(body);
    let workers: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let dyn_comm: Arc<dyn Communicator> = comm.clone();
                let ctx = NbcContext::init(dyn_comm, test_config()).unwrap();
                let result = body(comm, Arc::clone(&ctx));
                ctx.barrier().unwrap();
                ctx.finalize().unwrap();
                result
            })
        })
        .collect();
    workers.into_iter().map(|w| w.join().unwrap()).collect()
}

/// Poll `cond` until it holds or `timeout` expires
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trace {
    Started(String),
    Stepped(String, usize),
    Dropped(String),
}

pub type TraceLog = Arc<Mutex<Vec<Trace>>>;

pub fn new_log() -> TraceLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn snapshot(log: &TraceLog) -> Vec<Trace> {
    log.lock().unwrap().clone()
}

/// Index of the first entry matching `pred`
pub fn position<F: Fn(&Trace) -> bool>(log: &TraceLog, pred: F) -> Option<usize> {
    snapshot(log).iter().position(|t| pred(t))
}

pub fn has_dropped(log: &TraceLog, name: &str) -> bool {
    position(log, |t| *t == Trace::Dropped(name.to_string())).is_some()
}

/// Counts how many tracked operations are between `start` and drop
#[derive(Default)]
pub struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An operation whose behaviour is fully scripted.
///
/// Returns `Continue` while its gate is closed, then for each of `advances`
/// stages spends `continues_per_stage` steps before returning `Advance`,
/// and finally returns `Complete`. Every call is appended to the trace log
/// together with the stage the operation believes it is in.
pub struct ScriptedOp {
    name: String,
    context: ExecutionContext,
    run_type: RunType,
    blocks: bool,
    needs_completion: bool,
    advances: usize,
    continues_per_stage: usize,
    continues_left: usize,
    phase: usize,
    gate: Option<Arc<AtomicBool>>,
    handle: CompletionHandle,
    log: TraceLog,
    occupancy: Option<Arc<Occupancy>>,
    started: bool,
}

impl ScriptedOp {
    pub fn new(name: &str, log: &TraceLog) -> Self {
        Self {
            name: name.to_string(),
            context: ExecutionContext::DEFAULT,
            run_type: RunType::Bounded,
            blocks: false,
            needs_completion: true,
            advances: 0,
            continues_per_stage: 0,
            continues_left: 0,
            phase: 0,
            gate: None,
            handle: CompletionHandle::new(),
            log: Arc::clone(log),
            occupancy: None,
            started: false,
        }
    }

    pub fn on_context(mut self, id: u64) -> Self {
        self.context = ExecutionContext::new(id);
        self
    }

    pub fn unbounded(mut self) -> Self {
        self.run_type = RunType::Unbounded;
        self
    }

    pub fn blocking(mut self) -> Self {
        self.blocks = true;
        self
    }

    pub fn without_completion(mut self) -> Self {
        self.needs_completion = false;
        self
    }

    pub fn advances(mut self, advances: usize) -> Self {
        self.advances = advances;
        self
    }

    pub fn continues_per_stage(mut self, continues: usize) -> Self {
        self.continues_per_stage = continues;
        self.continues_left = continues;
        self
    }

    pub fn gated(mut self, gate: &Arc<AtomicBool>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    pub fn tracked(mut self, occupancy: &Arc<Occupancy>) -> Self {
        self.occupancy = Some(Arc::clone(occupancy));
        self
    }

    pub fn handle(&self) -> CompletionHandle {
        self.handle.clone()
    }

    fn record(&self, trace: Trace) {
        self.log.lock().unwrap().push(trace);
    }
}

impl OperationState for ScriptedOp {
    fn step(&mut self) -> NbcResult<PeAction> {
        self.record(Trace::Stepped(self.name.clone(), self.phase));
        if let Some(gate) = &self.gate {
            if !gate.load(Ordering::Acquire) {
                return Ok(PeAction::Continue);
            }
        }
        if self.continues_left > 0 {
            self.continues_left -= 1;
            return Ok(PeAction::Continue);
        }
        if self.phase < self.advances {
            self.phase += 1;
            self.continues_left = self.continues_per_stage;
            return Ok(PeAction::Advance);
        }
        Ok(PeAction::Complete)
    }

    fn get_execution_context(&self) -> ExecutionContext {
        self.context
    }

    fn get_run_type(&self) -> RunType {
        self.run_type
    }

    fn blocks(&self) -> bool {
        self.blocks
    }

    fn needs_completion(&self) -> bool {
        self.needs_completion
    }

    fn get_completion_handle(&self) -> Option<&CompletionHandle> {
        Some(&self.handle)
    }

    fn start(&mut self) {
        self.started = true;
        if let Some(occupancy) = &self.occupancy {
            occupancy.enter();
        }
        self.record(Trace::Started(self.name.clone()));
    }

    fn get_name(&self) -> &str {
        &self.name
    }

    fn get_desc(&self) -> String {
        format!("phase={}", self.phase)
    }
}

impl Drop for ScriptedOp {
    fn drop(&mut self) {
        if self.started {
            if let Some(occupancy) = &self.occupancy {
                occupancy.leave();
            }
        }
        if let Ok(mut log) = self.log.lock() {
            log.push(Trace::Dropped(self.name.clone()));
        }
    }
}

/// An operation whose step always fails, as a broken backend would
pub struct FailingOp;

impl OperationState for FailingOp {
    fn step(&mut self) -> NbcResult<PeAction> {
        Err(nbcoll::NbcError::Communication("injected backend failure".into()))
    }

    fn get_name(&self) -> &str {
        "FailingOp"
    }
}
