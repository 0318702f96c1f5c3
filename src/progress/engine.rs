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

//! The progress engine and its scheduler loop

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Sender};

use crate::config::{EngineConfig, IdlePolicy};
use crate::error::{FatalError, NbcError, NbcResult};
use crate::progress::affinity::{self, GroupPlacement};
use crate::progress::fatal::FatalReporter;
use crate::progress::pipeline::{InFlight, Pipeline};
use crate::progress::queue::QueueTable;
use crate::progress::request::CompletionHandle;
use crate::progress::state::{OperationState, RunType};

const DUMP_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Point-in-time counters, safe to read from any thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub admitted: u64,
    pub completed: u64,
    pub in_flight: usize,
    pub bounded_in_flight: usize,
    pub registered_contexts: usize,
}

enum Lifecycle {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Hands pipeline reports from the progress thread to `dump_state` callers.
///
/// Every request carries a sequence number that the reply echoes, so a
/// report produced for a caller that already gave up is never handed to the
/// next one. A pending request of 0 means none.
struct DumpMailbox {
    next_seq: AtomicU64,
    pending: AtomicU64,
    reply: Mutex<Option<(u64, String)>>,
}

impl DumpMailbox {
    fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(1),
            pending: AtomicU64::new(0),
            reply: Mutex::new(None),
        }
    }

    /// Publish a new request and return its sequence number
    fn post(&self) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut reply) = self.reply.lock() {
            *reply = None;
        }
        self.pending.store(seq, Ordering::Release);
        seq
    }

    /// Called by the progress thread; claims the pending request, if any
    fn take_request(&self) -> Option<u64> {
        match self.pending.swap(0, Ordering::AcqRel) {
            0 => None,
            seq => Some(seq),
        }
    }

    fn answer(&self, seq: u64, report: String) {
        if let Ok(mut reply) = self.reply.lock() {
            *reply = Some((seq, report));
        }
    }

    /// The reply to request `seq`. Replies to other requests are discarded.
    fn collect(&self, seq: u64) -> Option<String> {
        let mut reply = self.reply.lock().ok()?;
        match reply.take() {
            Some((answered, report)) if answered == seq => Some(report),
            _ => None,
        }
    }

    /// Give up on request `seq` unless the progress thread already claimed it
    fn withdraw(&self, seq: u64) {
        let _ = self
            .pending
            .compare_exchange(seq, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// State visible to both callers and the progress thread
struct EngineShared {
    queues: QueueTable,
    stop: AtomicBool,
    exited: AtomicBool,
    fatal: FatalReporter,
    dump: DumpMailbox,
    admitted: AtomicU64,
    completed: AtomicU64,
    in_flight: AtomicUsize,
    bounded_in_flight: AtomicUsize,
}

/// Sets `exited` when the progress thread leaves, including by unwinding
struct ExitGuard(Arc<EngineShared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.exited.store(true, Ordering::Release);
    }
}

/// Drives every enqueued [`OperationState`] to completion on one dedicated
/// thread.
///
/// # Example
/// ```ignore
/// let engine = ProgressEngine::new(EngineConfig::default())?;
/// engine.start()?;
/// engine.enqueue(Box::new(my_state))?;
/// engine.wait_for_completion(&mut handle)?;
/// engine.stop()?;
/// ```
pub struct ProgressEngine {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    lifecycle: Mutex<Lifecycle>,
    dump_lock: Mutex<()>,
}

impl ProgressEngine {
    pub fn new(config: EngineConfig) -> NbcResult<Self> {
        config.validate()?;
        let shared = EngineShared {
            queues: QueueTable::new(config.max_contexts, config.queue_capacity),
            stop: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            fatal: FatalReporter::from_config(&config),
            dump: DumpMailbox::new(),
            admitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            bounded_in_flight: AtomicUsize::new(0),
        };
        Ok(Self {
            config,
            shared: Arc::new(shared),
            lifecycle: Mutex::new(Lifecycle::Idle),
            dump_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start as the only group member on this node
    pub fn start(&self) -> NbcResult<()> {
        self.start_with_placement(GroupPlacement::default())
    }

    /// Spawn the progress thread and wait until it is ready.
    ///
    /// `placement` decides which core the thread binds to when binding is
    /// enabled. An engine runs at most once.
    pub fn start_with_placement(&self, placement: GroupPlacement) -> NbcResult<()> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| NbcError::poisoned("engine lifecycle"))?;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running(_) => {
                return Err(NbcError::Engine("progress engine already started".into()))
            }
            Lifecycle::Stopped => {
                return Err(NbcError::Engine("progress engine cannot be restarted".into()))
            }
        }

        let (ready_tx, ready_rx) = bounded(1);
        let scheduler = Scheduler::new(self.config.clone(), Arc::clone(&self.shared), placement);
        let guard = ExitGuard(Arc::clone(&self.shared));
        let handle = thread::Builder::new()
            .name("nbc-progress".to_string())
            .spawn(move || {
                let _guard = guard;
                scheduler.run(ready_tx);
            })?;

        match ready_rx.recv() {
            Ok(Some(cpu)) => crate::nbc_info!("Progress engine started on cpu {}", cpu),
            Ok(None) => crate::nbc_info!("Progress engine started (unbound)"),
            Err(_) => {
                let _ = handle.join();
                *lifecycle = Lifecycle::Stopped;
                return Err(NbcError::Engine(
                    "progress thread exited during startup".into(),
                ));
            }
        }
        *lifecycle = Lifecycle::Running(handle);
        Ok(())
    }

    /// Stop the progress thread and wait for it to exit.
    ///
    /// Operations still queued or in flight are dropped without completing.
    pub fn stop(&self) -> NbcResult<()> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| NbcError::poisoned("engine lifecycle"))?;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(handle) => {
                self.shared.stop.store(true, Ordering::Release);
                handle
                    .join()
                    .map_err(|_| NbcError::Engine("progress thread panicked".into()))?;
                crate::nbc_info!("Progress engine stopped");
                Ok(())
            }
            Lifecycle::Idle => {
                *lifecycle = Lifecycle::Idle;
                Err(NbcError::Engine("progress engine was never started".into()))
            }
            Lifecycle::Stopped => Err(NbcError::Engine("progress engine already stopped".into())),
        }
    }

    /// Whether the progress thread is currently serving queues
    pub fn is_running(&self) -> bool {
        match self.lifecycle.lock() {
            Ok(lifecycle) => {
                matches!(*lifecycle, Lifecycle::Running(_))
                    && !self.shared.exited.load(Ordering::Acquire)
            }
            Err(_) => false,
        }
    }

    /// Hand `state` to the engine. Callable from any thread.
    ///
    /// States are routed by their execution context; the first state for a
    /// new context registers its queue. Registering more than
    /// `max_contexts` contexts is fatal. A full queue is waited on while the
    /// engine runs.
    pub fn enqueue(&self, state: Box<dyn OperationState>) -> NbcResult<()> {
        if self.shared.stop.load(Ordering::Acquire) {
            return Err(NbcError::Engine("progress engine has been stopped".into()));
        }
        let context = state.get_execution_context();
        let queue = match self.shared.queues.resolve(context) {
            Ok(queue) => queue,
            Err(fatal) => {
                let mut report = String::new();
                self.shared.queues.describe(&mut report);
                self.shared.fatal.raise(fatal, &report)
            }
        };

        crate::nbc_trace!("enqueue {} on {}", state.get_name(), context);
        let mut state = state;
        loop {
            match queue.push(state) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if !self.is_running() {
                        return Err(NbcError::new(
                            crate::error::Code::CapacityError,
                            format!("submission queue for {} is full", context),
                        ));
                    }
                    state = rejected;
                    thread::yield_now();
                }
            }
        }
    }

    /// Whether the operation behind `handle` finished.
    ///
    /// On success the handle is cleared to null, releasing its reference.
    pub fn is_complete(&self, handle: &mut CompletionHandle) -> bool {
        if handle.is_done() {
            handle.clear();
            true
        } else {
            false
        }
    }

    /// Block the caller until `handle` completes.
    ///
    /// Fails if the progress thread exits first.
    pub fn wait_for_completion(&self, handle: &mut CompletionHandle) -> NbcResult<()> {
        loop {
            if self.is_complete(handle) {
                return Ok(());
            }
            if self.shared.exited.load(Ordering::Acquire) {
                // The thread may have signalled just before exiting.
                if self.is_complete(handle) {
                    return Ok(());
                }
                return Err(NbcError::Engine(
                    "progress engine exited before the operation completed".into(),
                ));
            }
            match self.config.idle_policy {
                IdlePolicy::Spin => std::hint::spin_loop(),
                IdlePolicy::Yield => thread::yield_now(),
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            admitted: self.shared.admitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            in_flight: self.shared.in_flight.load(Ordering::Relaxed),
            bounded_in_flight: self.shared.bounded_in_flight.load(Ordering::Relaxed),
            registered_contexts: self.shared.queues.len(),
        }
    }

    /// Human-readable description of queues and pipelines.
    ///
    /// Pipelines belong to the progress thread, so their section is produced
    /// there between passes. If the thread does not answer in time that
    /// section is reported as unavailable.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let stats = self.stats();
        let _ = writeln!(out, "Progress engine state:");
        let _ = writeln!(out, "Running: {}", self.is_running());
        let _ = writeln!(
            out,
            "Admitted: {} Completed: {} In flight: {} Bounded: {}/{}",
            stats.admitted,
            stats.completed,
            stats.in_flight,
            stats.bounded_in_flight,
            self.config.max_concurrent_ops
        );
        self.shared.queues.describe(&mut out);

        if !self.is_running() {
            let _ = writeln!(out, "Pipelines: progress thread not running");
            return out;
        }
        match self.request_pipeline_report() {
            Some(report) => out.push_str(&report),
            None => {
                let _ = writeln!(out, "Pipelines: unavailable (progress thread did not respond)");
            }
        }
        out
    }

    fn request_pipeline_report(&self) -> Option<String> {
        let _serial = self.dump_lock.lock().ok()?;
        let seq = self.shared.dump.post();

        let deadline = Instant::now() + DUMP_REPLY_TIMEOUT;
        while Instant::now() < deadline && !self.shared.exited.load(Ordering::Acquire) {
            if let Some(report) = self.shared.dump.collect(seq) {
                return Some(report);
            }
            thread::sleep(Duration::from_millis(1));
        }
        self.shared.dump.withdraw(seq);
        None
    }
}

impl Drop for ProgressEngine {
    fn drop(&mut self) {
        let running = matches!(
            self.lifecycle.lock().as_deref(),
            Ok(Lifecycle::Running(_))
        );
        if running {
            if let Err(e) = self.stop() {
                crate::nbc_warn!("Stopping progress engine on drop: {}", e);
            }
        }
    }
}

/// Everything owned by the progress thread
struct Scheduler {
    config: EngineConfig,
    shared: Arc<EngineShared>,
    placement: GroupPlacement,
    /// Head taken off each queue but not yet admitted, by queue index
    heads: Vec<Option<Box<dyn OperationState>>>,
    /// One pipeline per queue index, created on first admission
    pipelines: Vec<Option<Pipeline>>,
    /// Queue indices with a pipeline, in creation order
    active: Vec<usize>,
    num_bounded: usize,
    next_id: u64,
}

impl Scheduler {
    fn new(config: EngineConfig, shared: Arc<EngineShared>, placement: GroupPlacement) -> Self {
        let max_contexts = config.max_contexts;
        Self {
            config,
            shared,
            placement,
            heads: (0..max_contexts).map(|_| None).collect(),
            pipelines: (0..max_contexts).map(|_| None).collect(),
            active: Vec::with_capacity(max_contexts),
            num_bounded: 0,
            next_id: 0,
        }
    }

    fn run(mut self, ready: Sender<Option<usize>>) {
        let bound = if self.config.bind_to_core {
            match affinity::bind_progress_thread(self.placement, &self.config) {
                Ok(cpu) => Some(cpu),
                Err(e) => self.fail(FatalError::Affinity(e)),
            }
        } else {
            None
        };
        let _ = ready.send(bound);

        while !self.shared.stop.load(Ordering::Acquire) {
            let admitted = self.admit_ready();
            let stepped = match self.step_pipelines() {
                Ok(stepped) => stepped,
                Err(e) => self.fail(e),
            };
            self.serve_dump_request();

            if admitted + stepped == 0 {
                match self.config.idle_policy {
                    IdlePolicy::Spin => std::hint::spin_loop(),
                    IdlePolicy::Yield => thread::yield_now(),
                }
            }
        }
        self.report_leftovers();
    }

    /// Admit the head of every unblocked queue, subject to the bounded cap.
    fn admit_ready(&mut self) -> usize {
        let shared = &*self.shared;
        let cap = self.config.max_concurrent_ops;
        let num_stages = self.config.pipeline_stages;
        let mut admitted = 0;

        for index in 0..shared.queues.len() {
            let queue = match shared.queues.get(index) {
                Some(queue) => queue,
                None => continue,
            };
            if queue.is_blocked() {
                continue;
            }

            let head = &mut self.heads[index];
            if head.is_none() {
                *head = queue.pop();
            }
            let run_type = match head.as_ref() {
                Some(state) => state.get_run_type(),
                None => continue,
            };
            if run_type == RunType::Bounded && self.num_bounded >= cap {
                continue;
            }
            let mut state = match head.take() {
                Some(state) => state,
                None => continue,
            };

            if run_type == RunType::Bounded {
                self.num_bounded += 1;
            }
            state.start();
            let blocks = state.blocks();
            if blocks {
                queue.set_blocked(true);
            }
            let id = self.next_id;
            self.next_id += 1;
            crate::nbc_trace!(
                "start {} #{} on {} ({})",
                state.get_name(),
                id,
                queue.get_context(),
                run_type
            );

            if self.pipelines[index].is_none() {
                self.pipelines[index] = Some(Pipeline::new(queue.get_context(), num_stages));
                self.active.push(index);
            }
            if let Some(pipeline) = self.pipelines[index].as_mut() {
                pipeline.admit(InFlight::new(state, id, index, run_type, blocks));
            }

            admitted += 1;
            shared.admitted.fetch_add(1, Ordering::Relaxed);
            shared.in_flight.fetch_add(1, Ordering::Relaxed);
            shared
                .bounded_in_flight
                .store(self.num_bounded, Ordering::Relaxed);
        }
        admitted
    }

    fn step_pipelines(&mut self) -> Result<usize, FatalError> {
        let hang_timeout = self.config.hang_timeout;
        let shared = &*self.shared;
        let num_bounded = &mut self.num_bounded;
        let mut progress = 0;
        for &index in &self.active {
            if let Some(pipeline) = self.pipelines[index].as_mut() {
                progress += pipeline.run(hang_timeout, |op| retire(shared, num_bounded, op))?;
            }
        }
        Ok(progress)
    }

    fn serve_dump_request(&self) {
        if let Some(seq) = self.shared.dump.take_request() {
            let report = self.describe_pipelines();
            self.shared.dump.answer(seq, report);
        }
    }

    fn describe_pipelines(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Bounded in flight (scheduler): {}", self.num_bounded);
        for (index, head) in self.heads.iter().enumerate() {
            if let Some(state) = head {
                let _ = writeln!(out, "Staged head of queue {}: {}", index, state.get_name());
            }
        }
        for &index in &self.active {
            if let Some(pipeline) = &self.pipelines[index] {
                pipeline.describe(&mut out);
            }
        }
        out
    }

    fn report_leftovers(&self) {
        let staged = self.heads.iter().filter(|head| head.is_some()).count();
        let in_flight: usize = self
            .pipelines
            .iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .map(Pipeline::len)
            .sum();
        if staged + in_flight > 0 {
            crate::nbc_warn!(
                "Progress engine stopping with {} operations in flight and {} staged",
                in_flight,
                staged
            );
        }
    }

    fn fail(&self, error: FatalError) -> ! {
        let mut report = String::new();
        self.shared.queues.describe(&mut report);
        report.push_str(&self.describe_pipelines());
        self.shared.fatal.raise(error, &report)
    }
}

/// Unblock, destroy and then signal a completed operation.
///
/// The handle is signalled last so a caller that observes completion also
/// observes the state's resources released and the counters updated.
fn retire(shared: &EngineShared, num_bounded: &mut usize, op: InFlight) {
    let handle = if op.state.needs_completion() {
        op.state.get_completion_handle().cloned()
    } else {
        None
    };
    if op.run_type == RunType::Bounded {
        *num_bounded = num_bounded.saturating_sub(1);
        shared.bounded_in_flight.store(*num_bounded, Ordering::Relaxed);
    }
    if op.blocks {
        if let Some(queue) = shared.queues.get(op.origin) {
            queue.set_blocked(false);
        }
    }
    crate::nbc_trace!(
        "done {} #{} after {:?}",
        op.state.get_name(),
        op.id,
        op.admitted_at.elapsed()
    );
    drop(op);
    shared.completed.fetch_add(1, Ordering::Relaxed);
    shared.in_flight.fetch_sub(1, Ordering::Relaxed);
    if let Some(handle) = handle {
        handle.mark_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::DumpMailbox;

    #[test]
    fn late_reply_is_not_handed_to_the_next_request() {
        let mailbox = DumpMailbox::new();

        // First caller times out after the progress thread claimed its request.
        let first = mailbox.post();
        let claimed = mailbox.take_request();
        assert_eq!(claimed, Some(first));
        assert_eq!(mailbox.collect(first), None);
        mailbox.withdraw(first);

        // Second caller posts, then the stale report for the first arrives.
        let second = mailbox.post();
        mailbox.answer(first, "stale".to_string());
        assert_eq!(mailbox.collect(second), None);

        assert_eq!(mailbox.take_request(), Some(second));
        mailbox.answer(second, "fresh".to_string());
        assert_eq!(mailbox.collect(second).as_deref(), Some("fresh"));
    }

    #[test]
    fn withdrawn_request_is_not_served() {
        let mailbox = DumpMailbox::new();
        let seq = mailbox.post();
        mailbox.withdraw(seq);
        assert_eq!(mailbox.take_request(), None);
    }
}
