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

//! Per-context submission queues
//!
//! Any number of caller threads push into a queue; only the progress thread
//! pops. Queues are registered lazily, the first time a context is seen, into
//! a fixed table so that the progress thread can scan them without locking.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crossbeam_queue::ArrayQueue;

use crate::error::FatalError;
use crate::progress::state::{ExecutionContext, OperationState};

/// A bounded multi-producer queue of operation states for one context
pub struct SubmissionQueue {
    context: ExecutionContext,
    queue: ArrayQueue<Box<dyn OperationState>>,
    /// Set while a blocking operation from this queue is in flight.
    /// Only the progress thread writes it.
    blocked: AtomicBool,
    submitted: AtomicU64,
}

impl SubmissionQueue {
    fn new(context: ExecutionContext, capacity: usize) -> Self {
        Self {
            context,
            queue: ArrayQueue::new(capacity),
            blocked: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
        }
    }

    pub fn get_context(&self) -> ExecutionContext {
        self.context
    }

    /// Number of states waiting for admission
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    /// Total number of states ever pushed
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Hands the state back when the queue is full
    pub(crate) fn push(
        &self,
        state: Box<dyn OperationState>,
    ) -> Result<(), Box<dyn OperationState>> {
        self.queue.push(state)?;
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn pop(&self) -> Option<Box<dyn OperationState>> {
        self.queue.pop()
    }

    pub(crate) fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }
}

/// Fixed-capacity registry of submission queues, indexed by registration order.
///
/// Slots are filled at most once. `count` is published with release ordering
/// after a slot is filled, so a reader that loads `count` with acquire
/// ordering sees every slot below it.
pub(crate) struct QueueTable {
    slots: Box<[OnceLock<SubmissionQueue>]>,
    count: AtomicUsize,
    register: Mutex<()>,
    queue_capacity: usize,
}

impl QueueTable {
    /// The default context is registered up front at index 0.
    pub(crate) fn new(max_contexts: usize, queue_capacity: usize) -> Self {
        let slots: Box<[OnceLock<SubmissionQueue>]> =
            (0..max_contexts).map(|_| OnceLock::new()).collect();
        let table = Self {
            slots,
            count: AtomicUsize::new(0),
            register: Mutex::new(()),
            queue_capacity,
        };
        if let Some(slot) = table.slots.first() {
            let _ = slot.set(SubmissionQueue::new(
                ExecutionContext::DEFAULT,
                queue_capacity,
            ));
            table.count.store(1, Ordering::Release);
        }
        table
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn max_contexts(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&SubmissionQueue> {
        if index >= self.len() {
            return None;
        }
        self.slots[index].get()
    }

    fn find(&self, context: ExecutionContext, upto: usize) -> Option<&SubmissionQueue> {
        self.slots[..upto]
            .iter()
            .filter_map(|slot| slot.get())
            .find(|queue| queue.context == context)
    }

    /// The queue for `context`, registering a new one if needed.
    pub(crate) fn resolve(
        &self,
        context: ExecutionContext,
    ) -> Result<&SubmissionQueue, FatalError> {
        if let Some(queue) = self.find(context, self.len()) {
            return Ok(queue);
        }

        // Registration is rare; serialize it and re-check under the lock.
        let _guard = self
            .register
            .lock()
            .map_err(|_| FatalError::Internal("queue registration lock poisoned".into()))?;
        let count = self.count.load(Ordering::Acquire);
        if let Some(queue) = self.find(context, count) {
            return Ok(queue);
        }
        if count >= self.slots.len() {
            return Err(FatalError::TooManyContexts {
                max: self.slots.len(),
            });
        }
        let _ = self.slots[count].set(SubmissionQueue::new(context, self.queue_capacity));
        self.count.store(count + 1, Ordering::Release);
        crate::nbc_debug!("Registered submission queue {} for {}", count, context);
        self.slots[count]
            .get()
            .ok_or_else(|| FatalError::Internal("submission queue slot left empty".into()))
    }

    /// One line per registered queue
    pub(crate) fn describe(&self, out: &mut String) {
        let count = self.len();
        let _ = writeln!(out, "Submission queues ({} of {}):", count, self.slots.len());
        for (index, slot) in self.slots[..count].iter().enumerate() {
            if let Some(queue) = slot.get() {
                let _ = writeln!(
                    out,
                    "  {}: {} queued={} submitted={} blocked={}",
                    index,
                    queue.context,
                    queue.len(),
                    queue.submitted(),
                    queue.is_blocked()
                );
            }
        }
    }
}
