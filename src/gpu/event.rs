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

//! Stream completion events and the host-released stream gate

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::error::NbcResult;
use crate::gpu::stream::Stream;

/// Marks a point in a stream; [`query`](Event::query) reports whether the
/// stream has reached it.
///
/// A fresh event that was never recorded reports complete.
#[derive(Clone, Debug)]
pub struct Event {
    reached: Arc<AtomicBool>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            reached: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Capture the current end of `stream`.
    pub fn record(&self, stream: &Stream) -> NbcResult<()> {
        self.reached.store(false, Ordering::Release);
        let reached = Arc::clone(&self.reached);
        stream.launch(move || reached.store(true, Ordering::Release))
    }

    /// Non-blocking check
    pub fn query(&self) -> bool {
        self.reached.load(Ordering::Acquire)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds a stream at a point until the host releases it.
///
/// [`wait`](GpuWait::wait) queues a gate on the stream; everything queued
/// after it runs only once [`signal`](GpuWait::signal) is called. If the
/// `GpuWait` is dropped without signalling, the gate opens so the stream is
/// not wedged forever.
#[derive(Debug)]
pub struct GpuWait {
    released: Arc<AtomicBool>,
}

impl GpuWait {
    pub fn new() -> Self {
        Self {
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn wait(&self, stream: &Stream) -> NbcResult<()> {
        let released = Arc::clone(&self.released);
        let stream_id = stream.id();
        stream.launch(move || {
            while !released.load(Ordering::Acquire) {
                if Arc::strong_count(&released) == 1 {
                    crate::nbc_warn!("Stream {} gate dropped without being signalled", stream_id);
                    break;
                }
                thread::yield_now();
            }
        })
    }

    pub fn signal(&self) {
        self.released.store(true, Ordering::Release);
    }

    pub fn is_signalled(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Default for GpuWait {
    fn default() -> Self {
        Self::new()
    }
}
