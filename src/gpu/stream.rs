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

//! In-order device work queues

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};

use crate::data_types::Element;
use crate::error::{NbcError, NbcResult};
use crate::gpu::event::Event;
use crate::gpu::memory::{DeviceBuffer, HostBuffer};
use crate::progress::ExecutionContext;

/// Stream ids start at 1; 0 is the default execution context.
static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type WorkItem = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(WorkItem),
    Shutdown,
}

struct StreamInner {
    id: u64,
    sender: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    crate::nbc_error!("Stream {} worker panicked", self.id);
                }
            }
        }
    }
}

/// An ordered queue of device work.
///
/// Work items run one at a time, in submission order, on the stream's own
/// worker. Clones refer to the same stream; the worker drains outstanding
/// work and exits when the last clone is dropped.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

impl Stream {
    pub fn new() -> NbcResult<Self> {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded::<Command>();
        let worker = thread::Builder::new()
            .name(format!("nbc-stream-{}", id))
            .spawn(move || {
                while let Ok(Command::Run(work)) = receiver.recv() {
                    work();
                }
            })?;
        crate::nbc_debug!("Created stream {}", id);
        Ok(Self {
            inner: Arc::new(StreamInner {
                id,
                sender,
                worker: Mutex::new(Some(worker)),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The execution context operations on this stream are ordered in
    pub fn execution_context(&self) -> ExecutionContext {
        ExecutionContext::new(self.inner.id)
    }

    /// Queue an arbitrary work item behind everything already on the stream
    pub fn launch<F>(&self, work: F) -> NbcResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .sender
            .send(Command::Run(Box::new(work)))
            .map_err(|_| NbcError::Device(format!("stream {} is shut down", self.inner.id)))
    }

    /// Block the caller until all work queued so far has run
    pub fn synchronize(&self) -> NbcResult<()> {
        let event = Event::new();
        event.record(self)?;
        while !event.query() {
            thread::yield_now();
        }
        Ok(())
    }

    /// Copy `count` elements from `src[src_offset..]` into the host buffer at
    /// element offset `dst_offset`.
    pub fn memcpy_d2h<T: Element>(
        &self,
        dst: &HostBuffer,
        dst_offset: usize,
        src: &DeviceBuffer<T>,
        src_offset: usize,
        count: usize,
    ) -> NbcResult<()> {
        let width = std::mem::size_of::<T>();
        check_range("device source", src_offset + count, src.len())?;
        check_range(
            "host destination",
            (dst_offset + count) * width,
            dst.len_bytes(),
        )?;
        let (src, dst) = (src.storage(), dst.storage());
        let (from, to) = (src_offset * width, dst_offset * width);
        let len = count * width;
        self.launch(move || {
            copy_between(&src, from, &dst, to, len);
        })
    }

    /// Copy `count` elements from the host buffer at element offset
    /// `src_offset` into `dst[dst_offset..]`.
    pub fn memcpy_h2d<T: Element>(
        &self,
        dst: &DeviceBuffer<T>,
        dst_offset: usize,
        src: &HostBuffer,
        src_offset: usize,
        count: usize,
    ) -> NbcResult<()> {
        let width = std::mem::size_of::<T>();
        check_range("device destination", dst_offset + count, dst.len())?;
        check_range(
            "host source",
            (src_offset + count) * width,
            src.len_bytes(),
        )?;
        let (src, dst) = (src.storage(), dst.storage());
        let (from, to) = (src_offset * width, dst_offset * width);
        let len = count * width;
        self.launch(move || {
            copy_between(&src, from, &dst, to, len);
        })
    }

    pub fn memcpy_d2d<T: Element>(
        &self,
        dst: &DeviceBuffer<T>,
        dst_offset: usize,
        src: &DeviceBuffer<T>,
        src_offset: usize,
        count: usize,
    ) -> NbcResult<()> {
        let width = std::mem::size_of::<T>();
        check_range("device source", src_offset + count, src.len())?;
        check_range("device destination", dst_offset + count, dst.len())?;
        let (src, dst) = (src.storage(), dst.storage());
        let (from, to) = (src_offset * width, dst_offset * width);
        let len = count * width;
        self.launch(move || {
            copy_between(&src, from, &dst, to, len);
        })
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.inner.id).finish()
    }
}

fn check_range(what: &str, end: usize, len: usize) -> NbcResult<()> {
    if end > len {
        return Err(NbcError::IndexError(format!(
            "{} range ends at {} but the buffer holds {}",
            what, end, len
        )));
    }
    Ok(())
}

fn copy_between(
    src: &Arc<Mutex<Vec<u8>>>,
    from: usize,
    dst: &Arc<Mutex<Vec<u8>>>,
    to: usize,
    len: usize,
) {
    // Never hold two buffer locks at once; another stream may copy the
    // other way.
    let staged = match src.lock() {
        Ok(bytes) => bytes[from..from + len].to_vec(),
        Err(_) => {
            crate::nbc_error!("Buffer lock poisoned during copy");
            return;
        }
    };
    match dst.lock() {
        Ok(mut bytes) => bytes[to..to + len].copy_from_slice(&staged),
        Err(_) => crate::nbc_error!("Buffer lock poisoned during copy"),
    }
}
