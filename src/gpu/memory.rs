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

//! Device buffers, host staging buffers and the pinned memory pool

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::data_types::Element;
use crate::error::{NbcError, NbcResult};

/// Typed device memory.
///
/// Clones alias the same allocation; use
/// [`same_allocation`](DeviceBuffer::same_allocation) to detect in-place
/// calls.
pub struct DeviceBuffer<T: Element> {
    bytes: Arc<Mutex<Vec<u8>>>,
    len: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> DeviceBuffer<T> {
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len * std::mem::size_of::<T>()])),
            len,
            _marker: PhantomData,
        }
    }

    pub fn from_slice(data: &[T]) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytemuck::cast_slice::<T, u8>(data).to_vec())),
            len: data.len(),
            _marker: PhantomData,
        }
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }

    /// Copy the contents back to the host. Not ordered with any stream;
    /// synchronize first.
    pub fn to_vec(&self) -> NbcResult<Vec<T>> {
        let bytes = self
            .bytes
            .lock()
            .map_err(|_| NbcError::poisoned("device buffer"))?;
        Ok(bytemuck::pod_collect_to_vec::<u8, T>(&bytes))
    }

    pub fn same_allocation(&self, other: &DeviceBuffer<T>) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    pub(crate) fn storage(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.bytes)
    }
}

impl<T: Element> Clone for DeviceBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

impl<T: Element> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("type", &T::TYPE)
            .field("len", &self.len)
            .finish()
    }
}

/// Untyped host memory used for staging and by the network backend.
#[derive(Clone)]
pub struct HostBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    len_bytes: usize,
}

impl HostBuffer {
    pub fn new(len_bytes: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len_bytes])),
            len_bytes,
        }
    }

    pub fn from_elements<T: Element>(data: &[T]) -> Self {
        let bytes = bytemuck::cast_slice::<T, u8>(data).to_vec();
        let len_bytes = bytes.len();
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
            len_bytes,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    pub fn to_vec<T: Element>(&self) -> NbcResult<Vec<T>> {
        let bytes = self.lock()?;
        let whole = bytes.len() - bytes.len() % std::mem::size_of::<T>();
        Ok(bytemuck::pod_collect_to_vec::<u8, T>(&bytes[..whole]))
    }

    /// Overwrite the start of the buffer with `data`
    pub fn write_elements<T: Element>(&self, data: &[T]) -> NbcResult<()> {
        let src = bytemuck::cast_slice::<T, u8>(data);
        if src.len() > self.len_bytes {
            return Err(NbcError::IndexError(format!(
                "{} bytes do not fit in a {} byte host buffer",
                src.len(),
                self.len_bytes
            )));
        }
        self.lock()?[..src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn same_allocation(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }

    pub fn lock(&self) -> NbcResult<MutexGuard<'_, Vec<u8>>> {
        self.bytes.lock().map_err(|_| NbcError::poisoned("host buffer"))
    }

    /// Non-blocking lock. `Ok(None)` when another thread holds the buffer.
    pub fn try_lock(&self) -> NbcResult<Option<MutexGuard<'_, Vec<u8>>>> {
        match self.bytes.try_lock() {
            Ok(guard) => Ok(Some(guard)),
            Err(std::sync::TryLockError::WouldBlock) => Ok(None),
            Err(std::sync::TryLockError::Poisoned(_)) => Err(NbcError::poisoned("host buffer")),
        }
    }

    pub(crate) fn storage(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.bytes)
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("len_bytes", &self.len_bytes)
            .finish()
    }
}

/// Reuses page-locked staging buffers by exact byte size
#[derive(Debug, Default)]
pub struct PinnedMemoryPool {
    free: Mutex<HashMap<usize, Vec<HostBuffer>>>,
    allocations: AtomicUsize,
    reuses: AtomicUsize,
    outstanding: AtomicUsize,
}

impl PinnedMemoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A staging buffer of `len_bytes`, returned to the pool when dropped
    pub fn get(self: &Arc<Self>, len_bytes: usize) -> NbcResult<PinnedBuffer> {
        let reused = self
            .free
            .lock()
            .map_err(|_| NbcError::poisoned("pinned memory pool"))?
            .get_mut(&len_bytes)
            .and_then(Vec::pop);
        let buffer = match reused {
            Some(buffer) => {
                self.reuses.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                HostBuffer::new(len_bytes)
            }
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(PinnedBuffer {
            buffer,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, buffer: HostBuffer) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        match self.free.lock() {
            Ok(mut free) => free.entry(buffer.len_bytes()).or_default().push(buffer),
            Err(_) => crate::nbc_warn!("Pinned memory pool poisoned, dropping buffer"),
        }
    }

    /// Buffers created because none of the right size was free
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn reuses(&self) -> usize {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Buffers currently handed out
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

/// A staging buffer on loan from a [`PinnedMemoryPool`]
pub struct PinnedBuffer {
    buffer: HostBuffer,
    pool: Arc<PinnedMemoryPool>,
}

impl Deref for PinnedBuffer {
    type Target = HostBuffer;

    fn deref(&self) -> &HostBuffer {
        &self.buffer
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        self.pool.release(self.buffer.clone());
    }
}
