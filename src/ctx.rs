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

//! Library context
//!
//! Bundles the communicator, the progress engine and the pinned staging pool
//! that every collective entry point needs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{NbcError, NbcResult};
use crate::gpu::PinnedMemoryPool;
use crate::net::{CommType, Communicator};
use crate::progress::{GroupPlacement, ProgressEngine};

/// The entry point to nbcoll operations
pub struct NbcContext {
    communicator: Arc<dyn Communicator>,
    engine: ProgressEngine,
    memory_pool: Arc<PinnedMemoryPool>,
    finalized: AtomicBool,
}

impl NbcContext {
    /// Create a context over `communicator` and start its progress engine.
    ///
    /// The progress thread is placed according to the communicator's
    /// node-local rank and size.
    pub fn init(communicator: Arc<dyn Communicator>, config: EngineConfig) -> NbcResult<Arc<Self>> {
        let local_rank = usize::try_from(communicator.get_local_rank())
            .map_err(|_| NbcError::Invalid("negative local rank".into()))?;
        let local_size = usize::try_from(communicator.get_local_size())
            .map_err(|_| NbcError::Invalid("negative local size".into()))?;

        let engine = ProgressEngine::new(config)?;
        engine.start_with_placement(GroupPlacement::new(local_rank, local_size))?;
        crate::nbc_debug!(
            "Initialized context for rank {} of {}",
            communicator.get_rank(),
            communicator.get_world_size()
        );
        Ok(Arc::new(Self {
            communicator,
            engine,
            memory_pool: Arc::new(PinnedMemoryPool::new()),
            finalized: AtomicBool::new(false),
        }))
    }

    /// Stop the progress engine. Later calls do nothing.
    pub fn finalize(&self) -> NbcResult<()> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.engine.stop()
    }

    pub fn is_initialized(&self) -> bool {
        !self.finalized.load(Ordering::Acquire)
    }

    pub fn get_rank(&self) -> i32 {
        self.communicator.get_rank()
    }

    pub fn get_world_size(&self) -> i32 {
        self.communicator.get_world_size()
    }

    pub fn get_comm_type(&self) -> CommType {
        self.communicator.get_comm_type()
    }

    pub fn get_communicator(&self) -> Arc<dyn Communicator> {
        Arc::clone(&self.communicator)
    }

    pub fn get_engine(&self) -> &ProgressEngine {
        &self.engine
    }

    pub fn get_memory_pool(&self) -> Arc<PinnedMemoryPool> {
        Arc::clone(&self.memory_pool)
    }

    /// Blocking barrier across the group
    pub fn barrier(&self) -> NbcResult<()> {
        self.communicator.barrier()
    }
}

impl Drop for NbcContext {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            crate::nbc_warn!("Finalizing context on drop: {}", e);
        }
    }
}
