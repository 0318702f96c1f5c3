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

//! Completion handles shared between callers and the progress thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A flag the progress thread sets exactly once when an operation finishes.
///
/// Clones share the same flag. The engine keeps one clone inside the
/// operation state and writes it with release ordering; callers read with
/// acquire ordering. A null handle (no flag) is always complete.
#[derive(Clone, Debug, Default)]
pub struct CompletionHandle {
    flag: Option<Arc<AtomicBool>>,
}

impl CompletionHandle {
    /// A fresh, pending handle
    pub fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    /// The null handle, which reports completion immediately
    pub fn null() -> Self {
        Self { flag: None }
    }

    pub fn is_null(&self) -> bool {
        self.flag.is_none()
    }

    /// Whether the operation finished. Does not clear the handle.
    pub fn is_done(&self) -> bool {
        match &self.flag {
            Some(flag) => flag.load(Ordering::Acquire),
            None => true,
        }
    }

    /// Drop this handle's reference to the flag, turning it into a null handle
    pub fn clear(&mut self) {
        self.flag = None;
    }

    /// Signal completion. Only the progress thread calls this.
    pub(crate) fn mark_complete(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::Release);
        }
    }
}
