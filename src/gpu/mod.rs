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

//! Host-simulated accelerator
//!
//! Provides the device-side collaborators the staged collectives are written
//! against: in-order work [`Stream`]s, completion [`Event`]s, the
//! [`GpuWait`] stream gate and [`DeviceBuffer`]s. Each stream is a worker
//! thread executing its work items strictly in submission order, so device
//! work and host-side polling interleave the way they do on real hardware.
//!
//! # Example
//! ```ignore
//! use nbcoll::gpu::{DeviceBuffer, Event, HostBuffer, Stream};
//!
//! let stream = Stream::new()?;
//! let src = DeviceBuffer::from_slice(&[1.0f32, 2.0, 3.0]);
//! let host = HostBuffer::new(src.size_bytes());
//! stream.memcpy_d2h(&host, 0, &src, 0, 3)?;
//! let event = Event::new();
//! event.record(&stream)?;
//! while !event.query() {}
//! ```

mod event;
mod memory;
mod stream;

pub use event::{Event, GpuWait};
pub use memory::{DeviceBuffer, HostBuffer, PinnedBuffer, PinnedMemoryPool};
pub use stream::Stream;

/// Number of simulated devices
pub fn get_device_count() -> i32 {
    1
}
