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

//! Host-staged scatter over an in-process group

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use nbcoll::gpu::{DeviceBuffer, PinnedMemoryPool, Stream};
use nbcoll::net::{Communicator, LocalGroup};
use nbcoll::ops::{scatter, HostStagedScatter};
use nbcoll::progress::{OperationState, PeAction, ProgressEngine};

const WORLD: usize = 4;
const COUNT: usize = 3;

fn root_data(world: usize, count: usize) -> Vec<i64> {
    (0..(world * count) as i64).map(|v| v * 10 + 1).collect()
}

// ============================================================================
// Scatter Results
// ============================================================================

#[test]
fn test_scatter_from_rank_zero() {
    init_test_logging();
    let results = run_ranks(WORLD, |comm, ctx| {
        let rank = comm.get_rank();
        let stream = Stream::new().unwrap();
        let send = if rank == 0 {
            DeviceBuffer::from_slice(&root_data(WORLD, COUNT))
        } else {
            DeviceBuffer::<i64>::zeroed(0)
        };
        let recv = DeviceBuffer::<i64>::zeroed(COUNT);

        scatter(&ctx, &send, &recv, COUNT, 0, &stream).unwrap();
        stream.synchronize().unwrap();
        recv.to_vec().unwrap()
    });

    let expected = root_data(WORLD, COUNT);
    for (rank, got) in results.iter().enumerate() {
        assert_eq!(got[..], expected[rank * COUNT..(rank + 1) * COUNT], "rank {}", rank);
    }
    println!("✓ Every rank, including the root, receives its block");
}

#[test]
fn test_scatter_from_nonzero_root() {
    let root = 2;
    let results = run_ranks(WORLD, move |comm, ctx| {
        let stream = Stream::new().unwrap();
        let send = if comm.get_rank() == root {
            DeviceBuffer::from_slice(&root_data(WORLD, COUNT))
        } else {
            DeviceBuffer::<i64>::zeroed(0)
        };
        let recv = DeviceBuffer::<i64>::zeroed(COUNT);
        scatter(&ctx, &send, &recv, COUNT, root, &stream).unwrap();
        stream.synchronize().unwrap();
        recv.to_vec().unwrap()
    });

    let expected = root_data(WORLD, COUNT);
    for (rank, got) in results.iter().enumerate() {
        assert_eq!(got[..], expected[rank * COUNT..(rank + 1) * COUNT]);
    }
    println!("✓ Scatter honours a non-zero root");
}

#[test]
fn test_scatter_in_place_on_root() {
    let results = run_ranks(WORLD, |comm, ctx| {
        let rank = comm.get_rank();
        let stream = Stream::new().unwrap();
        if rank == 1 {
            let buffer = DeviceBuffer::from_slice(&root_data(WORLD, COUNT));
            scatter(&ctx, &buffer, &buffer, COUNT, 1, &stream).unwrap();
            stream.synchronize().unwrap();
            buffer.to_vec().unwrap()
        } else {
            let send = DeviceBuffer::<i64>::zeroed(0);
            let recv = DeviceBuffer::<i64>::zeroed(COUNT);
            scatter(&ctx, &send, &recv, COUNT, 1, &stream).unwrap();
            stream.synchronize().unwrap();
            recv.to_vec().unwrap()
        }
    });

    let expected = root_data(WORLD, COUNT);
    // The root's buffer is left exactly as it was.
    assert_eq!(results[1], expected);
    for rank in [0, 2, 3] {
        assert_eq!(results[rank][..], expected[rank * COUNT..(rank + 1) * COUNT]);
    }
    println!("✓ In-place scatter leaves the root buffer untouched");
}

#[test]
fn test_back_to_back_scatters_on_one_stream() {
    let results = run_ranks(2, |comm, ctx| {
        let rank = comm.get_rank();
        let stream = Stream::new().unwrap();
        let first = DeviceBuffer::from_slice(&[1.0f32, 2.0, 3.0, 4.0]);
        let second = DeviceBuffer::from_slice(&[5.0f32, 6.0, 7.0, 8.0]);
        let out_a = DeviceBuffer::<f32>::zeroed(2);
        let out_b = DeviceBuffer::<f32>::zeroed(2);
        let (send_a, send_b) = if rank == 0 {
            (first, second)
        } else {
            (DeviceBuffer::zeroed(0), DeviceBuffer::zeroed(0))
        };

        scatter(&ctx, &send_a, &out_a, 2, 0, &stream).unwrap();
        scatter(&ctx, &send_b, &out_b, 2, 0, &stream).unwrap();
        stream.synchronize().unwrap();
        (out_a.to_vec().unwrap(), out_b.to_vec().unwrap())
    });

    assert_eq!(results[0], (vec![1.0, 2.0], vec![5.0, 6.0]));
    assert_eq!(results[1], (vec![3.0, 4.0], vec![7.0, 8.0]));
    println!("✓ Consecutive scatters on one stream stay ordered");
}

// ============================================================================
// Edge Cases
// ============================================================================

#[test]
fn test_zero_count_scatter_does_nothing() {
    let comm = LocalGroup::create(1).unwrap().remove(0);
    let dyn_comm: Arc<dyn Communicator> = comm.clone();
    let ctx = nbcoll::NbcContext::init(dyn_comm, test_config()).unwrap();
    let stream = Stream::new().unwrap();
    let send = DeviceBuffer::<i32>::zeroed(0);
    let recv = DeviceBuffer::<i32>::zeroed(0);

    scatter(&ctx, &send, &recv, 0, 0, &stream).unwrap();
    stream.synchronize().unwrap();

    assert_eq!(comm.calls(), 0);
    assert_eq!(ctx.get_memory_pool().allocations(), 0);
    assert_eq!(ctx.get_engine().stats().admitted, 0);

    ctx.finalize().unwrap();
    println!("✓ Zero-count scatter creates no work");
}

#[test]
fn test_scatter_rejects_bad_arguments() {
    let comm = LocalGroup::create(2).unwrap().remove(0);
    let pool = Arc::new(PinnedMemoryPool::new());
    let stream = Stream::new().unwrap();
    let send = DeviceBuffer::<i32>::zeroed(4);
    let recv = DeviceBuffer::<i32>::zeroed(2);

    let bad_root = HostStagedScatter::new(comm.clone(), &pool, &send, &recv, 2, 5, &stream);
    assert!(bad_root.is_err());

    let short_send = HostStagedScatter::new(comm.clone(), &pool, &send, &recv, 3, 0, &stream);
    assert!(short_send.is_err());

    let zero = HostStagedScatter::new(comm, &pool, &send, &recv, 0, 0, &stream);
    assert!(zero.is_err());

    println!("✓ Invalid scatter arguments are rejected");
}

#[test]
fn test_construction_issues_stream_work() {
    let comm = LocalGroup::create(1).unwrap().remove(0);
    let pool = Arc::new(PinnedMemoryPool::new());
    let stream = Stream::new().unwrap();

    // Keep earlier work on the stream running until released.
    let gate = Arc::new(AtomicBool::new(false));
    let held = Arc::clone(&gate);
    stream
        .launch(move || {
            while !held.load(Ordering::Acquire) {
                std::thread::yield_now();
            }
        })
        .unwrap();

    let send = DeviceBuffer::from_slice(&[7u32, 8, 9]);
    let recv = DeviceBuffer::<u32>::zeroed(3);
    let mut state =
        HostStagedScatter::new(comm.clone(), &pool, &send, &recv, 3, 0, &stream).unwrap();

    assert_eq!(state.step().unwrap(), PeAction::Continue);
    assert!(!state.staging_ready());
    assert_eq!(comm.calls(), 0);

    gate.store(true, Ordering::Release);
    assert!(wait_until(Duration::from_secs(10), || state.staging_ready()));
    assert_eq!(state.step().unwrap(), PeAction::Advance);

    let engine = ProgressEngine::new(test_config()).unwrap();
    engine.start().unwrap();
    engine.enqueue(Box::new(state)).unwrap();
    stream.synchronize().unwrap();
    assert!(wait_until(Duration::from_secs(10), || engine.stats().completed == 1));
    engine.stop().unwrap();

    assert_eq!(recv.to_vec().unwrap(), vec![7, 8, 9]);
    assert_eq!(comm.calls(), 1);
    assert_eq!(pool.outstanding(), 0);
    println!("✓ Stream copies are issued when the state is constructed");
}
