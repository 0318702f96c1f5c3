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

//! Gather, broadcast and allreduce, on device and host buffers, plus the
//! in-process backend primitives they are built on.

mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use nbcoll::data_types::Type;
use nbcoll::error::Code;
use nbcoll::gpu::{DeviceBuffer, HostBuffer, Stream};
use nbcoll::net::comm_operations::reduce_into;
use nbcoll::net::{Communicator, LocalGroup, ReduceOp};
use nbcoll::ops::{self, allreduce, bcast, gather};

// ============================================================================
// Device Gather
// ============================================================================

#[test]
fn test_gather_to_root() {
    init_test_logging();
    let results = run_ranks(4, |comm, ctx| {
        let rank = comm.get_rank();
        let stream = Stream::new().unwrap();
        let send = DeviceBuffer::from_slice(&[rank * 100, rank * 100 + 1]);
        let recv = DeviceBuffer::<i32>::zeroed(if rank == 3 { 8 } else { 0 });
        gather(&ctx, &send, &recv, 2, 3, &stream).unwrap();
        stream.synchronize().unwrap();
        recv.to_vec().unwrap()
    });

    assert_eq!(results[3], vec![0, 1, 100, 101, 200, 201, 300, 301]);
    assert!(results[0].is_empty());
    println!("✓ Root gathers every contribution in rank order");
}

#[test]
fn test_gather_in_place() {
    let results = run_ranks(3, |comm, ctx| {
        let rank = comm.get_rank();
        let stream = Stream::new().unwrap();
        if rank == 0 {
            // The root's own share already sits in its slot.
            let buffer = DeviceBuffer::from_slice(&[5u64, 6, 0, 0, 0, 0]);
            gather(&ctx, &buffer, &buffer, 2, 0, &stream).unwrap();
            stream.synchronize().unwrap();
            buffer.to_vec().unwrap()
        } else {
            let value = rank as u64 * 10;
            let send = DeviceBuffer::from_slice(&[value, value + 1]);
            let recv = DeviceBuffer::<u64>::zeroed(0);
            gather(&ctx, &send, &recv, 2, 0, &stream).unwrap();
            stream.synchronize().unwrap();
            Vec::new()
        }
    });

    assert_eq!(results[0], vec![5, 6, 10, 11, 20, 21]);
    println!("✓ In-place gather keeps the root's share");
}

// ============================================================================
// Device Broadcast
// ============================================================================

#[test]
fn test_bcast_from_root() {
    let results = run_ranks(4, |comm, ctx| {
        let stream = Stream::new().unwrap();
        let buffer = if comm.get_rank() == 1 {
            DeviceBuffer::from_slice(&[2.5f64, -1.0, 8.0])
        } else {
            DeviceBuffer::<f64>::zeroed(3)
        };
        bcast(&ctx, &buffer, 3, 1, &stream).unwrap();
        stream.synchronize().unwrap();
        buffer.to_vec().unwrap()
    });

    for got in results {
        assert_eq!(got, vec![2.5, -1.0, 8.0]);
    }
    println!("✓ Broadcast reaches every rank");
}

#[test]
fn test_bcast_prefix_only() {
    let results = run_ranks(2, |comm, ctx| {
        let stream = Stream::new().unwrap();
        let buffer = if comm.get_rank() == 0 {
            DeviceBuffer::from_slice(&[1u8, 2, 3, 4])
        } else {
            DeviceBuffer::from_slice(&[9u8, 9, 9, 9])
        };
        bcast(&ctx, &buffer, 2, 0, &stream).unwrap();
        stream.synchronize().unwrap();
        buffer.to_vec().unwrap()
    });

    assert_eq!(results[1], vec![1, 2, 9, 9]);
    println!("✓ Broadcast touches only the first count elements");
}

// ============================================================================
// Device Allreduce
// ============================================================================

#[test]
fn test_allreduce_sum_f32() {
    let results = run_ranks(4, |comm, ctx| {
        let rank = comm.get_rank() as f32;
        let stream = Stream::new().unwrap();
        let send = DeviceBuffer::from_slice(&[rank, rank * 2.0, 1.0]);
        let recv = DeviceBuffer::<f32>::zeroed(3);
        allreduce(&ctx, &send, &recv, 3, ReduceOp::Sum, &stream).unwrap();
        stream.synchronize().unwrap();
        recv.to_vec().unwrap()
    });

    for got in results {
        assert_eq!(got, vec![6.0, 12.0, 4.0]);
    }
    println!("✓ Allreduce sums across ranks");
}

#[test]
fn test_allreduce_max_in_place() {
    let results = run_ranks(3, |comm, ctx| {
        let rank = comm.get_rank();
        let stream = Stream::new().unwrap();
        let buffer = DeviceBuffer::from_slice(&[rank, -rank, 7]);
        allreduce(&ctx, &buffer, &buffer, 3, ReduceOp::Max, &stream).unwrap();
        stream.synchronize().unwrap();
        buffer.to_vec().unwrap()
    });

    for got in results {
        assert_eq!(got, vec![2, 0, 7]);
    }
    println!("✓ In-place allreduce overwrites the input");
}

#[test]
fn test_allreduce_rejects_bitwise_on_floats() {
    let comm = LocalGroup::create(1).unwrap().remove(0);
    let pool = Arc::new(nbcoll::gpu::PinnedMemoryPool::new());
    let stream = Stream::new().unwrap();
    let buffer = DeviceBuffer::<f64>::zeroed(2);

    let err = ops::HostStagedAllreduce::new(comm, &pool, &buffer, &buffer, 2, ReduceOp::Bor, &stream)
        .err()
        .unwrap();
    assert_eq!(err.code(), Code::TypeError);
    assert_eq!(pool.allocations(), 0);
    println!("✓ Bitwise reduction of floats is a type error");
}

#[test]
fn test_zero_count_device_collectives_do_nothing() {
    let comm = LocalGroup::create(1).unwrap().remove(0);
    let dyn_comm: Arc<dyn Communicator> = comm.clone();
    let ctx = nbcoll::NbcContext::init(dyn_comm, test_config()).unwrap();
    let stream = Stream::new().unwrap();
    let send = DeviceBuffer::<i32>::zeroed(0);
    let recv = DeviceBuffer::<i32>::zeroed(0);

    gather(&ctx, &send, &recv, 0, 0, &stream).unwrap();
    bcast(&ctx, &recv, 0, 0, &stream).unwrap();
    allreduce(&ctx, &send, &recv, 0, ReduceOp::Sum, &stream).unwrap();
    stream.synchronize().unwrap();

    assert_eq!(comm.calls(), 0);
    assert_eq!(ctx.get_memory_pool().allocations(), 0);
    assert_eq!(ctx.get_engine().stats().admitted, 0);

    ctx.finalize().unwrap();
    println!("✓ Zero-count gather, broadcast and allreduce create no work");
}

// ============================================================================
// Host Collectives
// ============================================================================

#[test]
fn test_host_iallreduce_completes_handle() {
    let results = run_ranks(3, |comm, ctx| {
        let rank = comm.get_rank() as i64;
        let buffer = HostBuffer::from_elements(&[rank + 1, 10]);
        let mut handle = ops::iallreduce::<i64>(&ctx, &buffer, 2, ReduceOp::Prod).unwrap();
        assert!(!handle.is_null());
        ctx.get_engine().wait_for_completion(&mut handle).unwrap();
        assert!(handle.is_null());
        buffer.to_vec::<i64>().unwrap()
    });

    for got in results {
        assert_eq!(got, vec![6, 1000]);
    }
    println!("✓ Host allreduce signals its completion handle");
}

#[test]
fn test_host_ibcast() {
    let results = run_ranks(3, |comm, ctx| {
        let buffer = if comm.get_rank() == 2 {
            HostBuffer::from_elements(&[42u16, 43])
        } else {
            HostBuffer::new(4)
        };
        let mut handle = ops::ibcast::<u16>(&ctx, &buffer, 2, 2).unwrap();
        ctx.get_engine().wait_for_completion(&mut handle).unwrap();
        buffer.to_vec::<u16>().unwrap()
    });

    for got in results {
        assert_eq!(got, vec![42, 43]);
    }
    println!("✓ Host broadcast delivers to every rank");
}

#[test]
fn test_host_zero_count_returns_null_handle() {
    let comm = LocalGroup::create(1).unwrap().remove(0);
    let dyn_comm: Arc<dyn Communicator> = comm.clone();
    let ctx = nbcoll::NbcContext::init(dyn_comm, test_config()).unwrap();
    let buffer = HostBuffer::new(0);

    let mut handle = ops::iallreduce::<f32>(&ctx, &buffer, 0, ReduceOp::Sum).unwrap();
    assert!(handle.is_null());
    assert!(ctx.get_engine().is_complete(&mut handle));
    let handle = ops::ibcast::<f32>(&ctx, &buffer, 0, 0).unwrap();
    assert!(handle.is_null());

    assert_eq!(comm.calls(), 0);
    assert_eq!(ctx.get_memory_pool().allocations(), 0);
    assert_eq!(ctx.get_engine().stats().admitted, 0);
    ctx.finalize().unwrap();
    println!("✓ Zero-count host collectives complete immediately");
}

// ============================================================================
// Backend Primitives
// ============================================================================

#[test]
fn test_backend_reduce_to_root() {
    let comms = LocalGroup::create(3).unwrap();
    let workers: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let rank = comm.get_rank();
                let send = HostBuffer::from_elements(&[rank, rank + 3]);
                let recv = HostBuffer::new(8);
                let mut request = comm
                    .ireduce(Some(&send), &recv, 2, Type::Int32, ReduceOp::Sum, 0)
                    .unwrap();
                request.wait().unwrap();
                recv.to_vec::<i32>().unwrap()
            })
        })
        .collect();
    let results: Vec<Vec<i32>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(results[0], vec![3, 12]);
    assert_eq!(results[1], vec![0, 0]);
    println!("✓ Reduce delivers only to the root");
}

#[test]
fn test_backend_reduce_scatter() {
    let comms = LocalGroup::create(2).unwrap();
    let workers: Vec<_> = comms
        .into_iter()
        .map(|comm| {
            thread::spawn(move || {
                let rank = comm.get_rank() as u32;
                let send = HostBuffer::from_elements(&[rank, 1, 2, rank * 4]);
                let recv = HostBuffer::new(8);
                let mut request = comm
                    .ireduce_scatter(Some(&send), &recv, 2, Type::UInt32, ReduceOp::Sum)
                    .unwrap();
                request.wait().unwrap();
                recv.to_vec::<u32>().unwrap()
            })
        })
        .collect();
    let results: Vec<Vec<u32>> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert_eq!(results[0], vec![1, 2]);
    assert_eq!(results[1], vec![4, 4]);
    println!("✓ Reduce-scatter leaves each rank its block");
}

#[test]
fn test_backend_detects_mismatched_collectives() {
    let comms = LocalGroup::create(2).unwrap();
    let buffer = HostBuffer::new(16);

    comms[0].ibcast(&buffer, 4, Type::Int32, 0).unwrap();
    let err = comms[1].ibcast(&buffer, 2, Type::Int32, 0).err().unwrap();
    assert!(err.to_string().contains("collective #0"), "{}", err);
    println!("✓ Ranks disagreeing on a collective is reported");
}

#[test]
fn test_backend_test_does_not_wait_on_busy_send_buffer() {
    let comms = LocalGroup::create(1).unwrap();
    let send = HostBuffer::from_elements(&[3i32, 4]);
    let recv = HostBuffer::new(8);
    let mut request = comms[0]
        .iallreduce(Some(&send), &recv, 2, Type::Int32, ReduceOp::Sum)
        .unwrap();

    {
        let _held = send.lock().unwrap();
        for _ in 0..10 {
            assert!(!request.test().unwrap());
        }
    }
    request.wait().unwrap();
    assert_eq!(recv.to_vec::<i32>().unwrap(), vec![3, 4]);
    println!("✓ Testing a request skips a busy send buffer instead of waiting");
}

#[test]
fn test_backend_rejects_zero_count() {
    let comms = LocalGroup::create(1).unwrap();
    let buffer = HostBuffer::new(4);
    assert!(comms[0].ibcast(&buffer, 0, Type::Int32, 0).is_err());
    assert_eq!(comms[0].calls(), 0);
    println!("✓ Backend refuses empty collectives");
}

// ============================================================================
// Reduction Kernels
// ============================================================================

#[test]
fn test_reduce_kernels() {
    let mut acc = bytemuck::cast_slice::<i32, u8>(&[1, 5, -2]).to_vec();
    let src = bytemuck::cast_slice::<i32, u8>(&[3, 2, -7]).to_vec();
    reduce_into(Type::Int32, ReduceOp::Max, &mut acc, &src).unwrap();
    assert_eq!(bytemuck::pod_collect_to_vec::<u8, i32>(&acc), vec![3, 5, -2]);

    let mut acc = vec![0b1100u8, 0b1010];
    reduce_into(Type::UInt8, ReduceOp::Band, &mut acc, &[0b1010, 0b0110]).unwrap();
    assert_eq!(acc, vec![0b1000, 0b0010]);

    let mut acc = bytemuck::cast_slice::<f64, u8>(&[1.5, 2.0]).to_vec();
    let src = bytemuck::cast_slice::<f64, u8>(&[2.0, 0.5]).to_vec();
    reduce_into(Type::Double, ReduceOp::Min, &mut acc, &src).unwrap();
    assert_eq!(bytemuck::pod_collect_to_vec::<u8, f64>(&acc), vec![1.5, 0.5]);

    let mut acc = vec![0u8; 4];
    let err = reduce_into(Type::Float, ReduceOp::Band, &mut acc, &[0u8; 4]).unwrap_err();
    assert_eq!(err.code(), Code::TypeError);
    println!("✓ Reduction kernels combine elementwise");
}
