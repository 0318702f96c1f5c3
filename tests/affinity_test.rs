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

//! Progress thread placement

mod common;

use common::*;
use nbcoll::progress::affinity::{choose_core, parse_cpulist, Core, NumaNode, Topology};
use nbcoll::progress::{GroupPlacement, ProgressEngine};

// ============================================================================
// Core Selection
// ============================================================================

#[test]
fn test_parse_cpulist() {
    assert_eq!(parse_cpulist("0-3,8,10-11\n").unwrap(), vec![0, 1, 2, 3, 8, 10, 11]);
    assert_eq!(parse_cpulist("5").unwrap(), vec![5]);
    assert_eq!(parse_cpulist("").unwrap(), Vec::<usize>::new());
    assert_eq!(parse_cpulist("3,1-2,2").unwrap(), vec![1, 2, 3]);
    assert!(parse_cpulist("4-2").is_err());
    assert!(parse_cpulist("a-b").is_err());
    println!("✓ cpulist ranges and singletons parse");
}

#[test]
fn test_choose_core_splits_node_into_chunks() {
    // Eight cores per node, two nodes, four members on this host.
    let expected = [3, 7, 3, 7];
    for (local_rank, want) in expected.iter().enumerate() {
        let placement = GroupPlacement::new(local_rank, 4);
        assert_eq!(choose_core(8, 2, placement, None, None).unwrap(), *want);
    }

    // A single member takes the last core.
    assert_eq!(choose_core(8, 1, GroupPlacement::default(), None, None).unwrap(), 7);
    println!("✓ Members take the last core of their chunk");
}

#[test]
fn test_choose_core_overrides() {
    let placement = GroupPlacement::new(1, 4);
    assert_eq!(choose_core(8, 2, placement, None, Some(0)).unwrap(), 0);
    assert!(choose_core(8, 2, placement, None, Some(8)).is_err());

    // Four members sharing one node: chunks of two.
    assert_eq!(choose_core(8, 2, placement, Some(4), None).unwrap(), 3);
    assert!(choose_core(8, 2, placement, Some(0), None).is_err());
    println!("✓ Core and ranks-per-node overrides apply");
}

#[test]
fn test_choose_core_needs_enough_cores() {
    let placement = GroupPlacement::new(0, 8);
    assert!(choose_core(4, 1, placement, None, None).is_err());
    assert!(choose_core(0, 1, GroupPlacement::default(), None, None).is_err());
    println!("✓ Too few cores is reported");
}

#[test]
fn test_topology_from_nodes() {
    let topology = Topology::from_nodes(vec![
        NumaNode {
            os_index: 1,
            cores: vec![Core { cpus: vec![2, 3] }, Core { cpus: vec![4, 5] }],
        },
        NumaNode {
            os_index: 2,
            cores: vec![Core { cpus: vec![6] }],
        },
    ]);
    assert_eq!(topology.num_numa_nodes(), 2);
    assert_eq!(topology.current_node().map(|n| n.os_index), Some(1));
    println!("✓ Topology reports its nodes");
}

// ============================================================================
// Binding
// ============================================================================

#[cfg(target_os = "linux")]
#[test]
fn test_bound_engine_starts() {
    init_test_logging();
    let config = test_config().with_bind_to_core(true).with_progress_core(0);
    let engine = ProgressEngine::new(config).unwrap();
    engine.start().unwrap();
    assert!(engine.is_running());
    engine.stop().unwrap();
    println!("✓ Engine binds its progress thread on start");
}

#[test]
fn test_unusable_core_fails_start() {
    let config = test_config()
        .with_bind_to_core(true)
        .with_progress_core(1 << 20);
    let engine = ProgressEngine::new(config).unwrap();
    assert!(engine.start().is_err());
    assert!(!engine.is_running());
    println!("✓ A bind failure surfaces from start");
}
