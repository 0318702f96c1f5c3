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
//!
//! Group members sharing a node split the cores of their NUMA node into equal
//! chunks and each binds its progress thread to the last core of its chunk,
//! which keeps it away from the low-numbered cores application threads
//! usually occupy.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::config::EngineConfig;
use crate::error::{NbcError, NbcResult};

const NODE_ROOT: &str = "/sys/devices/system/node";
const CPU_ROOT: &str = "/sys/devices/system/cpu";

/// Where this process sits among the group members on its node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupPlacement {
    pub local_rank: usize,
    pub local_size: usize,
}

impl GroupPlacement {
    pub fn new(local_rank: usize, local_size: usize) -> Self {
        Self {
            local_rank,
            local_size,
        }
    }
}

impl Default for GroupPlacement {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

/// A physical core and the logical CPUs (hardware threads) on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Core {
    pub cpus: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNode {
    pub os_index: usize,
    pub cores: Vec<Core>,
}

/// The NUMA nodes and cores this process is allowed to run on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub nodes: Vec<NumaNode>,
}

impl Topology {
    pub fn from_nodes(nodes: Vec<NumaNode>) -> Self {
        Self { nodes }
    }

    /// Read the topology from sysfs, restricted to the CPUs in this
    /// process's affinity mask.
    ///
    /// Without NUMA information, all allowed CPUs form a single node.
    pub fn detect() -> NbcResult<Self> {
        let allowed = allowed_cpus()?;
        if allowed.is_empty() {
            return Err(NbcError::Topology("affinity mask is empty".into()));
        }

        let mut nodes = Vec::new();
        for (os_index, cpus) in read_node_cpulists(Path::new(NODE_ROOT)) {
            let cpus: Vec<usize> = cpus.into_iter().filter(|c| allowed.contains(c)).collect();
            if !cpus.is_empty() {
                nodes.push(NumaNode {
                    os_index,
                    cores: group_into_cores(&cpus, Path::new(CPU_ROOT)),
                });
            }
        }
        if nodes.is_empty() {
            crate::nbc_debug!("No NUMA information found, using a single node");
            nodes.push(NumaNode {
                os_index: 0,
                cores: group_into_cores(&allowed, Path::new(CPU_ROOT)),
            });
        }
        Ok(Self { nodes })
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// The first NUMA node this process may run on
    pub fn current_node(&self) -> Option<&NumaNode> {
        self.nodes.first()
    }
}

/// Parse a Linux cpulist such as `0-3,8,10-11`.
pub fn parse_cpulist(list: &str) -> NbcResult<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parse = |s: &str| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| NbcError::Topology(format!("bad cpulist entry '{}'", part)))
        };
        match part.split_once('-') {
            Some((lo, hi)) => {
                let (lo, hi) = (parse(lo)?, parse(hi)?);
                if lo > hi {
                    return Err(NbcError::Topology(format!("bad cpulist range '{}'", part)));
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(parse(part)?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

fn read_node_cpulists(root: &Path) -> Vec<(usize, Vec<usize>)> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut nodes: Vec<(usize, Vec<usize>)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let index = name.to_str()?.strip_prefix("node")?.parse::<usize>().ok()?;
            let list = fs::read_to_string(entry.path().join("cpulist")).ok()?;
            parse_cpulist(&list).ok().map(|cpus| (index, cpus))
        })
        .collect();
    nodes.sort_by_key(|(index, _)| *index);
    nodes
}

fn read_id(path: &Path) -> Option<usize> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Group hardware threads by (package, core id). CPUs without topology
/// information each count as their own core.
fn group_into_cores(cpus: &[usize], cpu_root: &Path) -> Vec<Core> {
    let mut by_core: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    let mut loose = Vec::new();
    for &cpu in cpus {
        let topo = cpu_root.join(format!("cpu{}", cpu)).join("topology");
        match (
            read_id(&topo.join("physical_package_id")),
            read_id(&topo.join("core_id")),
        ) {
            (Some(package), Some(core)) => by_core.entry((package, core)).or_default().push(cpu),
            _ => loose.push(Core { cpus: vec![cpu] }),
        }
    }
    let mut cores: Vec<Core> = by_core.into_values().map(|cpus| Core { cpus }).collect();
    cores.extend(loose);
    cores.sort_by_key(|core| core.cpus.first().copied().unwrap_or(usize::MAX));
    cores
}

/// Pick the core index within the NUMA node for the progress thread.
///
/// With no override, `ranks_per_numa = max(1, local_size / num_numa_nodes)`,
/// the cores are split into `num_cores / ranks_per_numa` sized chunks and
/// member `local_rank % ranks_per_numa` takes the last core of its chunk.
pub fn choose_core(
    num_cores: usize,
    num_numa_nodes: usize,
    placement: GroupPlacement,
    ranks_per_numa_override: Option<usize>,
    core_override: Option<usize>,
) -> NbcResult<usize> {
    if num_cores == 0 {
        return Err(NbcError::Topology("NUMA node has no cores".into()));
    }
    if let Some(core) = core_override {
        if core >= num_cores {
            return Err(NbcError::Topology(format!(
                "requested core {} but the NUMA node has {} cores",
                core, num_cores
            )));
        }
        return Ok(core);
    }

    let ranks_per_numa = match ranks_per_numa_override {
        Some(0) => return Err(NbcError::Topology("ranks per NUMA node must be at least 1".into())),
        Some(ranks) => ranks,
        None => std::cmp::max(1, placement.local_size / num_numa_nodes.max(1)),
    };
    let numa_rank = placement.local_rank % ranks_per_numa;
    let chunk = num_cores / ranks_per_numa;
    if chunk == 0 {
        return Err(NbcError::Topology(format!(
            "not enough cores to bind to: {} cores for {} ranks per NUMA node",
            num_cores, ranks_per_numa
        )));
    }
    Ok((numa_rank + 1) * chunk - 1)
}

/// Bind the calling thread to the core chosen for `placement`. Returns the
/// logical CPU bound to.
pub fn bind_progress_thread(placement: GroupPlacement, config: &EngineConfig) -> NbcResult<usize> {
    let topology = Topology::detect()?;
    let node = topology
        .current_node()
        .ok_or_else(|| NbcError::Topology("no NUMA node available".into()))?;
    let index = choose_core(
        node.cores.len(),
        topology.num_numa_nodes(),
        placement,
        config.ranks_per_numa_node,
        config.progress_core,
    )?;
    let cpu = node
        .cores
        .get(index)
        .and_then(|core| core.cpus.first().copied())
        .ok_or_else(|| NbcError::Topology(format!("core {} has no logical CPUs", index)))?;
    bind_current_thread(cpu)?;
    crate::nbc_debug!(
        "Progress thread bound to cpu {} (core {} of NUMA node {})",
        cpu,
        index,
        node.os_index
    );
    Ok(cpu)
}

#[cfg(target_os = "linux")]
pub fn allowed_cpus() -> NbcResult<Vec<usize>> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) };
    if rc != 0 {
        return Err(NbcError::Topology(format!(
            "sched_getaffinity failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok((0..libc::CPU_SETSIZE as usize)
        .filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &set) })
        .collect())
}

#[cfg(target_os = "linux")]
pub fn bind_current_thread(cpu: usize) -> NbcResult<()> {
    if cpu >= libc::CPU_SETSIZE as usize {
        return Err(NbcError::Topology(format!("cpu {} out of range", cpu)));
    }
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
    }
    let rc = unsafe { libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) };
    if rc != 0 {
        return Err(NbcError::Topology(format!(
            "sched_setaffinity to cpu {} failed: {}",
            cpu,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn allowed_cpus() -> NbcResult<Vec<usize>> {
    Err(NbcError::NotImplemented(
        "thread affinity is only supported on Linux".into(),
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn bind_current_thread(_cpu: usize) -> NbcResult<()> {
    Err(NbcError::NotImplemented(
        "thread affinity is only supported on Linux".into(),
    ))
}
