// SPDX-License-Identifier: GPL-2.0

//! Read-only cluster state the selection core operates over: the node
//! table, the idle-node bitmap, topology tables, and the scheduler
//! tunables parsed once from configuration strings.

use crate::nodemask::NodeMask;
use crate::gres::SockGres;
use crate::topology::{BlockTable, SwitchTable};

/// One compute node as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    /// Total usable CPUs (threads).
    pub cpus: u16,
    pub boards: u16,
    pub tot_sockets: u16,
    /// Cores per socket.
    pub cores: u16,
    /// Threads per core.
    pub tpc: u16,
    pub tot_cores: u16,
    /// Cores reserved for system use, excluded from task placement.
    pub core_spec_cnt: u16,
    /// Scheduling preference. Lower weight is selected first.
    pub sched_weight: u64,
}

impl NodeRecord {
    /// A uniform node used heavily by tests: one board, one socket,
    /// `cores` single-thread cores.
    pub fn flat(name: &str, cores: u16, sched_weight: u64) -> Self {
        Self {
            name: name.to_string(),
            cpus: cores,
            boards: 1,
            tot_sockets: 1,
            cores,
            tpc: 1,
            tot_cores: cores,
            core_spec_cnt: 0,
            sched_weight,
        }
    }
}

/// Per-node availability record, produced by the caller's resource pass and
/// narrowed by the core during selection.
#[derive(Debug, Clone, Default)]
pub struct AvailRes {
    /// CPUs the job may take on this node right now.
    pub avail_cpus: u16,
    /// CPUs the node could offer this job at best (used for load ratios).
    pub max_cpus: u16,
    pub avail_gpus: u16,
    pub avail_res_cnt: u32,
    pub sock_gres: SockGres,
    pub sock_cnt: u16,
    /// CPU floor induced by GRES core pruning; written by the core.
    pub gres_min_cpus: u16,
    /// Task ceiling induced by GRES pruning; written by the core.
    pub gres_max_tasks: u32,
}

impl AvailRes {
    pub fn with_cpus(avail: u16, max: u16) -> Self {
        Self {
            avail_cpus: avail,
            max_cpus: max,
            avail_res_cnt: avail as u32,
            sock_cnt: 1,
            ..Default::default()
        }
    }
}

/// Scheduler tunables, parsed once from the configuration strings and then
/// carried by handle for the lifetime of the cluster state.
#[derive(Debug, Clone, Default)]
pub struct Tunables {
    /// Fill serial (1 CPU / 1 node) jobs from the high end of the node list.
    pub pack_serial_at_end: bool,
    /// The switch fabric is a dragonfly; leaf placement uses its strategy.
    pub have_dragonfly: bool,
    /// Only use switch topology when the job asked for a switch bound.
    pub topo_optional: bool,
    /// Charge whole cores: one task per core regardless of threads.
    pub one_task_per_core: bool,
}

fn contains_nocase(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}

impl Tunables {
    /// Parse from the scheduler's parameter strings. Matching is
    /// case-insensitive substring search, like the configuration parser
    /// feeding them.
    pub fn parse(sched_params: &str, topology_param: &str, select_type_param: &str) -> Self {
        Self {
            pack_serial_at_end: contains_nocase(sched_params, "pack_serial_at_end"),
            have_dragonfly: contains_nocase(topology_param, "dragonfly"),
            topo_optional: contains_nocase(topology_param, "topooptional"),
            one_task_per_core: contains_nocase(select_type_param, "cr_one_task_per_core"),
        }
    }
}

/// Everything about the cluster that is read-stable for the duration of one
/// evaluation call.
#[derive(Debug)]
pub struct ClusterState {
    pub nodes: Vec<NodeRecord>,
    /// Nodes with no running work. Consulted by the busy-first strategy.
    pub idle_nodes: NodeMask,
    pub tunables: Tunables,
    pub switches: Option<SwitchTable>,
    pub blocks: Option<BlockTable>,
}

impl ClusterState {
    pub fn new(nodes: Vec<NodeRecord>, tunables: Tunables) -> Self {
        let nr = nodes.len();
        Self {
            nodes,
            idle_nodes: NodeMask::new_full(nr),
            tunables,
            switches: None,
            blocks: None,
        }
    }

    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// CPUs charged per allocated core on this node. Allocation units are
    /// whole cores, so every hardware thread of a core is charged.
    pub fn cpus_per_core(&self, node_inx: usize) -> u16 {
        self.nodes[node_inx].tpc.max(1)
    }
}
