// SPDX-License-Identifier: GPL-2.0

//! Job descriptor consumed by the selection core.
//!
//! A `JobRequest` is the read side of one scheduling attempt: resource
//! bounds, layout constraints, and topology preferences. The selection core
//! mutates only the advisory fields (`best_switch`, `wait4switch_start`,
//! `req_switch`) while everything else is treated as input.

use crate::gres::GresRequest;
use crate::nodemask::NodeMask;

/// Multi-core layout constraints, normally derived from the task launch
/// request. `cpus_per_task` is always at least 1.
#[derive(Debug, Clone)]
pub struct McLayout {
    pub cpus_per_task: u16,
    pub ntasks_per_node: u32,
    pub ntasks_per_board: u32,
    pub ntasks_per_socket: u32,
    /// 0 means unconstrained (an unlimited marker upstream normalizes
    /// to 0 here).
    pub ntasks_per_core: u32,
}

impl Default for McLayout {
    fn default() -> Self {
        Self {
            cpus_per_task: 1,
            ntasks_per_node: 0,
            ntasks_per_board: 0,
            ntasks_per_socket: 0,
            ntasks_per_core: 0,
        }
    }
}

/// Partition attributes the core consults.
#[derive(Debug, Clone, Copy, Default)]
pub struct Partition {
    /// Least-loaded-node placement requested at the partition level.
    pub lln: bool,
}

/// One job's resource request.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub job_id: u32,

    /// Total CPU floor for the allocation.
    pub min_cpus: u32,
    /// Optional total CPU ceiling.
    pub max_cpus: Option<u32>,
    /// Node-count bounds as the job stated them. These are distinct from the
    /// per-call bounds on the evaluation context, which the caller may have
    /// narrowed.
    pub min_nodes: u32,
    pub max_nodes: Option<u32>,

    /// Nodes the job explicitly named. Must all be selected or the call
    /// fails.
    pub req_node_mask: Option<NodeMask>,
    /// Per-required-node task counts, aligned with `req_node_mask` in index
    /// order. Only consulted for required nodes.
    pub arbitrary_tpn: Option<Vec<u16>>,

    /// Per-node CPU floor.
    pub pn_min_cpus: u16,
    /// Per-node CPU floor induced by per-node GRES requests.
    pub min_gres_cpu: u32,
    /// Whole-job CPU floor induced by per-job GRES requests.
    pub min_job_gres_cpu: u32,

    pub num_tasks: Option<u32>,
    pub ntasks_per_tres: Option<u16>,
    pub overcommit: bool,
    /// Allocate every resource on each selected node.
    pub whole_node: bool,
    /// Nodes must be consecutive in index order.
    pub contiguous: bool,
    /// Spread the job over as many nodes as possible.
    pub spread_job: bool,

    pub gres_req: GresRequest,
    pub partition: Partition,

    /// Requested maximum leaf-switch count. 0 means no constraint.
    pub req_switch: u32,
    /// Seconds the job is willing to wait for a better-localized allocation.
    pub wait4switch: u64,
    /// Epoch seconds of the first attempt that started the wait clock; 0
    /// if the clock has not started.
    pub wait4switch_start: u64,
    /// Advisory output: false when the allocation spans more leaf switches
    /// than requested and waiting longer might improve locality.
    pub best_switch: bool,
}

impl JobRequest {
    /// A minimal request for `min_cpus` CPUs on `min_nodes..=max` nodes,
    /// with every optional constraint disabled.
    pub fn new(job_id: u32, min_cpus: u32, min_nodes: u32) -> Self {
        Self {
            job_id,
            min_cpus,
            max_cpus: None,
            min_nodes,
            max_nodes: None,
            req_node_mask: None,
            arbitrary_tpn: None,
            pn_min_cpus: 1,
            min_gres_cpu: 0,
            min_job_gres_cpu: 0,
            num_tasks: None,
            ntasks_per_tres: None,
            overcommit: false,
            whole_node: false,
            contiguous: false,
            spread_job: false,
            gres_req: GresRequest::default(),
            partition: Partition::default(),
            req_switch: 0,
            wait4switch: 0,
            wait4switch_start: 0,
            best_switch: true,
        }
    }
}
