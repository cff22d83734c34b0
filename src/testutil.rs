// SPDX-License-Identifier: GPL-2.0

//! Shared fixtures for the strategy tests. Builds a small uniform cluster
//! and an evaluation context over it, with builder-style tweaks for the
//! scenarios the individual strategies need.

use crate::cluster::{AvailRes, ClusterState, NodeRecord, Tunables};
use crate::eval::{eval_nodes, CresSelect, EvalContext, EvalError};
use crate::gres::CountingGres;
use crate::job::{JobRequest, McLayout};
use crate::nodemask::NodeMask;
use crate::topology::{BlockTable, SwitchTable};

pub(crate) struct Fixture {
    pub cluster: ClusterState,
    pub job: JobRequest,
    pub node_map: NodeMask,
    pub avail_core: Vec<NodeMask>,
    pub avail_res: Vec<AvailRes>,
    pub gres: CountingGres,
    pub mc: McLayout,
    pub cres: CresSelect,
    pub min_nodes: u32,
    pub req_nodes: u32,
    pub max_nodes: u32,
    pub prefer_alloc_nodes: bool,
    pub time_now: u64,
}

impl Fixture {
    /// `n` identical nodes of `cpus` single-thread cores, weight 10, all
    /// idle, all candidates, requesting 1 CPU on 1 node by default.
    pub fn flat(n: usize, cpus: u16) -> Self {
        let nodes = (0..n)
            .map(|i| NodeRecord::flat(&format!("n{i}"), cpus, 10))
            .collect();
        let cluster = ClusterState::new(nodes, Tunables::default());
        Self {
            cluster,
            job: JobRequest::new(1, 1, 1),
            node_map: NodeMask::new_full(n),
            avail_core: (0..n).map(|_| NodeMask::new_full(cpus as usize)).collect(),
            avail_res: (0..n).map(|_| AvailRes::with_cpus(cpus, cpus)).collect(),
            gres: CountingGres::new(),
            mc: McLayout::default(),
            cres: CresSelect::default(),
            min_nodes: 1,
            req_nodes: 1,
            max_nodes: n as u32,
            prefer_alloc_nodes: false,
            time_now: 1_000,
        }
    }

    pub fn weights(mut self, weights: &[u64]) -> Self {
        for (node, w) in self.cluster.nodes.iter_mut().zip(weights) {
            node.sched_weight = *w;
        }
        self
    }

    /// Override one node's availability record.
    pub fn avail(mut self, node: usize, avail: u16, max: u16) -> Self {
        self.avail_res[node] = AvailRes::with_cpus(avail, max);
        self
    }

    /// Remove a node from the candidate set.
    pub fn without(mut self, node: usize) -> Self {
        self.node_map.clear_node(node).unwrap();
        self
    }

    pub fn switches(mut self, table: SwitchTable) -> Self {
        self.cluster.switches = Some(table);
        self
    }

    pub fn blocks(mut self, table: BlockTable) -> Self {
        self.cluster.blocks = Some(table);
        self
    }

    pub fn request(mut self, min_cpus: u32, min_nodes: u32, req_nodes: u32) -> Self {
        self.job.min_cpus = min_cpus;
        self.min_nodes = min_nodes;
        self.req_nodes = req_nodes;
        self
    }

    pub fn required(mut self, nodelist: &str) -> Self {
        let nr = self.cluster.nr_nodes();
        self.job.req_node_mask = Some(NodeMask::from_nodelist(nodelist, nr).unwrap());
        self
    }

    pub fn eval(&mut self) -> Result<(), EvalError> {
        let mut ctx = EvalContext {
            job: &mut self.job,
            node_map: &mut self.node_map,
            avail_core: &mut self.avail_core,
            avail_res: &mut self.avail_res,
            cluster: &self.cluster,
            gres: &mut self.gres,
            mc: self.mc.clone(),
            cres: self.cres,
            min_nodes: self.min_nodes,
            req_nodes: self.req_nodes,
            max_nodes: self.max_nodes,
            avail_cpus: 0,
            enforce_binding: false,
            first_pass: true,
            prefer_alloc_nodes: self.prefer_alloc_nodes,
            time_now: self.time_now,
        };
        eval_nodes(&mut ctx)
    }

    pub fn selected(&self) -> Vec<usize> {
        self.node_map.iter().collect()
    }
}
