// SPDX-License-Identifier: GPL-2.0

//! # GRES scheduling interface
//!
//! The selection core consumes generic resources (GPUs, NICs, ...) through a
//! narrow contract: initialize per-job tracking, commit resources node by
//! node, tentatively aggregate over a run of nodes, and test whether an
//! aggregate or the committed total satisfies the job. The contract is a
//! trait so callers can plug in a full GRES subsystem; `CountingGres` is the
//! reference implementation used by the tests and by callers whose resources
//! are plain per-type counts.

use crate::job::McLayout;
use crate::nodemask::NodeMask;
use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One generic-resource requirement of a job.
#[derive(Debug, Clone)]
pub struct GresSpec {
    pub name: String,
    /// Whole-job count. 0 means the type is only constrained per node and
    /// needs no aggregate tracking.
    pub count: u64,
    /// CPUs that must accompany each allocated unit. 0 means no coupling.
    pub cpus_per_gres: u16,
}

/// A job's generic-resource request.
#[derive(Debug, Clone, Default)]
pub struct GresRequest {
    pub specs: Vec<GresSpec>,
}

impl GresRequest {
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// True if any spec carries a whole-job count.
    pub fn has_per_job(&self) -> bool {
        self.specs.iter().any(|s| s.count > 0)
    }
}

/// Per-node generic-resource availability, already filtered to the sockets
/// and cores the job may use.
#[derive(Debug, Clone, Default)]
pub struct SockGres {
    pub avail: BTreeMap<String, u64>,
}

impl SockGres {
    pub fn avail_of(&self, name: &str) -> u64 {
        self.avail.get(name).copied().unwrap_or(0)
    }
}

/// Tentative aggregate over a run, switch, or block of nodes.
#[derive(Debug, Clone, Default)]
pub struct GresAccum {
    pub counts: BTreeMap<String, u64>,
}

/// Arguments to the socket/core pruning hook. Bundled so the trait stays
/// readable; every field maps to state the pruning decision may consult or
/// narrow.
pub struct SockFilterArgs<'a> {
    pub mc: &'a McLayout,
    pub sock_gres: &'a SockGres,
    pub sock_cnt: u16,
    pub cores_per_socket: u16,
    pub tpc: u16,
    pub avail_cpus: &'a mut u16,
    pub min_tasks_this_node: &'a mut u32,
    pub max_tasks_this_node: &'a mut u32,
    pub min_cores_this_node: &'a mut u32,
    pub rem_nodes: i32,
    pub enforce_binding: bool,
    pub first_pass: bool,
    /// Core mask of the node, indexed by core.
    pub avail_core: &'a mut NodeMask,
    pub node_name: &'a str,
    pub sockets_as_unit: bool,
}

/// The scheduling side of the GRES subsystem as the selection core sees it.
///
/// Implementations are stateful: `add` commits resources against the job and
/// `test` checks the committed total. A fresh (or `init`-reset) instance is
/// expected per evaluation call.
pub trait GresSched {
    /// Reset committed state. Returns true iff the job has whole-job GRES
    /// constraints that require aggregate tracking during selection.
    fn init(&mut self, req: &GresRequest) -> bool;

    /// Commit this node's resources against the job. May lower `avail_cpus`
    /// when the committed units pin fewer CPUs than the node offered.
    fn add(&mut self, req: &GresRequest, sock_gres: &SockGres, avail_cpus: &mut u16);

    /// Tentatively aggregate this node's resources into `accum`, creating
    /// the aggregate on first use.
    fn consec(&self, accum: &mut Option<GresAccum>, req: &GresRequest, sock_gres: &SockGres);

    /// Whether committed resources plus `accum` could satisfy the job.
    fn sufficient(&self, req: &GresRequest, accum: Option<&GresAccum>) -> bool;

    /// Whether the committed resources satisfy the job.
    fn test(&self, req: &GresRequest, job_id: u32) -> bool;

    /// Render an aggregate for diagnostics.
    fn describe(&self, accum: Option<&GresAccum>) -> String;

    /// Prune sockets/cores for one node and narrow the usable CPU count and
    /// task bounds accordingly.
    fn filter_sock_core(&self, req: &GresRequest, args: SockFilterArgs<'_>);
}

/// Reference implementation: per-type counting with optional CPU coupling.
#[derive(Debug, Clone, Default)]
pub struct CountingGres {
    committed: BTreeMap<String, u64>,
}

impl CountingGres {
    pub fn new() -> Self {
        Self::default()
    }

    fn remaining(&self, spec: &GresSpec) -> u64 {
        let done = self.committed.get(&spec.name).copied().unwrap_or(0);
        spec.count.saturating_sub(done)
    }
}

impl GresSched for CountingGres {
    fn init(&mut self, req: &GresRequest) -> bool {
        self.committed.clear();
        req.has_per_job()
    }

    fn add(&mut self, req: &GresRequest, sock_gres: &SockGres, avail_cpus: &mut u16) {
        for spec in &req.specs {
            if spec.count == 0 {
                continue;
            }
            let take = self.remaining(spec).min(sock_gres.avail_of(&spec.name));
            *self.committed.entry(spec.name.clone()).or_insert(0) += take;
            if spec.cpus_per_gres > 0 && take > 0 {
                let pinned = take.saturating_mul(spec.cpus_per_gres as u64);
                *avail_cpus = (*avail_cpus as u64).min(pinned).max(1) as u16;
            }
        }
    }

    fn consec(&self, accum: &mut Option<GresAccum>, req: &GresRequest, sock_gres: &SockGres) {
        let accum = accum.get_or_insert_with(GresAccum::default);
        for spec in &req.specs {
            if spec.count == 0 {
                continue;
            }
            *accum.counts.entry(spec.name.clone()).or_insert(0) +=
                sock_gres.avail_of(&spec.name);
        }
    }

    fn sufficient(&self, req: &GresRequest, accum: Option<&GresAccum>) -> bool {
        req.specs.iter().all(|spec| {
            let pending = accum
                .and_then(|a| a.counts.get(&spec.name))
                .copied()
                .unwrap_or(0);
            pending >= self.remaining(spec)
        })
    }

    fn test(&self, req: &GresRequest, _job_id: u32) -> bool {
        req.specs.iter().all(|spec| self.remaining(spec) == 0)
    }

    fn describe(&self, accum: Option<&GresAccum>) -> String {
        let mut out = String::new();
        if let Some(accum) = accum {
            for (name, cnt) in &accum.counts {
                if !out.is_empty() {
                    out.push(',');
                }
                let _ = write!(out, "{name}:{cnt}");
            }
        }
        out
    }

    fn filter_sock_core(&self, req: &GresRequest, args: SockFilterArgs<'_>) {
        for spec in &req.specs {
            if spec.count == 0 {
                continue;
            }
            let avail = args.sock_gres.avail_of(&spec.name);
            if avail == 0 {
                if args.enforce_binding {
                    *args.max_tasks_this_node = 0;
                    *args.avail_cpus = 0;
                }
                continue;
            }
            if spec.cpus_per_gres > 0 {
                // CPUs the units on this node can pin, which bounds how many
                // of the node's CPUs this job can make use of.
                let usable = avail
                    .min(self.remaining(spec).max(1))
                    .saturating_mul(spec.cpus_per_gres as u64);
                *args.avail_cpus = (*args.avail_cpus as u64).min(usable).max(0) as u16;
                let tpc = args.tpc.max(1) as u32;
                let cores = (usable as u32).div_ceil(tpc);
                *args.min_cores_this_node = (*args.min_cores_this_node).max(cores.min(
                    args.cores_per_socket as u32 * args.sock_cnt.max(1) as u32,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(count: u64, cpus_per_gres: u16) -> GresRequest {
        GresRequest {
            specs: vec![GresSpec {
                name: "gpu".to_string(),
                count,
                cpus_per_gres,
            }],
        }
    }

    fn sock(avail: u64) -> SockGres {
        let mut sg = SockGres::default();
        sg.avail.insert("gpu".to_string(), avail);
        sg
    }

    #[test]
    fn test_init_flags_per_job_tracking() {
        let mut gres = CountingGres::new();
        assert!(!gres.init(&GresRequest::default()));
        assert!(!gres.init(&req(0, 2)));
        assert!(gres.init(&req(4, 0)));
    }

    #[test]
    fn test_add_commits_and_test_passes() {
        let mut gres = CountingGres::new();
        let r = req(4, 0);
        gres.init(&r);
        let mut cpus = 8u16;

        gres.add(&r, &sock(2), &mut cpus);
        assert!(!gres.test(&r, 1));
        gres.add(&r, &sock(2), &mut cpus);
        assert!(gres.test(&r, 1));
        assert_eq!(cpus, 8);
    }

    #[test]
    fn test_add_caps_cpus_by_coupling() {
        let mut gres = CountingGres::new();
        let r = req(2, 2);
        gres.init(&r);
        let mut cpus = 16u16;
        gres.add(&r, &sock(2), &mut cpus);
        assert_eq!(cpus, 4);
    }

    #[test]
    fn test_consec_sufficient() {
        let mut gres = CountingGres::new();
        let r = req(4, 0);
        gres.init(&r);

        let mut accum = None;
        gres.consec(&mut accum, &r, &sock(2));
        assert!(!gres.sufficient(&r, accum.as_ref()));
        gres.consec(&mut accum, &r, &sock(2));
        assert!(gres.sufficient(&r, accum.as_ref()));
        assert_eq!(gres.describe(accum.as_ref()), "gpu:4");
    }

    #[test]
    fn test_filter_enforce_binding_zeroes_node() {
        let gres = CountingGres::new();
        let r = req(2, 0);
        let mc = McLayout::default();
        let sg = SockGres::default();
        let mut avail_cpus = 8u16;
        let mut min_tasks = 1u32;
        let mut max_tasks = 8u32;
        let mut min_cores = 0u32;
        let mut core_mask = NodeMask::new_full(8);

        gres.filter_sock_core(
            &r,
            SockFilterArgs {
                mc: &mc,
                sock_gres: &sg,
                sock_cnt: 1,
                cores_per_socket: 4,
                tpc: 2,
                avail_cpus: &mut avail_cpus,
                min_tasks_this_node: &mut min_tasks,
                max_tasks_this_node: &mut max_tasks,
                min_cores_this_node: &mut min_cores,
                rem_nodes: 1,
                enforce_binding: true,
                first_pass: true,
                avail_core: &mut core_mask,
                node_name: "n0",
                sockets_as_unit: false,
            },
        );
        assert_eq!(avail_cpus, 0);
        assert_eq!(max_tasks, 0);
    }
}
