// SPDX-License-Identifier: GPL-2.0

//! Dragonfly placement: allocate on one leaf switch when possible,
//! otherwise distribute over the leaves of one top-level switch on a
//! round-robin basis. A dragonfly fabric is all-to-all between groups, so
//! spreading beyond one leaf is cheap and evening out the leaves beats
//! minimizing their count.

use crate::eval::{
    absorb_required_topo, build_weight_buckets, enough_nodes, log_weight_buckets, nodelist_str,
    validate_required, EvalContext, EvalError, Tally,
};
use crate::gres::GresAccum;
use crate::nodemask::NodeMask;
use log::{debug, error, info, log_enabled, Level};

pub(crate) fn eval_nodes_dfly(ctx: &mut EvalContext) -> Result<(), EvalError> {
    ctx.avail_cpus = 0;

    if ctx.job.req_switch > 1 {
        // A leaf switch bound above one makes no sense on a dragonfly.
        info!(
            "Resetting job {} leaf switch count from {} to 0",
            ctx.job.job_id, ctx.job.req_switch
        );
        ctx.job.req_switch = 0;
    }
    let mut time_waiting = 0u64;
    if ctx.job.req_switch > 0 {
        if ctx.job.wait4switch_start == 0 {
            ctx.job.wait4switch_start = ctx.time_now;
        }
        time_waiting = ctx.time_now.saturating_sub(ctx.job.wait4switch_start);
    }

    let cluster = ctx.cluster;
    let Some(switches) = cluster.switches.as_ref() else {
        return Err(EvalError::NoLocalityDomain);
    };

    let mut switch_node_mask: Vec<NodeMask> = switches
        .switches
        .iter()
        .map(|s| s.node_mask.clone())
        .collect();

    let rc = dfly_select(ctx, &switches.switches, &mut switch_node_mask);

    if ctx.job.req_switch > 0 && rc.is_ok() {
        // req_switch == 1 here; enforced above.
        let mut leaf_switch_count = 0;
        for (i, sw) in switches.switches.iter().enumerate() {
            if sw.level != 0 {
                continue;
            }
            if switch_node_mask[i].overlaps(ctx.node_map) {
                leaf_switch_count += 1;
            }
        }
        if time_waiting >= ctx.job.wait4switch {
            ctx.job.best_switch = true;
            debug!(
                "job {} waited {} sec for switches use={}",
                ctx.job.job_id, time_waiting, leaf_switch_count
            );
        } else if leaf_switch_count > ctx.job.req_switch {
            // Allocation spans more switches than requested.
            ctx.job.best_switch = false;
            debug!(
                "job {} waited {} sec for switches={} found={} wait {}",
                ctx.job.job_id,
                time_waiting,
                ctx.job.req_switch,
                leaf_switch_count,
                ctx.job.wait4switch
            );
        } else {
            ctx.job.best_switch = true;
        }
    }

    rc
}

fn dfly_select(
    ctx: &mut EvalContext,
    switches: &[crate::topology::SwitchRecord],
    switch_node_mask: &mut [NodeMask],
) -> Result<(), EvalError> {
    let cluster = ctx.cluster;
    let nr = ctx.nr_nodes();

    let gres_per_job = ctx.gres_init();
    let mut tally = Tally::new(ctx.job, ctx.min_nodes, ctx.req_nodes, gres_per_job);
    let req_mask = ctx.job.req_node_mask.clone();

    if let Some(rm) = &req_mask {
        validate_required(ctx, rm)?;
    }
    if ctx.node_map.is_empty() {
        debug!("job {} node_map is empty", ctx.job.job_id);
        return Err(EvalError::Insufficient);
    }

    let mut avail_cpu_per_node = vec![0u16; nr];
    let bucket_src = ctx.node_map.clone();
    if let Some(rm) = &req_mask {
        absorb_required_topo(ctx, rm, &mut tally, gres_per_job, &mut avail_cpu_per_node)?;
    }
    let mut buckets = build_weight_buckets(cluster, &bucket_src);

    if let Some(rm) = &req_mask {
        *ctx.node_map &= rm;
        if ctx.satisfied(&tally) {
            // Required nodes completely satisfied the request.
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            debug!(
                "job {} requires nodes exceed maximum node limit",
                ctx.job.job_id
            );
            return Err(EvalError::MaxNodesReached);
        }
    } else {
        ctx.node_map.clear_all();
    }
    log_weight_buckets(cluster, &buckets);

    // Identify the top-level switch: the highest-level switch containing
    // every required node, or any candidate when nothing is required.
    let mut switch_required = vec![false; switches.len()];
    let mut leaf_switch_count = 0u32;
    let mut top_switch_inx: Option<usize> = None;
    for (i, sw) in switches.iter().enumerate() {
        if let Some(rm) = &req_mask {
            if rm.overlaps(&switch_node_mask[i]) {
                switch_required[i] = true;
                if sw.level == 0 {
                    leaf_switch_count += 1;
                }
                if top_switch_inx.map_or(true, |t| sw.level > switches[t].level) {
                    top_switch_inx = Some(i);
                }
            }
        } else if buckets
            .iter()
            .any(|b| b.node_mask.overlaps(&switch_node_mask[i]))
            && top_switch_inx.map_or(true, |t| sw.level > switches[t].level)
        {
            top_switch_inx = Some(i);
        }
    }

    let Some(top_switch_inx) = top_switch_inx else {
        error!(
            "job {} unable to identify top level switch",
            ctx.job.job_id
        );
        return Err(EvalError::NoLocalityDomain);
    };

    if let Some(rm) = &req_mask {
        if !rm.is_subset_of(&switch_node_mask[top_switch_inx]) {
            info!(
                "job {} requires nodes that do not have shared network",
                ctx.job.job_id
            );
            return Err(EvalError::SplitLocality);
        }
    }

    // Drop nodes unreachable from the top switch.
    let top_mask = switch_node_mask[top_switch_inx].clone();
    for (i, mask) in switch_node_mask.iter_mut().enumerate() {
        if i != top_switch_inx {
            *mask &= &top_mask;
        }
    }

    // Walk weight buckets until the identified node pool can satisfy the
    // request. Whole buckets are taken; the lower-weight ones (all but the
    // last) are promoted to near-required.
    let mut sufficient = false;
    let mut best_node_cnt = 0i32;
    let mut best_cpu_cnt = 0i64;
    let mut best_gres: Option<GresAccum> = None;
    let mut best_nodes = NodeMask::new(nr);
    let mut req2_nodes: Option<NodeMask> = None;
    for bucket in buckets.iter_mut() {
        if sufficient {
            break;
        }
        if best_node_cnt > 0 {
            match &mut req2_nodes {
                Some(r2) => *r2 |= &best_nodes,
                None => req2_nodes = Some(best_nodes.clone()),
            }
        }
        let candidates: Vec<usize> = bucket.node_mask.iter().collect();
        for i in candidates {
            if avail_cpu_per_node[i] != 0 {
                continue; // required node, already priced
            }
            if !top_mask.test_node(i) {
                continue;
            }
            ctx.select_cores(i, tally.min_rem_nodes);
            if ctx.avail_cpus == 0 {
                let _ = bucket.node_mask.clear_node(i);
                continue;
            }
            let _ = best_nodes.set_node(i);
            avail_cpu_per_node[i] = ctx.avail_cpus;
            best_cpu_cnt += ctx.avail_cpus as i64;
            best_node_cnt += 1;
            if gres_per_job {
                ctx.gres.consec(
                    &mut best_gres,
                    &ctx.job.gres_req,
                    &ctx.avail_res[i].sock_gres,
                );
            }
        }

        sufficient = best_cpu_cnt >= tally.rem_cpus
            && enough_nodes(best_node_cnt, tally.rem_nodes, ctx.min_nodes, ctx.req_nodes);
        if sufficient && gres_per_job {
            sufficient = ctx.gres.sufficient(&ctx.job.gres_req, best_gres.as_ref());
        }
    }

    if log_enabled!(Level::Debug) {
        if let Some(rm) = &req_mask {
            debug!("required nodes:{}", nodelist_str(cluster, rm));
        }
        debug!(
            "best nodes:{} node_cnt:{} cpu_cnt:{} {}",
            nodelist_str(cluster, &best_nodes),
            best_node_cnt,
            best_cpu_cnt,
            ctx.gres.describe(best_gres.as_ref())
        );
    }
    if !sufficient {
        debug!(
            "insufficient resources currently available for job {}",
            ctx.job.job_id
        );
        return Err(EvalError::Insufficient);
    }

    // Absorb the promoted low-weight nodes as if required; higher weight
    // nodes will only join as needed.
    if let Some(req2) = req2_nodes.clone() {
        for i in req2.iter() {
            if ctx.max_nodes == 0 {
                break;
            }
            ctx.avail_cpus = avail_cpu_per_node[i];
            ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
            if gres_per_job {
                ctx.gres_add(i);
            }
            ctx.commit_node(i, &mut tally);
        }

        for (i, sw) in switches.iter().enumerate() {
            if switch_required[i] {
                continue;
            }
            if req2.overlaps(&switch_node_mask[i]) {
                switch_required[i] = true;
                if sw.level == 0 {
                    leaf_switch_count += 1;
                }
            }
        }
        *ctx.node_map |= &req2;
        if ctx.max_nodes == 0 {
            debug!("job {} reached maximum node limit", ctx.job.job_id);
            return Err(EvalError::MaxNodesReached);
        }
        if tally.drained() && (!gres_per_job || ctx.gres_test()) {
            error!("Scheduling anomaly for job {}", ctx.job.job_id);
            return Ok(());
        }
    }

    // Rebuild the per-switch views over the identified pool.
    best_nodes |= &*ctx.node_map;
    let mut avail_nodes = NodeMask::new(nr);
    let mut switch_node_cnt = vec![0i32; switches.len()];
    for (i, mask) in switch_node_mask.iter_mut().enumerate() {
        *mask &= &best_nodes;
        avail_nodes |= mask;
        switch_node_cnt[i] = mask.weight() as i32;
    }

    if log_enabled!(Level::Debug) {
        for (i, sw) in switches.iter().enumerate() {
            debug!(
                "switch={} level={} nodes={}:{} required:{}",
                sw.name,
                sw.level,
                switch_node_cnt[i],
                nodelist_str(cluster, &switch_node_mask[i]),
                switch_required[i]
            );
        }
    }

    if let Some(rm) = &req_mask {
        if !rm.is_subset_of(&avail_nodes) {
            info!(
                "job {} requires nodes not available on any switch",
                ctx.job.job_id
            );
            return Err(EvalError::RequiredUnavailable);
        }
    }

    // Nothing anchored to a leaf yet: start from the leaf with the most
    // available nodes.
    if leaf_switch_count == 0 {
        let mut best_switch_inx: Option<usize> = None;
        for (i, sw) in switches.iter().enumerate() {
            if sw.level != 0 {
                continue;
            }
            if best_switch_inx.map_or(true, |b| switch_node_cnt[i] > switch_node_cnt[b]) {
                best_switch_inx = Some(i);
            }
        }
        if let Some(b) = best_switch_inx {
            leaf_switch_count = 1;
            switch_required[b] = true;
        }
    }

    // All anchors on one leaf switch: try to finish the whole request there.
    if leaf_switch_count == 1 {
        best_cpu_cnt = 0;
        best_node_cnt = 0;
        best_gres = None;
        let mut chosen_leaf: Option<usize> = None;
        for i in 0..switches.len() {
            if !switch_required[i] || switches[i].level != 0 {
                continue;
            }
            for j in switch_node_mask[i].iter() {
                if ctx.node_map.test_node(j) || avail_cpu_per_node[j] == 0 {
                    continue;
                }
                best_cpu_cnt += avail_cpu_per_node[j] as i64;
                best_node_cnt += 1;
                if gres_per_job {
                    ctx.gres.consec(
                        &mut best_gres,
                        &ctx.job.gres_req,
                        &ctx.avail_res[j].sock_gres,
                    );
                }
            }
            chosen_leaf = Some(i);
            break;
        }
        sufficient = best_cpu_cnt >= tally.rem_cpus
            && enough_nodes(best_node_cnt, tally.rem_nodes, ctx.min_nodes, ctx.req_nodes);
        if sufficient && gres_per_job {
            sufficient = ctx.gres.sufficient(&ctx.job.gres_req, best_gres.as_ref());
        }
        if sufficient {
            if let Some(i) = chosen_leaf {
                let members: Vec<usize> = switch_node_mask[i].iter().collect();
                for j in members {
                    if ctx.node_map.test_node(j) || avail_cpu_per_node[j] == 0 {
                        continue;
                    }
                    ctx.avail_cpus = avail_cpu_per_node[j];
                    ctx.cpus_to_use(j, tally.rem_max_cpus, tally.min_rem_nodes);
                    if gres_per_job {
                        ctx.gres_add(j);
                    }
                    ctx.commit_node(j, &mut tally);
                    let _ = ctx.node_map.set_node(j);
                    if tally.drained() && (!gres_per_job || ctx.gres_test()) {
                        return Ok(());
                    }
                    if ctx.max_nodes == 0 {
                        debug!("job {} reached maximum node limit", ctx.job.job_id);
                        return Err(EvalError::MaxNodesReached);
                    }
                }
            }
        }
    }

    // Round-robin the leaves, one node per switch per pass, until drained
    // or a full pass adds nothing.
    let mut prev_rem_nodes = tally.rem_nodes + 1;
    loop {
        if prev_rem_nodes == tally.rem_nodes {
            break; // stalled
        }
        prev_rem_nodes = tally.rem_nodes;
        for i in 0..switches.len() {
            if switches[i].level != 0 {
                continue;
            }
            let members: Vec<usize> = switch_node_mask[i].iter().collect();
            for j in members {
                if ctx.node_map.test_node(j) || avail_cpu_per_node[j] == 0 {
                    continue;
                }
                ctx.avail_cpus = avail_cpu_per_node[j];
                ctx.cpus_to_use(j, tally.rem_max_cpus, tally.min_rem_nodes);
                if gres_per_job {
                    ctx.gres_add(j);
                }
                ctx.commit_node(j, &mut tally);
                let _ = ctx.node_map.set_node(j);
                if tally.drained() && (!gres_per_job || ctx.gres_test()) {
                    return Ok(());
                }
                if ctx.max_nodes == 0 {
                    debug!("job {} reached maximum node limit", ctx.job.job_id);
                    return Err(EvalError::MaxNodesReached);
                }
                break; // move to next switch
            }
        }
    }

    if tally.min_drained() && (!gres_per_job || ctx.gres_test()) {
        return Ok(());
    }
    Err(EvalError::Insufficient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Fixture;
    use crate::topology::{SwitchRecord, SwitchTable};

    fn two_leaf_fabric(nr: usize) -> SwitchTable {
        let half = nr / 2;
        let m = |s: String| NodeMask::from_nodelist(&s, nr).unwrap();
        SwitchTable::new(vec![
            SwitchRecord::new("leaf0", 0, 2, m(format!("0-{}", half - 1))),
            SwitchRecord::new("leaf1", 0, 2, m(format!("{}-{}", half, nr - 1))),
            SwitchRecord::new("top", 1, 2, m(format!("0-{}", nr - 1))),
        ])
    }

    fn dfly_fixture(nr: usize, cpus: u16) -> Fixture {
        let mut fix = Fixture::flat(nr, cpus).switches(two_leaf_fabric(nr));
        fix.cluster.tunables.have_dragonfly = true;
        fix
    }

    #[test]
    fn test_one_leaf_when_it_suffices() {
        let mut fix = dfly_fixture(4, 8).request(16, 2, 2);
        assert_eq!(fix.eval(), Ok(()));
        // Both nodes land on leaf0.
        assert_eq!(fix.selected(), vec![0, 1]);
    }

    #[test]
    fn test_round_robin_across_leaves() {
        let mut fix = dfly_fixture(4, 8).request(32, 4, 4);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_required_straddle_keeps_shared_top() {
        // Required nodes on both leaves are fine: the top switch spans them.
        let mut fix = dfly_fixture(4, 8).required("0,2").request(16, 2, 2);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![0, 2]);
    }

    #[test]
    fn test_overshoot_sets_advisory() {
        // One switch requested, not enough room on one leaf: allocation
        // spans both, and since the job has not waited long enough the
        // advisory asks the caller to hold on.
        let mut fix = dfly_fixture(4, 8).request(32, 4, 4);
        fix.job.req_switch = 1;
        fix.job.wait4switch = 600;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected().len(), 4);
        assert!(!fix.job.best_switch);
        assert_eq!(fix.job.wait4switch_start, fix.time_now);
    }

    #[test]
    fn test_wait_expired_accepts_overshoot() {
        let mut fix = dfly_fixture(4, 8).request(32, 4, 4);
        fix.job.req_switch = 1;
        fix.job.wait4switch = 100;
        fix.job.wait4switch_start = 500;
        fix.time_now = 700; // waited 200s >= 100s
        assert_eq!(fix.eval(), Ok(()));
        assert!(fix.job.best_switch);
    }

    #[test]
    fn test_req_switch_above_one_resets() {
        let mut fix = dfly_fixture(4, 8).request(32, 4, 4);
        fix.job.req_switch = 3;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.job.req_switch, 0);
        // No constraint left, so the advisory stays untouched.
        assert!(fix.job.best_switch);
    }

    #[test]
    fn test_one_leaf_fit_sets_best_switch() {
        let mut fix = dfly_fixture(4, 8).request(16, 2, 2);
        fix.job.req_switch = 1;
        fix.job.wait4switch = 600;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![0, 1]);
        assert!(fix.job.best_switch);
    }

    #[test]
    fn test_disjoint_required_fails() {
        // Two disjoint fabrics; required nodes split across them.
        let m = |s: &str| NodeMask::from_nodelist(s, 4).unwrap();
        let table = SwitchTable::new(vec![
            SwitchRecord::new("leaf0", 0, 0, m("0-1")),
            SwitchRecord::new("leaf1", 0, 1, m("2-3")),
        ]);
        let mut fix = Fixture::flat(4, 8)
            .switches(table)
            .required("0,2")
            .request(32, 4, 4);
        fix.cluster.tunables.have_dragonfly = true;
        assert_eq!(fix.eval(), Err(EvalError::SplitLocality));
    }
}
