// SPDX-License-Identifier: GPL-2.0

//! Generic switch-tree placement with a minimal leaf-switch count.
//!
//! The top-level switch is the highest switch spanning all required nodes
//! (or, with none required, a capacity-sufficient switch overlapping the
//! lowest-weight candidates). Leaf switches are then added by topological
//! distance from the switches already in use, preferring leaves that fit
//! the remaining request with the least waste.
//!
//! When the result lands on more leaf switches than the job asked for and
//! the job is still willing to wait, the attempt is retried with the
//! preferred node count relaxed by one, restoring the pre-selection
//! snapshots each time, until the allocation fits or the slack runs out.

use crate::eval::{
    absorb_required_topo, build_weight_buckets, enough_nodes, log_weight_buckets, nodelist_str,
    validate_required, EvalContext, EvalError, Tally, WeightBucket,
};
use crate::gres::GresAccum;
use crate::nodemask::NodeMask;
use crate::topology::{SwitchRecord, DIST_INFINITE};
use log::{debug, error, info, log_enabled, Level};

/// Per-switch working state for one evaluation.
struct SwitchScratch {
    node_mask: Vec<NodeMask>,
    node_cnt: Vec<i32>,
    cpu_cnt: Vec<i64>,
    required: Vec<bool>,
}

pub(crate) fn eval_nodes_tree(ctx: &mut EvalContext) -> Result<(), EvalError> {
    ctx.avail_cpus = 0;

    let mut time_waiting = 0u64;
    if ctx.job.req_switch > 0 {
        if ctx.job.wait4switch_start == 0 {
            ctx.job.wait4switch_start = ctx.time_now;
        }
        time_waiting = ctx.time_now.saturating_sub(ctx.job.wait4switch_start);
    }

    let cluster = ctx.cluster;
    let Some(table) = cluster.switches.as_ref() else {
        return Err(EvalError::NoLocalityDomain);
    };
    let switches = table.switches.as_slice();
    let switch_cnt = switches.len();
    let nr = ctx.nr_nodes();

    let gres_per_job = ctx.gres_init();
    let mut tally = Tally::new(ctx.job, ctx.min_nodes, ctx.req_nodes, gres_per_job);
    let req_mask = ctx.job.req_node_mask.clone();
    let mut req_node_cnt = 0u32;
    if let Some(rm) = &req_mask {
        req_node_cnt = validate_required(ctx, rm)?;
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
    log_weight_buckets(cluster, &buckets);

    // Identify the top-level switch. Nodes can live on multiple
    // non-overlapping switches.
    let mut scratch = SwitchScratch {
        node_mask: Vec::with_capacity(switch_cnt),
        node_cnt: vec![0; switch_cnt],
        cpu_cnt: vec![0; switch_cnt],
        required: vec![false; switch_cnt],
    };
    let mut top_switch_inx: Option<usize> = None;
    let mut top_switch_lowest_weight = 0u64;
    for (i, sw) in switches.iter().enumerate() {
        let mask = sw.node_mask.and(ctx.node_map);
        scratch.node_cnt[i] = mask.weight() as i32;
        scratch.cpu_cnt[i] = mask
            .iter()
            .map(|j| ctx.avail_res[j].avail_cpus as i64)
            .sum();
        if let Some(rm) = &req_mask {
            if rm.overlaps(&mask) {
                scratch.required[i] = true;
                if top_switch_inx.map_or(true, |t| sw.level > switches[t].level) {
                    top_switch_inx = Some(i);
                }
            }
        }
        let capacity_ok = enough_nodes(
            scratch.node_cnt[i],
            tally.rem_nodes,
            ctx.min_nodes,
            ctx.req_nodes,
        ) && tally.rem_cpus <= scratch.cpu_cnt[i];
        if capacity_ok && req_mask.is_none() {
            if let Some(bucket) = buckets.iter().find(|b| b.node_mask.overlaps(&mask)) {
                if top_switch_inx.map_or(true, |t| {
                    sw.level >= switches[t].level && bucket.weight <= top_switch_lowest_weight
                }) {
                    top_switch_inx = Some(i);
                    top_switch_lowest_weight = bucket.weight;
                }
            }
        }
        scratch.node_mask.push(mask);
    }

    if req_mask.is_none() {
        ctx.node_map.clear_all();
    }

    // No single switch covers the request; likely a disjoint topology with
    // the candidates spread over unconnected fabrics.
    let Some(top_switch_inx) = top_switch_inx else {
        debug!(
            "job {} unable to identify top level switch",
            ctx.job.job_id
        );
        return Err(EvalError::NoLocalityDomain);
    };

    if let Some(rm) = &req_mask {
        if !rm.is_subset_of(&scratch.node_mask[top_switch_inx]) {
            info!(
                "job {} requires nodes that do not have shared network",
                ctx.job.job_id
            );
            return Err(EvalError::SplitLocality);
        }
    }

    // Drop nodes unreachable from the top switch.
    let top_mask = scratch.node_mask[top_switch_inx].clone();
    for (i, mask) in scratch.node_mask.iter_mut().enumerate() {
        if i != top_switch_inx {
            *mask &= &top_mask;
        }
    }

    let start_rem_cpus = tally.rem_cpus;
    let start_rem_max_cpus = tally.rem_max_cpus;
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
    }

    // Snapshots for the relax-and-retry loop.
    let start_node_map = ctx.node_map.clone();
    let req_switch_required = scratch.required.clone();
    let start_switch_node_mask = scratch.node_mask.clone();
    let org_max_nodes = ctx.max_nodes;
    let mut sufficient = false;

    loop {
        let rc = tree_attempt(
            ctx,
            switches,
            &mut scratch,
            &mut avail_cpu_per_node,
            &mut buckets,
            &mut tally,
            &mut sufficient,
            gres_per_job,
            top_switch_inx,
            req_mask.as_ref(),
        );

        if ctx.job.req_switch > 0 && rc.is_ok() {
            let mut leaf_switch_count = 0u32;
            for (i, sw) in switches.iter().enumerate() {
                if sw.level != 0 {
                    continue;
                }
                if scratch.node_mask[i].overlaps(ctx.node_map) {
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
                if ctx.req_nodes > ctx.min_nodes {
                    // Relax the preferred node count and try for a tighter
                    // topology from the pre-selection snapshots.
                    ctx.req_nodes -= 1;
                    tally.rem_nodes = ctx.req_nodes as i32 - req_node_cnt as i32;
                    tally.min_rem_nodes = ctx.min_nodes as i32 - req_node_cnt as i32;
                    ctx.max_nodes = org_max_nodes.saturating_sub(req_node_cnt);
                    tally.rem_cpus = start_rem_cpus;
                    tally.rem_max_cpus = start_rem_max_cpus;
                    ctx.node_map.copy_from(&start_node_map);
                    scratch.required.copy_from_slice(&req_switch_required);
                    avail_cpu_per_node.fill(0);
                    for (mask, start) in scratch
                        .node_mask
                        .iter_mut()
                        .zip(start_switch_node_mask.iter())
                    {
                        mask.copy_from(start);
                    }
                    debug!(
                        "job {} retrying with req_nodes {}",
                        ctx.job.job_id, ctx.req_nodes
                    );
                    continue;
                }
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

        return rc;
    }
}

#[allow(clippy::too_many_arguments)]
fn tree_attempt(
    ctx: &mut EvalContext,
    switches: &[SwitchRecord],
    scratch: &mut SwitchScratch,
    avail_cpu_per_node: &mut [u16],
    buckets: &mut [WeightBucket],
    tally: &mut Tally,
    sufficient: &mut bool,
    gres_per_job: bool,
    top_switch_inx: usize,
    req_mask: Option<&NodeMask>,
) -> Result<(), EvalError> {
    let cluster = ctx.cluster;
    let nr = ctx.nr_nodes();
    let switch_cnt = switches.len();

    // Identify the best node pool: the required nodes plus the lowest
    // weights that can satisfy the request, all under one top switch.
    // Whole weight buckets are taken, so the pool usually overshoots; the
    // distance logic later selects the best topology from it.
    let mut requested = false;
    let mut best_node_cnt = 0i32;
    let mut best_cpu_cnt = 0i64;
    let mut best_nodes = NodeMask::new(nr);
    let mut best_gres: Option<GresAccum> = None;
    let mut req2_nodes: Option<NodeMask> = None;
    for bucket in buckets.iter_mut() {
        if requested {
            break;
        }
        if best_node_cnt > 0 {
            // Lower-weight buckets join the allocation outright; this
            // bucket's nodes join only as needed.
            match &mut req2_nodes {
                Some(r2) => *r2 |= &best_nodes,
                None => req2_nodes = Some(best_nodes.clone()),
            }
        }
        if bucket.node_mask.is_empty() {
            continue;
        }
        let candidates: Vec<usize> = bucket.node_mask.iter().collect();
        for i in candidates {
            if req_mask.map_or(false, |m| m.test_node(i)) {
                continue; // required node
            }
            if !scratch.node_mask[top_switch_inx].test_node(i) {
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

        if !*sufficient {
            *sufficient = best_cpu_cnt >= tally.rem_cpus
                && enough_nodes(best_node_cnt, tally.rem_nodes, ctx.min_nodes, ctx.req_nodes);
            if *sufficient && gres_per_job {
                *sufficient = ctx.gres.sufficient(&ctx.job.gres_req, best_gres.as_ref());
            }
        }
        requested = best_node_cnt >= tally.rem_nodes
            && best_cpu_cnt >= tally.rem_cpus
            && (!gres_per_job || ctx.gres.sufficient(&ctx.job.gres_req, best_gres.as_ref()));
    }

    if log_enabled!(Level::Debug) {
        if let Some(rm) = req_mask {
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
    if !*sufficient {
        debug!(
            "insufficient resources currently available for job {}",
            ctx.job.job_id
        );
        return Err(EvalError::Insufficient);
    }

    // Absorb the promoted low-weight nodes as if required.
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
            ctx.commit_node(i, tally);
        }

        for (i, required) in scratch.required.iter_mut().enumerate() {
            if *required {
                continue;
            }
            if req2.overlaps(&scratch.node_mask[i]) {
                *required = true;
            }
        }
        *ctx.node_map |= &req2;

        if tally.drained() && (!gres_per_job || ctx.gres_test()) {
            error!("Scheduling anomaly for job {}", ctx.job.job_id);
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            debug!("job {} reached maximum node limit", ctx.job.job_id);
            return Err(EvalError::MaxNodesReached);
        }
    }

    // Rebuild the per-switch views over the identified pool.
    best_nodes |= &*ctx.node_map;
    for (i, mask) in scratch.node_mask.iter_mut().enumerate() {
        *mask &= &best_nodes;
        scratch.node_cnt[i] = mask.weight() as i32;
    }

    if log_enabled!(Level::Debug) {
        for (i, sw) in switches.iter().enumerate() {
            debug!(
                "switch={} level={} nodes={}:{} required:{}",
                sw.name,
                sw.level,
                scratch.node_cnt[i],
                nodelist_str(cluster, &scratch.node_mask[i]),
                scratch.required[i]
            );
        }
    }

    // Top off the leaf switches that already hold required nodes.
    if req_mask.is_some() || req2_nodes.is_some() {
        for i in 0..switch_cnt {
            if !scratch.required[i] || switches[i].level != 0 {
                continue;
            }
            let members: Vec<usize> = scratch.node_mask[i].iter().collect();
            for j in members {
                if ctx.node_map.test_node(j) || avail_cpu_per_node[j] == 0 {
                    continue;
                }
                ctx.avail_cpus = avail_cpu_per_node[j];
                ctx.cpus_to_use(j, tally.rem_max_cpus, tally.min_rem_nodes);
                if gres_per_job {
                    ctx.gres_add(j);
                }
                ctx.commit_node(j, tally);
                let _ = ctx.node_map.set_node(j);
                if tally.drained() && (!gres_per_job || ctx.gres_test()) {
                    return Ok(());
                }
            }
        }
    }

    // Add leaves by topological distance from the switches in use.
    let mut switches_dist = vec![0u32; switch_cnt];
    for i in 0..switch_cnt {
        if scratch.required[i] {
            topo_add_dist(&mut switches_dist, switches, i);
        }
    }
    let mut prev_rem_nodes = tally.rem_nodes + 1;
    loop {
        if prev_rem_nodes == tally.rem_nodes {
            break; // stalled
        }
        prev_rem_nodes = tally.rem_nodes;

        let mut best_switch_inx: Option<usize> = None;
        for i in 0..switch_cnt {
            if scratch.required[i] || switches[i].level != 0 {
                continue;
            }
            choose_best_switch(
                &switches_dist,
                &scratch.node_cnt,
                tally.rem_nodes,
                &scratch.cpu_cnt,
                tally.rem_cpus,
                i,
                &mut best_switch_inx,
                switches,
            );
        }
        let Some(best) = best_switch_inx else { break };

        topo_add_dist(&mut switches_dist, switches, best);
        // Nodes join in bitmap order; ordering by resource availability
        // would be better but costs more than it saves.
        let members: Vec<usize> = scratch.node_mask[best].iter().collect();
        for i in members {
            if ctx.max_nodes == 0 {
                break;
            }
            if ctx.node_map.test_node(i) || avail_cpu_per_node[i] == 0 {
                continue;
            }
            ctx.avail_cpus = avail_cpu_per_node[i];
            ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
            if gres_per_job {
                ctx.gres_add(i);
            }
            ctx.commit_node(i, tally);
            let _ = ctx.node_map.set_node(i);
            if tally.drained() && (!gres_per_job || ctx.gres_test()) {
                return Ok(());
            }
        }
        scratch.node_cnt[best] = 0; // used all
    }

    if tally.min_drained() && (!gres_per_job || ctx.gres_test()) {
        return Ok(());
    }
    Err(EvalError::Insufficient)
}

/// Accumulate the distance row of switch `inx` into `dist`, saturating at
/// infinity.
fn topo_add_dist(dist: &mut [u32], switches: &[SwitchRecord], inx: usize) {
    for (i, d) in dist.iter_mut().enumerate() {
        if switches[inx].dist[i] == DIST_INFINITE || *d == DIST_INFINITE {
            *d = DIST_INFINITE;
        } else {
            *d += switches[inx].dist[i];
        }
    }
}

/// Rank switch `i` against switch `j`: 1 when `i` is the better pick, -1
/// when `j` is, 0 for a dead tie. A switch that fits the whole remaining
/// request beats one that does not; among fitting switches fewer nodes
/// wins (tightest fit), among non-fitting more nodes wins. Ties walk up the
/// parent ladder, then fall back to node count and level.
#[allow(clippy::too_many_arguments)]
fn compare_switches(
    mut i: usize,
    mut j: usize,
    rem_nodes: i32,
    switch_node_cnt: &[i32],
    rem_cpus: i64,
    switch_cpu_cnt: &[i64],
    switches: &[SwitchRecord],
) -> i32 {
    loop {
        let i_fit = switch_node_cnt[i] >= rem_nodes && switch_cpu_cnt[i] >= rem_cpus;
        let j_fit = switch_node_cnt[j] >= rem_nodes && switch_cpu_cnt[j] >= rem_cpus;
        if i_fit && j_fit {
            if switch_node_cnt[i] < switch_node_cnt[j] {
                return 1;
            }
            if switch_node_cnt[i] > switch_node_cnt[j] {
                return -1;
            }
            break;
        } else if i_fit {
            return 1;
        } else if j_fit {
            return -1;
        }

        if (switches[i].parent != i || switches[j].parent != j)
            && switches[i].parent != switches[j].parent
        {
            i = switches[i].parent;
            j = switches[j].parent;
            continue;
        }

        break;
    }

    if switch_node_cnt[i] > switch_node_cnt[j] {
        return 1;
    }
    if switch_node_cnt[i] < switch_node_cnt[j] {
        return -1;
    }
    if switches[i].level < switches[j].level {
        return 1;
    }
    if switches[i].level > switches[j].level {
        return -1;
    }
    0
}

/// Consider switch `i` as the next leaf: closer by accumulated distance
/// wins outright, equal distance defers to `compare_switches`. Unreachable
/// or empty switches never win.
#[allow(clippy::too_many_arguments)]
fn choose_best_switch(
    dist: &[u32],
    switch_node_cnt: &[i32],
    rem_nodes: i32,
    switch_cpu_cnt: &[i64],
    rem_cpus: i64,
    i: usize,
    best_switch: &mut Option<usize>,
    switches: &[SwitchRecord],
) {
    if best_switch.is_none() || dist[i] == DIST_INFINITE || switch_node_cnt[i] == 0 {
        if switch_node_cnt[i] != 0 && dist[i] < DIST_INFINITE {
            *best_switch = Some(i);
        }
        return;
    }
    let best = best_switch.unwrap();

    let tcs = compare_switches(
        i,
        best,
        rem_nodes,
        switch_node_cnt,
        rem_cpus,
        switch_cpu_cnt,
        switches,
    );
    if (dist[i] < dist[best] && tcs >= 0) || (dist[i] == dist[best] && tcs > 0) {
        // Closer and fits the request, or same distance and tighter fit.
        *best_switch = Some(i);
    }
}
