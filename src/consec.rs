// SPDX-License-Identifier: GPL-2.0

//! Consecutive-runs best-fit selection, the default strategy when no
//! topology table applies.
//!
//! The candidate bitmap is partitioned into maximal runs of same-weight
//! usable nodes (weight splitting is disabled for contiguous jobs, which
//! care about adjacency only). Rounds then rank the surviving runs -
//! required nodes first, then lowest weight, then tightest sufficient fit -
//! and drain the winner into the allocation until the request is satisfied
//! or no usable run remains.

use crate::eval::{enough_nodes, EvalContext, EvalError, Tally};
use crate::gres::GresAccum;
use log::{debug, info, log_enabled, Level};

/// One maximal run of consecutive usable candidates.
#[derive(Debug, Clone, Default)]
struct Run {
    /// CPUs selectable from the run's non-required nodes.
    cpus: i32,
    /// Non-required usable nodes in the run.
    nodes: i32,
    start: usize,
    end: usize,
    /// First required node inside the run, if any.
    req: Option<usize>,
    /// Weight shared by the run's nodes; `None` until the first
    /// non-required node lands.
    weight: Option<u64>,
    gres: Option<GresAccum>,
}

pub(crate) fn eval_nodes_consec(ctx: &mut EvalContext) -> Result<(), EvalError> {
    ctx.avail_cpus = 0;
    let nr = ctx.nr_nodes();
    let gres_per_job = ctx.gres_init();
    let mut tally = Tally::new(ctx.job, ctx.min_nodes, ctx.req_nodes, gres_per_job);
    let mut avail_cpu_per_node = vec![0u16; nr];
    let req_mask = ctx.job.req_node_mask.clone();

    // Required nodes first: determine the resources they provide, then
    // select additional resources from the run table.
    if let Some(req_mask) = &req_mask {
        let arbitrary_tpn = ctx.job.arbitrary_tpn.clone();
        let mut req_seen = 0usize;
        for i in req_mask.iter() {
            if ctx.max_nodes == 0 {
                break;
            }
            ctx.select_cores(i, tally.min_rem_nodes);
            if let Some(tpn) = &arbitrary_tpn {
                let mut req_cpus = tpn[req_seen] as i64;
                req_seen += 1;
                req_cpus *= ctx.mc.cpus_per_task.max(1) as i64;
                req_cpus = req_cpus
                    .max(ctx.job.pn_min_cpus as i64)
                    .max(ctx.job.min_gres_cpu as i64);

                if (ctx.avail_cpus as i64) < req_cpus {
                    debug!(
                        "job {} required node {} needed {} cpus but only has {}",
                        ctx.job.job_id, ctx.cluster.nodes[i].name, req_cpus, ctx.avail_cpus
                    );
                    return Err(EvalError::RequiredNoResources);
                }
                ctx.avail_cpus = req_cpus as u16;
                let res = &mut ctx.avail_res[i];
                res.avail_cpus = ctx.avail_cpus;
                res.avail_res_cnt = res.avail_cpus as u32 + res.avail_gpus as u32;
            } else {
                ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
            }
            if gres_per_job {
                ctx.gres_add(i);
            }
            if ctx.avail_cpus == 0 {
                debug!(
                    "job {} required node {} lacks available resources",
                    ctx.job.job_id, ctx.cluster.nodes[i].name
                );
                return Err(EvalError::RequiredNoResources);
            }
            avail_cpu_per_node[i] = ctx.avail_cpus;
            ctx.commit_node(i, &mut tally);
        }

        if ctx.satisfied(&tally) {
            *ctx.node_map &= req_mask;
            return Ok(());
        }
        if ctx.max_nodes == 0 {
            return Err(EvalError::MaxNodesReached);
        }
    }

    // Build the run table. A node joins the current run when it is usable;
    // a weight change or an unusable node ends the run.
    let mut runs: Vec<Run> = vec![Run::default()];
    for i in 0..nr {
        let required_node = req_mask.as_ref().map_or(false, |m| m.test_node(i));
        let mut usable = ctx.node_map.test_node(i);
        if usable && !required_node {
            ctx.select_cores(i, tally.min_rem_nodes);
            if ctx.avail_cpus == 0 {
                let _ = ctx.node_map.clear_node(i);
                usable = false;
            }
            avail_cpu_per_node[i] = ctx.avail_cpus;
        }

        // Contiguous jobs ignore weight boundaries.
        let cur = runs.last_mut().unwrap();
        if usable
            && !ctx.job.contiguous
            && cur.weight.is_some()
            && cur.weight != Some(ctx.cluster.nodes[i].sched_weight)
        {
            if cur.nodes == 0 {
                // Only required nodes so far, reuse the record.
                cur.req = None;
            } else {
                cur.end = i - 1;
                runs.push(Run::default());
            }
        }

        let cur = runs.last_mut().unwrap();
        if usable {
            if cur.nodes == 0 {
                cur.start = i;
            }
            if required_node {
                // Resource counters were settled in the loop above; the
                // bitmap bit stays set.
                if cur.req.is_none() {
                    cur.req = Some(i);
                }
                continue;
            }
            let _ = ctx.node_map.clear_node(i);
            cur.cpus += ctx.avail_cpus as i32;
            cur.nodes += 1;
            if gres_per_job {
                ctx.gres.consec(
                    &mut cur.gres,
                    &ctx.job.gres_req,
                    &ctx.avail_res[i].sock_gres,
                );
            }
            cur.weight = Some(ctx.cluster.nodes[i].sched_weight);
        } else if cur.nodes == 0 {
            cur.req = None;
            cur.weight = None;
        } else {
            cur.end = i - 1;
            runs.push(Run::default());
        }
    }
    if runs.last().map_or(false, |r| r.nodes != 0) {
        runs.last_mut().unwrap().end = nr.saturating_sub(1);
    } else {
        runs.pop();
    }

    if log_enabled!(Level::Debug) {
        if runs.is_empty() {
            debug!("no consecutive runs found");
        }
        for (idx, run) in runs.iter().enumerate() {
            debug!(
                "run:{} cpus:{} nodes:{} begin:{} end:{} required:{:?} weight:{:?} gres:{}",
                idx,
                run.cpus,
                run.nodes,
                run.start,
                run.end,
                run.req,
                run.weight,
                ctx.gres.describe(run.gres.as_ref())
            );
        }
    }

    if let Some(max_cpus) = ctx.job.max_cpus {
        if tally.total_cpus > max_cpus as i64 {
            info!(
                "job {} can't use required nodes due to max CPU limit",
                ctx.job.job_id
            );
            return Err(EvalError::MaxCpusExceeded);
        }
    }

    // Accumulate nodes run by run until the request is satisfied.
    let mut success = false;
    while !runs.is_empty() && ctx.max_nodes > 0 {
        let mut best_inx: Option<usize> = None;
        let mut best_fit_cpus = 0i32;
        let mut best_fit_nodes = 0i32;
        let mut best_fit_sufficient = false;
        let mut best_fit_req: Option<usize> = None;
        let mut best_weight = 0u64;
        let mut abandoned = false;

        for idx in 0..runs.len() {
            let run = &runs[idx];
            if run.nodes == 0 {
                continue;
            }
            if ctx.job.contiguous && req_mask.is_some() && run.req.is_none() {
                continue;
            }
            let mut sufficient = (run.cpus as i64 >= tally.rem_cpus)
                && enough_nodes(run.nodes, tally.rem_nodes, ctx.min_nodes, ctx.req_nodes);
            if sufficient && gres_per_job {
                sufficient = ctx.gres.sufficient(&ctx.job.gres_req, run.gres.as_ref());
            }

            // First possibility, or contains required nodes, or lowest
            // weight.
            let mut new_best = best_fit_nodes == 0
                || (best_fit_req.is_none() && run.req.is_some())
                || run.weight.unwrap_or(u64::MAX) < best_weight;
            // At equal weight: first run large enough, or tightest fit, or
            // largest when nothing fits yet.
            if !new_best
                && run.weight == Some(best_weight)
                && ((sufficient && !best_fit_sufficient)
                    || (sufficient && run.cpus < best_fit_cpus)
                    || (!sufficient && run.cpus > best_fit_cpus))
            {
                new_best = true;
            }
            if !new_best && !best_fit_sufficient && ctx.job.contiguous && sufficient {
                new_best = true;
            }
            if new_best {
                best_fit_cpus = run.cpus;
                best_fit_nodes = run.nodes;
                best_inx = Some(idx);
                best_fit_req = run.req;
                best_fit_sufficient = sufficient;
                best_weight = run.weight.unwrap_or(u64::MAX);
            }

            if ctx.job.contiguous && req_mask.is_some() {
                // All required nodes must live in a single run.
                if runs[idx + 1..].iter().any(|r| r.req.is_some()) {
                    abandoned = true;
                    break;
                }
            }
        }
        if abandoned || best_fit_nodes == 0 {
            break;
        }
        let best_inx = best_inx.unwrap();
        if ctx.job.contiguous && !best_fit_sufficient {
            break; // no hole large enough
        }

        if let Some(req_inx) = best_fit_req {
            // The run includes required nodes; fan out from them, first
            // upward then downward.
            let (run_start, run_end) = (runs[best_inx].start, runs[best_inx].end);
            let mut done = false;
            for i in req_inx..=run_end {
                if ctx.max_nodes == 0
                    || (tally.drained() && (!gres_per_job || ctx.gres_test()))
                {
                    done = true;
                    break;
                }
                take_run_node(ctx, &mut tally, &avail_cpu_per_node, gres_per_job, i);
            }
            if !done {
                for i in (run_start..req_inx).rev() {
                    if ctx.max_nodes == 0
                        || (tally.drained() && (!gres_per_job || ctx.gres_test()))
                    {
                        break;
                    }
                    take_run_node(ctx, &mut tally, &avail_cpu_per_node, gres_per_job, i);
                }
            }
        } else {
            let (first, last) = (runs[best_inx].start, runs[best_inx].end);
            if tally.rem_nodes <= 1 {
                // One node left to pick: best-fit it within the run.
                let mut best_fit: Option<usize> = None;
                let mut best_size = 0u16;
                for i in first..=last {
                    if ctx.node_map.test_node(i) {
                        continue;
                    }
                    if (avail_cpu_per_node[i] as i64) < tally.rem_cpus {
                        continue;
                    }
                    if gres_per_job && !node_gres_sufficient(ctx, i) {
                        continue;
                    }
                    if best_fit.is_none() || avail_cpu_per_node[i] < best_size {
                        best_fit = Some(i);
                        best_size = avail_cpu_per_node[i];
                        if best_size as i64 == tally.rem_cpus {
                            break;
                        }
                    }
                }
                // With a single winner, rule the rest of the run out.
                if let Some(best_node) = best_fit {
                    for (i, cpus) in avail_cpu_per_node
                        .iter_mut()
                        .enumerate()
                        .take(last + 1)
                        .skip(first)
                    {
                        if i != best_node {
                            *cpus = 0;
                        }
                    }
                }
            }

            for i in first..=last {
                if ctx.max_nodes == 0
                    || (tally.drained() && (!gres_per_job || ctx.gres_test()))
                {
                    break;
                }
                if ctx.node_map.test_node(i) {
                    continue;
                }
                if avail_cpu_per_node[i] == 0 {
                    continue;
                }
                if ctx.max_nodes == 1 && (avail_cpu_per_node[i] as i64) < tally.rem_cpus {
                    // Only one more node may join and this one cannot
                    // cover the remaining CPUs.
                    continue;
                }
                take_run_node(ctx, &mut tally, &avail_cpu_per_node, gres_per_job, i);
            }
        }

        if tally.drained() && ctx.gres_test() {
            success = true;
            break;
        }
        runs[best_inx].cpus = 0;
        runs[best_inx].nodes = 0;
    }

    if !success
        && tally.rem_cpus <= 0
        && ctx.gres_test()
        && enough_nodes(0, tally.rem_nodes, ctx.min_nodes, ctx.req_nodes)
    {
        success = true;
    }

    if success {
        Ok(())
    } else {
        ctx.node_map.clear_all();
        Err(EvalError::Insufficient)
    }
}

/// Commit one node out of the chosen run. The CPU count may trim to zero
/// here; nodes the user explicitly placed are still granted and the step
/// layout sorts it out later.
fn take_run_node(
    ctx: &mut EvalContext,
    tally: &mut Tally,
    avail_cpu_per_node: &[u16],
    gres_per_job: bool,
    i: usize,
) {
    if ctx.node_map.test_node(i) {
        return;
    }
    if avail_cpu_per_node[i] == 0 {
        return;
    }
    ctx.avail_cpus = avail_cpu_per_node[i];
    ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
    if gres_per_job {
        ctx.gres_add(i);
    }
    ctx.commit_node(i, tally);
    let _ = ctx.node_map.set_node(i);
}

/// Whether this node's own resources could satisfy the remaining GRES.
fn node_gres_sufficient(ctx: &mut EvalContext, i: usize) -> bool {
    let mut one = None;
    ctx.gres.consec(
        &mut one,
        &ctx.job.gres_req,
        &ctx.avail_res[i].sock_gres,
    );
    ctx.gres.sufficient(&ctx.job.gres_req, one.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Fixture;

    // Two runs, [0..2] with 12 CPUs and [4..7] with 16: the only sufficient
    // run wins and the selection stays inside it.
    #[test]
    fn test_best_fit_takes_sufficient_run() {
        let mut fix = Fixture::flat(8, 4).without(3).request(16, 4, 4);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![4, 5, 6, 7]);
        for i in [4, 5, 6, 7] {
            assert_eq!(fix.avail_res[i].avail_cpus, 4);
        }
        assert_eq!(fix.avail_res[3].avail_cpus, 0);
    }

    #[test]
    fn test_tightest_sufficient_run_wins() {
        // Runs [0..1] (8 cpus) and [3..7] (20 cpus); both sufficient for
        // 8 cpus / 2 nodes, the tighter first run wins.
        let mut fix = Fixture::flat(8, 4).without(2).request(8, 2, 2);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![0, 1]);
    }

    #[test]
    fn test_lower_weight_run_wins() {
        let mut fix = Fixture::flat(8, 4)
            .weights(&[30, 30, 30, 30, 5, 5, 5, 5])
            .request(8, 2, 2);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![4, 5]);
    }

    #[test]
    fn test_weight_change_splits_runs() {
        // Same indices stay consecutive but the weight flips at node 2, so
        // [0..1] and [2..3] are distinct runs; the request needs 3 nodes
        // and only both runs together provide them.
        let mut fix = Fixture::flat(4, 4)
            .weights(&[10, 10, 20, 20])
            .request(12, 3, 3);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected().len(), 3);
        assert!(fix.node_map.test_node(0));
        assert!(fix.node_map.test_node(1));
    }

    #[test]
    fn test_required_fan_out() {
        // Required node 5 anchors its run; fill walks up from 5 then down.
        let mut fix = Fixture::flat(8, 4).required("5").request(12, 3, 3);
        assert_eq!(fix.eval(), Ok(()));
        let got = fix.selected();
        assert!(got.contains(&5));
        assert_eq!(got, vec![5, 6, 7]);
    }

    #[test]
    fn test_best_fit_single_node() {
        // One node wanted, 6 CPUs: node 2 (8 cpus) is the tightest fit
        // over node 0 (16) and node 1 (12).
        let mut fix = Fixture::flat(3, 16)
            .avail(0, 16, 16)
            .avail(1, 12, 16)
            .avail(2, 8, 16)
            .request(6, 1, 1);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![2]);
    }

    #[test]
    fn test_contiguous_needs_single_hole() {
        let mut fix = Fixture::flat(8, 4).without(2).request(16, 4, 4);
        fix.job.contiguous = true;
        // [0..1] is too small, [3..7] has the hole.
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_contiguous_no_hole_fails() {
        let mut fix = Fixture::flat(6, 4).without(2).request(24, 6, 6);
        fix.job.contiguous = true;
        assert!(fix.eval().is_err());
        assert!(fix.node_map.is_empty());
    }

    #[test]
    fn test_contiguous_split_required_fails() {
        // Required nodes 0 and 4 sit in different runs.
        let mut fix = Fixture::flat(8, 4)
            .without(2)
            .required("0,4")
            .request(16, 4, 4);
        fix.job.contiguous = true;
        assert!(fix.eval().is_err());
    }

    #[test]
    fn test_arbitrary_tpn_overrides_required_cpus() {
        let mut fix = Fixture::flat(4, 8).required("0,1").request(6, 2, 2);
        fix.job.arbitrary_tpn = Some(vec![2, 4]);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.avail_res[0].avail_cpus, 2);
        assert_eq!(fix.avail_res[1].avail_cpus, 4);
    }

    #[test]
    fn test_arbitrary_tpn_unsatisfiable_fails() {
        let mut fix = Fixture::flat(4, 8).required("0").request(4, 1, 1);
        fix.job.arbitrary_tpn = Some(vec![12]);
        assert_eq!(fix.eval(), Err(EvalError::RequiredNoResources));
    }

    // Accepting fewer nodes than preferred: range 2..4 nodes, CPUs land
    // with 3 nodes, and the shortfall against req stays within the slack.
    #[test]
    fn test_range_request_accepts_shortfall() {
        let mut fix = Fixture::flat(3, 8).request(24, 2, 4);
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected().len(), 3);
    }
}
