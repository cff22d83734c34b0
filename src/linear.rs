// SPDX-License-Identifier: GPL-2.0

//! Weight-group selection strategies: spread, busy-first, least-loaded and
//! serial packing. All four share one template - absorb the required nodes,
//! then walk the weight buckets in ascending order and pick nodes according
//! to the strategy's inner rule - and differ only in that rule:
//!
//! - spread: forward scan, take any usable node (maximize node count),
//! - serial: reverse scan, to pack 1 CPU / 1 node jobs at the end of the
//!   node list and keep the low end unfragmented,
//! - busy: two passes per bucket, nodes already running work first,
//! - lln: repeatedly take the node with the greatest available-to-total CPU
//!   ratio within the bucket.

use crate::eval::{build_weight_buckets, EvalContext, EvalError, Tally, WeightBucket};
use crate::nodemask::NodeMask;
use log::{debug, info};

struct LinearState {
    tally: Tally,
    gres_per_job: bool,
    orig_node_map: NodeMask,
    /// First/last candidate index at entry; `None` for an empty candidate
    /// set.
    range: Option<(usize, usize)>,
}

enum Prep {
    /// Required nodes alone satisfied the request.
    Done,
    Continue(LinearState),
}

/// The shared template opening: cap the node ceiling by the task count,
/// absorb required nodes, enforce the job CPU ceiling, and split the
/// candidates off into `orig_node_map`.
fn prepare(ctx: &mut EvalContext) -> Result<Prep, EvalError> {
    ctx.avail_cpus = 0;

    if let Some(num_tasks) = ctx.job.num_tasks {
        if num_tasks != 0 {
            ctx.max_nodes = ctx.max_nodes.min(num_tasks);
        }
    }
    let gres_per_job = ctx.gres_init();
    let mut tally = Tally::new(ctx.job, ctx.min_nodes, ctx.req_nodes, gres_per_job);

    let mut orig_node_map = ctx.node_map.clone();
    let range = ctx
        .node_map
        .first_set()
        .map(|start| (start, ctx.node_map.last_set().unwrap()));

    let req_mask = ctx.job.req_node_mask.clone();
    if let Some(req_mask) = req_mask {
        if let Some((i_start, i_end)) = range {
            for i in i_start..=i_end {
                if !req_mask.test_node(i) {
                    let _ = ctx.node_map.clear_node(i);
                    continue;
                }
                if ctx.avail_res[i].avail_cpus == 0 {
                    debug!(
                        "job {} required node {} lacks available resources",
                        ctx.job.job_id, ctx.cluster.nodes[i].name
                    );
                    return Err(EvalError::RequiredNoResources);
                }
                if ctx.max_nodes == 0 {
                    debug!(
                        "job {} requires nodes exceed maximum node limit",
                        ctx.job.job_id
                    );
                    return Err(EvalError::MaxNodesReached);
                }
                ctx.select_cores(i, tally.min_rem_nodes);
                ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
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
                // Leave the bitmap bit set; only the ceiling burns down.
                ctx.commit_node(i, &mut tally);
            }
        }
        if ctx.satisfied(&tally) {
            *ctx.node_map &= &req_mask;
            return Ok(Prep::Done);
        }
        if ctx.max_nodes == 0 {
            return Err(EvalError::MaxNodesReached);
        }
        orig_node_map.and_not_assign(ctx.node_map);
    } else {
        ctx.node_map.clear_all();
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

    Ok(Prep::Continue(LinearState {
        tally,
        gres_per_job,
        orig_node_map,
        range,
    }))
}

/// The shared template closing: success iff the counters drained, clearing
/// the bitmap on failure.
fn finish(ctx: &mut EvalContext, tally: &Tally, success: bool) -> Result<(), EvalError> {
    if success {
        return Ok(());
    }
    if tally.rem_cpus > 0 || tally.min_rem_nodes > 0 || !ctx.gres_test() {
        ctx.node_map.clear_all();
        return Err(EvalError::Insufficient);
    }
    Ok(())
}

/// Select resources using as many nodes as possible.
pub(crate) fn eval_nodes_spread(ctx: &mut EvalContext) -> Result<(), EvalError> {
    let state = match prepare(ctx)? {
        Prep::Done => return Ok(()),
        Prep::Continue(state) => state,
    };
    let LinearState {
        mut tally,
        gres_per_job,
        orig_node_map,
        range,
    } = state;

    let mut all_done = ctx.max_nodes == 0;
    let mut success = false;
    let buckets = build_weight_buckets(ctx.cluster, &orig_node_map);
    'buckets: for bucket in &buckets {
        if all_done {
            break;
        }
        let Some((i_start, i_end)) = range else { break };
        for i in i_start..=i_end {
            if ctx.avail_res[i].avail_cpus == 0 {
                continue;
            }
            if !bucket.node_mask.test_node(i) || ctx.node_map.test_node(i) {
                continue;
            }
            ctx.select_cores(i, tally.min_rem_nodes);
            ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
            if gres_per_job {
                ctx.gres_add(i);
            }
            if ctx.avail_cpus == 0 {
                continue;
            }
            ctx.commit_node(i, &mut tally);
            let _ = ctx.node_map.set_node(i);
            if ctx.satisfied(&tally) {
                success = true;
                break 'buckets;
            }
            if ctx.max_nodes == 0 {
                all_done = true;
                break;
            }
        }
    }

    finish(ctx, &tally, success)
}

/// Select resources at the end of the node list to reduce fragmentation.
pub(crate) fn eval_nodes_serial(ctx: &mut EvalContext) -> Result<(), EvalError> {
    let state = match prepare(ctx)? {
        Prep::Done => return Ok(()),
        Prep::Continue(state) => state,
    };
    let LinearState {
        mut tally,
        gres_per_job,
        orig_node_map,
        range,
    } = state;

    let mut all_done = ctx.max_nodes == 0;
    let mut success = false;
    let buckets = build_weight_buckets(ctx.cluster, &orig_node_map);
    'buckets: for bucket in &buckets {
        if all_done {
            break;
        }
        let Some((i_start, i_end)) = range else { break };
        for i in (i_start..=i_end).rev() {
            if ctx.max_nodes == 0 {
                break 'buckets;
            }
            if ctx.avail_res[i].avail_cpus == 0 {
                continue;
            }
            if !bucket.node_mask.test_node(i) || ctx.node_map.test_node(i) {
                continue;
            }
            ctx.select_cores(i, tally.min_rem_nodes);
            ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
            if ctx.avail_cpus == 0 {
                continue;
            }
            ctx.commit_node(i, &mut tally);
            let _ = ctx.node_map.set_node(i);
            if gres_per_job {
                ctx.gres_add(i);
            }
            if ctx.satisfied(&tally) {
                success = true;
                break 'buckets;
            }
            if ctx.max_nodes == 0 {
                all_done = true;
                break;
            }
        }
    }

    finish(ctx, &tally, success)
}

/// Select resources on busy nodes first so idle resources stay free as long
/// as possible.
pub(crate) fn eval_nodes_busy(ctx: &mut EvalContext) -> Result<(), EvalError> {
    let state = match prepare(ctx)? {
        Prep::Done => return Ok(()),
        Prep::Continue(state) => state,
    };
    let LinearState {
        mut tally,
        gres_per_job,
        orig_node_map,
        range,
    } = state;

    let mut all_done = ctx.max_nodes == 0;
    let mut success = false;
    let buckets = build_weight_buckets(ctx.cluster, &orig_node_map);
    'buckets: for bucket in &buckets {
        // Pass 0 takes nodes that already run work, pass 1 the idle ones.
        for idle_test in 0..2 {
            if all_done {
                break 'buckets;
            }
            let Some((i_start, i_end)) = range else {
                break 'buckets;
            };
            for i in i_start..=i_end {
                if ctx.avail_res[i].avail_cpus == 0 {
                    continue;
                }
                if !bucket.node_mask.test_node(i) || ctx.node_map.test_node(i) {
                    continue;
                }
                let idle = ctx.cluster.idle_nodes.test_node(i);
                if (idle_test == 0 && idle) || (idle_test == 1 && !idle) {
                    continue;
                }
                ctx.select_cores(i, tally.min_rem_nodes);
                ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
                if gres_per_job {
                    ctx.gres_add(i);
                }
                if ctx.avail_cpus == 0 {
                    continue;
                }
                ctx.commit_node(i, &mut tally);
                let _ = ctx.node_map.set_node(i);
                if ctx.satisfied(&tally) {
                    success = true;
                    all_done = true;
                    break;
                }
                if ctx.max_nodes == 0 {
                    all_done = true;
                    break;
                }
            }
        }
    }

    finish(ctx, &tally, success)
}

/// Select the least-loaded node - the greatest ratio of available to total
/// CPUs - within each weight bucket. The ratio comparison cross-multiplies
/// to stay in integers.
pub(crate) fn eval_nodes_lln(ctx: &mut EvalContext) -> Result<(), EvalError> {
    let state = match prepare(ctx)? {
        Prep::Done => return Ok(()),
        Prep::Continue(state) => state,
    };
    let LinearState {
        mut tally,
        gres_per_job,
        orig_node_map,
        range,
    } = state;

    let mut all_done = ctx.max_nodes == 0;
    let mut success = false;
    let buckets = build_weight_buckets(ctx.cluster, &orig_node_map);
    'buckets: for bucket in &buckets {
        if all_done {
            break;
        }
        let mut last_max_cpu_cnt: i64 = -1;
        loop {
            let picked = scan_least_loaded(ctx, bucket, &tally, range, last_max_cpu_cnt);
            let Some((max_cpu_idx, max_cpu_avail_cpus)) = picked else {
                // No more usable nodes at this weight, next bucket.
                break;
            };
            ctx.avail_cpus = max_cpu_avail_cpus;
            if gres_per_job {
                ctx.gres_add(max_cpu_idx);
            }
            last_max_cpu_cnt = ctx.avail_res[max_cpu_idx].max_cpus as i64;
            ctx.commit_node(max_cpu_idx, &mut tally);
            let _ = ctx.node_map.set_node(max_cpu_idx);
            if ctx.satisfied(&tally) {
                success = true;
                break 'buckets;
            }
            if ctx.max_nodes == 0 {
                all_done = true;
                break;
            }
        }
    }

    finish(ctx, &tally, success)
}

/// One least-loaded scan over a bucket. Returns the winning node and its
/// priced CPU count. Stops early when a node matches the previous round's
/// winning total, since no better ratio can follow at this weight.
fn scan_least_loaded(
    ctx: &mut EvalContext,
    bucket: &WeightBucket,
    tally: &Tally,
    range: Option<(usize, usize)>,
    last_max_cpu_cnt: i64,
) -> Option<(usize, u16)> {
    let (i_start, i_end) = range?;
    let mut max_cpu_idx: Option<usize> = None;
    let mut max_cpu_avail_cpus = 0u16;
    for i in i_start..=i_end {
        if !bucket.node_mask.test_node(i) || ctx.node_map.test_node(i) {
            continue;
        }
        ctx.select_cores(i, tally.min_rem_nodes);
        ctx.cpus_to_use(i, tally.rem_max_cpus, tally.min_rem_nodes);
        if ctx.avail_cpus == 0 {
            continue;
        }
        let better = match max_cpu_idx {
            None => true,
            Some(best) => {
                // avail/total ratio comparison with the divisors shifted
                // around to avoid floating point.
                (ctx.avail_res[best].max_cpus as u64 * ctx.cluster.nodes[i].cpus as u64)
                    < (ctx.avail_res[i].max_cpus as u64 * ctx.cluster.nodes[best].cpus as u64)
            }
        };
        if better {
            max_cpu_idx = Some(i);
            max_cpu_avail_cpus = ctx.avail_cpus;
            if ctx.avail_res[i].max_cpus as i64 == last_max_cpu_cnt {
                break;
            }
        }
    }
    match (max_cpu_idx, max_cpu_avail_cpus) {
        (Some(idx), cpus) if cpus > 0 => Some((idx, cpus)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::Fixture;

    #[test]
    fn test_spread_takes_index_order() {
        let mut fix = Fixture::flat(4, 8).request(16, 2, 2);
        fix.job.spread_job = true;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![0, 1]);
        assert_eq!(fix.avail_res[0].avail_cpus, 8);
        assert_eq!(fix.avail_res[1].avail_cpus, 8);
    }

    #[test]
    fn test_spread_prefers_lower_weight_buckets() {
        let mut fix = Fixture::flat(4, 8)
            .weights(&[20, 20, 10, 10])
            .request(16, 2, 2);
        fix.job.spread_job = true;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![2, 3]);
    }

    #[test]
    fn test_spread_skips_depleted_nodes() {
        let mut fix = Fixture::flat(4, 8).avail(0, 0, 8).request(16, 2, 2);
        fix.job.spread_job = true;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![1, 2]);
    }

    #[test]
    fn test_serial_fills_from_high_end() {
        let mut fix = Fixture::flat(4, 8).request(1, 1, 1);
        fix.cluster.tunables.pack_serial_at_end = true;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![3]);
    }

    #[test]
    fn test_busy_prefers_allocated_nodes() {
        let mut fix = Fixture::flat(4, 8).request(16, 2, 2);
        fix.prefer_alloc_nodes = true;
        // Only node 2 currently runs work.
        fix.cluster.idle_nodes = crate::nodemask::NodeMask::from_nodelist("0-1,3", 4).unwrap();
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![0, 2]);
    }

    #[test]
    fn test_busy_all_idle_falls_back_to_index_order() {
        let mut fix = Fixture::flat(4, 8).request(16, 2, 2);
        fix.prefer_alloc_nodes = true;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected(), vec![0, 1]);
    }

    // Four nodes at 8/16 avail/total plus one at 8/8: lln picks the fully
    // free node first, spread takes plain index order.
    #[test]
    fn test_lln_takes_best_ratio_first() {
        let mut fix = Fixture::flat(5, 16)
            .avail(0, 8, 8)
            .avail(1, 8, 8)
            .avail(2, 8, 8)
            .avail(3, 8, 8)
            .avail(4, 8, 8)
            .request(16, 2, 2);
        // Node 4 is 8 CPUs total, fully available.
        fix.cluster.nodes[4] = crate::cluster::NodeRecord::flat("n4", 8, 10);
        fix.cres.lln = true;
        assert_eq!(fix.eval(), Ok(()));
        assert!(fix.selected().contains(&4));
    }

    #[test]
    fn test_lln_partition_flag_routes() {
        let mut fix = Fixture::flat(2, 8).request(8, 1, 1);
        fix.job.partition.lln = true;
        assert_eq!(fix.eval(), Ok(()));
        assert_eq!(fix.selected().len(), 1);
    }

    #[test]
    fn test_required_node_without_resources_fails() {
        let mut fix = Fixture::flat(4, 8)
            .avail(1, 0, 8)
            .required("1")
            .request(8, 1, 1);
        fix.job.spread_job = true;
        assert_eq!(fix.eval(), Err(EvalError::RequiredNoResources));
    }

    #[test]
    fn test_max_cpus_blocks_required() {
        let mut fix = Fixture::flat(4, 8).required("0-1").request(16, 2, 2);
        fix.job.spread_job = true;
        fix.job.max_cpus = Some(1);
        // Even trimmed to the per-node floor, two required nodes exceed the
        // CPU ceiling.
        assert_eq!(fix.eval(), Err(EvalError::MaxCpusExceeded));
    }

    #[test]
    fn test_num_tasks_caps_node_count() {
        let mut fix = Fixture::flat(4, 1).request(4, 4, 4);
        fix.job.num_tasks = Some(2);
        fix.job.spread_job = true;
        // Two tasks cap the allocation at two nodes; four nodes of one CPU
        // each cannot reach 4 CPUs.
        assert!(fix.eval().is_err());
        assert!(fix.node_map.is_empty());
    }
}
