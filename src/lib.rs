// SPDX-License-Identifier: GPL-2.0

//! # Node selection core for batch workloads
//!
//! Given one job's resource request and a bitmap of candidate compute
//! nodes, pick the subset of nodes (and the CPU count to charge on each)
//! that satisfies the request while honoring node weights, generic-resource
//! constraints, and the cluster's switch or block topology.
//!
//! The single entry point is [`eval_nodes`], which routes the request to
//! one of the selection strategies - spread, busy-first, least-loaded,
//! serial packing, consecutive-runs best-fit, dragonfly, switch tree, or
//! block topology - based on the job's flags and the cluster configuration.
//! All strategies operate over the same [`EvalContext`] and share the
//! weight-bucketing and per-node CPU pricing primitives.
//!
//! The core is a pure function over the passed-in context: it performs no
//! I/O, keeps no state between calls, and is deterministic for a given
//! input. Callers provide the cluster tables ([`ClusterState`]) and a GRES
//! subsystem ([`GresSched`]); everything else happens in memory on the
//! caller's thread.
//!
//!```no_run
//!     use nodesel::{eval_nodes, EvalContext};
//!
//!     # fn demo(mut ctx: EvalContext) {
//!     match eval_nodes(&mut ctx) {
//!         Ok(()) => {
//!             // ctx.node_map now holds the selected nodes and each
//!             // selected avail_res entry the chosen CPU count.
//!         }
//!         Err(e) => {
//!             // No valid selection; discard the bitmap contents.
//!             eprintln!("selection failed: {e}");
//!         }
//!     }
//!     # }
//!```

mod nodemask;
pub use nodemask::NodeMask;

mod job;
pub use job::JobRequest;
pub use job::McLayout;
pub use job::Partition;

mod cluster;
pub use cluster::AvailRes;
pub use cluster::ClusterState;
pub use cluster::NodeRecord;
pub use cluster::Tunables;

mod gres;
pub use gres::CountingGres;
pub use gres::GresAccum;
pub use gres::GresRequest;
pub use gres::GresSched;
pub use gres::GresSpec;
pub use gres::SockFilterArgs;
pub use gres::SockGres;

mod topology;
pub use topology::BlockRecord;
pub use topology::BlockTable;
pub use topology::SwitchRecord;
pub use topology::SwitchTable;
pub use topology::DIST_INFINITE;

mod eval;
pub use eval::eval_nodes;
pub use eval::CresSelect;
pub use eval::EvalContext;
pub use eval::EvalError;

mod block;
mod consec;
mod dfly;
mod linear;
mod tree;

#[cfg(test)]
pub(crate) mod testutil;
