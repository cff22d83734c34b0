// SPDX-License-Identifier: GPL-2.0

//! # Fabric topology tables
//!
//! Two topology models feed the selection core:
//!
//! - A switch tree: a flat arena of `SwitchRecord`s addressed by index, each
//!   carrying its level (0 = leaf), a parent index (self-parented at the
//!   root), the bitmap of nodes reachable through it, and a per-switch
//!   distance row. Algorithms never chase pointers, only indices.
//! - A block table: a flat list of base blocks plus the set of legal
//!   power-of-two group sizes. Selection happens within one group.
//!
//! Both tables are built by the caller and read-stable during a call.

use crate::nodemask::NodeMask;

/// Distance sentinel for unreachable switch pairs. Accumulation saturates:
/// infinite plus anything stays infinite.
pub const DIST_INFINITE: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub struct SwitchRecord {
    pub name: String,
    /// 0 for leaf switches directly attached to nodes.
    pub level: u16,
    /// Index of the parent switch; the root parents itself.
    pub parent: usize,
    /// All nodes transitively reachable through this switch.
    pub node_mask: NodeMask,
    pub link_speed: u32,
    /// Hop distance to every other switch, `DIST_INFINITE` when unreachable.
    /// Filled in by `SwitchTable::new`.
    pub dist: Vec<u32>,
}

impl SwitchRecord {
    pub fn new(name: &str, level: u16, parent: usize, node_mask: NodeMask) -> Self {
        Self {
            name: name.to_string(),
            level,
            parent,
            node_mask,
            link_speed: 1,
            dist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwitchTable {
    pub switches: Vec<SwitchRecord>,
}

impl SwitchTable {
    /// Build the table and derive the pairwise distance rows from the parent
    /// links: the distance between two switches is the number of tree edges
    /// on the path through their closest common ancestor, or
    /// `DIST_INFINITE` for disjoint trees.
    pub fn new(mut switches: Vec<SwitchRecord>) -> Self {
        let cnt = switches.len();
        for i in 0..cnt {
            let mut row = Vec::with_capacity(cnt);
            for j in 0..cnt {
                row.push(tree_distance(&switches, i, j));
            }
            switches[i].dist = row;
        }
        Self { switches }
    }

    pub fn len(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }
}

fn ancestors(switches: &[SwitchRecord], mut i: usize) -> Vec<usize> {
    let mut path = vec![i];
    while switches[i].parent != i {
        i = switches[i].parent;
        path.push(i);
    }
    path
}

fn tree_distance(switches: &[SwitchRecord], i: usize, j: usize) -> u32 {
    if i == j {
        return 0;
    }
    let up_i = ancestors(switches, i);
    let up_j = ancestors(switches, j);
    for (hops_i, anc) in up_i.iter().enumerate() {
        if let Some(hops_j) = up_j.iter().position(|x| x == anc) {
            return (hops_i + hops_j) as u32;
        }
    }
    DIST_INFINITE
}

/// A leaf unit of the block hierarchy.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    pub name: String,
    pub node_mask: NodeMask,
}

impl BlockRecord {
    pub fn new(name: &str, node_mask: NodeMask) -> Self {
        Self {
            name: name.to_string(),
            node_mask,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BlockTable {
    /// Base blocks, in fabric order. Groups are formed over consecutive
    /// runs of this list.
    pub blocks: Vec<BlockRecord>,
    /// Nodes per base block.
    pub base_block_size: u32,
    /// Bit k set means groups of 2^k base blocks are legal.
    pub levels: u32,
    /// Union of every base block's nodes.
    pub nodes_mask: NodeMask,
}

impl BlockTable {
    pub fn new(blocks: Vec<BlockRecord>, base_block_size: u32, levels: u32, nr_nodes: usize) -> Self {
        let mut nodes_mask = NodeMask::new(nr_nodes);
        for b in &blocks {
            nodes_mask |= &b.node_mask;
        }
        Self {
            blocks,
            base_block_size,
            levels,
            nodes_mask,
        }
    }

    /// First legal block level at or above `level`, if any.
    pub fn first_level_from(&self, level: u32) -> Option<u32> {
        if level >= u32::BITS {
            return None;
        }
        let masked = self.levels >> level;
        if masked == 0 {
            None
        } else {
            Some(level + masked.trailing_zeros())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(list: &str, nr: usize) -> NodeMask {
        NodeMask::from_nodelist(list, nr).unwrap()
    }

    #[test]
    fn test_tree_distance_two_leaves_one_top() {
        // s0, s1 leaves under s2.
        let table = SwitchTable::new(vec![
            SwitchRecord::new("s0", 0, 2, mask("0-1", 4)),
            SwitchRecord::new("s1", 0, 2, mask("2-3", 4)),
            SwitchRecord::new("top", 1, 2, mask("0-3", 4)),
        ]);
        assert_eq!(table.switches[0].dist, vec![0, 2, 1]);
        assert_eq!(table.switches[1].dist, vec![2, 0, 1]);
        assert_eq!(table.switches[2].dist, vec![1, 1, 0]);
    }

    #[test]
    fn test_tree_distance_disjoint() {
        let table = SwitchTable::new(vec![
            SwitchRecord::new("s0", 0, 0, mask("0-1", 4)),
            SwitchRecord::new("s1", 0, 1, mask("2-3", 4)),
        ]);
        assert_eq!(table.switches[0].dist[1], DIST_INFINITE);
    }

    #[test]
    fn test_block_levels() {
        let blocks = vec![
            BlockRecord::new("b0", mask("0-1", 8)),
            BlockRecord::new("b1", mask("2-3", 8)),
            BlockRecord::new("b2", mask("4-5", 8)),
            BlockRecord::new("b3", mask("6-7", 8)),
        ];
        let table = BlockTable::new(blocks, 2, 0b0101, 8);
        assert_eq!(table.nodes_mask.weight(), 8);
        assert_eq!(table.first_level_from(0), Some(0));
        assert_eq!(table.first_level_from(1), Some(2));
        assert_eq!(table.first_level_from(3), None);
    }
}
