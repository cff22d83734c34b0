// SPDX-License-Identifier: GPL-2.0

//! # NodeMask
//!
//! Fixed-width bitmaps over the cluster's node index space, along with the
//! set algebra the selection strategies are built on.
//!
//! Unlike a CPU mask, the width of a NodeMask is a property of the cluster
//! being scheduled, not of the host running the scheduler, so every mask
//! carries its own length and binary operations require equal widths.
//!
//! Masks can be created empty, from a hexadecimal string, or from a node
//! list in range syntax:
//!
//!```
//!     use nodesel::NodeMask;
//!     let empty = NodeMask::new(64);
//!     let from_hex = NodeMask::from_str("0xf0", 64).unwrap();
//!     let from_list = NodeMask::from_nodelist("0-3,9", 64).unwrap();
//!```

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;
use std::ops::BitAndAssign;
use std::ops::BitOrAssign;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeMask {
    mask: BitVec<u64, Lsb0>,
}

impl NodeMask {
    fn check_node(&self, node: usize) -> Result<()> {
        if node >= self.mask.len() {
            bail!("Invalid node {} passed, max {}", node, self.mask.len());
        }

        Ok(())
    }

    /// Build a new empty NodeMask spanning `nr_nodes` indices.
    pub fn new(nr_nodes: usize) -> NodeMask {
        NodeMask {
            mask: bitvec![u64, Lsb0; 0; nr_nodes],
        }
    }

    /// Build a NodeMask with every index set.
    pub fn new_full(nr_nodes: usize) -> NodeMask {
        NodeMask {
            mask: bitvec![u64, Lsb0; 1; nr_nodes],
        }
    }

    /// Build a NodeMask from a hexadecimal string.
    pub fn from_str(mask_str: &str, nr_nodes: usize) -> Result<NodeMask> {
        match mask_str {
            "none" => return Ok(Self::new(nr_nodes)),
            "all" => return Ok(Self::new_full(nr_nodes)),
            _ => {}
        }
        let hex_str = {
            let mut tmp_str = mask_str
                .strip_prefix("0x")
                .unwrap_or(mask_str)
                .replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec = hex::decode(&hex_str)
            .with_context(|| format!("Failed to parse node mask: {mask_str}"))?;

        let mut mask = Self::new(nr_nodes);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                let node = index * 8 + lsb;
                if node >= nr_nodes {
                    bail!(
                        "Found node ({}) in mask ({}) which is larger than the cluster ({})",
                        node,
                        mask_str,
                        nr_nodes
                    );
                }
                mask.mask.set(node, true);
            }
        }

        Ok(mask)
    }

    /// Build a NodeMask from a node list such as "0-3,9,12-15".
    pub fn from_nodelist(nodelist: &str, nr_nodes: usize) -> Result<NodeMask> {
        let mut mask = NodeMask::new(nr_nodes);
        for group in nodelist.trim_end_matches('\0').split(',') {
            let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
                Ok((x, y)) => (x, y),
                Err(_) => match sscanf!(group.trim(), "{usize}") {
                    Ok(x) => (x, x),
                    Err(_) => {
                        bail!("Failed to parse node list {}", group.trim());
                    }
                },
            };
            for i in min..(max + 1) {
                mask.set_node(i)?;
            }
        }

        Ok(mask)
    }

    /// Set a bit in the NodeMask. Returns an error if the index exceeds the
    /// width of the mask.
    pub fn set_node(&mut self, node: usize) -> Result<()> {
        self.check_node(node)?;
        self.mask.set(node, true);
        Ok(())
    }

    /// Clear a bit from the NodeMask. Returns an error if the index exceeds
    /// the width of the mask.
    pub fn clear_node(&mut self, node: usize) -> Result<()> {
        self.check_node(node)?;
        self.mask.set(node, false);
        Ok(())
    }

    /// Test whether the specified bit is set. Out-of-range indices read as
    /// unset.
    pub fn test_node(&self, node: usize) -> bool {
        match self.mask.get(node) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    /// Return true if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// The width of the mask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// Index of the first set bit, if any.
    pub fn first_set(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Index of the last set bit, if any.
    pub fn last_set(&self) -> Option<usize> {
        self.mask.last_one()
    }

    /// Set every bit to 0.
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Overwrite this mask with the contents of another of equal width.
    pub fn copy_from(&mut self, other: &NodeMask) {
        debug_assert_eq!(self.len(), other.len());
        self.mask.copy_from_bitslice(&other.mask);
    }

    /// True if every bit set in `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &NodeMask) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.mask.iter_ones().all(|i| other.mask[i])
    }

    /// True if the two masks share any set bit.
    pub fn overlaps(&self, other: &NodeMask) -> bool {
        debug_assert_eq!(self.len(), other.len());
        self.mask.iter_ones().any(|i| other.mask[i])
    }

    /// Create a NodeMask that is the AND of this mask and another.
    pub fn and(&self, other: &NodeMask) -> NodeMask {
        let mut new = self.clone();
        new &= other;
        new
    }

    /// Create a NodeMask that is the OR of this mask and another.
    pub fn or(&self, other: &NodeMask) -> NodeMask {
        let mut new = self.clone();
        new |= other;
        new
    }

    /// Clear every bit of `self` that is set in `other`.
    pub fn and_not_assign(&mut self, other: &NodeMask) {
        debug_assert_eq!(self.len(), other.len());
        for i in other.mask.iter_ones() {
            self.mask.set(i, false);
        }
    }

    /// Create a NodeMask holding the bits of `self` not set in `other`.
    pub fn and_not(&self, other: &NodeMask) -> NodeMask {
        let mut new = self.clone();
        new.and_not_assign(other);
        new
    }

    /// Iterate over the indices with bits set, in ascending order.
    pub fn iter(&self) -> NodeMaskIterator<'_> {
        NodeMaskIterator {
            mask: self,
            index: 0,
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>, case: char) -> fmt::Result {
        let mut masks: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Throw out possible stray from u64 -> u32.
        masks.truncate(self.len().div_ceil(32).max(1));

        let width = match self.len().div_ceil(4) % 8 {
            0 => 8,
            v => v,
        };
        match case {
            'x' => write!(f, "{:0width$x}", masks.pop().unwrap(), width = width)?,
            'X' => write!(f, "{:0width$X}", masks.pop().unwrap(), width = width)?,
            _ => unreachable!(),
        }

        for submask in masks.iter().rev() {
            match case {
                'x' => write!(f, ",{submask:08x}")?,
                'X' => write!(f, ",{submask:08X}")?,
                _ => unreachable!(),
            }
        }
        Ok(())
    }
}

pub struct NodeMaskIterator<'a> {
    mask: &'a NodeMask,
    index: usize,
}

impl Iterator for NodeMaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.mask.len() {
            let index = self.index;
            self.index += 1;
            if self.mask.test_node(index) {
                return Some(index);
            }
        }

        None
    }
}

impl fmt::Display for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::LowerHex for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'x')
    }
}

impl fmt::UpperHex for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f, 'X')
    }
}

impl BitAndAssign<&Self> for NodeMask {
    fn bitand_assign(&mut self, rhs: &Self) {
        debug_assert_eq!(self.len(), rhs.len());
        self.mask &= &rhs.mask;
    }
}

impl BitOrAssign<&Self> for NodeMask {
    fn bitor_assign(&mut self, rhs: &Self) {
        debug_assert_eq!(self.len(), rhs.len());
        self.mask |= &rhs.mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_test() {
        let mut mask = NodeMask::new(16);
        assert!(!mask.test_node(3));
        mask.set_node(3).unwrap();
        assert!(mask.test_node(3));
        assert_eq!(mask.weight(), 1);
        mask.clear_node(3).unwrap();
        assert!(mask.is_empty());
        assert!(mask.set_node(16).is_err());
    }

    #[test]
    fn test_from_str() {
        let mask = NodeMask::from_str("0xf0", 16).unwrap();
        assert_eq!(mask.weight(), 4);
        assert_eq!(mask.first_set(), Some(4));
        assert_eq!(mask.last_set(), Some(7));
        assert!(NodeMask::from_str("0x100", 8).is_err());
        assert_eq!(NodeMask::from_str("all", 8).unwrap().weight(), 8);
        assert!(NodeMask::from_str("none", 8).unwrap().is_empty());
    }

    #[test]
    fn test_from_nodelist() {
        let mask = NodeMask::from_nodelist("0-3,9", 16).unwrap();
        assert_eq!(mask.weight(), 5);
        assert!(mask.test_node(0));
        assert!(mask.test_node(3));
        assert!(mask.test_node(9));
        assert!(!mask.test_node(4));
        assert!(NodeMask::from_nodelist("0-99", 16).is_err());
    }

    #[test]
    fn test_set_algebra() {
        let a = NodeMask::from_nodelist("0-7", 16).unwrap();
        let b = NodeMask::from_nodelist("4-11", 16).unwrap();
        assert_eq!(a.and(&b).weight(), 4);
        assert_eq!(a.or(&b).weight(), 12);
        let diff = a.and_not(&b);
        assert_eq!(diff.weight(), 4);
        assert_eq!(diff.last_set(), Some(3));
    }

    #[test]
    fn test_subset_overlap() {
        let a = NodeMask::from_nodelist("2-5", 16).unwrap();
        let b = NodeMask::from_nodelist("0-7", 16).unwrap();
        let c = NodeMask::from_nodelist("8-9", 16).unwrap();
        assert!(a.is_subset_of(&b));
        assert!(!b.is_subset_of(&a));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(NodeMask::new(16).is_subset_of(&a));
    }

    #[test]
    fn test_iter_ascending() {
        let mask = NodeMask::from_nodelist("1,5,9", 16).unwrap();
        let got: Vec<usize> = mask.iter().collect();
        assert_eq!(got, vec![1, 5, 9]);
    }
}
