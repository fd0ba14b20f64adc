//! Depth-first batch planning for address mode.
//!
//! Addresses are grouped by depth, sorted within each depth, and cut into
//! batches of at most `K` consecutive siblings. Depths are visited deepest
//! first so that every child batch is submitted before any batch that could
//! contain its parent.
//!
//! # Invariants
//!
//! - [INV-PLN-001] Every input address appears in exactly one batch.
//! - [INV-PLN-002] No batch is empty or larger than `K`.
//! - [INV-PLN-003] All members of a batch share one depth.
//! - [INV-PLN-004] The same input set always yields the same plan.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::hierarchy::Address;

/// A group of same-depth addresses submitted as one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    depth: usize,
    members: Vec<Address>,
}

impl Batch {
    /// Depth shared by every member.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// The batch members, in positional order.
    #[must_use]
    pub fn members(&self) -> &[Address] {
        &self.members
    }

    /// Members rendered as strings.
    #[must_use]
    pub fn member_ids(&self) -> Vec<String> {
        self.members.iter().map(ToString::to_string).collect()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for planned batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Batches keyed by depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepthPlan {
    levels: BTreeMap<usize, Vec<Batch>>,
}

impl DepthPlan {
    /// Levels in the order they must be dispatched: deepest first.
    pub fn levels(&self) -> impl Iterator<Item = (usize, &[Batch])> {
        self.levels
            .iter()
            .rev()
            .map(|(depth, batches)| (*depth, batches.as_slice()))
    }

    /// Every batch in dispatch order.
    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.levels().flat_map(|(_, batches)| batches.iter())
    }

    /// Total number of batches.
    #[must_use]
    pub fn batch_count(&self) -> usize {
        self.levels.values().map(Vec::len).sum()
    }

    /// Whether the plan has no batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Shorter addresses first, then lexicographic. Addresses carry no leading
/// zeros, so this is numeric order.
fn sibling_order(a: &Address, b: &Address) -> Ordering {
    a.as_str()
        .len()
        .cmp(&b.as_str().len())
        .then_with(|| a.as_str().cmp(b.as_str()))
}

/// Plan `addresses` into batches of at most `batch_size`.
///
/// A `batch_size` of zero is rejected by configuration validation; here it
/// is treated as one so the function stays total.
#[must_use]
pub fn plan(addresses: &[Address], batch_size: usize) -> DepthPlan {
    let batch_size = batch_size.max(1);

    let mut by_depth: BTreeMap<usize, Vec<Address>> = BTreeMap::new();
    for address in addresses {
        by_depth.entry(address.depth()).or_default().push(address.clone());
    }

    let levels = by_depth
        .into_iter()
        .map(|(depth, mut group)| {
            group.sort_by(sibling_order);
            group.dedup();
            let batches = group
                .chunks(batch_size)
                .map(|chunk| Batch {
                    depth,
                    members: chunk.to_vec(),
                })
                .collect();
            (depth, batches)
        })
        .collect();

    DepthPlan { levels }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    fn addrs(raw: &[&str]) -> Vec<Address> {
        raw.iter().map(|r| Address::parse(r).unwrap()).collect()
    }

    fn ids(batch: &Batch) -> Vec<&str> {
        batch.members().iter().map(Address::as_str).collect()
    }

    #[test]
    fn test_small_octree_plan() {
        let plan = plan(&addrs(&["0", "1", "11", "12"]), 7);
        let levels: Vec<_> = plan.levels().collect();

        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].0, 2);
        assert_eq!(ids(&levels[0].1[0]), vec!["11", "12"]);
        assert_eq!(levels[1].0, 1);
        assert_eq!(ids(&levels[1].1[0]), vec!["1"]);
        assert_eq!(levels[2].0, 0);
        assert_eq!(ids(&levels[2].1[0]), vec!["0"]);
    }

    #[test]
    fn test_root_never_shares_batch_with_children() {
        let plan = plan(&addrs(&["3", "0", "1", "2"]), 7);
        let batches: Vec<_> = plan.batches().collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(ids(batches[0]), vec!["1", "2", "3"]);
        assert_eq!(ids(batches[1]), vec!["0"]);
    }

    #[test]
    fn test_chunking_and_numeric_order() {
        let raw: Vec<String> = (10..=25).rev().map(|n| n.to_string()).collect();
        let raw: Vec<&str> = raw.iter().map(String::as_str).collect();
        let plan = plan(&addrs(&raw), 7);

        let sizes: Vec<_> = plan.batches().map(Batch::len).collect();
        assert_eq!(sizes, vec![7, 7, 2]);
        let first = plan.batches().next().unwrap();
        assert_eq!(ids(first), vec!["10", "11", "12", "13", "14", "15", "16"]);
        assert_eq!(plan.batch_count(), 3);
    }

    #[test]
    fn test_empty_input() {
        let plan = plan(&[], 7);
        assert!(plan.is_empty());
        assert_eq!(plan.batches().count(), 0);
    }

    fn address_strategy() -> impl Strategy<Value = Address> {
        prop_oneof![
            Just(Address::parse("0").unwrap()),
            "[1-9][0-9]{0,5}".prop_map(|s| Address::parse(&s).unwrap()),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Property: batches partition the input, respect the size bound,
        /// are depth-homogeneous, and arrive deepest first.
        #[test]
        fn prop_plan_partitions_input(
            input in prop::collection::vec(address_strategy(), 0..80),
            k in 1usize..10,
        ) {
            let plan = plan(&input, k);

            let mut seen = HashSet::new();
            let mut last_depth = usize::MAX;
            for batch in plan.batches() {
                prop_assert!(!batch.is_empty());
                prop_assert!(batch.len() <= k);
                prop_assert!(batch.depth() <= last_depth);
                last_depth = batch.depth();
                for member in batch.members() {
                    prop_assert_eq!(member.depth(), batch.depth());
                    prop_assert!(seen.insert(member.clone()));
                }
            }

            let distinct: HashSet<_> = input.iter().cloned().collect();
            prop_assert_eq!(seen, distinct);
            prop_assert_eq!(plan.clone(), super::plan(&input, k));
        }
    }
}
