//! Dependency ledger.
//!
//! Tracks, for every discovered node, its parent and the set of job ids the
//! node's own submission must hold on. When a batch is submitted, its job id
//! is recorded against the parent of every member; when the parent's batch
//! is later submitted it reads those ids back as its hold list.
//!
//! # Invariants
//!
//! - [INV-LED-001] Holds are a set. Recording the same job id twice for one
//!   parent leaves the parent's hold set unchanged.
//! - [INV-LED-002] A node's holds are read only after every child batch has
//!   been recorded. The ledger cannot check this; the depth order (address
//!   mode) and the walk join (directory mode) guarantee it.
//! - [INV-LED-003] A node is blocked when any child batch failed or was
//!   skipped. Blocked nodes are never submitted, so no job runs without the
//!   output it depends on.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

use tracing::debug;

use crate::hierarchy::Address;
use crate::submit::JobId;

/// One node's bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerEntry<N> {
    /// The node's parent, `None` for the root.
    pub parent: Option<N>,
    /// Job ids this node's submission waits on.
    pub holds: BTreeSet<JobId>,
    /// Set when a descendant batch could not be submitted.
    pub blocked: bool,
}

/// Node id → {parent, holds} map.
#[derive(Debug, Clone)]
pub struct DependencyLedger<N> {
    entries: HashMap<N, LedgerEntry<N>>,
}

impl<N> Default for DependencyLedger<N> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl DependencyLedger<Address> {
    /// Build a ledger for a discovered address set.
    #[must_use]
    pub fn from_addresses(addresses: &[Address]) -> Self {
        let mut ledger = Self::default();
        for address in addresses {
            ledger.insert(address.clone(), address.parent());
        }
        ledger
    }
}

impl<N> DependencyLedger<N>
where
    N: Eq + Hash + Clone + Debug,
{
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Re-registering keeps accumulated holds.
    pub fn insert(&mut self, node: N, parent: Option<N>) {
        self.entries
            .entry(node)
            .and_modify(|e| e.parent.clone_from(&parent))
            .or_insert_with(|| LedgerEntry {
                parent,
                holds: BTreeSet::new(),
                blocked: false,
            });
    }

    /// Number of registered nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no nodes are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The parent of `node`, if registered and not a root.
    #[must_use]
    pub fn parent(&self, node: &N) -> Option<&N> {
        self.entries.get(node).and_then(|e| e.parent.as_ref())
    }

    /// Record that `job` (which contains `node`) must finish before
    /// `node`'s parent runs.
    ///
    /// Returns `true` if a hold was attached. Roots and nodes whose parent
    /// was never discovered attach nothing.
    pub fn record_hold(&mut self, node: &N, job: JobId) -> bool {
        let Some(parent) = self.parent(node).cloned() else {
            return false;
        };
        match self.entries.get_mut(&parent) {
            Some(entry) => {
                entry.holds.insert(job);
                true
            },
            None => {
                debug!(node = ?node, parent = ?parent, %job, "parent not discovered; hold dropped");
                false
            },
        }
    }

    /// Record `job` against the parent of every member of a batch.
    pub fn record_batch<'a, I>(&mut self, members: I, job: JobId)
    where
        I: IntoIterator<Item = &'a N>,
        N: 'a,
    {
        for member in members {
            self.record_hold(member, job);
        }
    }

    /// The deduplicated hold set for `node`.
    #[must_use]
    pub fn read_holds(&self, node: &N) -> BTreeSet<JobId> {
        self.entries
            .get(node)
            .map(|e| e.holds.clone())
            .unwrap_or_default()
    }

    /// Union of the hold sets of every member of a batch.
    #[must_use]
    pub fn batch_holds<'a, I>(&self, members: I) -> BTreeSet<JobId>
    where
        I: IntoIterator<Item = &'a N>,
        N: 'a,
    {
        let mut holds = BTreeSet::new();
        for member in members {
            if let Some(entry) = self.entries.get(member) {
                holds.extend(entry.holds.iter().copied());
            }
        }
        holds
    }

    /// Mark the parent of every member as blocked.
    pub fn block_parents<'a, I>(&mut self, members: I)
    where
        I: IntoIterator<Item = &'a N>,
        N: 'a,
    {
        for member in members {
            let Some(parent) = self.parent(member).cloned() else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&parent) {
                entry.blocked = true;
            }
        }
    }

    /// Whether `node` has a failed or skipped descendant batch.
    #[must_use]
    pub fn is_blocked(&self, node: &N) -> bool {
        self.entries.get(node).is_some_and(|e| e.blocked)
    }

    /// Whether any member of a batch is blocked.
    #[must_use]
    pub fn batch_blocked<'a, I>(&self, members: I) -> bool
    where
        I: IntoIterator<Item = &'a N>,
        N: 'a,
    {
        members.into_iter().any(|m| self.is_blocked(m))
    }
}
