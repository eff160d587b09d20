//! Backend generations for rolling upgrades.
//!
//! The pool is partitioned into `non_updated` and `updated`. Operators move
//! backends into `updated` one at a time; once the last backend moves, the
//! updated set becomes the new baseline and the wave can start over. Which
//! service address fronts which partition depends on which side is currently
//! larger, so the two views stay consistent as a wave crosses the midpoint.

use std::collections::HashSet;
use std::net::Ipv4Addr;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum UpdateOutcome {
    /// Address is not one of the balanced backends.
    Unknown,
    AlreadyUpdated,
    Updated,
    /// The move emptied `non_updated`: the partition rolled over and the
    /// previous `updated` set is the new baseline.
    Rolled,
}

#[derive(Debug)]
pub(crate) struct Generation {
    non_updated: HashSet<Ipv4Addr>,
    updated: HashSet<Ipv4Addr>,
}

impl Generation {
    pub fn new(servers: &[Ipv4Addr]) -> Self {
        Self {
            non_updated: servers.iter().copied().collect(),
            updated: HashSet::new(),
        }
    }

    pub fn contains(&self, server: Ipv4Addr) -> bool {
        self.non_updated.contains(&server) || self.updated.contains(&server)
    }

    pub fn is_non_updated(&self, server: Ipv4Addr) -> bool {
        self.non_updated.contains(&server)
    }

    pub fn more_non_updated(&self) -> bool {
        self.non_updated.len() > self.updated.len()
    }

    pub fn mark_updated(&mut self, server: Ipv4Addr) -> UpdateOutcome {
        if !self.contains(server) {
            return UpdateOutcome::Unknown;
        }
        if self.updated.contains(&server) {
            return UpdateOutcome::AlreadyUpdated;
        }
        self.non_updated.remove(&server);
        self.updated.insert(server);
        if self.non_updated.is_empty() {
            // Wave complete: the updated generation is the new baseline.
            std::mem::swap(&mut self.non_updated, &mut self.updated);
            self.updated.clear();
            return UpdateOutcome::Rolled;
        }
        UpdateOutcome::Updated
    }

    /// Service address to present to (or on behalf of) `backend`: used both
    /// as the ARP probe's sender address and as the rewritten source of
    /// return traffic. The larger partition is fronted by `s1`.
    pub fn service_source(&self, backend: Ipv4Addr, s1: Ipv4Addr, s2: Ipv4Addr) -> Ipv4Addr {
        match (self.is_non_updated(backend), self.more_non_updated()) {
            (true, true) | (false, false) => s1,
            (true, false) | (false, true) => s2,
        }
    }

    /// Partition a brand-new flow should draw from, given which service
    /// address it targets. `s1` serves the larger side, `s2` the smaller.
    pub fn forward_pool(&self, toward_s1: bool) -> &HashSet<Ipv4Addr> {
        let updated_wins = if toward_s1 {
            self.updated.len() > self.non_updated.len()
        } else {
            self.updated.len() < self.non_updated.len()
        };
        if updated_wins {
            &self.updated
        } else {
            &self.non_updated
        }
    }

    pub fn non_updated(&self) -> &HashSet<Ipv4Addr> {
        &self.non_updated
    }

    pub fn updated(&self) -> &HashSet<Ipv4Addr> {
        &self.updated
    }
}
