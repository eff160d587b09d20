use crate::packet::TcpSegment;
use smoltcp::wire::EthernetAddress;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Switch-side rule idle timeout, seconds. Rules for dead connections fall
/// out of the flow table quickly; the controller-side memory below carries
/// the binding across re-appearances.
pub(crate) const FLOW_IDLE_TIMEOUT: u16 = 10;
/// Controller-side recall of a client/backend binding.
pub(crate) const FLOW_MEMORY_TIMEOUT: Duration = Duration::from_secs(300);
/// Period over which the whole backend pool is probed once.
pub(crate) const PROBE_CYCLE: Duration = Duration::from_secs(5);
/// How long an ARP reply may take before the backend counts as dead.
pub(crate) const ARP_DEADLINE: Duration = Duration::from_secs(3);
/// Floor between consecutive probes, at most four per second.
pub(crate) const MIN_PROBE_GAP: Duration = Duration::from_millis(250);

/// What the live-set knows about a reachable backend: where its ARP reply
/// came from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LiveEntry {
    pub mac: EthernetAddress,
    pub port: u16,
}

/// Directed TCP flow identity.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Debug)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn of_segment(segment: &TcpSegment) -> Self {
        Self {
            src_ip: segment.src_ip,
            dst_ip: segment.dst_ip,
            src_port: segment.src_port,
            dst_port: segment.dst_port,
        }
    }
}

/// One remembered client/backend binding, reachable under both flow
/// directions.
#[derive(Clone, Debug)]
pub(crate) struct MemoryEntry {
    pub backend: Ipv4Addr,
    /// Switch ingress port the client's traffic arrives on.
    pub client_port: u16,
    pub key_fwd: FlowKey,
    pub key_rev: FlowKey,
    pub deadline: Duration,
}

impl MemoryEntry {
    /// Derives both directed keys from the packet that triggered the
    /// selection: forward is the packet's own 4-tuple, reverse is what the
    /// backend's answer will look like before rewriting.
    pub fn new(backend: Ipv4Addr, segment: &TcpSegment, client_port: u16, now: Duration) -> Self {
        Self {
            backend,
            client_port,
            key_fwd: FlowKey::of_segment(segment),
            key_rev: FlowKey {
                src_ip: backend,
                dst_ip: segment.src_ip,
                src_port: segment.dst_port,
                dst_port: segment.src_port,
            },
            deadline: now + FLOW_MEMORY_TIMEOUT,
        }
    }

    pub fn refresh(&mut self, now: Duration) {
        self.deadline = now + FLOW_MEMORY_TIMEOUT;
    }

    pub fn is_expired(&self, now: Duration) -> bool {
        now > self.deadline
    }
}

/// Flow memory: every live entry is indexed under its forward and reverse
/// keys, and both indices always point at the same record. Entries are
/// stored once under a private id so removal (expiry or supersession) drops
/// both keys atomically.
#[derive(Default)]
pub(crate) struct FlowMemory {
    entries: HashMap<u64, MemoryEntry>,
    keys: HashMap<FlowKey, u64>,
    next_id: u64,
}

impl FlowMemory {
    pub fn insert(&mut self, entry: MemoryEntry) {
        let id = self.next_id;
        self.next_id += 1;
        for key in [entry.key_fwd, entry.key_rev] {
            if let Some(old) = self.keys.insert(key, id) {
                if old != id {
                    self.remove_id(old);
                }
            }
        }
        self.entries.insert(id, entry);
    }

    pub fn get(&self, key: &FlowKey) -> Option<&MemoryEntry> {
        let id = self.keys.get(key)?;
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, key: &FlowKey) -> Option<&mut MemoryEntry> {
        let id = *self.keys.get(key)?;
        self.entries.get_mut(&id)
    }

    /// Removes every expired entry, both keys at once. Returns how many
    /// entries were dropped.
    pub fn expire_sweep(&mut self, now: Duration) -> usize {
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.remove_id(*id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove_id(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            for key in [entry.key_fwd, entry.key_rev] {
                if self.keys.get(&key) == Some(&id) {
                    self.keys.remove(&key);
                }
            }
        }
    }
}

/// Running totals for observability; copied out under the balancer lock.
#[derive(Clone, Copy, Default, Debug)]
pub struct BalancerCounters {
    pub probes_sent: u64,
    pub servers_up: u64,
    pub servers_down: u64,
    pub flows_directed: u64,
    pub flows_expired: u64,
    pub drops_no_backend: u64,
    pub drops_unmatched_return: u64,
    pub drops_unclassified: u64,
}
