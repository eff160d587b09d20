//! Switch channel shared between the balancer core and the OpenFlow
//! transport. Both directions are bounded rings: the transport pushes
//! packet-in events and drains control messages without ever borrowing the
//! core mutably. When a ring is full the oldest item is dropped.

use crate::openflow::SwitchMsg;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

pub const QUEUE_CAPACITY: usize = 256;

/// One packet-in event as delivered by the switch.
#[derive(Clone, Debug)]
pub struct PacketIn {
    pub in_port: u16,
    /// Switch-side buffer holding the frame, if the switch kept one.
    pub buffer_id: Option<u32>,
    pub frame: Vec<u8>,
}

struct SharedQueues {
    inbound: VecDeque<PacketIn>,
    outbound: VecDeque<SwitchMsg>,
    capacity: usize,
}

impl SharedQueues {
    fn new(capacity: usize) -> Self {
        Self {
            inbound: VecDeque::with_capacity(capacity),
            outbound: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

/// Core-side end: the balancer sends control messages and pops packet-ins.
pub struct SwitchConn {
    inner: Arc<Mutex<SharedQueues>>,
    wake: Arc<Notify>,
    dpid: u64,
    mac: EthernetAddress,
}

/// Transport-side end: push packet-ins, drain outbound control messages.
#[derive(Clone)]
pub struct SwitchHandle {
    inner: Arc<Mutex<SharedQueues>>,
    wake: Arc<Notify>,
    dpid: u64,
}

impl SwitchConn {
    pub fn new(dpid: u64, mac: EthernetAddress, wake: Arc<Notify>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SharedQueues::new(QUEUE_CAPACITY))),
            wake,
            dpid,
            mac,
        }
    }

    pub fn handle(&self) -> SwitchHandle {
        SwitchHandle {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
            dpid: self.dpid,
        }
    }

    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    /// MAC of the switch itself, used as the rewrite source on return paths.
    pub fn mac(&self) -> EthernetAddress {
        self.mac
    }

    /// Fire-and-forget enqueue toward the transport.
    pub fn send(&self, msg: SwitchMsg) {
        let mut guard = self.inner.lock();
        if guard.outbound.len() >= guard.capacity {
            guard.outbound.pop_front();
        }
        guard.outbound.push_back(msg);
    }

    pub(crate) fn pop_packet_in(&self) -> Option<PacketIn> {
        self.inner.lock().inbound.pop_front()
    }
}

impl SwitchHandle {
    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    /// Enqueues a packet-in for the core and wakes the pump. Returns `false`
    /// if the ring was full and the oldest event had to be dropped.
    pub fn push_packet_in(&self, event: PacketIn) -> bool {
        let dropped = {
            let mut guard = self.inner.lock();
            let dropped = guard.inbound.len() >= guard.capacity;
            if dropped {
                guard.inbound.pop_front();
            }
            guard.inbound.push_back(event);
            dropped
        };
        self.wake.notify_one();
        !dropped
    }

    /// Takes up to `max` pending control messages for serialization.
    pub fn drain_outbound(&self, max: usize) -> Vec<SwitchMsg> {
        let mut guard = self.inner.lock();
        let take = max.min(guard.outbound.len());
        guard.outbound.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openflow::{PacketOut, SwitchMsg};

    fn conn() -> (SwitchConn, SwitchHandle) {
        let wake = Arc::new(Notify::new());
        let conn = SwitchConn::new(1, EthernetAddress([2, 0, 0, 0, 0, 1]), wake);
        let handle = conn.handle();
        (conn, handle)
    }

    #[test]
    fn outbound_drains_in_order() {
        let (conn, handle) = conn();
        conn.send(SwitchMsg::PacketOut(PacketOut::discard(7, 1)));
        conn.send(SwitchMsg::PacketOut(PacketOut::discard(8, 2)));
        let drained = handle.drain_outbound(16);
        assert_eq!(drained.len(), 2);
        match &drained[0] {
            SwitchMsg::PacketOut(out) => assert_eq!(out.buffer_id, Some(7)),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn inbound_ring_drops_oldest_when_full() {
        let (conn, handle) = conn();
        for n in 0..QUEUE_CAPACITY {
            assert!(handle.push_packet_in(PacketIn {
                in_port: n as u16,
                buffer_id: None,
                frame: Vec::new(),
            }));
        }
        assert!(!handle.push_packet_in(PacketIn {
            in_port: 9999,
            buffer_id: None,
            frame: Vec::new(),
        }));
        let first = conn.pop_packet_in().unwrap();
        assert_eq!(first.in_port, 1);
    }
}
