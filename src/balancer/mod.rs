//! The balancer core: classifies packet-ins and installs rewrite rules.
//!
//! All mutable state lives here behind one lock owned by the engine: the
//! live-set, the outstanding probes, the flow memory and the generation
//! partition are mutated together and their invariants span each other.

mod generation;
mod probe;
mod state;
mod steer;


pub use generation::UpdateOutcome;
pub use state::{BalancerCounters, FlowKey, LiveEntry};
pub use steer::SteerError;

use crate::logger::{self, BreadcrumbFlags};
use crate::openflow::{ActionList, FlowMod, OfAction, OfMatch, PacketOut, SwitchMsg};
use crate::packet::{self, ArpReply, ParsedFrame, TcpSegment};
use crate::switch::{PacketIn, SwitchConn};
use crate::LbConfig;
use generation::Generation;
use rand::rngs::StdRng;
use rand::SeedableRng;
use smoltcp::wire::EthernetAddress;
use state::{FlowMemory, MemoryEntry, ARP_DEADLINE, FLOW_IDLE_TIMEOUT, MIN_PROBE_GAP, PROBE_CYCLE};
use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::Duration;

pub struct Balancer {
    conn: SwitchConn,
    /// The switch's own MAC, rewrite source on the return path.
    mac: EthernetAddress,
    service_ip1: Ipv4Addr,
    service_ip2: Ipv4Addr,
    /// Probe rotation over the full backend pool, head is probed next.
    rotation: VecDeque<Ipv4Addr>,
    generation: Generation,
    live: HashMap<Ipv4Addr, LiveEntry>,
    /// Probes waiting for an ARP reply, by answer deadline.
    probes: HashMap<Ipv4Addr, Duration>,
    memory: FlowMemory,
    rng: StdRng,
    counters: BalancerCounters,
}

impl Balancer {
    pub(crate) fn new(config: &LbConfig, conn: SwitchConn) -> Self {
        let mac = conn.mac();
        Self {
            mac,
            service_ip1: config.service_ip1,
            service_ip2: config.service_ip2,
            rotation: config.servers.iter().copied().collect(),
            generation: Generation::new(&config.servers),
            live: HashMap::new(),
            probes: HashMap::new(),
            memory: FlowMemory::default(),
            rng: StdRng::from_entropy(),
            counters: BalancerCounters::default(),
            conn,
        }
    }

    pub fn counters(&self) -> BalancerCounters {
        self.counters
    }

    /// Drains every queued packet-in and runs it through the dispatcher.
    pub(crate) fn poll(&mut self, now: Duration) {
        while let Some(event) = self.conn.pop_packet_in() {
            self.handle_packet_in(&event, now);
        }
    }

    pub(crate) fn handle_packet_in(&mut self, event: &PacketIn, now: Duration) {
        match packet::parse_frame(&event.frame) {
            ParsedFrame::Tcp(segment) => self.handle_tcp(&segment, event, now),
            ParsedFrame::ArpReply(reply) => self.handle_arp_reply(&reply, event.in_port),
            ParsedFrame::OtherArp => {}
            ParsedFrame::Other => {
                self.counters.drops_unclassified += 1;
                self.drop_packet(event);
            }
        }
    }

    /// Moves `server` into the updated generation (operator command).
    pub(crate) fn mark_updated(&mut self, server: Ipv4Addr) {
        match self.generation.mark_updated(server) {
            UpdateOutcome::Unknown => {
                logger::warn(format!("not balancing server {server}"));
            }
            UpdateOutcome::AlreadyUpdated => {
                logger::info(format!("server {server} already updated"));
            }
            UpdateOutcome::Updated => {
                logger::info(format!("server {server} updating"));
                logger::breadcrumb(
                    BreadcrumbFlags::GENERATION,
                    format!(
                        "partition now {} non-updated / {} updated",
                        self.generation.non_updated().len(),
                        self.generation.updated().len()
                    ),
                );
            }
            UpdateOutcome::Rolled => {
                logger::info(format!("server {server} updating"));
                logger::info("update wave complete, updated generation is the new baseline");
            }
        }
    }

    fn handle_tcp(&mut self, segment: &TcpSegment, event: &PacketIn, now: Duration) {
        if self.generation.contains(segment.src_ip) {
            self.handle_return(segment, event, now);
        } else if segment.dst_ip == self.service_ip1 || segment.dst_ip == self.service_ip2 {
            self.handle_forward(segment, event, now);
        } else {
            self.counters.drops_unclassified += 1;
            self.drop_packet(event);
        }
    }

    /// Traffic from a backend toward a client: rewrite the source back to
    /// the service address the client believes it is talking to.
    fn handle_return(&mut self, segment: &TcpSegment, event: &PacketIn, now: Duration) {
        let key = FlowKey::of_segment(segment);
        let service_src =
            self.generation
                .service_source(segment.src_ip, self.service_ip1, self.service_ip2);
        let Some(entry) = self.memory.get_mut(&key) else {
            logger::debug(format!("no client for {key:?}"));
            self.counters.drops_unmatched_return += 1;
            self.drop_packet(event);
            return;
        };
        entry.refresh(now);
        let client_port = entry.client_port;

        let mut actions = ActionList::new();
        actions.push(OfAction::SetDlSrc(self.mac));
        actions.push(OfAction::SetNwSrc(service_src));
        actions.push(OfAction::Output(client_port));
        let flow_mod = FlowMod::add(
            OfMatch::from_tcp(segment, event.in_port),
            actions,
            FLOW_IDLE_TIMEOUT,
            event.buffer_id,
        );
        self.conn.send(SwitchMsg::FlowMod(flow_mod));
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("reverse rule {key:?} src rewritten to {service_src}"),
        );
    }

    /// Traffic from a client toward a service address: bind the flow to a
    /// backend (sticky while the backend stays live) and rewrite toward it.
    fn handle_forward(&mut self, segment: &TcpSegment, event: &PacketIn, now: Duration) {
        let key = FlowKey::of_segment(segment);
        let remembered = self
            .memory
            .get(&key)
            .map(|entry| entry.backend)
            .filter(|backend| self.live.contains_key(backend));
        let backend = match remembered {
            Some(backend) => backend,
            None => {
                let pool = self.generation.forward_pool(segment.dst_ip == self.service_ip1);
                match steer::pick_backend(&self.live, pool, &mut self.rng) {
                    Ok(backend) => {
                        logger::info(format!("directing {key:?} to {backend}"));
                        self.memory
                            .insert(MemoryEntry::new(backend, segment, event.in_port, now));
                        self.counters.flows_directed += 1;
                        backend
                    }
                    Err(SteerError::NoBackends) => {
                        logger::warn("no live servers");
                        self.counters.drops_no_backend += 1;
                        self.drop_packet(event);
                        return;
                    }
                    Err(SteerError::NoEligibleBackend) => {
                        logger::warn(format!(
                            "no live server in the target generation for {}",
                            segment.dst_ip
                        ));
                        self.counters.drops_no_backend += 1;
                        self.drop_packet(event);
                        return;
                    }
                }
            }
        };
        if let Some(entry) = self.memory.get_mut(&key) {
            entry.refresh(now);
        }
        let Some(dest) = self.live.get(&backend).copied() else {
            return;
        };

        let mut actions = ActionList::new();
        actions.push(OfAction::SetDlDst(dest.mac));
        actions.push(OfAction::SetNwDst(backend));
        actions.push(OfAction::Output(dest.port));
        let flow_mod = FlowMod::add(
            OfMatch::from_tcp(segment, event.in_port),
            actions,
            FLOW_IDLE_TIMEOUT,
            event.buffer_id,
        );
        self.conn.send(SwitchMsg::FlowMod(flow_mod));
    }

    /// Discards the switch-side buffer, if any. Unbuffered frames need no
    /// action to disappear.
    fn drop_packet(&self, event: &PacketIn) {
        if let Some(buffer_id) = event.buffer_id {
            self.conn
                .send(SwitchMsg::PacketOut(PacketOut::discard(buffer_id, event.in_port)));
        }
    }
}
