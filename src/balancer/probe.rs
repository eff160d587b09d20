//! ARP liveness probing and the piggy-backed expiry sweep.

use super::*;

impl Balancer {
    /// One probe-engine tick: sweep expired state, ARP the next backend in
    /// rotation, and report how long to wait before the next tick.
    pub(crate) fn probe_tick(&mut self, now: Duration) -> Duration {
        self.expire(now);
        if let Some(server) = self.rotation.pop_front() {
            self.rotation.push_back(server);
            let proto_src =
                self.generation
                    .service_source(server, self.service_ip1, self.service_ip2);
            let frame = packet::build_arp_probe(self.mac, proto_src, server);
            self.conn.send(SwitchMsg::PacketOut(PacketOut::flood(frame)));
            self.probes.insert(server, now + ARP_DEADLINE);
            self.counters.probes_sent += 1;
            logger::breadcrumb(
                BreadcrumbFlags::PROBE,
                format!("probing {server} as {proto_src}"),
            );
        }
        self.probe_wait_time()
    }

    /// Spreads the pool over the probe cycle, never faster than the floor.
    pub(crate) fn probe_wait_time(&self) -> Duration {
        let backends = self.rotation.len().max(1) as u32;
        cmp::max(MIN_PROBE_GAP, PROBE_CYCLE / backends)
    }

    fn expire(&mut self, now: Duration) {
        let lapsed: Vec<Ipv4Addr> = self
            .probes
            .iter()
            .filter(|(_, deadline)| now > **deadline)
            .map(|(server, _)| *server)
            .collect();
        for server in lapsed {
            self.probes.remove(&server);
            if self.live.remove(&server).is_some() {
                self.counters.servers_down += 1;
                logger::info(format!("server {server} down"));
            }
        }

        let removed = self.memory.expire_sweep(now);
        if removed > 0 {
            self.counters.flows_expired += removed as u64;
            logger::debug(format!("expired {removed} flows"));
        }
    }

    /// A backend answered a probe: clear the deadline and (re)learn where
    /// the backend lives. Replays of an identical reply change nothing.
    pub(super) fn handle_arp_reply(&mut self, reply: &ArpReply, in_port: u16) {
        if self.probes.remove(&reply.sender_ip).is_none() {
            return;
        }
        let entry = LiveEntry {
            mac: reply.sender_mac,
            port: in_port,
        };
        if self.live.get(&reply.sender_ip) == Some(&entry) {
            return;
        }
        self.live.insert(reply.sender_ip, entry);
        self.counters.servers_up += 1;
        logger::info(format!("server {} up", reply.sender_ip));
    }
}
