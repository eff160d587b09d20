//! Flow-plane core of a stateful OpenFlow 1.0 TCP load balancer.
//!
//! New flows toward one of two virtual service addresses are steered onto a
//! pool of backends by installing rewrite rules in the switch; return
//! traffic is rewritten so clients only ever see the service address. An
//! operator channel marks backends as updated, partitioning the pool into
//! two generations that the two service addresses front during rolling
//! upgrades. The OpenFlow transport, ARP responder and message bus are
//! external; they talk to the engine through [`SwitchHandle`] and
//! [`MessengerHandle`].

mod balancer;
mod clock;
pub mod logger;
pub mod messenger;
pub mod openflow;
pub mod packet;
pub mod switch;

pub use balancer::{BalancerCounters, FlowKey, LiveEntry, SteerError, UpdateOutcome};
pub use clock::Clock;
pub use messenger::MessengerHandle;
pub use switch::{PacketIn, SwitchHandle};

use anyhow::{bail, Context};
use balancer::Balancer;
use messenger::Messenger;
use parking_lot::Mutex;
use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use switch::SwitchConn;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

/// Only the switch with this datapath id is balanced; others are ignored.
const BALANCED_DPID: u64 = 1;
/// Pump fallback tick; packet-ins normally arrive via the wake notify.
const PUMP_TICK: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct LbConfig {
    pub service_ip1: Ipv4Addr,
    pub service_ip2: Ipv4Addr,
    pub servers: Vec<Ipv4Addr>,
}

impl LbConfig {
    /// Parses the construction parameters: two service addresses and a
    /// comma- or whitespace-separated backend list.
    pub fn parse(ip1: &str, ip2: &str, servers: &str) -> anyhow::Result<Self> {
        let service_ip1: Ipv4Addr = ip1
            .trim()
            .parse()
            .with_context(|| format!("invalid service address {ip1:?}"))?;
        let service_ip2: Ipv4Addr = ip2
            .trim()
            .parse()
            .with_context(|| format!("invalid service address {ip2:?}"))?;
        if service_ip1 == service_ip2 {
            bail!("service addresses must differ");
        }
        let mut parsed = Vec::new();
        for token in servers.split([',', ' ']).filter(|t| !t.trim().is_empty()) {
            let server: Ipv4Addr = token
                .trim()
                .parse()
                .with_context(|| format!("invalid server address {token:?}"))?;
            if parsed.contains(&server) {
                bail!("duplicate server address {server}");
            }
            parsed.push(server);
        }
        if parsed.is_empty() {
            bail!("at least one server address is required");
        }
        Ok(Self {
            service_ip1,
            service_ip2,
            servers: parsed,
        })
    }
}

struct EngineState {
    running: bool,
}

/// The controller engine: owns the runtime, the balancer and its tasks.
pub struct LbEngine {
    config: LbConfig,
    runtime: Runtime,
    clock: Clock,
    state: Arc<Mutex<EngineState>>,
    balancer: Arc<Mutex<Option<Balancer>>>,
    wake: Arc<Notify>,
    messenger_handle: MessengerHandle,
    messenger: Mutex<Option<Messenger>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LbEngine {
    pub fn new(config: LbConfig) -> anyhow::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_time()
            .build()?;
        let (messenger_handle, messenger) = messenger::channel();
        Ok(Self {
            config,
            runtime,
            clock: Clock::new(),
            state: Arc::new(Mutex::new(EngineState { running: false })),
            balancer: Arc::new(Mutex::new(None)),
            wake: Arc::new(Notify::new()),
            messenger_handle,
            messenger: Mutex::new(Some(messenger)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the pump task. Probing starts once a switch attaches.
    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.running {
                return;
            }
            state.running = true;
        }
        let Some(messenger) = self.messenger.lock().take() else {
            return;
        };
        self.start_pump(messenger);
        logger::info("engine started, waiting for switch");
    }

    /// Abrupt shutdown: pending sends and in-flight timers are abandoned.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.running = false;
        }
        self.wake.notify_waiters();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        logger::info("engine stopped");
    }

    /// Offers a newly connected switch to the engine. Returns the transport
    /// handle if this is the balanced datapath, `None` (with a warning) for
    /// every other switch.
    pub fn connect_switch(&self, dpid: u64, mac: EthernetAddress) -> Option<SwitchHandle> {
        if dpid != BALANCED_DPID {
            logger::warn(format!("ignoring switch {dpid:#x}"));
            return None;
        }
        let mut guard = self.balancer.lock();
        if guard.is_some() {
            logger::warn(format!("ignoring switch {dpid:#x}, already balancing"));
            return None;
        }
        let conn = SwitchConn::new(dpid, mac, Arc::clone(&self.wake));
        let handle = conn.handle();
        *guard = Some(Balancer::new(&self.config, conn));
        drop(guard);
        logger::info("IP load balancer ready");
        logger::info(format!("load balancing on switch {dpid:#x}"));
        self.start_probe_loop();
        Some(handle)
    }

    /// Endpoint for the operator message bus.
    pub fn messenger(&self) -> MessengerHandle {
        self.messenger_handle.clone()
    }

    pub fn counters(&self) -> BalancerCounters {
        self.balancer
            .lock()
            .as_ref()
            .map(|balancer| balancer.counters())
            .unwrap_or_default()
    }

    fn start_pump(&self, mut messenger: Messenger) {
        let balancer = Arc::clone(&self.balancer);
        let state = Arc::clone(&self.state);
        let wake = Arc::clone(&self.wake);
        let clock = self.clock;
        let handle = self.runtime.spawn(async move {
            let mut ticker = time::interval(PUMP_TICK);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if !state.lock().running {
                    break;
                }
                let mut guard = balancer.lock();
                messenger.pump(&mut guard);
                if let Some(balancer) = guard.as_mut() {
                    balancer.poll(clock.now());
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn start_probe_loop(&self) {
        let balancer = Arc::clone(&self.balancer);
        let state = Arc::clone(&self.state);
        let clock = self.clock;
        let handle = self.runtime.spawn(async move {
            let mut delay = Duration::ZERO;
            loop {
                time::sleep(delay).await;
                if !state.lock().running {
                    break;
                }
                delay = {
                    let mut guard = balancer.lock();
                    match guard.as_mut() {
                        Some(balancer) => balancer.probe_tick(clock.now()),
                        None => break,
                    }
                };
            }
        });
        self.tasks.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parses_comma_separated_servers() {
        let config = LbConfig::parse("10.0.1.1", "10.0.2.1", "10.0.0.2,10.0.0.3, 10.0.0.4").unwrap();
        assert_eq!(config.servers.len(), 3);
        assert_eq!(config.servers[0], Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn config_rejects_duplicates_and_garbage() {
        assert!(LbConfig::parse("10.0.1.1", "10.0.2.1", "10.0.0.2,10.0.0.2").is_err());
        assert!(LbConfig::parse("10.0.1.1", "10.0.2.1", "10.0.0.2,banana").is_err());
        assert!(LbConfig::parse("10.0.1.1", "10.0.2.1", "").is_err());
        assert!(LbConfig::parse("10.0.1.1", "10.0.1.1", "10.0.0.2").is_err());
    }

    #[test]
    fn only_datapath_one_attaches() {
        let config = LbConfig::parse("10.0.1.1", "10.0.2.1", "10.0.0.2").unwrap();
        let engine = LbEngine::new(config).unwrap();
        engine.start();
        assert!(engine.connect_switch(2, EthernetAddress([2, 0, 0, 0, 0, 9])).is_none());
        assert!(engine.connect_switch(1, EthernetAddress([2, 0, 0, 0, 0, 1])).is_some());
        assert!(engine.connect_switch(1, EthernetAddress([2, 0, 0, 0, 0, 2])).is_none());
        engine.stop();
    }
}
