//! Standalone simulator for the load-balancer engine.
//!
//! No real switch is involved: this binary plays the OpenFlow transport
//! against a scripted datapath. It answers the engine's ARP probes on behalf
//! of a handful of fake backends, injects client SYNs at both service
//! addresses, walks one backend through a rolling update and prints every
//! control message the engine emits.

use anyhow::Context;
use lb_engine::logger::{self, BreadcrumbFlags, LogLevel};
use lb_engine::messenger::UPDATE_CHANNEL;
use lb_engine::openflow::{FlowMod, OfAction, SwitchMsg};
use lb_engine::packet;
use lb_engine::switch::PacketIn;
use lb_engine::{LbConfig, LbEngine, SwitchHandle};
use serde_json::json;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
};
use std::collections::HashMap;
use std::env;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

const SWITCH_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
const CLIENT_MAC: EthernetAddress = EthernetAddress([0xce, 0x00, 0x00, 0x00, 0x00, 0x05]);
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 5);
const CLIENT_IN_PORT: u16 = 1;

struct Settings {
    ip1: String,
    ip2: String,
    servers: String,
    verbose: bool,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut settings = Self {
            ip1: "10.0.1.1".to_string(),
            ip2: "10.0.2.1".to_string(),
            servers: "10.0.0.2,10.0.0.3,10.0.0.4,10.0.0.5,10.0.0.6".to_string(),
            verbose: false,
        };
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--ip1" => settings.ip1 = args.next().context("--ip1 needs a value")?,
                "--ip2" => settings.ip2 = args.next().context("--ip2 needs a value")?,
                "--servers" => settings.servers = args.next().context("--servers needs a value")?,
                "--verbose" => settings.verbose = true,
                other => anyhow::bail!(
                    "unknown argument {other:?} (expected --ip1/--ip2/--servers/--verbose)"
                ),
            }
        }
        Ok(settings)
    }
}

struct FakeBackend {
    mac: EthernetAddress,
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    install_log_sink(&settings);

    let config = LbConfig::parse(&settings.ip1, &settings.ip2, &settings.servers)?;
    let backends: HashMap<Ipv4Addr, FakeBackend> = config
        .servers
        .iter()
        .enumerate()
        .map(|(index, server)| {
            (
                *server,
                FakeBackend {
                    mac: EthernetAddress([0x0a, 0, 0, 0, 0, server.octets()[3]]),
                    port: index as u16 + 2,
                },
            )
        })
        .collect();

    let engine = LbEngine::new(config.clone())?;
    engine.start();
    let handle = engine
        .connect_switch(1, SWITCH_MAC)
        .context("engine rejected the simulated switch")?;

    println!(
        "[standalone] balancing {} and {} over {} backends",
        config.service_ip1,
        config.service_ip2,
        config.servers.len()
    );
    pump(&handle, &backends, Duration::from_secs(2));

    println!(
        "[standalone] client SYN {}:40000 -> {}:80",
        CLIENT_IP, config.service_ip1
    );
    inject_syn(&handle, config.service_ip1, 40000);
    let msgs = pump(&handle, &backends, Duration::from_millis(500));
    if let Some(backend) = first_selected_backend(&msgs) {
        println!("[standalone] backend {backend} answers, expecting the reverse rewrite");
        let fake = &backends[&backend];
        handle.push_packet_in(PacketIn {
            in_port: fake.port,
            buffer_id: None,
            frame: packet::build_tcp_frame(fake.mac, SWITCH_MAC, backend, CLIENT_IP, 80, 40000),
        });
        pump(&handle, &backends, Duration::from_millis(500));
    }

    let updated = config.servers[0];
    println!("[standalone] operator marks {updated} as updated");
    let reply = engine
        .messenger()
        .submit(UPDATE_CHANNEL, "standalone", json!({ "msg": updated.to_string() }))
        .recv_timeout(Duration::from_secs(1))?;
    println!("[standalone] update_server acked: {reply}");

    println!(
        "[standalone] client SYN {}:40001 -> {}:80 (updated generation)",
        CLIENT_IP, config.service_ip2
    );
    inject_syn(&handle, config.service_ip2, 40001);
    pump(&handle, &backends, Duration::from_millis(500));

    engine.stop();
    Ok(())
}

fn install_log_sink(settings: &Settings) {
    logger::install_sink(
        Some(Box::new(|level: LogLevel, line: &str| {
            eprintln!("[{}] {}", level.as_str(), line);
        })),
        Some(if settings.verbose { "debug" } else { "info" }),
    );
    if settings.verbose {
        logger::set_breadcrumb_mask(BreadcrumbFlags::ALL);
    }
}

fn inject_syn(handle: &SwitchHandle, service: Ipv4Addr, client_port: u16) {
    handle.push_packet_in(PacketIn {
        in_port: CLIENT_IN_PORT,
        buffer_id: None,
        frame: packet::build_tcp_frame(
            CLIENT_MAC,
            SWITCH_MAC,
            CLIENT_IP,
            service,
            client_port,
            80,
        ),
    });
}

/// Drains the engine's control messages for `duration`, answering ARP probes
/// on behalf of the fake backends. Returns everything that was emitted.
fn pump(
    handle: &SwitchHandle,
    backends: &HashMap<Ipv4Addr, FakeBackend>,
    duration: Duration,
) -> Vec<SwitchMsg> {
    let mut seen = Vec::new();
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        for msg in handle.drain_outbound(64) {
            match &msg {
                SwitchMsg::PacketOut(out) => {
                    if let Some((source, target)) =
                        out.frame.as_deref().and_then(parse_arp_request)
                    {
                        if let Some(backend) = backends.get(&target) {
                            let reply =
                                packet::build_arp_reply(backend.mac, target, SWITCH_MAC, source);
                            handle.push_packet_in(PacketIn {
                                in_port: backend.port,
                                buffer_id: None,
                                frame: reply,
                            });
                        }
                    }
                }
                SwitchMsg::FlowMod(flow_mod) => {
                    println!("[standalone] flow-mod {}", describe_flow_mod(flow_mod));
                }
            }
            seen.push(msg);
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    seen
}

fn first_selected_backend(msgs: &[SwitchMsg]) -> Option<Ipv4Addr> {
    msgs.iter().find_map(|msg| match msg {
        SwitchMsg::FlowMod(flow_mod) => flow_mod.actions.iter().find_map(|action| match action {
            OfAction::SetNwDst(ip) => Some(*ip),
            _ => None,
        }),
        _ => None,
    })
}

fn parse_arp_request(frame: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let arp = ArpPacket::new_checked(eth.payload()).ok()?;
    let ArpRepr::EthernetIpv4 {
        operation,
        source_protocol_addr,
        target_protocol_addr,
        ..
    } = ArpRepr::parse(&arp).ok()?
    else {
        return None;
    };
    if operation != ArpOperation::Request {
        return None;
    }
    Some((
        Ipv4Addr::from(source_protocol_addr.0),
        Ipv4Addr::from(target_protocol_addr.0),
    ))
}

fn describe_flow_mod(flow_mod: &FlowMod) -> String {
    let m = &flow_mod.match_;
    let actions: Vec<String> = flow_mod
        .actions
        .iter()
        .map(|action| match action {
            OfAction::SetDlSrc(mac) => format!("dl_src={mac}"),
            OfAction::SetDlDst(mac) => format!("dl_dst={mac}"),
            OfAction::SetNwSrc(ip) => format!("nw_src={ip}"),
            OfAction::SetNwDst(ip) => format!("nw_dst={ip}"),
            OfAction::Output(port) => format!("output={port}"),
        })
        .collect();
    format!(
        "{}:{} -> {}:{} in_port={} idle={}s [{}]",
        m.nw_src,
        m.tp_src,
        m.nw_dst,
        m.tp_dst,
        m.in_port,
        flow_mod.idle_timeout,
        actions.join(" ")
    )
}
