//! OpenFlow 1.0 control messages as the core emits them.
//!
//! The engine never speaks the wire encoding itself; the transport that owns
//! the switch socket serializes these. Only the subset the balancer needs is
//! modeled: exact-match flow-mods with L2/L3 rewrite actions, and packet-outs
//! for probe injection and buffered-frame discard.

use crate::packet::TcpSegment;
use smallvec::SmallVec;
use smoltcp::wire::EthernetAddress;
use std::net::Ipv4Addr;

/// Pseudo-port: flood out every port except the ingress.
pub const OFPP_FLOOD: u16 = 0xfffb;
/// Pseudo-port: not associated with a physical port.
pub const OFPP_NONE: u16 = 0xffff;
/// `hard_timeout` value meaning the rule never hard-expires.
pub const OFP_FLOW_PERMANENT: u16 = 0;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const NW_PROTO_TCP: u8 = 6;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlowModCommand {
    Add,
    Modify,
    ModifyStrict,
    Delete,
    DeleteStrict,
}

/// Exact match over the L2 tuple plus the TCP 4-tuple, as derived from a
/// packet seen on an ingress port.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct OfMatch {
    pub in_port: u16,
    pub dl_src: EthernetAddress,
    pub dl_dst: EthernetAddress,
    pub dl_type: u16,
    pub nw_proto: u8,
    pub nw_src: Ipv4Addr,
    pub nw_dst: Ipv4Addr,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl OfMatch {
    pub fn from_tcp(segment: &TcpSegment, in_port: u16) -> Self {
        Self {
            in_port,
            dl_src: segment.src_mac,
            dl_dst: segment.dst_mac,
            dl_type: ETH_TYPE_IPV4,
            nw_proto: NW_PROTO_TCP,
            nw_src: segment.src_ip,
            nw_dst: segment.dst_ip,
            tp_src: segment.src_port,
            tp_dst: segment.dst_port,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OfAction {
    SetDlSrc(EthernetAddress),
    SetDlDst(EthernetAddress),
    SetNwSrc(Ipv4Addr),
    SetNwDst(Ipv4Addr),
    Output(u16),
}

pub type ActionList = SmallVec<[OfAction; 4]>;

#[derive(Clone, Debug)]
pub struct FlowMod {
    pub command: FlowModCommand,
    pub match_: OfMatch,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    /// Buffered frame to release once the rule is installed.
    pub buffer_id: Option<u32>,
    pub actions: ActionList,
}

impl FlowMod {
    pub fn add(
        match_: OfMatch,
        actions: ActionList,
        idle_timeout: u16,
        buffer_id: Option<u32>,
    ) -> Self {
        Self {
            command: FlowModCommand::Add,
            match_,
            idle_timeout,
            hard_timeout: OFP_FLOW_PERMANENT,
            buffer_id,
            actions,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PacketOut {
    pub buffer_id: Option<u32>,
    /// Raw frame carried inline when there is no switch-side buffer.
    pub frame: Option<Vec<u8>>,
    pub in_port: u16,
    pub actions: ActionList,
}

impl PacketOut {
    /// Inject `frame` and flood it out of every port.
    pub fn flood(frame: Vec<u8>) -> Self {
        let mut actions = ActionList::new();
        actions.push(OfAction::Output(OFPP_FLOOD));
        Self {
            buffer_id: None,
            frame: Some(frame),
            in_port: OFPP_NONE,
            actions,
        }
    }

    /// Release a buffered frame with no actions, discarding it.
    pub fn discard(buffer_id: u32, in_port: u16) -> Self {
        Self {
            buffer_id: Some(buffer_id),
            frame: None,
            in_port,
            actions: ActionList::new(),
        }
    }
}

/// Everything the core sends down the switch channel.
#[derive(Clone, Debug)]
pub enum SwitchMsg {
    FlowMod(FlowMod),
    PacketOut(PacketOut),
}
