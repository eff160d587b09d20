//! Operator message-bus endpoint.
//!
//! The bus transport itself lives outside the engine; it forwards each
//! received message here as an [`Envelope`] and relays the JSON reply back
//! to the peer. Two channels exist: `update_server`, which marks a backend
//! as updated and acknowledges with a per-client message count, and `chat`,
//! a benign echo for connectivity testing.

use crate::balancer::Balancer;
use crate::logger::{self, BreadcrumbFlags};
use crossbeam_channel::{bounded, Receiver, Sender};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::Ipv4Addr;

pub const UPDATE_CHANNEL: &str = "update_server";
pub const CHAT_CHANNEL: &str = "chat";

/// One bus message in flight toward the engine.
pub struct Envelope {
    pub channel: String,
    /// Identity of the sending client connection.
    pub peer: String,
    pub body: Value,
    pub reply: Sender<Value>,
}

/// Cloneable sender the bus adapter uses to reach the engine.
#[derive(Clone)]
pub struct MessengerHandle {
    tx: Sender<Envelope>,
}

impl MessengerHandle {
    /// Submits a message and returns the receiver for its reply.
    pub fn submit(&self, channel: &str, peer: &str, body: Value) -> Receiver<Value> {
        let (reply_tx, reply_rx) = bounded(1);
        let envelope = Envelope {
            channel: channel.to_string(),
            peer: peer.to_string(),
            body,
            reply: reply_tx,
        };
        if self.tx.send(envelope).is_err() {
            logger::warn("messenger submit after engine shutdown");
        }
        reply_rx
    }
}

/// Engine-side endpoint, drained from the pump task.
pub(crate) struct Messenger {
    rx: Receiver<Envelope>,
    /// Messages seen per client connection on the update channel.
    update_counts: HashMap<String, u64>,
}

pub(crate) fn channel() -> (MessengerHandle, Messenger) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        MessengerHandle { tx },
        Messenger {
            rx,
            update_counts: HashMap::new(),
        },
    )
}

impl Messenger {
    /// Handles every queued envelope. `balancer` is `None` until a switch
    /// has attached; update commands received before that are acknowledged
    /// but change nothing.
    pub fn pump(&mut self, balancer: &mut Option<Balancer>) {
        while let Ok(envelope) = self.rx.try_recv() {
            let reply = match envelope.channel.as_str() {
                UPDATE_CHANNEL => self.handle_update(&envelope, balancer),
                CHAT_CHANNEL => chat_reply(&envelope),
                other => {
                    logger::warn(format!("message for unknown channel {other:?}"));
                    json!({ "error": format!("unknown channel {other}") })
                }
            };
            let _ = envelope.reply.try_send(reply);
        }
    }

    fn handle_update(&mut self, envelope: &Envelope, balancer: &mut Option<Balancer>) -> Value {
        let count = self
            .update_counts
            .entry(envelope.peer.clone())
            .and_modify(|count| *count += 1)
            .or_insert(1);
        let count = *count;

        let msg = envelope
            .body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        logger::breadcrumb(
            BreadcrumbFlags::MESSENGER,
            format!("update #{count} from {}: {msg:?}", envelope.peer),
        );
        match msg.parse::<Ipv4Addr>() {
            Ok(server) => match balancer {
                Some(balancer) => balancer.mark_updated(server),
                None => logger::warn(format!("update for {server} before any switch attached")),
            },
            Err(_) => logger::warn(format!("update message with invalid address {msg:?}")),
        }
        json!({ "count": count, "msg": msg })
    }
}

fn chat_reply(envelope: &Envelope) -> Value {
    let msg = envelope
        .body
        .get("msg")
        .and_then(Value::as_str)
        .unwrap_or_default();
    json!({ "msg": format!("{} says {}", envelope.peer, msg) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_echoes_peer_and_text() {
        let (handle, mut messenger) = channel();
        let reply_rx = handle.submit(CHAT_CHANNEL, "ops-1", json!({ "msg": "ping" }));
        let mut balancer = None;
        messenger.pump(&mut balancer);
        let reply = reply_rx.try_recv().unwrap();
        assert_eq!(reply["msg"], "ops-1 says ping");
    }

    #[test]
    fn update_counts_are_per_peer() {
        let (handle, mut messenger) = channel();
        let mut balancer = None;
        let first = handle.submit(UPDATE_CHANNEL, "ops-1", json!({ "msg": "10.0.0.2" }));
        let second = handle.submit(UPDATE_CHANNEL, "ops-1", json!({ "msg": "10.0.0.3" }));
        let other = handle.submit(UPDATE_CHANNEL, "ops-2", json!({ "msg": "10.0.0.2" }));
        messenger.pump(&mut balancer);
        assert_eq!(first.try_recv().unwrap()["count"], 1);
        assert_eq!(second.try_recv().unwrap()["count"], 2);
        assert_eq!(other.try_recv().unwrap()["count"], 1);
    }

    #[test]
    fn invalid_address_is_acknowledged() {
        let (handle, mut messenger) = channel();
        let mut balancer = None;
        let reply_rx = handle.submit(UPDATE_CHANNEL, "ops-1", json!({ "msg": "not-an-ip" }));
        messenger.pump(&mut balancer);
        let reply = reply_rx.try_recv().unwrap();
        assert_eq!(reply["count"], 1);
        assert_eq!(reply["msg"], "not-an-ip");
    }

    #[test]
    fn unknown_channel_is_answered_with_error() {
        let (handle, mut messenger) = channel();
        let mut balancer = None;
        let reply_rx = handle.submit("mystery", "ops-1", json!({ "msg": "hi" }));
        messenger.pump(&mut balancer);
        assert!(reply_rx.try_recv().unwrap().get("error").is_some());
    }
}
