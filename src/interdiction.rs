//! Interdiction (spec.md §4.C, §6).
//!
//! Two producers feed one consumer: the pre-DPI `ip_port_map` fast path
//! (checked before a flow lookup even happens) and the post-classification
//! HTTP/TLS paths. Both funnel through [`InterdictionOrder`] onto a
//! `crossbeam_channel` the worker's sender thread drains — the channel is
//! this crate's stand-in for the packet-injection collaborator spec.md §1
//! treats as external.

use crossbeam_channel::Sender;
use std::net::IpAddr;

/// One packet the sender thread must synthesize and transmit back onto the
/// wire. Field shapes match spec.md §6 exactly: a RST reuses the
/// originating segment's sequence number unchanged, a redirect advances it
/// past the payload the client just sent and sets PSH.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterdictionOrder {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub psh_flag: bool,
    pub is_rst: bool,
    /// Redirect target / extra query-string data, when applicable. Absent
    /// for a plain RST.
    pub extra_param: Option<String>,
}

impl InterdictionOrder {
    /// A bare TCP RST back to the client, no payload.
    pub fn rst(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16, seq: u32, ack: u32) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            seq,
            ack,
            psh_flag: false,
            is_rst: true,
            extra_param: None,
        }
    }

    /// A redirect response. `payload_len` is the length of the client's
    /// request that's being answered, so the synthesized segment's sequence
    /// number lands right after it.
    pub fn redirect(
        src_ip: IpAddr,
        dst_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        payload_len: u32,
        extra_param: Option<String>,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            seq: seq.wrapping_add(payload_len),
            ack,
            psh_flag: true,
            is_rst: false,
            extra_param,
        }
    }
}

/// The sending half of the interdiction channel. Workers hold a clone of
/// this; a single background thread owns the receiving half and is
/// responsible for actually crafting and transmitting packets.
#[derive(Clone)]
pub struct InterdictionSender {
    tx: Sender<InterdictionOrder>,
}

impl InterdictionSender {
    pub fn new(tx: Sender<InterdictionOrder>) -> Self {
        Self { tx }
    }

    /// Enqueue an order. Per spec.md's try-lock-and-skip discipline this
    /// never blocks the worker: a full channel silently drops the order
    /// rather than stalling packet processing.
    pub fn send(&self, order: InterdictionOrder) -> bool {
        self.tx.try_send(order).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rst_preserves_incoming_seq() {
        let order = InterdictionOrder::rst("10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap(), 40000, 80, 1000, 2000);
        assert_eq!(order.seq, 1000);
        assert!(order.is_rst);
        assert!(!order.psh_flag);
    }

    #[test]
    fn redirect_advances_seq_past_payload_and_sets_psh() {
        let order = InterdictionOrder::redirect(
            "10.0.0.2".parse().unwrap(),
            "10.0.0.3".parse().unwrap(),
            40000,
            80,
            1000,
            2000,
            57,
            Some("?blocked=1".to_string()),
        );
        assert_eq!(order.seq, 1057);
        assert!(order.psh_flag);
        assert!(!order.is_rst);
    }

    #[test]
    fn send_to_full_channel_reports_drop_without_blocking() {
        let (tx, _rx) = crossbeam_channel::bounded(0);
        let sender = InterdictionSender::new(tx);
        let order = InterdictionOrder::rst("10.0.0.2".parse().unwrap(), "10.0.0.3".parse().unwrap(), 1, 2, 0, 0);
        assert!(!sender.send(order));
    }
}
