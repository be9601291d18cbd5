//! Worker Loop (spec.md §4.H).
//!
//! Ties every other component together: pull a buffer from the
//! distributor, decode it, run the interdiction gate, find-or-create its
//! flow, drive DPI, hand off to whichever classifier applies, recycle the
//! buffer, and periodically sweep the garbage collector. One `Worker`
//! instance is meant to be pinned to one CPU core and run exclusively on
//! it; nothing here is `Sync` by design — see spec.md §5.

use crate::config::Configuration;
use crate::dpi::{self, DpiEngine, DriveOutcome};
use crate::gc;
use crate::http_classifier::{self, HttpVerdict};
use crate::interdiction::{InterdictionOrder, InterdictionSender};
use crate::tls_classifier::{self, TlsVerdict};
use crate::{decoder, flow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Upstream collaborator that hands raw frames to exactly one worker at a
/// time (spec.md §6). Non-blocking by contract: `poll_packet` returning
/// `None` means "not yet", not "never".
pub trait Distributor {
    fn request_packet(&self, worker_id: usize);
    fn poll_packet(&self, worker_id: usize) -> Option<Vec<u8>>;
}

/// A cooperative stop flag, shared between the worker and whatever drives
/// its shutdown. `Arc<AtomicBool>` rather than a channel: polled every
/// iteration, including inside the distributor's idle spin.
#[derive(Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything one pinned core owns exclusively. Generic over the DPI
/// engine so the worker can be exercised in tests against
/// [`crate::dpi::engine::ReferenceDpiEngine`] without depending on a real
/// one.
pub struct Worker<E: DpiEngine> {
    id: usize,
    engine: E,
    config: Arc<Configuration>,
    tables: flow::FlowTables<E::FlowState>,
    stats: crate::stats::ThreadStats,
    interdiction: InterdictionSender,
    stop: StopFlag,
    gc_idle_ticks: u64,
    last_gc_tick: u64,
}

impl<E: DpiEngine> Worker<E> {
    pub fn new(
        id: usize,
        engine: E,
        config: Arc<Configuration>,
        flow_capacity: usize,
        interdiction: InterdictionSender,
        stop: StopFlag,
        gc_idle_ticks: u64,
    ) -> crate::error::Result<Self> {
        Ok(Self {
            id,
            engine,
            config,
            tables: flow::FlowTables::new(flow_capacity)?,
            stats: crate::stats::ThreadStats::new(),
            interdiction,
            stop,
            gc_idle_ticks,
            last_gc_tick: 0,
        })
    }

    pub fn stats(&self) -> &crate::stats::ThreadStats {
        &self.stats
    }

    /// Run the main loop until `stop` is signaled. `now_ticks` reads the
    /// worker's monotonic clock (TSC cycles in production; spec.md treats
    /// the unit as opaque beyond "monotonic and comparable to itself").
    pub fn run<D: Distributor>(&mut self, distributor: &D, now_ticks: impl Fn() -> u64, pause_cpu: impl Fn()) {
        while !self.stop.is_set() {
            distributor.request_packet(self.id);
            let buf = loop {
                if let Some(buf) = distributor.poll_packet(self.id) {
                    break Some(buf);
                }
                if self.stop.is_set() {
                    break None;
                }
                pause_cpu();
            };
            let Some(buf) = buf else { break };

            let tick = now_ticks();
            self.stats.total_packets += 1;
            self.analyze(&buf, tick);
            drop(buf);

            self.maybe_run_gc(tick);
        }
        self.shutdown();
    }

    fn analyze(&mut self, frame: &[u8], tick: u64) {
        let decoded = match decoder::decode(frame) {
            Ok(d) => d,
            Err(outcome) => {
                self.bump_drop_stat(outcome);
                return;
            }
        };

        match decoded.ip_version {
            4 => self.stats.ipv4_packets += 1,
            6 => self.stats.ipv6_packets += 1,
            _ => {}
        }
        self.stats.ip_packets += 1;
        self.stats.total_bytes += decoded.ip_total_len as u64;

        if self.interdiction_gate(&decoded) {
            return;
        }

        let key = flow::key_from_addrs(decoded.src_ip, decoded.dst_ip, decoded.src_port, decoded.dst_port);
        let flow = match key {
            flow::FlowKeyEither::V4(k) => self.tables.get_or_create_v4(k, tick),
            flow::FlowKeyEither::V6(k) => self.tables.get_or_create_v6(k, tick),
        };
        let Some(flow) = flow else {
            self.stats.pool_exhausted_drops += 1;
            warn!(worker = self.id, "flow pool exhausted, dropping packet");
            return;
        };

        self.stats.analyzed_packets += 1;
        flow.last_seen = tick;

        // TCP-only past the decoder's NOT_TCP reject, so the proto passed to
        // the engine is always 6.
        const TCP_PROTO: u8 = 6;
        let outcome = dpi::drive(
            &self.engine,
            flow,
            TCP_PROTO,
            decoded.src_port,
            decoded.dst_port,
            decoded.l3,
            decoded.ip_total_len,
            tick,
        );

        match outcome {
            DriveOutcome::AlreadyBlocked => {
                self.stats.already_detected_blocked += 1;
                return;
            }
            DriveOutcome::AlreadyDone => return,
            DriveOutcome::Completed | DriveOutcome::Classifying => {}
        }

        let protocol = flow.detected_protocol;
        let is_http = protocol.master == dpi::ProtocolId::Http
            || protocol.app == dpi::ProtocolId::Http
            || protocol.master == dpi::ProtocolId::DirectDownloadLink
            || protocol.app == dpi::ProtocolId::DirectDownloadLink;
        let is_tls = protocol.master == dpi::ProtocolId::Ssl
            || protocol.app == dpi::ProtocolId::Ssl
            || protocol.master == dpi::ProtocolId::Tor
            || protocol.app == dpi::ProtocolId::Tor;

        // Classify while `flow` is still borrowed, but only ever stash the
        // resulting action — emitting it happens after the borrow ends, so
        // the emit helpers are free to take `&mut self`.
        let mut pending_rst = false;
        let mut pending_redirect = None;

        if is_http && flow.dpi_state.http.method.is_some() && flow.dpi_state.http.url.is_some() {
            let (verdict, block, add_param) = http_classifier::classify(&self.config, &mut self.stats, &flow.dpi_state.http);
            if block {
                flow.block = true;
            }
            match verdict {
                HttpVerdict::Pass => {}
                HttpVerdict::Reset => pending_rst = true,
                HttpVerdict::Redirect => pending_redirect = Some(add_param),
            }
        } else if is_tls {
            let (verdict, block) = tls_classifier::classify(&self.config, &mut self.stats, &flow.dpi_state.tls, decoded.dst_ip);
            if block {
                flow.block = true;
            }
            if verdict == TlsVerdict::Reset {
                pending_rst = true;
            }
        }

        if pending_rst {
            self.emit_rst(&decoded);
        } else if let Some(add_param) = pending_redirect {
            self.emit_redirect(&decoded, add_param);
        }

        self.refresh_flow_gauges();
    }

    /// Recompute the live-flow gauges from the table's own counts. Cheap —
    /// `pool_used`/`ipv4_count`/`ipv6_count` are `O(1)` — so this just runs
    /// wherever a flow's birth or death may have changed them, rather than
    /// threading increment/decrement calls through every call site.
    fn refresh_flow_gauges(&mut self) {
        self.stats.ndpi_ipv4_flows_count = self.tables.ipv4_count() as u64;
        self.stats.ndpi_ipv6_flows_count = self.tables.ipv6_count() as u64;
        self.stats.ndpi_flows_count = self.tables.pool_used() as u64;
    }

    /// spec.md §4.C: pre-DPI fast path against `ip_port_map`. Returns
    /// `true` if the packet was fully handled (RST emitted, no flow
    /// lookup performed).
    fn interdiction_gate(&mut self, decoded: &decoder::DecodedPacket<'_>) -> bool {
        let Ok(guard) = self.config.ip_port_map.try_lock() else {
            return false;
        };
        let Some(map) = guard.as_ref() else {
            return false;
        };
        let hit = map.matches(decoded.dst_ip, decoded.dst_port);
        drop(guard);
        if hit {
            self.stats.matched_ip_port += 1;
            self.emit_rst(decoded);
            true
        } else {
            false
        }
    }

    fn emit_rst(&mut self, decoded: &decoder::DecodedPacket<'_>) {
        let order = InterdictionOrder::rst(
            decoded.dst_ip,
            decoded.src_ip,
            decoded.dst_port,
            decoded.src_port,
            decoded.seq,
            decoded.ack,
        );
        self.stats.sended_rst += 1;
        if !self.interdiction.send(order) {
            debug!(worker = self.id, "interdiction queue full, order dropped");
        }
    }

    fn emit_redirect(&mut self, decoded: &decoder::DecodedPacket<'_>, extra_param: String) {
        let extra_param = if extra_param.is_empty() { None } else { Some(extra_param) };
        let order = InterdictionOrder::redirect(
            decoded.dst_ip,
            decoded.src_ip,
            decoded.dst_port,
            decoded.src_port,
            decoded.seq,
            decoded.ack,
            decoded.payload.len() as u32,
            extra_param,
        );
        if !self.interdiction.send(order) {
            debug!(worker = self.id, "interdiction queue full, redirect dropped");
        }
    }

    fn bump_drop_stat(&mut self, outcome: decoder::DropOutcome) {
        use decoder::DropReason::*;
        if let Some(n) = outcome.counted_bytes {
            self.stats.total_bytes += n as u64;
        }
        match outcome.reason {
            NotIp => {}
            Ipv4Short => self.stats.ipv4_short_packets += 1,
            Ipv4Fragment => self.stats.ipv4_fragments += 1,
            Ipv6Fragment => self.stats.ipv6_fragments += 1,
            NotTcp | NoPayload | Malformed => {}
        }
        trace!(worker = self.id, reason = ?outcome.reason, "packet dropped at decode");
    }

    fn maybe_run_gc(&mut self, tick: u64) {
        if tick.saturating_sub(self.last_gc_tick) < gc::GC_INTERVAL_SECS {
            return;
        }
        self.last_gc_tick = tick;
        let evicted = gc::sweep(&mut self.tables, tick, self.gc_idle_ticks);
        self.stats.ndpi_flows_deleted += evicted as u64;
        self.refresh_flow_gauges();
    }

    fn shutdown(&mut self) {
        let evicted = self.tables.evict_all();
        self.stats.ndpi_flows_deleted += evicted as u64;
        self.refresh_flow_gauges();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpi::engine::ReferenceDpiEngine;
    use crossbeam_channel::unbounded;
    use std::sync::Mutex;

    struct QueueDistributor {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Distributor for QueueDistributor {
        fn request_packet(&self, _worker_id: usize) {}

        fn poll_packet(&self, _worker_id: usize) -> Option<Vec<u8>> {
            self.frames.lock().unwrap().pop()
        }
    }

    fn eth_ipv4_tcp(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; 14];
        f[12] = 0x08;
        f[13] = 0x00;
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        let total_len = (20 + 20 + payload.len()) as u16;
        ip[2..4].copy_from_slice(&total_len.to_be_bytes());
        ip[9] = 6;
        ip[12..16].copy_from_slice(&[10, 0, 0, 2]);
        ip[16..20].copy_from_slice(&[10, 0, 0, 3]);
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[4..8].copy_from_slice(&1000u32.to_be_bytes());
        tcp[8..12].copy_from_slice(&2000u32.to_be_bytes());
        tcp[12] = 5 << 4;
        f.extend(ip);
        f.extend(tcp);
        f.extend(payload);
        f
    }

    #[test]
    fn decode_reject_bumps_counter_without_touching_flow_table() {
        let (tx, _rx) = unbounded();
        let config = Arc::new(Configuration::new());
        let mut worker = Worker::new(
            0,
            ReferenceDpiEngine::new(),
            config,
            16,
            InterdictionSender::new(tx),
            StopFlag::new(),
            120,
        )
        .unwrap();
        let mut frame = eth_ipv4_tcp(1, 2, b"");
        frame[14 + 6] = 0x20; // MF bit
        worker.analyze(&frame, 1);
        assert_eq!(worker.stats().ipv4_fragments, 1);
        assert_eq!(worker.tables.pool_used(), 0);
        assert_eq!(worker.stats().total_bytes, 0);
    }

    #[test]
    fn no_payload_reject_still_counts_bytes() {
        // spec.md §4.A: the byte counter accumulates once the segment is
        // confirmed TCP, even if it's later rejected for carrying no
        // payload.
        let (tx, _rx) = unbounded();
        let config = Arc::new(Configuration::new());
        let mut worker = Worker::new(
            0,
            ReferenceDpiEngine::new(),
            config,
            16,
            InterdictionSender::new(tx),
            StopFlag::new(),
            120,
        )
        .unwrap();
        let frame = eth_ipv4_tcp(1, 2, b"");
        worker.analyze(&frame, 1);
        assert_eq!(worker.stats().total_bytes, 40);
        assert_eq!(worker.tables.pool_used(), 0);
    }

    #[test]
    fn ip_port_match_short_circuits_before_flow_lookup() {
        let (tx, rx) = unbounded();
        let config = Arc::new(Configuration::new());
        *config.ip_port_map.lock().unwrap() = {
            let mut m = crate::config::IpPortMap::default();
            m.insert("10.0.0.3".parse().unwrap(), Default::default());
            Some(m)
        };
        let mut worker = Worker::new(
            0,
            ReferenceDpiEngine::new(),
            config,
            16,
            InterdictionSender::new(tx),
            StopFlag::new(),
            120,
        )
        .unwrap();
        let frame = eth_ipv4_tcp(40000, 80, b"GET / HTTP/1.1\r\n\r\n");
        worker.analyze(&frame, 1);
        assert_eq!(worker.stats().matched_ip_port, 1);
        assert_eq!(worker.tables.pool_used(), 0);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn http_get_creates_flow_and_is_analyzed() {
        let (tx, _rx) = unbounded();
        let config = Arc::new(Configuration::new());
        let mut worker = Worker::new(
            0,
            ReferenceDpiEngine::new(),
            config,
            16,
            InterdictionSender::new(tx),
            StopFlag::new(),
            120,
        )
        .unwrap();
        let frame = eth_ipv4_tcp(40000, 80, b"GET /index.html HTTP/1.1\r\nHost: good.example\r\n\r\n");
        worker.analyze(&frame, 1);
        assert_eq!(worker.stats().analyzed_packets, 1);
        assert_eq!(worker.tables.pool_used(), 1);
        assert_eq!(worker.stats().ndpi_ipv4_flows_count, 1);
        assert_eq!(worker.stats().ndpi_flows_count, 1);
    }

    #[test]
    fn run_loop_drains_queue_and_stops_on_signal() {
        let (tx, _rx) = unbounded();
        let config = Arc::new(Configuration::new());
        let mut worker = Worker::new(
            0,
            ReferenceDpiEngine::new(),
            config,
            16,
            InterdictionSender::new(tx),
            StopFlag::new(),
            120,
        )
        .unwrap();

        let distributor = QueueDistributor {
            frames: Mutex::new(vec![
                eth_ipv4_tcp(40000, 80, b"GET /a HTTP/1.1\r\nHost: good.example\r\n\r\n"),
                eth_ipv4_tcp(40001, 80, b"GET /b HTTP/1.1\r\nHost: good.example\r\n\r\n"),
            ]),
        };
        let stop = worker.stop.clone();
        let tick = std::sync::atomic::AtomicU64::new(1);
        worker.run(
            &distributor,
            || {
                let t = tick.fetch_add(1, Ordering::Relaxed);
                if distributor.frames.lock().unwrap().is_empty() {
                    stop.signal();
                }
                t
            },
            || {},
        );

        assert_eq!(worker.stats().total_packets, 2);
        assert_eq!(worker.tables.pool_used(), 0); // shutdown evicted everything
    }

    #[test]
    fn shutdown_evicts_all_flows() {
        let (tx, _rx) = unbounded();
        let config = Arc::new(Configuration::new());
        let mut worker = Worker::new(
            0,
            ReferenceDpiEngine::new(),
            config,
            16,
            InterdictionSender::new(tx),
            StopFlag::new(),
            120,
        )
        .unwrap();
        let frame = eth_ipv4_tcp(40000, 80, b"GET /index.html HTTP/1.1\r\nHost: good.example\r\n\r\n");
        worker.analyze(&frame, 1);
        worker.shutdown();
        assert_eq!(worker.tables.pool_used(), 0);
        assert_eq!(worker.stats().ndpi_flows_count, 0);
    }
}
