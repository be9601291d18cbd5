//! DPI Driver (spec.md §4.D).
//!
//! The DPI engine itself is an external collaborator (spec.md §1) — this
//! module defines the stable contract a worker drives it through
//! ([`DpiEngine`]), the per-flow state it owns, and the early-abandon /
//! giveup / guess-undetected state machine spec.md describes. A concrete
//! [`engine::ReferenceDpiEngine`] is included so the driver and the
//! classifiers downstream of it have something real to run against in
//! tests; it is not the production engine the spec treats as a black box.

pub mod engine;

/// Protocol identifier pair the DPI engine reports: a "master" protocol
/// (the tunnel/carrier, e.g. HTTP) and the specific "app" protocol
/// detected within it. Mirrors nDPI's `ndpi_protocol` shape, which is
/// what spec.md's §4.D/§9 predicates are written against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolId {
    Unknown,
    Http,
    Ssl,
    Tor,
    DirectDownloadLink,
    Other(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DetectedProtocol {
    pub master: ProtocolId,
    pub app: ProtocolId,
}

impl DetectedProtocol {
    pub fn unknown() -> Self {
        Self { master: ProtocolId::Unknown, app: ProtocolId::Unknown }
    }

    pub fn is_unknown(&self) -> bool {
        self.master == ProtocolId::Unknown && self.app == ProtocolId::Unknown
    }
}

/// One HTTP method the classifier acts on (spec.md §4.E).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Head,
}

/// What the DPI engine has surfaced about an HTTP request on this flow.
#[derive(Clone, Debug, Default)]
pub struct HttpRequestInfo {
    pub method: Option<HttpMethod>,
    pub url: Option<String>,
}

/// What the DPI engine has surfaced about a TLS ClientHello on this flow.
#[derive(Clone, Debug, Default)]
pub struct TlsClientInfo {
    pub seen_client_cert: bool,
    pub client_certificate: Option<String>,
}

/// Per-endpoint identity the DPI engine tracks across packets of one
/// flow (spec.md §3: "two per-endpoint identity structures"). Opaque to
/// the worker; it only ever threads this through to the engine.
#[derive(Default)]
pub struct PeerIdentity {
    _private: (),
}

/// Everything a flow owns on behalf of the DPI engine: its private
/// detection state plus the client/server identity pair. Released when
/// the [`crate::flow::FlowRecord`] is dropped — see that module's notes
/// on invariant 2.
pub struct FlowDpiState<S> {
    pub engine_state: S,
    pub src_id: PeerIdentity,
    pub dst_id: PeerIdentity,
    pub http: HttpRequestInfo,
    pub tls: TlsClientInfo,
}

impl<S: Default> Default for FlowDpiState<S> {
    fn default() -> Self {
        Self {
            engine_state: S::default(),
            src_id: PeerIdentity::default(),
            dst_id: PeerIdentity::default(),
            http: HttpRequestInfo::default(),
            tls: TlsClientInfo::default(),
        }
    }
}

/// The DPI engine contract (spec.md §6). Thread-safe reads over a shared
/// handle; each flow owns its own `FlowState`.
pub trait DpiEngine {
    type FlowState: Default;

    /// Feed one packet's L3-onward bytes to the engine for this flow.
    fn process_packet(
        &self,
        state: &mut Self::FlowState,
        http: &mut HttpRequestInfo,
        tls: &mut TlsClientInfo,
        l3: &[u8],
        ip_total_len: u32,
        timestamp: u64,
    ) -> DetectedProtocol;

    /// The engine concedes it won't do better than what it already has.
    fn giveup(&self, state: &mut Self::FlowState) -> DetectedProtocol;

    /// Heuristic guess once the engine has given up. The source calls
    /// this with the positional shape `(ip_proto, 0, src_port, 0,
    /// dst_port)` — spec.md §9 open question 3 flags this as possibly a
    /// bug against the engine's documented signature (which would expect
    /// IP addresses in the zeroed slots), but preserves it rather than
    /// silently fixing it, so this signature keeps the same shape.
    fn guess_undetected_protocol(&self, ip_proto: u8, src_port: u16, dst_port: u16) -> DetectedProtocol;

    /// Does the engine want to give up on this flow right now? Exposed so
    /// the driver can implement early-abandon without engines needing to
    /// encode it inside `process_packet`'s return value.
    fn should_give_up(&self, state: &Self::FlowState) -> bool;
}

/// Outcome of driving one packet through the DPI state machine.
#[derive(Debug)]
pub enum DriveOutcome {
    /// Detection is ongoing; classifiers should not act yet.
    Classifying,
    /// Just transitioned to completed; `detected_protocol` on the flow is
    /// now final for this connection (barring TLS's special-cased
    /// continued inspection, spec.md §4.F).
    Completed,
    /// Flow was already completed and blocked; caller should bump
    /// `already_detected_blocked` and stop.
    AlreadyBlocked,
    /// Flow was already completed and not blocked; caller should stop.
    AlreadyDone,
}

/// Drive one packet through the New → Classifying → Giveup/Completed
/// state machine (spec.md §4.D). Mutates `flow`'s `detected_protocol`,
/// `detection_completed`, `packets`, and `bytes`; does not touch
/// `last_seen` — the caller stamps that uniformly across all inspection
/// paths.
pub fn drive<E: DpiEngine>(
    engine: &E,
    flow: &mut crate::flow::FlowRecord<E::FlowState>,
    ip_proto: u8,
    src_port: u16,
    dst_port: u16,
    l3: &[u8],
    ip_total_len: u32,
    timestamp: u64,
) -> DriveOutcome {
    if flow.detection_completed {
        return if flow.block {
            DriveOutcome::AlreadyBlocked
        } else {
            DriveOutcome::AlreadyDone
        };
    }

    let mut detected = engine.process_packet(
        &mut flow.dpi_state.engine_state,
        &mut flow.dpi_state.http,
        &mut flow.dpi_state.tls,
        l3,
        ip_total_len,
        timestamp,
    );

    if detected.is_unknown() && engine.should_give_up(&flow.dpi_state.engine_state) {
        detected = engine.giveup(&mut flow.dpi_state.engine_state);
    }

    if detected.is_unknown() {
        detected = engine.guess_undetected_protocol(ip_proto, src_port, dst_port);
    }

    flow.detected_protocol = detected;
    flow.packets += 1;
    flow.bytes += ip_total_len as u64;

    // Preserved verbatim from the source's literal (and, per spec.md §9
    // open question 1, self-contradictory) predicate: `protocol == TOR`
    // and `protocol != HTTP` can never both hold when TOR is detected,
    // and the `protocol != SSL` clause is duplicated. A "plausible
    // intended" rewrite is not substituted here without product-owner
    // sign-off; see DESIGN.md.
    let p = detected;
    let completed = p.app != ProtocolId::Ssl
        && p.app != ProtocolId::Ssl
        && p.app == ProtocolId::Tor
        && p.master != ProtocolId::Http
        && p.app != ProtocolId::Http
        && p.app != ProtocolId::DirectDownloadLink;

    if completed {
        flow.detection_completed = true;
        DriveOutcome::Completed
    } else {
        DriveOutcome::Classifying
    }
}
