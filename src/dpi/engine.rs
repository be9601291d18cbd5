//! A reference [`DpiEngine`] implementation.
//!
//! The real DPI engine is an external collaborator treated as a black
//! box (spec.md §1). This implementation exists so the driver and the
//! classifiers have something concrete to run against in tests: it
//! recognizes an HTTP request line via `httparse` (grounded in
//! `sase-ips::protocols::http::HttpAnalyzer::parse_request`) and a TLS
//! ClientHello's SNI extension (grounded in
//! `sase-ips::protocols::tls::TlsAnalyzer::parse_client_hello`). It is
//! deliberately not tuned for production accuracy — no multi-packet
//! reassembly, no protocol guessing beyond spec.md's contract.

use super::{DetectedProtocol, DpiEngine, HttpMethod, HttpRequestInfo, ProtocolId, TlsClientInfo};

/// Per-flow state the reference engine keeps: just enough to implement
/// early-abandon after a handful of unclassified packets.
#[derive(Default)]
pub struct ReferenceFlowState {
    packets_seen: u32,
}

const GIVEUP_AFTER_PACKETS: u32 = 8;

/// Split an IP-header-onward slice into its TCP payload, the way a real
/// DPI engine would internally before protocol sniffing. Returns `None`
/// if the slice is too short to be a valid header.
fn tcp_payload(l3: &[u8]) -> Option<&[u8]> {
    if l3.is_empty() {
        return None;
    }
    let version = l3[0] >> 4;
    let ip_header_len = match version {
        4 => {
            let ihl = (l3[0] & 0x0F) as usize * 4;
            if ihl < 20 || l3.len() < ihl {
                return None;
            }
            ihl
        }
        6 => 40,
        _ => return None,
    };
    if l3.len() < ip_header_len + 20 {
        return None;
    }
    let tcp = &l3[ip_header_len..];
    let tcp_header_len = ((tcp[12] >> 4) as usize) * 4;
    let payload_start = ip_header_len + tcp_header_len;
    if l3.len() < payload_start {
        return None;
    }
    Some(&l3[payload_start..])
}

fn detect_http(payload: &[u8]) -> Option<HttpRequestInfo> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(payload) {
        Ok(httparse::Status::Complete(_)) | Ok(httparse::Status::Partial) => {
            let method = match req.method {
                Some("GET") => Some(HttpMethod::Get),
                Some("POST") => Some(HttpMethod::Post),
                Some("HEAD") => Some(HttpMethod::Head),
                _ => return None,
            };
            let host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .map(|h| String::from_utf8_lossy(h.value).to_string());
            let path = req.path?.to_string();
            let url = host.map(|h| format!("http://{h}{path}"));
            Some(HttpRequestInfo { method, url })
        }
        Err(_) => None,
    }
}

/// Parse a TLS ClientHello and pull its SNI extension, if present.
/// Grounded on `sase-ips::protocols::tls::TlsAnalyzer::parse_client_hello`.
fn parse_client_hello_sni(data: &[u8]) -> Option<String> {
    if data.len() < 43 || data[0] != 0x16 {
        return None; // not a TLS handshake record
    }
    let record_length = ((data[3] as usize) << 8) | (data[4] as usize);
    if data.len() < 5 + record_length {
        return None;
    }
    let handshake = &data[5..];
    if handshake.is_empty() || handshake[0] != 0x01 {
        return None; // not a ClientHello
    }
    if handshake.len() < 4 {
        return None;
    }
    let client_hello = &handshake[4..];
    if client_hello.len() < 38 {
        return None;
    }

    let mut pos = 34; // client_version(2) + random(32)
    let session_id_len = *client_hello.get(pos)? as usize;
    pos += 1 + session_id_len;

    if pos + 2 > client_hello.len() {
        return None;
    }
    let cipher_len = ((client_hello[pos] as usize) << 8) | (client_hello[pos + 1] as usize);
    pos += 2 + cipher_len;

    let comp_len = *client_hello.get(pos)? as usize;
    pos += 1 + comp_len;

    if pos + 2 > client_hello.len() {
        return None;
    }
    let ext_len = ((client_hello[pos] as usize) << 8) | (client_hello[pos + 1] as usize);
    pos += 2;
    let ext_end = (pos + ext_len).min(client_hello.len());

    while pos + 4 <= ext_end {
        let ext_type = ((client_hello[pos] as u16) << 8) | (client_hello[pos + 1] as u16);
        let ext_data_len = ((client_hello[pos + 2] as usize) << 8) | (client_hello[pos + 3] as usize);
        pos += 4;
        if pos + ext_data_len > ext_end {
            break;
        }
        let ext_data = &client_hello[pos..pos + ext_data_len];
        if ext_type == 0x0000 && ext_data.len() > 5 {
            let name_len = ((ext_data[3] as usize) << 8) | (ext_data[4] as usize);
            if ext_data.len() >= 5 + name_len {
                return String::from_utf8(ext_data[5..5 + name_len].to_vec()).ok();
            }
        }
        pos += ext_data_len;
    }
    None
}

/// A minimal, self-contained stand-in for the real DPI engine.
pub struct ReferenceDpiEngine;

impl ReferenceDpiEngine {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ReferenceDpiEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DpiEngine for ReferenceDpiEngine {
    type FlowState = ReferenceFlowState;

    fn process_packet(
        &self,
        state: &mut Self::FlowState,
        http: &mut HttpRequestInfo,
        tls: &mut TlsClientInfo,
        l3: &[u8],
        _ip_total_len: u32,
        _timestamp: u64,
    ) -> DetectedProtocol {
        state.packets_seen += 1;

        let payload = match tcp_payload(l3) {
            Some(p) => p,
            None => return DetectedProtocol::unknown(),
        };

        if let Some(sni) = parse_client_hello_sni(payload) {
            tls.seen_client_cert = true;
            tls.client_certificate = Some(sni);
            return DetectedProtocol { master: ProtocolId::Ssl, app: ProtocolId::Ssl };
        }

        if let Some(req) = detect_http(payload) {
            *http = req;
            return DetectedProtocol { master: ProtocolId::Http, app: ProtocolId::Http };
        }

        DetectedProtocol::unknown()
    }

    fn giveup(&self, _state: &mut Self::FlowState) -> DetectedProtocol {
        DetectedProtocol::unknown()
    }

    fn guess_undetected_protocol(&self, _ip_proto: u8, _src_port: u16, dst_port: u16) -> DetectedProtocol {
        match dst_port {
            80 => DetectedProtocol { master: ProtocolId::Http, app: ProtocolId::Http },
            443 => DetectedProtocol { master: ProtocolId::Ssl, app: ProtocolId::Ssl },
            _ => DetectedProtocol::unknown(),
        }
    }

    fn should_give_up(&self, state: &Self::FlowState) -> bool {
        state.packets_seen >= GIVEUP_AFTER_PACKETS
    }
}
