//! TLS/SSL Classifier (spec.md §4.F).
//!
//! Runs once a flow's DPI driver has captured a ClientHello SNI (or,
//! failing that, once the driver gives up on a flow whose destination IP
//! is in the `ssl_ips` blocklist). Mirrors `worker.cpp`'s SNI path: unlike
//! the HTTP classifier there is no redirect option for TLS — a match is
//! always a RST, and `detection_completed` is deliberately left unset so
//! later packets on the same flow keep getting a chance to see a
//! certificate the driver didn't have the first time around (spec.md §9
//! open question 4 territory: interdiction can still act before detection
//! is "done").

use crate::config::Configuration;
use crate::dpi::TlsClientInfo;
use crate::stats::ThreadStats;
use std::net::IpAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsVerdict {
    Pass,
    Reset,
}

/// Classify one flow's captured TLS identity against `ssl_domains`, and —
/// if there was nothing to match there — against the `ssl_ips` fallback.
/// Always sets `flow.block = true` on a hit, never sets
/// `detection_completed`; the caller (the driver) owns that field. The
/// `ssl_domains` branch only runs once the engine reports
/// `ssl_seen_client_cert` and a non-empty identifier (spec.md §4.F).
pub fn classify(
    config: &Configuration,
    stats: &mut ThreadStats,
    tls: &TlsClientInfo,
    dst_ip: IpAddr,
) -> (TlsVerdict, bool) {
    if tls.seen_client_cert {
        if let Some(sni) = tls.client_certificate.as_deref() {
            if !sni.is_empty() {
                let Ok(guard) = config.ssl_domains.try_lock() else {
                    // try-lock-and-skip: no point continuing this packet.
                    return (TlsVerdict::Pass, false);
                };
                let Some(matcher) = guard.as_ref() else {
                    return (TlsVerdict::Pass, false);
                };

                let lowered;
                let sni = if config.flags.lower_host() {
                    lowered = sni.to_ascii_lowercase();
                    lowered.as_str()
                } else {
                    sni
                };
                let host_len = sni.len();

                let mut found = false;
                for m in matcher.matcher.find_iter(sni) {
                    let Some(meta) = matcher.meta.get(&m.pattern().as_u32()) else {
                        continue;
                    };
                    let match_len = m.end() - m.start();
                    if match_len != host_len {
                        if meta.exact_match {
                            continue;
                        }
                        // worker.cpp indexes the char just before the match
                        // as `host_len - match_len - 1` rather than the
                        // match's actual start position — this only agrees
                        // with the true preceding character when the hit is
                        // anchored at the end of `sni`, so a non-suffix
                        // partial hit is rejected here even if its own
                        // boundary char is a dot. Preserved verbatim.
                        if sni.as_bytes()[host_len - match_len - 1] != b'.' {
                            continue;
                        }
                    }
                    found = true;
                    break;
                }
                drop(guard);

                if found {
                    stats.matched_ssl += 1;
                    return (TlsVerdict::Reset, true);
                }
                return (TlsVerdict::Pass, false);
            }
        }
    }

    // No certificate observed on this flow yet. Fall back to the
    // destination-IP blocklist, but only once the engine has conceded it
    // won't be seeing one (the driver only calls this path post-giveup), and
    // only when `block_undetected_ssl` is enabled (spec.md §4.F / worker.cpp
    // nests the `ssl_ips` check inside that flag's guard).
    if config.flags.block_undetected_ssl() {
        if let Ok(guard) = config.ssl_ips.try_lock() {
            if let Some(ips) = guard.as_ref() {
                if ips.contains(&dst_ip) {
                    stats.matched_ssl_ip += 1;
                    return (TlsVerdict::Reset, true);
                }
            }
        }
    }

    (TlsVerdict::Pass, false)
}
