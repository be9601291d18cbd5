//! Shared, read-mostly configuration (spec.md §3, §5).
//!
//! Six collaborator objects are shared by every worker and occasionally
//! rewritten by a control thread: `ip_port_map`, `ssl_ips`, `ssl_domains`
//! (+ its match-type table), and `url_domains` (+ its entries-data table).
//! Each pair gets its own [`std::sync::Mutex`]; workers only ever
//! `try_lock` it, per spec.md's "try-lock-and-skip" discipline — a worker
//! must never block waiting on the control plane. The configuration
//! *loader* that populates these from disk or an admin API is an external
//! collaborator (spec.md §1) and is not modeled here.

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

/// `ip_port_map`: destination IP → set of ports (empty set matches any port).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IpPortMap {
    map: HashMap<IpAddr, HashSet<u16>>,
}

impl IpPortMap {
    pub fn insert(&mut self, ip: IpAddr, ports: HashSet<u16>) {
        self.map.insert(ip, ports);
    }

    /// `true` if `ip:port` is covered by this map (empty port set = any port).
    pub fn matches(&self, ip: IpAddr, port: u16) -> bool {
        match self.map.get(&ip) {
            Some(ports) => ports.is_empty() || ports.contains(&port),
            None => false,
        }
    }
}

/// Whether a non-exact Aho–Corasick hit should still be accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslPatternMeta {
    pub exact_match: bool,
}

/// `ssl_domains`: multi-pattern matcher plus pattern-id → exact-match flag.
pub struct SslDomainMatcher {
    pub matcher: AhoCorasick,
    pub meta: HashMap<u32, SslPatternMeta>,
}

impl SslDomainMatcher {
    pub fn new(patterns: &[(String, bool)]) -> Result<Self, aho_corasick::BuildError> {
        let matcher = AhoCorasick::new(patterns.iter().map(|(p, _)| p.as_str()))?;
        let meta = patterns
            .iter()
            .enumerate()
            .map(|(id, (_, exact))| (id as u32, SslPatternMeta { exact_match: *exact }))
            .collect();
        Ok(Self { matcher, meta })
    }
}

/// `url_domains` pattern kind: domain blocklist entry, or full-URL entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Domain,
    Url,
}

/// Auxiliary data for one compiled `url_domains` pattern.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPatternMeta {
    pub entry_type: EntryType,
    pub exact_match: bool,
    pub lineno: u32,
}

/// `url_domains`: multi-pattern matcher plus pattern-id → entry metadata.
pub struct UrlDomainMatcher {
    pub matcher: AhoCorasick,
    pub meta: HashMap<u32, UrlPatternMeta>,
}

impl UrlDomainMatcher {
    pub fn new(entries: &[(String, UrlPatternMeta)]) -> Result<Self, aho_corasick::BuildError> {
        let matcher = AhoCorasick::new(entries.iter().map(|(p, _)| p.as_str()))?;
        let meta = entries
            .iter()
            .enumerate()
            .map(|(id, (_, meta))| (id as u32, meta.clone()))
            .collect();
        Ok(Self { matcher, meta })
    }
}

/// How a redirect should append extra identifying data to the target URL.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AddParamType {
    None = 0,
    Id = 1,
    Url = 2,
}

impl From<u8> for AddParamType {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Id,
            2 => Self::Url,
            _ => Self::None,
        }
    }
}

/// Small, frequently-read flags. These are not behind the try-lock
/// discipline (they're independent booleans, not composite structures a
/// control thread rebuilds atomically), so plain atomics suffice.
pub struct ConfigFlags {
    url_normalization: AtomicBool,
    remove_dot: AtomicBool,
    lower_host: AtomicBool,
    match_url_exactly: AtomicBool,
    http_redirect: AtomicBool,
    block_undetected_ssl: AtomicBool,
    add_p_type: AtomicU8,
}

impl ConfigFlags {
    pub fn url_normalization(&self) -> bool {
        self.url_normalization.load(Ordering::Relaxed)
    }
    pub fn remove_dot(&self) -> bool {
        self.remove_dot.load(Ordering::Relaxed)
    }
    pub fn lower_host(&self) -> bool {
        self.lower_host.load(Ordering::Relaxed)
    }
    pub fn match_url_exactly(&self) -> bool {
        self.match_url_exactly.load(Ordering::Relaxed)
    }
    pub fn http_redirect(&self) -> bool {
        self.http_redirect.load(Ordering::Relaxed)
    }
    pub fn block_undetected_ssl(&self) -> bool {
        self.block_undetected_ssl.load(Ordering::Relaxed)
    }
    pub fn add_p_type(&self) -> AddParamType {
        self.add_p_type.load(Ordering::Relaxed).into()
    }

    pub fn set_http_redirect(&self, v: bool) {
        self.http_redirect.store(v, Ordering::Relaxed);
    }
    pub fn set_add_p_type(&self, v: AddParamType) {
        self.add_p_type.store(v as u8, Ordering::Relaxed);
    }
    pub fn set_block_undetected_ssl(&self, v: bool) {
        self.block_undetected_ssl.store(v, Ordering::Relaxed);
    }
    pub fn set_match_url_exactly(&self, v: bool) {
        self.match_url_exactly.store(v, Ordering::Relaxed);
    }
    pub fn set_url_normalization(&self, v: bool) {
        self.url_normalization.store(v, Ordering::Relaxed);
    }
    pub fn set_lower_host(&self, v: bool) {
        self.lower_host.store(v, Ordering::Relaxed);
    }
    pub fn set_remove_dot(&self, v: bool) {
        self.remove_dot.store(v, Ordering::Relaxed);
    }
}

impl Default for ConfigFlags {
    fn default() -> Self {
        Self {
            url_normalization: AtomicBool::new(false),
            remove_dot: AtomicBool::new(false),
            lower_host: AtomicBool::new(false),
            match_url_exactly: AtomicBool::new(false),
            http_redirect: AtomicBool::new(false),
            block_undetected_ssl: AtomicBool::new(false),
            add_p_type: AtomicU8::new(AddParamType::None as u8),
        }
    }
}

/// The shared configuration object. Every worker holds an `Arc<Configuration>`;
/// a control thread rewrites the `Mutex`-guarded fields in place.
#[derive(Default)]
pub struct Configuration {
    pub ip_port_map: Mutex<Option<IpPortMap>>,
    pub ssl_ips: Mutex<Option<HashSet<IpAddr>>>,
    pub ssl_domains: Mutex<Option<SslDomainMatcher>>,
    pub url_domains: Mutex<Option<UrlDomainMatcher>>,
    pub flags: ConfigFlags,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_port_map_empty_port_set_matches_any() {
        let mut m = IpPortMap::default();
        m.insert("10.0.0.3".parse().unwrap(), HashSet::new());
        assert!(m.matches("10.0.0.3".parse().unwrap(), 80));
        assert!(m.matches("10.0.0.3".parse().unwrap(), 443));
        assert!(!m.matches("10.0.0.4".parse().unwrap(), 80));
    }

    #[test]
    fn ip_port_map_specific_ports() {
        let mut m = IpPortMap::default();
        m.insert("10.0.0.3".parse().unwrap(), HashSet::from([80, 8080]));
        assert!(m.matches("10.0.0.3".parse().unwrap(), 80));
        assert!(!m.matches("10.0.0.3".parse().unwrap(), 22));
    }

    #[test]
    fn flags_default_to_off() {
        let flags = ConfigFlags::default();
        assert!(!flags.http_redirect());
        assert_eq!(flags.add_p_type(), AddParamType::None);
    }
}
