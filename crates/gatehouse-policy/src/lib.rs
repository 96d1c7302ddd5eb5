//! Declarative VPN policy: the parsed policy file and per-user resolution.
//!
//! The policy file is line-oriented. Non-indented lines open a section
//! (`global`, `group NAME`, `user NAME`); indented lines are statements that
//! belong to the current section. Resolution layers the global section, the
//! user's group sections, and the user's own section into a deduplicated
//! route set.

mod parser;
mod resolve;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::Duration;

use ipnet::IpNet;
use thiserror::Error;

pub use self::parser::parse_policy;
pub use self::resolve::{
    resolve_user, DnsMode, NetworkInfo, ResolveError, RouteEntry, UserPolicy,
};

/// Tunnel network used when the policy file has no `net` statement.
pub const DEFAULT_TUNNEL_NET: &str = "169.254.120.0/24";

#[derive(Debug, Error)]
#[error("policy:{line} {reason}")]
pub struct ParseError {
    pub line: usize,
    pub reason: String,
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Tri-state (plus `All`) setting used by the `dns` and `nat` statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flag {
    #[default]
    Unset,
    Off,
    On,
    All,
}

impl Flag {
    fn render(self) -> &'static str {
        match self {
            Flag::Unset => "",
            Flag::Off => "off",
            Flag::On => "on",
            Flag::All => "all",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SectionKind {
    Global,
    Group,
    User,
}

/// A `route` or `nat <cidr>` statement: a destination network plus an
/// optional set of TCP ports. An empty port list means every port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub network: IpNet,
    pub ports: Vec<u16>,
}

/// A reference to a topology element (`subnet-…` or `pcx-…`) by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRef {
    pub id: String,
    pub ports: Vec<u16>,
}

/// One scoped block of the policy file.
#[derive(Debug, Clone)]
pub struct Section {
    pub kind: SectionKind,
    pub name: String,
    /// Declaration order among sections of the same kind; the deterministic
    /// tie-break when folding group sections.
    pub order: usize,
    pub subnets: Vec<SubnetRef>,
    pub routes: Vec<Route>,
    pub nat_routes: Vec<Route>,
    pub nat: Flag,
    pub dns: Flag,
}

impl Section {
    fn new(kind: SectionKind, name: &str, order: usize) -> Self {
        Section {
            kind,
            name: name.to_string(),
            order,
            subnets: Vec::new(),
            routes: Vec::new(),
            nat_routes: Vec::new(),
            nat: Flag::Unset,
            dns: Flag::Unset,
        }
    }

    fn render(&self, out: &mut String) {
        match self.kind {
            SectionKind::Global => out.push_str("global\n"),
            SectionKind::Group => {
                let _ = writeln!(out, "group {}", self.name);
            }
            SectionKind::User => {
                let _ = writeln!(out, "user {}", self.name);
            }
        }

        if self.dns != Flag::Unset {
            let _ = writeln!(out, "\tdns {}", self.dns.render());
        }

        if self.nat == Flag::All {
            out.push_str("\tnat on\n");
        } else if self.nat == Flag::Off {
            out.push_str("\tnat off\n");
        }

        for subnet in &self.subnets {
            let _ = writeln!(out, "\t{}{}", subnet.id, render_ports(&subnet.ports));
        }

        for nat in &self.nat_routes {
            let _ = writeln!(out, "\tnat {}{}", nat.network, render_ports(&nat.ports));
        }

        for route in &self.routes {
            let _ = writeln!(out, "\troute {}{}", route.network, render_ports(&route.ports));
        }
    }
}

fn render_ports(ports: &[u16]) -> String {
    let mut s = String::new();
    for port in ports {
        let _ = write!(s, " {port}");
    }
    s
}

/// An immutable snapshot of the parsed policy file.
#[derive(Debug, Clone)]
pub struct PolicyFile {
    pub watch: Option<Duration>,
    pub network: Option<IpNet>,
    pub route53_zone: Option<String>,
    pub domain: Option<String>,
    pub weighted: bool,
    pub key_strength: Option<u32>,
    pub global: Section,
    pub groups: BTreeMap<String, Section>,
    pub users: BTreeMap<String, Section>,
}

impl PolicyFile {
    pub(crate) fn empty() -> Self {
        PolicyFile {
            watch: None,
            network: None,
            route53_zone: None,
            domain: None,
            weighted: false,
            key_strength: None,
            global: Section::new(SectionKind::Global, "", 0),
            groups: BTreeMap::new(),
            users: BTreeMap::new(),
        }
    }

    /// Text form for debug output. Parsing the result yields an equal
    /// policy, up to insertion order of groups and users.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.global.render(&mut out);

        if let Some(watch) = self.watch {
            if watch.as_secs() > 0 {
                let _ = writeln!(out, "\twatch {}s", watch.as_secs());
            }
        }

        if let (Some(zone), Some(domain)) = (&self.route53_zone, &self.domain) {
            let mode = if self.weighted { "weighted" } else { "simple" };
            let _ = writeln!(out, "\troute53 {zone} {domain} {mode}");
        }

        if let Some(network) = &self.network {
            let _ = writeln!(out, "\tnet {network}");
        }

        if let Some(strength) = self.key_strength {
            let _ = writeln!(out, "\tkey-strength {strength}");
        }

        for section in self.groups.values() {
            section.render(&mut out);
        }

        for section in self.users.values() {
            section.render(&mut out);
        }

        out
    }
}

/// Parse a CIDR, or a bare address as a host route (/32, /128 for IPv6).
/// The network address is truncated to the prefix.
pub(crate) fn parse_network(s: &str) -> Option<IpNet> {
    if s.contains('/') {
        s.parse::<IpNet>().ok().map(|net| net.trunc())
    } else {
        let addr: IpAddr = s.parse().ok()?;
        let prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        IpNet::new(addr, prefix).ok()
    }
}

/// Parse a duration of the form `30s`, `5m`, `2h`, or a concatenation such
/// as `1h30m`. A bare number is seconds.
pub(crate) fn parse_duration(s: &str) -> Option<Duration> {
    if s.is_empty() {
        return None;
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();

    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else {
            let value: u64 = digits.parse().ok()?;
            digits.clear();
            let unit = match ch {
                's' => Duration::from_secs(value),
                'm' => Duration::from_secs(value * 60),
                'h' => Duration::from_secs(value * 3600),
                _ => return None,
            };
            total += unit;
        }
    }

    if !digits.is_empty() {
        return None;
    }

    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_network_cidr_truncates() {
        let net = parse_network("10.2.0.9/16").unwrap();
        assert_eq!(net.to_string(), "10.2.0.0/16");
    }

    #[test]
    fn parse_network_bare_ip_is_host_route() {
        assert_eq!(parse_network("10.1.2.3").unwrap().to_string(), "10.1.2.3/32");
        assert_eq!(parse_network("fd00::1").unwrap().to_string(), "fd00::1/128");
    }

    #[test]
    fn parse_network_rejects_garbage() {
        assert!(parse_network("not-a-net").is_none());
        assert!(parse_network("10.0.0.0/99").is_none());
    }

    #[test]
    fn parse_duration_forms() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration("10x"), None);
    }
}
