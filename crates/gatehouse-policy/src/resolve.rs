//! Per-user policy resolution.
//!
//! Folds the global section, the user's group sections, and the user's own
//! section (in that order) into a deduplicated route set intersected with
//! the current network topology.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ipnet::IpNet;
use thiserror::Error;

use crate::{Flag, PolicyFile, Section, SectionKind};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("User {0} does not have access")]
    UserNotAuthorized(String),
}

/// The DNS push decision for a session. `Unset` folds to `Off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    Off,
    On,
}

/// One resolved route: a destination network and the TCP ports it is open
/// on. An empty port list means every port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub network: IpNet,
    pub ports: Vec<u16>,
}

/// The effective policy for one user, as pushed to the session and
/// programmed into the packet filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPolicy {
    pub dns: DnsMode,
    pub routes: Vec<RouteEntry>,
}

/// Network topology snapshot: known subnets and peerings by id, plus the
/// NAT egress networks.
#[derive(Debug, Clone, Default)]
pub struct NetworkInfo {
    pub subnets: HashMap<String, IpNet>,
    pub nat: Vec<IpNet>,
}

/// `None` means the route is open on every port; a specific set unions with
/// other sets and is absorbed by `None`.
type PortSet = Option<BTreeSet<u16>>;

/// Compute the effective policy for `user`, a member of `groups`, against
/// the topology in `netinfo`.
///
/// Deterministic: equal inputs give equal outputs regardless of group
/// iteration order.
pub fn resolve_user(
    policy: &PolicyFile,
    user: &str,
    groups: &[String],
    netinfo: &NetworkInfo,
) -> Result<UserPolicy, ResolveError> {
    let mut sections: Vec<&Section> = vec![&policy.global];

    for group in groups {
        if let Some(section) = policy.groups.get(group) {
            sections.push(section);
        }
    }

    let user_section = policy.users.get(user);

    if user_section.is_none() && sections.len() == 1 {
        return Err(ResolveError::UserNotAuthorized(user.to_string()));
    }

    sections.sort_by_key(|s| (s.kind, s.order));

    if let Some(section) = user_section {
        sections.push(section);
    }

    let mut dns = Flag::Unset;
    let mut nat = Flag::All;
    let mut nat_routes = Vec::new();
    let mut all_subnets = true;
    let mut routes: BTreeMap<IpNet, PortSet> = BTreeMap::new();

    for section in &sections {
        if section.dns != Flag::Unset {
            dns = section.dns;
        }

        if section.nat != Flag::Unset {
            nat = section.nat;
        }

        nat_routes.extend(section.nat_routes.iter().cloned());

        for route in &section.routes {
            add_route(&mut routes, route.network, &route.ports);
        }

        if !section.subnets.is_empty() {
            all_subnets = false;
        }

        for subnet in &section.subnets {
            // The topology may have moved on since the policy was written;
            // unknown ids resolve to nothing.
            match netinfo.subnets.get(&subnet.id) {
                Some(network) => add_route(&mut routes, *network, &subnet.ports),
                None => {
                    tracing::debug!(user, subnet = %subnet.id, "unknown subnet id, skipping")
                }
            }
        }
    }

    if nat != Flag::Off {
        if nat == Flag::All {
            for network in &netinfo.nat {
                add_route(&mut routes, *network, &[]);
            }
        }

        for route in &nat_routes {
            add_route(&mut routes, route.network, &route.ports);
        }
    }

    if all_subnets {
        for network in netinfo.subnets.values() {
            add_route(&mut routes, *network, &[]);
        }
    }

    let mut entries: Vec<RouteEntry> = routes
        .into_iter()
        .map(|(network, ports)| RouteEntry {
            network,
            ports: match ports {
                None => Vec::new(),
                Some(set) => set.into_iter().collect(),
            },
        })
        .collect();

    entries.sort_by(|a, b| a.network.to_string().cmp(&b.network.to_string()));

    Ok(UserPolicy {
        dns: if dns == Flag::On {
            DnsMode::On
        } else {
            DnsMode::Off
        },
        routes: entries,
    })
}

fn add_route(routes: &mut BTreeMap<IpNet, PortSet>, network: IpNet, ports: &[u16]) {
    let key = network.trunc();
    let entry = routes.entry(key);

    if ports.is_empty() {
        // All ports absorbs any specific set already recorded.
        *entry.or_insert(None) = None;
        return;
    }

    match entry.or_insert_with(|| Some(BTreeSet::new())) {
        None => {} // already open on all ports
        Some(set) => set.extend(ports.iter().copied()),
    }
}
