//! Line-oriented parser for the policy file.
//!
//! `#` starts a comment, blank lines are skipped. A line starting with a
//! space or tab is a statement inside the current section; anything else
//! opens a section. Repeated sections merge by appending statements.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::{
    parse_duration, parse_network, Flag, ParseError, PolicyFile, Result, Route, Section,
    SectionKind, SubnetRef,
};

struct Statement<'a> {
    word: &'a str,
    args: Vec<&'a str>,
    line: usize,
}

/// Parse the full policy file text into an immutable snapshot.
pub fn parse_policy(input: &str) -> Result<PolicyFile> {
    let mut policy = PolicyFile::empty();

    // (kind, name) of the section statements currently attach to.
    let mut current: Option<(SectionKind, String)> = None;

    for (index, raw) in input.lines().enumerate() {
        let line = index + 1;
        let text = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };

        let mut fields = text.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };
        let rest: Vec<&str> = fields.collect();

        let indented = text.starts_with(' ') || text.starts_with('\t');

        if !indented {
            current = Some(open_section(&mut policy, first, &rest, line)?);
            continue;
        }

        let Some((kind, name)) = &current else {
            return Err(ParseError {
                line,
                reason: format!("illegal statement {first} outside any section"),
            });
        };

        let stmt = Statement {
            word: first,
            args: rest,
            line,
        };

        if *kind == SectionKind::Global && parse_global(&mut policy, &stmt)? {
            continue;
        }

        let section = match kind {
            SectionKind::Global => &mut policy.global,
            SectionKind::Group => policy
                .groups
                .get_mut(name)
                .expect("current group section exists"),
            SectionKind::User => policy
                .users
                .get_mut(name)
                .expect("current user section exists"),
        };

        parse_statement(section, &stmt)?;
    }

    Ok(policy)
}

fn open_section(
    policy: &mut PolicyFile,
    first: &str,
    rest: &[&str],
    line: usize,
) -> Result<(SectionKind, String)> {
    if first == "global" {
        if !rest.is_empty() {
            return Err(ParseError {
                line,
                reason: "global section takes no name".to_string(),
            });
        }
        return Ok((SectionKind::Global, String::new()));
    }

    let (kind, name) = match (first, rest) {
        ("group", [name]) => (SectionKind::Group, *name),
        ("user", [name]) => (SectionKind::User, *name),
        _ => {
            return Err(ParseError {
                line,
                reason: format!("illegal section declaration {first}"),
            })
        }
    };

    match kind {
        SectionKind::Group => {
            let order = policy.groups.len();
            policy
                .groups
                .entry(name.to_string())
                .or_insert_with(|| Section::new(SectionKind::Group, name, order));
        }
        SectionKind::User => {
            policy
                .users
                .entry(name.to_string())
                .or_insert_with(|| Section::new(SectionKind::User, name, 0));
        }
        SectionKind::Global => unreachable!(),
    }

    Ok((kind, name.to_string()))
}

/// Statements only valid under `global` that configure the file itself
/// rather than the global section. Returns false when the word is an
/// ordinary section statement.
fn parse_global(policy: &mut PolicyFile, stmt: &Statement<'_>) -> Result<bool> {
    match stmt.word {
        "watch" => {
            let &[value] = stmt.args.as_slice() else {
                return Err(stmt.error("watch must have exactly one argument"));
            };
            let watch = parse_duration(value)
                .ok_or_else(|| stmt.error(&format!("cannot parse watch duration {value}")))?;
            policy.watch = Some(watch);
            Ok(true)
        }
        "net" => {
            let &[value] = stmt.args.as_slice() else {
                return Err(stmt.error("net must have exactly one argument"));
            };
            policy.network = Some(parse_tunnel_network(value).ok_or_else(|| {
                stmt.error(&format!("cannot parse net {value}"))
            })?);
            Ok(true)
        }
        "route53" => {
            let (zone, domain, mode) = match stmt.args.as_slice() {
                &[zone, domain] => (zone, domain, None),
                &[zone, domain, mode] => (zone, domain, Some(mode)),
                _ => return Err(stmt.error("route53 must have 2 or 3 arguments")),
            };
            policy.route53_zone = Some(zone.to_string());
            policy.domain = Some(domain.to_string());
            policy.weighted = match mode {
                None | Some("simple") => false,
                Some("weighted") => true,
                Some(other) => {
                    return Err(stmt.error(&format!("invalid route53 entry type {other}")))
                }
            };
            Ok(true)
        }
        "key-strength" => {
            let &[value] = stmt.args.as_slice() else {
                return Err(stmt.error("key-strength must have exactly one argument"));
            };
            let strength: u32 = value
                .parse()
                .map_err(|_| stmt.error(&format!("invalid key-strength {value}")))?;
            policy.key_strength = Some(strength);
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn parse_statement(section: &mut Section, stmt: &Statement<'_>) -> Result<()> {
    if stmt.word.starts_with("subnet-") || stmt.word.starts_with("pcx-") {
        let ports = parse_ports(stmt, &stmt.args)?;
        section.subnets.push(SubnetRef {
            id: stmt.word.to_string(),
            ports,
        });
        return Ok(());
    }

    match stmt.word {
        "nat" => {
            let Some(&first) = stmt.args.first() else {
                return Err(stmt.error("nat must have at least one argument"));
            };
            match first {
                "on" | "off" => {
                    if stmt.args.len() > 1 {
                        return Err(
                            stmt.error(&format!("nat cannot have arguments after '{first}'"))
                        );
                    }
                    section.nat = if first == "on" { Flag::All } else { Flag::Off };
                }
                _ => {
                    let route = parse_route(stmt)?;
                    section.nat = Flag::On;
                    section.nat_routes.push(route);
                }
            }
        }
        "route" => {
            let route = parse_route(stmt)?;
            section.routes.push(route);
        }
        "dns" => {
            let &[value] = stmt.args.as_slice() else {
                return Err(stmt.error("dns must have exactly one argument"));
            };
            section.dns = match value {
                "on" => Flag::On,
                "off" => Flag::Off,
                _ => return Err(stmt.error("dns setting must be 'on' or 'off'")),
            };
        }
        other => {
            tracing::debug!(line = stmt.line, word = other, "ignoring unknown statement");
        }
    }

    Ok(())
}

fn parse_route(stmt: &Statement<'_>) -> Result<Route> {
    let Some(&first) = stmt.args.first() else {
        return Err(stmt.error(&format!("{} must have at least one argument", stmt.word)));
    };

    let network = parse_network(first)
        .ok_or_else(|| stmt.error(&format!("cannot parse net {first}")))?;
    let ports = parse_ports(stmt, &stmt.args[1..])?;

    Ok(Route { network, ports })
}

fn parse_ports(stmt: &Statement<'_>, args: &[&str]) -> Result<Vec<u16>> {
    args.iter()
        .map(|value| {
            value
                .parse::<u16>()
                .map_err(|_| stmt.error(&format!("unable to parse port number {value}")))
        })
        .collect()
}

/// `net` accepts a CIDR or a bare IPv4 address, which implies /24.
fn parse_tunnel_network(s: &str) -> Option<IpNet> {
    if s.contains('/') {
        return s.parse::<IpNet>().ok().map(|net| net.trunc());
    }
    let addr: IpAddr = s.parse().ok()?;
    match addr {
        IpAddr::V4(_) => IpNet::new(addr, 24).ok().map(|net| net.trunc()),
        IpAddr::V6(_) => None,
    }
}

impl Statement<'_> {
    fn error(&self, reason: &str) -> ParseError {
        ParseError {
            line: self.line,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parses_sections_and_statements() {
        let policy = parse_policy(
            "# office VPN\n\
             global\n\
             \troute 10.1.0.0/16\n\
             \n\
             group dev\n\
             \troute 10.2.0.0/16 443 8443\n\
             \tsubnet-aaaa 22\n\
             user alice\n\
             \tdns on\n",
        )
        .unwrap();

        assert_eq!(policy.global.routes.len(), 1);
        let dev = &policy.groups["dev"];
        assert_eq!(dev.routes[0].ports, vec![443, 8443]);
        assert_eq!(dev.subnets[0].id, "subnet-aaaa");
        assert_eq!(dev.subnets[0].ports, vec![22]);
        assert_eq!(policy.users["alice"].dns, Flag::On);
    }

    #[test]
    fn statement_outside_section_is_an_error() {
        let err = parse_policy("\troute 10.0.0.0/8\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.reason.contains("outside any section"));
    }

    #[test]
    fn bad_section_header_is_an_error() {
        let err = parse_policy("group one two\n").unwrap_err();
        assert_eq!(err.line, 1);
    }

    #[test]
    fn repeated_sections_merge() {
        let policy = parse_policy(
            "group dev\n\
             \troute 10.1.0.0/16\n\
             group ops\n\
             \troute 10.9.0.0/16\n\
             group dev\n\
             \troute 10.2.0.0/16\n",
        )
        .unwrap();

        assert_eq!(policy.groups["dev"].routes.len(), 2);
        assert_eq!(policy.groups["dev"].order, 0);
        assert_eq!(policy.groups["ops"].order, 1);
    }

    #[test]
    fn global_only_statements_fill_the_policy() {
        let policy = parse_policy(
            "global\n\
             \twatch 2m\n\
             \tnet 10.8.0.0/24\n\
             \troute53 Z123 vpn.example.com weighted\n\
             \tkey-strength 2048\n",
        )
        .unwrap();

        assert_eq!(policy.watch, Some(Duration::from_secs(120)));
        assert_eq!(policy.network.unwrap().to_string(), "10.8.0.0/24");
        assert_eq!(policy.route53_zone.as_deref(), Some("Z123"));
        assert_eq!(policy.domain.as_deref(), Some("vpn.example.com"));
        assert!(policy.weighted);
        assert_eq!(policy.key_strength, Some(2048));
    }

    #[test]
    fn net_bare_ip_implies_slash_24() {
        let policy = parse_policy("global\n\tnet 10.8.0.0\n").unwrap();
        assert_eq!(policy.network.unwrap().to_string(), "10.8.0.0/24");
    }

    #[test]
    fn bare_route_ip_is_host_route() {
        let policy = parse_policy("global\n\troute 10.5.5.5\n").unwrap();
        assert_eq!(policy.global.routes[0].network.to_string(), "10.5.5.5/32");
    }

    #[test]
    fn nat_forms() {
        let policy = parse_policy(
            "group a\n\
             \tnat on\n\
             group b\n\
             \tnat off\n\
             group c\n\
             \tnat 192.168.1.0/24 443\n",
        )
        .unwrap();

        assert_eq!(policy.groups["a"].nat, Flag::All);
        assert_eq!(policy.groups["b"].nat, Flag::Off);
        let c = &policy.groups["c"];
        assert_eq!(c.nat, Flag::On);
        assert_eq!(c.nat_routes[0].ports, vec![443]);
    }

    #[test]
    fn nat_on_with_trailing_arguments_is_an_error() {
        assert!(parse_policy("group a\n\tnat on 443\n").is_err());
    }

    #[test]
    fn bad_port_reports_the_line() {
        let err = parse_policy("global\n\n\troute 10.0.0.0/8 http\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.reason.contains("port"));
    }

    #[test]
    fn bad_watch_duration_is_an_error() {
        assert!(parse_policy("global\n\twatch soon\n").is_err());
    }

    #[test]
    fn render_round_trips() {
        let text = "global\n\
             \twatch 90s\n\
             \tnet 10.8.0.0/24\n\
             \troute 10.1.0.0/16\n\
             group dev\n\
             \tdns on\n\
             \tnat 192.168.0.0/24\n\
             \troute 10.2.0.0/16 443\n\
             \tsubnet-abc 22\n\
             user alice\n\
             \tnat off\n";
        let policy = parse_policy(text).unwrap();
        let rendered = policy.render();
        let reparsed = parse_policy(&rendered).unwrap();

        assert_eq!(reparsed.render(), rendered);
        assert_eq!(reparsed.watch, policy.watch);
        assert_eq!(reparsed.groups["dev"].routes, policy.groups["dev"].routes);
        assert_eq!(reparsed.users["alice"].nat, policy.users["alice"].nat);
    }
}
