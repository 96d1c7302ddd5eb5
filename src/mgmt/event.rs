//! Notification parsing for the daemon's management channel.
//!
//! Asynchronous notifications are prefixed with `>`. STATE lines are flat;
//! CLIENT lines for CONNECT/REAUTH/ESTABLISHED/DISCONNECT are followed by
//! an environment block terminated by `>CLIENT:ENV,END`; ADDRESS lines
//! carry the assigned tunnel address inline.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{IpNet, Ipv4Net};

use super::MgmtError;

#[derive(Debug, Clone)]
pub struct StateEvent {
    pub time: i64,
    pub state: String,
    pub description: String,
    pub ipv4: Option<Ipv4Addr>,
    pub remote_address: Option<IpAddr>,
    pub remote_port: Option<u16>,
    pub local_address: Option<IpAddr>,
    pub local_port: Option<u16>,
    pub ipv6: Option<Ipv6Addr>,
}

/// Kind of client notification, before any environment block is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHeader {
    Connect { cid: u64, kid: u64 },
    Reauth { cid: u64, kid: u64 },
    Established { cid: u64 },
    Disconnect { cid: u64 },
    Address { cid: u64, address: IpNet, primary: bool },
}

/// A fully assembled client notification.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connect {
        cid: u64,
        kid: u64,
        env: HashMap<String, String>,
    },
    Reauth {
        cid: u64,
        kid: u64,
        env: HashMap<String, String>,
    },
    Established {
        cid: u64,
        env: HashMap<String, String>,
    },
    Disconnect {
        cid: u64,
        env: HashMap<String, String>,
    },
    Address {
        cid: u64,
        address: IpNet,
        primary: bool,
    },
}

impl ClientHeader {
    /// Whether an environment block follows this header on the wire.
    pub fn has_env(&self) -> bool {
        !matches!(self, ClientHeader::Address { .. })
    }

    pub fn into_event(self, env: HashMap<String, String>) -> ClientEvent {
        match self {
            ClientHeader::Connect { cid, kid } => ClientEvent::Connect { cid, kid, env },
            ClientHeader::Reauth { cid, kid } => ClientEvent::Reauth { cid, kid, env },
            ClientHeader::Established { cid } => ClientEvent::Established { cid, env },
            ClientHeader::Disconnect { cid } => ClientEvent::Disconnect { cid, env },
            ClientHeader::Address {
                cid,
                address,
                primary,
            } => ClientEvent::Address {
                cid,
                address,
                primary,
            },
        }
    }
}

pub const STATE_PREFIX: &str = ">STATE:";
pub const CLIENT_PREFIX: &str = ">CLIENT:";
const ENV_PREFIX: &str = ">CLIENT:ENV,";
const ENV_END: &str = ">CLIENT:ENV,END";

fn bad_line(line: &str) -> MgmtError {
    MgmtError::Protocol(line.to_string())
}

/// `>STATE:<ts>,<state>,<descr>,<ipv4>,<raddr>,<rport>,<laddr>,<lport>[,<ipv6>]`
pub fn parse_state_event(line: &str) -> Result<StateEvent, MgmtError> {
    let rest = line
        .strip_prefix(STATE_PREFIX)
        .ok_or_else(|| bad_line(line))?;
    let parts: Vec<&str> = rest.split(',').collect();

    if parts.len() < 8 {
        return Err(bad_line(line));
    }

    Ok(StateEvent {
        time: parts[0].parse().map_err(|_| bad_line(line))?,
        state: parts[1].to_string(),
        description: parts[2].to_string(),
        ipv4: parts[3].parse().ok(),
        remote_address: parts[4].parse().ok(),
        remote_port: parse_optional_port(parts[5], line)?,
        local_address: parts[6].parse().ok(),
        local_port: parse_optional_port(parts[7], line)?,
        ipv6: parts.get(8).and_then(|p| p.parse().ok()),
    })
}

fn parse_optional_port(field: &str, line: &str) -> Result<Option<u16>, MgmtError> {
    if field.is_empty() {
        return Ok(None);
    }
    field.parse().map(Some).map_err(|_| bad_line(line))
}

/// First line of a `>CLIENT:` notification.
pub fn parse_client_header(line: &str) -> Result<ClientHeader, MgmtError> {
    let rest = line
        .strip_prefix(CLIENT_PREFIX)
        .ok_or_else(|| bad_line(line))?;
    let parts: Vec<&str> = rest.split(',').collect();

    let [kind, cid, tail @ ..] = &parts[..] else {
        return Err(bad_line(line));
    };
    let cid: u64 = cid.parse().map_err(|_| bad_line(line))?;

    match (*kind, tail) {
        ("CONNECT", [kid]) => Ok(ClientHeader::Connect {
            cid,
            kid: kid.parse().map_err(|_| bad_line(line))?,
        }),
        ("REAUTH", [kid]) => Ok(ClientHeader::Reauth {
            cid,
            kid: kid.parse().map_err(|_| bad_line(line))?,
        }),
        ("ESTABLISHED", []) => Ok(ClientHeader::Established { cid }),
        ("DISCONNECT", []) => Ok(ClientHeader::Disconnect { cid }),
        ("ADDRESS", [address, primary]) => Ok(ClientHeader::Address {
            cid,
            address: parse_client_address(address).ok_or_else(|| bad_line(line))?,
            primary: *primary == "1",
        }),
        _ => Err(bad_line(line)),
    }
}

/// `<addr>` or `<addr>/<mask-ip>`, the mask given as a dotted netmask.
fn parse_client_address(field: &str) -> Option<IpNet> {
    match field.split_once('/') {
        None => {
            let addr: IpAddr = field.parse().ok()?;
            let prefix = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            IpNet::new(addr, prefix).ok()
        }
        Some((addr, mask)) => {
            let addr: Ipv4Addr = addr.parse().ok()?;
            let mask: Ipv4Addr = mask.parse().ok()?;
            Ipv4Net::with_netmask(addr, mask).ok().map(IpNet::V4)
        }
    }
}

/// One line of an environment block. Returns `None` at the terminator.
pub fn parse_env_line(line: &str) -> Result<Option<(String, String)>, MgmtError> {
    if line == ENV_END {
        return Ok(None);
    }

    let var = line.strip_prefix(ENV_PREFIX).ok_or_else(|| bad_line(line))?;
    let (name, value) = var.split_once('=').ok_or_else(|| bad_line(line))?;

    Ok(Some((name.to_string(), value.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_connected_line() {
        let event = parse_state_event(
            ">STATE:1693000000,CONNECTED,SUCCESS,10.8.0.1,203.0.113.9,1194,10.0.0.5,41194",
        )
        .unwrap();

        assert_eq!(event.state, "CONNECTED");
        assert_eq!(event.ipv4, Some("10.8.0.1".parse().unwrap()));
        assert_eq!(event.remote_port, Some(1194));
        assert_eq!(event.local_port, Some(41194));
        assert!(event.ipv6.is_none());
    }

    #[test]
    fn state_line_with_empty_ports_and_ipv6() {
        let event = parse_state_event(
            ">STATE:1693000000,WAIT,,,,,,,fd00::1",
        )
        .unwrap();

        assert_eq!(event.state, "WAIT");
        assert!(event.ipv4.is_none());
        assert_eq!(event.remote_port, None);
        assert_eq!(event.ipv6, Some("fd00::1".parse().unwrap()));
    }

    #[test]
    fn state_line_too_short_is_an_error() {
        assert!(parse_state_event(">STATE:123,CONNECTED").is_err());
    }

    #[test]
    fn connect_header() {
        let header = parse_client_header(">CLIENT:CONNECT,7,2").unwrap();
        assert_eq!(header, ClientHeader::Connect { cid: 7, kid: 2 });
        assert!(header.has_env());
    }

    #[test]
    fn reauth_header() {
        let header = parse_client_header(">CLIENT:REAUTH,7,3").unwrap();
        assert_eq!(header, ClientHeader::Reauth { cid: 7, kid: 3 });
    }

    #[test]
    fn disconnect_and_established_headers() {
        assert_eq!(
            parse_client_header(">CLIENT:DISCONNECT,9").unwrap(),
            ClientHeader::Disconnect { cid: 9 }
        );
        assert_eq!(
            parse_client_header(">CLIENT:ESTABLISHED,9").unwrap(),
            ClientHeader::Established { cid: 9 }
        );
    }

    #[test]
    fn address_header_with_netmask() {
        let header = parse_client_header(">CLIENT:ADDRESS,4,10.8.0.6/255.255.255.0,1").unwrap();
        let ClientHeader::Address {
            cid,
            address,
            primary,
        } = header
        else {
            panic!("not an address header");
        };

        assert_eq!(cid, 4);
        assert_eq!(address.to_string(), "10.8.0.6/24");
        assert!(primary);
        assert!(!ClientHeader::Address {
            cid,
            address,
            primary
        }
        .has_env());
    }

    #[test]
    fn address_header_without_mask_is_a_host() {
        let header = parse_client_header(">CLIENT:ADDRESS,4,10.8.0.6,0").unwrap();
        let ClientHeader::Address { address, primary, .. } = header else {
            panic!("not an address header");
        };
        assert_eq!(address.to_string(), "10.8.0.6/32");
        assert!(!primary);
    }

    #[test]
    fn malformed_headers_are_errors() {
        assert!(parse_client_header(">CLIENT:CONNECT,x,2").is_err());
        assert!(parse_client_header(">CLIENT:CONNECT,1").is_err());
        assert!(parse_client_header(">CLIENT:NONSENSE,1").is_err());
        assert!(parse_client_header(">CLIENT:ADDRESS,1,nonsense,0").is_err());
    }

    #[test]
    fn env_lines_until_terminator() {
        assert_eq!(
            parse_env_line(">CLIENT:ENV,X509_1_CN=alice").unwrap(),
            Some(("X509_1_CN".to_string(), "alice".to_string()))
        );
        assert_eq!(
            parse_env_line(">CLIENT:ENV,empty=").unwrap(),
            Some(("empty".to_string(), String::new()))
        );
        assert_eq!(parse_env_line(">CLIENT:ENV,END").unwrap(), None);
        assert!(parse_env_line(">CLIENT:ENV,novalue").is_err());
        assert!(parse_env_line("garbage").is_err());
    }
}
