//! The supervisor loop: boots the VPN daemon, authorizes clients against
//! the user directory, keeps the packet filter aligned with resolved
//! policy, and re-reconciles on a watch interval.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gatehouse_backend::{Backend, Fetched};
use gatehouse_ca::{make_server_certificate, CertificateStore};
use gatehouse_fw::{Firewall, FirewallRule, IptablesRunner};
use gatehouse_policy::{DnsMode, UserPolicy, DEFAULT_TUNNEL_NET};
use ipnet::{IpNet, Ipv4Net};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mgmt::event::{ClientEvent, StateEvent};
use crate::mgmt::{daemon, MgmtClient, MgmtError};
use crate::sessions::SessionTable;
use crate::users::{Update, UserDirectory, UserError};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Users(#[from] UserError),

    #[error(transparent)]
    Backend(#[from] gatehouse_backend::BackendError),

    #[error(transparent)]
    Ca(#[from] gatehouse_ca::CaError),

    #[error(transparent)]
    Firewall(#[from] gatehouse_fw::FirewallError),

    #[error(transparent)]
    Mgmt(#[from] MgmtError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Unable to load server key")]
    ServerKeyMissing,

    #[error("state channel closed before the tunnel came up")]
    NoTunnel,

    #[error("Failed to register DNS: {0}")]
    DnsRegistration(gatehouse_backend::BackendError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Watch interval when the policy file does not set one.
const DEFAULT_WATCH: Duration = Duration::from_secs(30);

/// Retry interval after a failed reconciliation pass.
const FAILED_WATCH: Duration = Duration::from_secs(300);

pub struct Supervisor {
    directory: UserDirectory,
    firewall: Firewall,
    client: MgmtClient,
    tunnel_ip: Ipv4Addr,
    sessions: RwLock<SessionTable>,
    /// Users that currently own a chain, for teardown when they vanish
    /// from the reconciled set.
    chain_users: Mutex<HashSet<String>>,
}

/// Boot the daemon and run until the management channel dies or a
/// shutdown signal arrives.
pub async fn run(backend: Arc<dyn Backend>, root: PathBuf, verbosity: u8) -> Result<()> {
    let started = std::time::Instant::now();

    let ca = Arc::new(CertificateStore::create(&root.join("capath"))?);
    let directory = UserDirectory::new(backend.clone(), ca);

    let update = directory.update().await?;
    let policy = update.policy.clone();

    let (cert_pem, key_pem) = fetch_server_keys(
        backend.as_ref(),
        policy.domain.as_deref().unwrap_or("vpn"),
    )
    .await?;

    let network = tunnel_network(policy.network);

    daemon::ensure_tun_device()?;
    let config_path = root.join("openvpn.conf");
    daemon::append_config(&config_path, verbosity, network, &cert_pem, &key_pem).await?;

    let (client, mut events) = MgmtClient::start(&root.join("socket"))?;
    let mut child = daemon::spawn_daemon(&config_path)?;

    let (tunnel_ip, tunnel_device) = wait_for_tunnel(&mut events.state).await?;
    tracing::info!(ip = %tunnel_ip, device = %tunnel_device, "tunnel up");

    // State events are only consumed during boot; dropping the receiver
    // lets the reader discard them instead of backing up the channel.
    drop(events.state);

    let firewall = Firewall::init(&tunnel_device, Box::new(IptablesRunner)).await?;

    let supervisor = Arc::new(Supervisor {
        directory,
        firewall,
        client,
        tunnel_ip,
        sessions: RwLock::new(SessionTable::default()),
        chain_users: Mutex::new(HashSet::new()),
    });

    supervisor.apply_update(&update, false).await?;

    if let (Some(zone), Some(domain)) = (&policy.route53_zone, &policy.domain) {
        backend
            .register_dns(zone, domain, policy.weighted)
            .await
            .map_err(SupervisorError::DnsRegistration)?;
    }

    tracing::info!(elapsed = ?started.elapsed(), users = update.users.len(), "server startup");

    let cancel = CancellationToken::new();
    let watch = tokio::spawn(
        supervisor
            .clone()
            .watch_loop(update.watch.unwrap_or(DEFAULT_WATCH), cancel.clone()),
    );

    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = supervisor.event_loop(&mut events.client) => {
            tracing::error!("management channel closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("termination requested, shutting down");
        }
    }

    cancel.cancel();
    let _ = watch.await;

    if let Err(e) = backend.unregister_dns().await {
        tracing::warn!(error = %e, "failed to unregister DNS");
    }

    supervisor.client.shutdown();
    let _ = child.wait().await;

    Ok(())
}

impl Supervisor {
    /// Single consumer of client notifications. Returns when the channel
    /// closes, which is fatal for the supervisor.
    async fn event_loop(&self, events: &mut mpsc::Receiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::Connect { cid, kid, env } => {
                    self.authorize(cid, kid, env, false).await;
                }
                ClientEvent::Reauth { cid, kid, env } => {
                    self.authorize(cid, kid, env, true).await;
                }
                ClientEvent::Established { cid, .. } => {
                    tracing::debug!(cid, "client established");
                }
                ClientEvent::Address { cid, address, primary } => {
                    self.client_address(cid, address, primary).await;
                }
                ClientEvent::Disconnect { cid, .. } => {
                    self.client_disconnect(cid).await;
                }
            }
        }
    }

    async fn authorize(&self, cid: u64, kid: u64, env: HashMap<String, String>, reauth: bool) {
        let user = env.get("X509_1_CN").cloned().unwrap_or_default();
        let cert_hash = env.get("X509_1_OU").cloned().unwrap_or_default();

        // The chain is a strict two-level hierarchy; a third certificate
        // means someone minted below a subordinate.
        if env.contains_key("tls_digest_sha256_3") {
            let reason =
                format!("Denying user {user} with key hash {cert_hash}, depth too high");
            tracing::warn!(cid, "{reason}");
            self.deny(cid, kid, &reason).await;
            return;
        }

        let (policy, alias) = match self.directory.authenticate(&user, &cert_hash).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(cid, user = %user, error = %e, "authentication failed");
                self.deny(cid, kid, &e.to_string()).await;
                return;
            }
        };

        let command = self.auth_command(cid, kid, &policy);

        let evicted = self
            .sessions
            .write()
            .authorize(cid, &user, alias, policy, reauth);

        if let Some(old) = evicted {
            tracing::info!(old_cid = old.cid, user = %user, "killing replaced session");
            if let Some(address) = old.address {
                if let Err(e) = self.firewall.disconnect_user(&old.user, address).await {
                    tracing::warn!(user = %user, error = %e, "failed to unbind replaced session");
                }
            }
            let _ = self.client.exec(&format!("client-kill {}", old.cid), false).await;
        }

        tracing::info!(cid, user = %user, "authorizing client");
        if let Err(e) = self.client.exec(&command, true).await {
            tracing::error!(cid, user = %user, error = %e, "client-auth failed");
        }
    }

    /// Assemble the multi-line `client-auth` body with its push directives.
    fn auth_command(&self, cid: u64, kid: u64, policy: &UserPolicy) -> String {
        let mut command = format!("client-auth {cid} {kid}\n");

        if policy.dns == DnsMode::On {
            command.push_str(&format!("push \"dhcp-option DNS {}\"\n", self.tunnel_ip));
        }

        for route in &policy.routes {
            match route.network {
                IpNet::V4(net) => {
                    command.push_str(&format!(
                        "push \"route {} {}\"\n",
                        net.network(),
                        net.netmask()
                    ));
                }
                IpNet::V6(net) => {
                    command.push_str(&format!("push \"route-ipv6 {net}\"\n"));
                }
            }
        }

        command.push_str("END");
        command
    }

    async fn deny(&self, cid: u64, kid: u64, reason: &str) {
        let command = format!("client-deny {cid} {kid} \"{reason}\"");
        if let Err(e) = self.client.exec(&command, true).await {
            tracing::error!(cid, error = %e, "client-deny failed");
        }
    }

    async fn client_address(&self, cid: u64, address: IpNet, primary: bool) {
        let Some(user) = self.sessions.write().set_address(cid, address) else {
            tracing::warn!(cid, "address notification for unknown client");
            return;
        };

        tracing::debug!(cid, user = %user, %address, primary, "client address assigned");
        if let Err(e) = self.firewall.connect_user(&user, address).await {
            tracing::error!(cid, user = %user, error = %e, "failed to bind client address");
        }
    }

    async fn client_disconnect(&self, cid: u64) {
        let Some(session) = self.sessions.write().remove_cid(cid) else {
            return;
        };

        tracing::info!(cid, user = %session.user, "client disconnected");
        if let Some(address) = session.address {
            if let Err(e) = self.firewall.disconnect_user(&session.user, address).await {
                tracing::warn!(user = %session.user, error = %e, "failed to unbind client");
            }
        }
    }

    /// Kill the user's live session and unbind its address.
    async fn disconnect_user(&self, user: &str) {
        let Some(session) = self.sessions.write().remove_user(user) else {
            return;
        };

        tracing::info!(user, cid = session.cid, "disconnecting user");
        if let Some(address) = session.address {
            if let Err(e) = self.firewall.disconnect_user(user, address).await {
                tracing::warn!(user, error = %e, "failed to unbind user");
            }
        }
        let _ = self
            .client
            .exec(&format!("client-kill {}", session.cid), false)
            .await;
    }

    /// Program chains for the reconciled user set and, during watch
    /// passes, kick sessions whose policy can no longer be pushed in
    /// place.
    async fn apply_update(&self, update: &Update, kick: bool) -> Result<()> {
        for (user, state) in &update.users {
            self.firewall
                .update_user(user, &chain_rules(&state.policy))
                .await?;

            if !kick {
                continue;
            }

            let stale = {
                let sessions = self.sessions.read();
                sessions.session_for_user(user).is_some_and(|session| {
                    !state.keys.contains(&session.alias)
                        || (session.policy.dns == DnsMode::Off)
                            != (state.policy.dns == DnsMode::Off)
                        || session.policy.routes != state.policy.routes
                })
            };

            if stale {
                self.disconnect_user(user).await;
            }
        }

        // Users that dropped out of the reconciled set lose their chain
        // and any live session.
        let vanished: Vec<String> = {
            let mut chain_users = self.chain_users.lock();
            let next: HashSet<String> = update.users.keys().cloned().collect();
            let vanished = chain_users.difference(&next).cloned().collect();
            *chain_users = next;
            vanished
        };

        for user in vanished {
            self.disconnect_user(&user).await;
            if let Err(e) = self.firewall.update_user(&user, &[]).await {
                tracing::warn!(user = %user, error = %e, "failed to drop chain");
            }
        }

        Ok(())
    }

    /// One delayed reconciliation at a time; the next tick is scheduled
    /// only after the pass finishes, and cancellation is checked before
    /// any work starts.
    async fn watch_loop(self: Arc<Self>, initial: Duration, cancel: CancellationToken) {
        let mut interval = initial;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("watch task stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            let started = std::time::Instant::now();

            match self.directory.update().await {
                Ok(update) => {
                    interval = update.watch.unwrap_or(DEFAULT_WATCH);
                    if let Err(e) = self.apply_update(&update, true).await {
                        tracing::warn!(error = %e, "failed to apply updated configuration");
                    }
                    tracing::info!(elapsed = ?started.elapsed(), "configuration updated");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to update configuration");
                    interval = FAILED_WATCH;
                }
            }
        }
    }
}

/// Expand a resolved policy into chain rules: one port-less rule for an
/// any-port route, one rule per listed port otherwise.
fn chain_rules(policy: &UserPolicy) -> Vec<FirewallRule> {
    let mut rules = Vec::with_capacity(policy.routes.len());

    for route in &policy.routes {
        if route.ports.is_empty() {
            rules.push(FirewallRule {
                network: route.network,
                port: None,
            });
        } else {
            for &port in &route.ports {
                rules.push(FirewallRule {
                    network: route.network,
                    port: Some(port),
                });
            }
        }
    }

    rules
}

fn tunnel_network(configured: Option<IpNet>) -> Ipv4Net {
    match configured {
        Some(IpNet::V4(net)) => net,
        Some(IpNet::V6(net)) => {
            tracing::warn!(%net, "tunnel network must be IPv4, using default");
            default_tunnel_network()
        }
        None => default_tunnel_network(),
    }
}

fn default_tunnel_network() -> Ipv4Net {
    DEFAULT_TUNNEL_NET
        .parse()
        .unwrap_or_else(|_| Ipv4Net::new(Ipv4Addr::new(169, 254, 120, 0), 24).unwrap())
}

/// Consume state events until CONNECTED names a tunnel address we can
/// match to a local interface.
async fn wait_for_tunnel(
    state: &mut mpsc::Receiver<StateEvent>,
) -> Result<(Ipv4Addr, String)> {
    while let Some(event) = state.recv().await {
        tracing::debug!(state = %event.state, "daemon state");

        if event.state != "CONNECTED" {
            continue;
        }
        let Some(ipv4) = event.ipv4 else { continue };

        if let Some(device) = find_interface_by_address(ipv4) {
            return Ok((ipv4, device));
        }

        tracing::warn!(%ipv4, "no interface carries the tunnel address yet");
    }

    Err(SupervisorError::NoTunnel)
}

#[cfg(unix)]
fn find_interface_by_address(addr: Ipv4Addr) -> Option<String> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;

    for ifaddr in addrs {
        let Some(sockaddr) = ifaddr.address else { continue };
        if let Some(sin) = sockaddr.as_sockaddr_in() {
            if sin.ip() == addr {
                return Some(ifaddr.interface_name);
            }
        }
    }

    None
}

/// Fetch the persisted server certificate and key, or generate and
/// persist a fresh bundle on first boot.
async fn fetch_server_keys(
    backend: &dyn Backend,
    name: &str,
) -> Result<(String, String)> {
    let cert = match backend.fetch_file("server.crt", None).await? {
        Fetched::Modified { body, .. } => Some(body),
        Fetched::NotModified | Fetched::Missing => None,
    };

    let Some(cert) = cert else {
        tracing::info!("generating a new server certificate");
        let bundle = make_server_certificate(name)?;

        backend.put_file("server.crt", bundle.cert_pem.as_bytes()).await?;
        backend.put_file("server.key", bundle.key_pem.as_bytes()).await?;
        backend.put_file("serverca.crt", bundle.ca_pem.as_bytes()).await?;

        return Ok((bundle.cert_pem, bundle.key_pem));
    };

    let key = match backend.fetch_file("server.key", None).await? {
        Fetched::Modified { body, .. } => body,
        Fetched::NotModified | Fetched::Missing => {
            return Err(SupervisorError::ServerKeyMissing)
        }
    };

    Ok((
        String::from_utf8_lossy(&cert).into_owned(),
        String::from_utf8_lossy(&key).into_owned(),
    ))
}
