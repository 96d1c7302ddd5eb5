//! Packet-filter reconciler: one iptables chain per active user.
//!
//! The chain named `user-<name>` holds one ACCEPT rule per (destination,
//! port) the user's resolved policy grants. Reconciliation diffs desired
//! against current and emits the minimal replace/append/delete commands; a
//! failed command mid-reconcile rebuilds the chain from scratch so the
//! in-memory view never diverges from the filter.
//!
//! Lock order: the address-binding mutex is taken before the chain lock.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;

use async_trait::async_trait;
use ipnet::IpNet;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to execute iptables {args:?}: {output}")]
    Command { args: Vec<String>, output: String },

    #[error("no chain for user {0}")]
    ChainMissing(String),

    #[error("unable to find default route")]
    NoDefaultRoute,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FirewallError>;

/// One rule of a user chain. `port: None` admits every TCP and non-TCP
/// destination port; a port-bearing rule matches TCP only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirewallRule {
    pub network: IpNet,
    pub port: Option<u16>,
}

/// Executes the packet-filter tool. Tests substitute a recorder.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> Result<()>;
}

/// Runs the real `iptables` binary.
pub struct IptablesRunner;

#[async_trait]
impl CommandRunner for IptablesRunner {
    async fn run(&self, args: &[String]) -> Result<()> {
        tracing::debug!(?args, "running iptables");

        let output = tokio::process::Command::new("iptables")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(FirewallError::Command {
                args: args.to_vec(),
                output: combined,
            });
        }

        Ok(())
    }
}

pub struct Firewall {
    vpn_interface: String,
    runner: Box<dyn CommandRunner>,
    chains: RwLock<HashMap<String, Vec<FirewallRule>>>,
    bindings: Mutex<HashMap<IpNet, String>>,
}

impl Firewall {
    /// Program the host baseline and discover the wan interface: forward
    /// policy drops, forwarding enabled, masquerade on the default-route
    /// interface, conntrack continuation accepted.
    pub async fn init(vpn_interface: &str, runner: Box<dyn CommandRunner>) -> Result<Self> {
        runner.run(&args(&["--policy", "FORWARD", "DROP"])).await?;

        let forward = tokio::fs::read("/proc/sys/net/ipv4/ip_forward").await?;
        if forward.first() != Some(&b'1') {
            tokio::fs::write("/proc/sys/net/ipv4/ip_forward", b"1").await?;
        }

        let route_table = tokio::fs::read_to_string("/proc/net/route").await?;
        let wan_interface = default_route_interface(&route_table)?;
        tracing::info!(wan = %wan_interface, vpn = vpn_interface, "firewall interfaces");

        runner
            .run(&args(&[
                "--table",
                "nat",
                "--append",
                "POSTROUTING",
                "--out-interface",
                &wan_interface,
                "--jump",
                "MASQUERADE",
            ]))
            .await?;

        runner
            .run(&args(&[
                "--append",
                "FORWARD",
                "--match",
                "conntrack",
                "--ctstate",
                "RELATED,ESTABLISHED",
                "--jump",
                "ACCEPT",
            ]))
            .await?;

        Ok(Firewall {
            vpn_interface: vpn_interface.to_string(),
            runner,
            chains: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        })
    }

    /// Construction for tests: no baseline programming, no proc access.
    pub fn with_runner(vpn_interface: &str, runner: Box<dyn CommandRunner>) -> Self {
        Firewall {
            vpn_interface: vpn_interface.to_string(),
            runner,
            chains: RwLock::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Reconcile the user's chain to exactly `rules`.
    pub async fn update_user(&self, user: &str, rules: &[FirewallRule]) -> Result<()> {
        let desired: HashSet<FirewallRule> = rules.iter().copied().collect();

        {
            let chains = self.chains.read().await;
            if !needs_update(chains.get(user), &desired) {
                return Ok(());
            }
        }

        let mut chains = self.chains.write().await;
        let current = chains.get(user);

        if !needs_update(current, &desired) {
            return Ok(());
        }

        let chain = chain_name(user);

        match (current, desired.is_empty()) {
            (None, true) => Ok(()),
            (Some(_), true) => {
                tracing::info!(user, "deleting user chain");
                chains.remove(user);
                self.drop_chain(&chain).await
            }
            (None, false) => {
                tracing::info!(user, rules = desired.len(), "adding user chain");
                self.runner.run(&args(&["--new-chain", &chain])).await?;

                match self.fill_chain(&chain, &desired).await {
                    Ok(applied) => {
                        chains.insert(user.to_string(), applied);
                        Ok(())
                    }
                    Err(e) => {
                        self.rebuild_chain(user, &mut chains, &desired).await?;
                        tracing::warn!(user, error = %e, "chain rebuilt after failed fill");
                        Ok(())
                    }
                }
            }
            (Some(current), false) => {
                tracing::info!(user, rules = desired.len(), "updating user chain");
                let mut state = current.clone();

                match self.apply_diff(&chain, &mut state, &desired).await {
                    Ok(()) => {
                        chains.insert(user.to_string(), state);
                        Ok(())
                    }
                    Err(e) => {
                        // Partial application: the filter no longer matches
                        // any recorded state. Rebuild from zero.
                        self.rebuild_chain(user, &mut chains, &desired).await?;
                        tracing::warn!(user, error = %e, "chain rebuilt after failed reconcile");
                        Ok(())
                    }
                }
            }
        }
    }

    /// Bind a connected client address to the user's chain. A stale binding
    /// of the same address to another user is withdrawn first.
    pub async fn connect_user(&self, user: &str, address: IpNet) -> Result<()> {
        let mut bindings = self.bindings.lock().await;

        if let Some(existing) = bindings.get(&address) {
            if existing != user {
                let existing = existing.clone();
                self.forward_rule("--delete", &existing, address).await?;
            }
        }

        // Hold the chain lock so the jump target cannot be deleted between
        // the check and the append.
        let chains = self.chains.read().await;
        if !chains.contains_key(user) {
            return Err(FirewallError::ChainMissing(user.to_string()));
        }

        bindings.insert(address, user.to_string());
        self.forward_rule("--append", user, address).await
    }

    /// Unbind a client address; a no-op when the address is bound to a
    /// different user (the binding was already replaced).
    pub async fn disconnect_user(&self, user: &str, address: IpNet) -> Result<()> {
        let mut bindings = self.bindings.lock().await;

        if bindings.get(&address).map(String::as_str) == Some(user) {
            bindings.remove(&address);
            return self.forward_rule("--delete", user, address).await;
        }

        Ok(())
    }

    async fn forward_rule(&self, op: &str, user: &str, address: IpNet) -> Result<()> {
        self.runner
            .run(&args(&[
                op,
                "FORWARD",
                "--in-interface",
                &self.vpn_interface,
                "--source",
                &address.to_string(),
                "--jump",
                &chain_name(user),
            ]))
            .await
    }

    /// Emit the minimal command set transforming `state` into `desired`.
    async fn apply_diff(
        &self,
        chain: &str,
        state: &mut Vec<FirewallRule>,
        desired: &HashSet<FirewallRule>,
    ) -> Result<()> {
        let mut remaining = desired.clone();
        let mut retired: Vec<usize> = Vec::new();

        for (index, rule) in state.iter().enumerate() {
            if !remaining.remove(rule) {
                retired.push(index);
            }
        }

        let mut additions: Vec<FirewallRule> = remaining.into_iter().collect();
        additions.sort_by_key(|rule| (rule.network.to_string(), rule.port));

        let mut retire_iter = retired.iter();
        let mut reused = 0usize;

        for rule in additions {
            match retire_iter.next() {
                Some(&slot) => {
                    self.runner
                        .run(&rule_args(
                            RuleOp::Replace(slot + 1),
                            chain,
                            &self.vpn_interface,
                            &rule,
                        ))
                        .await?;
                    state[slot] = rule;
                    reused += 1;
                }
                None => {
                    self.runner
                        .run(&rule_args(RuleOp::Append, chain, &self.vpn_interface, &rule))
                        .await?;
                    state.push(rule);
                }
            }
        }

        // Trailing slots with no replacement are deleted back to front so
        // earlier rule numbers stay valid.
        for &slot in retired[reused..].iter().rev() {
            self.runner
                .run(&args(&["--delete", chain, &(slot + 1).to_string()]))
                .await?;
            state.remove(slot);
        }

        Ok(())
    }

    async fn fill_chain(
        &self,
        chain: &str,
        desired: &HashSet<FirewallRule>,
    ) -> Result<Vec<FirewallRule>> {
        let mut rules: Vec<FirewallRule> = desired.iter().copied().collect();
        rules.sort_by_key(|rule| (rule.network.to_string(), rule.port));

        for rule in &rules {
            self.runner
                .run(&rule_args(RuleOp::Append, chain, &self.vpn_interface, rule))
                .await?;
        }

        Ok(rules)
    }

    /// Recovery path: flush the chain and re-add every desired rule. On
    /// success the recorded state matches the filter again; on failure the
    /// user's entry is dropped so the next reconcile starts from nothing.
    async fn rebuild_chain(
        &self,
        user: &str,
        chains: &mut HashMap<String, Vec<FirewallRule>>,
        desired: &HashSet<FirewallRule>,
    ) -> Result<()> {
        let chain = chain_name(user);
        chains.remove(user);

        self.runner.run(&args(&["--flush", &chain])).await?;

        let applied = self.fill_chain(&chain, desired).await?;
        chains.insert(user.to_string(), applied);
        Ok(())
    }

    async fn drop_chain(&self, chain: &str) -> Result<()> {
        self.runner.run(&args(&["--flush", chain])).await?;
        self.runner.run(&args(&["--delete-chain", chain])).await
    }
}

enum RuleOp {
    Append,
    Replace(usize),
}

fn chain_name(user: &str) -> String {
    format!("user-{user}")
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn rule_args(op: RuleOp, chain: &str, interface: &str, rule: &FirewallRule) -> Vec<String> {
    let mut out = match op {
        RuleOp::Append => vec!["--append".to_string(), chain.to_string()],
        RuleOp::Replace(rulenum) => vec![
            "--replace".to_string(),
            chain.to_string(),
            rulenum.to_string(),
        ],
    };

    out.extend(args(&[
        "--destination",
        &rule.network.to_string(),
        "--in-interface",
        interface,
    ]));

    if let Some(port) = rule.port {
        out.extend(args(&[
            "--protocol",
            "tcp",
            "--match",
            "tcp",
            "--dport",
            &port.to_string(),
        ]));
    }

    out.extend(args(&[
        "--match", "conntrack", "--ctstate", "NEW", "--jump", "ACCEPT",
    ]));

    out
}

fn needs_update(current: Option<&Vec<FirewallRule>>, desired: &HashSet<FirewallRule>) -> bool {
    match current {
        None => !desired.is_empty(),
        Some(current) => {
            current.len() != desired.len()
                || current.iter().any(|rule| !desired.contains(rule))
        }
    }
}

fn default_route_interface(route_table: &str) -> Result<String> {
    // /proc/net/route: header line, then "Iface Destination Gateway ...",
    // destinations in little-endian hex. 00000000 is the default route.
    for line in route_table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 && fields[1] == "00000000" {
            return Ok(fields[0].to_string());
        }
    }

    Err(FirewallError::NoDefaultRoute)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        commands: Arc<SyncMutex<Vec<Vec<String>>>>,
        fail_on: Arc<SyncMutex<Option<String>>>,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, args: &[String]) -> Result<()> {
            if let Some(marker) = self.fail_on.lock().clone() {
                if args.contains(&marker) {
                    self.fail_on.lock().take();
                    return Err(FirewallError::Command {
                        args: args.to_vec(),
                        output: "injected failure".to_string(),
                    });
                }
            }
            self.commands.lock().push(args.to_vec());
            Ok(())
        }
    }

    fn recorder_firewall() -> (Firewall, Arc<SyncMutex<Vec<Vec<String>>>>) {
        let recorder = Recorder::default();
        let commands = recorder.commands.clone();
        (Firewall::with_runner("tun0", Box::new(recorder)), commands)
    }

    fn rule(net: &str, port: Option<u16>) -> FirewallRule {
        FirewallRule {
            network: net.parse().unwrap(),
            port,
        }
    }

    fn count_ops(commands: &[Vec<String>], op: &str) -> usize {
        commands.iter().filter(|c| c[0] == op).count()
    }

    #[tokio::test]
    async fn first_update_creates_and_fills_the_chain() {
        let (fw, commands) = recorder_firewall();

        fw.update_user("alice", &[rule("10.0.0.0/24", None), rule("10.1.0.0/24", Some(443))])
            .await
            .unwrap();

        let commands = commands.lock();
        assert_eq!(commands[0], args(&["--new-chain", "user-alice"]));
        assert_eq!(count_ops(&commands, "--append"), 2);

        let with_port = commands
            .iter()
            .find(|c| c.contains(&"--dport".to_string()))
            .unwrap();
        assert!(with_port.contains(&"443".to_string()));
        assert!(with_port.contains(&"tcp".to_string()));
    }

    #[tokio::test]
    async fn same_rules_twice_is_idempotent() {
        let (fw, commands) = recorder_firewall();
        let rules = [rule("10.0.0.0/24", None), rule("10.1.0.0/24", Some(443))];

        fw.update_user("alice", &rules).await.unwrap();
        let after_first = commands.lock().len();

        fw.update_user("alice", &rules).await.unwrap();
        assert_eq!(commands.lock().len(), after_first);
    }

    #[tokio::test]
    async fn rule_order_does_not_matter() {
        let (fw, commands) = recorder_firewall();

        fw.update_user("alice", &[rule("10.0.0.0/24", None), rule("10.1.0.0/24", Some(443))])
            .await
            .unwrap();
        let after_first = commands.lock().len();

        fw.update_user("alice", &[rule("10.1.0.0/24", Some(443)), rule("10.0.0.0/24", None)])
            .await
            .unwrap();
        assert_eq!(commands.lock().len(), after_first);
    }

    #[tokio::test]
    async fn retired_slot_is_reused_by_replace() {
        let (fw, commands) = recorder_firewall();

        fw.update_user("alice", &[rule("10.0.0.0/24", None), rule("10.1.0.0/24", None)])
            .await
            .unwrap();
        commands.lock().clear();

        fw.update_user("alice", &[rule("10.0.0.0/24", None), rule("10.2.0.0/24", None)])
            .await
            .unwrap();

        let commands = commands.lock();
        assert_eq!(count_ops(&commands, "--replace"), 1);
        assert_eq!(count_ops(&commands, "--append"), 0);
        assert_eq!(count_ops(&commands, "--delete"), 0);
    }

    #[tokio::test]
    async fn shrinking_deletes_trailing_slots() {
        let (fw, commands) = recorder_firewall();

        fw.update_user(
            "alice",
            &[
                rule("10.0.0.0/24", None),
                rule("10.1.0.0/24", None),
                rule("10.2.0.0/24", None),
            ],
        )
        .await
        .unwrap();
        commands.lock().clear();

        fw.update_user("alice", &[rule("10.0.0.0/24", None)]).await.unwrap();

        let commands = commands.lock();
        assert_eq!(count_ops(&commands, "--delete"), 2);
    }

    #[tokio::test]
    async fn empty_desired_tears_down_the_chain() {
        let (fw, commands) = recorder_firewall();

        fw.update_user("alice", &[rule("10.0.0.0/24", None)]).await.unwrap();
        commands.lock().clear();

        fw.update_user("alice", &[]).await.unwrap();

        {
            let commands = commands.lock();
            assert_eq!(commands[0], args(&["--flush", "user-alice"]));
            assert_eq!(commands[1], args(&["--delete-chain", "user-alice"]));
        }

        // And tearing down an absent chain is a no-op.
        commands.lock().clear();
        fw.update_user("alice", &[]).await.unwrap();
        assert!(commands.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_reconcile_rebuilds_from_scratch() {
        let recorder = Recorder::default();
        let commands = recorder.commands.clone();
        let fail_on = recorder.fail_on.clone();
        let fw = Firewall::with_runner("tun0", Box::new(recorder));

        fw.update_user("alice", &[rule("10.0.0.0/24", None), rule("10.1.0.0/24", None)])
            .await
            .unwrap();
        commands.lock().clear();

        // Fail the replace; the rebuild path must flush and re-add both
        // desired rules.
        *fail_on.lock() = Some("--replace".to_string());
        fw.update_user("alice", &[rule("10.0.0.0/24", None), rule("10.2.0.0/24", None)])
            .await
            .unwrap();

        {
            let commands = commands.lock();
            assert!(commands.iter().any(|c| c[0] == "--flush"));
            assert_eq!(count_ops(&commands, "--append"), 2);
        }

        // The recorded state matches the rebuilt chain: re-applying the
        // same set emits nothing.
        commands.lock().clear();
        fw.update_user("alice", &[rule("10.0.0.0/24", None), rule("10.2.0.0/24", None)])
            .await
            .unwrap();
        assert!(commands.lock().is_empty());
    }

    #[tokio::test]
    async fn connect_requires_the_chain_and_binds_the_address() {
        let (fw, commands) = recorder_firewall();
        let addr: IpNet = "10.8.0.6/32".parse().unwrap();

        assert!(matches!(
            fw.connect_user("alice", addr).await,
            Err(FirewallError::ChainMissing(_))
        ));

        fw.update_user("alice", &[rule("10.0.0.0/24", None)]).await.unwrap();
        commands.lock().clear();

        fw.connect_user("alice", addr).await.unwrap();

        let commands = commands.lock();
        assert_eq!(
            commands[0],
            args(&[
                "--append",
                "FORWARD",
                "--in-interface",
                "tun0",
                "--source",
                "10.8.0.6/32",
                "--jump",
                "user-alice",
            ])
        );
    }

    #[tokio::test]
    async fn rebinding_an_address_withdraws_the_old_user() {
        let (fw, commands) = recorder_firewall();
        let addr: IpNet = "10.8.0.6/32".parse().unwrap();

        fw.update_user("alice", &[rule("10.0.0.0/24", None)]).await.unwrap();
        fw.update_user("bob", &[rule("10.0.0.0/24", None)]).await.unwrap();
        fw.connect_user("alice", addr).await.unwrap();
        commands.lock().clear();

        fw.connect_user("bob", addr).await.unwrap();

        let commands = commands.lock();
        assert_eq!(commands[0][0], "--delete");
        assert!(commands[0].contains(&"user-alice".to_string()));
        assert_eq!(commands[1][0], "--append");
        assert!(commands[1].contains(&"user-bob".to_string()));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_owner_checked() {
        let (fw, commands) = recorder_firewall();
        let addr: IpNet = "10.8.0.6/32".parse().unwrap();

        fw.update_user("alice", &[rule("10.0.0.0/24", None)]).await.unwrap();
        fw.connect_user("alice", addr).await.unwrap();
        commands.lock().clear();

        // Wrong owner: nothing happens.
        fw.disconnect_user("bob", addr).await.unwrap();
        assert!(commands.lock().is_empty());

        fw.disconnect_user("alice", addr).await.unwrap();
        assert_eq!(commands.lock().len(), 1);

        // Second disconnect: binding already gone.
        commands.lock().clear();
        fw.disconnect_user("alice", addr).await.unwrap();
        assert!(commands.lock().is_empty());
    }

    #[test]
    fn default_route_parsing() {
        let table = "Iface\tDestination\tGateway\n\
                     eth1\t0A000000\t00000000\n\
                     eth0\t00000000\t0100000A\n";
        assert_eq!(default_route_interface(table).unwrap(), "eth0");

        assert!(matches!(
            default_route_interface("Iface\tDestination\n"),
            Err(FirewallError::NoDefaultRoute)
        ));
    }
}
