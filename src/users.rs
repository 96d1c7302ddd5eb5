//! User/key coordination: reconciles the policy file, group membership,
//! and per-user key sets against the certificate store, and authenticates
//! presented certificate hashes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use gatehouse_backend::{Backend, BackendError, Fetched};
use gatehouse_ca::{parse_rsa_public_key, CaError, CertificateStore};
use gatehouse_policy::{
    parse_policy, resolve_user, NetworkInfo, ParseError, PolicyFile, ResolveError, UserPolicy,
};
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("Unable to load vpn configuration")]
    ConfigMissing,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("User {0} not found")]
    UserNotFound(String),

    #[error("User {0} does not exist")]
    UserGone(String),

    #[error("Key {alias} does not exist for user {user}")]
    KeyGone { user: String, alias: String },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("no policy snapshot loaded")]
    NotLoaded,
}

pub type Result<T> = std::result::Result<T, UserError>;

/// Per-user outcome of one reconciliation pass.
pub struct UserState {
    pub keys: HashSet<String>,
    pub policy: UserPolicy,
}

/// The full outcome of one reconciliation pass.
pub struct Update {
    pub users: HashMap<String, UserState>,
    pub watch: Option<Duration>,
    pub policy: Arc<PolicyFile>,
}

#[derive(Default)]
struct UserKeys {
    by_alias: HashMap<String, String>,
    by_hash: HashMap<String, String>,
}

#[derive(Default)]
struct DirectoryState {
    policy: Option<Arc<PolicyFile>>,
    policy_tag: Option<String>,
    netinfo: Option<Arc<NetworkInfo>>,
    user_groups: HashMap<String, Vec<String>>,
    users: HashMap<String, UserKeys>,
}

/// Owns the alias↔cert-hash index and the cached policy snapshot.
pub struct UserDirectory {
    backend: Arc<dyn Backend>,
    ca: Arc<CertificateStore>,
    state: RwLock<DirectoryState>,
}

impl UserDirectory {
    pub fn new(backend: Arc<dyn Backend>, ca: Arc<CertificateStore>) -> Self {
        UserDirectory {
            backend,
            ca,
            state: RwLock::new(DirectoryState::default()),
        }
    }

    /// Re-fetch the policy, group membership, and key sets; mint and
    /// remove subordinate certificates to match; resolve every user's
    /// effective policy. A parse failure keeps the prior snapshot.
    pub async fn update(&self) -> Result<Update> {
        let policy = self.refresh_policy().await?;

        let netinfo = Arc::new(self.backend.fetch_network_info().await?);

        {
            let mut state = self.state.write();
            state.netinfo = Some(netinfo.clone());
        }

        // Invert group → members into user → groups, then pick up users
        // that only have their own section.
        let mut user_groups: HashMap<String, Vec<String>> = HashMap::new();

        for group in policy.groups.keys() {
            let Some(members) = self.backend.fetch_group(group).await? else {
                tracing::warn!(group = %group, "group in policy does not exist in backend");
                continue;
            };
            for member in members {
                user_groups.entry(member).or_default().push(group.clone());
            }
        }

        for user in policy.users.keys() {
            user_groups.entry(user.clone()).or_default();
        }

        let key_sets = self.reconcile_keys(&user_groups).await?;

        let mut users = HashMap::new();
        for (user, keys) in key_sets {
            let groups = user_groups.get(&user).cloned().unwrap_or_default();
            let resolved = resolve_user(&policy, &user, &groups, &netinfo)?;
            users.insert(
                user,
                UserState {
                    keys,
                    policy: resolved,
                },
            );
        }

        {
            let mut state = self.state.write();
            state.user_groups = user_groups;
        }

        Ok(Update {
            users,
            watch: policy.watch,
            policy,
        })
    }

    /// Look up a presented cert-hash, re-verify the alias against the live
    /// backend, and resolve the user's current policy.
    pub async fn authenticate(&self, user: &str, cert_hash: &str) -> Result<(UserPolicy, String)> {
        let alias = {
            let state = self.state.read();
            state
                .users
                .get(user)
                .and_then(|keys| keys.by_hash.get(cert_hash))
                .cloned()
        };

        let Some(alias) = alias else {
            return Err(UserError::UserNotFound(user.to_string()));
        };

        // The index may be a watch interval stale; the backend is the
        // authority on whether the key is still active.
        let Some(live_keys) = self.backend.fetch_keys(user).await? else {
            return Err(UserError::UserGone(user.to_string()));
        };
        if !live_keys.iter().any(|key| *key == alias) {
            return Err(UserError::KeyGone {
                user: user.to_string(),
                alias,
            });
        }

        let groups = match self.backend.fetch_groups_for_user(user).await {
            Ok(groups) => {
                let groups = groups.unwrap_or_default();
                let mut state = self.state.write();
                state.user_groups.insert(user.to_string(), groups.clone());
                groups
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "group lookup failed, using cached groups");
                let state = self.state.read();
                state.user_groups.get(user).cloned().unwrap_or_default()
            }
        };

        let (policy, netinfo) = {
            let state = self.state.read();
            (
                state.policy.clone().ok_or(UserError::NotLoaded)?,
                state.netinfo.clone().ok_or(UserError::NotLoaded)?,
            )
        };

        let resolved = resolve_user(&policy, user, &groups, &netinfo)?;
        Ok((resolved, alias))
    }

    async fn refresh_policy(&self) -> Result<Arc<PolicyFile>> {
        let tag = self.state.read().policy_tag.clone();

        match self.backend.fetch_file("vpn.conf", tag.as_deref()).await? {
            Fetched::Modified { body, tag } => {
                let text = String::from_utf8_lossy(&body);
                let policy = Arc::new(parse_policy(&text)?);

                let mut state = self.state.write();
                state.policy = Some(policy.clone());
                state.policy_tag = if tag.is_empty() { None } else { Some(tag) };

                Ok(policy)
            }
            Fetched::NotModified => {
                self.state.read().policy.clone().ok_or(UserError::NotLoaded)
            }
            Fetched::Missing => Err(UserError::ConfigMissing),
        }
    }

    /// Diff every user's live key list against the index: mint certs for
    /// new aliases, drop certs whose alias disappeared. Certificate store
    /// mutations happen outside the index write lock.
    async fn reconcile_keys(
        &self,
        user_groups: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, HashSet<String>>> {
        let mut results = HashMap::new();

        for user in user_groups.keys() {
            let live: HashSet<String> = match self.backend.fetch_keys(user).await? {
                Some(keys) => keys.into_iter().collect(),
                None => HashSet::new(),
            };

            // New aliases, judged against the current index snapshot.
            let fresh: Vec<String> = {
                let state = self.state.read();
                let known = state.users.get(user.as_str());
                live.iter()
                    .filter(|alias| {
                        known.is_none_or(|keys| !keys.by_alias.contains_key(*alias))
                    })
                    .cloned()
                    .collect()
            };

            let mut minted: Vec<(String, String)> = Vec::new();
            for alias in fresh {
                let Some(body) = self.backend.fetch_key(user, &alias).await? else {
                    // Listed but gone by the time we fetched it; the next
                    // pass settles it.
                    continue;
                };
                let key = parse_rsa_public_key(&body)?;
                let hash = self.ca.add(user, &alias, &key)?;
                minted.push((alias, hash));
            }

            let removed: Vec<String> = {
                let mut state = self.state.write();
                let entry = state.users.entry(user.clone()).or_default();

                let stale: Vec<String> = entry
                    .by_alias
                    .keys()
                    .filter(|alias| !live.contains(*alias))
                    .cloned()
                    .collect();

                for alias in &stale {
                    if let Some(hash) = entry.by_alias.remove(alias) {
                        entry.by_hash.remove(&hash);
                    }
                }

                for (alias, hash) in minted {
                    entry.by_alias.insert(alias.clone(), hash.clone());
                    entry.by_hash.insert(hash, alias);
                }

                if entry.by_alias.is_empty() {
                    state.users.remove(user.as_str());
                }

                stale
            };

            for alias in removed {
                if let Err(e) = self.ca.remove(&alias) {
                    tracing::warn!(user = %user, alias = %alias, error = %e, "failed to drop certificate");
                }
            }

            if !live.is_empty() {
                results.insert(user.clone(), live);
            }
        }

        Ok(results)
    }
}
