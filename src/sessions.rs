//! Client session bookkeeping.
//!
//! Two invariants hold at all times: at most one session per user name
//! (a newer CONNECT evicts the older client id), and every entry in the
//! user index points at a live client entry.

use std::collections::HashMap;

use gatehouse_policy::UserPolicy;
use ipnet::IpNet;

#[derive(Debug, Clone)]
pub struct Session {
    pub user: String,
    pub cid: u64,
    pub alias: String,
    pub address: Option<IpNet>,
    pub policy: UserPolicy,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    clients: HashMap<u64, Session>,
    by_user: HashMap<String, u64>,
}

impl SessionTable {
    /// Record an authorized session. For a fresh CONNECT the replaced
    /// session of the same user (or a stale record under the same cid) is
    /// returned for the caller to kill; a REAUTH updates the existing
    /// record in place and never evicts.
    pub fn authorize(
        &mut self,
        cid: u64,
        user: &str,
        alias: String,
        policy: UserPolicy,
        reauth: bool,
    ) -> Option<Session> {
        let evicted = if reauth {
            None
        } else {
            if let Some(stale) = self.clients.remove(&cid) {
                if self.by_user.get(&stale.user) == Some(&cid) {
                    self.by_user.remove(&stale.user);
                }
            }
            self.by_user
                .get(user)
                .copied()
                .filter(|old_cid| *old_cid != cid)
                .and_then(|old_cid| self.clients.remove(&old_cid))
        };

        // A reauth keeps the address the daemon already announced.
        let address = self.clients.get(&cid).and_then(|s| s.address);

        self.clients.insert(
            cid,
            Session {
                user: user.to_string(),
                cid,
                alias,
                address,
                policy,
            },
        );
        self.by_user.insert(user.to_string(), cid);

        evicted
    }

    /// Attach the announced tunnel address; returns the owning user.
    pub fn set_address(&mut self, cid: u64, address: IpNet) -> Option<String> {
        let session = self.clients.get_mut(&cid)?;
        session.address = Some(address);
        Some(session.user.clone())
    }

    /// Remove by client id (DISCONNECT). A newer session of the same user
    /// under a different cid keeps its user-index entry.
    pub fn remove_cid(&mut self, cid: u64) -> Option<Session> {
        let session = self.clients.remove(&cid)?;
        if self.by_user.get(&session.user) == Some(&cid) {
            self.by_user.remove(&session.user);
        }
        Some(session)
    }

    /// Remove the user's live session, if any.
    pub fn remove_user(&mut self, user: &str) -> Option<Session> {
        let cid = self.by_user.remove(user)?;
        self.clients.remove(&cid)
    }

    pub fn session_for_user(&self, user: &str) -> Option<&Session> {
        let cid = self.by_user.get(user)?;
        self.clients.get(cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_policy::DnsMode;

    fn policy() -> UserPolicy {
        UserPolicy {
            dns: DnsMode::Off,
            routes: Vec::new(),
        }
    }

    #[test]
    fn new_connect_for_a_user_evicts_the_older_cid() {
        let mut table = SessionTable::default();

        table.authorize(1, "alice", "K1".into(), policy(), false);
        let evicted = table.authorize(2, "alice", "K1".into(), policy(), false);

        assert_eq!(evicted.unwrap().cid, 1);
        assert_eq!(table.session_for_user("alice").unwrap().cid, 2);
        // The old client entry is gone outright.
        assert!(table.remove_cid(1).is_none());
    }

    #[test]
    fn disconnect_of_the_evicted_cid_leaves_the_new_session() {
        let mut table = SessionTable::default();

        table.authorize(1, "alice", "K1".into(), policy(), false);
        table.authorize(2, "alice", "K1".into(), policy(), false);

        // The daemon's late DISCONNECT for cid 1 must not touch cid 2.
        assert!(table.remove_cid(1).is_none());
        assert_eq!(table.session_for_user("alice").unwrap().cid, 2);
    }

    #[test]
    fn reauth_updates_in_place_and_keeps_the_address() {
        let mut table = SessionTable::default();
        let address: IpNet = "10.8.0.6/32".parse().unwrap();

        table.authorize(1, "alice", "K1".into(), policy(), false);
        table.set_address(1, address);

        let evicted = table.authorize(1, "alice", "K2".into(), policy(), true);
        assert!(evicted.is_none());

        let session = table.session_for_user("alice").unwrap();
        assert_eq!(session.alias, "K2");
        assert_eq!(session.address, Some(address));
    }

    #[test]
    fn reconnect_reusing_the_same_cid_replaces_the_record() {
        let mut table = SessionTable::default();

        table.authorize(1, "alice", "K1".into(), policy(), false);
        let evicted = table.authorize(1, "bob", "K9".into(), policy(), false);

        // cid 1 now belongs to bob; alice has no session and nothing to
        // kill since the cid was reused, not replaced.
        assert!(evicted.is_none());
        assert!(table.session_for_user("alice").is_none());
        assert_eq!(table.session_for_user("bob").unwrap().cid, 1);
    }

    #[test]
    fn set_address_on_unknown_cid_is_none() {
        let mut table = SessionTable::default();
        assert!(table.set_address(9, "10.8.0.6/32".parse().unwrap()).is_none());
    }

    #[test]
    fn remove_user_clears_both_indexes() {
        let mut table = SessionTable::default();
        table.authorize(1, "alice", "K1".into(), policy(), false);

        let removed = table.remove_user("alice").unwrap();
        assert_eq!(removed.cid, 1);
        assert!(table.session_for_user("alice").is_none());
        assert!(table.remove_cid(1).is_none());
        assert!(table.remove_user("alice").is_none());
    }
}
