//! Filesystem backend for local operation and tests.
//!
//! Layout under the root directory:
//! - `groups` — one group per line: `name user₁ user₂ …`
//! - `user/<name>/<alias>` — PEM public keys
//! - `netinfo` — one topology element per line: `<id|"nat"> <cidr>`
//!
//! DNS registration is a no-op.

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::IpNet;

use crate::{Backend, BackendError, Fetched, NetworkInfo, Result};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBackend { root: root.into() }
    }

    async fn read_optional(&self, path: PathBuf) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BackendError::Io(e)),
        }
    }

    async fn read_groups(&self) -> Result<Option<String>> {
        let bytes = self.read_optional(self.root.join("groups")).await?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn fetch_file(&self, path: &str, _if_not_tag: Option<&str>) -> Result<Fetched> {
        match self.read_optional(self.root.join(path)).await? {
            Some(body) => Ok(Fetched::Modified {
                body,
                tag: String::new(),
            }),
            None => Ok(Fetched::Missing),
        }
    }

    async fn put_file(&self, path: &str, data: &[u8]) -> Result<()> {
        tokio::fs::write(self.root.join(path), data)
            .await
            .map_err(BackendError::Io)
    }

    async fn fetch_network_info(&self) -> Result<NetworkInfo> {
        let Some(bytes) = self.read_optional(self.root.join("netinfo")).await? else {
            return Ok(NetworkInfo::default());
        };
        let text = String::from_utf8_lossy(&bytes);

        let mut info = NetworkInfo::default();

        for line in text.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let &[id, net_str] = fields.as_slice() else {
                continue;
            };

            let network = parse_netinfo_network(net_str).ok_or(BackendError::Malformed {
                what: "netinfo network",
                value: net_str.to_string(),
            })?;

            if id == "nat" {
                info.nat.push(network);
            } else {
                info.subnets.insert(id.to_string(), network);
            }
        }

        Ok(info)
    }

    async fn fetch_group(&self, name: &str) -> Result<Option<Vec<String>>> {
        let Some(text) = self.read_groups().await? else {
            return Ok(None);
        };

        for line in text.lines() {
            let mut fields = line.split_whitespace();
            if fields.next() == Some(name) {
                return Ok(Some(fields.map(str::to_string).collect()));
            }
        }

        Ok(None)
    }

    async fn fetch_groups_for_user(&self, user: &str) -> Result<Option<Vec<String>>> {
        let Some(text) = self.read_groups().await? else {
            return Ok(None);
        };

        let mut groups = Vec::new();

        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let Some(group) = fields.next() else {
                continue;
            };
            if fields.any(|member| member == user) {
                groups.push(group.to_string());
            }
        }

        Ok(Some(groups))
    }

    async fn fetch_keys(&self, user: &str) -> Result<Option<Vec<String>>> {
        let dir = self.root.join("user").join(user);

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(BackendError::Io(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                keys.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        keys.sort();

        Ok(Some(keys))
    }

    async fn fetch_key(&self, user: &str, alias: &str) -> Result<Option<Vec<u8>>> {
        self.read_optional(self.root.join("user").join(user).join(alias))
            .await
    }

    async fn register_dns(&self, _zone: &str, _name: &str, _weighted: bool) -> Result<()> {
        Ok(())
    }

    async fn unregister_dns(&self) -> Result<()> {
        Ok(())
    }
}

/// A bare address in the netinfo file is a host network.
fn parse_netinfo_network(s: &str) -> Option<IpNet> {
    if s.contains('/') {
        return s.parse::<IpNet>().ok().map(|net| net.trunc());
    }
    let addr: IpAddr = s.parse().ok()?;
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(addr, prefix).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("gatehouse-local-{name}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn fetch_file_missing_is_a_signal_not_an_error() {
        let dir = fixture("missing");
        let backend = LocalBackend::new(&dir);

        assert!(matches!(
            backend.fetch_file("vpn.conf", None).await.unwrap(),
            Fetched::Missing
        ));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn groups_file_lookup_both_directions() {
        let dir = fixture("groups");
        write(&dir, "groups", "dev alice bob\nops bob\n");
        let backend = LocalBackend::new(&dir);

        assert_eq!(
            backend.fetch_group("dev").await.unwrap(),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert_eq!(backend.fetch_group("legal").await.unwrap(), None);

        assert_eq!(
            backend.fetch_groups_for_user("bob").await.unwrap(),
            Some(vec!["dev".to_string(), "ops".to_string()])
        );
        assert_eq!(
            backend.fetch_groups_for_user("carol").await.unwrap(),
            Some(vec![])
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn keys_listed_from_the_user_directory() {
        let dir = fixture("keys");
        write(&dir, "user/alice/KEYID2", "key two");
        write(&dir, "user/alice/KEYID1", "key one");
        let backend = LocalBackend::new(&dir);

        assert_eq!(
            backend.fetch_keys("alice").await.unwrap(),
            Some(vec!["KEYID1".to_string(), "KEYID2".to_string()])
        );
        assert_eq!(backend.fetch_keys("bob").await.unwrap(), None);

        assert_eq!(
            backend.fetch_key("alice", "KEYID1").await.unwrap(),
            Some(b"key one".to_vec())
        );
        assert_eq!(backend.fetch_key("alice", "KEYID9").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn netinfo_parses_subnets_and_nat() {
        let dir = fixture("netinfo");
        write(
            &dir,
            "netinfo",
            "subnet-one 10.0.1.0/24\nnat 0.0.0.0/0\nsubnet-two 10.0.2.5\nbroken\n",
        );
        let backend = LocalBackend::new(&dir);

        let info = backend.fetch_network_info().await.unwrap();
        assert_eq!(info.subnets["subnet-one"].to_string(), "10.0.1.0/24");
        assert_eq!(info.subnets["subnet-two"].to_string(), "10.0.2.5/32");
        assert_eq!(info.nat[0].to_string(), "0.0.0.0/0");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_netinfo_is_empty_topology() {
        let dir = fixture("no-netinfo");
        let backend = LocalBackend::new(&dir);
        let info = backend.fetch_network_info().await.unwrap();
        assert!(info.subnets.is_empty() && info.nat.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
