//! Launching the VPN daemon process.
//!
//! The operator supplies the base configuration file; the supervisor
//! appends the verbosity, the tunnel network, and the inline server
//! certificate and key before starting the process.

use std::path::Path;
use std::process::Stdio;

use ipnet::Ipv4Net;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

use super::Result;

/// Append the supervisor-controlled directives to the operator config.
pub async fn append_config(
    config: &Path,
    verbosity: u8,
    network: Ipv4Net,
    cert_pem: &str,
    key_pem: &str,
) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .open(config)
        .await?;

    let mut body = format!("\nverb {verbosity}\n");
    body.push_str(&format!(
        "\nserver {} {}\n",
        network.network(),
        network.netmask()
    ));
    body.push_str("\n<cert>\n");
    body.push_str(cert_pem.trim_end());
    body.push_str("\n</cert>\n");
    body.push_str("\n<key>\n");
    body.push_str(key_pem.trim_end());
    body.push_str("\n</key>\n");

    file.write_all(body.as_bytes()).await?;
    file.flush().await?;

    Ok(())
}

/// The daemon needs /dev/net/tun; containers often lack the node.
#[cfg(target_os = "linux")]
pub fn ensure_tun_device() -> Result<()> {
    use nix::sys::stat::{makedev, mknod, Mode, SFlag};

    let tun = Path::new("/dev/net/tun");
    if tun.exists() {
        return Ok(());
    }

    std::fs::create_dir_all("/dev/net")?;
    mknod(tun, SFlag::S_IFCHR, Mode::from_bits_truncate(0o600), makedev(10, 200))
        .map_err(std::io::Error::from)?;

    tracing::info!("created /dev/net/tun");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn ensure_tun_device() -> Result<()> {
    Ok(())
}

/// Start the daemon with the assembled configuration. Output goes to the
/// supervisor's own stdout/stderr.
pub fn spawn_daemon(config: &Path) -> Result<Child> {
    let child = Command::new("openvpn")
        .arg("--config")
        .arg(config)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()?;

    tracing::info!(pid = child.id(), "started VPN daemon");
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_config_adds_all_directives() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("gatehouse-daemon-conf-{nanos}"));
        std::fs::write(&path, "port 1194\nproto udp\n").unwrap();

        let network: Ipv4Net = "10.8.0.0/24".parse().unwrap();
        append_config(&path, 2, network, "CERT BODY", "KEY BODY")
            .await
            .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("port 1194\n"));
        assert!(text.contains("\nverb 2\n"));
        assert!(text.contains("\nserver 10.8.0.0 255.255.255.0\n"));
        assert!(text.contains("<cert>\nCERT BODY\n</cert>"));
        assert!(text.contains("<key>\nKEY BODY\n</key>"));

        let _ = std::fs::remove_file(&path);
    }
}
