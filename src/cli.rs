//! Command line surface.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "gatehouse",
    version,
    about = "Control-plane supervisor for a client-certificate VPN daemon"
)]
pub struct Cli {
    /// S3 directory containing vpn.conf. May be an s3:// URL or bucket/path
    #[arg(long, env = "S3_PATH", value_name = "url", global = true)]
    pub s3: Option<String>,

    /// Filesystem path containing vpn.conf
    #[arg(long, value_name = "path", conflicts_with = "s3", global = true)]
    pub local: Option<PathBuf>,

    /// Root path for the VPN runtime state
    #[arg(long, default_value = ".", value_name = "path")]
    pub root: PathBuf,

    /// Log verbosity
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse the policy file and print the normalized form
    Check,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive for the tracing subscriber.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// `verb` level passed to the VPN daemon.
    pub fn daemon_verbosity(self) -> u8 {
        match self {
            LogLevel::Debug => 2,
            LogLevel::Info | LogLevel::Warn => 1,
            LogLevel::Error => 0,
        }
    }
}

/// Split an `--s3` argument into (bucket, prefix). Accepts `s3://bucket/path`
/// and plain `bucket/path`.
pub fn parse_s3_target(s: &str) -> Option<(String, String)> {
    let rest = s.strip_prefix("s3://").unwrap_or(s);
    let rest = rest.trim_start_matches('/');

    match rest.split_once('/') {
        Some((bucket, path)) if !bucket.is_empty() => {
            Some((bucket.to_string(), path.trim_end_matches('/').to_string()))
        }
        None if !rest.is_empty() => Some((rest.to_string(), String::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s3_url_form() {
        assert_eq!(
            parse_s3_target("s3://my-bucket/vpn/prod"),
            Some(("my-bucket".to_string(), "vpn/prod".to_string()))
        );
    }

    #[test]
    fn bucket_slash_path_form() {
        assert_eq!(
            parse_s3_target("my-bucket/vpn"),
            Some(("my-bucket".to_string(), "vpn".to_string()))
        );
    }

    #[test]
    fn bare_bucket() {
        assert_eq!(
            parse_s3_target("my-bucket"),
            Some(("my-bucket".to_string(), String::new()))
        );
    }

    #[test]
    fn empty_is_none() {
        assert_eq!(parse_s3_target(""), None);
        assert_eq!(parse_s3_target("s3://"), None);
    }

    #[test]
    fn verbosity_mapping() {
        assert_eq!(LogLevel::Debug.daemon_verbosity(), 2);
        assert_eq!(LogLevel::Info.daemon_verbosity(), 1);
        assert_eq!(LogLevel::Warn.daemon_verbosity(), 1);
        assert_eq!(LogLevel::Error.daemon_verbosity(), 0);
    }
}
