use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gatehouse::cli::{self, Cli, Command};
use gatehouse::supervisor;
use gatehouse_backend::{Backend, Fetched, LocalBackend};

fn main() -> ExitCode {
    // The daemon invokes its tls-verify hook with bare argv; handle that
    // sub-mode before clap sees the arguments.
    let argv: Vec<String> = std::env::args().collect();
    if argv.len() > 2 && argv[1] == "verify" {
        return verify_mode(&argv[2]);
    }

    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_new(cli.loglevel.as_filter())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => return fatal(&format!("Unable to start runtime: {e}")),
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(message) => fatal(&message),
    }
}

async fn run(cli: Cli) -> Result<ExitCode, String> {
    let backend: Arc<dyn Backend> = if let Some(s3) = cli.s3.as_deref().filter(|s| !s.is_empty())
    {
        let (bucket, prefix) = cli::parse_s3_target(s3)
            .ok_or_else(|| format!("Cannot parse S3 path {s3}"))?;
        let backend = gatehouse_backend::AwsBackend::new(bucket.clone(), prefix.clone())
            .await
            .map_err(|e| {
                format!("Error initializing AWS config with S3 path {bucket}/{prefix}: {e}")
            })?;
        Arc::new(backend)
    } else if let Some(local) = &cli.local {
        Arc::new(LocalBackend::new(local.clone()))
    } else {
        return Err("One of --s3 or --local is required".to_string());
    };

    if let Some(Command::Check) = cli.command {
        return check_policy(backend.as_ref()).await;
    }

    let root = std::path::absolute(&cli.root)
        .map_err(|e| format!("Unable to resolve root path {}: {e}", cli.root.display()))?;

    supervisor::run(backend, root, cli.loglevel.daemon_verbosity())
        .await
        .map_err(|e| format!("Error running VPN: {e}"))?;

    Ok(ExitCode::SUCCESS)
}

/// Parse vpn.conf and print the normalized rendition.
async fn check_policy(backend: &dyn Backend) -> Result<ExitCode, String> {
    let fetched = backend
        .fetch_file("vpn.conf", None)
        .await
        .map_err(|e| format!("Error fetching vpn.conf: {e}"))?;

    let Fetched::Modified { body, .. } = fetched else {
        return Err("vpn.conf not found in backend".to_string());
    };

    let text = String::from_utf8_lossy(&body);
    let policy =
        gatehouse_policy::parse_policy(&text).map_err(|e| format!("Invalid policy: {e}"))?;

    print!("{}", policy.render());
    Ok(ExitCode::SUCCESS)
}

/// `gatehouse verify <depth>`: depth 0 runs the capath check; higher
/// depths are left to the daemon's own chain verification.
fn verify_mode(depth: &str) -> ExitCode {
    if depth != "0" {
        return ExitCode::SUCCESS;
    }

    let peer_cert = std::env::var("peer_cert").unwrap_or_default();
    let config = std::env::var("config").unwrap_or_default();

    let capath = Path::new(&config)
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("capath");

    match gatehouse_ca::check_certificate(&capath, Path::new(&peer_cert)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("Error checking certificate: {e}");
            ExitCode::from(1)
        }
    }
}

fn fatal(message: &str) -> ExitCode {
    eprintln!("{message}");
    ExitCode::from(1)
}
