//! busfence-proxy binary.
//!
//! Thin CLI over [`busfence_proxy::Proxy`]: parse the policy flags into
//! a table, bind the listen socket, proxy until interrupted.

use anyhow::{Context, Result};
use busfence_core::policy::PolicyLevel;
use busfence_proxy::{Proxy, ProxyConfig};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Filtering message-bus proxy.
///
/// Listens on PATH and forwards connections to the bus at ADDRESS,
/// enforcing the given per-name policy. A name ending in `.*` grants
/// the level to every direct child of the prefix instead.
#[derive(Debug, Parser)]
#[command(name = "busfence-proxy", version, about)]
struct Args {
    /// Upstream bus address (unix:path=..., unix:abstract=..., or a
    /// bare socket path).
    bus_address: String,

    /// Path of the proxied socket to create.
    listen_path: String,

    /// Grant SEE on a name (repeatable).
    #[arg(long = "see", value_name = "NAME")]
    see: Vec<String>,

    /// Grant TALK on a name (repeatable).
    #[arg(long = "talk", value_name = "NAME")]
    talk: Vec<String>,

    /// Grant OWN on a name (repeatable).
    #[arg(long = "own", value_name = "NAME")]
    own: Vec<String>,

    /// Disable filtering and relay everything verbatim.
    #[arg(long = "no-filter")]
    no_filter: bool,

    /// Log every proxied message at debug level.
    #[arg(long = "log-messages")]
    log_messages: bool,

    /// Per-side cap on queued outgoing bytes.
    #[arg(long = "max-queued-bytes", value_name = "BYTES")]
    max_queued_bytes: Option<usize>,

    /// Log filter (tracing `EnvFilter` syntax).
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

fn apply_policy(config: &mut ProxyConfig, names: &[String], level: PolicyLevel) {
    for name in names {
        match name.strip_suffix(".*") {
            Some(prefix) => config.add_wildcard_policy(prefix, level),
            None => config.add_policy(name.as_str(), level),
        };
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ProxyConfig::new(args.bus_address.as_str(), &args.listen_path);
    apply_policy(&mut config, &args.see, PolicyLevel::See);
    apply_policy(&mut config, &args.talk, PolicyLevel::Talk);
    apply_policy(&mut config, &args.own, PolicyLevel::Own);
    config.set_filter(!args.no_filter);
    config.set_log_messages(args.log_messages);
    if let Some(max) = args.max_queued_bytes {
        config.set_max_queued_bytes(max);
    }

    let proxy = Proxy::bind(config).context("failed to bind listen socket")?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install handler")?;
    tokio::select! {
        result = proxy.run() => result.context("proxy accept loop failed")?,
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
        _ = sigterm.recv() => info!("terminated, shutting down"),
    }
    Ok(())
}
