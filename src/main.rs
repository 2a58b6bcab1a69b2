//! CIDR allocator operator entry point
//!
//! Starts the NodeCIDRAllocation controller plus the metrics,
//! health-probe and admission webhook servers.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use cidr_allocator::controller::{self, Context};
use cidr_allocator::leader::LeaseLock;
use cidr_allocator::observability;
use cidr_allocator::webhook::{WebhookServer, WebhookTls};
use cidr_allocator::{telemetry, Error};

/// Operator allocating Node PodCIDRs from declarative address pools
#[derive(Parser, Debug)]
#[command(name = "cidr-allocator", version, about, long_about = None)]
struct Cli {
    /// The address the metrics endpoint binds to
    #[arg(long, env = "METRICS_BIND_ADDR", default_value = ":9003")]
    metrics_bind_address: String,

    /// The address the health probe endpoint binds to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDR", default_value = ":8081")]
    health_probe_bind_address: String,

    /// The Lease name used for leader election
    #[arg(
        long,
        env = "LEADER_ELECTION_ID",
        default_value = "cidr-allocator-leader.networking.nodecidr.dev"
    )]
    leader_election_id: String,

    /// Enable leader election; ensures only one active operator instance
    #[arg(long)]
    leader_elect: bool,

    /// Leader lease duration in seconds
    #[arg(long, default_value = "15")]
    leader_lease_seconds: i32,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Enable HTTP/2 for the webhook server; off by default because of
    /// the HTTP/2 rapid-reset CVEs
    #[arg(long)]
    enable_http2: bool,

    /// The address the admission webhook binds to
    #[arg(long, env = "WEBHOOK_BIND_ADDR", default_value = ":9443")]
    webhook_bind_address: String,

    /// Path to the webhook TLS certificate (plain HTTP when unset)
    #[arg(long, env = "WEBHOOK_TLS_CERT")]
    webhook_tls_cert: Option<std::path::PathBuf>,

    /// Path to the webhook TLS private key
    #[arg(long, env = "WEBHOOK_TLS_KEY")]
    webhook_tls_key: Option<std::path::PathBuf>,
}

/// Parse `:9003` / `0.0.0.0:9003` style bind addresses
fn parse_bind_addr(addr: &str) -> Result<SocketAddr, Error> {
    let normalized = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    normalized
        .parse()
        .map_err(|e| Error::config(format!("invalid bind address {addr:?}: {e}")))
}

fn leader_identity() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "cidr-allocator".to_string());
    format!("{host}-{}", std::process::id())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    telemetry::init(cli.debug);

    info!("starting cidr-allocator v{}", env!("CARGO_PKG_VERSION"));

    // rustls needs a process-wide crypto provider before any TLS config
    // is built.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    let metrics_addr = parse_bind_addr(&cli.metrics_bind_address)?;
    let probe_addr = parse_bind_addr(&cli.health_probe_bind_address)?;
    let webhook_addr = parse_bind_addr(&cli.webhook_bind_address)?;

    let client = kube::Client::try_default().await.map_err(Error::Kube)?;
    info!("connected to Kubernetes cluster");

    let metrics_listener = observability::bind(metrics_addr, "metrics").await?;
    let probe_listener = observability::bind(probe_addr, "health probe").await?;
    tokio::spawn(async move {
        if let Err(e) = observability::serve_metrics(metrics_listener).await {
            error!(error = %e, "metrics server terminated");
        }
    });
    tokio::spawn(async move {
        if let Err(e) = observability::serve_probes(probe_listener).await {
            error!(error = %e, "health probe server terminated");
        }
    });

    // ENABLE_WEBHOOKS=false skips webhook registration, for local runs
    // without certificates.
    let webhooks_enabled = std::env::var("ENABLE_WEBHOOKS")
        .map(|v| v != "false")
        .unwrap_or(true);
    if webhooks_enabled {
        let tls = match (cli.webhook_tls_cert, cli.webhook_tls_key) {
            (Some(cert_path), Some(key_path)) => Some(WebhookTls {
                cert_path,
                key_path,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::config(
                    "webhook TLS requires both --webhook-tls-cert and --webhook-tls-key",
                ))
            }
        };
        let server = WebhookServer::new(webhook_addr, tls, cli.enable_http2);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "admission webhook terminated");
            }
        });
    } else {
        info!("admission webhook disabled via ENABLE_WEBHOOKS=false");
    }

    if cli.leader_elect {
        let lock = Arc::new(LeaseLock::new(
            client.clone(),
            &cli.leader_election_id,
            &leader_identity(),
            cli.leader_lease_seconds,
        ));
        lock.acquire().await?;
        let _renewal = lock.spawn_renewal();
    }

    // Run the main controller loop until shutdown
    let ctx = Arc::new(Context::new(client));
    controller::run_controller(ctx).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_addresses_accept_the_short_form() {
        assert_eq!(
            parse_bind_addr(":9003").unwrap(),
            "0.0.0.0:9003".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_bind_addr("127.0.0.1:8081").unwrap(),
            "127.0.0.1:8081".parse::<SocketAddr>().unwrap()
        );
        assert!(parse_bind_addr("nonsense").is_err());
    }

    #[test]
    fn cli_defaults_match_the_deployment_manifests() {
        let cli = Cli::parse_from(["cidr-allocator"]);
        assert_eq!(cli.metrics_bind_address, ":9003");
        assert_eq!(cli.health_probe_bind_address, ":8081");
        assert!(!cli.leader_elect);
        assert!(!cli.enable_http2);
    }
}
