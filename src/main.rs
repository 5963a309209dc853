//! Portside CLI - SNI relay front end
//!
//! Runs the sniffing relay with statically configured TCP-forward routes.
//! Endpoint registration happens over the WebSocket serving entry points,
//! which an HTTP layer in front of this binary owns.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portside_relay::{Dest, EndpointRegistry, Proxy, RegistryDialer, RejectPolicy, RouteTable};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portside - route TLS connections by SNI without terminating them
#[derive(Parser, Debug)]
#[command(name = "portside")]
#[command(about = "Portside - route TLS connections by SNI without terminating them")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay front end
    #[command(long_about = r#"
Run the SNI relay: accept raw TCP connections, sniff the TLS ClientHello
for the server name, and forward the untouched stream to the destination
the name routes to.

EXAMPLES:
  # Forward two hostnames to local backends
  portside serve --listen 0.0.0.0:443 \
    --route db.example.com=127.0.0.1:5432 \
    --route "*.apps.example.com=127.0.0.1:8443"

  # Send everything without a route to a fallback server
  portside serve --listen 0.0.0.0:443 \
    --route web.example.com=127.0.0.1:8443 \
    --home 127.0.0.1:9000

ENVIRONMENT VARIABLES:
  PORTSIDE_LISTEN  Listen address
  PORTSIDE_HOME    Fallback server address
    "#)]
    Serve {
        /// Listen address (e.g. 0.0.0.0:443)
        #[arg(long, env = "PORTSIDE_LISTEN", default_value = "0.0.0.0:443")]
        listen: String,

        /// Static route, hostname=target-address (repeatable; hostname may
        /// be a *.wildcard)
        #[arg(long = "route")]
        routes: Vec<String>,

        /// Fallback server for hostnames without a route
        #[arg(long, env = "PORTSIDE_HOME")]
        home: Option<String>,

        /// Reject server names ending in this suffix (repeatable)
        #[arg(long = "reject-suffix")]
        reject_suffixes: Vec<String>,
    },
}

fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// `hostname=target` pairs from the command line
fn parse_routes(specs: &[String]) -> Result<RouteTable> {
    let table = RouteTable::new();
    for spec in specs {
        let (host, target) = spec
            .split_once('=')
            .with_context(|| format!("route '{spec}' is not hostname=target"))?;
        if host.is_empty() || target.is_empty() {
            anyhow::bail!("route '{spec}' has an empty side");
        }
        table.insert(host, Dest::Tcp(target.to_string()));
    }
    Ok(table)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            listen,
            routes,
            home,
            reject_suffixes,
        } => {
            info!("Portside starting...");

            let table = Arc::new(parse_routes(&routes)?);
            info!("Listen: {}", listen);
            info!("Routes: {}", table.len());
            if let Some(ref home_addr) = home {
                info!("Home server: {}", home_addr);
            }

            let registry = Arc::new(EndpointRegistry::new());
            let dialer = Arc::new(RegistryDialer::new(registry, table, home));
            let proxy = Proxy::new(dialer, RejectPolicy::new(reject_suffixes));

            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;

            let cancel = proxy.cancel_token();
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down...");
                    cancel.cancel();
                }
                result = proxy.run(listener) => {
                    if let Err(e) = result {
                        error!("Relay error: {:#}", e);
                        return Err(e.into());
                    }
                }
            }

            info!("Portside stopped");
            Ok(())
        }
    }
}
