//! OCPI EMSP Node - CLI for the EMSP receiver
//!
//! Serves the OCPI 2.2 receiver endpoints to configured CPO counterparties.
//!
//! # Usage
//!
//! ```bash
//! # One CPO, default listener on 0.0.0.0:8090
//! ocpi-emsp-node --party NL/EMS --cpo secret-token=DE/GEF
//!
//! # Strict downgrade policy and a seeded token list
//! ocpi-emsp-node --party NL/EMS --cpo secret-token=DE/GEF \
//!     --downgrades deny --tokens tokens.json
//!
//! # CPO command endpoint for outbound commands
//! ocpi-emsp-node --party NL/EMS --cpo secret-token=DE/GEF \
//!     --cpo-endpoint DE/GEF=their-token@https://cpo.example.com/ocpi/cpo/2.2/commands
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use ocpi_core::{AuthorizationService, CommandStore, LocalAuthorizer, PartyKey, Registry, TokenStatus};
use ocpi_emsp::{CpoEndpoint, EmspConfig, PartyAccess, ReceiverState, TracingObserver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DowngradePolicy {
    /// Follow each request's forceDowngrade flag
    Request,
    /// Always accept not-newer updates
    Allow,
    /// Never accept not-newer updates
    Deny,
}

/// OCPI EMSP receiver node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Own party, CC/PID
    #[arg(short, long, env = "OCPI_PARTY", default_value = "NL/EMS")]
    party: PartyKey,

    /// Listen address
    #[arg(short, long, env = "OCPI_LISTEN", default_value = "0.0.0.0:8090")]
    listen: SocketAddr,

    /// Externally reachable base URL
    #[arg(long, env = "OCPI_PUBLIC_URL", default_value = "http://localhost:8090")]
    public_url: String,

    /// Path prefix of the module endpoints
    #[arg(long, env = "OCPI_BASE_PATH", default_value = "/ocpi/emsp/2.2")]
    base_path: String,

    /// CPO access, TOKEN=CC/PID[:ROLE[:STATUS]] (can be repeated)
    #[arg(long = "cpo", env = "OCPI_CPO", value_delimiter = ',')]
    cpos: Vec<PartyAccess>,

    /// CPO commands endpoint, CC/PID=TOKEN@URL (can be repeated)
    #[arg(long = "cpo-endpoint", env = "OCPI_CPO_ENDPOINT", value_delimiter = ',')]
    cpo_endpoints: Vec<CpoEndpoint>,

    /// Downgrade policy for not-newer updates
    #[arg(long, env = "OCPI_DOWNGRADES", value_enum, default_value = "request")]
    downgrades: DowngradePolicy,

    /// Retention of unresolved commands in seconds
    #[arg(long, env = "OCPI_COMMAND_TTL", default_value = "900")]
    command_ttl: u64,

    /// Interval of the expired-command sweep in seconds
    #[arg(long, default_value = "60")]
    cleanup_interval: u64,

    /// Default and maximum page size of listings
    #[arg(long, default_value = "100")]
    page_limit: usize,

    #[arg(long, default_value = "1000")]
    max_page_limit: usize,

    /// JSON file with an array of token statuses to load at startup
    #[arg(long, env = "OCPI_TOKENS")]
    tokens: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error), RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Build configuration
    let mut config = EmspConfig::new(args.party.clone())
        .with_listen_addr(args.listen)
        .with_public_url(&args.public_url)
        .with_base_path(&args.base_path)
        .with_command_ttl(Duration::from_secs(args.command_ttl))
        .with_cleanup_interval(Duration::from_secs(args.cleanup_interval.max(1)))
        .with_page_limits(args.page_limit, args.max_page_limit);

    config = match args.downgrades {
        DowngradePolicy::Request => config,
        DowngradePolicy::Allow => config.with_downgrade_policy(true),
        DowngradePolicy::Deny => config.with_downgrade_policy(false),
    };
    for access in args.cpos {
        info!("Node: Accepting {} ({})", access.party, access.role);
        config = config.with_party(access);
    }
    for endpoint in args.cpo_endpoints {
        config = config.with_cpo_endpoint(endpoint);
    }
    if config.parties.is_empty() {
        warn!("Node: No CPO access configured, every request will be rejected");
    }

    let registry = Arc::new(Registry::new());
    if let Some(path) = &args.tokens {
        let loaded = load_tokens(&registry, path).await?;
        info!("Node: Loaded {} tokens from {}", loaded, path.display());
    }

    let commands = Arc::new(CommandStore::new(config.command_ttl));
    let authorization = AuthorizationService::new(Arc::new(LocalAuthorizer::new(
        registry.clone(),
        config.party.clone(),
    )));

    let cleanup = spawn_cleanup(commands.clone(), config.cleanup_interval);

    let state = ReceiverState::new(config, registry, commands, authorization)
        .with_observer(Arc::new(TracingObserver))
        .into_shared();

    info!("Node: Starting EMSP receiver for {}", args.party);
    ocpi_emsp::serve_with_shutdown(state, shutdown_signal()).await?;

    cleanup.abort();
    info!("Node: Stopped");
    Ok(())
}

/// Load token statuses from a JSON array file into the registry
async fn load_tokens(registry: &Registry, path: &PathBuf) -> Result<usize, Box<dyn std::error::Error>> {
    let raw = tokio::fs::read(path).await?;
    let statuses: Vec<TokenStatus> = serde_json::from_slice(&raw)?;

    let mut loaded = 0;
    for status in statuses {
        match registry.tokens().upsert(status, false).await {
            Ok(_) => loaded += 1,
            Err(e) => warn!("Node: Skipping token: {}", e),
        }
    }
    Ok(loaded)
}

fn spawn_cleanup(commands: Arc<CommandStore>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            commands.cleanup_expired();
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Node: Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Node: Shutting down");
}
