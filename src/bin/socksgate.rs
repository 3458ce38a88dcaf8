use anyhow::Result;
use clap::Parser;
use socksgate::{HealthCheck, Settings, Socks5Server};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args, falling back to environment variables
    let settings = Settings::parse();

    if settings.healthcheck {
        std::process::exit(run_healthcheck(&settings).await);
    }

    // Initialize tracing subscriber
    let level = if settings.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    // Configuration errors are fatal before anything is bound
    let auth = settings.credentials()?;
    match &auth {
        Some(creds) => info!("Authentication enabled for user '{}'", creds.username()),
        None => warn!(
            "Running the proxy server without authentication. This is NOT recommended for public servers."
        ),
    }

    let policy = settings.policy()?;
    if let Some(pattern) = policy.destination_pattern() {
        info!("Allowed destinations: {}", pattern.as_str());
    }
    if let Some(sources) = policy.allowed_sources() {
        info!("Allowed client IPs: {:?}", sources);
    }

    // Instantiate server
    let server = Socks5Server::new(settings.listen_addr())
        .with_auth(auth)
        .with_policy(policy)
        .with_timeouts(settings.timeouts()?);

    // Run it
    info!("Starting SOCKS5 proxy: {}", server.listen_addr);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

/// run_healthcheck probes the configured listener and returns the exit code
async fn run_healthcheck(settings: &Settings) -> i32 {
    let check = HealthCheck::new(settings.probe_addr(), settings.probe_credentials());

    match check.run().await {
        Ok(()) => {
            println!("Health check passed");
            0
        }
        Err(e) => {
            eprintln!("Health check failed: {e:#}");
            1
        }
    }
}
