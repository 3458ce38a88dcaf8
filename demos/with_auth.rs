//! SOCKS5 server with username/password authentication and access rules

use socksgate::{AccessPolicy, Credentials, HostPattern, Socks5Server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let auth = Credentials::new("<user>", "<pass>");

    // Only local clients, only *.example.com destinations
    let policy = AccessPolicy::new()
        .with_destination_pattern(Some(HostPattern::parse("*.example.com")?))
        .with_allowed_sources(["127.0.0.1".parse::<std::net::IpAddr>()?]);

    let server = Socks5Server::new("127.0.0.1:1080")
        .with_auth(Some(auth))
        .with_policy(policy);

    server.run().await?;
    Ok(())
}
