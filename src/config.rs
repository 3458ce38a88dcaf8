//! Startup configuration.
//!
//! Every option is a command line flag that falls back to an environment
//! variable, so the proxy can be configured either way (flags win).

use crate::{
    auth::Credentials,
    policy::{AccessPolicy, HostPattern},
    server::Timeouts,
};
use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, builder::BoolishValueParser};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

/// Upper bound for any configured timeout: one year
const MAX_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "A lightweight SOCKS5 proxy with authentication and access control", long_about = None)]
pub struct Settings {
    /// Username for SOCKS5 proxy
    #[arg(short, long, env = "PROXY_USER")]
    pub user: Option<String>,

    /// Password for SOCKS5 proxy
    #[arg(short, long, env = "PROXY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Listener port
    #[arg(long, env = "PROXY_PORT", default_value_t = 1080)]
    pub port: u16,

    /// Listener address
    #[arg(long, env = "PROXY_LISTEN_IP", default_value = "0.0.0.0")]
    pub listen_ip: String,

    /// Refuse to start unless username and password are set
    #[arg(
        long,
        env = "REQUIRE_AUTH",
        default_value = "true",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new()
    )]
    pub require_auth: bool,

    /// Allowed destination hosts: a glob such as `*.example.com`, or
    /// `regex:<expr>`
    #[arg(long, env = "ALLOWED_DEST_FQDN")]
    pub allowed_dest: Option<String>,

    /// Comma separated client IPs allowed to connect
    #[arg(long, env = "ALLOWED_IPS", value_delimiter = ',')]
    pub allowed_ips: Vec<String>,

    /// Seconds allowed for greeting, authentication and request
    #[arg(long, env = "PROXY_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Seconds allowed for resolving and connecting to a destination
    #[arg(long, env = "PROXY_CONNECT_TIMEOUT", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds a relay may sit without traffic before it is closed
    #[arg(long, env = "PROXY_IDLE_TIMEOUT", default_value_t = 900)]
    pub idle_timeout: u64,

    /// Probe a running proxy and exit
    #[arg(long)]
    pub healthcheck: bool,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Settings {
    /// credentials validates the username/password pair against
    /// `require_auth`
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        match (non_empty(&self.user), non_empty(&self.password)) {
            (Some(user), Some(password)) => Ok(Some(Credentials::new(user, password))),
            (None, None) if self.require_auth => bail!(
                "REQUIRE_AUTH is true, but PROXY_USER and PROXY_PASSWORD are not set"
            ),
            (None, None) => Ok(None),
            _ => bail!("must provide both username and password (or neither)"),
        }
    }

    /// probe_credentials is the pair the health check presents, if both
    /// halves are set. `require_auth` does not apply to the probe.
    pub fn probe_credentials(&self) -> Option<Credentials> {
        match (non_empty(&self.user), non_empty(&self.password)) {
            (Some(user), Some(password)) => Some(Credentials::new(user, password)),
            _ => None,
        }
    }

    pub fn policy(&self) -> Result<AccessPolicy> {
        let pattern = non_empty(&self.allowed_dest)
            .map(HostPattern::parse)
            .transpose()?;

        let sources = self
            .allowed_ips
            .iter()
            .map(|ip| ip.trim())
            .filter(|ip| !ip.is_empty())
            .map(|ip| {
                ip.parse::<IpAddr>()
                    .with_context(|| format!("invalid address in ALLOWED_IPS: '{ip}'"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(AccessPolicy::new()
            .with_destination_pattern(pattern)
            .with_allowed_sources(sources))
    }

    /// timeouts validates the configured timeouts; each must be between one
    /// second and one year
    pub fn timeouts(&self) -> Result<Timeouts> {
        Ok(Timeouts {
            handshake: timeout_secs("PROXY_HANDSHAKE_TIMEOUT", self.handshake_timeout)?,
            connect: timeout_secs("PROXY_CONNECT_TIMEOUT", self.connect_timeout)?,
            idle: timeout_secs("PROXY_IDLE_TIMEOUT", self.idle_timeout)?,
        })
    }

    /// listen_addr is the `host:port` string to bind
    pub fn listen_addr(&self) -> String {
        let ip = self.listen_ip.trim();
        let ip = if ip.is_empty() { "0.0.0.0" } else { ip };

        match ip.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", ip, self.port),
        }
    }

    /// probe_addr is where the health check dials: the listen address, with
    /// wildcard addresses replaced by loopback
    pub fn probe_addr(&self) -> String {
        match self.listen_ip.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) if ip.is_unspecified() => {
                SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.port).to_string()
            }
            Ok(IpAddr::V6(ip)) if ip.is_unspecified() => {
                SocketAddr::new(Ipv6Addr::LOCALHOST.into(), self.port).to_string()
            }
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) if self.listen_ip.trim().is_empty() => {
                SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.port).to_string()
            }
            Err(_) => self.listen_addr(),
        }
    }
}

fn timeout_secs(name: &str, secs: u64) -> Result<Duration> {
    if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
        bail!("{name} must be between 1 and {MAX_TIMEOUT_SECS} seconds, got {secs}");
    }
    Ok(Duration::from_secs(secs))
}

// Environment defaults arrive as empty strings
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}
