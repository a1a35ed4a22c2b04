//! Command line and runtime configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};

use crate::upstream::UpstreamMode;

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
#[command(group(ArgGroup::new("mode").required(true).args(["nodns", "dns"])))]
pub struct Args {
    /// Talk to a fixed origin server
    #[arg(long, num_args = 4, value_names = ["LISTEN_PORT", "WWW_IP", "ALPHA", "LOG"])]
    pub nodns: Option<Vec<String>>,

    /// Resolve the origin server through a DNS load balancer
    #[arg(long, num_args = 5, value_names = ["LISTEN_PORT", "DNS_IP", "DNS_PORT", "ALPHA", "LOG"])]
    pub dns: Option<Vec<String>>,

    #[arg(long, default_value_t = 80)]
    pub origin_port: u16,

    #[arg(long, value_enum, default_value_t = UpstreamMode::Shared)]
    pub upstream: UpstreamMode,

    #[arg(long, default_value_t = 10)]
    pub timeout_connect: u64,

    #[arg(long, default_value_t = 0)]
    pub timeout_idle: u64,

    #[arg(long, default_value_t = 60)]
    pub stats_interval: u64,

    #[arg(long, short = 'q')]
    pub quiet: bool,

    #[arg(long, short = 'v')]
    pub verbose: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

// ============================================================================
// PROXY CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum OriginSource {
    Fixed(IpAddr),
    Dns { server: IpAddr, port: u16 },
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_port: u16,
    pub origin: OriginSource,
    pub origin_port: u16,
    pub alpha: f64,
    pub log_path: PathBuf,
    pub upstream: UpstreamMode,
    pub connect_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub stats_interval: Option<Duration>,
}

impl ProxyConfig {
    pub fn from_args(args: &Args) -> Result<Self> {
        let (listen_port, origin, alpha, log_path) = match (&args.nodns, &args.dns) {
            (Some(values), None) => (
                parse_port(&values[0], "listen port")?,
                OriginSource::Fixed(parse_ip(&values[1], "www ip")?),
                parse_alpha(&values[2])?,
                PathBuf::from(&values[3]),
            ),
            (None, Some(values)) => (
                parse_port(&values[0], "listen port")?,
                OriginSource::Dns {
                    server: parse_ip(&values[1], "dns ip")?,
                    port: parse_port(&values[2], "dns port")?,
                },
                parse_alpha(&values[3])?,
                PathBuf::from(&values[4]),
            ),
            _ => bail!("exactly one of --nodns or --dns is required"),
        };

        Ok(Self {
            listen_port,
            origin,
            origin_port: args.origin_port,
            alpha,
            log_path,
            upstream: args.upstream,
            connect_timeout: secs(args.timeout_connect),
            idle_timeout: secs(args.timeout_idle),
            stats_interval: secs(args.stats_interval),
        })
    }

    /// Address of the origin server.
    pub fn origin_addr(&self) -> Result<SocketAddr> {
        match self.origin {
            OriginSource::Fixed(ip) => Ok(SocketAddr::new(ip, self.origin_port)),
            OriginSource::Dns { server, port } => bail!(
                "origin resolution through DNS ({}:{}) is not supported; use --nodns",
                server,
                port
            ),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.listen_port))
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

fn parse_port(value: &str, what: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .with_context(|| format!("invalid {}: {:?}", what, value))
}

fn parse_ip(value: &str, what: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .with_context(|| format!("invalid {}: {:?}", what, value))
}

fn parse_alpha(value: &str) -> Result<f64> {
    let alpha = value
        .parse::<f64>()
        .with_context(|| format!("invalid alpha: {:?}", value))?;
    if !(alpha > 0.0 && alpha <= 1.0) {
        bail!("alpha must be in (0, 1], got {}", alpha);
    }
    Ok(alpha)
}
