//! Parses the command line arguments and sets up logging.
//!
//! Running a relay that forwards everything arriving on 127.0.0.1:9000 to a
//! local DNS server, logging to a file:
//!
//! ```cargo run -- --udp-bind 127.0.0.1:9000 --udp-forward 127.0.0.1:53 --log-file```

use anyhow::Context;
use clap::Parser;
use prox_core::ProxyConfig;
use std::{
    fs::{create_dir_all, OpenOptions},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

const LOG_DIR: &str = "./logs";

/// Stores the different command line arguments.
#[derive(Parser, Debug)]
#[command(version, about = "Relays redirected TCP and UDP flows to their remotes")]
pub struct Args {
    /// Where the TCP server channel binds
    #[arg(long, default_value = "127.0.0.1:0")]
    pub tcp_bind: SocketAddr,
    /// Remote for TCP connections with no registered session
    #[arg(long)]
    pub tcp_forward: Option<SocketAddr>,
    /// Where the UDP server channel binds
    #[arg(long, default_value = "127.0.0.1:0")]
    pub udp_bind: SocketAddr,
    /// Remote for UDP datagrams with no registered session
    #[arg(long)]
    pub udp_forward: Option<SocketAddr>,
    /// The most sessions each transport keeps live at once
    #[arg(long, default_value_t = ProxyConfig::DEFAULT_MAX_SESSIONS)]
    pub max_sessions: usize,
    /// Seconds a TCP session may stay idle before it is reclaimed
    #[arg(long, default_value_t = 60)]
    pub tcp_timeout: u64,
    /// Seconds a UDP session may stay idle before it is reclaimed
    #[arg(long, default_value_t = 60)]
    pub udp_timeout: u64,
    /// Seconds between idle session sweeps
    #[arg(long, default_value_t = 10)]
    pub sweep_interval: u64,
    /// Lowest level logged unless RUST_LOG says otherwise
    #[arg(long, default_value = "info")]
    pub log_level: Level,
    /// Writes JSON logs to a dated file under ./logs instead of stderr
    #[arg(long)]
    pub log_file: bool,
}

impl Args {
    pub fn tcp_config(&self) -> ProxyConfig {
        ProxyConfig::new(self.tcp_bind)
            .max_sessions(self.max_sessions)
            .session_timeout(Duration::from_secs(self.tcp_timeout))
    }

    pub fn udp_config(&self) -> ProxyConfig {
        ProxyConfig::new(self.udp_bind)
            .max_sessions(self.max_sessions)
            .session_timeout(Duration::from_secs(self.udp_timeout))
    }

    /// Zero is bumped to one second.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }
}

/// Installs the global subscriber. Only call once, before the proxies start.
pub fn initialize_logging(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(args.log_level).into())
        .from_env_lossy();

    if args.log_file {
        create_dir_all(LOG_DIR).with_context(|| format!("failed to create {LOG_DIR}"))?;
        let file_path = format!(
            "{}/debug-{}.log",
            LOG_DIR,
            chrono::offset::Local::now().format("%y-%m-%d_%H-%M-%S")
        );
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&file_path)
            .with_context(|| format!("failed to open log file {file_path}"))?;
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("a global subscriber is already installed")?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .context("a global subscriber is already installed")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Args::try_parse_from(["prox"]).unwrap();
        assert_eq!(args.tcp_bind, "127.0.0.1:0".parse().unwrap());
        assert_eq!(args.tcp_forward, None);
        assert_eq!(args.udp_forward, None);
        assert_eq!(args.log_level, Level::INFO);
        assert!(!args.log_file);

        let tcp = args.tcp_config();
        assert_eq!(tcp.max_sessions, ProxyConfig::DEFAULT_MAX_SESSIONS);
        assert_eq!(tcp.session_timeout, ProxyConfig::DEFAULT_SESSION_TIMEOUT);
        assert_eq!(args.sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn per_transport_settings() {
        let args = Args::try_parse_from([
            "prox",
            "--tcp-bind",
            "0.0.0.0:7000",
            "--udp-forward",
            "10.0.0.53:53",
            "--max-sessions",
            "16",
            "--udp-timeout",
            "15",
            "--sweep-interval",
            "0",
            "--log-level",
            "trace",
        ])
        .unwrap();

        let tcp = args.tcp_config();
        assert_eq!(tcp.bind, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(tcp.max_sessions, 16);
        assert_eq!(tcp.session_timeout, Duration::from_secs(60));

        let udp = args.udp_config();
        assert_eq!(udp.session_timeout, Duration::from_secs(15));
        assert_eq!(args.udp_forward, Some("10.0.0.53:53".parse().unwrap()));
        assert_eq!(args.sweep_interval(), Duration::from_secs(1));
        assert_eq!(args.log_level, Level::TRACE);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(Args::try_parse_from(["prox", "--tcp-forward", "nowhere"]).is_err());
    }
}
