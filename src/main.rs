//! benchwire - TCP, TLS and UDP throughput testing

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use benchwire::client::{Client, ClientConfig};
use benchwire::config::{Config, parse_duration};
use benchwire::output::output_plain;
use benchwire::serve::{Server, ServerConfig};

/// Initialize logging with optional file output
fn init_logging(log_file: Option<&str>, log_level: Option<&str>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = log_level.unwrap_or("info");
    let env_filter =
        EnvFilter::from_default_env().add_directive(format!("benchwire={}", level).parse()?);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .without_time();

    if let Some(file_path) = log_file {
        let expanded_path = match file_path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(file_path)),
            None => PathBuf::from(file_path),
        };

        if let Some(parent) = expanded_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file_appender = tracing_appender::rolling::daily(
            expanded_path
                .parent()
                .unwrap_or_else(|| std::path::Path::new(".")),
            expanded_path
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("benchwire.log")),
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // Keep guard alive for the duration of the program
        std::mem::forget(guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "benchwire")]
#[command(author, version, about = "TCP, TLS and UDP throughput testing")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start server mode
    Serve(ServeArgs),
}

#[derive(Args)]
struct ClientArgs {
    /// Target hosts; a missing port is taken from --port
    #[arg(value_name = "HOST")]
    hosts: Vec<String>,

    /// Port appended to hosts given without one
    #[arg(short, long, env = "BENCHWIRE_PORT")]
    port: Option<u16>,

    /// Parallel connections per host
    #[arg(short, long)]
    connections: Option<usize>,

    /// Report interval (bare numbers are seconds)
    #[arg(short, long, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Test duration (bare numbers are seconds)
    #[arg(short = 't', long, value_parser = parse_duration, env = "BENCHWIRE_DURATION")]
    time: Option<Duration>,

    /// TCP read buffer size (e.g., 64K, 1M)
    #[arg(long, value_parser = parse_size)]
    tcp_read_size: Option<usize>,

    /// TCP write buffer size
    #[arg(long, value_parser = parse_size)]
    tcp_write_size: Option<usize>,

    /// UDP read buffer size
    #[arg(long, value_parser = parse_size)]
    udp_read_size: Option<usize>,

    /// UDP datagram size
    #[arg(long, value_parser = parse_size)]
    udp_write_size: Option<usize>,

    /// Speed ceiling per writer in Mbps (0 for unlimited)
    #[arg(long)]
    max_speed: Option<f64>,

    /// Do not send from the client
    #[arg(long)]
    passive_client: bool,

    /// Ask the server not to send
    #[arg(long)]
    passive_server: bool,

    /// UDP mode
    #[arg(short = 'u', long)]
    udp: bool,

    /// Do not fall back to plaintext TCP
    #[arg(long)]
    no_tcp: bool,

    /// Do not try TLS first
    #[arg(long)]
    no_tls: bool,

    /// TLS client certificate file (PEM)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS client private key file (PEM)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Extra CA file trusted alongside the system roots
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Skip server certificate verification
    #[arg(long)]
    insecure: bool,

    /// Local address for outgoing connections
    #[arg(long)]
    local_addr: Option<String>,

    /// CSV export filename template ('%d' index, '%s' remote)
    #[arg(long)]
    csv: Option<String>,

    /// JSON export filename template ('%d' index, '%s' remote)
    #[arg(long)]
    export: Option<String>,

    /// Handshake timeout
    #[arg(long, value_parser = parse_duration)]
    handshake_timeout: Option<Duration>,

    /// Log file path (e.g., "~/.config/benchwire/benchwire.log")
    #[arg(long, env = "BENCHWIRE_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "BENCHWIRE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Args)]
struct ServeArgs {
    /// Listen address (can be repeated); an empty host binds all interfaces
    #[arg(short, long = "listen", action = clap::ArgAction::Append)]
    listeners: Vec<String>,

    /// Port appended to listen addresses given without one
    #[arg(short, long, env = "BENCHWIRE_PORT")]
    port: Option<u16>,

    /// Do not accept plaintext TCP
    #[arg(long)]
    no_tcp: bool,

    /// Do not listen on UDP
    #[arg(long)]
    no_udp: bool,

    /// Do not offer TLS
    #[arg(long)]
    no_tls: bool,

    /// TLS certificate file (PEM)
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM)
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// TLS CA file for client certificate verification
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Require a client certificate signed by the CA
    #[arg(long)]
    verify_client: bool,

    /// UDP read buffer size
    #[arg(long, value_parser = parse_size)]
    udp_read_size: Option<usize>,

    /// Keep finished UDP peers in the session table
    #[arg(long)]
    keep_udp_peers: bool,

    /// Handshake timeout
    #[arg(long, value_parser = parse_duration)]
    handshake_timeout: Option<Duration>,

    /// Log file path
    #[arg(long, env = "BENCHWIRE_LOG_FILE")]
    log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "BENCHWIRE_LOG_LEVEL")]
    log_level: Option<String>,
}

fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.to_uppercase();
    let (num, suffix) = if s.ends_with('G') {
        (s.trim_end_matches('G'), 1024 * 1024 * 1024usize)
    } else if s.ends_with('M') {
        (s.trim_end_matches('M'), 1024 * 1024usize)
    } else if s.ends_with('K') {
        (s.trim_end_matches('K'), 1024usize)
    } else {
        (s.as_str(), 1usize)
    };

    let n = num.parse::<usize>().map_err(|e| e.to_string())?;
    n.checked_mul(suffix)
        .ok_or_else(|| format!("size {} is too large", s))
}

impl ClientArgs {
    fn apply_to(self, config: &mut ClientConfig) {
        config.hosts = self.hosts;
        let options = &mut config.options;
        if let Some(interval) = self.interval {
            options.report_interval = interval;
        }
        if let Some(time) = self.time {
            options.total_duration = time;
        }
        if let Some(size) = self.tcp_read_size {
            options.tcp_read_size = size;
        }
        if let Some(size) = self.tcp_write_size {
            options.tcp_write_size = size;
        }
        if let Some(size) = self.udp_read_size {
            options.udp_read_size = size;
        }
        if let Some(size) = self.udp_write_size {
            options.udp_write_size = size;
        }
        if let Some(speed) = self.max_speed {
            options.max_speed = speed;
        }
        options.passive_server |= self.passive_server;

        if let Some(port) = self.port {
            config.default_port = port;
        }
        if let Some(connections) = self.connections {
            config.connections = connections;
        }
        config.passive_client |= self.passive_client;
        config.udp |= self.udp;
        config.tcp &= !self.no_tcp;
        config.tls.enabled &= !self.no_tls;
        config.tls.verify_server &= !self.insecure;
        if let Some(cert) = self.tls_cert {
            config.tls.cert_path = cert;
        }
        if let Some(key) = self.tls_key {
            config.tls.key_path = key;
        }
        if self.tls_ca.is_some() {
            config.tls.ca_path = self.tls_ca;
        }
        if self.local_addr.is_some() {
            config.local_addr = self.local_addr;
        }
        if self.csv.is_some() {
            config.export.csv = self.csv;
        }
        if self.export.is_some() {
            config.export.json = self.export;
        }
        if let Some(limit) = self.handshake_timeout {
            config.handshake_timeout = limit;
        }
    }
}

impl ServeArgs {
    fn apply_to(self, config: &mut ServerConfig) {
        if !self.listeners.is_empty() {
            config.listeners = self.listeners;
        }
        if let Some(port) = self.port {
            config.default_port = port;
        }
        config.tcp &= !self.no_tcp;
        config.udp &= !self.no_udp;
        config.tls.enabled &= !self.no_tls;
        config.tls.verify_client |= self.verify_client;
        if let Some(cert) = self.tls_cert {
            config.tls.cert_path = cert;
        }
        if let Some(key) = self.tls_key {
            config.tls.key_path = key;
        }
        if let Some(ca) = self.tls_ca {
            config.tls.ca_path = ca;
        }
        if let Some(size) = self.udp_read_size {
            config.udp_read_size = size;
        }
        config.udp_eviction &= !self.keep_udp_peers;
        if let Some(limit) = self.handshake_timeout {
            config.handshake_timeout = limit;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load config file (falls back to defaults if it cannot be read)
    let (file_config, config_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    match cli.command {
        Some(Commands::Serve(args)) => {
            let log_file = args
                .log_file
                .as_ref()
                .or(file_config.server.log_file.as_ref());
            let log_level = args
                .log_level
                .as_ref()
                .or(file_config.server.log_level.as_ref());
            init_logging(log_file.map(|s| s.as_str()), log_level.map(|s| s.as_str()))?;
            if let Some(e) = config_error {
                warn!("Ignoring {}: {:#}", Config::config_path().display(), e);
            }

            let mut config = ServerConfig::default();
            file_config.server.apply_to(&mut config);
            args.apply_to(&mut config);

            Server::new(config).run().await
        }
        None => {
            let args = cli.client;
            let log_file = args
                .log_file
                .as_ref()
                .or(file_config.client.log_file.as_ref());
            let log_level = args
                .log_level
                .as_ref()
                .or(file_config.client.log_level.as_ref());
            init_logging(log_file.map(|s| s.as_str()), log_level.map(|s| s.as_str()))?;
            if let Some(e) = config_error {
                warn!("Ignoring {}: {:#}", Config::config_path().display(), e);
            }

            let mut config = ClientConfig::default();
            file_config.client.apply_to(&mut config)?;
            args.apply_to(&mut config);

            let stats = Client::new(config).run().await?;
            print!("{}", output_plain(&stats));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1500"), Ok(1500));
        assert_eq!(parse_size("64k"), Ok(64 * 1024));
        assert_eq!(parse_size("1M"), Ok(1024 * 1024));
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999G").is_err());
        assert!(parse_size(&format!("{}K", usize::MAX)).is_err());
    }

    #[test]
    fn test_client_flags_override_defaults() {
        let cli = Cli::parse_from([
            "benchwire",
            "10.0.0.1",
            "10.0.0.2:9000",
            "-c",
            "3",
            "-t",
            "5",
            "--no-tls",
            "--passive-server",
            "--csv",
            "out-%d-%s.csv",
        ]);
        assert!(cli.command.is_none());

        let mut config = ClientConfig::default();
        cli.client.apply_to(&mut config);
        assert_eq!(config.hosts, vec!["10.0.0.1", "10.0.0.2:9000"]);
        assert_eq!(config.connections, 3);
        assert_eq!(config.options.total_duration, Duration::from_secs(5));
        assert!(!config.tls.enabled);
        assert!(config.tcp);
        assert!(config.options.passive_server);
        assert_eq!(config.export.csv.as_deref(), Some("out-%d-%s.csv"));
    }

    #[test]
    fn test_serve_flags() {
        let cli = Cli::parse_from([
            "benchwire",
            "serve",
            "-l",
            ":9000",
            "-l",
            "127.0.0.1:9001",
            "--no-udp",
            "--keep-udp-peers",
        ]);
        let Some(Commands::Serve(args)) = cli.command else {
            panic!("expected serve subcommand");
        };

        let mut config = ServerConfig::default();
        args.apply_to(&mut config);
        assert_eq!(config.listeners, vec![":9000", "127.0.0.1:9001"]);
        assert!(!config.udp);
        assert!(config.tcp);
        assert!(!config.udp_eviction);
    }
}
