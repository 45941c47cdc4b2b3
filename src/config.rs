//! Configuration file support
//!
//! Loads configuration from ~/.config/benchwire/config.toml. Every field is
//! optional; values found here replace the built-in defaults and are in
//! turn overridden by command-line flags.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::client::ClientConfig;
use crate::serve::ServerConfig;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub client: ClientDefaults,

    #[serde(default)]
    pub server: ServerDefaults,
}

/// Default settings for client mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientDefaults {
    /// Port appended to hosts given without one
    pub default_port: Option<u16>,

    /// Parallel connections per host
    pub connections: Option<usize>,

    /// Report interval (e.g. "2s", or a bare number of seconds)
    pub report_interval: Option<String>,

    /// Total test duration
    pub duration: Option<String>,

    pub tcp_read_size: Option<usize>,
    pub tcp_write_size: Option<usize>,
    pub udp_read_size: Option<usize>,
    pub udp_write_size: Option<usize>,

    /// Speed ceiling in Mbps, 0 for unlimited
    pub max_speed: Option<f64>,

    pub passive_client: Option<bool>,
    pub passive_server: Option<bool>,

    pub udp: Option<bool>,

    /// Allow plaintext TCP
    pub tcp: Option<bool>,

    /// Try TLS first
    pub tls: Option<bool>,

    /// TLS client certificate path
    pub tls_cert: Option<String>,

    /// TLS client key path
    pub tls_key: Option<String>,

    /// Extra CA added to the system roots
    pub tls_ca: Option<String>,

    /// Verify the server certificate
    pub tls_verify_server: Option<bool>,

    /// Local address for outgoing connections
    pub local_addr: Option<String>,

    /// CSV export template ('%d' index, '%s' remote address)
    pub csv: Option<String>,

    /// JSON export template ('%d' index, '%s' remote address)
    pub export: Option<String>,

    /// Log file path (e.g., "~/.config/benchwire/benchwire.log")
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

/// Default settings for server mode
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerDefaults {
    /// Listen addresses
    pub listeners: Option<Vec<String>>,

    pub default_port: Option<u16>,

    /// Accept plaintext TCP
    pub tcp: Option<bool>,

    pub udp: Option<bool>,

    /// Offer TLS when the certificate files exist
    pub tls: Option<bool>,

    /// TLS certificate path
    pub tls_cert: Option<String>,

    /// TLS key path
    pub tls_key: Option<String>,

    /// TLS CA path
    pub tls_ca: Option<String>,

    /// Require client certificates signed by the CA
    pub tls_verify_client: Option<bool>,

    pub udp_read_size: Option<usize>,

    /// Remove finished UDP peers from the session table
    pub udp_eviction: Option<bool>,

    /// Log file path
    pub log_file: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("benchwire")
            .join("config.toml")
    }
}

/// Parse a duration; a bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return Duration::try_from_secs_f64(secs).map_err(|e| e.to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

fn duration_field(name: &str, value: &Option<String>) -> anyhow::Result<Option<Duration>> {
    value
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| anyhow::anyhow!("invalid {} in config file: {}", name, e))
}

impl ClientDefaults {
    /// Overwrite `config` with every value set in the file.
    pub fn apply_to(&self, config: &mut ClientConfig) -> anyhow::Result<()> {
        let options = &mut config.options;
        if let Some(interval) = duration_field("report_interval", &self.report_interval)? {
            options.report_interval = interval;
        }
        if let Some(duration) = duration_field("duration", &self.duration)? {
            options.total_duration = duration;
        }
        set(&mut options.tcp_read_size, self.tcp_read_size);
        set(&mut options.tcp_write_size, self.tcp_write_size);
        set(&mut options.udp_read_size, self.udp_read_size);
        set(&mut options.udp_write_size, self.udp_write_size);
        set(&mut options.max_speed, self.max_speed);
        set(&mut options.passive_server, self.passive_server);

        set(&mut config.default_port, self.default_port);
        set(&mut config.connections, self.connections);
        set(&mut config.passive_client, self.passive_client);
        set(&mut config.udp, self.udp);
        set(&mut config.tcp, self.tcp);
        set(&mut config.tls.enabled, self.tls);
        set(&mut config.tls.verify_server, self.tls_verify_server);
        if let Some(cert) = &self.tls_cert {
            config.tls.cert_path = PathBuf::from(cert);
        }
        if let Some(key) = &self.tls_key {
            config.tls.key_path = PathBuf::from(key);
        }
        if let Some(ca) = &self.tls_ca {
            config.tls.ca_path = Some(PathBuf::from(ca));
        }
        if self.local_addr.is_some() {
            config.local_addr = self.local_addr.clone();
        }
        if self.csv.is_some() {
            config.export.csv = self.csv.clone();
        }
        if self.export.is_some() {
            config.export.json = self.export.clone();
        }
        Ok(())
    }
}

impl ServerDefaults {
    /// Overwrite `config` with every value set in the file.
    pub fn apply_to(&self, config: &mut ServerConfig) {
        if let Some(listeners) = &self.listeners {
            config.listeners = listeners.clone();
        }
        set(&mut config.default_port, self.default_port);
        set(&mut config.tcp, self.tcp);
        set(&mut config.udp, self.udp);
        set(&mut config.tls.enabled, self.tls);
        set(&mut config.tls.verify_client, self.tls_verify_client);
        if let Some(cert) = &self.tls_cert {
            config.tls.cert_path = PathBuf::from(cert);
        }
        if let Some(key) = &self.tls_key {
            config.tls.key_path = PathBuf::from(key);
        }
        if let Some(ca) = &self.tls_ca {
            config.tls.ca_path = PathBuf::from(ca);
        }
        set(&mut config.udp_read_size, self.udp_read_size);
        set(&mut config.udp_eviction, self.udp_eviction);
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.client.connections.is_none());
        assert!(config.server.listeners.is_none());
        assert!(Config::config_path().ends_with("benchwire/config.toml"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("0.5"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("1m 30s"), Ok(Duration::from_secs(90)));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[client]
connections = 4
duration = "30s"
report_interval = "1"
max_speed = 100.0
tls = false
csv = "run-%d-%s.csv"

[server]
listeners = [":9000", "127.0.0.1:9001"]
udp_eviction = false
tls_ca = "/etc/benchwire/ca.pem"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.client.connections, Some(4));
        assert_eq!(config.server.listeners.as_ref().unwrap().len(), 2);

        let mut client = ClientConfig::default();
        config.client.apply_to(&mut client).unwrap();
        assert_eq!(client.connections, 4);
        assert_eq!(client.options.total_duration, Duration::from_secs(30));
        assert_eq!(client.options.report_interval, Duration::from_secs(1));
        assert_eq!(client.options.max_speed, 100.0);
        assert!(!client.tls.enabled);
        assert_eq!(client.export.csv.as_deref(), Some("run-%d-%s.csv"));
        // Untouched fields keep their defaults
        assert_eq!(client.options.tcp_read_size, 1_000_000);

        let mut server = ServerConfig::default();
        config.server.apply_to(&mut server);
        assert_eq!(server.listeners, vec![":9000", "127.0.0.1:9001"]);
        assert!(!server.udp_eviction);
        assert_eq!(server.tls.ca_path, PathBuf::from("/etc/benchwire/ca.pem"));
        assert!(server.udp);
    }

    #[test]
    fn test_bad_duration_is_reported() {
        let defaults = ClientDefaults {
            duration: Some("forever".to_string()),
            ..Default::default()
        };
        let err = defaults
            .apply_to(&mut ClientConfig::default())
            .unwrap_err();
        assert!(err.to_string().contains("duration"));
    }
}
