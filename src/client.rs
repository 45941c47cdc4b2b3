//! Client mode implementation
//!
//! Opens the requested number of connections to every host, runs one
//! session per connection and sums the results.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::net::{self, append_port_if_missing, port_suffix};
use crate::output::ExportConfig;
use crate::protocol::{
    DEFAULT_PORT, HANDSHAKE_TIMEOUT, Options, encode_datagram, recv_ack, send_options,
};
use crate::session::{SessionOutcome, WorkerPlan, supervise};
use crate::stats::{Aggregate, Aggregates, Rate, SessionReport};
use crate::tcp::{self, StreamReader, StreamWriter};
use crate::tls::{self, MaybeTlsStream, TlsClientConfig};
use crate::udp::{DatagramReader, DatagramWriter};
use crate::worker::{Role, WorkerSpec, random_buffer};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub hosts: Vec<String>,
    pub default_port: u16,
    /// Parallel connections per host
    pub connections: usize,
    pub options: Options,
    /// Suppress the client's own writer
    pub passive_client: bool,
    pub udp: bool,
    /// Allow plaintext TCP, alone or as the fallback from TLS
    pub tcp: bool,
    pub tls: TlsClientConfig,
    pub local_addr: Option<String>,
    pub export: ExportConfig,
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            default_port: DEFAULT_PORT,
            connections: 1,
            options: Options::default(),
            passive_client: false,
            udp: false,
            tcp: true,
            tls: TlsClientConfig::default(),
            local_addr: None,
            export: ExportConfig::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.hosts.is_empty() {
            anyhow::bail!("no hosts given");
        }
        if self.connections == 0 {
            anyhow::bail!("connections must be at least 1");
        }
        if !self.udp && !self.tcp && !self.tls.enabled {
            anyhow::bail!("TCP, TLS and UDP are all disabled");
        }
        self.options.validate()?;
        self.export.validate()?;
        Ok(())
    }

    fn protocol(&self) -> &'static str {
        if self.udp { "udp" } else { "tcp" }
    }
}

/// One finished client session
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub target: String,
    pub index: usize,
    pub remote: SocketAddr,
    pub is_tls: bool,
    pub read: Option<Rate>,
    pub write: Option<Rate>,
    pub report: SessionReport,
}

#[derive(Debug, Clone)]
pub struct ClientStats {
    pub total_duration: Duration,
    pub read_mbps: f64,
    pub write_mbps: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub sessions: Vec<SessionResult>,
    pub failed_attempts: usize,
}

enum Connection {
    Stream(MaybeTlsStream, SocketAddr),
    Datagram(UdpSocket, SocketAddr),
}

impl Connection {
    fn remote(&self) -> SocketAddr {
        match self {
            Connection::Stream(_, remote) | Connection::Datagram(_, remote) => *remote,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Connection::Stream(stream, _) => stream.label(),
            Connection::Datagram(..) => "UDP",
        }
    }
}

/// Everything a spawned session needs
#[derive(Clone)]
struct SessionContext {
    target: String,
    index: usize,
    connections: usize,
    options: Options,
    passive_client: bool,
    handshake_timeout: Duration,
    aggregates: Aggregates,
    export: ExportConfig,
}

impl SessionContext {
    fn conn(&self) -> String {
        format!("{}/{}", self.index, self.connections)
    }

    fn spec(
        &self,
        name: &'static str,
        role: Role,
        max_speed: f64,
        aggregate: &Aggregate,
    ) -> WorkerSpec {
        WorkerSpec {
            conn: self.conn(),
            name,
            role,
            report_interval: self.options.report_interval,
            max_speed,
            record_series: true,
            aggregate: aggregate.clone(),
        }
    }
}

pub struct Client {
    config: ClientConfig,
    aggregates: Aggregates,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            aggregates: Aggregates::new(),
        }
    }

    pub fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    pub async fn run(&self) -> anyhow::Result<ClientStats> {
        self.config.validate()?;
        let config = &self.config;

        let connector = if !config.udp {
            match config.tls.create_connector() {
                Ok(connector) => connector,
                Err(e) => {
                    warn!("TLS unavailable: {:#}", e);
                    None
                }
            }
        } else {
            None
        };
        let bind_addr = net::resolve_local(config.local_addr.as_deref()).await;
        let port = port_suffix(config.default_port);

        let mut sessions = Vec::new();
        let mut failed_attempts = 0;

        for host in &config.hosts {
            let target = append_port_if_missing(host, &port);

            for index in 0..config.connections {
                info!(
                    "Opening TLS={} {} {}/{}: {}",
                    connector.is_some(),
                    config.protocol(),
                    index,
                    config.connections,
                    target
                );

                let Some(conn) = self.open(&target, connector.as_ref(), bind_addr).await else {
                    failed_attempts += 1;
                    continue;
                };

                let ctx = SessionContext {
                    target: target.clone(),
                    index,
                    connections: config.connections,
                    options: config.options.clone(),
                    passive_client: config.passive_client,
                    handshake_timeout: config.handshake_timeout,
                    aggregates: self.aggregates.clone(),
                    export: config.export.clone(),
                };
                sessions.push(tokio::spawn(run_session(conn, ctx)));
            }
        }

        if sessions.is_empty() {
            anyhow::bail!("no successful connections");
        }

        let mut results = Vec::new();
        for joined in join_all(sessions).await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => warn!("Session task failed: {}", e),
            }
        }

        let reading = self.aggregates.reader.snapshot();
        let writing = self.aggregates.writer.snapshot();
        info!(
            "aggregate reading: {:.6} Mbps {} recv/s",
            reading.mbps, reading.cps as i64
        );
        info!(
            "aggregate writing: {:.6} Mbps {} send/s",
            writing.mbps, writing.cps as i64
        );

        Ok(ClientStats {
            total_duration: config.options.total_duration,
            read_mbps: reading.mbps,
            write_mbps: writing.mbps,
            read_bytes: reading.bytes,
            write_bytes: writing.bytes,
            sessions: results,
            failed_attempts,
        })
    }

    /// Dial one target: TLS first when available, then plain TCP or UDP.
    async fn open(
        &self,
        target: &str,
        connector: Option<&TlsConnector>,
        bind_addr: Option<SocketAddr>,
    ) -> Option<Connection> {
        let config = &self.config;

        if !config.udp
            && let Some(connector) = connector
        {
            match dial_tls(target, connector, bind_addr, config.handshake_timeout).await {
                Ok(conn) => return Some(conn),
                Err(e) => warn!("TLS to {} failed: {:#}", target, e),
            }
        }

        if config.udp {
            match net::connect_udp(target, bind_addr).await {
                Ok((socket, remote)) => Some(Connection::Datagram(socket, remote)),
                Err(e) => {
                    warn!("UDP dial {} failed: {}", target, e);
                    None
                }
            }
        } else if config.tcp {
            debug!("Trying plain TCP to {}", target);
            match net::connect_tcp(target, bind_addr).await {
                Ok((stream, remote)) => {
                    Some(Connection::Stream(MaybeTlsStream::Plain(stream), remote))
                }
                Err(e) => {
                    warn!("TCP dial {} failed: {}", target, e);
                    None
                }
            }
        } else {
            warn!("All enabled transports failed to connect to {}", target);
            None
        }
    }
}

async fn dial_tls(
    target: &str,
    connector: &TlsConnector,
    bind_addr: Option<SocketAddr>,
    limit: Duration,
) -> anyhow::Result<Connection> {
    let (stream, remote) = net::connect_tcp(target, bind_addr).await?;
    let server_name = match net::host_of(target) {
        "" => "localhost",
        host => host,
    };
    let stream = tokio::time::timeout(limit, tls::connect_tls(stream, connector, server_name))
        .await
        .map_err(|_| anyhow::anyhow!("TLS handshake timed out"))??;
    Ok(Connection::Stream(stream, remote))
}

async fn run_session(conn: Connection, ctx: SessionContext) -> Option<SessionResult> {
    let remote = conn.remote();
    let label = conn.label();
    let is_tls = matches!(conn, Connection::Stream(MaybeTlsStream::Tls(_), _));
    let conn_label = ctx.conn();
    info!("Starting {} {} {}", label, conn_label, remote);

    let outcome = match conn {
        Connection::Stream(stream, _) => stream_session(stream, &ctx).await,
        Connection::Datagram(socket, _) => datagram_session(socket, &ctx).await,
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("{} {} {}: {:#}", label, conn_label, remote, e);
            return None;
        }
    };

    let report = SessionReport {
        input: outcome
            .reader
            .as_ref()
            .map(|o| o.series.clone())
            .unwrap_or_default(),
        output: outcome
            .writer
            .as_ref()
            .map(|o| o.series.clone())
            .unwrap_or_default(),
    };
    ctx.export.export(ctx.index, &remote.to_string(), &report);

    info!("Closing {} {} {}", label, conn_label, remote);
    Some(SessionResult {
        target: ctx.target.clone(),
        index: ctx.index,
        remote,
        is_tls,
        read: outcome.reader.map(|o| o.average),
        write: outcome.writer.map(|o| o.average),
        report,
    })
}

async fn stream_session(
    stream: MaybeTlsStream,
    ctx: &SessionContext,
) -> anyhow::Result<SessionOutcome> {
    let label = stream.label();
    let (mut read_half, mut write_half) = tcp::split(stream);

    send_options(&mut write_half, &ctx.options).await?;
    debug!("{} {} options sent: {:?}", label, ctx.conn(), ctx.options);

    let ack = recv_ack(&mut read_half, ctx.handshake_timeout).await?;
    info!(
        "{} {} ack received, server version {}",
        label,
        ctx.conn(),
        ack.server_version()
    );

    let options = &ctx.options;
    let reader = WorkerPlan {
        io: StreamReader::new(read_half),
        buf: vec![0u8; options.tcp_read_size],
        spec: ctx.spec("clientReader", Role::Reader, 0.0, &ctx.aggregates.reader),
    };
    let writer = (!ctx.passive_client).then(|| WorkerPlan {
        io: StreamWriter::new(write_half),
        buf: random_buffer(options.tcp_write_size),
        spec: ctx.spec(
            "clientWriter",
            Role::Writer,
            options.max_speed,
            &ctx.aggregates.writer,
        ),
    });

    Ok(supervise(&ctx.conn(), options.total_duration, reader, writer).await)
}

async fn datagram_session(
    socket: UdpSocket,
    ctx: &SessionContext,
) -> anyhow::Result<SessionOutcome> {
    let socket = Arc::new(socket);
    let options = &ctx.options;

    socket.send(&encode_datagram(options)?).await?;
    debug!("UDP {} options sent: {:?}", ctx.conn(), options);

    let reader = WorkerPlan {
        io: DatagramReader::new(socket.clone()),
        buf: vec![0u8; options.udp_read_size],
        spec: ctx.spec("clientReader", Role::Reader, 0.0, &ctx.aggregates.reader),
    };
    let writer = (!ctx.passive_client).then(|| WorkerPlan {
        io: DatagramWriter::new(socket.clone()),
        buf: random_buffer(options.udp_write_size),
        spec: ctx.spec(
            "clientWriter",
            Role::Writer,
            options.max_speed,
            &ctx.aggregates.writer,
        ),
    });

    Ok(supervise(&ctx.conn(), options.total_duration, reader, writer).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let mut config = ClientConfig::default();
        assert!(config.validate().is_err());

        config.hosts = vec!["localhost".to_string()];
        assert!(config.validate().is_ok());

        config.connections = 0;
        assert!(config.validate().is_err());
        config.connections = 2;

        config.tcp = false;
        config.tls.enabled = false;
        assert!(config.validate().is_err());
        config.udp = true;
        assert!(config.validate().is_ok());

        config.export.csv = Some("no-placeholders.csv".to_string());
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_no_successful_connections() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ClientConfig {
            hosts: vec!["127.0.0.1".to_string()],
            default_port: port,
            connections: 2,
            tls: TlsClientConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };

        let err = Client::new(config).run().await.unwrap_err();
        assert!(err.to_string().contains("no successful connections"));
    }
}
