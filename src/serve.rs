//! Server mode implementation
//!
//! Binds a TCP listener and a UDP socket per listen address. TCP connections
//! run the options/ack handshake and a full duplex session; UDP peers are
//! tracked by the dispatcher in [`crate::udp`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::net::{self, append_port_if_missing, port_suffix};
use crate::protocol::{
    Ack, DEFAULT_PORT, DEFAULT_UDP_BUFFER, HANDSHAKE_TIMEOUT, recv_options, send_ack,
};
use crate::session::{WorkerPlan, supervise};
use crate::stats::Aggregates;
use crate::tcp::{self, StreamReader, StreamWriter};
use crate::tls::{self, MaybeTlsStream, TLS_HANDSHAKE_RECORD, TlsServerConfig};
use crate::udp::serve_udp;
use crate::worker::{Role, WorkerSpec, random_buffer};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen addresses; an empty host binds all IPv4 interfaces
    pub listeners: Vec<String>,
    pub default_port: u16,
    /// Accept plaintext TCP
    pub tcp: bool,
    pub udp: bool,
    pub tls: TlsServerConfig,
    pub udp_read_size: usize,
    /// Drop UDP peers from the table once their session ends
    pub udp_eviction: bool,
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listeners: vec![String::new()],
            default_port: DEFAULT_PORT,
            tcp: true,
            udp: true,
            tls: TlsServerConfig::default(),
            udp_read_size: DEFAULT_UDP_BUFFER,
            udp_eviction: true,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.listeners.is_empty() {
            anyhow::bail!("no listen addresses given");
        }
        if !self.tcp && !self.udp && !self.tls.enabled {
            anyhow::bail!("TCP, TLS and UDP are all disabled");
        }
        if self.udp_read_size == 0 {
            anyhow::bail!("udp_read_size must be at least 1");
        }
        Ok(())
    }
}

/// State shared by every TCP connection handler
struct ConnectionContext {
    acceptor: Option<TlsAcceptor>,
    plain: bool,
    handshake_timeout: Duration,
    aggregates: Aggregates,
    next_id: AtomicU64,
}

impl ConnectionContext {
    fn mode(&self) -> &'static str {
        match (&self.acceptor, self.plain) {
            (Some(_), true) => "TLS+TCP",
            (Some(_), false) => "TLS",
            (None, _) => "TCP",
        }
    }
}

pub struct Server {
    config: ServerConfig,
    aggregates: Aggregates,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            aggregates: Aggregates::new(),
        }
    }

    pub fn aggregates(&self) -> &Aggregates {
        &self.aggregates
    }

    /// Bind every listener and start serving in the background.
    pub async fn start(&self) -> anyhow::Result<RunningServer> {
        self.config.validate()?;
        let config = &self.config;

        let acceptor = config.tls.acceptor_for_run();
        let ctx = Arc::new(ConnectionContext {
            plain: config.tcp,
            acceptor,
            handshake_timeout: config.handshake_timeout,
            aggregates: self.aggregates.clone(),
            next_id: AtomicU64::new(0),
        });
        let serve_tcp = ctx.acceptor.is_some() || config.tcp;

        let port = port_suffix(config.default_port);
        let mut running = RunningServer::default();

        for listen in &config.listeners {
            let target = append_port_if_missing(listen, &port);
            let addr = match net::resolve(&target).await {
                Ok(addrs) => addrs[0],
                Err(e) => {
                    warn!("Cannot resolve listen address {}: {}", target, e);
                    continue;
                }
            };

            if serve_tcp {
                match net::bind_tcp_listener(addr) {
                    Ok(listener) => {
                        let local = listener.local_addr()?;
                        info!("Listening {} on {}", ctx.mode(), local);
                        running.tcp_addrs.push(local);
                        running
                            .tasks
                            .push(tokio::spawn(accept_loop(listener, local, ctx.clone())));
                    }
                    Err(e) => warn!("TCP listen on {} failed: {}", addr, e),
                }
            }

            if config.udp {
                match net::bind_udp_socket(addr) {
                    Ok(socket) => {
                        let local = socket.local_addr()?;
                        info!("Listening UDP on {}", local);
                        running.udp_addrs.push(local);
                        running.tasks.push(tokio::spawn(serve_udp(
                            Arc::new(socket),
                            config.udp_read_size,
                            config.udp_eviction,
                            self.aggregates.clone(),
                        )));
                    }
                    Err(e) => warn!("UDP listen on {} failed: {}", addr, e),
                }
            }
        }

        if running.tasks.is_empty() {
            anyhow::bail!("no listener could be started");
        }
        Ok(running)
    }

    /// Serve until every listener has failed.
    pub async fn run(&self) -> anyhow::Result<()> {
        let running = self.start().await?;
        running.wait().await;
        Ok(())
    }
}

/// Listener tasks of a started server; dropping it stops them.
#[derive(Default)]
pub struct RunningServer {
    tcp_addrs: Vec<SocketAddr>,
    udp_addrs: Vec<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    pub fn udp_addrs(&self) -> &[SocketAddr] {
        &self.udp_addrs
    }

    pub async fn wait(mut self) {
        let tasks = std::mem::take(&mut self.tasks);
        join_all(tasks).await;
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, local: SocketAddr, ctx: Arc<ConnectionContext>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let id = ctx.next_id.fetch_add(1, Ordering::Relaxed);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, id, &ctx).await {
                        warn!("Connection {} from {}: {:#}", id, peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Accept on {} failed, closing listener: {}", local, e);
                break;
            }
        }
    }
}

/// Decide between TLS and plaintext from the first byte the client sends.
async fn wants_tls(stream: &TcpStream, limit: Duration) -> anyhow::Result<Option<bool>> {
    let mut first = [0u8; 1];
    let n = tokio::time::timeout(limit, stream.peek(&mut first))
        .await
        .map_err(|_| anyhow::anyhow!("no data within {:?}", limit))??;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(first[0] == TLS_HANDSHAKE_RECORD))
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    ctx: &ConnectionContext,
) -> anyhow::Result<()> {
    let peer = net::normalize_addr(peer);

    let acceptor = match (&ctx.acceptor, ctx.plain) {
        (Some(acceptor), true) => match wants_tls(&stream, ctx.handshake_timeout).await? {
            Some(true) => Some(acceptor),
            Some(false) => None,
            None => {
                debug!("Connection {} from {} closed before sending data", id, peer);
                return Ok(());
            }
        },
        (Some(acceptor), false) => Some(acceptor),
        (None, _) => None,
    };

    let stream = match acceptor {
        Some(acceptor) => {
            tokio::time::timeout(ctx.handshake_timeout, tls::accept_tls(stream, acceptor))
                .await
                .map_err(|_| anyhow::anyhow!("TLS handshake timed out"))??
        }
        None => MaybeTlsStream::Plain(stream),
    };
    let is_tls = stream.is_tls();
    let label = stream.label();
    info!("Incoming {} {} from {}", label, id, peer);

    let (mut read_half, mut write_half) = tcp::split(stream);

    let options = match recv_options(&mut read_half, ctx.handshake_timeout).await {
        Ok(options) => options,
        Err(e) => {
            if is_tls {
                debug!("Options failure from {}: {:#}", peer, e);
            } else {
                debug!(
                    "Options failure from {} (client may be trying TLS first): {:#}",
                    peer, e
                );
            }
            return Ok(());
        }
    };
    info!(
        "{} {} options received, client version {}",
        label,
        id,
        options.client_version()
    );

    send_ack(&mut write_half, &Ack::new()).await?;
    debug!("{} {} ack sent", label, id);

    let conn = format!("{}/{}", id, peer);
    let reader = WorkerPlan {
        io: StreamReader::new(read_half),
        buf: vec![0u8; options.tcp_read_size],
        spec: WorkerSpec {
            conn: conn.clone(),
            name: "serverReader",
            role: Role::Reader,
            report_interval: options.report_interval,
            max_speed: 0.0,
            record_series: false,
            aggregate: ctx.aggregates.reader.clone(),
        },
    };
    let writer = (!options.passive_server).then(|| WorkerPlan {
        io: StreamWriter::new(write_half),
        buf: random_buffer(options.tcp_write_size),
        spec: WorkerSpec {
            conn: conn.clone(),
            name: "serverWriter",
            role: Role::Writer,
            report_interval: options.report_interval,
            max_speed: options.max_speed,
            record_series: false,
            aggregate: ctx.aggregates.writer.clone(),
        },
    });

    supervise(&conn, options.total_duration, reader, writer).await;
    info!("{} {} from {} closed", label, id, peer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Options, recv_ack, send_options};
    use tokio::io::AsyncWriteExt;

    fn plain_config() -> ServerConfig {
        ServerConfig {
            listeners: vec!["127.0.0.1:0".to_string()],
            udp: false,
            tls: TlsServerConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());
        let config = ServerConfig {
            tcp: false,
            udp: false,
            tls: TlsServerConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_start_fails_without_listeners() {
        let config = ServerConfig {
            listeners: vec!["no-such-host.invalid".to_string()],
            ..plain_config()
        };
        assert!(Server::new(config).start().await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_gets_no_ack() {
        let server = Server::new(plain_config());
        let running = server.start().await.unwrap();
        let addr = running.tcp_addrs()[0];

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"hello there\n").await.unwrap();

        // The server hangs up without answering; a reset is as good as EOF
        let mut buf = [0u8; 16];
        let result = tokio::time::timeout(Duration::from_secs(5), stream.peek(&mut buf))
            .await
            .unwrap();
        if let Ok(n) = result {
            assert_eq!(n, 0);
        }
    }

    #[tokio::test]
    async fn test_handshake_then_payload() {
        let server = Server::new(plain_config());
        let running = server.start().await.unwrap();
        let addr = running.tcp_addrs()[0];

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut read_half, mut write_half) = tcp::split(MaybeTlsStream::Plain(stream));
        let options = Options {
            total_duration: Duration::from_millis(300),
            report_interval: Duration::from_millis(100),
            passive_server: true,
            ..Default::default()
        };
        send_options(&mut write_half, &options).await.unwrap();
        let ack = recv_ack(&mut read_half, HANDSHAKE_TIMEOUT).await.unwrap();
        assert_eq!(ack.server_version(), crate::protocol::VERSION);

        write_half.write_all(&[0u8; 10_000]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let readers = server.aggregates().reader.snapshot();
        assert_eq!(readers.workers, 1);
        assert_eq!(readers.bytes, 10_000);
        assert_eq!(server.aggregates().writer.snapshot().workers, 0);
    }
}
