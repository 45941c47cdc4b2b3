//! UDP transports and the server's per-peer session table
//!
//! UDP has no connection state, so the server keeps one table entry per
//! peer address. The first datagram from an unseen peer carries its
//! [`Options`]; every later datagram is payload counted by length. A single
//! dispatcher task owns the table.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::net::normalize_addr;
use crate::protocol::{Options, decode_datagram};
use crate::stats::{Account, Aggregates, Rate};
use crate::worker::{Role, Transfer, WorkerSpec, log_rate, random_buffer, work_loop};

/// How often silent peers are checked for expiry
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How long a peer that never sent valid options, or whose session
/// ended, keeps its table entry when eviction is on
pub const PEER_LINGER: Duration = Duration::from_secs(10);

const READER_NAME: &str = "udpReader";

/// Reader transport over a connected socket
pub struct DatagramReader {
    socket: Arc<UdpSocket>,
}

impl DatagramReader {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transfer for DatagramReader {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf).await
    }
}

/// Writer transport over a connected socket
pub struct DatagramWriter {
    socket: Arc<UdpSocket>,
}

impl DatagramWriter {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl Transfer for DatagramWriter {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.send(buf).await
    }
}

/// Server writer to one peer of a shared socket.
///
/// Fails once the session's total duration has elapsed.
pub struct DatagramWriterTo {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    start: Instant,
    total: Duration,
}

impl DatagramWriterTo {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, start: Instant, total: Duration) -> Self {
        Self {
            socket,
            peer,
            start,
            total,
        }
    }
}

#[async_trait]
impl Transfer for DatagramWriterTo {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.start.elapsed() > self.total {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("total duration {:?} elapsed", self.total),
            ));
        }
        self.socket.send_to(buf, self.peer).await
    }
}

#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub id: u64,
    pub options: Options,
    pub account: Account,
    pub start: Instant,
}

impl ActiveSession {
    fn label(&self) -> String {
        format!("{}/0", self.id)
    }

    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.start) > self.options.total_duration
    }
}

#[derive(Debug, Clone)]
pub enum UdpSession {
    AwaitingOptions { since: Instant },
    Active(ActiveSession),
    Finished { at: Instant },
}

/// What the dispatcher must do with one datagram
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// A new peer's options were accepted
    Opened { id: u64, options: Options },
    /// Payload was counted; carries a report when an interval closed
    Payload(Option<Rate>),
    /// The peer's session ran past its duration and was closed
    Expired { id: u64, average: Rate },
    /// The peer's session already finished
    Ignored,
    /// The datagram was not valid options
    Rejected,
}

/// Per-peer UDP sessions, keyed by peer address
#[derive(Debug)]
pub struct UdpSessionTable {
    sessions: HashMap<SocketAddr, UdpSession>,
    next_id: u64,
    eviction: bool,
}

impl UdpSessionTable {
    /// With `eviction` off, expired peers stay behind as `Finished` for
    /// good; with it on, they are dropped after [`PEER_LINGER`].
    pub fn new(eviction: bool) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 0,
            eviction,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, peer: &SocketAddr) -> Option<&UdpSession> {
        self.sessions.get(peer)
    }

    pub fn dispatch(&mut self, peer: SocketAddr, datagram: &[u8], now: Instant) -> Dispatch {
        let (session, first) = match self.sessions.entry(peer) {
            Entry::Vacant(vacant) => {
                info!("UDP incoming: {}", peer);
                (vacant.insert(UdpSession::AwaitingOptions { since: now }), true)
            }
            Entry::Occupied(occupied) => (occupied.into_mut(), false),
        };

        match session {
            UdpSession::AwaitingOptions { .. } => match decode_datagram(datagram) {
                Ok(options) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    *session = UdpSession::Active(ActiveSession {
                        id,
                        options: options.clone(),
                        account: Account::new(now),
                        start: now,
                    });
                    Dispatch::Opened { id, options }
                }
                Err(e) => {
                    if first {
                        warn!("UDP options failure from {}: {:#}", peer, e);
                    } else {
                        debug!("UDP options failure from {}: {:#}", peer, e);
                    }
                    Dispatch::Rejected
                }
            },
            UdpSession::Active(active) => {
                if active.expired(now) {
                    let id = active.id;
                    let average = active.account.average(active.start, now);
                    self.finish(peer, now);
                    return Dispatch::Expired { id, average };
                }
                let interval = active.options.report_interval;
                Dispatch::Payload(active.account.update(datagram.len(), now, interval))
            }
            UdpSession::Finished { .. } => Dispatch::Ignored,
        }
    }

    /// Close every active session whose duration has elapsed and drop
    /// entries that have lingered past [`PEER_LINGER`].
    pub fn sweep(&mut self, now: Instant) -> Vec<(SocketAddr, u64, Rate)> {
        let expired: Vec<(SocketAddr, u64, Rate)> = self
            .sessions
            .iter()
            .filter_map(|(peer, session)| match session {
                UdpSession::Active(active) if active.expired(now) => Some((
                    *peer,
                    active.id,
                    active.account.average(active.start, now),
                )),
                _ => None,
            })
            .collect();

        let eviction = self.eviction;
        self.sessions.retain(|peer, session| match session {
            UdpSession::AwaitingOptions { since } => {
                let stale = now.saturating_duration_since(*since) > PEER_LINGER;
                if stale {
                    debug!("UDP peer {} never sent options, dropping", peer);
                }
                !stale
            }
            UdpSession::Finished { at } => {
                !eviction || now.saturating_duration_since(*at) <= PEER_LINGER
            }
            UdpSession::Active(_) => true,
        });

        for (peer, _, _) in &expired {
            self.finish(*peer, now);
        }
        expired
    }

    fn finish(&mut self, peer: SocketAddr, now: Instant) {
        self.sessions.insert(peer, UdpSession::Finished { at: now });
    }
}

/// Serve every UDP peer of `socket` until the task is dropped.
pub async fn serve_udp(
    socket: Arc<UdpSocket>,
    read_size: usize,
    eviction: bool,
    aggregates: Aggregates,
) {
    let mut table = UdpSessionTable::new(eviction);
    let mut buf = vec![0u8; read_size];
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (n, peer) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        debug!("UDP read error: {}", e);
                        continue;
                    }
                };
                let peer = normalize_addr(peer);

                match table.dispatch(peer, &buf[..n], Instant::now()) {
                    Dispatch::Opened { id, options } => {
                        info!(
                            "UDP session {} from {} (client version {}): {:?}",
                            id,
                            peer,
                            options.client_version(),
                            options
                        );
                        if !options.passive_server {
                            spawn_writer_to(&socket, peer, id, options, &aggregates);
                        }
                    }
                    Dispatch::Payload(Some(report)) => {
                        if let Some(UdpSession::Active(active)) = table.get(&peer) {
                            log_rate(&active.label(), "report", READER_NAME, &report, Role::Reader.cps_label());
                        }
                    }
                    Dispatch::Expired { id, average } => {
                        finish_reader(peer, id, &average, &aggregates);
                    }
                    Dispatch::Payload(None) | Dispatch::Ignored | Dispatch::Rejected => {}
                }
            }
            _ = sweep.tick() => {
                for (peer, id, average) in table.sweep(Instant::now()) {
                    finish_reader(peer, id, &average, &aggregates);
                }
            }
        }
    }
}

fn finish_reader(peer: SocketAddr, id: u64, average: &Rate, aggregates: &Aggregates) {
    info!("UDP session {} from {} reached its total duration", id, peer);
    log_rate(
        &format!("{}/0", id),
        "average",
        READER_NAME,
        average,
        Role::Reader.cps_label(),
    );
    aggregates.reader.add(average);
}

fn spawn_writer_to(
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    id: u64,
    options: Options,
    aggregates: &Aggregates,
) {
    let io = DatagramWriterTo::new(
        socket.clone(),
        peer,
        Instant::now(),
        options.total_duration,
    );
    let spec = WorkerSpec {
        conn: format!("{}/0", id),
        name: "serverWriterTo",
        role: Role::Writer,
        report_interval: options.report_interval,
        max_speed: options.max_speed,
        record_series: false,
        aggregate: aggregates.writer.clone(),
    };
    let buf = random_buffer(options.udp_write_size);

    tokio::spawn(async move {
        info!("UDP writer starting: {}", peer);
        work_loop(io, buf, spec).await;
        info!("UDP writer exiting: {}", peer);
    });
}
