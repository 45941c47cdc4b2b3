//! Transfer workers
//!
//! A worker drives one direction of one session: it calls
//! [`Transfer::transfer`] in a loop, feeds an [`Account`], logs a report
//! every interval and, when the transport fails, adds its lifetime average
//! to the role's [`Aggregate`].
//!
//! Workers never look at a cancellation flag themselves. The session
//! supervisor closes a [`CloseHandle`], and every [`Closable`] transport
//! tied to it starts failing with `ConnectionAborted`.

use std::io;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tracing::info;

use crate::rate_limit::{SpeedLimit, THROTTLE_PAUSE};
use crate::stats::{Account, Aggregate, Rate, RateSeries};

/// One read or write call against a session transport.
#[async_trait]
pub trait Transfer: Send {
    /// Move up to `buf.len()` bytes. Writers send from `buf`, readers fill it.
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Reader,
    Writer,
}

impl Role {
    pub fn cps_label(&self) -> &'static str {
        match self {
            Role::Reader => "rcv/s",
            Role::Writer => "snd/s",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
        }
    }
}

/// Owner side of a session's close signal
#[derive(Debug)]
pub struct CloseHandle {
    tx: watch::Sender<bool>,
}

impl CloseHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Wrap a transport so it fails once this handle is closed.
    pub fn wrap<T: Transfer>(&self, inner: T) -> Closable<T> {
        Closable {
            inner,
            closed: self.tx.subscribe(),
        }
    }

    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// A transport whose pending and future calls fail after its session closes
pub struct Closable<T> {
    inner: T,
    closed: watch::Receiver<bool>,
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed")
}

#[async_trait]
impl<T: Transfer> Transfer for Closable<T> {
    async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.closed.borrow() {
            return Err(closed_error());
        }
        tokio::select! {
            biased;
            _ = self.closed.changed() => Err(closed_error()),
            result = self.inner.transfer(buf) => result,
        }
    }
}

/// A buffer of `size` bytes from the thread-local CSPRNG
pub fn random_buffer(size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    rand::rng().fill(&mut buf[..]);
    buf
}

/// Per-worker parameters
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Connection label shown in every report line
    pub conn: String,
    pub name: &'static str,
    pub role: Role,
    pub report_interval: Duration,
    /// Megabits per second, 0 for unlimited
    pub max_speed: f64,
    pub record_series: bool,
    pub aggregate: Aggregate,
}

impl WorkerSpec {
    fn log(&self, kind: &str, rate: &Rate) {
        log_rate(&self.conn, kind, self.name, rate, self.role.cps_label());
    }
}

/// Emit one report line in the fixed column layout.
pub fn log_rate(conn: &str, kind: &str, name: &str, rate: &Rate, cps_label: &str) {
    info!(
        "{} {:>7} {:>14} rate: {:.6} Mbps {:>6} {}",
        conn, kind, name, rate.mbps, rate.cps as i64, cps_label
    );
}

/// What a worker hands back to its supervisor
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub average: Rate,
    pub series: RateSeries,
}

/// Run one worker until its transport fails.
pub async fn work_loop<T: Transfer>(mut io: T, mut buf: Vec<u8>, spec: WorkerSpec) -> WorkerOutcome {
    let start = Instant::now();
    let limit = SpeedLimit::new(spec.max_speed);
    let mut account = Account::new(start);
    let mut series = RateSeries::default();

    loop {
        tokio::task::yield_now().await;

        if let Some(limit) = limit
            && limit.exceeded(&account, Instant::now())
        {
            tokio::time::sleep(THROTTLE_PAUSE).await;
            continue;
        }

        match io.transfer(&mut buf).await {
            Ok(n) => {
                account.record(n);
                if let Some(report) = account.tick(Instant::now(), spec.report_interval, false) {
                    spec.log("report", &report);
                    if spec.record_series {
                        series.push(Utc::now(), report.mbps);
                    }
                }
            }
            Err(e) => {
                info!("{} {}: {}", spec.conn, spec.name, e);
                if let Some(report) = account.tick(Instant::now(), spec.report_interval, true) {
                    spec.log("report", &report);
                    if spec.record_series {
                        series.push(Utc::now(), report.mbps);
                    }
                }
                break;
            }
        }
    }

    let average = account.average(start, Instant::now());
    spec.log("average", &average);
    spec.aggregate.add(&average);

    WorkerOutcome { average, series }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts `remaining` calls of `chunk` bytes, then fails.
    struct Scripted {
        remaining: usize,
        chunk: usize,
    }

    #[async_trait]
    impl Transfer for Scripted {
        async fn transfer(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "done"));
            }
            self.remaining -= 1;
            Ok(self.chunk)
        }
    }

    /// Never completes on its own.
    struct Stalled;

    #[async_trait]
    impl Transfer for Stalled {
        async fn transfer(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            std::future::pending().await
        }
    }

    fn spec(role: Role, aggregate: &Aggregate) -> WorkerSpec {
        WorkerSpec {
            conn: "1/1".to_string(),
            name: "testWorker",
            role,
            report_interval: Duration::from_millis(5),
            max_speed: 0.0,
            record_series: true,
            aggregate: aggregate.clone(),
        }
    }

    #[tokio::test]
    async fn test_worker_adds_to_aggregate_once() {
        let aggregate = Aggregate::new();
        let io = Scripted {
            remaining: 50,
            chunk: 1000,
        };

        let outcome = work_loop(io, vec![0u8; 1000], spec(Role::Writer, &aggregate)).await;

        assert_eq!(outcome.average.bytes, 50_000);
        assert_eq!(outcome.average.calls, 50);
        let totals = aggregate.snapshot();
        assert_eq!(totals.workers, 1);
        assert_eq!(totals.bytes, 50_000);
        // The forced final report always lands in the series
        assert!(!outcome.series.is_empty());
    }

    #[tokio::test]
    async fn test_close_aborts_pending_call() {
        let close = CloseHandle::new();
        let mut io = close.wrap(Stalled);

        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            io.transfer(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        close.close();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(close.is_closed());
    }

    #[tokio::test]
    async fn test_closed_transport_fails_immediately() {
        let close = CloseHandle::new();
        close.close();
        let mut io = close.wrap(Scripted {
            remaining: 10,
            chunk: 1,
        });
        let mut buf = [0u8; 1];
        assert!(io.transfer(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn test_speed_limit_holds_rate() {
        let aggregate = Aggregate::new();
        let close = CloseHandle::new();
        let io = close.wrap(Scripted {
            remaining: usize::MAX,
            chunk: 10_000,
        });
        let mut worker_spec = spec(Role::Writer, &aggregate);
        worker_spec.max_speed = 8.0;
        worker_spec.report_interval = Duration::from_millis(100);

        let worker = tokio::spawn(work_loop(io, vec![0u8; 10_000], worker_spec));
        tokio::time::sleep(Duration::from_millis(600)).await;
        close.close();
        let outcome = worker.await.unwrap();

        // 8 Mbps for 0.6 s is 600 KB; one chunk of overshoot per tick is allowed
        assert!(outcome.average.bytes <= 700_000, "{}", outcome.average.bytes);
        assert!(outcome.average.mbps <= 8.0 * 1.25, "{}", outcome.average.mbps);
    }

    #[tokio::test]
    async fn test_speed_limit_holds_every_interval() {
        let aggregate = Aggregate::new();
        let close = CloseHandle::new();
        let io = close.wrap(Scripted {
            remaining: usize::MAX,
            chunk: 1_000,
        });
        let mut worker_spec = spec(Role::Writer, &aggregate);
        worker_spec.max_speed = 8.0;
        worker_spec.report_interval = Duration::from_millis(50);

        let worker = tokio::spawn(work_loop(io, vec![0u8; 1_000], worker_spec));
        tokio::time::sleep(Duration::from_millis(600)).await;
        close.close();
        let outcome = worker.await.unwrap();

        let samples = outcome.series.samples();
        assert!(samples.len() >= 4, "only {} samples", samples.len());

        // The last sample is the partial period forced on close
        let full = &samples[1..samples.len() - 1];
        for sample in full {
            assert!(
                sample.mbps <= 8.0 * 1.1,
                "interval ran at {:.2} Mbps: {:?}",
                sample.mbps,
                samples.iter().map(|s| s.mbps).collect::<Vec<_>>()
            );
        }
        assert!(full.iter().any(|s| s.mbps > 4.0));
    }

    #[test]
    fn test_random_buffer() {
        let buf = random_buffer(4096);
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
