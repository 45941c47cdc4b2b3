//! Session supervision
//!
//! Both sides run a session the same way: spawn the reader and (unless
//! passive) the writer, let the countdown run for the total duration, close
//! the session and wait for both workers before reporting.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::worker::{CloseHandle, Transfer, WorkerOutcome, WorkerSpec, work_loop};

/// A transport with the buffer and parameters its worker will use
pub struct WorkerPlan<T> {
    pub io: T,
    pub buf: Vec<u8>,
    pub spec: WorkerSpec,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub reader: Option<WorkerOutcome>,
    pub writer: Option<WorkerOutcome>,
}

/// Run a session to completion.
pub async fn supervise<R, W>(
    conn: &str,
    total: Duration,
    reader: WorkerPlan<R>,
    writer: Option<WorkerPlan<W>>,
) -> SessionOutcome
where
    R: Transfer + 'static,
    W: Transfer + 'static,
{
    let close = CloseHandle::new();

    let reader_task = spawn_worker(&close, reader);
    let writer_task = writer.map(|plan| spawn_worker(&close, plan));

    tokio::time::sleep(total).await;
    debug!("{} {:?} timer fired, closing", conn, total);
    close.close();

    let reader = join_worker(conn, reader_task).await;
    let writer = match writer_task {
        Some(task) => join_worker(conn, task).await,
        None => None,
    };

    SessionOutcome { reader, writer }
}

fn spawn_worker<T: Transfer + 'static>(
    close: &CloseHandle,
    plan: WorkerPlan<T>,
) -> JoinHandle<WorkerOutcome> {
    tokio::spawn(work_loop(close.wrap(plan.io), plan.buf, plan.spec))
}

async fn join_worker(conn: &str, task: JoinHandle<WorkerOutcome>) -> Option<WorkerOutcome> {
    match task.await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!("{} worker task failed: {}", conn, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Aggregate;
    use crate::worker::Role;
    use async_trait::async_trait;
    use std::io;

    /// Completes every call after a short delay.
    struct Ticking;

    #[async_trait]
    impl Transfer for Ticking {
        async fn transfer(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            tokio::time::sleep(Duration::from_millis(1)).await;
            Ok(buf.len())
        }
    }

    fn plan(role: Role, aggregate: &Aggregate) -> WorkerPlan<Ticking> {
        WorkerPlan {
            io: Ticking,
            buf: vec![0u8; 100],
            spec: WorkerSpec {
                conn: "0/1".to_string(),
                name: "testWorker",
                role,
                report_interval: Duration::from_millis(20),
                max_speed: 0.0,
                record_series: true,
                aggregate: aggregate.clone(),
            },
        }
    }

    #[tokio::test]
    async fn test_supervise_stops_both_workers() {
        let readers = Aggregate::new();
        let writers = Aggregate::new();

        let outcome = supervise(
            "0/1",
            Duration::from_millis(100),
            plan(Role::Reader, &readers),
            Some(plan(Role::Writer, &writers)),
        )
        .await;

        let reader = outcome.reader.unwrap();
        let writer = outcome.writer.unwrap();
        assert!(reader.average.bytes > 0);
        assert!(writer.average.bytes > 0);
        assert!(!reader.series.is_empty());
        assert_eq!(readers.snapshot().workers, 1);
        assert_eq!(writers.snapshot().workers, 1);
    }

    #[tokio::test]
    async fn test_passive_side_has_no_writer() {
        let readers = Aggregate::new();
        let writers = Aggregate::new();

        let outcome = supervise(
            "0/1",
            Duration::from_millis(50),
            plan(Role::Reader, &readers),
            None::<WorkerPlan<Ticking>>,
        )
        .await;

        assert!(outcome.reader.is_some());
        assert!(outcome.writer.is_none());
        assert_eq!(writers.snapshot().workers, 0);
        assert_eq!(writers.snapshot().bytes, 0);
    }
}
