// clickwatch/src/engine/scheduler.rs
//
// Worker lifecycle:
//
//   Disconnected ──start──▶ Connecting ──connected──▶ Running
//                               │  ▲                    │
//                               └──┘ fixed delay,       └─ cycle, sleep, cycle, ...
//                                    retried forever
//
// There is no terminal state in normal operation. A failed pass stays in
// Running. The shutdown signal is the only way out: while connecting it
// aborts the retry loop, while running it lets the in-flight cycle finish and
// exits before the next sleep completes.

use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info};

use super::cycle::CycleRunner;
use super::retry::{retry, RetryPolicy};
use crate::config::WorkerConfig;
use crate::state::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Running,
}

pub struct Scheduler<C: Connector> {
    connector:      C,
    runner:         CycleRunner,
    pass_interval:  Duration,
    retry_interval: Duration,
    state:          RwLock<WorkerState>,
}

impl<C: Connector> Scheduler<C> {
    pub fn new(connector: C, runner: CycleRunner, config: &WorkerConfig) -> Self {
        Self {
            connector,
            runner,
            pass_interval:  config.pass_interval(),
            retry_interval: config.retry_interval(),
            state:          RwLock::new(WorkerState::Disconnected),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn runner(&self) -> &CycleRunner {
        &self.runner
    }

    /// Connect (retrying forever), then run cycles every `pass_interval` until
    /// `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let Some(store) = self.connect(&mut shutdown).await else {
            info!("Worker stopped before a store connection was made");
            return;
        };

        loop {
            self.runner.run_cycle(&store).await;

            info!(sleep_secs = self.pass_interval.as_secs(), "Worker sleeping");
            tokio::select! {
                _ = tokio::time::sleep(self.pass_interval) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
        info!("Shutdown requested; worker stopped after completing its last cycle");
    }

    async fn connect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<C::Store> {
        self.set_state(WorkerState::Connecting);
        let target  = self.connector.target();
        let metrics = self.runner.metrics();

        let attempts = retry(RetryPolicy::forever(self.retry_interval), |attempt| {
            metrics.record_connect_attempt();
            info!(attempt, %target, "Connecting to data store");
            self.connector.connect()
        });

        tokio::select! {
            result = attempts => match result {
                Ok(store) => {
                    info!(%target, "Data store connection successful");
                    self.set_state(WorkerState::Running);
                    Some(store)
                }
                Err(e) => {
                    error!(%target, error = %e, "Gave up connecting to data store");
                    self.set_state(WorkerState::Disconnected);
                    None
                }
            },
            _ = shutdown_requested(shutdown) => {
                self.set_state(WorkerState::Disconnected);
                None
            }
        }
    }

    fn set_state(&self, next: WorkerState) {
        let prev = std::mem::replace(&mut *self.state.write(), next);
        if prev != next {
            info!(from = ?prev, to = ?next, "Worker state changed");
        }
    }
}

/// Resolves once the watch value is `true`. A dropped sender never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() { return; }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use chrono::Utc;

    use crate::events::ClickEvent;
    use crate::metrics::WorkerMetrics;
    use crate::state::memory::MemoryStore;
    use crate::state::StoreError;

    struct FlakyConnector {
        store:        MemoryStore,
        failures_left: AtomicU32,
    }

    impl Connector for FlakyConnector {
        type Store = MemoryStore;

        async fn connect(&self) -> Result<MemoryStore, StoreError> {
            let refused = self.failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                Err(StoreError::Unavailable("connection refused".into()))
            } else {
                Ok(self.store.clone())
            }
        }

        fn target(&self) -> String {
            "memory://flaky".into()
        }
    }

    fn scheduler(store: MemoryStore, failures: u32) -> Arc<Scheduler<FlakyConnector>> {
        let config = WorkerConfig::default();
        let runner = CycleRunner::new(&config, WorkerMetrics::new()).unwrap();
        let connector = FlakyConnector { store, failures_left: AtomicU32::new(failures) };
        Arc::new(Scheduler::new(connector, runner, &config))
    }

    async fn wait_for_cycles(s: &Scheduler<FlakyConnector>, n: u64) {
        while s.runner().metrics().snapshot().cycles < n {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_connection_then_runs_cycles() {
        let recent = Utc::now() - chrono::Duration::seconds(60);
        let store = MemoryStore::with_clicks(
            (0..150).map(|i| ClickEvent::new("L1", format!("10.0.0.{}", i % 100), recent)),
        );
        let sched = scheduler(store.clone(), 2);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.run(rx).await }
        });

        wait_for_cycles(&sched, 2).await;
        assert_eq!(sched.state(), WorkerState::Running);
        tx.send(true).unwrap();
        handle.await.unwrap();

        let m = sched.runner().metrics().snapshot();
        assert_eq!(m.connect_attempts, 3);
        assert_eq!(m.failed_passes, 0);
        assert_eq!(store.spikes().len() as u64, m.cycles);
        assert!(store.spikes().iter().all(|s| s.link_id == "L1" && s.spike_count == 150));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_connecting_stops_retrying() {
        let sched = scheduler(MemoryStore::new(), u32::MAX);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.run(rx).await }
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(sched.state(), WorkerState::Connecting);
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(sched.state(), WorkerState::Disconnected);
        let m = sched.runner().metrics().snapshot();
        assert!(m.connect_attempts >= 3);
        assert_eq!(m.cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_passes_do_not_stop_the_loop() {
        let store = MemoryStore::new();
        store.fail_queries(true);
        let sched = scheduler(store, 0);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let sched = Arc::clone(&sched);
            async move { sched.run(rx).await }
        });

        wait_for_cycles(&sched, 3).await;
        assert_eq!(sched.state(), WorkerState::Running);
        tx.send(true).unwrap();
        handle.await.unwrap();

        let m = sched.runner().metrics().snapshot();
        assert_eq!(m.failed_passes, 2 * m.cycles);
        assert_eq!(m.connect_attempts, 1);
    }
}
