//! Supervision of long-running units.
//!
//! Each unit (the adapter, every change worker, the dispatcher) is a future
//! built by a factory. The [`Supervisor`] runs every unit in its own restart
//! loop:
//!
//! - `Ok(())`: the unit is done and is not restarted.
//! - a recoverable error or a panic: the unit is rebuilt and restarted,
//!   unless that would exceed the [`RestartPolicy`].
//! - a fatal error, or an exhausted restart policy: the error is sent on
//!   the fatal channel and the unit stays down.
//!
//! Cancelling the supervisor's token stops every unit. Units run inline in
//! their restart loop's task, so aborting that task drops the unit too.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hark_core::RestartConfig;

use crate::error::ListenError;

/// How long [`Supervisor::shutdown`] waits for a unit before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Sliding-window restart bound.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    max_restarts: u32,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RestartPolicy {
    /// Creates a policy from configuration.
    #[must_use]
    pub fn new(config: RestartConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.window(),
            history: VecDeque::new(),
        }
    }

    /// Records a restart at `now`. Returns `false` if the restart would
    /// exceed the bound.
    pub fn admit(&mut self, now: Instant) -> bool {
        while self
            .history
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) > self.window)
        {
            self.history.pop_front();
        }

        if self.history.len() >= self.max_restarts as usize {
            return false;
        }
        self.history.push_back(now);
        true
    }
}

/// Runs units and restarts them when they fault.
#[derive(Debug)]
pub struct Supervisor {
    cancel: CancellationToken,
    restart: RestartConfig,
    fatal_tx: mpsc::UnboundedSender<ListenError>,
    units: Vec<(String, JoinHandle<()>)>,
}

impl Supervisor {
    /// Creates a supervisor whose units stop when `cancel` is cancelled.
    ///
    /// Returns the supervisor and the receiving end of its fatal channel.
    #[must_use]
    pub fn new(
        cancel: CancellationToken,
        restart: RestartConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ListenError>) {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        (
            Self {
                cancel,
                restart,
                fatal_tx,
                units: Vec::new(),
            },
            fatal_rx,
        )
    }

    /// Starts a supervised unit.
    ///
    /// `factory` is called once per run with the supervisor's token.
    pub fn add<F, Fut>(&mut self, name: impl Into<String>, mut factory: F)
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), ListenError>> + Send + 'static,
    {
        let name = name.into();
        let unit = name.clone();
        let cancel = self.cancel.clone();
        let fatal = self.fatal_tx.clone();
        let mut policy = RestartPolicy::new(self.restart);

        let handle = tokio::spawn(async move {
            loop {
                let run = AssertUnwindSafe(factory(cancel.clone())).catch_unwind();
                let fault = match run.await {
                    Ok(Ok(())) => {
                        tracing::trace!(unit = %unit, "Unit finished");
                        return;
                    }
                    Ok(Err(err)) if err.is_fatal() => {
                        tracing::error!(unit = %unit, error = %err, "Unit failed");
                        let _ = fatal.send(err);
                        return;
                    }
                    Ok(Err(err)) => err,
                    Err(_) => ListenError::worker_fault(&unit, "panicked"),
                };

                if cancel.is_cancelled() {
                    tracing::debug!(unit = %unit, error = %fault, "Unit faulted during shutdown");
                    return;
                }
                if !policy.admit(Instant::now()) {
                    tracing::error!(unit = %unit, error = %fault, "Restart limit reached");
                    let _ = fatal.send(ListenError::RestartLimit {
                        unit: unit.clone(),
                        source: Box::new(fault),
                    });
                    return;
                }
                tracing::warn!(unit = %unit, error = %fault, "Unit faulted, restarting");
            }
        });

        self.units.push((name, handle));
    }

    /// Starts `size` units named `{name}-{index}`.
    pub fn pool<F, Fut>(&mut self, name: &str, size: usize, factory: F)
    where
        F: Fn(usize, CancellationToken) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), ListenError>> + Send + 'static,
    {
        for index in 0..size {
            let factory = factory.clone();
            self.add(format!("{name}-{index}"), move |token| factory(index, token));
        }
    }

    /// Returns the names of the supervised units.
    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|(name, _)| name.as_str())
    }

    /// Cancels every unit and waits for them to stop.
    ///
    /// Units are joined concurrently. A unit that does not stop within a
    /// grace period is aborted.
    pub async fn shutdown(self) {
        self.cancel.cancel();

        let joins = self.units.into_iter().map(|(name, handle)| async move {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(unit = %name, error = %err, "Unit supervisor ended abnormally");
                }
                Err(_) => {
                    tracing::warn!(unit = %name, "Unit did not stop in time, aborting");
                    abort.abort();
                }
            }
        });
        join_all(joins).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn always_panics(counter: Arc<AtomicUsize>) -> Result<(), ListenError> {
        counter.fetch_add(1, Ordering::SeqCst);
        panic!("unit always panics");
    }

    fn fast_restarts() -> RestartConfig {
        RestartConfig {
            max_restarts: 3,
            within_ms: 60_000,
        }
    }

    #[test]
    fn test_policy_sliding_window() {
        let mut policy = RestartPolicy::new(RestartConfig {
            max_restarts: 2,
            within_ms: 1000,
        });
        let start = Instant::now();

        assert!(policy.admit(start));
        assert!(policy.admit(start + Duration::from_millis(100)));
        assert!(!policy.admit(start + Duration::from_millis(200)));
        // The first restart has left the window.
        assert!(policy.admit(start + Duration::from_millis(1050)));
    }

    #[test]
    fn test_policy_zero_restarts() {
        let mut policy = RestartPolicy::new(RestartConfig {
            max_restarts: 0,
            within_ms: 1000,
        });
        assert!(!policy.admit(Instant::now()));
    }

    #[tokio::test]
    async fn test_unit_that_finishes_is_not_restarted() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (mut supervisor, mut fatal_rx) =
            Supervisor::new(CancellationToken::new(), fast_restarts());

        let counter = Arc::clone(&runs);
        supervisor.add("once", move |_token| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), ListenError>(())
            }
        });
        supervisor.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_recoverable_fault_restarts() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (mut supervisor, mut fatal_rx) =
            Supervisor::new(CancellationToken::new(), fast_restarts());

        let counter = Arc::clone(&runs);
        supervisor.add("flaky", move |_token| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ListenError::worker_fault("flaky", "first run fails"))
                } else {
                    Ok(())
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.shutdown().await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(fatal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panics_exhaust_restart_limit() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (mut supervisor, mut fatal_rx) =
            Supervisor::new(CancellationToken::new(), fast_restarts());

        let counter = Arc::clone(&runs);
        supervisor.add("doomed", move |_token| always_panics(Arc::clone(&counter)));

        let err = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, ListenError::RestartLimit { .. }));
        assert_eq!(err.unit(), Some("doomed"));
        // One initial run plus three restarts.
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_fatal_error_is_forwarded_without_restart() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (mut supervisor, mut fatal_rx) =
            Supervisor::new(CancellationToken::new(), fast_restarts());

        let counter = Arc::clone(&runs);
        supervisor.add("dispatcher", move |_token| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), ListenError>(ListenError::Callback("boom".into()))
            }
        });

        let err = tokio::time::timeout(Duration::from_secs(5), fatal_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, ListenError::Callback(_)));
        supervisor.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_units() {
        let cancel = CancellationToken::new();
        let (mut supervisor, _fatal_rx) = Supervisor::new(cancel.clone(), fast_restarts());

        supervisor.pool("idle", 3, |_index, token: CancellationToken| async move {
            token.cancelled().await;
            Ok::<(), ListenError>(())
        });
        assert_eq!(
            supervisor.unit_names().collect::<Vec<_>>(),
            vec!["idle-0", "idle-1", "idle-2"]
        );

        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_unit_ignoring_cancellation() {
        let (mut supervisor, _fatal_rx) =
            Supervisor::new(CancellationToken::new(), fast_restarts());
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        supervisor.add("stubborn", move |_token: CancellationToken| {
            let counter = Arc::clone(&counter);
            async move {
                while counter.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok::<(), ListenError>(())
            }
        });

        supervisor.shutdown().await;
        tokio::task::yield_now().await;
        let after_shutdown = ticks.load(Ordering::SeqCst);
        assert!(after_shutdown > 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_shutdown);
    }
}
