//! A drainable lifecycle state machine for a single lazily-started child
//! process.
//!
//! A [`Drainable`] tracks one of seven states (see [`Status`]) and arbitrates
//! concurrent [`Drainable::exec`] callers against a single boot/shutdown
//! pair so that at most one `start` and one `stop` run at a time, callers
//! arriving while a start is in flight are parked until it resolves, and a
//! caller that arrives while the process is shutting down flips the
//! in-flight shutdown into a restart instead of racing it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, trace};

/// A boxed, owned future, used for the `start`/`stop` callback shape.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The closed set of states a [`Drainable`] can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No process running, nothing scheduled.
    Drained,
    /// `start` is in flight; callers other than the one running it park.
    Waking,
    /// Process is up and serving.
    Waked,
    /// Idle timeout fired, `stop` is in flight with no arrivals since.
    Draining,
    /// An arrival during `Draining` asked for the process back; `stop` is
    /// still running but will be followed by a `start` once it finishes.
    Rebooting,
    /// The last `start` or `stop` returned an error; terminal until a fresh
    /// external action (there is none in this crate) resets it.
    Failed,
    /// [`Drainable::terminate`] was called; no further transitions happen.
    Terminated,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Drained => "drained",
            Status::Waking => "waking",
            Status::Waked => "waked",
            Status::Draining => "draining",
            Status::Rebooting => "rebooting",
            Status::Failed => "failed",
            Status::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

struct Inner<E> {
    status: Status,
    /// Number of `exec` calls that have run their job and are waiting on
    /// their own idle timer; the process stays up as long as this is > 0.
    active: u64,
    last_error: Option<E>,
}

/// Coordinates lazy start, shared use, and idle shutdown of a single child
/// process.
///
/// `E` is the error type returned by the boot and shutdown callbacks; it
/// must be `Clone` because a single failure is handed back to every caller
/// that was waiting on it, not just the one that triggered it.
pub struct Drainable<E> {
    inner: Arc<Mutex<Inner<E>>>,
    notify: Arc<Notify>,
    start: Arc<dyn Fn() -> BoxFuture<Result<(), E>> + Send + Sync>,
    stop: Arc<dyn Fn() -> BoxFuture<Result<(), E>> + Send + Sync>,
    on_transition: Arc<dyn Fn(Status) + Send + Sync>,
    drain_timeout: Duration,
}

impl<E> Clone for Drainable<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
            start: self.start.clone(),
            stop: self.stop.clone(),
            on_transition: self.on_transition.clone(),
            drain_timeout: self.drain_timeout,
        }
    }
}

impl<E> Drainable<E>
where
    E: Clone + Send + Sync + 'static,
{
    pub fn new<Start, Stop, OnTransition>(
        start: Start,
        stop: Stop,
        drain_timeout: Duration,
        on_transition: OnTransition,
    ) -> Self
    where
        Start: Fn() -> BoxFuture<Result<(), E>> + Send + Sync + 'static,
        Stop: Fn() -> BoxFuture<Result<(), E>> + Send + Sync + 'static,
        OnTransition: Fn(Status) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: Status::Drained,
                active: 0,
                last_error: None,
            })),
            notify: Arc::new(Notify::new()),
            start: Arc::new(start),
            stop: Arc::new(stop),
            on_transition: Arc::new(on_transition),
            drain_timeout,
        }
    }

    pub async fn status(&self) -> Status {
        self.inner.lock().await.status
    }

    /// True once the process has finished booting and is ready to serve.
    pub async fn is_waked(&self) -> bool {
        self.inner.lock().await.status == Status::Waked
    }

    pub async fn last_error(&self) -> Option<E> {
        self.inner.lock().await.last_error.clone()
    }

    /// Runs `job` against the backend, starting it first if necessary.
    ///
    /// Returns the error from a failed `start`/`stop` to every caller that
    /// was waiting on it, whether or not that caller's own `job` ran.
    pub async fn exec<Fut>(&self, job: Fut) -> Result<(), E>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut guard = self.inner.lock().await;
        match guard.status {
            Status::Drained => {
                guard.status = Status::Waking;
                drop(guard);
                (self.on_transition)(Status::Waking);
                trace!("booting backend");
                let result = (self.start)().await;
                let mut guard = self.inner.lock().await;
                match result {
                    Ok(()) => {
                        guard.status = Status::Waked;
                        guard.last_error = None;
                        drop(guard);
                        self.notify.notify_waiters();
                        (self.on_transition)(Status::Waked);
                        job.await;
                        self.arm_timer().await;
                        Ok(())
                    }
                    Err(err) => {
                        guard.status = Status::Failed;
                        guard.last_error = Some(err.clone());
                        drop(guard);
                        self.notify.notify_waiters();
                        error!("backend failed to start");
                        (self.on_transition)(Status::Failed);
                        Err(err)
                    }
                }
            }
            Status::Waked => {
                drop(guard);
                job.await;
                self.arm_timer().await;
                Ok(())
            }
            Status::Failed => {
                let err = guard
                    .last_error
                    .clone()
                    .expect("Failed status always carries a stored error");
                Err(err)
            }
            Status::Terminated => Ok(()),
            Status::Waking | Status::Draining | Status::Rebooting => {
                // Every arrival here parks on the same barrier, including
                // the first caller to observe `Draining` (it bumps status
                // to `Rebooting` so the in-flight stop knows to restart
                // instead of settling) and every caller after it. This
                // differs from the original implementation, which only ran
                // the job for the very first `Draining` arrival and left
                // later `Rebooting` arrivals unserved; parking them all on
                // the barrier means every request gets served once the
                // restart completes.
                let was_draining = guard.status == Status::Draining;
                if was_draining {
                    guard.status = Status::Rebooting;
                }
                // Register as a waiter while still holding the lock, so a
                // concurrent transition can't call `notify_waiters()`
                // between our status read and our registration.
                let notified = self.notify.notified();
                drop(guard);
                if was_draining {
                    (self.on_transition)(Status::Rebooting);
                }
                notified.await;
                let guard = self.inner.lock().await;
                match guard.status {
                    Status::Waked => {
                        drop(guard);
                        job.await;
                        self.arm_timer().await;
                        Ok(())
                    }
                    Status::Failed => {
                        let err = guard
                            .last_error
                            .clone()
                            .expect("Failed status always carries a stored error");
                        Err(err)
                    }
                    _ => Ok(()),
                }
            }
        }
    }

    /// Stops scheduling further transitions; any already-running `start`
    /// or `stop` still completes, but will no longer move the state past
    /// `Terminated`. Intended for process shutdown, not normal draining.
    pub async fn terminate(&self) {
        let mut guard = self.inner.lock().await;
        guard.status = Status::Terminated;
        drop(guard);
        self.notify.notify_waiters();
        (self.on_transition)(Status::Terminated);
    }

    /// Bumps the in-flight counter and schedules this call's own idle
    /// timer. Each successful `exec` gets its own timer; the backend stays
    /// up as long as at least one of them hasn't fired yet, which gives a
    /// sliding idle window rather than a fixed one scheduled at boot.
    async fn arm_timer(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.active += 1;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.drain_timeout).await;
            this.fire_timer().await;
        });
    }

    async fn fire_timer(&self) {
        let mut guard = self.inner.lock().await;
        guard.active = guard.active.saturating_sub(1);
        if guard.active > 0 {
            return;
        }
        match guard.status {
            Status::Waked => {
                guard.status = Status::Draining;
                drop(guard);
                (self.on_transition)(Status::Draining);
                debug!("idle timeout reached, stopping backend");
                let result = (self.stop)().await;
                self.finish_drain(result).await;
            }
            Status::Terminated => {}
            other => {
                error!(status = %other, "idle timer fired in an unexpected state");
            }
        }
    }

    async fn finish_drain(&self, result: Result<(), E>) {
        let mut guard = self.inner.lock().await;
        match guard.status {
            Status::Draining => match result {
                Ok(()) => {
                    guard.status = Status::Drained;
                    guard.last_error = None;
                    drop(guard);
                    (self.on_transition)(Status::Drained);
                }
                Err(err) => {
                    guard.status = Status::Failed;
                    guard.last_error = Some(err);
                    drop(guard);
                    self.notify.notify_waiters();
                    error!("backend failed to stop");
                    (self.on_transition)(Status::Failed);
                }
            },
            Status::Rebooting => {
                drop(guard);
                match result {
                    Ok(()) => {
                        debug!("restarting backend after drain-time arrival");
                        let start_result = (self.start)().await;
                        let mut guard = self.inner.lock().await;
                        match start_result {
                            Ok(()) => {
                                guard.status = Status::Waked;
                                guard.last_error = None;
                                drop(guard);
                                self.notify.notify_waiters();
                                (self.on_transition)(Status::Waked);
                            }
                            Err(err) => {
                                guard.status = Status::Failed;
                                guard.last_error = Some(err);
                                drop(guard);
                                self.notify.notify_waiters();
                                error!("backend failed to restart");
                                (self.on_transition)(Status::Failed);
                            }
                        }
                    }
                    Err(err) => {
                        let mut guard = self.inner.lock().await;
                        guard.status = Status::Failed;
                        guard.last_error = Some(err);
                        drop(guard);
                        self.notify.notify_waiters();
                        error!("backend failed to stop before restart");
                        (self.on_transition)(Status::Failed);
                    }
                }
            }
            // Terminated raced in after `stop` was already running; nothing
            // left to do.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::Duration as TokioDuration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct BootError(&'static str);

    fn boxed_ok() -> BoxFuture<Result<(), BootError>> {
        Box::pin(async { Ok(()) })
    }

    fn recorder() -> (Arc<StdMutex<Vec<Status>>>, impl Fn(Status) + Send + Sync + 'static) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let inner = log.clone();
        (log, move |s: Status| inner.lock().unwrap().push(s))
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_concurrency_runs_start_once() {
        let start_calls = Arc::new(AtomicU64::new(0));
        let calls = start_calls.clone();
        let (_log, on_transition) = recorder();

        let drainable: Drainable<BootError> = Drainable::new(
            move || {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(TokioDuration::from_millis(50)).await;
                    Ok(())
                })
            },
            || boxed_ok(),
            TokioDuration::from_secs(60),
            on_transition,
        );

        let job_runs = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let d = drainable.clone();
            let job_runs = job_runs.clone();
            handles.push(tokio::spawn(async move {
                d.exec(async move {
                    job_runs.fetch_add(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        tokio::time::advance(TokioDuration::from_millis(60)).await;
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(job_runs.load(Ordering::SeqCst), 5);
        assert!(drainable.is_waked().await);
    }

    #[tokio::test(start_paused = true)]
    async fn drains_after_idle_window() {
        let stop_calls = Arc::new(AtomicU64::new(0));
        let calls = stop_calls.clone();
        let (log, on_transition) = recorder();

        let drainable: Drainable<BootError> = Drainable::new(
            || boxed_ok(),
            move || {
                let calls = calls.clone();
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
            TokioDuration::from_millis(100),
            on_transition,
        );

        drainable.exec(async {}).await.unwrap();
        assert_eq!(drainable.status().await, Status::Waked);

        tokio::time::advance(TokioDuration::from_millis(150)).await;
        tokio::task::yield_now().await;

        assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(drainable.status().await, Status::Drained);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Status::Waking, Status::Waked, Status::Draining, Status::Drained]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_during_drain_forces_restart_and_is_served() {
        let start_calls = Arc::new(AtomicU64::new(0));
        let starts = start_calls.clone();
        let (_log, on_transition) = recorder();

        let drainable: Drainable<BootError> = Drainable::new(
            move || {
                let starts = starts.clone();
                Box::pin(async move {
                    starts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            },
            || {
                Box::pin(async {
                    tokio::time::sleep(TokioDuration::from_millis(80)).await;
                    Ok(())
                })
            },
            TokioDuration::from_millis(50),
            on_transition,
        );

        drainable.exec(async {}).await.unwrap();
        tokio::time::advance(TokioDuration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(drainable.status().await, Status::Draining);

        let job_ran = Arc::new(AtomicU64::new(0));
        let runs = job_ran.clone();
        let d = drainable.clone();
        let arrival = tokio::spawn(async move {
            d.exec(async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .await
        });

        tokio::time::advance(TokioDuration::from_millis(100)).await;
        arrival.await.unwrap().unwrap();

        assert_eq!(job_ran.load(Ordering::SeqCst), 1);
        assert_eq!(start_calls.load(Ordering::SeqCst), 2);
        assert_eq!(drainable.status().await, Status::Waked);
    }

    #[tokio::test]
    async fn start_failure_surfaces_to_every_waiter() {
        let (_log, on_transition) = recorder();
        let drainable: Drainable<BootError> = Drainable::new(
            || Box::pin(async { Err(BootError("boom")) }),
            || boxed_ok(),
            TokioDuration::from_secs(60),
            on_transition,
        );

        let mut handles = Vec::new();
        for _ in 0..3 {
            let d = drainable.clone();
            handles.push(tokio::spawn(async move { d.exec(async {}).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), Err(BootError("boom")));
        }
        assert_eq!(drainable.status().await, Status::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_failure_is_retriable_on_next_exec() {
        let (_log, on_transition) = recorder();
        let drainable: Drainable<BootError> = Drainable::new(
            || boxed_ok(),
            || Box::pin(async { Err(BootError("stop failed")) }),
            TokioDuration::from_millis(30),
            on_transition,
        );

        drainable.exec(async {}).await.unwrap();
        tokio::time::advance(TokioDuration::from_millis(40)).await;
        tokio::task::yield_now().await;
        assert_eq!(drainable.status().await, Status::Failed);

        let result = drainable.exec(async {}).await;
        assert_eq!(result, Err(BootError("stop failed")));
    }

    #[tokio::test]
    async fn terminate_releases_parked_callers() {
        let (_log, on_transition) = recorder();
        let drainable: Drainable<BootError> = Drainable::new(
            || {
                Box::pin(async {
                    // never resolves before terminate cuts in
                    std::future::pending::<()>().await;
                    Ok(())
                })
            },
            || boxed_ok(),
            TokioDuration::from_secs(60),
            on_transition,
        );

        let d = drainable.clone();
        let first = tokio::spawn(async move { d.exec(async {}).await });
        tokio::task::yield_now().await;
        assert_eq!(drainable.status().await, Status::Waking);

        let d2 = drainable.clone();
        let parked = tokio::spawn(async move { d2.exec(async {}).await });
        tokio::task::yield_now().await;

        drainable.terminate().await;
        assert_eq!(drainable.status().await, Status::Terminated);
        assert_eq!(parked.await.unwrap(), Ok(()));

        first.abort();
    }
}
