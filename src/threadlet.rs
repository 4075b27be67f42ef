//! A single-worker cooperative task primitive (§4.2).
//!
//! `Threadlet` runs an optional `start` step followed by a `main` step as
//! one spawned `tokio` task, exposes an explicit idle/starting/running/
//! stopping lifecycle, and lets the worker body race its own work against
//! an externally-settable stop signal via [`tokio_util::sync::CancellationToken`]
//! rather than polling a bare boolean.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Handle passed into the `main` function, giving it (and only it) access
/// to the stop signal.
#[derive(Clone)]
pub struct Runner {
    cancel: CancellationToken,
}

/// The outcome of racing a future against the stop signal.
pub enum Raced<T> {
    /// Stop was requested before (or simultaneously with) the future
    /// completing.
    Stopped,
    /// The future completed first.
    Completed(T),
}

impl Runner {
    pub fn should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn when_stop_requested(&self) {
        self.cancel.cancelled().await
    }

    /// Completes as soon as `fut` or the stop signal completes, whichever
    /// is first. Stop wins ties, so a worker never executes one more unit
    /// of delay-bearing work than necessary after `stop()` is called.
    pub async fn race_with_stop<F: Future>(&self, fut: F) -> Raced<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Raced::Stopped,
            out = fut => Raced::Completed(out),
        }
    }
}

type SharedOutcome<E> = Shared<BoxFuture<'static, Result<(), E>>>;

struct Inner<E> {
    phase: Phase,
    cancel: CancellationToken,
    run_future: Option<SharedOutcome<E>>,
    started_future: Option<SharedOutcome<E>>,
}

/// A single-worker cooperative task. `E` is the error type shared between
/// the `start` and `main` steps; it must be `Clone` because multiple
/// concurrent callers of `run()`/`start()` observe the same outcome.
///
/// Always held behind an `Arc` (see [`Threadlet::new`]) so the observer
/// task spawned on every `run()` can update lifecycle state after the
/// worker finishes, without the caller needing to await anything.
pub struct Threadlet<E> {
    inner: Mutex<Inner<E>>,
    start_fn: Box<dyn Fn() -> BoxFuture<'static, Result<(), E>> + Send + Sync>,
    main_fn: Box<dyn Fn(Runner) -> BoxFuture<'static, Result<(), E>> + Send + Sync>,
    name: &'static str,
}

impl<E> Threadlet<E>
where
    E: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// `name` is used only for log messages emitted when a run fails with
    /// no observer (§4.2 Failure semantics).
    pub fn new<Start, StartFut, Main, MainFut>(
        name: &'static str,
        start: Start,
        main: Main,
    ) -> Arc<Self>
    where
        Start: Fn() -> StartFut + Send + Sync + 'static,
        StartFut: Future<Output = Result<(), E>> + Send + 'static,
        Main: Fn(Runner) -> MainFut + Send + Sync + 'static,
        MainFut: Future<Output = Result<(), E>> + Send + 'static,
    {
        Arc::new(Threadlet {
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                cancel: CancellationToken::new(),
                run_future: None,
                started_future: None,
            }),
            start_fn: Box::new(move || start().boxed()),
            main_fn: Box::new(move |runner| main(runner).boxed()),
            name,
        })
    }

    pub fn is_running(&self) -> bool {
        !matches!(self.inner.lock().unwrap().phase, Phase::Idle)
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock().unwrap().phase
    }

    /// Starts the task if idle; returns a future resolving to the same
    /// outcome every concurrent caller of `run()`/`stop()` observes.
    pub fn run(self: &Arc<Self>) -> SharedOutcome<E> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fut) = &inner.run_future {
            return fut.clone();
        }
        self.spawn_locked(&mut inner)
    }

    /// Starts the task if idle; resolves once the `start` step has
    /// finished (successfully or not), without waiting for `main`.
    pub fn start(self: &Arc<Self>) -> SharedOutcome<E> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(fut) = &inner.started_future {
            return fut.clone();
        }
        self.spawn_locked(&mut inner);
        inner
            .started_future
            .clone()
            .expect("spawn_locked always sets started_future")
    }

    pub fn when_started(self: &Arc<Self>) -> SharedOutcome<E> {
        self.start()
    }

    /// Requests the worker to stop and returns the same future as `run()`.
    /// If the worker isn't running, resolves immediately with `Ok(())`.
    pub fn stop(self: &Arc<Self>) -> BoxFuture<'static, Result<(), E>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.run_future.clone() {
            None => futures::future::ready(Ok(())).boxed(),
            Some(fut) => {
                if matches!(inner.phase, Phase::Running | Phase::Starting) {
                    inner.phase = Phase::Stopping;
                }
                inner.cancel.cancel();
                async move { fut.await }.boxed()
            }
        }
    }

    /// Builds and spawns the lifecycle task, recording its shared futures
    /// on `inner` (which the caller already holds locked) before
    /// returning the run future.
    fn spawn_locked(self: &Arc<Self>, inner: &mut Inner<E>) -> SharedOutcome<E> {
        inner.phase = Phase::Starting;
        inner.cancel = CancellationToken::new();
        let runner = Runner {
            cancel: inner.cancel.clone(),
        };

        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<Result<(), E>>();
        let started_future: SharedOutcome<E> = async move {
            started_rx.await.unwrap_or(Ok(()))
        }
        .boxed()
        .shared();
        inner.started_future = Some(started_future.clone());

        let start_fut = (self.start_fn)();
        let main_fn_call = (self.main_fn)(runner);

        let task = async move {
            let start_result = start_fut.await;
            match &start_result {
                Ok(()) => {
                    let _ = started_tx.send(Ok(()));
                }
                Err(e) => {
                    let _ = started_tx.send(Err(e.clone()));
                }
            }
            start_result?;
            main_fn_call.await
        };

        let run_future: SharedOutcome<E> = tokio::spawn(task)
            .map({
                let name = self.name;
                move |joined| match joined {
                    Ok(result) => result,
                    Err(join_err) => {
                        panic!("threadlet `{name}` panicked: {join_err}");
                    }
                }
            })
            .boxed()
            .shared();
        inner.run_future = Some(run_future.clone());

        // Drive Starting -> Running on the started signal, and reset to
        // Idle when the run completes, so `is_running()` reflects reality
        // even if nobody ever awaits the returned future. This also
        // surfaces an unobserved failure via a log line (§4.2).
        let this = Arc::clone(self);
        let observed_run = run_future.clone();
        let observed_started = started_future.clone();
        tokio::spawn(async move {
            if observed_started.await.is_ok() {
                let mut g = this.inner.lock().unwrap();
                if matches!(g.phase, Phase::Starting) {
                    g.phase = Phase::Running;
                }
            }
            let result = observed_run.await;
            {
                let mut g = this.inner.lock().unwrap();
                g.phase = Phase::Idle;
                g.run_future = None;
                g.started_future = None;
            }
            if let Err(e) = result {
                warn!(threadlet = this.name, error = ?e, "threadlet main exited with an error");
            }
        });

        run_future
    }
}
