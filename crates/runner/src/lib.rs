//! Process runner for the telemetry services.
//!
//! Named processes run concurrently until one of them fails, all of them
//! finish, or SIGTERM/SIGINT arrives. Closers then run with a shared timeout,
//! whatever the reason for stopping.
//!
//! # Example
//!
//! ```no_run
//! use telemetry_runner::Runner;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let code = Runner::new()
//!         .with_named_process("heartbeat", |ctx| async move {
//!             loop {
//!                 tokio::select! {
//!                     _ = ctx.cancelled() => break,
//!                     _ = tokio::time::sleep(Duration::from_secs(1)) => {
//!                         tracing::info!("still alive");
//!                     }
//!                 }
//!             }
//!             Ok(())
//!         })
//!         .with_closer(|| async move { Ok(()) })
//!         .run()
//!         .await;
//!     std::process::exit(code);
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

pub type Closer =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

/// How a [`Runner`] came to a stop
#[derive(Debug)]
pub enum RunOutcome {
    /// Every process returned `Ok` on its own
    Completed,
    /// Shutdown was requested by a signal or the runner's token
    Cancelled,
    /// A process failed or panicked; the rest were cancelled
    Failed { process: String, error: anyhow::Error },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed | RunOutcome::Cancelled => 0,
            RunOutcome::Failed { .. } => 1,
        }
    }
}

pub struct Runner {
    processes: Vec<(String, AppProcess)>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
    handle_signals: bool,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    /// Closer timeout defaults to 10 seconds
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            handle_signals: true,
        }
    }

    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let process: AppProcess = Box::new(|token| Box::pin(process(token)));
        self.processes.push((name.into(), process));
        self
    }

    /// Add an already boxed process, e.g. one returned by a worker's
    /// `into_runner_processes`
    pub fn with_boxed_process(mut self, name: impl Into<String>, process: AppProcess) -> Self {
        self.processes.push((name.into(), process));
        self
    }

    /// Closers run after every process has stopped, concurrently, and all of
    /// them run even if some fail.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Cancelling `token` shuts the runner down like a signal would
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Disable SIGTERM/SIGINT handling; shutdown then only comes from the token
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    /// Run to completion and return the exit code for the binary
    pub async fn run(self) -> i32 {
        let outcome = self.run_until_stopped().await;
        match &outcome {
            RunOutcome::Failed { process, error } => {
                error!(process = %process, error = %format!("{:#}", error), "exiting with error");
            }
            _ => info!("exiting normally"),
        }
        outcome.exit_code()
    }

    /// Run every process, then every closer, and report why the run ended
    pub async fn run_until_stopped(self) -> RunOutcome {
        let token = self.cancellation_token;
        if self.handle_signals {
            spawn_signal_handlers(token.clone());
        }

        let mut join_set = JoinSet::new();
        for (name, process) in self.processes {
            let process_token = token.clone();
            debug!(process = %name, "starting process");
            join_set.spawn(async move { (name, process(process_token).await) });
        }

        let mut failure: Option<(String, anyhow::Error)> = None;
        loop {
            let joined = tokio::select! {
                joined = join_set.join_next() => joined,
                _ = token.cancelled() => break,
            };
            let Some(joined) = joined else { break };

            match joined {
                Ok((name, Ok(()))) => debug!(process = %name, "process completed"),
                Ok((name, Err(error))) => {
                    error!(process = %name, error = %format!("{:#}", error), "process failed");
                    failure = Some((name, error));
                    break;
                }
                Err(join_error) => {
                    error!(error = %join_error, "process panicked");
                    failure = Some((
                        "<panicked>".to_string(),
                        anyhow::anyhow!("process panicked: {}", join_error),
                    ));
                    break;
                }
            }
        }

        let cancelled = token.is_cancelled() && failure.is_none();
        token.cancel();
        while let Some(joined) = join_set.join_next().await {
            if let Ok((name, Err(error))) = joined {
                warn!(process = %name, error = %format!("{:#}", error), "process failed during shutdown");
            }
        }

        run_closers(self.closers, self.closer_timeout).await;

        match failure {
            Some((process, error)) => RunOutcome::Failed { process, error },
            None if cancelled => RunOutcome::Cancelled,
            None => RunOutcome::Completed,
        }
    }
}

fn spawn_signal_handlers(token: CancellationToken) {
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT");
                ctrl_c_token.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("received SIGTERM");
                token.cancel();
            }
            Err(err) => error!(error = %err, "failed to listen for SIGTERM"),
        }
    });
}

async fn run_closers(closers: Vec<Closer>, timeout: Duration) {
    if closers.is_empty() {
        return;
    }
    info!(timeout_ms = timeout.as_millis(), count = closers.len(), "running closers");

    let mut closer_set = JoinSet::new();
    for closer in closers {
        closer_set.spawn(async move { closer().await });
    }

    let all = async {
        while let Some(result) = closer_set.join_next().await {
            match result {
                Ok(Ok(())) => debug!("closer completed"),
                Ok(Err(err)) => error!(error = %format!("{:#}", err), "closer failed"),
                Err(err) => error!(error = %err, "closer panicked"),
            }
        }
    };

    if tokio::time::timeout(timeout, all).await.is_err() {
        error!(timeout_ms = timeout.as_millis(), "closers timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    fn runner() -> Runner {
        Runner::new().without_signal_handlers()
    }

    fn until_cancelled() -> AppProcess {
        Box::new(|ctx| {
            Box::pin(async move {
                ctx.cancelled().await;
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_completed_processes_then_closers() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();

        let outcome = runner()
            .with_named_process("a", |_| async { Ok(()) })
            .with_named_process("b", |_| async { Ok(()) })
            .with_closer(move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .run_until_stopped()
            .await;

        assert!(matches!(outcome, RunOutcome::Completed));
        assert_eq!(outcome.exit_code(), 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_cancels_siblings() {
        let sibling_stopped = Arc::new(AtomicBool::new(false));
        let flag = sibling_stopped.clone();

        let outcome = runner()
            .with_named_process("long", move |ctx| async move {
                ctx.cancelled().await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_named_process("broken", |_| async { Err(anyhow::anyhow!("boom")) })
            .run_until_stopped()
            .await;

        match &outcome {
            RunOutcome::Failed { process, error } => {
                assert_eq!(process, "broken");
                assert_eq!(error.to_string(), "boom");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(outcome.exit_code(), 1);
        assert!(sibling_stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_external_cancel_stops_runner() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let outcome = runner()
            .with_cancellation_token(token)
            .with_boxed_process("waiter", until_cancelled())
            .run_until_stopped()
            .await;

        assert!(matches!(outcome, RunOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_every_closer_runs_even_when_one_fails() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (first, second) = (calls.clone(), calls.clone());

        runner()
            .with_closer(move || async move {
                first.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("close failed"))
            })
            .with_closer(move || async move {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .run_until_stopped()
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_closers_are_abandoned_after_timeout() {
        let started = tokio::time::Instant::now();

        runner()
            .with_closer(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .with_closer_timeout(Duration::from_millis(50))
            .run_until_stopped()
            .await;

        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
