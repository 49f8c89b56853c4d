//! A small concurrent process runner with graceful shutdown.
//!
//! Named processes run until one fails, all finish, or a shutdown signal
//! arrives; then every process is cancelled and drained with a timeout.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

type ProcessFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type Process = Box<dyn FnOnce(CancellationToken) -> ProcessFuture + Send>;

pub struct Runner {
    processes: Vec<(String, Process)>,
    shutdown: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Add a named process. It receives the shared cancellation token and
    /// is expected to return promptly once the token fires.
    pub fn with_named_process<F, Fut>(mut self, name: impl Into<String>, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.processes
            .push((name.into(), Box::new(|token| Box::pin(process(token)))));
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run all processes to completion. Returns the first process failure,
    /// if any.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut tasks: JoinSet<(String, anyhow::Result<()>)> = JoinSet::new();
        for (name, process) in self.processes {
            let token = self.shutdown.clone();
            tasks.spawn(async move {
                let result = process(token).await;
                (name, result)
            });
        }

        let sigterm = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::pin!(sigterm);

        let mut failure: Option<anyhow::Error> = None;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break;
                }
                _ = &mut sigterm => {
                    info!("termination signal received, shutting down");
                    break;
                }
                joined = tasks.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok((name, Ok(())))) => {
                            info!(process = %name, "process finished");
                        }
                        Some(Ok((name, Err(e)))) => {
                            error!(process = %name, error = %e, "process failed");
                            failure = Some(e.context(format!("process {} failed", name)));
                            break;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "process panicked");
                            failure = Some(anyhow::anyhow!("process panicked: {}", e));
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown.cancel();
        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, Err(e))) = joined {
                    warn!(process = %name, error = %e, "process failed during shutdown");
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown drain timed out, aborting remaining processes");
            tasks.abort_all();
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
