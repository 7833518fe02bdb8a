//! Worker supervision: ctrl-c handling and failure propagation.

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Run a set of spawned workers until ctrl-c or the first failure.
///
/// On ctrl-c the shutdown flag flips and workers exit at their next loop
/// head. If any worker returns an error (or panics), shutdown is signalled
/// and that error is propagated so the process exits nonzero.
pub async fn supervise(
    mut workers: JoinSet<anyhow::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let mut first_failure: Option<anyhow::Error> = None;

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("install ctrl-c handler")?;
                tracing::info!(event = "crawler.shutdown", "stopping workers");
                let _ = shutdown_tx.send(true);
                break;
            }
            joined = workers.join_next() => {
                match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        tracing::error!(event = "crawler.worker.failed", error = %format!("{err:#}"), "worker failed");
                        first_failure = Some(err);
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                    Some(Err(err)) => {
                        tracing::error!(event = "crawler.worker.panicked", error = %err, "worker panicked");
                        first_failure = Some(anyhow::Error::new(err).context("join worker"));
                        let _ = shutdown_tx.send(true);
                        break;
                    }
                }
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(event = "crawler.worker.failed", error = %format!("{err:#}"), "worker failed during shutdown");
                first_failure.get_or_insert(err);
            }
            Err(err) => {
                tracing::error!(event = "crawler.worker.panicked", error = %err, "worker panicked during shutdown");
                first_failure.get_or_insert(anyhow::Error::new(err).context("join worker"));
            }
        }
    }

    match first_failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
