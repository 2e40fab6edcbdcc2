use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::engine::Engine;

/// Run a cycle now, then once per `period`, until cancelled.
///
/// Cycles never overlap. Triggers that come due while a cycle is running are
/// kept and each runs, back to back, once that cycle ends. Each cycle runs in
/// its own task so a panic inside one is logged and the schedule carries on.
pub async fn run(engine: Arc<Engine>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let cycle_engine = engine.clone();
        let mut cycle = tokio::spawn(async move { cycle_engine.run_cycle().await });

        tokio::select! {
            joined = &mut cycle => match joined {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("Discovery cycle failed: {}", e),
                Err(e) => tracing::error!("Discovery cycle aborted: {}", e),
            },
            _ = cancel.cancelled() => {
                tracing::info!("Cancelling in-flight discovery cycle");
                cycle.abort();
                break;
            }
        }
    }

    tracing::info!("Scheduler shutting down");
}
