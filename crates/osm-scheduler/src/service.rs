use crate::scheduler::Scheduler;
use crate::SchedulerError;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Ticks each shard's scheduler on its own interval until shutdown. Shards
/// share nothing; one shard stopping on a fatal store error leaves the others
/// running.
pub struct SchedulerService {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<Result<(), SchedulerError>>)>,
}

impl SchedulerService {
    /// Spawns one loop per scheduler. Must be called inside a tokio runtime.
    pub fn start(schedulers: impl IntoIterator<Item = Arc<Scheduler>>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let tasks = schedulers
            .into_iter()
            .map(|scheduler| {
                let shard = scheduler.shard().to_string();
                let handle = tokio::spawn(run_shard(scheduler, rx.clone()));
                (shard, handle)
            })
            .collect();
        Self { shutdown, tasks }
    }

    pub fn shards(&self) -> Vec<&str> {
        self.tasks.iter().map(|(shard, _)| shard.as_str()).collect()
    }

    /// Signals every loop to stop and waits for them. Each entry carries the
    /// shard id and how its loop ended.
    pub async fn shutdown(self) -> Vec<(String, Result<(), SchedulerError>)> {
        let _ = self.shutdown.send(true);
        let mut results = Vec::with_capacity(self.tasks.len());
        for (shard, handle) in self.tasks {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => Err(SchedulerError::Worker(err.to_string())),
            };
            results.push((shard, result));
        }
        results
    }
}

pub async fn run_shard(
    scheduler: Arc<Scheduler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SchedulerError> {
    let mut ticker = tokio::time::interval(scheduler.config().tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(event = "scheduler_started", shard = %scheduler.shard());

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let worker = Arc::clone(&scheduler);
                let result = tokio::task::spawn_blocking(move || worker.tick(Utc::now()))
                    .await
                    .map_err(|err| SchedulerError::Worker(err.to_string()))
                    .and_then(|result| result);
                match result {
                    Ok(_) => {}
                    Err(err) if err.is_fatal() => {
                        error!(
                            event = "scheduler_stopped",
                            shard = %scheduler.shard(),
                            error = %err,
                        );
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(
                            event = "scheduler_tick_error",
                            shard = %scheduler.shard(),
                            error = %err,
                        );
                    }
                }
            }
        }
    }

    info!(event = "scheduler_shutdown", shard = %scheduler.shard());
    Ok(())
}
