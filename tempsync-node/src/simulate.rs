//! Whole-protocol run inside one process: a coordinator task and N worker tasks on one hub.

use tempsync_core::{CoordinatorReport, COORDINATOR_CHANNEL};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::channel::{ChannelHub, ChannelReceiver};
use crate::coordinator::{run_coordinator, CoordinatorSettings};
use crate::error::NodeError;
use crate::shutdown::{RunOutcome, Shutdown};
use crate::worker::{run_worker, WorkerReport, WorkerSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    pub coordinator: CoordinatorReport,
    /// Ordered by assigned index.
    pub workers: Vec<WorkerReport>,
}

/// Run a coordinator and one task per entry of `workers` until the coordinator finishes.
pub async fn simulate<H>(
    hub: H,
    coordinator: CoordinatorSettings,
    workers: Vec<WorkerSettings>,
    shutdown: &Shutdown,
) -> Result<RunOutcome<SimulationReport>, NodeError>
where
    H: ChannelHub + Clone + 'static,
{
    // Workers may send SYN before the coordinator task gets to open its channel.
    let mut well_known = hub
        .open_read(COORDINATOR_CHANNEL)
        .await
        .map_err(NodeError::Setup)?;
    info!(workers = workers.len(), "simulation starting");

    let coordinator_task = {
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { run_coordinator(&hub, &coordinator, &shutdown).await })
    };
    let mut worker_tasks = JoinSet::new();
    for settings in workers {
        let hub = hub.clone();
        let shutdown = shutdown.clone();
        worker_tasks.spawn(async move { run_worker(&hub, &settings, &shutdown).await });
    }

    let outcome = match coordinator_task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Ok(RunOutcome::Interrupted),
    };
    let report = match outcome {
        Ok(RunOutcome::Completed(report)) => report,
        Ok(RunOutcome::Interrupted) => {
            worker_tasks.abort_all();
            well_known.close();
            return Ok(RunOutcome::Interrupted);
        }
        Err(e) => {
            // Workers would wait for a broadcast that never comes.
            worker_tasks.abort_all();
            return Err(e);
        }
    };
    well_known.close();

    let mut finished = Vec::new();
    while let Some(joined) = worker_tasks.join_next().await {
        match joined {
            Ok(Ok(RunOutcome::Completed(w))) => finished.push(w),
            Ok(Ok(RunOutcome::Interrupted)) => return Ok(RunOutcome::Interrupted),
            Ok(Err(e)) => return Err(e),
            Err(e) => warn!(error = %e, "worker task did not finish"),
        }
    }
    finished.sort_by_key(|w| w.assigned_index);
    Ok(RunOutcome::Completed(SimulationReport {
        coordinator: report,
        workers: finished,
    }))
}
