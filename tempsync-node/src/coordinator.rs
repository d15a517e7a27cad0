//! Coordinator process: accept registrations on the well-known channel, then run
//! rounds with one reader task per worker feeding a single aggregation loop.

use std::time::Duration;

use tempsync_core::{
    coordinator_to_worker_channel, worker_to_coordinator_channel, Coordinator, CoordinatorParams,
    CoordinatorReport, Message, MessageKind, WorkerId, COORDINATOR_CHANNEL,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::{ChannelError, ChannelHub, ChannelReceiver, ChannelSender};
use crate::error::NodeError;
use crate::shutdown::{RunOutcome, Shutdown};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub params: CoordinatorParams,
    /// First wait for a worker's ACK; doubled per attempt.
    pub handshake_timeout: Duration,
    pub handshake_attempts: u32,
    /// Fail a round that is not complete within this time.
    pub round_timeout: Option<Duration>,
}

/// Channels to one registered worker.
struct Link<H: ChannelHub> {
    worker_id: WorkerId,
    outbound: H::Sender,
    inbound: H::Receiver,
}

/// Run the coordinator until convergence, failure, or shutdown.
pub async fn run_coordinator<H: ChannelHub>(
    hub: &H,
    settings: &CoordinatorSettings,
    shutdown: &Shutdown,
) -> Result<RunOutcome<CoordinatorReport>, NodeError> {
    async move {
        let result = tokio::select! {
            biased;
            _ = shutdown.wait() => {
                info!("interrupted, channels released");
                Ok(RunOutcome::Interrupted)
            }
            r = drive(hub, settings) => r.map(RunOutcome::Completed),
        };
        if let Err(e) = &result {
            error!(error = %e, "coordinator failed");
        }
        result
    }
    .instrument(info_span!("coordinator"))
    .await
}

async fn drive<H: ChannelHub>(
    hub: &H,
    settings: &CoordinatorSettings,
) -> Result<CoordinatorReport, NodeError> {
    let mut core = Coordinator::new(settings.params)?;
    let mut well_known = hub
        .open_read(COORDINATOR_CHANNEL)
        .await
        .map_err(NodeError::Setup)?;
    info!(
        workers = settings.params.worker_count,
        seed = settings.params.seed_estimate,
        "started"
    );

    let mut links = Vec::with_capacity(settings.params.worker_count);
    while !core.registration_complete() {
        let msg = well_known.recv().await.map_err(NodeError::Receive)?;
        let Message::Syn { worker_id } = msg else {
            debug!(%msg, "ignoring non-SYN on well-known channel");
            continue;
        };
        if let Some(link) = register::<H>(hub, &mut core, worker_id, settings).await? {
            links.push(link);
        }
    }
    well_known.close();
    info!("all workers registered");

    iterate::<H>(&mut core, links, settings.round_timeout).await
}

/// Handshake with one candidate. `Ok(None)` means the candidate was skipped.
async fn register<H: ChannelHub>(
    hub: &H,
    core: &mut Coordinator,
    worker_id: WorkerId,
    settings: &CoordinatorSettings,
) -> Result<Option<Link<H>>, NodeError> {
    let syn_ack = match core.begin_handshake(worker_id) {
        Ok(m) => m,
        Err(e) => {
            warn!(worker = %worker_id, error = %e, "rejecting SYN");
            return Ok(None);
        }
    };
    info!(worker = %worker_id, "worker connecting");

    let mut outbound = match hub.open_write(&coordinator_to_worker_channel(worker_id)).await {
        Ok(s) => s,
        Err(e) => {
            warn!(worker = %worker_id, error = %e, "cannot open worker channel, skipping");
            core.abandon_handshake(worker_id);
            return Ok(None);
        }
    };
    let mut inbound = match hub.open_read(&worker_to_coordinator_channel(worker_id)).await {
        Ok(r) => r,
        Err(e) => {
            core.abandon_handshake(worker_id);
            return Err(NodeError::Setup(e));
        }
    };
    if let Err(e) = outbound.send(&syn_ack).await {
        warn!(worker = %worker_id, error = %e, "cannot send SYN_ACK, skipping");
        core.abandon_handshake(worker_id);
        return Ok(None);
    }

    match await_ack(&mut inbound, worker_id, settings).await {
        Ok(()) => {
            let index = core.complete_handshake(worker_id)?;
            info!(worker = %worker_id, index, "worker registered");
            Ok(Some(Link {
                worker_id,
                outbound,
                inbound,
            }))
        }
        Err(e) => {
            warn!(worker = %worker_id, error = %e, "handshake failed, skipping");
            core.abandon_handshake(worker_id);
            outbound.close();
            inbound.close();
            Ok(None)
        }
    }
}

/// Wait for `ACK(worker_id)`, discarding anything else. The wait doubles on each attempt.
async fn await_ack<R: ChannelReceiver>(
    inbound: &mut R,
    worker_id: WorkerId,
    settings: &CoordinatorSettings,
) -> Result<(), NodeError> {
    let mut wait = settings.handshake_timeout;
    for attempt in 1..=settings.handshake_attempts {
        let deadline = Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(NodeError::Receive(e)),
                Ok(Ok(Message::Ack { worker_id: id })) if id == worker_id => return Ok(()),
                Ok(Ok(other)) => debug!(%other, "discarding while waiting for ACK"),
            }
        }
        debug!(worker = %worker_id, attempt, "no ACK yet");
        wait = wait.saturating_mul(2);
    }
    Err(NodeError::HandshakeTimeout {
        waiting_for: MessageKind::Ack,
        attempts: settings.handshake_attempts,
    })
}

type Delivery = (WorkerId, Result<Message, ChannelError>);

async fn iterate<H: ChannelHub>(
    core: &mut Coordinator,
    links: Vec<Link<H>>,
    round_timeout: Option<Duration>,
) -> Result<CoordinatorReport, NodeError> {
    let (tx, mut rx) = mpsc::channel::<Delivery>(links.len().max(1) * 2);
    let mut readers = JoinSet::new();
    let mut outbound = Vec::with_capacity(links.len());
    for link in links {
        outbound.push((link.worker_id, link.outbound));
        readers.spawn(read_worker(link.worker_id, link.inbound, tx.clone()));
    }
    drop(tx);

    let mut deadline = round_timeout.map(|t| Instant::now() + t);
    loop {
        let delivery = match deadline {
            Some(d) => match tokio::time::timeout_at(d, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    return Err(NodeError::RoundTimeout {
                        round: core.rounds() + 1,
                        missing: core.missing_readings(),
                    })
                }
            },
            None => rx.recv().await,
        };
        // Readers only exit after reporting an error, so an empty fan-in means they are all gone.
        let (worker_id, received) =
            delivery.ok_or_else(|| NodeError::Receive(ChannelError::Closed("fan-in".into())))?;
        let msg = received.map_err(NodeError::Receive)?;
        let Message::Reading { value } = msg else {
            warn!(worker = %worker_id, %msg, "protocol error: expected READING, discarding");
            continue;
        };
        debug!(worker = %worker_id, "received {:.4}", value);
        let outcome = match core.record_reading(worker_id, value) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "discarding reading");
                continue;
            }
        };

        info!(round = outcome.round, spread = outcome.spread, "sending {:.4}", outcome.estimate);
        for msg in outcome.broadcast() {
            if msg == Message::Done {
                info!(round = outcome.round, "workers agree, sending DONE");
            }
            for (id, sender) in outbound.iter_mut() {
                sender.send(&msg).await.map_err(|e| {
                    warn!(worker = %id, "broadcast failed");
                    NodeError::Send(e)
                })?;
            }
        }
        if outcome.converged {
            break;
        }
        deadline = round_timeout.map(|t| Instant::now() + t);
    }

    readers.abort_all();
    for (_, sender) in outbound.iter_mut() {
        sender.close();
    }
    let report = core.finish()?;
    info!(rounds = report.rounds, "finished with estimate {:.4}", report.estimate);
    Ok(report)
}

/// Forward everything one worker sends into the fan-in queue. Stops after the first error.
async fn read_worker<R: ChannelReceiver>(
    worker_id: WorkerId,
    mut inbound: R,
    tx: mpsc::Sender<Delivery>,
) {
    loop {
        let received = inbound.recv().await;
        let failed = received.is_err();
        if tx.send((worker_id, received)).await.is_err() || failed {
            break;
        }
    }
    debug!(channel = inbound.name(), "reader stopped");
    inbound.close();
}
