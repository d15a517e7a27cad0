//! Worker process: register with the coordinator, then answer each broadcast
//! with an updated local reading until DONE.

use std::time::Duration;

use rand::Rng;
use tempsync_core::{
    coordinator_to_worker_channel, worker_to_coordinator_channel, Message, MessageKind, Reaction,
    SeedSource, Worker, WorkerId, COORDINATOR_CHANNEL,
};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::{ChannelHub, ChannelReceiver, ChannelSender};
use crate::error::NodeError;
use crate::shutdown::{RunOutcome, Shutdown};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: WorkerId,
    pub seed: SeedSource,
    /// Wait for SYN_ACK per attempt.
    pub handshake_timeout: Duration,
    pub handshake_attempts: u32,
    /// Pause before re-sending SYN; doubled per attempt, plus up to 50% jitter.
    pub backoff: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub worker_id: WorkerId,
    pub assigned_index: u32,
    /// Broadcasts answered.
    pub rounds: u64,
    pub local: f64,
}

/// Run one worker until DONE, failure, or shutdown.
pub async fn run_worker<H: ChannelHub>(
    hub: &H,
    settings: &WorkerSettings,
    shutdown: &Shutdown,
) -> Result<RunOutcome<WorkerReport>, NodeError> {
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
            error!(error = %e, "worker failed");
        }
        result
    }
    .instrument(info_span!("worker", id = %settings.worker_id))
    .await
}

async fn drive<H: ChannelHub>(
    hub: &H,
    settings: &WorkerSettings,
) -> Result<WorkerReport, NodeError> {
    let id = settings.worker_id;
    let mut worker = Worker::new(id, settings.seed.clone());
    info!("started");

    let mut inbound = hub
        .open_read(&coordinator_to_worker_channel(id))
        .await
        .map_err(NodeError::Setup)?;
    let mut server = hub
        .open_write(COORDINATOR_CHANNEL)
        .await
        .map_err(NodeError::Setup)?;
    let syn = worker.begin_registration()?;
    server.send(&syn).await.map_err(NodeError::Send)?;
    worker.syn_sent()?;

    let (assigned_index, seed) =
        await_syn_ack(&mut worker, &mut inbound, &mut server, settings).await?;
    server.close();
    info!(index = assigned_index, "registered, temperature {:.4}", seed);

    let mut outbound = hub
        .open_write(&worker_to_coordinator_channel(id))
        .await
        .map_err(NodeError::Setup)?;
    for msg in worker.acknowledge()? {
        outbound.send(&msg).await.map_err(NodeError::Send)?;
    }
    info!("sending {:.4}", seed);

    loop {
        let msg = inbound.recv().await.map_err(NodeError::Receive)?;
        match worker.on_message(msg)? {
            Reaction::Reply(reply) => {
                if let Message::Reading { value } = reply {
                    info!("sending {:.4}", value);
                }
                if let Err(e) = outbound.send(&reply).await {
                    debug!(channel = outbound.name(), error = %e, "reply not delivered");
                    // The coordinator closes its side right after DONE; a reply to the
                    // final broadcast may hit a closed channel with DONE already queued.
                    if finish_if_done(&mut worker, &mut inbound, settings.handshake_timeout).await {
                        break;
                    }
                    return Err(NodeError::Send(e));
                }
            }
            Reaction::Finished => break,
            Reaction::Ignored(kind) => {
                warn!(%kind, "protocol violation: unexpected message, discarding")
            }
            Reaction::Registered { .. } => debug!("duplicate registration reaction"),
        }
    }
    info!(rounds = worker.rounds(), "received DONE");
    outbound.close();
    inbound.close();

    Ok(WorkerReport {
        worker_id: id,
        assigned_index,
        rounds: worker.rounds(),
        local: worker.local().unwrap_or(seed),
    })
}

/// Wait for SYN_ACK, re-sending SYN with jittered exponential backoff between attempts.
async fn await_syn_ack<R: ChannelReceiver, S: ChannelSender>(
    worker: &mut Worker,
    inbound: &mut R,
    server: &mut S,
    settings: &WorkerSettings,
) -> Result<(u32, f64), NodeError> {
    let mut backoff = settings.backoff;
    for attempt in 1..=settings.handshake_attempts {
        let deadline = Instant::now() + settings.handshake_timeout;
        loop {
            match tokio::time::timeout_at(deadline, inbound.recv()).await {
                Err(_) => break,
                Ok(Err(e)) => return Err(NodeError::Receive(e)),
                Ok(Ok(msg)) => match worker.on_message(msg)? {
                    Reaction::Registered {
                        assigned_index,
                        seed,
                    } => return Ok((assigned_index, seed)),
                    other => debug!(?other, "waiting for SYN_ACK"),
                },
            }
        }
        if attempt == settings.handshake_attempts {
            break;
        }
        let pause = with_jitter(backoff);
        warn!(attempt, ?pause, "no SYN_ACK, re-sending SYN");
        tokio::time::sleep(pause).await;
        if let Err(e) = server.send(&worker.syn()).await {
            warn!(error = %e, "could not re-send SYN");
        }
        backoff = backoff.saturating_mul(2);
    }
    Err(NodeError::HandshakeTimeout {
        waiting_for: MessageKind::SynAck,
        attempts: settings.handshake_attempts,
    })
}

fn with_jitter(base: Duration) -> Duration {
    let max_jitter = (base.as_millis() / 2) as u64;
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    base + Duration::from_millis(jitter)
}

/// Give a pending DONE `grace` to arrive. True if the worker terminated.
async fn finish_if_done<R: ChannelReceiver>(
    worker: &mut Worker,
    inbound: &mut R,
    grace: Duration,
) -> bool {
    while let Ok(Some(msg)) = inbound.try_recv() {
        if let Ok(Reaction::Finished) = worker.on_message(msg) {
            return true;
        }
    }
    let deadline = Instant::now() + grace;
    while let Ok(Ok(msg)) = tokio::time::timeout_at(deadline, inbound.recv()).await {
        if let Ok(Reaction::Finished) = worker.on_message(msg) {
            return true;
        }
    }
    false
}
