//! Coordinator state machine: registers a fixed number of workers, then runs
//! barrier-synchronised averaging rounds until the workers agree.

use crate::averaging::{self, DEFAULT_TOLERANCE};
use crate::identity::WorkerId;
use crate::protocol::Message;

/// Default number of workers the coordinator waits for.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Fixed parameters of one coordinator session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorParams {
    /// Number of workers to register before the first round (N).
    pub worker_count: usize,
    /// Global estimate before the first aggregation.
    pub seed_estimate: f64,
    /// Stability tolerance on the spread of worker readings.
    pub tolerance: f64,
}

impl Default for CoordinatorParams {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            seed_estimate: 0.0,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    AwaitingRegistrations,
    Iterating,
    ConvergedSendingDone,
    Terminated,
}

/// One registered worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    /// Ordinal in `[0, N)`, in registration order.
    pub assigned_index: u32,
    /// Reading from the last completed round.
    pub last_reading: Option<f64>,
}

/// SYN_ACK sent, ACK not yet received.
#[derive(Debug, Clone, Copy)]
struct PendingHandshake {
    worker_id: WorkerId,
    assigned_index: u32,
}

/// Result of a completed round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundOutcome {
    /// 1-based round number.
    pub round: u64,
    /// New global estimate, broadcast to every worker.
    pub estimate: f64,
    /// Maximum pairwise difference among this round's readings.
    pub spread: f64,
    pub converged: bool,
}

impl RoundOutcome {
    /// Messages to send, in order, to every registered worker.
    pub fn broadcast(&self) -> Vec<Message> {
        let mut out = vec![Message::Reading {
            value: self.estimate,
        }];
        if self.converged {
            out.push(Message::Done);
        }
        out
    }
}

/// Final state handed back when the session terminates after convergence.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorReport {
    pub rounds: u64,
    pub estimate: f64,
    /// Last reading per worker, in registration order.
    pub readings: Vec<(WorkerId, f64)>,
}

/// Main coordinator. Host passes handshake events and readings; core returns what to send.
/// Exclusively owns the global estimate and the worker records.
pub struct Coordinator {
    params: CoordinatorParams,
    phase: CoordinatorPhase,
    workers: Vec<WorkerRecord>,
    pending: Option<PendingHandshake>,
    estimate: f64,
    round: u64,
    /// Readings of the round in progress, indexed by assigned index.
    round_readings: Vec<Option<f64>>,
    received: usize,
}

impl Coordinator {
    pub fn new(params: CoordinatorParams) -> Result<Self, CoordinatorError> {
        if params.worker_count == 0 {
            return Err(CoordinatorError::InvalidWorkerCount);
        }
        Ok(Self {
            params,
            phase: CoordinatorPhase::AwaitingRegistrations,
            workers: Vec::with_capacity(params.worker_count),
            pending: None,
            estimate: params.seed_estimate,
            round: 0,
            round_readings: Vec::new(),
            received: 0,
        })
    }

    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    /// Current global estimate (the seed until the first round completes).
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// Number of completed rounds.
    pub fn rounds(&self) -> u64 {
        self.round
    }

    /// Registered workers in registration order.
    pub fn workers(&self) -> &[WorkerRecord] {
        &self.workers
    }

    pub fn is_registered(&self, worker_id: WorkerId) -> bool {
        self.workers.iter().any(|w| w.worker_id == worker_id)
    }

    pub fn registration_complete(&self) -> bool {
        self.workers.len() == self.params.worker_count
    }

    /// On SYN: reserve the next ordinal for `worker_id` and return the SYN_ACK to send.
    /// The ordinal is only consumed once the handshake completes.
    pub fn begin_handshake(&mut self, worker_id: WorkerId) -> Result<Message, CoordinatorError> {
        self.expect_phase(CoordinatorPhase::AwaitingRegistrations)?;
        if self.is_registered(worker_id) {
            return Err(CoordinatorError::DuplicateWorker(worker_id));
        }
        if let Some(p) = self.pending {
            return Err(CoordinatorError::HandshakeInProgress(p.worker_id));
        }
        let assigned_index = self.workers.len() as u32;
        self.pending = Some(PendingHandshake {
            worker_id,
            assigned_index,
        });
        Ok(Message::SynAck { assigned_index })
    }

    /// On ACK: register the pending worker. Returns its assigned index.
    /// Moves to `Iterating` once the N-th worker is registered.
    pub fn complete_handshake(&mut self, worker_id: WorkerId) -> Result<u32, CoordinatorError> {
        self.expect_phase(CoordinatorPhase::AwaitingRegistrations)?;
        let pending = self.pending.ok_or(CoordinatorError::NoPendingHandshake)?;
        if pending.worker_id != worker_id {
            return Err(CoordinatorError::HandshakeMismatch {
                expected: pending.worker_id,
                got: worker_id,
            });
        }
        self.pending = None;
        self.workers.push(WorkerRecord {
            worker_id,
            assigned_index: pending.assigned_index,
            last_reading: None,
        });
        if self.registration_complete() {
            self.phase = CoordinatorPhase::Iterating;
            self.round_readings = vec![None; self.workers.len()];
            self.received = 0;
        }
        Ok(pending.assigned_index)
    }

    /// Drop the pending handshake for `worker_id` (timeout or send failure).
    /// Returns whether one was pending.
    pub fn abandon_handshake(&mut self, worker_id: WorkerId) -> bool {
        match self.pending {
            Some(p) if p.worker_id == worker_id => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Record one worker's reading for the round in progress.
    /// Returns the outcome once every registered worker has reported;
    /// `None` while the round is still open.
    pub fn record_reading(
        &mut self,
        worker_id: WorkerId,
        value: f64,
    ) -> Result<Option<RoundOutcome>, CoordinatorError> {
        self.expect_phase(CoordinatorPhase::Iterating)?;
        let idx = self
            .workers
            .iter()
            .position(|w| w.worker_id == worker_id)
            .ok_or(CoordinatorError::UnknownWorker(worker_id))?;
        if self.round_readings[idx].is_some() {
            return Err(CoordinatorError::DuplicateReading {
                worker: worker_id,
                round: self.round + 1,
            });
        }
        self.round_readings[idx] = Some(value);
        self.received += 1;
        if self.received < self.workers.len() {
            return Ok(None);
        }
        Ok(Some(self.close_round()))
    }

    fn close_round(&mut self) -> RoundOutcome {
        let readings: Vec<f64> = self
            .round_readings
            .iter_mut()
            .map(|slot| slot.take().unwrap_or_default())
            .collect();
        self.received = 0;
        for (record, &r) in self.workers.iter_mut().zip(&readings) {
            record.last_reading = Some(r);
        }
        self.estimate = averaging::next_estimate(self.estimate, &readings);
        self.round += 1;
        let spread = averaging::spread(&readings).unwrap_or_default();
        let converged = averaging::is_stable(&readings, self.params.tolerance);
        if converged {
            self.phase = CoordinatorPhase::ConvergedSendingDone;
        }
        RoundOutcome {
            round: self.round,
            estimate: self.estimate,
            spread,
            converged,
        }
    }

    /// Workers that have not yet reported in the round in progress.
    pub fn missing_readings(&self) -> Vec<WorkerId> {
        if self.phase != CoordinatorPhase::Iterating {
            return Vec::new();
        }
        self.workers
            .iter()
            .zip(&self.round_readings)
            .filter(|(_, r)| r.is_none())
            .map(|(w, _)| w.worker_id)
            .collect()
    }

    /// After DONE went out: move to `Terminated` and hand back the final state.
    pub fn finish(&mut self) -> Result<CoordinatorReport, CoordinatorError> {
        self.expect_phase(CoordinatorPhase::ConvergedSendingDone)?;
        self.phase = CoordinatorPhase::Terminated;
        Ok(CoordinatorReport {
            rounds: self.round,
            estimate: self.estimate,
            readings: self
                .workers
                .iter()
                .filter_map(|w| w.last_reading.map(|r| (w.worker_id, r)))
                .collect(),
        })
    }

    /// Abort from any phase (interrupt).
    pub fn terminate(&mut self) {
        self.pending = None;
        self.phase = CoordinatorPhase::Terminated;
    }

    fn expect_phase(&self, expected: CoordinatorPhase) -> Result<(), CoordinatorError> {
        if self.phase != expected {
            return Err(CoordinatorError::WrongPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CoordinatorError {
    #[error("worker count must be at least 1")]
    InvalidWorkerCount,
    #[error("operation needs phase {expected:?}, coordinator is {actual:?}")]
    WrongPhase {
        expected: CoordinatorPhase,
        actual: CoordinatorPhase,
    },
    #[error("worker {0} is already registered")]
    DuplicateWorker(WorkerId),
    #[error("handshake with worker {0} still in progress")]
    HandshakeInProgress(WorkerId),
    #[error("no handshake in progress")]
    NoPendingHandshake,
    #[error("ACK from worker {got}, expected {expected}")]
    HandshakeMismatch { expected: WorkerId, got: WorkerId },
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),
    #[error("second reading from worker {worker} in round {round}")]
    DuplicateReading { worker: WorkerId, round: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{Reaction, SeedSource, Worker};

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9
    }

    fn params(n: usize) -> CoordinatorParams {
        CoordinatorParams {
            worker_count: n,
            ..CoordinatorParams::default()
        }
    }

    fn register(c: &mut Coordinator, id: i64) -> u32 {
        c.begin_handshake(WorkerId(id)).unwrap();
        c.complete_handshake(WorkerId(id)).unwrap()
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(matches!(
            Coordinator::new(params(0)),
            Err(CoordinatorError::InvalidWorkerCount)
        ));
    }

    #[test]
    fn registration_completes_after_exactly_n_handshakes() {
        let mut c = Coordinator::new(params(3)).unwrap();
        assert_eq!(register(&mut c, 100), 0);
        assert_eq!(c.phase(), CoordinatorPhase::AwaitingRegistrations);

        // SYN without ACK does not count; its ordinal is reused.
        let syn_ack = c.begin_handshake(WorkerId(200)).unwrap();
        assert_eq!(syn_ack, Message::SynAck { assigned_index: 1 });
        assert!(c.abandon_handshake(WorkerId(200)));
        assert_eq!(c.workers().len(), 1);

        // Duplicate id is refused.
        assert_eq!(
            c.begin_handshake(WorkerId(100)),
            Err(CoordinatorError::DuplicateWorker(WorkerId(100)))
        );

        assert_eq!(register(&mut c, 300), 1);
        assert_eq!(c.phase(), CoordinatorPhase::AwaitingRegistrations);
        assert_eq!(register(&mut c, 400), 2);
        assert_eq!(c.phase(), CoordinatorPhase::Iterating);
        assert!(c.registration_complete());

        let ids: Vec<_> = c.workers().iter().map(|w| w.worker_id.0).collect();
        assert_eq!(ids, vec![100, 300, 400]);
        assert!(c.workers().iter().all(|w| w.last_reading.is_none()));

        // No more registrations once iterating.
        assert!(matches!(
            c.begin_handshake(WorkerId(500)),
            Err(CoordinatorError::WrongPhase { .. })
        ));
    }

    #[test]
    fn ack_must_match_pending_worker() {
        let mut c = Coordinator::new(params(2)).unwrap();
        assert_eq!(
            c.complete_handshake(WorkerId(1)),
            Err(CoordinatorError::NoPendingHandshake)
        );
        c.begin_handshake(WorkerId(1)).unwrap();
        assert_eq!(
            c.begin_handshake(WorkerId(2)),
            Err(CoordinatorError::HandshakeInProgress(WorkerId(1)))
        );
        assert_eq!(
            c.complete_handshake(WorkerId(2)),
            Err(CoordinatorError::HandshakeMismatch {
                expected: WorkerId(1),
                got: WorkerId(2)
            })
        );
        assert!(!c.abandon_handshake(WorkerId(2)));
        assert_eq!(c.complete_handshake(WorkerId(1)), Ok(0));
    }

    #[test]
    fn readings_rejected_before_registration_completes() {
        let mut c = Coordinator::new(params(2)).unwrap();
        register(&mut c, 1);
        assert!(matches!(
            c.record_reading(WorkerId(1), 5.0),
            Err(CoordinatorError::WrongPhase { .. })
        ));
    }

    #[test]
    fn round_barrier_waits_for_every_worker() {
        let mut c = Coordinator::new(params(3)).unwrap();
        for id in 1..=3 {
            register(&mut c, id);
        }
        assert_eq!(c.record_reading(WorkerId(2), 1.0), Ok(None));
        assert_eq!(
            c.record_reading(WorkerId(2), 1.5),
            Err(CoordinatorError::DuplicateReading {
                worker: WorkerId(2),
                round: 1
            })
        );
        assert_eq!(
            c.record_reading(WorkerId(9), 1.0),
            Err(CoordinatorError::UnknownWorker(WorkerId(9)))
        );
        assert_eq!(c.record_reading(WorkerId(1), 2.0), Ok(None));
        assert_eq!(c.missing_readings(), vec![WorkerId(3)]);
        assert_eq!(c.rounds(), 0);
        assert_eq!(c.estimate(), 0.0);

        let outcome = c.record_reading(WorkerId(3), 3.0).unwrap().unwrap();
        assert_eq!(outcome.round, 1);
        assert!(approx(outcome.estimate, 6.0 / 5.0));
        assert!(approx(outcome.spread, 2.0));
        assert!(!outcome.converged);
        assert_eq!(outcome.broadcast(), vec![Message::Reading { value: outcome.estimate }]);
        assert!(c.missing_readings().len() == 3);

        // A new round starts empty: worker 2 may report again.
        assert_eq!(c.record_reading(WorkerId(2), 1.0), Ok(None));
    }

    #[test]
    fn arrival_order_does_not_change_estimate() {
        let readings = [(1, 0.1), (2, 0.7), (3, 1e8), (4, -3.3)];
        let mut forward = Coordinator::new(params(4)).unwrap();
        let mut backward = Coordinator::new(params(4)).unwrap();
        for id in 1..=4 {
            register(&mut forward, id);
            register(&mut backward, id);
        }
        let mut a = None;
        for &(id, v) in &readings {
            a = forward.record_reading(WorkerId(id), v).unwrap();
        }
        let mut b = None;
        for &(id, v) in readings.iter().rev() {
            b = backward.record_reading(WorkerId(id), v).unwrap();
        }
        assert_eq!(a.unwrap().estimate.to_bits(), b.unwrap().estimate.to_bits());
    }

    #[test]
    fn explicit_seed_estimate_is_used() {
        let mut c = Coordinator::new(CoordinatorParams {
            worker_count: 1,
            seed_estimate: 9.0,
            tolerance: DEFAULT_TOLERANCE,
        })
        .unwrap();
        assert_eq!(c.estimate(), 9.0);
        register(&mut c, 1);
        let outcome = c.record_reading(WorkerId(1), 3.0).unwrap().unwrap();
        assert!(approx(outcome.estimate, 7.0));
        // A single worker always agrees with itself.
        assert!(outcome.converged);
    }

    #[test]
    fn done_only_when_spread_within_tolerance() {
        let mut c = Coordinator::new(params(2)).unwrap();
        register(&mut c, 1);
        register(&mut c, 2);

        c.record_reading(WorkerId(1), 5.0).unwrap();
        let o = c.record_reading(WorkerId(2), 5.0 + 2e-4).unwrap().unwrap();
        assert!(!o.converged);
        assert!(!o.broadcast().contains(&Message::Done));
        assert_eq!(c.phase(), CoordinatorPhase::Iterating);
        assert!(matches!(c.finish(), Err(CoordinatorError::WrongPhase { .. })));

        c.record_reading(WorkerId(1), 5.0).unwrap();
        let o = c.record_reading(WorkerId(2), 5.0 + 5e-5).unwrap().unwrap();
        assert!(o.converged);
        assert_eq!(
            o.broadcast(),
            vec![Message::Reading { value: o.estimate }, Message::Done]
        );
        assert_eq!(c.phase(), CoordinatorPhase::ConvergedSendingDone);

        let report = c.finish().unwrap();
        assert_eq!(c.phase(), CoordinatorPhase::Terminated);
        assert_eq!(report.rounds, 2);
        assert_eq!(report.readings, vec![(WorkerId(1), 5.0), (WorkerId(2), 5.0 + 5e-5)]);
    }

    #[test]
    fn terminate_from_any_phase() {
        let mut c = Coordinator::new(params(2)).unwrap();
        c.begin_handshake(WorkerId(1)).unwrap();
        c.terminate();
        assert_eq!(c.phase(), CoordinatorPhase::Terminated);
        c.terminate();
        assert_eq!(c.phase(), CoordinatorPhase::Terminated);
        assert!(c.begin_handshake(WorkerId(2)).is_err());
    }

    /// Drive a coordinator and in-core workers through full rounds, no channels involved.
    fn run_session(seeds: &[f64], seed_estimate: f64) -> (Vec<RoundOutcome>, Vec<Vec<f64>>) {
        let mut c = Coordinator::new(CoordinatorParams {
            worker_count: seeds.len(),
            seed_estimate,
            tolerance: DEFAULT_TOLERANCE,
        })
        .unwrap();
        let mut workers: Vec<Worker> = seeds
            .iter()
            .enumerate()
            .map(|(i, &s)| Worker::new(WorkerId(1000 + i as i64), SeedSource::Fixed(s)))
            .collect();

        let mut outbox: Vec<Message> = Vec::new();
        for w in &mut workers {
            let syn = w.begin_registration().unwrap();
            w.syn_sent().unwrap();
            let Message::Syn { worker_id } = syn else {
                panic!("expected SYN")
            };
            let syn_ack = c.begin_handshake(worker_id).unwrap();
            assert!(matches!(w.on_message(syn_ack), Ok(Reaction::Registered { .. })));
            let [ack, first] = w.acknowledge().unwrap();
            assert_eq!(ack, Message::Ack { worker_id });
            c.complete_handshake(worker_id).unwrap();
            outbox.push(first);
        }

        let mut outcomes = Vec::new();
        let mut trajectory = Vec::new();
        loop {
            trajectory.push(
                outbox
                    .iter()
                    .map(|m| match m {
                        Message::Reading { value } => *value,
                        other => panic!("unexpected {other}"),
                    })
                    .collect::<Vec<_>>(),
            );
            let mut outcome = None;
            for (w, m) in workers.iter().zip(outbox.drain(..)) {
                let Message::Reading { value } = m else {
                    unreachable!()
                };
                outcome = c.record_reading(w.id(), value).unwrap();
            }
            let outcome = outcome.expect("round closes after N readings");
            outcomes.push(outcome);
            for w in &mut workers {
                for m in outcome.broadcast() {
                    match w.on_message(m).unwrap() {
                        Reaction::Reply(reply) => outbox.push(reply),
                        Reaction::Finished => {}
                        other => panic!("unexpected reaction {other:?}"),
                    }
                }
            }
            if outcome.converged {
                assert!(workers.iter().all(|w| w.is_terminated()));
                return (outcomes, trajectory);
            }
            assert!(outcomes.len() < 200, "did not converge");
        }
    }

    #[test]
    fn two_worker_trajectory() {
        let (outcomes, readings) = run_session(&[10.0, 20.0], 0.0);

        assert!(approx(outcomes[0].estimate, 7.5));
        assert!(approx(readings[1][0], 9.0));
        assert!(approx(readings[1][1], 15.0));

        assert!(approx(outcomes[1].estimate, 9.75));
        assert!(approx(readings[2][0], 9.3));
        assert!(approx(readings[2][1], 12.9));

        assert!(approx(outcomes[2].estimate, 10.425));
        assert!(approx(readings[3][0], 9.75));
        assert!(approx(readings[3][1], 11.91));

        // Workers converge; DONE goes out on the first round within tolerance and never earlier.
        let last = outcomes.last().unwrap();
        assert!(last.converged);
        assert!(last.spread <= DEFAULT_TOLERANCE);
        for o in &outcomes[..outcomes.len() - 1] {
            assert!(!o.converged);
            assert!(o.spread > DEFAULT_TOLERANCE);
        }
        // Spread contracts by 3/5 per round.
        for pair in outcomes.windows(2) {
            assert!(approx(pair[1].spread, pair[0].spread * 0.6) || pair[1].spread < 1e-6);
        }
    }

    #[test]
    fn four_worker_reference_seeds_converge() {
        let (outcomes, readings) = run_session(&[100.0, 22.0, 50.0, 40.0], 0.0);
        let last_round = readings.last().unwrap();
        assert!(averaging::is_stable(last_round, DEFAULT_TOLERANCE));
        assert!(outcomes.last().unwrap().converged);
        assert!(outcomes.len() > 3);
    }
}
