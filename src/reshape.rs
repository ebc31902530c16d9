//! # Reshape Orchestrator
//!
//! Reconfigures an existing, possibly non-empty queue into the retry topology
//! without losing a message. Five phases, strictly sequential:
//!
//! 1. **Probe**: passive-declare the queue, read its type.
//! 2. **Drain**: pull every message into memory.
//! 3. **Topology**: install the ancillary retry entities.
//! 4. **Re-home**: delete the old queue (AMQP first, management API when the
//!    broker refuses) and redeclare it with its dead-letter exchange.
//! 5. **Restore**: republish the batch under per-message confirms.
//!
//! Some brokers close the channel after a conflicting passive declare or a
//! deletion, so phases 3, 4 and 5 each start on a fresh session.
//!
//! From the moment the drain captures a message until the restore confirms
//! the last one, the in-memory batch is the only copy of that data. Failures
//! in that window end in [`AmqpError::CriticalHold`], which names the queue
//! and the number of messages still held; nothing is cleaned up, and recovery
//! is manual.

use crate::{
    channel::Session,
    config::{AmqpConfig, RetryConfig},
    drain::{drain, SavedMessage},
    errors::AmqpError,
    management::ManagementClient,
    publisher::publish_all,
    queue::{QueueDefinition, QueueType},
    reshape::ReshapeState::*,
    topology::{declare_main_with_dlx, RetryTopology, Topology},
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Progress point reported to the caller during a reshape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReshapePhase {
    Probe,
    Drain,
    Topology,
    Rehome,
    Restore,
}

/// Where a reshape stands. States are ordered; cancellation is only accepted
/// while no message is held in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReshapeState {
    Idle,
    Probed,
    Drained,
    TopologyReady,
    MainReady,
    Done,
    /// Terminal: unrestored messages remain in memory, human intervention
    /// required.
    CriticalHold,
}

impl ReshapeState {
    /// Whether a cancel signal is still honoured in this state. Once any
    /// message is held (state >= `Drained`) cancellation is declined and the
    /// reshape runs to completion or to `CriticalHold`.
    pub fn accepts_cancellation(&self) -> bool {
        matches!(self, Idle | Probed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Done | CriticalHold)
    }
}

/// Summary of a finished reshape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapeReport {
    pub queue: String,
    pub original_type: QueueType,
    /// Messages drained out of the old queue.
    pub drained: usize,
    /// Messages confirmed back into the new queue.
    pub restored: usize,
    /// The drain stopped early and the batch is incomplete.
    pub partial_drain: bool,
    /// The main queue came back without its dead-letter exchange.
    pub degraded_main: bool,
}

/// Installs and reshapes retry topologies for one broker.
///
/// Each operation owns its sessions exclusively; running several reshapers
/// against different queues is fine, two agents reshaping the same queue is
/// not (concurrent declarations surface as conflicts and abort).
pub struct Reshaper {
    cfg: AmqpConfig,
    retry: RetryConfig,
}

impl Reshaper {
    pub fn new(cfg: AmqpConfig, retry: RetryConfig) -> Result<Reshaper, AmqpError> {
        cfg.validate()?;
        retry.validate()?;
        Ok(Reshaper { cfg, retry })
    }

    /// Installs the retry topology around a queue that does not exist yet:
    /// the ancillary entities, then the main queue with its dead-letter
    /// exchange. A queue that already exists without the dead-letter argument
    /// makes the final declare conflict; use [`Reshaper::reshape`] for those,
    /// empty or not.
    pub async fn setup(&self, queue: &str, queue_type: QueueType) -> Result<(), AmqpError> {
        info!(queue, "setting up retry topology");

        let session = Session::open(&self.cfg).await?;
        let topology = RetryTopology::new(queue, self.retry);
        topology.install(&session).await?;
        declare_main_with_dlx(&session, queue, queue_type).await?;
        session.close().await;

        info!(queue, "retry topology ready");
        Ok(())
    }

    /// Reshapes an existing queue into the retry topology, preserving every
    /// message in flight.
    ///
    /// `cancel` is checked before the probe and during the drain until the
    /// first message is captured; after that the signal is declined. Progress
    /// callbacks fire during the drain and restore phases with
    /// `(phase, current, total)`.
    pub async fn reshape<F>(
        &self,
        queue: &str,
        cancel: Option<&AtomicBool>,
        mut on_progress: F,
    ) -> Result<ReshapeReport, AmqpError>
    where
        F: FnMut(ReshapePhase, usize, usize),
    {
        let reshape_id = Uuid::new_v4();
        info!(%reshape_id, queue, "starting reshape");

        let mut state = Idle;

        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) && state.accepts_cancellation() {
                return Err(AmqpError::Cancelled);
            }
        }

        // phase 1: probe
        let session = Session::open(&self.cfg).await?;
        let probe = session.passive_declare_queue(queue).await?;
        let original_type = self.probe_queue_type(queue).await?;
        state = Probed;
        debug!(
            %reshape_id,
            queue,
            state = ?state,
            messages_ready = probe.messages_ready,
            queue_type = original_type.as_str(),
            "queue probed"
        );
        on_progress(ReshapePhase::Probe, 0, probe.messages_ready as usize);

        // phase 2: drain
        let report = drain(&session, queue, cancel, |current, total| {
            on_progress(ReshapePhase::Drain, current, total)
        })
        .await?;
        let saved = report.messages;
        let partial_drain = report.failure.is_some();

        if let Some(failure) = report.failure {
            if saved.is_empty() {
                // nothing held yet, so the error can propagate cleanly
                session.close().await;
                return Err(failure);
            }
            warn!(
                %reshape_id,
                queue,
                error = failure.to_string(),
                captured = saved.len(),
                "drain stopped early; continuing with the partial batch"
            );
        }
        state = Drained;
        info!(
            %reshape_id,
            queue,
            state = ?state,
            drained = saved.len(),
            "messages saved in memory"
        );
        session.close().await;

        // phases 3-5 hold the only copy of the batch; any failure is terminal
        let outcome = self
            .rebuild(queue, original_type, &saved, &mut state, &mut on_progress)
            .await;

        match outcome {
            Ok(degraded_main) => {
                state = Done;
                debug!(%reshape_id, queue, state = ?state, "reshape complete");
                Ok(ReshapeReport {
                    queue: queue.to_owned(),
                    original_type,
                    drained: saved.len(),
                    restored: saved.len(),
                    partial_drain,
                    degraded_main,
                })
            }
            Err(err) => {
                state = CriticalHold;
                let held = unrestored(&err, saved.len());
                error!(
                    %reshape_id,
                    queue,
                    state = ?state,
                    error = err.to_string(),
                    held,
                    "reshape halted; saved messages were NOT restored"
                );
                Err(AmqpError::CriticalHold {
                    queue: queue.to_owned(),
                    held,
                    cause: err.to_string(),
                })
            }
        }
    }

    /// Phases 3 to 5: topology, re-home, restore. Returns whether the main
    /// queue came back degraded (without its dead-letter exchange).
    async fn rebuild<F>(
        &self,
        queue: &str,
        original_type: QueueType,
        saved: &[SavedMessage],
        state: &mut ReshapeState,
        on_progress: &mut F,
    ) -> Result<bool, AmqpError>
    where
        F: FnMut(ReshapePhase, usize, usize),
    {
        // phase 3: ancillary topology, on a fresh session
        let session = Session::open(&self.cfg).await?;
        let topology = RetryTopology::new(queue, self.retry);
        topology.install(&session).await?;
        *state = TopologyReady;
        debug!(queue, state = ?state, "ancillary entities declared");
        on_progress(ReshapePhase::Topology, 1, 1);
        session.close().await;

        // phase 4: re-home the main queue
        let degraded_main = self.rehome_main(queue, original_type).await?;
        *state = MainReady;
        debug!(queue, state = ?state, degraded_main, "main queue recreated");
        on_progress(ReshapePhase::Rehome, 1, 1);

        // phase 5: restore the batch, on a fresh session
        let session = Session::open(&self.cfg).await?;
        publish_all(&session, queue, saved, |current, total| {
            on_progress(ReshapePhase::Restore, current, total)
        })
        .await?;
        session.close().await;

        Ok(degraded_main)
    }

    /// Deletes the old main queue and declares the new one with its
    /// dead-letter exchange. The AMQP delete goes first; when the broker
    /// refuses it (argument conflicts close the channel), the management API
    /// removes the queue unconditionally. If even the DLX declare fails, a
    /// plain queue of the original type is declared so the saved batch has a
    /// destination. Degraded, but not lost.
    async fn rehome_main(&self, queue: &str, original_type: QueueType) -> Result<bool, AmqpError> {
        let session = Session::open(&self.cfg).await?;
        if let Err(err) = session.delete_queue(queue, false, false).await {
            warn!(
                error = err.to_string(),
                queue, "amqp delete refused; forcing removal via the management api"
            );
            let mgmt = ManagementClient::new(&self.cfg);
            match mgmt.delete_queue(&self.cfg.normalized_vhost(), queue).await {
                Ok(()) | Err(AmqpError::QueueNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        session.close().await;

        // the channel may be gone after the delete; declare on a fresh session
        let session = Session::open(&self.cfg).await?;
        match declare_main_with_dlx(&session, queue, original_type).await {
            Ok(()) => {
                session.close().await;
                Ok(false)
            }
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue, "declare with dead-letter exchange failed; restoring a plain queue"
                );
                session.close().await;

                let session = Session::open(&self.cfg).await?;
                let plain = QueueDefinition::new(queue).durable().queue_type(original_type);
                session.declare_queue(&plain).await?;
                session.close().await;
                Ok(true)
            }
        }
    }

    /// Reads the queue type from the management record. The AMQP probe cannot
    /// see the type, and the original instance must be recreated as what it
    /// was. When the management surface is unavailable (anything but a clean
    /// not-found) the type falls back to classic with a warning.
    async fn probe_queue_type(&self, queue: &str) -> Result<QueueType, AmqpError> {
        let mgmt = ManagementClient::new(&self.cfg);
        match mgmt.get_queue(&self.cfg.normalized_vhost(), queue).await {
            Ok(record) => Ok(QueueType::parse(&record.queue_type)),
            Err(AmqpError::QueueNotFound(name)) => Err(AmqpError::QueueNotFound(name)),
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    queue, "management record unavailable; assuming a classic queue"
                );
                Ok(QueueType::Classic)
            }
        }
    }
}

/// How many of `total` saved messages are still unrestored when `err` stopped
/// the rebuild. Publish failures name the 1-based failing message, and every
/// message before it was already confirmed back into the queue; any other
/// failure leaves the whole batch in memory.
fn unrestored(err: &AmqpError, total: usize) -> usize {
    match err {
        AmqpError::BrokerNack { index }
        | AmqpError::ConfirmTimeout { index }
        | AmqpError::PublishingError { index } => total.saturating_sub(index - 1),
        _ => total,
    }
}
