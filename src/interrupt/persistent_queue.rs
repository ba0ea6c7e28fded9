//! Persistent retry path for critical interrupts.
//!
//! Critical signals must survive router back-pressure, handler absence,
//! and process restarts. Every critical interrupt is persisted before the
//! send is acknowledged; a background loop then replays pending rows
//! against the in-memory router on an exponential backoff schedule until
//! delivery succeeds or retries are exhausted.
//!
//! Acknowledgement is explicit: the handler calls [`PersistentInterruptQueue::acknowledge`]
//! after finishing the work the interrupt demanded. Only acknowledged rows
//! are garbage-collected.

use crate::domain_types::{InterruptId, MaxRetries, RetryBaseMs, Timestamp};
use crate::interrupt::router::InterruptRouter;
use crate::interrupt::{Interrupt, PriorityBand, SignalCode};
use crate::observability::{Tracer, metrics};
use crate::store::{InterruptStore, StoreError};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retry loop period.
const RETRY_TICK: Duration = Duration::from_millis(100);
/// Maximum pending rows processed per cycle.
const RETRY_BATCH: usize = 100;
/// Ceiling of the exponential backoff schedule.
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// How long `close` waits for the background tasks.
const CLOSE_GRACE: Duration = Duration::from_secs(30);

/// Errors from the persistent queue.
#[derive(Debug, Error)]
pub enum PersistentQueueError {
    /// The interrupt is not in the critical band.
    #[error("signal {signal} is not critical; use the router directly")]
    NotCritical { signal: SignalCode },

    /// Store failure; the caller may retry.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Delay before attempt `attempt` (0-based), capped at 30 s.
#[must_use]
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    base.checked_mul(u32::try_from(factor).unwrap_or(u32::MAX))
        .map_or(BACKOFF_CAP, |delay| delay.min(BACKOFF_CAP))
}

/// Time after row creation at which attempt `retry_count` becomes
/// eligible: the sum of all backoff delays up to and including it.
#[must_use]
pub fn cumulative_delay(base: Duration, retry_count: u32) -> Duration {
    (0..=retry_count).fold(Duration::ZERO, |total, attempt| {
        total.saturating_add(backoff_delay(base, attempt))
    })
}

/// Guaranteed-delivery queue for critical interrupts.
pub struct PersistentInterruptQueue {
    store: Arc<dyn InterruptStore>,
    router: Arc<InterruptRouter>,
    tracer: Arc<dyn Tracer>,
    retry_max: MaxRetries,
    retry_base: RetryBaseMs,
    gc_interval: Duration,
    ack_ttl: Duration,
    // Serialises attempt cycles across the retry loop and manual pumps.
    cycle_lock: Mutex<()>,
    token: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl PersistentInterruptQueue {
    /// Creates a queue over the given store and router.
    #[must_use]
    pub fn new(
        store: Arc<dyn InterruptStore>,
        router: Arc<InterruptRouter>,
        tracer: Arc<dyn Tracer>,
        retry_max: MaxRetries,
        retry_base: RetryBaseMs,
        gc_interval: Duration,
        ack_ttl: Duration,
    ) -> Self {
        Self {
            store,
            router,
            tracer,
            retry_max,
            retry_base,
            gc_interval,
            ack_ttl,
            cycle_lock: Mutex::new(()),
            token: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Persists a critical interrupt for retried delivery and returns its
    /// row id. The row is durable before this returns.
    ///
    /// # Errors
    ///
    /// `NotCritical` for signals outside the critical band; `Store` on
    /// persistence failure.
    pub async fn enqueue(&self, interrupt: &Interrupt) -> Result<InterruptId, PersistentQueueError> {
        if interrupt.signal.band() != PriorityBand::Critical {
            return Err(PersistentQueueError::NotCritical {
                signal: interrupt.signal,
            });
        }
        let id = self
            .store
            .enqueue(interrupt, self.retry_max.as_u32())
            .await?;
        debug!(interrupt_id = %id, signal = %interrupt.signal, target = %interrupt.target,
               "critical interrupt persisted");
        Ok(id)
    }

    /// Records that the handler completed the work the interrupt demanded,
    /// moving the row delivered -> acknowledged.
    ///
    /// # Errors
    ///
    /// `Store` when the row is missing or not in the delivered state.
    pub async fn acknowledge(&self, id: InterruptId) -> Result<(), PersistentQueueError> {
        self.store.acknowledge(id, Timestamp::now()).await?;
        Ok(())
    }

    /// Starts the retry loop and the acknowledged-row GC sweep.
    pub fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("persistent interrupt queue already running");
            return;
        }

        let retry = Arc::clone(self);
        let retry_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRY_TICK);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = retry.attempt_cycle().await {
                            warn!(error = %e, "interrupt retry cycle failed");
                        }
                    }
                    () = retry.token.cancelled() => break,
                }
            }
            debug!("interrupt retry loop terminated");
        });

        let gc = Arc::clone(self);
        let gc_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(gc.gc_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = Timestamp::now().minus(gc.ack_ttl);
                        match gc.store.clear_old(cutoff).await {
                            Ok(0) => {}
                            Ok(removed) => debug!(removed, "collected acknowledged interrupts"),
                            Err(e) => warn!(error = %e, "interrupt GC sweep failed"),
                        }
                    }
                    () = gc.token.cancelled() => break,
                }
            }
            debug!("interrupt GC loop terminated");
        });

        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        tasks.push(retry_task);
        tasks.push(gc_task);
        info!("persistent interrupt queue started");
    }

    /// Runs one attempt cycle: snapshot up to 100 oldest pending rows,
    /// then attempt each eligible one against the router.
    ///
    /// The snapshot is collected before any attempt so no store cursor is
    /// held across the writes that attempts produce.
    ///
    /// # Errors
    ///
    /// `Store` when the snapshot cannot be read; per-row write failures
    /// are logged and do not abort the cycle.
    pub async fn attempt_cycle(&self) -> Result<(), PersistentQueueError> {
        let _cycle = self.cycle_lock.lock().await;

        let snapshot = self.store.list_pending(RETRY_BATCH).await?;
        if snapshot.is_empty() {
            return Ok(());
        }

        let now = Timestamp::now();
        let base = self.retry_base.as_duration();

        for row in snapshot {
            if self.token.is_cancelled() {
                break;
            }
            let eligible_at = row.created_at.plus(cumulative_delay(base, row.retry_count));
            if now < eligible_at {
                continue;
            }

            match self.router.send(row.to_interrupt()) {
                Ok(()) => {
                    self.tracer
                        .record_metric(metrics::INTERRUPT_DELIVERED_SLOW, 1.0);
                    if let Err(e) = self.store.mark_delivered(row.id, Timestamp::now()).await {
                        warn!(interrupt_id = %row.id, error = %e,
                              "delivered interrupt could not be recorded");
                    }
                }
                Err(send_err) => {
                    self.tracer.record_metric(metrics::INTERRUPT_RETRIED, 1.0);
                    let reason = send_err.to_string();
                    match self.store.increment_retry(row.id, &reason).await {
                        Ok(count) if count >= row.max_retries => {
                            warn!(interrupt_id = %row.id, retries = count,
                                  "critical interrupt exhausted retries");
                            if let Err(e) = self.store.mark_failed(row.id, &reason).await {
                                warn!(interrupt_id = %row.id, error = %e,
                                      "failed interrupt could not be recorded");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(interrupt_id = %row.id, error = %e,
                                  "retry count could not be recorded");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Stops the background loops, waiting up to 30 s for the current
    /// cycle to finish.
    pub async fn close(&self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("task list lock poisoned");
            guard.drain(..).collect()
        };
        let shutdown = futures::future::join_all(tasks);
        if tokio::time::timeout(CLOSE_GRACE, shutdown).await.is_err() {
            warn!("persistent interrupt queue tasks did not stop within grace period");
        }
        info!("persistent interrupt queue closed");
    }
}
