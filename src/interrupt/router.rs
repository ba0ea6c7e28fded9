//! In-memory routing of typed signals to registered handlers.
//!
//! Every registered (agent, signal) pair owns a worker task draining a
//! bounded channel sized by the signal's priority band. `send` is a
//! non-blocking enqueue onto that channel; there is no blocking path.
//! Handler panics are caught at the worker boundary so one misbehaving
//! handler cannot take its worker down.
//!
//! Ordering: FIFO per (agent, signal). No ordering across signals for the
//! same agent, and none across agents.

use crate::domain_types::AgentId;
use crate::interrupt::{Interrupt, SignalCode};
use crate::observability::{Tracer, metrics};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors from handler registration and shutdown.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A handler already exists for the (agent, signal) pair.
    #[error("handler already registered for signal {signal} on agent {agent}")]
    AlreadyRegistered { agent: AgentId, signal: SignalCode },

    /// No handler exists for the (agent, signal) pair.
    #[error("handler not registered for signal {signal} on agent {agent}")]
    NotRegistered { agent: AgentId, signal: SignalCode },

    /// The router has been closed.
    #[error("interrupt router is closed")]
    Closed,
}

/// Errors from a send attempt. Every variant means `delivered = false`.
#[derive(Debug, Error)]
pub enum SendError {
    /// No handler is registered for the signal on the target agent.
    #[error("no handler registered for signal {signal} on agent {target}")]
    NoHandler { signal: SignalCode, target: AgentId },

    /// The handler's buffer is saturated.
    #[error("buffer full for signal {signal} on agent {target}")]
    BufferFull { signal: SignalCode, target: AgentId },

    /// The router (or this handler's worker) has shut down.
    #[error("queue closed for signal {signal} on agent {target}")]
    QueueClosed { signal: SignalCode, target: AgentId },
}

/// An interrupt handler bound to one (agent, signal) pair.
#[async_trait]
pub trait InterruptHandler: Send + Sync {
    /// Processes one interrupt. Invoked from the pair's worker task,
    /// serially and in enqueue order.
    async fn handle(&self, interrupt: Interrupt);
}

struct Worker {
    tx: mpsc::Sender<Interrupt>,
    join: JoinHandle<()>,
}

/// In-memory typed signal dispatcher.
pub struct InterruptRouter {
    workers: DashMap<(AgentId, SignalCode), Worker>,
    token: CancellationToken,
    closed: AtomicBool,
    tracer: Arc<dyn Tracer>,
}

impl InterruptRouter {
    /// Creates a router reporting through the given tracer.
    #[must_use]
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self {
            workers: DashMap::new(),
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tracer,
        }
    }

    /// Registers a handler for a (agent, signal) pair and spawns its
    /// worker.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRegistered` if a handler exists for the pair — the
    /// existing handler is left in place — or `Closed` after shutdown.
    pub fn register_handler(
        &self,
        agent: AgentId,
        signal: SignalCode,
        handler: Arc<dyn InterruptHandler>,
    ) -> Result<(), RouterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RouterError::Closed);
        }

        let key = (agent.clone(), signal);
        match self.workers.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RouterError::AlreadyRegistered { agent, signal })
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let capacity = signal.band().buffer_capacity();
                let (tx, rx) = mpsc::channel(capacity);
                let join = Self::spawn_worker(
                    rx,
                    handler,
                    self.token.child_token(),
                    Arc::clone(&self.tracer),
                    agent,
                    signal,
                );
                entry.insert(Worker { tx, join });
                Ok(())
            }
        }
    }

    /// Removes the handler for a (agent, signal) pair. The worker drains
    /// whatever is already buffered, then exits.
    ///
    /// # Errors
    ///
    /// Returns `NotRegistered` if no handler exists for the pair.
    pub fn unregister_handler(
        &self,
        agent: &AgentId,
        signal: SignalCode,
    ) -> Result<(), RouterError> {
        self.workers
            .remove(&(agent.clone(), signal))
            .map(|_| ())
            .ok_or_else(|| RouterError::NotRegistered {
                agent: agent.clone(),
                signal,
            })
    }

    /// Attempts a non-blocking enqueue onto the pair's worker buffer.
    ///
    /// Returns immediately; the handler runs in the worker task. A `Ok`
    /// means the interrupt was accepted for delivery, not that the handler
    /// has run.
    ///
    /// # Errors
    ///
    /// `NoHandler` when nothing is registered, `BufferFull` on saturation,
    /// `QueueClosed` after shutdown. Non-critical callers treat all three
    /// as a drop; the critical path retries through the persistent queue.
    pub fn send(&self, interrupt: Interrupt) -> Result<(), SendError> {
        let signal = interrupt.signal;
        let target = interrupt.target.clone();

        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::QueueClosed { signal, target });
        }

        let Some(worker) = self.workers.get(&(target.clone(), signal)) else {
            return Err(SendError::NoHandler { signal, target });
        };

        match worker.tx.try_send(interrupt) {
            Ok(()) => {
                self.tracer.record_metric(metrics::INTERRUPT_DELIVERED_FAST, 1.0);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.tracer.record_metric(metrics::INTERRUPT_DROPPED, 1.0);
                Err(SendError::BufferFull { signal, target })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(SendError::QueueClosed { signal, target })
            }
        }
    }

    /// Number of registered (agent, signal) pairs.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.workers.len()
    }

    /// Shuts the router down: stops accepting sends, drains every worker
    /// buffer, and waits for in-flight handler invocations to finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(
            handlers = self.workers.len(),
            "closing interrupt router, draining worker buffers"
        );

        // Workers see cancellation, close their receivers, and keep
        // consuming until the buffer is empty.
        self.token.cancel();

        let keys: Vec<_> = self
            .workers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, worker)) = self.workers.remove(&key) {
                drop(worker.tx);
                if let Err(e) = worker.join.await {
                    warn!(error = %e, "interrupt worker terminated abnormally");
                }
            }
        }
    }

    fn spawn_worker(
        mut rx: mpsc::Receiver<Interrupt>,
        handler: Arc<dyn InterruptHandler>,
        token: CancellationToken,
        tracer: Arc<dyn Tracer>,
        agent: AgentId,
        signal: SignalCode,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut draining = false;
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(interrupt) => {
                            let invocation = AssertUnwindSafe(handler.handle(interrupt)).catch_unwind();
                            if invocation.await.is_err() {
                                tracer.record_error(
                                    "interrupt_router",
                                    &format!("handler for signal {signal} on {agent} panicked"),
                                );
                                warn!(%agent, %signal, "interrupt handler panicked; worker continues");
                            }
                        }
                        None => break,
                    },
                    () = token.cancelled(), if !draining => {
                        // Stop accepting new interrupts; recv keeps
                        // yielding what is already buffered until empty.
                        draining = true;
                        rx.close();
                    }
                }
            }
            debug!(%agent, %signal, "interrupt worker terminated");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain_types::AgentId;
    use crate::interrupt::signals;
    use crate::observability::NoopTracer;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;

    fn agent(id: &str) -> AgentId {
        AgentId::try_new(id.to_string()).unwrap()
    }

    fn interrupt(signal: SignalCode, target: &AgentId, payload: &'static [u8]) -> Interrupt {
        Interrupt::new(
            signal,
            target.clone(),
            Bytes::from_static(payload),
            agent("tester"),
        )
    }

    struct Recorder {
        seen: std::sync::Mutex<Vec<Bytes>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl InterruptHandler for Recorder {
        async fn handle(&self, interrupt: Interrupt) {
            self.seen.lock().unwrap().push(interrupt.payload);
        }
    }

    struct Blocking {
        release: Arc<tokio::sync::Semaphore>,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InterruptHandler for Blocking {
        async fn handle(&self, _interrupt: Interrupt) {
            self.release
                .acquire()
                .await
                .expect("release semaphore never closed")
                .forget();
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanicsOnce {
        fired: AtomicBool,
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InterruptHandler for PanicsOnce {
        async fn handle(&self, _interrupt: Interrupt) {
            if !self.fired.swap(true, Ordering::SeqCst) {
                panic!("first invocation blows up");
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_should_reject_second_registration_when_pair_taken() {
        let router = InterruptRouter::new(Arc::new(NoopTracer));
        let alpha = agent("alpha");
        let first = Recorder::new();
        let second = Recorder::new();

        router
            .register_handler(alpha.clone(), signals::pause(), first.clone())
            .unwrap();
        let err = router
            .register_handler(alpha.clone(), signals::pause(), second.clone())
            .unwrap_err();
        assert!(matches!(err, RouterError::AlreadyRegistered { .. }));

        // The original handler still receives sends.
        router
            .send(interrupt(signals::pause(), &alpha, b"one"))
            .unwrap();
        router.close().await;
        assert_eq!(first.seen.lock().unwrap().len(), 1);
        assert!(second.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_should_report_no_handler_when_nothing_registered() {
        let router = InterruptRouter::new(Arc::new(NoopTracer));
        let err = router
            .send(interrupt(signals::pause(), &agent("ghost"), b"x"))
            .unwrap_err();
        assert!(matches!(err, SendError::NoHandler { .. }));
        assert!(err.to_string().contains("no handler"));
    }

    #[tokio::test]
    async fn test_should_fail_unregister_when_pair_absent() {
        let router = InterruptRouter::new(Arc::new(NoopTracer));
        let err = router
            .unregister_handler(&agent("ghost"), signals::pause())
            .unwrap_err();
        assert!(matches!(err, RouterError::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_should_preserve_fifo_when_single_pair_flooded() {
        let router = InterruptRouter::new(Arc::new(NoopTracer));
        let alpha = agent("alpha");
        let recorder = Recorder::new();
        router
            .register_handler(alpha.clone(), signals::reload_config(), recorder.clone())
            .unwrap();

        let payloads: Vec<Bytes> = (0..50).map(|n| Bytes::from(format!("p{n}"))).collect();
        for payload in &payloads {
            router
                .send(Interrupt::new(
                    signals::reload_config(),
                    alpha.clone(),
                    payload.clone(),
                    agent("tester"),
                ))
                .unwrap();
        }

        router.close().await;
        assert_eq!(*recorder.seen.lock().unwrap(), payloads);
    }

    #[tokio::test]
    async fn test_should_return_buffer_full_when_low_band_saturated() {
        let router = InterruptRouter::new(Arc::new(NoopTracer));
        let alpha = agent("alpha");
        let release = Arc::new(tokio::sync::Semaphore::new(0));
        let handled = Arc::new(AtomicUsize::new(0));
        router
            .register_handler(
                alpha.clone(),
                signals::debug_dump(),
                Arc::new(Blocking {
                    release: release.clone(),
                    handled: handled.clone(),
                }),
            )
            .unwrap();

        // The handler blocks, so the buffer fills after at most
        // capacity + 1 sends (one interrupt may be held by the worker).
        let capacity = signals::debug_dump().band().buffer_capacity();
        let mut accepted = 0usize;
        loop {
            match router.send(interrupt(signals::debug_dump(), &alpha, b"fill")) {
                Ok(()) => accepted += 1,
                Err(SendError::BufferFull { .. }) => break,
                Err(other) => panic!("unexpected send error: {other:?}"),
            }
            assert!(accepted <= capacity + 1, "buffer never saturated");
        }
        assert!(accepted >= capacity);

        // Unblock so close() can drain everything that was accepted.
        release.add_permits(accepted);
        router.close().await;
        assert_eq!(handled.load(Ordering::SeqCst), accepted);
    }

    #[tokio::test]
    async fn test_should_keep_worker_alive_when_handler_panics() {
        let router = InterruptRouter::new(Arc::new(NoopTracer));
        let alpha = agent("alpha");
        let seen = Arc::new(AtomicUsize::new(0));
        router
            .register_handler(
                alpha.clone(),
                signals::status_request(),
                Arc::new(PanicsOnce {
                    fired: AtomicBool::new(false),
                    seen: seen.clone(),
                }),
            )
            .unwrap();

        router
            .send(interrupt(signals::status_request(), &alpha, b"boom"))
            .unwrap();
        router
            .send(interrupt(signals::status_request(), &alpha, b"after"))
            .unwrap();

        router.close().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_should_drain_buffered_interrupts_when_closed() {
        let router = InterruptRouter::new(Arc::new(NoopTracer));
        let alpha = agent("alpha");
        let recorder = Recorder::new();
        router
            .register_handler(alpha.clone(), signals::pause(), recorder.clone())
            .unwrap();

        for n in 0..20 {
            router
                .send(Interrupt::new(
                    signals::pause(),
                    alpha.clone(),
                    Bytes::from(format!("n{n}")),
                    agent("tester"),
                ))
                .unwrap();
        }

        // Close must process everything already accepted, not drop it.
        router.close().await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 20);

        let err = router
            .send(interrupt(signals::pause(), &alpha, b"late"))
            .unwrap_err();
        assert!(matches!(err, SendError::QueueClosed { .. }));
    }
}
