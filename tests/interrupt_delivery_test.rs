//! End-to-end interrupt delivery: the in-memory fast path and the
//! persistent critical path with retries and acknowledgement.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use weft::{
    AgentId, Fabric, FabricConfig, FabricError, Interrupt, InterruptHandler, RetryBaseMs,
    RouterError, ScriptedClient, SendError, SendOutcome, signals,
};

fn agent(id: &str) -> AgentId {
    AgentId::try_new(id.to_string()).unwrap()
}

async fn fabric_in(dir: &TempDir) -> Arc<Fabric> {
    let config = FabricConfig::builder()
        .store_path(dir.path().join("interrupts.db"))
        .retry_base(RetryBaseMs::try_new(50).unwrap())
        .build()
        .unwrap();
    Fabric::new(config, ScriptedClient::echo()).await.unwrap()
}

/// Forwards each received interrupt into a channel for the test body.
struct Forwarding {
    tx: mpsc::UnboundedSender<Interrupt>,
}

#[async_trait]
impl InterruptHandler for Forwarding {
    async fn handle(&self, interrupt: Interrupt) {
        let _ = self.tx.send(interrupt);
    }
}

#[test_log::test(tokio::test)]
async fn test_should_dispatch_immediately_when_signal_not_critical() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_in(&dir).await;
    let alpha = agent("alpha");
    let (tx, mut rx) = mpsc::unbounded_channel();

    fabric
        .register_interrupt_handler(alpha.clone(), signals::pause(), Arc::new(Forwarding { tx }))
        .unwrap();

    let outcome = fabric
        .send_interrupt(
            signals::pause(),
            &alpha,
            Bytes::from_static(b"hold"),
            &agent("operator"),
        )
        .await
        .unwrap();
    assert_eq!(outcome, SendOutcome::Dispatched);

    let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.payload, Bytes::from_static(b"hold"));
    assert!(received.persisted_id.is_none());

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_report_drop_when_no_handler_for_noncritical_signal() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_in(&dir).await;

    let err = fabric
        .send_interrupt(
            signals::pause(),
            &agent("ghost"),
            Bytes::new(),
            &agent("operator"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FabricError::InterruptSend(SendError::NoHandler { .. })
    ));

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_retry_critical_interrupt_until_delivered_and_acknowledged() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_in(&dir).await;
    fabric.start();
    let alpha = agent("alpha");

    // No handler yet: the send still succeeds because the critical path
    // persists the interrupt before acknowledging.
    let outcome = fabric
        .send_interrupt(
            signals::emergency_stop(),
            &alpha,
            Bytes::from_static(b"halt everything"),
            &agent("operator"),
        )
        .await
        .unwrap();
    let id = match outcome {
        SendOutcome::Enqueued(id) => id,
        other => panic!("critical interrupt should be enqueued, got {other:?}"),
    };

    // Let a few retry attempts fail against the missing handler.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The handler appears; the retry loop delivers within a few cycles.
    let (tx, mut rx) = mpsc::unbounded_channel();
    fabric
        .register_interrupt_handler(
            alpha.clone(),
            signals::emergency_stop(),
            Arc::new(Forwarding { tx }),
        )
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("retry loop should deliver the critical interrupt")
        .unwrap();
    assert_eq!(delivered.payload, Bytes::from_static(b"halt everything"));
    assert_eq!(delivered.persisted_id, Some(id));

    // Handler acknowledgement completes the lifecycle; a second ack is
    // rejected because the row is no longer in the delivered state.
    fabric.ack_interrupt(id).await.unwrap();
    assert!(fabric.ack_interrupt(id).await.is_err());

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_reject_duplicate_registration_when_pair_taken() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_in(&dir).await;
    let alpha = agent("alpha");
    let (tx, _rx) = mpsc::unbounded_channel();
    let (tx2, _rx2) = mpsc::unbounded_channel();

    fabric
        .register_interrupt_handler(alpha.clone(), signals::resume(), Arc::new(Forwarding { tx }))
        .unwrap();
    let err = fabric
        .register_interrupt_handler(
            alpha.clone(),
            signals::resume(),
            Arc::new(Forwarding { tx: tx2 }),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        FabricError::Router(RouterError::AlreadyRegistered { .. })
    ));

    // Unregistering twice reports the absence.
    fabric
        .unregister_interrupt_handler(&alpha, signals::resume())
        .unwrap();
    let err = fabric
        .unregister_interrupt_handler(&alpha, signals::resume())
        .unwrap_err();
    assert!(matches!(
        err,
        FabricError::Router(RouterError::NotRegistered { .. })
    ));

    fabric.shutdown().await;
}
