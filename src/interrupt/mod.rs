//! Typed out-of-band signalling between agents.
//!
//! An interrupt is a signal code plus payload addressed to one agent.
//! Codes partition into priority bands that determine buffer sizing and
//! delivery semantics: critical signals are persisted and retried by the
//! [`PersistentInterruptQueue`]; everything else rides the in-memory
//! [`InterruptRouter`] best-effort.

pub mod persistent_queue;
pub mod router;

pub use persistent_queue::PersistentInterruptQueue;
pub use router::{InterruptHandler, InterruptRouter, RouterError, SendError};

use crate::domain_types::{AgentId, Timestamp};
use bytes::Bytes;
use nutype::nutype;
use serde::{Deserialize, Serialize};

fn valid_signal_code(code: &u32) -> bool {
    *code <= 49 || *code >= 1000
}

/// A signal code inside the recognised bands.
///
/// Codes 0–49 are the built-in bands; codes ≥ 1000 are custom signals
/// with normal priority. Everything in between is rejected.
#[nutype(
    validate(predicate = valid_signal_code),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct SignalCode(u32);

impl SignalCode {
    /// The raw code.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }

    /// The priority band this code falls in.
    #[must_use]
    pub fn band(&self) -> PriorityBand {
        match self.as_u32() {
            0..=9 => PriorityBand::Critical,
            10..=19 => PriorityBand::High,
            30..=39 => PriorityBand::Low,
            // 20-29, 40-49, and custom codes.
            _ => PriorityBand::Normal,
        }
    }

    /// Whether this code demands guaranteed, persisted delivery.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.band() == PriorityBand::Critical
    }
}

/// Delivery class of a signal code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBand {
    /// Guaranteed delivery, persisted before send acknowledgement.
    Critical,
    /// Best-effort with a large buffer.
    High,
    /// Best-effort with a medium buffer.
    Normal,
    /// Best-effort with a small buffer.
    Low,
}

impl PriorityBand {
    /// Buffer capacity of the per-handler queue for this band.
    #[must_use]
    pub fn buffer_capacity(&self) -> usize {
        match self {
            Self::Critical | Self::High => 10_000,
            Self::Normal => 1_000,
            Self::Low => 100,
        }
    }
}

/// Well-known signal codes.
pub mod signals {
    use super::SignalCode;

    /// Immediately stop all in-progress work. Critical band.
    #[must_use]
    pub fn emergency_stop() -> SignalCode {
        SignalCode::try_new(0).expect("code 0 is in the critical band")
    }

    /// Orderly shutdown request. Critical band.
    #[must_use]
    pub fn shutdown() -> SignalCode {
        SignalCode::try_new(1).expect("code 1 is in the critical band")
    }

    /// Suspend message consumption. High band.
    #[must_use]
    pub fn pause() -> SignalCode {
        SignalCode::try_new(10).expect("code 10 is in the high band")
    }

    /// Resume message consumption. High band.
    #[must_use]
    pub fn resume() -> SignalCode {
        SignalCode::try_new(11).expect("code 11 is in the high band")
    }

    /// Re-read agent configuration. Normal band.
    #[must_use]
    pub fn reload_config() -> SignalCode {
        SignalCode::try_new(20).expect("code 20 is in the normal band")
    }

    /// Report current status. Normal band.
    #[must_use]
    pub fn status_request() -> SignalCode {
        SignalCode::try_new(40).expect("code 40 is in the normal band")
    }

    /// Emit internal diagnostics. Low band.
    #[must_use]
    pub fn debug_dump() -> SignalCode {
        SignalCode::try_new(30).expect("code 30 is in the low band")
    }
}

/// A typed signal addressed to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interrupt {
    /// The signal code, which fully determines priority.
    pub signal: SignalCode,
    /// The agent the signal is addressed to.
    pub target: AgentId,
    /// Opaque payload.
    pub payload: Bytes,
    /// The agent (or external caller id) that raised the signal.
    pub sender: AgentId,
    /// When the signal was raised.
    pub created_at: Timestamp,
    /// Row id of the persisted copy, set when a critical interrupt is
    /// replayed from the persistent queue. Handlers acknowledge with it
    /// after completing the demanded work.
    pub persisted_id: Option<crate::domain_types::InterruptId>,
}

impl Interrupt {
    /// Builds an interrupt stamped with the current time.
    #[must_use]
    pub fn new(signal: SignalCode, target: AgentId, payload: Bytes, sender: AgentId) -> Self {
        Self {
            signal,
            target,
            payload,
            sender,
            created_at: Timestamp::now(),
            persisted_id: None,
        }
    }
}
