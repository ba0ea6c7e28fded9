//! Strongly-typed domain values shared across the fabric.
//!
//! Identifiers, capacities, and timing values are modeled as `nutype`
//! newtypes so invalid values are rejected at construction rather than
//! deep inside a queue or retry loop.

use nutype::nutype;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

fn valid_agent_id(id: &str) -> bool {
    if id.is_empty() || id.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = id.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        // Bare id: `alpha`
        (Some(bare), None, None) => !bare.is_empty(),
        // Composite id: `workflow:member`
        (Some(workflow), Some(member), None) => !workflow.is_empty() && !member.is_empty(),
        _ => false,
    }
}

/// An agent identifier, either bare (`alpha`) or composite
/// (`planner:analyst`).
///
/// Composite ids denote an agent instance scoped to a workflow. The id
/// stays a string at every boundary so it round-trips over the wire; the
/// accessors below parse it internally.
#[nutype(
    validate(predicate = valid_agent_id),
    derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize, AsRef, TryFrom, Into)
)]
pub struct AgentId(String);

impl AgentId {
    /// Builds a composite id scoped to a workflow.
    ///
    /// # Errors
    ///
    /// Returns the `nutype` validation error when either part is empty or
    /// contains `:` / whitespace.
    pub fn composite(workflow: &str, member: &str) -> Result<Self, AgentIdError> {
        Self::try_new(format!("{workflow}:{member}"))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }

    /// Whether this id is scoped to a workflow.
    #[must_use]
    pub fn is_composite(&self) -> bool {
        self.as_str().contains(':')
    }

    /// The workflow scope of a composite id, or `None` for a bare id.
    #[must_use]
    pub fn workflow_scope(&self) -> Option<&str> {
        self.as_str().split_once(':').map(|(workflow, _)| workflow)
    }

    /// The member part of a composite id, or the whole id when bare.
    #[must_use]
    pub fn member(&self) -> &str {
        self.as_str()
            .split_once(':')
            .map_or(self.as_str(), |(_, member)| member)
    }
}

/// Unique identifier for a queued message.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new random message id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a persisted critical interrupt.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct InterruptId(Uuid);

impl InterruptId {
    /// Creates a new random interrupt id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a workflow instance.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Creates a new random workflow id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Per-agent conversation session identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// A broadcast topic name.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize, AsRef, TryFrom, Into)
)]
pub struct TopicName(String);

impl TopicName {
    /// Returns the topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.as_ref()
    }
}

/// Millisecond-precision wall-clock timestamp.
///
/// Stored as unix milliseconds so the persistent store can compare and
/// index timestamps without format conversions.
#[nutype(derive(
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
    From,
    Into
))]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self::new(i64::try_from(millis).unwrap_or(i64::MAX))
    }

    /// Unix milliseconds.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.into_inner()
    }

    /// This timestamp shifted forward by `duration`.
    #[must_use]
    pub fn plus(&self, duration: Duration) -> Self {
        let delta = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self::new(self.as_millis().saturating_add(delta))
    }

    /// This timestamp shifted backward by `duration`.
    #[must_use]
    pub fn minus(&self, duration: Duration) -> Self {
        let delta = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self::new(self.as_millis().saturating_sub(delta))
    }
}

/// Capacity of a bounded in-memory channel.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct ChannelCapacity(usize);

impl ChannelCapacity {
    /// Gets the value as usize for use with tokio channels.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum delivery attempts for a critical interrupt.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 50
)]
pub struct MaxRetries(u32);

impl MaxRetries {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Base delay of the exponential retry schedule, in milliseconds.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 30_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 100
)]
pub struct RetryBaseMs(u64);

impl RetryBaseMs {
    /// Converts to a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }

    /// Gets the value as u64.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Seconds after which an unacknowledged in-flight message reverts to
/// pending.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 30
)]
pub struct VisibilityTimeoutSecs(u64);

impl VisibilityTimeoutSecs {
    /// Converts to a `Duration`.
    #[must_use]
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.into_inner())
    }
}

/// Capacity of the global LLM concurrency semaphore.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 64),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2
)]
pub struct ConcurrencyLimit(usize);

impl ConcurrencyLimit {
    /// Gets the value as usize for semaphore construction.
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Maximum pending messages per recipient before enqueue is refused.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct InboxLimit(u64);

impl InboxLimit {
    /// Gets the value as u64.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Dequeue count past which a message is flagged as a poison suspect.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct PoisonThreshold(u32);

impl PoisonThreshold {
    /// Gets the value as u32.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Size of the SQLite connection pool.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 100),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10
)]
pub struct ConnectionPoolSize(u32);

impl ConnectionPoolSize {
    /// Gets the value as u32 for pool construction.
    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}
