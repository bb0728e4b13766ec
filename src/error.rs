// =============================================================================
// Component-boundary error taxonomy
// =============================================================================
//
// Two tiers, matching the rest of the engine: a small `thiserror`-derived enum
// at each component boundary that callers match on, bubbled up through
// `anyhow::Context` everywhere components are glued together (handlers,
// supervisor startup).

use thiserror::Error;

/// Errors surfaced by an `ExchangeClient` implementation.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),
}

impl ExchangeError {
    /// Whether a caller should retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::TransientNetwork(_) | ExchangeError::RateLimited(_))
    }
}

/// Why the SignalDispatcher declined to open a position.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("auto-trading disabled for this instrument")]
    AutoTradingDisabled,

    #[error("a dispatch is already open or pending for this coin")]
    PositionAlreadyOpenOrPending,

    #[error("duplicate alert_id")]
    Duplicate,

    #[error("size truncated to zero")]
    SizeZero,

    #[error("risk check failed: {0}")]
    RiskRejected(String),

    #[error("entry order was not filled")]
    EntryNotFilled,
}

/// Outcome of a single SignalDispatcher pipeline run.
#[derive(Debug)]
pub enum DispatchOutcome {
    Success { position_coin: String },
    Rejected { reason: RejectReason },
    /// Stop-loss placement failed but the rollback market order closed the
    /// entry cleanly (§8 scenario 3) — no position, no unprotected exposure,
    /// just a surfaced error. Distinct from `CriticalProtectionFailure`,
    /// which is reserved for the case where rollback *also* failed.
    EntryRolledBack { error: String },
    CriticalProtectionFailure { error: String },
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Success { .. })
    }
}
