use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Stable classification attached to every error that crosses a component
/// boundary. The orchestrator decides user-visible behavior from the kind
/// alone, never from the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad arguments or malformed task shape. Never retried.
    Validation,
    /// Tool outside the allowed set, or denied by the user. Never retried.
    Permission,
    /// Provider returned 429. Retried inside the model client only.
    RateLimited,
    /// 502/503/connection reset. Retried inside the model client only.
    TransientIo,
    /// A deadline elapsed.
    Timeout,
    /// Tool-specific failure (file-not-found, command-not-found, parse).
    Tool,
    /// A mandatory token category hit its cap.
    Budget,
    /// Database unreadable or snapshot invalid.
    Corruption,
}

impl ErrorKind {
    /// Whether the model client is allowed to retry this kind internally.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::TransientIo)
    }
}

/// Implemented by every crate-level error enum so callers can classify
/// without matching on foreign variants.
pub trait Kinded {
    fn kind(&self) -> ErrorKind;
}
