use tokio::time::Instant;
use uuid::Uuid;

use crate::{OperationError, ServerAddress};

/// Per-invocation state of one logical operation.
#[derive(Debug)]
pub struct OperationContext {
    pub operation_id: Uuid,
    /// The server the current attempt went to, if it got that far
    pub selected: Option<ServerAddress>,
    pub retry_count: u32,
    pub deadline: Option<Instant>,
}

impl OperationContext {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            operation_id: Uuid::new_v4(),
            selected: None,
            retry_count: 0,
            deadline,
        }
    }

    /// Whether waiting `backoff` would run past the deadline.
    pub fn would_overrun(&self, backoff: std::time::Duration) -> bool {
        self.deadline
            .map(|deadline| Instant::now() + backoff > deadline)
            .unwrap_or(false)
    }
}

/// What one attempt came to. The retry loop only ever looks at this.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Success(T),
    Retryable(OperationError),
    Fatal(OperationError),
}

impl<T> From<Result<T, OperationError>> for AttemptOutcome<T> {
    fn from(result: Result<T, OperationError>) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable(e),
            Err(e) => AttemptOutcome::Fatal(e),
        }
    }
}
