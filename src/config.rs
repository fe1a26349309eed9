//! Operation tuning knobs.

use std::time::Duration;

/// Bound on a whole operation, from `execute` to completion.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Delivery attempts (first send plus retries) before an operation fails.
pub const DEFAULT_MAX_NUMBER_OF_LOOKUPS: usize = 5;

#[derive(Clone, Debug)]
pub struct OperationConfig {
    /// Deadline after which an unfinished operation fails.
    pub operation_timeout: Duration,
    /// Cap on message delivery attempts. Bootstrap lookups that resolve to
    /// nothing are retried separately and do not consume this budget.
    pub max_number_of_lookups: usize,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_number_of_lookups: DEFAULT_MAX_NUMBER_OF_LOOKUPS,
        }
    }
}

impl OperationConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_max_lookups(mut self, max: usize) -> Self {
        self.max_number_of_lookups = max;
        self
    }
}
