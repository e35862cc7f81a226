//! Monitoring callbacks invoked by the client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::store::StoreError;

type StatusHook = Arc<dyn Fn(bool) + Send + Sync>;
type StartHook = Arc<dyn Fn(&str) + Send + Sync>;
type EndHook = Arc<dyn Fn(&str, Duration, Option<&StoreError>) + Send + Sync>;
type RetryHook = Arc<dyn Fn(&str, u32, &StoreError) + Send + Sync>;
type RecoveryStartHook = Arc<dyn Fn(&str) + Send + Sync>;
type RecoveryEndHook = Arc<dyn Fn(bool, Duration) + Send + Sync>;

/// Optional observers for connection and operation events.
///
/// Hooks run inline on the calling task and must not block.
#[derive(Clone, Default)]
pub struct MonitoringHooks {
    pub(crate) on_connection_status_change: Option<StatusHook>,
    pub(crate) on_operation_start: Option<StartHook>,
    pub(crate) on_operation_end: Option<EndHook>,
    pub(crate) on_retry_attempt: Option<RetryHook>,
    pub(crate) on_recovery_start: Option<RecoveryStartHook>,
    pub(crate) on_recovery_end: Option<RecoveryEndHook>,
}

impl fmt::Debug for MonitoringHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringHooks")
            .field("on_connection_status_change", &self.on_connection_status_change.is_some())
            .field("on_operation_start", &self.on_operation_start.is_some())
            .field("on_operation_end", &self.on_operation_end.is_some())
            .field("on_retry_attempt", &self.on_retry_attempt.is_some())
            .field("on_recovery_start", &self.on_recovery_start.is_some())
            .field("on_recovery_end", &self.on_recovery_end.is_some())
            .finish()
    }
}

impl MonitoringHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `true` when the connection comes back, `false` when lost.
    pub fn on_connection_status_change(mut self, hook: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_connection_status_change = Some(Arc::new(hook));
        self
    }

    pub fn on_operation_start(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_operation_start = Some(Arc::new(hook));
        self
    }

    /// Called with the operation name, total latency and the final error.
    pub fn on_operation_end(
        mut self,
        hook: impl Fn(&str, Duration, Option<&StoreError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_operation_end = Some(Arc::new(hook));
        self
    }

    /// Called before each backoff sleep with the failed attempt number.
    pub fn on_retry_attempt(mut self, hook: impl Fn(&str, u32, &StoreError) + Send + Sync + 'static) -> Self {
        self.on_retry_attempt = Some(Arc::new(hook));
        self
    }

    /// Called with the reason recovery started.
    pub fn on_recovery_start(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_recovery_start = Some(Arc::new(hook));
        self
    }

    /// Called with the recovery result and how long it took.
    pub fn on_recovery_end(mut self, hook: impl Fn(bool, Duration) + Send + Sync + 'static) -> Self {
        self.on_recovery_end = Some(Arc::new(hook));
        self
    }

    pub(crate) fn connection_status_changed(&self, connected: bool) {
        if let Some(hook) = &self.on_connection_status_change {
            hook(connected);
        }
    }

    pub(crate) fn operation_started(&self, operation: &str) {
        if let Some(hook) = &self.on_operation_start {
            hook(operation);
        }
    }

    pub(crate) fn operation_ended(&self, operation: &str, latency: Duration, error: Option<&StoreError>) {
        if let Some(hook) = &self.on_operation_end {
            hook(operation, latency, error);
        }
    }

    pub(crate) fn retry_attempted(&self, operation: &str, attempt: u32, error: &StoreError) {
        if let Some(hook) = &self.on_retry_attempt {
            hook(operation, attempt, error);
        }
    }

    pub(crate) fn recovery_started(&self, reason: &str) {
        if let Some(hook) = &self.on_recovery_start {
            hook(reason);
        }
    }

    pub(crate) fn recovery_ended(&self, recovered: bool, elapsed: Duration) {
        if let Some(hook) = &self.on_recovery_end {
            hook(recovered, elapsed);
        }
    }
}
