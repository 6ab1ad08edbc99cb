use std::time::Duration;

/// Timing knobs for the orchestrator.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Gap between job status checks while waiting for readiness.
    pub poll_interval: Duration,
    /// Pre-warm lead used when the caller does not give one.
    pub default_lead: Duration,
    /// Pause before the single cancellation retry.
    pub cancel_retry_delay: Duration,
    /// When set, a reported endpoint must accept a TCP connection within this
    /// long before it counts as ready.
    pub probe_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            default_lead: Duration::from_secs(150),
            cancel_retry_delay: Duration::from_millis(500),
            probe_timeout: None,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_default_lead(mut self, lead: Duration) -> Self {
        self.default_lead = lead;
        self
    }

    #[must_use]
    pub fn with_endpoint_probe(mut self, timeout: Duration) -> Self {
        self.probe_timeout = Some(timeout);
        self
    }
}
