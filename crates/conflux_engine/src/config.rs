//! Configuration for the sync engine.

use std::time::Duration;

/// What the engine does when a single member fails to connect or read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Stop the whole engine on the first connect/read failure.
    ///
    /// This is the historical behavior; the failing member's error becomes
    /// the cycle's error and every connected member is disconnected.
    #[default]
    StopAll,
    /// Keep syncing the remaining members. The first error still decides
    /// the terminal cycle status.
    Continue,
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied to every method call sent to a client.
    pub call_timeout: Duration,
    /// Single-member failure policy.
    pub error_policy: ErrorPolicy,
    /// Force a slow sync on the next cycle regardless of history.
    pub force_slow_sync: bool,
    /// Allow a group with fewer than two members. Useful in tests;
    /// a real sync needs at least two sources.
    pub allow_solo_member: bool,
    /// Retry ceiling for uid elevation during history splits.
    pub max_identity_elevation: u32,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            error_policy: ErrorPolicy::default(),
            force_slow_sync: false,
            allow_solo_member: false,
            max_identity_elevation: 8,
        }
    }

    /// Sets the method-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the single-member failure policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Forces a slow sync on the next cycle.
    pub fn with_force_slow_sync(mut self, force: bool) -> Self {
        self.force_slow_sync = force;
        self
    }

    /// Allows running with a single member.
    pub fn with_allow_solo_member(mut self, allow: bool) -> Self {
        self.allow_solo_member = allow;
        self
    }

    /// Sets the uid elevation retry ceiling.
    pub fn with_max_identity_elevation(mut self, max: u32) -> Self {
        self.max_identity_elevation = max;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = EngineConfig::new()
            .with_call_timeout(Duration::from_millis(250))
            .with_error_policy(ErrorPolicy::Continue)
            .with_force_slow_sync(true);

        assert_eq!(config.call_timeout, Duration::from_millis(250));
        assert_eq!(config.error_policy, ErrorPolicy::Continue);
        assert!(config.force_slow_sync);
        assert!(!config.allow_solo_member);
    }

    #[test]
    fn default_policy_stops_all() {
        assert_eq!(EngineConfig::default().error_policy, ErrorPolicy::StopAll);
    }
}
