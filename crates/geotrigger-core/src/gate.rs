//! Rate/time gate: per-identity execution quotas, minimum dwell time and
//! the advisory balance-threshold auto-deactivation check.

use crate::errors::StoreError;
use crate::lifecycle::LifecycleStore;
use crate::model::{MatchEvent, Rule};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info};

/// Why an event was held back. Held events are not errors: the match simply
/// stays pending until conditions change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HoldReason {
    #[error("Rate limit reached: {count} executions in the last {window_seconds}s (max {max})")]
    RateLimited {
        count: u32,
        max: u32,
        window_seconds: i64,
    },

    #[error("Dwell time {dwell_seconds}s below required minimum {required_seconds}s")]
    InsufficientDwell {
        dwell_seconds: i64,
        required_seconds: i64,
    },

    #[error("Rule is inactive")]
    RuleInactive,
}

pub struct Gate {
    store: LifecycleStore,
}

impl Gate {
    pub fn new(store: LifecycleStore) -> Self {
        Self { store }
    }

    /// Decide whether a match event is currently eligible for execution.
    ///
    /// The rate window is a trailing window ending at `now`. Dwell duration
    /// is consumed from the event; presence tracking itself lives in the
    /// external location pipeline.
    pub fn admit(
        &self,
        rule: &Rule,
        event: &MatchEvent,
        now: DateTime<Utc>,
    ) -> Result<Result<(), HoldReason>, StoreError> {
        if !rule.is_active {
            return Ok(Err(HoldReason::RuleInactive));
        }

        if let Some(limit) = &rule.rate_limit {
            let since = now - Duration::seconds(limit.execution_time_window_seconds);
            let count =
                self.store
                    .executions_since(rule.id, &event.matched_public_key, since)?;
            if count >= limit.max_executions_per_public_key {
                debug!(
                    rule_id = rule.id,
                    identity = %event.matched_public_key,
                    count,
                    "rate limit reached"
                );
                return Ok(Err(HoldReason::RateLimited {
                    count,
                    max: limit.max_executions_per_public_key,
                    window_seconds: limit.execution_time_window_seconds,
                }));
            }
        }

        if let Some(required) = rule.min_location_duration_seconds {
            let dwell = event.dwell_seconds.unwrap_or(0);
            if dwell < required {
                return Ok(Err(HoldReason::InsufficientDwell {
                    dwell_seconds: dwell,
                    required_seconds: required,
                }));
            }
        }

        Ok(Ok(()))
    }

    /// Advisory rule-level deactivation: flip the rule inactive when the
    /// watched balance has dropped to or below the configured threshold.
    /// Returns true when the rule was deactivated by this call. Best-effort
    /// only; not transactionally consistent with the balance source.
    pub fn check_deactivation(rule: &mut Rule, balance_xlm: f64) -> bool {
        let Some(policy) = &rule.deactivation else {
            return false;
        };
        if rule.is_active && balance_xlm <= policy.balance_threshold_xlm {
            info!(
                rule_id = rule.id,
                balance = balance_xlm,
                threshold = policy.balance_threshold_xlm,
                "balance at or below threshold, deactivating rule"
            );
            rule.is_active = false;
            return true;
        }
        false
    }
}
