//! Core data model: rules, match events, parameter templates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Location,
    Geofence,
    Proximity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOn {
    Enter,
    Exit,
    Within,
    Proximity,
}

/// Circular geofence. Matching against it is computed by the external
/// location pipeline; the engine only carries the definition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_meters: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuorumType {
    Any,
    All,
    Exact,
}

/// Policy requiring specific wallets to be in range before execution.
///
/// Invariant: a non-empty `required_wallet_public_keys` set must carry a
/// `minimum_wallet_count` in `1..=set size`. An empty set is vacuously
/// satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumPolicy {
    pub required_wallet_public_keys: BTreeSet<String>,
    pub minimum_wallet_count: Option<u32>,
    pub quorum_type: QuorumType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_executions_per_public_key: u32,
    /// Trailing window ending at "now", not a calendar bucket.
    pub execution_time_window_seconds: i64,
}

/// Auto-deactivation: flip the rule inactive once the watched balance drops
/// to or below the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeactivationPolicy {
    pub balance_threshold_xlm: f64,
    pub asset: String,
    pub use_smart_wallet_balance: bool,
}

/// A function-parameter template value: either a literal, or a placeholder
/// the engine resolves from the match context at execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ParameterValue {
    Literal(Value),
    SystemPlaceholder(PlaceholderKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderKind {
    MatchedWallet,
    MatchedLatitude,
    MatchedLongitude,
    Amount,
}

/// A persistent geofence-execution rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub contract_id: String,
    pub rule_type: RuleType,
    pub geofence: Option<Geofence>,
    pub function_name: String,
    pub function_parameters: BTreeMap<String, ParameterValue>,
    pub trigger_on: TriggerOn,
    pub is_active: bool,
    /// Wallet this rule targets when no quorum policy applies.
    pub target_public_key: Option<String>,
    pub quorum: Option<QuorumPolicy>,
    pub rate_limit: Option<RateLimitPolicy>,
    pub min_location_duration_seconds: Option<i64>,
    pub deactivation: Option<DeactivationPolicy>,
    /// Route payments through the vault/smart-wallet contract.
    pub use_smart_wallet: bool,
}

/// Metadata about the contract a rule belongs to, as reported by the rule
/// persistence API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractInfo {
    pub contract_id: String,
    /// Hard requirement declared by the contract: every call must carry a
    /// WebAuthn proof.
    pub webauthn_required: bool,
}

/// Identity of a match event: the idempotency key used throughout the
/// engine. `update_id` pins the specific location observation when the
/// pipeline supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventKey {
    pub rule_id: i64,
    pub matched_public_key: String,
    pub update_id: Option<i64>,
}

impl EventKey {
    pub fn new(rule_id: i64, matched_public_key: impl Into<String>, update_id: Option<i64>) -> Self {
        Self {
            rule_id,
            matched_public_key: matched_public_key.into(),
            update_id,
        }
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.update_id {
            Some(u) => write!(f, "{}:{}:{}", self.rule_id, self.matched_public_key, u),
            None => write!(f, "{}:{}", self.rule_id, self.matched_public_key),
        }
    }
}

/// Ephemeral record from the location pipeline: a wallet satisfied a rule's
/// trigger condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchEvent {
    pub rule_id: i64,
    pub matched_public_key: String,
    pub matched_at: DateTime<Utc>,
    pub location: Option<(f64, f64)>,
    pub update_id: Option<i64>,
    /// Continuous presence at the matched location, attached by the
    /// pipeline. Consumed by the dwell gate.
    pub dwell_seconds: Option<i64>,
    pub function_parameters: BTreeMap<String, Value>,
    pub message: String,
}

impl MatchEvent {
    pub fn key(&self) -> EventKey {
        EventKey::new(self.rule_id, self.matched_public_key.clone(), self.update_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Completed,
    Rejected,
}

/// Result reported by the external execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub transaction_hash: Option<String>,
    pub error: Option<String>,
}

/// Visible record in the completed view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedRecord {
    pub rule_id: i64,
    pub matched_public_key: String,
    pub update_id: Option<i64>,
    pub transaction_hash: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl CompletedRecord {
    /// Deduplication key for duplicate completion reports from upstream.
    /// Absent fields fall back to sentinels; see the store tests for the
    /// known collapse when two distinct completions lack both.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.rule_id,
            self.transaction_hash.as_deref().unwrap_or("no-tx"),
            self.update_id
                .map(|u| u.to_string())
                .unwrap_or_else(|| "no-update".to_string()),
            self.matched_public_key
        )
    }
}

/// Context for resolving a parameter template against a concrete match.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    pub matched_public_key: String,
    pub location: Option<(f64, f64)>,
    pub amount: Option<String>,
}

/// Resolve a parameter template into concrete values. Pure: same template
/// and context always produce the same map.
pub fn resolve_parameters(
    template: &BTreeMap<String, ParameterValue>,
    ctx: &ResolveContext,
) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (name, value) in template {
        let resolved = match value {
            ParameterValue::Literal(v) => v.clone(),
            ParameterValue::SystemPlaceholder(kind) => match kind {
                PlaceholderKind::MatchedWallet => Value::String(ctx.matched_public_key.clone()),
                PlaceholderKind::MatchedLatitude => ctx
                    .location
                    .and_then(|(lat, _)| serde_json::Number::from_f64(lat))
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                PlaceholderKind::MatchedLongitude => ctx
                    .location
                    .and_then(|(_, lon)| serde_json::Number::from_f64(lon))
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                PlaceholderKind::Amount => ctx
                    .amount
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            },
        };
        out.insert(name.clone(), resolved);
    }
    out
}

/// Conventional read prefixes: functions carrying one never require signing
/// material and may be simulated without reaching the ledger.
pub const READ_PREFIXES: [&str; 8] = [
    "get_", "is_", "has_", "check_", "query_", "view_", "read_", "fetch_",
];

pub fn is_read_only_function(name: &str) -> bool {
    READ_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Heuristic for payment-shaped functions, used for payload shape and
/// vault routing.
pub fn is_payment_function(name: &str) -> bool {
    matches!(
        name,
        "transfer" | "pay" | "payment" | "send" | "send_payment" | "transfer_from"
    ) || name.starts_with("transfer_")
        || name.starts_with("pay_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> BTreeMap<String, ParameterValue> {
        let mut t = BTreeMap::new();
        t.insert(
            "to".to_string(),
            ParameterValue::SystemPlaceholder(PlaceholderKind::MatchedWallet),
        );
        t.insert(
            "amount".to_string(),
            ParameterValue::SystemPlaceholder(PlaceholderKind::Amount),
        );
        t.insert("memo".to_string(), ParameterValue::Literal(json!("geo")));
        t
    }

    #[test]
    fn resolve_fills_placeholders_from_context() {
        let ctx = ResolveContext {
            matched_public_key: "W1".to_string(),
            location: Some((52.37, 4.89)),
            amount: Some("10".to_string()),
        };
        let out = resolve_parameters(&template(), &ctx);
        assert_eq!(out["to"], json!("W1"));
        assert_eq!(out["amount"], json!("10"));
        assert_eq!(out["memo"], json!("geo"));
    }

    #[test]
    fn resolve_is_deterministic() {
        let ctx = ResolveContext {
            matched_public_key: "W1".to_string(),
            location: Some((1.0, 2.0)),
            amount: None,
        };
        assert_eq!(
            resolve_parameters(&template(), &ctx),
            resolve_parameters(&template(), &ctx)
        );
    }

    #[test]
    fn read_prefix_detection() {
        assert!(is_read_only_function("get_balance"));
        assert!(is_read_only_function("check_quorum"));
        assert!(!is_read_only_function("transfer"));
        assert!(!is_read_only_function("mint_location_nft"));
    }

    #[test]
    fn dedup_key_uses_sentinels_for_absent_fields() {
        let rec = CompletedRecord {
            rule_id: 5,
            matched_public_key: "W1".to_string(),
            update_id: None,
            transaction_hash: None,
            completed_at: Utc::now(),
        };
        assert_eq!(rec.dedup_key(), "5_no-tx_no-update_W1");
    }

    #[test]
    fn dedup_key_full_tuple() {
        let rec = CompletedRecord {
            rule_id: 5,
            matched_public_key: "W1".to_string(),
            update_id: Some(42),
            transaction_hash: Some("abc123".to_string()),
            completed_at: Utc::now(),
        };
        assert_eq!(rec.dedup_key(), "5_abc123_42_W1");
    }
}
