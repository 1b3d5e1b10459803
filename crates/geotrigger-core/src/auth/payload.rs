//! Canonical signed payloads.
//!
//! A proof covers exactly one payload, and the payload must be re-derivable
//! byte-for-byte between proof generation and submission, or signature
//! verification downstream fails. Canonicalization is RFC 8785 (JCS) via
//! `serde_jcs`; construction is pure given fixed inputs.

use crate::model::{MatchEvent, Rule};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// How long a built payload stays usable before the dispatcher contract
/// would reject its issued-at timestamp. Stale payloads are rebuilt before
/// a proof is requested.
pub const PAYLOAD_FRESHNESS_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Payment payload missing {field}; resolve the parameter template before signing")]
    MissingPaymentField { field: String },

    #[error("Canonicalization failed: {0}")]
    Canonicalize(String),
}

impl From<PayloadError> for crate::errors::EngineError {
    fn from(e: PayloadError) -> Self {
        crate::errors::EngineError::Validation(crate::errors::ValidationError::PayloadInvalid {
            reason: e.to_string(),
        })
    }
}

/// Payment-shaped payload: covers exactly what the vault submission will
/// carry. Destination and amount are resolved from the match event before
/// signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentPayload {
    pub source: String,
    pub destination: String,
    pub amount: String,
    pub asset: String,
    pub memo: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

/// Generic function payload for non-payment calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunctionPayload {
    pub function: String,
    pub contract_id: String,
    pub parameters: BTreeMap<String, Value>,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignedPayload {
    Payment(PaymentPayload),
    Function(FunctionPayload),
}

impl SignedPayload {
    /// Canonical JCS string of the payload. Two independent constructions
    /// from the same inputs are byte-identical.
    pub fn canonical(&self) -> Result<String, PayloadError> {
        match self {
            SignedPayload::Payment(p) => serde_jcs::to_string(p),
            SignedPayload::Function(p) => serde_jcs::to_string(p),
        }
        .map_err(|e| PayloadError::Canonicalize(e.to_string()))
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            SignedPayload::Payment(p) => p.timestamp,
            SignedPayload::Function(p) => p.timestamp,
        }
    }

    /// Whether the payload's issued-at timestamp has aged past the
    /// freshness window and must be rebuilt before requesting a proof.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() - self.timestamp() > PAYLOAD_FRESHNESS_SECONDS
    }
}

fn take_string(params: &BTreeMap<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match params.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

/// Build the payment payload for a rule/match pair from already-resolved
/// parameters. The destination falls back to the matched wallet, matching
/// the system-generated placeholder semantics.
pub fn build_payment_payload(
    rule: &Rule,
    event: &MatchEvent,
    resolved: &BTreeMap<String, Value>,
    source: &str,
    timestamp: i64,
    nonce: Option<String>,
) -> Result<PaymentPayload, PayloadError> {
    let destination = take_string(resolved, &["destination", "to", "recipient"])
        .unwrap_or_else(|| event.matched_public_key.clone());
    let amount = take_string(resolved, &["amount"]).ok_or(PayloadError::MissingPaymentField {
        field: "amount".to_string(),
    })?;
    let asset = take_string(resolved, &["asset"]).unwrap_or_else(|| "XLM".to_string());
    let memo = take_string(resolved, &["memo"])
        .unwrap_or_else(|| format!("geotrigger rule {}", rule.id));
    Ok(PaymentPayload {
        source: source.to_string(),
        destination,
        amount,
        asset,
        memo,
        timestamp,
        nonce,
    })
}

/// Build the generic function payload from already-resolved parameters.
pub fn build_function_payload(
    rule: &Rule,
    resolved: &BTreeMap<String, Value>,
    timestamp: i64,
    nonce: Option<String>,
) -> FunctionPayload {
    FunctionPayload {
        function: rule.function_name.clone(),
        contract_id: rule.contract_id.clone(),
        parameters: resolved.clone(),
        timestamp,
        nonce,
    }
}
