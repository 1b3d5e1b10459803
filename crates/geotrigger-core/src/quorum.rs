//! Quorum evaluation: is a required-wallet-set policy currently satisfied?
//!
//! Queried on demand (operator-triggered status checks); execution is not
//! coupled to a live geofence feed.

use crate::errors::ValidationError;
use crate::model::{QuorumPolicy, QuorumType};
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuorumStatus {
    pub met: bool,
    pub in_range: BTreeSet<String>,
    pub out_of_range: BTreeSet<String>,
}

/// Validate the policy invariant: a non-empty required set carries a
/// minimum in `1..=set size`.
pub fn validate_policy(policy: &QuorumPolicy) -> Result<(), ValidationError> {
    if policy.required_wallet_public_keys.is_empty() {
        return Ok(());
    }
    match policy.minimum_wallet_count {
        None => Err(ValidationError::QuorumMinimumMissing),
        Some(m) if m < 1 || m as usize > policy.required_wallet_public_keys.len() => {
            Err(ValidationError::QuorumMinimumInconsistent {
                minimum: m,
                set_size: policy.required_wallet_public_keys.len(),
            })
        }
        Some(_) => Ok(()),
    }
}

/// Evaluate the policy against the set of wallets currently in range.
pub fn evaluate(
    policy: &QuorumPolicy,
    wallets_in_range: &BTreeSet<String>,
) -> Result<QuorumStatus, ValidationError> {
    validate_policy(policy)?;

    let required = &policy.required_wallet_public_keys;
    if required.is_empty() {
        // "None required": vacuously satisfied
        return Ok(QuorumStatus {
            met: true,
            in_range: BTreeSet::new(),
            out_of_range: BTreeSet::new(),
        });
    }

    let in_range: BTreeSet<String> = required.intersection(wallets_in_range).cloned().collect();
    let out_of_range: BTreeSet<String> = required.difference(wallets_in_range).cloned().collect();
    let minimum = policy.minimum_wallet_count.unwrap_or(1) as usize;

    let met = match policy.quorum_type {
        QuorumType::Any => in_range.len() >= minimum,
        QuorumType::All => out_of_range.is_empty(),
        QuorumType::Exact => in_range.len() == minimum,
    };

    Ok(QuorumStatus {
        met,
        in_range,
        out_of_range,
    })
}
