//! Batch orchestration: authorize first, then execute sequentially.
//!
//! All passkey proofs for the selected events are collected up front (one
//! credential selection, then one proof per distinct signed payload) before
//! any submission begins. A user who cancels mid-approval has submitted
//! nothing for items whose proof had not yet succeeded. Execution is
//! strictly sequential with a short pause between submissions; a failing
//! item never aborts the batch.

use crate::auth::AuthMode;
use crate::cancel::CancelToken;
use crate::errors::{AuthorizationError, EngineError};
use crate::executor::{ExecCredentials, ExecutionPlan, Executor};
use crate::model::{ContractInfo, EventKey, ExecutionOutcome, MatchEvent, Rule};
use crate::services::{Credential, PasskeyProof};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed pause between sequential submissions.
pub const INTER_SUBMISSION_PAUSE: Duration = Duration::from_millis(500);

/// One selected event with the rule and contract it executes under.
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub rule: Rule,
    pub contract: ContractInfo,
    pub event: MatchEvent,
}

#[derive(Debug)]
pub struct BatchItemResult {
    pub key: EventKey,
    pub result: Result<ExecutionOutcome, EngineError>,
}

/// Summary of a batch run. Partial success is expected and normal; the
/// batch never fails atomically.
#[derive(Debug)]
pub struct BatchReport {
    pub success_count: usize,
    pub fail_count: usize,
    pub per_item: Vec<BatchItemResult>,
}

impl BatchReport {
    pub fn summary(&self) -> String {
        format!("{} succeeded, {} failed", self.success_count, self.fail_count)
    }
}

struct PreparedItem {
    index: usize,
    plan: ExecutionPlan,
    proof: Option<PasskeyProof>,
}

pub struct BatchOrchestrator {
    pause: Duration,
}

impl Default for BatchOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchOrchestrator {
    pub fn new() -> Self {
        Self {
            pause: INTER_SUBMISSION_PAUSE,
        }
    }

    /// Override the inter-submission pause (tests use zero).
    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub async fn execute_batch(
        &self,
        executor: &Executor,
        items: &[BatchItem],
        creds: &ExecCredentials,
        cancel: &CancelToken,
    ) -> BatchReport {
        let mut failures: Vec<(usize, EngineError)> = Vec::new();
        let mut prepared: Vec<PreparedItem> = Vec::new();

        // Plan everything before touching the network.
        let now = Utc::now();
        let mut plans: Vec<(usize, ExecutionPlan)> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            match executor.plan(&item.rule, &item.contract, &item.event, creds, now) {
                Ok(plan) => plans.push((index, plan)),
                Err(e) => failures.push((index, e)),
            }
        }

        // One credential selection, reused for every passkey item: a
        // contract accepts only one registered credential per identity.
        let needs_passkey = plans
            .iter()
            .any(|(_, plan)| plan.mode == AuthMode::PasskeyRequired);
        let credential: Option<Credential> = if needs_passkey {
            match executor
                .resolver()
                .select_credential(&creds.identity, creds.secret_key.as_ref())
                .await
            {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "credential selection failed, excluding passkey items");
                    // Record the actual selection error so a transient
                    // network failure stays retry-safe per item.
                    let mut remaining = Vec::new();
                    for (index, plan) in plans {
                        if plan.mode == AuthMode::PasskeyRequired {
                            failures.push((index, e.clone()));
                        } else {
                            remaining.push((index, plan));
                        }
                    }
                    plans = remaining;
                    None
                }
            }
        } else {
            None
        };

        // Collect all obtainable proofs before any submission begins.
        for (index, plan) in plans {
            if plan.mode != AuthMode::PasskeyRequired {
                prepared.push(PreparedItem {
                    index,
                    plan,
                    proof: None,
                });
                continue;
            }
            let Some(credential) = &credential else {
                continue; // already recorded as failures above
            };
            if cancel.is_cancelled() {
                failures.push((index, AuthorizationError::Cancelled.into()));
                continue;
            }
            // Approvals are interactive; earlier ones may age this payload
            // past the freshness window. Re-plan before requesting.
            let plan = if plan.payload.is_stale(Utc::now()) {
                let item = &items[index];
                match executor.plan(&item.rule, &item.contract, &item.event, creds, Utc::now()) {
                    Ok(fresh) => fresh,
                    Err(e) => {
                        failures.push((index, e));
                        continue;
                    }
                }
            } else {
                plan
            };
            match executor
                .resolver()
                .acquire_proof(credential, &plan.payload, cancel)
                .await
            {
                Ok(proof) => prepared.push(PreparedItem {
                    index,
                    plan,
                    proof: Some(proof),
                }),
                Err(e) => failures.push((index, e)),
            }
        }

        // Sequential execution in selection order. Per-item failure is
        // isolated; cancellation stops further submissions only.
        let mut results: Vec<(usize, Result<ExecutionOutcome, EngineError>)> = Vec::new();
        let total = prepared.len();
        for (position, item) in prepared.into_iter().enumerate() {
            if cancel.is_cancelled() {
                results.push((item.index, Err(AuthorizationError::Cancelled.into())));
                continue;
            }
            let batch_item = &items[item.index];
            let outcome = executor
                .submit(
                    &batch_item.rule,
                    &batch_item.event,
                    creds,
                    &item.plan,
                    item.proof,
                )
                .await;
            results.push((item.index, outcome));
            if position + 1 < total && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        for (index, error) in failures {
            results.push((index, Err(error)));
        }
        results.sort_by_key(|(index, _)| *index);

        let per_item: Vec<BatchItemResult> = results
            .into_iter()
            .map(|(index, result)| BatchItemResult {
                key: items[index].event.key(),
                result,
            })
            .collect();
        let success_count = per_item.iter().filter(|r| r.result.is_ok()).count();
        let fail_count = per_item.len() - success_count;

        info!(success_count, fail_count, "batch finished");
        BatchReport {
            success_count,
            fail_count,
            per_item,
        }
    }
}
