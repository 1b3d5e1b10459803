//! Single-rule execution: drives one authorized match event through the
//! external execution service and reconciles the result into the
//! lifecycle store.

use crate::auth::{
    build_function_payload, build_payment_payload, resolve_mode, AuthMode, AuthResolver,
    SignedPayload,
};
use crate::cancel::CancelToken;
use crate::errors::{AuthorizationError, EngineError, SubmissionError, ValidationError};
use crate::lifecycle::LifecycleStore;
use crate::model::{
    is_payment_function, is_read_only_function, resolve_parameters, ContractInfo, ExecutionOutcome,
    MatchEvent, ResolveContext, Rule,
};
use crate::services::{
    ExecutionService, InvokeRequest, PasskeyProof, SecretKey, SigningMaterial, VaultPaymentRequest,
};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Signing inputs supplied by the operator for an execution.
#[derive(Debug, Clone)]
pub struct ExecCredentials {
    /// Acting identity (source account / smart-wallet owner).
    pub identity: String,
    pub secret_key: Option<SecretKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Vault/smart-wallet submission with explicit payment fields.
    Vault,
    /// Generic contract-function submission.
    Generic,
}

/// Everything decided before any network call: mode, route, resolved
/// parameters and the payload a proof must cover.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub mode: AuthMode,
    pub read_only: bool,
    pub route: Route,
    pub submit_to_ledger: bool,
    pub resolved: BTreeMap<String, Value>,
    pub payload: SignedPayload,
}

pub struct Executor {
    store: LifecycleStore,
    execution: Arc<dyn ExecutionService>,
    resolver: AuthResolver,
}

impl Executor {
    pub fn new(
        store: LifecycleStore,
        execution: Arc<dyn ExecutionService>,
        resolver: AuthResolver,
    ) -> Self {
        Self {
            store,
            execution,
            resolver,
        }
    }

    pub fn resolver(&self) -> &AuthResolver {
        &self.resolver
    }

    /// Validate and plan an execution. Rejected inputs never reach the
    /// network.
    pub fn plan(
        &self,
        rule: &Rule,
        contract: &ContractInfo,
        event: &MatchEvent,
        creds: &ExecCredentials,
        now: DateTime<Utc>,
    ) -> Result<ExecutionPlan, EngineError> {
        if rule.function_name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                rule_id: rule.id,
                field: "function_name".to_string(),
            }
            .into());
        }
        if !rule.is_active {
            return Err(ValidationError::RuleInactive { rule_id: rule.id }.into());
        }
        if let Some(policy) = &rule.quorum {
            crate::quorum::validate_policy(policy)?;
        }

        let read_only = is_read_only_function(&rule.function_name);
        let mode = resolve_mode(rule, contract);

        // Write functions need signing material; read-only functions only
        // reach the ledger when a secret key happens to be present.
        if !read_only && mode == AuthMode::SecretKeyOnly && creds.secret_key.is_none() {
            return Err(AuthorizationError::SecretKeyRequired {
                function: rule.function_name.clone(),
            }
            .into());
        }
        let submit_to_ledger = !read_only || creds.secret_key.is_some();

        // Prefer the pipeline-resolved parameters; fall back to resolving
        // the rule template against the match context.
        let resolved = if event.function_parameters.is_empty() {
            let ctx = ResolveContext {
                matched_public_key: event.matched_public_key.clone(),
                location: event.location,
                amount: None,
            };
            resolve_parameters(&rule.function_parameters, &ctx)
        } else {
            event.function_parameters.clone()
        };

        let payment = is_payment_function(&rule.function_name);
        let route = if payment && rule.use_smart_wallet {
            Route::Vault
        } else {
            Route::Generic
        };

        // Passkey payloads carry a nonce so the dispatcher can reject
        // replays.
        let nonce = (mode == AuthMode::PasskeyRequired).then(|| Uuid::new_v4().to_string());
        let payload = if payment {
            SignedPayload::Payment(build_payment_payload(
                rule,
                event,
                &resolved,
                &creds.identity,
                now.timestamp(),
                nonce,
            )?)
        } else {
            SignedPayload::Function(build_function_payload(
                rule,
                &resolved,
                now.timestamp(),
                nonce,
            ))
        };

        Ok(ExecutionPlan {
            mode,
            read_only,
            route,
            submit_to_ledger,
            resolved,
            payload,
        })
    }

    /// Execute one authorized match event end to end.
    pub async fn execute(
        &self,
        rule: &Rule,
        contract: &ContractInfo,
        event: &MatchEvent,
        creds: &ExecCredentials,
        cancel: &CancelToken,
    ) -> Result<ExecutionOutcome, EngineError> {
        let plan = self.plan(rule, contract, event, creds, Utc::now())?;
        debug!(rule_id = rule.id, key = %event.key(), mode = ?plan.mode, route = ?plan.route, "planned execution");

        let proof = match plan.mode {
            AuthMode::PasskeyRequired => {
                let credential = self
                    .resolver
                    .select_credential(&creds.identity, creds.secret_key.as_ref())
                    .await?;
                Some(
                    self.resolver
                        .acquire_proof(&credential, &plan.payload, cancel)
                        .await?,
                )
            }
            AuthMode::SecretKeyOnly => None,
        };

        self.submit(rule, event, creds, &plan, proof).await
    }

    /// Submit a planned execution with an already-acquired proof (the batch
    /// path collects proofs up front) and reconcile the result.
    pub async fn submit(
        &self,
        rule: &Rule,
        event: &MatchEvent,
        creds: &ExecCredentials,
        plan: &ExecutionPlan,
        proof: Option<PasskeyProof>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let signing_material = match (&proof, &creds.secret_key) {
            (Some(p), _) => Some(SigningMaterial::Passkey(p.clone())),
            (None, Some(key)) => Some(SigningMaterial::SecretKey(key.clone())),
            (None, None) => None,
        };

        let outcome = match plan.route {
            Route::Vault => {
                let proof = proof.ok_or(AuthorizationError::SecretKeyRequired {
                    function: rule.function_name.clone(),
                })?;
                let SignedPayload::Payment(payment) = &plan.payload else {
                    return Err(ValidationError::MissingField {
                        rule_id: rule.id,
                        field: "payment payload".to_string(),
                    }
                    .into());
                };
                let req = VaultPaymentRequest {
                    identity: creds.identity.clone(),
                    signing_material: SigningMaterial::Passkey(proof.clone()),
                    destination: payment.destination.clone(),
                    amount: payment.amount.clone(),
                    asset: payment.asset.clone(),
                    proof,
                    rule_id: rule.id,
                };
                self.execution.submit_vault_payment(&req).await?
            }
            Route::Generic => {
                let req = InvokeRequest {
                    function_name: rule.function_name.clone(),
                    parameters: plan.resolved.clone(),
                    identity: creds.identity.clone(),
                    signing_material,
                    submit_to_ledger: plan.submit_to_ledger,
                    rule_id: rule.id,
                    update_id: event.update_id,
                    matched_public_key: Some(event.matched_public_key.clone()),
                };
                self.execution.invoke_function(&req).await?
            }
        };

        if !outcome.success {
            // The event stays Pending; re-invoking is safe.
            return Err(SubmissionError::Rejected {
                message: outcome
                    .error
                    .unwrap_or_else(|| "execution service reported failure".to_string()),
            }
            .into());
        }

        info!(
            rule_id = rule.id,
            key = %event.key(),
            tx = outcome.transaction_hash.as_deref().unwrap_or("none"),
            "execution succeeded"
        );
        self.record_completion(event, outcome.transaction_hash.as_deref());
        Ok(outcome)
    }

    /// Best-effort completion bookkeeping. The on-chain effect already
    /// happened, so a failure here lands in the durable outbox for a later
    /// reconciliation pass instead of failing the operation.
    fn record_completion(&self, event: &MatchEvent, transaction_hash: Option<&str>) {
        match self.store.complete(
            event.rule_id,
            &event.matched_public_key,
            event.update_id,
            transaction_hash,
            Utc::now(),
        ) {
            Ok(_) => {}
            Err(e) => {
                warn!(key = %event.key(), error = %e, "completion bookkeeping failed, queueing for reconciliation");
                if let Some(tx) = transaction_hash {
                    if let Err(e) = self.store.outbox_push(
                        event.rule_id,
                        &event.matched_public_key,
                        event.update_id,
                        tx,
                    ) {
                        warn!(key = %event.key(), error = %e, "outbox push failed");
                    }
                }
            }
        }
    }
}
