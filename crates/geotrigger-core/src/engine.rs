//! The orchestrator object exposed to callers (UI or automation).
//!
//! Holds the pending-event cache, the selection set keyed by event
//! identity, and the per-batch cancellation token as explicit state rather
//! than ambient scope. A background poll refreshing the pending list is
//! suppressed while a batch is in flight.

use crate::auth::AuthResolver;
use crate::batch::{BatchItem, BatchOrchestrator, BatchReport};
use crate::cancel::CancelToken;
use crate::errors::{EngineError, ValidationError};
use crate::executor::{ExecCredentials, Executor};
use crate::gate::Gate;
use crate::lifecycle::LifecycleStore;
use crate::model::{CompletedRecord, ContractInfo, EventKey, ExecutionOutcome, MatchEvent, Rule};
use crate::quorum::{self, QuorumStatus};
use crate::services::{CredentialService, ExecutionService, RuleApi};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Engine {
    store: LifecycleStore,
    rules: Arc<dyn RuleApi>,
    executor: Executor,
    gate: Gate,
    batch: BatchOrchestrator,
    pending: Vec<MatchEvent>,
    selection: BTreeSet<EventKey>,
    batch_in_flight: bool,
    batch_cancel: CancelToken,
}

impl Engine {
    pub fn new(
        store: LifecycleStore,
        rules: Arc<dyn RuleApi>,
        execution: Arc<dyn ExecutionService>,
        credentials: Arc<dyn CredentialService>,
    ) -> Self {
        let resolver = AuthResolver::new(credentials);
        let executor = Executor::new(store.clone(), execution, resolver);
        let gate = Gate::new(store.clone());
        Self {
            store,
            rules,
            executor,
            gate,
            batch: BatchOrchestrator::new(),
            pending: Vec::new(),
            selection: BTreeSet::new(),
            batch_in_flight: false,
            batch_cancel: CancelToken::new(),
        }
    }

    /// Swap in a differently-tuned batch orchestrator (tests shrink the
    /// inter-submission pause).
    pub fn with_batch(mut self, batch: BatchOrchestrator) -> Self {
        self.batch = batch;
        self
    }

    /// Ingest a match event from the external pipeline. Idempotent on the
    /// identity tuple.
    pub fn ingest(&self, event: &MatchEvent) -> Result<bool, EngineError> {
        Ok(self.store.mark_pending(event)?)
    }

    /// Refresh the pending cache from the store. Suppressed while a batch
    /// is in flight to avoid racing state mutation; selection entries whose
    /// key no longer exists are pruned, the rest preserved. Also drains the
    /// reconciliation outbox.
    pub async fn refresh_pending(&mut self) -> Result<&[MatchEvent], EngineError> {
        if self.batch_in_flight {
            debug!("batch in flight, skipping pending refresh");
            return Ok(&self.pending);
        }

        self.reconcile().await?;

        self.pending = self
            .store
            .list_pending()?
            .into_iter()
            .map(|p| p.event)
            .collect();
        let live: BTreeSet<EventKey> = self.pending.iter().map(MatchEvent::key).collect();
        self.selection.retain(|key| live.contains(key));
        Ok(&self.pending)
    }

    pub fn pending(&self) -> &[MatchEvent] {
        &self.pending
    }

    pub fn list_completed(&self) -> Result<Vec<CompletedRecord>, EngineError> {
        Ok(self.store.list_completed()?)
    }

    pub fn list_rejected(&self) -> Result<Vec<MatchEvent>, EngineError> {
        Ok(self
            .store
            .list_rejected()?
            .into_iter()
            .map(|p| p.event)
            .collect())
    }

    pub fn select(&mut self, key: EventKey) {
        self.selection.insert(key);
    }

    pub fn deselect(&mut self, key: &EventKey) {
        self.selection.remove(key);
    }

    pub fn selection(&self) -> &BTreeSet<EventKey> {
        &self.selection
    }

    /// Operator-triggered quorum status check for a rule.
    pub async fn check_quorum(
        &self,
        rule_id: i64,
        wallets_in_range: &BTreeSet<String>,
    ) -> Result<QuorumStatus, EngineError> {
        let rule = self.fetch_rule(rule_id).await?;
        match &rule.quorum {
            Some(policy) => Ok(quorum::evaluate(policy, wallets_in_range)?),
            // No policy: vacuously satisfied
            None => Ok(QuorumStatus {
                met: true,
                in_range: BTreeSet::new(),
                out_of_range: BTreeSet::new(),
            }),
        }
    }

    /// Execute one pending match event.
    pub async fn execute(
        &self,
        key: &EventKey,
        creds: &ExecCredentials,
    ) -> Result<ExecutionOutcome, EngineError> {
        let event = self.find_event(key)?;
        let rule = self.fetch_rule(key.rule_id).await?;
        let contract = self.fetch_contract(&rule).await?;

        self.gate.admit(&rule, &event, Utc::now())??;

        self.executor
            .execute(&rule, &contract, &event, creds, &CancelToken::new())
            .await
    }

    /// Execute the current selection as a batch. Returns the summary
    /// report; per-item failures never abort the batch.
    pub async fn execute_selected(&mut self, creds: &ExecCredentials) -> BatchReport {
        let mut items = Vec::new();
        let mut held = Vec::new();
        let now = Utc::now();
        for key in self.selection.clone() {
            let assembled: Result<BatchItem, EngineError> = async {
                let event = self.find_event(&key)?;
                let rule = self.fetch_rule(key.rule_id).await?;
                let contract = self.fetch_contract(&rule).await?;
                self.gate.admit(&rule, &event, now)??;
                Ok(BatchItem {
                    rule,
                    contract,
                    event,
                })
            }
            .await;
            match assembled {
                Ok(item) => items.push(item),
                Err(e) => held.push((key, e)),
            }
        }

        self.batch_in_flight = true;
        self.batch_cancel = CancelToken::new();
        let mut report = self
            .batch
            .execute_batch(&self.executor, &items, creds, &self.batch_cancel)
            .await;
        self.batch_in_flight = false;

        for (key, error) in held {
            report.fail_count += 1;
            report.per_item.push(crate::batch::BatchItemResult {
                key,
                result: Err(error),
            });
        }
        report
    }

    /// Cancel the in-flight batch: no further proofs or submissions are
    /// attempted. Already-submitted transactions are never rolled back.
    pub fn cancel_batch(&self) {
        self.batch_cancel.cancel();
    }

    /// Reject a pending match event. Terminal. Honors the full identity
    /// tuple when the key carries an update id.
    pub fn reject(&self, key: &EventKey) -> Result<bool, EngineError> {
        Ok(self
            .store
            .reject(key.rule_id, &key.matched_public_key, key.update_id)?)
    }

    /// Drain the reconciliation outbox: retry completion bookkeeping for
    /// transactions that already landed on-chain, without resubmitting.
    pub async fn reconcile(&self) -> Result<usize, EngineError> {
        let entries = self.store.outbox_entries()?;
        let mut drained = 0;
        for entry in entries {
            match self.store.complete(
                entry.rule_id,
                &entry.matched_public_key,
                entry.update_id,
                Some(&entry.transaction_hash),
                Utc::now(),
            ) {
                Ok(_) => {
                    self.store.outbox_remove(entry.id)?;
                    drained += 1;
                    info!(
                        rule_id = entry.rule_id,
                        tx = %entry.transaction_hash,
                        "reconciled completion from outbox"
                    );
                }
                Err(e) => {
                    warn!(rule_id = entry.rule_id, error = %e, "outbox reconciliation attempt failed");
                    self.store.outbox_bump_attempts(entry.id)?;
                }
            }
        }
        Ok(drained)
    }

    /// Advisory balance-threshold check: deactivate the rule when its
    /// watched balance has dropped to or below the threshold, persisting
    /// the flip through the rule API.
    pub async fn deactivate_if_depleted(
        &self,
        rule_id: i64,
        balance_xlm: f64,
    ) -> Result<bool, EngineError> {
        let mut rule = self.fetch_rule(rule_id).await?;
        if Gate::check_deactivation(&mut rule, balance_xlm) {
            self.rules.update_rule(&rule).await?;
            return Ok(true);
        }
        Ok(false)
    }

    fn find_event(&self, key: &EventKey) -> Result<MatchEvent, EngineError> {
        if let Some(event) = self.pending.iter().find(|e| &e.key() == key) {
            return Ok(event.clone());
        }
        // Cache may be stale; fall back to the store before giving up.
        self.store
            .list_pending()?
            .into_iter()
            .map(|p| p.event)
            .find(|e| &e.key() == key)
            .ok_or_else(|| {
                ValidationError::EventNotFound {
                    key: key.to_string(),
                }
                .into()
            })
    }

    async fn fetch_rule(&self, rule_id: i64) -> Result<Rule, EngineError> {
        self.rules
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| ValidationError::RuleNotFound { rule_id }.into())
    }

    async fn fetch_contract(&self, rule: &Rule) -> Result<ContractInfo, EngineError> {
        Ok(self.rules.get_contract(&rule.contract_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SubmissionError;
    use crate::model::{RuleType, TriggerOn};
    use crate::services::{
        Credential, InvokeRequest, ProofOutcome, SecretKey, VaultPaymentRequest,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct FakeRules {
        rules: Vec<Rule>,
    }

    #[async_trait]
    impl RuleApi for FakeRules {
        async fn list_rules(&self) -> Result<Vec<Rule>, SubmissionError> {
            Ok(self.rules.clone())
        }

        async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>, SubmissionError> {
            Ok(self.rules.iter().find(|r| r.id == rule_id).cloned())
        }

        async fn create_rule(&self, _rule: &Rule) -> Result<i64, SubmissionError> {
            Ok(1)
        }

        async fn update_rule(&self, _rule: &Rule) -> Result<(), SubmissionError> {
            Ok(())
        }

        async fn delete_rule(&self, _rule_id: i64) -> Result<(), SubmissionError> {
            Ok(())
        }

        async fn get_contract(&self, contract_id: &str) -> Result<ContractInfo, SubmissionError> {
            Ok(ContractInfo {
                contract_id: contract_id.to_string(),
                webauthn_required: false,
            })
        }
    }

    struct OkExecution;

    #[async_trait]
    impl crate::services::ExecutionService for OkExecution {
        async fn invoke_function(
            &self,
            req: &InvokeRequest,
        ) -> Result<ExecutionOutcome, SubmissionError> {
            Ok(ExecutionOutcome {
                success: true,
                transaction_hash: Some(format!("tx{}", req.rule_id)),
                error: None,
            })
        }

        async fn submit_vault_payment(
            &self,
            _req: &VaultPaymentRequest,
        ) -> Result<ExecutionOutcome, SubmissionError> {
            Ok(ExecutionOutcome {
                success: true,
                transaction_hash: Some("vaulttx".to_string()),
                error: None,
            })
        }
    }

    struct NoCredentials;

    #[async_trait]
    impl CredentialService for NoCredentials {
        async fn list_credentials(
            &self,
            _identity: &str,
        ) -> Result<Vec<Credential>, SubmissionError> {
            Ok(vec![])
        }

        async fn request_proof(
            &self,
            _credential_id: &str,
            _payload: &str,
        ) -> Result<ProofOutcome, SubmissionError> {
            Ok(ProofOutcome::Denied)
        }

        async fn register_credential(
            &self,
            _identity: &str,
            _signing_material: &SecretKey,
            _public_key_material: &str,
        ) -> Result<bool, SubmissionError> {
            Ok(false)
        }
    }

    fn rule(id: i64) -> Rule {
        Rule {
            id,
            contract_id: "C1".to_string(),
            rule_type: RuleType::Location,
            geofence: Some(crate::model::Geofence {
                center_latitude: 52.0,
                center_longitude: 4.0,
                radius_meters: 100.0,
            }),
            function_name: "mint_badge".to_string(),
            function_parameters: BTreeMap::new(),
            trigger_on: TriggerOn::Enter,
            is_active: true,
            target_public_key: Some("GSOURCE".to_string()),
            quorum: None,
            rate_limit: None,
            min_location_duration_seconds: None,
            deactivation: None,
            use_smart_wallet: false,
        }
    }

    fn event(rule_id: i64, pk: &str, update_id: i64) -> MatchEvent {
        MatchEvent {
            rule_id,
            matched_public_key: pk.to_string(),
            matched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            location: None,
            update_id: Some(update_id),
            dwell_seconds: None,
            function_parameters: BTreeMap::new(),
            message: String::new(),
        }
    }

    fn engine(rules: Vec<Rule>) -> Engine {
        Engine::new(
            LifecycleStore::memory().unwrap(),
            Arc::new(FakeRules { rules }),
            Arc::new(OkExecution),
            Arc::new(NoCredentials),
        )
        .with_batch(BatchOrchestrator::new().with_pause(Duration::ZERO))
    }

    fn creds() -> ExecCredentials {
        ExecCredentials {
            identity: "GSOURCE".to_string(),
            secret_key: Some(SecretKey::parse(&("S".to_string() + &"A".repeat(55))).unwrap()),
        }
    }

    #[tokio::test]
    async fn selection_survives_refresh_with_pruning() {
        let mut engine = engine(vec![rule(1)]);
        engine.ingest(&event(1, "W1", 1)).unwrap();
        engine.ingest(&event(1, "W2", 2)).unwrap();
        engine.refresh_pending().await.unwrap();

        let k1 = EventKey::new(1, "W1", Some(1));
        let k2 = EventKey::new(1, "W2", Some(2));
        engine.select(k1.clone());
        engine.select(k2.clone());

        // One event leaves (rejected), one arrives
        engine.reject(&k2).unwrap();
        engine.ingest(&event(1, "W3", 3)).unwrap();
        engine.refresh_pending().await.unwrap();

        assert!(engine.selection().contains(&k1));
        assert!(!engine.selection().contains(&k2));
        assert_eq!(engine.pending().len(), 2);
    }

    #[tokio::test]
    async fn reject_honors_the_update_id() {
        let mut engine = engine(vec![rule(1)]);
        engine.ingest(&event(1, "W1", 1)).unwrap();
        engine.ingest(&event(1, "W1", 2)).unwrap();
        engine.refresh_pending().await.unwrap();

        assert!(engine.reject(&EventKey::new(1, "W1", Some(1))).unwrap());
        engine.refresh_pending().await.unwrap();
        assert_eq!(engine.pending().len(), 1);
        assert_eq!(engine.pending()[0].update_id, Some(2));
    }

    #[tokio::test]
    async fn execute_runs_scenario_end_to_end() {
        let mut engine = engine(vec![rule(5)]);
        engine.ingest(&event(5, "W1", 42)).unwrap();
        engine.refresh_pending().await.unwrap();

        let key = EventKey::new(5, "W1", Some(42));
        let outcome = engine.execute(&key, &creds()).await.unwrap();
        assert!(outcome.success);

        let completed = engine.list_completed().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].dedup_key(), "5_tx5_42_W1");
    }

    #[tokio::test]
    async fn unknown_event_is_a_validation_error() {
        let engine = engine(vec![rule(1)]);
        let err = engine
            .execute(&EventKey::new(1, "W1", Some(99)), &creds())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::EventNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn quorum_check_without_policy_is_met() {
        let engine = engine(vec![rule(1)]);
        let status = engine.check_quorum(1, &BTreeSet::new()).await.unwrap();
        assert!(status.met);
    }

    #[tokio::test]
    async fn batch_over_selection_reports_summary() {
        let mut engine = engine(vec![rule(1), rule(2)]);
        engine.ingest(&event(1, "W1", 1)).unwrap();
        engine.ingest(&event(2, "W1", 2)).unwrap();
        engine.refresh_pending().await.unwrap();
        engine.select(EventKey::new(1, "W1", Some(1)));
        engine.select(EventKey::new(2, "W1", Some(2)));

        let report = engine.execute_selected(&creds()).await;
        assert_eq!(report.success_count, 2);
        assert_eq!(report.fail_count, 0);
        assert!(!engine.batch_in_flight);
    }

    #[tokio::test]
    async fn reconcile_drains_outbox() {
        let engine = engine(vec![rule(1)]);
        engine.ingest(&event(1, "W1", 7)).unwrap();
        // Simulate a completed transaction whose bookkeeping call failed
        engine.store.outbox_push(1, "W1", Some(7), "txlost").unwrap();

        let drained = engine.reconcile().await.unwrap();
        assert_eq!(drained, 1);
        assert!(engine.store.outbox_entries().unwrap().is_empty());

        let completed = engine.list_completed().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].transaction_hash.as_deref(), Some("txlost"));
    }

    #[tokio::test]
    async fn held_event_surfaces_hold_reason() {
        let mut r = rule(1);
        r.min_location_duration_seconds = Some(600);
        let mut engine = engine(vec![r]);
        engine.ingest(&event(1, "W1", 1)).unwrap();
        engine.refresh_pending().await.unwrap();

        let err = engine
            .execute(&EventKey::new(1, "W1", Some(1)), &creds())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Held(_)));
    }
}
