//! End-to-end scenario: a location rule's match event arrives, the
//! operator executes it, the execution service confirms, and exactly one
//! completed record with the full dedup key is visible.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use geotrigger_core::batch::BatchOrchestrator;
use geotrigger_core::errors::SubmissionError;
use geotrigger_core::executor::ExecCredentials;
use geotrigger_core::lifecycle::LifecycleStore;
use geotrigger_core::model::{
    ContractInfo, EventKey, ExecutionOutcome, Geofence, MatchEvent, Rule, RuleType, TriggerOn,
};
use geotrigger_core::services::{
    Credential, CredentialService, ExecutionService, InvokeRequest, ProofOutcome, RuleApi,
    SecretKey, VaultPaymentRequest,
};
use geotrigger_core::Engine;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

struct OneRule(Rule);

#[async_trait]
impl RuleApi for OneRule {
    async fn list_rules(&self) -> Result<Vec<Rule>, SubmissionError> {
        Ok(vec![self.0.clone()])
    }

    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>, SubmissionError> {
        Ok((self.0.id == rule_id).then(|| self.0.clone()))
    }

    async fn create_rule(&self, _rule: &Rule) -> Result<i64, SubmissionError> {
        Ok(self.0.id)
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

struct ConfirmingExecution;

#[async_trait]
impl ExecutionService for ConfirmingExecution {
    async fn invoke_function(
        &self,
        _req: &InvokeRequest,
    ) -> Result<ExecutionOutcome, SubmissionError> {
        Ok(ExecutionOutcome {
            success: true,
            transaction_hash: Some("abc123".to_string()),
            error: None,
        })
    }

    async fn submit_vault_payment(
        &self,
        _req: &VaultPaymentRequest,
    ) -> Result<ExecutionOutcome, SubmissionError> {
        Ok(ExecutionOutcome {
            success: true,
            transaction_hash: Some("abc123".to_string()),
            error: None,
        })
    }
}

struct NoPasskeys;

#[async_trait]
impl CredentialService for NoPasskeys {
    async fn list_credentials(&self, _identity: &str) -> Result<Vec<Credential>, SubmissionError> {
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

fn location_rule() -> Rule {
    Rule {
        id: 5,
        contract_id: "CBADGE".to_string(),
        rule_type: RuleType::Location,
        geofence: Some(Geofence {
            center_latitude: 52.37,
            center_longitude: 4.89,
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

fn match_event() -> MatchEvent {
    MatchEvent {
        rule_id: 5,
        matched_public_key: "W1".to_string(),
        matched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        location: Some((52.3701, 4.8899)),
        update_id: Some(42),
        dwell_seconds: Some(60),
        function_parameters: BTreeMap::new(),
        message: "W1 entered the badge zone".to_string(),
    }
}

fn secret() -> SecretKey {
    SecretKey::parse(&("S".to_string() + &"A".repeat(55))).unwrap()
}

#[tokio::test]
async fn scenario_mark_pending_execute_complete() {
    let mut engine = Engine::new(
        LifecycleStore::memory().unwrap(),
        Arc::new(OneRule(location_rule())),
        Arc::new(ConfirmingExecution),
        Arc::new(NoPasskeys),
    )
    .with_batch(BatchOrchestrator::new().with_pause(Duration::ZERO));

    // Match event arrives from the pipeline
    assert!(engine.ingest(&match_event()).unwrap());
    engine.refresh_pending().await.unwrap();
    assert_eq!(engine.pending().len(), 1);

    // Quorum is empty, so it is vacuously met
    let quorum = engine.check_quorum(5, &BTreeSet::new()).await.unwrap();
    assert!(quorum.met);

    // Operator executes
    let key = EventKey::new(5, "W1", Some(42));
    let creds = ExecCredentials {
        identity: "GSOURCE".to_string(),
        secret_key: Some(secret()),
    };
    let outcome = engine.execute(&key, &creds).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.transaction_hash.as_deref(), Some("abc123"));

    // Exactly one completed record with the full dedup key
    let completed = engine.list_completed().unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].dedup_key(), "5_abc123_42_W1");

    engine.refresh_pending().await.unwrap();
    assert!(engine.pending().is_empty());

    // A duplicate upstream completion report changes nothing visible
    engine.execute(&key, &creds).await.unwrap_err();
    assert_eq!(engine.list_completed().unwrap().len(), 1);
}
