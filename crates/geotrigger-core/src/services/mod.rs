//! External collaborator contracts: the execution service, the credential
//! (passkey) service and the rule persistence API.
//!
//! The engine only consumes these; geofence matching and ledger submission
//! live behind them.

pub mod http;

use crate::errors::SubmissionError;
use crate::model::{ContractInfo, ExecutionOutcome, Rule};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Opaque secret-key signing material. The ledger's signature scheme is out
/// of scope; the engine only checks shape and hands the key through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKey(String);

impl SecretKey {
    /// Stellar-style seed: 'S' prefix, 56 chars, RFC 4648 base32 alphabet.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let valid = raw.len() == 56
            && raw.starts_with('S')
            && raw.chars().all(|c| matches!(c, 'A'..='Z' | '2'..='7'));
        valid.then(|| Self(raw.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SecretKey {
    /// Redacted; the key itself never reaches logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S…{}", &self.0[self.0.len() - 4..])
    }
}

/// A WebAuthn-style authorization proof, scoped to exactly one signed
/// payload. Never persisted beyond the execution attempt that consumes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasskeyProof {
    pub credential_id: String,
    pub public_key_material: String,
    pub signature: String,
    pub authenticator_data: String,
    pub client_data: String,
    pub signed_payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SigningMaterial {
    SecretKey(SecretKey),
    Passkey(PasskeyProof),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub credential_id: String,
    pub public_key_material: String,
    pub is_registered_on_chain: bool,
}

/// Discriminated result of a proof request. Denial and timeout are normal
/// outcomes of the user-facing flow, not transport errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProofOutcome {
    Granted(PasskeyProof),
    Denied,
    Timeout,
}

/// Generic contract-function submission.
#[derive(Debug, Clone, Serialize)]
pub struct InvokeRequest {
    pub function_name: String,
    pub parameters: BTreeMap<String, Value>,
    pub identity: String,
    pub signing_material: Option<SigningMaterial>,
    pub submit_to_ledger: bool,
    pub rule_id: i64,
    pub update_id: Option<i64>,
    pub matched_public_key: Option<String>,
}

/// Vault/smart-wallet payment submission: distinct request shape with
/// explicit destination, amount, asset and proof fields.
#[derive(Debug, Clone, Serialize)]
pub struct VaultPaymentRequest {
    pub identity: String,
    pub signing_material: SigningMaterial,
    pub destination: String,
    pub amount: String,
    pub asset: String,
    pub proof: PasskeyProof,
    pub rule_id: i64,
}

#[async_trait]
pub trait ExecutionService: Send + Sync {
    async fn invoke_function(&self, req: &InvokeRequest)
        -> Result<ExecutionOutcome, SubmissionError>;

    async fn submit_vault_payment(
        &self,
        req: &VaultPaymentRequest,
    ) -> Result<ExecutionOutcome, SubmissionError>;
}

#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn list_credentials(&self, identity: &str) -> Result<Vec<Credential>, SubmissionError>;

    /// Request a proof over `payload` from the credential holder. The call
    /// suspends until the user responds, the request times out, or the
    /// caller cancels.
    async fn request_proof(
        &self,
        credential_id: &str,
        payload: &str,
    ) -> Result<ProofOutcome, SubmissionError>;

    async fn register_credential(
        &self,
        identity: &str,
        signing_material: &SecretKey,
        public_key_material: &str,
    ) -> Result<bool, SubmissionError>;
}

#[async_trait]
pub trait RuleApi: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<Rule>, SubmissionError>;
    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>, SubmissionError>;
    async fn create_rule(&self, rule: &Rule) -> Result<i64, SubmissionError>;
    async fn update_rule(&self, rule: &Rule) -> Result<(), SubmissionError>;
    async fn delete_rule(&self, rule_id: i64) -> Result<(), SubmissionError>;
    async fn get_contract(&self, contract_id: &str) -> Result<ContractInfo, SubmissionError>;
}
