//! HTTP implementations of the collaborator contracts.

use super::{
    Credential, CredentialService, ExecutionService, InvokeRequest, ProofOutcome, RuleApi,
    SecretKey, VaultPaymentRequest,
};
use crate::errors::SubmissionError;
use crate::model::{ContractInfo, ExecutionOutcome, Rule};
use async_trait::async_trait;
use serde_json::json;

fn network_err(e: reqwest::Error) -> SubmissionError {
    SubmissionError::Network(e.to_string())
}

async fn reject_on_error_status(resp: reqwest::Response) -> Result<reqwest::Response, SubmissionError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(SubmissionError::Rejected {
        message: format!("status {}: {}", status, body),
    })
}

/// Execution service over HTTP: the backend that actually builds, signs and
/// submits ledger transactions.
pub struct HttpExecutionService {
    base_url: String,
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpExecutionService {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn request(&self, path: &str, body: &serde_json::Value) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        req
    }

    async fn post_outcome(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<ExecutionOutcome, SubmissionError> {
        let resp = self.request(path, &body).send().await.map_err(network_err)?;
        let resp = reject_on_error_status(resp).await?;
        resp.json::<ExecutionOutcome>().await.map_err(network_err)
    }
}

#[async_trait]
impl ExecutionService for HttpExecutionService {
    async fn invoke_function(
        &self,
        req: &InvokeRequest,
    ) -> Result<ExecutionOutcome, SubmissionError> {
        self.post_outcome("/execute", serde_json::to_value(req).unwrap_or(json!({})))
            .await
    }

    async fn submit_vault_payment(
        &self,
        req: &VaultPaymentRequest,
    ) -> Result<ExecutionOutcome, SubmissionError> {
        self.post_outcome(
            "/vault/payments",
            serde_json::to_value(req).unwrap_or(json!({})),
        )
        .await
    }
}

/// Credential service over HTTP: lists passkeys, relays proof requests to
/// the credential holder and registers credentials on-chain.
pub struct HttpCredentialService {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCredentialService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CredentialService for HttpCredentialService {
    async fn list_credentials(&self, identity: &str) -> Result<Vec<Credential>, SubmissionError> {
        let resp = self
            .client
            .get(format!("{}/credentials", self.base_url))
            .query(&[("identity", identity)])
            .send()
            .await
            .map_err(network_err)?;
        let resp = reject_on_error_status(resp).await?;
        resp.json::<Vec<Credential>>().await.map_err(network_err)
    }

    async fn request_proof(
        &self,
        credential_id: &str,
        payload: &str,
    ) -> Result<ProofOutcome, SubmissionError> {
        let resp = self
            .client
            .post(format!(
                "{}/credentials/{}/proofs",
                self.base_url, credential_id
            ))
            .json(&json!({ "payload": payload }))
            .send()
            .await
            .map_err(network_err)?;
        let resp = reject_on_error_status(resp).await?;
        resp.json::<ProofOutcome>().await.map_err(network_err)
    }

    async fn register_credential(
        &self,
        identity: &str,
        signing_material: &SecretKey,
        public_key_material: &str,
    ) -> Result<bool, SubmissionError> {
        let resp = self
            .client
            .post(format!("{}/credentials", self.base_url))
            .json(&json!({
                "identity": identity,
                "secret_key": signing_material.expose(),
                "public_key_material": public_key_material,
            }))
            .send()
            .await
            .map_err(network_err)?;
        let resp = reject_on_error_status(resp).await?;
        let body: serde_json::Value = resp.json().await.map_err(network_err)?;
        Ok(body.get("success").and_then(|v| v.as_bool()).unwrap_or(false))
    }
}

/// Rule persistence API over HTTP.
pub struct HttpRuleApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRuleApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RuleApi for HttpRuleApi {
    async fn list_rules(&self) -> Result<Vec<Rule>, SubmissionError> {
        let resp = self
            .client
            .get(format!("{}/rules", self.base_url))
            .send()
            .await
            .map_err(network_err)?;
        let resp = reject_on_error_status(resp).await?;
        resp.json::<Vec<Rule>>().await.map_err(network_err)
    }

    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>, SubmissionError> {
        let resp = self
            .client
            .get(format!("{}/rules/{}", self.base_url, rule_id))
            .send()
            .await
            .map_err(network_err)?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = reject_on_error_status(resp).await?;
        resp.json::<Rule>().await.map(Some).map_err(network_err)
    }

    async fn create_rule(&self, rule: &Rule) -> Result<i64, SubmissionError> {
        let resp = self
            .client
            .post(format!("{}/rules", self.base_url))
            .json(rule)
            .send()
            .await
            .map_err(network_err)?;
        let resp = reject_on_error_status(resp).await?;
        let body: serde_json::Value = resp.json().await.map_err(network_err)?;
        body.get("id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| SubmissionError::Rejected {
                message: "create response missing id".to_string(),
            })
    }

    async fn update_rule(&self, rule: &Rule) -> Result<(), SubmissionError> {
        let resp = self
            .client
            .put(format!("{}/rules/{}", self.base_url, rule.id))
            .json(rule)
            .send()
            .await
            .map_err(network_err)?;
        reject_on_error_status(resp).await.map(|_| ())
    }

    async fn delete_rule(&self, rule_id: i64) -> Result<(), SubmissionError> {
        let resp = self
            .client
            .delete(format!("{}/rules/{}", self.base_url, rule_id))
            .send()
            .await
            .map_err(network_err)?;
        reject_on_error_status(resp).await.map(|_| ())
    }

    async fn get_contract(&self, contract_id: &str) -> Result<ContractInfo, SubmissionError> {
        let resp = self
            .client
            .get(format!("{}/contracts/{}", self.base_url, contract_id))
            .send()
            .await
            .map_err(network_err)?;
        let resp = reject_on_error_status(resp).await?;
        resp.json::<ContractInfo>().await.map_err(network_err)
    }
}
