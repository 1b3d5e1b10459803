//! Authentication resolution: decides per rule whether secret-key signing
//! or a passkey proof is required, selects the on-chain registered
//! credential, and acquires proofs over canonical payloads.

use super::payload::SignedPayload;
use crate::cancel::CancelToken;
use crate::errors::{AuthorizationError, EngineError};
use crate::model::{is_payment_function, ContractInfo, ParameterValue, Rule};
use crate::services::{Credential, CredentialService, PasskeyProof, ProofOutcome, SecretKey};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    SecretKeyOnly,
    PasskeyRequired,
}

/// Parameter-template keys that mark a rule as already WebAuthn-shaped.
const WEBAUTHN_KEYS: [&str; 3] = ["signature", "authenticator_data", "client_data"];

/// Decide the authorization mode for a rule against its owning contract.
pub fn resolve_mode(rule: &Rule, contract: &ContractInfo) -> AuthMode {
    if contract.webauthn_required {
        return AuthMode::PasskeyRequired;
    }
    let has_webauthn_params = rule
        .function_parameters
        .keys()
        .any(|k| WEBAUTHN_KEYS.iter().any(|w| k.contains(w)));
    if has_webauthn_params {
        return AuthMode::PasskeyRequired;
    }
    if rule.use_smart_wallet && is_payment_function(&rule.function_name) {
        return AuthMode::PasskeyRequired;
    }
    // Only literal signature-ish values also count; a placeholder template
    // resolving into proof fields means the contract expects them.
    let has_webauthn_placeholder = rule.function_parameters.values().any(|v| {
        matches!(v, ParameterValue::Literal(val) if val
            .as_object()
            .map(|o| o.keys().any(|k| WEBAUTHN_KEYS.contains(&k.as_str())))
            .unwrap_or(false))
    });
    if has_webauthn_placeholder {
        return AuthMode::PasskeyRequired;
    }
    AuthMode::SecretKeyOnly
}

/// Default wait for on-chain registration to propagate before re-querying.
pub const REGISTRATION_SETTLE: Duration = Duration::from_secs(3);

pub struct AuthResolver {
    credentials: Arc<dyn CredentialService>,
    settle_wait: Duration,
}

impl AuthResolver {
    pub fn new(credentials: Arc<dyn CredentialService>) -> Self {
        Self {
            credentials,
            settle_wait: REGISTRATION_SETTLE,
        }
    }

    /// Override the registration settle wait (tests use zero).
    pub fn with_settle_wait(mut self, settle_wait: Duration) -> Self {
        self.settle_wait = settle_wait;
        self
    }

    /// Locate the one credential registered on-chain for the identity.
    ///
    /// When none is registered but a credential and a usable secret key are
    /// available, performs a one-time auto-registration: register, wait for
    /// on-chain propagation, re-query and re-select. A second miss is a
    /// hard error naming the remediation.
    pub async fn select_credential(
        &self,
        identity: &str,
        secret_key: Option<&SecretKey>,
    ) -> Result<Credential, EngineError> {
        let listed = self.credentials.list_credentials(identity).await?;
        if let Some(registered) = listed.iter().find(|c| c.is_registered_on_chain) {
            return Ok(registered.clone());
        }

        let (Some(unregistered), Some(key)) = (listed.first(), secret_key) else {
            return Err(AuthorizationError::NoRegisteredCredential {
                identity: identity.to_string(),
            }
            .into());
        };

        info!(identity, credential = %unregistered.credential_id, "auto-registering credential on-chain");
        let registered = self
            .credentials
            .register_credential(identity, key, &unregistered.public_key_material)
            .await?;
        if !registered {
            return Err(AuthorizationError::RegistrationFailed {
                reason: "registration call reported failure".to_string(),
            }
            .into());
        }

        // Registration is not immediately consistent; settle before re-read.
        tokio::time::sleep(self.settle_wait).await;

        let relisted = self.credentials.list_credentials(identity).await?;
        relisted
            .into_iter()
            .find(|c| c.is_registered_on_chain)
            .ok_or_else(|| {
                warn!(identity, "credential still unregistered after settle wait");
                AuthorizationError::NoRegisteredCredential {
                    identity: identity.to_string(),
                }
                .into()
            })
    }

    /// Request a proof over the payload's canonical form. The proof is
    /// scoped to exactly that payload; a proof covering anything else is
    /// rejected.
    pub async fn acquire_proof(
        &self,
        credential: &Credential,
        payload: &SignedPayload,
        cancel: &CancelToken,
    ) -> Result<PasskeyProof, EngineError> {
        if cancel.is_cancelled() {
            return Err(AuthorizationError::Cancelled.into());
        }
        let canonical = payload.canonical()?;

        debug!(credential = %credential.credential_id, "requesting passkey proof");
        let outcome = self
            .credentials
            .request_proof(&credential.credential_id, &canonical)
            .await?;

        match outcome {
            ProofOutcome::Granted(proof) => {
                if proof.signed_payload != canonical {
                    return Err(AuthorizationError::ProofPayloadMismatch.into());
                }
                Ok(proof)
            }
            ProofOutcome::Denied => Err(AuthorizationError::Denied {
                credential_id: credential.credential_id.clone(),
            }
            .into()),
            ProofOutcome::Timeout => Err(AuthorizationError::Timeout {
                credential_id: credential.credential_id.clone(),
            }
            .into()),
        }
    }
}
