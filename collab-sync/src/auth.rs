//! Access validation for connect events.
//!
//! Credential verification and document authorization are external
//! capabilities ([`IdentityService`], [`DocumentAuthorizer`]); the
//! [`AccessValidator`] sequences them and turns their answers into the
//! 401 / 403 split the gateway reports.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::error::{SyncError, SyncResult};
use crate::registry::unix_millis;

/// Verified caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub principal_id: String,
    pub tenant_id: String,
    pub role: String,
    pub display_name: Option<String>,
    /// Unix millis after which the credential is no longer valid
    pub expires_at: u64,
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessGrant {
    pub tenant_id: String,
    pub principal_id: String,
    pub role: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("credential expired")]
    Expired,
    #[error("identity service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizerError {
    #[error("authorization service unavailable: {0}")]
    Unavailable(String),
}

/// Verifies credentials (signature, expiry) and resolves the principal.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError>;
}

/// Decides whether a principal of a tenant may open a document.
#[async_trait]
pub trait DocumentAuthorizer: Send + Sync {
    async fn can_access(
        &self,
        principal_id: &str,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<bool, AuthorizerError>;
}

/// Longest tenant or document id accepted at connect, in bytes.
pub const MAX_ID_BYTES: usize = 1024;

/// Sequences identity verification and document authorization.
#[derive(Clone)]
pub struct AccessValidator {
    identity: Arc<dyn IdentityService>,
    authorizer: Arc<dyn DocumentAuthorizer>,
}

impl AccessValidator {
    pub fn new(identity: Arc<dyn IdentityService>, authorizer: Arc<dyn DocumentAuthorizer>) -> Self {
        Self {
            identity,
            authorizer,
        }
    }

    /// Validate `credential` for `document_id`.
    ///
    /// Fails with [`SyncError::Authentication`] for a missing, invalid or
    /// expired credential and [`SyncError::Authorization`] when the principal
    /// is valid but may not open the document. Collaborator outages surface
    /// as [`SyncError::Internal`], never as a denial.
    pub async fn validate(
        &self,
        credential: Option<&str>,
        document_id: &str,
    ) -> SyncResult<AccessGrant> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| SyncError::Authentication("missing credential".into()))?;

        let identity = match self.identity.verify(credential).await {
            Ok(identity) => identity,
            Err(IdentityError::Unavailable(e)) => {
                return Err(SyncError::Internal(format!("identity service: {e}")));
            }
            Err(e) => return Err(SyncError::Authentication(e.to_string())),
        };

        if identity.expires_at <= unix_millis() {
            return Err(SyncError::Authentication("credential expired".into()));
        }

        let denied = || SyncError::Authorization {
            principal_id: identity.principal_id.clone(),
            document_id: document_id.to_string(),
        };
        if document_id.trim().is_empty()
            || document_id.len() > MAX_ID_BYTES
            || identity.tenant_id.len() > MAX_ID_BYTES
        {
            return Err(denied());
        }

        let allowed = self
            .authorizer
            .can_access(&identity.principal_id, &identity.tenant_id, document_id)
            .await
            .map_err(|e| SyncError::Internal(e.to_string()))?;
        if !allowed {
            log::info!(
                "Denied {} (tenant {}) access to document {document_id}",
                identity.principal_id,
                identity.tenant_id
            );
            return Err(denied());
        }

        let display_name = identity
            .display_name
            .clone()
            .unwrap_or_else(|| identity.principal_id.clone());
        Ok(AccessGrant {
            tenant_id: identity.tenant_id,
            principal_id: identity.principal_id,
            role: identity.role,
            display_name,
        })
    }
}

// ─── JWT identity ─────────────────────────────────────────────────────

/// Claims carried by HS256 access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id
    pub sub: String,
    pub tenant_id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expiry, seconds since the epoch
    pub exp: u64,
}

/// Verifies HS256 JWTs issued by the account service.
pub struct JwtIdentityService {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl JwtIdentityService {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
        }
    }

    /// Sign `claims` with the shared secret.
    pub fn sign(&self, claims: &Claims) -> Result<String, IdentityError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| IdentityError::Invalid(e.to_string()))
    }
}

#[async_trait]
impl IdentityService for JwtIdentityService {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
        let data = jsonwebtoken::decode::<Claims>(credential, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => IdentityError::Expired,
                _ => IdentityError::Invalid(e.to_string()),
            })?;
        let claims = data.claims;
        Ok(Identity {
            principal_id: claims.sub,
            tenant_id: claims.tenant_id,
            role: claims.role,
            display_name: claims.name,
            expires_at: claims.exp.saturating_mul(1000),
        })
    }
}

// ─── Static collaborators ─────────────────────────────────────────────

/// Fixed credential → identity table.
#[derive(Default)]
pub struct StaticIdentityService {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, credential: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(credential.into(), identity);
        self
    }
}

#[async_trait]
impl IdentityService for StaticIdentityService {
    async fn verify(&self, credential: &str) -> Result<Identity, IdentityError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| IdentityError::Invalid("unknown credential".into()))
    }
}

/// Explicit allow-list of (principal, tenant, document) triples.
#[derive(Default)]
pub struct StaticAuthorizer {
    grants: HashSet<(String, String, String)>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(
        mut self,
        principal_id: impl Into<String>,
        tenant_id: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        self.grants
            .insert((principal_id.into(), tenant_id.into(), document_id.into()));
        self
    }
}

#[async_trait]
impl DocumentAuthorizer for StaticAuthorizer {
    async fn can_access(
        &self,
        principal_id: &str,
        tenant_id: &str,
        document_id: &str,
    ) -> Result<bool, AuthorizerError> {
        Ok(self.grants.contains(&(
            principal_id.to_string(),
            tenant_id.to_string(),
            document_id.to_string(),
        )))
    }
}

/// Allows any document inside the caller's own tenant.
///
/// Documents are always keyed by the tenant from the verified credential, so
/// this never grants access across tenants.
pub struct TenantAuthorizer;

#[async_trait]
impl DocumentAuthorizer for TenantAuthorizer {
    async fn can_access(
        &self,
        _principal_id: &str,
        tenant_id: &str,
        _document_id: &str,
    ) -> Result<bool, AuthorizerError> {
        Ok(!tenant_id.is_empty())
    }
}
