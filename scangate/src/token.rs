use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{Result, ScanError};
use crate::http;

/// Where and how to obtain bearer tokens (OAuth2 password grant).
#[derive(Clone)]
pub struct IdentityConfig {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    /// Sent as `acr_values=Tenant:<tenant>` when set.
    pub tenant: Option<String>,
}

impl fmt::Debug for IdentityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityConfig")
            .field("auth_url", &self.auth_url)
            .field("username", &self.username)
            .field("client_id", &self.client_id)
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

/// A bearer token valid for one scope.
#[derive(Clone)]
pub struct Credential {
    token: String,
    scope: String,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("scope", &self.scope)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

/// Per-run cache of credentials, one per scope.
///
/// Nothing is persisted; a new cache starts unauthenticated. Failed
/// acquisitions are not retried here.
pub struct TokenCache {
    client: reqwest::Client,
    identity: IdentityConfig,
    credentials: Mutex<HashMap<String, Credential>>,
}

impl TokenCache {
    pub fn new(client: reqwest::Client, identity: IdentityConfig) -> Self {
        Self {
            client,
            identity,
            credentials: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached credential for `scope`, fetching one if needed.
    #[instrument(skip(self), fields(auth_url = %self.identity.auth_url))]
    pub async fn acquire(&self, scope: &str) -> Result<Credential> {
        if let Some(credential) = self.cached(scope) {
            return Ok(credential);
        }

        let credential = self.request_token(scope).await?;
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.to_string(), credential.clone());
        debug!(scope, "credential acquired");
        Ok(credential)
    }

    /// Forget the credential for `scope`; the next `acquire` goes to the network.
    pub fn invalidate(&self, scope: &str) {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope);
    }

    fn cached(&self, scope: &str) -> Option<Credential> {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
    }

    async fn request_token(&self, scope: &str) -> Result<Credential> {
        let identity = &self.identity;
        let tenant = identity.tenant.as_ref().map(|t| format!("Tenant:{t}"));

        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", "password"),
            ("username", identity.username.as_str()),
            ("password", identity.password.as_str()),
            ("scope", scope),
            ("client_id", identity.client_id.as_str()),
        ];
        if let Some(secret) = &identity.client_secret {
            form.push(("client_secret", secret.as_str()));
        }
        if let Some(tenant) = &tenant {
            form.push(("acr_values", tenant.as_str()));
        }

        let what = format!("token request for scope {scope}");
        let request = self.client.post(&identity.auth_url).form(&form);
        let response = match http::send(request, &what).await {
            Ok(response) => response,
            // identity servers answer a bad password grant with 400 invalid_grant
            Err(ScanError::Protocol(detail)) => return Err(ScanError::Auth(detail)),
            Err(e) => return Err(e),
        };

        let body: TokenResponse = http::read_json(response, &what).await?;
        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ScanError::Protocol(format!("{what}: missing 'access_token'")))?;

        Ok(Credential {
            token,
            scope: scope.to_string(),
        })
    }
}
