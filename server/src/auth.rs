//! Credential validation and per-document permissions.
//!
//! Two credential kinds arrive on the wire `auth` message: HS256 bearer
//! tokens and static API keys. Both resolve to a [`TokenPayload`] whose
//! permission sets gate every state-mutating or state-exposing
//! operation. A deployment-wide flag can disable authentication
//! entirely, in which case connections auto-authenticate as an admin
//! principal named "anonymous" — a testing mode, never the default.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::SyncError;
use crate::protocol::{AuthPayload, WirePermissions};

/// Principal name used when authentication is disabled.
pub const ANONYMOUS_USER: &str = "anonymous";

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub can_read: Vec<String>,
    #[serde(default)]
    pub can_write: Vec<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// The resolved identity attached to an authenticated connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    #[serde(rename = "sub")]
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub permissions: Permissions,
    /// Expiry, seconds since epoch.
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl TokenPayload {
    /// Admin principal used by API keys and the auth-disabled mode.
    pub fn admin(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email: None,
            permissions: Permissions {
                can_read: Vec::new(),
                can_write: Vec::new(),
                is_admin: true,
            },
            exp: i64::MAX,
            iss: None,
            aud: None,
        }
    }

    pub fn can_read(&self, document_id: &str) -> bool {
        self.permissions.is_admin
            || self.permissions.can_read.iter().any(|d| d == document_id)
    }

    pub fn can_write(&self, document_id: &str) -> bool {
        self.permissions.is_admin
            || self.permissions.can_write.iter().any(|d| d == document_id)
    }

    pub fn is_admin(&self) -> bool {
        self.permissions.is_admin
    }

    /// Permission view sent back in `auth_success`.
    pub fn wire_permissions(&self) -> WirePermissions {
        WirePermissions {
            can_read: self.permissions.can_read.clone(),
            can_write: self.permissions.can_write.clone(),
            is_admin: self.permissions.is_admin,
        }
    }
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub struct AuthGate {
    required: bool,
    jwt_secret: Option<String>,
    issuer: Option<String>,
    audience: Option<String>,
    api_keys: std::collections::HashSet<String>,
    access_token_ttl: std::time::Duration,
}

impl AuthGate {
    pub fn new(config: &Config) -> Self {
        Self {
            required: config.auth_required,
            jwt_secret: config.jwt_secret.clone(),
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            api_keys: config.api_keys.clone(),
            access_token_ttl: config.access_token_ttl,
        }
    }

    /// Whether connections must present credentials at all.
    pub fn required(&self) -> bool {
        self.required
    }

    /// Identity granted to every connection when auth is disabled.
    pub fn anonymous(&self) -> TokenPayload {
        TokenPayload::admin(ANONYMOUS_USER)
    }

    /// Validate the credential material on an `auth` message.
    pub fn authenticate(&self, payload: &AuthPayload) -> Result<TokenPayload, SyncError> {
        if !self.required {
            return Ok(self.anonymous());
        }

        if let Some(api_key) = &payload.api_key {
            return self.validate_api_key(api_key);
        }
        if let Some(token) = &payload.token {
            return self.validate_token(token);
        }
        Err(SyncError::Auth("no credential supplied".to_string()))
    }

    fn validate_api_key(&self, api_key: &str) -> Result<TokenPayload, SyncError> {
        if self.api_keys.contains(api_key) {
            // API keys are deployment-level credentials: full access,
            // named by a stable prefix so logs stay useful.
            let label = api_key.chars().take(8).collect::<String>();
            Ok(TokenPayload::admin(&format!("api-key-{label}")))
        } else {
            Err(SyncError::Auth("unknown api key".to_string()))
        }
    }

    fn validate_token(&self, token: &str) -> Result<TokenPayload, SyncError> {
        let secret = self
            .jwt_secret
            .as_ref()
            .ok_or_else(|| SyncError::Auth("bearer tokens are not configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let data = decode::<TokenPayload>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .map_err(|e| SyncError::Auth(format!("invalid token: {e}")))?;

        Ok(data.claims)
    }

    /// Mint a signed access token for the given identity. Used by
    /// provisioning tooling and the test suites.
    pub fn issue_token(
        &self,
        user_id: &str,
        permissions: Permissions,
    ) -> Result<String, SyncError> {
        let secret = self
            .jwt_secret
            .as_ref()
            .ok_or_else(|| SyncError::Auth("bearer tokens are not configured".to_string()))?;

        let payload = TokenPayload {
            user_id: user_id.to_string(),
            email: None,
            permissions,
            exp: Utc::now().timestamp() + self.access_token_ttl.as_secs() as i64,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &payload,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| SyncError::Auth(format!("token minting failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate_with_secret() -> AuthGate {
        let config = Config {
            jwt_secret: Some("test-secret".to_string()),
            jwt_issuer: Some("synckit-tests".to_string()),
            ..Config::default()
        };
        AuthGate::new(&config)
    }

    fn scoped_permissions() -> Permissions {
        Permissions {
            can_read: vec!["doc-1".to_string(), "doc-2".to_string()],
            can_write: vec!["doc-1".to_string()],
            is_admin: false,
        }
    }

    #[test]
    fn token_roundtrip_preserves_permissions() {
        let gate = gate_with_secret();
        let token = gate.issue_token("user-1", scoped_permissions()).unwrap();

        let payload = gate
            .authenticate(&AuthPayload {
                token: Some(token),
                api_key: None,
                client_id: None,
            })
            .unwrap();

        assert_eq!(payload.user_id, "user-1");
        assert!(payload.can_read("doc-1"));
        assert!(payload.can_read("doc-2"));
        assert!(payload.can_write("doc-1"));
        assert!(!payload.can_write("doc-2"));
        assert!(!payload.can_read("doc-3"));
    }

    #[test]
    fn admins_bypass_document_scoping() {
        let payload = TokenPayload::admin("root");
        assert!(payload.can_read("anything"));
        assert!(payload.can_write("anything"));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let gate = gate_with_secret();
        // Hand-craft a payload that expired an hour ago.
        let expired = TokenPayload {
            user_id: "user-1".to_string(),
            email: None,
            permissions: scoped_permissions(),
            exp: Utc::now().timestamp() - 3600,
            iss: Some("synckit-tests".to_string()),
            aud: None,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &expired,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();

        let err = gate
            .authenticate(&AuthPayload {
                token: Some(token),
                api_key: None,
                client_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let gate = gate_with_secret();
        let other = AuthGate::new(&Config {
            jwt_secret: Some("other-secret".to_string()),
            jwt_issuer: Some("synckit-tests".to_string()),
            ..Config::default()
        });
        let token = other.issue_token("user-1", scoped_permissions()).unwrap();

        assert!(gate
            .authenticate(&AuthPayload {
                token: Some(token),
                api_key: None,
                client_id: None,
            })
            .is_err());
    }

    #[test]
    fn api_keys_authenticate_as_admin() {
        let config = Config {
            api_keys: ["deploy-key-123".to_string()].into_iter().collect(),
            jwt_secret: None,
            ..Config::default()
        };
        let gate = AuthGate::new(&config);

        let payload = gate
            .authenticate(&AuthPayload {
                token: None,
                api_key: Some("deploy-key-123".to_string()),
                client_id: None,
            })
            .unwrap();
        assert!(payload.is_admin());
        assert!(payload.user_id.starts_with("api-key-"));

        assert!(gate
            .authenticate(&AuthPayload {
                token: None,
                api_key: Some("wrong".to_string()),
                client_id: None,
            })
            .is_err());
    }

    #[test]
    fn missing_credential_is_rejected() {
        let gate = gate_with_secret();
        assert!(gate.authenticate(&AuthPayload::default()).is_err());
    }

    #[test]
    fn disabled_auth_grants_anonymous_admin() {
        let config = Config {
            auth_required: false,
            ..Config::default()
        };
        let gate = AuthGate::new(&config);
        assert!(!gate.required());

        let payload = gate.authenticate(&AuthPayload::default()).unwrap();
        assert_eq!(payload.user_id, ANONYMOUS_USER);
        assert!(payload.is_admin());
    }
}
