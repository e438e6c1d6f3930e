// src/services/auth_service.rs
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::{Identity, Role},
};

/// Resolves a session token into the identity behind it
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> DispatchResult<Identity>;

    async fn require_role(&self, token: &str, role: Role) -> DispatchResult<Identity> {
        let identity = self.authenticate(token).await?;
        if identity.role != role {
            return Err(DispatchError::Forbidden(format!(
                "{:?} session cannot act as {:?}",
                identity.role, role
            )));
        }
        Ok(identity)
    }
}

/// Asks the external identity service at `{base_url}/sessions/verify`
pub struct HttpAuthenticator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAuthenticator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Configuration(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self, token: &str) -> DispatchResult<Identity> {
        if token.trim().is_empty() {
            return Err(DispatchError::unauthorized("missing session token"));
        }

        let response = self
            .client
            .get(format!("{}/sessions/verify", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(DispatchError::unauthorized("session token rejected"))
            }
            status if status.is_success() => {
                let identity: Identity = response.json().await?;
                tracing::debug!("Authenticated {:?} {}", identity.role, identity.actor_id);
                Ok(identity)
            }
            status => {
                tracing::error!("Identity service answered {}", status);
                Err(DispatchError::Network(format!("identity service returned {}", status)))
            }
        }
    }
}

/// Development authenticator: `driver:<id>` and `operator:<id>` tokens
#[derive(Default)]
pub struct MockAuthenticator;

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, token: &str) -> DispatchResult<Identity> {
        let (role, id) = token
            .split_once(':')
            .ok_or_else(|| DispatchError::unauthorized("malformed session token"))?;
        if id.trim().is_empty() {
            return Err(DispatchError::unauthorized("session token names no actor"));
        }

        match role {
            "driver" => Ok(Identity::driver(id)),
            "operator" => Ok(Identity::operator(id)),
            _ => Err(DispatchError::unauthorized(format!("unknown role {}", role))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_tokens() {
        let auth = MockAuthenticator;
        assert_eq!(auth.authenticate("driver:drv-1").await.unwrap(), Identity::driver("drv-1"));
        assert_eq!(
            auth.authenticate("operator:op-7").await.unwrap(),
            Identity::operator("op-7")
        );

        for bad in ["", "drv-1", "driver:", "admin:root"] {
            let err = auth.authenticate(bad).await.unwrap_err();
            assert!(matches!(err, DispatchError::Unauthorized(_)), "{}", bad);
        }
    }

    #[tokio::test]
    async fn test_role_is_enforced() {
        let auth = MockAuthenticator;
        assert!(auth.require_role("operator:op-1", Role::Operator).await.is_ok());

        let err = auth.require_role("driver:drv-1", Role::Operator).await.unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_http_rejects_blank_token_without_calling_out() {
        let auth = HttpAuthenticator::new("http://127.0.0.1:9/", Duration::from_secs(1)).unwrap();
        let err = auth.authenticate("  ").await.unwrap_err();
        assert!(matches!(err, DispatchError::Unauthorized(_)));
    }
}
