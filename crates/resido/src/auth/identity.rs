use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::tenancy::Tenant;

/// Identity asserted by the external identity provider for an active token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub subject: String,
    pub email: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("identity provider returned an unexpected response: {0}")]
    Malformed(String),
}

/// Token introspection against the external identity provider. `Ok(None)`
/// means the provider does not recognise the token.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn introspect(
        &self,
        tenant: &Tenant,
        token: &str,
    ) -> Result<Option<ExternalIdentity>, IdentityError>;
}

/// Used when no identity provider is configured; every token falls through
/// to local verification.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledIdentityProvider;

#[async_trait]
impl IdentityProvider for DisabledIdentityProvider {
    async fn introspect(
        &self,
        _tenant: &Tenant,
        _token: &str,
    ) -> Result<Option<ExternalIdentity>, IdentityError> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct IntrospectionResponse {
    #[serde(default)]
    active: bool,
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
}

/// OAuth2 token introspection over HTTP. `{realm}` in the URL is replaced
/// with the tenant schema, so each tenant maps onto its own realm.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    url_template: String,
    client_id: String,
    client_secret: String,
}

impl HttpIdentityProvider {
    pub fn new(
        url_template: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IdentityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        })
    }

    fn url_for(&self, tenant: &Tenant) -> String {
        self.url_template.replace("{realm}", tenant.schema.as_str())
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn introspect(
        &self,
        tenant: &Tenant,
        token: &str,
    ) -> Result<Option<ExternalIdentity>, IdentityError> {
        let response = self
            .client
            .post(self.url_for(tenant))
            .form(&[
                ("token", token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| IdentityError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(IdentityError::Unavailable(format!(
                "introspection returned {}",
                response.status()
            )));
        }

        let body: IntrospectionResponse = response
            .json()
            .await
            .map_err(|e| IdentityError::Malformed(e.to_string()))?;

        if !body.active {
            return Ok(None);
        }
        let subject = body
            .sub
            .clone()
            .or_else(|| body.client_id.clone())
            .ok_or_else(|| IdentityError::Malformed("active token without subject".into()))?;

        Ok(Some(ExternalIdentity {
            subject,
            email: body.email,
            client_id: body.client_id,
        }))
    }
}
