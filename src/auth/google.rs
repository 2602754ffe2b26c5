use super::{Authorizer, ClientIdentity, Credential, TokenGrant};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use std::time::Duration;

/// Google OAuth endpoints.
const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// A failed call to the token endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TokenRequestError {
    /// Error while talking to the token endpoint.
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with an error status.
    #[error("token endpoint responded {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    /// The token response could not be parsed.
    #[error("invalid token response: {0}")]
    Json(#[from] serde_json::Error),
}

/// OAuth2 authorization-code client for Google APIs.
#[derive(Debug, Clone)]
pub struct GoogleOAuthClient {
    http_client: reqwest::Client,
    auth_url: String,
    token_url: String,
}

impl GoogleOAuthClient {
    /// Creates a client talking to Google's production endpoints.
    pub fn new(timeout: Duration) -> Result<GoogleOAuthClient> {
        GoogleOAuthClient::with_endpoints(GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL, timeout)
    }

    /// Creates a client talking to custom endpoints.
    pub fn with_endpoints(
        auth_url: impl Into<String>,
        token_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<GoogleOAuthClient> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(GoogleOAuthClient {
            http_client,
            auth_url: auth_url.into(),
            token_url: token_url.into(),
        })
    }

    /// Posts a grant form to the token endpoint.
    async fn request_token(
        &self,
        params: &[(&str, &str)],
    ) -> Result<TokenGrant, TokenRequestError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(TokenRequestError::Rejected { status, body });
        }

        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Authorizer for GoogleOAuthClient {
    fn authorization_url(
        &self,
        identity: &ClientIdentity,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<String> {
        let scope = scopes.join(" ");

        // `access_type=offline` together with `prompt=consent` makes Google issue a refresh
        // token even if the user has authorized this client before.
        let url = Url::parse_with_params(
            &self.auth_url,
            &[
                ("client_id", identity.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )?;

        Ok(url.into())
    }

    async fn exchange_code(
        &self,
        identity: &ClientIdentity,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenGrant> {
        let params = [
            ("client_id", identity.client_id.as_str()),
            ("client_secret", identity.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];

        let grant = self.request_token(&params).await.map_err(Error::Exchange)?;

        log::info!("successfully obtained tokens");
        Ok(grant)
    }

    async fn refresh_access_token(&self, credential: &Credential) -> Result<TokenGrant> {
        let params = [
            ("client_id", credential.client_id.as_str()),
            ("client_secret", credential.client_secret.as_str()),
            ("refresh_token", credential.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let grant = self.request_token(&params).await.map_err(Error::Refresh)?;

        log::debug!("refreshed access token");
        Ok(grant)
    }
}
